//! Double-buffer handoff between the emulation loop and the compositor thread.
//!
//! Two [`FrameBuffer`]s circulate between the sides. Ready frames travel to
//! the consumer over a bounded channel; released frames go back into a
//! per-index free slot the producer waits on. The producer always alternates
//! indices (0, 1, 0, ...), so it can never touch a buffer the compositor is
//! still reading: it blocks until that exact buffer comes back.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::framebuffer::FrameBuffer;

/// Number of buffers in flight.
pub const BUFFER_COUNT: usize = 2;

struct FreeSlots {
    slots: [Mutex<Option<FrameBuffer>>; BUFFER_COUNT],
    ready: [Condvar; BUFFER_COUNT],
    consumer_gone: AtomicBool,
    /// Frames submitted and not yet released
    pending: AtomicUsize,
}

impl FreeSlots {
    fn lock(&self, index: usize) -> MutexGuard<'_, Option<FrameBuffer>> {
        match self.slots[index].lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn put(&self, buf: FrameBuffer) {
        let index = buf.index() % BUFFER_COUNT;
        *self.lock(index) = Some(buf);
        self.ready[index].notify_one();
    }
}

/// Emulation-loop side.
pub struct FrameProducer {
    tx: SyncSender<FrameBuffer>,
    free: Arc<FreeSlots>,
    next: usize,
    sequence: u64,
}

/// Compositor side.
pub struct FrameConsumer {
    rx: Receiver<FrameBuffer>,
    free: Arc<FreeSlots>,
}

/// Build a handoff around two buffers, both initially free.
pub fn frame_channel(fb0: FrameBuffer, fb1: FrameBuffer) -> (FrameProducer, FrameConsumer) {
    let (tx, rx) = mpsc::sync_channel(BUFFER_COUNT);
    let free = Arc::new(FreeSlots {
        slots: [Mutex::new(None), Mutex::new(None)],
        ready: [Condvar::new(), Condvar::new()],
        consumer_gone: AtomicBool::new(false),
        pending: AtomicUsize::new(0),
    });
    free.put(fb0);
    free.put(fb1);
    (
        FrameProducer { tx, free: Arc::clone(&free), next: 0, sequence: 0 },
        FrameConsumer { rx, free },
    )
}

impl FrameProducer {
    /// Index of the buffer the next acquire will return.
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Frames submitted so far.
    pub fn submitted(&self) -> u64 {
        self.sequence
    }

    /// Frames queued or being composited.
    pub fn pending(&self) -> usize {
        self.free.pending.load(Ordering::Acquire)
    }

    /// Wait until the next buffer in turn has been released.
    pub fn acquire(&mut self, timeout: Duration) -> Result<FrameBuffer, PipelineError> {
        let deadline = Instant::now() + timeout;
        let index = self.next;
        let mut slot = self.free.lock(index);
        loop {
            if let Some(buf) = slot.take() {
                self.next = (index + 1) % BUFFER_COUNT;
                return Ok(buf);
            }
            if self.free.consumer_gone.load(Ordering::Acquire) {
                return Err(PipelineError::HandoffDisconnected);
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("Frame buffer {} not released within {:?}", index, timeout);
                return Err(PipelineError::HandoffTimeout);
            }
            slot = match self.free.ready[index].wait_timeout(slot, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Hand a finished frame to the consumer. Stamps its sequence number.
    pub fn submit(&mut self, mut buf: FrameBuffer) -> Result<(), PipelineError> {
        self.sequence += 1;
        buf.sequence = self.sequence;
        self.free.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(buf).map_err(|_| {
            self.free.pending.fetch_sub(1, Ordering::AcqRel);
            log::debug!("Compositor gone, dropping frame {}", self.sequence);
            PipelineError::HandoffDisconnected
        })
    }

    /// Put back a buffer that was acquired but never submitted. The turn
    /// order rewinds so the same buffer is handed out next.
    pub fn give_back(&mut self, buf: FrameBuffer) {
        self.next = buf.index() % BUFFER_COUNT;
        self.free.put(buf);
    }
}

impl FrameConsumer {
    /// Block for the next ready frame; `None` once the producer is gone.
    pub fn recv(&self) -> Option<FrameBuffer> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout` for a ready frame.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<FrameBuffer>, PipelineError> {
        match self.rx.recv_timeout(timeout) {
            Ok(buf) => Ok(Some(buf)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::HandoffDisconnected),
        }
    }

    pub fn try_recv(&self) -> Option<FrameBuffer> {
        match self.rx.try_recv() {
            Ok(buf) => Some(buf),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Return a presented frame to its free slot.
    pub fn release(&self, buf: FrameBuffer) {
        let _ = self.free.pending.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.free.put(buf);
    }
}

impl Drop for FrameConsumer {
    fn drop(&mut self) {
        self.free.consumer_gone.store(true, Ordering::Release);
        for cond in &self.free.ready {
            cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryPool;
    use std::thread;

    const SHORT: Duration = Duration::from_millis(20);

    fn channel() -> (FrameProducer, FrameConsumer) {
        let mut pool = MemoryPool::unbounded();
        let fb0 = FrameBuffer::alloc(0, &mut pool).unwrap();
        let fb1 = FrameBuffer::alloc(1, &mut pool).unwrap();
        frame_channel(fb0, fb1)
    }

    #[test]
    fn test_alternates_and_blocks_until_release() {
        let (mut tx, rx) = channel();
        let a = tx.acquire(SHORT).unwrap();
        let b = tx.acquire(SHORT).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));

        // Buffer 0 is still out; the producer may not reuse it.
        assert!(matches!(tx.acquire(SHORT), Err(PipelineError::HandoffTimeout)));

        tx.submit(a).unwrap();
        assert_eq!(tx.pending(), 1);
        let got = rx.recv().unwrap();
        assert_eq!((got.index(), got.sequence), (0, 1));
        rx.release(got);
        assert_eq!(tx.pending(), 0);

        let again = tx.acquire(SHORT).unwrap();
        assert_eq!(again.index(), 0);
        drop(b);
    }

    #[test]
    fn test_releasing_wrong_index_does_not_unblock() {
        let (mut tx, rx) = channel();
        let a = tx.acquire(SHORT).unwrap();
        let b = tx.acquire(SHORT).unwrap();
        tx.submit(b).unwrap();
        rx.release(rx.recv().unwrap());
        // Next in turn is index 0, which is still held here.
        assert!(matches!(tx.acquire(SHORT), Err(PipelineError::HandoffTimeout)));
        tx.give_back(a);
        assert_eq!(tx.acquire(SHORT).unwrap().index(), 0);
    }

    #[test]
    fn test_give_back_rewinds_turn() {
        let (mut tx, _rx) = channel();
        let a = tx.acquire(SHORT).unwrap();
        assert_eq!(tx.next_index(), 1);
        tx.give_back(a);
        assert_eq!(tx.next_index(), 0);
        assert_eq!(tx.acquire(SHORT).unwrap().index(), 0);
        assert_eq!(tx.submitted(), 0);
    }

    #[test]
    fn test_disconnects() {
        let (mut tx, rx) = channel();
        let a = tx.acquire(SHORT).unwrap();
        let _b = tx.acquire(SHORT).unwrap();
        drop(rx);
        assert!(matches!(tx.acquire(SHORT), Err(PipelineError::HandoffDisconnected)));
        assert!(matches!(tx.submit(a), Err(PipelineError::HandoffDisconnected)));

        let (tx, rx) = channel();
        drop(tx);
        assert!(rx.recv().is_none());
        assert!(matches!(rx.recv_timeout(SHORT), Err(PipelineError::HandoffDisconnected)));
    }

    #[test]
    fn test_frames_cross_threads_in_order() {
        let (mut tx, rx) = channel();
        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(buf) = rx.recv() {
                seen.push((buf.index(), buf.sequence));
                rx.release(buf);
            }
            seen
        });

        for _ in 0..10 {
            let buf = tx.acquire(Duration::from_secs(5)).unwrap();
            tx.submit(buf).unwrap();
        }
        drop(tx);

        let seen = consumer.join().unwrap();
        assert_eq!(seen.len(), 10);
        for (i, &(index, seq)) in seen.iter().enumerate() {
            assert_eq!(index, i % 2);
            assert_eq!(seq, i as u64 + 1);
        }
    }
}
