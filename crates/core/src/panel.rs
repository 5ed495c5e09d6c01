//! Panel driver interface.
//!
//! The physical display is a 240×135 RGB565 panel fed over SPI with DMA. The
//! compositor talks to it only through [`Panel`]:
//!
//! - `begin_batch` / `end_batch` bracket one frame's writes
//! - `set_window` selects the destination rectangle
//! - `write_pixels` starts a (possibly asynchronous) transfer
//! - `transfer_busy` / `wait_transfer_complete` guard scratch buffer reuse
//!
//! [`MemoryPanel`] is an in-memory implementation. It keeps the composed
//! image behind a shared handle (the desktop window reads it) and records
//! bracket/transfer bookkeeping so tests can check the write protocol.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::{PANEL_HEIGHT, PANEL_WIDTH};

/// Window writes retained between [`PanelHandle::take_log`] calls.
const WINDOW_LOG_LIMIT: usize = 4096;

/// Display driver used by the compositor.
pub trait Panel: Send {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn begin_batch(&mut self);
    fn end_batch(&mut self);
    fn set_window(&mut self, x: usize, y: usize, width: usize, height: usize);
    /// Start transferring `pixels` into the current window.
    fn write_pixels(&mut self, pixels: &[u16], dma_capable: bool);
    fn transfer_busy(&self) -> bool;
    fn wait_transfer_complete(&mut self);
}

/// Counters kept by [`MemoryPanel`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PanelCounters {
    pub batches: u64,
    pub windows: u64,
    pub writes: u64,
    pub pixels_written: u64,
    pub dma_writes: u64,
    pub waits: u64,
    /// Writes issued while a previous transfer was still in flight
    pub overlapped_writes: u64,
    /// Writes issued outside a begin/end bracket
    pub unbracketed_writes: u64,
    /// `end_batch` calls with no open bracket
    pub unbalanced_ends: u64,
}

/// One recorded window write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowWrite {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

struct PanelState {
    width: usize,
    height: usize,
    pixels: Vec<u16>,
    window: WindowWrite,
    cursor: usize,
    in_batch: bool,
    busy: bool,
    presented: u64,
    counters: PanelCounters,
    log: Vec<WindowWrite>,
}

/// Read side of a [`MemoryPanel`], cloneable across threads.
#[derive(Clone)]
pub struct PanelHandle {
    state: Arc<Mutex<PanelState>>,
}

impl PanelHandle {
    fn lock(&self) -> MutexGuard<'_, PanelState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Copy of the panel contents, row-major RGB565.
    pub fn snapshot(&self) -> Vec<u16> {
        self.lock().pixels.clone()
    }

    /// Copy the panel into `out` as `0x00RRGGBB`, returning the number of
    /// completed batches so callers can skip unchanged frames.
    pub fn copy_rgb888(&self, out: &mut Vec<u32>) -> u64 {
        let s = self.lock();
        out.clear();
        out.extend(s.pixels.iter().map(|&p| rgb565_to_rgb888(p)));
        s.presented
    }

    pub fn counters(&self) -> PanelCounters {
        self.lock().counters
    }

    /// Windows written since the last call.
    pub fn take_log(&self) -> Vec<WindowWrite> {
        std::mem::take(&mut self.lock().log)
    }

    pub fn dimensions(&self) -> (usize, usize) {
        let s = self.lock();
        (s.width, s.height)
    }
}

/// Expand RGB565 to `0x00RRGGBB`, replicating the high bits into the low.
pub fn rgb565_to_rgb888(p: u16) -> u32 {
    let r = ((p >> 11) & 0x1F) as u32;
    let g = ((p >> 5) & 0x3F) as u32;
    let b = (p & 0x1F) as u32;
    let r = (r << 3) | (r >> 2);
    let g = (g << 2) | (g >> 4);
    let b = (b << 3) | (b >> 2);
    (r << 16) | (g << 8) | b
}

/// In-memory panel; transfers complete when waited on.
pub struct MemoryPanel {
    handle: PanelHandle,
}

impl MemoryPanel {
    pub fn new(width: usize, height: usize) -> Self {
        MemoryPanel {
            handle: PanelHandle {
                state: Arc::new(Mutex::new(PanelState {
                    width,
                    height,
                    pixels: vec![0; width * height],
                    window: WindowWrite { x: 0, y: 0, width, height },
                    cursor: 0,
                    in_batch: false,
                    busy: false,
                    presented: 0,
                    counters: PanelCounters::default(),
                    log: Vec::new(),
                })),
            },
        }
    }

    pub fn handle(&self) -> PanelHandle {
        self.handle.clone()
    }
}

impl Default for MemoryPanel {
    fn default() -> Self {
        Self::new(PANEL_WIDTH, PANEL_HEIGHT)
    }
}

impl Panel for MemoryPanel {
    fn width(&self) -> usize {
        self.handle.lock().width
    }

    fn height(&self) -> usize {
        self.handle.lock().height
    }

    fn begin_batch(&mut self) {
        let mut s = self.handle.lock();
        s.in_batch = true;
        s.counters.batches += 1;
    }

    fn end_batch(&mut self) {
        let mut s = self.handle.lock();
        if !s.in_batch {
            s.counters.unbalanced_ends += 1;
        }
        s.in_batch = false;
        s.presented += 1;
    }

    fn set_window(&mut self, x: usize, y: usize, width: usize, height: usize) {
        let window = WindowWrite { x, y, width, height };
        let mut s = self.handle.lock();
        s.window = window;
        s.cursor = 0;
        s.counters.windows += 1;
        if s.log.len() < WINDOW_LOG_LIMIT {
            s.log.push(window);
        }
    }

    fn write_pixels(&mut self, pixels: &[u16], dma_capable: bool) {
        let mut s = self.handle.lock();
        if s.busy {
            s.counters.overlapped_writes += 1;
        }
        if !s.in_batch {
            s.counters.unbracketed_writes += 1;
        }
        s.counters.writes += 1;
        s.counters.pixels_written += pixels.len() as u64;
        if dma_capable {
            s.counters.dma_writes += 1;
        }

        let win = s.window;
        let (pw, ph) = (s.width, s.height);
        for &p in pixels {
            let cur = s.cursor;
            if win.width == 0 || cur >= win.width * win.height {
                break;
            }
            let x = win.x + cur % win.width;
            let y = win.y + cur / win.width;
            if x < pw && y < ph {
                s.pixels[y * pw + x] = p;
            }
            s.cursor = cur + 1;
        }
        s.busy = true;
    }

    fn transfer_busy(&self) -> bool {
        self.handle.lock().busy
    }

    fn wait_transfer_complete(&mut self) {
        let mut s = self.handle.lock();
        s.busy = false;
        s.counters.waits += 1;
    }
}
