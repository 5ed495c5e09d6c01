//! Streaming ROM bank cache.
//!
//! Cartridge images are far larger than fast memory, so ROM is virtualised
//! over a small arena of fixed-size bank buffers:
//!
//! - **bank0**: always resident copy of the lowest bank (the fixed bank
//!   every cartridge executes from).
//! - **hot bank**: the last bank that served a read, checked before the
//!   slot table.
//! - **slots**: an arena of bank buffers threaded on an index-linked LRU
//!   list, most recently used first.
//!
//! A miss fills the victim slot synchronously (one storage read of at most
//! one bank) and then prefetches the next sequential bank into a second
//! slot, placing it directly behind the just-filled one in LRU order.
//!
//! In direct-map mode the whole image is already addressable in memory and
//! reads bypass the slots entirely.
//!
//! Storage errors never surface from [`RomCache::read`]: a failed or short
//! fill is padded with `0xFF` (erased flash) and the slot is kept valid so
//! that a known-bad bank is not re-read on every access.

use std::io;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::memory::{Block, MemoryPool, Placement};
use crate::storage::{read_fully, RomStream};
use crate::{ROM_BANK_SIZE_EXTENDED, ROM_BANK_SIZE_INTERNAL};

/// Header offset of the colour-support flag.
pub const CGB_FLAG_ADDR: usize = 0x0143;

/// Byte returned for any address past the end of the image.
pub const OPEN_BUS: u8 = 0xFF;

/// How the cache is currently serving reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Closed,
    Streaming,
    DirectMap,
}

/// Cache geometry requested at open time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheOptions {
    /// Requested slot count; fewer may be allocated
    pub banks: usize,
    /// Bytes per bank
    pub bank_size: usize,
    /// Prefetch the next sequential bank on every miss
    pub prefetch: bool,
}

impl CacheOptions {
    /// Bank size follows the memory layout: small 4 KiB blocks when extended
    /// memory holds the slots, full 16 KiB cartridge banks otherwise.
    pub fn for_pool(pool: &MemoryPool, banks: usize, prefetch: bool) -> Self {
        let bank_size = if pool.has_extended() {
            ROM_BANK_SIZE_EXTENDED
        } else {
            ROM_BANK_SIZE_INTERNAL
        };
        CacheOptions { banks, bank_size, prefetch }
    }
}

/// Cumulative cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Misses (or prefetches) that displaced a different valid bank
    pub swaps: u64,
    /// Bank fills that hit a storage error or a short read
    pub fill_failures: u64,
    pub bank_count: usize,
    pub bank_size: usize,
    pub mode: CacheMode,
}

// ─── Internals ──────────────────────────────────────────────────────────────

struct BankSlot {
    data: Block<u8>,
    bank: Option<u32>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HotSlot {
    Bank0,
    Slot(usize),
}

#[derive(Clone, Copy, Debug)]
struct HotBank {
    base: usize,
    slot: HotSlot,
}

/// Address split, decided once per open.
#[derive(Clone, Copy, Debug, Default)]
struct Geometry {
    pow2: bool,
    shift: u32,
    mask: usize,
}

impl Geometry {
    fn new(bank_size: usize) -> Self {
        if bank_size.is_power_of_two() {
            Geometry { pow2: true, shift: bank_size.trailing_zeros(), mask: bank_size - 1 }
        } else {
            Geometry::default()
        }
    }
}

enum Source {
    None,
    Stream(Box<dyn RomStream>),
    Memory(Arc<[u8]>),
}

struct FillReport {
    expected: usize,
    read: usize,
    error: Option<io::Error>,
}

/// Fill `buf` from `base`, padding everything past the bytes actually read
/// with `0xFF`.
fn fill_block(stream: &mut dyn RomStream, buf: &mut [u8], base: usize, rom_size: usize) -> FillReport {
    let expected = rom_size.saturating_sub(base).min(buf.len());
    let (read, error) = match stream.seek_to(base as u64) {
        Ok(()) => read_fully(stream, &mut buf[..expected]),
        Err(e) => (0, Some(e)),
    };
    buf[read..].fill(OPEN_BUS);
    FillReport { expected, read, error }
}

// ─── RomCache ───────────────────────────────────────────────────────────────

/// Byte-addressable cartridge ROM over a bounded set of bank buffers.
pub struct RomCache {
    source: Source,
    size: usize,
    bank_size: usize,
    geometry: Geometry,
    bank0: Option<Block<u8>>,
    slots: Vec<BankSlot>,
    lru_head: Option<usize>,
    lru_tail: Option<usize>,
    hot: Option<HotBank>,
    prefetch: bool,
    hits: u64,
    misses: u64,
    swaps: u64,
    fill_failures: u64,
}

impl RomCache {
    pub fn new() -> Self {
        RomCache {
            source: Source::None,
            size: 0,
            bank_size: 0,
            geometry: Geometry::default(),
            bank0: None,
            slots: Vec::new(),
            lru_head: None,
            lru_tail: None,
            hot: None,
            prefetch: true,
            hits: 0,
            misses: 0,
            swaps: 0,
            fill_failures: 0,
        }
    }

    /// Enter streaming mode over `stream`.
    ///
    /// Allocates bank0 (fast memory preferred) and up to `opts.banks` slots
    /// (extended memory preferred), shrinking the slot count if the pool
    /// runs dry. Fails only if the image is empty, no slot at all can be
    /// allocated, or bank0 cannot be read in full.
    pub fn open(
        &mut self,
        mut stream: Box<dyn RomStream>,
        pool: &mut MemoryPool,
        opts: &CacheOptions,
    ) -> Result<(), PipelineError> {
        self.close(pool);

        let reported = stream.size();
        let size = usize::try_from(reported).map_err(|_| PipelineError::RomTooLarge(reported))?;
        if size == 0 {
            return Err(PipelineError::EmptyRom);
        }
        let bank_size = opts.bank_size.max(1);

        let mut bank0 = match pool.alloc(bank_size, OPEN_BUS, Placement::PreferFast) {
            Some(b) => b,
            None => {
                log::error!("ROM cache: failed to allocate bank0 buffer");
                return Err(PipelineError::NoCacheBanks);
            }
        };

        let requested = opts.banks.max(1);
        let mut slots = Vec::with_capacity(requested);
        for i in 0..requested {
            match pool.alloc(bank_size, OPEN_BUS, Placement::PreferExtended) {
                Some(data) => slots.push(BankSlot { data, bank: None, prev: None, next: None }),
                None => {
                    log::warn!("ROM cache: failed to allocate bank buffer #{}", i);
                    break;
                }
            }
        }
        if slots.is_empty() {
            log::error!("ROM cache: unable to allocate any cache banks");
            pool.free(bank0);
            return Err(PipelineError::NoCacheBanks);
        }
        if slots.len() < requested {
            log::warn!(
                "ROM cache: reducing active banks to {} due to memory limits",
                slots.len()
            );
        }

        let report = fill_block(stream.as_mut(), &mut bank0, 0, size);
        if report.read != report.expected {
            if let Some(e) = &report.error {
                log::error!("ROM cache: first bank read failed: {}", e);
            }
            pool.free(bank0);
            for slot in slots {
                pool.free(slot.data);
            }
            return Err(PipelineError::FirstBankUnreadable {
                expected: report.expected,
                got: report.read,
            });
        }

        log::info!(
            "Streaming ROM ({} bytes), {} banks of {:#x} bytes, prefetch {}",
            size,
            slots.len(),
            bank_size,
            if opts.prefetch { "on" } else { "off" }
        );

        self.source = Source::Stream(stream);
        self.size = size;
        self.bank_size = bank_size;
        self.geometry = Geometry::new(bank_size);
        self.bank0 = Some(bank0);
        self.slots = slots;
        self.prefetch = opts.prefetch;
        self.hot = Some(HotBank { base: 0, slot: HotSlot::Bank0 });
        Ok(())
    }

    /// Enter direct-map mode: every read is served straight from `rom`.
    pub fn open_memory(&mut self, rom: Arc<[u8]>, pool: &mut MemoryPool) -> Result<(), PipelineError> {
        self.close(pool);
        if rom.is_empty() {
            return Err(PipelineError::EmptyRom);
        }
        log::info!("ROM mapped directly ({} bytes), bank cache disabled", rom.len());
        self.size = rom.len();
        self.source = Source::Memory(rom);
        Ok(())
    }

    /// Release every buffer back to `pool` and reset all state.
    pub fn close(&mut self, pool: &mut MemoryPool) {
        if let Some(b0) = self.bank0.take() {
            pool.free(b0);
        }
        for slot in self.slots.drain(..) {
            pool.free(slot.data);
        }
        self.source = Source::None;
        self.size = 0;
        self.bank_size = 0;
        self.geometry = Geometry::default();
        self.lru_head = None;
        self.lru_tail = None;
        self.hot = None;
        self.reset_counters();
    }

    /// Shrink the slot arena to `new_count` (at least one), freeing the rest.
    ///
    /// Every slot is invalidated and the counters restart. Returns the slot
    /// count now in use.
    pub fn trim_banks(&mut self, new_count: usize, pool: &mut MemoryPool) -> usize {
        let new_count = new_count.max(1);
        if new_count >= self.slots.len() {
            return self.slots.len();
        }
        for slot in self.slots.drain(new_count..) {
            pool.free(slot.data);
        }
        for slot in self.slots.iter_mut() {
            slot.bank = None;
            slot.prev = None;
            slot.next = None;
        }
        self.lru_head = None;
        self.lru_tail = None;
        self.hot = None;
        self.reset_counters();
        self.slots.len()
    }

    fn reset_counters(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.swaps = 0;
        self.fill_failures = 0;
    }

    // ─── Read path ──────────────────────────────────────────────────────────

    /// Read one ROM byte. Addresses past the end read as `0xFF`.
    #[inline]
    pub fn read(&mut self, addr: usize) -> u8 {
        if addr >= self.size {
            return OPEN_BUS;
        }
        let stream_open = match &self.source {
            Source::Memory(rom) => {
                let v = rom[addr];
                self.hits += 1;
                return v;
            }
            Source::Stream(_) => true,
            Source::None => false,
        };
        if !stream_open {
            return OPEN_BUS;
        }

        if addr < self.bank_size {
            return match &self.bank0 {
                Some(b0) => {
                    self.hits += 1;
                    self.hot = Some(HotBank { base: 0, slot: HotSlot::Bank0 });
                    b0[addr]
                }
                None => OPEN_BUS,
            };
        }

        if let Some(hot) = self.hot {
            let rel = addr.wrapping_sub(hot.base);
            if addr >= hot.base && rel < self.bank_size {
                self.hits += 1;
                return self.hot_byte(hot.slot, rel);
            }
        }

        let (bank, offset) = self.split(addr);
        self.read_slow(bank, offset)
    }

    #[inline(always)]
    fn split(&self, addr: usize) -> (u32, usize) {
        if self.geometry.pow2 {
            ((addr >> self.geometry.shift) as u32, addr & self.geometry.mask)
        } else {
            ((addr / self.bank_size) as u32, addr % self.bank_size)
        }
    }

    #[inline(always)]
    fn hot_byte(&self, slot: HotSlot, rel: usize) -> u8 {
        match slot {
            HotSlot::Bank0 => self.bank0.as_ref().map_or(OPEN_BUS, |b| b[rel]),
            HotSlot::Slot(i) => self.slots[i].data[rel],
        }
    }

    fn read_slow(&mut self, bank: u32, offset: usize) -> u8 {
        let mut empty = None;
        for i in 0..self.slots.len() {
            match self.slots[i].bank {
                Some(b) if b == bank => {
                    self.hits += 1;
                    self.lru_touch(i);
                    self.set_hot(bank, i);
                    return self.slots[i].data[offset];
                }
                None if empty.is_none() => empty = Some(i),
                _ => {}
            }
        }

        self.misses += 1;
        let victim = empty.or(self.lru_tail).unwrap_or(0);
        self.load_into(victim, bank);
        self.lru_touch(victim);

        if self.prefetch && self.slots.len() > 1 {
            self.prefetch_after(bank + 1, victim);
        }

        self.set_hot(bank, victim);
        self.slots[victim].data[offset]
    }

    /// Evict whatever `idx` holds and fill it with `bank`, leaving it
    /// detached from the LRU list.
    fn load_into(&mut self, idx: usize, bank: u32) {
        let prev_bank = self.slots[idx].bank;
        self.lru_detach(idx);
        self.slots[idx].bank = None;

        let base = bank as usize * self.bank_size;
        let report = match &mut self.source {
            Source::Stream(stream) => fill_block(stream.as_mut(), &mut self.slots[idx].data, base, self.size),
            _ => {
                self.slots[idx].data.fill(OPEN_BUS);
                FillReport { expected: 0, read: 0, error: None }
            }
        };
        if report.read != report.expected || report.error.is_some() {
            self.fill_failures += 1;
            match report.error {
                Some(e) => log::warn!("ROM cache: failed to fill bank {}: {}", bank, e),
                None => log::warn!(
                    "ROM cache: short read (bank {}, expected {}, got {})",
                    bank,
                    report.expected,
                    report.read
                ),
            }
        }

        self.slots[idx].bank = Some(bank);
        if matches!(prev_bank, Some(p) if p != bank) {
            self.swaps += 1;
        }
    }

    fn prefetch_after(&mut self, next_bank: u32, filled: usize) {
        if next_bank as usize * self.bank_size >= self.size {
            return;
        }
        if self.slots.iter().any(|s| s.bank == Some(next_bank)) {
            return;
        }
        let candidate = (0..self.slots.len())
            .find(|&i| i != filled && self.slots[i].bank.is_none())
            .or_else(|| match self.lru_tail {
                Some(t) if t == filled => self.slots[t].prev,
                other => other,
            });
        if let Some(idx) = candidate {
            self.load_into(idx, next_bank);
            self.lru_insert_after(idx, filled);
        }
    }

    fn set_hot(&mut self, bank: u32, idx: usize) {
        self.hot = Some(HotBank { base: bank as usize * self.bank_size, slot: HotSlot::Slot(idx) });
    }

    // ─── LRU list ───────────────────────────────────────────────────────────

    fn lru_detach(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None if self.lru_head == Some(idx) => self.lru_head = next,
            None => {}
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None if self.lru_tail == Some(idx) => self.lru_tail = prev,
            None => {}
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn lru_touch(&mut self, idx: usize) {
        if self.lru_head == Some(idx) {
            return;
        }
        self.lru_detach(idx);
        self.slots[idx].next = self.lru_head;
        if let Some(h) = self.lru_head {
            self.slots[h].prev = Some(idx);
        }
        self.lru_head = Some(idx);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(idx);
        }
    }

    fn lru_insert_after(&mut self, idx: usize, after: usize) {
        self.lru_detach(idx);
        let next = self.slots[after].next;
        self.slots[idx].prev = Some(after);
        self.slots[idx].next = next;
        self.slots[after].next = Some(idx);
        match next {
            Some(n) => self.slots[n].prev = Some(idx),
            None => self.lru_tail = Some(idx),
        }
    }

    // ─── Queries ────────────────────────────────────────────────────────────

    pub fn mode(&self) -> CacheMode {
        match self.source {
            Source::None => CacheMode::Closed,
            Source::Stream(_) => CacheMode::Streaming,
            Source::Memory(_) => CacheMode::DirectMap,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bank_size(&self) -> usize {
        self.bank_size
    }

    pub fn bank_count(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            swaps: self.swaps,
            fill_failures: self.fill_failures,
            bank_count: self.slots.len(),
            bank_size: self.bank_size,
            mode: self.mode(),
        }
    }

    /// Resident banks, most recently used first.
    pub fn lru_order(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.slots.len());
        let mut cur = self.lru_head;
        while let Some(i) = cur {
            if let Some(b) = self.slots[i].bank {
                out.push(b);
            }
            cur = self.slots[i].next;
        }
        out
    }

    /// Raw colour-support flag from the cartridge header (0 if unavailable).
    pub fn cgb_flag(&self) -> u8 {
        if self.size <= CGB_FLAG_ADDR {
            return 0;
        }
        match &self.source {
            Source::Memory(rom) => rom[CGB_FLAG_ADDR],
            Source::Stream(_) if self.bank_size > CGB_FLAG_ADDR => {
                self.bank0.as_ref().map_or(0, |b| b[CGB_FLAG_ADDR])
            }
            _ => 0,
        }
    }

    /// Cartridge supports enhanced colour.
    pub fn is_cgb(&self) -> bool {
        self.cgb_flag() & 0x80 != 0
    }

    /// Cartridge requires enhanced colour.
    pub fn is_cgb_only(&self) -> bool {
        self.cgb_flag() == 0xC0
    }
}

impl Default for RomCache {
    fn default() -> Self {
        Self::new()
    }
}
