//! Differential frame compositor.
//!
//! Scales a 160×144 native frame onto the 240×135 panel (vertically, with
//! the image centred horizontally) and redraws only the panel rows whose
//! content changed since they were last presented.
//!
//! ## Modes
//!
//! | Mode        | Storage                              | Batching                 |
//! |-------------|--------------------------------------|--------------------------|
//! | `FullCache` | full panel-sized swap buffer         | any contiguous dirty run |
//! | `Fallback`  | 4-row scratch buffer                 | at most 4 rows per write |
//!
//! Both keep a per-panel-row hash of what was last sent. A row is skipped
//! without recomposition when it maps to exactly one source row, that source
//! row is not flagged dirty, and its hash equals the stored panel-row hash.
//! Otherwise the row is composed and its fresh hash decides whether it joins
//! the pending write segment.
//!
//! All writes of one frame sit inside a single `begin_batch`/`end_batch`
//! bracket, opened lazily on the first write. A frame with no changes
//! touches the panel not at all.

use std::time::{Duration, Instant};

use crate::config::ScaleFilter;
use crate::framebuffer::{hash_step, FrameBuffer, HASH_SEED};
use crate::memory::Block;
use crate::panel::Panel;
use crate::{FALLBACK_SEGMENT_ROWS, NATIVE_HEIGHT, NATIVE_WIDTH, PANEL_HEIGHT};

/// Weight meaning "entirely the next source row".
const FULL_WEIGHT: u16 = 256;

/// Which diffing strategy the compositor runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositorMode {
    FullCache,
    Fallback,
}

/// Per-frame compositor report.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComposeStats {
    pub rows_written: u32,
    pub segments: u32,
    pub duration: Duration,
    /// The composed frame was generated with interlaced scanlines
    pub interlaced: bool,
}

// ─── Row map ────────────────────────────────────────────────────────────────

/// Destination row → (source row, blend weight toward the next source row).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowMap {
    pub src: Vec<usize>,
    pub weight: Vec<u16>,
}

impl RowMap {
    /// Half-pixel-centre mapping of `dst_rows` onto `src_rows`.
    pub fn compute(src_rows: usize, dst_rows: usize, filter: ScaleFilter) -> RowMap {
        let mut src = Vec::with_capacity(dst_rows);
        let mut weight = Vec::with_capacity(dst_rows);
        let last = src_rows.saturating_sub(1);
        let scale = src_rows as f32 / dst_rows.max(1) as f32;
        let max_src = last as f32;

        for j in 0..dst_rows {
            let src_y = ((j as f32 + 0.5) * scale - 0.5).clamp(0.0, max_src);
            let mut y0 = src_y as usize;
            let frac = src_y - y0 as f32;

            let w = match filter {
                ScaleFilter::Nearest => {
                    if frac >= 0.5 && y0 < last {
                        y0 += 1;
                    }
                    0
                }
                ScaleFilter::Blend => {
                    let w = (frac * FULL_WEIGHT as f32).round() as u16;
                    if w >= FULL_WEIGHT {
                        y0 += 1;
                        0
                    } else {
                        w
                    }
                }
            };
            let y0 = y0.min(last);
            src.push(y0);
            weight.push(if y0 >= last { 0 } else { w });
        }
        RowMap { src, weight }
    }
}

// ─── Pixel helpers ──────────────────────────────────────────────────────────

/// Per-channel RGB565 blend; `w0 + w1 == 256`.
#[inline(always)]
pub fn blend_pixel(c0: u16, c1: u16, w0: u32, w1: u32) -> u16 {
    let (r0, g0, b0) = ((c0 >> 11) as u32 & 0x1F, (c0 >> 5) as u32 & 0x3F, c0 as u32 & 0x1F);
    let (r1, g1, b1) = ((c1 >> 11) as u32 & 0x1F, (c1 >> 5) as u32 & 0x3F, c1 as u32 & 0x1F);
    let r = (r0 * w0 + r1 * w1 + 128) >> 8;
    let g = (g0 * w0 + g1 * w1 + 128) >> 8;
    let b = (b0 * w0 + b1 * w1 + 128) >> 8;
    (((r & 0x1F) << 11) | ((g & 0x3F) << 5) | (b & 0x1F)) as u16
}

/// Produce one panel row into `dst` and return its hash.
///
/// Unblended rows reuse the source row's stored hash instead of rehashing.
fn compose_row(dst: &mut [u16], fb: &FrameBuffer, src_y0: usize, weight: u16) -> u32 {
    let row0 = fb.row(src_y0);
    if weight == 0 || src_y0 + 1 >= NATIVE_HEIGHT {
        dst.copy_from_slice(row0);
        return fb.row_hashes()[src_y0];
    }
    let row1 = fb.row(src_y0 + 1);
    let w1 = weight as u32;
    let w0 = FULL_WEIGHT as u32 - w1;
    let mut hash = HASH_SEED;
    for ((d, &a), &b) in dst.iter_mut().zip(row0).zip(row1) {
        let c = blend_pixel(a, b, w0, w1);
        *d = c;
        hash = hash_step(hash, c);
    }
    hash
}

/// Whether either contributing source row carries a dirty flag.
fn dirty_hint(fb: &FrameBuffer, cache_was_valid: bool, src_y0: usize, weight: u16) -> bool {
    if !cache_was_valid || src_y0 >= NATIVE_HEIGHT {
        return true;
    }
    let dirty = fb.row_dirty();
    let has_next = src_y0 + 1 < NATIVE_HEIGHT;
    match weight {
        0 => dirty[src_y0],
        _ if !has_next => dirty[src_y0],
        w if w >= FULL_WEIGHT => dirty[src_y0 + 1],
        _ => dirty[src_y0] || dirty[src_y0 + 1],
    }
}

/// Source-row hash a panel row would carry if it is an unblended copy.
fn expected_hash(fb: &FrameBuffer, src_y0: usize, weight: u16) -> Option<u32> {
    if weight == 0 {
        Some(fb.row_hashes()[src_y0])
    } else if weight == FULL_WEIGHT && src_y0 + 1 < NATIVE_HEIGHT {
        Some(fb.row_hashes()[src_y0 + 1])
    } else {
        None
    }
}

/// Lazily opened batch bracket plus counters for one frame.
struct FrameWrite {
    open: bool,
    rows: u32,
    segments: u32,
}

impl FrameWrite {
    fn new() -> Self {
        FrameWrite { open: false, rows: 0, segments: 0 }
    }

    fn write(&mut self, panel: &mut dyn Panel, x: usize, y: usize, rows: usize, pixels: &[u16], dma: bool) {
        if !self.open {
            panel.begin_batch();
            self.open = true;
        }
        if panel.transfer_busy() {
            panel.wait_transfer_complete();
        }
        panel.set_window(x, y, NATIVE_WIDTH, rows);
        panel.write_pixels(pixels, dma);
        self.rows += rows as u32;
        self.segments += 1;
    }

    /// Close the bracket if anything was written. Returns true if it was.
    fn finish(&self, panel: &mut dyn Panel) -> bool {
        if self.open {
            panel.wait_transfer_complete();
            panel.end_batch();
        }
        self.open
    }
}

/// Write the first `len` scratch rows and wait, since the scratch is reused.
fn flush_scratch(write: &mut FrameWrite, panel: &mut dyn Panel, x: usize, scratch: &[u16], start: usize, len: usize) {
    if len == 0 {
        return;
    }
    write.write(panel, x, start, len, &scratch[..len * NATIVE_WIDTH], true);
    panel.wait_transfer_complete();
}

// ─── FrameCompositor ────────────────────────────────────────────────────────

/// Scales, diffs and presents native frames on a [`Panel`].
pub struct FrameCompositor {
    panel: Box<dyn Panel>,
    filter: ScaleFilter,
    row_map: Option<RowMap>,
    swap: Option<Block<u16>>,
    scratch: Vec<u16>,
    swap_row_hash: [u32; PANEL_HEIGHT],
    display_cache_valid: bool,
    x_offset: usize,
    frames: u64,
}

impl FrameCompositor {
    /// Compositor in fallback mode.
    pub fn new(panel: Box<dyn Panel>, filter: ScaleFilter) -> Self {
        let x_offset = panel.width().saturating_sub(NATIVE_WIDTH) / 2;
        FrameCompositor {
            panel,
            filter,
            row_map: None,
            swap: None,
            scratch: vec![0; FALLBACK_SEGMENT_ROWS * NATIVE_WIDTH],
            swap_row_hash: [0; PANEL_HEIGHT],
            display_cache_valid: false,
            x_offset,
            frames: 0,
        }
    }

    /// Switch to full-cache mode using `swap` (panel rows × native width).
    pub fn with_swap_cache(mut self, mut swap: Block<u16>) -> Self {
        swap.fill(0xFFFF);
        self.swap = Some(swap);
        self.invalidate();
        self
    }

    /// Give back the swap cache, dropping to fallback mode.
    pub fn take_swap_cache(&mut self) -> Option<Block<u16>> {
        let swap = self.swap.take();
        self.invalidate();
        swap
    }

    pub fn mode(&self) -> CompositorMode {
        if self.swap.is_some() {
            CompositorMode::FullCache
        } else {
            CompositorMode::Fallback
        }
    }

    /// Forget what the panel shows; the next frame redraws every row.
    pub fn invalidate(&mut self) {
        self.display_cache_valid = false;
        self.swap_row_hash = [0; PANEL_HEIGHT];
    }

    pub fn display_cache_valid(&self) -> bool {
        self.display_cache_valid
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Row map, computing it on first use.
    pub fn row_map(&mut self) -> &RowMap {
        let filter = self.filter;
        self.row_map
            .get_or_insert_with(|| RowMap::compute(NATIVE_HEIGHT, PANEL_HEIGHT, filter))
    }

    /// Present `fb`, writing only changed rows. Clears the frame's dirty flags.
    pub fn composite(&mut self, fb: &mut FrameBuffer) -> ComposeStats {
        let start = Instant::now();
        if self.row_map.is_none() {
            self.row_map = Some(RowMap::compute(NATIVE_HEIGHT, PANEL_HEIGHT, self.filter));
        }
        let map = match self.row_map.take() {
            Some(m) => m,
            None => return ComposeStats::default(),
        };

        let write = if self.swap.is_some() {
            self.composite_full(fb, &map)
        } else {
            self.composite_fallback(fb, &map)
        };
        self.row_map = Some(map);

        if write.finish(self.panel.as_mut()) {
            self.display_cache_valid = true;
        }
        fb.clear_dirty();
        self.frames += 1;

        ComposeStats {
            rows_written: write.rows,
            segments: write.segments,
            duration: start.elapsed(),
            interlaced: fb.interlaced,
        }
    }

    fn composite_full(&mut self, fb: &FrameBuffer, map: &RowMap) -> FrameWrite {
        let mut write = FrameWrite::new();
        let cache_was_valid = self.display_cache_valid;
        let x = self.x_offset;
        let panel = self.panel.as_mut();
        let swap = match self.swap.as_mut() {
            Some(s) => s,
            None => return write,
        };
        let dma = swap.dma_capable();
        let mut seg_start = 0;
        let mut seg_len = 0;

        for j in 0..PANEL_HEIGHT {
            let (src, weight) = (map.src[j], map.weight[j]);
            let hint = dirty_hint(fb, cache_was_valid, src, weight);

            if cache_was_valid && !hint && expected_hash(fb, src, weight) == Some(self.swap_row_hash[j]) {
                if seg_len != 0 {
                    let px = &swap[seg_start * NATIVE_WIDTH..(seg_start + seg_len) * NATIVE_WIDTH];
                    write.write(panel, x, seg_start, seg_len, px, dma);
                    seg_len = 0;
                }
                continue;
            }

            let row = &mut swap[j * NATIVE_WIDTH..(j + 1) * NATIVE_WIDTH];
            let hash = compose_row(row, fb, src, weight);

            if !cache_was_valid || self.swap_row_hash[j] != hash {
                self.swap_row_hash[j] = hash;
                if seg_len == 0 {
                    seg_start = j;
                }
                seg_len += 1;
            } else if seg_len != 0 {
                let px = &swap[seg_start * NATIVE_WIDTH..(seg_start + seg_len) * NATIVE_WIDTH];
                write.write(panel, x, seg_start, seg_len, px, dma);
                seg_len = 0;
            }
        }
        if seg_len != 0 {
            let px = &swap[seg_start * NATIVE_WIDTH..(seg_start + seg_len) * NATIVE_WIDTH];
            write.write(panel, x, seg_start, seg_len, px, dma);
        }
        write
    }

    fn composite_fallback(&mut self, fb: &FrameBuffer, map: &RowMap) -> FrameWrite {
        let mut write = FrameWrite::new();
        let cache_was_valid = self.display_cache_valid;
        let x = self.x_offset;
        let panel = self.panel.as_mut();
        let scratch = &mut self.scratch;
        let mut seg_start = 0;
        let mut seg_len = 0;

        for j in 0..PANEL_HEIGHT {
            let (src, weight) = (map.src[j], map.weight[j]);
            let hint = dirty_hint(fb, cache_was_valid, src, weight);

            if cache_was_valid && !hint && expected_hash(fb, src, weight) == Some(self.swap_row_hash[j]) {
                flush_scratch(&mut write, panel, x, scratch, seg_start, seg_len);
                seg_len = 0;
                continue;
            }

            let slot = &mut scratch[seg_len * NATIVE_WIDTH..(seg_len + 1) * NATIVE_WIDTH];
            let hash = compose_row(slot, fb, src, weight);

            if !cache_was_valid || self.swap_row_hash[j] != hash {
                self.swap_row_hash[j] = hash;
                if seg_len == 0 {
                    seg_start = j;
                }
                seg_len += 1;
                if seg_len == FALLBACK_SEGMENT_ROWS {
                    flush_scratch(&mut write, panel, x, scratch, seg_start, seg_len);
                    seg_len = 0;
                }
            } else {
                flush_scratch(&mut write, panel, x, scratch, seg_start, seg_len);
                seg_len = 0;
            }
        }
        flush_scratch(&mut write, panel, x, scratch, seg_start, seg_len);
        write
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPool, Placement};
    use crate::panel::{MemoryPanel, PanelHandle};
    use crate::PANEL_WIDTH;

    fn frame(pool: &mut MemoryPool, seed: u16) -> FrameBuffer {
        let mut fb = FrameBuffer::alloc(0, pool).unwrap();
        for y in 0..NATIVE_HEIGHT {
            let row: Vec<u16> =
                (0..NATIVE_WIDTH).map(|x| (x as u16).wrapping_mul(31) ^ (y as u16) << 5 ^ seed).collect();
            fb.write_row(y, &row);
        }
        fb
    }

    fn full_cache(pool: &mut MemoryPool, filter: ScaleFilter) -> (FrameCompositor, PanelHandle) {
        let panel = MemoryPanel::default();
        let handle = panel.handle();
        let swap = pool.alloc(PANEL_HEIGHT * NATIVE_WIDTH, 0u16, Placement::ExtendedOnly).unwrap();
        (FrameCompositor::new(Box::new(panel), filter).with_swap_cache(swap), handle)
    }

    fn fallback() -> (FrameCompositor, PanelHandle) {
        let panel = MemoryPanel::default();
        let handle = panel.handle();
        (FrameCompositor::new(Box::new(panel), ScaleFilter::Nearest), handle)
    }

    #[test]
    fn test_row_map_is_deterministic() {
        let a = RowMap::compute(NATIVE_HEIGHT, PANEL_HEIGHT, ScaleFilter::Nearest);
        let b = RowMap::compute(NATIVE_HEIGHT, PANEL_HEIGHT, ScaleFilter::Nearest);
        assert_eq!(a, b);
        assert_eq!(a.src.len(), PANEL_HEIGHT);
        assert_eq!(a.src[0], 0);
        assert_eq!(a.src[PANEL_HEIGHT - 1], NATIVE_HEIGHT - 1);
        assert!(a.weight.iter().all(|&w| w == 0));
        assert!(a.src.windows(2).all(|w| w[0] < w[1]));

        let mut comp = fallback().0;
        let first = comp.row_map().clone();
        comp.row_map = None;
        assert_eq!(comp.row_map(), &first);
        assert_eq!(first, a);
    }

    #[test]
    fn test_blend_row_map_weights() {
        let m = RowMap::compute(NATIVE_HEIGHT, PANEL_HEIGHT, ScaleFilter::Blend);
        assert_eq!(m, RowMap::compute(NATIVE_HEIGHT, PANEL_HEIGHT, ScaleFilter::Blend));
        assert!(m.weight.iter().all(|&w| w < FULL_WEIGHT));
        assert!(m.weight.iter().any(|&w| w > 0));
        assert!(m.src.iter().all(|&s| s < NATIVE_HEIGHT));
        assert_eq!(m.weight[PANEL_HEIGHT - 1], 0);
    }

    #[test]
    fn test_blend_pixel() {
        assert_eq!(blend_pixel(0xFFFF, 0x0000, 128, 128), 0x8410);
        assert_eq!(blend_pixel(0x1234, 0xBEEF, 256, 0), 0x1234);
        assert_eq!(blend_pixel(0x1234, 0xBEEF, 0, 256), 0xBEEF);
    }

    #[test]
    fn test_identical_frame_flushes_nothing() {
        let mut pool = MemoryPool::unbounded();
        let (mut comp, handle) = full_cache(&mut pool, ScaleFilter::Nearest);
        assert_eq!(comp.mode(), CompositorMode::FullCache);
        let mut fb = frame(&mut pool, 0);

        let first = comp.composite(&mut fb);
        assert_eq!(first.segments, 1);
        assert_eq!(first.rows_written, PANEL_HEIGHT as u32);
        assert!(comp.display_cache_valid());

        let second = comp.composite(&mut fb);
        assert_eq!(second.segments, 0);
        assert_eq!(second.rows_written, 0);

        let c = handle.counters();
        assert_eq!(c.batches, 1);
        assert_eq!(c.overlapped_writes, 0);
        assert_eq!(c.unbracketed_writes, 0);
        assert_eq!(c.unbalanced_ends, 0);
    }

    #[test]
    fn test_identical_frame_with_blend() {
        let mut pool = MemoryPool::unbounded();
        let (mut comp, _) = full_cache(&mut pool, ScaleFilter::Blend);
        let mut fb = frame(&mut pool, 3);
        assert!(comp.composite(&mut fb).segments > 0);
        assert_eq!(comp.composite(&mut fb).segments, 0);
    }

    #[test]
    fn test_panel_receives_scaled_image() {
        let mut pool = MemoryPool::unbounded();
        let (mut comp, handle) = full_cache(&mut pool, ScaleFilter::Nearest);
        let mut fb = frame(&mut pool, 9);
        comp.composite(&mut fb);

        let map = comp.row_map().clone();
        let px = handle.snapshot();
        let x0 = (PANEL_WIDTH - NATIVE_WIDTH) / 2;
        for j in [0, 17, 67, PANEL_HEIGHT - 1] {
            let panel_row = &px[j * PANEL_WIDTH + x0..j * PANEL_WIDTH + x0 + NATIVE_WIDTH];
            assert_eq!(panel_row, fb.row(map.src[j]));
        }
        assert_eq!(px[0], 0);
    }

    #[test]
    fn test_single_changed_row_is_one_segment() {
        let mut pool = MemoryPool::unbounded();
        let (mut comp, handle) = full_cache(&mut pool, ScaleFilter::Nearest);
        let mut fb = frame(&mut pool, 1);
        comp.composite(&mut fb);
        handle.take_log();

        let target = comp.row_map().src[60];
        fb.write_row(target, &[0xF800; NATIVE_WIDTH]);
        let stats = comp.composite(&mut fb);
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.rows_written, 1);
        let log = handle.take_log();
        assert_eq!(log.len(), 1);
        assert_eq!((log[0].y, log[0].height, log[0].width), (60, 1, NATIVE_WIDTH));
    }

    #[test]
    fn test_unmapped_source_row_changes_nothing() {
        let mut pool = MemoryPool::unbounded();
        let (mut comp, _) = full_cache(&mut pool, ScaleFilter::Nearest);
        let mut fb = frame(&mut pool, 1);
        comp.composite(&mut fb);
        let map = comp.row_map().clone();
        let hidden = (0..NATIVE_HEIGHT).find(|y| !map.src.contains(y)).unwrap();
        fb.write_row(hidden, &[0x07E0; NATIVE_WIDTH]);
        assert_eq!(comp.composite(&mut fb).rows_written, 0);
    }

    #[test]
    fn test_fallback_batches_four_rows() {
        let mut pool = MemoryPool::unbounded();
        let (mut comp, handle) = fallback();
        assert_eq!(comp.mode(), CompositorMode::Fallback);
        let mut fb = frame(&mut pool, 5);

        let first = comp.composite(&mut fb);
        let expected = (PANEL_HEIGHT + FALLBACK_SEGMENT_ROWS - 1) / FALLBACK_SEGMENT_ROWS;
        assert_eq!(first.segments as usize, expected);
        assert_eq!(first.rows_written as usize, PANEL_HEIGHT);
        assert!(handle.take_log().iter().all(|w| w.height <= FALLBACK_SEGMENT_ROWS));

        let second = comp.composite(&mut fb);
        assert_eq!(second.segments, 0);

        let map = comp.row_map().clone();
        fb.write_row(map.src[10], &[1; NATIVE_WIDTH]);
        fb.write_row(map.src[100], &[2; NATIVE_WIDTH]);
        let third = comp.composite(&mut fb);
        assert_eq!((third.segments, third.rows_written), (2, 2));

        let c = handle.counters();
        assert_eq!(c.overlapped_writes, 0);
        assert_eq!(c.batches, 2);
        let px = handle.snapshot();
        let x0 = (PANEL_WIDTH - NATIVE_WIDTH) / 2;
        assert_eq!(px[100 * PANEL_WIDTH + x0], 2);
    }

    #[test]
    fn test_invalidate_forces_full_redraw() {
        let mut pool = MemoryPool::unbounded();
        let (mut comp, _) = full_cache(&mut pool, ScaleFilter::Nearest);
        let mut fb = frame(&mut pool, 2);
        comp.composite(&mut fb);
        comp.invalidate();
        assert_eq!(comp.composite(&mut fb).rows_written, PANEL_HEIGHT as u32);
        assert!(comp.take_swap_cache().is_some());
        assert_eq!(comp.mode(), CompositorMode::Fallback);
    }

    #[test]
    fn test_dirty_flags_cleared_and_interlace_reported() {
        let mut pool = MemoryPool::unbounded();
        let (mut comp, _) = fallback();
        let mut fb = frame(&mut pool, 4);
        fb.interlaced = true;
        let stats = comp.composite(&mut fb);
        assert!(stats.interlaced);
        assert_eq!(fb.dirty_rows(), 0);
    }
}
