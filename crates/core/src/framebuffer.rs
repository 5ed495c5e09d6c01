//! Native-resolution framebuffers and the scanline writer.
//!
//! Each [`FrameBuffer`] holds 160×144 RGB565 pixels plus, per row, a 32-bit
//! FNV-1a content hash and a dirty flag. The hash is accumulated while the
//! line is written, so the compositor can diff rows without touching pixel
//! data. A row is dirty when its new hash differs from the hash this same
//! buffer held for that row last time it was written.
//!
//! Pixels arrive from the emulation core one line at a time through the
//! [`ScanlineSink`] trait, either palette-indexed (monochrome mode) or as
//! RGB888 (enhanced colour mode).

use crate::memory::{Block, MemoryPool, Placement};
use crate::{NATIVE_HEIGHT, NATIVE_WIDTH};

/// FNV-1a offset basis.
pub const HASH_SEED: u32 = 2_166_136_261;
/// FNV-1a prime.
pub const HASH_PRIME: u32 = 16_777_619;

/// Fold one RGB565 sample into a row hash.
#[inline(always)]
pub fn hash_step(hash: u32, value: u16) -> u32 {
    (hash ^ value as u32).wrapping_mul(HASH_PRIME)
}

/// Hash a whole row of samples.
pub fn hash_row(row: &[u16]) -> u32 {
    row.iter().fold(HASH_SEED, |h, &v| hash_step(h, v))
}

/// Pack an `0xRRGGBB` colour into RGB565.
#[inline(always)]
pub fn rgb888_to_rgb565(colour: u32) -> u16 {
    let r = ((colour >> 16) & 0xFF) as u16;
    let g = ((colour >> 8) & 0xFF) as u16;
    let b = (colour & 0xFF) as u16;
    ((r & 0xF8) << 8) | ((g & 0xFC) << 3) | (b >> 3)
}

// ─── Palette ────────────────────────────────────────────────────────────────

/// Default four-shade monochrome palette.
pub const DMG_DEFAULT_PALETTE: [u16; 4] = [0xFFFF, 0xAD55, 0x528A, 0x0000];

/// Pixel palette bits (4–5) of a raw indexed pixel.
const PALETTE_BITS: u8 = 0x30;
/// Colour index bits (0–1) of a raw indexed pixel.
const COLOUR_BITS: u8 = 0x03;

/// Monochrome-mode colour lookup.
///
/// With `twelve_colour` off every pixel uses `bg`. With it on, the raw
/// pixel's palette bits pick OBJ0 (0), OBJ1 (1) or BG (anything else).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Palette {
    pub bg: [u16; 4],
    pub obj0: [u16; 4],
    pub obj1: [u16; 4],
    pub twelve_colour: bool,
}

impl Palette {
    pub fn new() -> Self {
        Palette {
            bg: DMG_DEFAULT_PALETTE,
            obj0: DMG_DEFAULT_PALETTE,
            obj1: DMG_DEFAULT_PALETTE,
            twelve_colour: false,
        }
    }

    /// Twelve-colour palette from RGB888 triples (BG, OBJ0, OBJ1).
    pub fn from_rgb888(bg: [u32; 4], obj0: [u32; 4], obj1: [u32; 4]) -> Self {
        Palette {
            bg: bg.map(rgb888_to_rgb565),
            obj0: obj0.map(rgb888_to_rgb565),
            obj1: obj1.map(rgb888_to_rgb565),
            twelve_colour: true,
        }
    }

    #[inline(always)]
    pub fn lookup(&self, raw: u8) -> u16 {
        let colour = (raw & COLOUR_BITS) as usize;
        if !self.twelve_colour {
            return self.bg[colour];
        }
        match (raw & PALETTE_BITS) >> 4 {
            0 => self.obj0[colour],
            1 => self.obj1[colour],
            _ => self.bg[colour],
        }
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::new()
    }
}

// ─── FrameBuffer ────────────────────────────────────────────────────────────

/// One native-resolution frame with per-row hashes and dirty flags.
#[derive(Debug)]
pub struct FrameBuffer {
    index: usize,
    pixels: Block<u16>,
    row_hash: [u32; NATIVE_HEIGHT],
    row_dirty: [bool; NATIVE_HEIGHT],
    /// Frame was generated with interlaced scanlines
    pub interlaced: bool,
    /// Sequence number stamped by the producer on submit
    pub sequence: u64,
}

impl FrameBuffer {
    /// Allocate buffer `index` from `pool`, preferring fast memory.
    pub fn alloc(index: usize, pool: &mut MemoryPool) -> Option<Self> {
        let pixels = pool.alloc(NATIVE_WIDTH * NATIVE_HEIGHT, 0u16, Placement::PreferFast)?;
        Some(FrameBuffer {
            index,
            pixels,
            row_hash: [0; NATIVE_HEIGHT],
            row_dirty: [true; NATIVE_HEIGHT],
            interlaced: false,
            sequence: 0,
        })
    }

    /// Handoff slot this buffer belongs to (0 or 1).
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    pub fn row(&self, y: usize) -> &[u16] {
        &self.pixels[y * NATIVE_WIDTH..(y + 1) * NATIVE_WIDTH]
    }

    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn row_hashes(&self) -> &[u32; NATIVE_HEIGHT] {
        &self.row_hash
    }

    pub fn row_dirty(&self) -> &[bool; NATIVE_HEIGHT] {
        &self.row_dirty
    }

    pub fn clear_dirty(&mut self) {
        self.row_dirty = [false; NATIVE_HEIGHT];
    }

    pub fn dirty_rows(&self) -> usize {
        self.row_dirty.iter().filter(|&&d| d).count()
    }

    /// Store a finished RGB565 line, updating its hash and dirty flag.
    pub fn write_row(&mut self, line: usize, colours: &[u16]) {
        if line >= NATIVE_HEIGHT || colours.len() < NATIVE_WIDTH {
            return;
        }
        let mut hash = HASH_SEED;
        let dst = &mut self.pixels[line * NATIVE_WIDTH..(line + 1) * NATIVE_WIDTH];
        for (d, &c) in dst.iter_mut().zip(colours) {
            *d = c;
            hash = hash_step(hash, c);
        }
        self.finish_row(line, hash);
    }

    #[inline(always)]
    fn finish_row(&mut self, line: usize, hash: u32) {
        self.row_dirty[line] = hash != self.row_hash[line];
        self.row_hash[line] = hash;
    }

    /// Release the pixel storage back to `pool`.
    pub fn free(self, pool: &mut MemoryPool) {
        pool.free(self.pixels);
    }
}

// ─── Scanline delivery ──────────────────────────────────────────────────────

/// Receiver for the emulation core's per-line output.
pub trait ScanlineSink {
    /// Palette-indexed line (monochrome mode).
    fn draw_line(&mut self, line: usize, pixels: &[u8; NATIVE_WIDTH]);
    /// Direct colour line, `0xRRGGBB` per pixel (enhanced colour mode).
    fn draw_line_rgb888(&mut self, line: usize, pixels: &[u32; NATIVE_WIDTH]);
}

/// Writes core output into a framebuffer through a palette.
pub struct LineWriter<'a> {
    pub fb: &'a mut FrameBuffer,
    pub palette: &'a Palette,
}

impl<'a> ScanlineSink for LineWriter<'a> {
    fn draw_line(&mut self, line: usize, pixels: &[u8; NATIVE_WIDTH]) {
        if line >= NATIVE_HEIGHT {
            return;
        }
        let mut hash = HASH_SEED;
        let palette = self.palette;
        let dst = &mut self.fb.pixels[line * NATIVE_WIDTH..(line + 1) * NATIVE_WIDTH];
        for (d, &p) in dst.iter_mut().zip(pixels.iter()) {
            let c = palette.lookup(p);
            *d = c;
            hash = hash_step(hash, c);
        }
        self.fb.finish_row(line, hash);
    }

    fn draw_line_rgb888(&mut self, line: usize, pixels: &[u32; NATIVE_WIDTH]) {
        if line >= NATIVE_HEIGHT {
            return;
        }
        let mut hash = HASH_SEED;
        let dst = &mut self.fb.pixels[line * NATIVE_WIDTH..(line + 1) * NATIVE_WIDTH];
        for (d, &p) in dst.iter_mut().zip(pixels.iter()) {
            let c = rgb888_to_rgb565(p);
            *d = c;
            hash = hash_step(hash, c);
        }
        self.fb.finish_row(line, hash);
    }
}

/// Sink that drops every line; used for frames that are not presented.
pub struct NullSink;

impl ScanlineSink for NullSink {
    fn draw_line(&mut self, _line: usize, _pixels: &[u8; NATIVE_WIDTH]) {}
    fn draw_line_rgb888(&mut self, _line: usize, _pixels: &[u32; NATIVE_WIDTH]) {}
}
