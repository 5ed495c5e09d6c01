//! "ROM scope" demonstration core.
//!
//! Stands in for a real CPU/PPU core so the pipeline can be exercised on
//! any cartridge image. A cursor walks the ROM through the bank cache the
//! way a program counter would: mostly sequential reads, with a jump to
//! another bank every so often, the target picked by the ROM's own bytes.
//! Each frame renders the bytes around the view address as a bitmap, 20
//! bytes (160 bits) per line, with the cursor's line highlighted.
//!
//! Pacing is honoured the way a real core would: with frame skip on, every
//! other frame is stepped but not drawn; with interlace on, only lines of
//! the current field parity are drawn, the field flipping on every drawn
//! frame.

use cartstream_core::core_iface::{Buttons, CoreBus, EmulationCore};
use cartstream_core::pacing::PacingDecision;
use cartstream_core::{NATIVE_HEIGHT, NATIVE_WIDTH};

/// Bytes shown per scanline (one bit per pixel)
const BYTES_PER_LINE: usize = NATIVE_WIDTH / 8;
/// Cursor steps per emitted scanline
const STEPS_PER_LINE: u32 = 64;
/// Vertical blank lines after the visible ones
const VBLANK_LINES: usize = 10;
/// Sequential reads between bank jumps
const JUMP_INTERVAL: u32 = 1024;
/// Native cartridge bank size, for jump targets
const CART_BANK: usize = 0x4000;
/// Lines scrolled per Up/Down press
const SCROLL_LINES: usize = 8;

pub struct RomScope {
    pc: usize,
    view: Option<usize>,
    line: usize,
    line_steps: u32,
    since_jump: u32,
    frame: u64,
    /// Frames actually drawn; picks the interlace field
    drawn: u64,
    pacing: PacingDecision,
    buttons: Buttons,
    prev_buttons: Buttons,
    enhanced: Option<bool>,
    drawing: bool,
    last_visible: bool,
    jumps: u64,
}

impl RomScope {
    pub fn new() -> Self {
        RomScope {
            pc: 0x100,
            view: None,
            line: 0,
            line_steps: 0,
            since_jump: 0,
            frame: 0,
            drawn: 0,
            pacing: PacingDecision::default(),
            buttons: Buttons::default(),
            prev_buttons: Buttons::default(),
            enhanced: None,
            drawing: true,
            last_visible: true,
            jumps: 0,
        }
    }

    pub fn jumps(&self) -> u64 {
        self.jumps
    }

    /// First byte shown on line 0.
    fn view_base(&self) -> usize {
        match self.view {
            Some(v) => v,
            None => (self.pc / BYTES_PER_LINE).saturating_sub(NATIVE_HEIGHT / 2) * BYTES_PER_LINE,
        }
    }

    /// Held now but not on the previous frame.
    fn pressed(&self, b: Buttons) -> bool {
        self.buttons.contains(b) && !self.prev_buttons.contains(b)
    }

    fn apply_buttons(&mut self, rom_size: usize) {
        let page = SCROLL_LINES * BYTES_PER_LINE;
        let base = self.view_base();
        if self.pressed(Buttons::UP) {
            self.view = Some(base.saturating_sub(page));
        }
        if self.pressed(Buttons::DOWN) {
            self.view = Some((base + page).min(rom_size.saturating_sub(1)));
        }
        if self.pressed(Buttons::LEFT) {
            self.pc = self.pc.saturating_sub(CART_BANK);
        }
        if self.pressed(Buttons::RIGHT) && rom_size > 0 {
            self.pc = (self.pc + CART_BANK) % rom_size;
        }
        if self.pressed(Buttons::A) || self.pressed(Buttons::START) {
            self.view = None;
        }
        self.prev_buttons = self.buttons;
    }

    fn advance_cursor(&mut self, bus: &mut CoreBus<'_>) {
        let size = bus.rom.size().max(1);
        let byte = bus.rom.read(self.pc);
        self.pc = (self.pc + 1) % size;
        self.since_jump += 1;
        if self.since_jump >= JUMP_INTERVAL {
            self.since_jump = 0;
            let banks = (size / CART_BANK).max(1);
            let lo = bus.rom.read(self.pc) as usize;
            let hi = bus.rom.read(self.pc + 1) as usize;
            let offset = ((hi << 8) | lo) % CART_BANK;
            self.pc = ((byte as usize % banks) * CART_BANK + offset) % size;
            self.jumps += 1;
        }
    }

    fn draw_line(&self, bus: &mut CoreBus<'_>, enhanced: bool) {
        let y = self.line;
        let addr = self.view_base() + y * BYTES_PER_LINE;
        let cursor_line = self.pc >= addr && self.pc < addr + BYTES_PER_LINE;

        if enhanced {
            let mut px = [0u32; NATIVE_WIDTH];
            for i in 0..BYTES_PER_LINE {
                let b = bus.rom.read(addr + i) as u32;
                let colour = (b << 16) | ((b ^ 0xFF) << 8) | ((b * 7) & 0xFF);
                for bit in 0..8 {
                    let on = b & (0x80 >> bit) != 0;
                    px[i * 8 + bit] = match (on, cursor_line) {
                        (true, _) => colour,
                        (false, true) => 0x203040,
                        (false, false) => 0,
                    };
                }
            }
            bus.lcd.draw_line_rgb888(y, &px);
        } else {
            let mut px = [0u8; NATIVE_WIDTH];
            let (on_shade, off_shade) = if cursor_line { (3, 1) } else { (2, 0) };
            for i in 0..BYTES_PER_LINE {
                let b = bus.rom.read(addr + i);
                for bit in 0..8 {
                    px[i * 8 + bit] = if b & (0x80 >> bit) != 0 { on_shade } else { off_shade };
                }
            }
            bus.lcd.draw_line(y, &px);
        }
    }
}

impl Default for RomScope {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulationCore for RomScope {
    fn step(&mut self, bus: &mut CoreBus<'_>) -> bool {
        let enhanced = *self.enhanced.get_or_insert_with(|| bus.rom.is_cgb());
        if self.line == 0 && self.line_steps == 0 {
            self.apply_buttons(bus.rom.size());
            self.drawing = !(self.pacing.frame_skip && self.frame % 2 == 1);
        }

        self.advance_cursor(bus);
        self.line_steps += 1;
        if self.line_steps < STEPS_PER_LINE {
            return false;
        }
        self.line_steps = 0;

        if self.line < NATIVE_HEIGHT && self.drawing {
            let field = (self.drawn % 2) as usize;
            if !self.pacing.interlace || self.line % 2 == field {
                self.draw_line(bus, enhanced);
            }
        }

        self.line += 1;
        if self.line < NATIVE_HEIGHT + VBLANK_LINES {
            return false;
        }
        self.line = 0;
        self.frame += 1;
        if self.drawing {
            self.drawn += 1;
        }
        self.last_visible = self.drawing;
        true
    }

    fn set_pacing(&mut self, decision: PacingDecision) {
        self.pacing = decision;
    }

    fn set_buttons(&mut self, buttons: Buttons) {
        self.buttons = buttons;
    }

    fn frame_visible(&self) -> bool {
        self.last_visible
    }

    fn enhanced_color(&self) -> bool {
        self.enhanced.unwrap_or(false)
    }

    fn diagnostics(&self) -> String {
        format!("pc={:#07x} line={} frame={} jumps={}", self.pc, self.line, self.frame, self.jumps)
    }
}
