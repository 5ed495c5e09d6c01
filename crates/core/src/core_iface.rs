//! Interface to the instruction-level emulation core.
//!
//! The pipeline never looks inside the core. It hands the core a
//! [`CoreBus`] (cartridge ROM through the cache, and a scanline sink for the
//! current framebuffer), steps it until a video frame completes, and feeds
//! it button state and pacing flags between frames.

use bitflags::bitflags;

use crate::framebuffer::ScanlineSink;
use crate::pacing::PacingDecision;
use crate::rom_cache::RomCache;

bitflags! {
    /// Pressed handheld buttons.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Buttons: u8 {
        const RIGHT = 0x01;
        const LEFT = 0x02;
        const UP = 0x04;
        const DOWN = 0x08;
        const A = 0x10;
        const B = 0x20;
        const SELECT = 0x40;
        const START = 0x80;
    }
}

/// What the core can reach while stepping.
pub struct CoreBus<'a> {
    pub rom: &'a mut RomCache,
    pub lcd: &'a mut dyn ScanlineSink,
}

/// An emulation core driven one step at a time.
pub trait EmulationCore {
    /// Execute one step. Returns true when a video frame just completed.
    fn step(&mut self, bus: &mut CoreBus<'_>) -> bool;

    /// Pacing flags for the frame about to run.
    fn set_pacing(&mut self, decision: PacingDecision);

    fn set_buttons(&mut self, buttons: Buttons);

    /// Whether the frame that just completed should be presented.
    fn frame_visible(&self) -> bool {
        true
    }

    /// Content renders in enhanced colour mode.
    fn enhanced_color(&self) -> bool {
        false
    }

    /// Short state dump logged when the watchdog trips.
    fn diagnostics(&self) -> String {
        String::new()
    }
}

/// Result of stepping one frame under the watchdog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WatchdogOutcome {
    pub completed: bool,
    pub steps: u32,
}

/// Step `core` until it reports a finished frame or `max_steps` run out.
///
/// An exhausted budget leaves the core as it is; the caller treats the
/// frame as incomplete and carries on with the next iteration.
pub fn run_frame_watchdog<C: EmulationCore + ?Sized>(
    core: &mut C,
    bus: &mut CoreBus<'_>,
    max_steps: u32,
) -> WatchdogOutcome {
    let mut steps = 0;
    while steps < max_steps {
        steps += 1;
        if core.step(bus) {
            return WatchdogOutcome { completed: true, steps };
        }
    }
    WatchdogOutcome { completed: false, steps }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::NullSink;
    use crate::memory::MemoryPool;
    use crate::NATIVE_WIDTH;
    use std::sync::Arc;

    /// Completes a frame every `period` steps; `period == 0` never does.
    struct Ticker {
        period: u32,
        count: u32,
        lines: u32,
        last_byte: u8,
    }

    impl EmulationCore for Ticker {
        fn step(&mut self, bus: &mut CoreBus<'_>) -> bool {
            self.count += 1;
            self.last_byte = bus.rom.read(self.count as usize);
            bus.lcd.draw_line(0, &[0; NATIVE_WIDTH]);
            self.lines += 1;
            self.period != 0 && self.count % self.period == 0
        }
        fn set_pacing(&mut self, _decision: PacingDecision) {}
        fn set_buttons(&mut self, _buttons: Buttons) {}
    }

    fn rom() -> RomCache {
        let mut pool = MemoryPool::unbounded();
        let mut cache = RomCache::new();
        let data: Vec<u8> = (0..=255u8).collect();
        cache.open_memory(Arc::from(data), &mut pool).unwrap();
        cache
    }

    #[test]
    fn test_frame_completes_within_budget() {
        let mut cache = rom();
        let mut sink = NullSink;
        let mut bus = CoreBus { rom: &mut cache, lcd: &mut sink };
        let mut core = Ticker { period: 100, count: 0, lines: 0, last_byte: 0 };
        let out = run_frame_watchdog(&mut core, &mut bus, 1000);
        assert_eq!(out, WatchdogOutcome { completed: true, steps: 100 });
        assert_eq!(core.last_byte, 100);
        assert_eq!(core.lines, 100);
    }

    #[test]
    fn test_lockup_is_cut_off() {
        let mut cache = rom();
        let mut sink = NullSink;
        let mut bus = CoreBus { rom: &mut cache, lcd: &mut sink };
        let mut core = Ticker { period: 0, count: 0, lines: 0, last_byte: 0 };
        let out = run_frame_watchdog(&mut core, &mut bus, 5000);
        assert_eq!(out, WatchdogOutcome { completed: false, steps: 5000 });
        // state carries over into the next attempt
        run_frame_watchdog(&mut core, &mut bus, 10);
        assert_eq!(core.count, 5010);
    }

    #[test]
    fn test_button_mask() {
        let mut b = Buttons::default();
        b.insert(Buttons::A);
        b.insert(Buttons::START);
        assert!(b.contains(Buttons::A));
        assert!(!b.contains(Buttons::B));
        assert_eq!(b.bits(), 0x90);
        b.set(Buttons::A, false);
        assert_eq!((b | Buttons::RIGHT).bits(), 0x81);
        assert_eq!(Buttons::all().bits(), 0xFF);
        assert_eq!(Buttons::from_bits_truncate(0x03), Buttons::RIGHT | Buttons::LEFT);
    }
}
