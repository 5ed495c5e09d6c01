//! Adaptive frame pacing.
//!
//! Two hysteresis machines react to the per-frame over/under-budget signal:
//!
//! - **frame skip**: the core renders but the compositor is not fed every
//!   other frame
//! - **interlace**: the core draws alternate scanlines per frame
//!
//! Each is `Active` (normal) or `Degraded`. Streak counters debounce the
//! transitions, a hold countdown and a minimum-frames-since-toggle window
//! stop oscillation. Thresholds depend on the compositor mode: the fallback
//! compositor is slower, so it degrades sooner.
//!
//! Interlace is tried first. While it is degraded, frame skip only engages
//! if its own over-budget streak keeps climbing past `enable_streak ×
//! escalation_factor`.

use crate::config::{FrameSkipMode, InterlaceThresholds, PacingConfig, SkipThresholds};

/// Output of one pacing update, read by the core before the next frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacingDecision {
    pub frame_skip: bool,
    pub interlace: bool,
}

/// Inputs besides the budget signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacingContext {
    /// The full-frame display cache is in use
    pub full_cache: bool,
    /// The running cartridge renders in enhanced colour mode
    pub enhanced_color: bool,
}

/// Hysteresis state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Active,
    Degraded,
}

/// Counters of one hysteresis machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Streaks {
    pub over: u8,
    pub under: u8,
    pub hold: u8,
    pub frames_since_toggle: u8,
}

// ─── Frame skip ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct FrameSkipMachine {
    stage: Stage,
    streaks: Streaks,
}

impl FrameSkipMachine {
    fn new(min_active_frames: u8) -> Self {
        FrameSkipMachine {
            stage: Stage::Active,
            streaks: Streaks { frames_since_toggle: min_active_frames, ..Streaks::default() },
        }
    }

    fn observe(&mut self, over_budget: bool) {
        let s = &mut self.streaks;
        s.hold = s.hold.saturating_sub(1);
        s.frames_since_toggle = s.frames_since_toggle.saturating_add(1);
        if over_budget {
            s.over = s.over.saturating_add(1);
            s.under = 0;
        } else {
            s.under = s.under.saturating_add(1);
            s.over = s.over.saturating_sub(1);
        }
    }

    fn can_toggle(&self, th: &SkipThresholds) -> bool {
        self.streaks.hold == 0 && self.streaks.frames_since_toggle >= th.min_active_frames
    }

    fn step(&mut self, th: &SkipThresholds, allow_enable: bool) -> bool {
        if !self.can_toggle(th) {
            return false;
        }
        let next = match self.stage {
            Stage::Active if allow_enable && self.streaks.over >= th.enable_streak => Stage::Degraded,
            Stage::Degraded if self.streaks.under >= th.disable_streak => Stage::Active,
            _ => return false,
        };
        self.stage = next;
        self.streaks = Streaks { hold: th.hold_frames, ..Streaks::default() };
        true
    }

    fn force(&mut self) {
        self.stage = Stage::Degraded;
        self.streaks = Streaks::default();
    }

    fn disable(&mut self, th: &SkipThresholds) {
        self.stage = Stage::Active;
        let fst = self.streaks.frames_since_toggle.max(th.min_active_frames);
        self.streaks = Streaks { frames_since_toggle: fst, ..Streaks::default() };
    }
}

// ─── Interlace ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
struct InterlaceMachine {
    stage: Stage,
    streaks: Streaks,
}

impl InterlaceMachine {
    fn reset(&mut self) {
        *self = InterlaceMachine::default();
    }

    fn step(&mut self, th: &InterlaceThresholds, over_budget: bool) -> bool {
        let s = &mut self.streaks;
        s.frames_since_toggle = s.frames_since_toggle.saturating_add(1);
        if over_budget {
            s.over = s.over.saturating_add(1);
            s.under = 0;
            s.hold = th.hold_frames;
        } else {
            s.under = s.under.saturating_add(1);
            s.over = s.over.saturating_sub(1);
            s.hold = s.hold.saturating_sub(1);
        }

        match self.stage {
            Stage::Active if s.over >= th.enable_streak => {
                self.stage = Stage::Degraded;
                s.hold = th.hold_frames;
                s.under = 0;
                s.frames_since_toggle = 0;
                true
            }
            Stage::Degraded if s.hold == 0 && s.under >= th.disable_streak => {
                self.reset();
                true
            }
            _ => false,
        }
    }
}

// ─── Controller ─────────────────────────────────────────────────────────────

/// Frame-skip and interlace pacing state for the main loop.
#[derive(Clone, Debug)]
pub struct PacingController {
    config: PacingConfig,
    mode: FrameSkipMode,
    skip: FrameSkipMachine,
    interlace: InterlaceMachine,
    toggles: u64,
}

impl PacingController {
    pub fn new(config: PacingConfig, mode: FrameSkipMode) -> Self {
        let min_active = config.full_cache.min_active_frames;
        PacingController {
            config,
            mode,
            skip: FrameSkipMachine::new(min_active),
            interlace: InterlaceMachine::default(),
            toggles: 0,
        }
    }

    pub fn mode(&self) -> FrameSkipMode {
        self.mode
    }

    /// Change the override mode; takes effect on the next update.
    pub fn set_mode(&mut self, mode: FrameSkipMode) {
        if mode != self.mode {
            log::info!("Frame skip mode: {} -> {}", self.mode, mode);
            self.mode = mode;
        }
    }

    pub fn frame_skip(&self) -> bool {
        self.skip.stage == Stage::Degraded
    }

    pub fn interlace(&self) -> bool {
        self.interlace.stage == Stage::Degraded
    }

    pub fn frame_skip_streaks(&self) -> Streaks {
        self.skip.streaks
    }

    pub fn interlace_streaks(&self) -> Streaks {
        self.interlace.streaks
    }

    /// Automatic transitions taken so far, both machines.
    pub fn toggles(&self) -> u64 {
        self.toggles
    }

    pub fn decision(&self) -> PacingDecision {
        PacingDecision { frame_skip: self.frame_skip(), interlace: self.interlace() }
    }

    fn thresholds(&self, ctx: PacingContext) -> SkipThresholds {
        if ctx.full_cache {
            self.config.full_cache
        } else {
            self.config.fallback
        }
    }

    /// Feed one frame's budget signal and return the flags for the next frame.
    pub fn update(&mut self, over_budget: bool, ctx: PacingContext) -> PacingDecision {
        let th = self.thresholds(ctx);
        self.skip.observe(over_budget);

        if ctx.enhanced_color && ctx.full_cache {
            if self.interlace.step(&self.config.interlace, over_budget) {
                self.toggles += 1;
                log::debug!("Interlace {}", if self.interlace() { "on" } else { "off" });
            }
        } else {
            self.interlace.reset();
        }

        // Interlace absorbs the pressure unless frame skip's own streak
        // keeps escalating past the configured multiple.
        let mut allow_enable = true;
        if self.interlace() {
            let escalate = th.enable_streak as u32 * self.config.escalation_factor as u32;
            if self.skip.streaks.over as u32 > escalate {
                self.interlace.streaks.over = self.config.interlace.enable_streak;
            } else {
                allow_enable = false;
            }
        }

        match self.mode {
            FrameSkipMode::Auto => {
                if self.skip.step(&th, allow_enable) {
                    self.toggles += 1;
                    log::debug!("Frame skip {}", if self.frame_skip() { "on" } else { "off" });
                }
            }
            FrameSkipMode::Forced => self.skip.force(),
            FrameSkipMode::Disabled => self.skip.disable(&th),
        }
        self.decision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: PacingContext = PacingContext { full_cache: true, enhanced_color: false };
    const FALLBACK: PacingContext = PacingContext { full_cache: false, enhanced_color: false };
    const ENHANCED: PacingContext = PacingContext { full_cache: true, enhanced_color: true };

    fn auto() -> PacingController {
        PacingController::new(PacingConfig::default(), FrameSkipMode::Auto)
    }

    fn run(p: &mut PacingController, over: bool, n: usize, ctx: PacingContext) -> PacingDecision {
        let mut d = p.decision();
        for _ in 0..n {
            d = p.update(over, ctx);
        }
        d
    }

    #[test]
    fn test_enable_needs_full_streak() {
        for (ctx, th) in [(FULL, SkipThresholds::FULL_CACHE), (FALLBACK, SkipThresholds::FALLBACK)] {
            let mut p = auto();
            let d = run(&mut p, true, th.enable_streak as usize - 1, ctx);
            assert!(!d.frame_skip);
            assert!(p.update(true, ctx).frame_skip);
        }
    }

    #[test]
    fn test_interrupted_streak_does_not_enable() {
        let mut p = auto();
        run(&mut p, true, 5, FULL);
        p.update(false, FULL);
        // over streak decayed to 4; two more reach 6
        assert!(!p.update(true, FULL).frame_skip);
        assert!(p.update(true, FULL).frame_skip);
    }

    #[test]
    fn test_disable_after_streak() {
        let th = SkipThresholds::FULL_CACHE;
        let mut p = auto();
        run(&mut p, true, th.enable_streak as usize, FULL);
        assert!(p.frame_skip());
        let d = run(&mut p, false, th.disable_streak as usize - 1, FULL);
        assert!(d.frame_skip);
        assert!(!p.update(false, FULL).frame_skip);
        assert_eq!(p.toggles(), 2);
    }

    #[test]
    fn test_disable_waits_for_min_active_window() {
        let mut config = PacingConfig::default();
        config.full_cache = SkipThresholds { enable_streak: 2, disable_streak: 3, min_active_frames: 10, hold_frames: 1 };
        let mut p = PacingController::new(config, FrameSkipMode::Auto);
        run(&mut p, true, 2, FULL);
        assert!(p.frame_skip());
        // under streak reaches 3 long before 10 frames have passed
        assert!(run(&mut p, false, 9, FULL).frame_skip);
        assert!(!p.update(false, FULL).frame_skip);
    }

    #[test]
    fn test_forced_ignores_signal() {
        let mut p = PacingController::new(PacingConfig::default(), FrameSkipMode::Forced);
        for i in 0..200 {
            assert!(p.update(i % 3 == 0, FULL).frame_skip);
            assert_eq!(p.frame_skip_streaks(), Streaks::default());
        }
    }

    #[test]
    fn test_disabled_pins_counters() {
        let mut p = PacingController::new(PacingConfig::default(), FrameSkipMode::Disabled);
        for i in 0..200 {
            assert!(!p.update(i % 7 != 0, FULL).frame_skip);
            let s = p.frame_skip_streaks();
            assert_eq!((s.over, s.under, s.hold), (0, 0, 0));
            assert!(s.frames_since_toggle >= SkipThresholds::FULL_CACHE.min_active_frames);
        }
    }

    #[test]
    fn test_mode_switch_from_forced_back_to_auto() {
        let mut p = PacingController::new(PacingConfig::default(), FrameSkipMode::Forced);
        run(&mut p, false, 3, FULL);
        p.set_mode(FrameSkipMode::Auto);
        // Forced left frames_since_toggle at 0, so the min window applies.
        let th = SkipThresholds::FULL_CACHE;
        assert!(run(&mut p, false, th.min_active_frames as usize - 1, FULL).frame_skip);
        assert!(!run(&mut p, false, th.disable_streak as usize, FULL).frame_skip);
        assert_eq!(p.mode(), FrameSkipMode::Auto);
    }

    #[test]
    fn test_interlace_only_with_enhanced_full_cache() {
        let mut p = auto();
        run(&mut p, true, 4, FULL);
        assert!(!p.interlace());

        let mut p = auto();
        assert!(!run(&mut p, true, 3, ENHANCED).interlace);
        assert!(p.update(true, ENHANCED).interlace);
        // dropping out of enhanced colour turns it off immediately
        assert!(!p.update(true, FULL).interlace);
    }

    #[test]
    fn test_interlace_absorbs_then_escalates() {
        let th = SkipThresholds::FULL_CACHE;
        let mut p = auto();
        let escalate = th.enable_streak as usize * 2;
        let d = run(&mut p, true, escalate, ENHANCED);
        assert!(d.interlace);
        assert!(!d.frame_skip);
        let d = p.update(true, ENHANCED);
        assert!(d.interlace && d.frame_skip);
    }

    #[test]
    fn test_interlace_release() {
        let it = InterlaceThresholds::default();
        let mut p = auto();
        run(&mut p, true, it.enable_streak as usize, ENHANCED);
        assert!(p.interlace());
        let d = run(&mut p, false, it.disable_streak as usize - 1, ENHANCED);
        assert!(d.interlace);
        assert!(!p.update(false, ENHANCED).interlace);
        assert_eq!(p.interlace_streaks(), Streaks::default());
    }

    #[test]
    fn test_counters_saturate() {
        let mut p = PacingController::new(PacingConfig::default(), FrameSkipMode::Auto);
        run(&mut p, false, 600, FALLBACK);
        let s = p.frame_skip_streaks();
        assert_eq!((s.under, s.frames_since_toggle), (255, 255));
    }
}
