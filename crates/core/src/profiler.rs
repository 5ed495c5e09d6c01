//! Runtime telemetry for the real-time pipeline.
//!
//! Three accumulators, each owned by the context that updates it:
//! - [`RenderProfiler`]: compositing time and panel traffic (compositor
//!   context, shared with the main loop behind a mutex)
//! - [`MainLoopProfiler`]: per-iteration phase timings (main context)
//! - [`RomCacheProfiler`]: hit/miss/swap deltas between reports
//!
//! Every reporting interval the main loop folds them into one `[PROF]` line
//! and starts a fresh window.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use crate::compositor::ComposeStats;
use crate::rom_cache::CacheStats;

/// Compositor-side accumulator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderProfiler {
    pub frames: u64,
    pub total_us: u64,
    pub max_us: u64,
    pub rows_written: u64,
    pub segments: u64,
    pub interlaced_frames: u64,
}

/// Render profiler shared between the compositor thread and the main loop.
pub type SharedRenderProfiler = Arc<Mutex<RenderProfiler>>;

impl RenderProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRenderProfiler {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn record(&mut self, stats: &ComposeStats) {
        let us = stats.duration.as_micros() as u64;
        self.frames += 1;
        self.total_us += us;
        self.max_us = self.max_us.max(us);
        self.rows_written += stats.rows_written as u64;
        self.segments += stats.segments as u64;
        if stats.interlaced {
            self.interlaced_frames += 1;
        }
    }

    /// Snapshot and reset.
    pub fn take(&mut self) -> RenderProfiler {
        std::mem::take(self)
    }

    pub fn avg_us(&self) -> f64 {
        if self.frames == 0 { 0.0 } else { self.total_us as f64 / self.frames as f64 }
    }
}

/// Lock a shared profiler, tolerating a poisoned mutex.
pub fn take_shared(shared: &SharedRenderProfiler) -> RenderProfiler {
    match shared.lock() {
        Ok(mut g) => g.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

/// Timings of one main-loop iteration, microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopSample {
    pub frame_us: u64,
    pub poll_us: u64,
    pub emu_us: u64,
    pub handoff_us: u64,
    pub idle_us: u64,
    pub requested_idle_us: u64,
    pub over_budget: bool,
    pub completed: bool,
    pub presented: bool,
}

/// Main-loop accumulator over one reporting window.
#[derive(Clone, Debug, Default)]
pub struct MainLoopProfiler {
    window_start_us: u64,
    pub iterations: u64,
    pub presented: u64,
    pub incomplete: u64,
    pub over_budget: u64,
    pub frame_us: u64,
    pub poll_us: u64,
    pub emu_us: u64,
    pub handoff_us: u64,
    pub idle_us: u64,
    pub requested_idle_us: u64,
    pub max_frame_us: u64,
}

impl MainLoopProfiler {
    pub fn new(now_us: u64) -> Self {
        MainLoopProfiler { window_start_us: now_us, ..Self::default() }
    }

    pub fn record(&mut self, s: &LoopSample) {
        self.iterations += 1;
        self.frame_us += s.frame_us;
        self.poll_us += s.poll_us;
        self.emu_us += s.emu_us;
        self.handoff_us += s.handoff_us;
        self.idle_us += s.idle_us;
        self.requested_idle_us += s.requested_idle_us;
        self.max_frame_us = self.max_frame_us.max(s.frame_us);
        if s.over_budget {
            self.over_budget += 1;
        }
        if !s.completed {
            self.incomplete += 1;
        }
        if s.presented {
            self.presented += 1;
        }
    }

    pub fn window_us(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.window_start_us)
    }

    /// True once `interval_us` has elapsed since the window opened.
    pub fn due(&self, now_us: u64, interval_us: u64) -> bool {
        self.iterations > 0 && self.window_us(now_us) >= interval_us
    }

    pub fn reset(&mut self, now_us: u64) {
        *self = MainLoopProfiler::new(now_us);
    }

    fn avg(&self, total: u64) -> f64 {
        if self.iterations == 0 { 0.0 } else { total as f64 / self.iterations as f64 }
    }
}

/// Cache counter deltas over one window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheDelta {
    pub hits: u64,
    pub misses: u64,
    pub swaps: u64,
}

impl CacheDelta {
    /// Hit rate in percent; 100 when there were no reads.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 100.0 } else { self.hits as f64 * 100.0 / total as f64 }
    }
}

/// Tracks cache counters between reports.
#[derive(Clone, Copy, Debug, Default)]
pub struct RomCacheProfiler {
    last: CacheDelta,
}

impl RomCacheProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters accumulated since the previous call. Handles counter resets
    /// (e.g. after a bank trim) by treating the new values as the delta.
    pub fn delta(&mut self, stats: &CacheStats) -> CacheDelta {
        let now = CacheDelta { hits: stats.hits, misses: stats.misses, swaps: stats.swaps };
        let sub = |a: u64, b: u64| if a >= b { a - b } else { a };
        let d = CacheDelta {
            hits: sub(now.hits, self.last.hits),
            misses: sub(now.misses, self.last.misses),
            swaps: sub(now.swaps, self.last.swaps),
        };
        self.last = now;
        d
    }
}

/// Pipeline state included in the periodic report.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportContext {
    pub queue_depth: usize,
    pub double_buffer: bool,
    pub full_cache: bool,
    pub frame_skip: bool,
    pub interlace: bool,
}

/// Format the one-line periodic report.
pub fn format_report(
    main: &MainLoopProfiler,
    window_us: u64,
    render: &RenderProfiler,
    rom: &CacheDelta,
    ctx: &ReportContext,
) -> String {
    let secs = window_us.max(1) as f64 / 1_000_000.0;
    let mut s = String::new();
    let _ = write!(
        s,
        "[PROF] fps={:.1} shown={:.1} frame={:.0}us max={}us poll={:.0}us emu={:.0}us handoff={:.0}us idle={:.0}/{:.0}us over={} incomplete={}",
        main.iterations as f64 / secs,
        main.presented as f64 / secs,
        main.avg(main.frame_us),
        main.max_frame_us,
        main.avg(main.poll_us),
        main.avg(main.emu_us),
        main.avg(main.handoff_us),
        main.avg(main.idle_us),
        main.avg(main.requested_idle_us),
        main.over_budget,
        main.incomplete,
    );
    let _ = write!(
        s,
        " | render={} avg={:.0}us max={}us rows={} segs={}",
        render.frames,
        render.avg_us(),
        render.max_us,
        render.rows_written,
        render.segments,
    );
    let _ = write!(
        s,
        " | rom hit={:.1}% miss={} swap={}",
        rom.hit_rate(),
        rom.misses,
        rom.swaps,
    );
    let _ = write!(
        s,
        " | queue={} {} {} skip={} ilace={}",
        ctx.queue_depth,
        if ctx.double_buffer { "double" } else { "single" },
        if ctx.full_cache { "swapcache" } else { "fallback" },
        ctx.frame_skip as u8,
        ctx.interlace as u8,
    );
    s
}
