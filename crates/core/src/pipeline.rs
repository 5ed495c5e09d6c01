//! The real-time pipeline context.
//!
//! [`Pipeline`] owns every piece of per-cartridge state: the memory pool,
//! the ROM cache, the emulation core, the pacing controller, the profilers
//! and the presenter (compositor thread plus frame handoff, or an inline
//! compositor in single-buffer mode). One call to
//! [`Pipeline::run_iteration`] is one turn of the main loop:
//!
//! 1. poll input
//! 2. step the core under the frame watchdog, drawing into the current
//!    framebuffer
//! 3. present the frame if it completed and is visible
//! 4. derive the over-budget signal and update pacing
//! 5. sleep away the rest of the frame budget
//!
//! ## Startup
//!
//! Resources are claimed in a fixed order so that each shortfall degrades
//! the right component:
//!
//! | Step | Resource               | On failure                               |
//! |------|------------------------|------------------------------------------|
//! | 1    | ROM cache              | fatal                                    |
//! | 2    | framebuffer 0          | fatal                                    |
//! | 3    | framebuffer 1          | single-buffer mode                       |
//! | 4    | display swap cache     | halve ROM banks and retry, then fallback |
//! | 5    | compositor thread      | single-buffer mode                       |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::channel::{frame_channel, FrameConsumer, FrameProducer};
use crate::compositor::{CompositorMode, FrameCompositor};
use crate::config::PipelineConfig;
use crate::core_iface::{run_frame_watchdog, Buttons, CoreBus, EmulationCore};
use crate::error::PipelineError;
use crate::framebuffer::{FrameBuffer, LineWriter, NullSink, Palette, ScanlineSink};
use crate::memory::{Block, MemoryPool, Placement};
use crate::pacing::{PacingContext, PacingController, PacingDecision};
use crate::panel::{MemoryPanel, Panel};
use crate::profiler::{
    format_report, take_shared, LoopSample, MainLoopProfiler, RenderProfiler, ReportContext,
    RomCacheProfiler, SharedRenderProfiler,
};
use crate::rom_cache::{CacheMode, CacheOptions, RomCache};
use crate::storage::RomStream;
use crate::{NATIVE_WIDTH, PANEL_HEIGHT};

/// Watchdog trips are logged on the first and then every this many in a row.
const WATCHDOG_LOG_EVERY: u32 = 60;
/// Early frames logged in full at debug level.
const DEBUG_FIRST_FRAMES: u64 = 10;
const DEBUG_FRAME_EVERY: u64 = 60;
const DEBUG_FRAME_LIMIT: u64 = 300;

// ─── Clock ──────────────────────────────────────────────────────────────────

/// Time source for frame pacing, in microseconds.
pub trait FrameClock: Send {
    fn now_us(&self) -> u64;
    fn sleep_us(&mut self, us: u64);
}

/// Monotonic wall clock.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock for SystemClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn sleep_us(&mut self, us: u64) {
        thread::sleep(Duration::from_micros(us));
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }
}

impl FrameClock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_us(&mut self, us: u64) {
        self.advance(us);
    }
}

// ─── Input ──────────────────────────────────────────────────────────────────

/// Polled once per iteration.
pub trait InputSource {
    fn poll(&mut self) -> Buttons;
}

impl<F: FnMut() -> Buttons> InputSource for F {
    fn poll(&mut self) -> Buttons {
        self()
    }
}

// ─── ROM source ─────────────────────────────────────────────────────────────

/// Where the cartridge image comes from.
pub enum RomSource {
    /// Random-access storage, streamed through the bank cache
    Stream(Box<dyn RomStream>),
    /// Already addressable image
    Memory(Arc<[u8]>),
    /// Packed image bytes, inflated into memory
    Packed(Vec<u8>),
}

// ─── Presenter ──────────────────────────────────────────────────────────────

struct CompositorJob {
    compositor: FrameCompositor,
    consumer: FrameConsumer,
    profiler: SharedRenderProfiler,
}

impl CompositorJob {
    fn run(self) -> FrameCompositor {
        let CompositorJob { mut compositor, consumer, profiler } = self;
        log::debug!("Compositor thread started ({:?})", compositor.mode());
        while let Some(mut fb) = consumer.recv() {
            let stats = compositor.composite(&mut fb);
            if let Ok(mut p) = profiler.lock() {
                p.record(&stats);
            }
            consumer.release(fb);
        }
        log::debug!("Compositor thread exiting after {} frames", compositor.frames());
        compositor
    }
}

enum Presenter {
    Double {
        producer: FrameProducer,
        current: Option<FrameBuffer>,
        thread: Option<JoinHandle<Option<FrameCompositor>>>,
    },
    Single {
        fb: FrameBuffer,
        compositor: FrameCompositor,
    },
    Closed,
}

// ─── Reports ────────────────────────────────────────────────────────────────

/// Outcome of one main-loop iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// 1-based iteration number
    pub frame: u64,
    pub completed: bool,
    pub steps: u32,
    pub visible: bool,
    pub presented: bool,
    pub over_budget: bool,
    /// Pacing flags for the next frame
    pub decision: PacingDecision,
    pub active_us: u64,
    pub idle_us: u64,
}

// ─── Builder ────────────────────────────────────────────────────────────────

/// Configures and starts a [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    panel: Option<Box<dyn Panel>>,
    clock: Option<Box<dyn FrameClock>>,
    palette: Palette,
}

impl PipelineBuilder {
    /// Defaults: in-memory panel, system clock, monochrome palette.
    pub fn new(config: PipelineConfig) -> Self {
        PipelineBuilder { config, panel: None, clock: None, palette: Palette::new() }
    }

    pub fn panel(mut self, panel: Box<dyn Panel>) -> Self {
        self.panel = Some(panel);
        self
    }

    pub fn clock(mut self, clock: Box<dyn FrameClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn palette(mut self, palette: Palette) -> Self {
        self.palette = palette;
        self
    }

    /// Claim resources in startup order and launch the compositor.
    pub fn build<C: EmulationCore>(self, source: RomSource, core: C) -> Result<Pipeline<C>, PipelineError> {
        let PipelineBuilder { mut config, panel, clock, palette } = self;
        config.sanitize();

        let mut pool = MemoryPool::new(&config.memory);
        let mut cache = RomCache::new();
        match source {
            RomSource::Stream(stream) => {
                let opts = CacheOptions::for_pool(&pool, config.rom_cache_banks as usize, config.prefetch);
                cache.open(stream, &mut pool, &opts)?;
            }
            RomSource::Memory(rom) => cache.open_memory(rom, &mut pool)?,
            RomSource::Packed(bytes) => {
                cache.open_packed(&bytes, &mut pool)?;
            }
        }

        let fb0 = match FrameBuffer::alloc(0, &mut pool) {
            Some(fb) => fb,
            None => {
                log::error!("Framebuffer allocation failed");
                cache.close(&mut pool);
                return Err(PipelineError::NoFramebuffer);
            }
        };
        let fb1 = if config.double_buffer {
            let fb = FrameBuffer::alloc(1, &mut pool);
            if fb.is_none() {
                log::warn!("Second framebuffer allocation failed, using single buffer mode");
            }
            fb
        } else {
            None
        };

        let mut compositor = FrameCompositor::new(
            panel.unwrap_or_else(|| Box::new(MemoryPanel::default())),
            config.scale_filter,
        );
        if let Some(swap) = alloc_swap_cache(&mut pool, &mut cache) {
            log::info!(
                "Display cache: {} bytes in {:?} memory",
                swap.len() * 2,
                swap.region()
            );
            compositor = compositor.with_swap_cache(swap);
        }
        let full_cache = compositor.mode() == CompositorMode::FullCache;

        let render = RenderProfiler::shared();
        let presenter = start_presenter(compositor, fb0, fb1, Arc::clone(&render), &mut pool)?;

        let clock = clock.unwrap_or_else(|| Box::new(SystemClock::new()));
        let now = clock.now_us();
        let stats = cache.stats();
        log::info!(
            "Pipeline ready: {:?} ROM, {} banks, {} compositor, {} buffer",
            stats.mode,
            stats.bank_count,
            if full_cache { "full-cache" } else { "fallback" },
            if matches!(presenter, Presenter::Double { .. }) { "double" } else { "single" },
        );

        Ok(Pipeline {
            pacing: PacingController::new(config.pacing, config.frame_skip_mode),
            target_us: config.frame_budget_us(),
            config,
            pool,
            cache,
            core,
            palette,
            presenter,
            full_cache,
            clock,
            render,
            main_prof: MainLoopProfiler::new(now),
            rom_prof: RomCacheProfiler::new(),
            last_report: None,
            frames: 0,
            watchdog_strikes: 0,
        })
    }
}

/// Panel-sized swap cache from extended memory, shrinking the ROM cache
/// until it fits. `None` selects the fallback compositor.
fn alloc_swap_cache(pool: &mut MemoryPool, cache: &mut RomCache) -> Option<Block<u16>> {
    if !pool.has_extended() {
        log::warn!("No extended memory, using fallback compositor");
        return None;
    }
    loop {
        if let Some(block) = pool.alloc(PANEL_HEIGHT * NATIVE_WIDTH, 0xFFFFu16, Placement::ExtendedOnly) {
            return Some(block);
        }
        let banks = cache.bank_count();
        if cache.mode() != CacheMode::Streaming || banks <= 1 {
            log::warn!("Display cache allocation failed, using fallback compositor");
            return None;
        }
        let kept = cache.trim_banks(banks / 2, pool);
        log::warn!("Display cache: trimmed ROM cache from {} to {} banks", banks, kept);
    }
}

fn start_presenter(
    compositor: FrameCompositor,
    fb0: FrameBuffer,
    fb1: Option<FrameBuffer>,
    render: SharedRenderProfiler,
    pool: &mut MemoryPool,
) -> Result<Presenter, PipelineError> {
    let fb1 = match fb1 {
        Some(fb) => fb,
        None => return Ok(Presenter::Single { fb: fb0, compositor }),
    };

    let (mut producer, consumer) = frame_channel(fb0, fb1);
    let job = Arc::new(Mutex::new(Some(CompositorJob { compositor, consumer, profiler: render })));
    let shared = Arc::clone(&job);
    let spawned = thread::Builder::new().name("compositor".into()).spawn(move || {
        let job = shared.lock().ok().and_then(|mut g| g.take());
        job.map(CompositorJob::run)
    });

    match spawned {
        Ok(handle) => Ok(Presenter::Double { producer, current: None, thread: Some(handle) }),
        Err(e) => {
            log::warn!("Compositor thread spawn failed ({}), using single buffer mode", e);
            let job = job.lock().ok().and_then(|mut g| g.take());
            collapse_to_single(producer, job, pool)
        }
    }
}

/// Take buffer 0 back out of an idle handoff for inline compositing and
/// return buffer 1's storage to `pool`.
fn collapse_to_single(
    mut producer: FrameProducer,
    job: Option<CompositorJob>,
    pool: &mut MemoryPool,
) -> Result<Presenter, PipelineError> {
    let fb = producer.acquire(Duration::ZERO)?;
    match producer.acquire(Duration::ZERO) {
        Ok(spare) => spare.free(pool),
        Err(e) => log::warn!("Second framebuffer not recovered: {}", e),
    }
    match job {
        Some(job) => Ok(Presenter::Single { fb, compositor: job.compositor }),
        None => {
            fb.free(pool);
            Err(PipelineError::HandoffDisconnected)
        }
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// All state of a running cartridge.
pub struct Pipeline<C: EmulationCore> {
    config: PipelineConfig,
    pool: MemoryPool,
    cache: RomCache,
    core: C,
    palette: Palette,
    presenter: Presenter,
    full_cache: bool,
    pacing: PacingController,
    clock: Box<dyn FrameClock>,
    target_us: f64,
    render: SharedRenderProfiler,
    main_prof: MainLoopProfiler,
    rom_prof: RomCacheProfiler,
    last_report: Option<String>,
    frames: u64,
    watchdog_strikes: u32,
}

impl<C: EmulationCore> Pipeline<C> {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &RomCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut RomCache {
        &mut self.cache
    }

    pub fn core(&self) -> &C {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut C {
        &mut self.core
    }

    pub fn pacing(&self) -> &PacingController {
        &self.pacing
    }

    pub fn pacing_mut(&mut self) -> &mut PacingController {
        &mut self.pacing
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn set_palette(&mut self, palette: Palette) {
        self.palette = palette;
    }

    pub fn compositor_mode(&self) -> CompositorMode {
        if self.full_cache {
            CompositorMode::FullCache
        } else {
            CompositorMode::Fallback
        }
    }

    pub fn double_buffered(&self) -> bool {
        matches!(self.presenter, Presenter::Double { .. })
    }

    /// Iterations run so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Render profiler totals since the last report.
    pub fn render_stats(&self) -> RenderProfiler {
        match self.render.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Most recent periodic report line.
    pub fn last_report(&self) -> Option<&str> {
        self.last_report.as_deref()
    }

    /// Run one main-loop iteration.
    pub fn run_iteration(&mut self, input: &mut dyn InputSource) -> Result<IterationReport, PipelineError> {
        let start = self.clock.now_us();
        self.frames += 1;

        let buttons = input.poll();
        self.core.set_buttons(buttons);
        let t_poll = self.clock.now_us();

        let decision = self.pacing.decision();
        self.core.set_pacing(decision);

        let handoff_timeout = Duration::from_millis(self.config.handoff_timeout_ms);
        let fb = match &mut self.presenter {
            Presenter::Double { producer, current, .. } => {
                if current.is_none() {
                    match producer.acquire(handoff_timeout) {
                        Ok(buf) => *current = Some(buf),
                        Err(PipelineError::HandoffTimeout) => {}
                        Err(e) => return Err(e),
                    }
                }
                current.as_mut()
            }
            Presenter::Single { fb, .. } => Some(fb),
            Presenter::Closed => None,
        };
        let t_acquired = self.clock.now_us();

        let outcome = {
            let mut null = NullSink;
            let lcd: &mut dyn ScanlineSink;
            let mut writer;
            match fb {
                Some(fb) => {
                    fb.interlaced = decision.interlace;
                    writer = LineWriter { fb, palette: &self.palette };
                    lcd = &mut writer;
                }
                None => lcd = &mut null,
            }
            let mut bus = CoreBus { rom: &mut self.cache, lcd };
            run_frame_watchdog(&mut self.core, &mut bus, self.config.frame_step_budget)
        };
        let t_emu = self.clock.now_us();

        if outcome.completed {
            self.watchdog_strikes = 0;
        } else {
            self.watchdog_strikes += 1;
            if self.watchdog_strikes == 1 || self.watchdog_strikes % WATCHDOG_LOG_EVERY == 0 {
                log::warn!(
                    "Frame watchdog: no frame after {} steps ({} in a row) {}",
                    outcome.steps,
                    self.watchdog_strikes,
                    self.core.diagnostics()
                );
            }
        }

        let visible = outcome.completed && self.core.frame_visible();
        let presented = visible && self.present()?;
        let t_present = self.clock.now_us();

        let active_us = t_present.saturating_sub(start);
        let mut delay = self.target_us - active_us as f64;
        if !outcome.completed {
            delay = 0.0;
        }
        let over_budget = !outcome.completed || delay <= 0.0;
        let requested_idle_us = if delay > 0.0 { delay as u64 } else { 0 };

        let ctx = PacingContext { full_cache: self.full_cache, enhanced_color: self.core.enhanced_color() };
        let next = self.pacing.update(over_budget, ctx);

        if self.frames <= DEBUG_FIRST_FRAMES
            || (self.frames % DEBUG_FRAME_EVERY == 0 && self.frames <= DEBUG_FRAME_LIMIT)
        {
            log::debug!(
                "Frame {}: steps={} done={} visible={} active={}us skip={} ilace={}",
                self.frames,
                outcome.steps,
                outcome.completed,
                visible,
                active_us,
                next.frame_skip,
                next.interlace
            );
        }

        if requested_idle_us > 0 {
            self.clock.sleep_us(requested_idle_us);
        }
        let end = self.clock.now_us();
        let idle_us = end.saturating_sub(t_present);

        self.main_prof.record(&LoopSample {
            frame_us: end.saturating_sub(start),
            poll_us: t_poll.saturating_sub(start),
            emu_us: t_emu.saturating_sub(t_acquired),
            handoff_us: t_acquired.saturating_sub(t_poll) + t_present.saturating_sub(t_emu),
            idle_us,
            requested_idle_us,
            over_budget,
            completed: outcome.completed,
            presented,
        });
        self.maybe_report(end);

        Ok(IterationReport {
            frame: self.frames,
            completed: outcome.completed,
            steps: outcome.steps,
            visible,
            presented,
            over_budget,
            decision: next,
            active_us,
            idle_us,
        })
    }

    /// Hand the current frame to the compositor. Returns false when there
    /// was no buffer to present.
    fn present(&mut self) -> Result<bool, PipelineError> {
        match &mut self.presenter {
            Presenter::Double { producer, current, .. } => match current.take() {
                Some(fb) => producer.submit(fb).map(|_| true),
                None => Ok(false),
            },
            Presenter::Single { fb, compositor } => {
                let stats = compositor.composite(fb);
                if let Ok(mut p) = self.render.lock() {
                    p.record(&stats);
                }
                Ok(true)
            }
            Presenter::Closed => Ok(false),
        }
    }

    fn maybe_report(&mut self, now_us: u64) {
        let interval = self.config.profiler_interval_us;
        if interval == 0 || !self.main_prof.due(now_us, interval) {
            return;
        }
        let render = take_shared(&self.render);
        let rom = self.rom_prof.delta(&self.cache.stats());
        let queue_depth = match &self.presenter {
            Presenter::Double { producer, .. } => producer.pending(),
            _ => 0,
        };
        let ctx = ReportContext {
            queue_depth,
            double_buffer: self.double_buffered(),
            full_cache: self.full_cache,
            frame_skip: self.pacing.frame_skip(),
            interlace: self.pacing.interlace(),
        };
        let line = format_report(&self.main_prof, self.main_prof.window_us(now_us), &render, &rom, &ctx);
        log::info!("{}", line);
        self.last_report = Some(line);
        self.main_prof.reset(now_us);
    }

    /// Stop the compositor thread after it has drained every queued frame.
    pub fn shutdown(&mut self) {
        if let Presenter::Double { producer, current, thread } =
            std::mem::replace(&mut self.presenter, Presenter::Closed)
        {
            drop(current);
            drop(producer);
            if let Some(handle) = thread {
                if handle.join().is_err() {
                    log::error!("Compositor thread panicked");
                }
            }
        }
    }
}

impl<C: EmulationCore> Drop for Pipeline<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FrameSkipMode, MemoryBudget, ScaleFilter};
    use crate::memory::Region;
    use crate::panel::PanelHandle;
    use crate::storage::ReaderStream;
    use crate::{NATIVE_HEIGHT, PANEL_WIDTH, ROM_BANK_SIZE_EXTENDED, ROM_BANK_SIZE_INTERNAL};
    use std::io::Cursor;

    /// Draws one line per step; a frame is 144 steps and costs `cost_us`.
    struct ScanCore {
        clock: ManualClock,
        cost_us: u64,
        line: usize,
        frame: u64,
        lockup: bool,
        last_decision: PacingDecision,
        buttons: Buttons,
    }

    impl ScanCore {
        fn new(clock: &ManualClock, cost_us: u64) -> Self {
            ScanCore {
                clock: clock.clone(),
                cost_us,
                line: 0,
                frame: 0,
                lockup: false,
                last_decision: PacingDecision::default(),
                buttons: Buttons::default(),
            }
        }
    }

    impl EmulationCore for ScanCore {
        fn step(&mut self, bus: &mut CoreBus<'_>) -> bool {
            if self.lockup {
                return false;
            }
            let shade = bus.rom.read(self.frame as usize * NATIVE_HEIGHT + self.line) & 0x03;
            bus.lcd.draw_line(self.line, &[shade; NATIVE_WIDTH]);
            self.line += 1;
            if self.line == NATIVE_HEIGHT {
                self.line = 0;
                self.frame += 1;
                self.clock.advance(self.cost_us);
                return true;
            }
            false
        }

        fn set_pacing(&mut self, decision: PacingDecision) {
            self.last_decision = decision;
        }

        fn set_buttons(&mut self, buttons: Buttons) {
            self.buttons = buttons;
        }

        fn diagnostics(&self) -> String {
            format!("line={}", self.line)
        }
    }

    fn rom(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn stream(len: usize) -> RomSource {
        RomSource::Stream(Box::new(ReaderStream::new(Cursor::new(rom(len))).unwrap()))
    }

    fn start(
        config: PipelineConfig,
        source: RomSource,
        cost_us: u64,
    ) -> Result<(Pipeline<ScanCore>, PanelHandle, ManualClock), PipelineError> {
        let clock = ManualClock::new();
        let panel = MemoryPanel::default();
        let handle = panel.handle();
        let pipeline = PipelineBuilder::new(config)
            .panel(Box::new(panel))
            .clock(Box::new(clock.clone()))
            .build(source, ScanCore::new(&clock, cost_us))?;
        Ok((pipeline, handle, clock))
    }

    fn no_input() -> impl FnMut() -> Buttons {
        Buttons::default
    }

    #[test]
    fn test_single_buffer_presents_inline() {
        let mut config = PipelineConfig::default();
        config.double_buffer = false;
        let (mut p, handle, _) = start(config, stream(0x20000), 5_000).unwrap();
        assert!(!p.double_buffered());
        assert_eq!(p.compositor_mode(), CompositorMode::FullCache);

        let report = p.run_iteration(&mut no_input()).unwrap();
        assert!(report.completed && report.visible && report.presented);
        assert!(!report.over_budget);
        assert_eq!(report.steps, NATIVE_HEIGHT as u32);
        assert_eq!(report.active_us, 5_000);
        assert_eq!(report.idle_us, 11_742);

        let c = handle.counters();
        assert_eq!(c.batches, 1);
        assert_eq!(c.unbracketed_writes, 0);
        assert_eq!(p.render_stats().frames, 1);
        let px = handle.snapshot();
        let x0 = (PANEL_WIDTH - NATIVE_WIDTH) / 2;
        // row 0 maps to source line 0, rom byte 0 -> shade 0
        assert_eq!(px[x0], crate::framebuffer::DMG_DEFAULT_PALETTE[0]);
    }

    #[test]
    fn test_double_buffer_drains_on_shutdown() {
        let (mut p, handle, _) = start(PipelineConfig::default(), stream(0x20000), 1_000).unwrap();
        assert!(p.double_buffered());
        let mut pressed = Buttons::default();
        pressed.insert(Buttons::A);
        let mut input = move || pressed;
        for _ in 0..10 {
            let r = p.run_iteration(&mut input).unwrap();
            assert!(r.presented);
        }
        assert!(p.core().buttons.contains(Buttons::A));
        p.shutdown();
        assert_eq!(p.render_stats().frames, 10);
        assert!(handle.counters().batches >= 1);
        assert_eq!(handle.counters().overlapped_writes, 0);
        // closed pipeline keeps stepping without presenting
        let r = p.run_iteration(&mut no_input()).unwrap();
        assert!(r.completed && !r.presented);
    }

    #[test]
    fn test_over_budget_engages_frame_skip() {
        let mut config = PipelineConfig::default();
        config.double_buffer = false;
        let (mut p, _, _) = start(config, stream(0x8000), 20_000).unwrap();
        let mut last = IterationReport::default();
        for _ in 0..6 {
            last = p.run_iteration(&mut no_input()).unwrap();
            assert!(last.over_budget);
            assert_eq!(last.idle_us, 0);
        }
        assert!(last.decision.frame_skip);
        p.run_iteration(&mut no_input()).unwrap();
        assert!(p.core().last_decision.frame_skip);
    }

    #[test]
    fn test_watchdog_trip_is_incomplete_frame() {
        let mut config = PipelineConfig::default();
        config.double_buffer = false;
        config.frame_step_budget = 500;
        let (mut p, handle, clock) = start(config, stream(0x8000), 1_000).unwrap();
        p.core_mut().lockup = true;
        let before = clock.now_us();
        let r = p.run_iteration(&mut no_input()).unwrap();
        assert!(!r.completed && !r.presented && r.over_budget);
        assert_eq!(r.steps, 500);
        assert_eq!(clock.now_us(), before);
        assert_eq!(handle.counters().batches, 0);

        p.core_mut().lockup = false;
        assert!(p.run_iteration(&mut no_input()).unwrap().completed);
    }

    #[test]
    fn test_forced_mode_from_config() {
        let mut config = PipelineConfig::default();
        config.double_buffer = false;
        config.frame_skip_mode = FrameSkipMode::Forced;
        let (mut p, _, _) = start(config, stream(0x8000), 1_000).unwrap();
        for _ in 0..5 {
            assert!(p.run_iteration(&mut no_input()).unwrap().decision.frame_skip);
        }
        p.pacing_mut().set_mode(FrameSkipMode::Disabled);
        assert!(!p.run_iteration(&mut no_input()).unwrap().decision.frame_skip);
    }

    #[test]
    fn test_periodic_report() {
        let mut config = PipelineConfig::default();
        config.double_buffer = false;
        config.profiler_interval_us = 100_000;
        let (mut p, _, _) = start(config, stream(0x8000), 1_000).unwrap();
        for _ in 0..7 {
            p.run_iteration(&mut no_input()).unwrap();
        }
        let line = p.last_report().unwrap();
        assert!(line.starts_with("[PROF]"));
        assert!(line.contains("single swapcache"));
        assert_eq!(p.render_stats().frames, 1);
    }

    #[test]
    fn test_no_extended_memory_uses_fallback() {
        let mut config = PipelineConfig::default();
        config.double_buffer = false;
        config.memory = MemoryBudget { fast_bytes: 1 << 20, extended_bytes: 0, extended_present: false, extended_dma: false };
        let (mut p, handle, _) = start(config, stream(0x20000), 1_000).unwrap();
        assert_eq!(p.compositor_mode(), CompositorMode::Fallback);
        assert_eq!(p.cache().bank_size(), ROM_BANK_SIZE_INTERNAL);
        assert_eq!(p.config().rom_cache_banks, crate::ROM_CACHE_BANK_MAX_NO_EXT);
        p.run_iteration(&mut no_input()).unwrap();
        assert!(handle.take_log().iter().all(|w| w.height <= crate::FALLBACK_SEGMENT_ROWS));
    }

    #[test]
    fn test_swap_cache_trims_rom_banks() {
        let mut config = PipelineConfig::default();
        config.double_buffer = false;
        config.memory = MemoryBudget {
            fast_bytes: 256 * 1024,
            extended_bytes: 24 * ROM_BANK_SIZE_EXTENDED,
            extended_present: true,
            extended_dma: true,
        };
        let (p, _, _) = start(config, stream(0x40000), 1_000).unwrap();
        assert_eq!(p.compositor_mode(), CompositorMode::FullCache);
        assert_eq!(p.cache().bank_count(), 12);
    }

    #[test]
    fn test_framebuffer_shortfalls() {
        let bank0 = ROM_BANK_SIZE_INTERNAL;
        let fb_bytes = NATIVE_WIDTH * NATIVE_HEIGHT * 2;
        let budget = |fast| MemoryBudget { fast_bytes: fast, extended_bytes: 0, extended_present: false, extended_dma: false };

        let mut config = PipelineConfig::default();
        config.rom_cache_banks = 1;
        config.memory = budget(2 * bank0 + fb_bytes + 100);
        let (p, _, _) = start(config.clone(), stream(0x20000), 1_000).unwrap();
        assert!(!p.double_buffered());

        config.memory = budget(2 * bank0 + 100);
        assert!(matches!(start(config.clone(), stream(0x20000), 1_000), Err(PipelineError::NoFramebuffer)));

        config.memory = budget(bank0 + 100);
        assert!(matches!(start(config, stream(0x20000), 1_000), Err(PipelineError::NoCacheBanks)));
    }

    #[test]
    fn test_collapse_to_single_returns_spare_buffer() {
        let mut pool = MemoryPool::unbounded();
        let start_free = pool.free_bytes(Region::Fast);
        let fb0 = FrameBuffer::alloc(0, &mut pool).unwrap();
        let one_buffer = pool.free_bytes(Region::Fast);
        let fb1 = FrameBuffer::alloc(1, &mut pool).unwrap();
        assert!(pool.free_bytes(Region::Fast) < one_buffer);

        let (producer, consumer) = frame_channel(fb0, fb1);
        let job = CompositorJob {
            compositor: FrameCompositor::new(Box::new(MemoryPanel::default()), ScaleFilter::Nearest),
            consumer,
            profiler: RenderProfiler::shared(),
        };
        let presenter = collapse_to_single(producer, Some(job), &mut pool).unwrap();
        assert_eq!(pool.free_bytes(Region::Fast), one_buffer);
        match presenter {
            Presenter::Single { fb, .. } => {
                assert_eq!(fb.index(), 0);
                fb.free(&mut pool);
            }
            _ => panic!("expected single buffer presenter"),
        }
        assert_eq!(pool.free_bytes(Region::Fast), start_free);
    }

    #[test]
    fn test_collapse_without_job_frees_both_buffers() {
        let mut pool = MemoryPool::unbounded();
        let start_free = pool.free_bytes(Region::Fast);
        let fb0 = FrameBuffer::alloc(0, &mut pool).unwrap();
        let fb1 = FrameBuffer::alloc(1, &mut pool).unwrap();
        let (producer, _consumer) = frame_channel(fb0, fb1);
        assert!(matches!(
            collapse_to_single(producer, None, &mut pool),
            Err(PipelineError::HandoffDisconnected)
        ));
        assert_eq!(pool.free_bytes(Region::Fast), start_free);
    }

    #[test]
    fn test_direct_and_packed_sources() {
        let mut config = PipelineConfig::default();
        config.double_buffer = false;
        let image = rom(0x10000);
        let (p, _, _) = start(config.clone(), RomSource::Memory(Arc::from(image.clone())), 1_000).unwrap();
        assert_eq!(p.cache().mode(), CacheMode::DirectMap);

        let packed = crate::rom_pack::pack_rom("t", "Test", &image, false).unwrap();
        let (mut p, _, _) = start(config, RomSource::Packed(packed), 1_000).unwrap();
        assert_eq!(p.cache_mut().read(0x1234), image[0x1234]);
        assert!(matches!(
            start(PipelineConfig::default(), RomSource::Memory(Arc::from(Vec::new())), 1_000),
            Err(PipelineError::EmptyRom)
        ));
    }
}
