//! cartstream desktop host v0.4.0.
//!
//! Runs the real-time pipeline on a workstation: the board's 240×135 panel
//! is simulated in memory and mirrored into a scaled window, storage is a
//! plain file, and memory budgets come from the command line so low-memory
//! degradation paths can be exercised without hardware.
//!
//! Two execution modes:
//!
//! - **GUI mode** (default): scaled window, keyboard/gamepad input, live
//!   frame-skip mode switching.
//! - **Headless mode** (`--headless`): run N iterations, print a summary and
//!   an ASCII snapshot of the panel.
//!
//! `--pack OUT` writes a packed image of the ROM for direct mapping and exits.
//!
//! No instruction-level core ships with this host; the [`scope::RomScope`]
//! core walks the cartridge through the bank cache and draws what it reads.

mod scope;

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use cartstream_core::config::MemoryBudget;
use cartstream_core::pipeline::{FrameClock, ManualClock, SystemClock};
use cartstream_core::rom_pack::{is_packed, write_pack};
use cartstream_core::storage::ReaderStream;
use cartstream_core::{
    Buttons, EmulationCore, FrameSkipMode, MemoryPanel, PanelHandle, Pipeline, PipelineBuilder,
    PipelineConfig, RomSource, ScaleFilter, PANEL_HEIGHT, PANEL_WIDTH, ROM_CACHE_BANK_MAX,
};
use clap::Parser;
use gilrs::{Axis, Button as GilrsButton, Event as GilrsEvent, EventType, Gilrs};
use minifb::{Key, KeyRepeat, Scale, ScaleMode, Window, WindowOptions};

use scope::RomScope;

/// Analog stick deadzone
const STICK_DEADZONE: f32 = 0.3;
/// Bytes inspected when sniffing for a packed image
const PACK_SNIFF_LEN: usize = 16;
/// Window title refresh interval
const TITLE_INTERVAL: Duration = Duration::from_secs(2);
const WINDOW_TITLE: &str = "cartstream v0.4.0";

#[derive(Parser, Debug)]
#[command(name = "cartstream", version, about = "Real-time handheld emulation pipeline host")]
struct Args {
    /// Cartridge image (raw ROM or packed image)
    rom: PathBuf,

    /// ROM cache bank count
    #[arg(long, default_value_t = ROM_CACHE_BANK_MAX)]
    banks: u8,

    /// Frame-skip mode: auto, on, off
    #[arg(long, default_value = "auto")]
    frame_skip: FrameSkipMode,

    /// Vertical scale filter: nearest, blend
    #[arg(long, default_value = "nearest")]
    filter: ScaleFilter,

    /// Fast internal memory budget in KiB
    #[arg(long, default_value_t = 256)]
    fast_mem_kib: usize,

    /// Extended memory budget in KiB
    #[arg(long, default_value_t = 8192)]
    ext_mem_kib: usize,

    /// Simulate a board without extended memory
    #[arg(long)]
    no_ext_mem: bool,

    /// Panel driver cannot DMA out of extended memory
    #[arg(long)]
    no_ext_dma: bool,

    /// Disable sequential bank prefetch
    #[arg(long)]
    no_prefetch: bool,

    /// Composite inline instead of on a separate thread
    #[arg(long)]
    single_buffer: bool,

    /// Run without a window
    #[arg(long)]
    headless: bool,

    /// Iterations to run in headless mode
    #[arg(long, default_value_t = 600)]
    frames: u64,

    /// Headless: do not sleep between frames (simulated clock)
    #[arg(long)]
    unpaced: bool,

    /// Window scale factor (1-6)
    #[arg(long, default_value_t = 3)]
    scale: usize,

    /// Profiler report interval in seconds (0 disables)
    #[arg(long, default_value_t = 5)]
    report_secs: u64,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Write a packed image of ROM to this path and exit
    #[arg(long, value_name = "OUT")]
    pack: Option<PathBuf>,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        let extended_present = !self.no_ext_mem;
        PipelineConfig {
            rom_cache_banks: self.banks,
            prefetch: !self.no_prefetch,
            frame_skip_mode: self.frame_skip,
            scale_filter: self.filter,
            memory: MemoryBudget {
                fast_bytes: self.fast_mem_kib * 1024,
                extended_bytes: if extended_present { self.ext_mem_kib * 1024 } else { 0 },
                extended_present,
                extended_dma: extended_present && !self.no_ext_dma,
            },
            double_buffer: !self.single_buffer,
            profiler_interval_us: self.report_secs * 1_000_000,
            ..PipelineConfig::default()
        }
    }
}

// ─── Gamepad ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct GamepadState {
    held: Buttons,
    stick_x: f32,
    stick_y: f32,
}

impl GamepadState {
    /// D-pad and face buttons, with the left stick folded into the d-pad.
    fn buttons(&self) -> Buttons {
        let mut b = self.held;
        if self.stick_x < -STICK_DEADZONE {
            b.insert(Buttons::LEFT);
        }
        if self.stick_x > STICK_DEADZONE {
            b.insert(Buttons::RIGHT);
        }
        if self.stick_y < -STICK_DEADZONE {
            b.insert(Buttons::UP);
        }
        if self.stick_y > STICK_DEADZONE {
            b.insert(Buttons::DOWN);
        }
        b
    }
}

fn init_gamepad() -> Option<Gilrs> {
    match Gilrs::new() {
        Ok(gilrs) => {
            let mut found = false;
            for (id, gp) in gilrs.gamepads() {
                log::debug!("Gamepad: [{}] \"{}\" ({})", id, gp.name(), gp.os_name());
                found = true;
            }
            if !found {
                log::debug!("No gamepad (hot-plug supported)");
            }
            Some(gilrs)
        }
        Err(e) => {
            log::warn!("Gamepad unavailable: {}", e);
            None
        }
    }
}

fn poll_gamepad(gilrs: &mut Gilrs, state: &mut GamepadState) {
    while let Some(GilrsEvent { event, .. }) = gilrs.next_event() {
        match event {
            EventType::ButtonPressed(b, _) => apply_button(state, b, true),
            EventType::ButtonReleased(b, _) => apply_button(state, b, false),
            EventType::AxisChanged(a, v, _) => apply_axis(state, a, v),
            EventType::Connected => log::info!("Gamepad connected"),
            EventType::Disconnected => {
                log::info!("Gamepad disconnected");
                *state = GamepadState::default();
            }
            _ => {}
        }
    }
}

fn apply_button(state: &mut GamepadState, btn: GilrsButton, pressed: bool) {
    let mapped = match btn {
        GilrsButton::DPadUp => Buttons::UP,
        GilrsButton::DPadDown => Buttons::DOWN,
        GilrsButton::DPadLeft => Buttons::LEFT,
        GilrsButton::DPadRight => Buttons::RIGHT,
        GilrsButton::South | GilrsButton::West => Buttons::A,
        GilrsButton::East | GilrsButton::North => Buttons::B,
        GilrsButton::Start => Buttons::START,
        GilrsButton::Select => Buttons::SELECT,
        _ => return,
    };
    state.held.set(mapped, pressed);
}

fn apply_axis(state: &mut GamepadState, axis: Axis, value: f32) {
    match axis {
        Axis::LeftStickX => state.stick_x = value,
        // gilrs reports up as positive
        Axis::LeftStickY => state.stick_y = -value,
        Axis::DPadX => {
            state.held.set(Buttons::LEFT, value < -STICK_DEADZONE);
            state.held.set(Buttons::RIGHT, value > STICK_DEADZONE);
        }
        Axis::DPadY => {
            state.held.set(Buttons::UP, value > STICK_DEADZONE);
            state.held.set(Buttons::DOWN, value < -STICK_DEADZONE);
        }
        _ => {}
    }
}

fn keyboard_buttons(window: &Window) -> Buttons {
    let mut b = Buttons::default();
    b.set(Buttons::UP, window.is_key_down(Key::Up));
    b.set(Buttons::DOWN, window.is_key_down(Key::Down));
    b.set(Buttons::LEFT, window.is_key_down(Key::Left));
    b.set(Buttons::RIGHT, window.is_key_down(Key::Right));
    b.set(Buttons::A, window.is_key_down(Key::Z));
    b.set(Buttons::B, window.is_key_down(Key::X));
    b.set(Buttons::START, window.is_key_down(Key::Enter));
    b.set(Buttons::SELECT, window.is_key_down(Key::Backspace));
    b
}

// ─── ROM source ─────────────────────────────────────────────────────────────

/// Packed images are inflated into memory; everything else is streamed.
fn open_source(path: &Path) -> Result<RomSource> {
    let mut head = [0u8; PACK_SNIFF_LEN];
    let n = File::open(path)
        .and_then(|mut f| f.read(&mut head))
        .with_context(|| format!("failed to open {}", path.display()))?;
    if is_packed(&head[..n]) {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        log::info!("{}: packed image, {} bytes", path.display(), bytes.len());
        return Ok(RomSource::Packed(bytes));
    }
    let stream = ReaderStream::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(RomSource::Stream(Box::new(stream)))
}

fn run_pack(rom: &Path, out: &Path) -> Result<()> {
    let data = fs::read(rom).with_context(|| format!("failed to read {}", rom.display()))?;
    if data.is_empty() {
        bail!("{} is empty", rom.display());
    }
    let stem = rom.file_stem().and_then(|s| s.to_str()).unwrap_or("rom");
    write_pack(out, stem, stem, &data, false).with_context(|| format!("failed to write {}", out.display()))?;
    let packed = fs::metadata(out).map(|m| m.len()).unwrap_or(0);
    println!("Packed {} ({} bytes) -> {} ({} bytes)", rom.display(), data.len(), out.display(), packed);
    Ok(())
}

// ─── Main ───────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Some(out) = &args.pack {
        return run_pack(&args.rom, out);
    }

    let panel = MemoryPanel::new(PANEL_WIDTH, PANEL_HEIGHT);
    let handle = panel.handle();
    let clock: Box<dyn FrameClock> = if args.headless && args.unpaced {
        Box::new(ManualClock::new())
    } else {
        Box::new(SystemClock::new())
    };

    let source = open_source(&args.rom)?;
    let mut pipeline = PipelineBuilder::new(args.pipeline_config())
        .panel(Box::new(panel))
        .clock(clock)
        .build(source, RomScope::new())
        .with_context(|| format!("failed to start pipeline for {}", args.rom.display()))?;

    log::info!(
        "{}: {} bytes, {:?} cache, {} banks × {} bytes, {:?} compositor, {}",
        args.rom.display(),
        pipeline.cache().size(),
        pipeline.cache().mode(),
        pipeline.cache().bank_count(),
        pipeline.cache().bank_size(),
        pipeline.compositor_mode(),
        if pipeline.double_buffered() { "double-buffered" } else { "single-buffered" },
    );

    let result = if args.headless {
        run_headless(&mut pipeline, &handle, args.frames)
    } else {
        run_gui(&mut pipeline, &handle, args.scale.clamp(1, 6))
    };
    pipeline.shutdown();
    result
}

// ─── GUI Mode ───────────────────────────────────────────────────────────────

fn run_gui(pipeline: &mut Pipeline<RomScope>, handle: &PanelHandle, scale: usize) -> Result<()> {
    let scaled_w = PANEL_WIDTH * scale;
    let scaled_h = PANEL_HEIGHT * scale;
    let mut window = Window::new(
        WINDOW_TITLE,
        scaled_w,
        scaled_h,
        WindowOptions {
            scale: Scale::X1,
            scale_mode: ScaleMode::AspectRatioStretch,
            resize: true,
            ..Default::default()
        },
    )
    .context("failed to create window")?;
    // The pipeline paces itself.
    window.set_target_fps(0);

    let mut gilrs = init_gamepad();
    let mut gp = GamepadState::default();
    let mut panel_buf = Vec::with_capacity(PANEL_WIDTH * PANEL_HEIGHT);
    let mut scaled_buf = vec![0u32; scaled_w * scaled_h];
    let mut last_presented = u64::MAX;
    let mut last_title = Instant::now();
    let mut title_frames = 0u64;
    let mut title_presented = 0u64;

    while window.is_open() && !window.is_key_down(Key::Escape) {
        if let Some(g) = gilrs.as_mut() {
            poll_gamepad(g, &mut gp);
        }
        for (key, mode) in [
            (Key::F1, FrameSkipMode::Auto),
            (Key::F2, FrameSkipMode::Forced),
            (Key::F3, FrameSkipMode::Disabled),
        ] {
            if window.is_key_pressed(key, KeyRepeat::No) {
                pipeline.pacing_mut().set_mode(mode);
            }
        }

        let buttons = keyboard_buttons(&window) | gp.buttons();
        let report = pipeline.run_iteration(&mut move || buttons)?;
        title_frames += 1;
        if report.presented {
            title_presented += 1;
        }

        let presented = handle.copy_rgb888(&mut panel_buf);
        if presented != last_presented {
            last_presented = presented;
            scale_into(&panel_buf, &mut scaled_buf, scale);
            window
                .update_with_buffer(&scaled_buf, scaled_w, scaled_h)
                .context("failed to update window")?;
        } else {
            window.update();
        }

        let elapsed = last_title.elapsed();
        if elapsed >= TITLE_INTERVAL {
            let secs = elapsed.as_secs_f64();
            let pacing = pipeline.pacing();
            window.set_title(&format!(
                "{} - {:.1} FPS ({:.1} shown) [{}{}{}]",
                WINDOW_TITLE,
                title_frames as f64 / secs,
                title_presented as f64 / secs,
                pacing.mode(),
                if pacing.frame_skip() { " skip" } else { "" },
                if pacing.interlace() { " interlace" } else { "" },
            ));
            title_frames = 0;
            title_presented = 0;
            last_title = Instant::now();
        }
    }
    log::info!("{} iterations, {}", pipeline.frames(), pipeline.core().diagnostics());
    Ok(())
}

/// Integer upscale of the panel image.
fn scale_into(src: &[u32], dst: &mut [u32], scale: usize) {
    let dst_w = PANEL_WIDTH * scale;
    for (y, row) in src.chunks_exact(PANEL_WIDTH).enumerate().take(PANEL_HEIGHT) {
        for sy in 0..scale {
            let base = (y * scale + sy) * dst_w;
            let line = &mut dst[base..base + dst_w];
            for (x, &c) in row.iter().enumerate() {
                line[x * scale..(x + 1) * scale].fill(c);
            }
        }
    }
}

// ─── Headless Mode ──────────────────────────────────────────────────────────

fn run_headless(pipeline: &mut Pipeline<RomScope>, handle: &PanelHandle, frames: u64) -> Result<()> {
    let start = Instant::now();
    let mut completed = 0u64;
    let mut presented = 0u64;
    let mut over_budget = 0u64;
    let mut no_input = || Buttons::default();
    for _ in 0..frames {
        let report = pipeline.run_iteration(&mut no_input)?;
        completed += report.completed as u64;
        presented += report.presented as u64;
        over_budget += report.over_budget as u64;
    }
    // Let the compositor finish what is queued before reading the panel.
    pipeline.shutdown();

    let secs = start.elapsed().as_secs_f64().max(1e-9);
    let stats = pipeline.cache().stats();
    let counters = handle.counters();
    println!(
        "{} iterations in {:.2}s ({:.1}/s): {} completed, {} presented, {} over budget",
        frames,
        secs,
        frames as f64 / secs,
        completed,
        presented,
        over_budget
    );
    println!(
        "ROM cache: {} hits, {} misses, {} swaps; panel: {} batches, {} writes, {} px",
        stats.hits, stats.misses, stats.swaps, counters.batches, counters.writes, counters.pixels_written
    );
    println!("Core: {} ({} bank jumps)", pipeline.core().diagnostics(), pipeline.core().jumps());
    if let Some(line) = pipeline.last_report() {
        println!("{}", line);
    }
    print_panel(&handle.snapshot());
    Ok(())
}

/// Dark pixels count as lit (ink on a light panel).
fn lit(p: u16) -> bool {
    let r = (p >> 11) & 0x1F;
    let g = (p >> 5) & 0x3F;
    let b = p & 0x1F;
    r * 2 + g + b * 2 < 94
}

/// Half-block ASCII render, two panel rows per text line.
fn print_panel(pixels: &[u16]) {
    let count = pixels.iter().filter(|&&p| lit(p)).count();
    println!("  ({} px lit)", count);
    for y in (0..PANEL_HEIGHT).step_by(2) {
        let mut l = String::with_capacity(PANEL_WIDTH + 4);
        l.push_str("  |");
        for x in 0..PANEL_WIDTH {
            let t = lit(pixels[y * PANEL_WIDTH + x]);
            let b = y + 1 < PANEL_HEIGHT && lit(pixels[(y + 1) * PANEL_WIDTH + x]);
            l.push(match (t, b) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                _ => ' ',
            });
        }
        l.push('|');
        println!("{}", l);
    }
}
