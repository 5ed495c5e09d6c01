//! # cartstream-core
//!
//! Real-time emulation pipeline for a handheld console running on a small
//! battery-powered board (v0.4.0).
//!
//! The board has a 240×135 RGB565 panel, removable storage, a few hundred
//! KiB of fast memory and optional slower extended memory. The pipeline
//! keeps a fixed ~59.73 Hz cadence even though cartridge images are much
//! larger than fast memory, panel updates are expensive, and per-frame CPU
//! emulation cost varies.
//!
//! ## Architecture
//!
//! - [`RomCache`]: byte-addressable cartridge ROM over a small LRU pool of
//!   bank buffers, streamed from storage or mapped directly
//! - [`FrameBuffer`]: native 160×144 frame with per-row hashes and dirty flags
//! - [`channel`]: double-buffer handoff to the compositor thread
//! - [`FrameCompositor`]: vertical scale, dirty-row diff, batched panel writes
//! - [`PacingController`]: frame-skip / interlace hysteresis
//! - [`Pipeline`]: context object owning all of the above plus the main loop
//! - [`memory`]: fast/extended memory budgets that drive degradation
//! - [`rom_pack`]: packed (compressed) ROM images for direct mapping
//! - [`profiler`]: periodic `[PROF]` telemetry
//!
//! The instruction-level CPU/PPU core is not part of this crate; it plugs in
//! through [`EmulationCore`].

pub mod channel;
pub mod compositor;
pub mod config;
pub mod core_iface;
pub mod error;
pub mod framebuffer;
pub mod memory;
pub mod pacing;
pub mod panel;
pub mod pipeline;
pub mod profiler;
pub mod rom_cache;
pub mod rom_pack;
pub mod storage;

pub use compositor::{CompositorMode, FrameCompositor};
pub use config::{FrameSkipMode, PipelineConfig, ScaleFilter};
pub use core_iface::{Buttons, CoreBus, EmulationCore};
pub use error::PipelineError;
pub use framebuffer::{FrameBuffer, Palette, ScanlineSink};
pub use memory::MemoryPool;
pub use pacing::{PacingController, PacingDecision};
pub use panel::{MemoryPanel, Panel, PanelHandle};
pub use pipeline::{Pipeline, PipelineBuilder, RomSource};
pub use rom_cache::RomCache;

/// Emulated display width in pixels
pub const NATIVE_WIDTH: usize = 160;
/// Emulated display height in pixels
pub const NATIVE_HEIGHT: usize = 144;
/// Physical panel width in pixels
pub const PANEL_WIDTH: usize = 240;
/// Physical panel height in pixels
pub const PANEL_HEIGHT: usize = 135;

/// Rows per write in the fallback compositor
pub const FALLBACK_SEGMENT_ROWS: usize = 4;

/// Maximum CPU steps per requested frame before the watchdog gives up
pub const FRAME_STEP_BUDGET: u32 = 2_000_000;
/// Emulated vertical refresh rate
pub const VERTICAL_SYNC_HZ: f64 = 59.7275;
/// Interval between `[PROF]` reports
pub const PROFILER_LOG_INTERVAL_US: u64 = 5_000_000;

/// Bank limit with extended memory present
pub const ROM_CACHE_BANK_MAX: u8 = 24;
/// Bank limit when everything lives in fast memory
pub const ROM_CACHE_BANK_MAX_NO_EXT: u8 = 9;
/// Cache block size with extended memory: 4 KiB
pub const ROM_BANK_SIZE_EXTENDED: usize = 0x1000;
/// Cache block size without extended memory: one 16 KiB cartridge bank
pub const ROM_BANK_SIZE_INTERNAL: usize = 0x4000;
