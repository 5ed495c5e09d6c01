//! Pipeline configuration.
//!
//! Everything that the firmware reads from its settings store (bank count,
//! frame-skip override) plus the empirically tuned pacing constants and the
//! memory budgets that decide which compositor mode the pipeline ends up in.
//!
//! | Concern            | Default                                  |
//! |--------------------|------------------------------------------|
//! | ROM cache banks    | 24 with extended memory, 9 without       |
//! | Frame-skip mode    | `Auto`                                   |
//! | Scale filter       | `Nearest`                                |
//! | Fast memory        | 256 KiB                                  |
//! | Extended memory    | 8 MiB, DMA capable                       |
//! | Frame step budget  | 2,000,000 emulated steps                 |
//!
//! The pacing thresholds are kept as plain configuration. They were tuned on
//! hardware and are not derived from anything else in the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{
    FRAME_STEP_BUDGET, PROFILER_LOG_INTERVAL_US, ROM_CACHE_BANK_MAX, ROM_CACHE_BANK_MAX_NO_EXT,
    VERTICAL_SYNC_HZ,
};

// ─── Modes ──────────────────────────────────────────────────────────────────

/// Frame-skip override selected by the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameSkipMode {
    /// Hysteresis controller decides.
    #[default]
    Auto,
    /// Always skip alternate frames.
    Forced,
    /// Never skip.
    Disabled,
}

impl FromStr for FrameSkipMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(FrameSkipMode::Auto),
            "forced" | "on" => Ok(FrameSkipMode::Forced),
            "disabled" | "off" => Ok(FrameSkipMode::Disabled),
            other => Err(format!("unknown frame-skip mode '{}'", other)),
        }
    }
}

impl fmt::Display for FrameSkipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FrameSkipMode::Auto => "auto",
            FrameSkipMode::Forced => "forced",
            FrameSkipMode::Disabled => "disabled",
        })
    }
}

/// Vertical scaling filter used by the compositor's row map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScaleFilter {
    /// Every panel row copies its nearest native row.
    #[default]
    Nearest,
    /// Panel rows blend the two nearest native rows by their fractional distance.
    Blend,
}

impl FromStr for ScaleFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(ScaleFilter::Nearest),
            "blend" | "linear" => Ok(ScaleFilter::Blend),
            other => Err(format!("unknown scale filter '{}'", other)),
        }
    }
}

impl fmt::Display for ScaleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScaleFilter::Nearest => "nearest",
            ScaleFilter::Blend => "blend",
        })
    }
}

// ─── Pacing thresholds ──────────────────────────────────────────────────────

/// Frame-skip hysteresis constants for one compositor mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipThresholds {
    /// Consecutive over-budget frames needed to start skipping
    pub enable_streak: u8,
    /// Consecutive under-budget frames needed to stop skipping
    pub disable_streak: u8,
    /// Frames that must pass after a toggle before the next one
    pub min_active_frames: u8,
    /// Debounce countdown loaded on every toggle
    pub hold_frames: u8,
}

impl SkipThresholds {
    /// Tuning used when the full-frame display cache is available.
    pub const FULL_CACHE: SkipThresholds = SkipThresholds {
        enable_streak: 6,
        disable_streak: 30,
        min_active_frames: 24,
        hold_frames: 6,
    };

    /// Tuning used by the fallback compositor; reacts faster.
    pub const FALLBACK: SkipThresholds = SkipThresholds {
        enable_streak: 4,
        disable_streak: 18,
        min_active_frames: 16,
        hold_frames: 4,
    };
}

/// Interlace hysteresis constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterlaceThresholds {
    pub enable_streak: u8,
    pub disable_streak: u8,
    pub hold_frames: u8,
}

impl Default for InterlaceThresholds {
    fn default() -> Self {
        InterlaceThresholds { enable_streak: 4, disable_streak: 24, hold_frames: 16 }
    }
}

/// All pacing controller tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingConfig {
    pub full_cache: SkipThresholds,
    pub fallback: SkipThresholds,
    pub interlace: InterlaceThresholds,
    /// While interlace is active, frame-skip may still engage once its
    /// over-budget streak exceeds `enable_streak * escalation_factor`.
    pub escalation_factor: u8,
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig {
            full_cache: SkipThresholds::FULL_CACHE,
            fallback: SkipThresholds::FALLBACK,
            interlace: InterlaceThresholds::default(),
            escalation_factor: 2,
        }
    }
}

// ─── Memory budget ──────────────────────────────────────────────────────────

/// Byte budgets of the two memory regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    /// Fast internal memory, always DMA capable
    pub fast_bytes: usize,
    /// Slower extended memory (PSRAM)
    pub extended_bytes: usize,
    /// Whether extended memory exists at all
    pub extended_present: bool,
    /// Whether the panel driver can DMA straight out of extended memory
    pub extended_dma: bool,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        MemoryBudget {
            fast_bytes: 256 * 1024,
            extended_bytes: 8 * 1024 * 1024,
            extended_present: true,
            extended_dma: true,
        }
    }
}

// ─── Pipeline config ────────────────────────────────────────────────────────

/// Complete configuration for [`crate::Pipeline`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Requested streaming cache bank count (clamped by [`PipelineConfig::sanitize`])
    pub rom_cache_banks: u8,
    /// Prefetch the next sequential bank after every miss
    pub prefetch: bool,
    pub frame_skip_mode: FrameSkipMode,
    pub scale_filter: ScaleFilter,
    pub memory: MemoryBudget,
    /// Run the compositor on its own thread behind the frame handoff
    pub double_buffer: bool,
    pub pacing: PacingConfig,
    /// Maximum emulated steps per requested video frame
    pub frame_step_budget: u32,
    /// Emulated display refresh rate
    pub vertical_sync_hz: f64,
    /// Interval between profiler reports; zero disables them
    pub profiler_interval_us: u64,
    /// Bound on waiting for the compositor to free a buffer
    pub handoff_timeout_ms: u64,
}

impl PipelineConfig {
    /// Largest bank count usable with the given memory layout.
    pub fn bank_limit(&self) -> u8 {
        if self.memory.extended_present {
            ROM_CACHE_BANK_MAX
        } else {
            ROM_CACHE_BANK_MAX_NO_EXT
        }
    }

    /// Clamp every field into its supported range.
    pub fn sanitize(&mut self) {
        let limit = self.bank_limit();
        self.rom_cache_banks = self.rom_cache_banks.clamp(1, limit);
        if !self.memory.extended_present {
            self.memory.extended_bytes = 0;
            self.memory.extended_dma = false;
        }
        if self.frame_step_budget == 0 {
            self.frame_step_budget = FRAME_STEP_BUDGET;
        }
        if !(self.vertical_sync_hz > 1.0) {
            self.vertical_sync_hz = VERTICAL_SYNC_HZ;
        }
        if self.pacing.escalation_factor == 0 {
            self.pacing.escalation_factor = 1;
        }
        if self.handoff_timeout_ms == 0 {
            self.handoff_timeout_ms = 1;
        }
    }

    /// Per-frame time budget in microseconds.
    pub fn frame_budget_us(&self) -> f64 {
        1_000_000.0 / self.vertical_sync_hz
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            rom_cache_banks: ROM_CACHE_BANK_MAX,
            prefetch: true,
            frame_skip_mode: FrameSkipMode::Auto,
            scale_filter: ScaleFilter::Nearest,
            memory: MemoryBudget::default(),
            double_buffer: true,
            pacing: PacingConfig::default(),
            frame_step_budget: FRAME_STEP_BUDGET,
            vertical_sync_hz: VERTICAL_SYNC_HZ,
            profiler_interval_us: PROFILER_LOG_INTERVAL_US,
            handoff_timeout_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_skip_mode_parse() {
        assert_eq!("auto".parse::<FrameSkipMode>(), Ok(FrameSkipMode::Auto));
        assert_eq!("Forced".parse::<FrameSkipMode>(), Ok(FrameSkipMode::Forced));
        assert_eq!("off".parse::<FrameSkipMode>(), Ok(FrameSkipMode::Disabled));
        assert!("sometimes".parse::<FrameSkipMode>().is_err());
        assert_eq!(FrameSkipMode::Disabled.to_string(), "disabled");
    }

    #[test]
    fn test_sanitize_clamps_banks() {
        let mut cfg = PipelineConfig { rom_cache_banks: 0, ..Default::default() };
        cfg.sanitize();
        assert_eq!(cfg.rom_cache_banks, 1);

        cfg.rom_cache_banks = 200;
        cfg.sanitize();
        assert_eq!(cfg.rom_cache_banks, ROM_CACHE_BANK_MAX);

        cfg.memory.extended_present = false;
        cfg.sanitize();
        assert_eq!(cfg.rom_cache_banks, ROM_CACHE_BANK_MAX_NO_EXT);
        assert_eq!(cfg.memory.extended_bytes, 0);
    }

    #[test]
    fn test_frame_budget() {
        let cfg = PipelineConfig::default();
        let us = cfg.frame_budget_us();
        assert!(us > 16_742.0 && us < 16_743.0, "budget {}", us);
    }

    #[test]
    fn test_config_survives_bincode() {
        let cfg = PipelineConfig { frame_skip_mode: FrameSkipMode::Forced, ..Default::default() };
        let bytes = bincode::serialize(&cfg).unwrap();
        let back: PipelineConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, cfg);
    }
}
