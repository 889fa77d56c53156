//! # Adaptive Bitrate Controller
//!
//! Once-per-second control loop steering the encoder bitrate from the video
//! transport latency the client reports.
//!
//! ```text
//!   latency ─────────────────────────────────────────────
//!              above target + threshold  → bitrate −= down (floor 5)
//!   target ┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄
//!              below target − threshold  → bitrate += up (ceiling max)
//!                                           only while the link is loaded
//! ```
//!
//! Latency samples are smoothed with an EMA (α = 0.1). Pure logic, no I/O;
//! the caller decides when a wall-clock second has passed and calls
//! [`BitrateController::tick`].

use crate::config::{BitrateConfig, MIN_BITRATE_MBPS};

/// Upper clamp for a latency sample (µs). Zero samples are treated as this.
pub const MAX_LATENCY_SAMPLE_US: u64 = 500_000;

const EMA_ALPHA: f64 = 0.1;

/// Adaptive bitrate state.
#[derive(Debug, Clone)]
pub struct BitrateController {
    config: BitrateConfig,
    refresh_rate: u32,
    /// Current encoder bitrate (Mbit/s).
    current_mbps: u64,
    target_latency_us: u64,
    /// Smoothed video transport latency; `None` until the first sample.
    latency_us: Option<f64>,
    bits_sent_in_second: u64,
    bits_sent_last_second: u64,
    frames_in_second: u32,
    frames_last_second: u32,
}

impl BitrateController {
    pub fn new(config: BitrateConfig, refresh_rate: u32) -> Self {
        let floor = MIN_BITRATE_MBPS.min(config.max_mbps);
        let current_mbps = config.initial_mbps.clamp(floor, config.max_mbps);
        BitrateController {
            target_latency_us: config.target_latency_us,
            config,
            refresh_rate: refresh_rate.max(1),
            current_mbps,
            latency_us: None,
            bits_sent_in_second: 0,
            bits_sent_last_second: 0,
            frames_in_second: 0,
            frames_last_second: 0,
        }
    }

    /// Feed one network latency sample (µs).
    pub fn report_network_latency(&mut self, latency_us: u64) {
        let sample = if latency_us == 0 || latency_us > MAX_LATENCY_SAMPLE_US {
            MAX_LATENCY_SAMPLE_US
        } else {
            latency_us
        } as f64;
        self.latency_us = Some(match self.latency_us {
            None => sample,
            Some(prev) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * prev,
        });
    }

    /// Count one encoded frame in the current second.
    pub fn encode_output(&mut self) {
        self.frames_in_second += 1;
    }

    /// Count bytes put on the wire in the current second.
    pub fn count_sent_bytes(&mut self, bytes: usize) {
        self.bits_sent_in_second += bytes as u64 * 8;
    }

    /// Close the current second and run one control step.
    ///
    /// Returns `true` when the bitrate changed and the encoder must be
    /// reconfigured.
    pub fn tick(&mut self) -> bool {
        self.bits_sent_last_second = std::mem::take(&mut self.bits_sent_in_second);
        self.frames_last_second = std::mem::take(&mut self.frames_in_second);

        if self.config.use_frametime {
            if self.frames_last_second > 0 {
                let frame_time = 1_000_000 / self.frames_last_second as i64;
                self.target_latency_us = (frame_time + self.config.target_offset_us).max(0) as u64;
            }
            self.target_latency_us = self.target_latency_us.min(self.config.target_max_us);
        }

        if !self.config.adaptive {
            return false;
        }
        let Some(latency) = self.latency_us else {
            return false;
        };

        let before = self.current_mbps;
        let high = (self.target_latency_us + self.config.threshold_us) as f64;
        let low = self.target_latency_us.saturating_sub(self.config.threshold_us) as f64;

        if latency > high {
            self.current_mbps = self
                .current_mbps
                .saturating_sub(self.config.down_step_mbps)
                .max(MIN_BITRATE_MBPS);
        } else if latency < low && self.link_loaded() {
            self.current_mbps =
                (self.current_mbps + self.config.up_step_mbps).min(self.config.max_mbps);
        }

        if self.current_mbps != before {
            tracing::info!(
                from_mbps = before,
                to_mbps = self.current_mbps,
                latency_us = latency as u64,
                target_us = self.target_latency_us,
                "bitrate changed"
            );
            true
        } else {
            false
        }
    }

    /// Whether last second's throughput justifies a step up: more than
    /// `light_load_threshold` of the current bitrate, scaled by the fraction
    /// of the refresh rate actually encoded.
    fn link_loaded(&self) -> bool {
        let frames = if self.frames_last_second == 0 {
            self.refresh_rate
        } else {
            self.frames_last_second
        };
        let sent_mbps = self.bits_sent_last_second as f64 / 1_000_000.0;
        let needed = self.current_mbps as f64
            * self.config.light_load_threshold
            * frames as f64
            / self.refresh_rate as f64;
        sent_mbps > needed
    }

    pub fn bitrate_mbps(&self) -> u64 {
        self.current_mbps
    }

    pub fn target_latency_us(&self) -> u64 {
        self.target_latency_us
    }

    /// Smoothed latency, if any sample arrived.
    pub fn latency_us(&self) -> Option<u64> {
        self.latency_us.map(|l| l as u64)
    }

    pub fn bits_sent_last_second(&self) -> u64 {
        self.bits_sent_last_second
    }

    pub fn frames_last_second(&self) -> u32 {
        self.frames_last_second
    }
}
