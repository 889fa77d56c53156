use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TransportError};
use crate::fec::fec_percentage_fits;

pub const CONFIG_VERSION: u32 = 1;

/// Lowest bitrate the adaptive controller will go to (Mbit/s).
pub const MIN_BITRATE_MBPS: u64 = 5;

// ─── TOML input ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfigInput {
    pub version: u32,
    pub video: VideoConfigInput,
    pub fec: FecConfigInput,
    pub bitrate: BitrateConfigInput,
    pub idr: IdrConfigInput,
    pub throttle: ThrottleConfigInput,
    pub pose: PoseConfigInput,
    pub network: NetworkConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VideoConfigInput {
    pub refresh_rate: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FecConfigInput {
    pub initial_percentage: Option<u16>,
    pub max_percentage: Option<u16>,
    pub step: Option<u16>,
    pub continuous_failure_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BitrateConfigInput {
    pub initial_mbps: Option<u64>,
    pub adaptive: Option<bool>,
    pub max_mbps: Option<u64>,
    pub up_step_mbps: Option<u64>,
    pub down_step_mbps: Option<u64>,
    pub target_latency_us: Option<u64>,
    pub threshold_us: Option<u64>,
    pub use_frametime: Option<bool>,
    pub target_offset_us: Option<i64>,
    pub target_max_us: Option<u64>,
    pub light_load_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdrConfigInput {
    pub min_interval_ms: Option<u64>,
    pub aggressive_interval_ms: Option<u64>,
    pub aggressive_keyframe_resend: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThrottleConfigInput {
    pub bitrate_multiplier: Option<f64>,
    pub window_us: Option<u64>,
    pub queue_warn_len: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoseConfigInput {
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfigInput {
    pub bind: Option<String>,
    pub peer: Option<String>,
}

// ─── Resolved config ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FecConfig {
    pub initial_percentage: u16,
    pub max_percentage: u16,
    pub step: u16,
    /// Failures closer together than this escalate the FEC percentage.
    pub continuous_failure_window: Duration,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            initial_percentage: 5,
            max_percentage: 10,
            step: 5,
            continuous_failure_window: Duration::from_secs(60),
        }
    }
}

impl FecConfig {
    /// Next percentage after a continuous failure at `current`.
    pub fn escalate(&self, current: u16) -> u16 {
        if current >= self.max_percentage {
            current
        } else {
            current.saturating_add(self.step).min(self.max_percentage)
        }
    }

    /// Every percentage a session can run at, starting from the initial one.
    pub fn escalation_path(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::successors(Some(self.initial_percentage), move |&p| {
            let next = self.escalate(p);
            (next != p).then_some(next)
        })
    }
}

#[derive(Debug, Clone)]
pub struct BitrateConfig {
    pub initial_mbps: u64,
    pub adaptive: bool,
    pub max_mbps: u64,
    pub up_step_mbps: u64,
    pub down_step_mbps: u64,
    pub target_latency_us: u64,
    pub threshold_us: u64,
    /// Derive the latency target from the measured frame time.
    pub use_frametime: bool,
    pub target_offset_us: i64,
    pub target_max_us: u64,
    pub light_load_threshold: f64,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            initial_mbps: 30,
            adaptive: true,
            max_mbps: 200,
            up_step_mbps: 10,
            down_step_mbps: 2,
            target_latency_us: 12_000,
            threshold_us: 4_000,
            use_frametime: false,
            target_offset_us: 0,
            target_max_us: 50_000,
            light_load_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdrConfig {
    pub min_interval: Duration,
    pub aggressive_interval: Duration,
    pub aggressive_keyframe_resend: bool,
}

impl Default for IdrConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(2),
            aggressive_interval: Duration::from_millis(100),
            aggressive_keyframe_resend: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Queue cap as a multiple of the current video bitrate; 0 disables.
    pub bitrate_multiplier: f64,
    pub window_us: u64,
    /// Queue length that triggers a warning.
    pub queue_warn_len: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            bitrate_multiplier: 1.5,
            window_us: 1_000,
            queue_warn_len: 4096,
        }
    }
}

impl ThrottleConfig {
    /// Queue cap in bits per second for a given video bitrate.
    pub fn cap_bps(&self, bitrate_mbps: u64) -> u64 {
        (bitrate_mbps as f64 * 1_000_000.0 * self.bitrate_multiplier) as u64
    }
}

#[derive(Debug, Clone)]
pub struct PoseConfig {
    pub capacity: usize,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self { capacity: 360 }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub bind: SocketAddr,
    /// Fixed client address; learned from the first datagram when unset.
    pub peer: Option<SocketAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 9944)),
            peer: None,
        }
    }
}

/// Immutable transport configuration shared by every component.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub version: u32,
    pub refresh_rate: u32,
    pub fec: FecConfig,
    pub bitrate: BitrateConfig,
    pub idr: IdrConfig,
    pub throttle: ThrottleConfig,
    pub pose: PoseConfig,
    pub network: NetworkConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            refresh_rate: 72,
            fec: FecConfig::default(),
            bitrate: BitrateConfig::default(),
            idr: IdrConfig::default(),
            throttle: ThrottleConfig::default(),
            pose: PoseConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr> {
    value.trim().parse().map_err(|e| {
        TransportError::Config(format!("invalid {field} address '{}': {e}", value.trim()))
    })
}

impl TransportConfigInput {
    pub fn resolve(self) -> Result<TransportConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(TransportError::Config(format!(
                "unsupported config version {version}"
            )));
        }

        let d = TransportConfig::default();

        let refresh_rate = self.video.refresh_rate.unwrap_or(d.refresh_rate);
        if refresh_rate == 0 {
            return Err(TransportError::Config("refresh_rate must be > 0".into()));
        }

        let fec = FecConfig {
            initial_percentage: self
                .fec
                .initial_percentage
                .unwrap_or(d.fec.initial_percentage),
            max_percentage: self.fec.max_percentage.unwrap_or(d.fec.max_percentage),
            step: self.fec.step.unwrap_or(d.fec.step),
            continuous_failure_window: self
                .fec
                .continuous_failure_window_ms
                .map(Duration::from_millis)
                .unwrap_or(d.fec.continuous_failure_window),
        };
        if fec.initial_percentage > fec.max_percentage {
            return Err(TransportError::Config(format!(
                "fec initial_percentage {} above max_percentage {}",
                fec.initial_percentage, fec.max_percentage
            )));
        }
        // The shard limit is not monotone in the percentage, so every step of
        // the escalation path has to fit, not only the endpoints.
        if let Some(bad) = fec.escalation_path().find(|&p| !fec_percentage_fits(p)) {
            return Err(TransportError::Config(format!(
                "fec percentage {bad} (escalating {} → {} by {}) can exceed the 20-shard limit",
                fec.initial_percentage, fec.max_percentage, fec.step
            )));
        }

        let b = &self.bitrate;
        let bitrate = BitrateConfig {
            initial_mbps: b.initial_mbps.unwrap_or(d.bitrate.initial_mbps),
            adaptive: b.adaptive.unwrap_or(d.bitrate.adaptive),
            max_mbps: b.max_mbps.unwrap_or(d.bitrate.max_mbps),
            up_step_mbps: b.up_step_mbps.unwrap_or(d.bitrate.up_step_mbps),
            down_step_mbps: b.down_step_mbps.unwrap_or(d.bitrate.down_step_mbps),
            target_latency_us: b.target_latency_us.unwrap_or(d.bitrate.target_latency_us),
            threshold_us: b.threshold_us.unwrap_or(d.bitrate.threshold_us),
            use_frametime: b.use_frametime.unwrap_or(d.bitrate.use_frametime),
            target_offset_us: b.target_offset_us.unwrap_or(d.bitrate.target_offset_us),
            target_max_us: b.target_max_us.unwrap_or(d.bitrate.target_max_us),
            light_load_threshold: b
                .light_load_threshold
                .unwrap_or(d.bitrate.light_load_threshold),
        };
        if bitrate.max_mbps < MIN_BITRATE_MBPS {
            return Err(TransportError::Config(format!(
                "bitrate max_mbps must be at least {MIN_BITRATE_MBPS}"
            )));
        }
        if bitrate.initial_mbps == 0 || bitrate.initial_mbps > bitrate.max_mbps {
            return Err(TransportError::Config(format!(
                "bitrate initial_mbps {} outside 1..={}",
                bitrate.initial_mbps, bitrate.max_mbps
            )));
        }

        let idr = IdrConfig {
            min_interval: self
                .idr
                .min_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(d.idr.min_interval),
            aggressive_interval: self
                .idr
                .aggressive_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(d.idr.aggressive_interval),
            aggressive_keyframe_resend: self
                .idr
                .aggressive_keyframe_resend
                .unwrap_or(d.idr.aggressive_keyframe_resend),
        };

        let throttle = ThrottleConfig {
            bitrate_multiplier: self
                .throttle
                .bitrate_multiplier
                .unwrap_or(d.throttle.bitrate_multiplier)
                .max(0.0),
            window_us: self.throttle.window_us.unwrap_or(d.throttle.window_us).max(100),
            queue_warn_len: self
                .throttle
                .queue_warn_len
                .unwrap_or(d.throttle.queue_warn_len),
        };

        let pose = PoseConfig {
            capacity: self.pose.capacity.unwrap_or(d.pose.capacity).max(1),
        };

        let network = NetworkConfig {
            bind: match self.network.bind.as_deref() {
                Some(s) => parse_addr("bind", s)?,
                None => d.network.bind,
            },
            peer: self
                .network
                .peer
                .as_deref()
                .map(|s| parse_addr("peer", s))
                .transpose()?,
        };

        Ok(TransportConfig {
            version,
            refresh_rate,
            fec,
            bitrate,
            idr,
            throttle,
            pose,
            network,
        })
    }
}

impl TransportConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(TransportConfig::default());
        }
        let parsed: TransportConfigInput = toml::from_str(input)
            .map_err(|e| TransportError::Config(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Minimum IDR spacing for the configured keyframe mode.
    pub fn idr_interval(&self) -> Duration {
        if self.idr.aggressive_keyframe_resend {
            self.idr.aggressive_interval
        } else {
            self.idr.min_interval
        }
    }
}
