//! # vrlink Server
//!
//! Headless stream server that drives the vrlink transport with synthetic
//! video frames. Useful for exercising a headset client, the FEC path and
//! the adaptive bitrate loop without a GPU encoder.
//!
//! ## Usage
//!
//! ```bash
//! # Wait for a headset on the default port, learn its address
//! vrlink-server
//!
//! # Fixed peer, 90 Hz, config file
//! vrlink-server --config vrlink.toml --peer 192.168.1.40:9944 --fps 90
//!
//! # Fixed 80 kB frames instead of bitrate-derived sizes
//! vrlink-server --frame-size 80000
//! ```

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use glam::{Quat, Vec3};
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;

use vrlink_transport::pose::DeviceMotion;
use vrlink_transport::{SessionEvent, StreamSession, TransportConfig, TransportRuntime};

/// IDR frames are this many times larger than predicted frames.
const IDR_SIZE_FACTOR: usize = 4;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = parse_args()?;

    // ── Config ──────────────────────────────────────────────────
    let mut config = match &args.config {
        Some(path) => TransportConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load config '{path}': {e}"))?,
        None => TransportConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.network.bind = bind;
    }
    if args.peer.is_some() {
        config.network.peer = args.peer;
    }
    if let Some(fps) = args.fps {
        anyhow::ensure!(fps > 0, "--fps must be greater than zero");
        config.refresh_rate = fps;
    }
    let config = Arc::new(config);

    tracing::info!(
        bind = %config.network.bind,
        peer = ?config.network.peer,
        fps = config.refresh_rate,
        bitrate_mbps = config.bitrate.initial_mbps,
        fec = config.fec.initial_percentage,
        frame_size = ?args.frame_size,
        "vrlink-server starting"
    );

    // ── Transport ───────────────────────────────────────────────
    let socket = UdpSocket::bind(config.network.bind)
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {e}", config.network.bind))?;
    let session = Arc::new(StreamSession::new(config.clone()));
    let events = session.events();
    let mut runtime = TransportRuntime::start(session.clone(), socket, config.network.peer)?;

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Frame loop ──────────────────────────────────────────────
    let mut source = SyntheticEncoder::new(
        args.seed,
        args.frame_size,
        config.refresh_rate,
        session.bitrate_mbps(),
    );
    let frame_interval = Duration::from_secs_f64(1.0 / config.refresh_rate as f64);
    let mut next_frame = Instant::now();
    let mut last_stats_log = Instant::now();
    let stats_interval = Duration::from_secs(5);

    while running.load(Ordering::Relaxed) {
        handle_events(&events, &mut source);

        let now_us = session.now_us();
        let target_timestamp_ns = now_us * 1_000;
        session.on_pose_updated(target_timestamp_ns, source.next_pose(now_us));

        if session.is_streaming() {
            let idr = session.check_idr_insertion(now_us);
            let (payload, encode_latency_us) = source.next_frame(idr);
            if idr {
                tracing::debug!(len = payload.len(), "sending IDR frame");
            }
            if let Err(e) =
                session.send_video_frame(payload, target_timestamp_ns, encode_latency_us, now_us)
            {
                tracing::error!(error = %e, "frame send failed");
            }
        }

        // Periodic stats logging
        if last_stats_log.elapsed() >= stats_interval {
            tracing::info!(stats = %session.stats().to_json(), "sender stats");
            last_stats_log = Instant::now();
        }

        next_frame += frame_interval;
        let now = Instant::now();
        if next_frame > now {
            std::thread::sleep(next_frame - now);
        } else {
            next_frame = now;
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    session.stop_stream();
    runtime.shutdown();
    tracing::info!(stats = %session.stats().to_json(), "vrlink-server stopped");

    Ok(())
}

fn handle_events(events: &Receiver<SessionEvent>, source: &mut SyntheticEncoder) {
    for event in events.try_iter() {
        match event {
            SessionEvent::StreamStarted => tracing::info!("headset started the stream"),
            SessionEvent::StreamStopped => tracing::info!("headset stopped the stream"),
            SessionEvent::BitrateChanged { mbps } => {
                source.set_bitrate(mbps);
                tracing::info!(mbps, frame_size = source.frame_size(), "encoder reconfigured");
            }
            SessionEvent::IdrRequested | SessionEvent::PoseUpdated { .. } => {}
        }
    }
}

// ─── Synthetic Encoder ──────────────────────────────────────────────────────

/// Random frame payloads sized like an encoder running at the current
/// bitrate, plus a slowly turning head pose.
struct SyntheticEncoder {
    rng: StdRng,
    fixed_size: Option<usize>,
    fps: u32,
    frame_size: usize,
}

impl SyntheticEncoder {
    fn new(seed: u64, fixed_size: Option<usize>, fps: u32, bitrate_mbps: u64) -> Self {
        let mut enc = SyntheticEncoder {
            rng: StdRng::seed_from_u64(seed),
            fixed_size,
            fps,
            frame_size: 0,
        };
        enc.set_bitrate(bitrate_mbps);
        enc
    }

    fn set_bitrate(&mut self, mbps: u64) {
        self.frame_size = self
            .fixed_size
            .unwrap_or((mbps * 1_000_000 / 8 / self.fps as u64) as usize)
            .max(1);
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Returns the payload and a simulated encode latency in µs.
    fn next_frame(&mut self, idr: bool) -> (Bytes, u64) {
        let base = if idr {
            self.frame_size * IDR_SIZE_FACTOR
        } else {
            self.frame_size
        };
        let jitter = (base / 10).max(1);
        let len = base - jitter / 2 + self.rng.random_range(0..jitter);
        let mut payload = vec![0u8; len];
        self.rng.fill(&mut payload[..]);
        (payload.into(), self.rng.random_range(2_000..6_000))
    }

    fn next_pose(&mut self, now_us: u64) -> DeviceMotion {
        let yaw = (now_us as f64 / 1_000_000.0 * 0.5).sin() as f32;
        DeviceMotion {
            orientation: Quat::from_rotation_y(yaw),
            position: Vec3::new(0.0, 1.6, 0.0),
            angular_velocity: Vec3::new(0.0, self.rng.random_range(-0.1..0.1f32), 0.0),
            ..Default::default()
        }
    }
}

// ─── CLI Parsing ────────────────────────────────────────────────────────────

struct Args {
    config: Option<String>,
    bind: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    fps: Option<u32>,
    frame_size: Option<usize>,
    seed: u64,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        bind: None,
        peer: None,
        fps: None,
        frame_size: None,
        seed: 1,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{flag} requires a value"))
        };
        match flag {
            "--config" | "-c" => parsed.config = Some(value()?),
            "--bind" | "-b" => {
                let val = value()?;
                parsed.bind = Some(
                    val.trim()
                        .parse()
                        .map_err(|e| anyhow::anyhow!("invalid bind address '{val}': {e}"))?,
                );
            }
            "--peer" | "-p" => {
                let val = value()?;
                parsed.peer = Some(
                    val.trim()
                        .parse()
                        .map_err(|e| anyhow::anyhow!("invalid peer address '{val}': {e}"))?,
                );
            }
            "--fps" | "-f" => {
                let val = value()?;
                parsed.fps = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid fps '{val}': {e}"))?,
                );
            }
            "--frame-size" | "-s" => {
                let val = value()?;
                parsed.frame_size = Some(
                    val.parse()
                        .map_err(|e| anyhow::anyhow!("invalid frame size '{val}': {e}"))?,
                );
            }
            "--seed" => {
                let val = value()?;
                parsed.seed = val
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid seed '{val}': {e}"))?;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                anyhow::bail!("unknown argument: {other}\nRun with --help for usage.");
            }
        }
        i += 1;
    }

    Ok(parsed)
}

fn print_help() {
    eprintln!(
        r#"vrlink-server — Headless VR stream server with synthetic frames

USAGE:
  vrlink-server [OPTIONS]

OPTIONS:
  --config, -c <path>     TOML transport config (defaults when omitted)
  --bind, -b <addr>       UDP bind address (default: 0.0.0.0:9944)
  --peer, -p <addr>       Fixed headset address (default: first sender)
  --fps, -f <hz>          Frame rate (default: config refresh_rate, 72)
  --frame-size, -s <n>    Fixed frame size in bytes (default: from bitrate)
  --seed <n>              Seed for synthetic frame contents (default: 1)
  --help, -h              Show this help

ENVIRONMENT VARIABLES:
  RUST_LOG       Log level filter (e.g. info, debug, vrlink_transport=trace)
"#
    );
}
