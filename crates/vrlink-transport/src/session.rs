//! # Stream Session
//!
//! Shared state for one connected headset. Every component sits behind its
//! own mutex and no method holds two of them at once, so the receive thread
//! and the encode/send thread never wait on each other for longer than one
//! in-memory update.
//!
//! ```text
//!  encoder ──send_video_frame──▶ FecEncoder ──▶ ThrottlingQueue ──drain──▶ socket
//!                                   ▲                 ▲
//!                          FecRateControl      BitrateController ◀── poll (1 s)
//!                                   ▲                 ▲
//!  socket ──handle_packet──▶ PacketErrorReport / TimeSync / StreamControl
//!                                   │
//!                                   ▼
//!                             IdrScheduler ──check_idr_insertion──▶ encoder
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use glam::Affine3A;

use crate::bitrate::BitrateController;
use crate::clock::{ClockSync, TimestampClock};
use crate::config::{FecConfig, TransportConfig};
use crate::error::Result;
use crate::fec::{EncodedFrame, FecEncoder, FrameSendSummary};
use crate::idr::IdrScheduler;
use crate::pose::{DeviceMotion, PoseEntry, PoseHistory};
use crate::stats::{SenderStats, StatsCollector};
use crate::throttle::ThrottlingQueue;
use crate::wire::{
    peek_packet_type, AudioFrame, AudioFrameStart, HapticsFeedback, LostFrameType, PacketErrorReport,
    PacketType, StreamControl, TimeSync, TimeSyncMode, MAX_PACKET_SIZE,
};

const SECOND_US: u64 = 1_000_000;
const EVENT_CAPACITY: usize = 256;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Notifications for the video encoder and the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    StreamStarted,
    StreamStopped,
    /// The encoder must be reconfigured to this bitrate.
    BitrateChanged { mbps: u64 },
    /// A keyframe was scheduled; poll [`StreamSession::check_idr_insertion`].
    IdrRequested,
    PoseUpdated { target_timestamp_ns: u64 },
}

// ─── FEC rate control ───────────────────────────────────────────────────────

/// FEC percentage escalation on repeated reconstruction failures.
#[derive(Debug, Clone)]
pub struct FecRateControl {
    config: FecConfig,
    percentage: u16,
    last_failure_us: Option<u64>,
}

impl FecRateControl {
    pub fn new(config: FecConfig) -> Self {
        FecRateControl {
            percentage: config.initial_percentage,
            config,
            last_failure_us: None,
        }
    }

    /// Register a failure. Returns the new percentage when it was raised.
    pub fn on_failure(&mut self, now_us: u64) -> Option<u16> {
        let window_us = self.config.continuous_failure_window.as_micros() as u64;
        let before = self.percentage;
        if let Some(last) = self.last_failure_us {
            if now_us.saturating_sub(last) < window_us {
                self.percentage = self.config.escalate(self.percentage);
            }
        }
        self.last_failure_us = Some(now_us);
        (self.percentage != before).then_some(self.percentage)
    }

    pub fn reset(&mut self) {
        self.percentage = self.config.initial_percentage;
        self.last_failure_us = None;
    }

    pub fn percentage(&self) -> u16 {
        self.percentage
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

/// Transport state shared between the receive and send threads.
pub struct StreamSession {
    config: Arc<TransportConfig>,
    clock: TimestampClock,
    streaming: AtomicBool,
    next_tick_us: AtomicU64,
    video_frame_index: AtomicU64,
    audio_packet_counter: AtomicU32,

    encoder: Mutex<FecEncoder>,
    queue: Mutex<ThrottlingQueue>,
    bitrate: Mutex<BitrateController>,
    idr: Mutex<IdrScheduler>,
    clock_sync: Mutex<ClockSync>,
    poses: Mutex<PoseHistory>,
    stats: Mutex<StatsCollector>,
    fec_rate: Mutex<FecRateControl>,

    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl StreamSession {
    pub fn new(config: Arc<TransportConfig>) -> Self {
        let bitrate = BitrateController::new(config.bitrate.clone(), config.refresh_rate);
        let cap = config.throttle.cap_bps(bitrate.bitrate_mbps());
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);
        StreamSession {
            clock: TimestampClock::new(),
            streaming: AtomicBool::new(false),
            next_tick_us: AtomicU64::new(SECOND_US),
            video_frame_index: AtomicU64::new(0),
            audio_packet_counter: AtomicU32::new(0),
            encoder: Mutex::new(FecEncoder::new()),
            queue: Mutex::new(ThrottlingQueue::with_window(cap, config.throttle.window_us)),
            bitrate: Mutex::new(bitrate),
            idr: Mutex::new(IdrScheduler::new(
                config.idr.min_interval,
                config.idr.aggressive_interval,
                config.idr.aggressive_keyframe_resend,
            )),
            clock_sync: Mutex::new(ClockSync::new()),
            poses: Mutex::new(PoseHistory::new(config.pose.capacity)),
            stats: Mutex::new(StatsCollector::new()),
            fec_rate: Mutex::new(FecRateControl::new(config.fec.clone())),
            events_tx,
            events_rx,
            config,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Session clock in µs.
    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    /// Event stream. Every clone competes for the same events.
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(TrySendError::Full(ev)) = self.events_tx.try_send(event) {
            tracing::trace!(?ev, "event channel full, dropping");
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    // ── Stream control ──────────────────────────────────────────────────

    pub fn start_stream(&self, now_us: u64) {
        lock(&self.fec_rate).reset();
        lock(&self.idr).on_stream_start(now_us);
        self.streaming.store(true, Ordering::Release);
        tracing::info!("stream started");
        self.emit(SessionEvent::StreamStarted);
        self.emit(SessionEvent::IdrRequested);
    }

    /// Stop streaming and drop everything still queued.
    pub fn stop_stream(&self) {
        if !self.streaming.swap(false, Ordering::AcqRel) {
            return;
        }
        let dropped = {
            let mut q = lock(&self.queue);
            let n = q.len();
            q.clear();
            n
        };
        tracing::info!(dropped_packets = dropped, "stream stopped");
        self.emit(SessionEvent::StreamStopped);
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Packetize one encoded frame into the transmit queue.
    ///
    /// Returns `None` when the stream is not running.
    pub fn send_video_frame(
        &self,
        payload: Bytes,
        target_timestamp_ns: u64,
        encode_latency_us: u64,
        now_us: u64,
    ) -> Result<Option<FrameSendSummary>> {
        if !self.is_streaming() {
            tracing::debug!(len = payload.len(), "not streaming, video frame skipped");
            return Ok(None);
        }
        let fec_percentage = lock(&self.fec_rate).percentage();
        let frame = EncodedFrame {
            tracking_frame_index: target_timestamp_ns,
            video_frame_index: self.video_frame_index.fetch_add(1, Ordering::Relaxed),
            payload,
        };

        let mut packets = Vec::new();
        let summary =
            lock(&self.encoder).send_frame(&frame, fec_percentage, now_us, |p| packets.push(p))?;

        {
            let mut q = lock(&self.queue);
            for p in packets {
                q.push(p, frame.video_frame_index, now_us);
            }
        }
        lock(&self.bitrate).encode_output();
        lock(&self.stats).encode_output(encode_latency_us);
        Ok(Some(summary))
    }

    /// Fragment an audio buffer into start + continuation packets. Returns
    /// the number of packets queued.
    pub fn send_audio(&self, payload: &[u8], presentation_time_us: u64, now_us: u64) -> usize {
        if !self.is_streaming() {
            tracing::debug!(len = payload.len(), "not streaming, audio skipped");
            return 0;
        }
        let mut packets = Vec::new();
        let mut remaining = payload;
        let mut first = true;
        while !remaining.is_empty() {
            let counter = self.audio_packet_counter.fetch_add(1, Ordering::Relaxed);
            let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE);
            if first {
                AudioFrameStart {
                    packet_counter: counter,
                    presentation_time: presentation_time_us,
                    frame_byte_size: payload.len() as u32,
                }
                .encode(&mut buf);
                first = false;
            } else {
                AudioFrame {
                    packet_counter: counter,
                }
                .encode(&mut buf);
            }
            let n = remaining.len().min(MAX_PACKET_SIZE - buf.len());
            buf.extend_from_slice(&remaining[..n]);
            remaining = &remaining[n..];
            packets.push(buf.freeze());
        }

        let count = packets.len();
        let mut q = lock(&self.queue);
        for p in packets {
            q.push(p, 0, now_us);
        }
        count
    }

    /// Queue a haptics pulse. Returns `false` when the stream is not running.
    pub fn send_haptics(&self, feedback: &HapticsFeedback, now_us: u64) -> bool {
        if !self.is_streaming() {
            tracing::debug!("not streaming, haptics skipped");
            return false;
        }
        let mut buf = BytesMut::with_capacity(HapticsFeedback::ENCODED_LEN);
        feedback.encode(&mut buf);
        lock(&self.queue).push(buf.freeze(), 0, now_us);
        true
    }

    /// Send queued datagrams within the current budget. Returns whether
    /// entries remain queued.
    ///
    /// The queue lock is held while `send` runs, so `send` must not block.
    /// `WouldBlock` keeps the datagram at the head; any other error drops it.
    pub fn drain<F>(&self, now_us: u64, mut send: F) -> bool
    where
        F: FnMut(&[u8]) -> io::Result<()>,
    {
        let mut packets = 0u64;
        let mut bytes = 0u64;
        let remaining = lock(&self.queue).drain(now_us, |entry| {
            send(&entry.bytes)?;
            packets += 1;
            bytes += entry.bytes.len() as u64;
            Ok(())
        });
        if packets > 0 {
            lock(&self.bitrate).count_sent_bytes(bytes as usize);
            lock(&self.stats).count_sent(packets, bytes);
        }
        remaining
    }

    /// Run the once-per-second work when a second boundary passed. Returns
    /// whether it ran.
    pub fn poll(&self, now_us: u64) -> bool {
        let next = self.next_tick_us.load(Ordering::Acquire);
        if now_us < next
            || self
                .next_tick_us
                .compare_exchange(next, now_us + SECOND_US, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return false;
        }

        let changed = {
            let mut b = lock(&self.bitrate);
            b.tick().then(|| b.bitrate_mbps())
        };
        if let Some(mbps) = changed {
            lock(&self.queue).set_bitrate(self.config.throttle.cap_bps(mbps));
            self.emit(SessionEvent::BitrateChanged { mbps });
        }
        lock(&self.stats).reset_second();

        let queued = lock(&self.queue).len();
        if queued > self.config.throttle.queue_warn_len {
            tracing::warn!(
                queued,
                limit = self.config.throttle.queue_warn_len,
                "transmit queue is growing, link slower than the bitrate cap"
            );
        }
        true
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Process one datagram from the client. Returns a reply to send back.
    pub fn handle_packet(&self, buf: &[u8], now_us: u64) -> Option<Bytes> {
        let Some(packet_type) = peek_packet_type(buf) else {
            tracing::trace!(len = buf.len(), "unknown packet dropped");
            return None;
        };
        match packet_type {
            PacketType::TimeSync => {
                let ts = TimeSync::decode(&mut &buf[..])?;
                self.handle_time_sync(&ts, now_us)
            }
            PacketType::PacketErrorReport => {
                let report = PacketErrorReport::decode(&mut &buf[..])?;
                tracing::debug!(
                    lost_frame_type = report.lost_frame_type,
                    from = report.from_packet_counter,
                    to = report.to_packet_counter,
                    "packet loss reported"
                );
                if report.lost_frame_type() == Some(LostFrameType::Video) {
                    self.on_fec_failure(now_us);
                }
                None
            }
            PacketType::StreamControl => {
                match StreamControl::decode(&mut &buf[..])? {
                    StreamControl::Start => self.start_stream(now_us),
                    StreamControl::Stop => self.stop_stream(),
                }
                None
            }
            other => {
                tracing::trace!(packet_type = ?other, "packet ignored");
                None
            }
        }
    }

    fn handle_time_sync(&self, ts: &TimeSync, now_us: u64) -> Option<Bytes> {
        match ts.mode() {
            Some(TimeSyncMode::ClientReport) => {
                lock(&self.stats).record_client_stats(ts.stats);
                self.report_network_latency(ts.stats.average_transport_latency as u64);
                if ts.stats.fec_failure != 0 {
                    self.on_fec_failure(now_us);
                }
                let reply = TimeSync {
                    mode: TimeSyncMode::ServerEcho as u32,
                    server_time: now_us,
                    ..*ts
                };
                Some(reply.to_bytes())
            }
            Some(TimeSyncMode::ClientEcho) => {
                lock(&self.clock_sync).on_round_trip(ts.sequence, ts.server_time, ts.client_time, now_us);
                None
            }
            _ => {
                tracing::trace!(mode = ts.mode, "time sync mode ignored");
                None
            }
        }
    }

    // ── Feedback ────────────────────────────────────────────────────────

    pub fn report_network_latency(&self, latency_us: u64) {
        lock(&self.bitrate).report_network_latency(latency_us);
    }

    /// The client could not reconstruct a frame.
    pub fn on_fec_failure(&self, now_us: u64) {
        let raised = lock(&self.fec_rate).on_failure(now_us);
        if let Some(pct) = raised {
            tracing::info!(fec_percentage = pct, "FEC percentage raised");
        }
        let scheduled = lock(&self.idr).on_packet_loss(now_us);
        if scheduled {
            self.emit(SessionEvent::IdrRequested);
        }
    }

    pub fn insert_idr(&self, now_us: u64) {
        lock(&self.idr).insert_idr(now_us);
        self.emit(SessionEvent::IdrRequested);
    }

    /// Polled by the encoder once per frame.
    pub fn check_idr_insertion(&self, now_us: u64) -> bool {
        lock(&self.idr).check_idr_insertion(now_us)
    }

    // ── Pose ────────────────────────────────────────────────────────────

    pub fn on_pose_updated(&self, target_timestamp_ns: u64, motion: DeviceMotion) {
        if lock(&self.poses).on_pose_updated(target_timestamp_ns, motion) {
            self.emit(SessionEvent::PoseUpdated {
                target_timestamp_ns,
            });
        }
    }

    pub fn set_pose_transform(&self, transform: Affine3A) {
        lock(&self.poses).set_transform(transform);
    }

    pub fn pose_at(&self, target_timestamp_ns: u64) -> Option<PoseEntry> {
        lock(&self.poses).get_pose_at(target_timestamp_ns)
    }

    pub fn best_pose_match(&self, candidate: &Affine3A) -> Option<PoseEntry> {
        lock(&self.poses).get_best_pose_match(candidate)
    }

    // ── Observation ─────────────────────────────────────────────────────

    pub fn fec_percentage(&self) -> u16 {
        lock(&self.fec_rate).percentage()
    }

    pub fn bitrate_mbps(&self) -> u64 {
        lock(&self.bitrate).bitrate_mbps()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn clock_offset_us(&self) -> Option<i64> {
        let c = lock(&self.clock_sync);
        c.is_synced().then(|| c.offset_us())
    }

    pub fn client_to_server_time(&self, client_us: u64) -> u64 {
        lock(&self.clock_sync).client_to_server_time(client_us)
    }

    pub fn server_to_client_time(&self, server_us: u64) -> u64 {
        lock(&self.clock_sync).server_to_client_time(server_us)
    }

    pub fn stats(&self) -> SenderStats {
        let fec = self.fec_percentage();
        let mbps = self.bitrate_mbps();
        let queued = self.queue_len();
        lock(&self.stats).snapshot(fec, mbps, queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session() -> StreamSession {
        StreamSession::new(Arc::new(TransportConfig::default()))
    }

    /// Drain window by window until the queue is empty.
    fn drain_all(s: &StreamSession, now_us: u64) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut t = now_us;
        while s.drain(t, |b| {
            out.push(b.to_vec());
            Ok(())
        }) {
            t += 1_000;
        }
        out
    }

    fn events(s: &StreamSession) -> Vec<SessionEvent> {
        s.events().try_iter().collect()
    }

    #[test]
    fn fec_rate_escalates_within_window() {
        let mut f = FecRateControl::new(FecConfig::default());
        assert_eq!(f.on_failure(0), None);
        assert_eq!(f.on_failure(1_000_000), Some(10));
        assert_eq!(f.on_failure(2_000_000), None);
        assert_eq!(f.percentage(), 10);
        f.reset();
        assert_eq!(f.percentage(), 5);
    }

    #[test]
    fn fec_rate_spaced_failures_do_not_escalate() {
        let cfg = FecConfig {
            continuous_failure_window: Duration::from_secs(1),
            ..Default::default()
        };
        let mut f = FecRateControl::new(cfg);
        f.on_failure(0);
        assert_eq!(f.on_failure(5_000_000), None);
        assert_eq!(f.percentage(), 5);
    }

    #[test]
    fn frames_skipped_until_stream_starts() {
        let s = session();
        let r = s.send_video_frame(Bytes::from(vec![1u8; 5_000]), 1, 0, 0).unwrap();
        assert!(r.is_none());
        assert_eq!(s.queue_len(), 0);
        assert_eq!(s.send_audio(&[0u8; 100], 0, 0), 0);
    }

    #[test]
    fn video_frame_queued_and_drained() {
        let s = session();
        s.start_stream(0);
        let summary = s
            .send_video_frame(Bytes::from(vec![7u8; 14_000]), 99, 3_000, 0)
            .unwrap()
            .unwrap();
        assert_eq!(summary.packets, 12);
        assert_eq!(s.queue_len(), 12);

        let sent = drain_all(&s, 0);
        assert_eq!(sent.len(), 12);
        assert_eq!(peek_packet_type(&sent[0]), Some(PacketType::VideoFrame));
        assert_eq!(s.queue_len(), 0);

        assert!(s.poll(SECOND_US));
        let stats = s.stats();
        assert_eq!(stats.packets_per_second, 12);
        assert_eq!(stats.fps, 1);
        assert_eq!(stats.encode_latency_avg_us, 3_000);
    }

    #[test]
    fn drain_failure_keeps_packet() {
        let s = session();
        s.start_stream(0);
        s.send_haptics(
            &HapticsFeedback {
                start_time: 0,
                amplitude: 1.0,
                duration: 0.1,
                frequency: 200.0,
                hand: 0,
            },
            0,
        );
        let remaining = s.drain(0, |_| Err(io::ErrorKind::WouldBlock.into()));
        assert!(remaining);
        assert_eq!(s.queue_len(), 1);
        assert_eq!(drain_all(&s, 0).len(), 1);
    }

    #[test]
    fn unreachable_network_does_not_wedge_queue() {
        let s = session();
        s.start_stream(0);
        s.send_video_frame(Bytes::from(vec![7u8; 14_000]), 99, 3_000, 0)
            .unwrap()
            .unwrap();
        assert_eq!(s.queue_len(), 12);

        let mut attempts = 0;
        let mut t = 0;
        while s.drain(t, |_| {
            attempts += 1;
            Err(io::ErrorKind::NetworkUnreachable.into())
        }) {
            t += 1_000;
        }
        assert_eq!(attempts, 12);
        assert_eq!(s.queue_len(), 0);
        assert_eq!(s.stats().packets_total, 0);

        // Traffic queued afterwards still goes out.
        s.send_video_frame(Bytes::from(vec![8u8; 500]), 100, 3_000, t)
            .unwrap()
            .unwrap();
        // One data shard plus one parity shard.
        assert_eq!(drain_all(&s, t).len(), 2);
        assert_eq!(s.stats().packets_total, 2);
    }

    #[test]
    fn audio_fragmented_under_packet_size() {
        let s = session();
        s.start_stream(0);
        let n = s.send_audio(&[3u8; 3_000], 1234, 0);
        assert_eq!(n, 3);
        let sent = drain_all(&s, 0);
        assert_eq!(peek_packet_type(&sent[0]), Some(PacketType::AudioFrameStart));
        assert_eq!(peek_packet_type(&sent[1]), Some(PacketType::AudioFrame));
        assert!(sent.iter().all(|p| p.len() <= MAX_PACKET_SIZE));
        let payload: usize = sent[0].len() - AudioFrameStart::ENCODED_LEN
            + sent[1..]
                .iter()
                .map(|p| p.len() - AudioFrame::ENCODED_LEN)
                .sum::<usize>();
        assert_eq!(payload, 3_000);
        let start = AudioFrameStart::decode(&mut &sent[0][..]).unwrap();
        assert_eq!(start.frame_byte_size, 3_000);
        assert_eq!(start.presentation_time, 1234);
    }

    #[test]
    fn time_sync_mode0_echoes_and_records() {
        let s = session();
        let sample = TimeSync {
            mode: 0,
            sequence: 5,
            server_time: 0,
            client_time: 777,
            stats: crate::wire::ClientStats {
                packets_lost_total: 3,
                average_transport_latency: 8_000,
                ..Default::default()
            },
        };
        let reply = s.handle_packet(&sample.to_bytes(), 42_000).unwrap();
        let echo = TimeSync::decode(&mut &reply[..]).unwrap();
        assert_eq!(echo.mode(), Some(TimeSyncMode::ServerEcho));
        assert_eq!(echo.server_time, 42_000);
        assert_eq!(echo.client_time, 777);
        assert_eq!(echo.sequence, 5);
        assert_eq!(s.stats().client.packets_lost_total, 3);
    }

    #[test]
    fn time_sync_mode2_sets_offset() {
        let s = session();
        assert_eq!(s.clock_offset_us(), None);
        let sample = TimeSync {
            mode: 2,
            sequence: 1,
            server_time: 1_000_000,
            client_time: 400_000,
            stats: Default::default(),
        };
        assert!(s.handle_packet(&sample.to_bytes(), 1_010_000).is_none());
        assert_eq!(s.clock_offset_us(), Some(605_000));
        assert_eq!(s.client_to_server_time(400_000), 1_005_000);
    }

    #[test]
    fn loss_reports_raise_fec_and_schedule_idr() {
        let s = session();
        s.start_stream(0);
        assert!(s.check_idr_insertion(0));
        let _ = events(&s);

        let mut buf = BytesMut::new();
        PacketErrorReport {
            lost_frame_type: LostFrameType::Video as u32,
            from_packet_counter: 10,
            to_packet_counter: 12,
        }
        .encode(&mut buf);
        s.handle_packet(&buf, 3_000_000);
        s.handle_packet(&buf, 3_500_000);

        assert_eq!(s.fec_percentage(), 10);
        // The second report lands while the first IDR is still pending.
        let idr_events = events(&s)
            .into_iter()
            .filter(|e| *e == SessionEvent::IdrRequested)
            .count();
        assert_eq!(idr_events, 1);
        assert!(s.check_idr_insertion(3_500_000));
    }

    #[test]
    fn audio_loss_report_is_ignored() {
        let s = session();
        s.start_stream(0);
        let mut buf = BytesMut::new();
        PacketErrorReport {
            lost_frame_type: LostFrameType::Audio as u32,
            from_packet_counter: 0,
            to_packet_counter: 1,
        }
        .encode(&mut buf);
        s.handle_packet(&buf, 1_000);
        s.handle_packet(&buf, 2_000);
        assert_eq!(s.fec_percentage(), 5);
    }

    #[test]
    fn stream_control_start_stop() {
        let s = session();
        let mut buf = BytesMut::new();
        StreamControl::Start.encode(&mut buf);
        s.handle_packet(&buf, 0);
        assert!(s.is_streaming());

        s.send_audio(&[1u8; 10], 0, 0);
        assert_eq!(s.queue_len(), 1);

        let mut buf = BytesMut::new();
        StreamControl::Stop.encode(&mut buf);
        s.handle_packet(&buf, 0);
        assert!(!s.is_streaming());
        assert_eq!(s.queue_len(), 0);

        let ev = events(&s);
        assert_eq!(ev.first(), Some(&SessionEvent::StreamStarted));
        assert_eq!(ev.last(), Some(&SessionEvent::StreamStopped));
    }

    #[test]
    fn garbage_is_ignored() {
        let s = session();
        assert!(s.handle_packet(&[], 0).is_none());
        assert!(s.handle_packet(&[0xff; 3], 0).is_none());
        assert!(s.handle_packet(&7u32.to_le_bytes(), 0).is_none());
    }

    #[test]
    fn poll_runs_once_per_second_and_lowers_bitrate() {
        let s = session();
        s.report_network_latency(200_000);
        assert!(!s.poll(500_000));
        assert!(s.poll(SECOND_US));
        assert!(!s.poll(SECOND_US + 10));
        assert_eq!(s.bitrate_mbps(), 28);
        assert!(events(&s).contains(&SessionEvent::BitrateChanged { mbps: 28 }));
    }

    #[test]
    fn pose_updates_emit_events() {
        let s = session();
        s.on_pose_updated(100, DeviceMotion::default());
        s.on_pose_updated(100, DeviceMotion::default());
        assert_eq!(
            events(&s),
            vec![SessionEvent::PoseUpdated {
                target_timestamp_ns: 100
            }]
        );
        assert!(s.pose_at(100).is_some());
        assert_eq!(
            s.best_pose_match(&Affine3A::IDENTITY).map(|e| e.target_timestamp_ns),
            Some(100)
        );
        s.set_pose_transform(Affine3A::from_translation(glam::Vec3::X));
        assert!(s.pose_at(100).is_none());
    }
}
