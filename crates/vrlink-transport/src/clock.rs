//! # Clock Sync
//!
//! Offset between the client and server clocks from the three-step time-sync
//! exchange:
//!
//! ```text
//!  client                              server
//!    │ mode 0 {clientTime, stats} ───────▶ │
//!    │ ◀──────── mode 1 {serverTime = now} │
//!    │ mode 2 {serverTime, clientTime} ──▶ │  RTT    = now − serverTime
//!    │                                     │  offset = now − (clientTime + RTT/2)
//! ```
//!
//! The offset is replaced on every mode-2 sample; no smoothing happens here.

use quanta::Instant;

/// Upper clamp for a round-trip sample (µs).
pub const MAX_RTT_US: u64 = 500_000;

// ─── Clock Sync ─────────────────────────────────────────────────────────────

/// Client ↔ server time-domain conversion.
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    /// `server − client` in µs.
    offset_us: i64,
    rtt_us: u64,
    samples: u64,
    last_sequence: Option<u64>,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a completed round trip (mode 2).
    ///
    /// `server_time_echoed` is the server clock the server put in its mode-1
    /// reply, `client_time` the client clock when the client answered.
    pub fn on_round_trip(
        &mut self,
        sequence: u64,
        server_time_echoed: u64,
        client_time: u64,
        now_us: u64,
    ) {
        let rtt = now_us.saturating_sub(server_time_echoed).min(MAX_RTT_US);
        let client_at_midpoint = client_time as i128 + (rtt / 2) as i128;
        self.offset_us = (now_us as i128 - client_at_midpoint) as i64;
        self.rtt_us = rtt;
        self.samples += 1;
        self.last_sequence = Some(sequence);
        tracing::trace!(sequence, rtt_us = rtt, offset_us = self.offset_us, "clock sync sample");
    }

    pub fn client_to_server_time(&self, client_us: u64) -> u64 {
        client_us.saturating_add_signed(self.offset_us)
    }

    pub fn server_to_client_time(&self, server_us: u64) -> u64 {
        server_us.saturating_add_signed(self.offset_us.saturating_neg())
    }

    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    pub fn rtt_us(&self) -> u64 {
        self.rtt_us
    }

    /// Whether at least one round trip completed.
    pub fn is_synced(&self) -> bool {
        self.samples > 0
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }
}

// ─── TimestampClock ─────────────────────────────────────────────────────────

/// Monotonic microsecond clock shared by every session component.
#[derive(Debug, Clone)]
pub struct TimestampClock {
    epoch: Instant,
}

impl TimestampClock {
    pub fn new() -> Self {
        TimestampClock {
            epoch: Instant::now(),
        }
    }

    /// Microseconds since the clock was created.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

impl Default for TimestampClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midpoint_offset() {
        let mut c = ClockSync::new();
        // Server sent mode 1 at 1_000_000; client stamped 400_000 on reply;
        // mode 2 arrives at 1_010_000 → RTT 10 ms.
        c.on_round_trip(1, 1_000_000, 400_000, 1_010_000);
        assert_eq!(c.rtt_us(), 10_000);
        assert_eq!(c.offset_us(), 1_010_000 - (400_000 + 5_000));
        assert_eq!(c.client_to_server_time(400_000), 1_005_000);
        assert_eq!(c.server_to_client_time(1_005_000), 400_000);
        assert!(c.is_synced());
    }

    #[test]
    fn negative_offset() {
        let mut c = ClockSync::new();
        c.on_round_trip(1, 100, 5_000_000, 120);
        assert!(c.offset_us() < 0);
        let client = 5_000_050;
        assert_eq!(c.server_to_client_time(c.client_to_server_time(client)), client);
    }

    #[test]
    fn rtt_outlier_clamped() {
        let mut c = ClockSync::new();
        c.on_round_trip(1, 0, 0, 3_000_000);
        assert_eq!(c.rtt_us(), MAX_RTT_US);
        assert_eq!(c.offset_us(), 3_000_000 - 250_000);
    }

    #[test]
    fn offset_replaced_not_smoothed() {
        let mut c = ClockSync::new();
        c.on_round_trip(1, 0, 0, 1_000);
        c.on_round_trip(2, 10_000, 90_000, 10_000);
        assert_eq!(c.offset_us(), -80_000);
        assert_eq!(c.last_sequence(), Some(2));
    }

    #[test]
    fn server_echo_from_the_future_saturates() {
        let mut c = ClockSync::new();
        c.on_round_trip(1, 2_000, 0, 1_000);
        assert_eq!(c.rtt_us(), 0);
        assert_eq!(c.offset_us(), 1_000);
    }

    #[test]
    fn timestamp_clock_monotonic() {
        let clock = TimestampClock::new();
        let t1 = clock.now_us();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let t2 = clock.now_us();
        assert!(t2 > t1);
    }
}
