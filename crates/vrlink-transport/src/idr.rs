//! # IDR Scheduler
//!
//! Decides when the encoder must emit a keyframe.
//!
//! ```text
//!            on_packet_loss / insert_idr / on_stream_start
//!   ┌──────┐ ─────────────────────────────────────────────▶ ┌───────────┐
//!   │ Idle │                                                │ Scheduled │
//!   └──────┘ ◀──────────── check_idr_insertion(now ≥ at) ── └───────────┘
//! ```
//!
//! Loss-triggered keyframes are spaced at least `min_interval` apart and loss
//! reports arriving while one is already scheduled collapse into it.

use std::time::Duration;

/// Keyframe scheduling state. All times are µs on the session clock.
#[derive(Debug, Clone)]
pub struct IdrScheduler {
    normal_interval_us: u64,
    aggressive_interval_us: u64,
    aggressive: bool,
    /// Spacing in force since the last stream start.
    min_interval_us: u64,
    insert_at_us: u64,
    scheduled: bool,
    /// Time the last keyframe was handed to the encoder.
    last_insert_us: Option<u64>,
}

impl IdrScheduler {
    pub fn new(min_interval: Duration, aggressive_interval: Duration, aggressive: bool) -> Self {
        let normal_interval_us = min_interval.as_micros() as u64;
        let aggressive_interval_us = aggressive_interval.as_micros() as u64;
        IdrScheduler {
            normal_interval_us,
            aggressive_interval_us,
            aggressive,
            min_interval_us: if aggressive {
                aggressive_interval_us
            } else {
                normal_interval_us
            },
            insert_at_us: 0,
            scheduled: false,
            last_insert_us: None,
        }
    }

    /// Stream (re)started: pick the spacing and request a keyframe now.
    pub fn on_stream_start(&mut self, now_us: u64) {
        self.min_interval_us = if self.aggressive {
            self.aggressive_interval_us
        } else {
            self.normal_interval_us
        };
        self.insert_at_us = now_us;
        self.scheduled = true;
        tracing::debug!(min_interval_us = self.min_interval_us, "IDR scheduled for stream start");
    }

    /// The client lost video data. Returns `false` when an IDR was already
    /// pending and the report was absorbed.
    pub fn on_packet_loss(&mut self, now_us: u64) -> bool {
        if self.scheduled {
            return false;
        }
        self.insert_at_us = match self.last_insert_us {
            Some(last) if now_us.saturating_sub(last) <= self.min_interval_us => {
                last + self.min_interval_us
            }
            _ => now_us,
        };
        self.scheduled = true;
        tracing::debug!(
            delay_us = self.insert_at_us.saturating_sub(now_us),
            "IDR scheduled after packet loss"
        );
        true
    }

    /// Explicit keyframe request; ignores the spacing rule.
    pub fn insert_idr(&mut self, now_us: u64) {
        self.insert_at_us = now_us;
        self.scheduled = true;
    }

    /// Polled once per encoded frame. `true` exactly once per scheduled IDR.
    pub fn check_idr_insertion(&mut self, now_us: u64) -> bool {
        if self.scheduled && now_us >= self.insert_at_us {
            self.scheduled = false;
            self.last_insert_us = Some(now_us);
            true
        } else {
            false
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    pub fn min_interval_us(&self) -> u64 {
        self.min_interval_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000;

    fn scheduler() -> IdrScheduler {
        IdrScheduler::new(Duration::from_secs(2), Duration::from_millis(100), false)
    }

    #[test]
    fn stream_start_fires_immediately() {
        let mut s = scheduler();
        s.on_stream_start(5 * MS);
        assert!(s.check_idr_insertion(5 * MS));
        assert!(!s.check_idr_insertion(5 * MS));
    }

    #[test]
    fn aggressive_flag_shortens_interval() {
        let mut s = IdrScheduler::new(Duration::from_secs(2), Duration::from_millis(100), true);
        s.on_stream_start(0);
        assert_eq!(s.min_interval_us(), 100 * MS);
    }

    #[test]
    fn loss_reports_debounce() {
        let mut s = scheduler();
        assert!(s.on_packet_loss(10 * MS));
        assert!(!s.on_packet_loss(11 * MS));
        let fired = (10..20u64).filter(|t| s.check_idr_insertion(t * MS)).count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn loss_soon_after_keyframe_is_deferred() {
        let mut s = scheduler();
        s.on_stream_start(0);
        assert!(s.check_idr_insertion(0));

        s.on_packet_loss(500 * MS);
        assert!(s.is_scheduled());
        assert!(!s.check_idr_insertion(1_999 * MS));
        assert!(s.check_idr_insertion(2_000 * MS));
    }

    #[test]
    fn loss_after_interval_fires_now() {
        let mut s = scheduler();
        s.on_stream_start(0);
        assert!(s.check_idr_insertion(0));
        s.on_packet_loss(3_000 * MS);
        assert!(s.check_idr_insertion(3_000 * MS));
    }

    #[test]
    fn explicit_insert_ignores_spacing() {
        let mut s = scheduler();
        s.on_stream_start(0);
        assert!(s.check_idr_insertion(0));
        s.insert_idr(MS);
        assert!(s.check_idr_insertion(MS));
    }

    #[test]
    fn idle_never_fires() {
        let mut s = scheduler();
        assert!(!s.check_idr_insertion(u64::MAX));
    }
}
