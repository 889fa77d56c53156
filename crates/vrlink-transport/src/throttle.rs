//! # Throttling Transmit Queue
//!
//! FIFO of ready-to-send datagrams drained under a byte budget.
//!
//! The configured bitrate is turned into a budget per burst window (1 ms by
//! default). Within a window packets go out back to back until the budget is
//! spent; the packet that crosses the budget is still sent, which absorbs
//! scheduling jitter. A new window starts once the clock moves past the old
//! one. A bitrate of zero disables throttling.
//!
//! The queue never refuses a push and applies no backpressure. Growth is
//! visible through [`ThrottlingQueue::len`] and [`ThrottlingQueue::queued_bytes`].

use std::collections::VecDeque;
use std::io;

use bytes::Bytes;

/// Default burst window.
pub const DEFAULT_WINDOW_US: u64 = 1_000;

/// A datagram waiting for budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub bytes: Bytes,
    /// Video frame the datagram belongs to (0 for non-video traffic).
    pub frame_index: u64,
    pub enqueue_time_us: u64,
}

/// Bitrate-limited FIFO transmit queue.
#[derive(Debug)]
pub struct ThrottlingQueue {
    entries: VecDeque<QueueEntry>,
    queued_bytes: usize,
    /// Cap in bits per second; 0 = unthrottled.
    bitrate_bps: u64,
    window_us: u64,
    window_start_us: u64,
    window_sent_bytes: u64,
    packets_sent: u64,
    bytes_sent: u64,
    packets_dropped: u64,
}

impl ThrottlingQueue {
    pub fn new(bitrate_bps: u64) -> Self {
        Self::with_window(bitrate_bps, DEFAULT_WINDOW_US)
    }

    pub fn with_window(bitrate_bps: u64, window_us: u64) -> Self {
        ThrottlingQueue {
            entries: VecDeque::new(),
            queued_bytes: 0,
            bitrate_bps,
            window_us: window_us.max(1),
            window_start_us: 0,
            window_sent_bytes: 0,
            packets_sent: 0,
            bytes_sent: 0,
            packets_dropped: 0,
        }
    }

    /// Enqueue a datagram. Always accepted.
    pub fn push(&mut self, bytes: Bytes, frame_index: u64, now_us: u64) {
        self.queued_bytes += bytes.len();
        self.entries.push_back(QueueEntry {
            bytes,
            frame_index,
            enqueue_time_us: now_us,
        });
    }

    /// Retune the cap. Takes effect from the current window on.
    pub fn set_bitrate(&mut self, bitrate_bps: u64) {
        if bitrate_bps != self.bitrate_bps {
            tracing::debug!(
                old_bps = self.bitrate_bps,
                new_bps = bitrate_bps,
                "throttle bitrate changed"
            );
            self.bitrate_bps = bitrate_bps;
        }
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate_bps
    }

    /// Bytes allowed per burst window.
    pub fn window_budget(&self) -> u64 {
        self.bitrate_bps / 8 * self.window_us / 1_000_000
    }

    fn roll_window(&mut self, now_us: u64) {
        if now_us.saturating_sub(self.window_start_us) >= self.window_us {
            self.window_start_us = now_us;
            self.window_sent_bytes = 0;
        }
    }

    /// Take the head entry if the current window still has budget.
    ///
    /// The budget is charged immediately; hand the entry back with
    /// [`ThrottlingQueue::requeue_front`] if it could not be sent.
    pub fn pop_ready(&mut self, now_us: u64) -> Option<QueueEntry> {
        self.roll_window(now_us);
        if self.bitrate_bps > 0 && self.window_sent_bytes >= self.window_budget() {
            return None;
        }
        let entry = self.entries.pop_front()?;
        self.queued_bytes -= entry.bytes.len();
        self.window_sent_bytes += entry.bytes.len() as u64;
        Some(entry)
    }

    /// Return an unsent entry to the head and refund its budget.
    pub fn requeue_front(&mut self, entry: QueueEntry) {
        self.window_sent_bytes = self
            .window_sent_bytes
            .saturating_sub(entry.bytes.len() as u64);
        self.queued_bytes += entry.bytes.len();
        self.entries.push_front(entry);
    }

    /// Record a datagram that left the socket.
    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    /// Send as many entries as the budget allows. Returns whether entries
    /// remain queued.
    ///
    /// `WouldBlock` leaves the entry at the head and ends the drain. Any
    /// other error drops the entry and the drain carries on.
    pub fn drain<F>(&mut self, now_us: u64, mut send: F) -> bool
    where
        F: FnMut(&QueueEntry) -> io::Result<()>,
    {
        while let Some(entry) = self.pop_ready(now_us) {
            match send(&entry) {
                Ok(()) => self.record_sent(entry.bytes.len()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.requeue_front(entry);
                    break;
                }
                Err(e) => {
                    self.packets_dropped += 1;
                    tracing::debug!(
                        error = %e,
                        len = entry.bytes.len(),
                        frame = entry.frame_index,
                        "send failed, packet dropped"
                    );
                }
            }
        }
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Enqueue time of the oldest waiting entry.
    pub fn head_enqueue_time_us(&self) -> Option<u64> {
        self.entries.front().map(|e| e.enqueue_time_us)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Entries discarded after a hard send error.
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }

    /// Drop everything queued (stream stop).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.queued_bytes = 0;
    }
}
