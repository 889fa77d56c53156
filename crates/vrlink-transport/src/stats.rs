//! # Sender Statistics
//!
//! Per-second and lifetime counters for the send path plus the latest
//! client-side report. [`StatsCollector`] accumulates; [`SenderStats`] is the
//! serializable view handed to logs and dashboards.

use serde::Serialize;

use crate::wire::ClientStats;

/// Snapshot of the send path, rendered as JSON by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SenderStats {
    pub packets_total: u64,
    pub bytes_total: u64,
    /// Packets sent during the previous second.
    pub packets_per_second: u64,
    /// Bits sent during the previous second.
    pub bits_per_second: u64,
    /// Frames encoded during the previous second.
    pub fps: u32,
    pub encode_latency_avg_us: u64,
    pub encode_latency_max_us: u64,
    pub client: ClientStats,
    pub fec_percentage: u16,
    pub bitrate_mbps: u64,
    pub queue_len: usize,
}

impl SenderStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

#[derive(Debug, Clone, Default)]
struct Second {
    packets: u64,
    bytes: u64,
    frames: u32,
    latency_sum_us: u64,
    latency_max_us: u64,
}

/// Running counters behind [`SenderStats`].
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    packets_total: u64,
    bytes_total: u64,
    current: Second,
    previous: Second,
    client: ClientStats,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count datagrams that left the socket.
    pub fn count_sent(&mut self, packets: u64, bytes: u64) {
        self.packets_total += packets;
        self.bytes_total += bytes;
        self.current.packets += packets;
        self.current.bytes += bytes;
    }

    /// One encoded frame left the encoder `latency_us` after capture.
    pub fn encode_output(&mut self, latency_us: u64) {
        self.current.frames += 1;
        self.current.latency_sum_us += latency_us;
        self.current.latency_max_us = self.current.latency_max_us.max(latency_us);
    }

    /// Store the statistics carried by a mode-0 time-sync sample.
    pub fn record_client_stats(&mut self, stats: ClientStats) {
        self.client = stats;
    }

    /// Close the current second.
    pub fn reset_second(&mut self) {
        self.previous = std::mem::take(&mut self.current);
    }

    pub fn client_stats(&self) -> &ClientStats {
        &self.client
    }

    pub fn snapshot(&self, fec_percentage: u16, bitrate_mbps: u64, queue_len: usize) -> SenderStats {
        let p = &self.previous;
        SenderStats {
            packets_total: self.packets_total,
            bytes_total: self.bytes_total,
            packets_per_second: p.packets,
            bits_per_second: p.bytes * 8,
            fps: p.frames,
            encode_latency_avg_us: if p.frames == 0 {
                0
            } else {
                p.latency_sum_us / p.frames as u64
            },
            encode_latency_max_us: p.latency_max_us,
            client: self.client,
            fec_percentage,
            bitrate_mbps,
            queue_len,
        }
    }
}
