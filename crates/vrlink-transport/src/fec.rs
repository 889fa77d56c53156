//! # FEC Frame Encoder
//!
//! Splits one compressed video frame into a Reed-Solomon block and emits one
//! UDP packet per `(shard, shardPacket)` pair.
//!
//! ## Shard layout
//!
//! ```text
//!  frame (len bytes)
//! ┌──────────────┬──────────────┬──────────┬─────────┐
//! │  data 0      │  data 1      │ data n-1 │ padding │   blockSize = shardPackets × 1358
//! └──────────────┴──────────────┴──────────┴─────────┘
//!        │              │              │
//!        ▼              ▼              ▼
//!   [pkt][pkt]     [pkt][pkt]     [pkt][pkt]   [parity 0][parity 1] ...
//!   fecIndex 0,1   2,3            ...          dataShards×shardPackets ..
//! ```
//!
//! The data-shard count is capped so that data plus worst-case parity never
//! exceeds [`FEC_SHARDS_MAX`]; large frames grow `shardPackets` instead of the
//! shard count. Receivers recompute the same layout from `frameByteSize` and
//! `fecPercentage` in the header, so no layout field goes on the wire.
//!
//! [`FrameReassembler`] is the receiving half: it collects packets by
//! `videoFrameIndex` and rebuilds the frame as soon as any `dataShards`
//! complete shards are present.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::codec::{ErasureCodec, ReedSolomonCodec};
use crate::error::Result;
use crate::wire::{
    decode_video_packet, encode_video_packet, VideoFrameHeader, FEC_SHARDS_MAX,
    MAX_VIDEO_BUFFER_SIZE,
};

// ─── Shard Math ─────────────────────────────────────────────────────────────

/// `ceil(data_shards × fec_percentage / 100)`.
pub fn parity_shards(data_shards: usize, fec_percentage: u16) -> usize {
    (data_shards * fec_percentage as usize).div_ceil(100)
}

/// Largest data-shard count whose worst-case parity still fits the shard
/// ceiling, leaving two shards of headroom.
pub fn max_data_shards(fec_percentage: u16) -> usize {
    let p = fec_percentage as usize;
    ((FEC_SHARDS_MAX - 2) * 100 + 99 + p) / (100 + p)
}

/// Whether every frame size is encodable at this FEC percentage.
pub fn fec_percentage_fits(fec_percentage: u16) -> bool {
    let max_data = max_data_shards(fec_percentage);
    max_data > 0 && max_data + parity_shards(max_data, fec_percentage) <= FEC_SHARDS_MAX
}

/// Block geometry for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    pub data_shards: usize,
    pub parity_shards: usize,
    /// Packets per shard.
    pub shard_packets: usize,
    /// Bytes per shard (`shard_packets × MAX_VIDEO_BUFFER_SIZE`).
    pub block_size: usize,
}

impl ShardLayout {
    /// Compute the layout for a `len`-byte frame.
    ///
    /// An empty frame has zero data shards and produces no packets.
    pub fn for_frame(len: usize, fec_percentage: u16) -> Self {
        let max_data = max_data_shards(fec_percentage).max(1);
        let min_block_size = len.div_ceil(max_data);
        let shard_packets = min_block_size.div_ceil(MAX_VIDEO_BUFFER_SIZE).max(1);
        let block_size = shard_packets * MAX_VIDEO_BUFFER_SIZE;
        let data_shards = len.div_ceil(block_size);
        ShardLayout {
            data_shards,
            parity_shards: parity_shards(data_shards, fec_percentage),
            shard_packets,
            block_size,
        }
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Packets emitted for the frame.
    pub fn packet_count(&self) -> usize {
        self.total_shards() * self.shard_packets
    }
}

// ─── Encoder ────────────────────────────────────────────────────────────────

/// One compressed frame handed over by the video encoder.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Target timestamp of the pose the frame was rendered with (ns).
    pub tracking_frame_index: u64,
    pub video_frame_index: u64,
    pub payload: Bytes,
}

/// What [`FecEncoder::send_frame`] emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSendSummary {
    pub layout: ShardLayout,
    pub packets: usize,
    /// Bytes emitted including headers.
    pub bytes: usize,
    /// Counter of the first emitted packet.
    pub first_packet_counter: u32,
}

/// Packetizes frames into FEC-protected video packets.
///
/// Owns the global packet counter, so one encoder serves one stream.
pub struct FecEncoder<C: ErasureCodec = ReedSolomonCodec> {
    codec: C,
    packet_counter: u32,
    packets_sent: u64,
    bytes_sent: u64,
}

impl FecEncoder<ReedSolomonCodec> {
    pub fn new() -> Self {
        Self::with_codec(ReedSolomonCodec)
    }
}

impl Default for FecEncoder<ReedSolomonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ErasureCodec> FecEncoder<C> {
    pub fn with_codec(codec: C) -> Self {
        FecEncoder {
            codec,
            packet_counter: 0,
            packets_sent: 0,
            bytes_sent: 0,
        }
    }

    /// Fragment, FEC-encode and emit one frame through `sink`.
    ///
    /// Panics if the layout exceeds [`FEC_SHARDS_MAX`] shards; a FEC
    /// percentage accepted by [`fec_percentage_fits`] never does.
    pub fn send_frame<F>(
        &mut self,
        frame: &EncodedFrame,
        fec_percentage: u16,
        sent_time_us: u64,
        mut sink: F,
    ) -> Result<FrameSendSummary>
    where
        F: FnMut(Bytes),
    {
        let len = frame.payload.len();
        let layout = ShardLayout::for_frame(len, fec_percentage);
        assert!(
            layout.total_shards() <= FEC_SHARDS_MAX,
            "FEC layout {layout:?} exceeds {FEC_SHARDS_MAX} shards (fec {fec_percentage}%)"
        );

        let mut summary = FrameSendSummary {
            layout,
            packets: 0,
            bytes: 0,
            first_packet_counter: self.packet_counter,
        };
        if layout.data_shards == 0 {
            tracing::debug!(video_frame = frame.video_frame_index, "empty frame, nothing sent");
            return Ok(summary);
        }

        let block = layout.block_size;
        let data: Vec<Bytes> = (0..layout.data_shards)
            .map(|i| {
                let start = i * block;
                let end = (start + block).min(len);
                if end - start == block {
                    frame.payload.slice(start..end)
                } else {
                    let mut padded = BytesMut::zeroed(block);
                    padded[..end - start].copy_from_slice(&frame.payload[start..end]);
                    padded.freeze()
                }
            })
            .collect();
        let refs: Vec<&[u8]> = data.iter().map(|s| s.as_ref()).collect();
        let parity = self
            .codec
            .encode(layout.data_shards, layout.parity_shards, block, &refs)?;

        let mut header = VideoFrameHeader {
            packet_counter: 0,
            tracking_frame_index: frame.tracking_frame_index,
            video_frame_index: frame.video_frame_index,
            sent_time: sent_time_us,
            frame_byte_size: len as u32,
            fec_index: 0,
            fec_percentage,
        };

        for (shard_idx, shard) in data.iter().enumerate() {
            for pkt in 0..layout.shard_packets {
                let shard_offset = pkt * MAX_VIDEO_BUFFER_SIZE;
                let frame_offset = shard_idx * block + shard_offset;
                let n = len.saturating_sub(frame_offset).min(MAX_VIDEO_BUFFER_SIZE);
                header.fec_index = (shard_idx * layout.shard_packets + pkt) as u32;
                self.emit(
                    &mut header,
                    &shard[shard_offset..shard_offset + n],
                    &mut sink,
                    &mut summary,
                );
            }
        }

        for (parity_idx, shard) in parity.iter().enumerate() {
            let shard_idx = layout.data_shards + parity_idx;
            for pkt in 0..layout.shard_packets {
                let shard_offset = pkt * MAX_VIDEO_BUFFER_SIZE;
                header.fec_index = (shard_idx * layout.shard_packets + pkt) as u32;
                self.emit(
                    &mut header,
                    &shard[shard_offset..shard_offset + MAX_VIDEO_BUFFER_SIZE],
                    &mut sink,
                    &mut summary,
                );
            }
        }

        tracing::trace!(
            video_frame = frame.video_frame_index,
            len,
            data_shards = layout.data_shards,
            parity_shards = layout.parity_shards,
            shard_packets = layout.shard_packets,
            packets = summary.packets,
            "frame packetized"
        );
        Ok(summary)
    }

    fn emit<F: FnMut(Bytes)>(
        &mut self,
        header: &mut VideoFrameHeader,
        payload: &[u8],
        sink: &mut F,
        summary: &mut FrameSendSummary,
    ) {
        header.packet_counter = self.packet_counter;
        self.packet_counter = self.packet_counter.wrapping_add(1);
        let packet = encode_video_packet(header, payload);
        summary.packets += 1;
        summary.bytes += packet.len();
        self.packets_sent += 1;
        self.bytes_sent += packet.len() as u64;
        sink(packet);
    }

    /// Counter the next packet will carry.
    pub fn next_packet_counter(&self) -> u32 {
        self.packet_counter
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

// ─── Reassembler ────────────────────────────────────────────────────────────

/// A frame rebuilt from received packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledFrame {
    pub tracking_frame_index: u64,
    pub video_frame_index: u64,
    pub payload: Bytes,
    /// Whether parity was needed to rebuild it.
    pub recovered: bool,
}

struct PartialFrame {
    tracking_frame_index: u64,
    frame_byte_size: usize,
    fec_percentage: u16,
    layout: ShardLayout,
    shards: Vec<Vec<u8>>,
    /// Per shard, which of its packets arrived.
    received: Vec<Vec<bool>>,
    complete_shards: usize,
}

impl PartialFrame {
    fn new(header: &VideoFrameHeader, layout: ShardLayout) -> Self {
        let total = layout.total_shards();
        PartialFrame {
            tracking_frame_index: header.tracking_frame_index,
            frame_byte_size: header.frame_byte_size as usize,
            fec_percentage: header.fec_percentage,
            layout,
            shards: vec![vec![0u8; layout.block_size]; total],
            received: vec![vec![false; layout.shard_packets]; total],
            complete_shards: 0,
        }
    }

    fn insert(&mut self, fec_index: usize, payload: &[u8]) {
        let shard = fec_index / self.layout.shard_packets;
        let pkt = fec_index % self.layout.shard_packets;
        if self.received[shard][pkt] {
            return;
        }
        let offset = pkt * MAX_VIDEO_BUFFER_SIZE;
        self.shards[shard][offset..offset + payload.len()].copy_from_slice(payload);
        self.received[shard][pkt] = true;
        if self.received[shard].iter().all(|&r| r) {
            self.complete_shards += 1;
        }
    }

    fn shard_complete(&self, shard: usize) -> bool {
        self.received[shard].iter().all(|&r| r)
    }
}

/// Receiver-side frame reassembly with erasure recovery.
pub struct FrameReassembler<C: ErasureCodec = ReedSolomonCodec> {
    codec: C,
    max_pending: usize,
    pending: BTreeMap<u64, PartialFrame>,
    /// Frames at or below this index are finished or abandoned.
    last_finished: Option<u64>,
    frames_completed: u64,
    frames_recovered: u64,
    frames_failed: u64,
}

impl FrameReassembler<ReedSolomonCodec> {
    /// `max_pending` bounds how many incomplete frames are tracked at once.
    pub fn new(max_pending: usize) -> Self {
        Self::with_codec(ReedSolomonCodec, max_pending)
    }
}

impl<C: ErasureCodec> FrameReassembler<C> {
    pub fn with_codec(codec: C, max_pending: usize) -> Self {
        FrameReassembler {
            codec,
            max_pending: max_pending.max(1),
            pending: BTreeMap::new(),
            last_finished: None,
            frames_completed: 0,
            frames_recovered: 0,
            frames_failed: 0,
        }
    }

    /// Feed one received datagram. Returns the frame once it can be rebuilt.
    ///
    /// Malformed, duplicate and late packets are ignored.
    pub fn push(&mut self, packet: Bytes) -> Result<Option<ReassembledFrame>> {
        let Some((header, payload)) = decode_video_packet(packet) else {
            tracing::trace!("ignoring malformed video packet");
            return Ok(None);
        };
        let frame_idx = header.video_frame_index;
        if self.last_finished.is_some_and(|last| frame_idx <= last) {
            return Ok(None);
        }

        let layout = ShardLayout::for_frame(header.frame_byte_size as usize, header.fec_percentage);
        if layout.data_shards == 0
            || layout.total_shards() > FEC_SHARDS_MAX
            || header.fec_index as usize >= layout.packet_count()
        {
            tracing::debug!(frame = frame_idx, fec_index = header.fec_index, "video packet outside frame layout");
            return Ok(None);
        }

        let partial = self
            .pending
            .entry(frame_idx)
            .or_insert_with(|| PartialFrame::new(&header, layout));
        if partial.frame_byte_size != header.frame_byte_size as usize
            || partial.fec_percentage != header.fec_percentage
        {
            tracing::debug!(frame = frame_idx, "inconsistent header within frame");
            return Ok(None);
        }
        partial.insert(header.fec_index as usize, &payload);

        if partial.complete_shards < partial.layout.data_shards {
            self.evict_overflow();
            return Ok(None);
        }

        let Some(partial) = self.pending.remove(&frame_idx) else {
            return Ok(None);
        };
        let frame = self.rebuild(frame_idx, partial);
        self.finish(frame_idx);
        frame.map(Some)
    }

    fn rebuild(&mut self, frame_idx: u64, partial: PartialFrame) -> Result<ReassembledFrame> {
        let layout = partial.layout;
        let complete: Vec<bool> = (0..layout.total_shards())
            .map(|s| partial.shard_complete(s))
            .collect();
        let recovered = complete[..layout.data_shards].iter().any(|c| !c);

        let mut slots: Vec<Option<Vec<u8>>> = partial
            .shards
            .into_iter()
            .zip(complete)
            .map(|(shard, ok)| ok.then_some(shard))
            .collect();
        if let Err(e) = self.codec.reconstruct(
            layout.data_shards,
            layout.parity_shards,
            layout.block_size,
            &mut slots,
        ) {
            self.frames_failed += 1;
            return Err(e);
        }

        let mut out = BytesMut::with_capacity(layout.data_shards * layout.block_size);
        for shard in slots.into_iter().take(layout.data_shards).flatten() {
            out.extend_from_slice(&shard);
        }
        out.truncate(partial.frame_byte_size);

        self.frames_completed += 1;
        if recovered {
            self.frames_recovered += 1;
            tracing::debug!(frame = frame_idx, "frame rebuilt from parity");
        }
        Ok(ReassembledFrame {
            tracking_frame_index: partial.tracking_frame_index,
            video_frame_index: frame_idx,
            payload: out.freeze(),
            recovered,
        })
    }

    /// Mark `frame_idx` done and abandon every older incomplete frame.
    fn finish(&mut self, frame_idx: u64) {
        let newer = match frame_idx.checked_add(1) {
            Some(next) => self.pending.split_off(&next),
            None => BTreeMap::new(),
        };
        let abandoned = std::mem::replace(&mut self.pending, newer);
        self.frames_failed += abandoned.len() as u64;
        self.last_finished = Some(frame_idx);
    }

    fn evict_overflow(&mut self) {
        while self.pending.len() > self.max_pending {
            if let Some((idx, _)) = self.pending.pop_first() {
                tracing::debug!(frame = idx, "dropping incomplete frame");
                self.frames_failed += 1;
                self.last_finished = Some(self.last_finished.map_or(idx, |l| l.max(idx)));
            }
        }
    }

    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    /// Frames that needed parity to rebuild.
    pub fn frames_recovered(&self) -> u64 {
        self.frames_recovered
    }

    /// Frames abandoned or unrecoverable.
    pub fn frames_failed(&self) -> u64 {
        self.frames_failed
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }
}
