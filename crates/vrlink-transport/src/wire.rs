//! # vrlink Wire Format
//!
//! Fixed-size little-endian headers. Every message starts with a `u32`
//! packet type; there is no implicit padding between fields.
//!
//! ## Video Frame Packet (42-byte header + payload)
//!
//! ```text
//!  0       4       8               16              24              32      36      40  42
//! +-------+-------+---------------+---------------+---------------+-------+-------+---+---------
//! | type  |counter| trackingFrame | videoFrame    | sentTime (µs) | frame | fec   |fec| payload
//! | (=9)  |  u32  | Index  u64    | Index  u64    |      u64      | bytes | index | % | ≤1358 B
//! +-------+-------+---------------+---------------+---------------+-------+-------+---+---------
//! ```
//!
//! Encode/decode are written field by field so the byte layout never depends
//! on Rust struct layout. Decoders return `None` on short buffers or a
//! mismatched type tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version. Peers with a different version are rejected before a
/// session is created.
pub const PROTOCOL_VERSION: u32 = 17;

/// UDP payload budget for a single packet.
pub const MAX_PACKET_SIZE: usize = 1400;

/// Encoded size of [`VideoFrameHeader`].
pub const VIDEO_FRAME_HEADER_SIZE: usize = 42;

/// Payload bytes available in a video packet after the header.
pub const MAX_VIDEO_BUFFER_SIZE: usize = MAX_PACKET_SIZE - VIDEO_FRAME_HEADER_SIZE;

/// Shard ceiling of the erasure codec (data + parity).
pub const FEC_SHARDS_MAX: usize = 20;

// ─── Packet Type ─────────────────────────────────────────────────────────────

/// Leading `u32` of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    HelloMessage = 1,
    ConnectionMessage = 2,
    RecoverConnection = 3,
    BroadcastRequest = 4,
    StreamControl = 5,
    TrackingInfo = 6,
    TimeSync = 7,
    ChangeSettings = 8,
    VideoFrame = 9,
    AudioFrameStart = 10,
    AudioFrame = 11,
    PacketErrorReport = 12,
    Haptics = 13,
}

impl PacketType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(PacketType::HelloMessage),
            2 => Some(PacketType::ConnectionMessage),
            3 => Some(PacketType::RecoverConnection),
            4 => Some(PacketType::BroadcastRequest),
            5 => Some(PacketType::StreamControl),
            6 => Some(PacketType::TrackingInfo),
            7 => Some(PacketType::TimeSync),
            8 => Some(PacketType::ChangeSettings),
            9 => Some(PacketType::VideoFrame),
            10 => Some(PacketType::AudioFrameStart),
            11 => Some(PacketType::AudioFrame),
            12 => Some(PacketType::PacketErrorReport),
            13 => Some(PacketType::Haptics),
            _ => None,
        }
    }
}

/// Read the packet type without consuming the buffer.
pub fn peek_packet_type(buf: &[u8]) -> Option<PacketType> {
    if buf.len() < 4 {
        return None;
    }
    PacketType::from_u32(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// Returns `true` if the peer speaks the same protocol version.
pub fn check_protocol_version(peer_version: u32) -> bool {
    peer_version == PROTOCOL_VERSION
}

/// Consume and verify the leading type tag.
fn expect_type(buf: &mut impl Buf, expected: PacketType, size: usize) -> Option<()> {
    if buf.remaining() < size {
        return None;
    }
    if buf.get_u32_le() != expected as u32 {
        return None;
    }
    Some(())
}

// ─── Video Frame ─────────────────────────────────────────────────────────────

/// Header carried by every FEC shard packet of a video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrameHeader {
    /// Global send counter, one per packet across all frames.
    pub packet_counter: u32,
    /// Target timestamp of the tracking pose the frame was rendered with (ns).
    pub tracking_frame_index: u64,
    /// Encoder output sequence.
    pub video_frame_index: u64,
    /// Server clock at send time (µs).
    pub sent_time: u64,
    /// Length of the unpadded frame.
    pub frame_byte_size: u32,
    /// Position within the frame's `(shard, shardPacket)` sequence.
    pub fec_index: u32,
    /// FEC percentage the frame was encoded with.
    pub fec_percentage: u16,
}

impl VideoFrameHeader {
    pub const ENCODED_LEN: usize = VIDEO_FRAME_HEADER_SIZE;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(PacketType::VideoFrame as u32);
        buf.put_u32_le(self.packet_counter);
        buf.put_u64_le(self.tracking_frame_index);
        buf.put_u64_le(self.video_frame_index);
        buf.put_u64_le(self.sent_time);
        buf.put_u32_le(self.frame_byte_size);
        buf.put_u32_le(self.fec_index);
        buf.put_u16_le(self.fec_percentage);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        expect_type(buf, PacketType::VideoFrame, Self::ENCODED_LEN)?;
        Some(VideoFrameHeader {
            packet_counter: buf.get_u32_le(),
            tracking_frame_index: buf.get_u64_le(),
            video_frame_index: buf.get_u64_le(),
            sent_time: buf.get_u64_le(),
            frame_byte_size: buf.get_u32_le(),
            fec_index: buf.get_u32_le(),
            fec_percentage: buf.get_u16_le(),
        })
    }
}

/// Build a complete video packet (header + payload).
pub fn encode_video_packet(header: &VideoFrameHeader, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_VIDEO_BUFFER_SIZE);
    let mut buf = BytesMut::with_capacity(VideoFrameHeader::ENCODED_LEN + payload.len());
    header.encode(&mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Split a received video packet into header and payload (zero-copy).
pub fn decode_video_packet(mut packet: Bytes) -> Option<(VideoFrameHeader, Bytes)> {
    let header = VideoFrameHeader::decode(&mut packet)?;
    if packet.len() > MAX_VIDEO_BUFFER_SIZE {
        return None;
    }
    Some((header, packet))
}

// ─── Packet Error Report ────────────────────────────────────────────────────

/// Which stream the client lost data on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LostFrameType {
    Video = 0,
    Audio = 1,
}

/// Client → server loss report covering a packet-counter range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketErrorReport {
    /// Raw lost-frame type; see [`PacketErrorReport::lost_frame_type`].
    pub lost_frame_type: u32,
    pub from_packet_counter: u32,
    pub to_packet_counter: u32,
}

impl PacketErrorReport {
    pub const ENCODED_LEN: usize = 16;

    pub fn lost_frame_type(&self) -> Option<LostFrameType> {
        match self.lost_frame_type {
            0 => Some(LostFrameType::Video),
            1 => Some(LostFrameType::Audio),
            _ => None,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(PacketType::PacketErrorReport as u32);
        buf.put_u32_le(self.lost_frame_type);
        buf.put_u32_le(self.from_packet_counter);
        buf.put_u32_le(self.to_packet_counter);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        expect_type(buf, PacketType::PacketErrorReport, Self::ENCODED_LEN)?;
        Some(PacketErrorReport {
            lost_frame_type: buf.get_u32_le(),
            from_packet_counter: buf.get_u32_le(),
            to_packet_counter: buf.get_u32_le(),
        })
    }
}

// ─── Time Sync ──────────────────────────────────────────────────────────────

/// Time-sync exchange mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TimeSyncMode {
    /// Client → server: client clock plus loss/latency statistics.
    ClientReport = 0,
    /// Server → client: echo carrying the server clock.
    ServerEcho = 1,
    /// Client → server: completes the round trip.
    ClientEcho = 2,
}

impl TimeSyncMode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(TimeSyncMode::ClientReport),
            1 => Some(TimeSyncMode::ServerEcho),
            2 => Some(TimeSyncMode::ClientEcho),
            _ => None,
        }
    }
}

/// Client-side statistics carried by mode-0 samples. All latencies in µs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ClientStats {
    pub packets_lost_total: u64,
    pub packets_lost_in_second: u64,
    pub average_total_latency: u32,
    pub max_total_latency: u32,
    pub min_total_latency: u32,
    pub average_transport_latency: u32,
    pub max_transport_latency: u32,
    pub min_transport_latency: u32,
    pub average_decode_latency: u32,
    pub max_decode_latency: u32,
    pub min_decode_latency: u32,
    /// Non-zero when the client failed to reconstruct a frame.
    pub fec_failure: u32,
    pub fec_failure_in_second: u64,
    pub fec_failure_total: u64,
    pub fps: u32,
}

/// Clock-sync sample exchanged in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSync {
    pub mode: u32,
    pub sequence: u64,
    pub server_time: u64,
    pub client_time: u64,
    /// Filled by the client only when `mode == 0`.
    pub stats: ClientStats,
}

impl TimeSync {
    pub const ENCODED_LEN: usize = 108;

    pub fn mode(&self) -> Option<TimeSyncMode> {
        TimeSyncMode::from_u32(self.mode)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let s = &self.stats;
        buf.put_u32_le(PacketType::TimeSync as u32);
        buf.put_u32_le(self.mode);
        buf.put_u64_le(self.sequence);
        buf.put_u64_le(self.server_time);
        buf.put_u64_le(self.client_time);
        buf.put_u64_le(s.packets_lost_total);
        buf.put_u64_le(s.packets_lost_in_second);
        buf.put_u32_le(s.average_total_latency);
        buf.put_u32_le(s.max_total_latency);
        buf.put_u32_le(s.min_total_latency);
        buf.put_u32_le(s.average_transport_latency);
        buf.put_u32_le(s.max_transport_latency);
        buf.put_u32_le(s.min_transport_latency);
        buf.put_u32_le(s.average_decode_latency);
        buf.put_u32_le(s.max_decode_latency);
        buf.put_u32_le(s.min_decode_latency);
        buf.put_u32_le(s.fec_failure);
        buf.put_u64_le(s.fec_failure_in_second);
        buf.put_u64_le(s.fec_failure_total);
        buf.put_u32_le(s.fps);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        expect_type(buf, PacketType::TimeSync, Self::ENCODED_LEN)?;
        let mode = buf.get_u32_le();
        let sequence = buf.get_u64_le();
        let server_time = buf.get_u64_le();
        let client_time = buf.get_u64_le();
        let stats = ClientStats {
            packets_lost_total: buf.get_u64_le(),
            packets_lost_in_second: buf.get_u64_le(),
            average_total_latency: buf.get_u32_le(),
            max_total_latency: buf.get_u32_le(),
            min_total_latency: buf.get_u32_le(),
            average_transport_latency: buf.get_u32_le(),
            max_transport_latency: buf.get_u32_le(),
            min_transport_latency: buf.get_u32_le(),
            average_decode_latency: buf.get_u32_le(),
            max_decode_latency: buf.get_u32_le(),
            min_decode_latency: buf.get_u32_le(),
            fec_failure: buf.get_u32_le(),
            fec_failure_in_second: buf.get_u64_le(),
            fec_failure_total: buf.get_u64_le(),
            fps: buf.get_u32_le(),
        };
        Some(TimeSync {
            mode,
            sequence,
            server_time,
            client_time,
            stats,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }
}

// ─── Haptics ────────────────────────────────────────────────────────────────

/// Server → client vibration request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HapticsFeedback {
    /// Delay from receipt until the pulse starts (µs).
    pub start_time: u64,
    pub amplitude: f32,
    /// Seconds.
    pub duration: f32,
    /// Hz.
    pub frequency: f32,
    /// 0 = right, 1 = left.
    pub hand: u8,
}

impl HapticsFeedback {
    pub const ENCODED_LEN: usize = 29;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(PacketType::Haptics as u32);
        buf.put_u64_le(self.start_time);
        buf.put_f32_le(self.amplitude);
        buf.put_f32_le(self.duration);
        buf.put_f32_le(self.frequency);
        buf.put_u8(self.hand);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        expect_type(buf, PacketType::Haptics, Self::ENCODED_LEN)?;
        Some(HapticsFeedback {
            start_time: buf.get_u64_le(),
            amplitude: buf.get_f32_le(),
            duration: buf.get_f32_le(),
            frequency: buf.get_f32_le(),
            hand: buf.get_u8(),
        })
    }
}

// ─── Stream Control ─────────────────────────────────────────────────────────

/// Client request to start or stop streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Start,
    Stop,
}

impl StreamControl {
    pub const ENCODED_LEN: usize = 8;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(PacketType::StreamControl as u32);
        buf.put_u32_le(match self {
            StreamControl::Start => 1,
            StreamControl::Stop => 2,
        });
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        expect_type(buf, PacketType::StreamControl, Self::ENCODED_LEN)?;
        match buf.get_u32_le() {
            1 => Some(StreamControl::Start),
            2 => Some(StreamControl::Stop),
            _ => None,
        }
    }
}

// ─── Audio ──────────────────────────────────────────────────────────────────

/// First fragment of an audio buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrameStart {
    pub packet_counter: u32,
    pub presentation_time: u64,
    pub frame_byte_size: u32,
}

impl AudioFrameStart {
    pub const ENCODED_LEN: usize = 20;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(PacketType::AudioFrameStart as u32);
        buf.put_u32_le(self.packet_counter);
        buf.put_u64_le(self.presentation_time);
        buf.put_u32_le(self.frame_byte_size);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        expect_type(buf, PacketType::AudioFrameStart, Self::ENCODED_LEN)?;
        Some(AudioFrameStart {
            packet_counter: buf.get_u32_le(),
            presentation_time: buf.get_u64_le(),
            frame_byte_size: buf.get_u32_le(),
        })
    }
}

/// Continuation fragment of an audio buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrame {
    pub packet_counter: u32,
}

impl AudioFrame {
    pub const ENCODED_LEN: usize = 8;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(PacketType::AudioFrame as u32);
        buf.put_u32_le(self.packet_counter);
    }

    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        expect_type(buf, PacketType::AudioFrame, Self::ENCODED_LEN)?;
        Some(AudioFrame {
            packet_counter: buf.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_buffer_size_matches_header() {
        assert_eq!(MAX_VIDEO_BUFFER_SIZE, 1358);
        let mut buf = BytesMut::new();
        VideoFrameHeader {
            packet_counter: 0,
            tracking_frame_index: 0,
            video_frame_index: 0,
            sent_time: 0,
            frame_byte_size: 0,
            fec_index: 0,
            fec_percentage: 0,
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), VIDEO_FRAME_HEADER_SIZE);
    }

    // ─── Golden bytes ───────────────────────────────────────────────────

    #[test]
    fn video_header_golden_bytes() {
        let hdr = VideoFrameHeader {
            packet_counter: 0x0403_0201,
            tracking_frame_index: 0x1112_1314_1516_1718,
            video_frame_index: 7,
            sent_time: 0xAABB,
            frame_byte_size: 14000,
            fec_index: 3,
            fec_percentage: 5,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);

        #[rustfmt::skip]
        let expected: [u8; 42] = [
            9, 0, 0, 0,
            0x01, 0x02, 0x03, 0x04,
            0x18, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x11,
            7, 0, 0, 0, 0, 0, 0, 0,
            0xBB, 0xAA, 0, 0, 0, 0, 0, 0,
            0xB0, 0x36, 0, 0,
            3, 0, 0, 0,
            5, 0,
        ];
        assert_eq!(&buf[..], &expected[..]);

        let decoded = VideoFrameHeader::decode(&mut &expected[..]).unwrap();
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn packet_error_report_golden_bytes() {
        let report = PacketErrorReport {
            lost_frame_type: LostFrameType::Video as u32,
            from_packet_counter: 100,
            to_packet_counter: 0x0102,
        };
        let mut buf = BytesMut::new();
        report.encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[12, 0, 0, 0, 0, 0, 0, 0, 100, 0, 0, 0, 0x02, 0x01, 0, 0][..]
        );
        let decoded = PacketErrorReport::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.lost_frame_type(), Some(LostFrameType::Video));
    }

    #[test]
    fn time_sync_layout() {
        let sample = TimeSync {
            mode: 2,
            sequence: 1,
            server_time: 0x0102_0304,
            client_time: 5,
            stats: ClientStats {
                fec_failure: 1,
                fps: 72,
                ..Default::default()
            },
        };
        let bytes = sample.to_bytes();
        assert_eq!(bytes.len(), TimeSync::ENCODED_LEN);
        assert_eq!(&bytes[0..8], &[7, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(&bytes[16..20], &[0x04, 0x03, 0x02, 0x01]);
        // fecFailure sits after 32 header + 16 loss + 36 latency bytes.
        assert_eq!(&bytes[84..88], &[1, 0, 0, 0]);
        assert_eq!(&bytes[104..108], &[72, 0, 0, 0]);

        let decoded = TimeSync::decode(&mut bytes.clone()).unwrap();
        assert_eq!(decoded, sample);
        assert_eq!(decoded.mode(), Some(TimeSyncMode::ClientEcho));
    }

    #[test]
    fn haptics_golden_bytes() {
        let h = HapticsFeedback {
            start_time: 0,
            amplitude: 1.0,
            duration: 0.5,
            frequency: 0.0,
            hand: 1,
        };
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), HapticsFeedback::ENCODED_LEN);
        assert_eq!(&buf[0..4], &[13, 0, 0, 0]);
        assert_eq!(&buf[12..16], &1.0f32.to_le_bytes());
        assert_eq!(&buf[16..20], &0.5f32.to_le_bytes());
        assert_eq!(buf[28], 1);
        assert_eq!(HapticsFeedback::decode(&mut buf.freeze()), Some(h));
    }

    #[test]
    fn stream_control_and_audio_golden_bytes() {
        let mut buf = BytesMut::new();
        StreamControl::Stop.encode(&mut buf);
        assert_eq!(&buf[..], &[5, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(
            StreamControl::decode(&mut buf.freeze()),
            Some(StreamControl::Stop)
        );

        let mut buf = BytesMut::new();
        AudioFrameStart {
            packet_counter: 1,
            presentation_time: 2,
            frame_byte_size: 3,
        }
        .encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[10, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0][..]
        );

        let mut buf = BytesMut::new();
        AudioFrame { packet_counter: 9 }.encode(&mut buf);
        assert_eq!(&buf[..], &[11, 0, 0, 0, 9, 0, 0, 0]);
    }

    // ─── Malformed input ────────────────────────────────────────────────

    #[test]
    fn truncated_or_mistyped_rejected() {
        let mut buf = BytesMut::new();
        PacketErrorReport {
            lost_frame_type: 0,
            from_packet_counter: 1,
            to_packet_counter: 2,
        }
        .encode(&mut buf);
        let full = buf.freeze();

        assert!(PacketErrorReport::decode(&mut full.slice(..15)).is_none());
        assert!(TimeSync::decode(&mut full.clone()).is_none());
        assert!(StreamControl::decode(&mut &[5u8, 0, 0, 0, 9, 0, 0, 0][..]).is_none());
        assert!(peek_packet_type(&[1, 2]).is_none());
        assert!(peek_packet_type(&[200, 0, 0, 0]).is_none());
        assert_eq!(peek_packet_type(&full), Some(PacketType::PacketErrorReport));
    }

    #[test]
    fn video_packet_split_is_zero_copy() {
        let hdr = VideoFrameHeader {
            packet_counter: 1,
            tracking_frame_index: 2,
            video_frame_index: 3,
            sent_time: 4,
            frame_byte_size: 5,
            fec_index: 0,
            fec_percentage: 5,
        };
        let pkt = encode_video_packet(&hdr, b"hello");
        assert_eq!(pkt.len(), VIDEO_FRAME_HEADER_SIZE + 5);
        let (decoded, payload) = decode_video_packet(pkt).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn protocol_version_check() {
        assert!(check_protocol_version(PROTOCOL_VERSION));
        assert!(!check_protocol_version(PROTOCOL_VERSION - 1));
    }
}
