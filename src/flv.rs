use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::error::RtmpError;
use crate::message::{MessageType, RtmpMessage};

pub const FLV_TAG_HEADER_SIZE: usize = 11;

/// The 13-byte FLV file header prepended to the first played-back tag.
const FLV_FILE_HEADER: [u8; 13] = [
    0x46, 0x4c, 0x56, 0x01, 0x01, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

/// Parsed 11-byte FLV tag header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlvTagHeader {
    pub tag_type: u8,
    pub payload_size: u32,
    pub timestamp: u32,
    /// Header, payload and the trailing previous-tag-size word.
    pub total_size: usize,
}

impl FlvTagHeader {
    pub fn parse(data: &[u8]) -> Option<FlvTagHeader> {
        if data.len() < FLV_TAG_HEADER_SIZE {
            return None;
        }

        let payload_size = u32::from_be_bytes([0, data[1], data[2], data[3]]);
        let mut timestamp = u32::from_be_bytes([0, data[4], data[5], data[6]]);
        timestamp |= (data[7] as u32) << 24;

        // the StreamID field is skipped; it is always zero in FLV files and
        // aggregates carry the stream id on the outer message

        Some(FlvTagHeader {
            tag_type: data[0],
            payload_size,
            timestamp,
            total_size: FLV_TAG_HEADER_SIZE + payload_size as usize + 4,
        })
    }
}

/// Publish-side adapter turning FLV-muxed buffers into RTMP messages.
///
/// Keeps a running timestamp base so that the 32-bit FLV timestamps, which
/// roll over after about 49 days, map onto a monotonic 64-bit timeline.
#[derive(Debug, Default)]
pub struct FlvToRtmp {
    base_ts: u64,
    last_ts: u64,
}

impl FlvToRtmp {
    pub fn new() -> FlvToRtmp {
        FlvToRtmp::default()
    }

    /// Convert one FLV buffer into a message. Returns `Ok(None)` for the
    /// FLV file header, which carries no media. The message stream id is
    /// left at zero; it is patched in at enqueue time.
    pub fn buffer_to_message(&mut self, data: &[u8]) -> Result<Option<RtmpMessage>, RtmpError> {
        if data.len() >= 4 && data.starts_with(b"FLV") {
            debug!("ignoring FLV file header");
            return Ok(None);
        }

        let header = FlvTagHeader::parse(data).ok_or_else(|| {
            RtmpError::InvalidData(format!("buffer too small for tag header: {}", data.len()))
        })?;

        if data.len() < header.total_size {
            return Err(RtmpError::InvalidData(format!(
                "buffer too small for tag body: buffer {}, tag {}",
                data.len(),
                header.total_size
            )));
        }

        let mut timestamp = header.timestamp as u64;
        if timestamp + self.base_ts + (i32::MAX as u64) < self.last_ts {
            warn!(
                from = self.last_ts,
                to = timestamp + self.base_ts,
                "timestamp regression; assuming overflow"
            );
            self.base_ts += u32::MAX as u64;
            self.base_ts += 1;
        } else if timestamp + self.base_ts > self.last_ts + i32::MAX as u64 {
            warn!(
                from = self.last_ts,
                to = timestamp + self.base_ts,
                "timestamp jump; assuming underflow"
            );
            if self.base_ts > 0 {
                self.base_ts -= u32::MAX as u64;
                self.base_ts -= 1;
            } else {
                warn!("cannot regress further; forcing timestamp to zero");
                timestamp = 0;
            }
        }
        timestamp += self.base_ts;
        self.last_ts = timestamp;

        let (message_type, cstream) = match MessageType::from_raw(header.tag_type) {
            MessageType::DataAmf0 => (MessageType::DataAmf0, 4),
            MessageType::Audio => (MessageType::Audio, 5),
            MessageType::Video => (MessageType::Video, 6),
            other => {
                return Err(RtmpError::InvalidData(format!(
                    "unknown tag type {}",
                    other.into_raw()
                )));
            }
        };

        let payload = Bytes::copy_from_slice(
            &data[FLV_TAG_HEADER_SIZE..FLV_TAG_HEADER_SIZE + header.payload_size as usize],
        );

        let mut message = RtmpMessage::new(message_type, cstream, 0, payload);
        message.dts = timestamp as i64;

        Ok(Some(message))
    }
}

/// Play-side adapter wrapping RTMP media messages back into FLV tags.
#[derive(Debug, Default)]
pub struct RtmpToFlv {
    sent_header: bool,
    last_ts: Option<i64>,
}

impl RtmpToFlv {
    pub fn new() -> RtmpToFlv {
        RtmpToFlv::default()
    }

    /// Re-frame a media message as an FLV tag, prepending the FLV file
    /// header on the first tag. Messages of the wrong type or below the
    /// minimum payload size for their type are dropped.
    pub fn message_to_buffer(&mut self, message: &RtmpMessage) -> Option<Bytes> {
        let min_size = match message.message_type {
            MessageType::Video => 6,
            MessageType::Audio => 2,
            MessageType::DataAmf0 => 1,
            _ => {
                debug!(ty = ?message.message_type, "ignoring message, wrong type");
                return None;
            }
        };

        if message.size() < min_size {
            debug!(
                size = message.size(),
                min_size,
                "ignoring too small message"
            );
            return None;
        }

        if let Some(last_ts) = self.last_ts {
            if last_ts > message.dts {
                trace!(last_ts, dts = message.dts, "timestamp regression");
            }
        }
        self.last_ts = Some(message.dts);

        let timestamp = message.dts as u32;
        let mut out = BytesMut::with_capacity(
            FLV_FILE_HEADER.len() + FLV_TAG_HEADER_SIZE + message.payload.len() + 4,
        );

        if !self.sent_header {
            out.put_slice(&FLV_FILE_HEADER);
            self.sent_header = true;
        }

        out.put_u8(message.message_type.into_raw());
        out.put_slice(&message.size().to_be_bytes()[1..4]);
        out.put_slice(&timestamp.to_be_bytes()[1..4]);
        out.put_u8((timestamp >> 24) as u8);
        out.put_slice(&[0, 0, 0]);
        out.put_slice(&message.payload);
        out.put_u32(message.size() + FLV_TAG_HEADER_SIZE as u32);

        Some(out.freeze())
    }
}

/// Split an Aggregate message into its FLV-framed submessages.
///
/// The payload is a packed FLV tag stream; each sub-tag becomes a message
/// with the aggregate's stream ids, its timestamp offset from the first
/// sub-tag, and the DISCONT flag only on the first.
pub(crate) fn split_aggregate(message: &RtmpMessage) -> Vec<RtmpMessage> {
    let data = &message.payload;
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut first_ts = 0u32;

    trace!(size = data.len(), "splitting aggregate message");

    while pos < data.len() {
        let remaining = &data[pos..];

        let Some(header) = FlvTagHeader::parse(remaining) else {
            error!(
                got = remaining.len(),
                "aggregate contains incomplete header"
            );
            break;
        };

        if remaining.len() < header.total_size {
            error!(
                want = header.total_size,
                got = remaining.len(),
                "aggregate contains incomplete message"
            );
            break;
        }

        let payload = message
            .payload
            .slice(pos + FLV_TAG_HEADER_SIZE..pos + FLV_TAG_HEADER_SIZE + header.payload_size as usize);

        let mut sub = RtmpMessage::new(
            MessageType::from_raw(header.tag_type),
            message.cstream,
            message.mstream,
            payload,
        );
        sub.dts = message.dts;
        sub.ts_delta = message.ts_delta;
        sub.discont = message.discont;

        if pos == 0 {
            first_ts = header.timestamp;
        } else {
            let ts_offset = header.timestamp.wrapping_sub(first_ts);
            sub.ts_delta = sub.ts_delta.wrapping_add(ts_offset);
            sub.dts += ts_offset as i64;
            sub.discont = false;
        }

        out.push(sub);
        pos += header.total_size;
    }

    out
}
