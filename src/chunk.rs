use bytes::{BufMut, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::error::RtmpError;
use crate::message::{MAXIMUM_MESSAGE_SIZE, MessageType, RtmpMessage};

const CHUNK_BYTE_TWOBYTE: u8 = 0;
const CHUNK_BYTE_THREEBYTE: u8 = 1;
const CHUNK_BYTE_MASK: u8 = 0x3f;
const CHUNK_STREAM_MIN_TWOBYTE: u32 = 0x40;
const CHUNK_STREAM_MIN_THREEBYTE: u32 = 0x140;
pub(crate) const CHUNK_STREAM_MAX_THREEBYTE: u32 = 0x1003f;

/// Message header sizes for chunk types 0 through 3.
const CHUNK_HEADER_SIZES: [usize; 4] = [11, 7, 3, 0];

const EXT_TIMESTAMP: u32 = 0xff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkType {
    Type0 = 0,
    Type1 = 1,
    Type2 = 2,
    Type3 = 3,
}

impl ChunkType {
    fn from_byte(byte: u8) -> ChunkType {
        match byte >> 6 {
            0 => ChunkType::Type0,
            1 => ChunkType::Type1,
            2 => ChunkType::Type2,
            _ => ChunkType::Type3,
        }
    }

    fn header_size(self) -> usize {
        CHUNK_HEADER_SIZES[self as usize]
    }
}

/// Result of scanning the basic header for a chunk stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdParse {
    Id(u32),
    /// Not enough input; this many bytes are required.
    NeedBytes(usize),
}

/// Parse the chunk stream id out of a basic header.
pub(crate) fn parse_id(data: &[u8]) -> IdParse {
    if data.is_empty() {
        return IdParse::NeedBytes(1);
    }

    match data[0] & CHUNK_BYTE_MASK {
        CHUNK_BYTE_TWOBYTE => {
            if data.len() < 2 {
                return IdParse::NeedBytes(2);
            }
            IdParse::Id(data[1] as u32 + CHUNK_STREAM_MIN_TWOBYTE)
        }
        CHUNK_BYTE_THREEBYTE => {
            if data.len() < 3 {
                return IdParse::NeedBytes(3);
            }
            IdParse::Id(u16::from_le_bytes([data[1], data[2]]) as u32 + CHUNK_STREAM_MIN_TWOBYTE)
        }
        n => IdParse::Id(n as u32),
    }
}

/// Cumulative per-chunk-stream message state. Fields inherited by
/// compressed headers persist across messages.
#[derive(Debug, Default, Clone)]
struct MessageState {
    mstream: u32,
    type_raw: u8,
    size: u32,
    /// Timestamp field of the last header; a delta, or an absolute value
    /// when the last full header carried one.
    ts_delta: u32,
    /// Running decode timestamp in milliseconds.
    dts: i64,
    discont: bool,
    /// Assembly buffer; present once payload bytes have started arriving.
    buf: Option<BytesMut>,
}

/// One chunk stream: parsing or serialization state for a single id.
#[derive(Debug)]
pub(crate) struct ChunkStream {
    id: u32,
    state: Option<MessageState>,
    offset: u32,
    bytes: u64,
}

impl ChunkStream {
    fn new(id: u32) -> ChunkStream {
        ChunkStream {
            id,
            state: None,
            offset: 0,
            bytes: 0,
        }
    }

    fn is_open(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.buf.is_some())
    }

    fn next_size(&self, chunk_size: u32) -> u32 {
        let size = self.state.as_ref().map(|s| s.size).unwrap_or(0);
        debug_assert!(self.offset <= size);
        (size - self.offset).min(chunk_size)
    }

    /// Parse a chunk header at the start of `data`.
    ///
    /// Returns the total header size. When `data` is shorter than the
    /// returned count, nothing was consumed and the caller must retry with
    /// more input.
    pub(crate) fn parse_header(&mut self, data: &[u8]) -> usize {
        let fmt = ChunkType::from_byte(data[0]);
        trace!(id = self.id, ty = fmt as usize, "parsing chunk header");

        let basic_size = match data[0] & CHUNK_BYTE_MASK {
            CHUNK_BYTE_TWOBYTE => 2,
            CHUNK_BYTE_THREEBYTE => 3,
            _ => 1,
        };

        let mut header_size = basic_size + fmt.header_size();

        if self.state.is_none() {
            debug!(id = self.id, "starting parse on new chunk stream");
            self.state = Some(MessageState {
                discont: true,
                ..Default::default()
            });
        }

        if data.len() < header_size {
            return header_size;
        }

        let message_header = &data[basic_size..];
        let state = self.state.as_mut().unwrap();
        let mut has_abs_timestamp = false;

        // cumulative field inheritance: each type updates a prefix of the
        // fields and keeps the rest from the previous header
        if fmt == ChunkType::Type0 {
            has_abs_timestamp = true;
            // message stream id is stored in little-endian format
            state.mstream = u32::from_le_bytes([
                message_header[7],
                message_header[8],
                message_header[9],
                message_header[10],
            ]);
        }
        if matches!(fmt, ChunkType::Type0 | ChunkType::Type1) {
            state.size = read_u24(&message_header[3..]);
            state.type_raw = message_header[6];
        }
        if fmt != ChunkType::Type3 {
            state.ts_delta = read_u24(message_header);
        }

        if state.ts_delta >= EXT_TIMESTAMP {
            if data.len() < header_size + 4 {
                return header_size + 4;
            }

            let timestamp = u32::from_be_bytes([
                data[header_size],
                data[header_size + 1],
                data[header_size + 2],
                data[header_size + 3],
            ]);

            if fmt == ChunkType::Type3 && state.ts_delta != timestamp {
                warn!(
                    want = state.ts_delta,
                    got = timestamp,
                    "type 3 extended timestamp does not match expected timestamp; \
                     assuming it's not present"
                );
            } else {
                state.ts_delta = timestamp;
                header_size += 4;
            }
        }

        if self.is_open() {
            trace!("message payload already started; not touching timestamp");
            return header_size;
        }

        let state = self.state.as_mut().unwrap();
        let (delta_32, abs_32) = if has_abs_timestamp {
            let abs = state.ts_delta;
            (abs.wrapping_sub(state.dts as u32), abs)
        } else {
            let delta = state.ts_delta;
            (delta, delta.wrapping_add(state.dts as u32))
        };

        trace!(delta = delta_32, abs = abs_32, "timestamp fields");

        // emulate signed 32-bit overflow
        let mut delta_64 = delta_32 as i64;
        if delta_64 > i32::MAX as i64 {
            delta_64 -= u32::MAX as i64;
            delta_64 -= 1;
        }

        if delta_64 >= 0 {
            // normal advancement
        } else if -delta_64 <= state.dts {
            warn!(delta_ms = delta_64, "timestamp regression");
        } else {
            warn!(delta_ms = delta_64, "timestamp regression out of bounds, offsetting");
            delta_64 = delta_32 as i64;
        }

        state.dts += delta_64;
        trace!(dts = state.dts, "adjusted message timestamp");

        header_size
    }

    /// The payload byte count the current chunk will carry. Allocates the
    /// assembly buffer on the first call for a message.
    pub(crate) fn parse_payload(&mut self, chunk_size: u32) -> u32 {
        let state = self.state.as_mut().expect("header parsed first");

        if state.buf.is_none() {
            if state.size > MAXIMUM_MESSAGE_SIZE {
                error!(size = state.size, "message size exceeds maximum, clamping");
                state.size = MAXIMUM_MESSAGE_SIZE;
            }
            trace!(size = state.size, "allocating message buffer");
            state.buf = Some(BytesMut::with_capacity(state.size as usize));
        }

        self.next_size(chunk_size)
    }

    /// Append one chunk's worth of payload; the slice length must equal the
    /// count returned by `parse_payload`. Returns the next chunk's size, 0
    /// when the message is complete.
    pub(crate) fn wrote_payload(&mut self, data: &[u8], chunk_size: u32) -> u32 {
        {
            let state = self.state.as_mut().expect("payload started");
            let buf = state.buf.as_mut().expect("payload started");
            buf.extend_from_slice(data);
        }

        self.offset += data.len() as u32;
        self.bytes += data.len() as u64;

        self.next_size(chunk_size)
    }

    /// Take the completed message, leaving the stream ready to inherit its
    /// header fields and timestamp.
    pub(crate) fn parse_finish(&mut self) -> RtmpMessage {
        let state = self.state.as_mut().expect("message complete");
        let buf = state.buf.take().expect("message complete");

        let message = RtmpMessage {
            message_type: MessageType::from_raw(state.type_raw),
            cstream: self.id,
            mstream: state.mstream,
            ts_delta: state.ts_delta,
            dts: state.dts,
            discont: state.discont,
            payload: buf.freeze(),
        };

        state.discont = false;
        self.offset = 0;

        message
    }

    fn select_chunk_type(&self, message: &RtmpMessage) -> (ChunkType, u32) {
        let abs = message.dts as u32;

        let Some(prev) = self.state.as_ref() else {
            trace!("picking header 0: no previous header");
            return (ChunkType::Type0, abs);
        };

        if prev.mstream != message.mstream {
            trace!(
                want = prev.mstream,
                got = message.mstream,
                "picking header 0: stream mismatch"
            );
            return (ChunkType::Type0, abs);
        }

        if (message.dts - prev.dts).abs() > i32::MAX as i64 {
            warn!(
                from = prev.dts,
                to = message.dts,
                "picking header 0: timestamp delta too large"
            );
            return (ChunkType::Type0, abs);
        }

        let delta = abs.wrapping_sub(prev.dts as u32);

        if prev.type_raw != message.message_type.into_raw() {
            trace!("picking header 1: type mismatch");
            return (ChunkType::Type1, delta);
        }

        if prev.size != message.size() {
            trace!("picking header 1: size mismatch");
            return (ChunkType::Type1, delta);
        }

        if prev.ts_delta != delta {
            trace!("picking header 2: timestamp delta mismatch");
            return (ChunkType::Type2, delta);
        }

        trace!("picking header 3");
        (ChunkType::Type3, delta)
    }

    fn serialize_header(&self, out: &mut BytesMut, fmt: ChunkType, state: &MessageState) {
        let ext_ts = state.ts_delta >= EXT_TIMESTAMP;

        // basic header
        if self.id < CHUNK_STREAM_MIN_TWOBYTE {
            out.put_u8(((fmt as u8) << 6) | self.id as u8);
        } else if self.id < CHUNK_STREAM_MIN_THREEBYTE {
            out.put_u8(((fmt as u8) << 6) | CHUNK_BYTE_TWOBYTE);
            out.put_u8((self.id - CHUNK_STREAM_MIN_TWOBYTE) as u8);
        } else {
            out.put_u8(((fmt as u8) << 6) | CHUNK_BYTE_THREEBYTE);
            out.put_u16_le((self.id - CHUNK_STREAM_MIN_TWOBYTE) as u16);
        }

        // message header
        if fmt != ChunkType::Type3 {
            put_u24(out, if ext_ts { EXT_TIMESTAMP } else { state.ts_delta });
        }
        if matches!(fmt, ChunkType::Type0 | ChunkType::Type1) {
            put_u24(out, state.size);
            out.put_u8(state.type_raw);
        }
        if fmt == ChunkType::Type0 {
            // message stream id is stored in little-endian format
            out.put_u32_le(state.mstream);
        }

        if ext_ts {
            out.put_u32(state.ts_delta);
        }
    }

    /// Serialize a whole message into consecutive chunks.
    pub(crate) fn serialize_all(
        &mut self,
        message: &RtmpMessage,
        chunk_size: u32,
    ) -> Result<BytesMut, RtmpError> {
        if !message.message_type.is_valid() {
            return Err(RtmpError::InvalidData(format!(
                "refusing to serialize message type {}",
                message.message_type.into_raw()
            )));
        }
        if message.size() > MAXIMUM_MESSAGE_SIZE {
            return Err(RtmpError::InvalidData(format!(
                "message too large: {} > {}",
                message.size(),
                MAXIMUM_MESSAGE_SIZE
            )));
        }

        let (fmt, ts_delta) = self.select_chunk_type(message);

        let state = MessageState {
            mstream: message.mstream,
            type_raw: message.message_type.into_raw(),
            size: message.size(),
            ts_delta,
            dts: message.dts,
            discont: false,
            buf: None,
        };

        trace!(
            id = self.id,
            ty = fmt as usize,
            size = state.size,
            "serializing message"
        );

        let mut out = BytesMut::with_capacity(message.payload.len() + 18);
        self.offset = 0;

        self.serialize_header(&mut out, fmt, &state);

        if state.size == 0 {
            trace!("chunk has no payload");
        }

        while self.offset < state.size {
            if self.offset > 0 {
                self.serialize_header(&mut out, ChunkType::Type3, &state);
            }

            let payload_size = (state.size - self.offset).min(chunk_size);
            let begin = self.offset as usize;
            out.extend_from_slice(&message.payload[begin..begin + payload_size as usize]);

            self.offset += payload_size;
            self.bytes += payload_size as u64;
        }

        self.state = Some(state);
        Ok(out)
    }
}

/// Chunk stream table; one instance each for the inbound and outbound
/// directions of a connection. Entries are created on demand.
#[derive(Debug, Default)]
pub(crate) struct ChunkStreams {
    streams: Vec<ChunkStream>,
}

impl ChunkStreams {
    pub(crate) fn new() -> ChunkStreams {
        ChunkStreams::default()
    }

    pub(crate) fn get(&mut self, id: u32) -> Result<&mut ChunkStream, RtmpError> {
        if id <= CHUNK_BYTE_THREEBYTE as u32 || id > CHUNK_STREAM_MAX_THREEBYTE {
            return Err(RtmpError::InvalidData(format!(
                "chunk stream id {id} out of range"
            )));
        }

        if let Some(i) = self.streams.iter().position(|s| s.id == id) {
            return Ok(&mut self.streams[i]);
        }

        debug!(id, "allocating chunk stream");
        let i = self.streams.len();
        self.streams.push(ChunkStream::new(id));
        Ok(&mut self.streams[i])
    }
}

fn read_u24(data: &[u8]) -> u32 {
    u32::from_be_bytes([0, data[0], data[1], data[2]])
}

fn put_u24(out: &mut BytesMut, value: u32) {
    out.put_slice(&value.to_be_bytes()[1..4]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn message(ty: MessageType, cstream: u32, mstream: u32, dts: i64, len: usize) -> RtmpMessage {
        let mut m = RtmpMessage::new(ty, cstream, mstream, Bytes::from(vec![0xABu8; len]));
        m.dts = dts;
        m
    }

    /// Feed serialized bytes through a parse table, returning completed
    /// messages; mirrors the connection's inbound loop.
    fn demux(streams: &mut ChunkStreams, mut data: &[u8], chunk_size: u32) -> Vec<RtmpMessage> {
        let mut out = Vec::new();

        while !data.is_empty() {
            let id = match parse_id(data) {
                IdParse::Id(id) => id,
                IdParse::NeedBytes(_) => panic!("truncated basic header"),
            };
            let cstream = streams.get(id).unwrap();
            let header_size = cstream.parse_header(data);
            assert!(data.len() >= header_size, "truncated chunk header");

            let payload_size = cstream.parse_payload(chunk_size) as usize;
            assert!(data.len() >= header_size + payload_size, "truncated payload");

            let next = cstream.wrote_payload(
                &data[header_size..header_size + payload_size],
                chunk_size,
            );
            if next == 0 {
                out.push(cstream.parse_finish());
            }

            data = &data[header_size + payload_size..];
        }

        out
    }

    #[test]
    fn parse_id_needed_bytes() {
        assert_eq!(parse_id(&[]), IdParse::NeedBytes(1));
        assert_eq!(parse_id(&[0x00]), IdParse::NeedBytes(2));
        assert_eq!(parse_id(&[0x01, 0x10]), IdParse::NeedBytes(3));
        assert_eq!(parse_id(&[0x05]), IdParse::Id(5));
        assert_eq!(parse_id(&[0x00, 0x00]), IdParse::Id(64));
        assert_eq!(parse_id(&[0x01, 0x01, 0x01]), IdParse::Id(64 + 0x101));
    }

    #[test]
    fn rejects_out_of_range_ids() {
        let mut streams = ChunkStreams::new();
        assert!(streams.get(1).is_err());
        assert!(streams.get(CHUNK_STREAM_MAX_THREEBYTE + 1).is_err());
        assert!(streams.get(2).is_ok());
        assert!(streams.get(CHUNK_STREAM_MAX_THREEBYTE).is_ok());
    }

    #[test]
    fn header_down_promotion_to_type3() {
        let mut streams = ChunkStreams::new();
        let cstream = streams.get(5).unwrap();

        let m1 = message(MessageType::Audio, 5, 1, 40, 100);
        let out1 = cstream.serialize_all(&m1, 128).unwrap();
        // type 0: basic(1) + header(11) + payload
        assert_eq!(out1.len(), 1 + 11 + 100);
        assert_eq!(out1[0] >> 6, 0);

        let m2 = message(MessageType::Audio, 5, 1, 80, 100);
        let out2 = cstream.serialize_all(&m2, 128).unwrap();
        // identical shape and delta: type 3, basic header only
        assert_eq!(out2.len(), 1 + 100);
        assert_eq!(out2[0] >> 6, 3);
        assert_eq!(out2[0] & CHUNK_BYTE_MASK, 5);
    }

    #[test]
    fn header_selection_is_minimal() {
        let mut streams = ChunkStreams::new();
        let cstream = streams.get(3).unwrap();

        let m1 = message(MessageType::Audio, 3, 1, 0, 10);
        cstream.serialize_all(&m1, 128).unwrap();

        // same everything but size: type 1
        let m2 = message(MessageType::Audio, 3, 1, 0, 20);
        let out = cstream.serialize_all(&m2, 128).unwrap();
        assert_eq!(out[0] >> 6, 1);

        // same size and type, new delta: type 2
        let m3 = message(MessageType::Audio, 3, 1, 15, 20);
        let out = cstream.serialize_all(&m3, 128).unwrap();
        assert_eq!(out[0] >> 6, 2);

        // different message stream: back to type 0
        let m4 = message(MessageType::Audio, 3, 2, 30, 20);
        let out = cstream.serialize_all(&m4, 128).unwrap();
        assert_eq!(out[0] >> 6, 0);
    }

    #[test]
    fn timestamp_regression_forces_type0() {
        let mut streams = ChunkStreams::new();
        let cstream = streams.get(4).unwrap();

        cstream
            .serialize_all(&message(MessageType::Video, 4, 1, 5_000_000_000, 8), 128)
            .unwrap();
        let out = cstream
            .serialize_all(&message(MessageType::Video, 4, 1, 0, 8), 128)
            .unwrap();
        assert_eq!(out[0] >> 6, 0);
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let mut out_streams = ChunkStreams::new();
        let mut in_streams = ChunkStreams::new();

        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut m = RtmpMessage::new(MessageType::Video, 6, 1, Bytes::from(payload.clone()));
        m.dts = 1234;

        let bytes = out_streams.get(6).unwrap().serialize_all(&m, 128).unwrap();
        let parsed = demux(&mut in_streams, &bytes, 128);

        assert_eq!(parsed.len(), 1);
        let p = &parsed[0];
        assert_eq!(p.message_type, MessageType::Video);
        assert_eq!(p.cstream, 6);
        assert_eq!(p.mstream, 1);
        assert_eq!(p.dts, 1234);
        assert_eq!(p.size() as usize, payload.len());
        assert_eq!(&p.payload[..], &payload[..]);
        assert!(p.discont);
    }

    #[test]
    fn interleaved_streams_reassemble_independently() {
        let mut out_streams = ChunkStreams::new();
        let mut in_streams = ChunkStreams::new();

        let m1 = message(MessageType::Audio, 5, 1, 0, 200);
        let m2 = message(MessageType::Video, 6, 1, 0, 300);

        let b1 = out_streams.get(5).unwrap().serialize_all(&m1, 128).unwrap();
        let b2 = out_streams.get(6).unwrap().serialize_all(&m2, 128).unwrap();

        // interleave chunk-by-chunk: first chunk of each, then the rest
        let mut wire = Vec::new();
        wire.extend_from_slice(&b1[..1 + 11 + 128]);
        wire.extend_from_slice(&b2[..1 + 11 + 128]);
        wire.extend_from_slice(&b1[1 + 11 + 128..]);
        wire.extend_from_slice(&b2[1 + 11 + 128..]);

        let parsed = demux(&mut in_streams, &wire, 128);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].cstream, 5);
        assert_eq!(parsed[0].size(), 200);
        assert_eq!(parsed[1].cstream, 6);
        assert_eq!(parsed[1].size(), 300);
    }

    #[test]
    fn extended_timestamp_roundtrip() {
        for dts in [0xff_ffffi64, 0x100_0000, 0xf123_4567] {
            let mut out_streams = ChunkStreams::new();
            let mut in_streams = ChunkStreams::new();

            let m = message(MessageType::Audio, 5, 1, dts, 16);
            let bytes = out_streams.get(5).unwrap().serialize_all(&m, 128).unwrap();

            // 24-bit field saturates and a 32-bit word follows
            assert_eq!(read_u24(&bytes[1..]), EXT_TIMESTAMP);

            let parsed = demux(&mut in_streams, &bytes, 128);
            assert_eq!(parsed.len(), 1);
            assert_eq!(parsed[0].dts, dts);
        }
    }

    #[test]
    fn extended_timestamp_on_continuation_chunks() {
        let mut out_streams = ChunkStreams::new();
        let mut in_streams = ChunkStreams::new();

        let m = message(MessageType::Video, 6, 1, 0x100_0000, 300);
        let bytes = out_streams.get(6).unwrap().serialize_all(&m, 128).unwrap();

        // 3 chunks: full header + ext, then two type-3 headers with ext
        let expected = (1 + 11 + 4 + 128) + (1 + 4 + 128) + (1 + 4 + 44);
        assert_eq!(bytes.len(), expected);

        let parsed = demux(&mut in_streams, &bytes, 128);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].size(), 300);
        assert_eq!(parsed[0].dts, 0x100_0000);
    }

    #[test]
    fn two_byte_and_three_byte_ids() {
        for id in [64u32, 319, 320, CHUNK_STREAM_MAX_THREEBYTE] {
            let mut out_streams = ChunkStreams::new();
            let mut in_streams = ChunkStreams::new();

            let m = message(MessageType::Audio, id, 1, 0, 4);
            let bytes = out_streams.get(id).unwrap().serialize_all(&m, 128).unwrap();
            let parsed = demux(&mut in_streams, &bytes, 128);
            assert_eq!(parsed.len(), 1);
            assert_eq!(parsed[0].cstream, id);
        }
    }

    #[test]
    fn inbound_timestamp_accumulates_deltas() {
        let mut out_streams = ChunkStreams::new();
        let mut in_streams = ChunkStreams::new();
        let cstream = out_streams.get(5).unwrap();

        let mut wire = Vec::new();
        for dts in [100i64, 140, 180] {
            let m = message(MessageType::Audio, 5, 1, dts, 10);
            wire.extend_from_slice(&cstream.serialize_all(&m, 128).unwrap());
        }

        let parsed = demux(&mut in_streams, &wire, 128);
        let dts: Vec<i64> = parsed.iter().map(|m| m.dts).collect();
        assert_eq!(dts, vec![100, 140, 180]);
        assert!(parsed[0].discont);
        assert!(!parsed[1].discont);
        assert!(!parsed[2].discont);
    }

    #[test]
    fn out_of_bounds_regression_treated_unsigned() {
        // a type-0 header with an absolute timestamp below the current
        // running time by more than the running time itself
        let mut in_streams = ChunkStreams::new();

        let mut wire = Vec::new();
        {
            let mut out_streams = ChunkStreams::new();
            let m = message(MessageType::Audio, 5, 1, 10, 4);
            wire.extend_from_slice(&out_streams.get(5).unwrap().serialize_all(&m, 128).unwrap());
        }
        {
            // fresh serializer so the second message is also type 0,
            // carrying abs = 0xfffffff0 (a -26ms delta against dts=10)
            let mut out_streams = ChunkStreams::new();
            let m = message(MessageType::Audio, 5, 1, 0xffff_fff0, 4);
            wire.extend_from_slice(&out_streams.get(5).unwrap().serialize_all(&m, 128).unwrap());
        }

        let parsed = demux(&mut in_streams, &wire, 128);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].dts, 10);
        // |delta| > dts: the 32-bit field is reinterpreted as unsigned
        assert_eq!(parsed[1].dts, 10 + 0xffff_ffe6);
    }
}
