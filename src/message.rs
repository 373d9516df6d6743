use bytes::{BufMut, Bytes, BytesMut};
use tracing::{error, warn};

use crate::amf0::{Amf0Value, decode_amf0_value};

pub const DEFAULT_CHUNK_SIZE: u32 = 128;
pub const MINIMUM_CHUNK_SIZE: u32 = 1;
pub const MAXIMUM_CHUNK_SIZE: u32 = 0x7FFF_FFFF;
pub const MAXIMUM_MESSAGE_SIZE: u32 = 0xFF_FFFF;

/// Matches librtmp.
pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Chunk stream reserved for protocol control and user control messages.
pub const CHUNK_STREAM_PROTOCOL: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invalid,          // 0
    SetChunkSize,     // 1
    Abort,            // 2
    Acknowledgement,  // 3
    UserControl,      // 4
    WindowAckSize,    // 5
    SetPeerBandwidth, // 6
    Audio,            // 8
    Video,            // 9
    DataAmf3,         // 15
    SharedObjectAmf3, // 16
    CommandAmf3,      // 17
    DataAmf0,         // 18
    SharedObjectAmf0, // 19
    CommandAmf0,      // 20
    Aggregate,        // 22
    Unknown(u8),
}

impl MessageType {
    pub fn from_raw(value: u8) -> MessageType {
        match value {
            0 => MessageType::Invalid,
            1 => MessageType::SetChunkSize,
            2 => MessageType::Abort,
            3 => MessageType::Acknowledgement,
            4 => MessageType::UserControl,
            5 => MessageType::WindowAckSize,
            6 => MessageType::SetPeerBandwidth,
            8 => MessageType::Audio,
            9 => MessageType::Video,
            15 => MessageType::DataAmf3,
            16 => MessageType::SharedObjectAmf3,
            17 => MessageType::CommandAmf3,
            18 => MessageType::DataAmf0,
            19 => MessageType::SharedObjectAmf0,
            20 => MessageType::CommandAmf0,
            22 => MessageType::Aggregate,
            other => MessageType::Unknown(other),
        }
    }

    pub fn into_raw(self) -> u8 {
        match self {
            MessageType::Invalid => 0,
            MessageType::SetChunkSize => 1,
            MessageType::Abort => 2,
            MessageType::Acknowledgement => 3,
            MessageType::UserControl => 4,
            MessageType::WindowAckSize => 5,
            MessageType::SetPeerBandwidth => 6,
            MessageType::Audio => 8,
            MessageType::Video => 9,
            MessageType::DataAmf3 => 15,
            MessageType::SharedObjectAmf3 => 16,
            MessageType::CommandAmf3 => 17,
            MessageType::DataAmf0 => 18,
            MessageType::SharedObjectAmf0 => 19,
            MessageType::CommandAmf0 => 20,
            MessageType::Aggregate => 22,
            MessageType::Unknown(other) => other,
        }
    }

    pub fn is_protocol_control(self) -> bool {
        matches!(
            self,
            MessageType::SetChunkSize
                | MessageType::Abort
                | MessageType::Acknowledgement
                | MessageType::WindowAckSize
                | MessageType::SetPeerBandwidth
        )
    }

    pub fn is_valid(self) -> bool {
        !matches!(self, MessageType::Unknown(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserControlType {
    StreamBegin,              // 0
    StreamEof,                // 1
    StreamDry,                // 2
    SetBufferLength,          // 3
    StreamIsRecorded,         // 4
    PingRequest,              // 6
    PingResponse,             // 7
    SwfVerificationRequest,   // 26
    SwfVerificationResponse,  // 27
    BufferEmpty,              // 31
    BufferReady,              // 32
    Unknown(u16),
}

impl UserControlType {
    pub fn from_raw(value: u16) -> UserControlType {
        match value {
            0 => UserControlType::StreamBegin,
            1 => UserControlType::StreamEof,
            2 => UserControlType::StreamDry,
            3 => UserControlType::SetBufferLength,
            4 => UserControlType::StreamIsRecorded,
            6 => UserControlType::PingRequest,
            7 => UserControlType::PingResponse,
            26 => UserControlType::SwfVerificationRequest,
            27 => UserControlType::SwfVerificationResponse,
            31 => UserControlType::BufferEmpty,
            32 => UserControlType::BufferReady,
            other => UserControlType::Unknown(other),
        }
    }

    pub fn into_raw(self) -> u16 {
        match self {
            UserControlType::StreamBegin => 0,
            UserControlType::StreamEof => 1,
            UserControlType::StreamDry => 2,
            UserControlType::SetBufferLength => 3,
            UserControlType::StreamIsRecorded => 4,
            UserControlType::PingRequest => 6,
            UserControlType::PingResponse => 7,
            UserControlType::SwfVerificationRequest => 26,
            UserControlType::SwfVerificationResponse => 27,
            UserControlType::BufferEmpty => 31,
            UserControlType::BufferReady => 32,
            UserControlType::Unknown(other) => other,
        }
    }
}

/// One RTMP message, as assembled from chunks or queued for serialization.
#[derive(Debug, Clone)]
pub struct RtmpMessage {
    pub message_type: MessageType,
    pub cstream: u32,
    pub mstream: u32,
    /// Last timestamp field written to or read from a chunk header for this
    /// message; delta or absolute depending on the header type.
    pub ts_delta: u32,
    /// Reconstructed decode timestamp in milliseconds.
    pub dts: i64,
    pub discont: bool,
    pub payload: Bytes,
}

impl RtmpMessage {
    pub fn new(
        message_type: MessageType,
        cstream: u32,
        mstream: u32,
        payload: Bytes,
    ) -> RtmpMessage {
        RtmpMessage {
            message_type,
            cstream,
            mstream,
            ts_delta: 0,
            dts: 0,
            discont: false,
            payload,
        }
    }

    pub fn size(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Protocol control check with the placement warnings the wire format
    /// calls for: such messages belong on chunk stream 2, message stream 0.
    pub fn is_protocol_control(&self) -> bool {
        if !self.message_type.is_protocol_control() {
            return false;
        }

        if self.cstream != CHUNK_STREAM_PROTOCOL {
            warn!(cstream = self.cstream, "protocol control message not on chunk stream 2");
        }
        if self.mstream != 0 {
            warn!(mstream = self.mstream, "protocol control message not on message stream 0");
        }

        true
    }

    pub fn is_user_control(&self) -> bool {
        if self.message_type != MessageType::UserControl {
            return false;
        }

        if self.cstream != CHUNK_STREAM_PROTOCOL {
            warn!(cstream = self.cstream, "user control message not on chunk stream 2");
        }
        if self.mstream != 0 {
            warn!(mstream = self.mstream, "user control message not on message stream 0");
        }

        true
    }

    /// A Data AMF0 message whose leading value is the string "onMetaData".
    pub fn is_metadata(&self) -> bool {
        if self.message_type != MessageType::DataAmf0 {
            return false;
        }

        matches!(
            decode_amf0_value(&self.payload),
            Ok((Amf0Value::String(name), _) | (Amf0Value::LongString(name), _))
                if name == "onMetaData"
        )
    }
}

/// Protocol control message body: type plus one u32 parameter, with an
/// extra limit-type byte on SetPeerBandwidth only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolControl {
    pub message_type: MessageType,
    pub param: u32,
    pub param2: u8,
}

fn pc_has_param2(message_type: MessageType) -> bool {
    message_type == MessageType::SetPeerBandwidth
}

impl ProtocolControl {
    pub fn parse(message: &RtmpMessage) -> Option<ProtocolControl> {
        if !message.message_type.is_protocol_control() {
            return None;
        }

        let expected = if pc_has_param2(message.message_type) { 5 } else { 4 };
        let payload = &message.payload;

        if payload.len() < expected {
            error!(
                len = payload.len(),
                "can't read protocol control param"
            );
            return None;
        }
        if payload.len() > expected {
            warn!(len = payload.len(), expected, "overlength protocol control");
        }

        Some(ProtocolControl {
            message_type: message.message_type,
            param: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            param2: if pc_has_param2(message.message_type) {
                payload[4]
            } else {
                0
            },
        })
    }

    pub fn into_message(self) -> RtmpMessage {
        let mut payload = BytesMut::with_capacity(5);
        payload.put_u32(self.param);
        if pc_has_param2(self.message_type) {
            payload.put_u8(self.param2);
        }

        RtmpMessage::new(self.message_type, CHUNK_STREAM_PROTOCOL, 0, payload.freeze())
    }
}

/// User control message body: event type plus one u32 parameter, with a
/// second u32 on SetBufferLength only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserControl {
    pub event_type: UserControlType,
    pub param: u32,
    pub param2: u32,
}

fn uc_has_param2(event_type: UserControlType) -> bool {
    event_type == UserControlType::SetBufferLength
}

impl UserControl {
    pub fn parse(message: &RtmpMessage) -> Option<UserControl> {
        if message.message_type != MessageType::UserControl {
            return None;
        }

        let payload = &message.payload;
        if payload.len() < 2 {
            error!(len = payload.len(), "can't read user control type");
            return None;
        }

        let event_type = UserControlType::from_raw(u16::from_be_bytes([payload[0], payload[1]]));
        let expected = if uc_has_param2(event_type) { 10 } else { 6 };

        if payload.len() < expected {
            error!(len = payload.len(), "can't read user control param");
            return None;
        }
        if payload.len() > expected {
            warn!(len = payload.len(), expected, "overlength user control");
        }

        Some(UserControl {
            event_type,
            param: u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]),
            param2: if uc_has_param2(event_type) {
                u32::from_be_bytes([payload[6], payload[7], payload[8], payload[9]])
            } else {
                0
            },
        })
    }

    pub fn into_message(self) -> RtmpMessage {
        let mut payload = BytesMut::with_capacity(10);
        payload.put_u16(self.event_type.into_raw());
        payload.put_u32(self.param);
        if uc_has_param2(self.event_type) {
            payload.put_u32(self.param2);
        }

        RtmpMessage::new(
            MessageType::UserControl,
            CHUNK_STREAM_PROTOCOL,
            0,
            payload.freeze(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf0::{Amf0Value, encode_amf0_values};

    #[test]
    fn message_type_raw_roundtrip() {
        for raw in [0u8, 1, 2, 3, 4, 5, 6, 8, 9, 15, 16, 17, 18, 19, 20, 22, 99] {
            assert_eq!(MessageType::from_raw(raw).into_raw(), raw);
        }
    }

    #[test]
    fn protocol_control_roundtrip() {
        let pc = ProtocolControl {
            message_type: MessageType::WindowAckSize,
            param: 2_500_000,
            param2: 0,
        };
        let message = pc.into_message();
        assert_eq!(message.cstream, CHUNK_STREAM_PROTOCOL);
        assert_eq!(message.mstream, 0);
        assert_eq!(message.payload.len(), 4);
        assert_eq!(ProtocolControl::parse(&message), Some(pc));
    }

    #[test]
    fn set_peer_bandwidth_carries_limit_type() {
        let pc = ProtocolControl {
            message_type: MessageType::SetPeerBandwidth,
            param: 5000,
            param2: 2,
        };
        let message = pc.into_message();
        assert_eq!(message.payload.len(), 5);
        assert_eq!(ProtocolControl::parse(&message), Some(pc));
    }

    #[test]
    fn short_protocol_control_rejected() {
        let message = RtmpMessage::new(
            MessageType::Acknowledgement,
            CHUNK_STREAM_PROTOCOL,
            0,
            Bytes::from_static(&[0, 0]),
        );
        assert_eq!(ProtocolControl::parse(&message), None);
    }

    #[test]
    fn user_control_roundtrip() {
        let uc = UserControl {
            event_type: UserControlType::SetBufferLength,
            param: 1,
            param2: 30000,
        };
        let message = uc.into_message();
        assert_eq!(message.payload.len(), 10);
        assert_eq!(UserControl::parse(&message), Some(uc));

        let ping = UserControl {
            event_type: UserControlType::PingResponse,
            param: 1234,
            param2: 0,
        };
        assert_eq!(UserControl::parse(&ping.into_message()), Some(ping));
    }

    #[test]
    fn metadata_probe() {
        let payload = encode_amf0_values(&[
            Amf0Value::String("onMetaData".into()),
            Amf0Value::EcmaArray(vec![("duration".into(), Amf0Value::Number(0.0))]),
        ]);
        let message =
            RtmpMessage::new(MessageType::DataAmf0, 4, 1, Bytes::from(payload));
        assert!(message.is_metadata());

        let other = RtmpMessage::new(
            MessageType::DataAmf0,
            4,
            1,
            Bytes::from(encode_amf0_values(&[Amf0Value::String("onCuePoint".into())])),
        );
        assert!(!other.is_metadata());
    }
}
