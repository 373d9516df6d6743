use bytes::{BufMut, BytesMut};
use tracing::{trace, warn};

use crate::amf0::*;

struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    fn encode_value(&mut self, value: &Amf0Value) {
        match value {
            Amf0Value::Number(n) => {
                self.buf.put_u8(NUMBER);
                self.buf.put_f64(*n);
            }
            Amf0Value::Boolean(b) => {
                self.buf.put_u8(BOOLEAN);
                self.buf.put_u8((*b).into());
            }
            Amf0Value::String(s) => self.put_string(s),
            Amf0Value::LongString(s) => self.put_long_string(s),
            Amf0Value::Object(fields) => {
                self.buf.put_u8(OBJECT);
                self.put_fields(fields);
            }
            Amf0Value::EcmaArray(fields) => {
                self.buf.put_u8(ECMA_ARRAY);
                // the count prefix is advisory and written as zero
                self.buf.put_u32(0);
                self.put_fields(fields);
            }
            Amf0Value::StrictArray(values) => {
                self.buf.put_u8(STRICT_ARRAY);
                self.buf.put_u32(values.len() as u32);
                for value in values {
                    self.encode_value(value);
                }
            }
            Amf0Value::Null => self.buf.put_u8(NULL),
            Amf0Value::Undefined | Amf0Value::ObjectEnd => self.buf.put_u8(UNDEFINED),
        }
    }

    fn put_string(&mut self, s: &str) {
        if s.len() > u16::MAX as usize {
            self.put_long_string(s);
            return;
        }
        self.buf.put_u8(STRING);
        self.put_field_name(s);
    }

    fn put_long_string(&mut self, s: &str) {
        let mut bytes = s.as_bytes();
        if bytes.len() > u32::MAX as usize {
            warn!(len = bytes.len(), "long string too long, truncating");
            bytes = &bytes[..u32::MAX as usize];
        }
        self.buf.put_u8(LONG_STRING);
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    fn put_field_name(&mut self, s: &str) {
        let mut bytes = s.as_bytes();
        if bytes.len() > u16::MAX as usize {
            warn!(len = bytes.len(), "string too long, truncating");
            bytes = &bytes[..u16::MAX as usize];
        }
        self.buf.put_u16(bytes.len() as u16);
        self.buf.put_slice(bytes);
    }

    fn put_fields(&mut self, fields: &[(String, Amf0Value)]) {
        for (name, value) in fields {
            self.put_field_name(name);
            self.encode_value(value);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(OBJECT_END);
    }
}

/// Serialize a sequence of values into one payload.
pub fn encode_amf0_values(values: &[Amf0Value]) -> Vec<u8> {
    let mut encoder = Amf0Encoder::new();
    for value in values {
        encoder.encode_value(value);
    }
    encoder.buf.to_vec()
}

/// Serialize a command envelope: name, transaction id, then arguments.
pub fn encode_amf0_command(transaction_id: f64, name: &str, args: &[Amf0Value]) -> Vec<u8> {
    trace!(command = name, transaction_id, "serializing command");

    let mut encoder = Amf0Encoder::new();
    encoder.encode_value(&Amf0Value::String(name.to_string()));
    encoder.encode_value(&Amf0Value::Number(transaction_id));
    for arg in args {
        encoder.encode_value(arg);
    }
    encoder.buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf0::decoding::decode_amf0_values;

    #[test]
    fn number_is_ieee754_be() {
        let bytes = encode_amf0_values(&[Amf0Value::Number(1.0)]);
        assert_eq!(bytes, [0x00, 0x3f, 0xf0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn object_end_marker_bytes() {
        let bytes = encode_amf0_values(&[Amf0Value::Object(vec![])]);
        assert_eq!(bytes, [OBJECT, 0x00, 0x00, 0x09]);
    }

    #[test]
    fn long_string_threshold() {
        let long = "x".repeat(u16::MAX as usize + 1);
        let bytes = encode_amf0_values(&[Amf0Value::String(long.clone())]);
        assert_eq!(bytes[0], LONG_STRING);

        let decoded = decode_amf0_values(&bytes).unwrap();
        assert_eq!(decoded, vec![Amf0Value::LongString(long)]);
    }

    #[test]
    fn ecma_array_writes_zero_count() {
        let bytes = encode_amf0_values(&[Amf0Value::EcmaArray(vec![(
            "a".into(),
            Amf0Value::Null,
        )])]);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 0]);
    }

    #[test]
    fn command_prefix_shape() {
        let bytes = encode_amf0_command(1.0, "connect", &[Amf0Value::Null]);
        assert_eq!(bytes[0], STRING);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]) as usize, 7);
        assert_eq!(&bytes[3..10], b"connect");
        assert_eq!(bytes[10], NUMBER);
    }
}
