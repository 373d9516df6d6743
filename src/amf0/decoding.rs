use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::amf0::*;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Amf0DecodeError {
    #[error("Insufficient data")]
    InsufficientData,
    #[error("Unknown or unimplemented AMF type: {0}")]
    UnknownType(u8),
    #[error("Invalid UTF-8 string")]
    InvalidUtf8,
    #[error("Maximum recursion depth {MAX_RECURSION_DEPTH} reached")]
    TooDeep,
    #[error("Empty object field name")]
    EmptyFieldName,
}

struct Amf0Decoder<'a> {
    data: &'a [u8],
    offset: usize,
    depth: u8,
}

impl<'a> Amf0Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            depth: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Amf0DecodeError> {
        if self.remaining() < len {
            return Err(Amf0DecodeError::InsufficientData);
        }
        let out = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, Amf0DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, Amf0DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, Amf0DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f64(&mut self) -> Result<f64, Amf0DecodeError> {
        let b = self.take(8)?;
        Ok(f64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_string(&mut self, len: usize) -> Result<String, Amf0DecodeError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Amf0DecodeError::InvalidUtf8)
    }

    fn decode_value(&mut self) -> Result<Amf0Value, Amf0DecodeError> {
        self.depth += 1;
        if self.depth > MAX_RECURSION_DEPTH {
            return Err(Amf0DecodeError::TooDeep);
        }
        let value = self.decode_value_body();
        self.depth -= 1;
        value
    }

    fn decode_value_body(&mut self) -> Result<Amf0Value, Amf0DecodeError> {
        let marker = self.read_u8()?;
        trace!(marker, "decoding AMF value");

        match marker {
            NUMBER => Ok(Amf0Value::Number(self.read_f64()?)),
            BOOLEAN => Ok(Amf0Value::Boolean(self.read_u8()? != 0)),
            STRING => {
                let len = self.read_u16()? as usize;
                Ok(Amf0Value::String(self.read_string(len)?))
            }
            LONG_STRING => {
                let len = self.read_u32()? as usize;
                Ok(Amf0Value::LongString(self.read_string(len)?))
            }
            OBJECT => Ok(Amf0Value::Object(self.decode_object_fields()?)),
            ECMA_ARRAY => {
                // the declared element count is advisory; fields are read
                // until the object-end marker
                let declared = self.read_u32()?;
                if declared == 0 {
                    debug!("ECMA array declares zero elements");
                }
                let fields = self.decode_object_fields()?;
                if declared != 0 && declared as usize != fields.len() {
                    warn!(
                        declared,
                        parsed = fields.len(),
                        "ECMA array element count disagrees with parsed fields"
                    );
                }
                Ok(Amf0Value::EcmaArray(fields))
            }
            STRICT_ARRAY => {
                let len = self.read_u32()? as usize;
                let mut values = Vec::with_capacity(len.min(self.remaining()));
                for _ in 0..len {
                    values.push(self.decode_value()?);
                }
                Ok(Amf0Value::StrictArray(values))
            }
            NULL => Ok(Amf0Value::Null),
            UNDEFINED | UNSUPPORTED => Ok(Amf0Value::Undefined),
            OBJECT_END => Ok(Amf0Value::ObjectEnd),
            other => Err(Amf0DecodeError::UnknownType(other)),
        }
    }

    fn decode_object_fields(&mut self) -> Result<Vec<(String, Amf0Value)>, Amf0DecodeError> {
        let mut fields = Vec::new();

        loop {
            let name_len = self.read_u16()? as usize;
            let name = self.read_string(name_len)?;
            let value = self.decode_value()?;

            if value == Amf0Value::ObjectEnd {
                return Ok(fields);
            }

            if name.is_empty() {
                return Err(Amf0DecodeError::EmptyFieldName);
            }

            fields.push((name, value));
        }
    }
}

/// Decode a single value, returning it and the bytes consumed.
pub fn decode_amf0_value(data: &[u8]) -> Result<(Amf0Value, usize), Amf0DecodeError> {
    let mut decoder = Amf0Decoder::new(data);
    let value = decoder.decode_value()?;
    Ok((value, decoder.offset))
}

/// Decode every top-level value in the payload.
pub fn decode_amf0_values(data: &[u8]) -> Result<Vec<Amf0Value>, Amf0DecodeError> {
    let mut decoder = Amf0Decoder::new(data);
    let mut values = Vec::new();

    while decoder.remaining() > 0 {
        values.push(decoder.decode_value()?);
    }

    Ok(values)
}

/// Decode a command envelope. Returns `None` (after logging) when the
/// payload lacks the string-name/number-id prefix or carries no arguments;
/// one malformed command must not kill the connection.
pub fn decode_amf0_command(data: &[u8]) -> Option<Amf0Command> {
    let mut decoder = Amf0Decoder::new(data);

    let name = match decoder.decode_value() {
        Ok(Amf0Value::String(name)) => name,
        Ok(other) => {
            warn!(got = other.type_name(), "command has no name");
            return None;
        }
        Err(err) => {
            warn!(%err, "failed to decode command name");
            return None;
        }
    };

    let transaction_id = match decoder.decode_value() {
        Ok(Amf0Value::Number(id)) => id,
        Ok(other) => {
            warn!(command = %name, got = other.type_name(), "command has no transaction ID");
            return None;
        }
        Err(err) => {
            warn!(command = %name, %err, "failed to decode transaction ID");
            return None;
        }
    };

    trace!(command = %name, transaction_id, "decoding command arguments");

    let mut args = Vec::new();
    while decoder.remaining() > 0 {
        match decoder.decode_value() {
            Ok(value) => args.push(value),
            Err(err) => {
                warn!(command = %name, %err, "failed to decode command argument");
                break;
            }
        }
    }

    if args.is_empty() {
        warn!(command = %name, "command has no arguments");
        return None;
    }

    Some(Amf0Command {
        name,
        transaction_id,
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf0::encoding::encode_amf0_values;

    fn roundtrip(values: &[Amf0Value]) -> Vec<Amf0Value> {
        let bytes = encode_amf0_values(values);
        decode_amf0_values(&bytes).unwrap()
    }

    #[test]
    fn scalar_roundtrip() {
        let values = vec![
            Amf0Value::Number(12.5),
            Amf0Value::Boolean(true),
            Amf0Value::String("hello".into()),
            Amf0Value::Null,
            Amf0Value::Undefined,
        ];
        assert_eq!(roundtrip(&values), values);
    }

    #[test]
    fn object_roundtrip_preserves_order() {
        let obj = Amf0Value::Object(vec![
            ("zebra".into(), Amf0Value::Number(1.0)),
            ("apple".into(), Amf0Value::String("x".into())),
            ("mango".into(), Amf0Value::Boolean(false)),
        ]);
        assert_eq!(roundtrip(std::slice::from_ref(&obj)), vec![obj]);
    }

    #[test]
    fn nested_roundtrip() {
        let value = Amf0Value::StrictArray(vec![
            Amf0Value::Object(vec![(
                "inner".into(),
                Amf0Value::EcmaArray(vec![("k".into(), Amf0Value::Number(2.0))]),
            )]),
            Amf0Value::Number(3.0),
        ]);
        assert_eq!(roundtrip(std::slice::from_ref(&value)), vec![value]);
    }

    #[test]
    fn rejects_excessive_depth() {
        // 17 nested strict arrays of one element each
        let mut bytes = Vec::new();
        for _ in 0..17 {
            bytes.push(STRICT_ARRAY);
            bytes.extend_from_slice(&1u32.to_be_bytes());
        }
        bytes.push(NULL);
        assert_eq!(
            decode_amf0_values(&bytes).unwrap_err(),
            Amf0DecodeError::TooDeep
        );
    }

    #[test]
    fn accepts_maximum_depth() {
        // value at depth 16 exactly
        let mut bytes = Vec::new();
        for _ in 0..15 {
            bytes.push(STRICT_ARRAY);
            bytes.extend_from_slice(&1u32.to_be_bytes());
        }
        bytes.push(NULL);
        assert!(decode_amf0_values(&bytes).is_ok());
    }

    #[test]
    fn ecma_array_count_is_advisory() {
        // count says 7, actual fields: 1
        let mut bytes = vec![ECMA_ARRAY];
        bytes.extend_from_slice(&7u32.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.push(b'k');
        bytes.push(NUMBER);
        bytes.extend_from_slice(&1.0f64.to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x00, OBJECT_END]);

        let (value, used) = decode_amf0_value(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(
            value,
            Amf0Value::EcmaArray(vec![("k".into(), Amf0Value::Number(1.0))])
        );
    }

    #[test]
    fn ecma_array_zero_count_parses_to_end() {
        let mut bytes = vec![ECMA_ARRAY];
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.push(b'v');
        bytes.push(BOOLEAN);
        bytes.push(1);
        bytes.extend_from_slice(&[0x00, 0x00, OBJECT_END]);

        let (value, _) = decode_amf0_value(&bytes).unwrap();
        assert_eq!(
            value,
            Amf0Value::EcmaArray(vec![("v".into(), Amf0Value::Boolean(true))])
        );
    }

    #[test]
    fn rejects_empty_field_name() {
        // empty name followed by a non-end value
        let bytes = vec![OBJECT, 0x00, 0x00, NULL, 0x00, 0x00, OBJECT_END];
        assert_eq!(
            decode_amf0_value(&bytes).unwrap_err(),
            Amf0DecodeError::EmptyFieldName
        );
    }

    #[test]
    fn truncated_input_is_insufficient() {
        let bytes = vec![NUMBER, 0x3f, 0xf0];
        assert_eq!(
            decode_amf0_values(&bytes).unwrap_err(),
            Amf0DecodeError::InsufficientData
        );
    }

    #[test]
    fn command_envelope_roundtrip() {
        let payload = crate::amf0::encode_amf0_command(
            2.0,
            "createStream",
            &[Amf0Value::Null],
        );
        let cmd = decode_amf0_command(&payload).unwrap();
        assert_eq!(cmd.name, "createStream");
        assert_eq!(cmd.transaction_id, 2.0);
        assert_eq!(cmd.args, vec![Amf0Value::Null]);
    }

    #[test]
    fn command_requires_arguments() {
        let payload = crate::amf0::encode_amf0_command(1.0, "connect", &[]);
        assert!(decode_amf0_command(&payload).is_none());
    }

    #[test]
    fn command_requires_string_name() {
        let payload = encode_amf0_values(&[Amf0Value::Number(1.0), Amf0Value::Number(2.0)]);
        assert!(decode_amf0_command(&payload).is_none());
    }
}
