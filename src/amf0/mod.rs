mod decoding;
mod encoding;

pub use decoding::{Amf0DecodeError, decode_amf0_command, decode_amf0_value, decode_amf0_values};
pub use encoding::{encode_amf0_command, encode_amf0_values};

pub(crate) const NUMBER: u8 = 0x00;
pub(crate) const BOOLEAN: u8 = 0x01;
pub(crate) const STRING: u8 = 0x02;
pub(crate) const OBJECT: u8 = 0x03;
pub(crate) const NULL: u8 = 0x05;
pub(crate) const UNDEFINED: u8 = 0x06;
pub(crate) const ECMA_ARRAY: u8 = 0x08;
pub(crate) const OBJECT_END: u8 = 0x09;
pub(crate) const STRICT_ARRAY: u8 = 0x0A;
pub(crate) const LONG_STRING: u8 = 0x0C;
pub(crate) const UNSUPPORTED: u8 = 0x0D;

pub(crate) const MAX_RECURSION_DEPTH: u8 = 16;

/// A single AMF0 value.
///
/// Object and ECMA array fields keep their wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Null,
    Undefined,
    Boolean(bool),
    Number(f64),
    String(String),
    LongString(String),
    Object(Vec<(String, Amf0Value)>),
    EcmaArray(Vec<(String, Amf0Value)>),
    StrictArray(Vec<Amf0Value>),
    /// Parser sentinel terminating objects; never a payload value.
    ObjectEnd,
}

impl Amf0Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Amf0Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) | Amf0Value::LongString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Amf0Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Look up a field of an object or ECMA array by name.
    pub fn field(&self, name: &str) -> Option<&Amf0Value> {
        match self {
            Amf0Value::Object(fields) | Amf0Value::EcmaArray(fields) => fields
                .iter()
                .find_map(|(k, v)| (k == name).then_some(v)),
            _ => None,
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Amf0Value::Null => "null",
            Amf0Value::Undefined => "undefined",
            Amf0Value::Boolean(_) => "boolean",
            Amf0Value::Number(_) => "number",
            Amf0Value::String(_) => "string",
            Amf0Value::LongString(_) => "long-string",
            Amf0Value::Object(_) => "object",
            Amf0Value::EcmaArray(_) => "ecma-array",
            Amf0Value::StrictArray(_) => "strict-array",
            Amf0Value::ObjectEnd => "object-end",
        }
    }
}

/// Command message envelope: `<name> <transaction id> <arg0> [args...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Amf0Command {
    pub name: String,
    pub transaction_id: f64,
    pub args: Vec<Amf0Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_lookup_preserves_first_match() {
        let obj = Amf0Value::Object(vec![
            ("code".into(), Amf0Value::String("a".into())),
            ("code".into(), Amf0Value::String("b".into())),
        ]);
        assert_eq!(obj.field("code").and_then(Amf0Value::as_str), Some("a"));
        assert_eq!(obj.field("missing"), None);
    }
}
