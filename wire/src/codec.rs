//! A concrete, length-prefix-free binary encoding for [`Frame`] and
//! [`ConnectDescriptor`]. `transport` adds the 4-byte length prefix used on
//! the wire; this module only handles the structure inside that prefix.

use crate::{FieldName, Frame, Message, Value, WireError};

const TAG_ORDINAL: u8 = 0x00;
const TAG_NAMED: u8 = 0x01;

const TAG_I32: u8 = 0x01;
const TAG_U32: u8 = 0x02;
const TAG_BOOL: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_MSG: u8 = 0x06;

/// Stateless encode/decode for [`Frame`]s and [`ConnectDescriptor`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    pub fn encode_frame(&self, frame: &Frame) -> Vec<u8> {
        let mut out = Vec::new();
        match frame.handle {
            Some(h) => {
                out.push(1);
                out.extend_from_slice(&h.to_be_bytes());
            }
            None => out.push(0),
        }
        encode_message(&frame.payload, &mut out);
        out
    }

    pub fn decode_frame(&self, bytes: &[u8]) -> Result<Frame, WireError> {
        let mut cursor = Cursor::new(bytes);
        let has_handle = cursor.take_u8()?;
        let handle = match has_handle {
            0 => None,
            _ => Some(cursor.take_i32()?),
        };
        let payload = decode_message(&mut cursor)?;
        Ok(Frame { handle, payload })
    }

    /// Encodes a [`ConnectDescriptor`]'s message with its leading
    /// `charWidth` guard byte (spec §3: "a leading `charWidth` count tells
    /// the engine whether names are byte-wide or UTF-16").
    pub fn encode_descriptor_message(&self, msg: &Message) -> Vec<u8> {
        let mut out = vec![crate::ConnectDescriptor::CHAR_WIDTH_NARROW];
        encode_message(msg, &mut out);
        out
    }

    pub fn decode_descriptor_message(&self, bytes: &[u8]) -> Result<Message, WireError> {
        let mut cursor = Cursor::new(bytes);
        let char_width = cursor.take_u8()?;
        if char_width != crate::ConnectDescriptor::CHAR_WIDTH_NARROW {
            return Err(WireError::UnsupportedCharWidth(char_width));
        }
        decode_message(&mut cursor)
    }
}

fn encode_message(msg: &Message, out: &mut Vec<u8>) {
    let fields = msg.fields();
    out.extend_from_slice(&(fields.len() as u16).to_be_bytes());
    for (name, value) in fields {
        encode_field_name(name, out);
        encode_value(value, out);
    }
}

fn encode_field_name(name: &FieldName, out: &mut Vec<u8>) {
    match name {
        FieldName::Ordinal(n) => {
            out.push(TAG_ORDINAL);
            out.extend_from_slice(&n.to_be_bytes());
        }
        FieldName::Named(s) => {
            out.push(TAG_NAMED);
            encode_str(s, out);
        }
    }
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::I32(v) => {
            out.push(TAG_I32);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::U32(v) => {
            out.push(TAG_U32);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Bool(v) => {
            out.push(TAG_BOOL);
            out.push(if *v { 1 } else { 0 });
        }
        Value::Str(s) => {
            out.push(TAG_STR);
            encode_str(s, out);
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
        }
        Value::Msg(m) => {
            out.push(TAG_MSG);
            encode_message(m, out);
        }
    }
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn decode_message(cursor: &mut Cursor) -> Result<Message, WireError> {
    let count = cursor.take_u16()?;
    let mut msg = Message::new();
    for _ in 0..count {
        let name = decode_field_name(cursor)?;
        let value = decode_value(cursor)?;
        msg = match name {
            FieldName::Ordinal(o) => msg.with_ordinal(o, value),
            FieldName::Named(n) => msg.with_named(n, value),
        };
    }
    Ok(msg)
}

fn decode_field_name(cursor: &mut Cursor) -> Result<FieldName, WireError> {
    match cursor.take_u8()? {
        TAG_ORDINAL => Ok(FieldName::Ordinal(cursor.take_u16()?)),
        TAG_NAMED => Ok(FieldName::Named(decode_str(cursor)?)),
        other => Err(WireError::UnknownFieldTag(other)),
    }
}

fn decode_value(cursor: &mut Cursor) -> Result<Value, WireError> {
    match cursor.take_u8()? {
        TAG_I32 => Ok(Value::I32(cursor.take_i32()?)),
        TAG_U32 => Ok(Value::U32(cursor.take_u32()?)),
        TAG_BOOL => Ok(Value::Bool(cursor.take_u8()? != 0)),
        TAG_STR => Ok(Value::Str(decode_str(cursor)?)),
        TAG_BYTES => {
            let len = cursor.take_u32()? as usize;
            Ok(Value::Bytes(cursor.take_bytes(len)?.to_vec()))
        }
        TAG_MSG => Ok(Value::Msg(decode_message(cursor)?)),
        other => Err(WireError::UnknownValueTag(other)),
    }
}

fn decode_str(cursor: &mut Cursor) -> Result<String, WireError> {
    let len = cursor.take_u32()? as usize;
    String::from_utf8(cursor.take_bytes(len)?.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

/// A minimal forward-only byte cursor; kept private to this module since
/// nothing outside the codec needs partial-decode access.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.pos + len > self.bytes.len() {
            return Err(WireError::Truncated {
                needed: self.pos + len - self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.take_bytes(2)?.try_into().unwrap()))
    }

    fn take_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take_bytes(4)?.try_into().unwrap()))
    }

    fn take_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_be_bytes(self.take_bytes(4)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectDescriptor;

    #[test]
    fn round_trips_a_frame_with_handle() {
        let frame = Frame::reply(
            42,
            Message::new()
                .with_named("op", Value::Str("ECHO_RESPONSE".into()))
                .with_named("nonce", Value::I32(7)),
        );
        let codec = BinaryCodec;
        let bytes = codec.encode_frame(&frame);
        let decoded = codec.decode_frame(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trips_a_notification_with_class_name() {
        let frame = Frame::notification(
            Message::new()
                .with_ordinal(0, Value::Str("Test".into()))
                .with_named("nonce", Value::I32(3)),
        );
        let codec = BinaryCodec;
        let bytes = codec.encode_frame(&frame);
        let decoded = codec.decode_frame(&bytes).unwrap();
        assert_eq!(decoded.class_name(), Some("Test"));
    }

    #[test]
    fn round_trips_a_connect_descriptor() {
        let descriptor = ConnectDescriptor {
            user_name: "alice".into(),
            cpp_to_java_pipe: "/tmp/og-ctoe-00000001".into(),
            java_to_cpp_pipe: "/tmp/og-etoc-00000001".into(),
            language_id: "Rust".into(),
            debug: true,
        };
        let codec = BinaryCodec;
        let bytes = codec.encode_descriptor_message(&descriptor.to_message());
        let msg = codec.decode_descriptor_message(&bytes).unwrap();
        assert_eq!(ConnectDescriptor::from_message(&msg).unwrap(), descriptor);
    }

    #[test]
    fn rejects_wrong_char_width() {
        let codec = BinaryCodec;
        let bytes = vec![9, 0, 0];
        assert!(matches!(
            codec.decode_descriptor_message(&bytes),
            Err(WireError::UnsupportedCharWidth(9))
        ));
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let codec = BinaryCodec;
        assert!(matches!(
            codec.decode_frame(&[1, 0, 0]),
            Err(WireError::Truncated { .. })
        ));
    }
}
