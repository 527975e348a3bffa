//! # CONNECTOR WIRE FORMAT
//!
//! The native-side Connector and the engine exchange *self-describing*
//! messages: named-or-ordinal fields carrying a small closed set of value
//! types. This crate defines that data model ([`Message`], [`Value`],
//! [`Frame`]) and ships one concrete [`codec`] for it.
//!
//! The bit-level encoding is deliberately not part of the Connector's core
//! contract — [`transport`](../connector_transport/index.html) and
//! [`connector`](../connector_core/index.html) only depend on the types in
//! this crate, never on [`codec::BinaryCodec`] directly, so a different wire
//! format can be substituted without touching session, client, or dispatch
//! logic.

pub mod codec;

use std::fmt;

/// A field's address within a [`Message`].
///
/// Most application fields are addressed by name, but the async dispatch
/// routing rule ("an ordinal-zero string field inside `payload` names the
/// async class") needs an addressable ordinal slot, so both forms are kept.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldName {
    Ordinal(u16),
    Named(String),
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldName::Ordinal(n) => write!(f, "#{n}"),
            FieldName::Named(s) => write!(f, "{s}"),
        }
    }
}

/// The closed set of value types a field may carry.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    I32(i32),
    U32(u32),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Msg(Message),
}

impl Value {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Value::Msg(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// An ordered list of named-or-ordinal fields.
///
/// Order is preserved (not just for round-tripping) because the async
/// dispatch rule is specifically "the string field *at ordinal 0*", not
/// "the first string field by name lookup" — callers that build a message
/// for dispatch must put the class name in field position 0.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message(Vec<(FieldName, Value)>);

impl Message {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_named(mut self, name: impl Into<String>, value: Value) -> Self {
        self.0.push((FieldName::Named(name.into()), value));
        self
    }

    pub fn with_ordinal(mut self, ordinal: u16, value: Value) -> Self {
        self.0.push((FieldName::Ordinal(ordinal), value));
        self
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.0.iter().find_map(|(field, value)| match field {
            FieldName::Named(n) if n == name => Some(value),
            _ => None,
        })
    }

    pub fn get_ordinal(&self, ordinal: u16) -> Option<&Value> {
        self.0.iter().find_map(|(field, value)| match field {
            FieldName::Ordinal(n) if *n == ordinal => Some(value),
            _ => None,
        })
    }

    pub fn fields(&self) -> &[(FieldName, Value)] {
        &self.0
    }
}

/// A "user message" (spec §3): a [`Message`] payload optionally paired with
/// a synchronous-call `handle`.
///
/// A [`Frame`] with `handle: Some(_)` is routed to the synchronous call
/// table; one with `handle: None` is routed to the async dispatcher keyed on
/// [`Frame::class_name`].
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub handle: Option<i32>,
    pub payload: Message,
}

impl Frame {
    pub fn reply(handle: i32, payload: Message) -> Self {
        Self {
            handle: Some(handle),
            payload,
        }
    }

    pub fn notification(payload: Message) -> Self {
        Self {
            handle: None,
            payload,
        }
    }

    /// The async dispatch class name: the string at ordinal 0 of `payload`.
    pub fn class_name(&self) -> Option<&str> {
        self.payload.get_ordinal(0).and_then(Value::as_str)
    }
}

/// The connect descriptor written once over the rendezvous endpoint (§3).
///
/// Field names mirror the wire contract exactly (`CPPToJavaPipe`,
/// `JavaToCPPPipe`) rather than being renamed to idiomatic Rust case,
/// because interoperability with the engine-side reader depends on them.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectDescriptor {
    pub user_name: String,
    pub cpp_to_java_pipe: String,
    pub java_to_cpp_pipe: String,
    pub language_id: String,
    pub debug: bool,
}

impl ConnectDescriptor {
    /// Narrow (byte-wide) string encoding; the only width this codec emits.
    pub const CHAR_WIDTH_NARROW: u8 = 1;

    pub fn to_message(&self) -> Message {
        Message::new()
            .with_named("userName", Value::Str(self.user_name.clone()))
            .with_named("CPPToJavaPipe", Value::Str(self.cpp_to_java_pipe.clone()))
            .with_named("JavaToCPPPipe", Value::Str(self.java_to_cpp_pipe.clone()))
            .with_named("languageID", Value::Str(self.language_id.clone()))
            .with_named("debug", Value::Bool(self.debug))
    }

    pub fn from_message(msg: &Message) -> Result<Self, WireError> {
        let field = |name: &'static str| {
            msg.get_named(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or(WireError::MissingField(name))
        };
        Ok(Self {
            user_name: field("userName")?,
            cpp_to_java_pipe: field("CPPToJavaPipe")?,
            java_to_cpp_pipe: field("JavaToCPPPipe")?,
            language_id: field("languageID")?,
            debug: msg
                .get_named("debug")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Errors raised while decoding a [`Frame`] or [`ConnectDescriptor`].
///
/// Corresponds to spec §7's `Protocol` kind ("malformed message — missing
/// payload, wrong character width, unknown field type").
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated message, expected at least {needed} more byte(s)")]
    Truncated { needed: usize },
    #[error("unknown field-name tag {0:#04x}")]
    UnknownFieldTag(u8),
    #[error("unknown value tag {0:#04x}")]
    UnknownValueTag(u8),
    #[error("field names must be valid UTF-8")]
    InvalidUtf8,
    #[error("required field {0:?} is missing")]
    MissingField(&'static str),
    #[error("unsupported character width {0}")]
    UnsupportedCharWidth(u8),
}
