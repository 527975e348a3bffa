//! # CONNECTOR CORE
//!
//! Client-side half of a native-to-engine bridge: establish a session with
//! a long-running engine process over a pair of local byte streams,
//! multiplex synchronous calls over it, dispatch engine-originated
//! notifications to registered callbacks, and supervise the engine's
//! process lifecycle.
//!
//! Layering: [`connector_wire`] defines the message data model and one
//! concrete codec for it; [`connector_transport`] defines the byte-stream
//! abstraction both sides of a session are built on; this crate wires the
//! two together into the session handshake ([`session`]), the engine
//! process supervisor ([`supervisor`]), the client lifecycle state machine
//! ([`client`]), the synchronous call table ([`sync_calls`]), the
//! asynchronous dispatcher ([`dispatch`]), and a typed request surface
//! ([`request`]).

pub mod alert;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod request;
pub mod session;
pub mod supervisor;
pub mod sync_calls;

pub use alert::{Alert, AlertSink, LoggingAlertSink};
pub use client::{Client, ClientState};
pub use config::ConnectorConfig;
pub use dispatch::{CallbackEntry, DispatchOutcome, Dispatcher};
pub use error::{render_invocation_error, ConnectorError, InvocationError};
pub use request::{call, RequestBuilder, WireRequest, WireResponse};

pub use connector_wire::{ConnectDescriptor, Frame, Message, Value};
