//! The Connector's error taxonomy (spec §7).

use connector_transport::TransportError;
use connector_wire::WireError;

/// Reserved error-code bands, mirrored from `Errors.h`: application error
/// codes returned by the engine never overlap these, so a caller can tell a
/// transport-layer failure from an application one by code alone even
/// before looking at the variant.
pub mod codes {
    pub const TRANSPORT_BAND_START: i32 = -1000;
    pub const PROTOCOL_BAND_START: i32 = -2000;
    pub const INTERNAL_BAND_START: i32 = -3000;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("transport closed")]
    TransportClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("engine is unavailable")]
    EngineUnavailable,

    #[error("not connected")]
    NotConnected,

    #[error("a call is already pending on this handle")]
    AlreadyPending,

    #[error("slot handle is invalid or stale")]
    SlotInvalid,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("out of memory: no free call slots")]
    OutOfMemory,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConnectorError {
    /// The reserved-band code for this error, independent of any
    /// application-level code the engine itself returns.
    pub fn code(&self) -> i32 {
        use codes::*;
        match self {
            ConnectorError::TransportClosed
            | ConnectorError::Timeout
            | ConnectorError::EngineUnavailable
            | ConnectorError::NotConnected => TRANSPORT_BAND_START,
            ConnectorError::HandshakeFailed(_) | ConnectorError::Protocol(_) => PROTOCOL_BAND_START,
            ConnectorError::AlreadyPending | ConnectorError::SlotInvalid => {
                INTERNAL_BAND_START - 1
            }
            ConnectorError::OutOfMemory => INTERNAL_BAND_START - 2,
            ConnectorError::Internal(_) => INTERNAL_BAND_START,
        }
    }
}

impl From<TransportError> for ConnectorError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => ConnectorError::Timeout,
            TransportError::Closed => ConnectorError::TransportClosed,
            TransportError::HandshakeFailed => {
                ConnectorError::HandshakeFailed("peer did not send the handshake byte".into())
            }
            TransportError::Io(io) => ConnectorError::Internal(io.to_string()),
        }
    }
}

impl From<WireError> for ConnectorError {
    fn from(e: WireError) -> Self {
        ConnectorError::Protocol(e.to_string())
    }
}

/// An engine-side invocation failure, decoded from the `Value` variant it
/// arrives in: an error code, an optional parameter index, and an optional
/// detail string (spec §4.8).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationError {
    /// `index` is zero-based as sent on the wire; rendered as 1-based
    /// because that is how a spreadsheet function's own argument positions
    /// are numbered everywhere else the user sees them.
    ParameterConversion { index: i32, detail: String },
    ResultConversion { detail: String },
    Other { code: i32 },
}

/// Renders an [`InvocationError`] the way the host surfaces it to a user.
pub fn render_invocation_error(error: &InvocationError) -> String {
    match error {
        InvocationError::ParameterConversion { index, detail } => {
            format!("Invalid parameter {} - {detail}", index + 1)
        }
        InvocationError::ResultConversion { detail } => {
            format!("Invalid function result - {detail}")
        }
        InvocationError::Other { code } => format!("Error {code}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_parameter_errors_with_a_one_based_index() {
        let rendered = render_invocation_error(&InvocationError::ParameterConversion {
            index: 2,
            detail: "expected a number".into(),
        });
        assert_eq!(rendered, "Invalid parameter 3 - expected a number");
    }

    #[test]
    fn renders_result_conversion_errors() {
        let rendered = render_invocation_error(&InvocationError::ResultConversion {
            detail: "not serializable".into(),
        });
        assert_eq!(rendered, "Invalid function result - not serializable");
    }

    #[test]
    fn renders_unknown_codes_verbatim() {
        let rendered = render_invocation_error(&InvocationError::Other { code: 42 });
        assert_eq!(rendered, "Error 42");
    }

    #[test]
    fn transport_closed_and_timeout_share_the_transport_band() {
        assert_eq!(
            ConnectorError::TransportClosed.code(),
            ConnectorError::Timeout.code()
        );
    }
}
