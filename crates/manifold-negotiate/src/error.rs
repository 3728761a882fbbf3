//! Negotiation failure taxonomy.

use std::fmt;
use std::io;

use manifold_wire::WireError;

/// Why a tool left the negotiation without a solution.
#[derive(Debug)]
pub enum NegotiateError {
    /// Environment variables or declared parameters are unusable.
    Config(String),
    /// A block's wire image was malformed.
    Wire(WireError),
    /// A peer violated the protocol.
    Protocol(String),
    /// The final graph does not satisfy this tool's declared arities.
    ArityMismatch {
        name: String,
        pid: i32,
        requires: u32,
        incoming: u32,
        provides: u32,
        outgoing: u32,
    },
    /// Reading or writing a negotiation descriptor failed.
    Io {
        context: &'static str,
        source: io::Error,
    },
}

impl NegotiateError {
    pub(crate) fn io(context: &'static str, source: io::Error) -> Self {
        NegotiateError::Io { context, source }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        NegotiateError::Protocol(message.into())
    }
}

impl fmt::Display for NegotiateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiateError::Config(msg) => write!(f, "configuration error: {msg}"),
            NegotiateError::Wire(e) => write!(f, "malformed message block: {e}"),
            NegotiateError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            NegotiateError::ArityMismatch {
                name,
                pid,
                requires,
                incoming,
                provides,
                outgoing,
            } => write!(
                f,
                "failed to satisfy requirements for tool {name} (pid {pid}): \
                 requires {requires} and gets {incoming}, \
                 provides {provides} and is offered {outgoing}"
            ),
            NegotiateError::Io { context, source } => write!(f, "{context}: {source}"),
        }
    }
}

impl std::error::Error for NegotiateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NegotiateError::Wire(e) => Some(e),
            NegotiateError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<WireError> for NegotiateError {
    fn from(e: WireError) -> Self {
        NegotiateError::Wire(e)
    }
}
