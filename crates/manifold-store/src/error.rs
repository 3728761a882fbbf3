//! Store failure taxonomy, with the exit code each failure maps to.

use std::fmt;
use std::io;

/// Anything that stops the store.
#[derive(Debug)]
pub enum StoreError {
    /// Bad flags, oversized socket path, or a full client table.
    Usage(String),
    /// A client broke the wire protocol, or a response header could not be
    /// written atomically.
    Protocol(String),
    /// Creating the listening socket failed.
    SocketSetup(io::Error),
    /// Descriptor I/O failed (bind included, like any other socket write).
    Io { context: String, source: io::Error },
    /// Marking the socket as listening failed.
    Listen(io::Error),
    /// Accepting a connection failed.
    Accept(io::Error),
}

impl StoreError {
    /// An I/O failure with a word of context, exit code 3.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    /// The process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StoreError::Usage(_) | StoreError::Protocol(_) => 1,
            StoreError::SocketSetup(_) => 2,
            StoreError::Io { .. } => 3,
            StoreError::Listen(_) => 4,
            StoreError::Accept(_) => 5,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Usage(msg) => write!(f, "{msg}"),
            StoreError::Protocol(msg) => write!(f, "{msg}"),
            StoreError::SocketSetup(e) => write!(f, "error creating socket: {e}"),
            StoreError::Io { context, source } => write!(f, "{context}: {source}"),
            StoreError::Listen(e) => write!(f, "listen: {e}"),
            StoreError::Accept(e) => write!(f, "accept: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::SocketSetup(e)
            | StoreError::Io { source: e, .. }
            | StoreError::Listen(e)
            | StoreError::Accept(e) => Some(e),
            _ => None,
        }
    }
}
