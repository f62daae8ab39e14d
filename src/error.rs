use std::io;

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// RPC error types
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// A bounded queue was full; the caller may retry later.
    #[error("Too many outstanding requests ({0}), please slow down")]
    Backpressure(&'static str),

    /// Another call with the same correlation id is still waiting for its reply.
    #[error("ID {0} already used for outstanding request")]
    DuplicateId(i64),

    /// The remote peer answered with an error object.
    #[error("RPC error [{code}]: {message}")]
    Protocol { code: i64, message: String },

    /// The byte stream has terminated. Terminal for the connection.
    #[error("EOF")]
    TransportEnded,

    /// A graceful stop did not finish within the allotted time.
    #[error("{0} timed out during stop serving")]
    ShutdownTimeout(&'static str),

    /// A value on the wire could not be decoded into a message. Not fatal.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Remote error code, if this error was reported by the peer.
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for the end-of-stream sentinel.
    pub fn is_transport_ended(&self) -> bool {
        matches!(self, RpcError::TransportEnded)
    }

    /// Maps an I/O failure onto the error taxonomy: a closed or reset stream is
    /// end-of-stream, anything else is reported as is.
    pub(crate) fn from_transport(err: io::Error) -> Self {
        if is_disconnect(&err) {
            RpcError::TransportEnded
        } else {
            RpcError::Io(err)
        }
    }
}

pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::WriteZero
    )
}
