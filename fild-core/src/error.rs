//! Errors raised while serving a connection.

use std::io;

use crate::channel::ChannelError;
use crate::protocol::ResponseCode;

/// Anything that aborts the packet or operation being processed.
#[derive(Debug, thiserror::Error)]
pub enum ObexError {
    #[error("transport: {0}")]
    Channel(#[from] ChannelError),
    #[error("packet length {0} is shorter than its prologue")]
    InvalidLength(u16),
    #[error("packet of {0} bytes exceeds the receive buffer")]
    DataTooBig(u16),
    #[error("malformed packet: {0}")]
    Invalid(&'static str),
    #[error("packet does not fit the transmit buffer")]
    TxOverflow,
    #[error("not ready")]
    NotReady,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("unsupported operation 0x{0:02x}")]
    UnsupportedOperation(u8),
    #[error("unsupported header 0x{0:02x}")]
    UnsupportedHeader(u8),
    #[error("unsupported {0}")]
    Unsupported(&'static str),
    #[error("request rejected: {0}")]
    Rejected(&'static str),
    #[error("{context}: {source}")]
    FileSystem {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ObexError {
    /// Adapter for `map_err` on file-system calls.
    pub fn fs(context: &'static str) -> impl FnOnce(io::Error) -> ObexError {
        move |source| ObexError::FileSystem { context, source }
    }

    /// Response code sent to the peer when this error ends a request.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            ObexError::UnknownOpcode(_) | ObexError::UnsupportedOperation(_) => {
                ResponseCode::BadRequest
            }
            ObexError::NotReady => ResponseCode::ServiceUnavailable,
            _ => ResponseCode::InternalServerError,
        }
    }

    /// Errors coming from the channel itself rather than from packet content.
    pub fn is_transport(&self) -> bool {
        matches!(self, ObexError::Channel(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_mapping_is_total() {
        assert_eq!(
            ObexError::UnsupportedOperation(0x85).response_code(),
            ResponseCode::BadRequest
        );
        assert_eq!(
            ObexError::UnknownOpcode(0x7A).response_code(),
            ResponseCode::BadRequest
        );
        assert_eq!(ObexError::NotReady.response_code(), ResponseCode::ServiceUnavailable);
        for other in [
            ObexError::Channel(ChannelError::Eof),
            ObexError::InvalidLength(2),
            ObexError::DataTooBig(9000),
            ObexError::Invalid("x"),
            ObexError::TxOverflow,
            ObexError::UnsupportedHeader(0x46),
            ObexError::Unsupported("action"),
            ObexError::Rejected("no name"),
            ObexError::fs("open")(io::Error::from(io::ErrorKind::NotFound)),
        ] {
            assert_eq!(other.response_code(), ResponseCode::InternalServerError);
        }
    }

    #[test]
    fn only_channel_errors_are_transport() {
        assert!(ObexError::Channel(ChannelError::Closed).is_transport());
        assert!(!ObexError::DataTooBig(9000).is_transport());
    }
}
