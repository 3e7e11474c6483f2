use crate::mock::MockKind;
use std::io::ErrorKind;
use thiserror::Error;

/// Error taxonomy of the interception core. Decoding failures close the
/// flow; `MockNotFound` is additionally forwarded to the external error
/// channel so test monitors can surface replay gaps.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("short buffer: need at least {needed} more bytes")]
    ShortBuffer { needed: usize },

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("unsupported {field} value {value:#x}")]
    Unsupported { field: &'static str, value: u64 },

    #[error("failed to dial upstream {addr}")]
    UpstreamDial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no {kind:?} mock matched the request on connection {connection_id}")]
    MockNotFound {
        kind: MockKind,
        connection_id: String,
    },

    #[error("no destination registered for source port {0}")]
    DestNotFound(u16),

    #[error("no session registered for app {0}")]
    SessionNotFound(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("tls handshake with client failed: {0}")]
    TlsHandshake(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        ProxyError::Malformed {
            what,
            reason: reason.into(),
        }
    }

    /// Duplicate the error for the monitor channel. `io::Error` is not
    /// `Clone`; its kind and message are carried over.
    pub fn clone_shallow(&self) -> ProxyError {
        match self {
            ProxyError::ShortBuffer { needed } => ProxyError::ShortBuffer { needed: *needed },
            ProxyError::Malformed { what, reason } => ProxyError::Malformed {
                what,
                reason: reason.clone(),
            },
            ProxyError::Unsupported { field, value } => ProxyError::Unsupported {
                field,
                value: *value,
            },
            ProxyError::UpstreamDial { addr, source } => ProxyError::UpstreamDial {
                addr: addr.clone(),
                source: std::io::Error::new(source.kind(), source.to_string()),
            },
            ProxyError::MockNotFound {
                kind,
                connection_id,
            } => ProxyError::MockNotFound {
                kind: *kind,
                connection_id: connection_id.clone(),
            },
            ProxyError::DestNotFound(port) => ProxyError::DestNotFound(*port),
            ProxyError::SessionNotFound(app) => ProxyError::SessionNotFound(*app),
            ProxyError::Cancelled => ProxyError::Cancelled,
            ProxyError::TlsHandshake(msg) => ProxyError::TlsHandshake(msg.clone()),
            ProxyError::Io(e) => ProxyError::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }

    /// EOF, reset-by-peer and friends mark the natural end of a flow
    /// rather than a failure.
    pub fn is_benign_disconnect(&self) -> bool {
        match self {
            ProxyError::Cancelled => true,
            ProxyError::Io(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_disconnect_classification() {
        let eof = ProxyError::Io(std::io::Error::new(ErrorKind::UnexpectedEof, "eof"));
        assert!(eof.is_benign_disconnect());
        assert!(ProxyError::Cancelled.is_benign_disconnect());
        let malformed = ProxyError::malformed("resp", "bad prefix");
        assert!(!malformed.is_benign_disconnect());
    }
}
