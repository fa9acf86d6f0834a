//! Error taxonomy for the receive path.
//!
//! Handlers return these to the frame loop; the loop decides the connection
//! transition. Individual handlers never tear the connection down
//! themselves.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplError {
    /// Timeout, refused, reset, interrupted. The connection retries without
    /// going standalone.
    #[error("transient network error: {0}")]
    NetworkTransient(io::Error),

    /// Unexpected close after handshake, malformed frame, digest mismatch.
    /// Transitions to NetworkFailure, disconnect and restart.
    #[error("fatal network error: {0}")]
    NetworkFatal(String),

    /// Version negotiation, incompatible settings or failed auth. The
    /// connection goes standalone.
    #[error("protocol incompatible: {0}")]
    ProtocolIncompatible(String),

    /// Submit or flush failure on the backing device.
    #[error("local io error: {0}")]
    LocalIo(String),

    /// Allocation shortage. Back off and retry, never crash.
    #[error("resource shortage: {0}")]
    Resource(String),

    /// Concurrent cluster state change; reported to the initiator, nothing
    /// committed.
    #[error("state change conflict")]
    StateConflict,

    /// Divergent histories on both sides; the configured policy ladder ran
    /// out of automatic answers.
    #[error("split brain detected, policy: {0}")]
    SplitBrain(String),
}

impl ReplError {
    /// Map an io error to the transient/fatal split of the failure policy.
    pub fn from_io(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            TimedOut | WouldBlock | ConnectionRefused | ConnectionReset | Interrupted
            | ConnectionAborted | NotConnected | AddrNotAvailable | NetworkUnreachable
            | HostUnreachable => ReplError::NetworkTransient(err),
            _ => ReplError::NetworkFatal(err.to_string()),
        }
    }

    /// True when the connection should keep its restart loop going.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplError::NetworkTransient(_) | ReplError::Resource(_))
    }

    /// True when the connection must stop retrying and go standalone.
    pub fn is_standalone(&self) -> bool {
        matches!(self, ReplError::ProtocolIncompatible(_))
    }

    pub fn malformed(what: impl Into<String>) -> Self {
        ReplError::NetworkFatal(format!("malformed frame: {}", what.into()))
    }
}

pub type Result<T> = std::result::Result<T, ReplError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_classification() {
        let e = ReplError::from_io(io::Error::from(io::ErrorKind::TimedOut));
        assert!(e.is_transient());

        let e = ReplError::from_io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(!e.is_transient());
        assert!(!e.is_standalone());

        assert!(ReplError::ProtocolIncompatible("auth".into()).is_standalone());
    }
}
