//! Crate-wide error kinds

use thiserror::Error;

/// Errors raised by the directory, the router and the transports.
///
/// The per-receiver forwarding loop treats `Transport`, `ProtocolNotActive`
/// and `SignatureRejected` as "this location did not work, try the next";
/// every other kind surfaces to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Registration collision in the directory or the local handler registry
    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),

    /// Lookup or deregistration miss
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed address, malformed configuration or invalid regex
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport activation requested twice for the same type
    #[error("transport '{0}' is already active")]
    AlreadyActive(String),

    /// No active transport matches the protocol of the target address
    #[error("transport protocol '{0}' is not active or supported")]
    ProtocolNotActive(String),

    /// The location's signature type is not on the accepted list
    #[error("service signature type '{signature_type}' rejected for '{receiver}'")]
    SignatureRejected {
        receiver: String,
        signature_type: String,
    },

    /// Wire-level failure: connect, write or read
    #[error("transport failure: {0}")]
    Transport(String),

    /// Outgoing payload exceeds the transport's published message limit
    #[error("message of {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures the forwarding loop may absorb by trying the
    /// receiver's next service location.
    pub fn is_routing_failure(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::ProtocolNotActive(_)
                | Error::SignatureRejected { .. }
                | Error::TooLarge { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
