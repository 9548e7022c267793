use std::time::Duration;

use crate::chain::{ChainError, KeepAddress};
use crate::registry::RegistryError;
use crate::tecdsa::ProtocolError;

/// Errors surfaced by the keep lifecycle engine.
///
/// The retry executor consults [`ClientError::is_transient`] to decide
/// whether an operation is worth another attempt. Everything else terminates
/// the operation (or the whole supervisor, for policy errors) immediately.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A signing event arrived but no committed signer showed up within the
    /// grace period. Usually a key generation still persisting; retriable.
    #[error("no committed signer for keep [{keep:?}] after {waited:?}")]
    AwaitingSigner { keep: KeepAddress, waited: Duration },

    /// The keep cannot be serviced by this client at all.
    #[error("keep [{keep:?}] has unsupported shape: {reason}")]
    UnsupportedKeepShape { keep: KeepAddress, reason: String },

    #[error("operation did not complete within {0:?}")]
    RetryTimeout(Duration),

    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Chain(err) => err.is_transient(),
            ClientError::Protocol(err) => err.is_transient(),
            ClientError::AwaitingSigner { .. } => true,
            ClientError::Registry(_)
            | ClientError::UnsupportedKeepShape { .. }
            | ClientError::RetryTimeout(_)
            | ClientError::Cancelled => false,
        }
    }
}
