use thiserror::Error;

use crate::provisioning::ProvisioningError;
use crate::transport::TransportError;
use crate::util::crypto::InvalidSecretFormat;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    InvalidSecret(#[from] InvalidSecretFormat),

    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session is not connected")]
    NotConnected,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("connect was cancelled by disconnect")]
    Cancelled,
}

impl SessionError {
    /// Whether trying again later may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidSecret(_) => false,
            Self::Provisioning(err) => err.is_transient(),
            Self::Transport(TransportError::Unauthorized(_)) => false,
            Self::Cancelled => false,
            _ => true,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command {0} was already answered")]
    DuplicateReply(String),
}
