//! Error type for proxied client calls

use crate::client::{ServiceError, SessionError};
use crate::dispatch::DispatchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Body read error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// The service failure, if the error came from the client itself
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            BridgeError::Service(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, BridgeError::Config(_) | BridgeError::Session(_))
    }
}

impl From<crate::config::ConfigError> for BridgeError {
    fn from(e: crate::config::ConfigError) -> Self {
        BridgeError::Config(e.to_string())
    }
}
