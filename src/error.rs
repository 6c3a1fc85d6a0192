//! Error types for the attestation service and its tooling

use thiserror::Error;

/// Errors that can occur while binding, serving or verifying attestation state
///
/// No variant ever carries a secret value. `SecretUnavailable` names the
/// secret, nothing more.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Placeholder not found in template; apply policy digest {digest} manually")]
    PlaceholderMissing { digest: String },

    #[error("Secret {name} is not available; attestation may have failed")]
    SecretUnavailable { name: String },

    #[error("Invalid tool input: {0}")]
    ToolInput(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Quote error: {0}")]
    Quote(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Timed out after {0} ms")]
    Timeout(u128),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// True when the remote side could not be reached at all
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
