//! Attestation-gated secret release for confidential containers
//!
//! This library provides:
//! - Policy binding: hashing a security policy into a key release policy
//! - Enclave detection and hardware evidence collection
//! - Startup-time secret loading that only ever exposes load flags
//! - The attestation status record and the JSON-RPC endpoint serving it
//! - Secret-consuming tools that refuse to run when their secret did not load
//! - A remote verifier that checks a running service over the network

pub mod config;
pub mod enclave;
pub mod error;
pub mod policy;
pub mod rpc;
pub mod secrets;
pub mod server;
pub mod status;
pub mod tools;
pub mod verifier;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs the global tracing subscriber
///
/// Logs go to stderr so stdout stays free for protocol frames and reports.
/// `RUST_LOG` overrides `default_level`.
pub fn init_tracing(
    default_level: &str,
) -> std::result::Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}
