//! Attestation Service
//!
//! Loads secrets and probes for an enclave once at startup, then serves the
//! resulting attestation status over JSON-RPC.
//!
//! # Transports
//!
//! - **streamable-http** (default): `MCP_TRANSPORT=streamable-http`, `POST /mcp` on port 8080
//! - **raw-rpc** (testing): `MCP_TRANSPORT=raw-rpc`, line-delimited JSON-RPC over TCP
//! - **stdio**: `MCP_TRANSPORT=stdio`

use anyhow::{Context, Result};
use std::sync::Arc;
use tee_attest::config::ServerConfig;
use tee_attest::enclave::{AttestationProvider, HostProbe, SecurityContextQuote};
use tee_attest::rpc::RpcHandler;
use tee_attest::secrets::SecretGate;
use tee_attest::server;
use tee_attest::status::{SecretFlags, StatusAggregator};
use tee_attest::tools::Toolbox;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tee_attest::init_tracing("info")?;

    info!("Starting attestation service...");

    let config = ServerConfig::from_env().context("Invalid configuration")?;
    info!(
        server = %config.server_name,
        version = %config.version,
        transport = ?config.transport,
        "Configuration loaded"
    );

    // Secrets are read before any listener exists; the tools share the gate
    let secrets = Arc::new(SecretGate::load_env(&config.secret_names));
    let loaded: SecretFlags = secrets
        .snapshot()
        .into_iter()
        .map(|record| (record.name, record.loaded))
        .collect();
    info!(secrets = %serde_json::to_string(&loaded)?, "Secrets loaded");

    let mut provider = AttestationProvider::new(HostProbe::new(config.tee_indicators.clone()));
    if let Some(dir) = &config.security_context_dir {
        provider = provider.with_quote_source(SecurityContextQuote::new(dir));
    }
    let claim = provider.attest();

    let status = StatusAggregator::new(
        &claim,
        &secrets.snapshot(),
        &config.server_name,
        &config.version,
    );
    info!(
        running_in_tee = claim.present(),
        tee_type = %claim.kind(),
        verdict = status.status().verdict(),
        "Attestation status built"
    );

    let tools = Toolbox::new(Arc::clone(&secrets), &config.server_name)
        .context("Failed to set up tools")?;
    let handler = Arc::new(RpcHandler::with_tools(status, Arc::new(tools)));
    server::run(&config, handler).await?;

    Ok(())
}
