//! Service configuration
//!
//! Everything is read from the environment once at startup. Unset variables
//! fall back to the defaults below.

use crate::enclave::DEFAULT_TEE_INDICATORS;
use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

/// Server identifier reported in the status payload
pub const DEFAULT_SERVER_NAME: &str = "mcp-tee-server";

/// Default listening port
pub const DEFAULT_PORT: u16 = 8080;

/// Credentials the service needs, in the order they are reported
pub const DEFAULT_SECRET_NAMES: &[&str] = &["GITHUB_TOKEN", "DB_CONNECTION_STRING", "WEBHOOK_URL"];

/// How the JSON-RPC endpoint is exposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// JSON-RPC over HTTP POST
    #[default]
    StreamableHttp,
    /// Line-delimited JSON-RPC over TCP
    RawRpc,
    /// Line-delimited JSON-RPC over stdin/stdout
    Stdio,
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streamable-http" | "http" => Ok(Transport::StreamableHttp),
            "raw-rpc" | "tcp" => Ok(Transport::RawRpc),
            "stdio" => Ok(Transport::Stdio),
            other => Err(Error::Config(format!("Unknown transport: {}", other))),
        }
    }
}

/// Configuration for the attestation service
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_name: String,
    pub version: String,
    /// Environment variables holding the credentials, in report order
    pub secret_names: Vec<String>,
    pub transport: Transport,
    pub listen_addr: SocketAddr,
    /// Paths whose presence indicates an enclave
    pub tee_indicators: Vec<PathBuf>,
    /// Directory holding the confidential container security context
    pub security_context_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            secret_names: DEFAULT_SECRET_NAMES.iter().map(|s| s.to_string()).collect(),
            transport: Transport::default(),
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            tee_indicators: DEFAULT_TEE_INDICATORS.iter().map(PathBuf::from).collect(),
            security_context_dir: None,
        }
    }
}

impl ServerConfig {
    /// Reads configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`
    ///
    /// An unknown transport falls back to HTTP with a warning. A malformed
    /// host or port is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(name) = get("SERVER_NAME") {
            config.server_name = name;
        }
        if let Some(version) = get("SERVER_VERSION") {
            config.version = version;
        }
        if let Some(names) = get("SECRET_NAMES") {
            config.secret_names = split_list(&names, ',');
        }
        if let Some(transport) = get("MCP_TRANSPORT") {
            config.transport = transport.parse().unwrap_or_else(|_| {
                warn!(transport = %transport, "Unknown MCP_TRANSPORT, falling back to streamable-http");
                Transport::StreamableHttp
            });
        }
        if let Some(host) = get("HOST") {
            let ip: IpAddr = host
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("Invalid HOST {}: {}", host, e)))?;
            config.listen_addr.set_ip(ip);
        }
        if let Some(port) = get("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("Invalid PORT {}: {}", port, e)))?;
            config.listen_addr.set_port(port);
        }
        if let Some(indicators) = get("TEE_INDICATORS") {
            config.tee_indicators = split_list(&indicators, ':')
                .into_iter()
                .map(PathBuf::from)
                .collect();
        }
        config.security_context_dir = get("UVM_SECURITY_CONTEXT_DIR").map(PathBuf::from);

        Ok(config)
    }
}

fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_default() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.server_name, DEFAULT_SERVER_NAME);
        assert_eq!(config.secret_names, DEFAULT_SECRET_NAMES);
        assert_eq!(config.transport, Transport::StreamableHttp);
        assert_eq!(config.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(config.tee_indicators.len(), DEFAULT_TEE_INDICATORS.len());
        assert!(config.security_context_dir.is_none());
    }

    #[test]
    fn test_secret_names_keep_order() {
        let config = config_from(&[("SECRET_NAMES", " B_TOKEN, A_URL ,,C ")]).unwrap();
        assert_eq!(config.secret_names, vec!["B_TOKEN", "A_URL", "C"]);
    }

    #[test]
    fn test_transport_selection() {
        assert_eq!(
            config_from(&[("MCP_TRANSPORT", "stdio")]).unwrap().transport,
            Transport::Stdio
        );
        assert_eq!(
            config_from(&[("MCP_TRANSPORT", "raw-rpc")]).unwrap().transport,
            Transport::RawRpc
        );
    }

    #[test]
    fn test_unknown_transport_falls_back() {
        let config = config_from(&[("MCP_TRANSPORT", "carrier-pigeon")]).unwrap();
        assert_eq!(config.transport, Transport::StreamableHttp);
    }

    #[test]
    fn test_listen_address() {
        let config = config_from(&[("HOST", "127.0.0.1"), ("PORT", "9090")]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9090".parse().unwrap());
    }

    #[test]
    fn test_invalid_port_is_error() {
        assert!(matches!(
            config_from(&[("PORT", "eighty")]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_indicators_and_security_context() {
        let config = config_from(&[
            ("TEE_INDICATORS", "/dev/sev-guest:/dev/tdx_guest"),
            ("UVM_SECURITY_CONTEXT_DIR", "/security-context"),
        ])
        .unwrap();
        assert_eq!(
            config.tee_indicators,
            vec![PathBuf::from("/dev/sev-guest"), PathBuf::from("/dev/tdx_guest")]
        );
        assert_eq!(
            config.security_context_dir,
            Some(PathBuf::from("/security-context"))
        );
    }
}
