//! Enclave presence detection and hardware evidence
//!
//! At startup the service asks an [`EnclaveProbe`] whether it is running
//! inside a hardware-isolated enclave. The host probe looks for the device
//! nodes and securityfs entries a confidential VM exposes; tests substitute
//! a [`FixedProbe`].
//!
//! Detection is a heuristic, not proof. When an enclave is present and a
//! [`QuoteSource`] is configured, the provider also collects the hardware
//! evidence a key release authority would validate, and carries it forward
//! untouched.
//!
//! Running outside an enclave is an ordinary result (local development),
//! never an error.

use crate::error::{Error, Result};
use crate::policy::PolicyDocument;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Paths whose presence indicates a hardware-isolated enclave
pub const DEFAULT_TEE_INDICATORS: &[&str] =
    &["/dev/sev-guest", "/dev/sev", "/sys/kernel/security/tee"];

/// Kind of execution environment, as reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeeKind {
    None,
    HardwareEnclave,
}

impl TeeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeeKind::None => "none",
            TeeKind::HardwareEnclave => "hardware-enclave",
        }
    }
}

impl fmt::Display for TeeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    NoEnclave,
    EnclavePresent { indicator: PathBuf },
}

/// Decides whether the current process runs inside an enclave
///
/// Implementations must be side-effect free; probing twice on the same
/// machine gives the same answer.
pub trait EnclaveProbe: Send + Sync {
    fn probe(&self) -> Detection;
}

/// Probes the host filesystem for enclave indicators
#[derive(Debug, Clone)]
pub struct HostProbe {
    indicators: Vec<PathBuf>,
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new(DEFAULT_TEE_INDICATORS.iter().map(PathBuf::from).collect())
    }
}

impl HostProbe {
    pub fn new(indicators: Vec<PathBuf>) -> Self {
        Self { indicators }
    }

    pub fn indicators(&self) -> &[PathBuf] {
        &self.indicators
    }
}

impl EnclaveProbe for HostProbe {
    fn probe(&self) -> Detection {
        match self.indicators.iter().find(|path| path.exists()) {
            Some(path) => Detection::EnclavePresent {
                indicator: path.clone(),
            },
            None => Detection::NoEnclave,
        }
    }
}

/// A probe with a predetermined answer
#[derive(Debug, Clone)]
pub struct FixedProbe(pub Detection);

impl FixedProbe {
    pub fn no_enclave() -> Self {
        Self(Detection::NoEnclave)
    }

    pub fn enclave(indicator: impl Into<PathBuf>) -> Self {
        Self(Detection::EnclavePresent {
            indicator: indicator.into(),
        })
    }
}

impl EnclaveProbe for FixedProbe {
    fn probe(&self) -> Detection {
        self.0.clone()
    }
}

/// Hardware evidence describing the measured code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareQuote {
    /// Hex digest identifying the measured configuration
    pub measurement: String,
    /// Signed evidence over the measurement, as produced by the platform
    pub signature: Vec<u8>,
    pub platform_claims: BTreeMap<String, String>,
}

/// Produces hardware evidence for the running enclave
pub trait QuoteSource: Send + Sync {
    fn quote(&self) -> Result<HardwareQuote>;
}

const SECURITY_POLICY_FILE: &str = "security-policy-base64";
const REFERENCE_INFO_FILE: &str = "reference-info-base64";
const HOST_CERT_FILE: &str = "host-amd-cert-base64";

/// Reads the security context a confidential container runtime mounts
/// into the container
///
/// The measurement is the digest of the security policy the container group
/// was launched with, which is the value bound into the release policy.
#[derive(Debug, Clone)]
pub struct SecurityContextQuote {
    dir: PathBuf,
}

impl SecurityContextQuote {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_base64(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        BASE64
            .decode(compact.as_bytes())
            .map(Some)
            .map_err(|e| Error::Quote(format!("Invalid base64 in {}: {}", name, e)))
    }
}

impl QuoteSource for SecurityContextQuote {
    fn quote(&self) -> Result<HardwareQuote> {
        let policy_path = self.dir.join(SECURITY_POLICY_FILE);
        let encoded = std::fs::read_to_string(&policy_path).map_err(|e| {
            Error::Quote(format!("Cannot read {}: {}", policy_path.display(), e))
        })?;
        let policy = PolicyDocument::from_base64(&encoded)
            .map_err(|e| Error::Quote(e.to_string()))?;

        let reference_info = self.read_base64(REFERENCE_INFO_FILE)?;
        let host_cert = self.read_base64(HOST_CERT_FILE)?;

        let mut platform_claims = BTreeMap::new();
        platform_claims.insert(
            "security_context_dir".to_string(),
            self.dir.display().to_string(),
        );
        platform_claims.insert(
            "reference_info".to_string(),
            presence(reference_info.is_some()).to_string(),
        );
        platform_claims.insert(
            "host_amd_cert".to_string(),
            presence(host_cert.is_some()).to_string(),
        );

        Ok(HardwareQuote {
            measurement: policy.digest().to_string(),
            signature: reference_info.unwrap_or_default(),
            platform_claims,
        })
    }
}

fn presence(present: bool) -> &'static str {
    if present {
        "present"
    } else {
        "absent"
    }
}

/// What the provider found at startup. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationClaim {
    kind: TeeKind,
    detected_at: DateTime<Utc>,
    indicator: Option<PathBuf>,
    quote: Option<HardwareQuote>,
}

impl AttestationClaim {
    /// A claim for a process running outside any enclave
    pub fn none(detected_at: DateTime<Utc>) -> Self {
        Self {
            kind: TeeKind::None,
            detected_at,
            indicator: None,
            quote: None,
        }
    }

    /// A claim for a process running inside a hardware enclave
    pub fn enclave(
        indicator: impl Into<PathBuf>,
        quote: Option<HardwareQuote>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: TeeKind::HardwareEnclave,
            detected_at,
            indicator: Some(indicator.into()),
            quote,
        }
    }

    pub fn present(&self) -> bool {
        self.kind == TeeKind::HardwareEnclave
    }

    pub fn kind(&self) -> TeeKind {
        self.kind
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    /// The indicator that matched, if any
    pub fn indicator(&self) -> Option<&Path> {
        self.indicator.as_deref()
    }

    pub fn quote(&self) -> Option<&HardwareQuote> {
        self.quote.as_ref()
    }
}

/// Detects the enclave and gathers evidence for it
pub struct AttestationProvider {
    probe: Box<dyn EnclaveProbe>,
    quote_source: Option<Box<dyn QuoteSource>>,
}

impl AttestationProvider {
    pub fn new(probe: impl EnclaveProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            quote_source: None,
        }
    }

    /// Consults `source` for hardware evidence whenever an enclave is detected
    pub fn with_quote_source(mut self, source: impl QuoteSource + 'static) -> Self {
        self.quote_source = Some(Box::new(source));
        self
    }

    /// Probes the environment and returns the claim, stamped with the current time
    pub fn attest(&self) -> AttestationClaim {
        self.attest_at(Utc::now())
    }

    /// Probes the environment and returns the claim, stamped with `at`
    pub fn attest_at(&self, at: DateTime<Utc>) -> AttestationClaim {
        match self.probe.probe() {
            Detection::NoEnclave => {
                warn!("No enclave indicator found, running outside a TEE");
                AttestationClaim::none(at)
            }
            Detection::EnclavePresent { indicator } => {
                info!(indicator = %indicator.display(), "Enclave indicator found");
                let quote = self.collect_quote();
                AttestationClaim::enclave(indicator, quote, at)
            }
        }
    }

    fn collect_quote(&self) -> Option<HardwareQuote> {
        let source = self.quote_source.as_ref()?;
        match source.quote() {
            Ok(quote) => {
                info!(
                    measurement = %quote.measurement,
                    signature_len = quote.signature.len(),
                    "Collected hardware evidence"
                );
                Some(quote)
            }
            Err(e) => {
                warn!(error = %e, "Failed to collect hardware evidence, continuing without it");
                None
            }
        }
    }
}
