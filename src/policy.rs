//! Binding a confidential-container security policy to a key release policy
//!
//! The security policy generated for a container group is hashed with
//! SHA-256. The hex digest is the measurement the hardware reports for that
//! policy, so writing it into the release policy template means the key
//! store only hands secrets to a container running under exactly that policy.
//!
//! Binding is textual: every occurrence of the placeholder token is replaced
//! with the digest. Re-running against an already bound file is a no-op.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::digest::{digest, SHA256};
use std::path::Path;
use tracing::{info, warn};

/// Placeholder token the release policy template carries for the digest
pub const POLICY_HASH_PLACEHOLDER: &str = "__POLICY_HASH__";

/// A security policy and its SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDocument {
    bytes: Vec<u8>,
    digest: String,
}

impl PolicyDocument {
    /// Wraps raw policy bytes and computes their digest
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let digest = sha256_hex(&bytes);
        Self { bytes, digest }
    }

    /// Decodes a base64 policy, as emitted by the policy generator
    ///
    /// Surrounding whitespace and line breaks are ignored.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = BASE64
            .decode(compact.as_bytes())
            .map_err(|e| Error::Policy(format!("Invalid base64 policy: {}", e)))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex SHA-256 of the policy bytes
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// What to do when the template has no placeholder left to fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaceholderMode {
    /// Warn and hand the digest to the operator
    #[default]
    Advisory,
    /// Fail the binding
    Strict,
}

/// Result of a binding attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// The placeholder was replaced `replacements` times
    Bound { replacements: usize },
    /// No placeholder, but the digest is already in the template
    AlreadyBound,
    /// No placeholder and no digest; the artifact needs manual follow-up
    Unbound,
}

/// A template after binding
#[derive(Debug, Clone)]
pub struct BoundArtifact {
    pub text: String,
    pub digest: String,
    pub outcome: BindOutcome,
}

impl BoundArtifact {
    /// True when the text differs from the input template
    pub fn changed(&self) -> bool {
        matches!(self.outcome, BindOutcome::Bound { .. })
    }
}

/// Binds a policy digest into template text
#[derive(Debug, Clone)]
pub struct PolicyBinder {
    placeholder: String,
    mode: PlaceholderMode,
}

impl Default for PolicyBinder {
    fn default() -> Self {
        Self::new(POLICY_HASH_PLACEHOLDER, PlaceholderMode::default())
    }
}

impl PolicyBinder {
    pub fn new(placeholder: impl Into<String>, mode: PlaceholderMode) -> Self {
        Self {
            placeholder: placeholder.into(),
            mode,
        }
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    pub fn mode(&self) -> PlaceholderMode {
        self.mode
    }

    /// Substitutes the policy digest for every placeholder in `template`
    ///
    /// Never performs IO. In strict mode a template with neither placeholder
    /// nor digest is an error; in advisory mode it is returned unchanged with
    /// `BindOutcome::Unbound` and a warning carrying the digest.
    pub fn bind(&self, policy: &PolicyDocument, template: &str) -> Result<BoundArtifact> {
        if self.placeholder.is_empty() {
            return Err(Error::Config("Placeholder token must not be empty".to_string()));
        }

        let digest = policy.digest().to_string();
        let replacements = template.matches(self.placeholder.as_str()).count();

        let outcome = if replacements > 0 {
            BindOutcome::Bound { replacements }
        } else if template.contains(digest.as_str()) {
            BindOutcome::AlreadyBound
        } else {
            BindOutcome::Unbound
        };

        match outcome {
            BindOutcome::Bound { replacements } => {
                info!(digest = %digest, replacements, "Bound policy digest into template");
                Ok(BoundArtifact {
                    text: template.replace(self.placeholder.as_str(), &digest),
                    digest,
                    outcome,
                })
            }
            BindOutcome::AlreadyBound => {
                info!(digest = %digest, "Template already carries the policy digest");
                Ok(BoundArtifact {
                    text: template.to_string(),
                    digest,
                    outcome,
                })
            }
            BindOutcome::Unbound => match self.mode {
                PlaceholderMode::Strict => Err(Error::PlaceholderMissing { digest }),
                PlaceholderMode::Advisory => {
                    warn!(
                        placeholder = %self.placeholder,
                        digest = %digest,
                        "Placeholder not found; apply the policy digest manually"
                    );
                    Ok(BoundArtifact {
                        text: template.to_string(),
                        digest,
                        outcome,
                    })
                }
            },
        }
    }

    /// Binds the template file at `path` in place
    ///
    /// The file is only rewritten when the text actually changed, so the
    /// operation is safe to re-run.
    pub fn bind_file(&self, policy: &PolicyDocument, path: &Path) -> Result<BoundArtifact> {
        self.bind_file_to(policy, path, path)
    }

    /// Binds the template at `template_path` and writes the result to `output_path`
    pub fn bind_file_to(
        &self,
        policy: &PolicyDocument,
        template_path: &Path,
        output_path: &Path,
    ) -> Result<BoundArtifact> {
        let template = std::fs::read_to_string(template_path)?;
        let artifact = self.bind(policy, &template)?;

        if artifact.changed() || template_path != output_path {
            std::fs::write(output_path, &artifact.text)?;
        }

        Ok(artifact)
    }
}

/// Lowercase hex SHA-256 of `bytes`
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(digest(&SHA256, bytes).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_digest_of_abc() {
        let policy = PolicyDocument::from_bytes(b"abc".to_vec());
        assert_eq!(policy.digest(), ABC_SHA256);
    }

    #[test]
    fn test_bind_replaces_placeholder() {
        let policy = PolicyDocument::from_bytes(b"abc".to_vec());
        let template = r#"{"anyOf":[{"allOf":[{"claim":"x-ms-sevsnpvm-hostdata","equals":"__POLICY_HASH__"}]}]}"#;

        let artifact = PolicyBinder::default().bind(&policy, template).unwrap();

        assert_eq!(artifact.outcome, BindOutcome::Bound { replacements: 1 });
        assert!(artifact.text.contains(ABC_SHA256));
        assert_eq!(artifact.text.matches(POLICY_HASH_PLACEHOLDER).count(), 0);
    }

    #[test]
    fn test_bind_replaces_every_occurrence() {
        let policy = PolicyDocument::from_bytes(b"abc".to_vec());
        let template = "a=__POLICY_HASH__\nb=__POLICY_HASH__\n";

        let artifact = PolicyBinder::default().bind(&policy, template).unwrap();

        assert_eq!(artifact.outcome, BindOutcome::Bound { replacements: 2 });
        assert_eq!(artifact.text, format!("a={0}\nb={0}\n", ABC_SHA256));
    }

    #[test]
    fn test_rebinding_is_noop() {
        let policy = PolicyDocument::from_bytes(b"policy".to_vec());
        let binder = PolicyBinder::default();

        let first = binder.bind(&policy, "hash: __POLICY_HASH__").unwrap();
        let second = binder.bind(&policy, &first.text).unwrap();

        assert_eq!(second.outcome, BindOutcome::AlreadyBound);
        assert_eq!(second.text, first.text);
        assert!(!second.changed());
    }

    #[test]
    fn test_same_bytes_same_digest() {
        let binder = PolicyBinder::default();
        let a = binder
            .bind(&PolicyDocument::from_bytes(b"same".to_vec()), "__POLICY_HASH__")
            .unwrap();
        let b = binder
            .bind(&PolicyDocument::from_bytes(b"same".to_vec()), "__POLICY_HASH__")
            .unwrap();
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.text, b.text);
    }

    #[test]
    fn test_missing_placeholder_is_advisory_by_default() {
        let policy = PolicyDocument::from_bytes(b"abc".to_vec());
        let artifact = PolicyBinder::default().bind(&policy, "no token here").unwrap();

        assert_eq!(artifact.outcome, BindOutcome::Unbound);
        assert_eq!(artifact.text, "no token here");
        assert_eq!(artifact.digest, ABC_SHA256);
    }

    #[test]
    fn test_missing_placeholder_strict_fails_with_digest() {
        let policy = PolicyDocument::from_bytes(b"abc".to_vec());
        let binder = PolicyBinder::new(POLICY_HASH_PLACEHOLDER, PlaceholderMode::Strict);

        match binder.bind(&policy, "no token here") {
            Err(Error::PlaceholderMissing { digest }) => assert_eq!(digest, ABC_SHA256),
            other => panic!("expected PlaceholderMissing, got {:?}", other),
        }
    }

    #[test]
    fn test_strict_accepts_already_bound() {
        let policy = PolicyDocument::from_bytes(b"abc".to_vec());
        let binder = PolicyBinder::new(POLICY_HASH_PLACEHOLDER, PlaceholderMode::Strict);
        let artifact = binder.bind(&policy, &format!("hash={}", ABC_SHA256)).unwrap();
        assert_eq!(artifact.outcome, BindOutcome::AlreadyBound);
    }

    #[test]
    fn test_from_base64_decodes_before_hashing() {
        // "abc" in base64, wrapped the way generators tend to emit it
        let policy = PolicyDocument::from_base64("YW\nJj\n").unwrap();
        assert_eq!(policy.bytes(), b"abc");
        assert_eq!(policy.digest(), ABC_SHA256);
    }

    #[test]
    fn test_from_base64_rejects_garbage() {
        assert!(matches!(
            PolicyDocument::from_base64("not base64!"),
            Err(Error::Policy(_))
        ));
    }

    #[test]
    fn test_empty_placeholder_rejected() {
        let policy = PolicyDocument::from_bytes(b"abc".to_vec());
        let binder = PolicyBinder::new("", PlaceholderMode::Advisory);
        assert!(matches!(binder.bind(&policy, "x"), Err(Error::Config(_))));
    }

    #[test]
    fn test_bind_file_in_place_is_rerunnable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skr-policy.json");
        std::fs::write(&path, r#"{"hash":"__POLICY_HASH__"}"#).unwrap();

        let policy = PolicyDocument::from_bytes(b"abc".to_vec());
        let binder = PolicyBinder::default();

        let first = binder.bind_file(&policy, &path).unwrap();
        assert!(first.changed());
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk, format!(r#"{{"hash":"{}"}}"#, ABC_SHA256));

        let second = binder.bind_file(&policy, &path).unwrap();
        assert_eq!(second.outcome, BindOutcome::AlreadyBound);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), on_disk);
    }

    #[test]
    fn test_bind_file_to_separate_output() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.json");
        let output = dir.path().join("bound.json");
        std::fs::write(&template, "__POLICY_HASH__").unwrap();

        let policy = PolicyDocument::from_bytes(b"abc".to_vec());
        PolicyBinder::default()
            .bind_file_to(&policy, &template, &output)
            .unwrap();

        assert_eq!(std::fs::read_to_string(&template).unwrap(), "__POLICY_HASH__");
        assert_eq!(std::fs::read_to_string(&output).unwrap(), ABC_SHA256);
    }
}
