//! The attestation status record served to remote verifiers
//!
//! Built once at startup from the enclave claim and the secret snapshot, then
//! handed out by value. The timestamp is the moment the enclave was probed;
//! repeated queries return the same record.

use crate::enclave::{AttestationClaim, TeeKind};
use crate::secrets::SecretRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Wire shape of the status query response
///
/// Unknown fields are rejected when parsing, so a verifier never silently
/// defaults a field the service forgot to send. `tee_type` is free text on
/// the wire: this service emits `none` or `hardware-enclave`, other services
/// describe the platform in their own words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttestationStatus {
    pub server: String,
    pub version: String,
    pub running_in_tee: bool,
    pub tee_type: String,
    pub secrets_loaded: SecretFlags,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub timestamp: DateTime<Utc>,
}

fn serialize_rfc3339<S: Serializer>(
    timestamp: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
}

impl AttestationStatus {
    /// Enclave present and every declared secret loaded
    pub fn verdict(&self) -> bool {
        self.running_in_tee && self.secrets_loaded.values().all(|loaded| loaded)
    }

    /// Names of declared secrets that did not load, in declaration order
    pub fn missing_secrets(&self) -> Vec<&str> {
        self.secrets_loaded
            .iter()
            .filter(|(_, loaded)| !*loaded)
            .map(|(name, _)| name)
            .collect()
    }

    /// The canonical kind, when `tee_type` is one this service emits
    pub fn tee_kind(&self) -> Option<TeeKind> {
        [TeeKind::None, TeeKind::HardwareEnclave]
            .into_iter()
            .find(|kind| kind.as_str() == self.tee_type)
    }
}

/// Secret name to load flag, in the order the secrets were declared
///
/// Serialized as a JSON object whose keys keep that order. Parsing keeps the
/// order of the document and rejects a name that appears twice.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecretFlags(Vec<(String, bool)>);

impl SecretFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag for `name`, keeping its original position if already present
    pub fn insert(&mut self, name: impl Into<String>, loaded: bool) {
        let name = name.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, flag)) => *flag = loaded,
            None => self.0.push((name, loaded)),
        }
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, loaded)| *loaded)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(name, loaded)| (name.as_str(), *loaded))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = bool> + '_ {
        self.0.iter().map(|(_, loaded)| *loaded)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, bool)> for SecretFlags {
    fn from_iter<I: IntoIterator<Item = (S, bool)>>(iter: I) -> Self {
        let mut flags = SecretFlags::new();
        for (name, loaded) in iter {
            flags.insert(name, loaded);
        }
        flags
    }
}

impl Serialize for SecretFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, loaded) in &self.0 {
            map.serialize_entry(name, loaded)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SecretFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FlagsVisitor;

        impl<'de> Visitor<'de> for FlagsVisitor {
            type Value = SecretFlags;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of secret names to booleans")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<SecretFlags, A::Error> {
                let mut flags = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, loaded)) = access.next_entry::<String, bool>()? {
                    if flags.iter().any(|(existing, _): &(String, bool)| *existing == name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate secret name {}",
                            name
                        )));
                    }
                    flags.push((name, loaded));
                }
                Ok(SecretFlags(flags))
            }
        }

        deserializer.deserialize_map(FlagsVisitor)
    }
}

/// Combines a claim and a secret snapshot into a status record
pub fn build_status(
    claim: &AttestationClaim,
    secrets: &[SecretRecord],
    server_id: &str,
    version: &str,
) -> AttestationStatus {
    AttestationStatus {
        server: server_id.to_string(),
        version: version.to_string(),
        running_in_tee: claim.present(),
        tee_type: claim.kind().as_str().to_string(),
        secrets_loaded: secrets
            .iter()
            .map(|record| (record.name.clone(), record.loaded))
            .collect(),
        timestamp: claim.detected_at(),
    }
}

/// Holds the status built at startup and serves it to any number of callers
#[derive(Debug, Clone)]
pub struct StatusAggregator {
    status: Arc<AttestationStatus>,
}

impl StatusAggregator {
    pub fn new(
        claim: &AttestationClaim,
        secrets: &[SecretRecord],
        server_id: &str,
        version: &str,
    ) -> Self {
        Self::from_status(build_status(claim, secrets, server_id, version))
    }

    pub fn from_status(status: AttestationStatus) -> Self {
        Self {
            status: Arc::new(status),
        }
    }

    /// The status built at startup
    pub fn query(&self) -> AttestationStatus {
        (*self.status).clone()
    }

    pub fn status(&self) -> &AttestationStatus {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-04T05:06:07.123456Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn records(flags: &[(&str, bool)]) -> Vec<SecretRecord> {
        flags
            .iter()
            .map(|(name, loaded)| SecretRecord {
                name: name.to_string(),
                loaded: *loaded,
            })
            .collect()
    }

    #[test]
    fn test_build_status_is_deterministic() {
        let claim = AttestationClaim::enclave("/dev/sev-guest", None, at());
        let secrets = records(&[("GITHUB_TOKEN", true), ("WEBHOOK_URL", false)]);

        let a = build_status(&claim, &secrets, "mcp-tee-server", "1.0.0");
        let b = build_status(&claim, &secrets, "mcp-tee-server", "1.0.0");

        assert_eq!(a, b);
        assert!(a.running_in_tee);
        assert_eq!(a.tee_kind(), Some(TeeKind::HardwareEnclave));
        assert_eq!(a.timestamp, at());
        assert_eq!(a.secrets_loaded.get("GITHUB_TOKEN"), Some(true));
        assert_eq!(a.secrets_loaded.get("WEBHOOK_URL"), Some(false));
    }

    #[test]
    fn test_wire_shape() {
        let claim = AttestationClaim::none(at());
        let status = build_status(&claim, &records(&[("GITHUB_TOKEN", false)]), "svc", "2.0");
        let value = serde_json::to_value(&status).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "server": "svc",
                "version": "2.0",
                "running_in_tee": false,
                "tee_type": "none",
                "secrets_loaded": {"GITHUB_TOKEN": false},
                "timestamp": "2026-03-04T05:06:07.123456Z"
            })
        );
    }

    #[test]
    fn test_parse_rejects_unknown_fields() {
        let raw = r#"{"server":"s","version":"1","running_in_tee":true,"tee_type":"hardware-enclave",
            "secrets_loaded":{},"timestamp":"2026-03-04T05:06:07Z","extra":1}"#;
        assert!(serde_json::from_str::<AttestationStatus>(raw).is_err());
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        let raw = r#"{"server":"s","version":"1","tee_type":"none","secrets_loaded":{},
            "timestamp":"2026-03-04T05:06:07Z"}"#;
        assert!(serde_json::from_str::<AttestationStatus>(raw).is_err());
    }

    #[test]
    fn test_parse_accepts_offset_timestamps() {
        let raw = r#"{"server":"s","version":"1","running_in_tee":false,"tee_type":"none",
            "secrets_loaded":{"A":true},"timestamp":"2026-03-04T07:06:07+02:00"}"#;
        let status: AttestationStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(status.timestamp.to_rfc3339(), "2026-03-04T05:06:07+00:00");
    }

    #[test]
    fn test_secrets_keep_declaration_order() {
        let claim = AttestationClaim::none(at());
        let secrets = records(&[
            ("GITHUB_TOKEN", true),
            ("DB_CONNECTION_STRING", true),
            ("WEBHOOK_URL", true),
        ]);
        let status = build_status(&claim, &secrets, "s", "1");

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains(
            r#""secrets_loaded":{"GITHUB_TOKEN":true,"DB_CONNECTION_STRING":true,"WEBHOOK_URL":true}"#
        ));

        let parsed: AttestationStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed.secrets_loaded.names().collect::<Vec<_>>(),
            vec!["GITHUB_TOKEN", "DB_CONNECTION_STRING", "WEBHOOK_URL"]
        );
    }

    #[test]
    fn test_parse_rejects_duplicate_secret_names() {
        let raw = r#"{"server":"s","version":"1","running_in_tee":true,"tee_type":"none",
            "secrets_loaded":{"A":true,"A":false},"timestamp":"2026-03-04T05:06:07Z"}"#;
        assert!(serde_json::from_str::<AttestationStatus>(raw).is_err());
    }

    #[test]
    fn test_parse_accepts_free_text_tee_type() {
        let raw = r#"{"server":"mcp-tee-server","version":"1.0.0","running_in_tee":true,
            "tee_type":"AMD SEV-SNP","secrets_loaded":{"GITHUB_TOKEN":true},
            "timestamp":"2026-03-04T05:06:07.123456+00:00"}"#;
        let status: AttestationStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(status.tee_type, "AMD SEV-SNP");
        assert_eq!(status.tee_kind(), None);
        assert!(status.verdict());
    }

    #[test]
    fn test_insert_keeps_position() {
        let mut flags = SecretFlags::new();
        flags.insert("B", false);
        flags.insert("A", true);
        flags.insert("B", true);
        assert_eq!(flags.iter().collect::<Vec<_>>(), vec![("B", true), ("A", true)]);
        assert_eq!(flags.len(), 2);
    }

    #[test]
    fn test_verdict_is_logical_and() {
        let cases = [
            (false, vec![], false),
            (true, vec![], true),
            (true, vec![("A", true), ("B", true)], true),
            (true, vec![("A", true), ("B", false)], false),
            (false, vec![("A", true), ("B", true)], false),
        ];

        for (in_tee, flags, expected) in cases {
            let claim = if in_tee {
                AttestationClaim::enclave("/dev/sev", None, at())
            } else {
                AttestationClaim::none(at())
            };
            let status = build_status(&claim, &records(&flags), "s", "1");
            assert_eq!(status.verdict(), expected, "tee={in_tee} flags={flags:?}");
        }
    }

    #[test]
    fn test_missing_secrets() {
        let claim = AttestationClaim::none(at());
        let status = build_status(
            &claim,
            &records(&[("A", true), ("B", false), ("C", false)]),
            "s",
            "1",
        );
        assert_eq!(status.missing_secrets(), vec!["B", "C"]);
    }

    #[test]
    fn test_query_is_stable() {
        let claim = AttestationClaim::none(at());
        let aggregator = StatusAggregator::new(&claim, &records(&[("A", true)]), "s", "1");
        let first = aggregator.query();
        let second = aggregator.clone().query();
        assert_eq!(first, second);
        assert_eq!(&first, aggregator.status());
    }
}
