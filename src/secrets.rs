//! Startup-time secret loading
//!
//! In production the attestation sidecar only populates these environment
//! variables after the key release policy accepted the container's hardware
//! evidence. The gate reads each declared name once, at startup, and keeps
//! the result as the system of record for the life of the process. There is
//! no way to re-read the environment afterwards.
//!
//! Values never leave this module except through [`SecretGate::require`].
//! They are redacted in `Debug` output and wiped from memory on drop.

use crate::error::{Error, Result};
use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// A loaded secret value
pub struct SecretValue(Zeroizing<String>);

impl SecretValue {
    /// Borrows the raw value. Callers must not log or return it.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

/// Why a secret is or is not available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadState {
    Loaded,
    /// The variable was not set
    Missing,
    /// The variable was set to an empty string
    Empty,
    /// The variable was set but is not valid unicode
    NotUnicode,
}

impl LoadState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadState::Loaded)
    }
}

#[derive(Debug)]
enum SecretSlot {
    Absent(LoadState),
    Present(SecretValue),
}

impl SecretSlot {
    fn state(&self) -> LoadState {
        match self {
            SecretSlot::Absent(state) => *state,
            SecretSlot::Present(_) => LoadState::Loaded,
        }
    }
}

/// The observable part of a secret: its name and whether it loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretRecord {
    pub name: String,
    pub loaded: bool,
}

/// Secrets read once at startup, in declaration order
#[derive(Debug)]
pub struct SecretGate {
    slots: Vec<(String, SecretSlot)>,
}

impl SecretGate {
    /// Reads every declared name from the process environment
    pub fn load_env<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::load_with(names, |name| std::env::var_os(name))
    }

    /// Reads every declared name through `lookup`
    ///
    /// Duplicate names are read once; the first declaration wins.
    pub fn load_with<I, S, F>(names: I, lookup: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&str) -> Option<OsString>,
    {
        let mut slots: Vec<(String, SecretSlot)> = Vec::new();

        for name in names {
            let name = name.as_ref();
            if slots.iter().any(|(existing, _)| existing == name) {
                warn!(secret = %name, "Secret declared twice, ignoring duplicate");
                continue;
            }

            let slot = match lookup(name) {
                None => SecretSlot::Absent(LoadState::Missing),
                Some(raw) => match raw.into_string() {
                    Ok(value) if value.is_empty() => SecretSlot::Absent(LoadState::Empty),
                    Ok(value) => SecretSlot::Present(SecretValue(Zeroizing::new(value))),
                    Err(_) => SecretSlot::Absent(LoadState::NotUnicode),
                },
            };

            match slot.state() {
                LoadState::Loaded => info!(secret = %name, "Secret loaded"),
                state => warn!(secret = %name, state = ?state, "Secret not loaded"),
            }

            slots.push((name.to_string(), slot));
        }

        Self { slots }
    }

    /// Name and load flag of every declared secret, in declaration order
    pub fn snapshot(&self) -> Vec<SecretRecord> {
        self.slots
            .iter()
            .map(|(name, slot)| SecretRecord {
                name: name.clone(),
                loaded: slot.state().is_loaded(),
            })
            .collect()
    }

    /// Load state of a declared secret, `None` if the name was never declared
    pub fn state(&self, name: &str) -> Option<LoadState> {
        self.slot(name).map(SecretSlot::state)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.state(name).is_some_and(|s| s.is_loaded())
    }

    pub fn all_loaded(&self) -> bool {
        self.slots.iter().all(|(_, slot)| slot.state().is_loaded())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|(name, _)| name.as_str())
    }

    /// Hands a loaded secret to an in-process consumer
    pub fn require(&self, name: &str) -> Result<&SecretValue> {
        match self.slot(name) {
            Some(SecretSlot::Present(value)) => Ok(value),
            _ => Err(Error::SecretUnavailable {
                name: name.to_string(),
            }),
        }
    }

    fn slot(&self, name: &str) -> Option<&SecretSlot> {
        self.slots
            .iter()
            .find(|(declared, _)| declared == name)
            .map(|(_, slot)| slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const NAMES: [&str; 3] = ["GITHUB_TOKEN", "DB_CONNECTION_STRING", "WEBHOOK_URL"];

    fn gate_from(env: &[(&str, &str)]) -> SecretGate {
        let env: HashMap<String, OsString> = env
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        SecretGate::load_with(NAMES, |name| env.get(name).cloned())
    }

    #[test]
    fn test_nothing_set() {
        let gate = gate_from(&[]);
        assert!(gate.snapshot().iter().all(|r| !r.loaded));
        assert!(!gate.all_loaded());
        assert_eq!(gate.state("GITHUB_TOKEN"), Some(LoadState::Missing));
    }

    #[test]
    fn test_loaded_exactly_for_present_subset() {
        // every subset of the declared names
        for mask in 0u8..8 {
            let present: Vec<(&str, &str)> = NAMES
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, name)| (*name, "value"))
                .collect();
            let gate = gate_from(&present);

            for (i, record) in gate.snapshot().iter().enumerate() {
                assert_eq!(record.name, NAMES[i]);
                assert_eq!(record.loaded, mask & (1 << i) != 0, "mask {mask:03b}");
            }
        }
    }

    #[test]
    fn test_empty_value_is_not_loaded() {
        let gate = gate_from(&[("GITHUB_TOKEN", "")]);
        assert_eq!(gate.state("GITHUB_TOKEN"), Some(LoadState::Empty));
        assert!(!gate.is_loaded("GITHUB_TOKEN"));
        assert!(gate.require("GITHUB_TOKEN").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_unicode_value_is_not_loaded() {
        use std::os::unix::ffi::OsStringExt;

        let gate = SecretGate::load_with(["GITHUB_TOKEN"], |_| {
            Some(OsString::from_vec(vec![0x66, 0xff, 0x6f]))
        });
        assert_eq!(gate.state("GITHUB_TOKEN"), Some(LoadState::NotUnicode));
    }

    #[test]
    fn test_require_returns_value() {
        let gate = gate_from(&[("WEBHOOK_URL", "https://hooks.example/abc")]);
        assert_eq!(
            gate.require("WEBHOOK_URL").unwrap().expose(),
            "https://hooks.example/abc"
        );
    }

    #[test]
    fn test_require_error_names_secret_only() {
        let gate = gate_from(&[("GITHUB_TOKEN", "ghp_supersecret")]);
        let err = gate.require("DB_CONNECTION_STRING").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("DB_CONNECTION_STRING"));
        assert!(!message.contains("ghp_supersecret"));
    }

    #[test]
    fn test_undeclared_secret_is_unavailable() {
        let gate = gate_from(&[("GITHUB_TOKEN", "x")]);
        assert_eq!(gate.state("AWS_SECRET"), None);
        assert!(matches!(
            gate.require("AWS_SECRET"),
            Err(Error::SecretUnavailable { .. })
        ));
    }

    #[test]
    fn test_debug_never_shows_values() {
        let gate = gate_from(&[("GITHUB_TOKEN", "ghp_supersecret")]);
        let rendered = format!("{:?}", gate);
        assert!(!rendered.contains("ghp_supersecret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_snapshot_serializes_without_values() {
        let gate = gate_from(&[("GITHUB_TOKEN", "ghp_supersecret")]);
        let json = serde_json::to_string(&gate.snapshot()).unwrap();
        assert!(!json.contains("ghp_supersecret"));
        assert!(json.contains("\"loaded\":true"));
    }

    #[test]
    fn test_duplicate_names_read_once() {
        let gate = SecretGate::load_with(["A", "B", "A"], |_| Some(OsString::from("v")));
        assert_eq!(gate.names().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn test_no_declared_secrets_all_loaded() {
        let gate = SecretGate::load_with(Vec::<String>::new(), |_| None);
        assert!(gate.all_loaded());
        assert!(gate.snapshot().is_empty());
    }
}
