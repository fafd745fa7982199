//! Dependency Manifest: external services and their validation state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::SCHEMA_VERSION;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub at: DateTime<Utc>,
    pub ok: bool,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    #[serde(default)]
    pub required_credentials: Vec<String>,
    #[serde(default)]
    pub last_validation: Option<ValidationResult>,
    #[serde(default)]
    pub available: bool,
}

impl ServiceEntry {
    /// Usable only when available and the latest validation succeeded.
    pub fn is_usable(&self) -> bool {
        self.available && self.last_validation.as_ref().is_some_and(|v| v.ok)
    }
}

/// Persisted manifest document (`manifest.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
    pub schema_version: u32,
    pub services: BTreeMap<String, ServiceEntry>,
}

impl Default for DependencyManifest {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            services: BTreeMap::new(),
        }
    }
}

/// Outcome of one service check, supplied by `deps check` or a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub service: String,
    pub ok: bool,
    #[serde(default)]
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl DependencyManifest {
    pub fn is_usable(&self, service: &str) -> bool {
        self.services.get(service).is_some_and(ServiceEntry::is_usable)
    }

    /// Services in `names` that are unknown, unvalidated, or unavailable.
    pub fn unusable<'a>(&self, names: &'a [String]) -> Vec<&'a str> {
        names
            .iter()
            .filter(|name| !self.is_usable(name))
            .map(String::as_str)
            .collect()
    }

    pub fn apply_check(&mut self, check: &ServiceCheck) {
        let entry = self.services.entry(check.service.clone()).or_default();
        entry.available = check.ok;
        entry.last_validation = Some(ValidationResult {
            at: check.at,
            ok: check.ok,
            detail: check.detail.clone(),
        });
    }

    /// Validate every service's credentials through `lookup` (name -> value).
    ///
    /// A service passes when each required credential resolves to a non-empty
    /// value. Returns one check per service, in name order.
    pub fn check_credentials<F: Fn(&str) -> Option<String>>(
        &self,
        lookup: F,
        at: DateTime<Utc>,
    ) -> Vec<ServiceCheck> {
        self.services
            .iter()
            .map(|(name, entry)| {
                let missing: Vec<&str> = entry
                    .required_credentials
                    .iter()
                    .filter(|cred| lookup(cred).is_none_or(|value| value.trim().is_empty()))
                    .map(String::as_str)
                    .collect();
                let (ok, detail) = if missing.is_empty() {
                    (true, "credentials present".to_string())
                } else {
                    (false, format!("missing credentials: {}", missing.join(", ")))
                };
                ServiceCheck {
                    service: name.clone(),
                    ok,
                    detail,
                    at,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn unvalidated_service_is_unusable() {
        let mut manifest = DependencyManifest::default();
        manifest.services.insert(
            "billing".to_string(),
            ServiceEntry {
                available: true,
                ..ServiceEntry::default()
            },
        );
        assert!(!manifest.is_usable("billing"));
        assert!(!manifest.is_usable("unknown"));
    }

    #[test]
    fn credential_check_reports_missing_names() {
        let mut manifest = DependencyManifest::default();
        manifest.services.insert(
            "billing".to_string(),
            ServiceEntry {
                required_credentials: vec!["BILLING_TOKEN".to_string(), "BILLING_URL".to_string()],
                ..ServiceEntry::default()
            },
        );
        let checks = manifest.check_credentials(
            |name| (name == "BILLING_URL").then(|| "https://billing.internal".to_string()),
            at(),
        );
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].ok);
        assert_eq!(checks[0].detail, "missing credentials: BILLING_TOKEN");

        for check in &checks {
            manifest.apply_check(check);
        }
        assert!(!manifest.is_usable("billing"));

        manifest.apply_check(&ServiceCheck {
            service: "billing".to_string(),
            ok: true,
            detail: String::new(),
            at: at(),
        });
        assert!(manifest.is_usable("billing"));
    }
}
