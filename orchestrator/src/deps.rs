//! `orchestrator deps check`: validate service credentials from the
//! environment and record the results in the manifest.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::manifest::ServiceCheck;
use crate::io::config::load_config;
use crate::io::init::OrchestratorPaths;
use crate::io::store::StateStore;

/// Check every manifest service with `lookup` and persist the outcome.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn check_dependencies<F: Fn(&str) -> Option<String>>(
    root: &Path,
    lookup: F,
) -> Result<Vec<ServiceCheck>> {
    let paths = OrchestratorPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let store = StateStore::new(paths, config);
    let mut snapshot = store.load().context("load state for dependency check")?.snapshot;

    let checks = snapshot.manifest.check_credentials(lookup, Utc::now());
    for check in &checks {
        if check.ok {
            info!(service = %check.service, "service validated");
        } else {
            warn!(service = %check.service, detail = %check.detail, "service unavailable");
        }
        snapshot.manifest.apply_check(check);
    }
    store.save(&snapshot).context("save dependency check")?;
    Ok(checks)
}

/// Credential lookup backed by process environment variables.
pub fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
