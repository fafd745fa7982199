//! `orchestrator resume`: clear a session halt after operator review.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument};

use crate::core::types::Halt;
use crate::io::config::load_config;
use crate::io::init::OrchestratorPaths;
use crate::io::store::StateStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub session_id: String,
    /// The halt that was cleared; `None` when the session was not halted.
    pub cleared: Option<Halt>,
}

#[instrument(skip_all, fields(root = %root.display()))]
pub fn resume_session(root: &Path) -> Result<ResumeReport> {
    let paths = OrchestratorPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let store = StateStore::new(paths, config);
    let mut snapshot = store.load().context("load state for resume")?.snapshot;

    let cleared = snapshot.session.resume();
    if let Some(halt) = &cleared {
        store.save(&snapshot).context("save resumed session")?;
        info!(class = %halt.class, "session resumed");
    }
    Ok(ResumeReport {
        session_id: snapshot.session.id.clone(),
        cleared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestWorkspace, timestamp};

    #[test]
    fn clears_a_persisted_halt() {
        let ws = TestWorkspace::new().expect("workspace");
        let store = ws.store().expect("store");
        let mut snapshot = store.load().expect("load").snapshot;
        snapshot
            .session
            .halt("safety_limit_exceeded", "escalation budget (3/3)", timestamp(5));
        store.save(&snapshot).expect("save");

        let report = resume_session(ws.root()).expect("resume");
        assert_eq!(
            report.cleared.map(|halt| halt.class),
            Some("safety_limit_exceeded".to_string())
        );
        let stored = store.load().expect("load").snapshot;
        assert_eq!(stored.session.halted, None);
        assert!(!stored.session.blocked);
    }

    #[test]
    fn running_session_is_left_alone() {
        let ws = TestWorkspace::new().expect("workspace");
        let before = std::fs::read_to_string(&ws.paths().session_path).expect("read");
        let report = resume_session(ws.root()).expect("resume");
        assert_eq!(report.cleared, None);
        let after = std::fs::read_to_string(&ws.paths().session_path).expect("read");
        assert_eq!(before, after);
    }
}
