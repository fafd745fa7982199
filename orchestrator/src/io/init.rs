//! Layout of `.orchestrator/` and its initialization.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::core::types::Snapshot;
use crate::io::config::write_config;
use crate::io::store::StateStore;

/// Commit marker file name, inside `state/` and every backup.
pub const COMMIT_FILE: &str = "commit.json";

/// All canonical paths within `.orchestrator/` for a project root.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
    pub dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
    pub state_dir: PathBuf,
    pub session_path: PathBuf,
    pub tasks_path: PathBuf,
    pub xref_path: PathBuf,
    pub manifest_path: PathBuf,
    /// Written last by every save; binds the four documents of one generation.
    pub commit_path: PathBuf,
    pub lock_path: PathBuf,
    pub backups_dir: PathBuf,
    pub evidence_dir: PathBuf,
    pub audit_dir: PathBuf,
    pub gateway_audit_path: PathBuf,
    pub escalation_audit_path: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dir = root.join(".orchestrator");
        let state_dir = dir.join("state");
        let audit_dir = dir.join("audit");
        Self {
            root: root.clone(),
            dir: dir.clone(),
            config_path: dir.join("config.toml"),
            gitignore_path: dir.join(".gitignore"),
            session_path: state_dir.join("session.json"),
            tasks_path: state_dir.join("tasks.json"),
            xref_path: state_dir.join("xref.json"),
            manifest_path: state_dir.join("manifest.json"),
            commit_path: state_dir.join(COMMIT_FILE),
            lock_path: state_dir.join(".lock"),
            state_dir,
            backups_dir: dir.join("backups"),
            evidence_dir: dir.join("evidence"),
            gateway_audit_path: audit_dir.join("gateway.jsonl"),
            escalation_audit_path: audit_dir.join("escalations.jsonl"),
            audit_dir,
        }
    }

    /// Append-only evidence log for one task.
    pub fn evidence_path(&self, task_id: &str) -> PathBuf {
        self.evidence_dir.join(format!("{task_id}.jsonl"))
    }

    pub fn chain_path(&self, task_id: &str) -> PathBuf {
        self.evidence_dir.join(format!("{task_id}.chain.json"))
    }
}

/// Options for [`init_orchestrator`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing `.orchestrator/`.
    pub force: bool,
}

/// Create `.orchestrator/` with a default config and an empty session.
///
/// Fails if `.orchestrator/` already exists unless `options.force` is set.
pub fn init_orchestrator(root: &Path, options: &InitOptions) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(root);
    if paths.dir.exists() && !paths.dir.is_dir() {
        return Err(anyhow!(
            "orchestrator init: .orchestrator exists but is not a directory"
        ));
    }
    if paths.dir.exists() && !options.force {
        return Err(anyhow!(
            "orchestrator init: .orchestrator already exists (use --force to overwrite)"
        ));
    }

    for dir in [
        &paths.dir,
        &paths.state_dir,
        &paths.backups_dir,
        &paths.evidence_dir,
        &paths.audit_dir,
    ] {
        create_dir(dir)?;
    }
    fs::write(&paths.gitignore_path, ORCHESTRATOR_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;

    let config = OrchestratorConfig::default();
    write_config(&paths.config_path, &config)?;

    let now = Utc::now();
    let snapshot = Snapshot::initial(new_session_id(now), now, config.clone());
    StateStore::new(paths.clone(), config).save(&snapshot)?;

    info!(root = %root.display(), session = %snapshot.session.id, "initialized orchestrator");
    Ok(paths)
}

/// Session ids are unique per process and second.
pub fn new_session_id(now: chrono::DateTime<Utc>) -> String {
    format!("session-{}-{}", now.format("%Y%m%dT%H%M%SZ"), std::process::id())
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const ORCHESTRATOR_GITIGNORE: &str = "backups/\nstate/.lock\n";
