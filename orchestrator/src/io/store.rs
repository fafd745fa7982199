//! State Store: sole owner of the on-disk state documents and evidence logs.
//!
//! `load` never fails on missing or corrupt state. It runs four stages per
//! document (presence, parse, schema, cross-record consistency), repairs what
//! is safe to repair, and otherwise falls back to the newest valid backup and
//! then to a fresh session, reporting what it did.
//!
//! `save` takes the lock, backs up the current documents, then writes each
//! document to a temp file, re-reads and re-validates it, and renames it into
//! place. The commit marker is written last and records the digest of every
//! document, so documents from different saves never load as a valid snapshot.
//! Any failure rolls already-replaced documents back to the backup.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use jsonschema::{Draft, Validator};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::core::chain::EvidenceChain;
use crate::core::evidence::EvidenceRecord;
use crate::core::invariants::{check_consistency, repair};
use crate::core::types::{SCHEMA_VERSION, Snapshot};
use crate::io::init::{COMMIT_FILE, OrchestratorPaths, new_session_id};

const SESSION_SCHEMA: &str = include_str!("../../schemas/session.schema.json");
const TASKS_SCHEMA: &str = include_str!("../../schemas/tasks.schema.json");
const XREF_SCHEMA: &str = include_str!("../../schemas/xref.schema.json");
const MANIFEST_SCHEMA: &str = include_str!("../../schemas/manifest.schema.json");

fn compile(schema: &str) -> Validator {
    let value: Value = serde_json::from_str(schema).expect("embedded schema is valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&value)
        .expect("embedded schema compiles")
}

static SESSION_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(SESSION_SCHEMA));
static TASKS_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(TASKS_SCHEMA));
static XREF_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(XREF_SCHEMA));
static MANIFEST_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile(MANIFEST_SCHEMA));

/// The four independently stored state documents, in write order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    Session,
    Tasks,
    Xref,
    Manifest,
}

impl Document {
    pub const ALL: [Document; 4] = [
        Document::Session,
        Document::Tasks,
        Document::Xref,
        Document::Manifest,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Document::Session => "session.json",
            Document::Tasks => "tasks.json",
            Document::Xref => "xref.json",
            Document::Manifest => "manifest.json",
        }
    }

    pub fn schema(self) -> &'static str {
        match self {
            Document::Session => SESSION_SCHEMA,
            Document::Tasks => TASKS_SCHEMA,
            Document::Xref => XREF_SCHEMA,
            Document::Manifest => MANIFEST_SCHEMA,
        }
    }

    fn validator(self) -> &'static Validator {
        match self {
            Document::Session => &SESSION_VALIDATOR,
            Document::Tasks => &TASKS_VALIDATOR,
            Document::Xref => &XREF_VALIDATOR,
            Document::Manifest => &MANIFEST_VALIDATOR,
        }
    }

    pub fn violations(self, value: &Value) -> Vec<String> {
        self.validator()
            .iter_errors(value)
            .map(|err| err.to_string())
            .collect()
    }

    fn payload(self, snapshot: &Snapshot) -> Result<String> {
        match self {
            Document::Session => to_pretty_json(&snapshot.session),
            Document::Tasks => to_pretty_json(&snapshot.tasks),
            Document::Xref => to_pretty_json(&snapshot.xref),
            Document::Manifest => to_pretty_json(&snapshot.manifest),
        }
    }
}

/// Commit marker (`state/commit.json`), written after all four documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMarker {
    pub schema_version: u32,
    /// Increases by one per save.
    pub generation: u64,
    pub committed_at: DateTime<Utc>,
    /// Document file name to the hex SHA-256 of its exact bytes.
    pub documents: BTreeMap<String, String>,
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn read_commit(dir: &Path) -> Result<CommitMarker, String> {
    let contents = match fs::read_to_string(dir.join(COMMIT_FILE)) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(format!("{COMMIT_FILE}: missing"));
        }
        Err(err) => return Err(format!("{COMMIT_FILE}: unreadable: {err}")),
    };
    serde_json::from_str(&contents).map_err(|err| format!("{COMMIT_FILE}: invalid: {err}"))
}

/// Documents under `dir` that do not belong to the generation its commit
/// marker records. Empty when all four match.
pub fn commit_problems(dir: &Path) -> Vec<String> {
    let marker = match read_commit(dir) {
        Ok(marker) => marker,
        Err(problem) => return vec![problem],
    };
    let mut problems = Vec::new();
    for doc in Document::ALL {
        let name = doc.file_name();
        let actual = match fs::read(dir.join(name)) {
            Ok(bytes) => digest(&bytes),
            Err(err) => {
                problems.push(format!("{name}: unreadable: {err}"));
                continue;
            }
        };
        match marker.documents.get(name) {
            Some(expected) if *expected == actual => {}
            Some(_) => problems.push(format!(
                "{name}: does not match commit generation {}",
                marker.generation
            )),
            None => problems.push(format!(
                "{name}: missing from commit generation {}",
                marker.generation
            )),
        }
    }
    problems
}

/// How `load` arrived at its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Every stage passed.
    Clean,
    /// No state existed; a fresh session was created in memory.
    Initialized,
    /// Repairable consistency violations were fixed in place.
    Repaired,
    /// State was restored from a backup, reinitialized after corruption, or
    /// carries violations that could not be repaired.
    Recovered,
}

#[derive(Debug, Clone)]
pub struct Loaded {
    pub snapshot: Snapshot,
    pub status: LoadStatus,
    /// What `load` did, in order.
    pub actions: Vec<String>,
}

impl Loaded {
    pub fn is_recovered(&self) -> bool {
        self.status == LoadStatus::Recovered
    }
}

/// A backup directory `backups/<UTC timestamp>-<seq>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub name: String,
    pub dir: PathBuf,
    pub seq: u64,
    pub taken_at: DateTime<Utc>,
}

const BACKUP_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

fn backup_name(taken_at: DateTime<Utc>, seq: u64) -> String {
    format!("{}-{seq:06}", taken_at.format(BACKUP_TIME_FORMAT))
}

fn parse_backup_name(name: &str) -> Option<(DateTime<Utc>, u64)> {
    let (stamp, seq) = name.split_once('-')?;
    let taken_at = NaiveDateTime::parse_from_str(stamp, BACKUP_TIME_FORMAT)
        .ok()?
        .and_utc();
    Some((taken_at, seq.parse().ok()?))
}

static LOCK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Unique per process, instant, and acquisition attempt.
fn lock_nonce() -> String {
    let now = Utc::now();
    format!(
        "{}-{}-{}",
        std::process::id(),
        now.timestamp_nanos_opt().unwrap_or_default(),
        LOCK_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Age of the lock file. `None` when its modification time lies in the
/// future, which counts as held.
fn lock_age(path: &Path) -> io::Result<Option<Duration>> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified.elapsed().ok())
}

/// Held while the store writes. On drop the lock file is removed only if it
/// still carries this holder's token.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    token: String,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim() == self.token => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), err = %err, "failed to release state lock");
                }
            }
            Ok(_) => warn!(path = %self.path.display(), "state lock was taken over; leaving it"),
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "failed to release state lock");
            }
        }
    }
}

pub struct StateStore {
    paths: OrchestratorPaths,
    config: OrchestratorConfig,
}

impl StateStore {
    pub fn new(paths: OrchestratorPaths, config: OrchestratorConfig) -> Self {
        Self { paths, config }
    }

    pub fn paths(&self) -> &OrchestratorPaths {
        &self.paths
    }

    fn document_path(&self, doc: Document) -> PathBuf {
        self.paths.state_dir.join(doc.file_name())
    }

    fn exists_in_workspace(&self, path: &str) -> bool {
        self.paths.root.join(path).exists()
    }

    fn initial_snapshot(&self) -> Snapshot {
        let now = Utc::now();
        Snapshot::initial(new_session_id(now), now, self.config.clone())
    }

    /// Load a validated, consistent snapshot. Only fails on errors unrelated
    /// to the state documents themselves.
    #[instrument(skip_all, fields(state_dir = %self.paths.state_dir.display()))]
    pub fn load(&self) -> Result<Loaded> {
        let present = Document::ALL
            .iter()
            .filter(|doc| self.document_path(**doc).exists())
            .count();
        if present == 0 && self.list_backups().is_empty() {
            info!("no state found, initializing session");
            return Ok(Loaded {
                snapshot: self.initial_snapshot(),
                status: LoadStatus::Initialized,
                actions: vec!["no state found; initialized a new session".to_string()],
            });
        }

        match read_documents(&self.paths.state_dir) {
            Ok(snapshot) => Ok(self.settle(snapshot, Vec::new(), false)),
            Err(problems) => {
                for problem in &problems {
                    warn!(problem = %problem, "state document rejected");
                }
                Ok(self.recover(problems))
            }
        }
    }

    /// Stage 4: cross-record consistency, repairing what is safe to repair.
    fn settle(&self, mut snapshot: Snapshot, mut actions: Vec<String>, recovered: bool) -> Loaded {
        let exists = |path: &str| self.exists_in_workspace(path);
        let violations = check_consistency(&snapshot, exists);
        if violations.is_empty() {
            let status = if recovered {
                LoadStatus::Recovered
            } else {
                LoadStatus::Clean
            };
            return Loaded {
                snapshot,
                status,
                actions,
            };
        }

        let fatal: Vec<String> = violations
            .iter()
            .filter(|violation| !violation.repairable)
            .map(|violation| violation.message.clone())
            .collect();
        for repaired in repair(&mut snapshot, exists) {
            debug!(action = %repaired, "state repaired");
            actions.push(repaired);
        }
        for message in &fatal {
            warn!(violation = %message, "unrepairable state violation");
            actions.push(format!("unrepairable: {message}"));
        }
        let status = if recovered || !fatal.is_empty() {
            LoadStatus::Recovered
        } else {
            LoadStatus::Repaired
        };
        Loaded {
            snapshot,
            status,
            actions,
        }
    }

    /// Fall back to the newest backup that passes every stage, else a fresh session.
    fn recover(&self, problems: Vec<String>) -> Loaded {
        let mut actions: Vec<String> = problems
            .into_iter()
            .map(|problem| format!("rejected {problem}"))
            .collect();
        let exists = |path: &str| self.exists_in_workspace(path);

        for backup in self.list_backups().iter().rev() {
            match read_documents(&backup.dir) {
                Ok(snapshot) => {
                    if check_consistency(&snapshot, exists)
                        .iter()
                        .any(|violation| !violation.repairable)
                    {
                        actions.push(format!("skipped backup {}: inconsistent", backup.name));
                        continue;
                    }
                    info!(backup = %backup.name, "restored state from backup");
                    actions.push(format!("restored from backup {}", backup.name));
                    return self.settle(snapshot, actions, true);
                }
                Err(problems) => actions.push(format!(
                    "skipped backup {}: {}",
                    backup.name,
                    problems.join("; ")
                )),
            }
        }

        warn!("no valid backup, initializing session");
        actions.push("no valid backup; initialized a new session".to_string());
        Loaded {
            snapshot: self.initial_snapshot(),
            status: LoadStatus::Recovered,
            actions,
        }
    }

    /// Atomically persist all four documents.
    #[instrument(skip_all, fields(session = %snapshot.session.id, iteration = snapshot.session.iteration))]
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let _lock = self.lock()?;
        fs::create_dir_all(&self.paths.state_dir)
            .with_context(|| format!("create directory {}", self.paths.state_dir.display()))?;

        let payloads = Document::ALL
            .iter()
            .map(|doc| Ok((*doc, doc.payload(snapshot)?)))
            .collect::<Result<Vec<_>>>()?;
        let generation = read_commit(&self.paths.state_dir).map_or(0, |marker| marker.generation) + 1;
        let marker = CommitMarker {
            schema_version: SCHEMA_VERSION,
            generation,
            committed_at: Utc::now(),
            documents: payloads
                .iter()
                .map(|(doc, payload)| (doc.file_name().to_string(), digest(payload.as_bytes())))
                .collect(),
        };
        let marker = to_pretty_json(&marker)?;

        let backup = self.backup_current()?;
        match self.prune_backups(Utc::now()) {
            Ok(removed) if !removed.is_empty() => debug!(removed = removed.len(), "pruned backups"),
            Ok(_) => {}
            Err(err) => warn!(err = %err, "failed to prune backups"),
        }

        let mut written = Vec::new();
        for (doc, payload) in &payloads {
            if let Err(err) = write_verified(&self.document_path(*doc), *doc, payload) {
                warn!(document = doc.file_name(), err = %err, "save failed, rolling back");
                self.rollback(&written, backup.as_ref());
                return Err(err.context(format!("save {}", doc.file_name())));
            }
            written.push(*doc);
        }
        if let Err(err) = write_atomic(&self.paths.commit_path, &marker) {
            warn!(err = %err, "commit failed, rolling back");
            self.rollback(&written, backup.as_ref());
            return Err(err.context("commit state"));
        }
        debug!(generation, "state saved");
        Ok(())
    }

    /// Restore `written` documents to their pre-save contents.
    fn rollback(&self, written: &[Document], backup: Option<&Backup>) {
        for doc in written {
            let path = self.document_path(*doc);
            let saved = backup
                .map(|backup| backup.dir.join(doc.file_name()))
                .filter(|saved| saved.exists());
            let result = match saved {
                Some(saved) => fs::copy(&saved, &path).map(|_| ()),
                None => fs::remove_file(&path),
            };
            if let Err(err) = result {
                warn!(document = doc.file_name(), err = %err, "rollback failed");
            }
        }
    }

    fn backup_current(&self) -> Result<Option<Backup>> {
        let existing: Vec<Document> = Document::ALL
            .into_iter()
            .filter(|doc| self.document_path(*doc).exists())
            .collect();
        if existing.is_empty() {
            return Ok(None);
        }
        let seq = self.list_backups().last().map_or(1, |backup| backup.seq + 1);
        let taken_at = Utc::now();
        let name = backup_name(taken_at, seq);
        let dir = self.paths.backups_dir.join(&name);
        fs::create_dir_all(&dir).with_context(|| format!("create backup {}", dir.display()))?;
        for doc in existing {
            let from = self.document_path(doc);
            fs::copy(&from, dir.join(doc.file_name()))
                .with_context(|| format!("back up {}", from.display()))?;
        }
        if self.paths.commit_path.is_file() {
            fs::copy(&self.paths.commit_path, dir.join(COMMIT_FILE))
                .with_context(|| format!("back up {}", self.paths.commit_path.display()))?;
        }
        debug!(backup = %name, "state backed up");
        Ok(Some(Backup {
            name,
            dir,
            seq,
            taken_at,
        }))
    }

    /// Backups ordered oldest first. Unrecognized entries are ignored.
    pub fn list_backups(&self) -> Vec<Backup> {
        let entries = match fs::read_dir(&self.paths.backups_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(err = %err, "failed to list backups");
                return Vec::new();
            }
        };
        let mut backups: Vec<Backup> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                let (taken_at, seq) = parse_backup_name(&name)?;
                Some(Backup {
                    name,
                    dir: entry.path(),
                    seq,
                    taken_at,
                })
            })
            .collect();
        backups.sort_by_key(|backup| backup.seq);
        backups
    }

    /// Remove backups beyond the retention count or age. The newest backup
    /// always survives. Returns the removed names.
    pub fn prune_backups(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let settings = &self.config.store;
        let keep = settings.backup_retention_count.max(1);
        let max_age = i64::try_from(settings.backup_retention_age_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);

        let backups = self.list_backups();
        let total = backups.len();
        let mut removed = Vec::new();
        for (index, backup) in backups.iter().enumerate() {
            if index + 1 == total {
                break;
            }
            let beyond_count = total - index > keep;
            let too_old = now.signed_duration_since(backup.taken_at) > max_age;
            if beyond_count || too_old {
                fs::remove_dir_all(&backup.dir)
                    .with_context(|| format!("remove backup {}", backup.dir.display()))?;
                removed.push(backup.name.clone());
            }
        }
        Ok(removed)
    }

    /// Take the staleness-checked lock guarding writes.
    ///
    /// The lock file holds the owner's pid and a nonce. A stale lock is moved
    /// aside under a unique name and only discarded if it is still the lock
    /// that was judged stale.
    pub fn lock(&self) -> Result<StoreLock> {
        let path = &self.paths.lock_path;
        fs::create_dir_all(&self.paths.state_dir)
            .with_context(|| format!("create directory {}", self.paths.state_dir.display()))?;
        let stale_after = Duration::from_secs(self.config.store.lock_stale_secs);
        let nonce = lock_nonce();
        let token = format!("{nonce} {}", Utc::now().to_rfc3339());

        for _ in 0..3 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{token}")
                        .with_context(|| format!("write lock {}", path.display()))?;
                    return Ok(StoreLock {
                        path: path.clone(),
                        token,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let observed = match fs::read_to_string(path) {
                        Ok(contents) => contents,
                        Err(err) if err.kind() == ErrorKind::NotFound => continue,
                        Err(err) => {
                            return Err(err).with_context(|| format!("read lock {}", path.display()));
                        }
                    };
                    let age = match lock_age(path) {
                        Ok(age) => age,
                        Err(err) if err.kind() == ErrorKind::NotFound => continue,
                        Err(err) => {
                            return Err(err).with_context(|| format!("inspect lock {}", path.display()));
                        }
                    };
                    if age.is_none_or(|age| age < stale_after) {
                        bail!(
                            "state store is locked by another invocation ({}); retry later",
                            path.display()
                        );
                    }
                    warn!(path = %path.display(), age = ?age, holder = %observed.trim(), "reclaiming stale state lock");
                    self.reclaim_lock(&nonce, &observed)?;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
        Err(anyhow!("could not acquire state lock {}", path.display()))
    }

    /// Move the lock aside and discard it if it is the one observed stale.
    /// A lock created in between is put back and reported as held.
    fn reclaim_lock(&self, nonce: &str, observed: &str) -> Result<()> {
        let path = &self.paths.lock_path;
        let aside = self.paths.state_dir.join(format!(".lock.stale-{nonce}"));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("move stale lock {}", path.display()));
            }
        }
        let moved = fs::read_to_string(&aside)
            .with_context(|| format!("read stale lock {}", aside.display()))?;
        if moved != observed {
            let restored = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .and_then(|mut file| file.write_all(moved.as_bytes()));
            if let Err(err) = restored {
                warn!(path = %path.display(), err = %err, "failed to restore a live state lock");
            }
        }
        if let Err(err) = fs::remove_file(&aside) {
            warn!(path = %aside.display(), err = %err, "failed to remove reclaimed state lock");
        }
        if moved != observed {
            bail!(
                "state store is locked by another invocation ({}); retry later",
                path.display()
            );
        }
        Ok(())
    }

    /// Stored evidence for `task_id`, in append order.
    pub fn read_evidence(&self, task_id: &str) -> Result<Vec<EvidenceRecord>> {
        let path = self.paths.evidence_path(checked_task_id(task_id)?);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} line {}", path.display(), index + 1))
            })
            .collect()
    }

    /// Stored chain for `task_id`; empty when nothing was recorded yet.
    pub fn read_chain(&self, task_id: &str) -> Result<EvidenceChain> {
        let path = self.paths.chain_path(checked_task_id(task_id)?);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(EvidenceChain::new(task_id));
            }
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// Append `records` to the task's evidence log and extend its chain, under
    /// the store lock. The log is restored if the chain cannot be written.
    #[instrument(skip_all, fields(task_id = %task_id, records = records.len()))]
    pub fn append_evidence(
        &self,
        task_id: &str,
        records: &[EvidenceRecord],
    ) -> Result<EvidenceChain> {
        checked_task_id(task_id)?;
        if let Some(stray) = records.iter().find(|record| record.task_id != task_id) {
            bail!("evidence '{}' belongs to task '{}'", stray.id, stray.task_id);
        }
        let _lock = self.lock()?;

        let mut chain = self.read_chain(task_id)?;
        let log_path = self.paths.evidence_path(task_id);
        let previous = match fs::read_to_string(&log_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err).with_context(|| format!("read {}", log_path.display())),
        };

        let mut contents = previous.clone().unwrap_or_default();
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        for record in records {
            chain.append(record);
            contents.push_str(&serde_json::to_string(record).context("serialize evidence")?);
            contents.push('\n');
        }

        write_atomic(&log_path, &contents)?;
        if let Err(err) = write_atomic(&self.paths.chain_path(task_id), &to_pretty_json(&chain)?) {
            let restored = match &previous {
                Some(previous) => write_atomic(&log_path, previous),
                None => fs::remove_file(&log_path).map_err(anyhow::Error::from),
            };
            if let Err(restore_err) = restored {
                warn!(err = %restore_err, "failed to restore evidence log");
            }
            return Err(err.context("write evidence chain"));
        }
        debug!(head = %chain.head(), "evidence appended");
        Ok(chain)
    }
}

/// Task ids name files under `evidence/`.
fn checked_task_id(task_id: &str) -> Result<&str> {
    let safe = !task_id.is_empty()
        && !task_id.starts_with('.')
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !safe {
        bail!("task id '{task_id}' is not usable as a file name");
    }
    Ok(task_id)
}

/// Stages 1-3 for every document under `dir`, typed decoding, then the
/// commit marker check.
fn read_documents(dir: &Path) -> Result<Snapshot, Vec<String>> {
    let mut problems = Vec::new();
    let session = read_document(dir, Document::Session, &mut problems);
    let tasks = read_document(dir, Document::Tasks, &mut problems);
    let xref = read_document(dir, Document::Xref, &mut problems);
    let manifest = read_document(dir, Document::Manifest, &mut problems);
    match (session, tasks, xref, manifest) {
        (Some(session), Some(tasks), Some(xref), Some(manifest)) if problems.is_empty() => {
            let torn = commit_problems(dir);
            if !torn.is_empty() {
                return Err(torn);
            }
            Ok(Snapshot {
                session,
                tasks,
                xref,
                manifest,
            })
        }
        _ => Err(problems),
    }
}

fn read_document<T: DeserializeOwned>(
    dir: &Path,
    doc: Document,
    problems: &mut Vec<String>,
) -> Option<T> {
    let name = doc.file_name();
    let contents = match fs::read_to_string(dir.join(name)) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            problems.push(format!("{name}: missing"));
            return None;
        }
        Err(err) => {
            problems.push(format!("{name}: unreadable: {err}"));
            return None;
        }
    };
    let value: Value = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => {
            problems.push(format!("{name}: invalid json: {err}"));
            return None;
        }
    };
    let violations = doc.violations(&value);
    if !violations.is_empty() {
        problems.push(format!("{name}: schema: {}", violations.join("; ")));
        return None;
    }
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            problems.push(format!("{name}: {err}"));
            None
        }
    }
}

/// Write to `<path>.tmp`, verify by re-reading, then rename into place.
fn write_verified(path: &Path, doc: Document, payload: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let result = (|| -> Result<()> {
        fs::write(&tmp_path, payload)
            .with_context(|| format!("write temp {}", tmp_path.display()))?;
        let reread = fs::read_to_string(&tmp_path)
            .with_context(|| format!("re-read temp {}", tmp_path.display()))?;
        if reread != payload {
            bail!("re-read of {} does not match what was written", tmp_path.display());
        }
        let value: Value = serde_json::from_str(&reread)
            .with_context(|| format!("re-parse {}", tmp_path.display()))?;
        let violations = doc.violations(&value);
        if !violations.is_empty() {
            bail!(
                "{} fails its schema: {}",
                doc.file_name(),
                violations.join("; ")
            );
        }
        fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))
    })();
    if result.is_err()
        && tmp_path.is_file()
        && let Err(err) = fs::remove_file(&tmp_path)
    {
        warn!(path = %tmp_path.display(), err = %err, "failed to remove temp file");
    }
    result
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<String> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::SystemTime;

    use super::*;
    use crate::core::evidence::EvidenceKind;
    use crate::core::types::TaskStatus;
    use crate::test_support::{evidence_record, snapshot_with, task_with_deps, timestamp};

    fn store(root: &Path) -> StateStore {
        StateStore::new(OrchestratorPaths::new(root), OrchestratorConfig::default())
    }

    fn sample() -> Snapshot {
        let mut snapshot = snapshot_with(vec![
            task_with_deps("a", &[]),
            task_with_deps("b", &["a"]),
        ]);
        snapshot.tasks.get_mut("a").expect("a").status = TaskStatus::Completed;
        snapshot
    }

    #[test]
    fn empty_workspace_initializes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded = store(temp.path()).load().expect("load");
        assert_eq!(loaded.status, LoadStatus::Initialized);
        assert!(loaded.snapshot.tasks.tasks.is_empty());
    }

    /// Save then load yields an equal snapshot.
    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let snapshot = sample();
        store.save(&snapshot).expect("save");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.status, LoadStatus::Clean, "{:?}", loaded.actions);
        assert_eq!(loaded.snapshot, snapshot);
        assert!(!store.paths().lock_path.exists());
    }

    /// A write that fails part-way leaves the previous state loadable.
    #[test]
    fn failed_save_rolls_back_written_documents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let before = sample();
        store.save(&before).expect("save");

        let mut after = before.clone();
        after.session.iteration = 9;
        after.tasks.get_mut("b").expect("b").status = TaskStatus::InProgress;
        // A directory where the temp file goes makes the tasks write fail
        // after session.json was already replaced.
        fs::create_dir_all(store.paths().state_dir.join("tasks.json.tmp")).expect("block tmp");

        assert!(store.save(&after).is_err());
        let loaded = store.load().expect("load");
        assert_eq!(loaded.snapshot, before);
        assert_eq!(loaded.status, LoadStatus::Clean);
    }

    #[test]
    fn rejected_write_removes_its_temp_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("manifest.json");
        let err = write_verified(&path, Document::Manifest, "{\"schema_version\": 7, \"services\": {}}\n")
            .unwrap_err();
        assert!(err.to_string().contains("fails its schema"));
        assert!(!temp.path().join("manifest.json.tmp").exists());
        assert!(!path.exists());
    }

    #[test]
    fn failed_commit_rolls_back_every_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let before = sample();
        store.save(&before).expect("save");

        let mut after = before.clone();
        after.session.iteration = 4;
        fs::create_dir_all(store.paths().state_dir.join("commit.json.tmp")).expect("block tmp");

        assert!(store.save(&after).is_err());
        let loaded = store.load().expect("load");
        assert_eq!(loaded.status, LoadStatus::Clean);
        assert_eq!(loaded.snapshot, before);
    }

    /// Documents from two different saves never load as one snapshot.
    #[test]
    fn torn_save_recovers_the_previous_generation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let before = sample();
        store.save(&before).expect("save before");
        let mut after = before.clone();
        after.session.iteration = 7;
        after.tasks.get_mut("b").expect("b").title = "b retitled".to_string();
        store.save(&after).expect("save after");

        // Crash right after session.json was replaced: every other file,
        // including the marker, still belongs to the previous save.
        let backup = store.list_backups().pop().expect("backup");
        for name in ["tasks.json", "xref.json", "manifest.json", COMMIT_FILE] {
            fs::copy(backup.dir.join(name), store.paths().state_dir.join(name)).expect("restore");
        }

        let loaded = store.load().expect("load");
        assert_eq!(loaded.status, LoadStatus::Recovered);
        assert_eq!(loaded.snapshot, before);
        assert!(loaded.actions.iter().any(|action| {
            action.contains("session.json: does not match commit generation 1")
        }));
    }

    /// Every document replaced but the marker not yet written.
    #[test]
    fn uncommitted_save_is_not_loaded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let before = sample();
        store.save(&before).expect("save before");
        let committed = fs::read(&store.paths().commit_path).expect("marker");
        let mut after = before.clone();
        after.session.iteration = 3;
        store.save(&after).expect("save after");
        fs::write(&store.paths().commit_path, committed).expect("old marker");

        let loaded = store.load().expect("load");
        assert!(loaded.is_recovered());
        assert_eq!(loaded.snapshot, before);
    }

    #[test]
    fn commit_marker_counts_generations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.save(&sample()).expect("save");
        store.save(&sample()).expect("save");
        let marker = read_commit(&store.paths().state_dir).expect("marker");
        assert_eq!(marker.generation, 2);
        assert_eq!(marker.documents.len(), Document::ALL.len());
        assert!(commit_problems(&store.paths().state_dir).is_empty());

        fs::remove_file(&store.paths().commit_path).expect("remove marker");
        assert_eq!(
            commit_problems(&store.paths().state_dir),
            vec![format!("{COMMIT_FILE}: missing")]
        );
    }

    #[test]
    fn corrupt_document_recovers_from_newest_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let first = sample();
        store.save(&first).expect("save first");
        let mut second = first.clone();
        second.session.iteration = 1;
        store.save(&second).expect("save second");
        let mut third = second.clone();
        third.session.iteration = 2;
        store.save(&third).expect("save third");

        fs::write(&store.paths().tasks_path, "{ not json").expect("corrupt");
        let loaded = store.load().expect("load");
        assert!(loaded.is_recovered());
        assert_eq!(loaded.snapshot, second);
        assert!(
            loaded
                .actions
                .iter()
                .any(|action| action.starts_with("rejected tasks.json: invalid json"))
        );
        assert!(
            loaded
                .actions
                .iter()
                .any(|action| action.starts_with("restored from backup"))
        );
    }

    #[test]
    fn schema_violation_without_backup_reinitializes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.save(&sample()).expect("save");
        fs::write(
            &store.paths().manifest_path,
            "{\"schema_version\": 7, \"services\": {}}\n",
        )
        .expect("corrupt");

        let loaded = store.load().expect("load");
        assert!(loaded.is_recovered());
        assert!(loaded.snapshot.tasks.tasks.is_empty());
        assert!(
            loaded
                .actions
                .iter()
                .any(|action| action.contains("manifest.json: schema"))
        );
    }

    #[test]
    fn repairable_violations_are_fixed_on_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut snapshot = sample();
        snapshot.tasks.get_mut("b").expect("b").targets = vec!["src/b.rs".to_string()];
        snapshot.tasks.get_mut("a").expect("a").dependents.clear();
        store.save(&snapshot).expect("save");

        let loaded = store.load().expect("load");
        assert_eq!(loaded.status, LoadStatus::Repaired);
        assert_eq!(loaded.snapshot.tasks.get("a").expect("a").dependents, vec!["b"]);
        assert!(loaded.snapshot.xref.contains("src/b.rs"));
    }

    #[test]
    fn backups_are_pruned_by_count_and_age() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = OrchestratorConfig::default();
        config.store.backup_retention_count = 3;
        config.store.backup_retention_age_secs = 3600;
        let store = StateStore::new(OrchestratorPaths::new(temp.path()), config);
        for (seq, at) in [(1, 0), (2, 10), (3, 20), (4, 4000), (5, 4010)] {
            fs::create_dir_all(store.paths().backups_dir.join(backup_name(timestamp(at), seq)))
                .expect("backup dir");
        }

        let removed = store.prune_backups(timestamp(4020)).expect("prune");
        assert_eq!(removed.len(), 3);
        let kept: Vec<u64> = store.list_backups().iter().map(|b| b.seq).collect();
        assert_eq!(kept, vec![4, 5]);

        // The newest backup survives even when it is too old.
        let removed = store.prune_backups(timestamp(100_000)).expect("prune");
        assert_eq!(removed.len(), 1);
        let kept: Vec<u64> = store.list_backups().iter().map(|b| b.seq).collect();
        assert_eq!(kept, vec![5]);
    }

    #[test]
    fn fresh_lock_blocks_and_stale_lock_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::create_dir_all(&store.paths().state_dir).expect("state dir");
        File::create(&store.paths().lock_path).expect("lock");

        let err = store.save(&sample()).unwrap_err();
        assert!(err.to_string().contains("locked"));

        let file = OpenOptions::new()
            .write(true)
            .open(&store.paths().lock_path)
            .expect("open lock");
        file.set_modified(SystemTime::now() - Duration::from_secs(60))
            .expect("age lock");
        store.save(&sample()).expect("save after reclaim");
        assert!(!store.paths().lock_path.exists());
        let leftovers: Vec<_> = fs::read_dir(&store.paths().state_dir)
            .expect("read state dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".lock.stale-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    /// A lock stamped in the future counts as held, not stale.
    #[test]
    fn future_dated_lock_is_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::create_dir_all(&store.paths().state_dir).expect("state dir");
        let file = File::create(&store.paths().lock_path).expect("lock");
        file.set_modified(SystemTime::now() + Duration::from_secs(3600))
            .expect("date lock");

        let err = store.save(&sample()).unwrap_err();
        assert!(err.to_string().contains("locked"));
        assert!(store.paths().lock_path.exists());
    }

    #[test]
    fn lock_records_owner_and_is_released() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let lock = store.lock().expect("lock");
        let contents = fs::read_to_string(&store.paths().lock_path).expect("read lock");
        let pid = std::process::id().to_string();
        assert!(contents.starts_with(&format!("{pid}-")), "{contents}");
        assert!(store.lock().is_err());
        drop(lock);
        assert!(!store.paths().lock_path.exists());
    }

    /// Dropping a lock that another invocation took over leaves theirs alone.
    #[test]
    fn dropped_lock_keeps_a_new_owners_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let lock = store.lock().expect("lock");
        fs::write(&store.paths().lock_path, "4242-1-0 2026-01-01T00:00:00Z\n").expect("take over");
        drop(lock);
        assert_eq!(
            fs::read_to_string(&store.paths().lock_path).expect("read lock"),
            "4242-1-0 2026-01-01T00:00:00Z\n"
        );
    }

    #[test]
    fn evidence_appends_extend_the_chain() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let first = vec![evidence_record("a", 1, EvidenceKind::Progress, timestamp(1))];
        let second = vec![evidence_record("a", 2, EvidenceKind::Completion, timestamp(2))];
        store.append_evidence("a", &first).expect("append");
        let chain = store.append_evidence("a", &second).expect("append");

        let records = store.read_evidence("a").expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(chain.entries.len(), 2);
        assert_eq!(store.read_chain("a").expect("chain"), chain);
        assert!(crate::core::chain::verify(&chain, &records).intact);
    }

    #[test]
    fn evidence_rejects_unsafe_ids_and_foreign_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        assert!(store.read_evidence("../escape").is_err());
        let foreign = vec![evidence_record("b", 1, EvidenceKind::Progress, timestamp(1))];
        assert!(store.append_evidence("a", &foreign).is_err());
        assert!(store.read_evidence("a").expect("read").is_empty());
    }

    #[test]
    fn backup_names_round_trip() {
        let name = backup_name(timestamp(61), 12);
        assert_eq!(name, "20260101T000101Z-000012");
        assert_eq!(parse_backup_name(&name), Some((timestamp(61), 12)));
        assert_eq!(parse_backup_name("notes"), None);
    }
}
