//! State Store durability seen from whole cycles: corrupted documents are
//! recovered from backups, interrupted writes leave the prior state intact,
//! torn saves are rejected, and a held lock keeps a second invocation from
//! writing.

use std::fs;

use orchestrator::core::types::TaskStatus;
use orchestrator::cycle::{CycleDeps, Trigger, run_cycle};
use orchestrator::io::store::LoadStatus;
use orchestrator::test_support::{
    MemoryAudit, MemorySource, ScriptedDispatcher, ScriptedEvaluator, TestWorkspace,
    task_with_deps,
};

const CONTINUE: &str = r#"{"kind":"continue","instruction":"Write the lexer"}"#;

struct Collaborators {
    dispatcher: ScriptedDispatcher,
    evaluator: ScriptedEvaluator,
    audit: MemoryAudit,
    source: MemorySource,
}

impl Collaborators {
    fn new(responses: usize) -> Self {
        Self {
            dispatcher: ScriptedDispatcher::new(
                (0..responses).map(|_| Ok(CONTINUE.to_string())).collect(),
            ),
            evaluator: ScriptedEvaluator::default(),
            audit: MemoryAudit::default(),
            source: MemorySource::default(),
        }
    }

    fn deps(&self) -> CycleDeps<'_> {
        CycleDeps {
            dispatcher: &self.dispatcher,
            evaluator: &self.evaluator,
            audit: &self.audit,
            source: &self.source,
        }
    }
}

#[test]
fn corrupted_tasks_document_is_restored_from_backup() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.seed(vec![task_with_deps("lexer", &[]), task_with_deps("parser", &["lexer"])])
        .expect("seed");
    let collaborators = Collaborators::new(2);
    run_cycle(ws.root(), &Trigger::default(), &collaborators.deps()).expect("cycle 1");

    fs::write(&ws.paths().tasks_path, "{\"schema_version\": 1, \"tasks\": [").expect("corrupt");

    let report = run_cycle(ws.root(), &Trigger::default(), &collaborators.deps()).expect("cycle 2");
    assert_eq!(report.meta.state, LoadStatus::Recovered);
    assert!(
        report
            .meta
            .state_actions
            .iter()
            .any(|action| action.starts_with("restored from backup"))
    );

    let loaded = ws.store().expect("store").load().expect("load");
    assert_eq!(loaded.status, LoadStatus::Clean);
    assert_eq!(loaded.snapshot.tasks.tasks.len(), 2);
}

#[test]
fn documents_from_two_saves_are_never_loaded_together() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.seed(vec![task_with_deps("lexer", &[])]).expect("seed");
    let collaborators = Collaborators::new(2);
    run_cycle(ws.root(), &Trigger::default(), &collaborators.deps()).expect("cycle 1");

    // Crash after session.json was replaced by cycle 1: tasks.json still holds
    // the seeded generation while the marker names cycle 1.
    let store = ws.store().expect("store");
    let newest = store.list_backups().pop().expect("backup");
    fs::copy(newest.dir.join("tasks.json"), &ws.paths().tasks_path).expect("tear");

    let loaded = store.load().expect("load");
    assert_eq!(loaded.status, LoadStatus::Recovered);
    assert_eq!(loaded.snapshot.session.iteration, 0);
    assert_eq!(loaded.snapshot.tasks.tasks[0].status, TaskStatus::Pending);
    assert!(
        loaded
            .actions
            .iter()
            .any(|action| action.contains("tasks.json: does not match commit generation"))
    );
}

#[test]
fn leftover_temp_file_from_interrupted_write_is_ignored() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.seed(vec![task_with_deps("lexer", &[])]).expect("seed");
    let before = fs::read_to_string(&ws.paths().tasks_path).expect("read");
    fs::write(ws.paths().state_dir.join("tasks.json.tmp"), "{ half written").expect("tmp");

    let loaded = ws.store().expect("store").load().expect("load");
    assert_eq!(loaded.status, LoadStatus::Clean);
    assert_eq!(fs::read_to_string(&ws.paths().tasks_path).expect("read"), before);
    assert_eq!(loaded.snapshot.tasks.tasks[0].status, TaskStatus::Pending);
}

#[test]
fn held_lock_prevents_a_second_writer() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.seed(vec![task_with_deps("lexer", &[])]).expect("seed");
    let before = fs::read_to_string(&ws.paths().session_path).expect("read");

    let store = ws.store().expect("store");
    let lock = store.lock().expect("lock");
    let collaborators = Collaborators::new(1);
    let err = run_cycle(ws.root(), &Trigger::default(), &collaborators.deps()).unwrap_err();
    assert!(format!("{err:#}").contains("locked"));
    assert_eq!(fs::read_to_string(&ws.paths().session_path).expect("read"), before);

    drop(lock);
    let collaborators = Collaborators::new(1);
    run_cycle(ws.root(), &Trigger::default(), &collaborators.deps()).expect("cycle after unlock");
}

#[test]
fn backups_are_pruned_to_retention_count() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.configure(|config| config.store.backup_retention_count = 3)
        .expect("configure");
    ws.seed(vec![task_with_deps("lexer", &[])]).expect("seed");
    let collaborators = Collaborators::new(6);
    for _ in 0..6 {
        run_cycle(ws.root(), &Trigger::default(), &collaborators.deps()).expect("cycle");
    }
    let backups = ws.store().expect("store").list_backups();
    assert!(backups.len() <= 4, "kept {} backups", backups.len());
    let seqs: Vec<u64> = backups.iter().map(|backup| backup.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
}
