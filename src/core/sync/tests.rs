use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{Outcome, SyncEngine, SyncStart};
use crate::adapters::source::SourceReader;
use crate::adapters::treedb::TreeDb;
use crate::core::events::{BusEvent, SyncPhase};
use crate::core::model::{Folder, MessageNode, NodeType, DEFAULT_FOLDER_ID};
use crate::core::ports::emitter::EventSink;
use crate::core::tree::TreeStore;

struct RecordingSink {
    events: Mutex<Vec<BusEvent>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn phases(&self) -> Vec<SyncPhase> {
        self.events
            .lock()
            .expect("recording sink lock poisoned")
            .iter()
            .filter_map(|event| match event {
                BusEvent::Progress(progress) => Some(progress.phase),
                _ => None,
            })
            .collect()
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .expect("recording sink lock poisoned")
            .iter()
            .map(BusEvent::kind)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: BusEvent) {
        self.events
            .lock()
            .expect("recording sink lock poisoned")
            .push(event);
    }
}

struct Fixture {
    engine: SyncEngine,
    tree: Arc<TreeStore>,
    db: Arc<Mutex<TreeDb>>,
    sink: Arc<RecordingSink>,
    root: PathBuf,
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn fixture() -> Fixture {
    let root = std::env::temp_dir().join(format!("trellis-sync-test-{}", uuid::Uuid::new_v4()));
    let db = Arc::new(Mutex::new(
        TreeDb::open(&root.join("tree.db")).expect("open database"),
    ));
    let sink = RecordingSink::new();
    let source = SourceReader::new(&root);
    let tree = Arc::new(TreeStore::new(
        db.clone(),
        source.clone(),
        sink.clone() as Arc<dyn EventSink>,
    ));
    let engine = SyncEngine::new(
        db.clone(),
        tree.clone(),
        source,
        sink.clone() as Arc<dyn EventSink>,
    );
    Fixture {
        engine,
        tree,
        db,
        sink,
        root,
    }
}

fn write_message(root: &Path, session: &str, id: &str, body: serde_json::Value) {
    let dir = root.join("storage").join("message").join(session);
    std::fs::create_dir_all(&dir).expect("create session directory");
    std::fs::write(
        dir.join(format!("{id}.json")),
        serde_json::to_string(&body).expect("encode message"),
    )
    .expect("write message file");
}

fn message(id: &str, role: &str, summary: serde_json::Value, parent: Option<&str>, created: i64) -> serde_json::Value {
    let mut body = serde_json::json!({
        "id": id,
        "sessionID": "ses_a",
        "role": role,
        "time": {"created": created},
        "summary": summary,
        "agent": "build",
    });
    if let Some(parent) = parent {
        body["parentId"] = serde_json::json!(parent);
    }
    body
}

fn seed_scenario(root: &Path) {
    write_message(
        root,
        "ses_a",
        "m1",
        message("m1", "user", serde_json::json!("Continue the task"), None, 1_700_000_000_000),
    );
    write_message(
        root,
        "ses_a",
        "m2",
        message("m2", "assistant", serde_json::Value::Null, Some("m1"), 1_700_000_060_000),
    );
}

fn run(fx: &Fixture) -> Outcome {
    fx.engine
        .inner
        .run_phases(&AtomicBool::new(false))
        .expect("sync run succeeds")
}

fn db_node(fx: &Fixture, id: &str) -> MessageNode {
    fx.db
        .lock()
        .expect("database lock poisoned")
        .get_node(id)
        .expect("load node")
        .expect("node exists")
}

#[test]
fn full_sync_classifies_and_links_the_scenario() {
    let fx = fixture();
    seed_scenario(&fx.root);

    let outcome = run(&fx);
    assert_eq!(
        outcome,
        Outcome::Completed {
            inserted: 2,
            updated: 0
        }
    );

    let m1 = db_node(&fx, "m1");
    assert_eq!(m1.node_type, NodeType::Auto);
    assert!(m1.tags.contains(&"auto-generated".to_string()));
    assert_eq!(m1.children, vec!["m2".to_string()]);
    assert_eq!(m1.session_id.as_deref(), Some("ses_a"));

    let m2 = db_node(&fx, "m2");
    assert_eq!(m2.node_type, NodeType::Response);
    assert_eq!(m2.summary, "AI response");
    assert_eq!(m2.parent_id.as_deref(), Some("m1"));

    let folder = fx
        .db
        .lock()
        .expect("database lock poisoned")
        .get_folder(DEFAULT_FOLDER_ID)
        .expect("load folder");
    assert!(folder.is_some());
}

#[test]
fn repeated_sync_is_idempotent_and_reports_updates() {
    let fx = fixture();
    seed_scenario(&fx.root);

    run(&fx);
    let first_m1 = db_node(&fx, "m1");

    let outcome = run(&fx);
    assert_eq!(
        outcome,
        Outcome::Completed {
            inserted: 0,
            updated: 2
        }
    );

    let second_m1 = db_node(&fx, "m1");
    assert_eq!(second_m1.summary, first_m1.summary);
    assert_eq!(second_m1.tags, first_m1.tags);
    assert_eq!(second_m1.children, first_m1.children);
    assert_eq!(second_m1.node_type, first_m1.node_type);
}

#[test]
fn incremental_merge_preserves_local_state() {
    let fx = fixture();
    seed_scenario(&fx.root);
    run(&fx);

    // Local edits between runs: lock m1 and cache its content.
    {
        let mut db = fx.db.lock().expect("database lock poisoned");
        let mut m1 = db.get_node("m1").expect("load node").expect("node exists");
        m1.locked = true;
        m1.content = "cached body".to_string();
        m1.has_loaded = true;
        m1.expanded = true;
        db.upsert_node(DEFAULT_FOLDER_ID, &m1).expect("save edits");
    }

    // The source retitles m1 to an ordinary request.
    write_message(
        &fx.root,
        "ses_a",
        "m1",
        message("m1", "user", serde_json::json!("Refactor the parser"), None, 1_700_000_000_000),
    );

    run(&fx);

    let m1 = db_node(&fx, "m1");
    assert_eq!(m1.summary, "Refactor the parser");
    assert_eq!(m1.node_type, NodeType::User);
    assert!(!m1.tags.contains(&"auto-generated".to_string()));
    assert!(m1.locked);
    assert!(m1.expanded);
    assert!(m1.has_loaded);
    assert_eq!(m1.content, "cached body");
    assert_eq!(m1.children, vec!["m2".to_string()]);
}

#[test]
fn cancellation_before_the_first_session_writes_nothing() {
    let fx = fixture();
    seed_scenario(&fx.root);

    let cancelled = AtomicBool::new(true);
    fx.engine.inner.execute(&cancelled);

    assert_eq!(fx.sink.phases().last(), Some(&SyncPhase::Cancelled));
    assert!(fx
        .db
        .lock()
        .expect("database lock poisoned")
        .is_empty()
        .expect("check empty"));
}

#[test]
fn second_start_reports_already_running() {
    let fx = fixture();
    fx.engine.inner.running.store(true, Ordering::SeqCst);
    assert!(fx.engine.is_running());
    assert_eq!(fx.engine.start(), SyncStart::AlreadyRunning);
    fx.engine.inner.running.store(false, Ordering::SeqCst);

    // Cancel with no run in flight is a no-op.
    fx.engine.cancel();
}

#[test]
fn missing_source_root_surfaces_an_error_phase() {
    let fx = fixture();
    // No storage/message directory was ever created.
    fx.engine.inner.execute(&AtomicBool::new(false));

    assert_eq!(fx.sink.phases().last(), Some(&SyncPhase::Error));
    assert!(fx.sink.kinds().contains(&"error"));
}

#[test]
fn broken_message_files_are_skipped_not_fatal() {
    let fx = fixture();
    seed_scenario(&fx.root);
    let session_dir = fx.root.join("storage").join("message").join("ses_a");
    std::fs::write(session_dir.join("m3.json"), "{broken").expect("write broken file");

    let outcome = run(&fx);
    assert_eq!(
        outcome,
        Outcome::Completed {
            inserted: 2,
            updated: 0
        }
    );
}

#[test]
fn merge_without_the_default_folder_is_a_sync_error() {
    let fx = fixture();
    seed_scenario(&fx.root);
    run(&fx);

    // Move the data out of the default folder so the store is non-empty but
    // the merge target is gone.
    {
        let mut db = fx.db.lock().expect("database lock poisoned");
        db.insert_folder(&Folder::new("other", "Other", "#123456"))
            .expect("insert folder");
        let m1 = db.get_node("m1").expect("load node").expect("node exists");
        db.upsert_node("other", &m1).expect("move node");
        let m2 = db.get_node("m2").expect("load node").expect("node exists");
        db.upsert_node("other", &m2).expect("move node");
        db.delete_folder(DEFAULT_FOLDER_ID).expect("delete folder");
    }

    let error = fx
        .engine
        .inner
        .run_phases(&AtomicBool::new(false))
        .expect_err("merge target is gone");
    assert!(error.to_string().contains("default folder"));
}

#[test]
fn completion_reloads_the_tree_and_publishes_full_state() {
    let fx = fixture();
    seed_scenario(&fx.root);

    fx.engine.inner.execute(&AtomicBool::new(false));

    assert_eq!(fx.sink.phases().first(), Some(&SyncPhase::Init));
    assert_eq!(fx.sink.phases().last(), Some(&SyncPhase::Complete));
    assert!(fx.sink.kinds().contains(&"update"));

    let snapshot = fx.tree.snapshot();
    assert!(snapshot[DEFAULT_FOLDER_ID].nodes.contains_key("m1"));
    assert_eq!(
        snapshot[DEFAULT_FOLDER_ID].nodes["m1"].children,
        vec!["m2".to_string()]
    );
}
