//! Reconciliation of the external message layout into the durable store and
//! the in-memory tree. One run at a time; phases are reported through the
//! notification bus as `init -> reading -> building -> writing` followed by a
//! terminal `complete`, `cancelled` or `error`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::adapters::source::SourceReader;
use crate::adapters::treedb::TreeDb;
use crate::core::classify;
use crate::core::error::AppError;
use crate::core::events::{BusEvent, ErrorEvent, SyncPhase, SyncProgress};
use crate::core::model::{
    Folder, MessageNode, DEFAULT_FOLDER_COLOR, DEFAULT_FOLDER_ID, DEFAULT_FOLDER_NAME,
};
use crate::core::ports::emitter::EventSink;
use crate::core::tree::TreeStore;

const PROGRESS_EVERY: usize = 100;
const CANCEL_LOCK: &str = "cancel token lock poisoned";
const DB_LOCK: &str = "database lock poisoned";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStart {
    Started,
    AlreadyRunning,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Completed { inserted: usize, updated: usize },
    Cancelled,
}

/// Cheap handle; clones share one engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<Mutex<TreeDb>>,
    tree: Arc<TreeStore>,
    source: SourceReader,
    events: Arc<dyn EventSink>,
    running: AtomicBool,
    /// Token of the run in flight. A fresh token is created at every start
    /// and is only ever flipped, never reused, so a late `cancel` cannot
    /// leak into the next run.
    current_cancel: Mutex<Option<Arc<AtomicBool>>>,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Mutex<TreeDb>>,
        tree: Arc<TreeStore>,
        source: SourceReader,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                tree,
                source,
                events,
                running: AtomicBool::new(false),
                current_cancel: Mutex::new(None),
            }),
        }
    }

    /// Starts a background run unless one is already in flight.
    pub fn start(&self) -> SyncStart {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return SyncStart::AlreadyRunning;
        }

        let cancel = Arc::new(AtomicBool::new(false));
        *self.inner.current_cancel.lock().expect(CANCEL_LOCK) = Some(cancel.clone());

        let inner = self.inner.clone();
        std::thread::Builder::new()
            .name("trellis-sync".to_string())
            .spawn(move || {
                inner.execute(&cancel);
                *inner.current_cancel.lock().expect(CANCEL_LOCK) = None;
                inner.running.store(false, Ordering::SeqCst);
            })
            .expect("failed to spawn sync thread");

        SyncStart::Started
    }

    /// Requests cooperative cancellation of the run in flight, if any. The
    /// flag is observed between sessions and between node writes, so a large
    /// session delays the stop but never loses already-written data.
    pub fn cancel(&self) {
        if let Some(token) = self
            .inner
            .current_cancel
            .lock()
            .expect(CANCEL_LOCK)
            .as_ref()
        {
            token.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn execute(&self, cancel: &AtomicBool) {
        self.progress(SyncProgress::new(SyncPhase::Init, "Starting sync..."));

        match self.run_phases(cancel) {
            Ok(Outcome::Completed { inserted, updated }) => {
                if let Err(error) = self.tree.reload() {
                    log::error!("Failed to reload tree after sync: {error}");
                    self.fail("Sync finished but the tree could not be reloaded", &error);
                    return;
                }
                self.events.publish(BusEvent::Update(self.tree.snapshot()));
                self.progress(SyncProgress::counted(
                    SyncPhase::Complete,
                    format!("Sync complete: {inserted} added, {updated} updated"),
                    inserted + updated,
                    inserted + updated,
                ));
            }
            Ok(Outcome::Cancelled) => {
                // Whatever was written stays; there is no rollback.
                self.progress(SyncProgress::new(SyncPhase::Cancelled, "Sync cancelled"));
            }
            Err(error) => {
                log::error!("Sync failed: {error}");
                self.fail("Sync failed", &error);
            }
        }
    }

    fn run_phases(&self, cancel: &AtomicBool) -> Result<Outcome, AppError> {
        let mut nodes = match self.read_phase(cancel)? {
            Some(nodes) => nodes,
            None => return Ok(Outcome::Cancelled),
        };

        if !self.build_phase(cancel, &mut nodes) {
            return Ok(Outcome::Cancelled);
        }

        self.write_phase(cancel, nodes)
    }

    /// Enumerates sessions, parses every message file and classifies it into
    /// a working node. Returns None when cancelled. A session or file that
    /// cannot be read is logged and skipped; only failing to enumerate the
    /// session directories aborts the run.
    fn read_phase(
        &self,
        cancel: &AtomicBool,
    ) -> Result<Option<HashMap<String, MessageNode>>, AppError> {
        let sessions = self.source.list_sessions()?;
        let total = sessions.len();
        self.progress(SyncProgress::counted(
            SyncPhase::Reading,
            format!("Found {total} sessions"),
            0,
            total,
        ));

        let mut nodes: HashMap<String, MessageNode> = HashMap::new();
        for (index, session_dir) in sessions.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let messages = match self.source.read_session(session_dir) {
                Ok(messages) => messages,
                Err(error) => {
                    log::warn!(
                        "Skipping unreadable session {}: {}",
                        session_dir.display(),
                        error
                    );
                    continue;
                }
            };

            for message in messages {
                let classified =
                    classify::classify(&message.role, &message.agent, &message.summary);
                let node = MessageNode {
                    id: message.id.clone(),
                    node_type: classified.node_type,
                    content: String::new(),
                    summary: classified.title,
                    timestamp: SourceReader::epoch_millis_to_rfc3339(message.time.created),
                    parent_id: message.parent_id,
                    children: Vec::new(),
                    tags: classified.tags,
                    expanded: false,
                    selected: false,
                    session_id: Some(message.session_id),
                    has_loaded: false,
                    locked: false,
                };
                nodes.insert(node.id.clone(), node);

                if nodes.len() % PROGRESS_EVERY == 0 {
                    self.progress(SyncProgress::counted(
                        SyncPhase::Reading,
                        format!("Parsed {} messages", nodes.len()),
                        index + 1,
                        total,
                    ));
                }
            }

            self.progress(SyncProgress::counted(
                SyncPhase::Reading,
                format!("Read session {}/{}", index + 1, total),
                index + 1,
                total,
            ));
        }

        Ok(Some(nodes))
    }

    /// Resolves parent->children links across the whole working set. Nodes
    /// are visited in (timestamp, id) order so children ordering is the same
    /// on every run. Returns false when cancelled.
    fn build_phase(&self, cancel: &AtomicBool, nodes: &mut HashMap<String, MessageNode>) -> bool {
        let total = nodes.len();
        self.progress(SyncProgress::counted(
            SyncPhase::Building,
            "Linking message threads...",
            0,
            total,
        ));

        for (done, (_, id)) in ordered_ids(nodes).into_iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
            let Some(parent_id) = nodes.get(&id).and_then(|node| node.parent_id.clone()) else {
                continue;
            };
            if let Some(parent) = nodes.get_mut(&parent_id) {
                if !parent.children.contains(&id) {
                    parent.children.push(id);
                }
            }
            if (done + 1) % PROGRESS_EVERY == 0 {
                self.progress(SyncProgress::counted(
                    SyncPhase::Building,
                    format!("Linked {}/{} nodes", done + 1, total),
                    done + 1,
                    total,
                ));
            }
        }

        true
    }

    /// Full write when the store holds zero nodes, incremental merge
    /// otherwise. Per-node write failures are logged and skipped; the run
    /// completes with an undercount rather than aborting.
    fn write_phase(
        &self,
        cancel: &AtomicBool,
        nodes: HashMap<String, MessageNode>,
    ) -> Result<Outcome, AppError> {
        let store_is_empty = self.db.lock().expect(DB_LOCK).is_empty()?;
        let total = nodes.len();
        self.progress(SyncProgress::counted(
            SyncPhase::Writing,
            if store_is_empty {
                format!("Writing {total} nodes")
            } else {
                format!("Merging {total} nodes")
            },
            0,
            total,
        ));

        let existing = if store_is_empty {
            let folder = Folder::new(DEFAULT_FOLDER_ID, DEFAULT_FOLDER_NAME, DEFAULT_FOLDER_COLOR);
            self.db.lock().expect(DB_LOCK).insert_folder(&folder)?;
            HashMap::new()
        } else {
            let db = self.db.lock().expect(DB_LOCK);
            if db.get_folder(DEFAULT_FOLDER_ID)?.is_none() {
                return Err(AppError::sync(format!(
                    "default folder '{DEFAULT_FOLDER_ID}' is missing; cannot merge"
                )));
            }
            db.nodes_for_folder(DEFAULT_FOLDER_ID)?
        };

        let mut inserted = 0usize;
        let mut updated = 0usize;
        for (done, (_, id)) in ordered_ids(&nodes).into_iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return Ok(Outcome::Cancelled);
            }

            let incoming = &nodes[&id];
            let (record, is_update) = match existing.get(&id) {
                Some(current) => (merge_into_existing(current, incoming), true),
                None => (incoming.clone(), false),
            };

            match self
                .db
                .lock()
                .expect(DB_LOCK)
                .upsert_node(DEFAULT_FOLDER_ID, &record)
            {
                Ok(()) => {
                    if is_update {
                        updated += 1;
                    } else {
                        inserted += 1;
                    }
                }
                Err(error) => {
                    log::warn!("Failed to write node {id}: {error}");
                }
            }

            if (done + 1) % PROGRESS_EVERY == 0 {
                self.progress(SyncProgress::counted(
                    SyncPhase::Writing,
                    format!("Wrote {}/{} nodes", done + 1, total),
                    done + 1,
                    total,
                ));
            }
        }

        Ok(Outcome::Completed { inserted, updated })
    }

    fn progress(&self, progress: SyncProgress) {
        self.events.publish(BusEvent::Progress(progress));
    }

    fn fail(&self, message: &str, error: &AppError) {
        self.progress(SyncProgress::failed(message, error.to_string()));
        self.events.publish(BusEvent::Error(ErrorEvent {
            message: format!("{message}: {error}"),
        }));
    }
}

/// The external source owns summary, tags, classification and thread links;
/// everything the user touched locally (content cache, lock, expansion,
/// selection) survives the merge untouched.
fn merge_into_existing(current: &MessageNode, incoming: &MessageNode) -> MessageNode {
    let mut merged = current.clone();
    merged.node_type = incoming.node_type;
    merged.summary = incoming.summary.clone();
    merged.tags = incoming.tags.clone();
    merged.parent_id = incoming.parent_id.clone();
    merged.children = incoming.children.clone();
    merged
}

fn ordered_ids(nodes: &HashMap<String, MessageNode>) -> Vec<(String, String)> {
    let mut ordered: Vec<(String, String)> = nodes
        .values()
        .map(|node| (node.timestamp.clone(), node.id.clone()))
        .collect();
    ordered.sort();
    ordered
}

#[cfg(test)]
mod tests;
