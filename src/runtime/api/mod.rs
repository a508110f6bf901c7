//! The application facade: one explicitly constructed object owning the
//! store, tree, sync engine and bus, passed by reference into every caller.
//! This is the whole surface the transport layer is allowed to touch.

use std::sync::{Arc, Mutex};

use tokio_stream::wrappers::ReceiverStream;

use crate::adapters::bus::EventBus;
use crate::adapters::config::Settings;
use crate::adapters::source::{SourceInfo, SourceReader};
use crate::adapters::treedb::TreeDb;
use crate::core::error::AppError;
use crate::core::events::{BusEvent, TreeSnapshot};
use crate::core::model::{Folder, MessageNode, NodeType};
use crate::core::ports::emitter::EventSink;
use crate::core::search::{self, SearchHit};
use crate::core::sync::{SyncEngine, SyncStart};
use crate::core::tree::{FolderRef, TreeStore};
use crate::runtime::watcher::SourceWatcher;

const DB_LOCK: &str = "database lock poisoned";

pub struct App {
    settings: Settings,
    db: Arc<Mutex<TreeDb>>,
    tree: Arc<TreeStore>,
    sync: SyncEngine,
    bus: Arc<EventBus>,
    source: SourceReader,
}

impl App {
    /// Opens the durable store, loads the tree from it and wires the sync
    /// engine and bus together. Does not start a sync; callers decide when.
    pub fn bootstrap(settings: Settings) -> Result<Self, AppError> {
        let db = Arc::new(Mutex::new(TreeDb::open(&settings.database_path())?));
        let bus = Arc::new(EventBus::new());
        let source = SourceReader::new(&settings.source_root());
        let tree = Arc::new(TreeStore::new(
            db.clone(),
            source.clone(),
            bus.clone() as Arc<dyn EventSink>,
        ));
        let sync = SyncEngine::new(
            db.clone(),
            tree.clone(),
            source.clone(),
            bus.clone() as Arc<dyn EventSink>,
        );

        tree.reload()?;

        Ok(Self {
            settings,
            db,
            tree,
            sync,
            bus,
            source,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn list_folders(&self) -> Vec<Folder> {
        self.tree.list_folders()
    }

    pub fn list_all_nodes(&self) -> Vec<MessageNode> {
        self.tree.all_nodes()
    }

    pub fn create_folder(&self, name: &str, color: &str) -> Result<Folder, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::validation("folder name is required"));
        }
        let color = if color.trim().is_empty() {
            "#4a90d9"
        } else {
            color.trim()
        };
        let folder = Folder::new(&uuid::Uuid::new_v4().to_string(), name, color);
        self.tree.add_folder(folder.clone())?;
        Ok(folder)
    }

    pub fn update_folder(&self, id: &str, name: &str, color: &str) -> Result<(), AppError> {
        if name.trim().is_empty() {
            return Err(AppError::validation("folder name is required"));
        }
        self.tree.update_folder(id, name.trim(), color.trim())
    }

    pub fn delete_folder(&self, id: &str) -> Result<(), AppError> {
        self.tree.delete_folder(id)
    }

    /// Inserts a node; a blank id or timestamp is filled in here so the
    /// transport can pass partial records.
    pub fn create_node(&self, folder: &str, mut node: MessageNode) -> Result<MessageNode, AppError> {
        if node.id.trim().is_empty() {
            node.id = uuid::Uuid::new_v4().to_string();
        } else if self.tree.get_node(&node.id).is_some() {
            return Err(AppError::validation(format!(
                "node {} already exists",
                node.id
            )));
        }
        if node.timestamp.trim().is_empty() {
            node.timestamp = chrono::Utc::now().to_rfc3339();
        }
        self.tree.add_node(&FolderRef::parse(folder), node.clone())?;
        Ok(node)
    }

    pub fn update_node(&self, folder: &str, node: MessageNode) -> Result<(), AppError> {
        self.tree.update_node(&FolderRef::parse(folder), node)
    }

    pub fn delete_node(&self, folder: &str, node_id: &str) -> Result<(), AppError> {
        self.tree.delete_node(&FolderRef::parse(folder), node_id)
    }

    pub fn set_locked(&self, folder: &str, node_id: &str, locked: bool) -> Result<(), AppError> {
        self.tree.set_locked(&FolderRef::parse(folder), node_id, locked)
    }

    /// Lazy body fetch; the first call reads the source parts and caches.
    pub fn node_content(&self, node_id: &str) -> Result<MessageNode, AppError> {
        self.tree.load_content(node_id)
    }

    pub fn reorder(
        &self,
        folder: &str,
        node_id: &str,
        new_parent_id: Option<&str>,
        new_index: i64,
    ) -> Result<(), AppError> {
        self.tree
            .reorder(&FolderRef::parse(folder), node_id, new_parent_id, new_index)
    }

    /// Ranked search. Indexed mode when the text index is available; the
    /// in-memory scorer otherwise, and always for raw searches, which skip
    /// the summary field in a way the index cannot express.
    pub fn search(
        &self,
        query: &str,
        raw: bool,
        type_filter: Option<NodeType>,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>, AppError> {
        let limit = limit.unwrap_or_else(|| self.settings.search_limit());
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        if !raw {
            let db = self.db.lock().expect(DB_LOCK);
            if db.fts_available()? {
                return db.search_nodes(query, type_filter, limit);
            }
        }

        Ok(search::search_folders(
            &self.tree.snapshot(),
            query,
            raw,
            type_filter,
            limit,
        ))
    }

    pub fn start_sync(&self) -> SyncStart {
        self.sync.start()
    }

    pub fn cancel_sync(&self) {
        self.sync.cancel();
    }

    pub fn sync_running(&self) -> bool {
        self.sync.is_running()
    }

    /// Live-update stream. The first event is always `init` with the full
    /// current state; every later mutation republishes the whole tree.
    pub fn subscribe(&self) -> ReceiverStream<BusEvent> {
        let rx = self.bus.subscribe(BusEvent::Init(self.tree.snapshot()));
        ReceiverStream::new(rx)
    }

    pub fn export_state(&self) -> TreeSnapshot {
        self.tree.snapshot()
    }

    pub fn import_folders(&self, folders: TreeSnapshot) -> Result<usize, AppError> {
        self.tree.import_folders(folders)
    }

    /// Concatenates the bodies of the given nodes for the clipboard. Nodes
    /// without a body fall back to their summary; unknown ids are logged and
    /// skipped so one stale selection does not void the whole copy.
    pub fn copy_selected(&self, node_ids: &[String]) -> Result<String, AppError> {
        let mut blocks = Vec::new();
        for node_id in node_ids {
            let node = match self.tree.load_content(node_id) {
                Ok(node) => node,
                Err(error) if error.is_not_found() => {
                    log::warn!("Skipping unknown node {node_id} in copy");
                    continue;
                }
                Err(error) => return Err(error),
            };
            let body = if node.content.is_empty() {
                node.summary.clone()
            } else {
                node.content.clone()
            };
            blocks.push(format!("## {}\n\n{}", node.summary, body));
        }
        Ok(blocks.join("\n\n---\n\n"))
    }

    /// Clears the durable store and the in-memory tree entirely.
    pub fn reset(&self) -> Result<(), AppError> {
        self.db.lock().expect(DB_LOCK).delete_all()?;
        self.tree.reload()?;
        self.bus.publish(BusEvent::Update(self.tree.snapshot()));
        Ok(())
    }

    pub fn source_info(&self) -> Result<SourceInfo, AppError> {
        self.source.scan()
    }

    /// Starts the auto-sync watcher over the message root. The handle stops
    /// the watcher on drop.
    pub fn watch_source(&self) -> Result<SourceWatcher, AppError> {
        SourceWatcher::spawn(
            self.source.message_root().to_path_buf(),
            self.settings.watch_debounce(),
            self.sync.clone(),
        )
    }
}
