//! Authoritative in-memory folder map. Every mutation and read passes
//! through here: reads share the lock, writers are exclusive, and each
//! mutation persists to the store and then publishes the full current state.
//! Nodes live in an id-keyed arena; `parent_id`/`children` hold ids, never
//! references, and adjacency is rebuilt after every bulk load.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use crate::adapters::source::SourceReader;
use crate::adapters::treedb::TreeDb;
use crate::core::error::AppError;
use crate::core::events::{BusEvent, TreeSnapshot};
use crate::core::model::{Folder, MessageNode};
use crate::core::ports::emitter::EventSink;

const MAP_LOCK: &str = "folder map lock poisoned";
const DB_LOCK: &str = "database lock poisoned";

/// Folder designator for node mutations. The empty string and `"all"` are
/// sentinels meaning "every folder containing the node".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderRef {
    All,
    Id(String),
}

impl FolderRef {
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() || raw == "all" {
            FolderRef::All
        } else {
            FolderRef::Id(raw.to_string())
        }
    }
}

pub struct TreeStore {
    folders: RwLock<HashMap<String, Folder>>,
    db: Arc<Mutex<TreeDb>>,
    source: SourceReader,
    events: Arc<dyn EventSink>,
}

impl TreeStore {
    pub fn new(db: Arc<Mutex<TreeDb>>, source: SourceReader, events: Arc<dyn EventSink>) -> Self {
        Self {
            folders: RwLock::new(HashMap::new()),
            db,
            source,
            events,
        }
    }

    /// Replaces the in-memory map with the durable state. A folder whose
    /// nodes fail to load is logged and skipped rather than failing the
    /// whole reload.
    pub fn reload(&self) -> Result<(), AppError> {
        let mut loaded = HashMap::new();
        {
            let db = self.db.lock().expect(DB_LOCK);
            for mut folder in db.all_folders()? {
                match db.nodes_for_folder(&folder.id) {
                    Ok(nodes) => folder.nodes = nodes,
                    Err(error) => {
                        log::warn!("Failed to load nodes for folder {}: {}", folder.id, error);
                        continue;
                    }
                }
                loaded.insert(folder.id.clone(), folder);
            }
        }

        *self.folders.write().expect(MAP_LOCK) = loaded;
        Ok(())
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.folders.read().expect(MAP_LOCK).clone()
    }

    /// Folders newest first, nodes included.
    pub fn list_folders(&self) -> Vec<Folder> {
        let folders = self.folders.read().expect(MAP_LOCK);
        let mut out: Vec<Folder> = folders.values().cloned().collect();
        out.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        out
    }

    /// All nodes across folders, deduplicated by id. Folders are visited in
    /// (created_at, id) order so the first-seen winner is deterministic.
    pub fn all_nodes(&self) -> Vec<MessageNode> {
        let folders = self.folders.read().expect(MAP_LOCK);
        let mut out: Vec<MessageNode> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for folder_id in ordered_folder_ids(&folders) {
            let folder = &folders[&folder_id];
            let mut nodes: Vec<&MessageNode> = folder.nodes.values().collect();
            nodes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
            for node in nodes {
                if seen.insert(node.id.clone()) {
                    out.push(node.clone());
                }
            }
        }

        out
    }

    pub fn get_node(&self, node_id: &str) -> Option<MessageNode> {
        let folders = self.folders.read().expect(MAP_LOCK);
        first_node(&folders, node_id).cloned()
    }

    pub fn add_folder(&self, folder: Folder) -> Result<(), AppError> {
        let snapshot = {
            let mut folders = self.folders.write().expect(MAP_LOCK);
            self.db.lock().expect(DB_LOCK).insert_folder(&folder)?;
            folders.insert(folder.id.clone(), folder);
            folders.clone()
        };
        self.events.publish(BusEvent::Update(snapshot));
        Ok(())
    }

    /// Renames/recolors a folder; its nodes and creation time are kept.
    pub fn update_folder(&self, id: &str, name: &str, color: &str) -> Result<(), AppError> {
        let snapshot = {
            let mut folders = self.folders.write().expect(MAP_LOCK);
            let folder = folders
                .get_mut(id)
                .ok_or_else(|| AppError::not_found(format!("folder {id}")))?;
            folder.name = name.to_string();
            folder.color = color.to_string();
            self.db.lock().expect(DB_LOCK).insert_folder(folder)?;
            folders.clone()
        };
        self.events.publish(BusEvent::Update(snapshot));
        Ok(())
    }

    pub fn delete_folder(&self, id: &str) -> Result<(), AppError> {
        let snapshot = {
            let mut folders = self.folders.write().expect(MAP_LOCK);
            if !folders.contains_key(id) {
                return Err(AppError::not_found(format!("folder {id}")));
            }
            self.db.lock().expect(DB_LOCK).delete_folder(id)?;
            folders.remove(id);
            folders.clone()
        };
        self.events.publish(BusEvent::Update(snapshot));
        Ok(())
    }

    /// Inserts a node into the designated folder, or into every folder when
    /// the sentinel is used, wiring it into an existing parent's children.
    pub fn add_node(&self, folder_ref: &FolderRef, node: MessageNode) -> Result<(), AppError> {
        let snapshot = {
            let mut folders = self.folders.write().expect(MAP_LOCK);
            let target_ids = match folder_ref {
                FolderRef::Id(id) => {
                    if !folders.contains_key(id) {
                        return Err(AppError::not_found(format!("folder {id}")));
                    }
                    vec![id.clone()]
                }
                FolderRef::All => ordered_folder_ids(&folders),
            };

            self.persist_node(&target_ids, &node)?;

            for folder_id in &target_ids {
                let folder = folders.get_mut(folder_id).expect("target folder present");
                attach_node(folder, node.clone());
            }
            folders.clone()
        };
        self.events.publish(BusEvent::Update(snapshot));
        Ok(())
    }

    /// Replaces the node record wherever the designator matches. NotFound
    /// when no targeted folder contains the id.
    pub fn update_node(&self, folder_ref: &FolderRef, node: MessageNode) -> Result<(), AppError> {
        let snapshot = {
            let mut folders = self.folders.write().expect(MAP_LOCK);
            let containing = containing_folders(&folders, folder_ref, &node.id)?;

            self.persist_node(&containing, &node)?;

            for folder_id in &containing {
                let folder = folders.get_mut(folder_id).expect("containing folder present");
                folder.nodes.insert(node.id.clone(), node.clone());
            }
            folders.clone()
        };
        self.events.publish(BusEvent::Update(snapshot));
        Ok(())
    }

    /// Removes the node and strips its id from every remaining node's
    /// children in the targeted folders.
    pub fn delete_node(&self, folder_ref: &FolderRef, node_id: &str) -> Result<(), AppError> {
        let snapshot = {
            let mut folders = self.folders.write().expect(MAP_LOCK);
            let containing = containing_folders(&folders, folder_ref, node_id)?;

            self.db.lock().expect(DB_LOCK).delete_node(node_id)?;

            for folder_id in &containing {
                let folder = folders.get_mut(folder_id).expect("containing folder present");
                folder.nodes.remove(node_id);
                for node in folder.nodes.values_mut() {
                    node.children.retain(|child| child != node_id);
                }
            }
            folders.clone()
        };
        self.events.publish(BusEvent::Update(snapshot));
        Ok(())
    }

    /// Detaches the node from its current parent (filtered removal, safe
    /// against concurrent children edits under the same lock), reparents it,
    /// and splices it in at `new_index`, appending when out of range.
    pub fn reorder(
        &self,
        folder_ref: &FolderRef,
        node_id: &str,
        new_parent_id: Option<&str>,
        new_index: i64,
    ) -> Result<(), AppError> {
        let snapshot = {
            let mut folders = self.folders.write().expect(MAP_LOCK);
            let containing = containing_folders(&folders, folder_ref, node_id)?;

            for folder_id in &containing {
                let folder = folders.get_mut(folder_id).expect("containing folder present");
                reorder_in_folder(folder, node_id, new_parent_id, new_index);
            }

            let moved = {
                let first = containing.first().expect("at least one containing folder");
                folders[first].nodes[node_id].clone()
            };
            self.persist_node(&containing, &moved)?;
            folders.clone()
        };
        self.events.publish(BusEvent::Update(snapshot));
        Ok(())
    }

    pub fn set_locked(
        &self,
        folder_ref: &FolderRef,
        node_id: &str,
        locked: bool,
    ) -> Result<(), AppError> {
        let snapshot = {
            let mut folders = self.folders.write().expect(MAP_LOCK);
            let containing = containing_folders(&folders, folder_ref, node_id)?;

            self.db.lock().expect(DB_LOCK).set_node_locked(node_id, locked)?;

            for folder_id in &containing {
                let folder = folders.get_mut(folder_id).expect("containing folder present");
                if let Some(node) = folder.nodes.get_mut(node_id) {
                    node.locked = locked;
                }
            }
            folders.clone()
        };
        self.events.publish(BusEvent::Update(snapshot));
        Ok(())
    }

    /// Lazy body fetch: the first access reads the message's text parts from
    /// the source and caches them; repeat calls are free. Not a mutation, so
    /// nothing is published.
    pub fn load_content(&self, node_id: &str) -> Result<MessageNode, AppError> {
        {
            let folders = self.folders.read().expect(MAP_LOCK);
            match first_node(&folders, node_id) {
                Some(node) if node.has_loaded => return Ok(node.clone()),
                Some(_) => {}
                None => return Err(AppError::not_found(format!("node {node_id}"))),
            }
        }

        let mut folders = self.folders.write().expect(MAP_LOCK);
        let Some(existing) = first_node(&folders, node_id) else {
            return Err(AppError::not_found(format!("node {node_id}")));
        };
        if existing.has_loaded {
            return Ok(existing.clone());
        }

        let Some(content) = self.source.read_content(node_id) else {
            // No text parts yet; leave has_loaded unset so a later call
            // retries.
            return Ok(existing.clone());
        };

        for folder in folders.values_mut() {
            if let Some(node) = folder.nodes.get_mut(node_id) {
                node.content = content.clone();
                node.has_loaded = true;
            }
        }

        let updated = first_node(&folders, node_id)
            .expect("node still present under write lock")
            .clone();
        {
            let mut db = self.db.lock().expect(DB_LOCK);
            if let Some(folder_id) = db.node_folder_id(node_id)? {
                db.upsert_node(&folder_id, &updated)?;
            }
        }
        Ok(updated)
    }

    /// Merges an exported folder map back in, persisting every folder and
    /// node, and republishes. Returns the number of folders imported.
    pub fn import_folders(&self, imported: TreeSnapshot) -> Result<usize, AppError> {
        let count = imported.len();
        let snapshot = {
            let mut folders = self.folders.write().expect(MAP_LOCK);
            {
                let mut db = self.db.lock().expect(DB_LOCK);
                for folder in imported.values() {
                    db.insert_folder(folder)?;
                    for node in folder.nodes.values() {
                        if let Err(error) = db.upsert_node(&folder.id, node) {
                            log::warn!("Failed to persist imported node {}: {}", node.id, error);
                        }
                    }
                }
            }
            for (id, folder) in imported {
                folders.insert(id, folder);
            }
            folders.clone()
        };
        self.events.publish(BusEvent::Update(snapshot));
        Ok(count)
    }

    /// Persist to the folder already holding the node durably when it is
    /// among the targets, otherwise to the first target. A node is stored in
    /// exactly one folder row even when the sentinel fans it out in memory.
    fn persist_node(&self, target_ids: &[String], node: &MessageNode) -> Result<(), AppError> {
        let Some(first) = target_ids.first() else {
            return Ok(());
        };
        let mut db = self.db.lock().expect(DB_LOCK);
        let durable = db
            .node_folder_id(&node.id)?
            .filter(|folder_id| target_ids.contains(folder_id))
            .unwrap_or_else(|| first.clone());
        db.upsert_node(&durable, node)
    }
}

fn ordered_folder_ids(folders: &HashMap<String, Folder>) -> Vec<String> {
    let mut ids: Vec<&Folder> = folders.values().collect();
    ids.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    ids.into_iter().map(|folder| folder.id.clone()).collect()
}

fn first_node<'a>(
    folders: &'a HashMap<String, Folder>,
    node_id: &str,
) -> Option<&'a MessageNode> {
    for folder_id in ordered_folder_ids(folders) {
        if let Some(node) = folders[&folder_id].nodes.get(node_id) {
            return Some(node);
        }
    }
    None
}

/// Resolves a designator to the folders that actually contain the node;
/// NotFound when none do.
fn containing_folders(
    folders: &HashMap<String, Folder>,
    folder_ref: &FolderRef,
    node_id: &str,
) -> Result<Vec<String>, AppError> {
    let containing: Vec<String> = match folder_ref {
        FolderRef::Id(id) => {
            let folder = folders
                .get(id)
                .ok_or_else(|| AppError::not_found(format!("folder {id}")))?;
            if folder.nodes.contains_key(node_id) {
                vec![id.clone()]
            } else {
                Vec::new()
            }
        }
        FolderRef::All => ordered_folder_ids(folders)
            .into_iter()
            .filter(|folder_id| folders[folder_id].nodes.contains_key(node_id))
            .collect(),
    };

    if containing.is_empty() {
        return Err(AppError::not_found(format!("node {node_id}")));
    }
    Ok(containing)
}

fn attach_node(folder: &mut Folder, node: MessageNode) {
    if let Some(parent_id) = node.parent_id.clone() {
        if let Some(parent) = folder.nodes.get_mut(&parent_id) {
            if !parent.children.contains(&node.id) {
                parent.children.push(node.id.clone());
            }
        }
    }
    folder.nodes.insert(node.id.clone(), node);
}

fn reorder_in_folder(
    folder: &mut Folder,
    node_id: &str,
    new_parent_id: Option<&str>,
    new_index: i64,
) {
    let old_parent_id = folder
        .nodes
        .get(node_id)
        .and_then(|node| node.parent_id.clone());

    if let Some(old_parent_id) = old_parent_id {
        if let Some(old_parent) = folder.nodes.get_mut(&old_parent_id) {
            old_parent.children.retain(|child| child != node_id);
        }
    }

    if let Some(node) = folder.nodes.get_mut(node_id) {
        node.parent_id = new_parent_id.map(str::to_string);
    }

    let Some(new_parent_id) = new_parent_id else {
        return;
    };
    if let Some(new_parent) = folder.nodes.get_mut(new_parent_id) {
        if new_index >= 0 && (new_index as usize) <= new_parent.children.len() {
            new_parent
                .children
                .insert(new_index as usize, node_id.to_string());
        } else {
            new_parent.children.push(node_id.to_string());
        }
    }
}
