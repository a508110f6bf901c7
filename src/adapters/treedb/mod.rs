//! Durable mirror of folders, nodes and tags plus the FTS5 text index over
//! node content/summary/type. All write access funnels through one logical
//! connection; callers serialize on the surrounding mutex.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::core::error::AppError;
use crate::core::model::{Folder, MessageNode, NodeType};
use crate::core::search::SearchHit;

pub struct TreeDb {
    conn: Connection,
}

impl TreeDb {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS folders (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                color TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                folder_id TEXT NOT NULL,
                type TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                summary TEXT NOT NULL DEFAULT '',
                timestamp TEXT NOT NULL,
                parent_id TEXT,
                expanded INTEGER NOT NULL DEFAULT 0,
                selected INTEGER NOT NULL DEFAULT 0,
                session_id TEXT,
                has_loaded INTEGER NOT NULL DEFAULT 0,
                locked INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (folder_id) REFERENCES folders(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                FOREIGN KEY (node_id) REFERENCES nodes(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_folder_id ON nodes(folder_id);
            CREATE INDEX IF NOT EXISTS idx_nodes_parent_id ON nodes(parent_id);
            CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(type);
            CREATE INDEX IF NOT EXISTS idx_nodes_timestamp ON nodes(timestamp);
            CREATE INDEX IF NOT EXISTS idx_tags_node_id ON tags(node_id);
            ",
        )?;

        // FTS is optional. When sqlite is built without FTS5 the indexed
        // search degrades to the in-memory scorer.
        let _ = conn.execute_batch(
            "
            CREATE VIRTUAL TABLE IF NOT EXISTS nodes_fts USING fts5(
                node_id UNINDEXED,
                content,
                summary,
                type,
                tokenize = 'unicode61'
            );
            ",
        );

        sync_nodes_fts(&conn)?;

        Ok(Self { conn })
    }

    pub fn fts_available(&self) -> Result<bool, AppError> {
        Ok(table_exists(&self.conn, "nodes_fts")?)
    }

    pub fn node_count(&self) -> Result<i64, AppError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, AppError> {
        Ok(self.node_count()? == 0)
    }

    pub fn insert_folder(&mut self, folder: &Folder) -> Result<(), AppError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO folders (id, name, color, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![folder.id, folder.name, folder.color, folder.created_at],
        )?;
        Ok(())
    }

    pub fn get_folder(&self, id: &str) -> Result<Option<Folder>, AppError> {
        let folder = self
            .conn
            .query_row(
                "SELECT id, name, color, created_at FROM folders WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Folder {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        color: row.get(2)?,
                        created_at: row.get(3)?,
                        nodes: HashMap::new(),
                    })
                },
            )
            .optional()?;
        Ok(folder)
    }

    /// All folders without their nodes, newest first.
    pub fn all_folders(&self) -> Result<Vec<Folder>, AppError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, color, created_at FROM folders ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Folder {
                id: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
                created_at: row.get(3)?,
                nodes: HashMap::new(),
            })
        })?;

        let mut folders = Vec::new();
        for row in rows {
            folders.push(row?);
        }
        Ok(folders)
    }

    pub fn delete_folder(&mut self, id: &str) -> Result<(), AppError> {
        if table_exists(&self.conn, "nodes_fts")? {
            self.conn.execute(
                "DELETE FROM nodes_fts WHERE node_id IN (SELECT id FROM nodes WHERE folder_id = ?1)",
                params![id],
            )?;
        }
        self.conn
            .execute("DELETE FROM folders WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Loads a folder's nodes and rebuilds parent->children adjacency from
    /// the stored `parent_id` column. Children are never persisted directly;
    /// ordering is (timestamp, id) so repeated loads agree.
    pub fn nodes_for_folder(
        &self,
        folder_id: &str,
    ) -> Result<HashMap<String, MessageNode>, AppError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, type, content, summary, timestamp, parent_id,
                    expanded, selected, session_id, has_loaded, locked
             FROM nodes
             WHERE folder_id = ?1
             ORDER BY timestamp DESC",
        )?;
        let rows = stmt.query_map(params![folder_id], row_to_node)?;

        let mut nodes: HashMap<String, MessageNode> = HashMap::new();
        for row in rows {
            let node = row?;
            nodes.insert(node.id.clone(), node);
        }

        if nodes.is_empty() {
            return Ok(nodes);
        }

        self.attach_tags(&mut nodes)?;
        rebuild_children(&mut nodes);
        Ok(nodes)
    }

    pub fn get_node(&self, id: &str) -> Result<Option<MessageNode>, AppError> {
        let node = self
            .conn
            .query_row(
                "SELECT id, type, content, summary, timestamp, parent_id,
                        expanded, selected, session_id, has_loaded, locked
                 FROM nodes
                 WHERE id = ?1",
                params![id],
                row_to_node,
            )
            .optional()?;

        let Some(mut node) = node else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare("SELECT tag FROM tags WHERE node_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
        for row in rows {
            node.tags.push(row?);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT id FROM nodes WHERE parent_id = ?1 ORDER BY timestamp, id")?;
        let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
        for row in rows {
            node.children.push(row?);
        }

        Ok(Some(node))
    }

    pub fn node_folder_id(&self, id: &str) -> Result<Option<String>, AppError> {
        let folder_id = self
            .conn
            .query_row(
                "SELECT folder_id FROM nodes WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(folder_id)
    }

    /// One transaction per node: replace the row, re-create its tag rows and
    /// refresh its index entry, so the node and its tags never diverge even
    /// if the process dies mid-batch.
    pub fn upsert_node(&mut self, folder_id: &str, node: &MessageNode) -> Result<(), AppError> {
        let has_fts = table_exists(&self.conn, "nodes_fts")?;
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO nodes
             (id, folder_id, type, content, summary, timestamp, parent_id,
              expanded, selected, session_id, has_loaded, locked)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                node.id,
                folder_id,
                node.node_type.as_str(),
                node.content,
                node.summary,
                node.timestamp,
                node.parent_id,
                i64::from(node.expanded),
                i64::from(node.selected),
                node.session_id,
                i64::from(node.has_loaded),
                i64::from(node.locked),
            ],
        )?;

        tx.execute("DELETE FROM tags WHERE node_id = ?1", params![node.id])?;
        for tag in &node.tags {
            tx.execute(
                "INSERT INTO tags (node_id, tag) VALUES (?1, ?2)",
                params![node.id, tag],
            )?;
        }

        if has_fts {
            tx.execute(
                "DELETE FROM nodes_fts WHERE node_id = ?1",
                params![node.id],
            )?;
            tx.execute(
                "INSERT INTO nodes_fts (node_id, content, summary, type) VALUES (?1, ?2, ?3, ?4)",
                params![
                    node.id,
                    node.content,
                    node.summary,
                    node.node_type.as_str()
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn delete_node(&mut self, id: &str) -> Result<(), AppError> {
        if table_exists(&self.conn, "nodes_fts")? {
            self.conn
                .execute("DELETE FROM nodes_fts WHERE node_id = ?1", params![id])?;
        }
        self.conn
            .execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Returns false when no such node row exists.
    pub fn set_node_locked(&mut self, id: &str, locked: bool) -> Result<bool, AppError> {
        let updated = self.conn.execute(
            "UPDATE nodes SET locked = ?1 WHERE id = ?2",
            params![i64::from(locked), id],
        )?;
        Ok(updated > 0)
    }

    /// Indexed search: bm25 rank ascending (lower is better), optional type
    /// filter, folder metadata denormalized for display.
    pub fn search_nodes(
        &self,
        query: &str,
        type_filter: Option<NodeType>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, AppError> {
        if !table_exists(&self.conn, "nodes_fts")? {
            return Ok(Vec::new());
        }
        let Some(fts_query) = build_fts_query(query) else {
            return Ok(Vec::new());
        };

        let base = "SELECT n.id, n.type, n.content, n.summary, n.timestamp, n.parent_id,
                           COALESCE(f.id, ''), COALESCE(f.name, ''), COALESCE(f.color, ''),
                           bm25(nodes_fts) AS rank
                    FROM nodes_fts
                    JOIN nodes n ON n.id = nodes_fts.node_id
                    LEFT JOIN folders f ON n.folder_id = f.id
                    WHERE nodes_fts MATCH ?1";

        let map_hit = |row: &rusqlite::Row<'_>| -> rusqlite::Result<SearchHit> {
            Ok(SearchHit {
                id: row.get(0)?,
                node_type: NodeType::parse(&row.get::<_, String>(1)?),
                content: row.get(2)?,
                summary: row.get(3)?,
                timestamp: row.get(4)?,
                parent_id: row.get(5)?,
                folder_id: row.get(6)?,
                folder_name: row.get(7)?,
                folder_color: row.get(8)?,
                rank: row.get(9)?,
            })
        };

        let mut hits = Vec::new();
        match type_filter {
            Some(node_type) => {
                let sql = format!("{base} AND n.type = ?2 ORDER BY rank LIMIT ?3");
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![fts_query, node_type.as_str(), limit as i64],
                    map_hit,
                )?;
                for row in rows {
                    hits.push(row?);
                }
            }
            None => {
                let sql = format!("{base} ORDER BY rank LIMIT ?2");
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(params![fts_query, limit as i64], map_hit)?;
                for row in rows {
                    hits.push(row?);
                }
            }
        }

        Ok(hits)
    }

    pub fn delete_all(&mut self) -> Result<(), AppError> {
        if table_exists(&self.conn, "nodes_fts")? {
            self.conn.execute("DELETE FROM nodes_fts", [])?;
        }
        self.conn.execute("DELETE FROM tags", [])?;
        self.conn.execute("DELETE FROM nodes", [])?;
        self.conn.execute("DELETE FROM folders", [])?;
        Ok(())
    }

    fn attach_tags(&self, nodes: &mut HashMap<String, MessageNode>) -> Result<(), AppError> {
        let node_ids: Vec<&str> = nodes.keys().map(String::as_str).collect();
        let sql = format!(
            "SELECT node_id, tag FROM tags WHERE node_id IN ({}) ORDER BY id",
            placeholders(node_ids.len())
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(node_ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (node_id, tag) = row?;
            if let Some(node) = nodes.get_mut(&node_id) {
                node.tags.push(tag);
            }
        }
        Ok(())
    }
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageNode> {
    Ok(MessageNode {
        id: row.get(0)?,
        node_type: NodeType::parse(&row.get::<_, String>(1)?),
        content: row.get(2)?,
        summary: row.get(3)?,
        timestamp: row.get(4)?,
        parent_id: row.get(5)?,
        children: Vec::new(),
        tags: Vec::new(),
        expanded: row.get::<_, i64>(6)? == 1,
        selected: row.get::<_, i64>(7)? == 1,
        session_id: row.get(8)?,
        has_loaded: row.get::<_, i64>(9)? == 1,
        locked: row.get::<_, i64>(10)? == 1,
    })
}

/// Rebuilds every node's `children` from `parent_id`, visiting nodes in
/// (timestamp, id) order so the result is stable across loads.
pub fn rebuild_children(nodes: &mut HashMap<String, MessageNode>) {
    let mut ordered: Vec<(String, String)> = nodes
        .values()
        .map(|node| (node.timestamp.clone(), node.id.clone()))
        .collect();
    ordered.sort();

    for node in nodes.values_mut() {
        node.children.clear();
    }

    for (_, id) in ordered {
        let Some(parent_id) = nodes.get(&id).and_then(|node| node.parent_id.clone()) else {
            continue;
        };
        if let Some(parent) = nodes.get_mut(&parent_id) {
            parent.children.push(id);
        }
    }
}

fn placeholders(count: usize) -> String {
    let mut out = String::new();
    for i in 1..=count {
        if i > 1 {
            out.push(',');
        }
        out.push_str(&format!("?{i}"));
    }
    out
}

fn build_fts_query(query: &str) -> Option<String> {
    let mut terms = Vec::new();
    for token in query
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| token.chars().count() >= 2)
    {
        let cleaned = token.trim().to_lowercase();
        if cleaned.is_empty() || terms.iter().any(|existing| existing == &cleaned) {
            continue;
        }
        terms.push(cleaned);
        if terms.len() >= 12 {
            break;
        }
    }

    if terms.is_empty() {
        return None;
    }

    Some(
        terms
            .iter()
            .map(|term| format!("\"{}\"*", term.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// The index rows are rebuilt from scratch when the node and index counts
/// diverge (e.g. the database was last written by an FTS-less build).
fn sync_nodes_fts(conn: &Connection) -> rusqlite::Result<()> {
    if !table_exists(conn, "nodes_fts")? {
        return Ok(());
    }

    let node_count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
    let fts_count: i64 = conn.query_row("SELECT COUNT(*) FROM nodes_fts", [], |row| row.get(0))?;
    if node_count == fts_count {
        return Ok(());
    }

    conn.execute("DELETE FROM nodes_fts", [])?;
    conn.execute(
        "INSERT INTO nodes_fts (node_id, content, summary, type)
         SELECT id, content, summary, type FROM nodes",
        [],
    )?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
