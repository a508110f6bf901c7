//! Reader for the external tool's on-disk storage layout:
//! `<root>/storage/message/<sessionId>/<messageId>.json` holds one file per
//! message, and `<root>/storage/part/<messageId>/<partId>.json` holds the
//! ordered content fragments. Metadata is read eagerly; parts only on demand.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

use crate::core::error::AppError;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceMessage {
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(rename = "parentId", default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub time: SourceTime,
    #[serde(default)]
    pub summary: Value,
    #[serde(default)]
    pub agent: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceTime {
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcePart {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "type", default)]
    pub part_type: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SourceInfo {
    pub path: String,
    pub session_count: usize,
    pub message_count: usize,
}

#[derive(Debug, Clone)]
pub struct SourceReader {
    message_root: PathBuf,
    part_root: PathBuf,
}

impl SourceReader {
    pub fn new(data_root: &Path) -> Self {
        Self {
            message_root: data_root.join("storage").join("message"),
            part_root: data_root.join("storage").join("part"),
        }
    }

    pub fn message_root(&self) -> &Path {
        &self.message_root
    }

    pub fn available(&self) -> bool {
        self.message_root.is_dir()
    }

    /// Session directories under the message root, sorted by name so every
    /// run visits them in the same order.
    pub fn list_sessions(&self) -> Result<Vec<PathBuf>, AppError> {
        let entries = std::fs::read_dir(&self.message_root).map_err(|e| {
            AppError::sync_with(
                format!(
                    "failed to read message directory {}",
                    self.message_root.display()
                ),
                e,
            )
        })?;

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                AppError::sync_with("failed to enumerate session directories", e)
            })?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                sessions.push(entry.path());
            }
        }

        sessions.sort();
        Ok(sessions)
    }

    /// All messages of one session. A file that cannot be read or parsed is
    /// logged and skipped; it never aborts the session.
    pub fn read_session(&self, session_dir: &Path) -> Result<Vec<SourceMessage>, AppError> {
        let entries = std::fs::read_dir(session_dir).map_err(|e| {
            AppError::sync_with(
                format!("failed to read session {}", session_dir.display()),
                e,
            )
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .collect();
        files.sort();

        let mut messages = Vec::new();
        for file in files {
            let data = match std::fs::read_to_string(&file) {
                Ok(data) => data,
                Err(error) => {
                    log::warn!("Failed to read message file {}: {}", file.display(), error);
                    continue;
                }
            };
            match serde_json::from_str::<SourceMessage>(&data) {
                Ok(message) if !message.id.is_empty() => messages.push(message),
                Ok(_) => {
                    log::warn!("Skipping message without id: {}", file.display());
                }
                Err(error) => {
                    log::warn!("Failed to parse message {}: {}", file.display(), error);
                }
            }
        }

        Ok(messages)
    }

    /// Body text for one message: all `text`-typed parts joined with
    /// newlines. Returns None when the part directory is missing or holds no
    /// text, so the caller can leave `has_loaded` unset and retry later.
    pub fn read_content(&self, message_id: &str) -> Option<String> {
        let part_dir = self.part_root.join(message_id);
        let entries = std::fs::read_dir(&part_dir).ok()?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("json"))
            .collect();
        files.sort();

        let mut fragments = Vec::new();
        for file in files {
            let Ok(data) = std::fs::read_to_string(&file) else {
                continue;
            };
            let Ok(part) = serde_json::from_str::<SourcePart>(&data) else {
                continue;
            };
            if part.part_type == "text" && !part.text.is_empty() {
                fragments.push(part.text);
            }
        }

        if fragments.is_empty() {
            None
        } else {
            Some(fragments.join("\n"))
        }
    }

    /// Walks the whole message tree once, for startup logging and the info
    /// surface.
    pub fn scan(&self) -> Result<SourceInfo, AppError> {
        let mut session_count = 0;
        let mut message_count = 0;

        for entry in WalkDir::new(&self.message_root).min_depth(1).max_depth(2) {
            let entry = entry.map_err(|e| {
                AppError::sync_with(
                    format!("failed to scan {}", self.message_root.display()),
                    e,
                )
            })?;
            if entry.depth() == 1 && entry.file_type().is_dir() {
                session_count += 1;
            } else if entry.depth() == 2
                && entry.file_type().is_file()
                && entry.path().extension().and_then(|ext| ext.to_str()) == Some("json")
            {
                message_count += 1;
            }
        }

        Ok(SourceInfo {
            path: self.message_root.to_string_lossy().to_string(),
            session_count,
            message_count,
        })
    }

    pub fn epoch_millis_to_rfc3339(millis: i64) -> String {
        chrono::DateTime::from_timestamp_millis(millis)
            .unwrap_or_default()
            .to_rfc3339()
    }
}
