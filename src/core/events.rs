use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::model::Folder;

/// Full folder map as published to subscribers. Every `update` carries the
/// complete state; there are no delta events.
pub type TreeSnapshot = HashMap<String, Folder>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Init,
    Reading,
    Building,
    Writing,
    Complete,
    Cancelled,
    Error,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Init => "init",
            SyncPhase::Reading => "reading",
            SyncPhase::Building => "building",
            SyncPhase::Writing => "writing",
            SyncPhase::Complete => "complete",
            SyncPhase::Cancelled => "cancelled",
            SyncPhase::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SyncPhase::Complete | SyncPhase::Cancelled | SyncPhase::Error
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub message: String,
    #[serde(default)]
    pub processed: usize,
    #[serde(default)]
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncProgress {
    pub fn new(phase: SyncPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            processed: 0,
            total: 0,
            error: None,
        }
    }

    pub fn counted(
        phase: SyncPhase,
        message: impl Into<String>,
        processed: usize,
        total: usize,
    ) -> Self {
        Self {
            phase,
            message: message.into(),
            processed,
            total,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            phase: SyncPhase::Error,
            message: message.into(),
            processed: 0,
            total: 0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum BusEvent {
    Init(TreeSnapshot),
    Progress(SyncProgress),
    Update(TreeSnapshot),
    Error(ErrorEvent),
}

impl BusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BusEvent::Init(_) => "init",
            BusEvent::Progress(_) => "progress",
            BusEvent::Update(_) => "update",
            BusEvent::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_events_serialize_as_tagged_envelopes() {
        let event = BusEvent::Progress(SyncProgress::counted(
            SyncPhase::Reading,
            "Read 3/10 sessions...",
            3,
            10,
        ));

        let json = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(json["type"], "progress");
        assert_eq!(json["data"]["phase"], "reading");
        assert_eq!(json["data"]["processed"], 3);
        assert_eq!(json["data"]["total"], 10);
    }

    #[test]
    fn error_progress_carries_the_underlying_message() {
        let progress = SyncProgress::failed("Failed to read messages", "permission denied");
        assert_eq!(progress.phase, SyncPhase::Error);
        assert!(progress.phase.is_terminal());
        assert_eq!(progress.error.as_deref(), Some("permission denied"));
    }
}
