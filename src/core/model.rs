use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FOLDER_ID: &str = "opencode";
pub const DEFAULT_FOLDER_NAME: &str = "OpenCode History";
pub const DEFAULT_FOLDER_COLOR: &str = "#e94560";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Prompt,
    Response,
    User,
    Auto,
    System,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Prompt => "prompt",
            NodeType::Response => "response",
            NodeType::User => "user",
            NodeType::Auto => "auto",
            NodeType::System => "system",
        }
    }

    /// Total parse; unrecognized stored values fall back to the classifier
    /// default rather than failing a whole row load.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "response" => NodeType::Response,
            "user" => NodeType::User,
            "auto" => NodeType::Auto,
            "system" => NodeType::System,
            _ => NodeType::Prompt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub expanded: bool,
    #[serde(default)]
    pub selected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub has_loaded: bool,
    #[serde(default)]
    pub locked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub color: String,
    pub created_at: String,
    #[serde(default)]
    pub nodes: HashMap<String, MessageNode>,
}

impl Folder {
    pub fn new(id: &str, name: &str, color: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            color: color.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            nodes: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips_through_wire_form() {
        for node_type in [
            NodeType::Prompt,
            NodeType::Response,
            NodeType::User,
            NodeType::Auto,
            NodeType::System,
        ] {
            assert_eq!(NodeType::parse(node_type.as_str()), node_type);
        }
    }

    #[test]
    fn node_type_parse_defaults_unknown_values_to_prompt() {
        assert_eq!(NodeType::parse("banana"), NodeType::Prompt);
        assert_eq!(NodeType::parse(""), NodeType::Prompt);
    }

    #[test]
    fn message_node_serializes_with_camel_case_field_names() {
        let node = MessageNode {
            id: "msg_1".to_string(),
            node_type: NodeType::Response,
            content: String::new(),
            summary: "Title".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            parent_id: Some("msg_0".to_string()),
            children: Vec::new(),
            tags: vec!["build".to_string()],
            expanded: false,
            selected: false,
            session_id: Some("ses_1".to_string()),
            has_loaded: false,
            locked: true,
        };

        let json = serde_json::to_value(&node).expect("serialize node");
        assert_eq!(json["type"], "response");
        assert_eq!(json["parentId"], "msg_0");
        assert_eq!(json["sessionId"], "ses_1");
        assert_eq!(json["hasLoaded"], false);
        assert_eq!(json["locked"], true);
    }
}
