//! Pure classification of raw source messages into node types and tags.
//!
//! The external tool stores the message summary as an absent value, a bool,
//! a plain string, or an object with a `title` field. That union is resolved
//! to a plain string here, at the ingestion boundary, so nothing downstream
//! ever sees the variant.

use serde_json::Value;

use crate::core::model::NodeType;

pub const AUTO_GENERATED_TAG: &str = "auto-generated";

const AUTO_GENERATED_PATTERNS: &[&str] = &[
    "auto-generated",
    "auto generated",
    "previous query",
    "previous prompt",
    "history",
    "continue",
    "resume",
    "up arrow",
    "\u{2191}",
    "\u{2191} arrow",
    "continuation",
    "repeating",
    "recalling",
    "recall",
];

#[derive(Debug, Clone)]
pub struct Classification {
    pub node_type: NodeType,
    pub tags: Vec<String>,
    pub title: String,
}

pub fn summary_title(summary: &Value) -> String {
    match summary {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

pub fn is_auto_generated(title: &str) -> bool {
    if title.is_empty() {
        return false;
    }
    let lowered = title.to_lowercase();
    AUTO_GENERATED_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

pub fn classify(role: &str, agent: &str, summary: &Value) -> Classification {
    let title = summary_title(summary);

    let (node_type, tags) = match role {
        "assistant" => (NodeType::Response, base_tags(agent, role)),
        "system" => (NodeType::System, base_tags(agent, role)),
        "user" => {
            if is_auto_generated(&title) {
                let mut tags = base_tags(agent, role);
                tags.push(AUTO_GENERATED_TAG.to_string());
                (NodeType::Auto, tags)
            } else {
                (NodeType::User, base_tags(agent, role))
            }
        }
        _ => (NodeType::Prompt, base_tags(agent, role)),
    };

    let title = if title.is_empty() {
        default_title(role)
    } else {
        title
    };

    Classification {
        node_type,
        tags,
        title,
    }
}

fn base_tags(agent: &str, role: &str) -> Vec<String> {
    vec![agent.to_string(), role.to_string()]
}

fn default_title(role: &str) -> String {
    match role {
        "assistant" => "AI response".to_string(),
        "system" => "System message".to_string(),
        _ => format!("{role} message"),
    }
}
