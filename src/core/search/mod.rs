//! In-process fallback ranking over the folder map. The indexed strategy
//! lives in the persistence layer; both produce the same `SearchHit` shape,
//! ordered ascending by rank (lower is better).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::model::{Folder, MessageNode, NodeType};

const WEIGHT_CONTENT: (f64, f64) = (100.0, 150.0);
const WEIGHT_SUMMARY: (f64, f64) = (60.0, 90.0);
const WEIGHT_TYPE: (f64, f64) = (30.0, 50.0);
const WEIGHT_TAG: (f64, f64) = (20.0, 35.0);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub content: String,
    pub summary: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub folder_id: String,
    pub folder_name: String,
    pub folder_color: String,
    pub rank: f64,
}

/// Match quality for one field. Exact full-string matches take the exact
/// weight, substring matches the base weight. When neither applies but the
/// query is an in-order character subsequence of the text, a gentler
/// position-sensitive score is awarded instead; the two are never combined.
fn field_score(query: &str, text: &str, weights: (f64, f64)) -> f64 {
    let (base, exact) = weights;
    if text.contains(query) {
        if text == query {
            return exact;
        }
        return base;
    }
    match subsequence_gap(query, text) {
        Some(gap_streak) => (0.5 / (1.0 + gap_streak as f64)) * base,
        None => 0.0,
    }
}

/// Walks the text once; `gap_streak` ends up counting the non-matching run
/// after the final matched character, so earlier (more buried) matches score
/// lower. Returns None when the query is not a subsequence at all.
fn subsequence_gap(query: &str, text: &str) -> Option<usize> {
    let query: Vec<char> = query.chars().collect();
    if query.is_empty() {
        return None;
    }

    let mut matched = 0;
    let mut gap_streak = 0usize;
    for ch in text.chars() {
        if matched < query.len() && ch == query[matched] {
            matched += 1;
            gap_streak = 0;
        } else if matched > 0 {
            gap_streak += 1;
        }
    }

    (matched == query.len()).then_some(gap_streak)
}

/// Weighted score of one node against a lowercased query. Raw mode skips the
/// summary field entirely; only the first matching tag contributes.
pub fn match_score(query_lower: &str, node: &MessageNode, search_raw: bool) -> f64 {
    let mut score = 0.0;

    score += field_score(query_lower, &node.content.to_lowercase(), WEIGHT_CONTENT);

    if !search_raw {
        score += field_score(query_lower, &node.summary.to_lowercase(), WEIGHT_SUMMARY);
    }

    score += field_score(query_lower, node.node_type.as_str(), WEIGHT_TYPE);

    for tag in &node.tags {
        let tag_score = field_score(query_lower, &tag.to_lowercase(), WEIGHT_TAG);
        if tag_score > 0.0 {
            score += tag_score;
            break;
        }
    }

    score
}

/// Fallback search over the in-memory folder map. Auto-generated nodes are
/// excluded; a node appearing in several folders is reported once, for the
/// folder with the earliest creation timestamp.
pub fn search_folders(
    folders: &HashMap<String, Folder>,
    query: &str,
    search_raw: bool,
    type_filter: Option<NodeType>,
    limit: usize,
) -> Vec<SearchHit> {
    let query_lower = query.trim().to_lowercase();
    if query_lower.is_empty() {
        return Vec::new();
    }

    let mut ordered: Vec<&Folder> = folders.values().collect();
    ordered.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut seen: HashSet<&str> = HashSet::new();
    let mut hits: Vec<SearchHit> = Vec::new();

    for folder in ordered {
        for node in folder.nodes.values() {
            if node.node_type == NodeType::Auto {
                continue;
            }
            if let Some(wanted) = type_filter {
                if node.node_type != wanted {
                    continue;
                }
            }
            if !seen.insert(node.id.as_str()) {
                continue;
            }

            let score = match_score(&query_lower, node, search_raw);
            if score > 0.0 {
                hits.push(SearchHit {
                    id: node.id.clone(),
                    node_type: node.node_type,
                    content: node.content.clone(),
                    summary: node.summary.clone(),
                    timestamp: node.timestamp.clone(),
                    parent_id: node.parent_id.clone(),
                    folder_id: folder.id.clone(),
                    folder_name: folder.name.clone(),
                    folder_color: folder.color.clone(),
                    rank: -score,
                });
            }
        }
    }

    hits.sort_by(|a, b| {
        a.rank
            .partial_cmp(&b.rank)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, node_type: NodeType, content: &str, summary: &str) -> MessageNode {
        MessageNode {
            id: id.to_string(),
            node_type,
            content: content.to_string(),
            summary: summary.to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            parent_id: None,
            children: Vec::new(),
            tags: Vec::new(),
            expanded: false,
            selected: false,
            session_id: None,
            has_loaded: false,
            locked: false,
        }
    }

    fn folder_with(nodes: Vec<MessageNode>) -> HashMap<String, Folder> {
        let mut folder = Folder::new("f1", "Folder", "#111111");
        for n in nodes {
            folder.nodes.insert(n.id.clone(), n);
        }
        let mut folders = HashMap::new();
        folders.insert(folder.id.clone(), folder);
        folders
    }

    #[test]
    fn exact_beats_substring_beats_subsequence_beats_none() {
        let exact = field_score("deploy", "deploy", WEIGHT_CONTENT);
        let substring = field_score("deploy", "please deploy this", WEIGHT_CONTENT);
        let subsequence = field_score("dpy", "deploy", WEIGHT_CONTENT);
        let none = field_score("zzz", "deploy", WEIGHT_CONTENT);

        assert!(exact > substring);
        assert!(substring > subsequence);
        assert!(subsequence > none);
        assert_eq!(none, 0.0);
    }

    #[test]
    fn subsequence_score_is_position_sensitive() {
        // The query resolves right at the end of the first text but is
        // buried before a long tail in the second.
        let near = field_score("abc", "a-b-c", WEIGHT_CONTENT);
        let buried = field_score("abc", "a-b-c-xxxxxxxx", WEIGHT_CONTENT);
        assert!(near > buried);
        assert!(buried > 0.0);
    }

    #[test]
    fn raw_mode_skips_the_summary_field() {
        let n = node("n1", NodeType::User, "", "deploy notes");
        let scored = match_score("deploy", &n, false);
        let raw = match_score("deploy", &n, true);
        assert!(scored > 0.0);
        assert_eq!(raw, 0.0);
    }

    #[test]
    fn only_the_first_matching_tag_counts() {
        let mut n = node("n1", NodeType::User, "", "");
        n.tags = vec![
            "deploy-a".to_string(),
            "deploy-b".to_string(),
            "deploy-c".to_string(),
        ];
        let score = match_score("deploy", &n, true);
        assert_eq!(score, WEIGHT_TAG.0);
    }

    #[test]
    fn auto_generated_nodes_are_excluded_from_fallback_search() {
        let folders = folder_with(vec![
            node("n1", NodeType::Auto, "deploy everything", "deploy"),
            node("n2", NodeType::User, "deploy everything", "deploy"),
        ]);
        let hits = search_folders(&folders, "deploy", false, None, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "n2");
    }

    #[test]
    fn results_are_ordered_by_rank_and_capped() {
        let folders = folder_with(vec![
            node("n1", NodeType::User, "deploy", ""),
            node("n2", NodeType::User, "please deploy this", ""),
            node("n3", NodeType::User, "d-e-p-l-o-y", ""),
            node("n4", NodeType::User, "unrelated", ""),
        ]);

        let hits = search_folders(&folders, "deploy", true, None, 10);
        assert_eq!(
            hits.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(),
            vec!["n1", "n2", "n3"]
        );

        let capped = search_folders(&folders, "deploy", true, None, 2);
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn type_filter_narrows_fallback_results() {
        let folders = folder_with(vec![
            node("n1", NodeType::User, "deploy", ""),
            node("n2", NodeType::Response, "deploy", ""),
        ]);
        let hits = search_folders(&folders, "deploy", true, Some(NodeType::Response), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "n2");
    }

    #[test]
    fn empty_query_returns_nothing() {
        let folders = folder_with(vec![node("n1", NodeType::User, "deploy", "")]);
        assert!(search_folders(&folders, "   ", false, None, 10).is_empty());
    }
}
