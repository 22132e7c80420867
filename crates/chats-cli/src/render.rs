//! Transcript rendering for decrypted conversations.
//!
//! A conversation carries a `mapping` of message nodes linked by `parent`/`children`. Rendering
//! walks it depth-first from the root with an explicit stack, so deeply branched or very long
//! conversations cannot exhaust the call stack, and a visited set stops malformed cycles.

use std::collections::HashSet;

use chrono::DateTime;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// User and assistant turns in traversal order. `None` when no root node exists.
pub fn turns(conversation: &Value) -> Option<Vec<Turn>> {
    let empty = Map::new();
    let mapping = conversation
        .get("mapping")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let root = mapping
        .iter()
        .find(|(_, node)| node.get("parent").map_or(true, Value::is_null))
        .map(|(id, _)| id.as_str())?;

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(node_id) = stack.pop() {
        if !seen.insert(node_id) {
            continue;
        }
        let Some(node) = mapping.get(node_id) else {
            continue;
        };
        if let Some(turn) = node.get("message").and_then(turn_of) {
            out.push(turn);
        }
        if let Some(children) = node.get("children").and_then(Value::as_array) {
            // Reverse so the first child is visited first.
            stack.extend(children.iter().rev().filter_map(Value::as_str));
        }
    }
    Some(out)
}

fn turn_of(message: &Value) -> Option<Turn> {
    let role = match message.pointer("/author/role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        _ => return None,
    };
    let text: String = message
        .pointer("/content/parts")
        .and_then(Value::as_array)?
        .iter()
        .filter_map(Value::as_str)
        .collect();
    if text.trim().is_empty() {
        return None;
    }
    Some(Turn { role, text })
}

fn title(conversation: &Value) -> &str {
    conversation
        .get("title")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or("Untitled")
}

/// Terminal transcript used by `read`.
pub fn render_transcript(conversation: &Value) -> String {
    let mut out = format!("# {}\n\n", title(conversation));
    match turns(conversation) {
        Some(turns) => {
            for turn in turns {
                out.push_str(&format!("**{}:**\n{}\n\n---\n\n", turn.role.label(), turn.text));
            }
        }
        None => out.push_str("(Could not parse conversation structure)\n"),
    }
    out
}

/// Standalone Markdown document used by `export-markdown`.
pub fn render_markdown(conversation: &Value) -> String {
    let mut lines = vec![format!("# {}\n", title(conversation))];
    let created = conversation
        .get("create_time")
        .and_then(Value::as_f64)
        .and_then(|secs| DateTime::from_timestamp(secs as i64, 0));
    if let Some(created) = created {
        lines.push(format!("*Created: {} UTC*\n", created.format("%Y-%m-%d %H:%M")));
    }
    lines.push("---\n".to_string());
    for turn in turns(conversation).unwrap_or_default() {
        lines.push(format!("## {}\n\n{}\n", turn.role.label(), turn.text));
        lines.push("---\n".to_string());
    }
    lines.join("\n")
}

/// `<date>_<sanitized title>_<id prefix>.md`; the title is cut to 50 chars and reduced to
/// alphanumerics, `-` and `_`.
pub fn markdown_file_name(date: &str, conversation: &Value, record_id: &str) -> String {
    let title: String = title(conversation)
        .chars()
        .take(50)
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let title = title.trim().replace(' ', "_");
    format!("{date}_{title}_{}.md", chats_core::id_prefix(record_id))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn conversation() -> Value {
        json!({
            "title": "Rust: lifetimes?",
            "create_time": 1_700_000_000.5,
            "mapping": {
                "root": {"parent": null, "children": ["u1"], "message": null},
                "u1": {
                    "parent": "root",
                    "children": ["a1", "a2"],
                    "message": {"author": {"role": "user"}, "content": {"parts": ["What is 'a?"]}}
                },
                "a1": {
                    "parent": "u1",
                    "children": [],
                    "message": {"author": {"role": "assistant"}, "content": {"parts": ["A ", "lifetime."]}}
                },
                "a2": {
                    "parent": "u1",
                    "children": ["s1"],
                    "message": {"author": {"role": "assistant"}, "content": {"parts": ["Second branch"]}}
                },
                "s1": {
                    "parent": "a2",
                    "children": [],
                    "message": {"author": {"role": "system"}, "content": {"parts": ["hidden"]}}
                }
            }
        })
    }

    #[test]
    fn walks_depth_first_in_child_order() {
        let turns = turns(&conversation()).expect("root");
        assert_eq!(
            turns,
            vec![
                Turn { role: Role::User, text: "What is 'a?".into() },
                Turn { role: Role::Assistant, text: "A lifetime.".into() },
                Turn { role: Role::Assistant, text: "Second branch".into() },
            ]
        );
    }

    #[test]
    fn deep_chains_do_not_recurse() {
        let mut mapping = Map::new();
        let depth = 50_000;
        for i in 0..depth {
            let parent = if i == 0 { Value::Null } else { json!(format!("n{}", i - 1)) };
            let children = if i + 1 < depth { json!([format!("n{}", i + 1)]) } else { json!([]) };
            mapping.insert(
                format!("n{i}"),
                json!({
                    "parent": parent,
                    "children": children,
                    "message": {"author": {"role": "user"}, "content": {"parts": ["x"]}}
                }),
            );
        }
        let turns = turns(&json!({ "mapping": mapping })).expect("root");
        assert_eq!(turns.len(), depth);
    }

    #[test]
    fn cycles_terminate() {
        let conv = json!({
            "mapping": {
                "a": {"parent": null, "children": ["b"], "message": {"author": {"role": "user"}, "content": {"parts": ["hi"]}}},
                "b": {"parent": "a", "children": ["a"], "message": {"author": {"role": "assistant"}, "content": {"parts": ["yo"]}}}
            }
        });
        assert_eq!(turns(&conv).expect("root").len(), 2);
    }

    #[test]
    fn transcript_without_root_says_so() {
        let out = render_transcript(&json!({"title": "t", "mapping": {}}));
        assert!(out.starts_with("# t\n"));
        assert!(out.contains("Could not parse conversation structure"));
    }

    #[test]
    fn transcript_labels_turns() {
        let out = render_transcript(&conversation());
        assert!(out.contains("**User:**\nWhat is 'a?\n"));
        assert!(out.contains("**Assistant:**\nSecond branch\n"));
        assert!(!out.contains("hidden"));
    }

    #[test]
    fn markdown_has_header_and_sections() {
        let md = render_markdown(&conversation());
        assert!(md.starts_with("# Rust: lifetimes?\n"));
        assert!(md.contains("*Created: 2023-11-14 22:13 UTC*"));
        assert!(md.contains("## User\n\nWhat is 'a?\n"));
        assert_eq!(md.matches("## Assistant").count(), 2);
    }

    #[test]
    fn file_name_is_sanitized() {
        let name = markdown_file_name("2024-05-01", &conversation(), "abcdef123456");
        assert_eq!(name, "2024-05-01_Rust__lifetimes__abcdef12.md");
        let untitled = markdown_file_name("2024-05-01", &json!({}), "xyz");
        assert_eq!(untitled, "2024-05-01_Untitled_xyz.md");
    }
}
