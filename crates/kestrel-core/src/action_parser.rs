// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Detects tagged actions (`<name>payload</name>`) inside model output.
//!
//! Two action shapes are recognised, dispatched the same way by [`parse`] —
//! the split is only in how a handler later interprets `payload`:
//! - legacy colon-delimited actions (`task_create`, `add_summary_note`, ...)
//! - newer actions whose payload is a JSON object (`delegate`, `spawn_sub_agent`, ...)

use std::sync::OnceLock;

use regex::Regex;

/// Closed set of action tag names recognised at parse time. Unknown tags are
/// ignored rather than rejected, so new model output that mentions an
/// unrelated `<foo>` element in prose does not get misparsed as an action.
pub const KNOWN_ACTIONS: &[&str] = &[
    "execute",
    "search",
    "memory_search",
    "task_create",
    "task_update",
    "subtask_add",
    "enhanced_read",
    "enhanced_write",
    "find_files_enhanced",
    "browser_navigate",
    "project_list",
    "add_declarative_note",
    "add_summary_note",
    "delegate",
    "spawn_sub_agent",
    "stop_sub_agent",
    "resume_sub_agent",
];

/// A single parsed action tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub payload: String,
}

fn tag_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = KNOWN_ACTIONS.join("|");
        Regex::new(&format!(r"(?is)<({alternation})>(.*?)</\1>")).expect("static action tag regex")
    })
}

/// Byte span `(start, end)` of each complete action, paired with the parsed action.
fn actions_with_spans(text: &str) -> Vec<(Action, usize, usize)> {
    tag_pattern()
        .captures_iter(text)
        .map(|caps| {
            let whole = caps.get(0).unwrap();
            let name = caps.get(1).unwrap().as_str().to_ascii_lowercase();
            let payload = caps.get(2).unwrap().as_str().to_string();
            (Action { name, payload }, whole.start(), whole.end())
        })
        .collect()
}

/// Extract every complete, well-formed action tag from `text`, in order of
/// appearance. Unclosed tags and unknown tag names are ignored. Never panics;
/// on pathologically large input the regex engine may time out in spirit but
/// `regex` itself does not implement timeouts, so callers of `parse` in the
/// Engine are expected to cap `text` length upstream.
pub fn parse(text: &str) -> Vec<Action> {
    actions_with_spans(text).into_iter().map(|(a, _, _)| a).collect()
}

/// Does `text` contain at least one complete, well-formed action tag?
///
/// Used by the gateway streaming loop to trigger an early interrupt once an
/// action is fully visible, rather than waiting for the whole turn to finish
/// streaming.
pub fn contains_complete_action(text: &str) -> bool {
    tag_pattern().is_match(text)
}

/// Remove a partial opening tag trailing after the last complete action.
///
/// Text up to and including the last complete action is returned unchanged.
/// Anything after that point starting at the first `<` is dropped, since a
/// `<` appearing after the last known-good action boundary is assumed to be
/// the start of a tag the model has not finished emitting yet.
pub fn strip_incomplete_tags(text: &str) -> String {
    let last_end = actions_with_spans(text).last().map(|(_, _, end)| *end).unwrap_or(0);
    let tail = &text[last_end..];
    match tail.find('<') {
        Some(idx) => format!("{}{}", &text[..last_end], &tail[..idx]),
        None => text.to_string(),
    }
}

/// Split a legacy colon-delimited payload into `n` fields, defaulting missing
/// trailing fields to `""`. Mirrors the positional-field convention used by
/// actions inherited from the system this core replaces.
pub fn split_colon_fields(payload: &str, n: usize) -> Vec<String> {
    let mut parts: Vec<String> = payload.splitn(n, ':').map(|s| s.to_string()).collect();
    while parts.len() < n {
        parts.push(String::new());
    }
    parts
}

/// `add_summary_note`'s specific defaulting rule: with no `:` in the payload
/// the category defaults to `"general"` and the whole payload is the note text.
pub fn parse_summary_note(payload: &str) -> (String, String) {
    match payload.split_once(':') {
        Some((category, text)) => (category.trim().to_string(), text.trim().to_string()),
        None => ("general".to_string(), payload.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_action() {
        let actions = parse("<search>rust async traits</search>");
        assert_eq!(actions, vec![Action { name: "search".into(), payload: "rust async traits".into() }]);
    }

    #[test]
    fn case_insensitive_tag_name() {
        let actions = parse("<SEARCH>x</SEARCH>");
        assert_eq!(actions[0].name, "search");
    }

    #[test]
    fn unknown_tag_is_ignored() {
        let actions = parse("<frobnicate>x</frobnicate>");
        assert!(actions.is_empty());
    }

    #[test]
    fn unclosed_tag_is_ignored() {
        let actions = parse("<search>rust async");
        assert!(actions.is_empty());
    }

    #[test]
    fn duplicate_tags_returned_in_order() {
        let actions = parse("<search>a</search> then <search>b</search>");
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].payload, "a");
        assert_eq!(actions[1].payload, "b");
    }

    #[test]
    fn multiple_distinct_actions_in_order() {
        let actions = parse("<task_create>do thing</task_create><execute>ls -la</execute>");
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].name, "task_create");
        assert_eq!(actions[1].name, "execute");
    }

    #[test]
    fn payload_preserves_inner_whitespace() {
        let actions = parse("<execute>\n  ls -la\n</execute>");
        assert_eq!(actions[0].payload, "\n  ls -la\n");
    }

    #[test]
    fn nested_same_name_tags_collapse_to_one_action() {
        // No recursive parsing guarantee: a same-name nested pair resolves as
        // one action whose payload contains the raw nested text.
        let actions = parse("<search><search>inner</search></search>");
        assert_eq!(actions.len(), 1);
        assert!(actions[0].payload.contains("<search>inner</search>"));
    }

    #[test]
    fn contains_complete_action_true_when_closed() {
        assert!(contains_complete_action("prefix <execute>ls</execute> suffix"));
    }

    #[test]
    fn contains_complete_action_false_when_unclosed() {
        assert!(!contains_complete_action("prefix <execute>ls"));
    }

    #[test]
    fn strip_incomplete_tags_removes_trailing_partial_tag() {
        let text = "<execute>ls</execute> and now <sear";
        let stripped = strip_incomplete_tags(text);
        assert_eq!(stripped, "<execute>ls</execute> and now ");
    }

    #[test]
    fn strip_incomplete_tags_is_noop_when_nothing_trailing() {
        let text = "<execute>ls</execute>";
        assert_eq!(strip_incomplete_tags(text), text);
    }

    #[test]
    fn strip_incomplete_tags_keeps_plain_trailing_prose() {
        let text = "<execute>ls</execute> all done";
        assert_eq!(strip_incomplete_tags(text), text);
    }

    #[test]
    fn split_colon_fields_pads_missing_with_empty() {
        let fields = split_colon_fields("a:b", 3);
        assert_eq!(fields, vec!["a".to_string(), "b".to_string(), "".to_string()]);
    }

    #[test]
    fn split_colon_fields_respects_field_count_limit() {
        // Splitting into 2 fields keeps any further colons inside the 2nd field.
        let fields = split_colon_fields("a:b:c", 2);
        assert_eq!(fields, vec!["a".to_string(), "b:c".to_string()]);
    }

    #[test]
    fn summary_note_defaults_category_to_general() {
        let (category, text) = parse_summary_note("just a note, no colon");
        assert_eq!(category, "general");
        assert_eq!(text, "just a note, no colon");
    }

    #[test]
    fn summary_note_splits_category_and_text() {
        let (category, text) = parse_summary_note("decisions: picked postgres");
        assert_eq!(category, "decisions");
        assert_eq!(text, "picked postgres");
    }
}
