// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use fnord_model::{Message, SUMMARY_PREFIX};

// ─── Compaction prompts ───────────────────────────────────────────────────────

pub const COMPACTION_PROMPT: &str = "You are a context compaction assistant for a \
code-research agent. Summarise the conversation history below in a concise, \
information-dense way. Preserve all file paths, function names, findings, \
decisions, and tool outputs that may matter to future research steps. Your \
summary will replace the original history to free up context space. If a \
prior summary is included, fold its contents into the new summary so nothing \
canonical is lost.";

pub const TERSIFY_PROMPT: &str = "Rewrite the following message as a much shorter \
paraphrase. Keep every fact, file path, identifier, and number; cut filler, \
repetition, and pleasantries. Reply with the paraphrase only.";

/// Construct the canonical summary system message.
pub fn summary_message(text: &str) -> Message {
    Message::system(format!("{SUMMARY_PREFIX}: {text}"))
}

/// Split the non-system messages for compaction: everything before the
/// returned index is summarised, everything from it on is preserved verbatim.
///
/// The split is moved backwards until the preserved tail begins at a turn
/// boundary.  A tail starting on a tool response would orphan it from a
/// request that was summarised away, violating the request/response pairing
/// on the next model call; a tail starting on the request itself is a valid
/// boundary, since the request leads the preserved group.
pub fn split_point(non_system: &[Message], keep_rounds: usize) -> usize {
    let mut split = non_system.len().saturating_sub(keep_rounds);
    while split > 0 && split < non_system.len() {
        match &non_system[split] {
            Message::ToolResponse { .. } => split -= 1,
            _ => break,
        }
    }
    split
}

/// Serialise messages into plain text for inclusion in a compaction prompt.
pub fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !m.is_system())
        .map(|m| match m {
            Message::User { content } => format!("User: {content}"),
            Message::Assistant { content } => format!("Assistant: {content}"),
            Message::ToolCalls { tool_calls } => tool_calls
                .iter()
                .map(|c| format!("[tool_call: {}({})]", c.name, c.arguments))
                .collect::<Vec<_>>()
                .join("\n"),
            Message::ToolResponse { name, content, .. } => {
                format!("[tool_result {name}: {content}]")
            }
            Message::System { content } => format!("System: {content}"),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the secondary-call message list for a compaction round.
///
/// The prior canonical summary (when one exists) rides along so the new
/// summary subsumes it, and the history text is the serialised old messages.
pub fn compaction_request(prior_summary: Option<&str>, history_text: &str) -> Vec<Message> {
    let mut body = String::new();
    if let Some(prior) = prior_summary {
        body.push_str("Prior summary:\n");
        body.push_str(prior);
        body.push_str("\n\n");
    }
    body.push_str("Conversation history:\n\n");
    body.push_str(history_text);
    vec![Message::system(COMPACTION_PROMPT), Message::user(body)]
}

/// Build the secondary-call message list for tersifying one message.
pub fn tersify_request(content: &str) -> Vec<Message> {
    vec![
        Message::system(TERSIFY_PROMPT),
        Message::user(content.to_string()),
    ]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use fnord_model::ToolCallRequest;

    use super::*;

    fn call(id: &str) -> Message {
        Message::tool_calls(vec![ToolCallRequest {
            id: id.into(),
            name: "grep".into(),
            arguments: "{}".into(),
        }])
    }

    // ── split_point ───────────────────────────────────────────────────────────

    #[test]
    fn split_keeps_last_n_messages() {
        let msgs = vec![
            Message::user("a"),
            Message::assistant("b"),
            Message::user("c"),
            Message::assistant("d"),
        ];
        assert_eq!(split_point(&msgs, 2), 2);
    }

    #[test]
    fn split_smaller_history_keeps_everything() {
        let msgs = vec![Message::user("a")];
        assert_eq!(split_point(&msgs, 5), 0);
    }

    #[test]
    fn split_moves_back_past_tool_groups() {
        let msgs = vec![
            Message::user("a"),
            call("1"),
            Message::tool_response("1", "grep", "out"),
            Message::assistant("d"),
        ];
        // keep_rounds = 2 would start the tail at the tool response; the
        // split must retreat past the whole group to the call's predecessor.
        assert_eq!(split_point(&msgs, 2), 1);
    }

    #[test]
    fn split_stops_on_a_leading_tool_request() {
        let msgs = vec![
            Message::user("a"),
            Message::assistant("b"),
            call("1"),
            Message::tool_response("1", "grep", "out"),
        ];
        // The tail [call, response] is a complete group; no retreat needed.
        assert_eq!(split_point(&msgs, 2), 2);
    }

    #[test]
    fn split_at_zero_stays_zero() {
        let msgs = vec![call("1"), Message::tool_response("1", "grep", "out")];
        assert_eq!(split_point(&msgs, 1), 0);
    }

    // ── serialize_history ─────────────────────────────────────────────────────

    #[test]
    fn history_includes_roles_and_tool_traffic() {
        let msgs = vec![
            Message::system("drop me"),
            Message::user("where is it?"),
            call("1"),
            Message::tool_response("1", "grep", "src/main.rs:3"),
            Message::assistant("in main.rs"),
        ];
        let text = serialize_history(&msgs);
        assert!(!text.contains("drop me"));
        assert!(text.contains("User: where is it?"));
        assert!(text.contains("[tool_call: grep({})]"));
        assert!(text.contains("src/main.rs:3"));
        assert!(text.contains("Assistant: in main.rs"));
    }

    // ── Request builders ──────────────────────────────────────────────────────

    #[test]
    fn compaction_request_embeds_prior_summary() {
        let msgs = compaction_request(Some("we found the parser"), "User: hi");
        assert_eq!(msgs.len(), 2);
        let body = msgs[1].text().unwrap();
        assert!(body.contains("we found the parser"));
        assert!(body.contains("User: hi"));
    }

    #[test]
    fn compaction_request_without_prior_summary() {
        let msgs = compaction_request(None, "User: hi");
        assert!(!msgs[1].text().unwrap().contains("Prior summary"));
    }

    #[test]
    fn summary_message_carries_canonical_prefix() {
        let m = summary_message("short version");
        assert!(m.is_summary_line());
        assert!(m.text().unwrap().contains("short version"));
    }

    #[test]
    fn tersify_request_wraps_content() {
        let msgs = tersify_request("long rambling text");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].text(), Some("long rambling text"));
    }
}
