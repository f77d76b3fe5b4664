//! Plain-text renderings of sessions, history and diffs, shared by the bot
//! replies and the CLI output.

use std::time::Duration;

use opencode_relay_client::{MessageSummary, ModelRef, Session};
use opencode_relay_stream::dispatcher::truncate_display;
use opencode_relay_stream::DEFAULT_MAX_DISPLAY_CHARS;

pub const SESSION_LIST_LIMIT: usize = 20;
pub const HISTORY_LIMIT: usize = 10;

const HISTORY_ENTRY_CHARS: usize = 200;
const SHORT_ID_CHARS: usize = 8;

/// First characters of a session id, enough to recognise it in a list.
pub fn short_id(id: &str) -> String {
    match id.char_indices().nth(SHORT_ID_CHARS) {
        Some((cut, _)) => format!("{}...", &id[..cut]),
        None => id.to_string(),
    }
}

pub fn session_list(sessions: &[Session], current: Option<&str>) -> String {
    if sessions.is_empty() {
        return "No sessions found".to_string();
    }
    let shown = sessions.len().min(SESSION_LIST_LIMIT);
    let mut text = format!(
        "Available Sessions ({} total, showing first {})\n\n",
        sessions.len(),
        shown
    );
    for (index, session) in sessions.iter().take(shown).enumerate() {
        let title = if session.title.is_empty() {
            "Untitled"
        } else {
            session.title.as_str()
        };
        let marker = if current == Some(session.id.as_str()) {
            " [active]"
        } else {
            ""
        };
        text.push_str(&format!(
            "{}. {} - {}{}\n",
            index + 1,
            session.id,
            title,
            marker
        ));
    }
    text.push_str("\nUse /switch <id> to switch sessions");
    text
}

/// The last few messages, each clipped, within one chat message.
pub fn history(messages: &[MessageSummary]) -> String {
    if messages.is_empty() {
        return "No messages yet".to_string();
    }
    let start = messages.len().saturating_sub(HISTORY_LIMIT);
    let mut text = String::from("Recent Messages\n\n");
    for message in &messages[start..] {
        let role = if message.role.is_empty() {
            "user"
        } else {
            message.role.as_str()
        };
        let content = match message.content.char_indices().nth(HISTORY_ENTRY_CHARS) {
            Some((cut, _)) => format!("{}...", &message.content[..cut]),
            None => message.content.clone(),
        };
        text.push_str(&format!("{role}:\n{content}\n\n"));
    }
    truncate_display(text, DEFAULT_MAX_DISPLAY_CHARS)
}

pub fn diff(diff: &str) -> String {
    if diff.trim().is_empty() {
        return "No changes".to_string();
    }
    truncate_display(format!("Current Changes\n\n{diff}"), DEFAULT_MAX_DISPLAY_CHARS)
}

pub fn uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m {seconds}s"),
        _ => format!("{hours}h {minutes}m {seconds}s"),
    }
}

pub fn model_label(model: Option<&ModelRef>) -> String {
    model
        .map(ModelRef::to_string)
        .unwrap_or_else(|| "server default".to_string())
}

pub fn agent_label(agent: Option<&str>) -> &str {
    agent.filter(|name| !name.is_empty()).unwrap_or("default")
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencode_relay_stream::dispatcher::TRUNCATION_MARKER;

    fn session(id: &str, title: &str) -> Session {
        serde_json::from_value(serde_json::json!({ "id": id, "title": title }))
            .expect("session")
    }

    fn message(role: &str, content: &str) -> MessageSummary {
        MessageSummary {
            id: "msg".to_string(),
            role: role.to_string(),
            content: content.to_string(),
            tokens: 0,
            cost: 0.0,
        }
    }

    #[test]
    fn short_ids_keep_eight_characters() {
        assert_eq!(short_id("ses_0123456789"), "ses_0123...");
        assert_eq!(short_id("ses_1"), "ses_1");
    }

    #[test]
    fn session_list_marks_current_and_caps_length() {
        let mut sessions = vec![session("ses_a", "first"), session("ses_b", "")];
        let text = session_list(&sessions, Some("ses_b"));
        assert!(text.starts_with("Available Sessions (2 total, showing first 2)"));
        assert!(text.contains("1. ses_a - first\n"));
        assert!(text.contains("2. ses_b - Untitled [active]\n"));
        assert!(text.ends_with("Use /switch <id> to switch sessions"));

        sessions = (0..25).map(|i| session(&format!("ses_{i}"), "t")).collect();
        let text = session_list(&sessions, None);
        assert!(text.contains("(25 total, showing first 20)"));
        assert!(text.contains("20. ses_19"));
        assert!(!text.contains("21. "));

        assert_eq!(session_list(&[], None), "No sessions found");
    }

    #[test]
    fn history_keeps_the_last_ten_and_clips_entries() {
        let mut messages: Vec<_> = (0..12).map(|i| message("user", &format!("m{i}"))).collect();
        messages.push(message("", &"x".repeat(250)));
        let text = history(&messages);
        assert!(!text.contains("user:\nm2\n"));
        assert!(text.contains("user:\nm3\n"));
        assert!(text.contains(&format!("user:\n{}...", "x".repeat(200))));
        assert_eq!(history(&[]), "No messages yet");
    }

    #[test]
    fn long_diffs_are_truncated() {
        assert_eq!(diff("  \n"), "No changes");
        let text = diff(&"+line\n".repeat(1000));
        assert!(text.starts_with("Current Changes\n\n+line"));
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn uptime_drops_leading_zero_units() {
        assert_eq!(uptime(Duration::from_secs(42)), "42s");
        assert_eq!(uptime(Duration::from_secs(125)), "2m 5s");
        assert_eq!(uptime(Duration::from_secs(3 * 3600 + 7)), "3h 0m 7s");
    }

    #[test]
    fn labels_fall_back_to_defaults() {
        assert_eq!(model_label(None), "server default");
        assert_eq!(agent_label(Some("")), "default");
        assert_eq!(agent_label(Some("plan")), "plan");
    }
}
