use std::collections::HashSet;

use crate::codec::{PartDelta, PartKind, PartSnapshot};

pub const STATUS_THINKING: &str = "Thinking...";
pub const STATUS_PROCESSING: &str = "Processing...";
pub const STATUS_RUNNING_TOOL: &str = "Running tool...";

/// Per-conversation response being assembled from part events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyState {
    text: String,
    status: String,
    active_text_part: Option<String>,
    auxiliary_parts: HashSet<String>,
}

impl AssemblyState {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn active_text_part(&self) -> Option<&str> {
        self.active_text_part.as_deref()
    }

    pub fn is_auxiliary(&self, part_id: &str) -> bool {
        self.auxiliary_parts.contains(part_id)
    }

    /// Applies a full part snapshot. Returns true when the visible text or
    /// the status line changed.
    pub fn apply_snapshot(&mut self, part: &PartSnapshot) -> bool {
        let status_before = self.status.clone();
        let mut text_changed = false;
        match &part.kind {
            PartKind::Text => {
                self.auxiliary_parts.remove(&part.part_id);
                self.active_text_part = Some(part.part_id.clone());
                if !part.text.is_empty() && part.text != self.text {
                    self.text.clone_from(&part.text);
                    text_changed = true;
                }
                self.status.clear();
            }
            PartKind::Reasoning => {
                if self.active_text_part.as_deref() == Some(part.part_id.as_str()) {
                    self.active_text_part = None;
                }
                self.auxiliary_parts.insert(part.part_id.clone());
                if part.text.is_empty() {
                    self.set_status(STATUS_THINKING);
                } else {
                    self.status.clear();
                }
            }
            PartKind::StepStart => self.set_status(STATUS_PROCESSING),
            PartKind::ToolRunning { tool: Some(tool) } => {
                self.status = format!("Running tool: {tool}...");
            }
            PartKind::ToolRunning { tool: None } => self.set_status(STATUS_RUNNING_TOOL),
            PartKind::StepFinish | PartKind::ToolFinished => self.status.clear(),
            PartKind::Other(_) => {}
        }
        text_changed || status_before != self.status
    }

    /// Applies an incremental text delta. Deltas for auxiliary parts and for
    /// fields other than `text` are discarded.
    pub fn apply_delta(&mut self, delta: &PartDelta) -> bool {
        if delta.field != "text" || self.auxiliary_parts.contains(&delta.part_id) {
            return false;
        }
        let had_status = !self.status.is_empty();
        self.status.clear();
        if delta.delta.is_empty() {
            return had_status;
        }
        self.text.push_str(&delta.delta);
        true
    }

    fn set_status(&mut self, status: &str) {
        self.status.clear();
        self.status.push_str(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(part_id: &str, kind: PartKind, text: &str) -> PartSnapshot {
        PartSnapshot {
            session_id: "ses_1".to_string(),
            message_id: "msg_1".to_string(),
            part_id: part_id.to_string(),
            kind,
            text: text.to_string(),
        }
    }

    fn delta(part_id: &str, field: &str, text: &str) -> PartDelta {
        PartDelta {
            session_id: "ses_1".to_string(),
            message_id: "msg_1".to_string(),
            part_id: part_id.to_string(),
            field: field.to_string(),
            delta: text.to_string(),
        }
    }

    #[test]
    fn text_snapshot_replaces_instead_of_appending() {
        let mut state = AssemblyState::default();
        assert!(state.apply_snapshot(&snapshot("prt_1", PartKind::Text, "Hello")));
        assert!(state.apply_delta(&delta("prt_1", "text", " world")));
        assert!(state.apply_snapshot(&snapshot("prt_1", PartKind::Text, "Hi")));
        assert_eq!(state.text(), "Hi");
        assert_eq!(state.active_text_part(), Some("prt_1"));
    }

    #[test]
    fn empty_text_snapshot_keeps_accumulated_text() {
        let mut state = AssemblyState::default();
        state.apply_delta(&delta("prt_1", "text", "partial"));
        assert!(!state.apply_snapshot(&snapshot("prt_2", PartKind::Text, "")));
        assert_eq!(state.text(), "partial");
        assert_eq!(state.active_text_part(), Some("prt_2"));
    }

    #[test]
    fn deltas_concatenate_in_order() {
        let mut state = AssemblyState::default();
        for piece in ["The ", "quick ", "brown ", "fox"] {
            state.apply_delta(&delta("prt_1", "text", piece));
        }
        assert_eq!(state.text(), "The quick brown fox");
    }

    #[test]
    fn reasoning_deltas_never_reach_visible_text() {
        let mut state = AssemblyState::default();
        state.apply_delta(&delta("prt_text", "text", "visible"));
        assert!(state.apply_snapshot(&snapshot("prt_r", PartKind::Reasoning, "")));
        assert_eq!(state.status(), STATUS_THINKING);

        let before = state.clone();
        assert!(!state.apply_delta(&delta("prt_r", "text", "secret thoughts")));
        assert_eq!(state, before);

        assert!(state.apply_snapshot(&snapshot("prt_r", PartKind::Reasoning, "secret thoughts")));
        assert_eq!(state.status(), "");
        assert_eq!(state.text(), "visible");
        assert!(state.is_auxiliary("prt_r"));
    }

    #[test]
    fn auxiliary_part_is_never_the_active_text_part() {
        let mut state = AssemblyState::default();
        state.apply_snapshot(&snapshot("prt_1", PartKind::Text, ""));
        state.apply_snapshot(&snapshot("prt_1", PartKind::Reasoning, ""));
        assert_eq!(state.active_text_part(), None);
        assert!(state.is_auxiliary("prt_1"));

        state.apply_snapshot(&snapshot("prt_1", PartKind::Text, "now visible"));
        assert!(!state.is_auxiliary("prt_1"));
        assert_eq!(state.active_text_part(), Some("prt_1"));
    }

    #[test]
    fn non_text_field_deltas_are_ignored() {
        let mut state = AssemblyState::default();
        state.apply_delta(&delta("prt_1", "text", "keep"));
        assert!(!state.apply_delta(&delta("prt_1", "metadata", "x")));
        assert!(!state.apply_delta(&delta("prt_1", "title", "y")));
        assert_eq!(state.text(), "keep");
    }

    #[test]
    fn step_and_tool_status_lines() {
        let mut state = AssemblyState::default();
        assert!(state.apply_snapshot(&snapshot("prt_s", PartKind::StepStart, "")));
        assert_eq!(state.status(), STATUS_PROCESSING);
        assert!(state.apply_snapshot(&snapshot(
            "prt_t",
            PartKind::ToolRunning {
                tool: Some("bash".to_string())
            },
            ""
        )));
        assert_eq!(state.status(), "Running tool: bash...");
        assert!(state.apply_snapshot(&snapshot("prt_t", PartKind::ToolFinished, "")));
        assert_eq!(state.status(), "");
        assert!(!state.apply_snapshot(&snapshot("prt_s", PartKind::StepFinish, "")));
    }

    #[test]
    fn text_delta_clears_status_line() {
        let mut state = AssemblyState::default();
        state.apply_snapshot(&snapshot("prt_s", PartKind::StepStart, ""));
        assert!(state.apply_delta(&delta("prt_1", "text", "ok")));
        assert_eq!(state.status(), "");
    }
}
