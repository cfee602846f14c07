// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Streamed response events and text-delta extraction

use crate::runtime::{ContentBlock, RuntimeMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events yielded to a streaming caller. `Error` and `Done` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta { text: String },
    ToolUse { name: String, input: Value },
    Error { message: String },
    Done,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Done)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
}

/// Accumulated result of a non-streaming exchange
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub session_id: String,
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Reconciles cumulative snapshots and true deltas into one text.
///
/// A block whose text extends everything seen so far is a snapshot and only
/// its suffix is new. Anything else is a delta and is appended whole.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    full_text: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one text block; returns the new text, if any
    pub fn observe(&mut self, text: &str) -> Option<String> {
        let delta = if let Some(suffix) = text.strip_prefix(self.full_text.as_str()) {
            let suffix = suffix.to_string();
            self.full_text = text.to_string();
            suffix
        } else {
            self.full_text.push_str(text);
            text.to_string()
        };
        (!delta.is_empty()).then_some(delta)
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn into_text(self) -> String {
        self.full_text
    }
}

/// What one runtime message contributes to an exchange
#[derive(Debug, PartialEq)]
pub enum MessageOutcome {
    Events(Vec<StreamEvent>),
    Failed(String),
    Finished,
}

/// Translate a runtime message into stream events, applying the delta rule per block
pub fn translate_message(tracker: &mut DeltaTracker, message: RuntimeMessage) -> MessageOutcome {
    match message {
        RuntimeMessage::Init { .. } => MessageOutcome::Events(Vec::new()),
        RuntimeMessage::Assistant { blocks } => {
            let mut events = Vec::with_capacity(blocks.len());
            for block in blocks {
                match block {
                    ContentBlock::Text(text) => {
                        if let Some(delta) = tracker.observe(&text) {
                            events.push(StreamEvent::TextDelta { text: delta });
                        }
                    }
                    ContentBlock::ToolUse { name, input } => {
                        events.push(StreamEvent::ToolUse { name, input });
                    }
                }
            }
            MessageOutcome::Events(events)
        }
        RuntimeMessage::Result { is_error: true, message } => {
            MessageOutcome::Failed(message.unwrap_or_else(|| "Unknown error".to_string()))
        }
        RuntimeMessage::Result { is_error: false, .. } => MessageOutcome::Finished,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn deltas(snapshots: &[&str]) -> (Vec<String>, String) {
        let mut tracker = DeltaTracker::new();
        let out = snapshots.iter().filter_map(|s| tracker.observe(s)).collect();
        (out, tracker.into_text())
    }

    #[test]
    fn test_cumulative_snapshots_emit_suffixes() {
        let (out, full) = deltas(&["Hello", "Hello, world"]);
        assert_eq!(out, vec!["Hello", ", world"]);
        assert_eq!(full, "Hello, world");
    }

    #[test]
    fn test_non_prefix_text_is_appended() {
        let (out, full) = deltas(&["A", "B"]);
        assert_eq!(out, vec!["A", "B"]);
        assert_eq!(full, "AB");
    }

    #[test]
    fn test_repeated_snapshot_emits_nothing() {
        let (out, full) = deltas(&["abc", "abc", ""]);
        assert_eq!(out, vec!["abc"]);
        assert_eq!(full, "abc");
    }

    #[test]
    fn test_translate_message_per_block() {
        let mut tracker = DeltaTracker::new();
        let msg = RuntimeMessage::Assistant {
            blocks: vec![
                ContentBlock::Text("Hi".into()),
                ContentBlock::ToolUse {
                    name: "Read".into(),
                    input: serde_json::json!({"path": "a.txt"}),
                },
                ContentBlock::Text("Hi there".into()),
            ],
        };
        assert_eq!(
            translate_message(&mut tracker, msg),
            MessageOutcome::Events(vec![
                StreamEvent::TextDelta { text: "Hi".into() },
                StreamEvent::ToolUse {
                    name: "Read".into(),
                    input: serde_json::json!({"path": "a.txt"})
                },
                StreamEvent::TextDelta { text: " there".into() },
            ])
        );

        let err = RuntimeMessage::Result {
            is_error: true,
            message: None,
        };
        assert_eq!(
            translate_message(&mut tracker, err),
            MessageOutcome::Failed("Unknown error".into())
        );
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(StreamEvent::TextDelta { text: "x".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text_delta", "text": "x"}));
        let json = serde_json::to_value(StreamEvent::Done).unwrap();
        assert_eq!(json, serde_json::json!({"type": "done"}));
    }

    proptest! {
        #[test]
        fn prop_snapshots_reassemble_final_text(text in "[a-z ]{0,40}", cuts in proptest::collection::vec(0usize..40, 0..6)) {
            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(text.len())).collect();
            cuts.sort_unstable();
            cuts.push(text.len());

            let mut tracker = DeltaTracker::new();
            let mut emitted = String::new();
            for cut in cuts {
                if let Some(delta) = tracker.observe(&text[..cut]) {
                    emitted.push_str(&delta);
                }
            }
            prop_assert_eq!(&emitted, &text);
            prop_assert_eq!(tracker.full_text(), text.as_str());
        }

        #[test]
        fn prop_deltas_concatenate(parts in proptest::collection::vec("[a-z]{1,8}", 1..8)) {
            let mut tracker = DeltaTracker::new();
            let mut emitted = String::new();
            for part in &parts {
                if let Some(delta) = tracker.observe(part) {
                    emitted.push_str(&delta);
                }
            }
            prop_assert_eq!(emitted.as_str(), tracker.full_text());
        }
    }
}
