//! Extraction of human-readable text from agent JSONL messages.
//!
//! The engine does not interpret agent semantics; this module only
//! pulls displayable text out of the common stream-json shapes so the
//! iteration transcript stays readable.

use serde_json::Value;

/// Extract displayable text from a structured agent message, if any.
///
/// Recognized shapes, in order:
/// - `{"result": "..."}` (final result line)
/// - `{"message": {"content": [{"type": "text", "text": "..."}, ...]}}`
/// - `{"content": "..."}`
#[must_use]
pub fn extract_text(value: &Value) -> Option<String> {
    if let Some(result) = value.get("result").and_then(Value::as_str) {
        return Some(result.to_string());
    }

    if let Some(content) = value.pointer("/message/content").and_then(Value::as_array) {
        let mut text = String::new();
        for block in content {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(t);
                }
            }
        }
        if !text.is_empty() {
            return Some(text);
        }
        return None;
    }

    value
        .get("content")
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn result_line_wins() {
        let value = json!({"type": "result", "result": "all done"});
        assert_eq!(extract_text(&value).as_deref(), Some("all done"));
    }

    #[test]
    fn assistant_text_blocks_are_joined() {
        let value = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "first"},
                {"type": "tool_use", "name": "edit"},
                {"type": "text", "text": "second"},
            ]}
        });
        assert_eq!(extract_text(&value).as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn tool_only_messages_yield_nothing() {
        let value = json!({
            "message": {"content": [{"type": "tool_use", "name": "bash"}]}
        });
        assert_eq!(extract_text(&value), None);
    }
}
