//! Prompt rendering for agent invocations.
//!
//! Deliberately minimal: placeholder substitution only. Anything
//! richer belongs to the caller's template system.

use ralph_tui_core::Task;

/// Template used when the config does not provide one.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "\
Work on the following task and mark it complete in the tracker when done.

Task {{task_id}}: {{task_title}}

{{task_description}}";

/// Render a prompt for a task.
///
/// Supported placeholders: `{{task_id}}`, `{{task_title}}`,
/// `{{task_description}}` (empty string when the task has none).
#[must_use]
pub fn render_prompt(template: &str, task: &Task) -> String {
    template
        .replace("{{task_id}}", &task.id)
        .replace("{{task_title}}", &task.title)
        .replace("{{task_description}}", task.description.as_deref().unwrap_or(""))
}
