//! Context assembly for worker dispatch.
//!
//! Workers see a flat text rendering of the recent conversation, truncated
//! from the oldest end to fit a byte budget. The most recent entry is
//! always included even when it alone exceeds the budget.

use crate::task::ConversationEntry;

/// Render conversation history newest-to-oldest into a bounded string.
pub fn build_context(entries: &[ConversationEntry], max_bytes: usize) -> String {
    let mut result = String::new();
    let mut total = 0;
    for entry in entries.iter().rev() {
        let line = format!("{}: {}\n\n", entry.role.as_str().to_uppercase(), entry.content);
        if total + line.len() > max_bytes && !result.is_empty() {
            break;
        }
        result = format!("{}{}", line, result);
        total += line.len();
    }
    result
}

/// Full context handed to a worker: the overall request plus the bounded
/// conversation tail.
pub fn build_subtask_context(
    task_description: &str,
    entries: &[ConversationEntry],
    max_bytes: usize,
) -> String {
    let history = build_context(entries, max_bytes);
    if history.is_empty() {
        format!("OVERALL TASK: {}\n", task_description)
    } else {
        format!("OVERALL TASK: {}\n\n{}", task_description, history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ConversationRole;

    fn entry(role: ConversationRole, content: &str) -> ConversationEntry {
        ConversationEntry::new(role, content)
    }

    #[test]
    fn renders_roles_and_preserves_order() {
        let entries = vec![
            entry(ConversationRole::User, "hello"),
            entry(ConversationRole::Assistant, "world"),
        ];
        let result = build_context(&entries, 10_000);
        let user_pos = result.find("USER: hello").unwrap();
        let assistant_pos = result.find("ASSISTANT: world").unwrap();
        assert!(user_pos < assistant_pos);
    }

    #[test]
    fn truncates_from_the_oldest_end() {
        let entries = vec![
            entry(ConversationRole::User, "first message"),
            entry(ConversationRole::Assistant, "second message"),
            entry(ConversationRole::User, "third message"),
        ];
        let result = build_context(&entries, 30);
        assert!(result.contains("USER: third message"));
        assert!(!result.contains("first message"));
    }

    #[test]
    fn most_recent_entry_always_included() {
        let entries = vec![entry(
            ConversationRole::User,
            "a very long message that exceeds the budget",
        )];
        let result = build_context(&entries, 5);
        assert!(result.contains("a very long message"));
    }

    #[test]
    fn empty_history_yields_task_only_context() {
        let result = build_subtask_context("ship the release", &[], 1000);
        assert_eq!(result, "OVERALL TASK: ship the release\n");
    }

    #[test]
    fn subtask_context_combines_task_and_history() {
        let entries = vec![entry(ConversationRole::TaskResult, "step done")];
        let result = build_subtask_context("ship the release", &entries, 1000);
        assert!(result.starts_with("OVERALL TASK: ship the release"));
        assert!(result.contains("TASK_RESULT: step done"));
    }
}
