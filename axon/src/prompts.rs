//! Prompt assembly for the reasoning loop.
//!
//! The system prompt is built from (prefix, agent description, tool list,
//! format instructions, suffix); the per-step user message is the task plus
//! the scratchpad. Assembly goes through the process scratch-buffer pool.

use crate::pool::scratch_pool;

/// Default ReAct format instructions. `{tool_names}` is substituted with
/// the comma-separated registered tool names.
pub const FORMAT_INSTRUCTIONS: &str = "Use the following format:\n\n\
Thought: reason about what to do next\n\
Action: the tool to use, one of [{tool_names}]\n\
Action Input: the tool arguments as JSON\n\
Observation: the tool result\n\
... (Thought / Action / Action Input / Observation can repeat)\n\
Thought: I now know the answer\n\
Final Answer: the answer to the task\n\n\
When no tool is needed, answer directly with Final Answer.";

/// Substitutes `{tool_names}` in a format-instruction template.
pub fn render_format_instructions(template: &str, tool_names: &[String]) -> String {
    template.replace("{tool_names}", &tool_names.join(", "))
}

/// Builds the system prompt for a run.
pub fn build_system_prompt(
    prefix: Option<&str>,
    description: &str,
    tool_descriptors: &[String],
    tool_names: &[String],
    format_instructions: &str,
    suffix: Option<&str>,
) -> String {
    let mut buf = scratch_pool().checkout();
    if let Some(prefix) = prefix {
        buf.push_str(prefix);
        buf.push_str("\n\n");
    }
    if !description.is_empty() {
        buf.push_str(description);
        buf.push_str("\n\n");
    }
    if tool_descriptors.is_empty() {
        buf.push_str("You have no tools available.\n\n");
    } else {
        buf.push_str("You have access to the following tools:\n");
        for descriptor in tool_descriptors {
            buf.push_str("- ");
            buf.push_str(descriptor);
            buf.push('\n');
        }
        buf.push('\n');
    }
    buf.push_str(&render_format_instructions(format_instructions, tool_names));
    if let Some(suffix) = suffix {
        buf.push_str("\n\n");
        buf.push_str(suffix);
    }
    buf.to_string()
}

/// Builds the per-step user message: task, optional instruction and
/// context, then the scratchpad so far.
pub fn build_user_message(
    task: &str,
    instruction: Option<&str>,
    context_lines: &[String],
    scratchpad: &str,
) -> String {
    let mut buf = scratch_pool().checkout();
    buf.push_str("Task: ");
    buf.push_str(task);
    if let Some(instruction) = instruction {
        buf.push_str("\nInstruction: ");
        buf.push_str(instruction);
    }
    for line in context_lines {
        buf.push('\n');
        buf.push_str(line);
    }
    if !scratchpad.is_empty() {
        buf.push_str("\n\n");
        buf.push_str(scratchpad);
    }
    buf.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_are_substituted() {
        let rendered = render_format_instructions(
            FORMAT_INSTRUCTIONS,
            &["search".to_string(), "calc".to_string()],
        );
        assert!(rendered.contains("one of [search, calc]"));
        assert!(!rendered.contains("{tool_names}"));
    }

    #[test]
    fn system_prompt_lists_tools_and_keeps_order() {
        let prompt = build_system_prompt(
            Some("You are a research agent."),
            "Answers questions with tools.",
            &["calc: does math".to_string(), "search: finds facts".to_string()],
            &["calc".to_string(), "search".to_string()],
            FORMAT_INSTRUCTIONS,
            Some("Be terse."),
        );
        assert!(prompt.starts_with("You are a research agent."));
        assert!(prompt.contains("- calc: does math"));
        assert!(prompt.contains("- search: finds facts"));
        assert!(prompt.ends_with("Be terse."));
    }

    #[test]
    fn empty_tool_list_is_stated() {
        let prompt = build_system_prompt(None, "", &[], &[], FORMAT_INSTRUCTIONS, None);
        assert!(prompt.contains("no tools available"));
    }

    #[test]
    fn user_message_appends_scratchpad_only_when_present() {
        let bare = build_user_message("what is 2+2?", None, &[], "");
        assert_eq!(bare, "Task: what is 2+2?");

        let with_pad = build_user_message(
            "q",
            Some("be brief"),
            &["context: x=1".to_string()],
            "Thought: t",
        );
        assert!(with_pad.contains("Instruction: be brief"));
        assert!(with_pad.contains("context: x=1"));
        assert!(with_pad.ends_with("Thought: t"));
    }
}
