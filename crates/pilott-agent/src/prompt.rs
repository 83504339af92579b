//! Prompt text sent to the LLM backend.

use crate::config::AgentConfig;
use pilott_core::{StepRecord, Task};
use pilott_memory::SearchResult;
use std::fmt::Write;

/// Sent after an unstructured reply during planning.
pub const FORMAT_CORRECTION: &str = "Your last reply was not a tool call or a final answer. \
Either call one of the available tools or finish with your final answer.";

pub fn system_prompt(config: &AgentConfig) -> String {
    let mut prompt = format!("You are an agent with the role '{}'.", config.role);
    if !config.goal.is_empty() {
        let _ = write!(prompt, " Your goal: {}.", config.goal);
    }
    if let Some(backstory) = &config.backstory {
        let _ = write!(prompt, "\n\n{backstory}");
    }
    if !config.capabilities.is_empty() {
        let _ = write!(prompt, "\n\nCapabilities: {}.", config.capabilities.join(", "));
    }
    prompt.push_str(
        "\n\nWork step by step. Use the available tools when an action is needed, \
         and reply with your final answer once the task is complete.",
    );
    prompt
}

/// The task statement: description, priority, context and recalled knowledge.
pub fn task_prompt(task: &Task, knowledge: &[SearchResult]) -> String {
    let mut prompt = format!("Task: {}\nPriority: {:?}", task.description, task.priority);

    if !task.context.is_empty() {
        let mut keys: Vec<&String> = task.context.keys().collect();
        keys.sort();
        prompt.push_str("\n\nContext:");
        for key in keys {
            let _ = write!(prompt, "\n- {key}: {}", task.context[key]);
        }
    }

    if !knowledge.is_empty() {
        prompt.push_str("\n\nRelevant knowledge:");
        for item in knowledge {
            let _ = write!(prompt, "\n- {}", item.knowledge.text);
        }
    }
    prompt
}

pub fn summary_prompt(steps: &[StepRecord]) -> String {
    let mut prompt = String::from("Summarize the outcome of this task in a few sentences.");
    if !steps.is_empty() {
        let tools: Vec<&str> = steps.iter().map(|s| s.tool.as_str()).collect();
        let _ = write!(prompt, " Steps executed: {}.", tools.join(", "));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pilott_memory::Knowledge;
    use serde_json::json;

    #[test]
    fn test_system_prompt_mentions_role_and_capabilities() {
        let config = AgentConfig::new("mailer")
            .with_goal("deliver notifications")
            .with_capabilities(["email"]);
        let prompt = system_prompt(&config);
        assert!(prompt.contains("'mailer'"));
        assert!(prompt.contains("deliver notifications"));
        assert!(prompt.contains("Capabilities: email."));
    }

    #[test]
    fn test_task_prompt_lists_sorted_context_and_knowledge() {
        let task = Task::new("Notify the on-call engineer")
            .with_context("zone", json!("eu"))
            .with_context("channel", json!("email"));
        let knowledge = vec![SearchResult {
            entry_id: uuid::Uuid::new_v4(),
            knowledge: Knowledge {
                text: "On-call rota lives in the ops wiki".into(),
                metadata: Default::default(),
                tags: Default::default(),
            },
            score: 0.8,
            timestamp: Utc::now(),
        }];
        let prompt = task_prompt(&task, &knowledge);
        let channel = prompt.find("channel").unwrap_or(usize::MAX);
        let zone = prompt.find("zone").unwrap_or(0);
        assert!(channel < zone);
        assert!(prompt.contains("On-call rota"));
        assert!(prompt.starts_with("Task: Notify the on-call engineer"));
    }
}
