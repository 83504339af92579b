use crate::skill::{Skill, SkillDescriptor};
use pilott_core::{PilottError, PilottResult, ToolCall, ToolResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Central registry for all available skills.
pub struct SkillRegistry {
    skills: HashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self {
            skills: HashMap::new(),
        }
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        let name = skill.descriptor().name.clone();
        info!(skill = %name, "Registered skill");
        self.skills.insert(name, skill);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Skill>> {
        self.skills.get(name)
    }

    /// Descriptors sorted by name, so prompts are stable across calls.
    pub fn list_descriptors(&self) -> Vec<SkillDescriptor> {
        let mut descriptors: Vec<SkillDescriptor> = self
            .skills
            .values()
            .map(|s| s.descriptor().clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Whether the named skill may be retried after a failure.
    /// Unknown skills are never retried.
    pub fn is_idempotent(&self, name: &str) -> bool {
        self.skills
            .get(name)
            .is_some_and(|s| s.descriptor().idempotent)
    }

    /// Execute a tool call against the named skill.
    pub async fn execute(&self, call: ToolCall) -> PilottResult<ToolResult> {
        let skill = self
            .skills
            .get(&call.name)
            .ok_or_else(|| PilottError::Skill(format!("Unknown skill: {}", call.name)))?;

        debug!(skill = %call.name, call_id = %call.id, "Executing skill");
        skill.execute(call).await
    }

    pub fn skill_count(&self) -> usize {
        self.skills.len()
    }
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::new()
    }
}
