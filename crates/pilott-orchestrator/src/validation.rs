use pilott_core::task::{REQUIRED_CAPABILITIES_KEY, TYPE_KEY};
use pilott_core::{Task, TaskError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Context requirements for one task type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTypeRule {
    /// Context keys that must be present and non-null.
    #[serde(default)]
    pub required_keys: Vec<String>,
}

/// Checks a task's shape before it is admitted.
#[derive(Debug, Clone, Default)]
pub struct TaskValidator {
    rules: HashMap<String, TaskTypeRule>,
}

impl TaskValidator {
    pub fn new(rules: HashMap<String, TaskTypeRule>) -> Self {
        Self { rules }
    }

    pub fn validate(&self, task: &Task) -> Result<(), TaskError> {
        if task.description.trim().is_empty() {
            return Err(invalid("description is empty"));
        }

        if let Some(value) = task.context.get(TYPE_KEY) {
            if !value.is_string() {
                return Err(invalid(format!("'{TYPE_KEY}' must be a string")));
            }
        }

        if let Some(value) = task.context.get(REQUIRED_CAPABILITIES_KEY) {
            let well_formed = value
                .as_array()
                .is_some_and(|items| items.iter().all(|c| c.is_string()));
            if !well_formed {
                return Err(invalid(format!(
                    "'{REQUIRED_CAPABILITIES_KEY}' must be a list of strings"
                )));
            }
        }

        let Some(rule) = task.task_type().and_then(|t| self.rules.get(t)) else {
            return Ok(());
        };
        let missing: Vec<&str> = rule
            .required_keys
            .iter()
            .filter(|key| task.context.get(*key).map_or(true, serde_json::Value::is_null))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(invalid(format!(
                "task type '{}' requires context keys: {}",
                task.task_type().unwrap_or_default(),
                missing.join(", ")
            )))
        }
    }
}

fn invalid(reason: impl Into<String>) -> TaskError {
    TaskError::InvalidTask {
        reason: reason.into(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn email_validator() -> TaskValidator {
        let mut rules = HashMap::new();
        rules.insert(
            "email".to_string(),
            TaskTypeRule {
                required_keys: vec!["recipient".into(), "subject".into()],
            },
        );
        TaskValidator::new(rules)
    }

    #[test]
    fn test_plain_task_is_valid() {
        assert!(TaskValidator::default().validate(&Task::new("do it")).is_ok());
    }

    #[test]
    fn test_empty_description_rejected() {
        let err = TaskValidator::default().validate(&Task::new("  ")).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask { .. }));
    }

    #[test]
    fn test_reserved_keys_must_be_well_typed() {
        let v = TaskValidator::default();
        let bad_type = Task::new("x").with_context("type", json!(7));
        assert!(v.validate(&bad_type).is_err());

        let bad_caps = Task::new("x").with_context("required_capabilities", json!("email"));
        assert!(v.validate(&bad_caps).is_err());

        let mixed = Task::new("x").with_context("required_capabilities", json!(["email", 1]));
        assert!(v.validate(&mixed).is_err());
    }

    #[test]
    fn test_type_rules_require_keys() {
        let v = email_validator();
        let task = Task::new("send report")
            .with_type("email")
            .with_context("recipient", json!("ops@example.com"))
            .with_context("subject", json!(null));
        let err = v.validate(&task).unwrap_err();
        assert_eq!(
            err,
            TaskError::InvalidTask {
                reason: "task type 'email' requires context keys: subject".into()
            }
        );

        let ok = task.with_context("subject", json!("Weekly report"));
        assert!(v.validate(&ok).is_ok());

        // Types without a rule pass through.
        assert!(v.validate(&Task::new("look up").with_type("search")).is_ok());
    }
}
