//! Status conditions shared by pool instances and volume configs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status values
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A typed status condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Message
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(
        r#type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: r#type.into(),
            status,
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.into()),
            message: Some(message.into()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Set a condition, keeping the transition time when the status is unchanged
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) => {
            let transition = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                condition.last_transition_time
            };
            *existing = condition;
            existing.last_transition_time = transition;
        }
        None => conditions.push(condition),
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], r#type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == r#type)
}

/// Remove a condition by type, returning whether it was present
pub fn remove_condition(conditions: &mut Vec<Condition>, r#type: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.r#type != r#type);
    before != conditions.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_keeps_transition_time() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("DiskReplacement", ConditionStatus::True, "InProgress", "bd-2"),
        );
        let first = conditions[0].last_transition_time;

        set_condition(
            &mut conditions,
            Condition::new("DiskReplacement", ConditionStatus::True, "InProgress", "bd-2, bd-4"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message.as_deref(), Some("bd-2, bd-4"));

        set_condition(
            &mut conditions,
            Condition::new("DiskReplacement", ConditionStatus::False, "Success", ""),
        );
        assert_eq!(conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn test_remove_condition() {
        let mut conditions = vec![Condition::new("Resizing", ConditionStatus::True, "r", "m")];
        assert!(remove_condition(&mut conditions, "Resizing"));
        assert!(!remove_condition(&mut conditions, "Resizing"));
        assert!(find_condition(&conditions, "Resizing").is_none());
    }
}
