use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DataMap;

/// One entry in a context's append-only history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Ambient information threaded through a single task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub system_info: DataMap,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: DataMap,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self {
            user_id: None,
            conversation_id: None,
            system_info: DataMap::new(),
            history: Vec::new(),
            created_at: Utc::now(),
            metadata: DataMap::new(),
        }
    }
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context acting on behalf of a user (used for approvals)
    pub fn with_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Append an entry stamped with the current time
    pub fn add_to_history(&mut self, action: impl Into<String>, data: Value) {
        self.add_to_history_at(action, data, Utc::now());
    }

    pub fn add_to_history_at(
        &mut self,
        action: impl Into<String>,
        data: Value,
        timestamp: DateTime<Utc>,
    ) {
        self.history.push(HistoryEntry {
            action: action.into(),
            data,
            timestamp,
        });
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_is_append_only_and_ordered() {
        let mut context = TaskContext::new();
        context.add_to_history("submitted", json!({"queue": "default"}));
        context.add_to_history("dispatched", json!({"agent_id": "docker"}));

        let actions: Vec<_> = context.history().iter().map(|h| h.action.as_str()).collect();
        assert_eq!(actions, vec!["submitted", "dispatched"]);
        assert!(context.history()[0].timestamp <= context.history()[1].timestamp);
    }

    #[test]
    fn test_with_user() {
        let context = TaskContext::with_user("alice").with_conversation("conv-1");
        assert_eq!(context.user_id.as_deref(), Some("alice"));
        assert_eq!(context.conversation_id.as_deref(), Some("conv-1"));
        assert!(context.history().is_empty());
    }

    #[test]
    fn test_context_round_trip_preserves_timestamps() {
        let mut context = TaskContext::with_user("bob");
        context
            .system_info
            .insert("docker_version".into(), json!("27.1"));
        context.metadata.insert("source".into(), json!("api"));
        context.add_to_history("submitted", json!(null));
        context.add_to_history("approved", json!({"by": "bob"}));

        let json = serde_json::to_string(&context).unwrap();
        let restored: TaskContext = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, context);
        assert_eq!(
            restored.history()[1].timestamp,
            context.history()[1].timestamp
        );
    }
}
