use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::DataMap;

/// Outcome of one agent execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub task_id: String,
    #[serde(default)]
    pub data: Option<DataMap>,
    #[serde(default)]
    pub error: Option<String>,
    /// Measured wall time of the execution
    #[serde(default)]
    pub execution_time: Duration,
}

impl TaskResult {
    pub fn ok(task_id: impl Into<String>, data: DataMap) -> Self {
        Self {
            success: true,
            task_id: task_id.into(),
            data: Some(data),
            error: None,
            execution_time: Duration::ZERO,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            task_id: task_id.into(),
            data: None,
            error: Some(error.into()),
            execution_time: Duration::ZERO,
        }
    }

    /// Insert a key into `data`, creating the map when needed
    pub fn insert_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data
            .get_or_insert_with(DataMap::new)
            .insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ok_and_failed_constructors() {
        let ok = TaskResult::ok("task-1", DataMap::new());
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = TaskResult::failed("task-1", "boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.data.is_none());
    }

    #[test]
    fn test_insert_data_creates_map() {
        let mut result = TaskResult::failed("task-1", "boom");
        result.insert_data("attempt", json!(2));
        assert_eq!(result.data.unwrap()["attempt"], json!(2));
    }

    #[test]
    fn test_result_round_trip() {
        let mut result = TaskResult::ok("task-9", DataMap::new());
        result.execution_time = Duration::from_millis(1534);
        result.insert_data("lines", json!(["a", "b"]));

        let json = serde_json::to_string(&result).unwrap();
        let restored: TaskResult = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, result);
    }
}
