use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::task::DataMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub task_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub fields: DataMap,
}

/// Per-execution structured log, mirrored into `tracing`.
///
/// Clones share the same entries so the engine can serve logs of an
/// execution that is still running.
#[derive(Debug, Clone)]
pub struct ExecutionLogger {
    task_id: String,
    agent_id: String,
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl ExecutionLogger {
    pub fn new(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            entries: Arc::default(),
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, fields: DataMap) {
        let message = message.into();
        match level {
            LogLevel::Debug => debug!(task_id = %self.task_id, agent_id = %self.agent_id, "{}", message),
            LogLevel::Info => info!(task_id = %self.task_id, agent_id = %self.agent_id, "{}", message),
            LogLevel::Warning => warn!(task_id = %self.task_id, agent_id = %self.agent_id, "{}", message),
            LogLevel::Error => error!(task_id = %self.task_id, agent_id = %self.agent_id, "{}", message),
        }
        self.entries.lock().push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
            task_id: self.task_id.clone(),
            agent_id: self.agent_id.clone(),
            fields,
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message, DataMap::new());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, DataMap::new());
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message, DataMap::new());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, DataMap::new());
    }

    /// Entries in insertion order, optionally filtered by level, then paginated
    pub fn get_logs(&self, level: Option<LogLevel>, limit: usize, offset: usize) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| level.map_or(true, |l| entry.level == l))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn count(&self, level: LogLevel) -> usize {
        self.entries.lock().iter().filter(|e| e.level == level).count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entries_carry_ids_and_fields() {
        let logger = ExecutionLogger::new("task-1", "scanner");
        let mut fields = DataMap::new();
        fields.insert("image".into(), json!("nginx"));
        logger.log(LogLevel::Info, "scanning", fields);

        let logs = logger.get_logs(None, 10, 0);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].task_id, "task-1");
        assert_eq!(logs[0].agent_id, "scanner");
        assert_eq!(logs[0].fields["image"], json!("nginx"));
    }

    #[test]
    fn test_filter_and_paginate() {
        let logger = ExecutionLogger::new("t", "a");
        for i in 0..5 {
            logger.info(format!("info {}", i));
        }
        logger.error("boom");
        logger.warning("careful");

        assert_eq!(logger.count(LogLevel::Error), 1);
        assert_eq!(logger.count(LogLevel::Warning), 1);

        let page = logger.get_logs(Some(LogLevel::Info), 2, 1);
        let messages: Vec<_> = page.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["info 1", "info 2"]);
        assert!(logger.get_logs(None, 10, 100).is_empty());
    }

    #[test]
    fn test_clones_share_entries() {
        let logger = ExecutionLogger::new("t", "a");
        let view = logger.clone();
        logger.debug("hello");
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_level_serialization() {
        assert_eq!(serde_json::to_string(&LogLevel::Warning).unwrap(), "\"warning\"");
    }
}
