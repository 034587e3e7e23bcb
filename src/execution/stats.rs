use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource usage of one execution.
///
/// Attached to every result under [`STATS_KEY`]. `cpu_time` falls back to
/// wall time unless the sandbox measured it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionStats {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Wall time in seconds
    pub execution_time: f64,
    pub cpu_time: f64,
    pub memory_usage_mb: f64,
    pub memory_peak_mb: f64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub error_count: usize,
    pub warning_count: usize,
}

/// Reserved result data key holding [`ExecutionStats`]
pub const STATS_KEY: &str = "execution_stats";

impl ExecutionStats {
    pub fn start(&mut self) {
        self.start_time = Some(Utc::now());
        self.end_time = None;
    }

    /// Seconds since start, up to `end_time` once finished
    pub fn elapsed(&self) -> f64 {
        let Some(start) = self.start_time else {
            return 0.0;
        };
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - start)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn finish(&mut self, error_count: usize, warning_count: usize) {
        self.end_time = Some(Utc::now());
        self.execution_time = self.elapsed();
        if self.cpu_time == 0.0 {
            self.cpu_time = self.execution_time;
        }
        self.error_count = error_count;
        self.warning_count = warning_count;
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}
