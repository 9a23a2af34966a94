//! Operation Types
//!
//! Submission options and serializable operation snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Options of a single submission
#[derive(Debug, Clone)]
pub struct OperationOptions {
    /// Human-readable alias for logs
    pub alias: String,
    /// Caller-chosen de-duplication token
    pub sequence: Option<u64>,
    /// Caller-supplied identity; generated when absent
    pub id: Option<Uuid>,
}

impl OperationOptions {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            sequence: None,
            id: None,
        }
    }

    /// Set sequence
    pub fn with_sequence(mut self, sequence: Option<u64>) -> Self {
        self.sequence = sequence;
        self
    }

    /// Use a fixed operation identity
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }
}

/// In-flight operation snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationInfo {
    /// Operation identity
    pub uuid: Uuid,
    /// Alias given at submission
    pub alias: String,
    /// De-duplication token, if any
    pub sequence: Option<u64>,
    /// When the operation entered the registry
    pub registered_at: DateTime<Utc>,
}

/// Timing statistic of an operation run by the engine (microseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStat {
    /// Operation identity as reported by the engine
    pub uuid: String,
    /// Engine-side operation name
    pub name: String,
    /// Start time, microseconds since the Unix epoch
    pub started: u64,
    /// Run time in microseconds; 0 while running
    pub duration: u64,
}

impl OperationStat {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            started: now_micros(),
            duration: 0,
        }
    }

    /// Fix the duration at the current time
    pub fn done(&mut self) {
        let now = now_micros();
        if now > self.started {
            self.duration = now - self.started;
        }
    }
}

fn now_micros() -> u64 {
    u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_builder() {
        let id = Uuid::new_v4();
        let options = OperationOptions::new("sleep").with_sequence(Some(3)).with_id(id);
        assert_eq!(options.alias, "sleep");
        assert_eq!(options.sequence, Some(3));
        assert_eq!(options.id, Some(id));
    }

    #[test]
    fn test_stat_duration() {
        let mut stat = OperationStat::new("id", "Sleeping");
        std::thread::sleep(std::time::Duration::from_millis(2));
        stat.done();
        assert!(stat.duration >= 1000);
    }
}
