use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
    pub destination: Option<String>,
}

/// Bounded in-memory run log, shared between the aggregator and observers.
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn add_log(&self, level: &str, message: String, destination: Option<String>) {
        let entry = LogEntry {
            timestamp: Utc::now().timestamp(),
            level: level.to_string(),
            message,
            destination,
        };

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        match limit {
            Some(n) => buffer.iter().rev().take(n).rev().cloned().collect(),
            None => buffer.iter().cloned().collect(),
        }
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entries_fall_off() {
        let log = LogBuffer::new(2);
        log.add_log("info", "one".into(), None);
        log.add_log("info", "two".into(), None);
        log.add_log("warn", "three".into(), Some("dest-0".into()));

        let entries = log.get_logs(None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "two");
        assert_eq!(entries[1].message, "three");
        assert_eq!(entries[1].destination.as_deref(), Some("dest-0"));
    }

    #[test]
    fn limit_returns_most_recent() {
        let log = LogBuffer::new(10);
        for i in 0..5 {
            log.add_log("info", format!("m{i}"), None);
        }
        let last_two = log.get_logs(Some(2));
        assert_eq!(last_two[0].message, "m3");
        assert_eq!(last_two[1].message, "m4");
    }
}
