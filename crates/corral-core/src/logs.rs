//! Read-only interface to the log collector.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Stream suffixes making up one component's log group.
pub const STREAM_SUFFIXES: &[&str] = &["", ":out", ":err"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDescription {
    pub name: String,
    pub last_event_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub logs: Vec<String>,
    pub cursor: Option<String>,
    pub filter: Option<String>,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub log: String,
    pub timestamp: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPage {
    pub items: Vec<Event>,
    pub prev_cursor: Option<String>,
    pub next_cursor: Option<String>,
}

/// Queried for display only; never mutated by the engine.
#[async_trait]
pub trait LogCollector: Send + Sync {
    async fn describe_logs(&self, names: &[String]) -> Result<Vec<LogDescription>>;

    async fn get_events(&self, query: &EventQuery) -> Result<EventPage>;
}

/// Expand log group names into their stream names.
pub fn group_streams(group: &str) -> impl Iterator<Item = String> + '_ {
    STREAM_SUFFIXES.iter().map(move |suffix| format!("{}{}", group, suffix))
}

/// The later of two optional RFC 3339 timestamps.
pub fn latest(a: Option<String>, b: Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b > a { b } else { a }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_streams() {
        let streams: Vec<String> = group_streams("abc").collect();
        assert_eq!(streams, vec!["abc", "abc:out", "abc:err"]);
    }

    #[test]
    fn test_latest() {
        let early = Some("2024-01-01T00:00:00Z".to_string());
        let late = Some("2024-06-01T00:00:00Z".to_string());
        assert_eq!(latest(early.clone(), late.clone()), late);
        assert_eq!(latest(late.clone(), None), late);
        assert_eq!(latest(None, early.clone()), early);
        assert_eq!(latest(None, None), None);
    }
}
