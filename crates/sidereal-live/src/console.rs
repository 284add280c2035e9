//! Browser console log bridge.
//!
//! Frontends post their `console.*` output here; entries land in a bounded
//! store and are pushed to live subscribers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broadcast::{Broadcaster, Subscription};
use crate::config::ConsoleConfig;
use crate::store::TelemetryStore;

/// Console level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Debug,
    #[default]
    Log,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    /// Parse a level name leniently; anything unrecognised is `Log`.
    pub fn parse(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Log,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload posted by a frontend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleIngest {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleLogEntry {
    pub id: String,
    pub level: ConsoleLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ConsoleLogEntry {
    fn matches_pattern(&self, needle: &str) -> bool {
        let contains = |s: &str| s.to_lowercase().contains(needle);
        contains(&self.message)
            || self.url.as_deref().is_some_and(contains)
            || self.stack.as_deref().is_some_and(contains)
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleQuery {
    pub min_level: Option<ConsoleLevel>,
    pub session: Option<String>,
    /// Case-insensitive substring matched against message, url and stack.
    pub pattern: Option<String>,
    pub limit: usize,
}

impl Default for ConsoleQuery {
    fn default() -> Self {
        Self {
            min_level: None,
            session: None,
            pattern: None,
            limit: 100,
        }
    }
}

#[derive(Debug)]
pub struct FrontendConsole {
    store: TelemetryStore<ConsoleLogEntry>,
    broadcaster: Broadcaster<Arc<ConsoleLogEntry>>,
}

impl FrontendConsole {
    pub fn new(config: &ConsoleConfig) -> Self {
        Self {
            store: TelemetryStore::new("console", config.capacity),
            broadcaster: Broadcaster::new("console", config.subscriber_queue),
        }
    }

    pub fn ingest(&self, input: ConsoleIngest) -> Arc<ConsoleLogEntry> {
        let level = input
            .level
            .as_deref()
            .map_or(ConsoleLevel::Log, ConsoleLevel::parse);
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);

        let entry = ConsoleLogEntry {
            id,
            level,
            message: input.message,
            timestamp: Utc::now(),
            session_id: input.session_id.filter(|s| !s.is_empty()),
            url: input.url.filter(|s| !s.is_empty()),
            stack: input.stack.filter(|s| !s.is_empty()),
        };

        let record = self.store.insert(entry).record;
        self.broadcaster.publish(&record);
        tracing::trace!(id = %record.id, level = %record.level, "Console entry received");
        record
    }

    /// Matching entries, newest first.
    pub fn query(&self, query: &ConsoleQuery) -> Vec<Arc<ConsoleLogEntry>> {
        let pattern = query.pattern.as_deref().map(str::to_lowercase);
        self.store
            .query(
                |entry| {
                    query.min_level.map_or(true, |min| entry.level >= min)
                        && query
                            .session
                            .as_deref()
                            .map_or(true, |s| entry.session_id.as_deref() == Some(s))
                        && pattern.as_deref().map_or(true, |p| entry.matches_pattern(p))
                },
                query.limit,
            )
            .into_iter()
            .map(|e| e.record)
            .collect()
    }

    /// Warnings and errors, newest first.
    pub fn errors(&self, limit: usize) -> Vec<Arc<ConsoleLogEntry>> {
        self.query(&ConsoleQuery {
            min_level: Some(ConsoleLevel::Warn),
            limit,
            ..Default::default()
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConsoleLogEntry>> {
        self.store
            .query(|entry| entry.id == id, 1)
            .into_iter()
            .next()
            .map(|e| e.record)
    }

    pub fn subscribe(&self) -> Subscription<Arc<ConsoleLogEntry>> {
        self.broadcaster.subscribe()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn console(capacity: usize) -> FrontendConsole {
        FrontendConsole::new(&ConsoleConfig {
            capacity,
            subscriber_queue: 16,
        })
    }

    fn post(level: &str, message: &str) -> ConsoleIngest {
        ConsoleIngest {
            level: Some(level.to_owned()),
            message: message.to_owned(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("debug", ConsoleLevel::Debug)]
    #[case("LOG", ConsoleLevel::Log)]
    #[case("info", ConsoleLevel::Info)]
    #[case("warning", ConsoleLevel::Warn)]
    #[case("error", ConsoleLevel::Error)]
    #[case("fatal", ConsoleLevel::Log)]
    #[case("", ConsoleLevel::Log)]
    fn level_parsing(#[case] input: &str, #[case] expected: ConsoleLevel) {
        assert_eq!(ConsoleLevel::parse(input), expected);
    }

    #[test]
    fn levels_are_ordered() {
        assert!(ConsoleLevel::Debug < ConsoleLevel::Log);
        assert!(ConsoleLevel::Log < ConsoleLevel::Info);
        assert!(ConsoleLevel::Info < ConsoleLevel::Warn);
        assert!(ConsoleLevel::Warn < ConsoleLevel::Error);
    }

    #[test]
    fn ingest_assigns_short_id() {
        let console = console(10);
        let entry = console.ingest(post("info", "hello"));

        assert_eq!(entry.id.len(), 8);
        assert_eq!(console.get(&entry.id).unwrap().message, "hello");
        assert!(console.get("missing").is_none());
    }

    #[test]
    fn errors_is_warn_and_above() {
        let console = console(10);
        for level in ["debug", "log", "info", "warn", "error"] {
            console.ingest(post(level, level));
        }

        let levels: Vec<ConsoleLevel> = console.errors(10).iter().map(|e| e.level).collect();
        assert_eq!(levels, vec![ConsoleLevel::Error, ConsoleLevel::Warn]);

        let min_warn = console.query(&ConsoleQuery {
            min_level: Some(ConsoleLevel::Warn),
            limit: 10,
            ..Default::default()
        });
        assert_eq!(min_warn, console.errors(10));
    }

    #[test]
    fn query_filters_by_session_and_pattern() {
        let console = console(10);
        console.ingest(ConsoleIngest {
            session_id: Some("tab-1".to_owned()),
            url: Some("https://app.local/Checkout".to_owned()),
            ..post("error", "boom")
        });
        console.ingest(ConsoleIngest {
            session_id: Some("tab-2".to_owned()),
            stack: Some("at checkout.js:10".to_owned()),
            ..post("log", "render")
        });
        console.ingest(post("info", "unrelated"));

        let by_session = console.query(&ConsoleQuery {
            session: Some("tab-1".to_owned()),
            ..Default::default()
        });
        assert_eq!(by_session.len(), 1);
        assert_eq!(by_session[0].message, "boom");

        let by_pattern = console.query(&ConsoleQuery {
            pattern: Some("CHECKOUT".to_owned()),
            ..Default::default()
        });
        let messages: Vec<&str> = by_pattern.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["render", "boom"]);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let console = console(3);
        for i in 0..5 {
            console.ingest(post("log", &format!("m{i}")));
        }

        let messages: Vec<String> = console
            .query(&ConsoleQuery::default())
            .iter()
            .map(|e| e.message.clone())
            .collect();
        assert_eq!(messages, vec!["m4", "m3", "m2"]);
        assert_eq!(console.len(), 3);
    }

    #[tokio::test]
    async fn subscribers_receive_new_entries() {
        let console = console(10);
        let mut sub = console.subscribe();
        let entry = console.ingest(post("warn", "careful"));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.id, entry.id);
    }

    #[test]
    fn ingest_payload_uses_camel_case() {
        let input: ConsoleIngest = serde_json::from_str(
            r#"{"level":"error","message":"x","sessionId":"s1","url":"u","stack":"st"}"#,
        )
        .unwrap();
        assert_eq!(input.session_id.as_deref(), Some("s1"));
        assert_eq!(input.stack.as_deref(), Some("st"));
    }
}
