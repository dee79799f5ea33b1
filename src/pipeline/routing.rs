//! Topic pattern matching and forwarding rules

use serde::{Deserialize, Serialize};

/// MQTT-style topic filter match.
///
/// `+` matches exactly one level, `#` matches the remaining levels
/// (including none), anything else must match literally.
pub fn topic_matches(topic: &str, pattern: &str) -> bool {
    if topic == pattern {
        return true;
    }
    let mut topic_levels = topic.split('/');
    let mut pattern_levels = pattern.split('/');
    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub source_pattern: String,
    pub destination: String,
}

/// Ordered forwarding rules; the first match wins
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, source_pattern: impl Into<String>, destination: impl Into<String>) {
        self.routes.push(Route {
            source_pattern: source_pattern.into(),
            destination: destination.into(),
        });
    }

    /// Destination for `topic`. Rules pointing a topic back at itself are skipped.
    pub fn resolve(&self, topic: &str) -> Option<&str> {
        self.routes
            .iter()
            .filter(|r| r.destination != topic)
            .find(|r| topic_matches(topic, &r.source_pattern))
            .map(|r| r.destination.as_str())
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
