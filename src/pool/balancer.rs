//! Connection selection strategies

use super::metrics::ConnectionMetrics;
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering as CmpOrdering,
    fmt,
    str::FromStr,
    sync::atomic::{AtomicUsize, Ordering},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Cyclic index over the candidates, stateful across calls
    #[default]
    RoundRobin,
    /// Fewest messages sent
    LeastConnections,
    /// Highest health score
    HealthScore,
    /// Lowest mean response time
    ResponseTime,
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancingStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalancingStrategy::LeastConnections => write!(f, "least_connections"),
            LoadBalancingStrategy::HealthScore => write!(f, "health_score"),
            LoadBalancingStrategy::ResponseTime => write!(f, "response_time"),
        }
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" => Ok(LoadBalancingStrategy::RoundRobin),
            "least_connections" | "least-connections" => Ok(LoadBalancingStrategy::LeastConnections),
            "health_score" | "health-score" => Ok(LoadBalancingStrategy::HealthScore),
            "response_time" | "response-time" => Ok(LoadBalancingStrategy::ResponseTime),
            other => Err(ConfigurationError::InvalidValue {
                field: "strategy".to_string(),
                value: other.to_string(),
                reason: "Unknown load balancing strategy".to_string(),
            }),
        }
    }
}

/// Picks one candidate per request according to a strategy
#[derive(Debug, Default)]
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    next_index: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            next_index: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    /// Index of the chosen candidate. Ties go to the earliest candidate.
    pub fn select(&self, candidates: &[&ConnectionMetrics]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                Some(index % candidates.len())
            }
            LoadBalancingStrategy::LeastConnections => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, m)| m.message_count)
                .map(|(i, _)| i),
            LoadBalancingStrategy::HealthScore => candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    b.health_score
                        .partial_cmp(&a.health_score)
                        .unwrap_or(CmpOrdering::Equal)
                })
                .map(|(i, _)| i),
            LoadBalancingStrategy::ResponseTime => candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let a = a.average_response_time().unwrap_or(0.0);
                    let b = b.average_response_time().unwrap_or(0.0);
                    a.partial_cmp(&b).unwrap_or(CmpOrdering::Equal)
                })
                .map(|(i, _)| i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn metrics(messages: u64, score: f64, latency_ms: Option<u64>) -> ConnectionMetrics {
        let mut m = ConnectionMetrics::default();
        m.message_count = messages;
        m.health_score = score;
        if let Some(ms) = latency_ms {
            m.record_response_time(Duration::from_millis(ms));
        }
        m
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::RoundRobin);
        let (a, b, c) = (metrics(0, 1.0, None), metrics(0, 1.0, None), metrics(0, 1.0, None));
        let candidates = vec![&a, &b, &c];

        let picks: Vec<usize> = (0..6).filter_map(|_| lb.select(&candidates)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_metric_strategies() {
        let a = metrics(10, 0.5, Some(40));
        let b = metrics(2, 0.9, Some(80));
        let c = metrics(5, 0.9, Some(10));
        let candidates = vec![&a, &b, &c];

        assert_eq!(
            LoadBalancer::new(LoadBalancingStrategy::LeastConnections).select(&candidates),
            Some(1)
        );
        assert_eq!(
            LoadBalancer::new(LoadBalancingStrategy::HealthScore).select(&candidates),
            Some(1)
        );
        assert_eq!(
            LoadBalancer::new(LoadBalancingStrategy::ResponseTime).select(&candidates),
            Some(2)
        );
        assert_eq!(LoadBalancer::default().select(&[]), None);
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!(
            "least-connections".parse::<LoadBalancingStrategy>().unwrap(),
            LoadBalancingStrategy::LeastConnections
        );
        assert!("fastest".parse::<LoadBalancingStrategy>().is_err());
        assert_eq!(LoadBalancingStrategy::ResponseTime.to_string(), "response_time");
    }
}
