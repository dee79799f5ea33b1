use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, time::Duration};

/// Response-time samples kept per connection
pub const RESPONSE_SAMPLE_CAPACITY: usize = 100;

const CHECK_SUCCESS_GAIN: f64 = 0.1;
const CHECK_FAILURE_PENALTY: f64 = 0.2;
const CHECK_EXCEPTION_PENALTY: f64 = 0.3;

/// Per-connection counters and health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub message_count: u64,
    pub error_count: u64,
    pub reconnect_count: u64,
    /// Most recent round-trip times in milliseconds, oldest first
    pub response_time_samples: VecDeque<f64>,
    pub health_score: f64,
    pub is_healthy: bool,
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self {
            message_count: 0,
            error_count: 0,
            reconnect_count: 0,
            response_time_samples: VecDeque::with_capacity(RESPONSE_SAMPLE_CAPACITY),
            health_score: 1.0,
            is_healthy: true,
        }
    }
}

impl ConnectionMetrics {
    pub fn record_response_time(&mut self, elapsed: Duration) {
        if self.response_time_samples.len() == RESPONSE_SAMPLE_CAPACITY {
            self.response_time_samples.pop_front();
        }
        self.response_time_samples
            .push_back(elapsed.as_secs_f64() * 1000.0);
    }

    /// Mean of the retained samples; `None` before the first sample
    pub fn average_response_time(&self) -> Option<f64> {
        if self.response_time_samples.is_empty() {
            return None;
        }
        let sum: f64 = self.response_time_samples.iter().sum();
        Some(sum / self.response_time_samples.len() as f64)
    }

    pub fn record_message(&mut self) {
        self.message_count += 1;
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    pub fn record_check_success(&mut self, elapsed: Duration) {
        self.record_response_time(elapsed);
        self.health_score = (self.health_score + CHECK_SUCCESS_GAIN).min(1.0);
        self.is_healthy = true;
    }

    /// The check ran and the broker rejected it
    pub fn record_check_failure(&mut self) {
        self.error_count += 1;
        self.health_score = (self.health_score - CHECK_FAILURE_PENALTY).max(0.0);
        self.is_healthy = false;
    }

    /// The check could not run at all (no live session)
    pub fn record_check_exception(&mut self) {
        self.error_count += 1;
        self.health_score = (self.health_score - CHECK_EXCEPTION_PENALTY).max(0.0);
        self.is_healthy = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_score_bounds() {
        let mut m = ConnectionMetrics::default();
        m.record_check_success(Duration::from_millis(5));
        assert_eq!(m.health_score, 1.0);

        m.record_check_failure();
        assert!((m.health_score - 0.8).abs() < 1e-9);
        assert!(!m.is_healthy);

        for _ in 0..5 {
            m.record_check_exception();
        }
        assert_eq!(m.health_score, 0.0);

        m.record_check_success(Duration::from_millis(5));
        assert!((m.health_score - 0.1).abs() < 1e-9);
        assert!(m.is_healthy);
    }

    #[test]
    fn test_response_samples_ring() {
        let mut m = ConnectionMetrics::default();
        assert_eq!(m.average_response_time(), None);

        for i in 0..150u64 {
            m.record_response_time(Duration::from_millis(i));
        }
        assert_eq!(m.response_time_samples.len(), RESPONSE_SAMPLE_CAPACITY);
        assert_eq!(m.response_time_samples.front().copied(), Some(50.0));

        let avg = m.average_response_time().unwrap();
        assert!((avg - 99.5).abs() < 1e-9);
    }
}
