use std::time::Instant;

/// Smoothing factor applied to each new response-time sample.
const RESPONSE_TIME_ALPHA: f64 = 0.2;

/// The load balancer's view of one execution endpoint.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub healthy: bool,
    pub active_connections: usize,
    pub max_connections: usize,
    /// Exponentially smoothed response time in milliseconds.
    pub response_time_ms: f64,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub total_requests: u64,
    pub total_failures: u64,
}

impl Worker {
    pub fn new(id: impl Into<String>, address: impl Into<String>, weight: u32) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight,
            healthy: true,
            active_connections: 0,
            max_connections: usize::MAX,
            response_time_ms: 0.0,
            consecutive_failures: 0,
            last_failure: None,
            total_requests: 0,
            total_failures: 0,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn has_capacity(&self) -> bool {
        self.active_connections < self.max_connections
    }

    pub fn is_available(&self) -> bool {
        self.healthy && self.has_capacity()
    }

    pub fn record_response_time(&mut self, sample_ms: f64) {
        self.response_time_ms =
            (1.0 - RESPONSE_TIME_ALPHA) * self.response_time_ms + RESPONSE_TIME_ALPHA * sample_ms;
    }

    /// Score used by response-time balancing; lower is better.
    pub fn response_score(&self) -> f64 {
        self.response_time_ms * (1.0 + self.active_connections as f64 / 10.0)
    }

    /// Connections per unit of weight; a zero weight never wins.
    pub fn weighted_load(&self) -> f64 {
        if self.weight == 0 {
            f64::INFINITY
        } else {
            self.active_connections as f64 / self.weight as f64
        }
    }
}
