//! # Application State Management
//!
//! Shared state for the HTTP surface: configuration, request metrics, the
//! call session registry handle, and the server start time. Everything
//! mutable sits behind `Arc<RwLock<_>>` so concurrent request handlers can
//! read without contention and the middleware can update counters safely.
//!
//! The session registry carries its own lock internally; `AppState` just
//! holds the shared handle so the HTTP handlers and the audio socket see
//! the same calls.

use crate::audio::session::SessionRegistry;
use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration; read-only after startup but kept behind a
    /// lock so snapshots are consistent
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by the metrics middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Call session registry shared with the audio socket server
    pub registry: Arc<SessionRegistry>,

    /// When the server started; Instant is Copy, no locking needed
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Statistics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry,
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the current configuration. Cloning releases the lock
    /// immediately instead of holding it across response serialization.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record one finished request against its endpoint's statistics.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the metrics for the /metrics endpoint; cloned so
    /// the lock is not held while the response is built.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(AppConfig::default(), Arc::new(SessionRegistry::new()))
    }

    #[test]
    fn test_request_counters() {
        let state = state();
        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = state();
        state.record_endpoint_request("GET /api/v1/calls", 10, false);
        state.record_endpoint_request("GET /api/v1/calls", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let m = &snapshot.endpoint_metrics["GET /api/v1/calls"];
        assert_eq!(m.request_count, 2);
        assert_eq!(m.average_duration_ms(), 20.0);
        assert_eq!(m.error_rate(), 0.5);
    }

    #[test]
    fn test_empty_endpoint_metric_rates() {
        let m = EndpointMetric::default();
        assert_eq!(m.average_duration_ms(), 0.0);
        assert_eq!(m.error_rate(), 0.0);
    }
}
