// ABOUTME: In-process render metrics: monotonic counters plus duration/size histograms
// ABOUTME: Writes are append-only observations; reads hand out an immutable snapshot

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::RwLock;

/// count/sum/min/max aggregate. No percentiles; consumers that want
/// distributions feed the snapshot into their own backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Histogram {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(match self.min {
            Some(current) => current.min(value),
            None => value,
        });
        self.max = Some(match self.max {
            Some(current) => current.max(value),
            None => value,
        });
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

#[derive(Debug, Default)]
struct SinkState {
    attempted: u64,
    success: u64,
    failure: u64,
    duration_seconds: Histogram,
    artifact_bytes: Histogram,
    last_update: Option<DateTime<Utc>>,
}

/// Point-in-time view of the sink. Detached from the live state; later
/// observations never show through.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub renders_attempted: u64,
    pub renders_success: u64,
    pub renders_failure: u64,
    pub render_duration_seconds: Histogram,
    pub artifact_bytes: Histogram,
    pub last_update: Option<DateTime<Utc>>,
}

/// Shared metrics sink for the render service.
///
/// Built once at startup next to the pool and handed to the orchestrator by
/// reference. Every job increments `attempted` exactly once, exactly one of
/// `success`/`failure` once, and records one duration observation.
#[derive(Debug, Default)]
pub struct ResultSink {
    state: RwLock<SinkState>,
}

impl ResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_attempt(&self) {
        let mut state = self.state.write().await;
        state.attempted += 1;
        state.last_update = Some(Utc::now());
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        state.success += 1;
        state.last_update = Some(Utc::now());
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        state.failure += 1;
        state.last_update = Some(Utc::now());
    }

    pub async fn observe_duration(&self, duration: Duration) {
        let mut state = self.state.write().await;
        state.duration_seconds.observe(duration.as_secs_f64());
        state.last_update = Some(Utc::now());
    }

    pub async fn observe_artifact_bytes(&self, bytes: u64) {
        let mut state = self.state.write().await;
        state.artifact_bytes.observe(bytes as f64);
        state.last_update = Some(Utc::now());
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().await;
        MetricsSnapshot {
            renders_attempted: state.attempted,
            renders_success: state.success,
            renders_failure: state.failure,
            render_duration_seconds: state.duration_seconds.clone(),
            artifact_bytes: state.artifact_bytes.clone(),
            last_update: state.last_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate_independently() {
        let sink = ResultSink::new();
        sink.record_attempt().await;
        sink.record_attempt().await;
        sink.record_success().await;
        sink.record_failure().await;

        let snap = sink.snapshot().await;
        assert_eq!(snap.renders_attempted, 2);
        assert_eq!(snap.renders_success, 1);
        assert_eq!(snap.renders_failure, 1);
        assert!(snap.last_update.is_some());
    }

    #[tokio::test]
    async fn test_histogram_tracks_bounds_and_sum() {
        let sink = ResultSink::new();
        sink.observe_duration(Duration::from_secs_f64(2.0)).await;
        sink.observe_duration(Duration::from_secs_f64(0.5)).await;
        sink.observe_duration(Duration::from_secs_f64(9.5)).await;

        let hist = sink.snapshot().await.render_duration_seconds;
        assert_eq!(hist.count, 3);
        assert_eq!(hist.min, Some(0.5));
        assert_eq!(hist.max, Some(9.5));
        assert!((hist.sum - 12.0).abs() < f64::EPSILON);
        assert_eq!(hist.mean(), Some(4.0));
    }

    #[tokio::test]
    async fn test_empty_histogram_has_no_bounds() {
        let snap = ResultSink::new().snapshot().await;
        assert_eq!(snap.render_duration_seconds.count, 0);
        assert_eq!(snap.render_duration_seconds.min, None);
        assert_eq!(snap.render_duration_seconds.max, None);
        assert_eq!(snap.render_duration_seconds.mean(), None);
        assert_eq!(snap.last_update, None);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_from_later_writes() {
        let sink = ResultSink::new();
        sink.record_attempt().await;
        let before = sink.snapshot().await;

        sink.record_attempt().await;
        sink.observe_artifact_bytes(4096).await;

        assert_eq!(before.renders_attempted, 1);
        assert_eq!(before.artifact_bytes.count, 0);
        let after = sink.snapshot().await;
        assert_eq!(after.renders_attempted, 2);
        assert_eq!(after.artifact_bytes.count, 1);
    }
}
