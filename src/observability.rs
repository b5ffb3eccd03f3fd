use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use uuid::Uuid;

/// Request/connection counters plus structured audit logging. Gauges for
/// sessions and queue length are read from their owners at snapshot time.
#[derive(Debug, Default)]
pub struct Observability {
    request_total: AtomicU64,
    request_errors: AtomicU64,
    websocket_active: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub request_total: u64,
    pub request_errors: u64,
    pub websocket_active: u64,
    pub active_sessions: u64,
    pub queue_length: u64,
}

impl Observability {
    pub fn next_trace_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn increment_request(&self) {
        self.request_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_error(&self) {
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_websocket_active(&self, count: u64) {
        self.websocket_active.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_sessions: u64, queue_length: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            request_total: self.request_total.load(Ordering::Relaxed),
            request_errors: self.request_errors.load(Ordering::Relaxed),
            websocket_active: self.websocket_active.load(Ordering::Relaxed),
            active_sessions,
            queue_length,
        }
    }

    pub fn log_request(&self, trace_id: &str, target: &str, status: u16, latency_ms: i64) {
        log::info!(
            target: "audit",
            "{}",
            json!({
                "traceId": trace_id,
                "eventName": target,
                "status": status,
                "latencyMs": latency_ms,
            })
        );
    }
}
