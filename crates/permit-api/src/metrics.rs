//! Minimal Prometheus-style metrics (no external deps) and the in-memory API
//! call log behind the monitoring endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

const CALL_LOG_CAPACITY: usize = 1000;

/// Process-wide service metrics.
#[derive(Default)]
pub struct Metrics {
    http_requests_total: AtomicU64,
    http_errors_total: AtomicU64,
    applications_submitted_total: AtomicU64,
    status_transitions_total: AtomicU64,
    bulk_updates_total: AtomicU64,
    payment_webhooks_total: AtomicU64,
    sms_attempts_total: AtomicU64,
    sms_failures_total: AtomicU64,
    dashboard_streams_active: AtomicU64,
    calls: Mutex<VecDeque<ApiCall>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApiCall {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MonitoringSummary {
    pub total_calls: usize,
    pub error_count: usize,
    pub error_rate: f64,
    pub average_response_ms: f64,
    pub slowest: Option<ApiCall>,
}

impl Metrics {
    pub fn record_call(&self, call: ApiCall) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
        if call.status >= 400 {
            self.http_errors_total.fetch_add(1, Ordering::Relaxed);
        }

        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        if calls.len() >= CALL_LOG_CAPACITY {
            calls.pop_front();
        }
        calls.push_back(call);
    }

    pub fn inc_submission(&self) {
        self.applications_submitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_transition(&self, n: u64) {
        self.status_transitions_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_bulk_update(&self) {
        self.bulk_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_payment_webhook(&self) {
        self.payment_webhooks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sms(&self, delivered: bool) {
        self.sms_attempts_total.fetch_add(1, Ordering::Relaxed);
        if !delivered {
            self.sms_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stream_opened(&self) {
        self.dashboard_streams_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        let _ = self
            .dashboard_streams_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Aggregate view over the retained call log.
    pub fn summary(&self) -> MonitoringSummary {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        let total_calls = calls.len();
        let error_count = calls.iter().filter(|c| c.status >= 400).count();
        let total_ms: u64 = calls.iter().map(|c| c.duration_ms).sum();
        let (error_rate, average_response_ms) = if total_calls == 0 {
            (0.0, 0.0)
        } else {
            (
                error_count as f64 / total_calls as f64,
                total_ms as f64 / total_calls as f64,
            )
        };

        MonitoringSummary {
            total_calls,
            error_count,
            error_rate,
            average_response_ms,
            slowest: calls.iter().max_by_key(|c| c.duration_ms).cloned(),
        }
    }

    /// Most recent failed calls, newest first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ApiCall> {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls
            .iter()
            .rev()
            .filter(|c| c.status >= 400)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn render(&self, uptime_secs: u64) -> String {
        let mut out = String::new();
        let mut metric = |name: &str, kind: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            out.push_str(&format!("{name} {value}\n"));
        };

        metric(
            "permitd_uptime_seconds",
            "gauge",
            "Service uptime in seconds.",
            uptime_secs,
        );
        metric(
            "permitd_http_requests_total",
            "counter",
            "Total HTTP requests handled.",
            self.http_requests_total.load(Ordering::Relaxed),
        );
        metric(
            "permitd_http_errors_total",
            "counter",
            "Total HTTP responses with status >= 400.",
            self.http_errors_total.load(Ordering::Relaxed),
        );
        metric(
            "permitd_applications_submitted_total",
            "counter",
            "Total applications submitted.",
            self.applications_submitted_total.load(Ordering::Relaxed),
        );
        metric(
            "permitd_status_transitions_total",
            "counter",
            "Total application status changes written.",
            self.status_transitions_total.load(Ordering::Relaxed),
        );
        metric(
            "permitd_bulk_updates_total",
            "counter",
            "Total bulk status updates.",
            self.bulk_updates_total.load(Ordering::Relaxed),
        );
        metric(
            "permitd_payment_webhooks_total",
            "counter",
            "Total verified payment webhooks.",
            self.payment_webhooks_total.load(Ordering::Relaxed),
        );
        metric(
            "permitd_sms_attempts_total",
            "counter",
            "Total SMS send attempts.",
            self.sms_attempts_total.load(Ordering::Relaxed),
        );
        metric(
            "permitd_sms_failures_total",
            "counter",
            "Total failed SMS send attempts.",
            self.sms_failures_total.load(Ordering::Relaxed),
        );
        metric(
            "permitd_dashboard_streams_active",
            "gauge",
            "Open dashboard event streams.",
            self.dashboard_streams_active.load(Ordering::Relaxed),
        );

        out
    }
}

/// Record method, route template, status and latency of every request.
pub async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;

    state.metrics.record_call(ApiCall {
        method,
        path,
        status: response.status().as_u16(),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        at: Utc::now(),
    });
    response
}
