//! Tracing & Metrics model (spec.md §4.K).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub attributes: HashMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

/// A single span within a trace. The root span (`parent_span_id =
/// None`) is created by `startTrace`; every other span is created by
/// `createSpan` against a parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub span_id: Uuid,
    pub trace_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub name: String,
    pub operation_type: String,
    pub tags: HashMap<String, String>,
    pub events: Vec<SpanEvent>,
    pub status: SpanStatus,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Span {
    pub fn duration_ms(&self) -> Option<f64> {
        self.ended_at.map(|end| (end - self.started_at).num_microseconds().unwrap_or(0) as f64 / 1000.0)
    }
}

/// A full trace: its root span plus every child span recorded under
/// it, keyed by `span_id` for O(1) lookup during `createSpan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: Uuid,
    pub root_span_id: Uuid,
    pub tenant_id: Option<String>,
    pub provider: Option<String>,
    pub spans: HashMap<Uuid, Span>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Trace {
    pub fn root(&self) -> &Span {
        self.spans.get(&self.root_span_id).expect("root span always present")
    }

    pub fn is_completed(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.ended_at.map(|end| (end - self.started_at).num_microseconds().unwrap_or(0) as f64 / 1000.0)
    }
}

/// Caller-facing handle returned by `startTrace`, carrying the
/// W3C-propagable identifiers without exposing the full `Trace`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
}

impl TraceContext {
    /// Renders a `traceparent: 00-<traceId>-<spanId>-01` header value
    /// (spec.md §6 "Trace propagation headers").
    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id.simple(), self.span_id.simple())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Uuid,
}

impl SpanContext {
    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id.simple(), self.span_id.simple())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub operation_type: Option<String>,
    pub provider: Option<String>,
    pub tenant_id: Option<String>,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub tag: Option<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineBucket {
    pub bucket_start: DateTime<Utc>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStatistics {
    pub total_traces: u64,
    pub error_count: u64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub by_operation_type: HashMap<String, u64>,
    pub by_provider: HashMap<String, u64>,
    pub by_error: HashMap<String, u64>,
    pub timeline: Vec<TimelineBucket>,
}
