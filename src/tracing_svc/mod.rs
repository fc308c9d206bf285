//! Tracing & Metrics (spec.md §4.K).
//!
//! `TracingService` keeps active traces in a `DashMap` until their root
//! span ends, then moves them into a bounded completed-trace ring
//! buffer. Grounded on `src/provider_errors/mod.rs`'s bounded-history
//! pattern (`VecDeque` capped at a configured size) for the completed
//! set, and on the teacher's own `tracing`/`tracing-subscriber` pair for
//! the ambient logging this module turns into a queryable component.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TracingSettings;
use crate::models::tracing::{
    Span, SpanContext, SpanEvent, SpanStatus, Trace, TraceContext, TraceQuery, TraceStatistics, TimelineBucket,
};

const MAX_COMPLETED_TRACES: usize = 10_000;
const TIMELINE_BUCKET_SECS: i64 = 5 * 60;

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("unknown trace: {0}")]
    UnknownTrace(Uuid),
    #[error("unknown span: {0}")]
    UnknownSpan(Uuid),
    #[error("trace already ended: {0}")]
    AlreadyEnded(Uuid),
}

/// Maintains active traces and a bounded completed-trace history with
/// periodic cleanup of traces past `retention_secs` (spec.md §4.K
/// "Stateful tracing service maintaining active traces and bounded
/// completed history with periodic cleanup").
pub struct TracingService {
    active: DashMap<Uuid, Trace>,
    completed: Mutex<VecDeque<Trace>>,
    settings: TracingSettings,
}

impl TracingService {
    pub fn new(settings: TracingSettings) -> Self {
        Self {
            active: DashMap::new(),
            completed: Mutex::new(VecDeque::new()),
            settings,
        }
    }

    /// Starts a new trace with a root span, sampled against
    /// `settings.sampling_rate` via the caller-supplied `sampled`
    /// decision (the service itself is mechanism, not policy — callers
    /// decide whether to start a trace at all).
    pub fn start_trace(&self, name: &str, operation_type: &str, tags: HashMap<String, String>) -> TraceContext {
        let trace_id = Uuid::new_v4();
        let span_id = Uuid::new_v4();
        let now = Utc::now();

        let root = Span {
            span_id,
            trace_id,
            parent_span_id: None,
            name: name.to_string(),
            operation_type: operation_type.to_string(),
            tags,
            events: Vec::new(),
            status: SpanStatus::Unset,
            error_message: None,
            started_at: now,
            ended_at: None,
        };

        let mut spans = HashMap::new();
        spans.insert(span_id, root);

        let trace = Trace {
            trace_id,
            root_span_id: span_id,
            tenant_id: None,
            provider: None,
            spans,
            started_at: now,
            ended_at: None,
        };
        self.active.insert(trace_id, trace);

        TraceContext { trace_id, span_id }
    }

    pub fn create_span(&self, parent: TraceContext, name: &str, tags: HashMap<String, String>) -> Result<SpanContext, TracingError> {
        let mut trace = self.active.get_mut(&parent.trace_id).ok_or(TracingError::UnknownTrace(parent.trace_id))?;
        if !trace.spans.contains_key(&parent.span_id) {
            return Err(TracingError::UnknownSpan(parent.span_id));
        }

        let span_id = Uuid::new_v4();
        let span = Span {
            span_id,
            trace_id: parent.trace_id,
            parent_span_id: Some(parent.span_id),
            name: name.to_string(),
            operation_type: trace.spans[&parent.span_id].operation_type.clone(),
            tags,
            events: Vec::new(),
            status: SpanStatus::Unset,
            error_message: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        trace.spans.insert(span_id, span);

        Ok(SpanContext { trace_id: parent.trace_id, span_id, parent_span_id: parent.span_id })
    }

    pub fn add_event(&self, trace_id: Uuid, span_id: Uuid, name: &str, attributes: HashMap<String, String>) -> Result<(), TracingError> {
        let mut trace = self.active.get_mut(&trace_id).ok_or(TracingError::UnknownTrace(trace_id))?;
        let span = trace.spans.get_mut(&span_id).ok_or(TracingError::UnknownSpan(span_id))?;
        span.events.push(SpanEvent { name: name.to_string(), attributes, occurred_at: Utc::now() });
        Ok(())
    }

    pub fn set_tag(&self, trace_id: Uuid, span_id: Uuid, key: &str, value: &str) -> Result<(), TracingError> {
        let mut trace = self.active.get_mut(&trace_id).ok_or(TracingError::UnknownTrace(trace_id))?;
        let span = trace.spans.get_mut(&span_id).ok_or(TracingError::UnknownSpan(span_id))?;
        span.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn record_exception(&self, trace_id: Uuid, span_id: Uuid, message: &str) -> Result<(), TracingError> {
        let mut trace = self.active.get_mut(&trace_id).ok_or(TracingError::UnknownTrace(trace_id))?;
        let span = trace.spans.get_mut(&span_id).ok_or(TracingError::UnknownSpan(span_id))?;
        span.status = SpanStatus::Error;
        span.error_message = Some(message.to_string());
        Ok(())
    }

    pub fn end_span(&self, trace_id: Uuid, span_id: Uuid, status: SpanStatus) -> Result<(), TracingError> {
        let mut trace = self.active.get_mut(&trace_id).ok_or(TracingError::UnknownTrace(trace_id))?;
        let root_span_id = trace.root_span_id;
        let span = trace.spans.get_mut(&span_id).ok_or(TracingError::UnknownSpan(span_id))?;
        if span.ended_at.is_some() {
            return Err(TracingError::AlreadyEnded(span_id));
        }
        span.ended_at = Some(Utc::now());
        if status != SpanStatus::Unset {
            span.status = status;
        }

        if span_id == root_span_id {
            trace.ended_at = span.ended_at;
            drop(trace);
            self.retire(trace_id);
        }
        Ok(())
    }

    /// Moves a completed trace from `active` into the bounded
    /// completed-history ring buffer (oldest dropped once
    /// `MAX_COMPLETED_TRACES` is exceeded).
    fn retire(&self, trace_id: Uuid) {
        let Some((_, trace)) = self.active.remove(&trace_id) else { return };
        let mut completed = self.completed.lock().expect("completed trace history lock poisoned");
        completed.push_back(trace);
        while completed.len() > MAX_COMPLETED_TRACES {
            completed.pop_front();
        }
    }

    pub fn get_trace(&self, trace_id: Uuid) -> Option<Trace> {
        if let Some(trace) = self.active.get(&trace_id) {
            return Some(trace.clone());
        }
        None
    }

    pub fn get_trace_async(&self, trace_id: Uuid) -> Option<Trace> {
        if let Some(trace) = self.get_trace(trace_id) {
            return Some(trace);
        }
        self.completed.lock().expect("completed trace history lock poisoned").iter().find(|t| t.trace_id == trace_id).cloned()
    }

    pub fn search_traces(&self, query: &TraceQuery) -> Vec<Trace> {
        let mut results: Vec<Trace> = self.active.iter().map(|e| e.value().clone()).collect();
        results.extend(self.completed.lock().expect("completed trace history lock poisoned").iter().cloned());
        results.retain(|trace| matches(trace, query));
        results
    }

    pub fn get_statistics(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> TraceStatistics {
        let mut traces: Vec<Trace> = self.active.iter().map(|e| e.value().clone()).collect();
        traces.extend(self.completed.lock().expect("completed trace history lock poisoned").iter().cloned());
        traces.retain(|t| t.started_at >= start && t.started_at <= end);

        let mut durations: Vec<f64> = Vec::new();
        let mut by_operation_type: HashMap<String, u64> = HashMap::new();
        let mut by_provider: HashMap<String, u64> = HashMap::new();
        let mut by_error: HashMap<String, u64> = HashMap::new();
        let mut error_count = 0u64;
        let mut buckets: HashMap<i64, u64> = HashMap::new();

        for trace in &traces {
            let root = trace.root();
            *by_operation_type.entry(root.operation_type.clone()).or_insert(0) += 1;
            if let Some(provider) = &trace.provider {
                *by_provider.entry(provider.clone()).or_insert(0) += 1;
            }
            if let Some(duration) = trace.duration_ms() {
                durations.push(duration);
            }
            if trace.spans.values().any(|s| s.status == SpanStatus::Error) {
                error_count += 1;
                if let Some(message) = trace.spans.values().find_map(|s| s.error_message.clone()) {
                    *by_error.entry(message).or_insert(0) += 1;
                }
            }
            let bucket = trace.started_at.timestamp() / TIMELINE_BUCKET_SECS;
            *buckets.entry(bucket).or_insert(0) += 1;
        }

        durations.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let p95 = percentile(&durations, 0.95);
        let p99 = percentile(&durations, 0.99);

        let mut timeline: Vec<TimelineBucket> = buckets
            .into_iter()
            .map(|(bucket, count)| TimelineBucket {
                bucket_start: DateTime::from_timestamp(bucket * TIMELINE_BUCKET_SECS, 0).unwrap_or(start),
                count,
            })
            .collect();
        timeline.sort_by_key(|b| b.bucket_start);

        TraceStatistics {
            total_traces: traces.len() as u64,
            error_count,
            p95_duration_ms: p95,
            p99_duration_ms: p99,
            by_operation_type,
            by_provider,
            by_error,
            timeline,
        }
    }

    /// Drops completed traces (and abandoned active traces) older than
    /// `retention_secs`; active traces whose root span never ended are
    /// force-closed so they don't leak forever.
    pub fn cleanup_expired(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.settings.retention_secs as i64);

        let stale_active: Vec<Uuid> = self.active.iter().filter(|e| e.value().started_at < cutoff).map(|e| *e.key()).collect();
        for trace_id in stale_active {
            if let Some((_, mut trace)) = self.active.remove(&trace_id) {
                trace.ended_at.get_or_insert(Utc::now());
                let mut completed = self.completed.lock().expect("completed trace history lock poisoned");
                completed.push_back(trace);
                while completed.len() > MAX_COMPLETED_TRACES {
                    completed.pop_front();
                }
            }
        }

        let mut completed = self.completed.lock().expect("completed trace history lock poisoned");
        completed.retain(|t| t.started_at >= cutoff);
    }

    pub async fn run_cleanup_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.cleanup_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cleanup_expired(),
                _ = cancel.cancelled() => return,
            }
        }
    }
}

fn matches(trace: &Trace, query: &TraceQuery) -> bool {
    if let Some(start) = query.start {
        if trace.started_at < start {
            return false;
        }
    }
    if let Some(end) = query.end {
        if trace.started_at > end {
            return false;
        }
    }
    if let Some(operation_type) = &query.operation_type {
        if &trace.root().operation_type != operation_type {
            return false;
        }
    }
    if let Some(provider) = &query.provider {
        if trace.provider.as_deref() != Some(provider.as_str()) {
            return false;
        }
    }
    if let Some(tenant_id) = &query.tenant_id {
        if trace.tenant_id.as_deref() != Some(tenant_id.as_str()) {
            return false;
        }
    }
    if let Some(min) = query.min_duration_ms {
        if trace.duration_ms().map(|d| d < min).unwrap_or(true) {
            return false;
        }
    }
    if let Some(max) = query.max_duration_ms {
        if trace.duration_ms().map(|d| d > max).unwrap_or(true) {
            return false;
        }
    }
    if let Some((key, value)) = &query.tag {
        if !trace.spans.values().any(|s| s.tags.get(key).map(|v| v == value).unwrap_or(false)) {
            return false;
        }
    }
    true
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TracingService {
        TracingService::new(TracingSettings::default())
    }

    #[test]
    fn traceparent_has_w3c_shape() {
        let svc = service();
        let ctx = svc.start_trace("chat.completion", "chat", HashMap::new());
        let header = ctx.traceparent();
        assert!(header.starts_with("00-"));
        assert_eq!(header.split('-').count(), 4);
    }

    #[test]
    fn end_root_span_retires_trace_from_active() {
        let svc = service();
        let ctx = svc.start_trace("chat.completion", "chat", HashMap::new());
        assert!(svc.get_trace(ctx.trace_id).is_some());
        svc.end_span(ctx.trace_id, ctx.span_id, SpanStatus::Ok).unwrap();
        assert!(svc.get_trace(ctx.trace_id).is_none());
    }

    #[test]
    fn child_span_inherits_operation_type() {
        let svc = service();
        let ctx = svc.start_trace("chat.completion", "chat", HashMap::new());
        let child = svc.create_span(ctx, "provider.call", HashMap::new()).unwrap();
        let trace = svc.get_trace(ctx.trace_id).unwrap();
        assert_eq!(trace.spans[&child.span_id].operation_type, "chat");
    }

    #[test]
    fn statistics_count_errors_and_compute_percentiles() {
        let svc = service();
        for _ in 0..5 {
            let ctx = svc.start_trace("chat.completion", "chat", HashMap::new());
            svc.end_span(ctx.trace_id, ctx.span_id, SpanStatus::Ok).unwrap();
        }
        let ctx = svc.start_trace("chat.completion", "chat", HashMap::new());
        svc.record_exception(ctx.trace_id, ctx.span_id, "boom").unwrap();
        svc.end_span(ctx.trace_id, ctx.span_id, SpanStatus::Error).unwrap();

        let stats = svc.get_statistics(Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::hours(1));
        assert_eq!(stats.total_traces, 6);
        assert_eq!(stats.error_count, 1);
    }
}
