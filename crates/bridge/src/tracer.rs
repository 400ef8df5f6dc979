// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `Tracer` / `Metrics` — the observability collaborators from spec.md §2.
//! Specified only as interfaces; the default implementations route through
//! `tracing`, matching every `tracing::debug!`/`warn!` call site already in
//! [`crate::backend::acp`] and the teacher's modules.

/// Structured observability hook. The default logs through `tracing` spans
/// keyed by `session_id`; embedders may swap in their own sink (e.g. an
/// OpenTelemetry exporter) without touching bridge internals.
pub trait Tracer: Send + Sync {
    fn event(&self, session_id: &str, name: &str, detail: &str);
}

/// Default [`Tracer`] that logs through `tracing`.
#[derive(Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn event(&self, session_id: &str, name: &str, detail: &str) {
        tracing::debug!(session_id, event = name, detail, "bridge event");
    }
}

/// Counters a metrics backend would want; a Non-goal to implement a real
/// backend (spec.md §1), but the hook itself is ambient stack, not a
/// feature, so it is always present.
pub trait Metrics: Send + Sync {
    fn incr(&self, counter: &str);
    fn observe(&self, histogram: &str, value: f64);
}

/// No-op default, used when no metrics sink is configured.
#[derive(Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr(&self, _counter: &str) {}
    fn observe(&self, _histogram: &str, _value: f64) {}
}
