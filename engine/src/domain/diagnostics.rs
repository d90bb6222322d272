//! Processing diagnostics
//!
//! Per-span outcomes ([`SpanDiagnostics`]) and process-wide counters
//! ([`Diagnostics`]). Counters are relaxed atomics behind an `Arc`, so a
//! clone shares the same totals.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::domain::detect::DetectionMethod;

/// What happened to one span
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpanDiagnostics {
    pub detection_method: DetectionMethod,
    pub confidence: f64,
    /// Rule set the fields were extracted with
    pub rule_set: Option<String>,
    /// Fields dropped by rule validation
    pub rejected_fields: Vec<String>,
    /// Fields taken from structure discovery
    pub discovered_fields: Vec<String>,
    pub missing_required: Vec<String>,
    pub timed_out: Vec<String>,
    pub failed_transforms: Vec<String>,
    /// Set when processing failed and an empty event was returned
    pub error: Option<String>,
}

impl SpanDiagnostics {
    /// True when any field was lost or processing failed.
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
            || !self.rejected_fields.is_empty()
            || !self.missing_required.is_empty()
            || !self.timed_out.is_empty()
            || !self.failed_transforms.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostics {
    inner: Arc<DiagnosticsInner>,
}

#[derive(Debug, Default)]
struct DiagnosticsInner {
    spans_processed: AtomicU64,
    spans_degraded: AtomicU64,
    detection_misses: AtomicU64,
    validation_failures: AtomicU64,
    missing_required: AtomicU64,
    transform_timeouts: AtomicU64,
    transform_errors: AtomicU64,
    processing_errors: AtomicU64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DiagnosticsInner::default()),
        }
    }

    /// Fold one span's outcome into the totals.
    pub(crate) fn record(&self, span: &SpanDiagnostics) {
        let inner = &self.inner;
        inner.spans_processed.fetch_add(1, Ordering::Relaxed);
        if span.is_degraded() {
            inner.spans_degraded.fetch_add(1, Ordering::Relaxed);
        }
        if span.detection_method == DetectionMethod::Unmatched {
            inner.detection_misses.fetch_add(1, Ordering::Relaxed);
        }
        if span.error.is_some() {
            inner.processing_errors.fetch_add(1, Ordering::Relaxed);
        }
        add(&inner.validation_failures, span.rejected_fields.len());
        add(&inner.missing_required, span.missing_required.len());
        add(&inner.transform_timeouts, span.timed_out.len());
        add(&inner.transform_errors, span.failed_transforms.len());
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &self.inner;
        DiagnosticsSnapshot {
            spans_processed: load(&inner.spans_processed),
            spans_degraded: load(&inner.spans_degraded),
            detection_misses: load(&inner.detection_misses),
            validation_failures: load(&inner.validation_failures),
            missing_required: load(&inner.missing_required),
            transform_timeouts: load(&inner.transform_timeouts),
            transform_errors: load(&inner.transform_errors),
            processing_errors: load(&inner.processing_errors),
        }
    }

    pub fn reset(&self) {
        let inner = &self.inner;
        for counter in [
            &inner.spans_processed,
            &inner.spans_degraded,
            &inner.detection_misses,
            &inner.validation_failures,
            &inner.missing_required,
            &inner.transform_timeouts,
            &inner.transform_errors,
            &inner.processing_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

fn add(counter: &AtomicU64, n: usize) {
    if n > 0 {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub spans_processed: u64,
    pub spans_degraded: u64,
    pub detection_misses: u64,
    pub validation_failures: u64,
    pub missing_required: u64,
    pub transform_timeouts: u64,
    pub transform_errors: u64,
    pub processing_errors: u64,
}

impl DiagnosticsSnapshot {
    /// Share of processed spans that lost at least one field (0.0 to 1.0).
    pub fn degraded_rate(&self) -> f64 {
        if self.spans_processed == 0 {
            0.0
        } else {
            self.spans_degraded as f64 / self.spans_processed as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let diagnostics = Diagnostics::new();
        diagnostics.record(&SpanDiagnostics {
            detection_method: DetectionMethod::Exact,
            confidence: 0.95,
            ..Default::default()
        });
        diagnostics.record(&SpanDiagnostics {
            timed_out: vec!["outputs.finish_reason".into()],
            missing_required: vec!["config.model".into(), "config.provider".into()],
            ..Default::default()
        });

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.spans_processed, 2);
        assert_eq!(snapshot.spans_degraded, 1);
        assert_eq!(snapshot.detection_misses, 1);
        assert_eq!(snapshot.transform_timeouts, 1);
        assert_eq!(snapshot.missing_required, 2);
        assert_eq!(snapshot.degraded_rate(), 0.5);
    }

    #[test]
    fn test_clones_share_counters() {
        let diagnostics = Diagnostics::new();
        let clone = diagnostics.clone();
        clone.record(&SpanDiagnostics::default());
        assert_eq!(diagnostics.snapshot().spans_processed, 1);

        diagnostics.reset();
        assert_eq!(clone.snapshot(), DiagnosticsSnapshot::default());
        assert_eq!(DiagnosticsSnapshot::default().degraded_rate(), 0.0);
    }
}
