//! Time-to-first-byte and processing time bookkeeping for services

use std::time::Instant;

use crate::frames::{Frame, MetricsData, MetricsKind, StartParams};

/// Produces metrics frames for one service call at a time
#[derive(Debug, Clone)]
pub(crate) struct ServiceMetrics {
    processor: &'static str,
    enabled: bool,
    usage_enabled: bool,
    started: Option<Instant>,
    ttfb_reported: bool,
}

impl ServiceMetrics {
    pub(crate) const fn new(processor: &'static str) -> Self {
        Self {
            processor,
            enabled: false,
            usage_enabled: false,
            started: None,
            ttfb_reported: false,
        }
    }

    pub(crate) const fn configure(&mut self, params: &StartParams) {
        self.enabled = params.enable_metrics;
        self.usage_enabled = params.enable_usage_metrics;
    }

    /// Mark the start of a call
    pub(crate) fn start(&mut self) {
        self.started = Some(Instant::now());
        self.ttfb_reported = false;
    }

    /// Time to first byte, reported once per call
    pub(crate) fn first_byte(&mut self) -> Option<Frame> {
        if self.ttfb_reported {
            return None;
        }
        let started = self.started?;
        self.ttfb_reported = true;
        let value = started.elapsed();
        tracing::debug!(processor = self.processor, ttfb_ms = value.as_millis(), "ttfb");
        self.frame(MetricsKind::Ttfb { value })
    }

    /// Total processing time; ends the call
    pub(crate) fn finish(&mut self) -> Option<Frame> {
        let value = self.started.take()?.elapsed();
        tracing::debug!(
            processor = self.processor,
            processing_ms = value.as_millis(),
            "processing time"
        );
        self.frame(MetricsKind::Processing { value })
    }

    pub(crate) fn usage(&self, kind: MetricsKind) -> Option<Frame> {
        if !self.usage_enabled {
            return None;
        }
        Some(Frame::Metrics(MetricsData {
            processor: self.processor.to_string(),
            kind,
        }))
    }

    pub(crate) fn reset(&mut self) {
        self.started = None;
        self.ttfb_reported = false;
    }

    fn frame(&self, kind: MetricsKind) -> Option<Frame> {
        self.enabled.then(|| {
            Frame::Metrics(MetricsData {
                processor: self.processor.to_string(),
                kind,
            })
        })
    }
}
