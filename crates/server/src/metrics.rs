#![cfg(feature = "metrics")]

use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub message_rejections_total: IntCounterVec,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "dockside_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let rejections = IntCounterVec::new(
            Opts::new(
                "dockside_message_rejections_total",
                "Messages or conversation lookups refused, labeled by rejection code",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total: requests,
            message_rejections_total: rejections,
        }))
    }

    pub fn increment_messaging_rejection(&self, reason: &str) {
        self.message_rejections_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_counter_is_exported() {
        let metrics = MetricsContext::init().expect("registry");
        metrics.increment_messaging_rejection("rate_limited");
        metrics.increment_messaging_rejection("rate_limited");

        let body = String::from_utf8(metrics.encode().expect("encode")).expect("utf8");
        assert!(body.contains("dockside_message_rejections_total{reason=\"rate_limited\"} 2"));
    }
}
