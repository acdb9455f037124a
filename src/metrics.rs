// Copyright 2020 Joyent, Inc.

//! Metrics collection for Fast clients and servers.

use prometheus::{CounterVec, Opts, Registry};

/// The metrics collector both multiplexers report into. Construct one,
/// register it with a prometheus `Registry`, and hand it to the client or
/// server options.
#[derive(Clone)]
pub struct FastMetrics {
    /// Completed RPC requests (END or ERROR observed), by method.
    pub requests_completed: CounterVec,
}

impl FastMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let requests_completed = CounterVec::new(
            Opts::new(
                "fast_requests_completed",
                "Total completed Fast RPC requests by method",
            ),
            &["rpcMethod"],
        )?;

        Ok(FastMetrics { requests_completed })
    }

    /// Registers all collectors with the provided registry.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.requests_completed.clone()))
    }

    pub(crate) fn observe_request_completed(&self, method: &str) {
        self.requests_completed.with_label_values(&[method]).inc();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn requests_completed_counts_by_method() {
        let metrics = FastMetrics::new().unwrap();
        let registry = Registry::new();
        metrics.register(&registry).unwrap();

        metrics.observe_request_completed("echo");
        metrics.observe_request_completed("echo");
        metrics.observe_request_completed("date");

        let echo = metrics
            .requests_completed
            .with_label_values(&["echo"])
            .get();
        assert_eq!(echo as u64, 2);

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "fast_requests_completed"));
    }
}
