//! Prometheus counters/histograms for the producer/consumer engine, gated behind the `metrics`
//! feature so a caller that doesn't want the `prometheus` registry can opt out entirely.

#[cfg(feature = "metrics")]
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters/histograms shared by a [`crate::Producer`] or [`crate::Consumer`] and its
/// background tasks. Cheap to clone: every field is itself a cheaply-cloneable handle into the
/// shared registry. Compiles down to a zero-sized no-op when the `metrics` feature is off.
#[derive(Clone, Debug)]
pub struct AmiMetrics {
    #[cfg(feature = "metrics")]
    registry: Registry,

    #[cfg(feature = "metrics")]
    pub messages_sent_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub messages_flushed_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub messages_delivered_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub acks_total: IntCounter,
    #[cfg(feature = "metrics")]
    pub retries_total: IntCounterVec,
    #[cfg(feature = "metrics")]
    pub errors_total: IntCounterVec,
    #[cfg(feature = "metrics")]
    pub flush_latency_seconds: Histogram,

    #[cfg(not(feature = "metrics"))]
    _noop: (),
}

impl AmiMetrics {
    pub fn new() -> crate::error::AmiResult<Self> {
        #[cfg(feature = "metrics")]
        {
            let registry = Registry::new();

            let messages_sent_total = IntCounter::with_opts(Opts::new(
                "ami_messages_sent_total",
                "messages accepted by Send",
            ))?;
            let messages_flushed_total = IntCounter::with_opts(Opts::new(
                "ami_messages_flushed_total",
                "messages written to the store via a pipelined XADD batch",
            ))?;
            let messages_delivered_total = IntCounter::with_opts(Opts::new(
                "ami_messages_delivered_total",
                "messages delivered on the consumer's application channel",
            ))?;
            let acks_total = IntCounter::with_opts(Opts::new(
                "ami_acks_total",
                "messages acknowledged (XACK+XDEL) to the store",
            ))?;
            let retries_total = IntCounterVec::new(
                Opts::new("ami_retries_total", "retry attempts by operation"),
                &["op"],
            )?;
            let errors_total = IntCounterVec::new(
                Opts::new("ami_errors_total", "errors observed by operation"),
                &["op"],
            )?;
            let flush_latency_seconds = Histogram::with_opts(HistogramOpts::new(
                "ami_flush_latency_seconds",
                "time to execute a pipelined flush transaction",
            ))?;

            registry.register(Box::new(messages_sent_total.clone()))?;
            registry.register(Box::new(messages_flushed_total.clone()))?;
            registry.register(Box::new(messages_delivered_total.clone()))?;
            registry.register(Box::new(acks_total.clone()))?;
            registry.register(Box::new(retries_total.clone()))?;
            registry.register(Box::new(errors_total.clone()))?;
            registry.register(Box::new(flush_latency_seconds.clone()))?;

            Ok(Self {
                registry,
                messages_sent_total,
                messages_flushed_total,
                messages_delivered_total,
                acks_total,
                retries_total,
                errors_total,
                flush_latency_seconds,
            })
        }

        #[cfg(not(feature = "metrics"))]
        {
            Ok(Self { _noop: () })
        }
    }

    #[cfg(feature = "metrics")]
    pub fn gather_text(&self) -> crate::error::AmiResult<String> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl AmiMetrics {
    // Safe to call unconditionally regardless of whether the `metrics` feature is on; each
    // helper is a no-op when it's off.

    #[inline]
    pub fn inc_sent(&self) {
        #[cfg(feature = "metrics")]
        self.messages_sent_total.inc();
    }

    #[inline]
    pub fn inc_flushed(&self, _n: u64) {
        #[cfg(feature = "metrics")]
        self.messages_flushed_total.inc_by(_n);
    }

    #[inline]
    pub fn inc_delivered(&self) {
        #[cfg(feature = "metrics")]
        self.messages_delivered_total.inc();
    }

    #[inline]
    pub fn inc_acked(&self, _n: u64) {
        #[cfg(feature = "metrics")]
        self.acks_total.inc_by(_n);
    }

    #[inline]
    pub fn inc_retry(&self, _op: &str) {
        #[cfg(feature = "metrics")]
        self.retries_total.with_label_values(&[_op]).inc();
    }

    #[inline]
    pub fn inc_error(&self, _op: &str) {
        #[cfg(feature = "metrics")]
        self.errors_total.with_label_values(&[_op]).inc();
    }

    #[inline]
    pub fn observe_flush_latency(&self, _secs: f64) {
        #[cfg(feature = "metrics")]
        self.flush_latency_seconds.observe(_secs);
    }
}

#[cfg(test)]
#[cfg(feature = "metrics")]
mod tests {
    use super::*;

    #[test]
    fn registers_without_panicking() {
        let m = AmiMetrics::new().expect("metrics registry");
        m.messages_sent_total.inc();
        let text = m.gather_text().expect("gather");
        assert!(text.contains("ami_messages_sent_total"));
    }

    #[test]
    fn helpers_update_the_same_counters_as_direct_field_access() {
        let m = AmiMetrics::new().expect("metrics registry");
        m.inc_sent();
        m.inc_flushed(3);
        m.inc_delivered();
        m.inc_acked(3);
        m.inc_retry("producer_xadd");
        m.inc_error("producer_xadd");
        m.observe_flush_latency(0.01);

        assert_eq!(m.messages_sent_total.get(), 1);
        assert_eq!(m.messages_flushed_total.get(), 3);
        assert_eq!(m.messages_delivered_total.get(), 1);
        assert_eq!(m.acks_total.get(), 3);
        assert_eq!(m.retries_total.with_label_values(&["producer_xadd"]).get(), 1);
        assert_eq!(m.errors_total.with_label_values(&["producer_xadd"]).get(), 1);
    }
}
