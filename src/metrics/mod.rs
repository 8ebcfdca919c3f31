use prometheus::Encoder;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use tracing::warn;


use crate::Result;

/// Processor metrics, registered in a registry owned by the caller.
///
/// Every series is labelled with the host name; per-lease series also carry
/// the lease token.
#[derive(Debug, Clone)]
pub struct ProcessorMetrics {
    pub leases_acquired: IntCounterVec,
    pub leases_lost: IntCounterVec,
    pub leases_released: IntCounterVec,
    pub batches_delivered: IntCounterVec,
    pub items_delivered: IntCounterVec,
    pub delegate_failures: IntCounterVec,
    pub checkpoints: IntCounterVec,
    pub estimated_lag: IntGaugeVec,
    pub delivery_latency_ms: HistogramVec,
}

impl ProcessorMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let metrics = Self {
            leases_acquired: IntCounterVec::new(
                Opts::new("cfp_leases_acquired", "Leases taken by this host"),
                &["host"],
            )?,
            leases_lost: IntCounterVec::new(
                Opts::new("cfp_leases_lost", "Leases that moved to another host while owned"),
                &["host"],
            )?,
            leases_released: IntCounterVec::new(
                Opts::new("cfp_leases_released", "Leases given up voluntarily"),
                &["host"],
            )?,
            batches_delivered: IntCounterVec::new(
                Opts::new("cfp_batches_delivered", "Batches handed to the delegate successfully"),
                &["host", "lease"],
            )?,
            items_delivered: IntCounterVec::new(
                Opts::new("cfp_items_delivered", "Changes handed to the delegate successfully"),
                &["host", "lease"],
            )?,
            delegate_failures: IntCounterVec::new(
                Opts::new("cfp_delegate_failures", "Batches the delegate failed or panicked on"),
                &["host", "lease"],
            )?,
            checkpoints: IntCounterVec::new(
                Opts::new("cfp_checkpoints", "Continuation tokens persisted"),
                &["host", "lease"],
            )?,
            estimated_lag: IntGaugeVec::new(
                Opts::new("cfp_estimated_lag", "Changes not yet delivered, per lease"),
                &["host", "lease"],
            )?,
            delivery_latency_ms: HistogramVec::new(
                HistogramOpts::new("cfp_delivery_latency_ms", "Delegate invocation latency in ms")
                    .buckets(prometheus::exponential_buckets(1.0, 2.0, 16)?),
                &["host"],
            )?,
        };

        registry.register(Box::new(metrics.leases_acquired.clone()))?;
        registry.register(Box::new(metrics.leases_lost.clone()))?;
        registry.register(Box::new(metrics.leases_released.clone()))?;
        registry.register(Box::new(metrics.batches_delivered.clone()))?;
        registry.register(Box::new(metrics.items_delivered.clone()))?;
        registry.register(Box::new(metrics.delegate_failures.clone()))?;
        registry.register(Box::new(metrics.checkpoints.clone()))?;
        registry.register(Box::new(metrics.estimated_lag.clone()))?;
        registry.register(Box::new(metrics.delivery_latency_ms.clone()))?;

        Ok(metrics)
    }
}

/// Text exposition of everything in `registry`, for a scrape endpoint.
pub fn render_metrics(registry: &Registry) -> String {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!("could not encode metrics: {}", e);
    }
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            warn!("metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}
