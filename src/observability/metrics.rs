use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::observability::events::{DispatchEvent, EventSink};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_total: IntCounterVec,
    pub orders_in_queue: IntGauge,
    pub match_latency_seconds: HistogramVec,
    pub connected_couriers: IntGauge,
    pub unassignable_orders_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Offers by outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let orders_in_queue = IntGauge::new("orders_in_queue", "Orders waiting for a matching pass")
            .expect("valid orders_in_queue metric");

        let match_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "match_latency_seconds",
                "Latency of one matching pass in seconds",
            ),
            &["outcome"],
        )
        .expect("valid match_latency_seconds metric");

        let connected_couriers = IntGauge::new("connected_couriers", "Couriers with a live session")
            .expect("valid connected_couriers metric");

        let unassignable_orders_total = IntCounter::new(
            "unassignable_orders_total",
            "Orders that exhausted their offer attempts",
        )
        .expect("valid unassignable_orders_total metric");

        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(orders_in_queue.clone()))
            .expect("register orders_in_queue");
        registry
            .register(Box::new(match_latency_seconds.clone()))
            .expect("register match_latency_seconds");
        registry
            .register(Box::new(connected_couriers.clone()))
            .expect("register connected_couriers");
        registry
            .register(Box::new(unassignable_orders_total.clone()))
            .expect("register unassignable_orders_total");

        Self {
            registry,
            offers_total,
            orders_in_queue,
            match_latency_seconds,
            connected_couriers,
            unassignable_orders_total,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl EventSink for Metrics {
    fn record(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::OfferIssued { .. } => {
                self.offers_total.with_label_values(&["issued"]).inc()
            }
            DispatchEvent::OfferAccepted { .. } => {
                self.offers_total.with_label_values(&["accepted"]).inc()
            }
            DispatchEvent::OfferRejected { .. } => {
                self.offers_total.with_label_values(&["rejected"]).inc()
            }
            DispatchEvent::OfferExpired { .. } => {
                self.offers_total.with_label_values(&["expired"]).inc()
            }
            DispatchEvent::OrderUnassignable { .. } => self.unassignable_orders_total.inc(),
            _ => {}
        }
    }
}
