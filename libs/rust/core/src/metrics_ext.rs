//! OpenTelemetry instruments for the federation loop and the plugin registry.
use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

static METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("biscus_federation"));

#[derive(Clone, Debug)]
pub struct FederationMetrics {
    pub rounds_aggregated: Counter<u64>,
    pub rounds_rejected: Counter<u64>,
    pub client_results: Counter<u64>,
    pub client_failures: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub registry_entries: Counter<u64>,
    pub registry_skipped: Counter<u64>,
}

pub static FEDERATION_METRICS: Lazy<FederationMetrics> = Lazy::new(|| FederationMetrics {
    rounds_aggregated: METER.u64_counter("biscus_rounds_aggregated_total").with_description("Rounds whose fit results were aggregated").build(),
    rounds_rejected: METER.u64_counter("biscus_rounds_rejected_total").with_description("Rounds dropped because failures were not accepted").build(),
    client_results: METER.u64_counter("biscus_client_results_total").with_description("Client results received by the strategy").build(),
    client_failures: METER.u64_counter("biscus_client_failures_total").with_description("Client failures received by the strategy").build(),
    aggregation_latency_ms: METER
        .f64_histogram("biscus_aggregation_latency_ms")
        .with_description("Parameter aggregation latency (ms)")
        .with_unit("ms")
        .build(),
    registry_entries: METER.u64_counter("biscus_registry_entries_total").with_description("Components registered per category").build(),
    registry_skipped: METER.u64_counter("biscus_registry_skipped_total").with_description("Components or config variants rejected at registration").build(),
});
