use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_requests_total",
        "Total number of GraphQL requests",
        &["operation_name", "operation_type", "status"]
    )
    .unwrap()
});

pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gateway_request_duration_seconds",
        "Duration of GraphQL requests in seconds",
        &["operation_name", "operation_type"]
    )
    .unwrap()
});

pub static SUBGRAPH_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_subgraph_requests_total",
        "Total number of subgraph sub-requests",
        &["service", "status"]
    )
    .unwrap()
});

pub static SUBGRAPH_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gateway_subgraph_latency_seconds",
        "Subgraph sub-request latency in seconds",
        &["service"]
    )
    .unwrap()
});

pub static RATE_LIMIT_REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_rate_limit_rejections_total",
        "Operations rejected by the rate limiter",
        &["reason"]
    )
    .unwrap()
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
