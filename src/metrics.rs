use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram,
    IntCounter, IntGauge, TextEncoder,
};

pub static CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "streamhub_connections_total",
        "Total number of client connections accepted"
    ))
    .unwrap()
});

pub static CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(opts!(
        "streamhub_connections_active",
        "Currently registered client connections"
    ))
    .unwrap()
});

pub static MESSAGES_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "streamhub_messages_dropped_total",
        "Outbound frames evicted from saturated connection buffers"
    ))
    .unwrap()
});

pub static FORCED_DISCONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "streamhub_forced_disconnects_total",
        "Connections force-closed after exceeding the send timeout"
    ))
    .unwrap()
});

pub static RELAY_PUBLISH_SUCCESS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "streamhub_relay_publish_success_total",
        "Relay records acknowledged by the durable log"
    ))
    .unwrap()
});

pub static RELAY_PUBLISH_FAILURE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "streamhub_relay_publish_failure_total",
        "Relay publishes that timed out or were rejected"
    ))
    .unwrap()
});

pub static RELAY_PUBLISH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "streamhub_relay_publish_latency_seconds",
        "Time from publish call to durable acknowledgment"
    )
    .unwrap()
});

pub static RATE_LIMIT_REJECTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "streamhub_rate_limit_rejected_total",
        "Login attempts rejected by the rate limiter"
    ))
    .unwrap()
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
