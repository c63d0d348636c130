use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static STREAM_SESSIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_STREAM_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static STREAM_EVENTS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static STREAM_KEEPALIVES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static STREAM_TOKENS_ISSUED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "porta_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create porta_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "porta_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create porta_gateway_http_request_duration_seconds"),
        )
    })
}

fn stream_sessions_total() -> &'static IntCounterVec {
    STREAM_SESSIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "porta_gateway_stream_sessions_total",
                    "Relay stream sessions by terminal outcome.",
                ),
                &["outcome"],
            )
            .expect("create porta_gateway_stream_sessions_total"),
        )
    })
}

fn active_stream_sessions() -> &'static IntGauge {
    ACTIVE_STREAM_SESSIONS.get_or_init(|| {
        register_collector(
            IntGauge::new(
                "porta_gateway_active_stream_sessions",
                "Relay stream sessions currently open.",
            )
            .expect("create porta_gateway_active_stream_sessions"),
        )
    })
}

fn stream_events_total() -> &'static IntCounter {
    STREAM_EVENTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "porta_gateway_stream_events_total",
                "Data frames relayed to clients.",
            )
            .expect("create porta_gateway_stream_events_total"),
        )
    })
}

fn stream_keepalives_total() -> &'static IntCounter {
    STREAM_KEEPALIVES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "porta_gateway_stream_keepalives_total",
                "Keep-alive comment frames written to clients.",
            )
            .expect("create porta_gateway_stream_keepalives_total"),
        )
    })
}

fn stream_tokens_issued_total() -> &'static IntCounter {
    STREAM_TOKENS_ISSUED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "porta_gateway_stream_tokens_issued_total",
                "Capability tokens minted for stream access.",
            )
            .expect("create porta_gateway_stream_tokens_issued_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn stream_session_opened() {
    active_stream_sessions().inc();
}

pub fn stream_session_closed(outcome: &str) {
    active_stream_sessions().dec();
    stream_sessions_total().with_label_values(&[outcome]).inc();
}

pub fn inc_stream_event() {
    stream_events_total().inc();
}

pub fn inc_stream_keepalive() {
    stream_keepalives_total().inc();
}

pub fn inc_stream_token_issued() {
    stream_tokens_issued_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = stream_events_total();
    let _ = stream_keepalives_total();
    let _ = stream_tokens_issued_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
