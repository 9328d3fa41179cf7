use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static ROUTINE_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static ROUTINE_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static TRANSACTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

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
                Opts::new("taskline_http_requests_total", "HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create taskline_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "taskline_http_request_duration_seconds",
                    "HTTP request duration in seconds.",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
                &["route", "method", "outcome"],
            )
            .expect("create taskline_http_request_duration_seconds"),
        )
    })
}

fn routine_calls_total() -> &'static IntCounterVec {
    ROUTINE_CALLS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("taskline_routine_calls_total", "Stored routine call count."),
                &["routine", "outcome"],
            )
            .expect("create taskline_routine_calls_total"),
        )
    })
}

fn routine_duration_seconds() -> &'static HistogramVec {
    ROUTINE_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "taskline_routine_duration_seconds",
                    "Stored routine call duration in seconds.",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
                &["routine"],
            )
            .expect("create taskline_routine_duration_seconds"),
        )
    })
}

fn transactions_total() -> &'static IntCounterVec {
    TRANSACTIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "taskline_transactions_total",
                    "Transaction scopes by outcome.",
                ),
                &["outcome"],
            )
            .expect("create taskline_transactions_total"),
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

/// `outcome` is one of `ok`, `business`, `error`.
pub fn observe_routine_call(routine: &str, outcome: &str, duration: Duration) {
    routine_calls_total()
        .with_label_values(&[routine, outcome])
        .inc();
    routine_duration_seconds()
        .with_label_values(&[routine])
        .observe(duration.as_secs_f64());
}

pub fn observe_transaction(outcome: &str) {
    transactions_total().with_label_values(&[outcome]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = routine_calls_total();
    let _ = transactions_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
