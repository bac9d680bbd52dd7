//! Process-wide Prometheus metrics, gathered by the default registry and
//! exposed at `GET /metrics` (see `http_surface::routes::metrics_response`).
//!
//! Registered once via `once_cell::Lazy` and incremented from the call
//! sites that already know the relevant event, the same way the teacher's
//! `metrics::set_build_info_metric`/per-module counters are defined next
//! to the code that fires them rather than in one giant enum.

use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGauge, Opts};

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "brokerd_active_connections",
        "Number of connection handles currently tracked by the manager",
    )
    .expect("metric definition is valid");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
});

pub static CONNECTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("brokerd_connects_total", "Total `/connect` outcomes by result"),
        &["result"],
    )
    .expect("metric definition is valid");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

pub static HANDLES_EXPIRED_TOTAL: Lazy<prometheus::IntCounter> = Lazy::new(|| {
    let counter = prometheus::IntCounter::new(
        "brokerd_handles_expired_total",
        "Total connection handles force-closed by the sweeper",
    )
    .expect("metric definition is valid");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

pub static AUTH_FAILURES_TOTAL: Lazy<prometheus::IntCounter> = Lazy::new(|| {
    let counter = prometheus::IntCounter::new(
        "brokerd_auth_failures_total",
        "Total rejected `/login` attempts and token validation failures",
    )
    .expect("metric definition is valid");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

pub static APPROVAL_DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "brokerd_approval_decisions_total",
            "Total approval coordinator outcomes by decision",
        ),
        &["decision"],
    )
    .expect("metric definition is valid");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
});

/// Registers every metric eagerly, so the first `/metrics` scrape after
/// startup already lists them at zero rather than only after the first
/// event fires.
pub fn init() {
    Lazy::force(&ACTIVE_CONNECTIONS);
    Lazy::force(&CONNECTS_TOTAL);
    Lazy::force(&HANDLES_EXPIRED_TOTAL);
    Lazy::force(&AUTH_FAILURES_TOTAL);
    Lazy::force(&APPROVAL_DECISIONS_TOTAL);
}
