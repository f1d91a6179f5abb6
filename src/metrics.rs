//! Prometheus counters for reconciliation skip/conflict/failure paths,
//! exposed on the `/metrics` endpoint.

use prometheus::{
    Encoder as _,
    IntCounter,
    IntCounterVec,
    Opts,
    Registry,
    TextEncoder,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Ingress entries skipped during a reconcile tick, by reason.
pub static SKIPPED_ENTRIES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "ingress_entries_skipped_total",
            "Ingress entries skipped during reconciliation, by reason",
        ),
        &["reason"],
    )
    .expect("valid metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register skipped entries counter");
    counter
});

/// Hosts claimed by more than one entry with differing frontend schemes.
pub static DNS_HOST_CONFLICTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "dns_host_conflicts_total",
        "Hosts requested with conflicting frontend schemes; the first entry wins",
    )
    .expect("valid metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register host conflicts counter");
    counter
});

/// Failed change-set submissions to the DNS provider.
pub static DNS_UPDATE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "dns_update_failures_total",
        "Failed record change submissions to the DNS provider",
    )
    .expect("valid metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register update failures counter");
    counter
});

/// Record changes successfully applied to the DNS provider.
pub static DNS_CHANGES_APPLIED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "dns_changes_applied_total",
        "Record changes successfully applied to the DNS provider",
    )
    .expect("valid metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register changes applied counter");
    counter
});

pub fn skipped(reason: &str) {
    SKIPPED_ENTRIES.with_label_values(&[reason]).inc();
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather() -> String {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        error!("failed to encode metrics: {err}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
