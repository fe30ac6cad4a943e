//! Telemetry (spec.md §8, supplemented): prometheus counters and
//! histograms exposed over `/metrics`, following the
//! `once_cell::sync::Lazy` + `register_*!` idiom `peserver::worker` uses
//! for its own counters. Unlike the teacher, this crate owns its metrics
//! registration directly rather than delegating to pingora's built-in
//! prometheus service, since `cmd` is an axum binary.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Encode(#[from] prometheus::Error),
    Utf8(#[from] std::string::FromUtf8Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Found,
    NoPeers,
    Timeout,
}

impl ResolveOutcome {
    fn label(self) -> &'static str {
        match self {
            ResolveOutcome::Found => "found",
            ResolveOutcome::NoPeers => "no_peers",
            ResolveOutcome::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    Success,
    PeerUnreachable,
    PeerBadResponse,
    DigestMismatch,
}

impl MirrorOutcome {
    fn label(self) -> &'static str {
        match self {
            MirrorOutcome::Success => "success",
            MirrorOutcome::PeerUnreachable => "peer_unreachable",
            MirrorOutcome::PeerBadResponse => "peer_bad_response",
            MirrorOutcome::DigestMismatch => "digest_mismatch",
        }
    }
}

static RESOLVE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cm_resolve_total",
        "Peer Router resolve attempts by outcome",
        &["outcome"]
    )
    .unwrap()
});

static RESOLVE_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "cm_resolve_duration_seconds",
        "Time to find the first usable peer for a content key",
        &["outcome"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap()
});

static MIRROR_ATTEMPT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cm_mirror_attempt_total",
        "Attempts to serve a request by forwarding to a peer, by outcome",
        &["outcome"]
    )
    .unwrap()
});

static PROXY_FALLBACK_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cm_proxy_fallback_total",
        "Requests served by falling through to the origin registry",
        &["reason"]
    )
    .unwrap()
});

static ADVERTISED_KEYS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "cm_advertised_keys",
        "Number of distinct content keys currently advertised on the DHT"
    )
    .unwrap()
});

pub fn record_resolve(outcome: ResolveOutcome, duration: std::time::Duration) {
    RESOLVE_TOTAL.with_label_values(&[outcome.label()]).inc();
    RESOLVE_DURATION_SECONDS
        .with_label_values(&[outcome.label()])
        .observe(duration.as_secs_f64());
}

pub fn record_mirror_attempt(outcome: MirrorOutcome) {
    MIRROR_ATTEMPT_TOTAL.with_label_values(&[outcome.label()]).inc();
}

pub fn record_proxy_fallback(reason: &str) {
    PROXY_FALLBACK_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_advertised_keys(n: i64) {
    ADVERTISED_KEYS.set(n);
}

/// Renders every registered metric in Prometheus text exposition format,
/// for a `GET /metrics` handler to return verbatim.
pub fn gather() -> Result<String, Error> {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_includes_recorded_metrics() {
        record_resolve(ResolveOutcome::Found, std::time::Duration::from_millis(5));
        set_advertised_keys(7);
        let text = gather().unwrap();
        assert!(text.contains("cm_resolve_total"));
        assert!(text.contains("cm_advertised_keys 7"));
    }
}
