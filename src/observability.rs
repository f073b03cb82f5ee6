// Aggregate counters only. Per-destination detail never lands here; the
// build script rejects identity-bearing types in this module.

use std::sync::atomic::{AtomicU64, Ordering};

static PROXY_REQUESTS: AtomicU64 = AtomicU64::new(0);
static PROXY_REQUESTS_OK: AtomicU64 = AtomicU64::new(0);
static PROXY_REQUESTS_FAILED: AtomicU64 = AtomicU64::new(0);

static SOCKS_CONNECTIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static SOCKS_CONNECTIONS_REJECTED: AtomicU64 = AtomicU64::new(0);

static HTTP_REQUESTS: AtomicU64 = AtomicU64::new(0);
static HTTP_REQUESTS_REJECTED: AtomicU64 = AtomicU64::new(0);

static PROMPTS_SHOWN: AtomicU64 = AtomicU64::new(0);
static PROMPTS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn record_proxy_request() {
    PROXY_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_proxy_outcome(ok: bool) {
    if ok {
        PROXY_REQUESTS_OK.fetch_add(1, Ordering::Relaxed);
    } else {
        PROXY_REQUESTS_FAILED.fetch_add(1, Ordering::Relaxed);
    }
}

#[inline]
pub fn record_socks_connection_opened() {
    SOCKS_CONNECTIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_socks_connection_rejected() {
    SOCKS_CONNECTIONS_REJECTED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_http_request() {
    HTTP_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_http_request_rejected() {
    HTTP_REQUESTS_REJECTED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_prompt_shown() {
    PROMPTS_SHOWN.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_prompt_timed_out() {
    PROMPTS_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilitySnapshot {
    pub proxy_requests: u64,
    pub proxy_requests_ok: u64,
    pub proxy_requests_failed: u64,
    pub socks_connections_opened: u64,
    pub socks_connections_rejected: u64,
    pub http_requests: u64,
    pub http_requests_rejected: u64,
    pub prompts_shown: u64,
    pub prompts_timed_out: u64,
}

pub fn snapshot() -> ObservabilitySnapshot {
    ObservabilitySnapshot {
        proxy_requests: PROXY_REQUESTS.load(Ordering::Relaxed),
        proxy_requests_ok: PROXY_REQUESTS_OK.load(Ordering::Relaxed),
        proxy_requests_failed: PROXY_REQUESTS_FAILED.load(Ordering::Relaxed),
        socks_connections_opened: SOCKS_CONNECTIONS_OPENED.load(Ordering::Relaxed),
        socks_connections_rejected: SOCKS_CONNECTIONS_REJECTED.load(Ordering::Relaxed),
        http_requests: HTTP_REQUESTS.load(Ordering::Relaxed),
        http_requests_rejected: HTTP_REQUESTS_REJECTED.load(Ordering::Relaxed),
        prompts_shown: PROMPTS_SHOWN.load(Ordering::Relaxed),
        prompts_timed_out: PROMPTS_TIMED_OUT.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_counters_split_by_result() {
        let before = snapshot();
        record_proxy_outcome(true);
        record_proxy_outcome(false);
        record_proxy_outcome(false);
        let after = snapshot();
        assert!(after.proxy_requests_ok >= before.proxy_requests_ok + 1);
        assert!(after.proxy_requests_failed >= before.proxy_requests_failed + 2);
    }
}
