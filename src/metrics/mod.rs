use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// Global counters (low overhead). Coarse-grained and process-wide.
static PUBLISHED: AtomicU64 = AtomicU64::new(0);
static DELIVERED: AtomicU64 = AtomicU64::new(0);
static RETRIED: AtomicU64 = AtomicU64::new(0);
static ACKED: AtomicU64 = AtomicU64::new(0);
static DROPPED_EXPIRED: AtomicU64 = AtomicU64::new(0);
static DROPPED_RETRY_LIMIT: AtomicU64 = AtomicU64::new(0);
static DROPPED_ORPHANED: AtomicU64 = AtomicU64::new(0);
static DROPPED_SUB_Q_FULL: AtomicU64 = AtomicU64::new(0);
static FILES_RELAYED: AtomicU64 = AtomicU64::new(0);
static CONNECTIONS_CLOSED: AtomicU64 = AtomicU64::new(0);

// Broker readiness state
static READY: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn set_ready(v: bool) {
    READY.store(v, Ordering::Relaxed);
}

#[inline]
pub fn is_ready() -> bool {
    READY.load(Ordering::Relaxed)
}

#[inline]
pub fn inc_published(n: u64) {
    PUBLISHED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_delivered(n: u64) {
    DELIVERED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_retried(n: u64) {
    RETRIED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_acked(n: u64) {
    ACKED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_dropped_expired(n: u64) {
    DROPPED_EXPIRED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_dropped_retry_limit(n: u64) {
    DROPPED_RETRY_LIMIT.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_dropped_orphaned(n: u64) {
    DROPPED_ORPHANED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_dropped_sub_queue_full(n: u64) {
    DROPPED_SUB_Q_FULL.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_files_relayed(n: u64) {
    FILES_RELAYED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_connections_closed(n: u64) {
    CONNECTIONS_CLOSED.fetch_add(n, Ordering::Relaxed);
}

#[inline]
pub fn published() -> u64 {
    PUBLISHED.load(Ordering::Relaxed)
}
#[inline]
pub fn delivered() -> u64 {
    DELIVERED.load(Ordering::Relaxed)
}
#[inline]
pub fn retried() -> u64 {
    RETRIED.load(Ordering::Relaxed)
}
#[inline]
pub fn acked() -> u64 {
    ACKED.load(Ordering::Relaxed)
}
#[inline]
pub fn dropped_expired() -> u64 {
    DROPPED_EXPIRED.load(Ordering::Relaxed)
}
#[inline]
pub fn dropped_retry_limit() -> u64 {
    DROPPED_RETRY_LIMIT.load(Ordering::Relaxed)
}
#[inline]
pub fn dropped_orphaned() -> u64 {
    DROPPED_ORPHANED.load(Ordering::Relaxed)
}
#[inline]
pub fn files_relayed() -> u64 {
    FILES_RELAYED.load(Ordering::Relaxed)
}
#[inline]
pub fn connections_closed() -> u64 {
    CONNECTIONS_CLOSED.load(Ordering::Relaxed)
}

pub fn snapshot() -> String {
    // Simple text format (Prometheus-style without HELP/TYPE lines).
    format!(
        "fastport_published {}\nfastport_delivered {}\nfastport_retried {}\nfastport_acked {}\nfastport_dropped_expired {}\nfastport_dropped_retry_limit {}\nfastport_dropped_orphaned {}\nfastport_dropped_sub_queue_full {}\nfastport_files_relayed {}\nfastport_connections_closed {}\n",
        PUBLISHED.load(Ordering::Relaxed),
        DELIVERED.load(Ordering::Relaxed),
        RETRIED.load(Ordering::Relaxed),
        ACKED.load(Ordering::Relaxed),
        DROPPED_EXPIRED.load(Ordering::Relaxed),
        DROPPED_RETRY_LIMIT.load(Ordering::Relaxed),
        DROPPED_ORPHANED.load(Ordering::Relaxed),
        DROPPED_SUB_Q_FULL.load(Ordering::Relaxed),
        FILES_RELAYED.load(Ordering::Relaxed),
        CONNECTIONS_CLOSED.load(Ordering::Relaxed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_lists_every_counter() {
        let snap = snapshot();
        for name in [
            "fastport_published",
            "fastport_delivered",
            "fastport_retried",
            "fastport_acked",
            "fastport_dropped_expired",
            "fastport_dropped_retry_limit",
            "fastport_dropped_orphaned",
            "fastport_dropped_sub_queue_full",
            "fastport_files_relayed",
            "fastport_connections_closed",
        ] {
            assert!(snap.contains(name), "missing counter {name}");
        }
    }

    #[test]
    fn counters_are_monotonic() {
        let before = published();
        inc_published(2);
        assert!(published() >= before + 2);

        let before = dropped_expired();
        inc_dropped_expired(1);
        assert!(dropped_expired() > before);
    }
}
