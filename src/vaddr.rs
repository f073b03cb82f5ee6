use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

/// How long an unreported proxy handle (and its token) may linger before
/// the housekeeping pass reclaims it.
pub const ENTRY_STALE_AFTER: Duration = Duration::from_secs(600);

/// What a virtual address stands for: the real destination plus the SOCKS
/// upstream it must be reached through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualTarget {
    pub host: String,
    pub socks_host: String,
    pub socks_port: u16,
}

/// Synthetic 10.0.0.0/8 addresses standing in for real destinations, so
/// resolver-bound clients never resolve sensitive names locally.
#[derive(Default)]
pub struct VirtualAddrTable {
    entries: Mutex<HashMap<Ipv4Addr, VirtualTarget>>,
}

impl VirtualAddrTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh token bound to `target`.
    pub fn mint(&self, target: VirtualTarget) -> Ipv4Addr {
        let mut entries = self.entries.lock().unwrap();
        let mut rng = rand::thread_rng();

        loop {
            let raw = 0x0a00_0000u32 + rng.gen_range(0..0x00ff_ffffu32);
            let addr = Ipv4Addr::from(raw);

            if let std::collections::hash_map::Entry::Vacant(slot) = entries.entry(addr) {
                slot.insert(target);
                return addr;
            }
        }
    }

    pub fn resolve(&self, addr: Ipv4Addr) -> Option<VirtualTarget> {
        self.entries.lock().unwrap().get(&addr).cloned()
    }

    pub fn remove(&self, addr: Ipv4Addr) {
        self.entries.lock().unwrap().remove(&addr);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

/// Opaque handle returned with a proxy lease; the caller reports the
/// connection outcome against it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyHandle(u64);

#[derive(Debug, Clone)]
pub struct ProxyMapEntry {
    pub host: String,
    pub virtual_addr: Option<Ipv4Addr>,
    pub created: Instant,
}

/// Outstanding proxy leases awaiting an outcome report.
#[derive(Default)]
pub struct ProxyRegistry {
    next_handle: AtomicU64,
    entries: Mutex<HashMap<u64, ProxyMapEntry>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, host: String, virtual_addr: Option<Ipv4Addr>) -> ProxyHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);

        self.entries.lock().unwrap().insert(
            handle,
            ProxyMapEntry {
                host,
                virtual_addr,
                created: Instant::now(),
            },
        );

        ProxyHandle(handle)
    }

    /// Take the entry for an outcome report. A handle resolves at most once;
    /// a second report gets `None`.
    pub fn complete(&self, handle: ProxyHandle) -> Option<ProxyMapEntry> {
        self.entries.lock().unwrap().remove(&handle.0)
    }

    /// Drop entries older than `max_age`, returning them so the caller can
    /// release their tokens.
    pub fn collect_stale(&self, max_age: Duration) -> Vec<ProxyMapEntry> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();

        let stale: Vec<u64> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.created) > max_age)
            .map(|(handle, _)| *handle)
            .collect();

        stale
            .into_iter()
            .filter_map(|handle| entries.remove(&handle))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> VirtualTarget {
        VirtualTarget {
            host: host.to_string(),
            socks_host: "127.0.0.1".to_string(),
            socks_port: 29101,
        }
    }

    #[test]
    fn minted_addresses_live_in_ten_slash_eight() {
        let table = VirtualAddrTable::new();
        let addr = table.mint(target("dest.example.com"));
        assert_eq!(addr.octets()[0], 10);
    }

    #[test]
    fn tokens_resolve_until_removed() {
        let table = VirtualAddrTable::new();
        let addr = table.mint(target("dest.example.com"));

        assert_eq!(table.resolve(addr), Some(target("dest.example.com")));

        table.remove(addr);
        assert_eq!(table.resolve(addr), None);
    }

    #[test]
    fn handles_complete_exactly_once() {
        let registry = ProxyRegistry::new();
        let handle = registry.register("dest.example.com".into(), None);

        assert!(registry.complete(handle).is_some());
        assert!(registry.complete(handle).is_none());
    }

    #[test]
    fn stale_entries_are_collected() {
        let registry = ProxyRegistry::new();
        registry.register("old.example.com".into(), None);

        assert!(registry.collect_stale(Duration::ZERO).len() == 1);
        assert!(registry.is_empty());

        registry.register("fresh.example.com".into(), None);
        assert!(registry.collect_stale(Duration::from_secs(600)).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_mints_get_distinct_tokens() {
        let table = VirtualAddrTable::new();
        let a = table.mint(target("a.example.com"));
        let b = table.mint(target("b.example.com"));
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }
}
