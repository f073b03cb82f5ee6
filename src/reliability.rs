use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

const FAILURE_THRESHOLD: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(30 * 60);
const BACKOFF_CEILING: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_HISTORY_RECORDS: usize = 4096;

/// Per-host connect history driving the retry backoff.
#[derive(Debug, Clone, Default)]
pub struct HostReliability {
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
    total_ok: u64,
    total_fail: u64,
}

impl HostReliability {
    /// Whether a new attempt is admitted right now. An admitted check counts
    /// as an attempt and stamps the attempt time.
    fn can_connect(&mut self, now: Instant) -> bool {
        let mut ok = self.consecutive_failures < FAILURE_THRESHOLD;

        if !ok {
            let delay = backoff_delay(self.consecutive_failures);

            if let Some(last) = self.last_attempt {
                if now.duration_since(last) >= delay {
                    ok = true;
                }
            } else {
                ok = true;
            }
        }

        if ok {
            self.last_attempt = Some(now);
        }

        ok
    }

    fn record_outcome(&mut self, ok: bool) -> u32 {
        if ok {
            self.total_ok += 1;
            self.consecutive_failures = 0;
        } else {
            self.total_fail += 1;
            self.consecutive_failures += 1;
        }
        self.consecutive_failures
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.total_ok, self.total_fail)
    }
}

/// Delay before the next admitted attempt once the failure threshold is hit:
/// doubles per failure past the third, capped at a day.
fn backoff_delay(consecutive_failures: u32) -> Duration {
    let mut delay = BACKOFF_BASE;

    for _ in 3..consecutive_failures {
        delay *= 2;
        if delay >= BACKOFF_CEILING {
            return BACKOFF_CEILING;
        }
    }

    delay
}

/// Fixed-capacity map that evicts its least recently touched entry, telling
/// the eviction callback which entry went.
pub struct BoundedHistory<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    tick: u64,
    on_evict: Option<Box<dyn Fn(&K, &V) + Send>>,
}

impl<K: Eq + Hash + Clone, V> BoundedHistory<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            tick: 0,
            on_evict: None,
        }
    }

    pub fn with_eviction(mut self, on_evict: impl Fn(&K, &V) + Send + 'static) -> Self {
        self.on_evict = Some(Box::new(on_evict));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch or create the entry for `key`, refreshing its recency.
    pub fn entry_mut(&mut self, key: &K) -> &mut V
    where
        V: Default,
    {
        self.tick += 1;
        let tick = self.tick;

        if !self.entries.contains_key(key) {
            if self.entries.len() >= self.capacity {
                self.evict_oldest();
            }
            self.entries.insert(key.clone(), (V::default(), tick));
        }

        let slot = self.entries.get_mut(key).unwrap();
        slot.1 = tick;
        &mut slot.0
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(v, _)| v)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, (_, tick))| *tick)
            .map(|(k, _)| k.clone());

        if let Some(key) = oldest {
            if let Some((value, _)) = self.entries.remove(&key) {
                if let Some(cb) = &self.on_evict {
                    cb(&key, &value);
                }
            }
        }
    }
}

/// Shared per-destination circuit breaker.
pub struct ReliabilityTracker {
    inner: Mutex<BoundedHistory<String, HostReliability>>,
}

impl Default for ReliabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliabilityTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(
                BoundedHistory::new(MAX_HISTORY_RECORDS)
                    .with_eviction(|_, _: &HostReliability| {}),
            ),
        }
    }

    /// Admission check; creates the record lazily and stamps the attempt
    /// time when admitted.
    pub fn can_connect(&self, host: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.entry_mut(&host.to_string()).can_connect(Instant::now())
    }

    pub fn record_outcome(&self, host: &str, ok: bool) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.entry_mut(&host.to_string());
        let consecutive = record.record_outcome(ok);
        let (total_ok, total_fail) = record.totals();

        if !ok && consecutive > 2 {
            info!(
                host,
                consecutive, total_ok, total_fail, "repeated connect failures, backing off"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_n_times(n: u32) -> HostReliability {
        let mut record = HostReliability::default();
        for _ in 0..n {
            record.record_outcome(false);
        }
        record
    }

    #[test]
    fn admits_until_failure_threshold() {
        let mut record = failed_n_times(4);
        assert!(record.can_connect(Instant::now()));

        let mut record = failed_n_times(5);
        assert!(!record.can_connect(Instant::now()));
    }

    #[test]
    fn backoff_doubles_past_third_failure_and_caps() {
        assert_eq!(backoff_delay(5), Duration::from_secs(2 * 60 * 60));
        assert_eq!(backoff_delay(6), Duration::from_secs(4 * 60 * 60));
        assert_eq!(backoff_delay(20), Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn admits_again_once_backoff_elapsed() {
        let mut record = failed_n_times(5);
        let start = Instant::now();
        record.last_attempt = Some(start);

        // Inside the two-hour window the host stays blocked; the attempt
        // stamp must not move.
        assert!(!record.can_connect(start + Duration::from_secs(60 * 60)));
        assert_eq!(record.last_attempt, Some(start));

        assert!(record.can_connect(start + Duration::from_secs(2 * 60 * 60)));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut record = failed_n_times(7);
        record.record_outcome(true);
        assert!(record.can_connect(Instant::now()));
        assert_eq!(record.totals(), (1, 7));
    }

    #[test]
    fn bounded_history_evicts_oldest() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evicted);

        let mut map: BoundedHistory<String, u32> = BoundedHistory::new(2)
            .with_eviction(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        *map.entry_mut(&"a".to_string()) = 1;
        *map.entry_mut(&"b".to_string()) = 2;
        // Touch "a" so "b" is oldest when "c" arrives.
        let _ = map.entry_mut(&"a".to_string());
        *map.entry_mut(&"c".to_string()) = 3;

        assert_eq!(map.len(), 2);
        assert_eq!(evicted.load(Ordering::SeqCst), 1);
        assert!(map.get(&"b".to_string()).is_none());
        assert!(map.get(&"a".to_string()).is_some());
    }

    #[test]
    fn tracker_round_trip() {
        let tracker = ReliabilityTracker::new();
        assert!(tracker.can_connect("host.example"));
        for _ in 0..5 {
            tracker.record_outcome("host.example", false);
        }
        assert!(!tracker.can_connect("host.example"));
        tracker.record_outcome("host.example", true);
        assert!(tracker.can_connect("host.example"));
    }
}
