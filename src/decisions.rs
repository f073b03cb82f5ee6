use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::kvstore::KeyValueStore;

const STORE_KEY: &str = "prompt.decisions";

/// What remembering a pattern did beyond storing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RememberEffect {
    Stored,
    /// The user accepted `*`: prompting is to be disabled globally and the
    /// stored set was cleared. Distinct from the `^*` deny-everything entry.
    DisablePrompting,
}

struct Inner {
    entries: BTreeSet<String>,
    last_logged: String,
}

/// Persisted allow/deny decisions.
///
/// Entry forms: `host`, `^host`, `*.a.b`, `^*.a.b` and the global `^*`.
pub struct DecisionSet {
    store: Arc<dyn KeyValueStore>,
    inner: Mutex<Inner>,
}

impl DecisionSet {
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let mut entries = BTreeSet::new();

        if let Some(raw) = store.get(STORE_KEY) {
            for bit in raw.split(',') {
                let bit = bit.trim();
                if !bit.is_empty() {
                    entries.insert(bit.to_string());
                }
            }
        }

        Self {
            store,
            inner: Mutex::new(Inner {
                entries,
                last_logged: String::new(),
            }),
        }
    }

    /// Stored verdict for `host`: `Some(true)` allow, `Some(false)` deny,
    /// `None` when nothing matches and the caller should prompt.
    pub fn lookup(&self, host: &str) -> Option<bool> {
        let inner = self.inner.lock().unwrap();
        let entries = &inner.entries;

        if entries.contains("^*") {
            return Some(false);
        }
        if entries.contains(host) {
            return Some(true);
        }
        if entries.contains(&format!("^{}", host)) {
            return Some(false);
        }

        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() > 2 {
            let wild = format!("*.{}.{}", labels[labels.len() - 2], labels[labels.len() - 1]);

            if entries.contains(&wild) {
                return Some(true);
            }
            if entries.contains(&format!("^{}", wild)) {
                return Some(false);
            }
        }

        None
    }

    /// Store a remembered decision. A wildcard insert removes the narrower
    /// entries it covers.
    pub fn remember(&self, pattern: &str, accepted: bool) -> RememberEffect {
        let mut inner = self.inner.lock().unwrap();

        if pattern == "*" {
            inner.entries.clear();

            if accepted {
                self.persist(&inner.entries);
                return RememberEffect::DisablePrompting;
            }

            inner.entries.insert("^*".to_string());
            self.persist(&inner.entries);
            return RememberEffect::Stored;
        }

        if let Some(term) = pattern.strip_prefix('*') {
            let covered: Vec<String> = inner
                .entries
                .iter()
                .filter(|entry| entry.ends_with(term))
                .cloned()
                .collect();
            for entry in covered {
                inner.entries.remove(&entry);
            }
        }

        let entry = if accepted {
            pattern.to_string()
        } else {
            format!("^{}", pattern)
        };
        inner.entries.insert(entry);

        self.persist(&inner.entries);
        RememberEffect::Stored
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.entries.is_empty() {
            inner.entries.clear();
            self.persist(&inner.entries);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    /// Log the decision state, but only when it changed since the last log.
    pub fn log_state(&self, prompting_enabled: bool) {
        let mut inner = self.inner.lock().unwrap();

        let state = if prompting_enabled {
            let entries: Vec<&String> = inner.entries.iter().collect();
            format!("{:?}", entries)
        } else {
            "disabled".to_string()
        };

        if inner.last_logged != state {
            inner.last_logged = state.clone();
            info!(decisions = %state, "prompt decisions");
        }
    }

    fn persist(&self, entries: &BTreeSet<String>) {
        let joined = entries.iter().cloned().collect::<Vec<_>>().join(",");
        self.store.set(STORE_KEY, &joined);
    }
}
