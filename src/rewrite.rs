use std::collections::HashMap;
use std::sync::RwLock;

use lazy_static::lazy_static;
use tracing::warn;

lazy_static! {
    /// Operator-domain onion aliases, consulted before the configured rules
    /// when onion rewriting is requested.
    static ref ONION_ALIASES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("version.biglybt.com", "7zq2rhfhvgcv7pkt.onion");
        map.insert("plugins.biglybt.com", "ezhdqq3jjpsqg65l.onion");
        map
    };
}

/// Suffix-based hostname rewriting. Lookup walks the host's suffixes from
/// most specific to least specific and reattaches any stripped prefix.
#[derive(Default)]
pub struct DomainRewriteRules {
    rules: RwLock<HashMap<String, String>>,
}

impl DomainRewriteRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rule set from `from=to` lines. Both sides must carry a
    /// dot; anything else is logged and skipped.
    pub fn reload(&self, lines: &[String]) {
        let mut rules = HashMap::new();

        for raw in lines {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let Some((from, to)) = line.split_once('=') else {
                warn!(line, "invalid domain rewrite entry");
                continue;
            };

            let from = from.trim();
            let to = to.trim();

            if !from.contains('.') || !to.contains('.') {
                warn!(line, "invalid domain rewrite entry");
                continue;
            }

            rules.insert(from.to_string(), to.to_string());
        }

        *self.rules.write().unwrap() = rules;
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().unwrap().is_empty()
    }

    /// Rewrite `host` through the alias table (when `onions` is set) and the
    /// longest-matching configured suffix. Unmatched hosts pass through.
    pub fn rewrite(&self, host: &str, onions: bool) -> String {
        if onions {
            if let Some(alias) = ONION_ALIASES.get(host) {
                return (*alias).to_string();
            }
        }

        let labels: Vec<&str> = host.split('.').collect();
        let rules = self.rules.read().unwrap();

        for start in 0..labels.len() {
            let suffix = labels[start..].join(".");

            if let Some(target) = rules.get(&suffix) {
                if start == 0 {
                    return target.clone();
                }
                let prefix = labels[..start].join(".");
                return format!("{}.{}", prefix, target);
            }
        }

        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(entries: &[&str]) -> DomainRewriteRules {
        let rules = DomainRewriteRules::new();
        rules.reload(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        rules
    }

    #[test]
    fn most_specific_suffix_wins() {
        let rules = rules(&["b.com=x.net", "a.b.com=y.net"]);

        assert_eq!(rules.rewrite("sub.a.b.com", false), "sub.y.net");
        assert_eq!(rules.rewrite("sub.b.com", false), "sub.x.net");
        assert_eq!(rules.rewrite("a.b.com", false), "y.net");
    }

    #[test]
    fn unmatched_hosts_pass_through() {
        let rules = rules(&["b.com=x.net"]);
        assert_eq!(rules.rewrite("example.org", false), "example.org");
    }

    #[test]
    fn invalid_lines_are_skipped() {
        let rules = rules(&["nodot=x.net", "b.com=nodot", "ok.com=fine.net", "garbage"]);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rewrite("ok.com", false), "fine.net");
    }

    #[test]
    fn onion_aliases_apply_only_when_requested() {
        let rules = rules(&[]);
        assert_eq!(
            rules.rewrite("version.biglybt.com", true),
            "7zq2rhfhvgcv7pkt.onion"
        );
        assert_eq!(
            rules.rewrite("version.biglybt.com", false),
            "version.biglybt.com"
        );
    }
}
