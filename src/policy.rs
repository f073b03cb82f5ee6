use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::decisions::{DecisionSet, RememberEffect};
use crate::prompt::{PromptDispatcher, PromptProvider};
use crate::reliability::ReliabilityTracker;

/// Reserved suffix for destinations only reachable through the anonymizing
/// network; always admitted without prompting.
pub const ANONYMOUS_SERVICE_SUFFIX: &str = ".onion";

/// Alternate-network suffix handled by the filtering bridge, never by host
/// admission.
pub const ALTERNATE_NETWORK_SUFFIX: &str = ".i2p";

const OPERATOR_DOMAINS: [&str; 2] = ["biglybt.com", "vuze.com"];

type WarmUpHook = dyn Fn() + Send + Sync;

/// Host admission: rewriting rules live in [`crate::rewrite`], this type
/// answers whether a destination may be tunneled at all.
pub struct DomainPolicy {
    prompt_on_use: Arc<AtomicBool>,
    skip_operator_domains: bool,
    decisions: Arc<DecisionSet>,
    dispatcher: PromptDispatcher,
    reliability: Arc<ReliabilityTracker>,
    warm_up: Mutex<Option<Arc<WarmUpHook>>>,
}

impl DomainPolicy {
    pub fn new(
        prompt_on_use: bool,
        skip_operator_domains: bool,
        decisions: Arc<DecisionSet>,
        reliability: Arc<ReliabilityTracker>,
    ) -> Self {
        Self {
            prompt_on_use: Arc::new(AtomicBool::new(prompt_on_use)),
            skip_operator_domains,
            decisions,
            dispatcher: PromptDispatcher::new(),
            reliability,
            warm_up: Mutex::new(None),
        }
    }

    /// Hook invoked just before a prompt shows, so the daemon can warm up
    /// while the user decides.
    pub fn set_warm_up(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.warm_up.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn attach_prompt_provider(&self, provider: Arc<dyn PromptProvider>) {
        self.dispatcher.attach(provider);
    }

    pub fn detach_prompt_provider(&self) {
        self.dispatcher.detach();
    }

    pub fn reset_decisions(&self) {
        self.decisions.reset();
        self.decisions
            .log_state(self.prompt_on_use.load(Ordering::SeqCst));
    }

    pub fn prompting_enabled(&self) -> bool {
        self.prompt_on_use.load(Ordering::SeqCst)
    }

    /// Whether `host` may be routed. Consults, in order: structural sanity,
    /// the alternate-network filter, the reliability breaker, the anonymous
    /// suffix, remembered decisions and finally the prompt capability.
    pub fn is_accepted(&self, reason: &str, host: &str) -> bool {
        if !host.contains('.') {
            return false;
        }
        if host == "127.0.0.1" {
            return false;
        }

        let lc_host = host.to_ascii_lowercase();

        if lc_host.ends_with(ALTERNATE_NETWORK_SUFFIX) {
            return false;
        }

        if !self.reliability.can_connect(host) {
            return false;
        }

        if lc_host.ends_with(ANONYMOUS_SERVICE_SUFFIX) {
            return true;
        }

        match self.stored_decision(&lc_host) {
            Some(accepted) => accepted,
            None => self.prompt(reason, host),
        }
    }

    /// Stored verdict without prompting; `None` means ask.
    fn stored_decision(&self, lc_host: &str) -> Option<bool> {
        if !self.prompt_on_use.load(Ordering::SeqCst) {
            return Some(true);
        }

        if self.skip_operator_domains && is_operator_domain(lc_host) {
            return Some(true);
        }

        self.decisions.lookup(lc_host)
    }

    fn prompt(&self, reason: &str, host: &str) -> bool {
        let lc_host = host.to_ascii_lowercase();

        let decisions = Arc::clone(&self.decisions);
        let prompt_on_use = Arc::clone(&self.prompt_on_use);
        let skip_operator = self.skip_operator_domains;
        let recheck_host = lc_host.clone();

        let recheck = move || {
            if !prompt_on_use.load(Ordering::SeqCst) {
                return Some(true);
            }
            if skip_operator && is_operator_domain(&recheck_host) {
                return Some(true);
            }
            decisions.lookup(&recheck_host)
        };

        let warm_up = self.warm_up.lock().unwrap().clone();
        let warm = move || {
            if let Some(hook) = warm_up {
                (hook.as_ref())();
            }
        };

        let response = self.dispatcher.ask(reason, host, recheck, warm);

        if let Some(pattern) = &response.remember {
            let effect = self.decisions.remember(pattern, response.accepted);
            if effect == RememberEffect::DisablePrompting {
                self.prompt_on_use.store(false, Ordering::SeqCst);
            }
            self.decisions
                .log_state(self.prompt_on_use.load(Ordering::SeqCst));
        }

        response.accepted
    }
}

fn is_operator_domain(lc_host: &str) -> bool {
    OPERATOR_DOMAINS
        .iter()
        .any(|domain| lc_host == *domain || lc_host.ends_with(&format!(".{}", domain)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemoryStore;
    use crate::prompt::{HeadlessAllow, HeadlessDeny, PromptResponse};

    fn policy(prompt_on_use: bool) -> DomainPolicy {
        DomainPolicy::new(
            prompt_on_use,
            true,
            Arc::new(DecisionSet::load(Arc::new(MemoryStore::new()))),
            Arc::new(ReliabilityTracker::new()),
        )
    }

    #[test]
    fn rejects_structurally_bad_hosts() {
        let policy = policy(false);
        assert!(!policy.is_accepted("test", "localhost"));
        assert!(!policy.is_accepted("test", "127.0.0.1"));
    }

    #[test]
    fn rejects_alternate_network_suffix() {
        let policy = policy(false);
        assert!(!policy.is_accepted("test", "destination.i2p"));
    }

    #[test]
    fn accepts_anonymous_suffix_without_prompt() {
        let policy = policy(true);
        policy.attach_prompt_provider(Arc::new(HeadlessDeny));
        assert!(policy.is_accepted("test", "abcdefghijklmnop.onion"));
    }

    #[test]
    fn prompting_disabled_accepts_everything_sane() {
        let policy = policy(false);
        assert!(policy.is_accepted("test", "anything.example.com"));
    }

    #[test]
    fn operator_domains_skip_the_prompt() {
        let policy = policy(true);
        policy.attach_prompt_provider(Arc::new(HeadlessDeny));
        assert!(policy.is_accepted("test", "version.biglybt.com"));
    }

    #[test]
    fn prompt_outcome_is_followed() {
        let allowing = policy(true);
        allowing.attach_prompt_provider(Arc::new(HeadlessAllow));
        assert!(allowing.is_accepted("test", "site.example.com"));

        let denying = policy(true);
        denying.attach_prompt_provider(Arc::new(HeadlessDeny));
        assert!(!denying.is_accepted("test", "site.example.com"));
    }

    #[test]
    fn remembered_accept_all_disables_prompting() {
        struct RememberAll;
        impl PromptProvider for RememberAll {
            fn is_interaction_thread(&self) -> bool {
                false
            }
            fn prompt_for_host(&self, _: &str, _: &str) -> PromptResponse {
                PromptResponse {
                    accepted: true,
                    remember: Some("*".into()),
                }
            }
        }

        let policy = policy(true);
        policy.attach_prompt_provider(Arc::new(RememberAll));

        assert!(policy.is_accepted("test", "site.example.com"));
        assert!(!policy.prompting_enabled());
        // Subsequent hosts no longer prompt.
        policy.detach_prompt_provider();
        assert!(policy.is_accepted("test", "other.example.com"));
    }

    #[test]
    fn reliability_gate_blocks_failing_hosts() {
        let reliability = Arc::new(ReliabilityTracker::new());
        let policy = DomainPolicy::new(
            false,
            true,
            Arc::new(DecisionSet::load(Arc::new(MemoryStore::new()))),
            Arc::clone(&reliability),
        );

        for _ in 0..5 {
            reliability.record_outcome("flaky.example.com", false);
        }

        assert!(!policy.is_accepted("test", "flaky.example.com"));
    }
}
