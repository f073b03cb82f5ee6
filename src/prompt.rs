use std::sync::mpsc::{self, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::observability;

const PROMPT_WAIT: Duration = Duration::from_secs(60);
const PROVIDER_ATTACH_WAIT: Duration = Duration::from_secs(30);

/// Answer from the interaction capability.
#[derive(Debug, Clone)]
pub struct PromptResponse {
    pub accepted: bool,
    /// Pattern to persist when the user chose to remember the decision:
    /// the host itself, a `*.a.b` wildcard, or `*` for all hosts.
    pub remember: Option<String>,
}

/// Interaction capability. Implementations must never be invoked on a relay
/// I/O thread; the dispatcher keeps prompting on its own worker.
pub trait PromptProvider: Send + Sync {
    /// True when the current thread is the provider's interaction thread.
    /// Admission must not block that thread on its own prompt.
    fn is_interaction_thread(&self) -> bool;

    fn prompt_for_host(&self, reason: &str, host: &str) -> PromptResponse;
}

/// Headless provider that deterministically denies every host.
pub struct HeadlessDeny;

impl PromptProvider for HeadlessDeny {
    fn is_interaction_thread(&self) -> bool {
        false
    }

    fn prompt_for_host(&self, _reason: &str, _host: &str) -> PromptResponse {
        PromptResponse {
            accepted: false,
            remember: None,
        }
    }
}

/// Headless provider that accepts every host. Test use only.
pub struct HeadlessAllow;

impl PromptProvider for HeadlessAllow {
    fn is_interaction_thread(&self) -> bool {
        false
    }

    fn prompt_for_host(&self, _reason: &str, _host: &str) -> PromptResponse {
        PromptResponse {
            accepted: true,
            remember: None,
        }
    }
}

struct PromptJob {
    reason: String,
    host: String,
    /// Re-evaluated on the worker just before prompting; a queued prompt may
    /// have been answered by an earlier remembered decision.
    recheck: Box<dyn Fn() -> Option<bool> + Send>,
    /// Kicked before showing the prompt so the daemon warms up while the
    /// user reads the dialog.
    warm_up: Box<dyn FnOnce() + Send>,
    reply: SyncSender<PromptResponse>,
}

struct ProviderSlot {
    provider: Mutex<Option<Arc<dyn PromptProvider>>>,
    attached: Condvar,
}

/// Serialises prompts onto one worker thread and bounds how long callers
/// wait for an answer. No answer within the window means deny.
pub struct PromptDispatcher {
    slot: Arc<ProviderSlot>,
    jobs: Sender<PromptJob>,
}

impl PromptDispatcher {
    pub fn new() -> Self {
        let slot = Arc::new(ProviderSlot {
            provider: Mutex::new(None),
            attached: Condvar::new(),
        });

        let (jobs, rx) = mpsc::channel::<PromptJob>();

        let worker_slot = Arc::clone(&slot);
        std::thread::Builder::new()
            .name("prompt-dispatch".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    run_job(&worker_slot, job);
                }
            })
            .expect("spawn prompt dispatcher");

        Self { slot, jobs }
    }

    /// Attach the interactive provider once the embedding surface exists.
    pub fn attach(&self, provider: Arc<dyn PromptProvider>) {
        let mut slot = self.slot.provider.lock().unwrap();
        *slot = Some(provider);
        self.slot.attached.notify_all();
    }

    pub fn detach(&self) {
        let mut slot = self.slot.provider.lock().unwrap();
        *slot = None;
    }

    /// Ask about `host`, rechecking stored decisions on the worker and
    /// warming the daemon before the dialog shows. Deny on timeout, on a
    /// missing provider, or when invoked from the interaction thread.
    pub fn ask(
        &self,
        reason: &str,
        host: &str,
        recheck: impl Fn() -> Option<bool> + Send + 'static,
        warm_up: impl FnOnce() + Send + 'static,
    ) -> PromptResponse {
        let denied = PromptResponse {
            accepted: false,
            remember: None,
        };

        if let Some(provider) = self.slot.provider.lock().unwrap().clone() {
            if provider.is_interaction_thread() {
                warn!(host, "prompt requested from the interaction thread, denying");
                return denied;
            }
        }

        let (reply, rx) = mpsc::sync_channel(1);

        let job = PromptJob {
            reason: reason.to_string(),
            host: host.to_string(),
            recheck: Box::new(recheck),
            warm_up: Box::new(warm_up),
            reply,
        };

        if self.jobs.send(job).is_err() {
            return denied;
        }

        match rx.recv_timeout(PROMPT_WAIT) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                observability::record_prompt_timed_out();
                debug!(host, "prompt timed out, denying");
                denied
            }
        }
    }
}

impl Default for PromptDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn run_job(slot: &ProviderSlot, job: PromptJob) {
    let PromptJob {
        reason,
        host,
        recheck,
        warm_up,
        reply,
    } = job;

    let denied = PromptResponse {
        accepted: false,
        remember: None,
    };

    // A decision stored while this job sat in the queue wins.
    if let Some(accepted) = recheck() {
        let _ = reply.send(PromptResponse {
            accepted,
            remember: None,
        });
        return;
    }

    let provider = {
        let guard = slot.provider.lock().unwrap();
        let (guard, _timeout) = slot
            .attached
            .wait_timeout_while(guard, PROVIDER_ATTACH_WAIT, |p| p.is_none())
            .unwrap();
        guard.clone()
    };

    let Some(provider) = provider else {
        debug!(host = %host, "no prompt provider attached, denying");
        let _ = reply.send(denied);
        return;
    };

    // Assume the user will accept; start the daemon while the dialog is up.
    warm_up();

    observability::record_prompt_shown();

    let _ = reply.send(provider.prompt_for_host(&reason, &host));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn headless_deny_refuses() {
        let dispatcher = PromptDispatcher::new();
        dispatcher.attach(Arc::new(HeadlessDeny));

        let response = dispatcher.ask("test", "host.example", || None, || {});
        assert!(!response.accepted);
    }

    #[test]
    fn headless_allow_accepts() {
        let dispatcher = PromptDispatcher::new();
        dispatcher.attach(Arc::new(HeadlessAllow));

        let response = dispatcher.ask("test", "host.example", || None, || {});
        assert!(response.accepted);
    }

    #[test]
    fn queued_recheck_short_circuits_the_dialog() {
        struct Panicking;
        impl PromptProvider for Panicking {
            fn is_interaction_thread(&self) -> bool {
                false
            }
            fn prompt_for_host(&self, _: &str, _: &str) -> PromptResponse {
                panic!("dialog must not be shown once a decision exists");
            }
        }

        let dispatcher = PromptDispatcher::new();
        dispatcher.attach(Arc::new(Panicking));

        let response = dispatcher.ask("test", "host.example", || Some(true), || {});
        assert!(response.accepted);
    }

    #[test]
    fn interaction_thread_caller_is_denied() {
        struct AlwaysUiThread(AtomicBool);
        impl PromptProvider for AlwaysUiThread {
            fn is_interaction_thread(&self) -> bool {
                true
            }
            fn prompt_for_host(&self, _: &str, _: &str) -> PromptResponse {
                self.0.store(true, Ordering::SeqCst);
                PromptResponse {
                    accepted: true,
                    remember: None,
                }
            }
        }

        let provider = Arc::new(AlwaysUiThread(AtomicBool::new(false)));
        let dispatcher = PromptDispatcher::new();
        dispatcher.attach(provider.clone());

        let response = dispatcher.ask("test", "host.example", || None, || {});
        assert!(!response.accepted);
        assert!(!provider.0.load(Ordering::SeqCst));
    }
}
