use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{LifecyclePolicy, MAX_CONNECT_WAIT_TIME, MIN_RECONNECT_TIME, STOP_ON_IDLE_TIME};
use crate::control::ControlChannel;
use crate::daemon_config::DaemonConfigSync;
use crate::process::start_daemon;

const CONNECT_RETRY_PAUSE: Duration = Duration::from_secs(1);

struct SupervisorState {
    session: Option<Arc<ControlChannel>>,
    connecting: bool,
    last_connect_attempt: Option<Instant>,
}

/// Owns the daemon's lifecycle: launches it, drives the control handshake,
/// rate-limits reconnects and applies the stop-on-idle policy.
///
/// Lifecycle: Idle -> Connecting -> Connected -> Closing -> Idle. Only one
/// connection attempt runs at a time; late callers join it through the
/// shared condvar instead of starting another.
pub struct ProcessSupervisor {
    self_weak: Weak<Self>,

    daemon_dir: PathBuf,
    daemon_binary: String,
    data_dir: PathBuf,
    control_port: u16,
    socks_port: u16,
    debug_daemon: bool,
    lifecycle: LifecyclePolicy,
    services_enabled: bool,

    config_sync: Arc<DaemonConfigSync>,

    state: Mutex<SupervisorState>,
    attempt_done: Condvar,
    unloaded: AtomicBool,
    last_use: Mutex<Instant>,
    attempts: AtomicU64,
}

impl ProcessSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        daemon_dir: PathBuf,
        daemon_binary: String,
        data_dir: PathBuf,
        control_port: u16,
        socks_port: u16,
        debug_daemon: bool,
        lifecycle: LifecyclePolicy,
        services_enabled: bool,
        config_sync: Arc<DaemonConfigSync>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            daemon_dir,
            daemon_binary,
            data_dir,
            control_port,
            socks_port,
            debug_daemon,
            lifecycle,
            services_enabled,
            config_sync,
            state: Mutex::new(SupervisorState {
                session: None,
                connecting: false,
                last_connect_attempt: None,
            }),
            attempt_done: Condvar::new(),
            unloaded: AtomicBool::new(false),
            last_use: Mutex::new(Instant::now()),
            attempts: AtomicU64::new(0),
        })
    }

    /// An instance left over from a previous run answers on the control
    /// port; take it down so this supervisor owns a fresh daemon.
    pub fn take_over_existing_daemon(&self) {
        if let Ok(channel) =
            ControlChannel::connect(&self.data_dir, self.control_port, self.socks_port)
        {
            info!("found an existing daemon instance, closing it");
            channel.shutdown(true);
        }
    }

    pub fn is_connected(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .session
            .as_ref()
            .map(|s| s.is_live())
            .unwrap_or(false)
    }

    pub fn is_connected_or_connecting(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.connecting
            || state
                .session
                .as_ref()
                .map(|s| s.is_live())
                .unwrap_or(false)
    }

    /// Stamp activity for the idle policy.
    pub fn touch(&self) {
        *self.last_use.lock().unwrap() = Instant::now();
    }

    /// Kick a background connect without waiting for it.
    pub fn prepare_connection(&self, reason: &str) {
        if self.is_connected_or_connecting() {
            return;
        }
        debug!(reason, "preparing daemon connection");
        self.ensure_connected(Duration::ZERO, true);
    }

    /// Return the live session, starting or joining a connection attempt as
    /// needed. In background mode this returns immediately after kicking the
    /// attempt off; otherwise it blocks up to `max_wait`.
    ///
    /// A new attempt is refused while the previous one started less than the
    /// reconnect interval ago, which bounds restart storms when the daemon
    /// keeps dying. An explicit close resets that limiter.
    pub fn ensure_connected(
        &self,
        max_wait: Duration,
        background: bool,
    ) -> Option<Arc<ControlChannel>> {
        let mut state = self.state.lock().unwrap();

        if let Some(session) = &state.session {
            if session.is_live() {
                return Some(Arc::clone(session));
            }
            state.session = None;
        }

        if self.unloaded.load(Ordering::SeqCst) {
            return None;
        }

        if !state.connecting {
            let now = Instant::now();

            if let Some(last) = state.last_connect_attempt {
                if now.duration_since(last) < MIN_RECONNECT_TIME {
                    return None;
                }
            }

            state.connecting = true;
            state.last_connect_attempt = Some(now);
            self.attempts.fetch_add(1, Ordering::SeqCst);

            let Some(me) = self.self_weak.upgrade() else {
                state.connecting = false;
                return None;
            };
            let spawned = thread::Builder::new()
                .name("daemon-connect".into())
                .spawn(move || {
                    me.run_connect_attempt();

                    let mut state = me.state.lock().unwrap();
                    state.connecting = false;
                    drop(state);
                    me.attempt_done.notify_all();
                });

            if spawned.is_err() {
                state.connecting = false;
                return None;
            }
        }

        if background {
            return None;
        }

        let deadline = Instant::now() + max_wait;
        while state.connecting {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (next, _) = self
                .attempt_done
                .wait_timeout(state, remaining)
                .unwrap();
            state = next;
        }

        state
            .session
            .as_ref()
            .filter(|s| s.is_live())
            .map(Arc::clone)
    }

    fn run_connect_attempt(&self) {
        let started = Instant::now();

        if self.config_sync.is_dirty() {
            if let Err(e) = self.config_sync.sync() {
                warn!(error = %e, "daemon config sync failed");
            }
        }

        let mut child = match start_daemon(
            &self.daemon_dir,
            &self.daemon_binary,
            "config.txt",
            self.debug_daemon,
        ) {
            Ok(child) => Some(child),
            Err(e) => {
                warn!(error = %e, "daemon start failed, abandoning attempt");
                return;
            }
        };

        debug!("waiting for daemon to initialise");

        while !self.unloaded.load(Ordering::SeqCst) {
            match ControlChannel::connect(&self.data_dir, self.control_port, self.socks_port) {
                Ok(channel) => {
                    if let Some(process) = child.take() {
                        channel.adopt_process(process);
                    }

                    let mut state = self.state.lock().unwrap();
                    state.session = Some(channel);
                    drop(state);

                    self.touch();
                    info!("daemon session established");
                    return;
                }
                Err(e) => debug!(error = %e, "daemon not answering yet"),
            }

            if started.elapsed() > MAX_CONNECT_WAIT_TIME {
                warn!("daemon failed to initialise, abandoning");
                break;
            }

            thread::sleep(CONNECT_RETRY_PAUSE);
        }

        if let Some(mut process) = child.take() {
            let _ = process.kill();
            let _ = process.wait();
        }
    }

    /// Close the active session. Explicit closes reset the reconnect rate
    /// limiter.
    pub fn close_connection(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();

        if let Some(session) = state.session.take() {
            session.close(Some(&format!("close requested: {}", reason)));
        }

        state.last_connect_attempt = None;
    }

    /// Periodic policy check: closes the session on idle or for a pending
    /// config change, reconnects when always-on mode demands it.
    pub fn health_check(&self, active_http_roots: bool) {
        if self.unloaded.load(Ordering::SeqCst) {
            self.close_connection("unloaded");
            return;
        }

        let on_demand = self.lifecycle.start_on_demand && !self.services_enabled;

        if on_demand {
            if self.lifecycle.stop_on_idle && !active_http_roots {
                let idle = self.last_use.lock().unwrap().elapsed();
                if idle > STOP_ON_IDLE_TIME && self.is_connected() {
                    self.close_connection("close on idle");
                }
            }
        } else if !self.is_connected() {
            self.prepare_connection("always-on mode");
        } else if self.config_sync.is_dirty() {
            // Next attempt re-syncs the config and restarts the daemon.
            self.close_connection("reloading configuration");
        }
    }

    /// Final teardown: graceful daemon shutdown and no further attempts.
    pub fn unload(&self) {
        self.unloaded.store(true, Ordering::SeqCst);

        let session = {
            let mut state = self.state.lock().unwrap();
            state.session.take()
        };

        if let Some(session) = session {
            session.shutdown(false);
        }
    }

    pub fn connection_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor_with_missing_daemon(dir: &std::path::Path) -> Arc<ProcessSupervisor> {
        let config_sync = Arc::new(DaemonConfigSync::new(
            dir.join("config.txt"),
            dir.join("data"),
            dir.join("services"),
            29101,
            29151,
            false,
        ));

        ProcessSupervisor::new(
            dir.to_path_buf(),
            "no-such-daemon".to_string(),
            dir.join("data"),
            29151,
            29101,
            false,
            LifecyclePolicy {
                start_on_demand: true,
                stop_on_idle: true,
            },
            false,
            config_sync,
        )
    }

    #[test]
    fn failed_attempt_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_with_missing_daemon(dir.path());

        assert!(supervisor
            .ensure_connected(Duration::from_secs(5), false)
            .is_none());
        assert_eq!(supervisor.connection_attempts(), 1);

        // Within the reconnect interval the second call is an idempotent
        // no-op: no session, no new process attempt.
        assert!(supervisor
            .ensure_connected(Duration::from_secs(5), false)
            .is_none());
        assert_eq!(supervisor.connection_attempts(), 1);
    }

    #[test]
    fn explicit_close_resets_the_limiter() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_with_missing_daemon(dir.path());

        assert!(supervisor
            .ensure_connected(Duration::from_secs(5), false)
            .is_none());
        assert_eq!(supervisor.connection_attempts(), 1);

        supervisor.close_connection("test");

        assert!(supervisor
            .ensure_connected(Duration::from_secs(5), false)
            .is_none());
        assert_eq!(supervisor.connection_attempts(), 2);
    }

    #[test]
    fn background_mode_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_with_missing_daemon(dir.path());

        let started = Instant::now();
        assert!(supervisor
            .ensure_connected(Duration::from_secs(30), true)
            .is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unloaded_supervisor_refuses_connections() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_with_missing_daemon(dir.path());

        supervisor.unload();
        assert!(supervisor
            .ensure_connected(Duration::from_secs(1), false)
            .is_none());
        assert_eq!(supervisor.connection_attempts(), 0);
    }

    #[test]
    fn first_attempt_syncs_the_daemon_config() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor_with_missing_daemon(dir.path());

        supervisor.ensure_connected(Duration::from_secs(5), false);

        // The config file was written even though the daemon itself is
        // missing; the next launch will pick it up unchanged.
        assert!(dir.path().join("config.txt").exists());
    }
}
