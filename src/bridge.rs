use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{
    BridgeConfig, DaemonMode, CONTROL_PORT_DEFAULT, HEALTH_CHECK_PERIOD, SOCKS_PORT_DEFAULT,
};
use crate::daemon_config::DaemonConfigSync;
use crate::decisions::DecisionSet;
use crate::error::BridgeError;
use crate::http_proxy::HttpProxyTree;
use crate::kvstore::KeyValueStore;
use crate::observability;
use crate::policy::{DomainPolicy, ALTERNATE_NETWORK_SUFFIX};
use crate::ports::allocate_port;
use crate::prompt::PromptProvider;
use crate::reliability::ReliabilityTracker;
use crate::rewrite::DomainRewriteRules;
use crate::socks::{BridgeMode, SocksBridge, SocksRoute, UpstreamRouter};
use crate::supervisor::ProcessSupervisor;
use crate::vaddr::{ProxyHandle, ProxyRegistry, VirtualAddrTable, VirtualTarget, ENTRY_STALE_AFTER};

const FILTERING_PORT_KEY: &str = "filtering.proxy.port";
const ENDPOINT_WAIT: Duration = Duration::from_secs(30);

/// Everything a caller needs to route one destination: where to dial SOCKS,
/// what to ask it for, and the handle to report the outcome against.
#[derive(Debug, Clone)]
pub struct ProxyLease {
    pub handle: ProxyHandle,
    pub socks_host: String,
    pub socks_port: u16,
    /// What to request through the SOCKS endpoint: a virtual address when
    /// the destination is being hidden from local resolution, otherwise the
    /// (possibly rewritten) destination itself.
    pub connect_host: String,
    /// Real host to present in Host headers and TLS when `connect_host` is
    /// a virtual address.
    pub host_header: Option<String>,
}

/// SOCKS endpoints exposed to embedding callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteringConfig {
    pub socks_host: String,
    pub socks_port: u16,
    pub alt_host: Option<String>,
    pub alt_port: Option<u16>,
}

/// Top-level coordinator: admission, the supervised daemon, virtual-address
/// bridging and the rewriting HTTP proxy roots.
pub struct TorBridge {
    self_weak: Weak<Self>,

    config: BridgeConfig,
    internal_socks_port: u16,

    store: Arc<dyn KeyValueStore>,
    reliability: Arc<ReliabilityTracker>,
    policy: Arc<DomainPolicy>,
    rewrites: Arc<DomainRewriteRules>,

    supervisor: Option<Arc<ProcessSupervisor>>,
    config_sync: Option<Arc<DaemonConfigSync>>,

    vaddrs: Arc<VirtualAddrTable>,
    registry: Arc<ProxyRegistry>,

    socks_bridge: Mutex<Option<Arc<SocksBridge>>>,
    filtering_bridge: Mutex<Option<Arc<SocksBridge>>>,
    filtering_alt: Mutex<Option<(String, u16)>>,

    http_roots: Mutex<HashMap<String, Arc<HttpProxyTree>>>,

    unloaded: AtomicBool,
    last_stats: Mutex<String>,
}

impl TorBridge {
    pub fn start(
        config: BridgeConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Arc<Self>, BridgeError> {
        config.validate()?;

        let internal_socks_port = if config.socks_port != 0 {
            config.socks_port
        } else {
            allocate_port(SOCKS_PORT_DEFAULT)
        };
        let internal_control_port = if config.control_port != 0 {
            config.control_port
        } else {
            allocate_port(CONTROL_PORT_DEFAULT)
        };

        let rewrites = Arc::new(DomainRewriteRules::new());
        rewrites.reload(&config.domain_rewrites);

        let reliability = Arc::new(ReliabilityTracker::new());
        let decisions = Arc::new(DecisionSet::load(Arc::clone(&store)));
        let policy = Arc::new(DomainPolicy::new(
            config.prompt.prompt_on_use,
            config.prompt.skip_operator_domains,
            decisions,
            Arc::clone(&reliability),
        ));

        let (supervisor, config_sync) = if config.is_external() {
            (None, None)
        } else {
            fs::create_dir_all(config.data_dir())?;
            fs::create_dir_all(config.services_dir())?;

            let config_sync = Arc::new(DaemonConfigSync::new(
                config.config_file(),
                config.data_dir(),
                config.services_dir(),
                internal_socks_port,
                internal_control_port,
                config.services_enabled,
            ));

            let supervisor = ProcessSupervisor::new(
                config.daemon_dir.clone(),
                config.daemon_binary.clone(),
                config.data_dir(),
                internal_control_port,
                internal_socks_port,
                config.debug_daemon,
                config.lifecycle,
                config.services_enabled,
                Arc::clone(&config_sync),
            );

            supervisor.take_over_existing_daemon();

            (Some(supervisor), Some(config_sync))
        };

        let bridge = Arc::new_cyclic(|weak| TorBridge {
            self_weak: weak.clone(),
            config,
            internal_socks_port,
            store,
            reliability,
            policy,
            rewrites,
            supervisor,
            config_sync,
            vaddrs: Arc::new(VirtualAddrTable::new()),
            registry: Arc::new(ProxyRegistry::new()),
            socks_bridge: Mutex::new(None),
            filtering_bridge: Mutex::new(None),
            filtering_alt: Mutex::new(None),
            http_roots: Mutex::new(HashMap::new()),
            unloaded: AtomicBool::new(false),
            last_stats: Mutex::new(String::new()),
        });

        if let Some(supervisor) = &bridge.supervisor {
            let warm = Arc::downgrade(supervisor);
            bridge.policy.set_warm_up(move || {
                if let Some(supervisor) = warm.upgrade() {
                    supervisor.prepare_connection("about to prompt");
                }
            });

            let always_on =
                !bridge.config.lifecycle.start_on_demand || bridge.config.services_enabled;
            if bridge.config.enabled && always_on {
                supervisor.prepare_connection("startup");
            }
        }

        spawn_health_task(Arc::downgrade(&bridge));

        info!(
            enabled = bridge.config.enabled,
            external = bridge.config.is_external(),
            socks_port = internal_socks_port,
            "bridge started"
        );

        Ok(bridge)
    }

    pub fn attach_prompt_provider(&self, provider: Arc<dyn PromptProvider>) {
        self.policy.attach_prompt_provider(provider);
    }

    pub fn reset_prompt_decisions(&self) {
        self.policy.reset_decisions();
    }

    /// The SOCKS endpoint traffic ultimately leaves through: the supervised
    /// daemon's listener (connecting it on demand) or the external one.
    pub fn active_socks_endpoint(&self, max_wait: Duration) -> Option<(String, u16)> {
        match &self.config.mode {
            DaemonMode::External { socks_host, socks_port } => {
                Some((socks_host.clone(), *socks_port))
            }
            DaemonMode::Supervised => {
                let supervisor = self.supervisor.as_ref()?;
                let session = supervisor.ensure_connected(max_wait, false)?;
                Some(("127.0.0.1".to_string(), session.socks_port()))
            }
        }
    }

    /// Admit `host` and lease a virtualized route for it: the caller dials
    /// the returned local SOCKS endpoint with the virtual address, keeping
    /// the real name out of local resolution.
    pub fn proxy_for_url(&self, reason: &str, host: &str) -> Option<ProxyLease> {
        self.lease_url(reason, host, false)
    }

    /// Same as [`TorBridge::proxy_for_url`] but skipping admission; used by
    /// the operator-initiated self-test.
    pub(crate) fn proxy_for_url_forced(&self, host: &str) -> Option<ProxyLease> {
        self.lease_url("self-test", host, true)
    }

    fn lease_url(&self, reason: &str, host: &str, force: bool) -> Option<ProxyLease> {
        if !force && !self.admit(reason, host) {
            return None;
        }
        if force && (!self.config.enabled || self.unloaded.load(Ordering::SeqCst)) {
            return None;
        }

        let (socks_host, socks_port) = self.active_socks_endpoint(ENDPOINT_WAIT)?;

        let bridge = match self.ensure_socks_bridge() {
            Ok(bridge) => bridge,
            Err(e) => {
                warn!(error = %e, "SOCKS bridge unavailable");
                return None;
            }
        };

        let virtual_addr = self.vaddrs.mint(VirtualTarget {
            host: host.to_string(),
            socks_host,
            socks_port,
        });

        let handle = self.registry.register(host.to_string(), Some(virtual_addr));

        self.touch();
        observability::record_proxy_request();

        Some(ProxyLease {
            handle,
            socks_host: "127.0.0.1".to_string(),
            socks_port: bridge.port(),
            connect_host: virtual_addr.to_string(),
            host_header: Some(self.rewrites.rewrite(host, false)),
        })
    }

    /// Admit `host` and lease the plain upstream route for callers that can
    /// carry hostnames through SOCKS themselves.
    pub fn proxy_for_port(&self, reason: &str, host: &str) -> Option<ProxyLease> {
        if !self.admit(reason, host) {
            return None;
        }

        let (socks_host, socks_port) = self.active_socks_endpoint(ENDPOINT_WAIT)?;

        let handle = self.registry.register(host.to_string(), None);

        self.touch();
        observability::record_proxy_request();

        Some(ProxyLease {
            handle,
            socks_host,
            socks_port,
            connect_host: self.rewrites.rewrite(host, true),
            host_header: None,
        })
    }

    /// Report how a leased route worked out. Each handle resolves exactly
    /// once; the token and map entry go away with the report.
    pub fn report_outcome(&self, handle: ProxyHandle, ok: bool) {
        let Some(entry) = self.registry.complete(handle) else {
            warn!("proxy entry missing for outcome report");
            return;
        };

        observability::record_proxy_outcome(ok);
        self.reliability.record_outcome(&entry.host, ok);

        if let Some(addr) = entry.virtual_addr {
            self.vaddrs.remove(addr);
        }
    }

    fn admit(&self, reason: &str, host: &str) -> bool {
        if !self.config.enabled || self.unloaded.load(Ordering::SeqCst) {
            return false;
        }
        self.policy.is_accepted(reason, host)
    }

    fn touch(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.touch();
        }
    }

    fn ensure_socks_bridge(&self) -> Result<Arc<SocksBridge>, BridgeError> {
        let mut guard = self.socks_bridge.lock().unwrap();

        if let Some(bridge) = guard.as_ref() {
            return Ok(Arc::clone(bridge));
        }

        if self.unloaded.load(Ordering::SeqCst) {
            return Err(BridgeError::Capacity("bridge unloaded"));
        }

        let router: Arc<dyn UpstreamRouter> = Arc::new(BridgeRouter {
            bridge: self.self_weak.clone(),
        });
        let bridge = SocksBridge::start(0, BridgeMode::Direct, router)?;

        *guard = Some(Arc::clone(&bridge));
        Ok(bridge)
    }

    /// Create (or re-reference) the rewriting proxy root for `origin`.
    /// Returns the root's local listener port.
    pub fn create_http_proxy(
        &self,
        reason: &str,
        origin: &url::Url,
    ) -> Result<Option<u16>, BridgeError> {
        let Some(host) = origin.host_str() else {
            return Err(BridgeError::Config(format!("origin without host: {}", origin)));
        };

        if !self.admit(reason, host) {
            return Ok(None);
        }

        self.touch();

        let upstream = self
            .active_socks_endpoint(ENDPOINT_WAIT)
            .ok_or_else(|| BridgeError::UpstreamDial("no SOCKS endpoint available".into()))?;

        let https = origin.scheme().eq_ignore_ascii_case("https");
        let port = origin.port().unwrap_or(if https { 443 } else { 80 });
        let key = crate::http_proxy::origin_key(https, &host.to_ascii_lowercase(), port);

        let mut roots = self.http_roots.lock().unwrap();

        if let Some(tree) = roots.get(&key) {
            tree.inc_ref();
            return Ok(Some(tree.root_port()));
        }

        let tree = HttpProxyTree::start(origin, Some(upstream))?;
        let root_port = tree.root_port();

        info!(proxy = %tree.describe(), "created rewrite proxy");
        roots.insert(key, tree);

        Ok(Some(root_port))
    }

    /// Release one reference on the proxy root listening on `port`,
    /// destroying the whole tree when the count reaches zero.
    pub fn destroy_http_proxy(&self, port: u16) {
        self.touch();

        let mut roots = self.http_roots.lock().unwrap();

        let Some((key, tree)) = roots
            .iter()
            .find(|(_, tree)| tree.root_port() == port)
            .map(|(key, tree)| (key.clone(), Arc::clone(tree)))
        else {
            return;
        };

        if tree.dec_ref() == 0 {
            roots.remove(&key);
        }
    }

    /// Non-blocking activation: true when a session is already live, and a
    /// background connect is kicked otherwise.
    pub fn request_activation(&self) -> bool {
        if self.config.is_external() {
            return true;
        }

        let Some(supervisor) = &self.supervisor else {
            return false;
        };

        if supervisor.is_connected() {
            self.touch();
            return true;
        }

        supervisor.ensure_connected(Duration::from_secs(5), true);
        false
    }

    /// Endpoints for embedding callers, including the filtering bridge when
    /// one runs.
    pub fn filtering_config(&self) -> FilteringConfig {
        let alt = self.filtering_alt.lock().unwrap().clone();
        let filtering = self.filtering_bridge.lock().unwrap();

        let (socks_host, socks_port) = if let Some(bridge) = filtering.as_ref() {
            ("127.0.0.1".to_string(), bridge.port())
        } else {
            match &self.config.mode {
                DaemonMode::External { socks_host, socks_port } => {
                    (socks_host.clone(), *socks_port)
                }
                DaemonMode::Supervised => ("127.0.0.1".to_string(), self.internal_socks_port),
            }
        };

        FilteringConfig {
            socks_host,
            socks_port,
            alt_host: alt.as_ref().map(|(host, _)| host.clone()),
            alt_port: alt.map(|(_, port)| port),
        }
    }

    /// Register the alternate-network SOCKS endpoint and lazily start the
    /// filtering bridge, reusing its previously persisted port when that
    /// port still binds.
    pub fn set_filtering_endpoint(
        &self,
        alt_host: &str,
        alt_port: u16,
    ) -> Result<FilteringConfig, BridgeError> {
        *self.filtering_alt.lock().unwrap() = Some((alt_host.to_string(), alt_port));

        let mut guard = self.filtering_bridge.lock().unwrap();

        if guard.is_none() {
            let router: Arc<dyn UpstreamRouter> = Arc::new(BridgeRouter {
                bridge: self.self_weak.clone(),
            });

            let remembered_port = self
                .store
                .get(FILTERING_PORT_KEY)
                .and_then(|raw| raw.parse::<u16>().ok())
                .unwrap_or(0);

            let bridge = match SocksBridge::start(
                remembered_port,
                BridgeMode::Filtering,
                Arc::clone(&router),
            ) {
                Ok(bridge) => bridge,
                Err(_) => SocksBridge::start(0, BridgeMode::Filtering, router)?,
            };

            self.store.set(FILTERING_PORT_KEY, &bridge.port().to_string());
            info!(
                port = bridge.port(),
                alt_host, alt_port, "filtering bridge started"
            );

            *guard = Some(bridge);
        }

        drop(guard);
        Ok(self.filtering_config())
    }

    /// Provision a hidden service mapping port 80 onto `target_port`,
    /// waiting briefly for the daemon to issue its hostname. Returns the
    /// `.onion` name when available.
    pub fn provision_hidden_service(
        &self,
        service_id: &str,
        target_port: u16,
        bind_ip: Option<&str>,
    ) -> Result<Option<String>, BridgeError> {
        let Some(config_sync) = &self.config_sync else {
            return Ok(None);
        };

        let was_current = config_sync.ensure_service_descriptor(service_id, target_port, bind_ip)?;

        if !self.config.services_enabled {
            return Ok(None);
        }

        if was_current {
            if let Some(host) = config_sync.read_service_hostname(service_id) {
                return Ok(Some(host));
            }
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(15);

        loop {
            if let Some(host) = config_sync.read_service_hostname(service_id) {
                return Ok(Some(host));
            }

            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }

            if let Some(supervisor) = &self.supervisor {
                supervisor.health_check(!self.http_roots.lock().unwrap().is_empty());
            }

            thread::sleep(Duration::from_secs(1));
        }
    }

    /// Periodic housekeeping: stats, supervisor policy, stale-lease GC.
    fn tick(&self) {
        self.log_stats();

        if let Some(supervisor) = &self.supervisor {
            let active_roots = !self.http_roots.lock().unwrap().is_empty();
            supervisor.health_check(active_roots);
        }

        for entry in self.registry.collect_stale(ENTRY_STALE_AFTER) {
            warn!(host = %entry.host, "removed orphaned proxy entry");
            if let Some(addr) = entry.virtual_addr {
                self.vaddrs.remove(addr);
            }
        }
    }

    fn log_stats(&self) {
        let snapshot = observability::snapshot();
        let roots = self.http_roots.lock().unwrap();

        if snapshot.proxy_requests == 0 && roots.is_empty() {
            return;
        }

        let mut stats = format!(
            "requests={}, ok={}, failed={}",
            snapshot.proxy_requests, snapshot.proxy_requests_ok, snapshot.proxy_requests_failed
        );

        if !roots.is_empty() {
            let details: Vec<String> = roots.values().map(|tree| tree.describe()).collect();
            stats.push_str(&format!(
                "; HTTP proxies={} {{{}}}",
                roots.len(),
                details.join("} {")
            ));
        }
        drop(roots);

        let mut last = self.last_stats.lock().unwrap();
        if *last != stats {
            *last = stats.clone();
            info!(stats = %stats, "bridge activity");
        }
    }

    /// Full teardown: daemon shutdown, listeners stopped, trees destroyed.
    pub fn unload(&self) {
        if self.unloaded.swap(true, Ordering::SeqCst) {
            return;
        }

        self.policy.detach_prompt_provider();

        if let Some(supervisor) = &self.supervisor {
            supervisor.unload();
        }

        if let Some(bridge) = self.socks_bridge.lock().unwrap().take() {
            bridge.stop();
        }
        if let Some(bridge) = self.filtering_bridge.lock().unwrap().take() {
            bridge.stop();
        }

        let roots: Vec<Arc<HttpProxyTree>> = {
            let mut map = self.http_roots.lock().unwrap();
            map.drain().map(|(_, tree)| tree).collect()
        };
        for tree in roots {
            while tree.dec_ref() > 0 {}
        }

        info!("bridge unloaded");
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

/// Routing glue handed to the SOCKS listeners; holds the bridge weakly so a
/// stopped bridge cannot be kept alive by its own listener.
struct BridgeRouter {
    bridge: Weak<TorBridge>,
}

impl UpstreamRouter for BridgeRouter {
    fn route_virtual(&self, addr: Ipv4Addr) -> Option<SocksRoute> {
        let bridge = self.bridge.upgrade()?;
        let target = bridge.vaddrs.resolve(addr)?;

        Some(SocksRoute {
            upstream_host: target.socks_host,
            upstream_port: target.socks_port,
            dest_host: bridge.rewrites.rewrite(&target.host, true),
        })
    }

    fn route_hostname(&self, host: &str) -> Result<SocksRoute, BridgeError> {
        let bridge = self
            .bridge
            .upgrade()
            .ok_or_else(|| BridgeError::UpstreamDial("bridge stopped".into()))?;

        if host.to_ascii_lowercase().ends_with(ALTERNATE_NETWORK_SUFFIX) {
            let alt = bridge.filtering_alt.lock().unwrap().clone();
            let (alt_host, alt_port) = alt.ok_or_else(|| {
                BridgeError::UpstreamDial("alternate-network proxy not configured".into())
            })?;

            return Ok(SocksRoute {
                upstream_host: alt_host,
                upstream_port: alt_port,
                dest_host: host.to_string(),
            });
        }

        let (upstream_host, upstream_port) = bridge
            .active_socks_endpoint(ENDPOINT_WAIT)
            .ok_or_else(|| BridgeError::UpstreamDial("no SOCKS endpoint available".into()))?;

        Ok(SocksRoute {
            upstream_host,
            upstream_port,
            dest_host: host.to_string(),
        })
    }
}

fn spawn_health_task(bridge: Weak<TorBridge>) {
    thread::Builder::new()
        .name("bridge-health".into())
        .spawn(move || loop {
            thread::sleep(HEALTH_CHECK_PERIOD);

            let Some(bridge) = bridge.upgrade() else {
                return;
            };
            if bridge.unloaded.load(Ordering::SeqCst) {
                return;
            }

            bridge.tick();
        })
        .ok();
}
