pub mod body;
pub mod processor;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use scopeguard::defer;
use socket2::{Domain, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::READ_TIMEOUT;
use crate::error::BridgeError;
use crate::observability;
use crate::tls::TlsDialer;

/// Concurrent request processors per origin node; excess connections are
/// rejected at accept.
pub const MAX_PROCESSORS: usize = 32;

pub type NodeId = usize;

/// One per-origin forward-proxy instance inside a tree.
struct Node {
    key: String,
    host: String,
    port: u16,
    https: bool,
    listen_port: u16,
    parent: Option<NodeId>,
    stopped: Arc<AtomicBool>,
    active_processors: Arc<AtomicUsize>,
    request_count: Arc<AtomicU64>,
    /// Client sockets of in-flight processors, for teardown.
    connections: Arc<Mutex<HashMap<u64, TcpStream>>>,
}

#[derive(Clone)]
pub(crate) struct NodeInfo {
    pub host: String,
    pub port: u16,
    pub https: bool,
    pub request_count: Arc<AtomicU64>,
}

struct TreeInner {
    nodes: Vec<Node>,
    index: HashMap<String, NodeId>,
}

/// Tree of rewriting proxy listeners, one per origin, keyed
/// `scheme:host:port`. The root is created for a target origin; children
/// appear as the rewriter discovers linked origins. Nodes are held in an
/// arena with parent indices; the root's reference count owns them all.
pub struct HttpProxyTree {
    self_weak: std::sync::Weak<Self>,
    upstream: Option<(String, u16)>,
    dialer: TlsDialer,
    inner: Mutex<TreeInner>,
    cookie_names: Mutex<HashMap<String, String>>,
    http_only_seen: AtomicBool,
    destroyed: AtomicBool,
    ref_count: AtomicUsize,
    next_conn_id: AtomicU64,
}

impl HttpProxyTree {
    /// Create the root node for `origin` and start its listener. The tree
    /// starts with a reference count of one.
    pub fn start(
        origin: &url::Url,
        upstream: Option<(String, u16)>,
    ) -> Result<Arc<Self>, BridgeError> {
        let tree = Arc::new_cyclic(|weak| HttpProxyTree {
            self_weak: weak.clone(),
            upstream,
            dialer: TlsDialer::new(),
            inner: Mutex::new(TreeInner {
                nodes: Vec::new(),
                index: HashMap::new(),
            }),
            cookie_names: Mutex::new(HashMap::new()),
            http_only_seen: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            ref_count: AtomicUsize::new(1),
            next_conn_id: AtomicU64::new(0),
        });

        let root = tree.create_node(origin, None)?;
        debug_assert_eq!(root, 0);

        Ok(tree)
    }

    pub fn root_port(&self) -> u16 {
        let inner = self.inner.lock().unwrap();
        inner.nodes[0].listen_port
    }

    pub fn root_key(&self) -> String {
        let inner = self.inner.lock().unwrap();
        inner.nodes[0].key.clone()
    }

    pub fn inc_ref(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one reference; at zero the whole tree is destroyed. Returns the
    /// remaining count.
    pub fn dec_ref(&self) -> usize {
        let remaining = self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.destroy();
        }
        remaining
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Whether any accepted `Set-Cookie` in this tree carried `HttpOnly`.
    pub fn http_only_cookie_seen(&self) -> bool {
        self.http_only_seen.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_http_only_seen(&self) {
        self.http_only_seen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn upstream(&self) -> Option<(String, u16)> {
        self.upstream.clone()
    }

    pub(crate) fn dialer(&self) -> &TlsDialer {
        &self.dialer
    }

    pub(crate) fn node_info(&self, id: NodeId) -> NodeInfo {
        let inner = self.inner.lock().unwrap();
        let node = &inner.nodes[id];
        NodeInfo {
            host: node.host.clone(),
            port: node.port,
            https: node.https,
            request_count: Arc::clone(&node.request_count),
        }
    }

    /// Record a cookie name seen in an accepted `Set-Cookie`.
    pub(crate) fn add_set_cookie_name(&self, name: &str, value: &str) {
        self.cookie_names
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    pub(crate) fn has_set_cookie_name(&self, name: &str) -> bool {
        self.cookie_names.lock().unwrap().contains_key(name)
    }

    /// Find or create the node for an absolute URL, returning its local
    /// listener port. With `existing_only`, creation is limited to origins
    /// sharing the root's second-level domain; unrelated origins only
    /// resolve when a node already exists.
    pub(crate) fn get_child(
        &self,
        url_str: &str,
        existing_only: bool,
    ) -> Result<Option<u16>, BridgeError> {
        let lower = url_str.to_ascii_lowercase();
        if !lower.starts_with("http://") && !lower.starts_with("https://") {
            return Ok(None);
        }

        let parsed = match url::Url::parse(url_str) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(None),
        };

        let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
            return Ok(None);
        };
        let https = parsed.scheme().eq_ignore_ascii_case("https");
        let port = parsed
            .port()
            .unwrap_or(if https { 443 } else { 80 });

        let key = origin_key(https, &host, port);

        if self.is_destroyed() {
            return Err(BridgeError::Rewrite("proxy tree destroyed".into()));
        }

        {
            let inner = self.inner.lock().unwrap();
            if let Some(&id) = inner.index.get(&key) {
                return Ok(Some(inner.nodes[id].listen_port));
            }
        }

        let mut optional = existing_only;
        if optional {
            let root_host = {
                let inner = self.inner.lock().unwrap();
                inner.nodes[0].host.clone()
            };
            // Origins under the root's own second-level domain are created
            // freely even outside form/meta contexts.
            if second_level_domain(&host) == second_level_domain(&root_host) {
                optional = false;
            }
        }

        if optional {
            return Ok(None);
        }

        let child = self.create_node(&parsed, Some(0))?;
        let inner = self.inner.lock().unwrap();
        Ok(Some(inner.nodes[child].listen_port))
    }

    fn create_node(&self, origin: &url::Url, parent: Option<NodeId>) -> Result<NodeId, BridgeError> {
        let Some(host) = origin.host_str().map(str::to_ascii_lowercase) else {
            return Err(BridgeError::Rewrite(format!(
                "origin without a host: {}",
                origin
            )));
        };
        let https = origin.scheme().eq_ignore_ascii_case("https");
        let port = origin.port().unwrap_or(if https { 443 } else { 80 });
        let key = origin_key(https, &host, port);

        let listener = bind_reusable()?;
        let listen_port = listener.local_addr()?.port();

        let node = Node {
            key: key.clone(),
            host,
            port,
            https,
            listen_port,
            parent,
            stopped: Arc::new(AtomicBool::new(false)),
            active_processors: Arc::new(AtomicUsize::new(0)),
            request_count: Arc::new(AtomicU64::new(0)),
            connections: Arc::new(Mutex::new(HashMap::new())),
        };

        let id = {
            let mut inner = self.inner.lock().unwrap();
            if self.is_destroyed() {
                return Err(BridgeError::Rewrite("proxy tree destroyed".into()));
            }
            let id = inner.nodes.len();
            inner.index.insert(key, id);
            inner.nodes.push(node);
            id
        };

        info!(origin = %origin, listen_port, "rewrite proxy node started");

        let tree = self
            .self_weak
            .upgrade()
            .ok_or_else(|| BridgeError::Rewrite("proxy tree destroyed".into()))?;
        thread::Builder::new()
            .name(format!("http-proxy-{}", listen_port))
            .spawn(move || accept_loop(tree, id, listener))
            .map_err(BridgeError::Io)?;

        Ok(id)
    }

    /// Tear down every node and in-flight processor, root first.
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (ports, connections): (Vec<u16>, Vec<Arc<Mutex<HashMap<u64, TcpStream>>>>) = {
            let mut inner = self.inner.lock().unwrap();
            let ports = inner.nodes.iter().map(|n| n.listen_port).collect();
            let conns = inner
                .nodes
                .iter()
                .map(|n| Arc::clone(&n.connections))
                .collect();
            for node in &mut inner.nodes {
                node.stopped.store(true, Ordering::SeqCst);
            }
            (ports, conns)
        };

        // Wake each accept loop so it observes the stop flag and exits.
        for port in ports {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            let _ = TcpStream::connect_timeout(&addr, std::time::Duration::from_secs(1));
        }

        for registry in connections {
            let mut registry = registry.lock().unwrap();
            for (_, socket) in registry.drain() {
                let _ = socket.shutdown(Shutdown::Both);
            }
        }

        info!("rewrite proxy tree destroyed");
    }

    /// One status line: origin, port, request count, children in brackets.
    pub fn describe(&self) -> String {
        let inner = self.inner.lock().unwrap();

        fn describe_node(inner: &TreeInner, id: NodeId) -> String {
            let node = &inner.nodes[id];
            let children: Vec<String> = inner
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.parent == Some(id))
                .map(|(child_id, _)| describe_node(inner, child_id))
                .collect();

            format!(
                "{}{}: port={}, reqs={} [{}]",
                node.host,
                if node.https { " (https)" } else { "" },
                node.listen_port,
                node.request_count.load(Ordering::SeqCst),
                children.join(", ")
            )
        }

        if inner.nodes.is_empty() {
            "<empty>".to_string()
        } else {
            describe_node(&inner, 0)
        }
    }
}

pub(crate) fn origin_key(https: bool, host: &str, port: u16) -> String {
    format!(
        "{}:{}:{}",
        if https { "https" } else { "http" },
        host,
        port
    )
}

/// Second-level domain, `example.com` for `a.b.example.com`; hosts with
/// fewer labels pass through whole.
pub(crate) fn second_level_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        host.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

fn bind_reusable() -> Result<TcpListener, BridgeError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::LOCALHOST, 0)).into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

fn accept_loop(tree: Arc<HttpProxyTree>, id: NodeId, listener: TcpListener) {
    let (stopped, active, connections) = {
        let inner = tree.inner.lock().unwrap();
        let node = &inner.nodes[id];
        (
            Arc::clone(&node.stopped),
            Arc::clone(&node.active_processors),
            Arc::clone(&node.connections),
        )
    };

    loop {
        let (client, _) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if stopped.load(Ordering::SeqCst) || tree.is_destroyed() {
                    return;
                }
                debug!(error = %e, "proxy accept failed");
                continue;
            }
        };

        if stopped.load(Ordering::SeqCst) || tree.is_destroyed() {
            return;
        }

        if client.set_read_timeout(Some(READ_TIMEOUT)).is_err() {
            continue;
        }

        if active.load(Ordering::SeqCst) >= MAX_PROCESSORS {
            warn!("too many request processors, rejecting connection");
            observability::record_http_request_rejected();
            let _ = client.shutdown(Shutdown::Both);
            continue;
        }

        active.fetch_add(1, Ordering::SeqCst);

        let conn_id = tree.next_conn_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(handle) = client.try_clone() {
            connections.lock().unwrap().insert(conn_id, handle);
        }

        let tree_for_processor = Arc::clone(&tree);
        let active_for_processor = Arc::clone(&active);
        let connections_for_processor = Arc::clone(&connections);

        let spawned = thread::Builder::new()
            .name("http-proxy-conn".into())
            .spawn(move || {
                defer! {
                    active_for_processor.fetch_sub(1, Ordering::SeqCst);
                    connections_for_processor.lock().unwrap().remove(&conn_id);
                }
                processor::process(tree_for_processor, id, client);
            });

        if spawned.is_err() {
            active.fetch_sub(1, Ordering::SeqCst);
            connections.lock().unwrap().remove(&conn_id);
        }
    }
}
