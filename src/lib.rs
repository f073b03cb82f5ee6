pub mod bridge;
pub mod config;
pub mod control;
pub mod daemon_config;
pub mod decisions;
pub mod error;
pub mod http_proxy;
pub mod kvstore;
pub mod observability;
pub mod policy;
pub mod ports;
pub mod process;
pub mod prompt;
pub mod relay;
pub mod reliability;
pub mod rewrite;
pub mod selftest;
pub mod socks;
pub mod socks_client;
pub mod supervisor;
pub mod tls;
pub mod vaddr;

pub use bridge::{ProxyLease, TorBridge};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use vaddr::ProxyHandle;
