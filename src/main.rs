use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tor_proxy_bridge::config::BridgeConfig;
use tor_proxy_bridge::kvstore::JsonFileStore;
use tor_proxy_bridge::selftest::run_proxy_test;
use tor_proxy_bridge::TorBridge;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;
    let mut run_test = false;

    for arg in &mut args {
        match arg.as_str() {
            "--test" => run_test = true,
            other => config_path = Some(PathBuf::from(other)),
        }
    }

    let config = match &config_path {
        Some(path) => match BridgeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => BridgeConfig::default(),
    };

    let store = Arc::new(JsonFileStore::open(config.daemon_dir.join("bridge-store.json")));

    let bridge = match TorBridge::start(config, store) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!(error = %e, "failed to start bridge");
            std::process::exit(1);
        }
    };

    if run_test {
        let test_url = bridge.config().test_url.clone();
        for line in run_proxy_test(&bridge, &test_url) {
            info!("{}", line);
        }
        bridge.unload();
        return;
    }

    info!("bridge running; interrupt to stop");

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
