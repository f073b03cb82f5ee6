use std::sync::Arc;
use std::time::Duration;

use crate::bridge::TorBridge;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);
const BODY_PREVIEW: usize = 1024;

/// Operator-facing connectivity test: fetch the configured URL through the
/// full admission, virtual-address and SOCKS path, and return a readable
/// line summary. The outcome feeds the reliability tracker like any other
/// proxied request.
pub fn run_proxy_test(bridge: &Arc<TorBridge>, test_url: &str) -> Vec<String> {
    let mut lines = Vec::new();

    let parsed = match url::Url::parse(test_url) {
        Ok(parsed) => parsed,
        Err(e) => {
            lines.push(format!("Invalid test URL {:?}: {}", test_url, e));
            return lines;
        }
    };

    let Some(host) = parsed.host_str().map(str::to_string) else {
        lines.push(format!("Test URL has no host: {}", test_url));
        return lines;
    };

    let Some(lease) = bridge.proxy_for_url_forced(&host) else {
        lines.push("Failed to set up proxy (no daemon session?)".to_string());
        return lines;
    };

    lines.push(format!(
        "Testing connection via SOCKS proxy on {}:{}",
        lease.socks_host, lease.socks_port
    ));

    let mut fetch_url = parsed.clone();
    let _ = fetch_url.set_host(Some(&lease.connect_host));

    let result = fetch(&lease.socks_host, lease.socks_port, &fetch_url, lease.host_header.as_deref());

    let ok = match result {
        Ok(summary) => {
            lines.extend(summary);
            true
        }
        Err(e) => {
            lines.push(format!("Test failed: {}", e));
            false
        }
    };

    bridge.report_outcome(lease.handle, ok);

    lines
}

fn fetch(
    socks_host: &str,
    socks_port: u16,
    url: &url::Url,
    host_header: Option<&str>,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let proxy = reqwest::Proxy::all(format!("socks5h://{}:{}", socks_host, socks_port))?;

    let client = reqwest::blocking::Client::builder()
        .proxy(proxy)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(TEST_TIMEOUT)
        .timeout(TEST_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .build()?;

    let mut request = client.get(url.as_str());
    if let Some(host) = host_header {
        request = request.header(reqwest::header::HOST, host);
    }

    let response = request.send()?;

    let mut lines = vec![format!(
        "Connection succeeded, response={}/{}",
        response.status().as_u16(),
        response.status().canonical_reason().unwrap_or("")
    )];

    lines.push(format!("Headers: {:?}", response.headers()));

    let body = response.text().unwrap_or_default();
    let preview: String = body.chars().take(BODY_PREVIEW).collect();
    lines.push("Start of response:".to_string());
    lines.push(preview);

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, DaemonMode};
    use crate::kvstore::MemoryStore;

    #[test]
    fn invalid_url_reports_without_leasing() {
        let mut config = BridgeConfig::default();
        config.mode = DaemonMode::External {
            socks_host: "127.0.0.1".into(),
            socks_port: 9050,
        };
        config.prompt.prompt_on_use = false;

        let bridge = TorBridge::start(config, Arc::new(MemoryStore::new())).unwrap();

        let lines = run_proxy_test(&bridge, "not a url");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Invalid test URL"));

        bridge.unload();
    }
}
