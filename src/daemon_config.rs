use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::error::BridgeError;

/// Keeps the daemon's on-disk config in step with what the supervisor
/// requires: listener ports, cookie auth, data directory and any provisioned
/// hidden-service blocks. Synchronization is idempotent; a rewrite is only
/// performed when the file diverges.
pub struct DaemonConfigSync {
    config_file: PathBuf,
    data_dir: PathBuf,
    services_dir: PathBuf,
    socks_port: u16,
    control_port: u16,
    services_enabled: bool,
    needs_checking: AtomicBool,
}

impl DaemonConfigSync {
    pub fn new(
        config_file: PathBuf,
        data_dir: PathBuf,
        services_dir: PathBuf,
        socks_port: u16,
        control_port: u16,
        services_enabled: bool,
    ) -> Self {
        Self {
            config_file,
            data_dir,
            services_dir,
            socks_port,
            control_port,
            services_enabled,
            needs_checking: AtomicBool::new(true),
        }
    }

    /// Flag the config for re-checking before the next daemon start; a live
    /// session is closed for reload by the health task when this is set.
    pub fn mark_dirty(&self) {
        self.needs_checking.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.needs_checking.load(Ordering::SeqCst)
    }

    /// Diff the file against the required directives and rewrite on
    /// divergence. Returns whether a write happened.
    pub fn sync(&self) -> Result<bool, BridgeError> {
        self.needs_checking.store(false, Ordering::SeqCst);

        let required = self.required_lines();
        let required_hs = self.required_hidden_service_lines();

        let keys: BTreeSet<&str> = required
            .iter()
            .filter_map(|line| line.split_whitespace().next())
            .collect();

        let mut write_config = false;
        let mut config_lines: Vec<String> = Vec::new();
        let mut missing: Vec<String> = required.clone();
        let mut found_hs: BTreeSet<String> = BTreeSet::new();

        match fs::read_to_string(&self.config_file) {
            Ok(existing) => {
                for raw in existing.lines() {
                    let line = raw.trim();

                    if line.starts_with("HiddenService") {
                        found_hs.insert(line.to_string());
                        continue;
                    }

                    let mut keep = true;

                    if let Some(pos) = missing.iter().position(|l| l == line) {
                        missing.remove(pos);
                    } else if let Some(key) = line.split_whitespace().next() {
                        // A required directive with a stale value is dropped
                        // in favour of the required line.
                        if keys.contains(key) {
                            keep = false;
                        }
                    }

                    if keep {
                        config_lines.push(line.to_string());
                    }
                }

                if !missing.is_empty() {
                    config_lines.append(&mut missing);
                    write_config = true;
                }

                if required_hs != found_hs {
                    write_config = true;
                }
            }
            Err(_) => {
                config_lines = required;
                write_config = true;
            }
        }

        if write_config {
            let mut out = String::new();
            for line in config_lines.iter().chain(required_hs.iter()) {
                out.push_str(line);
                out.push('\n');
            }

            fs::write(&self.config_file, out)?;
            info!(file = %self.config_file.display(), "daemon config rewritten");
        }

        Ok(write_config)
    }

    fn required_lines(&self) -> Vec<String> {
        let data_dir_name = self
            .data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());

        vec![
            format!("SocksPort 127.0.0.1:{}", self.socks_port),
            format!("ControlPort 127.0.0.1:{}", self.control_port),
            "CookieAuthentication 1".to_string(),
            format!("DataDirectory .{}{}", MAIN_SEPARATOR, data_dir_name),
        ]
    }

    /// Union of the directive lines of every provisioned service file.
    fn required_hidden_service_lines(&self) -> BTreeSet<String> {
        let mut lines = BTreeSet::new();

        if !self.services_enabled {
            return lines;
        }

        let Ok(entries) = fs::read_dir(&self.services_dir) else {
            return lines;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }

            match fs::read_to_string(&path) {
                Ok(raw) => {
                    for line in raw.lines() {
                        let line = line.trim();
                        if !line.is_empty() {
                            lines.insert(line.to_string());
                        }
                    }
                }
                Err(e) => warn!(file = %path.display(), error = %e, "unreadable service file"),
            }
        }

        lines
    }

    /// Write the per-service descriptor unless it is already exactly what
    /// provisioning requires and a hostname has been issued for it. Returns
    /// whether the descriptor was already current.
    pub fn ensure_service_descriptor(
        &self,
        service_id: &str,
        target_port: u16,
        bind_ip: Option<&str>,
    ) -> Result<bool, BridgeError> {
        validate_service_id(service_id)?;

        let service_file = self.services_dir.join(format!("{}.txt", service_id));
        let bind_ip = bind_ip.unwrap_or("127.0.0.1");

        let required = [
            format!(
                "HiddenServiceDir .{sep}services{sep}{id}",
                sep = MAIN_SEPARATOR,
                id = service_id
            ),
            format!("HiddenServicePort 80 {}:{}", bind_ip, target_port),
        ];

        let mut current = false;

        if let Ok(existing) = fs::read_to_string(&service_file) {
            let lines: Vec<&str> = existing.lines().map(str::trim).collect();
            current = lines.len() == 2 && lines[0] == required[0] && lines[1] == required[1];
        }

        if current && self.read_service_hostname(service_id).is_none() {
            current = false;
        }

        if !current {
            fs::create_dir_all(&self.services_dir)?;
            fs::write(&service_file, format!("{}\n{}\n", required[0], required[1]))?;
            self.mark_dirty();
        }

        Ok(current)
    }

    /// Hostname the daemon wrote back for a provisioned service, if any.
    pub fn read_service_hostname(&self, service_id: &str) -> Option<String> {
        let host_file = self.services_dir.join(service_id).join("hostname");

        let raw = fs::read_to_string(host_file).ok()?;
        let host = raw.trim();

        if host.ends_with(".onion") {
            Some(host.to_string())
        } else {
            None
        }
    }

    pub fn services_dir(&self) -> &Path {
        &self.services_dir
    }
}

fn validate_service_id(service_id: &str) -> Result<(), BridgeError> {
    let ok = !service_id.is_empty()
        && service_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if ok {
        Ok(())
    } else {
        Err(BridgeError::Config(format!(
            "invalid service id: {:?}",
            service_id
        )))
    }
}
