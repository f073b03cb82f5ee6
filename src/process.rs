use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use tracing::{debug, info, warn};

use crate::error::BridgeError;

/// Launch the daemon with the given config file, binding its lifetime to
/// this process id so an unexpected controller death takes the daemon down
/// with it. Stdout and stderr are drained into the log.
pub fn start_daemon(
    daemon_dir: &Path,
    binary_name: &str,
    config_file_name: &str,
    mirror_stdout: bool,
) -> Result<Child, BridgeError> {
    let binary = daemon_dir.join(binary_name);

    if !binary.exists() {
        return Err(BridgeError::Process(format!(
            "daemon binary missing: {}",
            binary.display()
        )));
    }

    info!(binary = %binary.display(), "starting daemon");

    let mut command = Command::new(&binary);
    command
        .current_dir(daemon_dir)
        .arg("-f")
        .arg(config_file_name)
        .arg("__OwningControllerProcess")
        .arg(std::process::id().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    set_library_path(&mut command, daemon_dir);

    let mut child = command
        .spawn()
        .map_err(|e| BridgeError::Process(format!("daemon start failed: {}", e)))?;

    if let Some(stdout) = child.stdout.take() {
        thread::Builder::new()
            .name("daemon-stdout".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    match line {
                        Ok(line) => {
                            if mirror_stdout {
                                debug!(target: "daemon", "> {}", line);
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .ok();
    }

    if let Some(stderr) = child.stderr.take() {
        thread::Builder::new()
            .name("daemon-stderr".into())
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => warn!(target: "daemon", "* {}", line),
                        Err(_) => break,
                    }
                }
            })
            .ok();
    }

    info!("daemon started");

    Ok(child)
}

/// The bundled daemon resolves its shared libraries from its own directory.
fn set_library_path(command: &mut Command, daemon_dir: &Path) {
    if cfg!(target_os = "macos") {
        command.env("DYLD_LIBRARY_PATH", daemon_dir);
    } else if cfg!(target_os = "linux") {
        command.env("LD_LIBRARY_PATH", daemon_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_a_process_error() {
        let dir = tempfile::tempdir().unwrap();

        let result = start_daemon(dir.path(), "no-such-daemon", "config.txt", false);
        match result {
            Err(BridgeError::Process(msg)) => assert!(msg.contains("missing")),
            other => panic!("expected process error, got {:?}", other.map(|_| ())),
        }
    }
}
