//! Docker-backed sandbox using the bollard API.
//!
//! Each command gets a fresh container with the worktree bind-mounted
//! read-write at `/workspace`, the allowlisted environment, no network by
//! default, and resource limits from the sandbox settings. Timeouts kill the
//! container; shutdown kills every container still alive.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::config::SandboxSettings;
use crate::error::SandboxError;
use crate::sandbox::{Sandbox, SandboxRequest, SandboxResult};

const CPU_PERIOD: i64 = 100_000;

/// Sandbox that runs each command in a disposable container.
pub struct DockerSandbox {
    docker: Docker,
    settings: SandboxSettings,
    live: Mutex<HashSet<String>>,
    counter: AtomicU64,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon.
    pub fn connect(settings: SandboxSettings) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Unavailable(format!("cannot connect to daemon: {e}")))?;
        Ok(Self {
            docker,
            settings,
            live: Mutex::new(HashSet::new()),
            counter: AtomicU64::new(0),
        })
    }

    fn next_name(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("aurelia-sbx-{}-{n}", std::process::id())
    }

    fn host_config(&self, request: &SandboxRequest) -> HostConfig {
        HostConfig {
            binds: Some(vec![format!(
                "{}:/workspace:rw",
                request.worktree.display()
            )]),
            memory: parse_memory(&self.settings.memory_limit),
            cpu_period: Some(CPU_PERIOD),
            cpu_quota: Some((self.settings.cpu_limit * CPU_PERIOD as f64) as i64),
            network_mode: Some(if self.settings.network {
                "bridge".to_string()
            } else {
                "none".to_string()
            }),
            ..Default::default()
        }
    }

    async fn collect_logs(&self, id: &str) -> (String, String) {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container = id, error = %e, "error reading container logs");
                    break;
                }
            }
        }
        (stdout, stderr)
    }

    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            warn!(container = id, error = %e, "failed to remove container");
        }
        self.live.lock().expect("live set lock poisoned").remove(id);
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(&self, request: SandboxRequest) -> Result<SandboxResult, SandboxError> {
        let name = self.next_name();
        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = Config {
            image: Some(self.settings.image.clone()),
            cmd: Some(request.argv.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: Some("/workspace".to_string()),
            host_config: Some(self.host_config(&request)),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::Launch(format!("create container: {e}")))?;
        let id = created.id;
        self.live
            .lock()
            .expect("live set lock poisoned")
            .insert(id.clone());

        debug!(container = %id, argv = ?request.argv, "starting sandbox container");
        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&id).await;
            return Err(SandboxError::Launch(format!("start container: {e}")));
        }

        let wait = async {
            let options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut stream = self.docker.wait_container(&id, Some(options));
            match stream.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                Some(Err(e)) => Err(SandboxError::Launch(format!("wait container: {e}"))),
                None => Ok(-1),
            }
        };

        let (exit_code, timed_out) = match tokio::time::timeout(request.timeout, wait).await {
            Ok(Ok(code)) => (code, false),
            Ok(Err(e)) => {
                self.remove(&id).await;
                return Err(e);
            }
            Err(_) => {
                warn!(container = %id, timeout = ?request.timeout, "sandbox timed out; killing container");
                let _ = self
                    .docker
                    .kill_container(&id, None::<KillContainerOptions<String>>)
                    .await;
                (-1, true)
            }
        };

        let (stdout, stderr) = self.collect_logs(&id).await;
        self.remove(&id).await;

        Ok(SandboxResult {
            exit_code,
            stdout,
            stderr,
            timed_out,
        })
    }

    async fn check(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| SandboxError::Unavailable(format!("daemon ping failed: {e}")))
    }

    async fn kill_all(&self) {
        let ids: Vec<String> = self
            .live
            .lock()
            .expect("live set lock poisoned")
            .iter()
            .cloned()
            .collect();
        for id in ids {
            warn!(container = %id, "killing live sandbox container on shutdown");
            let _ = self
                .docker
                .kill_container(&id, None::<KillContainerOptions<String>>)
                .await;
            self.remove(&id).await;
        }
    }
}

/// Parse a docker-style memory string (`2g`, `512m`, `1024`) into bytes.
fn parse_memory(raw: &str) -> Option<i64> {
    let raw = raw.trim().to_lowercase();
    if raw.is_empty() {
        return None;
    }
    let (digits, multiplier) = match raw.chars().last()? {
        'g' => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        'm' => (&raw[..raw.len() - 1], 1024 * 1024),
        'k' => (&raw[..raw.len() - 1], 1024),
        _ => (raw.as_str(), 1),
    };
    digits.parse::<i64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_strings_parse() {
        assert_eq!(parse_memory("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("64k"), Some(64 * 1024));
        assert_eq!(parse_memory("1048576"), Some(1_048_576));
        assert_eq!(parse_memory("lots"), None);
    }

    // Exercises a real Docker daemon.
    #[tokio::test]
    #[ignore]
    async fn runs_command_in_container() {
        let settings = SandboxSettings {
            image: "alpine:3".to_string(),
            ..Default::default()
        };
        let sandbox = DockerSandbox::connect(settings).expect("connect");
        sandbox.check().await.expect("daemon");

        let dir = tempfile::tempdir().expect("tempdir");
        let request = SandboxRequest::shell(
            "echo hello from sandbox",
            dir.path(),
            std::time::Duration::from_secs(30),
        );
        let result = sandbox.run(request).await.expect("run");
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello from sandbox"));
    }
}
