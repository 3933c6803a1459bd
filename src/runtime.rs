// 容器引擎适配层：通过 docker CLI 驱动容器，引擎不可用与操作失败分开上报。
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Engine unreachable (docker binary missing or daemon down). The
    /// service starts in degraded mode instead of crashing on this.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),
    #[error("container engine rejected the request: {0}")]
    Rejected(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container not running: {0}")]
    NotRunning(String),
    #[error("exec failed (exit {exit_code}): {stderr}")]
    ExecFailed { exit_code: i64, stderr: String },
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub cpu: f64,
    pub memory_mb: u64,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerState {
    /// Full engine-assigned id, regardless of which handle was queried.
    pub id: String,
    pub running: bool,
}

/// Engine seam. The lifecycle manager only talks to this trait, so tests
/// run against an in-memory fake instead of a docker daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        limits: ResourceLimits,
        workdir: &str,
        uid: u32,
        env: &HashMap<String, String>,
    ) -> Result<String, RuntimeError>;

    async fn inspect(&self, handle: &str) -> Result<ContainerState, RuntimeError>;

    async fn exec(
        &self,
        handle: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError>;

    async fn stop(&self, handle: &str, grace_secs: u64) -> Result<(), RuntimeError>;

    async fn remove(&self, handle: &str, with_volumes: bool) -> Result<(), RuntimeError>;

    async fn attach_network(&self, handle: &str, network: &str) -> Result<(), RuntimeError>;

    async fn detach_network(&self, handle: &str, network: &str) -> Result<(), RuntimeError>;

    async fn ensure_network(&self, network: &str) -> Result<(), RuntimeError>;

    /// All container names carrying the prefix, running or not. Used only
    /// by the startup orphan reconciliation.
    async fn list_containers(&self, name_prefix: &str) -> Result<Vec<String>, RuntimeError>;

    /// Argv for an interactive shell attached to the container; the PTY
    /// layer runs this under a pseudo-terminal. The default covers
    /// docker-compatible CLIs.
    fn shell_argv(&self, handle: &str) -> Vec<String> {
        vec![
            "docker".into(),
            "exec".into(),
            "-it".into(),
            handle.into(),
            "/bin/bash".into(),
        ]
    }
}

pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<ExecOutput, RuntimeError> {
        let mut cmd = Command::new("docker");
        cmd.args(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        debug!(args = ?args, "docker invoke");
        let mut child = cmd
            .spawn()
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;
        if let (Some(bytes), Some(mut handle)) = (stdin, child.stdin.take()) {
            let owned = bytes.to_vec();
            handle
                .write_all(&owned)
                .await
                .map_err(|err| RuntimeError::Rejected(err.to_string()))?;
            drop(handle);
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|err| RuntimeError::Unavailable(err.to_string()))?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1) as i64,
        })
    }

    fn classify_failure(output: &ExecOutput) -> RuntimeError {
        let stderr = output.stderr.trim().to_string();
        let lowered = stderr.to_lowercase();
        if lowered.contains("cannot connect to the docker daemon")
            || lowered.contains("docker daemon is not running")
        {
            return RuntimeError::Unavailable(stderr);
        }
        if lowered.contains("no such container") {
            return RuntimeError::NotFound(stderr);
        }
        if lowered.contains("is not running") {
            return RuntimeError::NotRunning(stderr);
        }
        RuntimeError::Rejected(stderr)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<(), RuntimeError> {
        let output = self.run(&["version", "--format", "{{.Server.Version}}"], None).await?;
        if output.exit_code != 0 {
            return Err(RuntimeError::Unavailable(output.stderr.trim().to_string()));
        }
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        limits: ResourceLimits,
        workdir: &str,
        uid: u32,
        env: &HashMap<String, String>,
    ) -> Result<String, RuntimeError> {
        // cpu 以单核占比表达，换算为 period/quota。
        let cpu_quota = (limits.cpu.max(0.05) * 100_000.0) as i64;
        let memory = format!("{}m", limits.memory_mb.max(64));
        let user = uid.to_string();
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            // 创建时不挂任何外网，安装包时再临时接入。
            "--network".into(),
            "none".into(),
            "--user".into(),
            user,
            "-w".into(),
            workdir.into(),
            "-m".into(),
            memory,
            "--cpu-period=100000".into(),
            format!("--cpu-quota={cpu_quota}"),
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(image.into());
        args.push("sleep".into());
        args.push("infinity".into());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&arg_refs, None).await?;
        if output.exit_code != 0 {
            return Err(Self::classify_failure(&output));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn inspect(&self, handle: &str) -> Result<ContainerState, RuntimeError> {
        let output = self
            .run(
                &["inspect", "-f", "{{.Id}} {{.State.Running}}", handle],
                None,
            )
            .await?;
        if output.exit_code != 0 {
            return Err(Self::classify_failure(&output));
        }
        let text = output.stdout.trim();
        let mut parts = text.split_whitespace();
        let id = parts.next().unwrap_or_default().to_string();
        let running = parts.next() == Some("true");
        Ok(ContainerState { id, running })
    }

    async fn exec(
        &self,
        handle: &str,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        let mut args: Vec<&str> = vec!["exec"];
        if stdin.is_some() {
            args.push("-i");
        }
        args.push(handle);
        for arg in argv {
            args.push(arg.as_str());
        }
        let output = self.run(&args, stdin).await?;
        if output.exit_code != 0 {
            let lowered = output.stderr.to_lowercase();
            if lowered.contains("no such container") || lowered.contains("is not running") {
                return Err(Self::classify_failure(&output));
            }
            // Non-zero exit from the command itself is a valid result; the
            // caller decides whether that is an error.
        }
        Ok(output)
    }

    async fn stop(&self, handle: &str, grace_secs: u64) -> Result<(), RuntimeError> {
        let grace = grace_secs.to_string();
        let output = self.run(&["stop", "-t", &grace, handle], None).await?;
        if output.exit_code != 0 {
            return Err(Self::classify_failure(&output));
        }
        Ok(())
    }

    async fn remove(&self, handle: &str, with_volumes: bool) -> Result<(), RuntimeError> {
        let mut args = vec!["rm", "-f"];
        if with_volumes {
            args.push("-v");
        }
        args.push(handle);
        let output = self.run(&args, None).await?;
        if output.exit_code != 0 {
            return Err(Self::classify_failure(&output));
        }
        Ok(())
    }

    async fn attach_network(&self, handle: &str, network: &str) -> Result<(), RuntimeError> {
        let output = self.run(&["network", "connect", network, handle], None).await?;
        if output.exit_code != 0 {
            // Already attached counts as success.
            if output.stderr.to_lowercase().contains("already exists") {
                return Ok(());
            }
            return Err(Self::classify_failure(&output));
        }
        Ok(())
    }

    async fn detach_network(&self, handle: &str, network: &str) -> Result<(), RuntimeError> {
        let output = self
            .run(&["network", "disconnect", network, handle], None)
            .await?;
        if output.exit_code != 0 {
            if output.stderr.to_lowercase().contains("is not connected") {
                return Ok(());
            }
            return Err(Self::classify_failure(&output));
        }
        Ok(())
    }

    async fn ensure_network(&self, network: &str) -> Result<(), RuntimeError> {
        let probe = self.run(&["network", "inspect", network], None).await?;
        if probe.exit_code == 0 {
            return Ok(());
        }
        // Bridge mode, not internal-only: installs need egress.
        let output = self
            .run(&["network", "create", "--driver", "bridge", network], None)
            .await?;
        if output.exit_code != 0 {
            if output.stderr.to_lowercase().contains("already exists") {
                return Ok(());
            }
            return Err(Self::classify_failure(&output));
        }
        Ok(())
    }

    async fn list_containers(&self, name_prefix: &str) -> Result<Vec<String>, RuntimeError> {
        let filter = format!("name={name_prefix}");
        let output = self
            .run(
                &["ps", "-a", "--filter", &filter, "--format", "{{.Names}}"],
                None,
            )
            .await?;
        if output.exit_code != 0 {
            return Err(Self::classify_failure(&output));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_output_prefers_both_streams() {
        let output = ExecOutput {
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            exit_code: 0,
        };
        assert_eq!(output.combined(), "outerr");
        let only_err = ExecOutput {
            stdout: String::new(),
            stderr: "boom".to_string(),
            exit_code: 1,
        };
        assert_eq!(only_err.combined(), "boom");
    }

    #[test]
    fn failure_classification_maps_daemon_and_container_errors() {
        let daemon = ExecOutput {
            stdout: String::new(),
            stderr: "Cannot connect to the Docker daemon at unix:///var/run/docker.sock".into(),
            exit_code: 1,
        };
        assert!(matches!(
            DockerCli::classify_failure(&daemon),
            RuntimeError::Unavailable(_)
        ));

        let missing = ExecOutput {
            stdout: String::new(),
            stderr: "Error: No such container: codebox-u1".into(),
            exit_code: 1,
        };
        assert!(matches!(
            DockerCli::classify_failure(&missing),
            RuntimeError::NotFound(_)
        ));

        let stopped = ExecOutput {
            stdout: String::new(),
            stderr: "container abc is not running".into(),
            exit_code: 1,
        };
        assert!(matches!(
            DockerCli::classify_failure(&stopped),
            RuntimeError::NotRunning(_)
        ));
    }
}
