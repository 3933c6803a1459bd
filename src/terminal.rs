// 终端服务：会话 -> PTY 映射、命令审计、安装命令的临时联网与完成轮询。
use crate::commands;
use crate::config::TerminalConfig;
use crate::container::{ContainerError, ContainerManager};
use crate::pty::PtySession;
use crate::runtime::ExecOutput;
use crate::storage::{StorageBackend, TerminalCommandRecord};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

struct TerminalEntry {
    pty: Arc<PtySession>,
    container_handle: String,
    /// Best-effort cwd hint derived from observed `cd` lines. UI only.
    cwd: Mutex<String>,
}

pub struct TerminalService {
    config: TerminalConfig,
    manager: Arc<ContainerManager>,
    storage: Arc<dyn StorageBackend>,
    sessions: DashMap<String, Arc<TerminalEntry>>,
}

impl TerminalService {
    pub fn new(
        config: TerminalConfig,
        manager: Arc<ContainerManager>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            config,
            manager,
            storage,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Attaches a PTY to the session's running container. Returns the
    /// output receiver on a fresh spawn, None when already attached (at
    /// most one PTY per session; a reconnect resumes the existing one).
    pub fn open(
        &self,
        session_id: &str,
    ) -> Result<Option<mpsc::Receiver<String>>, ContainerError> {
        if self.sessions.contains_key(session_id) {
            return Ok(None);
        }
        let handle = self.manager.running_handle(session_id)?;
        let argv = self.manager.runtime().shell_argv(&handle);
        let (pty, output_rx) = PtySession::spawn(session_id, &argv)
            .map_err(|err| ContainerError::CreationFailed(err.to_string()))?;
        let workdir = self.manager.config().workdir.clone();
        let entry = Arc::new(TerminalEntry {
            pty,
            container_handle: handle,
            cwd: Mutex::new(workdir),
        });
        self.sessions.insert(session_id.to_string(), entry);
        info!(session = %session_id, "终端会话已挂载");
        Ok(Some(output_rx))
    }

    fn entry(&self, session_id: &str) -> Result<Arc<TerminalEntry>, ContainerError> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.clone())
            .ok_or(ContainerError::SessionNotFound)
    }

    pub fn container_handle(&self, session_id: &str) -> Result<String, ContainerError> {
        Ok(self.entry(session_id)?.container_handle.clone())
    }

    pub fn current_dir(&self, session_id: &str) -> String {
        self.sessions
            .get(session_id)
            .map(|entry| entry.cwd.lock().clone())
            .unwrap_or_else(|| self.manager.config().workdir.clone())
    }

    /// Applies a completed line to the cwd hint; returns the new cwd if
    /// the line was a `cd`.
    pub fn track_cwd(&self, session_id: &str, line: &str) -> Option<String> {
        let entry = self.sessions.get(session_id)?;
        let workdir = self.manager.config().workdir.clone();
        let current = entry.cwd.lock().clone();
        let updated = commands::apply_cd(&current, line, &workdir)?;
        *entry.cwd.lock() = updated.clone();
        Some(updated)
    }

    /// Raw keystroke path: bytes go straight to the PTY, which echoes.
    pub fn send_raw_input(&self, session_id: &str, bytes: &[u8]) -> Result<bool, ContainerError> {
        let entry = self.entry(session_id)?;
        Ok(entry.pty.send_input(bytes))
    }

    /// Full-command path: audit entry, guaranteed trailing newline,
    /// forward to the PTY, bump last-activity.
    pub fn send_command(&self, session_id: &str, command: &str) -> Result<bool, ContainerError> {
        let entry = self.entry(session_id)?;
        self.record_command(session_id, command, None, None, None);
        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        let sent = entry.pty.send_input(line.as_bytes());
        self.manager.touch(session_id);
        Ok(sent)
    }

    /// Audit entry for an interactively completed line (raw input path);
    /// the command itself already went through the PTY.
    pub fn record_command(
        &self,
        session_id: &str,
        command: &str,
        exit_code: Option<i64>,
        output: Option<String>,
        duration_ms: Option<i64>,
    ) {
        let record = TerminalCommandRecord {
            session_id: session_id.to_string(),
            command: command.trim_end_matches('\n').to_string(),
            working_dir: self.current_dir(session_id),
            exit_code,
            output,
            created_at: now_ts(),
            duration_ms,
        };
        if let Err(err) = self.storage.append_command(&record) {
            warn!(session = %session_id, "命令审计写入失败: {err}");
        }
    }

    /// One-shot exec path for callers that need a deterministic result
    /// instead of a live stream.
    pub async fn execute_sync(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<ExecOutput, ContainerError> {
        let handle = self.manager.running_handle(session_id)?;
        let started = Instant::now();
        let output = self
            .manager
            .runtime()
            .exec(
                &handle,
                &["sh".to_string(), "-c".to_string(), command.to_string()],
                None,
            )
            .await?;
        let duration_ms = started.elapsed().as_millis() as i64;
        self.record_command(
            session_id,
            command,
            Some(output.exit_code),
            Some(output.combined()),
            Some(duration_ms),
        );
        self.manager.touch(session_id);
        Ok(output)
    }

    /// Polls the installer's process count inside the container until it
    /// reaches zero. Returns true when completion was observed, false when
    /// the hard ceiling or the fallback wait decided instead. The caller
    /// must disable the network afterwards on every path.
    pub async fn wait_install_complete(&self, session_id: &str, base: &str) -> bool {
        let handle = match self.container_handle(session_id) {
            Ok(handle) => handle,
            Err(_) => return false,
        };
        let runtime = self.manager.runtime();
        let deadline = Instant::now() + Duration::from_secs(self.config.install_max_wait_s);
        let poll = Duration::from_secs(self.config.install_poll_interval_s.max(1));

        // Initial grace so a just-forked installer is visible to pgrep.
        tokio::time::sleep(Duration::from_secs(self.config.install_initial_delay_s)).await;

        loop {
            if Instant::now() >= deadline {
                warn!(session = %session_id, base = %base, "安装监控达到时间上限，强制结束");
                return false;
            }
            let probe = runtime
                .exec(
                    &handle,
                    &[
                        "sh".to_string(),
                        "-c".to_string(),
                        format!("pgrep -c {base}"),
                    ],
                    None,
                )
                .await;
            match probe {
                Ok(output) => {
                    let count = output
                        .stdout
                        .trim()
                        .parse::<u64>()
                        .unwrap_or(if output.exit_code != 0 { 0 } else { 1 });
                    if count == 0 {
                        info!(session = %session_id, base = %base, "安装进程已退出");
                        return true;
                    }
                }
                Err(err) => {
                    // Monitoring failure degrades to one fixed wait
                    // instead of hanging or leaving the network open.
                    warn!(session = %session_id, "安装监控失败，退化为固定等待: {err}");
                    tokio::time::sleep(Duration::from_secs(
                        self.config.install_fallback_wait_s,
                    ))
                    .await;
                    return false;
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn enable_network(&self, session_id: &str) -> bool {
        match self.container_handle(session_id) {
            Ok(handle) => self.manager.enable_network(&handle).await,
            Err(_) => false,
        }
    }

    pub async fn disable_network(&self, session_id: &str) -> bool {
        match self.container_handle(session_id) {
            Ok(handle) => self.manager.disable_network(&handle).await,
            Err(_) => false,
        }
    }

    /// Tears down the PTY only; the container keeps running. Used when the
    /// reconnect grace expires — a later attach gets a fresh PTY.
    pub fn close_pty(&self, session_id: &str) {
        if let Some((_, entry)) = self.sessions.remove(session_id) {
            entry.pty.close();
            info!(session = %session_id, "终端会话已卸载");
        }
    }

    /// Full teardown: PTY plus the persisted session.
    pub async fn close_session(&self, session_id: &str) -> Result<bool, ContainerError> {
        self.close_pty(session_id);
        self.manager.terminate(session_id).await
    }

    /// Closes every attached PTY; called at process shutdown.
    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close_pty(&id);
        }
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
