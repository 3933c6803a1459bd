// 容器生命周期管理：每用户至多一个活跃会话，落库状态为唯一权威。
use crate::config::ContainerConfig;
use crate::files;
use crate::runtime::{ContainerRuntime, ResourceLimits, RuntimeError};
use crate::storage::{ContainerSessionRecord, SessionStatus, StorageBackend};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("user already has an active container")]
    AlreadyHasActiveContainer,
    #[error("session not found")]
    SessionNotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("container creation failed: {0}")]
    CreationFailed(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct ContainerManager {
    config: ContainerConfig,
    storage: Arc<dyn StorageBackend>,
    runtime: Arc<dyn ContainerRuntime>,
    /// Engine unreachable at startup; cleared on the first successful ping.
    degraded: AtomicBool,
    /// Per-user creation locks close the concurrent double-create race.
    create_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Runtime-tracked live containers, session id -> engine handle.
    /// Rebuilt empty on restart; storage stays the source of truth.
    live: DashMap<String, String>,
}

impl ContainerManager {
    pub fn new(
        config: ContainerConfig,
        storage: Arc<dyn StorageBackend>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            config,
            storage,
            runtime,
            degraded: AtomicBool::new(false),
            create_locks: DashMap::new(),
            live: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// 启动自检：引擎不可达时降级启动，可达时回收孤儿容器。
    pub async fn startup(&self) {
        match self.runtime.ping().await {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                if let Err(err) = self.runtime.ensure_network(&self.config.install_network).await {
                    warn!("安装网络初始化失败: {err}");
                }
                if let Err(err) = self.reap_orphans().await {
                    warn!("孤儿容器回收失败: {err}");
                }
            }
            Err(err) => {
                self.degraded.store(true, Ordering::SeqCst);
                warn!("容器引擎不可用，降级启动: {err}");
            }
        }
    }

    async fn ensure_engine(&self) -> Result<(), ContainerError> {
        if !self.degraded.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Degraded mode retries the ping so the engine coming back does
        // not require a process restart.
        match self.runtime.ping().await {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => Err(ContainerError::Runtime(err)),
        }
    }

    /// Creates the session row first, then the container; any failure
    /// moves the row to `error` and best-effort releases the container.
    pub async fn create(
        &self,
        user_id: &str,
        project_id: Option<String>,
        initial_files: Vec<(String, Vec<u8>)>,
    ) -> Result<ContainerSessionRecord, ContainerError> {
        self.ensure_engine().await?;

        let lock = self
            .create_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.storage.get_active_session(user_id)? {
            info!(user = %user_id, session = %existing.session_id, "已有活跃容器，拒绝重复创建");
            return Err(ContainerError::AlreadyHasActiveContainer);
        }

        let session_id = format!("cbx_{}", Uuid::new_v4().simple());
        let suffix: String = session_id.chars().rev().take(8).collect();
        let name = format!("{}-{}-{}", self.config.name_prefix, user_id, suffix);
        let now = now_ts();
        let record = ContainerSessionRecord {
            session_id: session_id.clone(),
            user_id: user_id.to_string(),
            project_id,
            container_id: None,
            status: SessionStatus::Creating.as_str().to_string(),
            image: self.config.image.clone(),
            cpu_limit: self.config.cpu_limit,
            memory_limit_mb: self.config.memory_limit_mb as i64,
            env_json: "{}".to_string(),
            created_at: now,
            last_activity_at: now,
            terminated_at: None,
        };
        self.storage.create_session(&record)?;

        let limits = ResourceLimits {
            cpu: self.config.cpu_limit,
            memory_mb: self.config.memory_limit_mb,
        };
        let env: HashMap<String, String> = HashMap::new();
        let handle = match self
            .runtime
            .create_container(
                &name,
                &self.config.image,
                limits,
                &self.config.workdir,
                self.config.uid,
                &env,
            )
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                self.storage
                    .update_session_status(&session_id, SessionStatus::Error)?;
                let _ = self.runtime.remove(&name, true).await;
                return Err(ContainerError::CreationFailed(err.to_string()));
            }
        };
        self.storage.set_session_container(&session_id, &handle)?;

        // Initial files are part of the creating sequence: a failed write
        // fails the whole create, same as a failed container start.
        for (path, content) in &initial_files {
            if let Err(err) =
                files::write_file(self.runtime.as_ref(), &handle, path, content).await
            {
                warn!(session = %session_id, path = %path, "初始文件写入失败: {err}");
                self.storage
                    .update_session_status(&session_id, SessionStatus::Error)?;
                self.release_container(&handle).await;
                return Err(ContainerError::CreationFailed(format!(
                    "initial file {path}: {err}"
                )));
            }
        }

        self.storage
            .update_session_status(&session_id, SessionStatus::Running)?;
        self.live.insert(session_id.clone(), handle.clone());
        info!(user = %user_id, session = %session_id, container = %handle, "容器会话已启动");

        let mut created = record;
        created.container_id = Some(handle);
        created.status = SessionStatus::Running.as_str().to_string();
        Ok(created)
    }

    /// Idempotent teardown. Engine failures are logged but never block the
    /// persisted transition to `terminated`: a leaked container is caught
    /// by the next sweep, a stuck row is not.
    pub async fn terminate(&self, session_id: &str) -> Result<bool, ContainerError> {
        let Some(record) = self.storage.get_session(session_id)? else {
            return Ok(false);
        };
        if record.status() == Some(SessionStatus::Terminated) {
            return Ok(false);
        }
        if let Some(handle) = record.container_id.as_deref() {
            self.release_container(handle).await;
        }
        self.storage.mark_terminated(session_id, now_ts())?;
        self.live.remove(session_id);
        info!(session = %session_id, "容器会话已终止");
        Ok(true)
    }

    async fn release_container(&self, handle: &str) {
        if let Err(err) = self
            .runtime
            .detach_network(handle, &self.config.install_network)
            .await
        {
            warn!(container = %handle, "终止时断网失败: {err}");
        }
        if let Err(err) = self.runtime.stop(handle, self.config.stop_grace_s).await {
            warn!(container = %handle, "容器停止失败: {err}");
        }
        if let Err(err) = self.runtime.remove(handle, true).await {
            warn!(container = %handle, "容器删除失败: {err}");
        }
    }

    /// Ownership check before any container-affecting operation.
    pub fn get_owned(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<ContainerSessionRecord, ContainerError> {
        let Some(record) = self.storage.get_session(session_id)? else {
            return Err(ContainerError::SessionNotFound);
        };
        if record.user_id != user_id {
            return Err(ContainerError::AccessDenied);
        }
        Ok(record)
    }

    /// Engine handle for a running session; the session id is the only
    /// lookup key, a miss is a hard SessionNotFound.
    pub fn running_handle(&self, session_id: &str) -> Result<String, ContainerError> {
        let Some(record) = self.storage.get_session(session_id)? else {
            return Err(ContainerError::SessionNotFound);
        };
        if record.status() != Some(SessionStatus::Running) {
            return Err(ContainerError::SessionNotFound);
        }
        record
            .container_id
            .ok_or(ContainerError::SessionNotFound)
    }

    pub fn list_sessions(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<ContainerSessionRecord>, ContainerError> {
        Ok(self.storage.list_sessions(user_id, active_only)?)
    }

    pub fn touch(&self, session_id: &str) {
        if let Err(err) = self.storage.touch_session_activity(session_id, now_ts()) {
            warn!(session = %session_id, "活跃时间更新失败: {err}");
        }
    }

    /// Network toggles are non-fatal: the container may already be in the
    /// desired state, and the caller should attempt its command anyway.
    pub async fn enable_network(&self, handle: &str) -> bool {
        if let Err(err) = self.runtime.ensure_network(&self.config.install_network).await {
            warn!(container = %handle, "安装网络创建失败: {err}");
        }
        match self
            .runtime
            .attach_network(handle, &self.config.install_network)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(container = %handle, "接入安装网络失败: {err}");
                false
            }
        }
    }

    pub async fn disable_network(&self, handle: &str) -> bool {
        match self
            .runtime
            .detach_network(handle, &self.config.install_network)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(container = %handle, "断开安装网络失败: {err}");
                false
            }
        }
    }

    /// Two-phase idle sweep: mark expired rows terminated first, then
    /// reap any still-tracked container whose row has gone terminated.
    /// The split tolerates user actions interleaving with the sweep.
    pub async fn sweep_idle(&self) -> Result<usize, ContainerError> {
        let cutoff = now_ts() - self.config.idle_timeout_s as f64;
        let idle = self.storage.list_idle_running(cutoff)?;
        let mut marked = 0usize;
        for record in idle {
            info!(session = %record.session_id, user = %record.user_id, "空闲超时，标记终止");
            self.storage.mark_terminated(&record.session_id, now_ts())?;
            marked += 1;
        }

        let tracked: Vec<(String, String)> = self
            .live
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (session_id, handle) in tracked {
            let still_active = self
                .storage
                .get_session(&session_id)?
                .and_then(|record| record.status())
                .map(|status| status.is_active())
                .unwrap_or(false);
            if !still_active {
                self.release_container(&handle).await;
                self.live.remove(&session_id);
            }
        }
        Ok(marked)
    }

    /// Terminated rows older than the retention window are purged along
    /// with their command history.
    pub fn purge_retention(&self) -> Result<usize, ContainerError> {
        let cutoff = now_ts() - self.config.retention_s as f64;
        let expired = self.storage.list_terminated_before(cutoff)?;
        let mut purged = 0usize;
        for record in expired {
            self.storage.purge_session(&record.session_id)?;
            purged += 1;
        }
        Ok(purged)
    }

    /// Startup reconciliation: the runtime map is rebuilt empty on boot,
    /// so any engine-side container without an active row is an orphan.
    async fn reap_orphans(&self) -> Result<(), ContainerError> {
        let names = self
            .runtime
            .list_containers(&format!("{}-", self.config.name_prefix))
            .await?;
        for name in names {
            let state = match self.runtime.inspect(&name).await {
                Ok(state) => state,
                Err(_) => continue,
            };
            let active = self
                .storage
                .get_session_by_container(&state.id)?
                .and_then(|record| record.status())
                .map(|status| status.is_active())
                .unwrap_or(false);
            if active {
                // Re-adopt into the runtime map so the sweep can see it.
                if let Some(record) = self.storage.get_session_by_container(&state.id)? {
                    self.live.insert(record.session_id, state.id.clone());
                }
            } else {
                info!(container = %name, "回收无主容器");
                let _ = self.runtime.remove(&name, true).await;
            }
        }
        Ok(())
    }

    /// Periodic background loop; individual iteration failures are logged
    /// and never kill the task.
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            let interval = std::time::Duration::from_secs(manager.config.sweep_interval_s.max(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = manager.sweep_idle().await {
                    error!("空闲清扫失败: {err}");
                }
                if let Err(err) = manager.purge_retention() {
                    error!("保留期清理失败: {err}");
                }
            }
        });
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
