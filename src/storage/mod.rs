// 存储模块：封装会话/命令/账号的 SQLite 持久化读写。

mod sqlite;

use anyhow::Result;

pub use sqlite::SqliteStorage;

/// Session lifecycle status. Transitions are monotonic: a terminated
/// session is never resurrected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Creating,
    Running,
    Error,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "creating" => Some(Self::Creating),
            "running" => Some(Self::Running),
            "error" => Some(Self::Error),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Non-terminal statuses count against the one-container-per-user limit.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Creating | Self::Running)
    }
}

#[derive(Debug, Clone)]
pub struct ContainerSessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub project_id: Option<String>,
    /// Engine-assigned container id, unique once assigned.
    pub container_id: Option<String>,
    pub status: String,
    pub image: String,
    pub cpu_limit: f64,
    pub memory_limit_mb: i64,
    pub env_json: String,
    pub created_at: f64,
    pub last_activity_at: f64,
    pub terminated_at: Option<f64>,
}

impl ContainerSessionRecord {
    pub fn status(&self) -> Option<SessionStatus> {
        SessionStatus::parse(&self.status)
    }
}

/// Append-only audit entry, written for interactive and one-shot commands.
#[derive(Debug, Clone)]
pub struct TerminalCommandRecord {
    pub session_id: String,
    pub command: String,
    pub working_dir: String,
    /// Present only for the synchronous exec path.
    pub exit_code: Option<i64>,
    pub output: Option<String>,
    pub created_at: f64,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct UserAccountRecord {
    pub user_id: String,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub role: String,
    pub status: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub last_login_at: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct UserTokenRecord {
    pub token: String,
    pub user_id: String,
    pub expires_at: f64,
    pub created_at: f64,
    pub last_used_at: f64,
}

/// 存储后端抽象；容器会话行是状态机的唯一权威来源。
pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> Result<()>;

    fn create_session(&self, record: &ContainerSessionRecord) -> Result<()>;
    fn get_session(&self, session_id: &str) -> Result<Option<ContainerSessionRecord>>;
    fn get_session_by_container(
        &self,
        container_id: &str,
    ) -> Result<Option<ContainerSessionRecord>>;
    fn get_active_session(&self, user_id: &str) -> Result<Option<ContainerSessionRecord>>;
    fn list_sessions(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<ContainerSessionRecord>>;
    fn set_session_container(&self, session_id: &str, container_id: &str) -> Result<()>;
    fn update_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()>;
    fn touch_session_activity(&self, session_id: &str, now_ts: f64) -> Result<()>;
    fn mark_terminated(&self, session_id: &str, now_ts: f64) -> Result<()>;
    /// Running sessions whose last activity is older than the cutoff.
    fn list_idle_running(&self, cutoff_ts: f64) -> Result<Vec<ContainerSessionRecord>>;
    fn list_terminated_before(&self, cutoff_ts: f64) -> Result<Vec<ContainerSessionRecord>>;
    fn purge_session(&self, session_id: &str) -> Result<i64>;

    fn append_command(&self, record: &TerminalCommandRecord) -> Result<()>;
    fn list_commands(&self, session_id: &str, limit: i64) -> Result<Vec<TerminalCommandRecord>>;

    fn upsert_user_account(&self, record: &UserAccountRecord) -> Result<()>;
    fn get_user_account(&self, user_id: &str) -> Result<Option<UserAccountRecord>>;
    fn get_user_account_by_username(&self, username: &str) -> Result<Option<UserAccountRecord>>;

    fn create_user_token(&self, record: &UserTokenRecord) -> Result<()>;
    fn get_user_token(&self, token: &str) -> Result<Option<UserTokenRecord>>;
    fn touch_user_token(&self, token: &str, last_used_at: f64) -> Result<()>;
    fn delete_user_token(&self, token: &str) -> Result<i64>;
}
