// SQLite 存储实现：会话状态、命令审计与账号令牌统一落库。
use crate::storage::{
    ContainerSessionRecord, SessionStatus, StorageBackend, TerminalCommandRecord,
    UserAccountRecord, UserTokenRecord,
};
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/codebox.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    pub fn now_ts() -> f64 {
        Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn map_session(row: &Row<'_>) -> rusqlite::Result<ContainerSessionRecord> {
        Ok(ContainerSessionRecord {
            session_id: row.get("session_id")?,
            user_id: row.get("user_id")?,
            project_id: row.get("project_id")?,
            container_id: row.get("container_id")?,
            status: row.get("status")?,
            image: row.get("image")?,
            cpu_limit: row.get("cpu_limit")?,
            memory_limit_mb: row.get("memory_limit_mb")?,
            env_json: row.get("env_json")?,
            created_at: row.get("created_at")?,
            last_activity_at: row.get("last_activity_at")?,
            terminated_at: row.get("terminated_at")?,
        })
    }

    fn map_command(row: &Row<'_>) -> rusqlite::Result<TerminalCommandRecord> {
        Ok(TerminalCommandRecord {
            session_id: row.get("session_id")?,
            command: row.get("command")?,
            working_dir: row.get("working_dir")?,
            exit_code: row.get("exit_code")?,
            output: row.get("output")?,
            created_at: row.get("created_at")?,
            duration_ms: row.get("duration_ms")?,
        })
    }

    fn map_user(row: &Row<'_>) -> rusqlite::Result<UserAccountRecord> {
        Ok(UserAccountRecord {
            user_id: row.get("user_id")?,
            username: row.get("username")?,
            email: row.get("email")?,
            password_hash: row.get("password_hash")?,
            role: row.get("role")?,
            status: row.get("status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            last_login_at: row.get("last_login_at")?,
        })
    }

    fn map_token(row: &Row<'_>) -> rusqlite::Result<UserTokenRecord> {
        Ok(UserTokenRecord {
            token: row.get("token")?,
            user_id: row.get("user_id")?,
            expires_at: row.get("expires_at")?,
            created_at: row.get("created_at")?,
            last_used_at: row.get("last_used_at")?,
        })
    }
}

const SESSION_COLUMNS: &str = "session_id, user_id, project_id, container_id, status, image, \
     cpu_limit, memory_limit_mb, env_json, created_at, last_activity_at, terminated_at";

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS container_sessions (
              session_id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              project_id TEXT,
              container_id TEXT UNIQUE,
              status TEXT NOT NULL,
              image TEXT NOT NULL,
              cpu_limit REAL NOT NULL,
              memory_limit_mb INTEGER NOT NULL,
              env_json TEXT NOT NULL,
              created_at REAL NOT NULL,
              last_activity_at REAL NOT NULL,
              terminated_at REAL
            );
            CREATE INDEX IF NOT EXISTS idx_container_sessions_user_status
              ON container_sessions (user_id, status);
            CREATE INDEX IF NOT EXISTS idx_container_sessions_status_activity
              ON container_sessions (status, last_activity_at);
            CREATE TABLE IF NOT EXISTS terminal_commands (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              command TEXT NOT NULL,
              working_dir TEXT NOT NULL,
              exit_code INTEGER,
              output TEXT,
              created_at REAL NOT NULL,
              duration_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_terminal_commands_session
              ON terminal_commands (session_id, id);
            CREATE TABLE IF NOT EXISTS user_accounts (
              user_id TEXT PRIMARY KEY,
              username TEXT NOT NULL UNIQUE,
              email TEXT,
              password_hash TEXT NOT NULL,
              role TEXT NOT NULL,
              status TEXT NOT NULL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              last_login_at REAL
            );
            CREATE TABLE IF NOT EXISTS user_tokens (
              token TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              expires_at REAL NOT NULL,
              created_at REAL NOT NULL,
              last_used_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_user_tokens_user
              ON user_tokens (user_id);
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn create_session(&self, record: &ContainerSessionRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            &format!(
                "INSERT INTO container_sessions ({SESSION_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                record.session_id,
                record.user_id,
                record.project_id,
                record.container_id,
                record.status,
                record.image,
                record.cpu_limit,
                record.memory_limit_mb,
                record.env_json,
                record.created_at,
                record.last_activity_at,
                record.terminated_at,
            ],
        )?;
        Ok(())
    }

    fn get_session(&self, session_id: &str) -> Result<Option<ContainerSessionRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM container_sessions WHERE session_id = ?1"),
                params![session_id],
                Self::map_session,
            )
            .optional()?;
        Ok(record)
    }

    fn get_session_by_container(
        &self,
        container_id: &str,
    ) -> Result<Option<ContainerSessionRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM container_sessions WHERE container_id = ?1"
                ),
                params![container_id],
                Self::map_session,
            )
            .optional()?;
        Ok(record)
    }

    fn get_active_session(&self, user_id: &str) -> Result<Option<ContainerSessionRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM container_sessions \
                     WHERE user_id = ?1 AND status IN ('creating', 'running') \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![user_id],
                Self::map_session,
            )
            .optional()?;
        Ok(record)
    }

    fn list_sessions(
        &self,
        user_id: &str,
        active_only: bool,
    ) -> Result<Vec<ContainerSessionRecord>> {
        let conn = self.open()?;
        let sql = if active_only {
            format!(
                "SELECT {SESSION_COLUMNS} FROM container_sessions \
                 WHERE user_id = ?1 AND status IN ('creating', 'running') \
                 ORDER BY created_at DESC"
            )
        } else {
            format!(
                "SELECT {SESSION_COLUMNS} FROM container_sessions \
                 WHERE user_id = ?1 ORDER BY created_at DESC"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id], Self::map_session)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn set_session_container(&self, session_id: &str, container_id: &str) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE container_sessions SET container_id = ?2 WHERE session_id = ?1",
            params![session_id, container_id],
        )?;
        Ok(())
    }

    fn update_session_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE container_sessions SET status = ?2 WHERE session_id = ?1",
            params![session_id, status.as_str()],
        )?;
        Ok(())
    }

    fn touch_session_activity(&self, session_id: &str, now_ts: f64) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE container_sessions SET last_activity_at = ?2 WHERE session_id = ?1",
            params![session_id, now_ts],
        )?;
        Ok(())
    }

    fn mark_terminated(&self, session_id: &str, now_ts: f64) -> Result<()> {
        // 终止是单向迁移，已终止的行保持原 terminated_at。
        let conn = self.open()?;
        conn.execute(
            "UPDATE container_sessions \
             SET status = 'terminated', terminated_at = COALESCE(terminated_at, ?2) \
             WHERE session_id = ?1",
            params![session_id, now_ts],
        )?;
        Ok(())
    }

    fn list_idle_running(&self, cutoff_ts: f64) -> Result<Vec<ContainerSessionRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM container_sessions \
             WHERE status = 'running' AND last_activity_at < ?1"
        ))?;
        let rows = stmt.query_map(params![cutoff_ts], Self::map_session)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn list_terminated_before(&self, cutoff_ts: f64) -> Result<Vec<ContainerSessionRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM container_sessions \
             WHERE status = 'terminated' AND terminated_at IS NOT NULL AND terminated_at < ?1"
        ))?;
        let rows = stmt.query_map(params![cutoff_ts], Self::map_session)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn purge_session(&self, session_id: &str) -> Result<i64> {
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM terminal_commands WHERE session_id = ?1",
            params![session_id],
        )?;
        let affected = conn.execute(
            "DELETE FROM container_sessions WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(affected as i64)
    }

    fn append_command(&self, record: &TerminalCommandRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO terminal_commands \
             (session_id, command, working_dir, exit_code, output, created_at, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.session_id,
                record.command,
                record.working_dir,
                record.exit_code,
                record.output,
                record.created_at,
                record.duration_ms,
            ],
        )?;
        Ok(())
    }

    fn list_commands(&self, session_id: &str, limit: i64) -> Result<Vec<TerminalCommandRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, command, working_dir, exit_code, output, created_at, duration_ms \
             FROM terminal_commands WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit], Self::map_command)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn upsert_user_account(&self, record: &UserAccountRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO user_accounts \
             (user_id, username, email, password_hash, role, status, created_at, updated_at, last_login_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(user_id) DO UPDATE SET \
               username = excluded.username, \
               email = excluded.email, \
               password_hash = excluded.password_hash, \
               role = excluded.role, \
               status = excluded.status, \
               updated_at = excluded.updated_at, \
               last_login_at = excluded.last_login_at",
            params![
                record.user_id,
                record.username,
                record.email,
                record.password_hash,
                record.role,
                record.status,
                record.created_at,
                record.updated_at,
                record.last_login_at,
            ],
        )?;
        Ok(())
    }

    fn get_user_account(&self, user_id: &str) -> Result<Option<UserAccountRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT user_id, username, email, password_hash, role, status, \
                 created_at, updated_at, last_login_at \
                 FROM user_accounts WHERE user_id = ?1",
                params![user_id],
                Self::map_user,
            )
            .optional()?;
        Ok(record)
    }

    fn get_user_account_by_username(&self, username: &str) -> Result<Option<UserAccountRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT user_id, username, email, password_hash, role, status, \
                 created_at, updated_at, last_login_at \
                 FROM user_accounts WHERE username = ?1",
                params![username],
                Self::map_user,
            )
            .optional()?;
        Ok(record)
    }

    fn create_user_token(&self, record: &UserTokenRecord) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO user_tokens (token, user_id, expires_at, created_at, last_used_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.token,
                record.user_id,
                record.expires_at,
                record.created_at,
                record.last_used_at,
            ],
        )?;
        Ok(())
    }

    fn get_user_token(&self, token: &str) -> Result<Option<UserTokenRecord>> {
        let conn = self.open()?;
        let record = conn
            .query_row(
                "SELECT token, user_id, expires_at, created_at, last_used_at \
                 FROM user_tokens WHERE token = ?1",
                params![token],
                Self::map_token,
            )
            .optional()?;
        Ok(record)
    }

    fn touch_user_token(&self, token: &str, last_used_at: f64) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE user_tokens SET last_used_at = ?2 WHERE token = ?1",
            params![token, last_used_at],
        )?;
        Ok(())
    }

    fn delete_user_token(&self, token: &str) -> Result<i64> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM user_tokens WHERE token = ?1", params![token])?;
        Ok(affected as i64)
    }
}
