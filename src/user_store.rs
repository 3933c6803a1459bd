use crate::storage::{StorageBackend, UserAccountRecord, UserTokenRecord};
use anyhow::{anyhow, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const DEFAULT_TOKEN_TTL_S: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub role: String,
    pub status: String,
    pub created_at: f64,
    pub last_login_at: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct UserSession {
    pub user: UserAccountRecord,
    pub token: UserTokenRecord,
}

pub struct UserStore {
    storage: Arc<dyn StorageBackend>,
}

impl UserStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    pub fn normalize_user_id(raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let mut output = String::with_capacity(trimmed.len());
        for ch in trimmed.chars() {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                output.push(ch);
            } else {
                return None;
            }
        }
        if output.is_empty() {
            None
        } else {
            Some(output)
        }
    }

    pub fn hash_password(password: &str) -> Result<String> {
        let trimmed = password.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("password is empty"));
        }
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(trimmed.as_bytes(), &salt)
            .map_err(|err| anyhow!(err.to_string()))?;
        Ok(hash.to_string())
    }

    pub fn verify_password(hash: &str, password: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.trim().as_bytes(), &parsed)
            .is_ok()
    }

    pub fn to_profile(user: &UserAccountRecord) -> UserProfile {
        UserProfile {
            id: user.user_id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
            status: user.status.clone(),
            created_at: user.created_at,
            last_login_at: user.last_login_at,
        }
    }

    pub fn get_user_by_id(&self, user_id: &str) -> Result<Option<UserAccountRecord>> {
        self.storage.get_user_account(user_id)
    }

    pub fn create_user(
        &self,
        username: &str,
        email: Option<String>,
        password: &str,
        role: &str,
    ) -> Result<UserAccountRecord> {
        let user_id =
            Self::normalize_user_id(username).ok_or_else(|| anyhow!("invalid username"))?;
        if self
            .storage
            .get_user_account_by_username(&user_id)?
            .is_some()
        {
            return Err(anyhow!("username already exists"));
        }
        let now = now_ts();
        let record = UserAccountRecord {
            user_id: user_id.clone(),
            username: user_id,
            email,
            password_hash: Self::hash_password(password)?,
            role: role.trim().to_string(),
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
            last_login_at: None,
        };
        self.storage.upsert_user_account(&record)?;
        Ok(record)
    }

    pub fn create_session_token(&self, user_id: &str) -> Result<UserTokenRecord> {
        let now = now_ts();
        let expires_at = now + DEFAULT_TOKEN_TTL_S as f64;
        let token = format!("cbt_{}", Uuid::new_v4().simple());
        let record = UserTokenRecord {
            token: token.clone(),
            user_id: user_id.to_string(),
            expires_at,
            created_at: now,
            last_used_at: now,
        };
        self.storage.create_user_token(&record)?;
        Ok(record)
    }

    /// Opaque-token lookup. Expired tokens are deleted on the way out so
    /// the table does not grow without bound.
    pub fn authenticate_token(&self, token: &str) -> Result<Option<UserAccountRecord>> {
        let Some(record) = self.storage.get_user_token(token)? else {
            return Ok(None);
        };
        let now = now_ts();
        if record.expires_at <= now {
            let _ = self.storage.delete_user_token(&record.token);
            return Ok(None);
        }
        let Some(user) = self.storage.get_user_account(&record.user_id)? else {
            return Ok(None);
        };
        if user.status.trim().to_lowercase() != "active" {
            return Ok(None);
        }
        let _ = self.storage.touch_user_token(&record.token, now);
        Ok(Some(user))
    }

    pub fn login(&self, username: &str, password: &str) -> Result<UserSession> {
        let user_id =
            Self::normalize_user_id(username).ok_or_else(|| anyhow!("invalid username"))?;
        let mut user = self
            .storage
            .get_user_account_by_username(&user_id)?
            .ok_or_else(|| anyhow!("user not found"))?;
        if user.status.trim().to_lowercase() != "active" {
            return Err(anyhow!("user disabled"));
        }
        if !Self::verify_password(&user.password_hash, password) {
            return Err(anyhow!("invalid password"));
        }
        let now = now_ts();
        user.last_login_at = Some(now);
        user.updated_at = now;
        self.storage.upsert_user_account(&user)?;
        let token = self.create_session_token(&user.user_id)?;
        Ok(UserSession { user, token })
    }

    pub fn logout(&self, token: &str) -> Result<()> {
        let _ = self.storage.delete_user_token(token)?;
        Ok(())
    }

    /// First-run bootstrap: create an admin account when the environment
    /// provides a password and no admin exists yet.
    pub fn bootstrap_admin(&self) -> Result<()> {
        let Ok(password) = std::env::var("CODEBOX_ADMIN_PASSWORD") else {
            return Ok(());
        };
        if self.storage.get_user_account_by_username("admin")?.is_some() {
            return Ok(());
        }
        self.create_user("admin", None, &password, "admin")?;
        info!("已创建初始管理员账号 admin");
        Ok(())
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
