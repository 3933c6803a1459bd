// 配置读取：YAML 配置文件加环境变量覆盖，各分节均有默认值。
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_methods: Option<Vec<String>>,
    pub allow_headers: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/codebox.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    /// Container name prefix; the engine-side name is `{prefix}-{user}-{suffix}`.
    pub name_prefix: String,
    /// Fraction of one core, converted to cpu-period/cpu-quota.
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
    pub workdir: String,
    /// Non-root uid the workload runs as.
    pub uid: u32,
    /// Shared egress network attached only for package installs.
    pub install_network: String,
    pub idle_timeout_s: u64,
    pub sweep_interval_s: u64,
    /// How long terminated session rows are retained before purge.
    pub retention_s: u64,
    pub stop_grace_s: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "codebox-python:latest".to_string(),
            name_prefix: "codebox".to_string(),
            cpu_limit: 1.0,
            memory_limit_mb: 512,
            workdir: "/workspace".to_string(),
            uid: 1000,
            install_network: "codebox-install".to_string(),
            idle_timeout_s: 30 * 60,
            sweep_interval_s: 5 * 60,
            retention_s: 24 * 3600,
            stop_grace_s: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Seconds a session survives with zero attached sockets before teardown.
    pub reconnect_grace_s: u64,
    /// Delay before broadcasting a filesystem-change notification.
    pub fs_notify_delay_ms: u64,
    pub install_poll_interval_s: u64,
    pub install_initial_delay_s: u64,
    pub install_max_wait_s: u64,
    /// Fixed wait used when the completion monitor itself fails.
    pub install_fallback_wait_s: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            reconnect_grace_s: 30,
            fs_notify_delay_ms: 500,
            install_poll_interval_s: 5,
            install_initial_delay_s: 10,
            install_max_wait_s: 5 * 60,
            install_fallback_wait_s: 30,
        }
    }
}

pub fn load_config() -> Config {
    // 配置文件允许不存在，开发环境直接落默认值。
    let path = env::var("CODEBOX_CONFIG_PATH").unwrap_or_else(|_| "config/codebox.yaml".to_string());
    let content = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(_) => return Config::default(),
    };
    serde_yaml::from_str::<Config>(&content).unwrap_or_else(|err| {
        warn!("配置解析失败，使用默认配置: {err}");
        Config::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.container.workdir, "/workspace");
        assert!(config.container.idle_timeout_s > 0);
        assert!(config.terminal.reconnect_grace_s > 0);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("server:\n  port: 9001\n").unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.storage.db_path, "./data/codebox.db");
        assert_eq!(config.container.image, "codebox-python:latest");
    }
}
