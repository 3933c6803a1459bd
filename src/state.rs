// 应用状态：所有共享组件的装配点。
use crate::api::terminal_ws::TerminalBridge;
use crate::commands::{CommandClassifier, RegexClassifier};
use crate::config::Config;
use crate::container::ContainerManager;
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::storage::{SqliteStorage, StorageBackend};
use crate::terminal::TerminalService;
use crate::user_store::UserStore;
use anyhow::Result;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
    pub users: Arc<UserStore>,
    pub manager: Arc<ContainerManager>,
    pub terminal: Arc<TerminalService>,
    pub bridge: Arc<TerminalBridge>,
    pub classifier: Arc<dyn CommandClassifier>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: Config) -> Result<SharedState> {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new());
        Self::with_runtime(config, runtime)
    }

    /// Runtime injection seam; tests swap in a fake engine here.
    pub fn with_runtime(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Result<SharedState> {
        let storage: Arc<dyn StorageBackend> =
            Arc::new(SqliteStorage::new(config.storage.db_path.clone()));
        storage.ensure_initialized()?;

        let users = Arc::new(UserStore::new(storage.clone()));
        users.bootstrap_admin()?;

        let manager = Arc::new(ContainerManager::new(
            config.container.clone(),
            storage.clone(),
            runtime,
        ));
        let terminal = Arc::new(TerminalService::new(
            config.terminal.clone(),
            manager.clone(),
            storage.clone(),
        ));
        let bridge = Arc::new(TerminalBridge::new());
        let classifier: Arc<dyn CommandClassifier> = Arc::new(RegexClassifier::new());

        Ok(Arc::new(Self {
            config,
            storage,
            users,
            manager,
            terminal,
            bridge,
            classifier,
        }))
    }
}
