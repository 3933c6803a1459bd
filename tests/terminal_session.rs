use async_trait::async_trait;
use codebox_server::config::{ContainerConfig, TerminalConfig};
use codebox_server::container::ContainerManager;
use codebox_server::runtime::{
    ContainerRuntime, ContainerState, ExecOutput, ResourceLimits, RuntimeError,
};
use codebox_server::storage::{SqliteStorage, StorageBackend};
use codebox_server::terminal::TerminalService;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Engine double whose interactive attach command is a plain local `cat`,
/// so PTY sessions run for real without a container engine. `pgrep`
/// probes inside `exec` are scripted through a queue.
#[derive(Default)]
struct FakeEngine {
    fail_exec: AtomicBool,
    pgrep_counts: Mutex<VecDeque<u64>>,
    networks: Mutex<HashSet<String>>,
}

#[async_trait]
impl ContainerRuntime for FakeEngine {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create_container(
        &self,
        name: &str,
        _image: &str,
        _limits: ResourceLimits,
        _workdir: &str,
        _uid: u32,
        _env: &HashMap<String, String>,
    ) -> Result<String, RuntimeError> {
        Ok(format!("id_{name}"))
    }

    async fn inspect(&self, handle: &str) -> Result<ContainerState, RuntimeError> {
        Ok(ContainerState {
            id: handle.to_string(),
            running: true,
        })
    }

    async fn exec(
        &self,
        _handle: &str,
        _argv: &[String],
        _stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(RuntimeError::Rejected("exec transport down".to_string()));
        }
        // Emulates `pgrep -c`: exit 1 with no output once the count is 0.
        let count = self.pgrep_counts.lock().pop_front().unwrap_or(0);
        if count == 0 {
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 1,
            })
        } else {
            Ok(ExecOutput {
                stdout: format!("{count}\n"),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    async fn stop(&self, _handle: &str, _grace_secs: u64) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn remove(&self, _handle: &str, _with_volumes: bool) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn attach_network(&self, _handle: &str, network: &str) -> Result<(), RuntimeError> {
        self.networks.lock().insert(network.to_string());
        Ok(())
    }

    async fn detach_network(&self, _handle: &str, network: &str) -> Result<(), RuntimeError> {
        self.networks.lock().remove(network);
        Ok(())
    }

    async fn ensure_network(&self, _network: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn list_containers(&self, _name_prefix: &str) -> Result<Vec<String>, RuntimeError> {
        Ok(Vec::new())
    }

    fn shell_argv(&self, _handle: &str) -> Vec<String> {
        vec!["/bin/cat".to_string()]
    }
}

fn temp_db(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "codebox_terminal_{tag}_{}.db",
        uuid::Uuid::new_v4().simple()
    ))
}

fn build_stack(
    tag: &str,
    config: TerminalConfig,
) -> (
    TerminalService,
    Arc<ContainerManager>,
    Arc<FakeEngine>,
    std::path::PathBuf,
) {
    let db_path = temp_db(tag);
    let storage: Arc<dyn StorageBackend> =
        Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
    storage.ensure_initialized().unwrap();
    let engine = Arc::new(FakeEngine::default());
    let manager = Arc::new(ContainerManager::new(
        ContainerConfig::default(),
        storage.clone(),
        engine.clone(),
    ));
    let terminal = TerminalService::new(config, manager.clone(), storage);
    (terminal, manager, engine, db_path)
}

fn quick_poll() -> TerminalConfig {
    TerminalConfig {
        install_poll_interval_s: 1,
        install_initial_delay_s: 0,
        install_max_wait_s: 30,
        install_fallback_wait_s: 0,
        ..TerminalConfig::default()
    }
}

#[tokio::test]
async fn reconnect_reuses_pty_until_teardown() {
    let (terminal, manager, _engine, db_path) =
        build_stack("ptyreuse", TerminalConfig::default());
    let record = manager.create("alice", None, Vec::new()).await.unwrap();
    let sid = record.session_id.clone();

    let mut rx = terminal
        .open(&sid)
        .unwrap()
        .expect("first attach spawns a pty");
    // A second attach while the PTY lives resumes it instead of spawning.
    assert!(terminal.open(&sid).unwrap().is_none());
    assert!(terminal.is_open(&sid));
    assert!(terminal.send_raw_input(&sid, b"hello\n").unwrap());

    let mut seen = String::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !seen.contains("hello") {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let chunk = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("pty output before deadline")
            .expect("pty channel open");
        seen.push_str(&chunk);
    }

    // After teardown the mapping is gone and the next attach is fresh.
    terminal.close_pty(&sid);
    assert!(!terminal.is_open(&sid));
    let fresh = terminal.open(&sid).unwrap();
    assert!(fresh.is_some());
    terminal.close_pty(&sid);

    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn install_monitor_observes_process_exit() {
    let (terminal, manager, engine, db_path) = build_stack("installdone", quick_poll());
    let record = manager.create("alice", None, Vec::new()).await.unwrap();
    let sid = record.session_id.clone();
    let _rx = terminal.open(&sid).unwrap().unwrap();

    assert!(terminal.enable_network(&sid).await);
    assert!(!engine.networks.lock().is_empty());

    // Two busy polls, then the installer is gone.
    engine.pgrep_counts.lock().extend([2, 1]);
    let started = Instant::now();
    assert!(terminal.wait_install_complete(&sid, "pip").await);
    // Detection lands within a couple of poll intervals of the exit.
    assert!(started.elapsed() < Duration::from_secs(10));

    // The caller's guaranteed-cleanup step closes egress again.
    assert!(terminal.disable_network(&sid).await);
    assert!(engine.networks.lock().is_empty());

    terminal.close_pty(&sid);
    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn install_monitor_gives_up_at_the_ceiling() {
    let config = TerminalConfig {
        install_max_wait_s: 2,
        ..quick_poll()
    };
    let (terminal, manager, engine, db_path) = build_stack("installstuck", config);
    let record = manager.create("alice", None, Vec::new()).await.unwrap();
    let sid = record.session_id.clone();
    let _rx = terminal.open(&sid).unwrap().unwrap();

    // The installer never exits; the hard ceiling decides.
    engine.pgrep_counts.lock().extend(std::iter::repeat(1).take(60));
    let started = Instant::now();
    assert!(!terminal.wait_install_complete(&sid, "npm").await);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(10));

    terminal.close_pty(&sid);
    let _ = std::fs::remove_file(db_path);
}

#[tokio::test]
async fn install_monitor_failure_falls_back_to_fixed_wait() {
    let (terminal, manager, engine, db_path) = build_stack("installfail", quick_poll());
    let record = manager.create("alice", None, Vec::new()).await.unwrap();
    let sid = record.session_id.clone();
    let _rx = terminal.open(&sid).unwrap().unwrap();

    engine.fail_exec.store(true, Ordering::SeqCst);
    // A broken probe degrades to the fixed wait and reports no observation.
    assert!(!terminal.wait_install_complete(&sid, "pip").await);

    terminal.close_pty(&sid);
    let _ = std::fs::remove_file(db_path);
}
