use codebox_server::storage::{
    ContainerSessionRecord, SessionStatus, SqliteStorage, StorageBackend, TerminalCommandRecord,
};
use codebox_server::user_store::UserStore;
use std::sync::Arc;

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn temp_storage(tag: &str) -> (SqliteStorage, std::path::PathBuf) {
    let db_path = std::env::temp_dir().join(format!(
        "codebox_{tag}_{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let storage = SqliteStorage::new(db_path.to_string_lossy().to_string());
    storage.ensure_initialized().unwrap();
    (storage, db_path)
}

fn build_session(session_id: &str, user_id: &str, status: &str, now: f64) -> ContainerSessionRecord {
    ContainerSessionRecord {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        project_id: None,
        container_id: None,
        status: status.to_string(),
        image: "codebox-python:latest".to_string(),
        cpu_limit: 1.0,
        memory_limit_mb: 512,
        env_json: "{}".to_string(),
        created_at: now,
        last_activity_at: now,
        terminated_at: None,
    }
}

#[test]
fn active_session_lookup_counts_creating_and_running() {
    let (storage, db_path) = temp_storage("active");
    let now = now_ts();

    storage
        .create_session(&build_session("s1", "alice", "creating", now))
        .unwrap();
    let active = storage.get_active_session("alice").unwrap().unwrap();
    assert_eq!(active.session_id, "s1");

    storage
        .update_session_status("s1", SessionStatus::Running)
        .unwrap();
    assert!(storage.get_active_session("alice").unwrap().is_some());

    storage.mark_terminated("s1", now).unwrap();
    assert!(storage.get_active_session("alice").unwrap().is_none());
    assert!(storage.get_active_session("bob").unwrap().is_none());

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn mark_terminated_keeps_first_timestamp() {
    let (storage, db_path) = temp_storage("terminate");
    let now = now_ts();

    storage
        .create_session(&build_session("s1", "alice", "running", now))
        .unwrap();
    storage.mark_terminated("s1", 100.0).unwrap();
    storage.mark_terminated("s1", 200.0).unwrap();

    let record = storage.get_session("s1").unwrap().unwrap();
    assert_eq!(record.status(), Some(SessionStatus::Terminated));
    assert_eq!(record.terminated_at, Some(100.0));

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn idle_and_retention_queries_respect_cutoffs() {
    let (storage, db_path) = temp_storage("sweep");
    let now = now_ts();

    storage
        .create_session(&build_session("fresh", "alice", "running", now))
        .unwrap();
    storage
        .create_session(&build_session("stale", "bob", "running", now))
        .unwrap();
    storage
        .touch_session_activity("stale", now - 3600.0)
        .unwrap();

    let idle = storage.list_idle_running(now - 1800.0).unwrap();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].session_id, "stale");

    storage.mark_terminated("stale", now - 90000.0).unwrap();
    let expired = storage.list_terminated_before(now - 86400.0).unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].session_id, "stale");

    // Purge deletes the row and its command history together.
    storage
        .append_command(&TerminalCommandRecord {
            session_id: "stale".to_string(),
            command: "ls".to_string(),
            working_dir: "/workspace".to_string(),
            exit_code: None,
            output: None,
            created_at: now,
            duration_ms: None,
        })
        .unwrap();
    let affected = storage.purge_session("stale").unwrap();
    assert_eq!(affected, 1);
    assert!(storage.get_session("stale").unwrap().is_none());
    assert!(storage.list_commands("stale", 10).unwrap().is_empty());

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn command_history_preserves_order_and_limit() {
    let (storage, db_path) = temp_storage("commands");
    let now = now_ts();

    for index in 0..5 {
        storage
            .append_command(&TerminalCommandRecord {
                session_id: "s1".to_string(),
                command: format!("echo {index}"),
                working_dir: "/workspace".to_string(),
                exit_code: Some(0),
                output: Some(String::new()),
                created_at: now + index as f64,
                duration_ms: Some(5),
            })
            .unwrap();
    }

    let all = storage.list_commands("s1", 100).unwrap();
    assert_eq!(all.len(), 5);
    assert_eq!(all[0].command, "echo 0");
    assert_eq!(all[4].command, "echo 4");

    let limited = storage.list_commands("s1", 2).unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].command, "echo 0");

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn token_auth_round_trip_and_expiry() {
    let (storage, db_path) = temp_storage("tokens");
    let storage: Arc<dyn StorageBackend> = Arc::new(storage);
    let users = UserStore::new(storage.clone());

    users
        .create_user("alice", None, "correct-horse", "user")
        .unwrap();
    let session = users.login("alice", "correct-horse").unwrap();
    assert!(session.token.token.starts_with("cbt_"));

    let authed = users.authenticate_token(&session.token.token).unwrap();
    assert_eq!(authed.unwrap().user_id, "alice");

    assert!(users.login("alice", "wrong").is_err());
    assert!(users.authenticate_token("cbt_missing").unwrap().is_none());

    // Expired tokens fail authentication and are removed.
    let mut expired = storage.get_user_token(&session.token.token).unwrap().unwrap();
    expired.expires_at = now_ts() - 1.0;
    storage.delete_user_token(&expired.token).unwrap();
    storage.create_user_token(&expired).unwrap();
    assert!(users.authenticate_token(&expired.token).unwrap().is_none());
    assert!(storage.get_user_token(&expired.token).unwrap().is_none());

    let _ = std::fs::remove_file(db_path);
}
