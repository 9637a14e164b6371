// ABOUTME: Registry persistence across daemon restarts, and single-instance socket ownership

mod common;

use ciab_daemon::daemon;
use ciab_daemon::models::{HealthState, TerminalRecord};
use ciab_daemon::tmux::FakeBackend;
use ciab_daemon::DaemonError;
use common::{config_for, TestDaemon};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Reconciliation refreshes `last_checked` on startup; everything else must survive.
fn without_check_time(mut records: Vec<TerminalRecord>) -> Vec<TerminalRecord> {
    for record in &mut records {
        record.last_checked = None;
    }
    records
}

#[tokio::test]
async fn test_records_survive_restart() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;
    client
        .create_terminal("t1", Path::new("/repo/a"), Some("cfg-a"))
        .await
        .unwrap();
    client
        .create_terminal("t2", Path::new("/repo/b"), Some("cfg-b"))
        .await
        .unwrap();
    client.send_input("t1", "echo hi\n").await.unwrap();
    let before = client.list_terminals().await.unwrap();
    drop(client);

    let (temp_dir, backend) = daemon.stop().await;
    assert!(temp_dir.path().join("state").join("terminals.json").exists());
    assert!(!temp_dir.path().join("daemon.sock").exists());

    let daemon = TestDaemon::start_in(temp_dir, backend).await;
    let mut client = daemon.client().await;
    let after = client.list_terminals().await.unwrap();
    assert_eq!(without_check_time(after), without_check_time(before));

    let found = client.find_by_config("cfg-b").await.unwrap().unwrap();
    assert_eq!(found.id, "t2");
    assert_eq!(client.check_health("t1").await.unwrap().state, HealthState::Healthy);

    drop(client);
    daemon.stop().await;
}

#[tokio::test]
async fn test_restart_marks_lost_sessions_missing_but_keeps_them() {
    let daemon = TestDaemon::start().await;
    let mut client = daemon.client().await;
    client
        .create_terminal("t1", Path::new("/repo"), None)
        .await
        .unwrap();
    drop(client);
    let (temp_dir, _) = daemon.stop().await;

    // tmux server went away with the daemon
    let daemon = TestDaemon::start_in(temp_dir, Arc::new(FakeBackend::new())).await;
    let mut client = daemon.client().await;

    let terminals = client.list_terminals().await.unwrap();
    assert_eq!(terminals.len(), 1);
    assert_eq!(terminals[0].last_health, Some(HealthState::Missing));
    assert_eq!(client.check_health("t1").await.unwrap().state, HealthState::Missing);

    client.kill_terminal("t1").await.expect("kill of a lost terminal succeeds");
    assert!(client.list_terminals().await.unwrap().is_empty());

    drop(client);
    daemon.stop().await;
}

#[tokio::test]
async fn test_corrupt_snapshot_starts_empty() {
    let temp_dir = TempDir::new().unwrap();
    let state = temp_dir.path().join("state");
    std::fs::create_dir_all(&state).unwrap();
    std::fs::write(state.join("terminals.json"), "[{ truncated").unwrap();

    let daemon = TestDaemon::start_in(temp_dir, Arc::new(FakeBackend::new())).await;
    let mut client = daemon.client().await;
    assert!(client.list_terminals().await.unwrap().is_empty());

    drop(client);
    daemon.stop().await;
}

#[tokio::test]
async fn test_second_daemon_refuses_live_socket() {
    let daemon = TestDaemon::start().await;

    let config = config_for(daemon.temp_dir.path());
    let result = daemon::run(config, Arc::new(FakeBackend::new())).await;
    assert!(matches!(result, Err(DaemonError::AlreadyRunning(_))));

    // The first daemon is unaffected
    daemon.client().await.ping().await.unwrap();
    daemon.stop().await;
}

#[tokio::test]
async fn test_stale_socket_is_replaced() {
    let temp_dir = TempDir::new().unwrap();
    let socket = temp_dir.path().join("daemon.sock");
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let daemon = TestDaemon::start_in(temp_dir, Arc::new(FakeBackend::new())).await;
    daemon.client().await.ping().await.unwrap();
    daemon.stop().await;
}
