// ABOUTME: Concurrent CreateTerminal races from separate client connections

mod common;

use ciab_daemon::daemon::ErrorKind;
use ciab_daemon::tmux::FakeBackend;
use common::TestDaemon;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_id_has_exactly_one_winner() {
    let backend = Arc::new(FakeBackend::new().with_create_delay(Duration::from_millis(100)));
    let daemon = TestDaemon::start_in(TempDir::new().unwrap(), backend).await;

    let mut a = daemon.client().await;
    let mut b = daemon.client().await;
    let (ra, rb) = tokio::join!(
        a.create_terminal("t1", Path::new("/repo"), None),
        b.create_terminal("t1", Path::new("/repo"), None),
    );

    let results = [ra, rb];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one create should win: {:?}", results);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser.kind(), Some(ErrorKind::Conflict));

    assert_eq!(daemon.backend.session_names().await, vec!["ciab_t1".to_string()]);
    assert_eq!(daemon.backend.create_calls(), 1);

    drop((a, b));
    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_ids_all_succeed() {
    let backend = Arc::new(FakeBackend::new().with_create_delay(Duration::from_millis(20)));
    let daemon = TestDaemon::start_in(TempDir::new().unwrap(), backend).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let socket = daemon.socket_path();
        handles.push(tokio::spawn(async move {
            let mut client = ciab_daemon::daemon::DaemonClient::connect(&socket).await.unwrap();
            client
                .create_terminal(&format!("t{}", i), Path::new("/repo"), None)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().expect("create failed");
    }

    assert_eq!(daemon.backend.session_names().await.len(), 8);
    let mut client = daemon.client().await;
    assert_eq!(client.list_terminals().await.unwrap().len(), 8);

    drop(client);
    daemon.stop().await;
}
