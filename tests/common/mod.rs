// ABOUTME: Shared helpers for daemon integration tests - an in-process daemon on a temp socket
#![allow(dead_code)]

use ciab_daemon::config::DaemonConfig;
use ciab_daemon::daemon::{self, DaemonClient};
use ciab_daemon::tmux::FakeBackend;
use ciab_daemon::DaemonError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub struct TestDaemon {
    pub temp_dir: TempDir,
    pub config: DaemonConfig,
    pub backend: Arc<FakeBackend>,
    handle: JoinHandle<Result<(), DaemonError>>,
}

/// Config with every path inside `dir` and no periodic reconciliation.
pub fn config_for(dir: &Path) -> DaemonConfig {
    DaemonConfig {
        socket_path: dir.join("daemon.sock"),
        state_path: dir.join("state").join("terminals.json"),
        worktree_root: dir.join("worktrees"),
        log_dir: dir.join("logs"),
        reconcile_interval_secs: 0,
        snapshot_interval_secs: 1,
        ..DaemonConfig::default()
    }
}

impl TestDaemon {
    pub async fn start() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self::start_in(temp_dir, Arc::new(FakeBackend::new())).await
    }

    /// Start against an existing directory and backend, e.g. to simulate a restart.
    pub async fn start_in(temp_dir: TempDir, backend: Arc<FakeBackend>) -> Self {
        let config = config_for(temp_dir.path());
        let handle = tokio::spawn(daemon::run(config.clone(), backend.clone()));
        wait_for_socket(&config.socket_path).await;
        Self {
            temp_dir,
            config,
            backend,
            handle,
        }
    }

    pub async fn client(&self) -> DaemonClient {
        DaemonClient::connect(&self.config.socket_path)
            .await
            .expect("Failed to connect to test daemon")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path.clone()
    }

    /// Shut the daemon down and hand back its directory and backend.
    pub async fn stop(self) -> (TempDir, Arc<FakeBackend>) {
        self.client().await.shutdown().await.expect("Shutdown failed");
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("Daemon did not stop")
            .expect("Daemon task panicked")
            .expect("Daemon returned an error");
        (self.temp_dir, self.backend)
    }
}

pub async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if DaemonClient::probe(path, Duration::from_millis(200)).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Daemon never came up on {}", path.display());
}

/// A repository with one commit, at `<dir>/repo`.
pub fn init_repo(dir: &Path) -> PathBuf {
    let repo_path = dir.join("repo");
    std::fs::create_dir_all(&repo_path).unwrap();
    let repo = git2::Repository::init(&repo_path).unwrap();
    std::fs::write(repo_path.join("README.md"), "# test repo\n").unwrap();

    let signature = git2::Signature::now("Test User", "test@example.com").unwrap();
    let tree_id = {
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        index.write_tree().unwrap()
    };
    let tree = repo.find_tree(tree_id).unwrap();
    repo.commit(Some("HEAD"), &signature, &signature, "Initial commit", &tree, &[])
        .unwrap();
    repo_path
}

/// Branch `name` at HEAD, pushed to `origin`, checked out in a worktree at `path`.
pub fn add_pushed_worktree(repo_path: &Path, name: &str, path: &Path) {
    let repo = git2::Repository::open(repo_path).unwrap();
    let head = repo.head().unwrap().peel_to_commit().unwrap();
    let branch = repo.branch(name, &head, false).unwrap();
    repo.reference(&format!("refs/remotes/origin/{}", name), head.id(), true, "push")
        .unwrap();

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let reference = branch.into_reference();
    let mut opts = git2::WorktreeAddOptions::new();
    opts.reference(Some(&reference));
    repo.worktree(name, path, Some(&opts)).unwrap();

    let worktree_repo = git2::Repository::open(path).unwrap();
    worktree_repo
        .checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
        .unwrap();
}
