// ABOUTME: Health reconciliation between the terminal registry and tmux ground truth
// Registry absence is never taken as proof a session is gone; the backend is always asked

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{HealthState, SessionNaming, TerminalId, TerminalRecord};
use crate::session::registry::TerminalRegistry;
use crate::tmux::SessionBackend;

/// Result of one health check. Authoritative only for the instant it was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub id: TerminalId,
    pub state: HealthState,
    pub backing_session_name: String,
    /// Why the state is Unknown
    pub message: Option<String>,
}

/// Compares registry records against the backend.
pub struct HealthReconciler {
    registry: Arc<TerminalRegistry>,
    backend: Arc<dyn SessionBackend>,
    naming: SessionNaming,
}

impl HealthReconciler {
    pub fn new(
        registry: Arc<TerminalRegistry>,
        backend: Arc<dyn SessionBackend>,
        naming: SessionNaming,
    ) -> Self {
        Self {
            registry,
            backend,
            naming,
        }
    }

    /// The backing session name a terminal with this id would have.
    pub fn prefix_for(&self, id: &str) -> String {
        self.naming.backing_name(id)
    }

    /// Check one id, registered or not. Only Healthy and Missing are recorded.
    pub async fn check(&self, id: &str) -> HealthReport {
        let report = match self.registry.lookup(id).await {
            Some(record) => self.check_registered(&record).await,
            None => self.check_unregistered(id).await,
        };

        if report.state != HealthState::Unknown
            && report.state != HealthState::UnregisteredButPresent
        {
            self.registry.mark_health(id, report.state).await;
        }
        report
    }

    async fn check_registered(&self, record: &TerminalRecord) -> HealthReport {
        let (state, message) = match self.backend.has_session(&record.backing_session_name).await {
            Ok(true) => (HealthState::Healthy, None),
            Ok(false) => (HealthState::Missing, None),
            Err(e) => {
                warn!("Health of terminal {} unverifiable: {}", record.id, e);
                (HealthState::Unknown, Some(e.to_string()))
            }
        };
        HealthReport {
            id: record.id.clone(),
            state,
            backing_session_name: record.backing_session_name.clone(),
            message,
        }
    }

    /// No record: ask the backend directly instead of trusting the registry,
    /// which may have been reset or may not have caught up with a create.
    async fn check_unregistered(&self, id: &str) -> HealthReport {
        let backing = self.prefix_for(id);
        let (state, message) = match self.backend.list_sessions_matching(&backing).await {
            Ok(sessions) if sessions.iter().any(|s| *s == backing) => {
                info!("Terminal {} has a live session {} but no registry record", id, backing);
                (HealthState::UnregisteredButPresent, None)
            }
            Ok(_) => (HealthState::Missing, None),
            Err(e) => {
                warn!("Health of unregistered terminal {} unverifiable: {}", id, e);
                (HealthState::Unknown, Some(e.to_string()))
            }
        };
        HealthReport {
            id: id.to_string(),
            state,
            backing_session_name: backing,
            message,
        }
    }

    /// Check every registered terminal. Never removes records; Missing ones
    /// stay until a caller kills them.
    pub async fn reconcile_all(&self) -> Vec<HealthReport> {
        let records = self.registry.list().await;
        let mut reports = Vec::with_capacity(records.len());

        for record in records {
            let report = self.check_registered(&record).await;
            match report.state {
                HealthState::Missing => {
                    warn!(
                        "Terminal {} lost its backend session {}",
                        record.id, record.backing_session_name
                    );
                    self.registry.mark_health(&record.id, report.state).await;
                }
                HealthState::Healthy => {
                    self.registry.mark_health(&record.id, report.state).await;
                }
                _ => {}
            }
            reports.push(report);
        }

        debug!("Reconciled {} terminal(s)", reports.len());
        reports
    }

    /// Run `reconcile_all` on an interval until shutdown is signalled.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; startup already reconciled
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.reconcile_all().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::backend::MockSessionBackend;
    use crate::tmux::BackendError;
    use mockall::predicate::eq;
    use std::path::PathBuf;

    fn record(id: &str) -> TerminalRecord {
        TerminalRecord::new(
            id.to_string(),
            format!("cfg-{}", id),
            format!("ciab_{}", id),
            PathBuf::from("/repo"),
        )
    }

    fn reconciler(registry: Arc<TerminalRegistry>, backend: MockSessionBackend) -> HealthReconciler {
        HealthReconciler::new(registry, Arc::new(backend), SessionNaming::default())
    }

    #[tokio::test]
    async fn test_registered_and_alive_is_healthy() {
        let registry = Arc::new(TerminalRegistry::new());
        registry.register(record("t1")).await.unwrap();

        let mut backend = MockSessionBackend::new();
        backend
            .expect_has_session()
            .with(eq("ciab_t1"))
            .times(1)
            .returning(|_| Ok(true));

        let report = reconciler(registry, backend).check("t1").await;
        assert_eq!(report.state, HealthState::Healthy);
        assert!(report.message.is_none());
    }

    #[tokio::test]
    async fn test_registered_but_dead_is_missing_and_kept() {
        let registry = Arc::new(TerminalRegistry::new());
        registry.register(record("t1")).await.unwrap();

        let mut backend = MockSessionBackend::new();
        backend.expect_has_session().returning(|_| Ok(false));

        let report = reconciler(registry.clone(), backend).check("t1").await;
        assert_eq!(report.state, HealthState::Missing);

        let kept = registry.lookup("t1").await.expect("record must not be pruned");
        assert_eq!(kept.last_health, Some(HealthState::Missing));
    }

    #[tokio::test]
    async fn test_unregistered_with_live_session_is_not_missing() {
        let registry = Arc::new(TerminalRegistry::new());

        let mut backend = MockSessionBackend::new();
        backend.expect_has_session().never();
        backend
            .expect_list_sessions_matching()
            .with(eq("ciab_t1"))
            .times(1)
            .returning(|_| Ok(vec!["ciab_t1".to_string(), "ciab_t10".to_string()]));

        let report = reconciler(registry, backend).check("t1").await;
        assert_eq!(report.state, HealthState::UnregisteredButPresent);
        assert_eq!(report.backing_session_name, "ciab_t1");
    }

    #[tokio::test]
    async fn test_prefix_sibling_does_not_count_as_present() {
        let registry = Arc::new(TerminalRegistry::new());

        let mut backend = MockSessionBackend::new();
        backend
            .expect_list_sessions_matching()
            .returning(|_| Ok(vec!["ciab_t10".to_string()]));

        let report = reconciler(registry, backend).check("t1").await;
        assert_eq!(report.state, HealthState::Missing);
    }

    #[tokio::test]
    async fn test_never_created_is_missing() {
        let registry = Arc::new(TerminalRegistry::new());

        let mut backend = MockSessionBackend::new();
        backend
            .expect_list_sessions_matching()
            .returning(|_| Ok(Vec::new()));

        let report = reconciler(registry, backend).check("ghost").await;
        assert_eq!(report.state, HealthState::Missing);
        assert!(report.message.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unknown_not_missing() {
        let registry = Arc::new(TerminalRegistry::new());
        registry.register(record("t1")).await.unwrap();

        let mut backend = MockSessionBackend::new();
        backend.expect_has_session().returning(|_| {
            Err(BackendError::ServerUnavailable(
                "error connecting to /tmp/tmux-1000/default".to_string(),
            ))
        });

        let report = reconciler(registry.clone(), backend).check("t1").await;
        assert_eq!(report.state, HealthState::Unknown);
        assert!(report.message.unwrap().contains("error connecting"));

        // Last known health is left alone
        assert_eq!(
            registry.lookup("t1").await.unwrap().last_health,
            Some(HealthState::Healthy)
        );
    }

    #[tokio::test]
    async fn test_unregistered_timeout_is_unknown() {
        let registry = Arc::new(TerminalRegistry::new());

        let mut backend = MockSessionBackend::new();
        backend.expect_list_sessions_matching().returning(|_| {
            Err(BackendError::Timeout {
                command: "list-sessions".to_string(),
                after: Duration::from_secs(5),
            })
        });

        let report = reconciler(registry, backend).check("t1").await;
        assert_eq!(report.state, HealthState::Unknown);
    }

    #[tokio::test]
    async fn test_no_caching_between_calls() {
        let registry = Arc::new(TerminalRegistry::new());
        registry.register(record("t1")).await.unwrap();

        let mut backend = MockSessionBackend::new();
        let mut seq = mockall::Sequence::new();
        backend
            .expect_has_session()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        backend
            .expect_has_session()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        backend
            .expect_has_session()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));

        let reconciler = reconciler(registry, backend);
        assert_eq!(reconciler.check("t1").await.state, HealthState::Healthy);
        assert_eq!(reconciler.check("t1").await.state, HealthState::Missing);
        assert_eq!(reconciler.check("t1").await.state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_reconcile_all_marks_but_never_prunes() {
        let registry = Arc::new(TerminalRegistry::new());
        registry.register(record("alive")).await.unwrap();
        registry.register(record("dead")).await.unwrap();

        let mut backend = MockSessionBackend::new();
        backend
            .expect_has_session()
            .returning(|name| Ok(name == "ciab_alive"));

        let reports = reconciler(registry.clone(), backend).reconcile_all().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(registry.len().await, 2);
        assert_eq!(
            registry.lookup("dead").await.unwrap().last_health,
            Some(HealthState::Missing)
        );
        assert_eq!(
            registry.lookup("alive").await.unwrap().last_health,
            Some(HealthState::Healthy)
        );
    }
}
