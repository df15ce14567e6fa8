//! Session sweeper: periodic expiry of idle sessions.
//!
//! One pass ([`SessionSweeper::sweep_at`]) does three things in order:
//! 1. expires live sessions idle past the session timeout
//! 2. reconciles persisted sessions whose expiry passed: live ones are
//!    re-persisted with a fresh expiry, the rest are marked inactive
//! 3. evicts idle channels
//!
//! A failure on one session is logged and counted; the pass goes on.
//! [`SessionSweeper::spawn`] runs passes on an interval until stopped and
//! can be triggered on demand.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::channel::ChannelMap;
use crate::error::CollabError;
use crate::now_millis;
use crate::session::SessionRegistry;
use crate::storage::CollabStore;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Live sessions expired
    pub expired: usize,
    /// Persisted sessions refreshed or deactivated
    pub reconciled: usize,
    pub failures: usize,
    pub channels_evicted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone)]
pub struct SessionSweeper {
    registry: Arc<SessionRegistry>,
    channels: Arc<ChannelMap>,
    store: Arc<dyn CollabStore>,
    interval: Duration,
}

impl SessionSweeper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        channels: Arc<ChannelMap>,
        store: Arc<dyn CollabStore>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            channels,
            store,
            interval,
        }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(now_millis()).await
    }

    /// Run one pass as if the clock read `now`.
    pub async fn sweep_at(&self, now: u64) -> SweepReport {
        let mut report = SweepReport::default();

        for (content_id, session_id) in self.registry.idle_sessions(now).await {
            match self.registry.expire_if_idle(&content_id, session_id, now).await {
                Ok(true) => report.expired += 1,
                // Touched or removed since it was listed.
                Ok(false) => {}
                Err(e) => {
                    log::error!("Failed to expire session {session_id} on {content_id}: {e}");
                    report.failures += 1;
                }
            }
        }

        match self.store.expired_sessions(now).await {
            Ok(records) => {
                for record in records {
                    let session_id = record.session_id;
                    let result = if self.registry.content_of(session_id).await.is_some() {
                        self.registry.persist(session_id).await.map(|_| ())
                    } else {
                        self.store
                            .deactivate_session(session_id)
                            .await
                            .map(|_| ())
                            .map_err(CollabError::from)
                    };
                    match result {
                        Ok(()) => report.reconciled += 1,
                        Err(e) => {
                            log::error!("Failed to reconcile persisted session {session_id}: {e}");
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to list expired sessions: {e}");
                report.failures += 1;
            }
        }

        report.channels_evicted = self.channels.evict_idle().await;

        if report.is_empty() {
            log::debug!("Sweep found nothing to do");
        } else {
            log::info!(
                "Sweep: {} expired, {} reconciled, {} failed, {} channel(s) evicted",
                report.expired,
                report.reconciled,
                report.failures,
                report.channels_evicted
            );
        }
        report
    }

    /// Start the periodic sweep task.
    pub fn spawn(&self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (report_tx, report_rx) = watch::channel(SweepReport::default());
        let trigger = Arc::new(Notify::new());

        let sweeper = self.clone();
        let notified = trigger.clone();
        let task = tokio::spawn(async move {
            log::info!("Session sweeper started (every {:?})", sweeper.interval);
            let mut ticker = tokio::time::interval(sweeper.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = notified.notified() => {}
                    _ = ticker.tick() => {}
                }
                let report = sweeper.sweep().await;
                let _ = report_tx.send(report);
            }
            log::info!("Session sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            trigger,
            reports: report_rx,
            task,
        }
    }
}

/// Control handle of a spawned sweeper.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    trigger: Arc<Notify>,
    reports: watch::Receiver<SweepReport>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Run a pass now instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Wait for the next completed pass.
    pub async fn next_report(&mut self) -> Option<SweepReport> {
        self.reports.changed().await.ok()?;
        Some(*self.reports.borrow_and_update())
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::error!("Session sweeper task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{BroadcastHub, Connection};
    use crate::collaborators::AllowAll;
    use crate::config::CollabConfig;
    use crate::protocol::{LeaveReason, ServerEvent};
    use crate::session::{Permissions, Session, StartOptions};
    use crate::storage::MemoryStore;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        channels: Arc<ChannelMap>,
        store: Arc<MemoryStore>,
        sweeper: SessionSweeper,
        timeout_ms: u64,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(CollabConfig::for_testing());
        let channels = Arc::new(ChannelMap::new(config.history_cap));
        let hub = Arc::new(BroadcastHub::new(channels.clone()));
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new(
            config.clone(),
            channels.clone(),
            hub,
            store.clone(),
            Arc::new(AllowAll),
        ));
        let sweeper = SessionSweeper::new(
            registry.clone(),
            channels.clone(),
            store.clone(),
            Duration::from_secs(3600),
        );
        Fixture {
            registry,
            channels,
            store,
            sweeper,
            timeout_ms: config.session_timeout.as_millis() as u64,
        }
    }

    #[tokio::test]
    async fn test_sweep_expires_idle_and_notifies() {
        let f = fixture();
        let (conn, mut rx) = Connection::channel(8);
        f.registry
            .start_session("c1", "watcher", StartOptions::with_connection(conn))
            .await
            .unwrap();
        let idle = f
            .registry
            .start_session("c1", "idle", StartOptions::default())
            .await
            .unwrap();
        let idle_id = idle.session.id;
        // Drain the join notice for "idle".
        rx.recv().await.unwrap();

        f.channels
            .write("c1")
            .await
            .sessions
            .get_mut(&idle_id)
            .unwrap()
            .last_activity = 0;

        let report = f.sweeper.sweep_at(now_millis()).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.failures, 0);
        assert_eq!(report.channels_evicted, 0);
        assert!(f.registry.content_of(idle_id).await.is_none());
        assert!(!f.store.load_session(idle_id).await.unwrap().unwrap().active);

        let frame = rx.recv().await.unwrap();
        let event = ServerEvent::decode(&frame).unwrap().event;
        assert_eq!(
            event,
            ServerEvent::UserLeft {
                session_id: idle_id,
                user_id: "idle".into(),
                reason: LeaveReason::Expired,
            }
        );
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_sessions() {
        let f = fixture();
        let snapshot = f
            .registry
            .start_session("c1", "u1", StartOptions::default())
            .await
            .unwrap();

        let report = f.sweeper.sweep_at(snapshot.session.last_activity + 1).await;
        assert_eq!(report.expired, 0);
        assert_eq!(report.channels_evicted, 0);
        assert!(f.registry.content_of(snapshot.session.id).await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_deactivates_orphaned_records() {
        let f = fixture();
        let orphan = Session::new("c9", "ghost", Permissions::full(), 4, 1_000);
        f.store.put_session(&orphan.to_record(f.timeout_ms).unwrap()).await.unwrap();

        let report = f.sweeper.sweep_at(1_000 + f.timeout_ms + 1).await;
        assert_eq!(report.reconciled, 1);
        assert!(!f.store.load_session(orphan.id).await.unwrap().unwrap().active);

        let again = f.sweeper.sweep_at(1_000 + f.timeout_ms + 2).await;
        assert_eq!(again.reconciled, 0);
    }

    #[tokio::test]
    async fn test_sweep_evicts_empty_channels() {
        let f = fixture();
        let snapshot = f
            .registry
            .start_session("c1", "u1", StartOptions::default())
            .await
            .unwrap();
        f.registry
            .leave_session(snapshot.session.id, "u1")
            .await
            .unwrap();

        let report = f.sweeper.sweep().await;
        assert_eq!(report.channels_evicted, 1);
    }

    #[tokio::test]
    async fn test_spawned_sweeper_runs_on_trigger() {
        let f = fixture();
        let orphan = Session::new("c2", "ghost", Permissions::full(), 4, 0);
        f.store.put_session(&orphan.to_record(0).unwrap()).await.unwrap();

        let mut handle = f.sweeper.spawn();
        handle.trigger();
        let report = tokio::time::timeout(Duration::from_secs(5), handle.next_report())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.reconciled, 1);
        handle.stop().await;
    }
}
