//! Best-effort deduplication of racing workers.
//!
//! The backing store (labeled issues on the review hub) is eventually
//! consistent and offers no atomic create-if-absent, so this is NOT a true
//! distributed lock and must never be relied on for mutual exclusion. It is
//! best-effort deduplication: probe for an existing lock with backoff, create
//! one if none is visible, re-read after a short delay, and resolve duplicate
//! creates deterministically by lowest lock id. A worker that cannot reach
//! the store at all proceeds as if first, trading a possible duplicate
//! investigation for availability.

use crate::errors::CoordinationError;
use crate::hub::ReviewHub;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};

pub const LOCK_LABEL: &str = "mender-lock";

/// One lock record in the store. `lock_id` totally orders racing creates.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRecord {
    pub lock_id: u64,
    pub resource_key: String,
    pub worker: String,
    pub created_at: DateTime<Utc>,
}

/// Store operations the protocol needs. The real store is the review hub;
/// tests script one in memory.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// All lock records currently visible for the key, expired or not.
    async fn find(&self, resource_key: &str) -> Result<Vec<LockRecord>, CoordinationError>;
    async fn create(&self, resource_key: &str, worker: &str)
        -> Result<LockRecord, CoordinationError>;
    async fn retire(&self, record: &LockRecord) -> Result<(), CoordinationError>;
    /// Record interest on someone else's lock. Best effort.
    async fn attach_waiter(&self, record: &LockRecord, worker: &str)
        -> Result<(), CoordinationError>;
}

#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub enabled: bool,
    /// Probes for an existing lock before creating one. Sized to exceed the
    /// store's observed propagation delay.
    pub probe_attempts: u32,
    /// Base backoff between probes; probe k waits k times this.
    pub probe_delay_ms: u64,
    /// Wait between create and the reconciliation re-read.
    pub reconcile_delay_ms: u64,
    /// A lock older than this with no fix landed is abandoned.
    pub lock_ttl_secs: i64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_attempts: 3,
            probe_delay_ms: 2_000,
            reconcile_delay_ms: 5_000,
            lock_ttl_secs: 3_600,
        }
    }
}

/// What a claim attempt concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Proceed with the investigation. The lock is absent when coordination
    /// is disabled or the store was unreachable (fail open).
    Owner { lock: Option<LockRecord> },
    /// Another worker is already investigating this failure.
    Skip { holder: Option<LockRecord> },
}

pub struct Coordinator<'a> {
    store: &'a dyn LockStore,
    config: CoordinationConfig,
}

impl<'a> Coordinator<'a> {
    pub fn new(store: &'a dyn LockStore, config: CoordinationConfig) -> Self {
        Self { store, config }
    }

    /// Decide whether this worker should investigate `resource_key`.
    pub async fn claim(&self, resource_key: &str, worker: &str) -> ClaimOutcome {
        if !self.config.enabled {
            debug!("coordination disabled, proceeding unconditionally");
            return ClaimOutcome::Owner { lock: None };
        }

        let mut reaped = HashSet::new();

        // Probe for an existing lock; the store may lag behind a very recent
        // create by another worker.
        for probe in 1..=self.config.probe_attempts {
            match self.store.find(resource_key).await {
                Ok(records) => {
                    let live = self.live_locks(records, &mut reaped).await;
                    if let Some(holder) = live.into_iter().min_by_key(|r| r.lock_id) {
                        info!(lock_id = holder.lock_id, worker = %holder.worker,
                              "existing lock found, skipping");
                        if let Err(e) = self.store.attach_waiter(&holder, worker).await {
                            warn!(error = %e, "failed to attach as waiter");
                        }
                        return ClaimOutcome::Skip {
                            holder: Some(holder),
                        };
                    }
                }
                Err(e) => {
                    warn!(error = %e, "lock store unreachable, failing open");
                    return ClaimOutcome::Owner { lock: None };
                }
            }
            if probe < self.config.probe_attempts {
                let backoff = self.config.probe_delay_ms * u64::from(probe);
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
        }

        // Nobody visible: create our own record, then re-read to catch a
        // worker that created in the same window.
        let own = match self.store.create(resource_key, worker).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "lock creation failed, failing open");
                return ClaimOutcome::Owner { lock: None };
            }
        };
        tokio::time::sleep(std::time::Duration::from_millis(
            self.config.reconcile_delay_ms,
        ))
        .await;

        let visible = match self.store.find(resource_key).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "reconciliation read failed, proceeding as owner");
                return ClaimOutcome::Owner { lock: Some(own) };
            }
        };

        // Lowest lock id wins. The re-read may lag behind our own create, so
        // the comparison always includes the record we hold in hand; only a
        // strictly lower id visible in the store beats it.
        let live = self.live_locks(visible, &mut reaped).await;
        let winner = match live.into_iter().min_by_key(|r| r.lock_id) {
            Some(other) if other.lock_id < own.lock_id => other,
            _ => own.clone(),
        };

        if winner.lock_id == own.lock_id {
            info!(lock_id = own.lock_id, "lock claimed");
            ClaimOutcome::Owner { lock: Some(own) }
        } else {
            info!(
                own = own.lock_id,
                winner = winner.lock_id,
                "lost create race, retiring own lock"
            );
            if let Err(e) = self.store.retire(&own).await {
                warn!(error = %e, lock_id = own.lock_id, "failed to retire losing lock");
            }
            ClaimOutcome::Skip {
                holder: Some(winner),
            }
        }
    }

    /// Release a lock once the investigation concluded. Best effort.
    pub async fn release(&self, lock: &LockRecord) {
        if let Err(e) = self.store.retire(lock).await {
            warn!(error = %e, lock_id = lock.lock_id, "failed to release lock");
        }
    }

    /// Split out the live records and opportunistically retire the expired
    /// ones so abandoned locks do not linger on the hub. `reaped` dedupes
    /// retirements within one claim call.
    async fn live_locks(
        &self,
        records: Vec<LockRecord>,
        reaped: &mut HashSet<u64>,
    ) -> Vec<LockRecord> {
        let cutoff = Utc::now() - Duration::seconds(self.config.lock_ttl_secs);
        let mut live = Vec::new();
        for record in records {
            if record.created_at > cutoff {
                live.push(record);
            } else if reaped.insert(record.lock_id) {
                debug!(lock_id = record.lock_id, "retiring expired lock");
                if let Err(e) = self.store.retire(&record).await {
                    warn!(error = %e, lock_id = record.lock_id, "failed to retire expired lock");
                }
            }
        }
        live
    }
}

/// Lock store over hub issues: one open labeled issue per lock, the issue
/// number as the lock id.
pub struct IssueLockStore<'a> {
    hub: &'a dyn ReviewHub,
}

impl<'a> IssueLockStore<'a> {
    pub fn new(hub: &'a dyn ReviewHub) -> Self {
        Self { hub }
    }

    fn title_for(resource_key: &str) -> String {
        format!("{}: {}", LOCK_LABEL, resource_key)
    }
}

#[async_trait]
impl LockStore for IssueLockStore<'_> {
    async fn find(&self, resource_key: &str) -> Result<Vec<LockRecord>, CoordinationError> {
        let issues = self
            .hub
            .list_open_issues(LOCK_LABEL)
            .await
            .map_err(|e| CoordinationError::StoreUnreachable(e.to_string()))?;
        let title = Self::title_for(resource_key);
        Ok(issues
            .into_iter()
            .filter(|i| i.title == title)
            .map(|i| LockRecord {
                lock_id: i.number,
                resource_key: resource_key.to_string(),
                worker: String::new(),
                created_at: i.created_at,
            })
            .collect())
    }

    async fn create(
        &self,
        resource_key: &str,
        worker: &str,
    ) -> Result<LockRecord, CoordinationError> {
        let body = format!(
            "Automated investigation lock for `{}`, held by worker `{}`. \
             Closed automatically when the investigation concludes or expires.",
            resource_key, worker
        );
        let issue = self
            .hub
            .create_issue(
                &Self::title_for(resource_key),
                &body,
                &[LOCK_LABEL.to_string()],
            )
            .await
            .map_err(|e| CoordinationError::StoreUnreachable(e.to_string()))?;
        Ok(LockRecord {
            lock_id: issue.number,
            resource_key: resource_key.to_string(),
            worker: worker.to_string(),
            created_at: issue.created_at,
        })
    }

    async fn retire(&self, record: &LockRecord) -> Result<(), CoordinationError> {
        self.hub
            .close_issue(record.lock_id)
            .await
            .map_err(|e| CoordinationError::RetireFailed {
                lock_id: record.lock_id,
                message: e.to_string(),
            })
    }

    async fn attach_waiter(
        &self,
        record: &LockRecord,
        worker: &str,
    ) -> Result<(), CoordinationError> {
        self.hub
            .comment(
                record.lock_id,
                &format!("Worker `{}` observed this lock and skipped.", worker),
            )
            .await
            .map_err(|e| CoordinationError::StoreUnreachable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // Scripted store: each `find` pops the next canned response, so tests
    // model propagation lag exactly.
    struct ScriptedStore {
        finds: Mutex<VecDeque<Result<Vec<LockRecord>, CoordinationError>>>,
        next_id: Mutex<u64>,
        retired: Mutex<Vec<u64>>,
        waiters: Mutex<Vec<u64>>,
    }

    impl ScriptedStore {
        fn new(finds: Vec<Result<Vec<LockRecord>, CoordinationError>>, next_id: u64) -> Self {
            Self {
                finds: Mutex::new(finds.into()),
                next_id: Mutex::new(next_id),
                retired: Mutex::new(Vec::new()),
                waiters: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LockStore for ScriptedStore {
        async fn find(&self, _key: &str) -> Result<Vec<LockRecord>, CoordinationError> {
            self.finds
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn create(&self, key: &str, worker: &str) -> Result<LockRecord, CoordinationError> {
            let id = *self.next_id.lock().unwrap();
            Ok(record(id, key, worker, 0))
        }

        async fn retire(&self, r: &LockRecord) -> Result<(), CoordinationError> {
            self.retired.lock().unwrap().push(r.lock_id);
            Ok(())
        }

        async fn attach_waiter(
            &self,
            r: &LockRecord,
            _worker: &str,
        ) -> Result<(), CoordinationError> {
            self.waiters.lock().unwrap().push(r.lock_id);
            Ok(())
        }
    }

    fn record(id: u64, key: &str, worker: &str, age_secs: i64) -> LockRecord {
        LockRecord {
            lock_id: id,
            resource_key: key.to_string(),
            worker: worker.to_string(),
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn fast_config() -> CoordinationConfig {
        CoordinationConfig {
            enabled: true,
            probe_attempts: 3,
            probe_delay_ms: 0,
            reconcile_delay_ms: 0,
            lock_ttl_secs: 3_600,
        }
    }

    #[tokio::test]
    async fn disabled_coordination_always_proceeds() {
        let store = ScriptedStore::new(vec![Err(CoordinationError::StoreUnreachable("x".into()))], 1);
        let config = CoordinationConfig {
            enabled: false,
            ..fast_config()
        };
        let outcome = Coordinator::new(&store, config).claim("F1", "w1").await;
        assert_eq!(outcome, ClaimOutcome::Owner { lock: None });
        // The store was never consulted.
        assert_eq!(store.finds.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn existing_lock_means_skip_with_waiter() {
        let holder = record(7, "F1", "w1", 60);
        let store = ScriptedStore::new(vec![Ok(vec![holder.clone()])], 8);
        let outcome = Coordinator::new(&store, fast_config()).claim("F1", "w2").await;
        assert_eq!(
            outcome,
            ClaimOutcome::Skip {
                holder: Some(holder)
            }
        );
        assert_eq!(*store.waiters.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn lock_appearing_on_a_later_probe_is_honored() {
        // First two probes miss it; the third catches up.
        let holder = record(7, "F1", "w1", 60);
        let store = ScriptedStore::new(
            vec![Ok(vec![]), Ok(vec![]), Ok(vec![holder.clone()])],
            8,
        );
        let outcome = Coordinator::new(&store, fast_config()).claim("F1", "w2").await;
        assert!(matches!(outcome, ClaimOutcome::Skip { .. }));
    }

    #[tokio::test]
    async fn uncontended_create_becomes_owner() {
        let own = record(5, "F1", "w1", 0);
        let store = ScriptedStore::new(
            vec![Ok(vec![]), Ok(vec![]), Ok(vec![]), Ok(vec![own.clone()])],
            5,
        );
        let outcome = Coordinator::new(&store, fast_config()).claim("F1", "w1").await;
        match outcome {
            ClaimOutcome::Owner { lock: Some(lock) } => assert_eq!(lock.lock_id, 5),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(store.retired.lock().unwrap().is_empty());
    }

    // Both racing workers must converge on the same winner no matter which
    // create the store applied first.
    #[tokio::test]
    async fn create_race_resolves_to_lowest_lock_id() {
        for (own_id, other_id) in [(5u64, 9u64), (9, 5)] {
            let both = vec![record(own_id, "F1", "me", 0), record(other_id, "F1", "them", 0)];
            let store = ScriptedStore::new(
                vec![Ok(vec![]), Ok(vec![]), Ok(vec![]), Ok(both)],
                own_id,
            );
            let outcome = Coordinator::new(&store, fast_config()).claim("F1", "me").await;
            if own_id < other_id {
                assert!(
                    matches!(outcome, ClaimOutcome::Owner { .. }),
                    "lowest id should own"
                );
                assert!(store.retired.lock().unwrap().is_empty());
            } else {
                match outcome {
                    ClaimOutcome::Skip { holder: Some(h) } => assert_eq!(h.lock_id, other_id),
                    other => panic!("unexpected outcome: {:?}", other),
                }
                assert_eq!(*store.retired.lock().unwrap(), vec![own_id]);
            }
        }
    }

    #[tokio::test]
    async fn expired_lock_is_ignored_and_retired() {
        let stale = record(3, "F1", "w1", 7_200);
        let fresh_own = record(9, "F1", "w2", 0);
        let store = ScriptedStore::new(
            vec![
                Ok(vec![stale.clone()]),
                Ok(vec![stale.clone()]),
                Ok(vec![stale.clone()]),
                Ok(vec![stale, fresh_own]),
            ],
            9,
        );
        let outcome = Coordinator::new(&store, fast_config()).claim("F1", "w2").await;
        assert!(matches!(outcome, ClaimOutcome::Owner { .. }));
        // The stale record is closed once, not once per observation.
        assert_eq!(*store.retired.lock().unwrap(), vec![3]);
    }

    // The reconcile re-read can lag behind our own create and return only a
    // rival's record. Our in-hand record still participates in the
    // tie-break, so the lowest id keeps ownership.
    #[tokio::test]
    async fn reconcile_read_missing_own_record_keeps_ownership() {
        let rival = record(9, "F1", "them", 0);
        let store = ScriptedStore::new(
            vec![Ok(vec![]), Ok(vec![]), Ok(vec![]), Ok(vec![rival])],
            5,
        );
        let outcome = Coordinator::new(&store, fast_config()).claim("F1", "me").await;
        match outcome {
            ClaimOutcome::Owner { lock: Some(lock) } => assert_eq!(lock.lock_id, 5),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(store.retired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let store = ScriptedStore::new(
            vec![Err(CoordinationError::StoreUnreachable("503".into()))],
            1,
        );
        let outcome = Coordinator::new(&store, fast_config()).claim("F1", "w1").await;
        assert_eq!(outcome, ClaimOutcome::Owner { lock: None });
    }

    #[tokio::test]
    async fn reconciliation_read_failure_keeps_ownership() {
        let store = ScriptedStore::new(
            vec![
                Ok(vec![]),
                Ok(vec![]),
                Ok(vec![]),
                Err(CoordinationError::StoreUnreachable("timeout".into())),
            ],
            4,
        );
        let outcome = Coordinator::new(&store, fast_config()).claim("F1", "w1").await;
        match outcome {
            ClaimOutcome::Owner { lock: Some(lock) } => assert_eq!(lock.lock_id, 4),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
