//! The supervisor loop.
//!
//! One instance per process; only the one on the agency leader acts. The
//! loop waits for the cluster data to be initialized, then ticks at the
//! configured frequency: refill the job id window, refresh the cached
//! snapshots under the process-wide mutex, run schema upgrades and health
//! checks, then dispatch shrink / replication enforcement / job work.
//!
//! Every error inside a tick is logged and dropped; the loop only exits on
//! `begin_shutdown()` or after handling a cluster-wide shutdown request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use arbor_agency::{AgencyClient, AgencyPaths, AgencyTree, TransactOp, Transaction};
use arbor_types::SupervisionConfig;

use crate::enforce::enforce_replication;
use crate::error::SupervisionError;
use crate::health::{HealthCheck, HealthStatus};
use crate::jobs::{JobContext, JobEnv, JobIdAllocator, JobStatus};
use crate::shrink::shrink_cluster;

/// Interval between polls while waiting for cluster initialization.
const INIT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What a tick decided about the loop's future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep ticking.
    Continue,
    /// The supervisor observed its own shutdown signal; stop the loop.
    Stop,
}

/// Cached snapshots, guarded by the process-wide state mutex.
struct CachedState {
    snapshot: AgencyTree,
    transient: AgencyTree,
}

/// The cluster supervisor.
pub struct Supervisor {
    env: JobEnv,
    config: SupervisionConfig,
    ids: JobIdAllocator,
    state: AsyncMutex<CachedState>,
    stop: AtomicBool,
    self_shutdown: AtomicBool,
    wakeup: Notify,
}

impl Supervisor {
    /// Creates a supervisor with entropy-seeded randomness.
    #[must_use]
    pub fn new(agency: Arc<dyn AgencyClient>, config: SupervisionConfig) -> Self {
        Self::with_rng(agency, config, StdRng::from_entropy())
    }

    /// Creates a supervisor with caller-controlled randomness (tests seed
    /// this).
    #[must_use]
    pub fn with_rng(
        agency: Arc<dyn AgencyClient>,
        config: SupervisionConfig,
        rng: StdRng,
    ) -> Self {
        let paths = AgencyPaths::new(config.agency_prefix.clone());
        Self {
            env: JobEnv { agency, paths, rng: Mutex::new(rng) },
            config,
            ids: JobIdAllocator::new(),
            state: AsyncMutex::new(CachedState {
                snapshot: AgencyTree::empty(),
                transient: AgencyTree::empty(),
            }),
            stop: AtomicBool::new(false),
            self_shutdown: AtomicBool::new(false),
            wakeup: Notify::new(),
        }
    }

    /// The shared job environment (exposed for tests and inspectors).
    #[must_use]
    pub fn env(&self) -> &JobEnv {
        &self.env
    }

    /// Signals the loop to stop and wakes every blocking wait.
    pub fn begin_shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wakeup.notify_waiters();
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Runs the supervisor until shutdown.
    pub async fn run(&self) {
        // Before any health work the cluster data must exist; acting on an
        // empty tree would mark every planned server failed.
        while !self.stopping() {
            tokio::select! {
                () = tokio::time::sleep(INIT_POLL_INTERVAL) => {},
                () = self.wakeup.notified() => continue,
            }
            match self.env.agency.read_db().await {
                Ok(tree) => {
                    let under_prefix = tree
                        .get(self.env.paths.prefix())
                        .map(|v| v.as_object().map(Map::len).unwrap_or(0))
                        .unwrap_or(0);
                    if under_prefix > 0 {
                        break;
                    }
                },
                Err(e) => tracing::debug!(error = %e, "agency unreachable during init wait"),
            }
            tracing::debug!("waiting for cluster data to be initialized");
        }

        while !self.stopping() {
            if self.run_once().await == TickOutcome::Stop {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.frequency) => {},
                () = self.wakeup.notified() => {},
            }
        }
    }

    /// Runs exactly one tick.
    pub async fn run_once(&self) -> TickOutcome {
        // New jobs need ids; allocation failure leaves the window empty
        // and job creation blocked until the next tick.
        if self.env.agency.leading() && self.ids.exhausted() {
            if let Err(e) = self.refill_job_ids().await {
                tracing::warn!(error = %e, "failed to acquire job ids from agency");
            }
        }

        let mut state = self.state.lock().await;
        self.refresh_snapshots(&mut state).await;
        let snapshot = state.snapshot.clone();
        let transient = state.transient.clone();

        if self.env.agency.leading() {
            self.upgrade_agency(&snapshot).await;
            self.fix_prototype_chain(&snapshot).await;
            let leading_for = (Utc::now() - self.env.agency.leader_since())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if leading_for > self.config.grace_period {
                HealthCheck::new(&self.env, &snapshot, &transient, self.config.grace_period)
                    .run(&self.ids)
                    .await;
            }
        }

        if snapshot.bool_at(self.env.paths.shutdown()) == Some(true) {
            self.handle_shutdown(&snapshot).await;
        } else if self.self_shutdown.load(Ordering::SeqCst) {
            return TickOutcome::Stop;
        } else if self.env.agency.leading() {
            shrink_cluster(&self.env, &snapshot, &self.ids, self.config.shrink_via_remove_server)
                .await;
            enforce_replication(&self.env, &snapshot, &self.ids).await;
            self.work_jobs(&snapshot).await;
        }
        TickOutcome::Continue
    }

    /// Refreshes the cached snapshots; on failure the previous ones stay
    /// in place and the tick degrades to a no-op.
    async fn refresh_snapshots(&self, state: &mut CachedState) {
        match self.env.agency.read_db().await {
            Ok(tree) => {
                state.snapshot = tree
                    .get(self.env.paths.prefix())
                    .cloned()
                    .map(AgencyTree::new)
                    .unwrap_or_default();
            },
            Err(e) => tracing::warn!(error = %e, "failed to refresh agency snapshot"),
        }
        match self.env.agency.read_transient().await {
            Ok(tree) => {
                state.transient = tree
                    .get(self.env.paths.prefix())
                    .cloned()
                    .map(AgencyTree::new)
                    .unwrap_or_default();
            },
            Err(e) => tracing::warn!(error = %e, "failed to refresh transient snapshot"),
        }
    }

    /// Claims a fresh window of job ids: one conditional increment of
    /// `/Sync/LatestID` plus a read of the new value, atomically.
    async fn refill_job_ids(&self) -> Result<(), SupervisionError> {
        let batch = self.config.job_id_batch;
        let path = self.env.paths.abs(self.env.paths.latest_id());
        let envelope = vec![
            TransactOp::Write(Transaction::new().increment_by(path.clone(), batch)),
            TransactOp::Read(vec![path.clone()]),
        ];
        let result = self.env.agency.transact(envelope).await?;
        let ceiling = result
            .results
            .get(1)
            .and_then(|read| read.get(&path))
            .and_then(Value::as_u64)
            .filter(|_| result.accepted)
            .ok_or(SupervisionError::NoJobIds)?;
        self.ids.refill(ceiling - batch, ceiling);
        Ok(())
    }

    /// Legacy schema upgrade: `/Target/FailedServers` was once an array;
    /// rewrite it as an object keyed by server.
    async fn upgrade_agency(&self, snapshot: &AgencyTree) {
        let failed_servers = self.env.paths.failed_servers();
        let Some(Value::Array(entries)) = snapshot.get(failed_servers) else {
            return;
        };
        let mut object = Map::new();
        for entry in entries {
            if let Some(server) = entry.as_str() {
                object.insert(server.to_string(), json!({}));
            }
        }
        let tx = Transaction::new()
            .set(self.env.paths.abs(failed_servers), Value::Object(object))
            .require_old(self.env.paths.abs(failed_servers), Value::Array(entries.clone()));
        self.env.submit("upgrade FailedServers schema", tx).await;
    }

    /// Normalizes `distributeShardsLike` chains so every clone points
    /// directly at its root prototype, in one guarded multi-op
    /// transaction.
    async fn fix_prototype_chain(&self, snapshot: &AgencyTree) {
        let collections_root = self.env.paths.plan_collections();
        let mut tx = Transaction::new();

        for (database, _) in snapshot.children(collections_root) {
            let db_path = format!("{collections_root}/{database}");
            for (collection, descriptor) in snapshot.children(&db_path) {
                let Some(prototype) =
                    descriptor.get("distributeShardsLike").and_then(Value::as_str)
                else {
                    continue;
                };
                if prototype.is_empty() {
                    continue;
                }
                let root = resolve_prototype(snapshot, &db_path, prototype);
                if root != prototype {
                    let like_path = self
                        .env
                        .paths
                        .abs(&format!("{db_path}/{collection}/distributeShardsLike"));
                    tx = tx
                        .set(like_path.clone(), json!(root))
                        .require_old(like_path, json!(prototype));
                }
            }
        }

        if !tx.is_empty()
            && !self.env.submit("normalize distributeShardsLike", tx).await
        {
            tracing::warn!("plan changed since resolution of distributeShardsLike");
        }
    }

    /// Handles a cluster-wide shutdown request: wait until every
    /// registered server has left GOOD, then delete the key as leader and
    /// wait for the write to replicate.
    async fn handle_shutdown(&self, snapshot: &AgencyTree) {
        self.self_shutdown.store(true, Ordering::SeqCst);
        tracing::debug!("waiting for servers to shut down");

        let mut servers_cleared = true;
        for (server, _) in snapshot.children(self.env.paths.servers_registered()) {
            if server == "Version" {
                continue;
            }
            let health_path = format!("{}/Status", self.env.paths.health(server));
            if snapshot.str_at(&health_path) == Some(HealthStatus::Good.as_str()) {
                servers_cleared = false;
            } else {
                tracing::warn!(server, "server did not shut down properly it seems");
            }
        }

        if servers_cleared && self.env.agency.leading() {
            let tx =
                Transaction::new().delete(self.env.paths.abs(self.env.paths.shutdown()));
            match self.env.agency.write(vec![tx]).await {
                Ok(result) if result.applied_one() => {
                    if !self.env.agency.wait_for(result.indices[0]).await {
                        tracing::error!("shutdown-key delete was not replicated to followers");
                    }
                },
                Ok(result) => {
                    tracing::error!(indices = ?result.indices, "invalid result during shutdown");
                },
                Err(e) => tracing::error!(error = %e, "failed to delete shutdown key"),
            }
        }
    }

    /// Drives every ToDo and Pending job one step.
    async fn work_jobs(&self, snapshot: &AgencyTree) {
        let context = JobContext { env: &self.env, snapshot };
        let todo: Vec<String> =
            snapshot.children("/Target/ToDo").map(|(name, _)| name.to_string()).collect();
        for job_id in todo {
            if let Err(e) = context.run(JobStatus::ToDo, &job_id).await {
                tracing::warn!(error = %e, "job step failed");
            }
        }
        let pending: Vec<String> =
            snapshot.children("/Target/Pending").map(|(name, _)| name.to_string()).collect();
        for job_id in pending {
            if let Err(e) = context.run(JobStatus::Pending, &job_id).await {
                tracing::warn!(error = %e, "job step failed");
            }
        }
    }
}

/// Follows a `distributeShardsLike` chain to its root.
fn resolve_prototype(snapshot: &AgencyTree, db_path: &str, start: &str) -> String {
    let mut current = start.to_string();
    let mut hops = 0;
    loop {
        let next = snapshot
            .str_at(&format!("{db_path}/{current}/distributeShardsLike"))
            .filter(|like| !like.is_empty());
        match next {
            Some(next) if hops < 64 => {
                current = next.to_string();
                hops += 1;
            },
            _ => return current,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_resolve_prototype_follows_chain() {
        let snapshot = AgencyTree::new(json!({
            "Plan": {"Collections": {"db": {
                "a": {"distributeShardsLike": "b"},
                "b": {"distributeShardsLike": "c"},
                "c": {},
            }}},
        }));
        assert_eq!(resolve_prototype(&snapshot, "/Plan/Collections/db", "b"), "c");
        assert_eq!(resolve_prototype(&snapshot, "/Plan/Collections/db", "c"), "c");
    }

    #[test]
    fn test_resolve_prototype_bounded_on_cycle() {
        let snapshot = AgencyTree::new(json!({
            "Plan": {"Collections": {"db": {
                "a": {"distributeShardsLike": "b"},
                "b": {"distributeShardsLike": "a"},
            }}},
        }));
        // Must terminate despite the cycle.
        let _ = resolve_prototype(&snapshot, "/Plan/Collections/db", "a");
    }
}
