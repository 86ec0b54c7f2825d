//! Repair everything a failed server held.
//!
//! Created atomically with the BAD→FAILED health transition. On start the
//! job locks the server and walks the plan: for every shard the failed
//! server leads it spawns a failedLeader child, for every shard it merely
//! follows (non-clone collections with replication) a failedFollower child
//! with a random available target, and for shards with no live holders at
//! all an unassumedLeadership child. The job finishes once all children
//! have drained; if the server reports GOOD again first, unstarted
//! children are deleted best-effort.

use async_trait::async_trait;
use serde_json::{Value, json};

use arbor_agency::{AgencyTree, Transaction};

use crate::health::HealthStatus;
use crate::jobs::{
    FailedFollower, FailedLeader, Job, JobContext, JobEnv, JobStatus, JobType, UnassumedLeadership,
    abortable, available_servers, finish, job_record, record_str, run_helper, start_transition,
};

/// The failedServer job.
pub struct FailedServer<'a> {
    env: &'a JobEnv,
    snapshot: &'a AgencyTree,
    status: JobStatus,
    job_id: String,
    creator: String,
    server: String,
}

impl<'a> FailedServer<'a> {
    /// Constructs a fresh job (not yet in any bucket).
    #[must_use]
    pub fn new(
        env: &'a JobEnv,
        snapshot: &'a AgencyTree,
        job_id: impl Into<String>,
        creator: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            env,
            snapshot,
            status: JobStatus::NotFound,
            job_id: job_id.into(),
            creator: creator.into(),
            server: server.into(),
        }
    }

    /// Rehydrates the job from its agency record.
    #[must_use]
    pub fn from_record(
        env: &'a JobEnv,
        snapshot: &'a AgencyTree,
        status: JobStatus,
        job_id: &str,
        record: &Value,
    ) -> Option<Self> {
        Some(Self {
            env,
            snapshot,
            status,
            job_id: job_id.to_string(),
            creator: record_str(record, "creator").unwrap_or_else(|| "supervision".to_string()),
            server: record_str(record, "server")?,
        })
    }

    /// Drives the job one step.
    pub async fn run(&self) -> JobStatus {
        run_helper(self).await
    }

    /// The ToDo entry plus its preconditions, for merging into the health
    /// check's status transaction.
    ///
    /// The create precondition asserts `BAD`: that is the status on record
    /// at the moment the check decides to mark the server FAILED.
    #[must_use]
    pub fn create_transaction(&self) -> Transaction {
        let paths = &self.env.paths;
        Transaction::new()
            .set(
                paths.abs(&format!("/Target/ToDo/{}", self.job_id)),
                json!({
                    "type": JobType::FailedServer.as_str(),
                    "server": self.server,
                    "jobId": self.job_id,
                    "creator": self.creator,
                    "timeCreated": JobEnv::now(),
                }),
            )
            .set(paths.abs(&paths.failed_server(&self.server)), json!([]))
            .require_old(
                paths.abs(&format!("{}/Status", paths.health(&self.server))),
                json!(HealthStatus::Bad.as_str()),
            )
            .require_old(
                paths.abs(paths.failed_servers()),
                self.snapshot.get(paths.failed_servers()).cloned().unwrap_or(json!({})),
            )
    }

    /// Schedules repair children for every shard the failed server holds.
    async fn schedule_children(&self) {
        let mut sub = 0usize;
        let collections_root = self.env.paths.plan_collections();
        let databases: Vec<String> =
            self.snapshot.children(collections_root).map(|(name, _)| name.to_string()).collect();

        for database in databases {
            let collections: Vec<(String, Value)> = self
                .snapshot
                .children(&format!("{collections_root}/{database}"))
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect();

            for (collection, descriptor) in collections {
                let replication_factor =
                    descriptor.get("replicationFactor").and_then(Value::as_u64).unwrap_or(1);
                let is_clone = descriptor
                    .get("distributeShardsLike")
                    .and_then(Value::as_str)
                    .is_some_and(|like| !like.is_empty());
                let current_root =
                    format!("/Current/Collections/{database}/{collection}");
                let has_current = self.snapshot.children(&current_root).count() > 0;

                let shards: Vec<(String, Vec<String>)> = self
                    .snapshot
                    .children(&format!("{collections_root}/{database}/{collection}/shards"))
                    .map(|(shard, servers)| {
                        let list = servers
                            .as_array()
                            .map(|items| {
                                items
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default();
                        (shard.to_string(), list)
                    })
                    .collect();

                if !has_current {
                    for (shard, _) in &shards {
                        let child_id = format!("{}-{sub}", self.job_id);
                        sub += 1;
                        UnassumedLeadership::new(
                            self.env,
                            self.snapshot,
                            child_id,
                            self.job_id.clone(),
                            database.clone(),
                            collection.clone(),
                            shard.clone(),
                            self.server.clone(),
                        )
                        .run()
                        .await;
                    }
                    continue;
                }
                if replication_factor <= 1 {
                    continue;
                }

                for (shard, servers) in &shards {
                    let Some(position) = servers.iter().position(|s| *s == self.server) else {
                        continue;
                    };
                    if position == 0 {
                        // The position-1 follower is promoted by the plan
                        // rewrite; the replacement fills the freed slot.
                        if servers.get(1).is_none() {
                            continue;
                        }
                        let candidates: Vec<String> = available_servers(self.snapshot)
                            .into_iter()
                            .filter(|candidate| !servers.contains(candidate))
                            .collect();
                        let Some(replacement) = self.env.pick_random(&candidates) else {
                            tracing::warn!(
                                shard = %shard,
                                "no replacement server available for failed leader"
                            );
                            continue;
                        };
                        let child_id = format!("{}-{sub}", self.job_id);
                        sub += 1;
                        FailedLeader::new(
                            self.env,
                            self.snapshot,
                            child_id,
                            self.job_id.clone(),
                            database.clone(),
                            collection.clone(),
                            shard.clone(),
                            self.server.clone(),
                            replacement,
                        )
                        .run()
                        .await;
                    } else if !is_clone {
                        let candidates: Vec<String> = available_servers(self.snapshot)
                            .into_iter()
                            .filter(|candidate| !servers.contains(candidate))
                            .collect();
                        let Some(target) = self.env.pick_random(&candidates) else {
                            tracing::warn!(
                                shard = %shard,
                                "no replacement server available for failed follower"
                            );
                            continue;
                        };
                        let child_id = format!("{}-{sub}", self.job_id);
                        sub += 1;
                        FailedFollower::new(
                            self.env,
                            self.snapshot,
                            child_id,
                            self.job_id.clone(),
                            database.clone(),
                            collection.clone(),
                            shard.clone(),
                            self.server.clone(),
                            target,
                        )
                        .run()
                        .await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Job for FailedServer<'_> {
    fn env(&self) -> &JobEnv {
        self.env
    }

    fn snapshot(&self) -> &AgencyTree {
        self.snapshot
    }

    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn job_type(&self) -> JobType {
        JobType::FailedServer
    }

    fn current_status(&self) -> JobStatus {
        self.status
    }

    fn resource_lock(&self) -> String {
        self.env.paths.blocked_server(&self.server)
    }

    async fn create(&self) -> bool {
        tracing::debug!(server = %self.server, "todo: handle failover for db server");
        self.env.submit("create failedServer", self.create_transaction()).await
    }

    async fn start(&self) -> bool {
        let paths = &self.env.paths;
        // Bail out if health went back to anything but FAILED.
        let health_path = format!("{}/Status", paths.health(&self.server));
        if self.snapshot.str_at(&health_path) != Some(HealthStatus::Failed.as_str()) {
            let reason =
                format!("server {} is no longer failed; not starting failedServer job", self.server);
            tracing::info!("{reason}");
            finish(self.env, self.snapshot, &self.job_id, None, false, &reason).await;
            return false;
        }

        // Abort an abortable job currently blocking the server.
        if let Some(blocker) =
            self.snapshot.str_at(&format!("{}/jobId", self.resource_lock()))
        {
            if abortable(self.snapshot, blocker) {
                JobContext { env: self.env, snapshot: self.snapshot }.abort(blocker).await;
            } else {
                return false;
            }
        }

        let Some(record) = job_record(self.snapshot, JobStatus::ToDo, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "failed to get ToDo record from snapshot");
            return false;
        };
        let tx = start_transition(self.env, record, &self.job_id)
            .set(self.env.paths.abs(&self.resource_lock()), json!({"jobId": self.job_id}))
            .require_old_empty(self.env.paths.abs(&self.resource_lock()), true);

        if !self.env.submit("start failedServer", tx).await {
            tracing::info!(job_id = %self.job_id, "precondition failed for starting job");
            return false;
        }
        tracing::debug!(server = %self.server, "pending job for failed db server");
        self.schedule_children().await;
        true
    }

    async fn status_check(&self) -> JobStatus {
        let paths = &self.env.paths;
        let health_path = format!("{}/Status", paths.health(&self.server));
        let server_healthy =
            self.snapshot.str_at(&health_path) == Some(HealthStatus::Good.as_str());

        let prefix = format!("{}-", self.job_id);
        let unstarted: Vec<String> = self
            .snapshot
            .children("/Target/ToDo")
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, _)| name.to_string())
            .collect();
        let started = self
            .snapshot
            .children("/Target/Pending")
            .filter(|(name, _)| name.starts_with(&prefix))
            .count();

        // A recovered server invalidates children that have not started
        // yet; delete them best-effort.
        if server_healthy && !unstarted.is_empty() {
            tracing::info!(
                server = %self.server,
                "server is healthy again, deleting unstarted child jobs"
            );
            let mut tx = Transaction::new();
            for child in &unstarted {
                tx = tx.delete(paths.abs(&format!("/Target/ToDo/{child}")));
            }
            if !self.env.submit("delete unstarted children", tx).await {
                return JobStatus::Pending;
            }
        }

        let open = started + if server_healthy { 0 } else { unstarted.len() };
        if open > 0 {
            return JobStatus::Pending;
        }
        if finish(self.env, self.snapshot, &self.job_id, Some(&self.resource_lock()), true, "")
            .await
        {
            JobStatus::Finished
        } else {
            JobStatus::Pending
        }
    }
}
