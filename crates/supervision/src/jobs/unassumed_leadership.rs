//! Give a leaderless shard a new leader.
//!
//! Scheduled by failedServer for shards whose Current entry is empty: no
//! holder ever reported in, so there is no follower to promote. The start
//! transaction rewrites plan position 0 to a healthy available server.

use async_trait::async_trait;
use serde_json::{Value, json};

use arbor_agency::AgencyTree;

use crate::health::HealthStatus;
use crate::jobs::{
    Job, JobEnv, JobStatus, JobType, available_servers, current_servers, finish, job_record,
    planned_servers, record_str, run_helper, start_transition,
};

/// The unassumedLeadership job.
pub struct UnassumedLeadership<'a> {
    env: &'a JobEnv,
    snapshot: &'a AgencyTree,
    status: JobStatus,
    job_id: String,
    creator: String,
    database: String,
    collection: String,
    shard: String,
    server: String,
}

impl<'a> UnassumedLeadership<'a> {
    /// Constructs a fresh job (not yet in any bucket).
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        env: &'a JobEnv,
        snapshot: &'a AgencyTree,
        job_id: impl Into<String>,
        creator: impl Into<String>,
        database: impl Into<String>,
        collection: impl Into<String>,
        shard: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            env,
            snapshot,
            status: JobStatus::NotFound,
            job_id: job_id.into(),
            creator: creator.into(),
            database: database.into(),
            collection: collection.into(),
            shard: shard.into(),
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
            database: record_str(record, "database")?,
            collection: record_str(record, "collection")?,
            shard: record_str(record, "shard")?,
            server: record_str(record, "server")?,
        })
    }

    /// Drives the job one step.
    pub async fn run(&self) -> JobStatus {
        run_helper(self).await
    }

    fn healthy_candidates(&self) -> Vec<String> {
        available_servers(self.snapshot)
            .into_iter()
            .filter(|candidate| *candidate != self.server)
            .filter(|candidate| {
                let path = format!("{}/Status", self.env.paths.health(candidate));
                self.snapshot.str_at(&path) == Some(HealthStatus::Good.as_str())
            })
            .collect()
    }
}

#[async_trait]
impl Job for UnassumedLeadership<'_> {
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
        JobType::UnassumedLeadership
    }

    fn current_status(&self) -> JobStatus {
        self.status
    }

    fn resource_lock(&self) -> String {
        self.env.paths.blocked_shard(&self.shard)
    }

    async fn create(&self) -> bool {
        tracing::debug!(shard = %self.shard, "todo: reassign unassumed leadership");
        let tx = arbor_agency::Transaction::new().set(
            self.env.paths.abs(&format!("/Target/ToDo/{}", self.job_id)),
            json!({
                "creator": self.creator,
                "type": JobType::UnassumedLeadership.as_str(),
                "database": self.database,
                "collection": self.collection,
                "shard": self.shard,
                "server": self.server,
                "jobId": self.job_id,
                "timeCreated": JobEnv::now(),
            }),
        );
        self.env.submit("create unassumedLeadership", tx).await
    }

    async fn start(&self) -> bool {
        let planned = planned_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        if planned.is_empty() {
            finish(self.env, self.snapshot, &self.job_id, None, false, "shard has no plan entry")
                .await;
            return false;
        }
        let candidates = self.healthy_candidates();
        let Some(leader) = self.env.pick_random(&candidates) else {
            // No healthy server yet; stay in ToDo for the next tick.
            tracing::debug!(shard = %self.shard, "no healthy server available for leadership");
            return false;
        };
        let mut desired = planned.clone();
        desired[0] = leader.clone();

        let Some(record) = job_record(self.snapshot, JobStatus::ToDo, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "failed to get ToDo record from snapshot");
            return false;
        };
        let plan_path =
            self.env.paths.plan_shard_servers(&self.database, &self.collection, &self.shard);
        let tx = start_transition(self.env, record, &self.job_id)
            .set(self.env.paths.abs(&plan_path), json!(desired))
            .set(self.env.paths.abs(&self.resource_lock()), json!({"jobId": self.job_id}))
            .increment(self.env.paths.abs(self.env.paths.plan_version()))
            .require_old(self.env.paths.abs(&plan_path), json!(planned))
            .require_old_empty(self.env.paths.abs(&self.resource_lock()), true);

        let applied = self.env.submit("start unassumedLeadership", tx).await;
        if applied {
            tracing::info!(shard = %self.shard, leader = %leader, "pending: assign leadership");
        }
        applied
    }

    async fn status_check(&self) -> JobStatus {
        let planned = planned_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        let current = current_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        if current.first().is_none() || planned.first() != current.first() {
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
