//! Move one shard from a server to another.
//!
//! Follower moves substitute the target in place. Leader moves use the
//! same list shape as a leader failover: the position-1 follower is
//! promoted and the target joins at the tail, so convergence checks are
//! shared with the failure jobs.

use async_trait::async_trait;
use serde_json::{Value, json};

use arbor_agency::AgencyTree;

use crate::jobs::{
    Job, JobEnv, JobStatus, JobType, compare_server_lists, current_servers, finish, job_record,
    planned_servers, record_str, run_helper, start_transition,
};

/// The moveShard job.
pub struct MoveShard<'a> {
    env: &'a JobEnv,
    snapshot: &'a AgencyTree,
    status: JobStatus,
    job_id: String,
    creator: String,
    database: String,
    collection: String,
    shard: String,
    from: String,
    to: String,
}

impl<'a> MoveShard<'a> {
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
        from: impl Into<String>,
        to: impl Into<String>,
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
            from: from.into(),
            to: to.into(),
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
            from: record_str(record, "fromServer")?,
            to: record_str(record, "toServer")?,
        })
    }

    /// Drives the job one step.
    pub async fn run(&self) -> JobStatus {
        run_helper(self).await
    }
}

#[async_trait]
impl Job for MoveShard<'_> {
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
        JobType::MoveShard
    }

    fn current_status(&self) -> JobStatus {
        self.status
    }

    fn resource_lock(&self) -> String {
        self.env.paths.blocked_shard(&self.shard)
    }

    async fn create(&self) -> bool {
        tracing::debug!(
            shard = %self.shard, from = %self.from, to = %self.to, "todo: move shard"
        );
        let tx = arbor_agency::Transaction::new().set(
            self.env.paths.abs(&format!("/Target/ToDo/{}", self.job_id)),
            json!({
                "creator": self.creator,
                "type": JobType::MoveShard.as_str(),
                "database": self.database,
                "collection": self.collection,
                "shard": self.shard,
                "fromServer": self.from,
                "toServer": self.to,
                "jobId": self.job_id,
                "timeCreated": JobEnv::now(),
            }),
        );
        self.env.submit("create moveShard", tx).await
    }

    async fn start(&self) -> bool {
        let planned = planned_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        let Some(position) = planned.iter().position(|server| *server == self.from) else {
            finish(
                self.env,
                self.snapshot,
                &self.job_id,
                None,
                false,
                "fromServer no longer holds the shard",
            )
            .await;
            return false;
        };
        if planned.contains(&self.to) {
            finish(
                self.env,
                self.snapshot,
                &self.job_id,
                None,
                false,
                "toServer already holds the shard",
            )
            .await;
            return false;
        }

        let moved: Vec<String> = if position == 0 {
            let mut list: Vec<String> =
                planned.iter().skip(1).cloned().collect();
            list.push(self.to.clone());
            list
        } else {
            planned
                .iter()
                .map(|server| if *server == self.from { self.to.clone() } else { server.clone() })
                .collect()
        };

        let Some(record) = job_record(self.snapshot, JobStatus::ToDo, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "failed to get ToDo record from snapshot");
            return false;
        };
        let plan_path =
            self.env.paths.plan_shard_servers(&self.database, &self.collection, &self.shard);
        let tx = start_transition(self.env, record, &self.job_id)
            .set(self.env.paths.abs(&plan_path), json!(moved))
            .set(self.env.paths.abs(&self.resource_lock()), json!({"jobId": self.job_id}))
            .increment(self.env.paths.abs(self.env.paths.plan_version()))
            .require_old(self.env.paths.abs(&plan_path), json!(planned))
            .require_old_empty(self.env.paths.abs(&self.resource_lock()), true);

        let applied = self.env.submit("start moveShard", tx).await;
        if applied {
            tracing::info!(
                shard = %self.shard, from = %self.from, to = %self.to, "pending: move shard"
            );
        }
        applied
    }

    async fn status_check(&self) -> JobStatus {
        let planned = planned_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        let current = current_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        if !compare_server_lists(&planned, &current) {
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

    async fn abort(&self) {
        // Revert the plan to keep the source server if the move never
        // converged; then record the failure.
        finish(
            self.env,
            self.snapshot,
            &self.job_id,
            Some(&self.resource_lock()),
            false,
            "aborted",
        )
        .await;
    }
}
