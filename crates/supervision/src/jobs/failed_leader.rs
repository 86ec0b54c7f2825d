//! Replace the failed leader of one shard.
//!
//! Structurally a failedFollower, but the plan rewrite reorders the list:
//! the old position-1 follower becomes the leader and the replacement
//! server joins at the tail. `[A, B, C]` with failed leader `A` and
//! replacement `X` becomes `[B, C, X]`.

use async_trait::async_trait;
use serde_json::{Value, json};

use arbor_agency::{AgencyTree, Transaction};

use crate::health::HealthStatus;
use crate::jobs::{
    Job, JobEnv, JobStatus, JobType, clones, compare_server_lists, current_servers, finish,
    job_record, planned_servers, record_str, run_helper, start_transition,
};

/// The failedLeader job.
pub struct FailedLeader<'a> {
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

impl<'a> FailedLeader<'a> {
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

    fn todo_record(&self, job_id: &str, collection: &str, shard: &str) -> Value {
        json!({
            "creator": self.creator,
            "type": JobType::FailedLeader.as_str(),
            "database": self.database,
            "collection": collection,
            "shard": shard,
            "fromServer": self.from,
            "toServer": self.to,
            "jobId": job_id,
            "timeCreated": JobEnv::now(),
        })
    }

    /// The reordered plan list: promote position 1, append the
    /// replacement.
    fn promoted_list(&self, planned: &[String]) -> Vec<String> {
        let mut reordered: Vec<String> =
            planned.iter().filter(|server| **server != self.from).cloned().collect();
        reordered.push(self.to.clone());
        reordered
    }
}

#[async_trait]
impl Job for FailedLeader<'_> {
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
        JobType::FailedLeader
    }

    fn current_status(&self) -> JobStatus {
        self.status
    }

    fn resource_lock(&self) -> String {
        self.env.paths.blocked_shard(&self.shard)
    }

    async fn create(&self) -> bool {
        tracing::debug!(
            shard = %self.shard, from = %self.from, to = %self.to,
            "todo: handle leader failover"
        );
        let mut tx = Transaction::new();
        let members = clones(self.snapshot, &self.database, &self.collection, &self.shard);
        for (sub, member) in members.iter().enumerate() {
            let child_id =
                if sub == 0 { self.job_id.clone() } else { format!("{}-{sub}", self.job_id) };
            tx = tx.set(
                self.env.paths.abs(&format!("/Target/ToDo/{child_id}")),
                self.todo_record(&child_id, &member.collection, &member.shard),
            );
        }
        self.env.submit("create failedLeader", tx).await
    }

    async fn start(&self) -> bool {
        let health_path = format!("{}/Status", self.env.paths.health(&self.from));
        if self.snapshot.str_at(&health_path) == Some(HealthStatus::Good.as_str()) {
            tracing::debug!(server = %self.from, "server recovered, not starting leader repair");
            return false;
        }
        let planned = planned_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        if planned.first() != Some(&self.from) {
            finish(
                self.env,
                self.snapshot,
                &self.job_id,
                None,
                false,
                "server is no longer the shard leader",
            )
            .await;
            return false;
        }
        let Some(record) = job_record(self.snapshot, JobStatus::ToDo, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "failed to get ToDo record from snapshot");
            return false;
        };

        let plan_path =
            self.env.paths.plan_shard_servers(&self.database, &self.collection, &self.shard);
        let tx = start_transition(self.env, record, &self.job_id)
            .set(self.env.paths.abs(&plan_path), json!(self.promoted_list(&planned)))
            .set(self.env.paths.abs(&self.resource_lock()), json!({"jobId": self.job_id}))
            .push(self.env.paths.abs(&self.env.paths.failed_server(&self.from)), json!(self.shard))
            .increment(self.env.paths.abs(self.env.paths.plan_version()))
            .require_old_empty(self.env.paths.abs(&self.resource_lock()), true)
            .require_old(self.env.paths.abs(&plan_path), json!(planned));

        let applied = self.env.submit("start failedLeader", tx).await;
        if applied {
            tracing::info!(
                shard = %self.shard, from = %self.from, to = %self.to,
                "pending: change leadership"
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
        let erase = Transaction::new().erase(
            self.env.paths.abs(&self.env.paths.failed_server(&self.from)),
            json!(self.shard),
        );
        self.env.submit("erase repaired shard", erase).await;

        if finish(self.env, self.snapshot, &self.job_id, Some(&self.resource_lock()), true, "")
            .await
        {
            JobStatus::Finished
        } else {
            JobStatus::Pending
        }
    }
}
