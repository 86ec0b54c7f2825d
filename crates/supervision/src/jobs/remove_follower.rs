//! Drop a follower from an over-replicated shard.
//!
//! The leader (position 0) is never removed. Among the followers, one that
//! is absent from Current is preferred; otherwise the last follower goes.

use async_trait::async_trait;
use serde_json::{Value, json};

use arbor_agency::{AgencyTree, Transaction};

use crate::jobs::{
    Job, JobEnv, JobStatus, JobType, clones, compare_server_lists, current_servers, finish,
    job_record, planned_servers, record_str, run_helper, start_transition,
};

/// The removeFollower job.
pub struct RemoveFollower<'a> {
    env: &'a JobEnv,
    snapshot: &'a AgencyTree,
    status: JobStatus,
    job_id: String,
    creator: String,
    database: String,
    collection: String,
    shard: String,
}

impl<'a> RemoveFollower<'a> {
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
        })
    }

    /// Drives the job one step.
    pub async fn run(&self) -> JobStatus {
        run_helper(self).await
    }

    fn todo_record(&self, job_id: &str, collection: &str, shard: &str) -> Value {
        json!({
            "creator": self.creator,
            "type": JobType::RemoveFollower.as_str(),
            "database": self.database,
            "collection": collection,
            "shard": shard,
            "jobId": job_id,
            "timeCreated": JobEnv::now(),
        })
    }
}

#[async_trait]
impl Job for RemoveFollower<'_> {
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
        JobType::RemoveFollower
    }

    fn current_status(&self) -> JobStatus {
        self.status
    }

    fn resource_lock(&self) -> String {
        self.env.paths.blocked_shard(&self.shard)
    }

    async fn create(&self) -> bool {
        tracing::debug!(shard = %self.shard, "todo: remove follower");
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
        self.env.submit("create removeFollower", tx).await
    }

    async fn start(&self) -> bool {
        let planned = planned_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        if planned.len() < 2 {
            finish(
                self.env,
                self.snapshot,
                &self.job_id,
                None,
                false,
                "shard has no follower to remove",
            )
            .await;
            return false;
        }
        let current = current_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        // Prefer a follower that never showed up in Current.
        let victim = planned[1..]
            .iter()
            .find(|server| !current.contains(*server))
            .cloned()
            .unwrap_or_else(|| planned[planned.len() - 1].clone());

        let Some(record) = job_record(self.snapshot, JobStatus::ToDo, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "failed to get ToDo record from snapshot");
            return false;
        };

        let remaining: Vec<String> =
            planned.iter().filter(|server| **server != victim).cloned().collect();
        let plan_path =
            self.env.paths.plan_shard_servers(&self.database, &self.collection, &self.shard);
        let tx = start_transition(self.env, record, &self.job_id)
            .set(self.env.paths.abs(&plan_path), json!(remaining))
            .set(self.env.paths.abs(&self.resource_lock()), json!({"jobId": self.job_id}))
            .increment(self.env.paths.abs(self.env.paths.plan_version()))
            .require_old(self.env.paths.abs(&plan_path), json!(planned))
            .require_old_empty(self.env.paths.abs(&self.resource_lock()), true);

        let applied = self.env.submit("start removeFollower", tx).await;
        if applied {
            tracing::info!(shard = %self.shard, follower = %victim, "pending: remove follower");
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
}
