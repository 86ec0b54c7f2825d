//! Add a follower to an under-replicated shard.
//!
//! Scheduled by the replication driver without a target; the start
//! transaction resolves one: a random available server holding neither the
//! plan nor the current copy of the shard. Preconditions pin both lists to
//! the observed state and require the shard to be unlocked.

use async_trait::async_trait;
use serde_json::{Value, json};

use arbor_agency::{AgencyTree, Transaction};

use crate::jobs::{
    Job, JobEnv, JobStatus, JobType, available_servers, clones, current_servers, finish,
    job_record, planned_servers, record_str, run_helper, start_transition,
};

/// The addFollower job.
pub struct AddFollower<'a> {
    env: &'a JobEnv,
    snapshot: &'a AgencyTree,
    status: JobStatus,
    job_id: String,
    creator: String,
    database: String,
    collection: String,
    shard: String,
    new_followers: Vec<String>,
}

impl<'a> AddFollower<'a> {
    /// Constructs a fresh job; `new_followers` may be empty, in which case
    /// the start transaction picks a target.
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
        new_followers: Vec<String>,
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
            new_followers,
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
        let new_followers = record
            .get("newFollower")
            .and_then(Value::as_array)
            .map(|items| {
                items.iter().filter_map(Value::as_str).map(str::to_string).collect()
            })
            .unwrap_or_default();
        Some(Self {
            env,
            snapshot,
            status,
            job_id: job_id.to_string(),
            creator: record_str(record, "creator").unwrap_or_else(|| "supervision".to_string()),
            database: record_str(record, "database")?,
            collection: record_str(record, "collection")?,
            shard: record_str(record, "shard")?,
            new_followers,
        })
    }

    /// Drives the job one step.
    pub async fn run(&self) -> JobStatus {
        run_helper(self).await
    }

    fn todo_record(&self, job_id: &str, collection: &str, shard: &str) -> Value {
        json!({
            "creator": self.creator,
            "type": JobType::AddFollower.as_str(),
            "database": self.database,
            "collection": collection,
            "shard": shard,
            "newFollower": self.new_followers,
            "jobId": job_id,
            "timeCreated": JobEnv::now(),
        })
    }
}

#[async_trait]
impl Job for AddFollower<'_> {
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
        JobType::AddFollower
    }

    fn current_status(&self) -> JobStatus {
        self.status
    }

    fn resource_lock(&self) -> String {
        self.env.paths.blocked_shard(&self.shard)
    }

    async fn create(&self) -> bool {
        tracing::debug!(shard = %self.shard, "todo: add follower");
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
        self.env.submit("create addFollower", tx).await
    }

    async fn start(&self) -> bool {
        let planned = planned_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        let current = current_servers(self.snapshot, &self.database, &self.collection, &self.shard);

        let targets = if self.new_followers.is_empty() {
            let candidates: Vec<String> = available_servers(self.snapshot)
                .into_iter()
                .filter(|server| !planned.contains(server) && !current.contains(server))
                .collect();
            match self.env.pick_random(&candidates) {
                Some(target) => vec![target],
                None => {
                    tracing::info!(shard = %self.shard, "no server available as new follower");
                    return false;
                },
            }
        } else {
            self.new_followers.clone()
        };
        for target in &targets {
            if current.contains(target) {
                finish(
                    self.env,
                    self.snapshot,
                    &self.job_id,
                    None,
                    false,
                    "newFollower must not be already holding the shard",
                )
                .await;
                return false;
            }
            if planned.contains(target) {
                finish(
                    self.env,
                    self.snapshot,
                    &self.job_id,
                    None,
                    false,
                    "newFollower must not be planned for shard already",
                )
                .await;
                return false;
            }
        }

        let Some(record) = job_record(self.snapshot, JobStatus::ToDo, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "failed to get ToDo record from snapshot");
            return false;
        };
        let mut record = record.clone();
        if let Some(map) = record.as_object_mut() {
            map.insert("newFollower".to_string(), json!(targets));
        }

        let plan_path = self
            .env
            .paths
            .plan_shard_servers(&self.database, &self.collection, &self.shard);
        let current_path = self
            .env
            .paths
            .current_shard_servers(&self.database, &self.collection, &self.shard);
        let mut tx = start_transition(self.env, &record, &self.job_id)
            .set(self.env.paths.abs(&self.resource_lock()), json!({"jobId": self.job_id}));
        for target in &targets {
            tx = tx.push(self.env.paths.abs(&plan_path), json!(target));
        }
        let tx = tx
            .increment(self.env.paths.abs(self.env.paths.plan_version()))
            .require_old(self.env.paths.abs(&current_path), json!(current))
            .require_old(self.env.paths.abs(&plan_path), json!(planned))
            .require_old_empty(self.env.paths.abs(&self.resource_lock()), true);

        let applied = self.env.submit("start addFollower", tx).await;
        if applied {
            tracing::info!(shard = %self.shard, followers = ?targets, "pending: add follower");
        }
        applied
    }

    async fn status_check(&self) -> JobStatus {
        let current = current_servers(self.snapshot, &self.database, &self.collection, &self.shard);
        let record = job_record(self.snapshot, JobStatus::Pending, &self.job_id);
        let targets: Vec<String> = record
            .and_then(|r| r.get("newFollower"))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_else(|| self.new_followers.clone());
        if targets.is_empty() || !targets.iter().all(|t| current.contains(t)) {
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
