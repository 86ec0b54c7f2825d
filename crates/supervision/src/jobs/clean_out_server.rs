//! Drain a server by moving every shard it holds elsewhere.
//!
//! On start the job locks the server and schedules one moveShard child per
//! held shard (random available targets). Once all children drain, the
//! server is pushed onto `/Target/CleanedServers` and the job finishes.

use async_trait::async_trait;
use serde_json::{Value, json};

use arbor_agency::{AgencyTree, Transaction};

use crate::jobs::{
    Job, JobEnv, JobStatus, JobType, MoveShard, available_servers, finish, job_record,
    open_children, record_str, run_helper, start_transition,
};

/// The cleanOutServer job.
pub struct CleanOutServer<'a> {
    env: &'a JobEnv,
    snapshot: &'a AgencyTree,
    status: JobStatus,
    job_id: String,
    creator: String,
    server: String,
}

impl<'a> CleanOutServer<'a> {
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

    /// Shards held by the drained server, as (database, collection, shard,
    /// servers) tuples; clones are skipped (they follow their prototype).
    fn held_shards(&self) -> Vec<(String, String, String, Vec<String>)> {
        let mut held = Vec::new();
        for (database, _) in self.snapshot.children(self.env.paths.plan_collections()) {
            let db_path = format!("{}/{database}", self.env.paths.plan_collections());
            for (collection, descriptor) in self.snapshot.children(&db_path) {
                if descriptor
                    .get("distributeShardsLike")
                    .and_then(Value::as_str)
                    .is_some_and(|like| !like.is_empty())
                {
                    continue;
                }
                for (shard, servers) in self.snapshot.children(&format!("{db_path}/{collection}/shards"))
                {
                    let list: Vec<String> = servers
                        .as_array()
                        .map(|items| {
                            items.iter().filter_map(Value::as_str).map(str::to_string).collect()
                        })
                        .unwrap_or_default();
                    if list.contains(&self.server) {
                        held.push((
                            database.to_string(),
                            collection.to_string(),
                            shard.to_string(),
                            list,
                        ));
                    }
                }
            }
        }
        held
    }
}

#[async_trait]
impl Job for CleanOutServer<'_> {
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
        JobType::CleanOutServer
    }

    fn current_status(&self) -> JobStatus {
        self.status
    }

    fn resource_lock(&self) -> String {
        self.env.paths.blocked_server(&self.server)
    }

    async fn create(&self) -> bool {
        tracing::info!(server = %self.server, "todo: clean out server");
        let tx = Transaction::new().set(
            self.env.paths.abs(&format!("/Target/ToDo/{}", self.job_id)),
            json!({
                "type": JobType::CleanOutServer.as_str(),
                "server": self.server,
                "jobId": self.job_id,
                "creator": self.creator,
                "timeCreated": JobEnv::now(),
            }),
        );
        self.env.submit("create cleanOutServer", tx).await
    }

    async fn start(&self) -> bool {
        let Some(record) = job_record(self.snapshot, JobStatus::ToDo, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "failed to get ToDo record from snapshot");
            return false;
        };
        let tx = start_transition(self.env, record, &self.job_id)
            .set(self.env.paths.abs(&self.resource_lock()), json!({"jobId": self.job_id}))
            .require_old_empty(self.env.paths.abs(&self.resource_lock()), true);
        if !self.env.submit("start cleanOutServer", tx).await {
            tracing::info!(job_id = %self.job_id, "precondition failed for starting job");
            return false;
        }

        let mut sub = 0usize;
        for (database, collection, shard, servers) in self.held_shards() {
            let candidates: Vec<String> = available_servers(self.snapshot)
                .into_iter()
                .filter(|candidate| *candidate != self.server && !servers.contains(candidate))
                .collect();
            let Some(target) = self.env.pick_random(&candidates) else {
                finish(
                    self.env,
                    self.snapshot,
                    &self.job_id,
                    Some(&self.resource_lock()),
                    false,
                    "no destination server available",
                )
                .await;
                return false;
            };
            let child_id = format!("{}-{sub}", self.job_id);
            sub += 1;
            MoveShard::new(
                self.env,
                self.snapshot,
                child_id,
                self.job_id.clone(),
                database,
                collection,
                shard,
                self.server.clone(),
                target,
            )
            .run()
            .await;
        }
        true
    }

    async fn status_check(&self) -> JobStatus {
        if open_children(self.snapshot, &self.job_id) > 0 {
            return JobStatus::Pending;
        }
        // Drained: the cleaned-servers entry, the bucket move and the lock
        // release are one transaction, so the state stays observable
        // atomically.
        let mut record = job_record(self.snapshot, JobStatus::Pending, &self.job_id)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        record.insert("timeFinished".to_string(), json!(JobEnv::now()));
        let tx = Transaction::new()
            .set(
                self.env.paths.abs(&format!("/Target/Finished/{}", self.job_id)),
                Value::Object(record),
            )
            .delete(self.env.paths.abs(&format!("/Target/Pending/{}", self.job_id)))
            .delete(self.env.paths.abs(&self.resource_lock()))
            .push(self.env.paths.abs(self.env.paths.cleaned_servers()), json!(self.server));
        if self.env.submit("finish cleanOutServer", tx).await {
            tracing::info!(server = %self.server, "server cleaned out");
            JobStatus::Finished
        } else {
            JobStatus::Pending
        }
    }
}
