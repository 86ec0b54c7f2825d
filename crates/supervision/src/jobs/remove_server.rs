//! Remove a server from the plan entirely.
//!
//! Only feasible when the server is still planned, has not been cleaned
//! yet, and enough servers remain to satisfy every replication factor. On
//! start the server is locked and addFollower children re-home its shards;
//! once they drain the job rewrites every affected plan list in one
//! transaction (each guarded by an `old` precondition), records the server
//! as cleaned and bumps the plan version.

use async_trait::async_trait;
use serde_json::{Value, json};

use arbor_agency::{AgencyTree, Transaction};

use crate::jobs::{
    AddFollower, Job, JobEnv, JobStatus, JobType, available_servers, finish, job_record,
    open_children, record_str, run_helper, start_transition,
};

/// The removeServer job.
pub struct RemoveServer<'a> {
    env: &'a JobEnv,
    snapshot: &'a AgencyTree,
    status: JobStatus,
    job_id: String,
    creator: String,
    server: String,
}

impl<'a> RemoveServer<'a> {
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

    /// Checks whether removing the server can possibly succeed.
    fn check_feasibility(&self) -> Result<(), String> {
        if !self.snapshot.has(&format!("/Plan/DBServers/{}", self.server)) {
            return Err(format!("no db server with id {} in plan", self.server));
        }
        let cleaned = self.snapshot.string_list(self.env.paths.cleaned_servers());
        if cleaned.contains(&self.server) {
            return Err(format!("{} has been cleaned out already", self.server));
        }
        let available = available_servers(self.snapshot);
        if available.len() <= 1 {
            return Err(format!("{} is the last standing db server", self.server));
        }
        let remaining = (available.len() - 1) as u64;
        let max_replication = max_replication_factor(self.snapshot);
        if max_replication > remaining {
            return Err(format!(
                "cannot accommodate replication factor {max_replication} with {remaining} \
                 servers after removing {}",
                self.server
            ));
        }
        Ok(())
    }

    /// Schedules addFollower children for every affected non-clone shard.
    async fn schedule_add_followers(&self) -> bool {
        let mut sub = 0usize;
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
                for (shard, servers) in
                    self.snapshot.children(&format!("{db_path}/{collection}/shards"))
                {
                    let list: Vec<String> = servers
                        .as_array()
                        .map(|items| {
                            items.iter().filter_map(Value::as_str).map(str::to_string).collect()
                        })
                        .unwrap_or_default();
                    if !list.contains(&self.server) {
                        continue;
                    }
                    let candidates: Vec<String> = available_servers(self.snapshot)
                        .into_iter()
                        .filter(|candidate| !list.contains(candidate))
                        .collect();
                    let Some(target) = self.env.pick_random(&candidates) else {
                        tracing::error!(
                            shard = %shard,
                            "no servers remain as target for removeServer"
                        );
                        return false;
                    };
                    let child_id = format!("{}-{sub}", self.job_id);
                    sub += 1;
                    AddFollower::new(
                        self.env,
                        self.snapshot,
                        child_id,
                        self.job_id.clone(),
                        database.to_string(),
                        collection.to_string(),
                        shard.to_string(),
                        vec![target],
                    )
                    .run()
                    .await;
                }
            }
        }
        true
    }
}

#[async_trait]
impl Job for RemoveServer<'_> {
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
        JobType::RemoveServer
    }

    fn current_status(&self) -> JobStatus {
        self.status
    }

    fn resource_lock(&self) -> String {
        self.env.paths.blocked_server(&self.server)
    }

    async fn create(&self) -> bool {
        tracing::info!(server = %self.server, "todo: remove server");
        let tx = Transaction::new().set(
            self.env.paths.abs(&format!("/Target/ToDo/{}", self.job_id)),
            json!({
                "type": JobType::RemoveServer.as_str(),
                "server": self.server,
                "jobId": self.job_id,
                "creator": self.creator,
                "timeCreated": JobEnv::now(),
            }),
        );
        self.env.submit("create removeServer", tx).await
    }

    async fn start(&self) -> bool {
        let Some(record) = job_record(self.snapshot, JobStatus::ToDo, &self.job_id) else {
            tracing::info!(job_id = %self.job_id, "failed to get ToDo record from snapshot");
            return false;
        };
        let tx = start_transition(self.env, record, &self.job_id)
            .set(self.env.paths.abs(&self.resource_lock()), json!({"jobId": self.job_id}))
            .require_old_empty(self.env.paths.abs(&self.resource_lock()), true);
        if !self.env.submit("start removeServer", tx).await {
            tracing::info!(job_id = %self.job_id, "precondition failed for starting job");
            return false;
        }

        if let Err(reason) = self.check_feasibility() {
            tracing::error!("{reason}");
            finish(self.env, self.snapshot, &self.job_id, Some(&self.resource_lock()), false, &reason)
                .await;
            return false;
        }
        if !self.schedule_add_followers().await {
            finish(
                self.env,
                self.snapshot,
                &self.job_id,
                Some(&self.resource_lock()),
                false,
                "could not schedule add followers",
            )
            .await;
            return false;
        }
        tracing::info!(server = %self.server, "pending: removing server");
        true
    }

    async fn status_check(&self) -> JobStatus {
        if open_children(self.snapshot, &self.job_id) > 0 {
            return JobStatus::Pending;
        }

        // All shards re-homed: strip the server from every plan list,
        // record it as cleaned and bump the plan version, atomically and
        // guarded per shard.
        let mut tx = Transaction::new();
        for (database, _) in self.snapshot.children(self.env.paths.plan_collections()) {
            let db_path = format!("{}/{database}", self.env.paths.plan_collections());
            for (collection, _) in self.snapshot.children(&db_path) {
                for (shard, servers) in
                    self.snapshot.children(&format!("{db_path}/{collection}/shards"))
                {
                    let list: Vec<String> = servers
                        .as_array()
                        .map(|items| {
                            items.iter().filter_map(Value::as_str).map(str::to_string).collect()
                        })
                        .unwrap_or_default();
                    if !list.contains(&self.server) {
                        continue;
                    }
                    let desired: Vec<String> =
                        list.iter().filter(|s| **s != self.server).cloned().collect();
                    let path = self
                        .env
                        .paths
                        .abs(&self.env.paths.plan_shard_servers(database, collection, shard));
                    tx = tx.set(path.clone(), json!(desired)).require_old(path, json!(list));
                }
            }
        }
        tx = tx
            .push(self.env.paths.abs(self.env.paths.cleaned_servers()), json!(self.server))
            .increment(self.env.paths.abs(self.env.paths.plan_version()));

        if !self.env.submit("strip removed server from plan", tx).await {
            return JobStatus::Pending;
        }
        tracing::info!(server = %self.server, "reported in /Target/CleanedServers");
        if finish(self.env, self.snapshot, &self.job_id, Some(&self.resource_lock()), true, "")
            .await
        {
            JobStatus::Finished
        } else {
            JobStatus::Pending
        }
    }
}

/// The greatest replication factor over all planned collections.
fn max_replication_factor(snapshot: &AgencyTree) -> u64 {
    let mut max = 1;
    for (database, _) in snapshot.children("/Plan/Collections") {
        for (_, descriptor) in snapshot.children(&format!("/Plan/Collections/{database}")) {
            if let Some(factor) = descriptor.get("replicationFactor").and_then(Value::as_u64) {
                max = max.max(factor);
            }
        }
    }
    max
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_max_replication_factor() {
        let snapshot = AgencyTree::new(json!({
            "Plan": {"Collections": {"db": {
                "a": {"replicationFactor": 2},
                "b": {"replicationFactor": 5},
                "c": {},
            }}},
        }));
        assert_eq!(max_replication_factor(&snapshot), 5);
        assert_eq!(max_replication_factor(&AgencyTree::empty()), 1);
    }
}
