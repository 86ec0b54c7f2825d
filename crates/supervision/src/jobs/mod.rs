//! The job framework.
//!
//! A job lives in exactly one agency bucket: `/Target/ToDo`,
//! `/Target/Pending`, `/Target/Finished` or `/Target/Failed`. Its record is
//! immutable except for the bucket move, `timeStarted` and the failure
//! `result`. Every transition is one conditional transaction, so observers
//! see job state atomically.
//!
//! `run_helper` drives a job forward one step per supervisor tick:
//! a fresh job writes its ToDo entry (`create`), a ToDo job attempts its
//! start transaction (`start`), a Pending job checks convergence
//! (`status_check`). Failed preconditions leave the job where it is; the
//! next tick retries against a fresh snapshot.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use serde_json::Value;

use arbor_agency::{AgencyClient, AgencyPaths, AgencyTree, Transaction};

use crate::error::SupervisionError;

pub mod add_follower;
pub mod clean_out_server;
pub mod failed_follower;
pub mod failed_leader;
pub mod failed_server;
pub mod move_shard;
pub mod remove_follower;
pub mod remove_server;
pub mod unassumed_leadership;

pub use add_follower::AddFollower;
pub use clean_out_server::CleanOutServer;
pub use failed_follower::FailedFollower;
pub use failed_leader::FailedLeader;
pub use failed_server::FailedServer;
pub use move_shard::MoveShard;
pub use remove_follower::RemoveFollower;
pub use remove_server::RemoveServer;
pub use unassumed_leadership::UnassumedLeadership;

/// Job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    /// Repair everything a failed server held.
    FailedServer,
    /// Replace the failed leader of one shard.
    FailedLeader,
    /// Replace a failed follower of one shard.
    FailedFollower,
    /// Add a follower to an under-replicated shard.
    AddFollower,
    /// Drop a follower from an over-replicated shard.
    RemoveFollower,
    /// Drain a server by moving all its shards away.
    CleanOutServer,
    /// Remove a drained server from the plan.
    RemoveServer,
    /// Move one shard between servers.
    MoveShard,
    /// Give a leaderless shard a new leader.
    UnassumedLeadership,
}

impl JobType {
    /// The wire name stored in job records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::FailedServer => "failedServer",
            JobType::FailedLeader => "failedLeader",
            JobType::FailedFollower => "failedFollower",
            JobType::AddFollower => "addFollower",
            JobType::RemoveFollower => "removeFollower",
            JobType::CleanOutServer => "cleanOutServer",
            JobType::RemoveServer => "removeServer",
            JobType::MoveShard => "moveShard",
            JobType::UnassumedLeadership => "unassumedLeadership",
        }
    }

    /// Parses the wire name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "failedServer" => Some(JobType::FailedServer),
            "failedLeader" => Some(JobType::FailedLeader),
            "failedFollower" => Some(JobType::FailedFollower),
            "addFollower" => Some(JobType::AddFollower),
            "removeFollower" => Some(JobType::RemoveFollower),
            "cleanOutServer" => Some(JobType::CleanOutServer),
            "removeServer" => Some(JobType::RemoveServer),
            "moveShard" => Some(JobType::MoveShard),
            "unassumedLeadership" => Some(JobType::UnassumedLeadership),
            _ => None,
        }
    }

    /// Whether a pending job of this kind may be aborted to make way for a
    /// failure repair.
    #[must_use]
    pub fn abortable(self) -> bool {
        matches!(
            self,
            JobType::AddFollower
                | JobType::RemoveFollower
                | JobType::MoveShard
                | JobType::CleanOutServer
        )
    }
}

/// Bucket a job currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// No record yet (freshly constructed).
    NotFound,
    /// Created, waiting to start.
    ToDo,
    /// Started; the plan change is committed, convergence pending.
    Pending,
    /// Terminal success.
    Finished,
    /// Terminal failure.
    Failed,
}

impl JobStatus {
    /// The bucket path, when the status maps to one.
    #[must_use]
    pub fn bucket(self) -> Option<&'static str> {
        match self {
            JobStatus::ToDo => Some("/Target/ToDo"),
            JobStatus::Pending => Some("/Target/Pending"),
            JobStatus::Finished => Some("/Target/Finished"),
            JobStatus::Failed => Some("/Target/Failed"),
            JobStatus::NotFound => None,
        }
    }
}

/// Shared environment handed to every job.
pub struct JobEnv {
    /// Agency connection.
    pub agency: Arc<dyn AgencyClient>,
    /// Path builder rooted at the configured prefix.
    pub paths: AgencyPaths,
    /// Seedable randomness for repair-target selection.
    pub rng: Mutex<StdRng>,
}

impl JobEnv {
    /// The current wall-clock time as stored in job records.
    #[must_use]
    pub fn now() -> String {
        Utc::now().to_rfc3339()
    }

    /// Picks a random element.
    #[must_use]
    pub fn pick_random(&self, items: &[String]) -> Option<String> {
        if items.is_empty() {
            return None;
        }
        let index = self.rng.lock().gen_range(0..items.len());
        Some(items[index].clone())
    }

    /// Submits one transaction; returns whether it applied.
    ///
    /// Rejection (precondition failure) is logged and swallowed: the next
    /// tick re-drives from a fresh snapshot.
    pub async fn submit(&self, what: &str, tx: Transaction) -> bool {
        match self.agency.write(vec![tx]).await {
            Ok(result) if result.applied_one() => true,
            Ok(_) => {
                tracing::info!(what, "precondition failed");
                false
            },
            Err(e) => {
                tracing::warn!(what, error = %e, "agency write failed");
                false
            },
        }
    }
}

/// One job's behavior.
#[async_trait]
pub trait Job: Send + Sync {
    /// The environment.
    fn env(&self) -> &JobEnv;

    /// The snapshot this job runs against.
    fn snapshot(&self) -> &AgencyTree;

    /// The job id.
    fn job_id(&self) -> &str;

    /// The job kind.
    fn job_type(&self) -> JobType;

    /// Bucket the job was constructed from.
    fn current_status(&self) -> JobStatus;

    /// The resource lock this job takes, prefix-relative
    /// (`/Supervision/Shards/<s>` or `/Supervision/DBServers/<srv>`).
    fn resource_lock(&self) -> String;

    /// Writes the ToDo record. Returns success.
    async fn create(&self) -> bool;

    /// Attempts the start transaction: delete ToDo, write Pending, lock the
    /// resource, apply the plan change, bump the plan version. Returns
    /// whether the transaction applied.
    async fn start(&self) -> bool;

    /// Observes convergence of a Pending job; may finish it.
    async fn status_check(&self) -> JobStatus;

    /// Kind-specific abort; default is a no-op.
    async fn abort(&self) {}
}

/// Drives a job one step, based on the bucket it was constructed from.
pub async fn run_helper(job: &dyn Job) -> JobStatus {
    match job.current_status() {
        JobStatus::NotFound => {
            if job.create().await {
                JobStatus::ToDo
            } else {
                JobStatus::NotFound
            }
        },
        JobStatus::ToDo => {
            if job.start().await {
                JobStatus::Pending
            } else {
                JobStatus::ToDo
            }
        },
        JobStatus::Pending => job.status_check().await,
        terminal => terminal,
    }
}

/// Reads a job record from its bucket in the snapshot.
#[must_use]
pub fn job_record<'a>(
    snapshot: &'a AgencyTree,
    status: JobStatus,
    job_id: &str,
) -> Option<&'a Value> {
    let bucket = status.bucket()?;
    snapshot.get(&format!("{bucket}/{job_id}"))
}

/// Reads a string field of a job record.
#[must_use]
pub fn record_str(record: &Value, field: &str) -> Option<String> {
    record.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Enumerates `/Plan/DBServers` minus `/Target/CleanedServers`.
#[must_use]
pub fn available_servers(snapshot: &AgencyTree) -> Vec<String> {
    let cleaned = snapshot.string_list("/Target/CleanedServers");
    snapshot
        .children("/Plan/DBServers")
        .map(|(name, _)| name.to_string())
        .filter(|server| !cleaned.contains(server))
        .collect()
}

/// A member of a `distributeShardsLike` equivalence class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardClone {
    /// Collection name.
    pub collection: String,
    /// The clone's shard corresponding to the prototype shard.
    pub shard: String,
}

/// Enumerates the collections sharing the prototype's shard layout,
/// mapping the prototype shard to each clone's shard by position.
///
/// The prototype itself is the first entry.
#[must_use]
pub fn clones(snapshot: &AgencyTree, database: &str, collection: &str, shard: &str) -> Vec<ShardClone> {
    let mut result =
        vec![ShardClone { collection: collection.to_string(), shard: shard.to_string() }];
    let proto_path = format!("/Plan/Collections/{database}/{collection}/shards");
    let proto_shards: Vec<&str> = snapshot.children(&proto_path).map(|(name, _)| name).collect();
    let Some(index) = proto_shards.iter().position(|name| *name == shard) else {
        return result;
    };
    for (name, value) in snapshot.children(&format!("/Plan/Collections/{database}")) {
        if name == collection {
            continue;
        }
        let like = value.get("distributeShardsLike").and_then(Value::as_str);
        if like != Some(collection) {
            continue;
        }
        let clone_path = format!("/Plan/Collections/{database}/{name}/shards");
        let clone_shards: Vec<&str> =
            snapshot.children(&clone_path).map(|(shard_name, _)| shard_name).collect();
        if let Some(clone_shard) = clone_shards.get(index) {
            result.push(ShardClone {
                collection: name.to_string(),
                shard: (*clone_shard).to_string(),
            });
        }
    }
    result
}

/// Compares a planned against an observed server list: the leader
/// (position 0) must match exactly, followers are order-insensitive.
#[must_use]
pub fn compare_server_lists(planned: &[String], current: &[String]) -> bool {
    if planned.len() != current.len() || planned.is_empty() || current.is_empty() {
        return false;
    }
    if planned[0] != current[0] {
        return false;
    }
    let mut planned_followers: Vec<&String> = planned[1..].iter().collect();
    let mut current_followers: Vec<&String> = current[1..].iter().collect();
    planned_followers.sort();
    current_followers.sort();
    planned_followers == current_followers
}

/// Moves a job to Finished (ok) or Failed, freeing its resource lock, in
/// one transaction.
pub async fn finish(
    env: &JobEnv,
    snapshot: &AgencyTree,
    job_id: &str,
    resource_lock: Option<&str>,
    ok: bool,
    reason: &str,
) -> bool {
    let record = job_record(snapshot, JobStatus::Pending, job_id)
        .or_else(|| job_record(snapshot, JobStatus::ToDo, job_id));
    let mut finished = match record {
        Some(Value::Object(map)) => map.clone(),
        _ => {
            let mut map = serde_json::Map::new();
            map.insert("jobId".to_string(), Value::String(job_id.to_string()));
            map
        },
    };
    finished.insert("timeFinished".to_string(), Value::String(JobEnv::now()));
    if !ok && !reason.is_empty() {
        finished.insert("result".to_string(), Value::String(reason.to_string()));
    }

    let target = if ok { "/Target/Finished" } else { "/Target/Failed" };
    let mut tx = Transaction::new()
        .set(env.paths.abs(&format!("{target}/{job_id}")), Value::Object(finished))
        .delete(env.paths.abs(&format!("/Target/ToDo/{job_id}")))
        .delete(env.paths.abs(&format!("/Target/Pending/{job_id}")));
    if let Some(lock) = resource_lock {
        tx = tx.delete(env.paths.abs(lock));
    }
    let applied = env.submit("finish job", tx).await;
    if applied {
        tracing::debug!(job_id, ok, "job finished");
    }
    applied
}

/// Copies a ToDo record into the operations of a start transaction:
/// the Pending entry (record plus `timeStarted`) and the ToDo delete.
#[must_use]
pub fn start_transition(env: &JobEnv, record: &Value, job_id: &str) -> Transaction {
    let mut pending = match record {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    pending.insert("timeStarted".to_string(), Value::String(JobEnv::now()));
    Transaction::new()
        .set(env.paths.abs(&format!("/Target/Pending/{job_id}")), Value::Object(pending))
        .delete(env.paths.abs(&format!("/Target/ToDo/{job_id}")))
}

/// Planned servers of a shard.
#[must_use]
pub fn planned_servers(
    snapshot: &AgencyTree,
    database: &str,
    collection: &str,
    shard: &str,
) -> Vec<String> {
    snapshot.string_list(&format!("/Plan/Collections/{database}/{collection}/shards/{shard}"))
}

/// Observed servers of a shard (leader first).
#[must_use]
pub fn current_servers(
    snapshot: &AgencyTree,
    database: &str,
    collection: &str,
    shard: &str,
) -> Vec<String> {
    snapshot.string_list(&format!("/Current/Collections/{database}/{collection}/{shard}/servers"))
}

/// Whether a pending job blocking a resource may be aborted.
#[must_use]
pub fn abortable(snapshot: &AgencyTree, job_id: &str) -> bool {
    let Some(record) = job_record(snapshot, JobStatus::Pending, job_id)
        .or_else(|| job_record(snapshot, JobStatus::ToDo, job_id))
    else {
        return false;
    };
    record
        .get("type")
        .and_then(Value::as_str)
        .and_then(JobType::parse)
        .is_some_and(JobType::abortable)
}

/// Hands out job ids from a window claimed against `/Sync/LatestID`.
///
/// An exhausted allocator blocks job creation until the supervisor refills
/// it; nothing can start without ids.
#[derive(Default)]
pub struct JobIdAllocator {
    window: Mutex<(u64, u64)>,
}

impl JobIdAllocator {
    /// Creates an exhausted allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a fresh `[start, end)` window.
    pub fn refill(&self, start: u64, end: u64) {
        *self.window.lock() = (start, end);
    }

    /// Whether the window is used up.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        let window = self.window.lock();
        window.0 >= window.1
    }

    /// The next job id, or `None` when the window is used up.
    #[must_use]
    pub fn next(&self) -> Option<String> {
        let mut window = self.window.lock();
        if window.0 >= window.1 {
            return None;
        }
        let id = window.0;
        window.0 += 1;
        Some(id.to_string())
    }
}

/// Dispatches jobs by reading their record and constructing the concrete
/// kind.
pub struct JobContext<'a> {
    /// Shared environment.
    pub env: &'a JobEnv,
    /// Snapshot of the agency tree under the prefix.
    pub snapshot: &'a AgencyTree,
}

impl JobContext<'_> {
    /// Runs one step of the job found in `status`'s bucket.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisionError::JobNotFound`] when the record vanished
    /// and [`SupervisionError::MalformedJob`] when it cannot be
    /// interpreted; malformed jobs are moved to Failed before returning.
    pub async fn run(&self, status: JobStatus, job_id: &str) -> Result<JobStatus, SupervisionError> {
        let Some(record) = job_record(self.snapshot, status, job_id) else {
            return Err(SupervisionError::JobNotFound { job_id: job_id.to_string() });
        };
        let record = record.clone();
        let Some(job) = self.instantiate(status, job_id, &record) else {
            finish(self.env, self.snapshot, job_id, None, false, "malformed job record").await;
            return Err(SupervisionError::MalformedJob {
                job_id: job_id.to_string(),
                reason: "missing or unknown fields".to_string(),
            });
        };
        Ok(run_helper(job.as_ref()).await)
    }

    /// Aborts the job with the given id, wherever it lives.
    pub async fn abort(&self, job_id: &str) {
        for status in [JobStatus::Pending, JobStatus::ToDo] {
            if let Some(record) = job_record(self.snapshot, status, job_id) {
                let record = record.clone();
                if let Some(job) = self.instantiate(status, job_id, &record) {
                    job.abort().await;
                }
                return;
            }
        }
    }

    fn instantiate(
        &self,
        status: JobStatus,
        job_id: &str,
        record: &Value,
    ) -> Option<Box<dyn Job + '_>> {
        let job_type = record.get("type").and_then(Value::as_str).and_then(JobType::parse)?;
        let job: Box<dyn Job + '_> = match job_type {
            JobType::FailedServer => {
                Box::new(FailedServer::from_record(self.env, self.snapshot, status, job_id, record)?)
            },
            JobType::FailedLeader => {
                Box::new(FailedLeader::from_record(self.env, self.snapshot, status, job_id, record)?)
            },
            JobType::FailedFollower => Box::new(FailedFollower::from_record(
                self.env,
                self.snapshot,
                status,
                job_id,
                record,
            )?),
            JobType::AddFollower => {
                Box::new(AddFollower::from_record(self.env, self.snapshot, status, job_id, record)?)
            },
            JobType::RemoveFollower => Box::new(RemoveFollower::from_record(
                self.env,
                self.snapshot,
                status,
                job_id,
                record,
            )?),
            JobType::CleanOutServer => Box::new(CleanOutServer::from_record(
                self.env,
                self.snapshot,
                status,
                job_id,
                record,
            )?),
            JobType::RemoveServer => {
                Box::new(RemoveServer::from_record(self.env, self.snapshot, status, job_id, record)?)
            },
            JobType::MoveShard => {
                Box::new(MoveShard::from_record(self.env, self.snapshot, status, job_id, record)?)
            },
            JobType::UnassumedLeadership => Box::new(UnassumedLeadership::from_record(
                self.env,
                self.snapshot,
                status,
                job_id,
                record,
            )?),
        };
        Some(job)
    }
}

/// Counts open (ToDo or Pending) children of a parent job.
#[must_use]
pub fn open_children(snapshot: &AgencyTree, parent_id: &str) -> usize {
    let prefix = format!("{parent_id}-");
    snapshot
        .children("/Target/ToDo")
        .chain(snapshot.children("/Target/Pending"))
        .filter(|(name, _)| name.starts_with(&prefix))
        .count()
}
