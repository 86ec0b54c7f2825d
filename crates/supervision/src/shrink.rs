//! Cluster shrinking.
//!
//! Low priority: runs only when no job is in ToDo or Pending. When the
//! target server count is below the available count, failed servers that
//! hold nothing of value are candidates for removal, and otherwise the
//! last healthy server (sorted by name) is drained via cleanOutServer.
//!
//! The removeServer path is gated behind
//! `SupervisionConfig::shrink_via_remove_server`, which defaults to off;
//! the stock behavior only logs the finding and shrinks through
//! cleanOutServer exclusively.

use serde_json::Value;

use arbor_agency::AgencyTree;

use crate::health::HealthStatus;
use crate::jobs::{
    CleanOutServer, JobEnv, JobIdAllocator, RemoveServer, available_servers, run_helper,
};

/// Runs one shrink evaluation over the snapshot.
pub async fn shrink_cluster(
    env: &JobEnv,
    snapshot: &AgencyTree,
    ids: &JobIdAllocator,
    via_remove_server: bool,
) {
    // Low priority: stand back while any job is in flight.
    if snapshot.children("/Target/ToDo").count() > 0
        || snapshot.children("/Target/Pending").count() > 0
    {
        return;
    }

    let Some(target) = snapshot.u64_at(env.paths.target_db_server_count()) else {
        tracing::trace!("targeted number of db servers not set yet");
        return;
    };

    let mut available = available_servers(snapshot);
    if target >= available.len() as u64 {
        return;
    }
    if available.len() == 1 {
        tracing::debug!("only one db server left for operation");
        return;
    }

    // Failed servers are presumed useless until a shard proves otherwise.
    let mut useless_failed: Vec<String> = Vec::new();
    available.retain(|server| {
        let failed = server_health(env, snapshot, server) == Some(HealthStatus::Failed);
        if failed {
            useless_failed.push(server.clone());
        }
        !failed
    });

    let mut max_replication_factor: u64 = 1;
    for (database, _) in snapshot.children(env.paths.plan_collections()) {
        let db_path = format!("{}/{database}", env.paths.plan_collections());
        for (collection, descriptor) in snapshot.children(&db_path) {
            let Some(replication_factor) =
                descriptor.get("replicationFactor").and_then(Value::as_u64)
            else {
                tracing::warn!(collection = %collection, "cannot retrieve replication factor");
                return;
            };
            max_replication_factor = max_replication_factor.max(replication_factor);

            if useless_failed.is_empty() {
                continue;
            }
            for (_, servers) in snapshot.children(&format!("{db_path}/{collection}/shards")) {
                let list: Vec<&str> = servers
                    .as_array()
                    .map(|items| items.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                for (position, server) in list.iter().enumerate() {
                    let is_leader = position == 0;
                    if (is_leader || replication_factor >= available.len() as u64)
                        && useless_failed.iter().any(|candidate| candidate.as_str() == *server)
                    {
                        // Holds data of interest after all; keep waiting
                        // for recovery or operator intervention.
                        useless_failed.retain(|candidate| candidate.as_str() != *server);
                    }
                }
            }
        }
    }

    if !useless_failed.is_empty() {
        useless_failed.sort();
        let Some(victim) = useless_failed.last() else { return };
        if via_remove_server {
            let Some(job_id) = ids.next() else {
                tracing::warn!("job id window exhausted during shrink");
                return;
            };
            run_helper(&RemoveServer::new(env, snapshot, job_id, "supervision", victim.clone()))
                .await;
        } else {
            tracing::info!(server = %victim, "not starting removeServer job because it is disabled");
        }
        return;
    }

    // Do not count failed servers here: they still hold data of interest
    // and we wait indefinitely for them to recover or be removed.
    if max_replication_factor < available.len() as u64
        && available.len() as u64 > target
    {
        available.sort();
        let Some(victim) = available.last() else { return };
        let Some(job_id) = ids.next() else {
            tracing::warn!("job id window exhausted during shrink");
            return;
        };
        run_helper(&CleanOutServer::new(env, snapshot, job_id, "supervision", victim.clone()))
            .await;
    }
}

fn server_health(env: &JobEnv, snapshot: &AgencyTree, server: &str) -> Option<HealthStatus> {
    snapshot
        .str_at(&format!("{}/Status", env.paths.health(server)))
        .and_then(HealthStatus::parse)
}
