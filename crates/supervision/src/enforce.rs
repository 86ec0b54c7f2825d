//! Replication enforcement.
//!
//! For every planned non-clone collection, compare each shard's actual
//! server count with the desired replication factor and schedule an
//! addFollower or removeFollower job. Satellites (replication factor 0)
//! expand to every available server. A shard with an existing repair job
//! in ToDo, or a locked shard, is skipped — this is what makes the driver
//! idempotent across ticks.

use serde_json::Value;

use arbor_agency::AgencyTree;

use crate::jobs::{
    AddFollower, JobEnv, JobIdAllocator, JobStatus, RemoveFollower, available_servers, run_helper,
};

/// Runs one enforcement pass over the snapshot.
pub async fn enforce_replication(env: &JobEnv, snapshot: &AgencyTree, ids: &JobIdAllocator) {
    let databases: Vec<String> = snapshot
        .children(env.paths.plan_collections())
        .map(|(name, _)| name.to_string())
        .collect();

    for database in databases {
        let db_path = format!("{}/{database}", env.paths.plan_collections());
        let collections: Vec<(String, Value)> = snapshot
            .children(&db_path)
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();

        for (collection, descriptor) in collections {
            let Some(mut replication_factor) =
                descriptor.get("replicationFactor").and_then(Value::as_u64)
            else {
                tracing::debug!(collection = %collection, "no replicationFactor entry");
                continue;
            };
            // Satellites distribute to every server.
            if replication_factor == 0 {
                replication_factor = available_servers(snapshot).len() as u64;
            }
            let is_clone = descriptor
                .get("distributeShardsLike")
                .and_then(Value::as_str)
                .is_some_and(|like| !like.is_empty());
            if is_clone {
                continue;
            }

            let shards: Vec<(String, u64)> = snapshot
                .children(&format!("{db_path}/{collection}/shards"))
                .map(|(shard, servers)| {
                    (shard.to_string(), servers.as_array().map(Vec::len).unwrap_or(0) as u64)
                })
                .collect();

            for (shard, actual) in shards {
                if actual == replication_factor {
                    continue;
                }
                if has_repair_job(snapshot, &shard) {
                    tracing::debug!(
                        shard = %shard,
                        "repair job already in ToDo, not scheduling again"
                    );
                    continue;
                }
                if snapshot.has(&env.paths.blocked_shard(&shard)) {
                    continue;
                }
                let Some(job_id) = ids.next() else {
                    tracing::warn!("job id window exhausted during replication enforcement");
                    return;
                };
                if actual < replication_factor {
                    run_helper(&AddFollower::new(
                        env,
                        snapshot,
                        job_id,
                        "supervision",
                        database.clone(),
                        collection.clone(),
                        shard,
                        Vec::new(),
                    ))
                    .await;
                } else {
                    run_helper(&RemoveFollower::new(
                        env,
                        snapshot,
                        job_id,
                        "supervision",
                        database.clone(),
                        collection.clone(),
                        shard,
                    ))
                    .await;
                }
            }
        }
    }
}

/// Whether a ToDo job of a shard-repair kind already targets the shard.
fn has_repair_job(snapshot: &AgencyTree, shard: &str) -> bool {
    snapshot.children(JobStatus::ToDo.bucket().unwrap_or_default()).any(|(_, record)| {
        let job_type = record.get("type").and_then(Value::as_str);
        matches!(job_type, Some("addFollower" | "removeFollower" | "moveShard"))
            && record.get("shard").and_then(Value::as_str) == Some(shard)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_has_repair_job_matches_type_and_shard() {
        let snapshot = AgencyTree::new(json!({
            "Target": {"ToDo": {
                "1": {"type": "addFollower", "shard": "s1"},
                "2": {"type": "failedServer", "server": "A"},
            }},
        }));
        assert!(has_repair_job(&snapshot, "s1"));
        assert!(!has_repair_job(&snapshot, "s2"));
    }
}
