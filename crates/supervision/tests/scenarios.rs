//! End-to-end supervisor scenarios against the in-memory agency.
//!
//! Each test seeds a small cluster, drives `run_once` ticks and asserts
//! the literal agency state the control loop must produce.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value, json};

use arbor_agency::{AgencyTree, MockAgency};
use arbor_supervision::Supervisor;
use arbor_types::SupervisionConfig;

const PREFIX: &str = "/arango";

fn config() -> SupervisionConfig {
    SupervisionConfig::builder()
        .agency_prefix(PREFIX.to_string())
        .frequency(Duration::from_millis(10))
        .grace_period(Duration::from_secs(5))
        .build()
        .unwrap()
}

fn abs(path: &str) -> String {
    format!("{PREFIX}{path}")
}

/// Seeds a healthy cluster: the given db servers, one collection `c` in
/// `_system` with shard `s1` on `holders`.
fn seed_cluster(agency: &MockAgency, servers: &[&str], replication_factor: u64, holders: &[&str]) {
    for server in servers {
        agency.seed(&abs(&format!("/Plan/DBServers/{server}")), json!("none"));
        agency.seed(
            &abs(&format!("/Current/ServersRegistered/{server}/endpoint")),
            json!(format!("tcp://{server}:8529")),
        );
        mark_healthy(agency, server);
    }
    agency.seed(&abs("/Target/FailedServers"), json!({}));
    agency.seed(&abs("/Sync/LatestID"), json!(1));
    agency.seed(&abs("/Plan/Version"), json!(1));
    agency.seed(
        &abs("/Plan/Collections/_system/c"),
        json!({
            "replicationFactor": replication_factor,
            "shards": { "s1": holders },
        }),
    );
    agency.seed(&abs("/Current/Collections/_system/c/s1/servers"), json!(holders));
    // Leadership is long established, so health checks run immediately.
    agency.set_leader_since(Utc::now() - ChronoDuration::seconds(60));
}

/// Seeds a fresh heartbeat and a GOOD health record for a server.
fn mark_healthy(agency: &MockAgency, server: &str) {
    let now = Utc::now().to_rfc3339();
    agency.seed_transient(&abs(&format!("/Sync/ServerStates/{server}/time")), json!(now));
    agency.seed_transient(&abs(&format!("/Sync/ServerStates/{server}/status")), json!("SERVING"));
    agency.seed(&abs(&format!("/Supervision/Health/{server}/Status")), json!("GOOD"));
}

/// Makes a server look dead past the grace period: the heartbeat no longer
/// advances, the last ack is old, and the recorded status is BAD.
fn mark_failing(agency: &MockAgency, server: &str) {
    let stale_beat = "t-stale".to_string();
    let old_ack = (Utc::now() - ChronoDuration::seconds(30)).to_rfc3339();
    agency.seed_transient(&abs(&format!("/Sync/ServerStates/{server}/time")), json!(stale_beat));
    agency.seed_transient(
        &abs(&format!("/Supervision/Health/{server}")),
        json!({
            "LastHeartbeatSent": stale_beat,
            "LastHeartbeatStatus": "SERVING",
            "LastHeartbeatAcked": old_ack,
            "Status": "BAD",
        }),
    );
    agency.seed(&abs(&format!("/Supervision/Health/{server}/Status")), json!("BAD"));
}

fn supervisor(agency: &Arc<MockAgency>) -> Supervisor {
    Supervisor::with_rng(agency.clone(), config(), StdRng::seed_from_u64(0x5eed))
}

fn jobs_of_type(tree: &AgencyTree, bucket: &str, job_type: &str) -> Vec<(String, Value)> {
    tree.children(bucket)
        .filter(|(_, record)| record.get("type").and_then(Value::as_str) == Some(job_type))
        .map(|(id, record)| (id.to_string(), record.clone()))
        .collect()
}

/// S1 — follower failure recovery: a failed follower is marked FAILED, a
/// failedServer job appears, its failedFollower child replaces B with a
/// spare server in the plan and records the shard under FailedServers/B.
#[tokio::test]
async fn test_follower_failure_recovery() {
    let agency = Arc::new(MockAgency::new());
    seed_cluster(&agency, &["A", "B", "C", "D", "E"], 3, &["A", "B", "C"]);
    mark_failing(&agency, "B");

    let supervisor = supervisor(&agency);

    // Tick 1: health check marks B FAILED and creates the failedServer job
    // in the same transaction.
    supervisor.run_once().await;
    let tree = agency.persistent_snapshot();
    assert_eq!(
        tree.str_at(&abs("/Supervision/Health/B/Status")),
        Some("FAILED"),
        "B must be FAILED after the grace period"
    );
    let failed_server_jobs = jobs_of_type(&tree, &abs("/Target/ToDo"), "failedServer");
    assert_eq!(failed_server_jobs.len(), 1);
    assert_eq!(failed_server_jobs[0].1["server"], json!("B"));

    // Tick 2: the failedServer job starts and spawns a failedFollower
    // child for s1.
    supervisor.run_once().await;
    let tree = agency.persistent_snapshot();
    let children = jobs_of_type(&tree, &abs("/Target/ToDo"), "failedFollower");
    assert_eq!(children.len(), 1, "one failedFollower child expected");
    let child = &children[0].1;
    assert_eq!(child["database"], json!("_system"));
    assert_eq!(child["collection"], json!("c"));
    assert_eq!(child["shard"], json!("s1"));
    assert_eq!(child["fromServer"], json!("B"));
    let target = child["toServer"].as_str().unwrap().to_string();
    assert!(["D", "E"].contains(&target.as_str()), "target {target} must be a spare server");

    // Tick 3: the child's start transaction rewrites the plan.
    supervisor.run_once().await;
    let tree = agency.persistent_snapshot();
    let plan = tree.string_list(&abs("/Plan/Collections/_system/c/shards/s1"));
    assert_eq!(plan, vec!["A".to_string(), target.clone(), "C".to_string()]);
    assert_eq!(tree.string_list(&abs("/Target/FailedServers/B")), vec!["s1"]);
    // The shard is locked by the child while it is pending.
    assert!(tree.has(&abs("/Supervision/Shards/s1")));
}

/// S2 — leader failure: the child is failedLeader; the old position-1
/// follower is promoted and the replacement joins at the tail.
#[tokio::test]
async fn test_leader_failure_recovery() {
    let agency = Arc::new(MockAgency::new());
    seed_cluster(&agency, &["A", "B", "C", "D", "E"], 3, &["A", "B", "C"]);
    mark_failing(&agency, "A");

    let supervisor = supervisor(&agency);
    supervisor.run_once().await;
    supervisor.run_once().await;

    let tree = agency.persistent_snapshot();
    let children = jobs_of_type(&tree, &abs("/Target/ToDo"), "failedLeader");
    assert_eq!(children.len(), 1, "one failedLeader child expected");
    let target = children[0].1["toServer"].as_str().unwrap().to_string();
    assert!(["D", "E"].contains(&target.as_str()));

    supervisor.run_once().await;
    let tree = agency.persistent_snapshot();
    let plan = tree.string_list(&abs("/Plan/Collections/_system/c/shards/s1"));
    assert_eq!(
        plan,
        vec!["B".to_string(), "C".to_string(), target],
        "old position-1 server must lead, replacement joins the tail"
    );
}

/// S3 — shrink: with more servers than targeted and everything healthy, a
/// cleanOutServer job appears for the last server in sorted order.
#[tokio::test]
async fn test_shrink_schedules_clean_out_of_last_server() {
    let agency = Arc::new(MockAgency::new());
    seed_cluster(&agency, &["A", "B", "C"], 2, &["A", "B"]);
    agency.seed(&abs("/Target/NumberOfDBServers"), json!(2));
    agency.seed(&abs("/Target/CleanedServers"), json!([]));

    let supervisor = supervisor(&agency);
    supervisor.run_once().await;

    let tree = agency.persistent_snapshot();
    let jobs = jobs_of_type(&tree, &abs("/Target/ToDo"), "cleanOutServer");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].1["server"], json!("C"));
}

/// S5 — add-follower idempotence: an under-replicated shard gets exactly
/// one addFollower ToDo entry no matter how often enforcement runs.
#[tokio::test]
async fn test_enforce_replication_is_idempotent() {
    let agency = Arc::new(MockAgency::new());
    // Only two servers exist, so the job can never resolve a target and
    // stays in ToDo.
    seed_cluster(&agency, &["A", "B"], 3, &["A", "B"]);

    let supervisor = supervisor(&agency);
    for _ in 0..5 {
        supervisor.run_once().await;
        let tree = agency.persistent_snapshot();
        let jobs = jobs_of_type(&tree, &abs("/Target/ToDo"), "addFollower");
        assert_eq!(jobs.len(), 1, "exactly one addFollower ToDo entry at all times");
        assert_eq!(jobs[0].1["shard"], json!("s1"));
    }
}

/// Replication convergence (§ testable properties): once a spare server
/// exists, the addFollower job commits and the plan reaches the
/// replication factor.
#[tokio::test]
async fn test_replication_convergence() {
    let agency = Arc::new(MockAgency::new());
    seed_cluster(&agency, &["A", "B", "C"], 3, &["A", "B"]);

    let supervisor = supervisor(&agency);
    supervisor.run_once().await; // schedules addFollower
    supervisor.run_once().await; // starts it: plan grows to 3

    let tree = agency.persistent_snapshot();
    let plan = tree.string_list(&abs("/Plan/Collections/_system/c/shards/s1"));
    assert_eq!(plan.len(), 3);
    assert_eq!(plan[..2], ["A".to_string(), "B".to_string()]);
    assert_eq!(plan[2], "C");

    // Current catches up; the job finishes and releases the shard lock.
    agency.seed(&abs("/Current/Collections/_system/c/s1/servers"), json!(plan));
    supervisor.run_once().await;
    let tree = agency.persistent_snapshot();
    assert_eq!(jobs_of_type(&tree, &abs("/Target/Pending"), "addFollower").len(), 0);
    assert_eq!(jobs_of_type(&tree, &abs("/Target/Finished"), "addFollower").len(), 1);
    assert!(!tree.has(&abs("/Supervision/Shards/s1")));
}

/// Resource-lock exclusion: two jobs targeting the same shard never hold
/// the lock simultaneously; the second start fails its precondition.
#[tokio::test]
async fn test_shard_lock_exclusion() {
    let agency = Arc::new(MockAgency::new());
    seed_cluster(&agency, &["A", "B", "C", "D"], 3, &["A", "B"]);
    // Two competing repair jobs for the same shard, seeded directly.
    for (id, job_type) in [("100", "addFollower"), ("101", "moveShard")] {
        let mut record = json!({
            "type": job_type,
            "database": "_system",
            "collection": "c",
            "shard": "s1",
            "jobId": id,
            "creator": "test",
            "timeCreated": Utc::now().to_rfc3339(),
        });
        if job_type == "moveShard" {
            record["fromServer"] = json!("A");
            record["toServer"] = json!("D");
        }
        agency.seed(&abs(&format!("/Target/ToDo/{id}")), record);
    }

    let supervisor = supervisor(&agency);
    for _ in 0..4 {
        supervisor.run_once().await;
        let tree = agency.persistent_snapshot();
        let pending: Vec<String> = tree
            .children(&abs("/Target/Pending"))
            .filter(|(_, r)| r.get("shard").and_then(Value::as_str) == Some("s1"))
            .map(|(id, _)| id.to_string())
            .collect();
        assert!(pending.len() <= 1, "two jobs hold the same shard: {pending:?}");
        if let Some(lock_holder) = tree.str_at(&abs("/Supervision/Shards/s1/jobId")) {
            assert!(pending.contains(&lock_holder.to_string()) || pending.is_empty());
        }
    }
}

/// A recovered server deletes its FailedServers entry, the failedServer
/// job drops its unstarted children and finishes successfully.
#[tokio::test]
async fn test_server_recovery_clears_repair_state() {
    let agency = Arc::new(MockAgency::new());
    // No spare servers: the parent cannot spawn real repair children.
    seed_cluster(&agency, &["A", "B", "C"], 3, &["A", "B", "C"]);
    mark_failing(&agency, "B");

    let supervisor = supervisor(&agency);
    supervisor.run_once().await; // FAILED + failedServer job
    supervisor.run_once().await; // job starts (no children possible)

    let tree = agency.persistent_snapshot();
    let parents = jobs_of_type(&tree, &abs("/Target/Pending"), "failedServer");
    assert_eq!(parents.len(), 1);
    let parent_id = parents[0].0.clone();
    // An unstarted child left over from the failure window; the shard is
    // blocked by another job, so the child cannot start meanwhile.
    agency.seed(
        &abs(&format!("/Target/ToDo/{parent_id}-0")),
        json!({
            "type": "failedFollower",
            "database": "_system",
            "collection": "c",
            "shard": "s1",
            "fromServer": "B",
            "toServer": "A",
            "jobId": format!("{parent_id}-0"),
            "creator": parent_id,
            "timeCreated": Utc::now().to_rfc3339(),
        }),
    );
    agency.seed(&abs("/Supervision/Shards/s1"), json!({"jobId": "999"}));

    // B comes back.
    let fresh = Utc::now().to_rfc3339();
    agency.seed_transient(&abs("/Sync/ServerStates/B/time"), json!(fresh));
    agency.seed_transient(
        &abs("/Supervision/Health/B"),
        json!({
            "LastHeartbeatSent": "t-stale",
            "LastHeartbeatStatus": "SERVING",
            "LastHeartbeatAcked": Utc::now().to_rfc3339(),
            "Status": "FAILED",
        }),
    );
    agency.seed(&abs("/Supervision/Health/B/Status"), json!("FAILED"));

    supervisor.run_once().await; // health back to GOOD, repair list cleared
    supervisor.run_once().await; // parent deletes the child and finishes

    let tree = agency.persistent_snapshot();
    assert_eq!(tree.str_at(&abs("/Supervision/Health/B/Status")), Some("GOOD"));
    assert!(!tree.has(&abs("/Target/FailedServers/B")), "repair list entry must be cleared");
    assert!(!tree.has(&abs(&format!("/Target/ToDo/{parent_id}-0"))), "child must be deleted");
    assert_eq!(jobs_of_type(&tree, &abs("/Target/Finished"), "failedServer").len(), 1);
    assert!(!tree.has(&abs("/Supervision/DBServers/B")), "server lock must be released");
}

/// The shutdown key makes the supervisor wait for servers to leave and
/// then delete the key as leader.
#[tokio::test]
async fn test_cluster_shutdown_handling() {
    let agency = Arc::new(MockAgency::new());
    seed_cluster(&agency, &["A", "B"], 2, &["A", "B"]);
    agency.seed(&abs("/Shutdown"), json!(true));

    let supervisor = supervisor(&agency);
    supervisor.run_once().await;
    // Servers still GOOD: the key must survive.
    assert!(agency.persistent_snapshot().has(&abs("/Shutdown")));

    agency.seed(&abs("/Supervision/Health/A/Status"), json!("BAD"));
    agency.seed(&abs("/Supervision/Health/B/Status"), json!("BAD"));
    supervisor.run_once().await;
    assert!(
        !agency.persistent_snapshot().has(&abs("/Shutdown")),
        "leader must delete the shutdown key once servers left"
    );
}

/// The legacy FailedServers array is upgraded to an object once.
#[tokio::test]
async fn test_failed_servers_schema_upgrade() {
    let agency = Arc::new(MockAgency::new());
    seed_cluster(&agency, &["A", "B"], 2, &["A", "B"]);
    agency.seed(&abs("/Target/FailedServers"), json!(["A", "B"]));

    let supervisor = supervisor(&agency);
    supervisor.run_once().await;

    let tree = agency.persistent_snapshot();
    let upgraded = tree.get(&abs("/Target/FailedServers")).unwrap();
    assert!(upgraded.is_object(), "got: {upgraded}");
    assert!(upgraded.get("A").is_some());
    assert!(upgraded.get("B").is_some());
}

/// distributeShardsLike chains collapse to their root prototype.
#[tokio::test]
async fn test_prototype_chain_normalization() {
    let agency = Arc::new(MockAgency::new());
    seed_cluster(&agency, &["A", "B"], 2, &["A", "B"]);
    agency.seed(
        &abs("/Plan/Collections/_system/clone1"),
        json!({"replicationFactor": 2, "distributeShardsLike": "c", "shards": {}}),
    );
    agency.seed(
        &abs("/Plan/Collections/_system/clone2"),
        json!({"replicationFactor": 2, "distributeShardsLike": "clone1", "shards": {}}),
    );

    let supervisor = supervisor(&agency);
    supervisor.run_once().await;

    let tree = agency.persistent_snapshot();
    assert_eq!(
        tree.str_at(&abs("/Plan/Collections/_system/clone2/distributeShardsLike")),
        Some("c"),
        "chain clone2 -> clone1 -> c must collapse"
    );
}

/// The removeServer path inside shrink is disabled by default: a useless
/// failed server is only logged. With the switch on, the job is
/// scheduled.
#[tokio::test]
async fn test_shrink_remove_server_switch() {
    for via_remove_server in [false, true] {
        let agency = Arc::new(MockAgency::new());
        seed_cluster(&agency, &["A", "B", "C", "D"], 2, &["A", "B"]);
        agency.seed(&abs("/Target/NumberOfDBServers"), json!(3));
        // D is long failed and holds nothing.
        agency.seed(&abs("/Supervision/Health/D/Status"), json!("FAILED"));

        let config = SupervisionConfig::builder()
            .agency_prefix(PREFIX.to_string())
            .grace_period(Duration::from_secs(5))
            .shrink_via_remove_server(via_remove_server)
            .build()
            .unwrap();
        let supervisor =
            Supervisor::with_rng(agency.clone(), config, StdRng::seed_from_u64(3));
        supervisor.run_once().await;

        let tree = agency.persistent_snapshot();
        let jobs = jobs_of_type(&tree, &abs("/Target/ToDo"), "removeServer");
        if via_remove_server {
            assert_eq!(jobs.len(), 1, "switch on must schedule removeServer");
            assert_eq!(jobs[0].1["server"], json!("D"));
        } else {
            assert!(jobs.is_empty(), "disabled switch must only log the finding");
        }
    }
}

/// `begin_shutdown` wakes every blocking wait and stops the loop.
#[tokio::test(start_paused = true)]
async fn test_begin_shutdown_stops_loop() {
    let agency = Arc::new(MockAgency::new());
    seed_cluster(&agency, &["A"], 1, &["A"]);

    let supervisor = Arc::new(Supervisor::with_rng(
        agency.clone(),
        config(),
        StdRng::seed_from_u64(1),
    ));
    let runner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.run().await })
    };
    tokio::task::yield_now().await;
    supervisor.begin_shutdown();
    runner.await.unwrap();
}

/// A follower observes but does not act.
#[tokio::test]
async fn test_follower_supervisor_does_nothing() {
    let agency = Arc::new(MockAgency::new());
    seed_cluster(&agency, &["A", "B"], 3, &["A", "B"]);
    agency.set_leading(false);

    let supervisor = supervisor(&agency);
    supervisor.run_once().await;

    let tree = agency.persistent_snapshot();
    assert_eq!(tree.children(&abs("/Target/ToDo")).count(), 0);
}
