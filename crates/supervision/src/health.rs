//! Node health tracking.
//!
//! Health is derived from heartbeats the nodes write into the transient
//! tree: a changed `/Sync/ServerStates/<srv>/time` (or a server we have no
//! record for yet) is a fresh beat. The status ladder is
//! GOOD → BAD → FAILED; a server is never marked FAILED without having
//! been BAD for at least the grace period first, and the BAD→FAILED
//! transition publishes the `failedServer` repair job in the same
//! transaction.
//!
//! Reports are always written to the transient store; the replicated tree
//! only sees *status changes*, so heartbeat noise cannot saturate the
//! replicated log.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use arbor_agency::{AgencyTree, Transaction};

use crate::jobs::{FailedServer, JobEnv, JobIdAllocator};

/// Health states of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Heartbeats arriving.
    Good,
    /// Heartbeats missing, grace period not exceeded.
    Bad,
    /// Heartbeats missing beyond the grace period; repair scheduled.
    Failed,
}

impl HealthStatus {
    /// The wire name stored in health records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Good => "GOOD",
            HealthStatus::Bad => "BAD",
            HealthStatus::Failed => "FAILED",
        }
    }

    /// Parses the wire name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "GOOD" => Some(HealthStatus::Good),
            "BAD" => Some(HealthStatus::Bad),
            "FAILED" => Some(HealthStatus::Failed),
            _ => None,
        }
    }
}

/// Server roles, determining the record's role tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    DbServer,
    Coordinator,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::DbServer => "DBServer",
            Role::Coordinator => "Coordinator",
        }
    }

    /// Short prefix of server ids carrying this role.
    fn tag(self) -> &'static str {
        match self {
            Role::DbServer => "PR",
            Role::Coordinator => "CR",
        }
    }

    fn plan_path(self) -> &'static str {
        match self {
            Role::DbServer => "/Plan/DBServers",
            Role::Coordinator => "/Plan/Coordinators",
        }
    }
}

/// One tick's health evaluation.
pub struct HealthCheck<'a> {
    env: &'a JobEnv,
    snapshot: &'a AgencyTree,
    transient: &'a AgencyTree,
    grace_period: Duration,
}

impl<'a> HealthCheck<'a> {
    /// Creates a checker over the tick's snapshots.
    #[must_use]
    pub fn new(
        env: &'a JobEnv,
        snapshot: &'a AgencyTree,
        transient: &'a AgencyTree,
        grace_period: Duration,
    ) -> Self {
        Self { env, snapshot, transient, grace_period }
    }

    /// Checks all planned servers of both roles.
    pub async fn run(&self, ids: &JobIdAllocator) {
        self.check_role(Role::DbServer, ids).await;
        self.check_role(Role::Coordinator, ids).await;
    }

    async fn check_role(&self, role: Role, ids: &JobIdAllocator) {
        let planned: Vec<String> =
            self.snapshot.children(role.plan_path()).map(|(name, _)| name.to_string()).collect();

        // Health records carrying this role's tag but no longer planned
        // are garbage.
        let mut stale: Vec<String> = self
            .snapshot
            .children(self.env.paths.health_root())
            .map(|(name, _)| name.to_string())
            .filter(|name| name.starts_with(role.tag()) && !planned.contains(name))
            .collect();
        stale.extend(
            self.transient
                .children(self.env.paths.health_root())
                .map(|(name, _)| name.to_string())
                .filter(|name| {
                    name.starts_with(role.tag())
                        && !planned.contains(name)
                        && !self.snapshot.has(&self.env.paths.health(name))
                }),
        );
        stale.dedup();

        let mut good_coordinator: Option<String> = None;
        let mut foxxmaster_ok = false;
        let current_foxxmaster =
            self.snapshot.str_at(self.env.paths.foxxmaster()).map(str::to_string);

        for server in &planned {
            let verdict = self.check_server(server, role, ids).await;
            if role == Role::Coordinator {
                if let Some(HealthStatus::Good) = verdict {
                    if good_coordinator.is_none() {
                        good_coordinator = Some(server.clone());
                    }
                    if current_foxxmaster.as_deref() == Some(server.as_str()) {
                        foxxmaster_ok = true;
                    }
                }
            }
        }

        if !stale.is_empty() {
            let mut tx = Transaction::new();
            for server in &stale {
                tx = tx.delete(self.env.paths.abs(&self.env.paths.health(server)));
            }
            self.env.submit("garbage-collect health records", tx.clone()).await;
            if let Err(e) = self.env.agency.write_transient(vec![tx]).await {
                tracing::debug!(error = %e, "transient gc write failed");
            }
        }

        // One GOOD coordinator must be named foxxmaster; last writer wins.
        if role == Role::Coordinator && !foxxmaster_ok {
            if let Some(master) = good_coordinator {
                let tx = Transaction::new()
                    .set(self.env.paths.abs(self.env.paths.foxxmaster()), json!(master));
                self.env.submit("assign foxxmaster", tx).await;
            }
        }
    }

    /// Evaluates one server; returns the status written, if any.
    async fn check_server(
        &self,
        server: &str,
        role: Role,
        ids: &JobIdAllocator,
    ) -> Option<HealthStatus> {
        let paths = &self.env.paths;
        let sync_path = paths.sync_server_state(server);
        let heartbeat_time = self.transient.str_at(&format!("{sync_path}/time")).unwrap_or("");
        let heartbeat_status = self.transient.str_at(&format!("{sync_path}/status")).unwrap_or("");

        let health_path = paths.health(server);
        let has_record = self.transient.has(&health_path);
        let last_sent =
            self.transient.str_at(&format!("{health_path}/LastHeartbeatSent")).unwrap_or("");
        let last_heartbeat_status =
            self.transient.str_at(&format!("{health_path}/LastHeartbeatStatus")).unwrap_or("");
        let last_acked =
            self.transient.str_at(&format!("{health_path}/LastHeartbeatAcked")).unwrap_or("");
        let prior = self
            .transient
            .str_at(&format!("{health_path}/Status"))
            .or_else(|| self.snapshot.str_at(&format!("{health_path}/Status")))
            .and_then(HealthStatus::parse);

        // A fresh beat, or a server we have never seen, counts as good.
        let good = !has_record || last_sent != heartbeat_time;

        let mut report = Map::new();
        report.insert("LastHeartbeatSent".to_string(), json!(heartbeat_time));
        report.insert("LastHeartbeatStatus".to_string(), json!(heartbeat_status));
        report.insert("Role".to_string(), json!(role.as_str()));
        report.insert(
            "ShortName".to_string(),
            json!(self.snapshot.str_at(&paths.short_name(server)).unwrap_or("Unknown")),
        );
        if let Some(endpoint) = self
            .snapshot
            .str_at(&format!("{}/{server}/endpoint", paths.servers_registered()))
        {
            report.insert("Endpoint".to_string(), json!(endpoint));
        }

        let mut report_persistent = last_heartbeat_status != heartbeat_status;
        let mut envelope: Option<Transaction> = None;

        let new_status = if good {
            report.insert("LastHeartbeatAcked".to_string(), json!(Utc::now().to_rfc3339()));
            if prior != Some(HealthStatus::Good) {
                report_persistent = true;
            }
            // A recovered server leaves the repair list.
            if prior == Some(HealthStatus::Failed)
                && self.snapshot.has(&paths.failed_server(server))
            {
                let tx =
                    Transaction::new().delete(paths.abs(&paths.failed_server(server)));
                self.env.submit("clear recovered failed server", tx).await;
            }
            HealthStatus::Good
        } else {
            report.insert("LastHeartbeatAcked".to_string(), json!(last_acked));
            if prior == Some(HealthStatus::Failed) {
                // The status is the state itself: a server already FAILED
                // stays FAILED without a new persistent write or job.
                HealthStatus::Failed
            } else if self.elapsed_since(last_acked) > self.grace_period {
                if prior == Some(HealthStatus::Bad) {
                    report_persistent = true;
                    if role == Role::DbServer {
                        if let Some(job_id) = ids.next() {
                            let job = FailedServer::new(
                                self.env,
                                self.snapshot,
                                job_id,
                                "supervision",
                                server,
                            );
                            envelope = Some(job.create_transaction());
                        } else {
                            tracing::warn!(
                                server,
                                "no job ids available, deferring failedServer creation"
                            );
                            // Stay BAD until ids are available again, so
                            // the FAILED mark and the job stay atomic.
                            report.insert(
                                "Status".to_string(),
                                json!(HealthStatus::Bad.as_str()),
                            );
                            self.write_report(&health_path, &report, false, None).await;
                            return Some(HealthStatus::Bad);
                        }
                    }
                    HealthStatus::Failed
                } else {
                    // BAD must precede FAILED, even when the grace period
                    // has long passed.
                    report_persistent = true;
                    HealthStatus::Bad
                }
            } else {
                if prior != Some(HealthStatus::Bad) {
                    report_persistent = true;
                }
                HealthStatus::Bad
            }
        };
        report.insert("Status".to_string(), json!(new_status.as_str()));
        self.write_report(&health_path, &report, report_persistent, envelope).await;
        Some(new_status)
    }

    async fn write_report(
        &self,
        health_path: &str,
        report: &Map<String, Value>,
        persistent: bool,
        envelope: Option<Transaction>,
    ) {
        let report_tx = Transaction::new()
            .set(self.env.paths.abs(health_path), Value::Object(report.clone()));

        if let Err(e) = self.env.agency.write_transient(vec![report_tx.clone()]).await {
            tracing::debug!(error = %e, "transient health report failed");
        }
        if persistent {
            let mut tx = report_tx;
            if let Some(envelope) = envelope {
                tx.ops.extend(envelope.ops);
                tx.preconditions.extend(envelope.preconditions);
            }
            self.env.submit("persist health status", tx).await;
        }
    }

    fn elapsed_since(&self, timestamp: &str) -> Duration {
        DateTime::parse_from_rfc3339(timestamp)
            .map(|parsed| {
                (Utc::now() - parsed.with_timezone(&Utc)).to_std().unwrap_or(Duration::ZERO)
            })
            .unwrap_or(Duration::MAX)
    }
}
