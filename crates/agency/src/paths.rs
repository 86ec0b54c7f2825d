//! Typed builder over the fixed agency tree layout.
//!
//! The agency prefix is explicit state handed to the supervisor at
//! construction; nothing in this crate keeps it in a global. Methods return
//! prefix-relative paths (the form used against cached snapshots, which are
//! rooted at the prefix); [`AgencyPaths::abs`] produces the absolute form
//! used in transactions.

/// Path builder rooted at a configured agency prefix.
#[derive(Debug, Clone)]
pub struct AgencyPaths {
    prefix: String,
}

impl AgencyPaths {
    /// Creates a path builder for the given prefix (e.g. `/arango`).
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// The configured prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Converts a prefix-relative path into the absolute form.
    #[must_use]
    pub fn abs(&self, relative: &str) -> String {
        format!("{}{relative}", self.prefix)
    }

    /// `/Plan/DBServers`
    #[must_use]
    pub fn plan_db_servers(&self) -> &'static str {
        "/Plan/DBServers"
    }

    /// `/Plan/Coordinators`
    #[must_use]
    pub fn plan_coordinators(&self) -> &'static str {
        "/Plan/Coordinators"
    }

    /// `/Plan/Collections`
    #[must_use]
    pub fn plan_collections(&self) -> &'static str {
        "/Plan/Collections"
    }

    /// `/Plan/Collections/<db>/<col>/shards/<shard>`
    #[must_use]
    pub fn plan_shard_servers(&self, db: &str, col: &str, shard: &str) -> String {
        format!("/Plan/Collections/{db}/{col}/shards/{shard}")
    }

    /// `/Plan/Version`
    #[must_use]
    pub fn plan_version(&self) -> &'static str {
        "/Plan/Version"
    }

    /// `/Current/Collections`
    #[must_use]
    pub fn current_collections(&self) -> &'static str {
        "/Current/Collections"
    }

    /// `/Current/Collections/<db>/<col>/<shard>/servers`
    #[must_use]
    pub fn current_shard_servers(&self, db: &str, col: &str, shard: &str) -> String {
        format!("/Current/Collections/{db}/{col}/{shard}/servers")
    }

    /// `/Current/ServersRegistered`
    #[must_use]
    pub fn servers_registered(&self) -> &'static str {
        "/Current/ServersRegistered"
    }

    /// `/Current/Foxxmaster`
    #[must_use]
    pub fn foxxmaster(&self) -> &'static str {
        "/Current/Foxxmaster"
    }

    /// `/Sync/ServerStates/<srv>`
    #[must_use]
    pub fn sync_server_state(&self, server: &str) -> String {
        format!("/Sync/ServerStates/{server}")
    }

    /// `/Sync/LatestID`
    #[must_use]
    pub fn latest_id(&self) -> &'static str {
        "/Sync/LatestID"
    }

    /// `/Supervision/Health/<srv>`
    #[must_use]
    pub fn health(&self, server: &str) -> String {
        format!("/Supervision/Health/{server}")
    }

    /// `/Supervision/Health`
    #[must_use]
    pub fn health_root(&self) -> &'static str {
        "/Supervision/Health"
    }

    /// `/Supervision/Shards/<shard>` — lock taken by a job mutating a shard.
    #[must_use]
    pub fn blocked_shard(&self, shard: &str) -> String {
        format!("/Supervision/Shards/{shard}")
    }

    /// `/Supervision/DBServers/<srv>` — lock taken by a job mutating a server.
    #[must_use]
    pub fn blocked_server(&self, server: &str) -> String {
        format!("/Supervision/DBServers/{server}")
    }

    /// `/Target/MapUniqueToShortID/<srv>/ShortName`
    #[must_use]
    pub fn short_name(&self, server: &str) -> String {
        format!("/Target/MapUniqueToShortID/{server}/ShortName")
    }

    /// `/Target/FailedServers`
    #[must_use]
    pub fn failed_servers(&self) -> &'static str {
        "/Target/FailedServers"
    }

    /// `/Target/FailedServers/<srv>`
    #[must_use]
    pub fn failed_server(&self, server: &str) -> String {
        format!("/Target/FailedServers/{server}")
    }

    /// `/Target/CleanedServers`
    #[must_use]
    pub fn cleaned_servers(&self) -> &'static str {
        "/Target/CleanedServers"
    }

    /// `/Target/NumberOfDBServers`
    #[must_use]
    pub fn target_db_server_count(&self) -> &'static str {
        "/Target/NumberOfDBServers"
    }

    /// `/Target/ToDo`
    #[must_use]
    pub fn todo(&self) -> &'static str {
        "/Target/ToDo"
    }

    /// `/Target/Pending`
    #[must_use]
    pub fn pending(&self) -> &'static str {
        "/Target/Pending"
    }

    /// `/Target/Finished`
    #[must_use]
    pub fn finished(&self) -> &'static str {
        "/Target/Finished"
    }

    /// `/Target/Failed`
    #[must_use]
    pub fn failed(&self) -> &'static str {
        "/Target/Failed"
    }

    /// `/Target/<bucket>/<jobId>`
    #[must_use]
    pub fn job(&self, bucket: &str, job_id: &str) -> String {
        format!("{bucket}/{job_id}")
    }

    /// `/Shutdown`
    #[must_use]
    pub fn shutdown(&self) -> &'static str {
        "/Shutdown"
    }
}
