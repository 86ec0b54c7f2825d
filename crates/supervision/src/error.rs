//! Error types for the supervisor.
//!
//! Errors inside the supervisor are always logged and dropped: the loop
//! never terminates on transient failure. The variants here exist so that
//! helpers can report *what* failed to the tick that drops them.

use snafu::Snafu;

use arbor_agency::AgencyError;

/// Result type alias for supervision operations.
pub type Result<T> = std::result::Result<T, SupervisionError>;

/// Errors that can occur while supervising the cluster.
#[derive(Debug, Snafu)]
pub enum SupervisionError {
    /// The agency could not be reached; the tick becomes a no-op.
    #[snafu(display("agency error: {source}"))]
    Agency {
        /// The underlying agency error.
        source: AgencyError,
    },

    /// A job record is missing from the expected bucket.
    #[snafu(display("job {job_id} not found in agency"))]
    JobNotFound {
        /// The missing job.
        job_id: String,
    },

    /// A job record exists but cannot be interpreted.
    #[snafu(display("malformed job {job_id}: {reason}"))]
    MalformedJob {
        /// The offending job.
        job_id: String,
        /// What was wrong with the record.
        reason: String,
    },

    /// No job ids are available and allocation failed.
    #[snafu(display("job id window exhausted"))]
    NoJobIds,
}

impl From<AgencyError> for SupervisionError {
    fn from(source: AgencyError) -> Self {
        SupervisionError::Agency { source }
    }
}
