use crate::db::BoxError;

/// Errors surfaced by the load-generation engine.
///
/// Driver-level failures cross the [`crate::Database`] seam as boxed errors
/// and are wrapped here with the context of the failing operation. Under
/// force-mode, `Query` and `Format` errors are logged and skipped instead of
/// aborting the run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening or pinging a connection failed. Aborts preparation.
    #[error("failed to open connection: {0}")]
    Connection(BoxError),

    /// The driver reported an execution failure for a query.
    #[error("query failed: {cause}: query={query}")]
    Query { query: String, cause: BoxError },

    /// A corpus record could not be decoded, or the query field is missing.
    #[error("malformed record: {reason}: key={key}, json={line}")]
    Format {
        key: String,
        line: String,
        reason: String,
    },

    /// File open/seek/read failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An operation was invoked in the wrong lifecycle state.
    #[error("{0}")]
    Lifecycle(&'static str),
}
