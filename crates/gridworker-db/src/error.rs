use thiserror::Error;

/// Error taxonomy for the DB Gateway, matching spec.md §7's `DBConnect` /
/// `DBTransient` / `DBQuery` rows. `ClaimRace` is deliberately not a
/// variant here: `Gateway::fetch_and_lock_job` returns `Ok(None)` for a lost
/// race, since spec.md treats it as an expected outcome, not a failure.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("could not connect to the database: {0}")]
    Connect(#[source] sqlx::Error),

    /// A connection was lost mid-query. Retried by `with_retry` up to the
    /// caller's wait budget before being surfaced.
    #[error("transient database error: {0}")]
    Transient(#[source] sqlx::Error),

    /// `Transient` errors kept recurring past the caller's `jobs_wait_time`
    /// budget.
    #[error("database unreachable after exhausting the retry budget")]
    RetryBudgetExhausted,

    /// A permanent SQL error (bad query, constraint violation, etc).
    #[error("database query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// `insert_client` (or any "must return an id" call) executed without
    /// error but produced no id.
    #[error("{0} did not return an id")]
    NoIdReturned(&'static str),
}

impl GatewayError {
    /// MySQL's "server has gone away" (2006) / "lost connection" (2013)
    /// conditions, the two the original's `is_recoverable_error` treats as
    /// retryable.
    pub fn from_sqlx(err: sqlx::Error) -> GatewayError {
        if is_transient(&err) {
            GatewayError::Transient(err)
        } else {
            GatewayError::Query(err)
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    ) || matches!(err, sqlx::Error::Database(db) if matches!(db.code().as_deref(), Some("2006") | Some("2013")))
}
