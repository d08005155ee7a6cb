//! Cross-worker file-download locking over `(binary_id, filesystem_id)`.
//!
//! Ported from `original_source/src/database_fs_locking.cc`. The original's
//! three-way return convention (-1 retry, 0 wait, 1 success) becomes
//! [`LockOutcome`]; the background "keep the lock fresh" thread becomes a
//! task scoped to the caller's lock hold (design notes §9), owned by
//! `gridworker-engine::artifact`, not by this module — this module only
//! exposes the primitive single-shot operations the refresher calls in a
//! loop.

use std::time::Duration;

use sqlx::{MySqlPool, Row};

use crate::error::GatewayError;

/// A download is considered abandoned once its lock row's `lastReport` is
/// older than this.
pub const DOWNLOAD_TIMEOUT_SECS: i64 = 10;
/// How often a held lock's `lastReport` must be refreshed.
pub const DOWNLOAD_REFRESH: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Acquired the lock; caller now owns the download.
    Acquired,
    /// Another worker holds an active lock; caller should sleep
    /// [`DOWNLOAD_REFRESH`] and call again.
    HeldByOther,
    /// The insert raced another worker's insert and lost; same
    /// recommendation as `HeldByOther`.
    LostRace,
}

/// Tries to acquire the download lock for `(binary_id, fsid)`, stealing it
/// from a peer whose `lastReport` is older than [`DOWNLOAD_TIMEOUT_SECS`].
pub async fn try_lock(
    pool: &MySqlPool,
    table: LockTable,
    binary_id: i32,
    fsid: i32,
) -> Result<LockOutcome, GatewayError> {
    let mut tx = pool.begin().await.map_err(GatewayError::from_sqlx)?;

    let row = sqlx::query(&format!(
        "SELECT TIMESTAMPDIFF(SECOND, lastReport, NOW()) AS age \
         FROM {} WHERE {} = ? AND filesystemID = ? FOR UPDATE",
        table.table_name(),
        table.id_column(),
    ))
    .bind(binary_id)
    .bind(fsid)
    .fetch_optional(&mut *tx)
    .await
    .map_err(GatewayError::from_sqlx)?;

    let outcome = match row {
        None => {
            let inserted = sqlx::query(&format!(
                "INSERT INTO {} ({}, filesystemID, lastReport) VALUES (?, ?, NOW())",
                table.table_name(),
                table.id_column(),
            ))
            .bind(binary_id)
            .bind(fsid)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => LockOutcome::Acquired,
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    LockOutcome::LostRace
                }
                Err(e) => return Err(GatewayError::from_sqlx(e)),
            }
        }
        Some(row) => {
            let age: i64 = row.try_get("age").unwrap_or(0);
            if age > DOWNLOAD_TIMEOUT_SECS {
                refresh_in_tx(&mut tx, table, binary_id, fsid).await?;
                LockOutcome::Acquired
            } else {
                LockOutcome::HeldByOther
            }
        }
    };

    tx.commit().await.map_err(GatewayError::from_sqlx)?;
    Ok(outcome)
}

async fn refresh_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::MySql>,
    table: LockTable,
    binary_id: i32,
    fsid: i32,
) -> Result<(), GatewayError> {
    sqlx::query(&format!(
        "UPDATE {} SET lastReport = NOW() WHERE {} = ? AND filesystemID = ?",
        table.table_name(),
        table.id_column(),
    ))
    .bind(binary_id)
    .bind(fsid)
    .execute(&mut **tx)
    .await
    .map_err(GatewayError::from_sqlx)?;
    Ok(())
}

/// Refreshes an already-held lock's `lastReport`. Called in a loop by the
/// refresher task roughly every [`DOWNLOAD_REFRESH`].
pub async fn refresh(
    pool: &MySqlPool,
    table: LockTable,
    binary_id: i32,
    fsid: i32,
) -> Result<(), GatewayError> {
    sqlx::query(&format!(
        "UPDATE {} SET lastReport = NOW() WHERE {} = ? AND filesystemID = ?",
        table.table_name(),
        table.id_column(),
    ))
    .bind(binary_id)
    .bind(fsid)
    .execute(pool)
    .await
    .map_err(GatewayError::from_sqlx)?;
    Ok(())
}

pub async fn unlock(
    pool: &MySqlPool,
    table: LockTable,
    binary_id: i32,
    fsid: i32,
) -> Result<(), GatewayError> {
    sqlx::query(&format!(
        "DELETE FROM {} WHERE {} = ? AND filesystemID = ?",
        table.table_name(),
        table.id_column(),
    ))
    .bind(binary_id)
    .bind(fsid)
    .execute(pool)
    .await
    .map_err(GatewayError::from_sqlx)?;
    Ok(())
}

/// Read-only check: is this binary currently locked (by anyone) on this
/// filesystem? Fails safe — treats a query error as "locked," matching the
/// original's `file_locked`.
pub async fn is_locked(pool: &MySqlPool, table: LockTable, binary_id: i32, fsid: i32) -> bool {
    let row = sqlx::query(&format!(
        "SELECT TIMESTAMPDIFF(SECOND, lastReport, NOW()) AS age \
         FROM {} WHERE {} = ? AND filesystemID = ?",
        table.table_name(),
        table.id_column(),
    ))
    .bind(binary_id)
    .bind(fsid)
    .fetch_optional(pool)
    .await;

    match row {
        Ok(Some(row)) => {
            let age: i64 = row.try_get("age").unwrap_or(0);
            age <= DOWNLOAD_TIMEOUT_SECS
        }
        Ok(None) => false,
        Err(_) => true,
    }
}

/// Instance and solver downloads are locked in separate tables with
/// identical shapes; `LockTable` picks which one a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTable {
    Instance,
    Solver,
}

impl LockTable {
    fn table_name(self) -> &'static str {
        match self {
            LockTable::Instance => "InstanceDownloads",
            LockTable::Solver => "SolverDownloads",
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            LockTable::Instance => "idInstance",
            LockTable::Solver => "idSolver",
        }
    }
}
