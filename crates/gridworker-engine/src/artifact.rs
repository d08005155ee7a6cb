//! Fetch, cache, decompress, and MD5-verify solver/instance binaries on the
//! shared filesystem under `base_path/{solvers,instances}`.
//!
//! Ported from `original_source/src/file_routines.cc` (write-then-chmod
//! order, MD5 check) and `database_fs_locking.cc` (the cross-worker lock
//! algorithm). The lock-refresh background thread becomes a task scoped to
//! the `with_lock` call (design notes §9) instead of a shared `finished`
//! flag.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use md5::{Digest, Md5};
use sqlx::MySqlPool;
use thiserror::Error;
use tokio::task::JoinHandle;

use gridworker_db::locking::{self, LockOutcome, LockTable, DOWNLOAD_REFRESH};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error materializing artifact: {0}")]
    FetchError(#[source] std::io::Error),
    #[error("md5 mismatch for {name}: db={expected} computed={actual}")]
    IntegrityError {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("download lock for {0} held by another worker past the timeout window")]
    TimeoutError(String),
    #[error(transparent)]
    Database(#[from] gridworker_db::GatewayError),
}

pub enum ArtifactKind {
    Solver,
    Instance,
}

impl ArtifactKind {
    fn subdir(&self) -> &'static str {
        match self {
            ArtifactKind::Solver => "solvers",
            ArtifactKind::Instance => "instances",
        }
    }

    fn mode(&self) -> u32 {
        match self {
            ArtifactKind::Solver => 0o777,
            ArtifactKind::Instance => 0o666,
        }
    }

    fn lock_table(&self) -> LockTable {
        match self {
            ArtifactKind::Solver => LockTable::Solver,
            ArtifactKind::Instance => LockTable::Instance,
        }
    }
}

/// Ensures `binary_id`'s blob (named `<md5>_<name>`) is present under
/// `base_path/<kind>` and matches `expected_md5`, fetching it via `fetch`
/// if needed. `fetch` is supplied by the caller (it differs only in which
/// gateway call it issues — `get_solver_binary` vs `get_instance_binary`).
pub async fn materialize<F, Fut>(
    pool: &MySqlPool,
    base_path: &Path,
    kind: ArtifactKind,
    binary_id: i32,
    fsid: i32,
    name: &str,
    expected_md5: &str,
    fetch: F,
) -> Result<PathBuf, ArtifactError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>, gridworker_db::GatewayError>>,
{
    let dir = base_path.join(kind.subdir());
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(ArtifactError::FetchError)?;
    let target = dir.join(format!("{expected_md5}_{name}"));

    if target.exists() && md5_matches(&target, expected_md5).await? {
        return Ok(target);
    }

    let table = kind.lock_table();
    let deadline = std::time::Instant::now() + Duration::from_secs(locking::DOWNLOAD_TIMEOUT_SECS as u64 * 6);

    loop {
        match locking::try_lock(pool, table, binary_id, fsid).await? {
            LockOutcome::Acquired => break,
            LockOutcome::HeldByOther | LockOutcome::LostRace => {
                tokio::time::sleep(DOWNLOAD_REFRESH).await;
                if target.exists() && md5_matches(&target, expected_md5).await? {
                    return Ok(target);
                }
                if std::time::Instant::now() > deadline {
                    return Err(ArtifactError::TimeoutError(name.to_string()));
                }
            }
        }
    }

    let refresher = spawn_refresher(pool.clone(), table, binary_id, fsid);
    let result = download_and_verify(&target, expected_md5, name, fetch, kind.mode()).await;
    refresher.abort();
    locking::unlock(pool, table, binary_id, fsid).await?;
    result.map(|()| target)
}

async fn download_and_verify<F, Fut>(
    target: &Path,
    expected_md5: &str,
    name: &str,
    fetch: F,
    mode: u32,
) -> Result<(), ArtifactError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>, gridworker_db::GatewayError>>,
{
    let blob = fetch().await?;
    let blob = maybe_decompress(blob);

    tokio::fs::write(target, &blob)
        .await
        .map_err(ArtifactError::FetchError)?;

    let perms = std::fs::Permissions::from_mode(mode);
    tokio::fs::set_permissions(target, perms)
        .await
        .map_err(ArtifactError::FetchError)?;

    if !md5_matches(target, expected_md5).await? {
        let actual = compute_md5(target).await.unwrap_or_default();
        return Err(ArtifactError::IntegrityError {
            name: name.to_string(),
            expected: expected_md5.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Two distinct containers show up here: `.xz`-framed blobs (`\xFD7zXZ\x00`
/// magic, decoded by `XzDecoder` directly) and the upstream system's own
/// `"LZMA"`-prefixed format (the literal ASCII bytes tested by the
/// original's `is_lzma`), which is a raw LZMA-SDK "alone" stream — a
/// 5-byte properties header plus an 8-byte uncompressed size — immediately
/// following the prefix. `liblzma`'s legacy alone-format decoder handles
/// that container; it is not `.xz` framing, so `XzDecoder::new` can't read
/// it directly. A plain blob that matches neither magic passes through
/// unchanged.
fn maybe_decompress(blob: Vec<u8>) -> Vec<u8> {
    const XZ_MAGIC: [u8; 6] = [0xFD, b'7', b'z', b'X', b'Z', 0x00];
    const LZMA_MAGIC: &[u8; 4] = b"LZMA";

    if blob.len() >= XZ_MAGIC.len() && blob[..XZ_MAGIC.len()] == XZ_MAGIC {
        if let Some(out) = decode_xz(&blob) {
            return out;
        }
    } else if blob.len() >= LZMA_MAGIC.len() && &blob[..LZMA_MAGIC.len()] == LZMA_MAGIC {
        if let Some(out) = decode_lzma_alone(&blob[LZMA_MAGIC.len()..]) {
            return out;
        }
    }
    blob
}

fn decode_xz(blob: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = xz2::read::XzDecoder::new(blob);
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut out).ok()?;
    Some(out)
}

fn decode_lzma_alone(raw: &[u8]) -> Option<Vec<u8>> {
    let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX).ok()?;
    let mut decoder = xz2::read::XzDecoder::new_stream(raw, stream);
    let mut out = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut out).ok()?;
    Some(out)
}

async fn md5_matches(path: &Path, expected: &str) -> Result<bool, ArtifactError> {
    Ok(compute_md5(path).await? == expected)
}

async fn compute_md5(path: &Path) -> Result<String, ArtifactError> {
    let bytes = tokio::fs::read(path).await.map_err(ArtifactError::FetchError)?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn spawn_refresher(
    pool: MySqlPool,
    table: LockTable,
    binary_id: i32,
    fsid: i32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(DOWNLOAD_REFRESH).await;
            if locking::refresh(&pool, table, binary_id, fsid).await.is_err() {
                tracing::warn!(binary_id, fsid, "failed to refresh download lock");
            }
        }
    })
}
