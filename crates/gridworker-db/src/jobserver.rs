//! Optional job-server mode (spec.md §6.4): an advisory TCP service that
//! hands out experiment/job ids without being consulted for the actual
//! claim, which always still runs through [`crate::gateway::Gateway`].
//!
//! Ported from `original_source/src/jobserver.cc`. All integers are
//! big-endian on the wire; `func_id` is a `u16`, everything else a `u32`.

use md5::{Digest, Md5};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const PROTOCOL_VERSION: u32 = 2;
const MAGIC: &[u8; 12] = b"EDACC_CLIENT";
const FUNC_POSSIBLE_EXPERIMENT_IDS: u16 = 0;
const FUNC_JOB_ID: u16 = 1;

#[derive(Debug, Error)]
pub enum JobServerError {
    #[error("job-server connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("job-server protocol version mismatch: expected {PROTOCOL_VERSION}, got {0}")]
    VersionMismatch(u32),
}

pub struct JobServerClient {
    host: String,
    port: u16,
    database: String,
    username: String,
    password: String,
    stream: Option<TcpStream>,
}

impl JobServerClient {
    pub fn new(host: &str, port: u16, database: &str, username: &str, password: &str) -> Self {
        JobServerClient {
            host: host.to_string(),
            port,
            database: database.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            stream: None,
        }
    }

    /// Reconnects if necessary, then runs the handshake in
    /// `connectToJobserver`: version exchange, magic, nonce+MD5 auth,
    /// database-name handshake.
    pub async fn ensure_connected(&mut self) -> Result<(), JobServerError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;

        let version = stream.read_u32().await?;
        if version != PROTOCOL_VERSION {
            return Err(JobServerError::VersionMismatch(version));
        }
        stream.write_u32(PROTOCOL_VERSION).await?;
        stream.write_all(MAGIC).await?;

        let nonce = stream.read_u32().await?;
        let mut hasher = Md5::new();
        hasher.update(nonce.to_string());
        hasher.update(&self.username);
        hasher.update(&self.password);
        let digest = hasher.finalize();
        stream.write_all(&digest).await?;

        let mut db_name = self.database.clone().into_bytes();
        db_name.push(0);
        stream.write_u32(db_name.len() as u32).await?;
        stream.write_all(&db_name).await?;

        self.stream = Some(stream);
        Ok(())
    }

    /// Function 0: the set of experiment ids eligible for `grid_queue_id`.
    pub async fn possible_experiment_ids(
        &mut self,
        grid_queue_id: i32,
    ) -> Result<Vec<i32>, JobServerError> {
        self.ensure_connected().await?;
        let stream = self.stream.as_mut().expect("just connected");

        stream.write_u16(FUNC_POSSIBLE_EXPERIMENT_IDS).await?;
        stream.write_i32(grid_queue_id).await?;

        let count = stream.read_u32().await?;
        let mut ids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ids.push(stream.read_i32().await?);
        }
        Ok(ids)
    }

    /// Function 1: a job id for `experiment_id`.
    pub async fn job_id(&mut self, experiment_id: i32) -> Result<i32, JobServerError> {
        self.ensure_connected().await?;
        let stream = self.stream.as_mut().expect("just connected");

        stream.write_u16(FUNC_JOB_ID).await?;
        stream.write_i32(experiment_id).await?;
        Ok(stream.read_i32().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_digest_matches_nonce_user_pass_concatenation() {
        let mut hasher = Md5::new();
        hasher.update(42u32.to_string());
        hasher.update("worker");
        hasher.update("hunter2");
        let digest = hasher.finalize();
        assert_eq!(digest.len(), 16);
    }
}
