//! Control Channel: a background task that polls the `messages` table every
//! two seconds on its own pooled connection and dispatches parsed commands
//! to the Main Loop over a bounded channel.
//!
//! Ported from `original_source/src/client.cc`'s message-polling branch of
//! the main loop; split out into its own task here since the DB Gateway
//! already hands out independent pooled connections (design notes, DB
//! Gateway entry in DESIGN.md).

use std::time::Duration;

use tokio::sync::mpsc;

use gridworker_db::Gateway;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A parsed control message, per spec.md §4.5.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Kill { job_id: i32 },
    KillClientSoft,
    KillClientHard,
    WaitTime { seconds: i32 },
}

/// Parses one message body. Unrecognized text is ignored (logged by the
/// caller), matching the original's silent-skip behavior for malformed
/// messages.
pub fn parse_command(body: &str) -> Option<ControlCommand> {
    let body = body.trim();
    if let Some(rest) = body.strip_prefix("kill_client ") {
        return match rest.trim() {
            "soft" => Some(ControlCommand::KillClientSoft),
            "hard" => Some(ControlCommand::KillClientHard),
            _ => None,
        };
    }
    if let Some(rest) = body.strip_prefix("kill ") {
        return rest.trim().parse().ok().map(|job_id| ControlCommand::Kill { job_id });
    }
    if let Some(rest) = body.strip_prefix("wait_time ") {
        return rest
            .trim()
            .parse()
            .ok()
            .map(|seconds| ControlCommand::WaitTime { seconds });
    }
    None
}

/// Runs until the receiver side is dropped. Intended to be spawned as its
/// own task and polled against a dedicated pool connection, never the one
/// the Main Loop uses for scheduling.
///
/// `jobs_wait_time`/`current_wait_time` are written back alongside every
/// poll (the original updates them in the same `UPDATE Client ...` as the
/// message clear, not as a separate statement) and should reflect the Main
/// Loop's live backoff state at the moment of the call.
pub async fn run(
    gateway: Gateway,
    client_id: i32,
    jobs_wait_time: i32,
    current_wait_time: i32,
    tx: mpsc::Sender<ControlCommand>,
) {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        interval.tick().await;
        match gateway
            .get_message(client_id, jobs_wait_time, current_wait_time)
            .await
        {
            Ok(body) if !body.is_empty() => match parse_command(&body) {
                Some(cmd) => {
                    if tx.send(cmd).await.is_err() {
                        return;
                    }
                }
                None => tracing::warn!(%body, "unrecognized control message"),
            },
            Ok(_) => {}
            Err(err) => tracing::warn!(%err, "control channel poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kill() {
        assert_eq!(parse_command("kill 42"), Some(ControlCommand::Kill { job_id: 42 }));
    }

    #[test]
    fn parses_kill_client_soft_and_hard() {
        assert_eq!(parse_command("kill_client soft"), Some(ControlCommand::KillClientSoft));
        assert_eq!(parse_command("kill_client hard"), Some(ControlCommand::KillClientHard));
    }

    #[test]
    fn parses_wait_time() {
        assert_eq!(
            parse_command("wait_time 300"),
            Some(ControlCommand::WaitTime { seconds: 300 })
        );
    }

    #[test]
    fn rejects_unknown_command() {
        assert_eq!(parse_command("frobnicate"), None);
    }

    #[test]
    fn rejects_malformed_kill() {
        assert_eq!(parse_command("kill not-a-number"), None);
    }
}
