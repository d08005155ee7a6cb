//! Installs listeners for every signal spec.md §5 names and ties them to
//! the shared [`gridworker_engine::lifecycle::ShutdownFlag`]. Ported from
//! `original_source/src/signals.cc`'s signal table; `sigaction` + a global
//! flag becomes one `tokio::signal::unix::signal` task per signal, all
//! setting the same `ShutdownFlag`.

use tokio::signal::unix::{signal, SignalKind};

use gridworker_engine::lifecycle::ShutdownFlag;

fn signals() -> Vec<(SignalKind, &'static str)> {
    vec![
        (SignalKind::hangup(), "SIGHUP"),
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::quit(), "SIGQUIT"),
        (SignalKind::from_raw(libc::SIGABRT), "SIGABRT"),
        (SignalKind::from_raw(libc::SIGSEGV), "SIGSEGV"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::user_defined1(), "SIGUSR1"),
        (SignalKind::user_defined2(), "SIGUSR2"),
        (SignalKind::from_raw(libc::SIGXCPU), "SIGXCPU"),
        (SignalKind::from_raw(libc::SIGXFSZ), "SIGXFSZ"),
    ]
}

/// Spawns one task per signal kind and returns immediately; each task sets
/// `flag` the first time its signal fires and then exits (one shutdown
/// request is all the Main Loop needs — repeated signals don't escalate
/// here, unlike `kill_client hard` over the Control Channel).
///
/// Catching `SIGSEGV`/`SIGABRT` this way only works because the original
/// contract is "run `exit_client` then terminate", not "resume execution":
/// the process still exits once the Main Loop observes the shutdown flag,
/// it just does so via the ordinary shutdown path instead of the kernel's
/// default core-dump disposition.
pub fn install(flag: ShutdownFlag) {
    for (kind, name) in signals() {
        let mut stream = match signal(kind) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(signal = name, %err, "failed to install signal handler");
                continue;
            }
        };
        let flag = flag.clone();
        tokio::spawn(async move {
            if stream.recv().await.is_some() {
                tracing::info!(signal = name, "shutdown requested");
                flag.request();
            }
        });
    }
}
