//! Captures the `HostInfo` contract spec.md treats as an external
//! collaborator. Field semantics are ported from the original's
//! `/proc`-reading routines rather than a generic system-info crate,
//! because the exact substring/formula conventions below are part of the
//! contract (see DESIGN.md).

use std::collections::HashSet;
use std::fs;

use crate::model::HostInfo;

/// Captures a full `HostInfo` snapshot from `/proc` and the network stack.
/// Any individual field that can't be read falls back to a zero value
/// rather than failing the whole capture — a malformed `/proc` entry should
/// not prevent the worker from signing on.
pub fn capture() -> HostInfo {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_else(|err| {
        tracing::warn!(%err, "could not read /proc/cpuinfo, host info will be incomplete");
        String::new()
    });
    let meminfo = fs::read_to_string("/proc/meminfo").unwrap_or_else(|err| {
        tracing::warn!(%err, "could not read /proc/meminfo, host info will be incomplete");
        String::new()
    });

    let (num_cores, num_threads) = count_cores_and_threads(&cpuinfo);
    let cpu_flags = first_field_value(&cpuinfo, "flags");
    let hyperthreading = cpu_flags.contains(" ht ") || cpu_flags.ends_with(" ht");
    let turboboost = cpu_flags.contains(" ida");
    let cpu_model = first_field_value(&cpuinfo, "model name");
    let cache_size = first_cache_size_kb(&cpuinfo);
    let (memory, free_memory) = parse_meminfo(&meminfo);

    HostInfo {
        num_cores,
        num_threads,
        hyperthreading,
        turboboost,
        cpu_model,
        cache_size,
        cpu_flags,
        memory,
        free_memory,
        cpuinfo,
        meminfo,
        hostname: hostname().unwrap_or_default(),
        ip_address: primary_ip_address().unwrap_or_default(),
    }
}

/// `num_threads` = count of `processor` lines. `num_cores` = distinct
/// `core id` values times distinct `physical id` values — the same
/// (slightly naive, doesn't handle asymmetric topologies) formula as the
/// original `get_num_physical_cpus`.
fn count_cores_and_threads(cpuinfo: &str) -> (i32, i32) {
    let mut physical_ids = HashSet::new();
    let mut core_ids = HashSet::new();
    let mut processors = 0i32;

    for line in cpuinfo.lines() {
        if let Some(v) = line.strip_prefix("processor") {
            if v.trim_start().starts_with(':') {
                processors += 1;
            }
        } else if let Some(v) = field_value(line, "physical id") {
            physical_ids.insert(v);
        } else if let Some(v) = field_value(line, "core id") {
            core_ids.insert(v);
        }
    }

    let cores = if physical_ids.is_empty() || core_ids.is_empty() {
        processors
    } else {
        (core_ids.len() * physical_ids.len()) as i32
    };
    (cores, processors)
}

fn field_value(line: &str, field: &str) -> Option<String> {
    let (key, value) = line.split_once(':')?;
    if key.trim() == field {
        Some(value.trim().to_string())
    } else {
        None
    }
}

fn first_field_value(cpuinfo: &str, field: &str) -> String {
    cpuinfo
        .lines()
        .find_map(|line| field_value(line, field))
        .unwrap_or_default()
}

/// Strips the trailing ` KB` unit, mirroring the original's `-2`
/// substring-length adjustment.
fn first_cache_size_kb(cpuinfo: &str) -> i32 {
    let raw = first_field_value(cpuinfo, "cache size");
    raw.trim_end_matches("KB")
        .trim()
        .parse()
        .unwrap_or_default()
}

fn parse_meminfo(meminfo: &str) -> (u64, u64) {
    let mut total = 0u64;
    let mut free = 0u64;
    for line in meminfo.lines() {
        if let Some(v) = field_value(line, "MemTotal") {
            total = parse_kb(&v);
        } else if let Some(v) = field_value(line, "MemFree") {
            free = parse_kb(&v);
        }
    }
    (total, free)
}

fn parse_kb(value: &str) -> u64 {
    value
        .split_whitespace()
        .next()
        .and_then(|n| n.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or_default()
}

fn hostname() -> Option<String> {
    ::hostname::get().ok()?.into_string().ok()
}

/// First non-loopback IPv4 address, read off `/proc/net/fib_trie`-adjacent
/// state is overkill for this worker; `/proc/net/route`'s interface list
/// combined with a UDP "connect" trick is the common idiomatic shortcut,
/// but gridworker only needs *an* address to report, not routing behavior,
/// so it shells out to the same mechanism most lightweight daemons use.
fn primary_ip_address() -> Option<String> {
    use std::net::UdpSocket;
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
processor\t: 0
model name\t: Example CPU
physical id\t: 0
core id\t: 0
cache size\t: 8192 KB
flags\t\t: fpu vme ht ida

processor\t: 1
model name\t: Example CPU
physical id\t: 0
core id\t: 1
cache size\t: 8192 KB
flags\t\t: fpu vme ht ida
";

    #[test]
    fn counts_cores_and_threads() {
        let (cores, threads) = count_cores_and_threads(SAMPLE);
        assert_eq!(threads, 2);
        assert_eq!(cores, 2);
    }

    #[test]
    fn extracts_flags_based_features() {
        let flags = first_field_value(SAMPLE, "flags");
        assert!(flags.contains(" ht ") || flags.ends_with(" ht"));
        assert!(flags.contains(" ida"));
    }

    #[test]
    fn strips_cache_size_unit() {
        assert_eq!(first_cache_size_kb(SAMPLE), 8192);
    }
}
