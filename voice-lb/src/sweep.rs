//! Control-plane expiry of idle rate-limit records.
//!
//! The data path never deletes; the LRU map evicts under pressure and this
//! sweep removes sources that have gone quiet.

use std::borrow::BorrowMut;

use anyhow::{Context, Result};
use aya::maps::{HashMap, MapData};
use tracing::debug;

use voice_lb_common::{RateRecord, rate};

/// Current `CLOCK_MONOTONIC` reading, the clock `bpf_ktime_get_ns` reports.
pub fn monotonic_now_ns() -> Result<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("clock_gettime(CLOCK_MONOTONIC)");
    }
    Ok((ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64))
}

#[derive(Clone, Copy, Debug)]
pub struct SweepPolicy {
    pub window_ns: u64,
    pub idle_windows: u64,
}

/// Keys whose records have been idle longer than the policy allows.
pub fn expired_keys<I>(records: I, now: u64, policy: SweepPolicy) -> Vec<u32>
where
    I: IntoIterator<Item = (u32, RateRecord)>,
{
    records
        .into_iter()
        .filter(|(_, record)| rate::is_expired(record, now, policy.window_ns, policy.idle_windows))
        .map(|(addr, _)| addr)
        .collect()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub scanned: usize,
    pub removed: usize,
}

/// Removes expired records from the live map. Entries that vanish or fail
/// mid-sweep are skipped; the next pass picks up anything left behind.
pub fn sweep_map<T: BorrowMut<MapData>>(
    map: &mut HashMap<T, u32, RateRecord>,
    now: u64,
    policy: SweepPolicy,
) -> SweepOutcome {
    let mut records = Vec::new();
    for item in map.iter() {
        match item {
            Ok(entry) => records.push(entry),
            Err(err) => debug!(%err, "rate map iteration stopped early"),
        }
    }
    let scanned = records.len();
    let mut removed = 0;
    for addr in expired_keys(records, now, policy) {
        match map.remove(&addr) {
            Ok(()) => removed += 1,
            Err(err) => debug!(addr, %err, "failed to remove rate record"),
        }
    }
    SweepOutcome { scanned, removed }
}
