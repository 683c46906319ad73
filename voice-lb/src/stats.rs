use std::{borrow::Borrow, convert::TryFrom, path::Path, time::Duration};

use anyhow::{Context, Result, anyhow};
use aya::maps::{Map, MapData, PerCpuArray};
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Number as JsonNumber, Value};
use tracing::info;

use voice_lb_common::Stat;

const SLOTS: usize = Stat::COUNT as usize;

/// Open the pinned per-CPU stats array.
pub fn open_pinned<P: AsRef<Path>>(pin_path: P) -> Result<PerCpuArray<MapData, u64>> {
    let pin = pin_path.as_ref();
    let map_data = MapData::from_pin(pin)
        .map_err(|e| anyhow!("failed to open pinned map {}: {}", pin.display(), e))?;
    let map_enum = Map::PerCpuArray(map_data);
    PerCpuArray::<_, u64>::try_from(map_enum)
        .map_err(|e| anyhow!("failed to convert to PerCpuArray: {}", e))
}

/// Counters summed over every CPU at one instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    totals: [u128; SLOTS],
}

impl StatsSnapshot {
    pub fn read<T: Borrow<MapData>>(map: &PerCpuArray<T, u64>) -> Result<Self> {
        let mut totals = [0u128; SLOTS];
        for stat in Stat::ALL {
            let per_cpu = map
                .get(&(stat as u32), 0)
                .with_context(|| format!("failed to read stat {}", stat.name()))?;
            totals[stat as usize] = sum_counters(per_cpu.iter());
        }
        Ok(Self {
            taken_at: Utc::now(),
            totals,
        })
    }

    pub fn get(&self, stat: Stat) -> u128 {
        self.totals[stat as usize]
    }

    /// Per-second increase since `earlier`. A counter that went backwards
    /// (maps recreated underneath us) reports zero.
    pub fn rates_since(&self, earlier: &StatsSnapshot, elapsed: Duration) -> [f64; SLOTS] {
        let secs = elapsed.as_secs_f64();
        let mut rates = [0.0; SLOTS];
        if secs <= 0.0 {
            return rates;
        }
        for stat in Stat::ALL {
            let delta = self.get(stat).saturating_sub(earlier.get(stat));
            rates[stat as usize] = delta as f64 / secs;
        }
        rates
    }

    pub fn to_json(&self) -> Value {
        let mut counters = JsonMap::new();
        for stat in Stat::ALL {
            counters.insert(stat.name().to_string(), value_from_u128(self.get(stat)));
        }
        let mut obj = JsonMap::new();
        obj.insert(
            "timestamp".to_string(),
            Value::String(self.taken_at.to_rfc3339()),
        );
        obj.insert("counters".to_string(), Value::Object(counters));
        Value::Object(obj)
    }
}

/// Log totals and per-second rates between two snapshots.
pub fn report(current: &StatsSnapshot, previous: &StatsSnapshot) {
    let elapsed = (current.taken_at - previous.taken_at)
        .to_std()
        .unwrap_or_default();
    let rates = current.rates_since(previous, elapsed);
    info!(
        at = %current.taken_at.format("%H:%M:%S"),
        packets = %current.get(Stat::Packets),
        pps = round1(rates[Stat::Packets as usize]),
        bps = round1(rates[Stat::Bytes as usize] * 8.0),
        sip_rps = round1(rates[Stat::SignalingRequests as usize]),
        dropped = %current.get(Stat::Dropped),
        transmitted = %current.get(Stat::Transmitted),
        no_backend = %current.get(Stat::NoBackend),
        "stats"
    );
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn sum_counters<'a, I>(values: I) -> u128
where
    I: IntoIterator<Item = &'a u64>,
{
    values
        .into_iter()
        .fold(0u128, |total, v| total.wrapping_add(*v as u128))
}

fn value_from_u128(n: u128) -> Value {
    if n <= u64::MAX as u128 {
        Value::Number(JsonNumber::from(n as u64))
    } else {
        Value::String(n.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot(secs: i64, totals: [u128; SLOTS]) -> StatsSnapshot {
        StatsSnapshot {
            taken_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            totals,
        }
    }

    #[test]
    fn sum_counters_accumulates_multiple_cpus() {
        let cpus = [100u64, 50, 0, 7];
        assert_eq!(sum_counters(cpus.iter()), 157);
    }

    #[test]
    fn sum_counters_handles_large_values() {
        let cpus = [u64::MAX, 1];
        assert_eq!(sum_counters(cpus.iter()), (u64::MAX as u128) + 1);
    }

    #[test]
    fn value_from_u128_formats_numbers() {
        match value_from_u128(42) {
            Value::Number(n) => assert_eq!(n, JsonNumber::from(42)),
            other => panic!("unexpected value: {other:?}"),
        }

        let big = (u64::MAX as u128) + 5;
        match value_from_u128(big) {
            Value::String(s) => assert_eq!(s, big.to_string()),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn rates_are_per_second() {
        let earlier = snapshot(0, [100, 1_000, 10, 0, 50, 0]);
        let later = snapshot(2, [300, 5_000, 30, 4, 150, 0]);
        let rates = later.rates_since(&earlier, Duration::from_secs(2));
        assert_eq!(rates[Stat::Packets as usize], 100.0);
        assert_eq!(rates[Stat::Bytes as usize], 2_000.0);
        assert_eq!(rates[Stat::SignalingRequests as usize], 10.0);
        assert_eq!(rates[Stat::Dropped as usize], 2.0);
    }

    #[test]
    fn counters_going_backwards_rate_zero() {
        let earlier = snapshot(0, [500; SLOTS]);
        let later = snapshot(1, [10; SLOTS]);
        let rates = later.rates_since(&earlier, Duration::from_secs(1));
        assert!(rates.iter().all(|r| *r == 0.0));
        assert!(
            later
                .rates_since(&earlier, Duration::ZERO)
                .iter()
                .all(|r| *r == 0.0)
        );
    }

    #[test]
    fn json_names_every_counter() {
        let snap = snapshot(0, [1, 2, 3, 4, 5, 6]);
        let json = snap.to_json();
        let counters = json["counters"].as_object().unwrap();
        assert_eq!(counters.len(), SLOTS);
        assert_eq!(counters["packets"], Value::from(1u64));
        assert_eq!(counters["no_backend"], Value::from(6u64));
        assert!(json["timestamp"].as_str().unwrap().starts_with("2023-11-14"));
    }
}
