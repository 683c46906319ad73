//! Operator configuration file.
//!
//! Everything has a default matching the classic deployment (SIP on
//! 5060/5061, RTP 10000-20000, API on 8080, 100k requests per second per
//! source), so an empty file is valid and balances nothing.

use std::{fmt, fs, net::Ipv4Addr, path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Serialize};

use voice_lb_common::{
    BACKEND_ACTIVE, BACKEND_HAS_MAC, Backend, ChecksumMode, LbConfig, MAX_BACKENDS, Pool,
    RATE_TABLE_CAPACITY, SelectorMode,
};

use crate::health::HealthPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BalancerConfig {
    pub ports: PortsConfig,
    pub rate_limit: RateLimitConfig,
    pub selection: SelectionConfig,
    pub checksum: ChecksumSetting,
    pub stats: StatsConfig,
    pub health: HealthConfig,
    pub signaling_backends: Vec<BackendEntry>,
    pub api_backends: Vec<BackendEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PortsConfig {
    pub signaling: u16,
    pub signaling_tls: u16,
    pub media_start: u16,
    pub media_end: u16,
    pub api: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        let d = LbConfig::DEFAULT;
        Self {
            signaling: d.signaling_port,
            signaling_tls: d.signaling_tls_port,
            media_start: d.media_port_start,
            media_end: d.media_port_end,
            api: d.api_port,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Signaling requests admitted per source per window.
    pub requests_per_window: u64,
    pub window_ms: u64,
    /// Max tracked sources; the kernel evicts least recently used beyond it.
    pub table_capacity: u32,
    /// Seconds between control-plane sweeps of idle records. 0 disables.
    pub sweep_interval_secs: u64,
    /// Records idle for more than this many windows are swept.
    pub sweep_idle_windows: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: LbConfig::DEFAULT.rate_limit,
            window_ms: LbConfig::DEFAULT.rate_window_ns / 1_000_000,
            table_capacity: RATE_TABLE_CAPACITY,
            sweep_interval_secs: 30,
            sweep_idle_windows: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SelectorSetting {
    #[default]
    Modulo,
    Maglev,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumSetting {
    #[default]
    Offload,
    Incremental,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionConfig {
    pub mode: SelectorSetting,
    /// Modulus for signaling selection, 1..=16.
    pub signaling_slots: u8,
    pub api_slots: u8,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            mode: SelectorSetting::Modulo,
            signaling_slots: MAX_BACKENDS as u8,
            api_slots: MAX_BACKENDS as u8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StatsConfig {
    pub report_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 5,
        }
    }
}

/// TCP reachability checks run by `voice-lb run`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Connect timeout per check.
    pub timeout_ms: u64,
    /// Consecutive successes before a down backend is restored.
    pub healthy_threshold: u8,
    /// Consecutive failures before a backend is taken out of rotation.
    pub unhealthy_threshold: u8,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            timeout_ms: 2000,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackendEntry {
    /// Explicit slot; otherwise the entry's position in the list.
    #[serde(default)]
    pub slot: Option<u32>,
    pub address: Ipv4Addr,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u16,
    #[serde(default)]
    pub mac: Option<MacAddr>,
}

fn default_weight() -> u16 {
    100
}

impl BackendEntry {
    pub fn to_backend(&self) -> Backend {
        let mut flags = BACKEND_ACTIVE;
        let mut mac = [0u8; 6];
        if let Some(addr) = self.mac {
            flags |= BACKEND_HAS_MAC;
            mac = addr.0;
        }
        Backend {
            addr: u32::from(self.address),
            port: self.port,
            weight: self.weight,
            connections: 0,
            mac,
            flags,
            reserved: 0,
        }
    }
}

/// Link-layer address written as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut out = [0u8; 6];
        let mut parts = s.trim().split([':', '-']);
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| anyhow!("MAC address '{s}' has fewer than 6 octets"))?;
            ensure!(
                part.len() == 2 && part.bytes().all(|b| b.is_ascii_hexdigit()),
                "invalid octet '{part}' in MAC address '{s}'"
            );
            *byte = u8::from_str_radix(part, 16)
                .with_context(|| format!("invalid octet '{part}' in MAC address '{s}'"))?;
        }
        ensure!(
            parts.next().is_none(),
            "MAC address '{s}' has more than 6 octets"
        );
        Ok(MacAddr(out))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddr> for String {
    fn from(value: MacAddr) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl BalancerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("invalid config at {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: BalancerConfig = toml::from_str(content).context("failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ports = &self.ports;
        ensure!(
            ports.media_start <= ports.media_end,
            "media port range {}-{} is empty",
            ports.media_start,
            ports.media_end
        );
        ensure!(
            ports.signaling != 0 && ports.signaling_tls != 0 && ports.api != 0,
            "ports must be non-zero"
        );
        ensure!(
            !(ports.media_start..=ports.media_end).contains(&ports.signaling),
            "signaling port {} lies inside the media range",
            ports.signaling
        );
        ensure!(
            ports.signaling_tls != ports.api,
            "signaling TLS port and API port are both {}",
            ports.api
        );

        let rate = &self.rate_limit;
        ensure!(rate.window_ms > 0, "rate window must be greater than zero");
        ensure!(
            rate.table_capacity > 0,
            "rate table capacity must be greater than zero"
        );
        ensure!(
            rate.sweep_interval_secs == 0 || rate.sweep_idle_windows > 0,
            "sweep_idle_windows must be greater than zero when sweeping"
        );

        for (label, slots) in [
            ("signaling_slots", self.selection.signaling_slots),
            ("api_slots", self.selection.api_slots),
        ] {
            ensure!(
                (1..=MAX_BACKENDS).contains(&(slots as u32)),
                "{label} must be between 1 and {MAX_BACKENDS}, got {slots}"
            );
        }
        ensure!(
            self.stats.report_interval_secs > 0,
            "stats report interval must be greater than zero"
        );

        let health = &self.health;
        if health.enabled {
            ensure!(
                health.interval_secs > 0 && health.timeout_ms > 0,
                "health check interval and timeout must be greater than zero"
            );
            ensure!(
                health.healthy_threshold > 0 && health.unhealthy_threshold > 0,
                "health thresholds must be greater than zero"
            );
        }

        self.backend_table(Pool::Signaling)?;
        self.backend_table(Pool::Api)?;
        Ok(())
    }

    pub fn lb_config(&self) -> LbConfig {
        LbConfig {
            signaling_port: self.ports.signaling,
            signaling_tls_port: self.ports.signaling_tls,
            media_port_start: self.ports.media_start,
            media_port_end: self.ports.media_end,
            api_port: self.ports.api,
            signaling_slots: self.selection.signaling_slots,
            api_slots: self.selection.api_slots,
            selector: match self.selection.mode {
                SelectorSetting::Modulo => SelectorMode::Modulo as u8,
                SelectorSetting::Maglev => SelectorMode::Maglev as u8,
            },
            checksum: match self.checksum {
                ChecksumSetting::Offload => ChecksumMode::Offload as u8,
                ChecksumSetting::Incremental => ChecksumMode::Incremental as u8,
            },
            reserved: [0; 2],
            rate_limit: self.rate_limit.requests_per_window,
            rate_window_ns: self.rate_limit.window_ms.saturating_mul(1_000_000),
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.stats.report_interval_secs.max(1))
    }

    /// Sweep cadence, `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        match self.rate_limit.sweep_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Health check cadence and policy, `None` when checks are disabled.
    pub fn health_policy(&self) -> Option<(Duration, HealthPolicy)> {
        let health = &self.health;
        if !health.enabled {
            return None;
        }
        Some((
            Duration::from_secs(health.interval_secs),
            HealthPolicy {
                timeout: Duration::from_millis(health.timeout_ms),
                healthy_after: health.healthy_threshold,
                unhealthy_after: health.unhealthy_threshold,
            },
        ))
    }

    pub fn entries(&self, pool: Pool) -> &[BackendEntry] {
        match pool {
            Pool::Signaling => &self.signaling_backends,
            Pool::Api => &self.api_backends,
        }
    }

    /// Lays a pool's entries out into its slot array.
    pub fn backend_table(&self, pool: Pool) -> Result<[Backend; MAX_BACKENDS as usize]> {
        let label = pool_name(pool);
        let slots = match pool {
            Pool::Signaling => self.selection.signaling_slots,
            Pool::Api => self.selection.api_slots,
        } as u32;
        let mut table = [Backend::EMPTY; MAX_BACKENDS as usize];

        for (position, item) in self.entries(pool).iter().enumerate() {
            let slot = item.slot.unwrap_or(position as u32);
            ensure!(
                slot < MAX_BACKENDS,
                "{label} backend {} uses slot {slot}, table has {MAX_BACKENDS}",
                item.address
            );
            ensure!(
                !item.address.is_unspecified(),
                "{label} backend in slot {slot} has address 0.0.0.0"
            );
            if slot >= slots && self.selection.mode == SelectorSetting::Modulo {
                tracing::warn!(
                    pool = label,
                    slot,
                    slots,
                    "backend sits beyond the selection modulus and will never be chosen"
                );
            }
            let entry = &mut table[slot as usize];
            ensure!(
                !entry.is_usable(),
                "{label} slot {slot} is configured twice"
            );
            *entry = item.to_backend();
        }

        Ok(table)
    }
}

pub fn pool_name(pool: Pool) -> &'static str {
    match pool {
        Pool::Signaling => "signaling",
        Pool::Api => "api",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parses_and_formats() {
        let mac: MacAddr = "02:1A:2b:3c:4d:5e".parse().unwrap();
        assert_eq!(mac.0, [0x02, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
        assert_eq!(mac.to_string(), "02:1a:2b:3c:4d:5e");
        assert_eq!("02-1a-2b-3c-4d-5e".parse::<MacAddr>().unwrap(), mac);
    }

    #[test]
    fn mac_rejects_bad_input() {
        for bad in [
            "",
            "02:1a",
            "02:1a:2b:3c:4d:5e:6f",
            "zz:1a:2b:3c:4d:5e",
            "2:1a:2b:3c:4d:5e",
            "+a:00:00:00:00:01",
            "02:00:00:00:00:-1",
        ] {
            assert!(bad.parse::<MacAddr>().is_err(), "{bad}");
        }
    }

    #[test]
    fn backend_entry_sets_flags() {
        let item = BackendEntry {
            slot: None,
            address: Ipv4Addr::new(10, 0, 0, 5),
            port: 5060,
            weight: 100,
            mac: Some(MacAddr([2, 0, 0, 0, 0, 1])),
        };
        let backend = item.to_backend();
        assert_eq!(backend.addr, 0x0a00_0005);
        assert!(backend.is_usable());
        assert_eq!(backend.mac(), Some([2, 0, 0, 0, 0, 1]));
    }
}
