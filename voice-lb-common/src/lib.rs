#![no_std]

// Types shared between the XDP program and the userspace control plane, plus
// the per-packet decision pipeline itself. Keep this crate `no_std` and
// allocation free so the kernel side can use all of it.

pub mod forward;
pub mod packet;
pub mod rate;
pub mod select;
pub mod stats;

pub use forward::{Pool, TrafficClass, Verdict};
pub use packet::{PacketBuf, ParsedPacket, Transport};
pub use stats::Stat;

/// Slots in each backend array.
pub const MAX_BACKENDS: u32 = 16;
/// Design capacity of the per-source rate table.
pub const RATE_TABLE_CAPACITY: u32 = 1_000_000;
/// Entries in a Maglev lookup table. Must be prime and much larger than
/// `MAX_BACKENDS`.
pub const MAGLEV_TABLE_SIZE: u32 = 4099;
/// Maglev entry that has not been assigned a slot.
pub const MAGLEV_EMPTY: u32 = u32::MAX;

pub const DEFAULT_SIGNALING_PORT: u16 = 5060;
pub const DEFAULT_SIGNALING_TLS_PORT: u16 = 5061;
pub const DEFAULT_MEDIA_PORT_START: u16 = 10_000;
pub const DEFAULT_MEDIA_PORT_END: u16 = 20_000;
pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_RATE_LIMIT: u64 = 100_000;
pub const DEFAULT_RATE_WINDOW_NS: u64 = 1_000_000_000;

/// Slot in the single-entry `LB_CONFIG` array.
pub const CONFIG_SLOT_RUNTIME: u32 = 0;

/// Slot is populated and may be selected.
pub const BACKEND_ACTIVE: u8 = 1 << 0;
/// `mac` holds the backend's link-layer address.
pub const BACKEND_HAS_MAC: u8 = 1 << 1;

/// One slot of a backend array. `addr` is the IPv4 address as a host-order
/// integer (`u32::from(Ipv4Addr)`).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Backend {
    pub addr: u32,
    pub port: u16,
    pub weight: u16,
    pub connections: u64,
    pub mac: [u8; 6],
    pub flags: u8,
    pub reserved: u8,
}

impl Backend {
    pub const EMPTY: Backend = Backend {
        addr: 0,
        port: 0,
        weight: 0,
        connections: 0,
        mac: [0; 6],
        flags: 0,
        reserved: 0,
    };

    /// Whether the slot may be used as a forwarding target. A zero address is
    /// never usable, even when flagged active.
    #[inline(always)]
    pub fn is_usable(&self) -> bool {
        self.flags & BACKEND_ACTIVE != 0 && self.addr != 0
    }

    #[inline(always)]
    pub fn mac(&self) -> Option<[u8; 6]> {
        if self.flags & BACKEND_HAS_MAC != 0 {
            Some(self.mac)
        } else {
            None
        }
    }
}

/// Fixed-window counter for one source address.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct RateRecord {
    pub count: u64,
    pub window_start: u64,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum SelectorMode {
    /// `mix(addr, port) % slots`.
    #[default]
    Modulo = 0,
    /// `table[mix(addr, port) % MAGLEV_TABLE_SIZE]`.
    Maglev = 1,
}

impl SelectorMode {
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => SelectorMode::Maglev,
            _ => SelectorMode::Modulo,
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ChecksumMode {
    /// Zero the IPv4 checksum and leave recomputation to the NIC.
    #[default]
    Offload = 0,
    /// Patch the IPv4 and transport checksums in place (RFC 1624).
    Incremental = 1,
}

impl ChecksumMode {
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ChecksumMode::Incremental,
            _ => ChecksumMode::Offload,
        }
    }
}

/// Runtime knobs written by the loader into `LB_CONFIG`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LbConfig {
    pub signaling_port: u16,
    pub signaling_tls_port: u16,
    pub media_port_start: u16,
    pub media_port_end: u16,
    pub api_port: u16,
    pub signaling_slots: u8,
    pub api_slots: u8,
    pub selector: u8,
    pub checksum: u8,
    pub reserved: [u8; 2],
    pub rate_limit: u64,
    pub rate_window_ns: u64,
}

impl LbConfig {
    pub const DEFAULT: LbConfig = LbConfig {
        signaling_port: DEFAULT_SIGNALING_PORT,
        signaling_tls_port: DEFAULT_SIGNALING_TLS_PORT,
        media_port_start: DEFAULT_MEDIA_PORT_START,
        media_port_end: DEFAULT_MEDIA_PORT_END,
        api_port: DEFAULT_API_PORT,
        signaling_slots: MAX_BACKENDS as u8,
        api_slots: MAX_BACKENDS as u8,
        selector: SelectorMode::Modulo as u8,
        checksum: ChecksumMode::Offload as u8,
        reserved: [0; 2],
        rate_limit: DEFAULT_RATE_LIMIT,
        rate_window_ns: DEFAULT_RATE_WINDOW_NS,
    };

    #[inline(always)]
    pub fn selector_mode(&self) -> SelectorMode {
        SelectorMode::from_raw(self.selector)
    }

    #[inline(always)]
    pub fn checksum_mode(&self) -> ChecksumMode {
        ChecksumMode::from_raw(self.checksum)
    }

    /// Modulus for a pool, clamped to `1..=MAX_BACKENDS` so a corrupt config
    /// can neither divide by zero nor index past the array.
    #[inline(always)]
    pub fn slots(&self, pool: Pool) -> u32 {
        let raw = match pool {
            Pool::Signaling => self.signaling_slots,
            Pool::Api => self.api_slots,
        } as u32;
        if raw == 0 || raw > MAX_BACKENDS {
            MAX_BACKENDS
        } else {
            raw
        }
    }
}

impl Default for LbConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes `aya::Pod` for the map value types so they can be used with aya's
// typed map APIs.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{Backend, LbConfig, RateRecord};
    use aya::Pod;

    unsafe impl Pod for Backend {}
    unsafe impl Pod for RateRecord {}
    unsafe impl Pod for LbConfig {}
}
