// Map definitions. Names are the user-visible pin names the control plane
// opens (kept under the kernel's 15 byte limit); keep them in sync with
// `voice-lb/src/loader.rs`.
//
// Array maps start zeroed. The loader always writes both Maglev tables, so a
// zero entry there really means slot 0.

use aya_ebpf::macros::map;
use aya_ebpf::maps::{Array, LruHashMap, PerCpuArray};
use voice_lb_common::{
    Backend, LbConfig, RateRecord, Stat, MAGLEV_TABLE_SIZE, MAX_BACKENDS, RATE_TABLE_CAPACITY,
};

/// Source address -> fixed-window record. The loader may resize it.
#[map(name = "rate_limit")]
pub static RATE_LIMIT: LruHashMap<u32, RateRecord> =
    LruHashMap::<u32, RateRecord>::with_max_entries(RATE_TABLE_CAPACITY, 0);

#[map(name = "sig_backends")]
pub static SIGNALING_BACKENDS: Array<Backend> =
    Array::<Backend>::with_max_entries(MAX_BACKENDS, 0);

#[map(name = "api_backends")]
pub static API_BACKENDS: Array<Backend> = Array::<Backend>::with_max_entries(MAX_BACKENDS, 0);

#[map(name = "sig_maglev")]
pub static SIGNALING_MAGLEV: Array<u32> = Array::<u32>::with_max_entries(MAGLEV_TABLE_SIZE, 0);

#[map(name = "api_maglev")]
pub static API_MAGLEV: Array<u32> = Array::<u32>::with_max_entries(MAGLEV_TABLE_SIZE, 0);

#[map(name = "stats")]
pub static STATS: PerCpuArray<u64> = PerCpuArray::<u64>::with_max_entries(Stat::COUNT, 0);

#[map(name = "lb_config")]
pub static LB_CONFIG: Array<LbConfig> = Array::<LbConfig>::with_max_entries(1, 0);
