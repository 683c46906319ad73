#![no_std]
#![no_main]

mod maps;

use aya_ebpf::bindings::xdp_action;
use aya_ebpf::helpers::bpf_ktime_get_ns;
use aya_ebpf::macros::xdp;
use aya_ebpf::programs::XdpContext;
use voice_lb_common::forward::{self, Datapath};
use voice_lb_common::rate::RateTable;
use voice_lb_common::stats::StatsSink;
use voice_lb_common::{Backend, LbConfig, PacketBuf, Pool, RateRecord, Stat, Verdict};

use crate::maps::{
    API_BACKENDS, API_MAGLEV, LB_CONFIG, RATE_LIMIT, SIGNALING_BACKENDS, SIGNALING_MAGLEV, STATS,
};

#[xdp]
pub fn xdp_voice_lb(ctx: XdpContext) -> u32 {
    let cfg = runtime_config();
    let mut pkt = XdpPacket { ctx: &ctx };
    match forward::process(&mut pkt, &cfg, &mut Kernel) {
        Verdict::Pass => xdp_action::XDP_PASS,
        Verdict::Drop => xdp_action::XDP_DROP,
        Verdict::Transmit => xdp_action::XDP_TX,
    }
}

fn runtime_config() -> LbConfig {
    match LB_CONFIG.get(voice_lb_common::CONFIG_SLOT_RUNTIME) {
        Some(cfg) => *cfg,
        None => LbConfig::DEFAULT,
    }
}

/// Frame accessor over `data..data_end`. Each access re-derives the pointers
/// and compares against `data_end` right before the copy.
struct XdpPacket<'a> {
    ctx: &'a XdpContext,
}

impl PacketBuf for XdpPacket<'_> {
    #[inline(always)]
    fn frame_len(&self) -> usize {
        self.ctx.data_end().saturating_sub(self.ctx.data())
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let start = self.ctx.data();
        let end = self.ctx.data_end();
        if start + offset + N > end {
            return None;
        }
        let ptr = (start + offset) as *const [u8; N];
        Some(unsafe { core::ptr::read_unaligned(ptr) })
    }

    #[inline(always)]
    fn store<const N: usize>(&mut self, offset: usize, bytes: [u8; N]) -> bool {
        let start = self.ctx.data();
        let end = self.ctx.data_end();
        if start + offset + N > end {
            return false;
        }
        let ptr = (start + offset) as *mut [u8; N];
        unsafe { core::ptr::write_unaligned(ptr, bytes) };
        true
    }
}

/// The shared maps, seen through the pipeline's traits.
struct Kernel;

impl RateTable for Kernel {
    #[inline(always)]
    fn lookup(&mut self, addr: u32) -> Option<&mut RateRecord> {
        RATE_LIMIT
            .get_ptr_mut(&addr)
            .map(|ptr| unsafe { &mut *ptr })
    }

    #[inline(always)]
    fn insert(&mut self, addr: u32, record: RateRecord) -> bool {
        RATE_LIMIT.insert(&addr, &record, 0).is_ok()
    }
}

impl StatsSink for Kernel {
    #[inline(always)]
    fn add(&mut self, stat: Stat, n: u64) {
        if let Some(ptr) = STATS.get_ptr_mut(stat as u32) {
            unsafe {
                *ptr = (*ptr).wrapping_add(n);
            }
        }
    }
}

impl Datapath for Kernel {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn backend(&self, pool: Pool, slot: u32) -> Option<Backend> {
        let table = match pool {
            Pool::Signaling => &SIGNALING_BACKENDS,
            Pool::Api => &API_BACKENDS,
        };
        table.get(slot).copied()
    }

    #[inline(always)]
    fn maglev_entry(&self, pool: Pool, index: u32) -> Option<u32> {
        let table = match pool {
            Pool::Signaling => &SIGNALING_MAGLEV,
            Pool::Api => &API_MAGLEV,
        };
        table.get(index).copied()
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
