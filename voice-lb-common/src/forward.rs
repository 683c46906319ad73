//! Classification and the per-packet verdict.

use crate::packet::{
    self, PacketBuf, ParsedPacket, Transport, ETH_DST_OFFSET, ETH_SRC_OFFSET, IPV4_CHECK_OFFSET,
    IPV4_DST_OFFSET, IPV4_OFFSET,
};
use crate::rate::{self, RateLimit, RateTable};
use crate::select;
use crate::stats::{Stat, StatsSink};
use crate::{Backend, ChecksumMode, LbConfig, SelectorMode};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Hand the frame to the kernel stack untouched.
    Pass,
    Drop,
    /// Headers were rewritten; send the frame back out.
    Transmit,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrafficClass {
    Signaling,
    Media,
    Api,
    Other,
}

/// Backend array a class is balanced over.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Pool {
    Signaling,
    Api,
}

/// Everything the pipeline touches besides the frame itself.
pub trait Datapath: RateTable + StatsSink {
    /// Monotonic nanoseconds.
    fn now_ns(&self) -> u64;

    /// Snapshot of one backend slot, `None` if the index is out of range.
    fn backend(&self, pool: Pool, slot: u32) -> Option<Backend>;

    /// Raw Maglev table entry at `index`.
    fn maglev_entry(&self, pool: Pool, index: u32) -> Option<u32>;
}

#[inline(always)]
pub fn classify(pkt: &ParsedPacket, cfg: &LbConfig) -> TrafficClass {
    let port = pkt.dst_port;
    match pkt.transport {
        Transport::Udp if port == cfg.signaling_port => TrafficClass::Signaling,
        Transport::Udp if port >= cfg.media_port_start && port <= cfg.media_port_end => {
            TrafficClass::Media
        }
        Transport::Tcp if port == cfg.signaling_tls_port => TrafficClass::Signaling,
        Transport::Tcp if port == cfg.api_port => TrafficClass::Api,
        _ => TrafficClass::Other,
    }
}

/// Runs one frame through parse, classify, admit, select and rewrite.
#[inline(always)]
pub fn process<P, D>(pkt: &mut P, cfg: &LbConfig, dp: &mut D) -> Verdict
where
    P: PacketBuf + ?Sized,
    D: Datapath + ?Sized,
{
    dp.incr(Stat::Packets);
    dp.add(Stat::Bytes, pkt.frame_len() as u64);

    let Some(parsed) = packet::parse(pkt) else {
        return Verdict::Pass;
    };

    match classify(&parsed, cfg) {
        TrafficClass::Signaling => {
            dp.incr(Stat::SignalingRequests);
            let limit = RateLimit {
                limit: cfg.rate_limit,
                window_ns: cfg.rate_window_ns,
            };
            let now = dp.now_ns();
            if !rate::admit(&mut *dp, parsed.src_addr, now, limit) {
                dp.incr(Stat::Dropped);
                return Verdict::Drop;
            }
            balance(pkt, &parsed, cfg, dp, Pool::Signaling)
        }
        TrafficClass::Api => balance(pkt, &parsed, cfg, dp, Pool::Api),
        TrafficClass::Media | TrafficClass::Other => Verdict::Pass,
    }
}

#[inline(always)]
fn balance<P, D>(
    pkt: &mut P,
    parsed: &ParsedPacket,
    cfg: &LbConfig,
    dp: &mut D,
    pool: Pool,
) -> Verdict
where
    P: PacketBuf + ?Sized,
    D: Datapath + ?Sized,
{
    let slot = match cfg.selector_mode() {
        SelectorMode::Modulo => Some(select::select(
            parsed.src_addr,
            parsed.src_port,
            cfg.slots(pool),
        )),
        SelectorMode::Maglev => dp
            .maglev_entry(pool, select::maglev_index(parsed.src_addr, parsed.src_port))
            .and_then(select::maglev_slot),
    };

    // Copied once; a concurrent control-plane write cannot change it under us.
    let backend = slot
        .and_then(|slot| dp.backend(pool, slot))
        .filter(Backend::is_usable);
    let Some(backend) = backend else {
        dp.incr(Stat::NoBackend);
        return Verdict::Pass;
    };

    if rewrite(pkt, parsed, &backend, cfg.checksum_mode()).is_none() {
        return Verdict::Pass;
    }
    dp.incr(Stat::Transmitted);
    Verdict::Transmit
}

/// Points the frame at `backend`. Every read happens before the first write so
/// a failed bounds check leaves the frame untouched.
#[inline(always)]
fn rewrite<P: PacketBuf + ?Sized>(
    pkt: &mut P,
    parsed: &ParsedPacket,
    backend: &Backend,
    mode: ChecksumMode,
) -> Option<()> {
    let eth_dst = pkt.load::<6>(ETH_DST_OFFSET)?;
    let eth_src = pkt.load::<6>(ETH_SRC_OFFSET)?;
    let old_daddr = pkt.load::<4>(IPV4_OFFSET + IPV4_DST_OFFSET)?;
    let new_daddr = backend.addr.to_be_bytes();

    let (new_eth_dst, new_eth_src) = match backend.mac() {
        // Out the interface we arrived on, towards the backend.
        Some(mac) => (mac, eth_dst),
        // No resolved address: reflect to the sender's own MAC.
        None => (eth_src, eth_src),
    };

    let (ip_check, l4_check) = match mode {
        ChecksumMode::Offload => ([0, 0], None),
        ChecksumMode::Incremental => {
            let old = pkt.load_u16(IPV4_OFFSET + IPV4_CHECK_OFFSET)?;
            let ip_check = csum_replace4(old, old_daddr, new_daddr).to_be_bytes();
            let l4_check = match parsed.l4_check_offset() {
                Some(at) => {
                    let old = pkt.load_u16(at)?;
                    if parsed.transport == Transport::Udp && old == 0 {
                        // Sender opted out of the UDP checksum.
                        None
                    } else {
                        let mut new = csum_replace4(old, old_daddr, new_daddr);
                        if parsed.transport == Transport::Udp && new == 0 {
                            new = 0xffff;
                        }
                        Some((at, new.to_be_bytes()))
                    }
                }
                None => None,
            };
            (ip_check, l4_check)
        }
    };

    let mut ok = pkt.store(ETH_DST_OFFSET, new_eth_dst);
    ok &= pkt.store(ETH_SRC_OFFSET, new_eth_src);
    ok &= pkt.store(IPV4_OFFSET + IPV4_DST_OFFSET, new_daddr);
    ok &= pkt.store(IPV4_OFFSET + IPV4_CHECK_OFFSET, ip_check);
    if let Some((at, bytes)) = l4_check {
        ok &= pkt.store(at, bytes);
    }
    if ok {
        Some(())
    } else {
        None
    }
}

/// RFC 1624 incremental update of a ones-complement checksum after a 32-bit
/// field changes from `old` to `new`.
#[inline(always)]
fn csum_replace4(check: u16, old: [u8; 4], new: [u8; 4]) -> u16 {
    let mut sum = (!check) as u32;
    sum += (!u16::from_be_bytes([old[0], old[1]])) as u32;
    sum += (!u16::from_be_bytes([old[2], old[3]])) as u32;
    sum += u16::from_be_bytes([new[0], new[1]]) as u32;
    sum += u16::from_be_bytes([new[2], new[3]]) as u32;
    sum = (sum & 0xffff) + (sum >> 16);
    sum = (sum & 0xffff) + (sum >> 16);
    !(sum as u16)
}
