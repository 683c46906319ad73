//! Bounds-checked header decoding.
//!
//! Every structured access goes through [`PacketBuf`], whose implementations
//! compare against the end of the frame immediately before touching memory.
//! The kernel implementation relies on that shape to satisfy the verifier.

pub const ETH_HDR_LEN: usize = 14;
pub const ETH_DST_OFFSET: usize = 0;
pub const ETH_SRC_OFFSET: usize = 6;
const ETH_PROTO_OFFSET: usize = 12;
pub const ETH_P_IPV4: u16 = 0x0800;

pub const IPV4_OFFSET: usize = ETH_HDR_LEN;
const IPV4_MIN_HDR_LEN: usize = 20;
const IPV4_FRAG_OFFSET: usize = 6;
const IPV4_PROTO_OFFSET: usize = 9;
pub const IPV4_CHECK_OFFSET: usize = 10;
const IPV4_SRC_OFFSET: usize = 12;
pub const IPV4_DST_OFFSET: usize = 16;
const IPV4_FRAG_MASK: u16 = 0x1fff;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
const UDP_HDR_LEN: usize = 8;
const TCP_HDR_LEN: usize = 20;
pub const UDP_CHECK_OFFSET: usize = 6;
pub const TCP_CHECK_OFFSET: usize = 16;

/// A window over one received frame with an explicit end boundary.
pub trait PacketBuf {
    /// Total bytes in the frame.
    fn frame_len(&self) -> usize;

    /// Copies `N` bytes starting at `offset`, or `None` if they do not fit.
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]>;

    /// Overwrites `N` bytes at `offset`. Returns `false` (and writes nothing)
    /// if they do not fit.
    fn store<const N: usize>(&mut self, offset: usize, bytes: [u8; N]) -> bool;

    #[inline(always)]
    fn load_u8(&self, offset: usize) -> Option<u8> {
        self.load::<1>(offset).map(|b| b[0])
    }

    #[inline(always)]
    fn load_u16(&self, offset: usize) -> Option<u16> {
        self.load::<2>(offset).map(u16::from_be_bytes)
    }

    #[inline(always)]
    fn load_u32(&self, offset: usize) -> Option<u32> {
        self.load::<4>(offset).map(u32::from_be_bytes)
    }
}

impl PacketBuf for [u8] {
    #[inline(always)]
    fn frame_len(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn load<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        self.get(offset..end)?.try_into().ok()
    }

    #[inline(always)]
    fn store<const N: usize>(&mut self, offset: usize, bytes: [u8; N]) -> bool {
        let Some(end) = offset.checked_add(N) else {
            return false;
        };
        match self.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(&bytes);
                true
            }
            None => false,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
    /// Any other IP protocol; ports are reported as zero.
    Other(u8),
}

/// Decoded addressing of an IPv4 frame. Addresses are host-order integers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ParsedPacket {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub transport: Transport,
    pub src_port: u16,
    pub dst_port: u16,
    /// Offset of the transport header within the frame.
    pub l4_offset: usize,
}

impl ParsedPacket {
    /// Offset of the transport checksum field, if the protocol has one that
    /// covers the IPv4 pseudo-header.
    #[inline(always)]
    pub fn l4_check_offset(&self) -> Option<usize> {
        match self.transport {
            Transport::Udp => Some(self.l4_offset + UDP_CHECK_OFFSET),
            Transport::Tcp => Some(self.l4_offset + TCP_CHECK_OFFSET),
            Transport::Other(_) => None,
        }
    }
}

/// Decodes Ethernet + IPv4 + UDP/TCP. `None` means "not classifiable" and the
/// caller must pass the frame through untouched.
#[inline(always)]
pub fn parse<P: PacketBuf + ?Sized>(pkt: &P) -> Option<ParsedPacket> {
    // Also proves the whole Ethernet header is present.
    let proto = pkt.load_u16(ETH_PROTO_OFFSET)?;
    if proto != ETH_P_IPV4 {
        return None;
    }

    let ip = pkt.load::<IPV4_MIN_HDR_LEN>(IPV4_OFFSET)?;
    let version_ihl = ip[0];
    if version_ihl >> 4 != 4 {
        return None;
    }
    let ihl_words = (version_ihl & 0x0f) as usize;
    if ihl_words < 5 {
        return None;
    }
    let header_len = ihl_words * 4;

    let src_addr = u32::from_be_bytes([
        ip[IPV4_SRC_OFFSET],
        ip[IPV4_SRC_OFFSET + 1],
        ip[IPV4_SRC_OFFSET + 2],
        ip[IPV4_SRC_OFFSET + 3],
    ]);
    let dst_addr = u32::from_be_bytes([
        ip[IPV4_DST_OFFSET],
        ip[IPV4_DST_OFFSET + 1],
        ip[IPV4_DST_OFFSET + 2],
        ip[IPV4_DST_OFFSET + 3],
    ]);
    let protocol = ip[IPV4_PROTO_OFFSET];
    let l4_offset = IPV4_OFFSET + header_len;

    let transport = match protocol {
        PROTO_UDP => Transport::Udp,
        PROTO_TCP => Transport::Tcp,
        other => Transport::Other(other),
    };

    let (src_port, dst_port) = match transport {
        Transport::Other(_) => (0, 0),
        Transport::Udp | Transport::Tcp => {
            // Later fragments carry payload where the ports would be.
            let frag = u16::from_be_bytes([ip[IPV4_FRAG_OFFSET], ip[IPV4_FRAG_OFFSET + 1]]);
            if frag & IPV4_FRAG_MASK != 0 {
                return None;
            }
            let ports = if transport == Transport::Udp {
                pkt.load::<UDP_HDR_LEN>(l4_offset)?;
                pkt.load::<4>(l4_offset)?
            } else {
                pkt.load::<TCP_HDR_LEN>(l4_offset)?;
                pkt.load::<4>(l4_offset)?
            };
            (
                u16::from_be_bytes([ports[0], ports[1]]),
                u16::from_be_bytes([ports[2], ports[3]]),
            )
        }
    };

    Some(ParsedPacket {
        src_addr,
        dst_addr,
        transport,
        src_port,
        dst_port,
        l4_offset,
    })
}
