//! Frame decoding down to TCP segments.
//!
//! Only TCP carries TLS here, so everything else (UDP, ICMP, ARP, frames
//! cut short by the snap length) decodes to `None`.

use std::net::{IpAddr, SocketAddr};

use etherparse::{NetSlice, SlicedPacket, TcpSlice, TransportSlice};

/// Linux cooked capture (v1) header in front of the IP packet.
const SLL_HEADER_LEN: usize = 16;

/// Link-layer type of the capture, determines how to parse raw packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    LinuxSll,
    RawIp,
}

/// Control bits of a TCP header that reassembly cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl TcpFlags {
    fn of(tcp: &TcpSlice<'_>) -> Self {
        TcpFlags {
            syn: tcp.syn(),
            ack: tcp.ack(),
            fin: tcp.fin(),
            rst: tcp.rst(),
            psh: tcp.psh(),
        }
    }
}

/// One captured TCP segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    /// Connection this segment belongs to, whichever way it travels.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.src, self.dst)
    }
}

/// Both endpoints of a TCP connection, lower endpoint first, so the two
/// directions of a connection share one key.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamKey {
    lo: SocketAddr,
    hi: SocketAddr,
}

impl StreamKey {
    pub fn new(a: SocketAddr, b: SocketAddr) -> Self {
        let (a, b) = (canonical(a), canonical(b));
        if a <= b {
            StreamKey { lo: a, hi: b }
        } else {
            StreamKey { lo: b, hi: a }
        }
    }

    /// Lower endpoint in address order.
    pub fn lo(&self) -> SocketAddr {
        self.lo
    }

    pub fn hi(&self) -> SocketAddr {
        self.hi
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <-> {}", self.lo, self.hi)
    }
}

/// Dual-stack sockets report IPv4 peers as `::ffff:a.b.c.d`; fold those
/// back to IPv4 so both spellings land on one connection.
fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}

/// Decode a captured frame to the TCP segment it carries.
pub fn decode_segment(frame: &[u8], link_type: LinkType) -> Option<TcpSegment> {
    let sliced = slice_frame(frame, link_type)?;
    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return None,
    };
    let Some(TransportSlice::Tcp(tcp)) = &sliced.transport else {
        return None;
    };

    Some(TcpSegment {
        src: canonical(SocketAddr::new(src_ip, tcp.source_port())),
        dst: canonical(SocketAddr::new(dst_ip, tcp.destination_port())),
        seq: tcp.sequence_number(),
        flags: TcpFlags::of(tcp),
        payload: tcp.payload().to_vec(),
    })
}

fn slice_frame(frame: &[u8], link_type: LinkType) -> Option<SlicedPacket<'_>> {
    match link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(frame).ok(),
        LinkType::RawIp => SlicedPacket::from_ip(frame).ok(),
        LinkType::LinuxSll => SlicedPacket::from_ip(frame.get(SLL_HEADER_LEN..)?).ok(),
    }
}
