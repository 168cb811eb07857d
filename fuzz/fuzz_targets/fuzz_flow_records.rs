#![no_main]
use libfuzzer_sys::fuzz_target;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tlsgrep::protocol::{TcpFlags, TcpSegment};
use tlsgrep::reassembly::TcpFlow;
use tlsgrep::tls::Flow;

// Input is a sequence of chunks: one control byte (low bit picks the
// sender, the rest sizes the chunk) followed by the chunk's payload.
fuzz_target!(|data: &[u8]| {
    let client = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 51000);
    let server = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 443);
    let mut seq = [1u32, 1u32];
    let mut flow = Flow::new(TcpFlow::new());

    let mut rest = data;
    while let Some((&control, tail)) = rest.split_first() {
        let from_client = control & 1 == 0;
        let len = usize::from(control >> 1).min(tail.len());
        let (payload, tail) = tail.split_at(len);
        rest = tail;

        let i = usize::from(!from_client);
        let (src, dst) = if from_client {
            (client, server)
        } else {
            (server, client)
        };
        let segment = TcpSegment {
            src,
            dst,
            seq: seq[i],
            flags: TcpFlags {
                ack: true,
                ..TcpFlags::default()
            },
            payload: payload.to_vec(),
        };
        seq[i] = seq[i].wrapping_add(len as u32);
        flow.add(&segment);
    }
    flow.finish();
});
