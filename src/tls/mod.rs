pub mod connstate;
pub mod decrypt;
pub mod direction;
pub mod flow;
pub mod handshake;
pub mod keylog;

use std::collections::HashMap;

use crate::protocol::{StreamKey, TcpSegment};
use crate::reassembly::{Side, TcpFlow};

pub use connstate::{
    ConnStatePeriod, ConnStatePlex, ConnectionStateParams, EpochId, PlexCipher, Role,
};
pub use decrypt::DecryptError;
pub use direction::{Direction, DirectionId, DirectionStats, RecordBody, TlsRecord};
pub use flow::{ClientSide, Flow, FlowConfig};
pub use keylog::KeyLog;

const MAX_CONNECTIONS: usize = 10_000;

enum Tracked {
    /// No payload yet to decide whether this is TLS.
    Probing(TcpFlow),
    Tls(Box<Flow>),
    Ignored,
}

struct Connection {
    state: Tracked,
    first_seen: u64,
    /// Monotonic tick updated on each packet for LRU eviction.
    last_active: u64,
}

/// Tracks every TCP connection in a capture and decrypts the ones that
/// carry TLS.
pub struct TlsDecryptor {
    config: FlowConfig,
    connections: HashMap<StreamKey, Connection>,
    tick: u64,
    evicted: u64,
    evicted_tls: u64,
}

impl TlsDecryptor {
    pub fn new(config: FlowConfig) -> Self {
        TlsDecryptor {
            config,
            connections: HashMap::new(),
            tick: 0,
            evicted: 0,
            evicted_tls: 0,
        }
    }

    /// Route one segment to its connection. Returns true if the connection
    /// is being decrypted as TLS.
    pub fn process_segment(&mut self, segment: &TcpSegment) -> bool {
        let key = segment.stream_key();

        self.tick += 1;
        let tick = self.tick;

        // Evict least-recently-active connection if at capacity for a new one
        if !self.connections.contains_key(&key) && self.connections.len() >= MAX_CONNECTIONS {
            self.evict_oldest();
        }

        let conn = self
            .connections
            .entry(key)
            .or_insert_with(|| Connection {
                state: Tracked::Probing(TcpFlow::new()),
                first_seen: tick,
                last_active: tick,
            });
        conn.last_active = tick;

        let verdict = match &mut conn.state {
            Tracked::Tls(flow) => return flow.add(segment).is_some(),
            Tracked::Ignored => return false,
            Tracked::Probing(tcp) => {
                if tcp.add(segment).is_none() {
                    return false;
                }
                classify(tcp)
            }
        };

        match verdict {
            None => false,
            Some(false) => {
                tracing::debug!(stream = %segment.stream_key(), "not TLS, ignoring");
                conn.state = Tracked::Ignored;
                false
            }
            Some(true) => {
                if let Tracked::Probing(tcp) = std::mem::replace(&mut conn.state, Tracked::Ignored)
                {
                    tracing::debug!(stream = %segment.stream_key(), "TLS connection");
                    let flow = Flow::with_config(tcp, self.config.clone());
                    conn.state = Tracked::Tls(Box::new(flow));
                }
                true
            }
        }
    }

    /// Evict the least-recently-active connection.
    fn evict_oldest(&mut self) {
        let oldest_key = self
            .connections
            .iter()
            .min_by_key(|(_, conn)| conn.last_active)
            .map(|(key, _)| key.clone());
        let Some(key) = oldest_key else {
            return;
        };
        match self.connections.remove(&key).map(|conn| conn.state) {
            Some(Tracked::Tls(flow)) => {
                let (fwd, rev) = (flow.fwd().stats(), flow.rev().stats());
                tracing::warn!(
                    stream = %key,
                    records = fwd.records + rev.records,
                    application_bytes = fwd.application_bytes + rev.application_bytes,
                    "connection table full, dropping TLS flow"
                );
                self.evicted_tls += 1;
            }
            _ => tracing::debug!(stream = %key, "connection table full, evicting"),
        }
        self.evicted += 1;
    }

    pub fn flow(&self, key: &StreamKey) -> Option<&Flow> {
        match &self.connections.get(key)?.state {
            Tracked::Tls(flow) => Some(&**flow),
            _ => None,
        }
    }

    /// TLS flows currently tracked, in no particular order.
    pub fn flows(&self) -> impl Iterator<Item = (&StreamKey, &Flow)> {
        self.connections.iter().filter_map(|(key, conn)| match &conn.state {
            Tracked::Tls(flow) => Some((key, &**flow)),
            _ => None,
        })
    }

    /// Connections tracked, TLS or not.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections dropped to stay under the table limit.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Evicted connections that had been recognized as TLS.
    pub fn evicted_tls(&self) -> u64 {
        self.evicted_tls
    }

    /// Flush every TLS flow and return them in order of first appearance.
    pub fn finish(self) -> Vec<(StreamKey, Flow)> {
        let mut flows: Vec<_> = self
            .connections
            .into_iter()
            .filter_map(|(key, conn)| match conn.state {
                Tracked::Tls(mut flow) => {
                    flow.finish();
                    Some((conn.first_seen, key, *flow))
                }
                _ => None,
            })
            .collect();
        flows.sort_by_key(|(first_seen, _, _)| *first_seen);
        flows
            .into_iter()
            .map(|(_, key, flow)| (key, flow))
            .collect()
    }
}

/// Decide from the first payload bytes of either side whether a connection
/// speaks TLS. `None` until one side has a full record header.
fn classify(tcp: &TcpFlow) -> Option<bool> {
    [Side::Forward, Side::Reverse].into_iter().find_map(|side| {
        let bytes = tcp.half(side).bytes();
        (bytes.len() >= 5).then(|| direction::is_record_header(bytes))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TcpFlags;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn packet(src_port: u16, seq: u32, payload: &[u8]) -> TcpSegment {
        TcpSegment {
            src: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), src_port),
            dst: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 443),
            seq,
            flags: TcpFlags {
                ack: true,
                psh: true,
                ..TcpFlags::default()
            },
            payload: payload.to_vec(),
        }
    }

    fn key(src_port: u16) -> StreamKey {
        packet(src_port, 0, &[]).stream_key()
    }

    const ALERT: [u8; 7] = [0x15, 0x03, 0x03, 0x00, 0x02, 0x01, 0x00];

    #[test]
    fn max_connections_evicts_oldest() {
        let mut decryptor = TlsDecryptor::new(FlowConfig::default());

        // Fill to MAX_CONNECTIONS with unique stream keys (varying port)
        for i in 0..MAX_CONNECTIONS {
            decryptor.process_segment(&packet(i as u16 + 1, 0, &[0xFF]));
        }
        assert_eq!(decryptor.len(), MAX_CONNECTIONS);

        // One more should evict the oldest (port 1) and admit the new one
        decryptor.process_segment(&packet(60000, 0, &[0xFF]));
        assert_eq!(decryptor.len(), MAX_CONNECTIONS);
        assert!(decryptor.connections.contains_key(&key(60000)));
        assert!(!decryptor.connections.contains_key(&key(1)));
        assert_eq!(decryptor.evicted(), 1);
        assert_eq!(decryptor.evicted_tls(), 0);
    }

    #[test]
    fn max_connections_allows_existing_connection() {
        let mut decryptor = TlsDecryptor::new(FlowConfig::default());
        for i in 0..MAX_CONNECTIONS {
            decryptor.process_segment(&packet(i as u16 + 1, 0, &[0xFF]));
        }

        // Sending more data to an existing connection should still work
        decryptor.process_segment(&packet(1, 1, &[0xAA]));
        assert_eq!(decryptor.len(), MAX_CONNECTIONS);
        assert!(decryptor.connections.contains_key(&key(1)));
        assert_eq!(decryptor.evicted(), 0);
    }

    #[test]
    fn tls_connection_is_promoted_to_flow() {
        let mut decryptor = TlsDecryptor::new(FlowConfig::default());
        assert!(decryptor.process_segment(&packet(5000, 0, &ALERT)));
        let flow = decryptor.flow(&key(5000)).unwrap();
        assert_eq!(flow.fwd().records().len(), 1);
        assert_eq!(decryptor.flows().count(), 1);
    }

    #[test]
    fn record_header_split_across_packets_waits() {
        let mut decryptor = TlsDecryptor::new(FlowConfig::default());
        assert!(!decryptor.process_segment(&packet(5000, 0, &ALERT[..3])));
        assert!(decryptor.flow(&key(5000)).is_none());
        assert!(decryptor.process_segment(&packet(5000, 3, &ALERT[3..])));
        assert_eq!(decryptor.flow(&key(5000)).unwrap().fwd().records().len(), 1);
    }

    #[test]
    fn plaintext_connection_is_ignored() {
        let mut decryptor = TlsDecryptor::new(FlowConfig::default());
        assert!(!decryptor.process_segment(&packet(5000, 0, b"GET / HTTP/1.1\r\n")));
        assert!(!decryptor.process_segment(&packet(5000, 16, &ALERT)));
        assert!(decryptor.flow(&key(5000)).is_none());
        assert!(decryptor.finish().is_empty());
    }

    #[test]
    fn evicting_tls_flow_is_counted_separately() {
        let mut decryptor = TlsDecryptor::new(FlowConfig::default());
        for i in 0..MAX_CONNECTIONS {
            assert!(decryptor.process_segment(&packet(i as u16 + 1, 0, &ALERT)));
        }
        decryptor.process_segment(&packet(60000, 0, &[0xFF]));
        assert_eq!(decryptor.evicted(), 1);
        assert_eq!(decryptor.evicted_tls(), 1);
        assert!(decryptor.flow(&key(1)).is_none());
        assert!(decryptor.flow(&key(2)).is_some());
    }

    #[test]
    fn finish_returns_flows_in_first_seen_order() {
        let mut decryptor = TlsDecryptor::new(FlowConfig::default());
        for port in [7000, 6000, 8000] {
            decryptor.process_segment(&packet(port, 0, &ALERT));
        }
        let flows = decryptor.finish();
        let ports: Vec<_> = flows.iter().map(|(key, _)| key.lo().port()).collect();
        assert_eq!(ports, [7000, 6000, 8000]);
        assert!(flows.iter().all(|(_, flow)| flow.is_finished()));
    }
}
