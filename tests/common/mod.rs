//! Synthetic TLS 1.2 (ECDHE_RSA_WITH_AES_128_GCM_SHA256) conversations,
//! framed as Ethernet/IPv4/TCP packets.

#![allow(dead_code)]

use etherparse::PacketBuilder;
use ring::aead::{AES_128_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hmac;

use tlsgrep::protocol::{LinkType, TcpSegment, decode_segment};
use tlsgrep::tls::decrypt::tls12_prf;

pub const CLIENT_RANDOM: [u8; 32] = [0x11; 32];
pub const SERVER_RANDOM: [u8; 32] = [0x22; 32];
pub const MASTER_SECRET: [u8; 48] = [0x33; 48];
pub const SUITE: u16 = 0xC02F;

pub const CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const HANDSHAKE: u8 = 0x16;
pub const APPLICATION_DATA: u8 = 0x17;

const CLIENT: ([u8; 4], u16) = ([10, 0, 0, 1], 51000);
const SERVER: ([u8; 4], u16) = ([10, 0, 0, 2], 443);
const CLIENT_ISN: u32 = 1000;
const SERVER_ISN: u32 = 5000;

#[derive(Clone, Copy)]
pub struct Keys {
    pub client_key: [u8; 16],
    pub client_salt: [u8; 4],
    pub server_key: [u8; 16],
    pub server_salt: [u8; 4],
}

/// Split the key block the way a TLS 1.2 AES-128-GCM endpoint does.
pub fn derive_keys(
    master: &[u8; 48],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Keys {
    let mut seed = server_random.to_vec();
    seed.extend_from_slice(client_random);
    let block = tls12_prf(master, b"key expansion", &seed, 40, hmac::HMAC_SHA256);
    let mut keys = Keys {
        client_key: [0; 16],
        client_salt: [0; 4],
        server_key: [0; 16],
        server_salt: [0; 4],
    };
    keys.client_key.copy_from_slice(&block[..16]);
    keys.server_key.copy_from_slice(&block[16..32]);
    keys.client_salt.copy_from_slice(&block[32..36]);
    keys.server_salt.copy_from_slice(&block[36..40]);
    keys
}

pub fn keylog_line(client_random: &[u8; 32], master: &[u8; 48]) -> String {
    format!("CLIENT_RANDOM {} {}\n", hex(client_random), hex(master))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn handshake_msg(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let len = (body.len() as u32).to_be_bytes();
    let mut msg = vec![msg_type, len[1], len[2], len[3]];
    msg.extend_from_slice(body);
    msg
}

pub fn client_hello(random: &[u8; 32]) -> Vec<u8> {
    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(random);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x02]);
    body.extend_from_slice(&SUITE.to_be_bytes());
    body.extend_from_slice(&[0x01, 0x00]);
    handshake_msg(1, &body)
}

pub fn server_hello(random: &[u8; 32], suite: u16) -> Vec<u8> {
    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(random);
    body.push(0);
    body.extend_from_slice(&suite.to_be_bytes());
    body.push(0);
    handshake_msg(2, &body)
}

pub fn server_hello_done() -> Vec<u8> {
    handshake_msg(14, &[])
}

pub fn client_key_exchange() -> Vec<u8> {
    let mut body = vec![32];
    body.extend_from_slice(&[0x44; 32]);
    handshake_msg(16, &body)
}

pub fn finished() -> Vec<u8> {
    handshake_msg(20, &[0x5A; 12])
}

fn record(content_type: u8, fragment: &[u8]) -> Vec<u8> {
    let mut rec = vec![content_type, 0x03, 0x03];
    rec.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
    rec.extend_from_slice(fragment);
    rec
}

/// One endpoint's write state.
#[derive(Default)]
struct Writer {
    keys: Option<([u8; 16], [u8; 4])>,
    seq: u64,
}

impl Writer {
    fn encode(&mut self, content_type: u8, plaintext: &[u8]) -> Vec<u8> {
        let seq = self.seq;
        self.seq += 1;
        let Some((key, salt)) = self.keys else {
            return record(content_type, plaintext);
        };

        let explicit = seq.to_be_bytes();
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&salt);
        nonce[4..].copy_from_slice(&explicit);
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&seq.to_be_bytes());
        aad[8] = content_type;
        aad[9..11].copy_from_slice(&[0x03, 0x03]);
        aad[11..].copy_from_slice(&(plaintext.len() as u16).to_be_bytes());

        let sealing = LessSafeKey::new(UnboundKey::new(&AES_128_GCM, &key).unwrap());
        let mut body = plaintext.to_vec();
        sealing
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(aad),
                &mut body,
            )
            .unwrap();

        let mut fragment = explicit.to_vec();
        fragment.extend_from_slice(&body);
        record(content_type, &fragment)
    }
}

/// Builds the TCP payloads of a TLS conversation, one segment per call.
#[derive(Default)]
pub struct Conversation {
    client: Writer,
    server: Writer,
    segments: Vec<(bool, Vec<u8>)>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    fn writer(&mut self, from_client: bool) -> &mut Writer {
        if from_client {
            &mut self.client
        } else {
            &mut self.server
        }
    }

    /// Send records in one TCP segment, protected by the sender's current keys.
    pub fn send(&mut self, from_client: bool, records: &[(u8, Vec<u8>)]) {
        let writer = self.writer(from_client);
        let payload: Vec<u8> = records
            .iter()
            .flat_map(|(content_type, body)| writer.encode(*content_type, body))
            .collect();
        self.segments.push((from_client, payload));
    }

    /// Send ChangeCipherSpec under the current keys, then switch to `keys`.
    pub fn change_cipher_spec(&mut self, from_client: bool, keys: &Keys) {
        self.send(from_client, &[(CHANGE_CIPHER_SPEC, vec![1])]);
        let writer = self.writer(from_client);
        writer.keys = Some(if from_client {
            (keys.client_key, keys.client_salt)
        } else {
            (keys.server_key, keys.server_salt)
        });
        writer.seq = 0;
    }

    /// Full handshake with the given randoms; both sides end keyed.
    pub fn handshake(&mut self, client_random: &[u8; 32], server_random: &[u8; 32], keys: &Keys) {
        self.send(true, &[(HANDSHAKE, client_hello(client_random))]);
        self.send(
            false,
            &[
                (HANDSHAKE, server_hello(server_random, SUITE)),
                (HANDSHAKE, server_hello_done()),
            ],
        );
        self.send(true, &[(HANDSHAKE, client_key_exchange())]);
        self.change_cipher_spec(true, keys);
        self.send(true, &[(HANDSHAKE, finished())]);
        self.change_cipher_spec(false, keys);
        self.send(false, &[(HANDSHAKE, finished())]);
    }

    pub fn segments(&self) -> &[(bool, Vec<u8>)] {
        &self.segments
    }
}

/// Handshake plus one request and one response.
pub fn standard_session(request: &[u8], response: &[u8]) -> Conversation {
    let keys = derive_keys(&MASTER_SECRET, &CLIENT_RANDOM, &SERVER_RANDOM);
    let mut conv = Conversation::new();
    conv.handshake(&CLIENT_RANDOM, &SERVER_RANDOM, &keys);
    conv.send(true, &[(APPLICATION_DATA, request.to_vec())]);
    conv.send(false, &[(APPLICATION_DATA, response.to_vec())]);
    conv
}

fn tcp_frame(from_client: bool, seq: u32, ack: u32, flags: &str, payload: &[u8]) -> Vec<u8> {
    let ((src_ip, src_port), (dst_ip, dst_port)) = if from_client {
        (CLIENT, SERVER)
    } else {
        (SERVER, CLIENT)
    };
    let mut builder = PacketBuilder::ethernet2([0; 6], [0; 6])
        .ipv4(src_ip, dst_ip, 64)
        .tcp(src_port, dst_port, seq, 65535);
    if flags.contains('S') {
        builder = builder.syn();
    }
    if flags.contains('A') {
        builder = builder.ack(ack);
    }
    if flags.contains('P') {
        builder = builder.psh();
    }
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

/// Ethernet frames: three-way handshake, then each segment in order.
pub fn frames(segments: &[(bool, Vec<u8>)]) -> Vec<Vec<u8>> {
    let mut client_seq = CLIENT_ISN + 1;
    let mut server_seq = SERVER_ISN + 1;
    let mut out = vec![
        tcp_frame(true, CLIENT_ISN, 0, "S", &[]),
        tcp_frame(false, SERVER_ISN, client_seq, "SA", &[]),
        tcp_frame(true, client_seq, server_seq, "A", &[]),
    ];
    for (from_client, payload) in segments {
        let frame = if *from_client {
            let f = tcp_frame(true, client_seq, server_seq, "AP", payload);
            client_seq += payload.len() as u32;
            f
        } else {
            let f = tcp_frame(false, server_seq, client_seq, "AP", payload);
            server_seq += payload.len() as u32;
            f
        };
        out.push(frame);
    }
    out
}

pub fn packets(frames: &[Vec<u8>]) -> Vec<TcpSegment> {
    frames
        .iter()
        .map(|frame| decode_segment(frame, LinkType::Ethernet).unwrap())
        .collect()
}

/// Split every segment in two, keeping order.
pub fn halve_segments(segments: &[(bool, Vec<u8>)]) -> Vec<(bool, Vec<u8>)> {
    segments
        .iter()
        .flat_map(|(from_client, payload)| {
            let (a, b) = payload.split_at(payload.len() / 2);
            [(*from_client, a.to_vec()), (*from_client, b.to_vec())]
        })
        .collect()
}

/// Write a pcap file (Ethernet link type) containing `frames`.
pub fn write_pcap(path: &std::path::Path, frames: &[Vec<u8>]) {
    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes()); // magic
    out.extend_from_slice(&2u16.to_le_bytes()); // major version
    out.extend_from_slice(&4u16.to_le_bytes()); // minor version
    out.extend_from_slice(&0i32.to_le_bytes()); // thiszone
    out.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
    out.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
    out.extend_from_slice(&1u32.to_le_bytes()); // network (Ethernet)
    for (i, frame) in frames.iter().enumerate() {
        out.extend_from_slice(&(1_700_000_000u32 + i as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }
    std::fs::write(path, out).unwrap();
}
