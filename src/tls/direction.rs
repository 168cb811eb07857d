use std::sync::Arc;

use serde::Serialize;
use tls_parser::TlsRecordType;

use super::connstate::{ConnStatePlex, EpochId, PlexCipher};
use super::decrypt::DecryptError;
use super::flow::ConnStates;
use super::handshake;
use crate::reassembly::{HalfStream, Side};

/// Record header: type(1) + version(2) + length(2).
const RECORD_HEADER_LEN: usize = 5;
/// Largest legal TLSCiphertext fragment (RFC 5246 6.2.3).
const MAX_FRAGMENT_LEN: usize = (1 << 14) + 2048;

const MAX_DECRYPTED_BYTES: usize = 1_048_576; // 1 MB per direction
const MAX_RECORDS: usize = 65_536;
const MAX_RECORD_BYTES: usize = 8 * 1_048_576;
const MAX_HANDSHAKE_BYTES: usize = 262_144;

/// Identifies one direction of one [`Flow`](super::Flow).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectionId {
    pub(crate) flow: u64,
    pub(crate) side: Side,
}

impl DirectionId {
    pub fn flow(&self) -> u64 {
        self.flow
    }

    pub fn side(&self) -> Side {
        self.side
    }
}

impl std::fmt::Display for DirectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow#{}/{}", self.flow, self.side)
    }
}

/// Payload of a parsed record after applying its epoch's protection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    /// Sent under the null cipher.
    Plaintext(Vec<u8>),
    Decrypted(Vec<u8>),
    Undecryptable {
        ciphertext: Vec<u8>,
        reason: DecryptError,
    },
}

impl RecordBody {
    /// Cleartext bytes, when the record could be read.
    pub fn plaintext(&self) -> Option<&[u8]> {
        match self {
            RecordBody::Plaintext(data) | RecordBody::Decrypted(data) => Some(data),
            RecordBody::Undecryptable { .. } => None,
        }
    }

    fn len(&self) -> usize {
        match self {
            RecordBody::Plaintext(data) | RecordBody::Decrypted(data) => data.len(),
            RecordBody::Undecryptable { ciphertext, .. } => ciphertext.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsRecord {
    pub content_type: u8,
    pub version: u16,
    pub epoch: EpochId,
    pub body: RecordBody,
}

/// Per-direction record counters, serialized in JSON output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectionStats {
    pub records: u64,
    pub decrypted: u64,
    pub undecryptable: u64,
    /// Records parsed but not retained because of the record caps.
    pub dropped: u64,
    pub application_bytes: u64,
}

/// True if `buf` starts with a plausible TLS record header.
pub fn is_record_header(buf: &[u8]) -> bool {
    if buf.len() < RECORD_HEADER_LEN {
        return false;
    }
    let length = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    (0x14..=0x18).contains(&buf[0]) && buf[1] == 3 && length <= MAX_FRAGMENT_LEN
}

/// One side of a TLS connection: splits the reassembled byte stream into
/// records and opens them with the plex of the current epoch.
#[derive(Debug)]
pub struct Direction {
    id: DirectionId,
    plex: Option<Arc<ConnStatePlex>>,
    /// Epochs installed on this direction, oldest first.
    epochs: Vec<EpochId>,
    /// Record sequence number within the current epoch.
    seq: u64,
    handshake_buf: Vec<u8>,
    records: Vec<TlsRecord>,
    record_bytes: usize,
    application_data: Vec<u8>,
    truncated: bool,
    stalled: bool,
    /// Held at a ChangeCipherSpec until the other side claims the newest epoch.
    waiting: bool,
    stats: DirectionStats,
}

impl Direction {
    pub(crate) fn new(id: DirectionId) -> Self {
        Direction {
            id,
            plex: None,
            epochs: Vec::new(),
            seq: 0,
            handshake_buf: Vec::new(),
            records: Vec::new(),
            record_bytes: 0,
            application_data: Vec::new(),
            truncated: false,
            stalled: false,
            waiting: false,
            stats: DirectionStats::default(),
        }
    }

    /// Parse every complete record available in `stream`.
    pub(crate) fn update_records(&mut self, stream: &mut HalfStream, states: &mut ConnStates) {
        loop {
            if self.stalled {
                let n = stream.bytes().len();
                stream.consume(n);
                return;
            }
            let buf = stream.bytes();
            if buf.len() < RECORD_HEADER_LEN {
                return;
            }
            if !is_record_header(buf) {
                tracing::debug!(
                    direction = %self.id,
                    first_byte = buf[0],
                    "not a TLS record, stalling direction"
                );
                self.stalled = true;
                continue;
            }
            let length = u16::from_be_bytes([buf[3], buf[4]]) as usize;
            let total = RECORD_HEADER_LEN + length;
            if buf.len() < total {
                return;
            }

            let content_type = buf[0];
            if TlsRecordType(content_type) == TlsRecordType::ChangeCipherSpec
                && states.awaiting() == Some(self.id.side.opposite())
            {
                if !self.waiting {
                    tracing::debug!(
                        direction = %self.id,
                        "ChangeCipherSpec ahead of the other side, waiting"
                    );
                }
                self.waiting = true;
                return;
            }
            self.waiting = false;
            let version = u16::from_be_bytes([buf[1], buf[2]]);
            let fragment = buf[RECORD_HEADER_LEN..total].to_vec();
            stream.consume(total);
            self.handle_record(content_type, version, fragment, states);
        }
    }

    fn handle_record(
        &mut self,
        content_type: u8,
        version: u16,
        fragment: Vec<u8>,
        states: &mut ConnStates,
    ) {
        let Some(plex) = self.plex.clone() else {
            tracing::warn!(direction = %self.id, "record before first epoch, stalling");
            self.stalled = true;
            return;
        };

        let seq = self.seq;
        self.seq = self.seq.saturating_add(1);
        let body = match plex.cipher() {
            PlexCipher::Null => RecordBody::Plaintext(fragment),
            PlexCipher::Keyed(keys) => match keys.open(seq, content_type, version, &fragment) {
                Ok(plaintext) => RecordBody::Decrypted(plaintext),
                Err(reason) => {
                    tracing::debug!(direction = %self.id, seq, %reason, "record did not open");
                    RecordBody::Undecryptable {
                        ciphertext: fragment,
                        reason,
                    }
                }
            },
            PlexCipher::Unavailable(reason) => RecordBody::Undecryptable {
                ciphertext: fragment,
                reason: reason.clone(),
            },
        };
        tracing::trace!(
            direction = %self.id,
            epoch = %plex.epoch(),
            seq,
            content_type,
            len = body.len(),
            "record"
        );

        self.stats.records += 1;
        match &body {
            RecordBody::Decrypted(_) => self.stats.decrypted += 1,
            RecordBody::Undecryptable { .. } => self.stats.undecryptable += 1,
            RecordBody::Plaintext(_) => {}
        }

        match (TlsRecordType(content_type), body.plaintext()) {
            (TlsRecordType::Handshake, Some(data)) => self.push_handshake(data, states),
            (TlsRecordType::Handshake, None) => self.handshake_buf.clear(),
            (TlsRecordType::ApplicationData, Some(data)) => self.push_application_data(data),
            _ => {}
        }

        self.retain(TlsRecord {
            content_type,
            version,
            epoch: plex.epoch(),
            body,
        });

        if TlsRecordType(content_type) == TlsRecordType::ChangeCipherSpec {
            self.on_change_cipher_spec(states);
        }
    }

    fn push_handshake(&mut self, data: &[u8], states: &mut ConnStates) {
        if self.handshake_buf.len() + data.len() > MAX_HANDSHAKE_BYTES {
            tracing::debug!(direction = %self.id, "oversized handshake message dropped");
            self.handshake_buf.clear();
            return;
        }
        self.handshake_buf.extend_from_slice(data);

        let mut offset = 0;
        while let Some(len) = handshake::complete_message_len(&self.handshake_buf[offset..]) {
            let msg = &self.handshake_buf[offset..offset + len];
            if let Some(event) = handshake::parse_message(msg) {
                states.observe_handshake(self.id.side, &event);
            }
            offset += len;
        }
        self.handshake_buf.drain(..offset);
    }

    fn push_application_data(&mut self, data: &[u8]) {
        self.stats.application_bytes += data.len() as u64;
        let room = MAX_DECRYPTED_BYTES.saturating_sub(self.application_data.len());
        if data.len() > room && !self.truncated {
            tracing::debug!(direction = %self.id, "decrypted data cap reached");
            self.truncated = true;
        }
        self.application_data
            .extend_from_slice(&data[..data.len().min(room)]);
    }

    fn retain(&mut self, record: TlsRecord) {
        let size = record.body.len();
        if self.records.len() >= MAX_RECORDS || self.record_bytes + size > MAX_RECORD_BYTES {
            self.stats.dropped += 1;
            return;
        }
        self.record_bytes += size;
        self.records.push(record);
    }

    /// Switch to this side's half of the next epoch.
    pub(crate) fn on_change_cipher_spec(&mut self, states: &mut ConnStates) {
        let plex = states.next_connstate(self.id);
        tracing::debug!(
            direction = %self.id,
            epoch = %plex.epoch(),
            records = self.seq,
            "installing next epoch"
        );
        self.epochs.push(plex.epoch());
        self.plex = Some(plex);
        self.seq = 0;
        self.handshake_buf.clear();
    }

    pub fn id(&self) -> DirectionId {
        self.id
    }

    pub fn side(&self) -> Side {
        self.id.side
    }

    /// Plex of the epoch currently protecting this direction.
    pub fn plex(&self) -> Option<&Arc<ConnStatePlex>> {
        self.plex.as_ref()
    }

    pub fn epochs(&self) -> &[EpochId] {
        &self.epochs
    }

    /// Records read so far under the current epoch.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn records(&self) -> &[TlsRecord] {
        &self.records
    }

    /// Decrypted application data, in stream order.
    pub fn application_data(&self) -> &[u8] {
        &self.application_data
    }

    /// Application data exceeded the retention cap.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Non-TLS bytes were seen; everything after them is discarded.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Parsing is paused at a ChangeCipherSpec because the other side has
    /// not yet switched to the newest epoch.
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn stats(&self) -> DirectionStats {
        self.stats
    }
}
