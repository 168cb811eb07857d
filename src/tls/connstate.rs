//! Cryptographic epochs of a TLS connection.
//!
//! An epoch ([`ConnStatePeriod`]) starts at a ChangeCipherSpec and holds one
//! [`ConnStatePlex`] per TCP side. The parameters negotiated for the next
//! epoch accumulate in a [`ConnectionStateParams`] until the epoch is built.

use std::sync::Arc;

use serde::Serialize;

use super::decrypt::{DecryptError, RecordKeys, derive_tls12_keys};
use super::handshake::{HandshakeEvent, cipher_suite_params};
use super::keylog::KeyLog;
use crate::reassembly::Side;

const TLS12: u16 = 0x0303;

/// Position of an epoch within its flow, starting at 0 for the bootstrap epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EpochId(pub u64);

impl std::fmt::Display for EpochId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "epoch#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

/// Negotiated values for the next epoch. Each field keeps its first write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStateParams {
    client_random: Option<[u8; 32]>,
    server_random: Option<[u8; 32]>,
    cipher_suite: Option<u16>,
    version: Option<u16>,
    client_side: Option<Side>,
}

impl ConnectionStateParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the ClientHello random and the side that sent it.
    pub fn set_client_random(&mut self, random: [u8; 32], from: Side) -> bool {
        if self.client_random.is_some() {
            return false;
        }
        self.client_random = Some(random);
        self.client_side = Some(from);
        true
    }

    pub fn set_server_random(&mut self, random: [u8; 32]) -> bool {
        set_once(&mut self.server_random, random)
    }

    pub fn set_cipher_suite(&mut self, id: u16) -> bool {
        set_once(&mut self.cipher_suite, id)
    }

    pub fn set_version(&mut self, version: u16) -> bool {
        set_once(&mut self.version, version)
    }

    /// Fold a hello message seen on `from` into the parameters.
    pub fn apply(&mut self, event: &HandshakeEvent, from: Side) {
        match *event {
            HandshakeEvent::ClientHello { random, .. } => {
                if !self.set_client_random(random, from) {
                    tracing::debug!(%from, "ignoring repeated ClientHello");
                }
            }
            HandshakeEvent::ServerHello {
                random,
                cipher_suite,
                version,
            } => {
                self.set_server_random(random);
                self.set_cipher_suite(cipher_suite);
                self.set_version(version);
            }
        }
    }

    pub fn client_random(&self) -> Option<&[u8; 32]> {
        self.client_random.as_ref()
    }

    pub fn server_random(&self) -> Option<&[u8; 32]> {
        self.server_random.as_ref()
    }

    pub fn cipher_suite(&self) -> Option<u16> {
        self.cipher_suite
    }

    pub fn version(&self) -> Option<u16> {
        self.version
    }

    /// Side that sent the ClientHello, if one was seen.
    pub fn client_side(&self) -> Option<Side> {
        self.client_side
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn derive_keys(
        &self,
        keylog: Option<&KeyLog>,
    ) -> Result<(RecordKeys, RecordKeys), DecryptError> {
        let client_random = self
            .client_random
            .as_ref()
            .ok_or(DecryptError::MissingParameter("ClientHello"))?;
        let server_random = self
            .server_random
            .as_ref()
            .ok_or(DecryptError::MissingParameter("ServerHello"))?;
        let suite_id = self
            .cipher_suite
            .ok_or(DecryptError::MissingParameter("cipher suite"))?;
        match self.version {
            Some(TLS12) => {}
            Some(other) => return Err(DecryptError::UnsupportedVersion(other)),
            None => return Err(DecryptError::MissingParameter("protocol version")),
        }
        let suite =
            cipher_suite_params(suite_id).ok_or(DecryptError::UnsupportedCipherSuite(suite_id))?;
        let master = keylog
            .and_then(|kl| kl.master_secret(client_random))
            .ok_or(DecryptError::MissingSecret)?;
        derive_tls12_keys(master, client_random, server_random, &suite)
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T) -> bool {
    if slot.is_some() {
        return false;
    }
    *slot = Some(value);
    true
}

/// Record protection in effect for one plex.
#[derive(Debug)]
pub enum PlexCipher {
    /// Before the first ChangeCipherSpec: records are plaintext.
    Null,
    Keyed(RecordKeys),
    /// Keys could not be derived; records stay ciphertext.
    Unavailable(DecryptError),
}

impl PlexCipher {
    pub fn is_null(&self) -> bool {
        matches!(self, PlexCipher::Null)
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self, PlexCipher::Keyed(_))
    }

    pub fn unavailable_reason(&self) -> Option<&DecryptError> {
        match self {
            PlexCipher::Unavailable(reason) => Some(reason),
            _ => None,
        }
    }
}

/// One side's half of an epoch.
#[derive(Debug)]
pub struct ConnStatePlex {
    epoch: EpochId,
    side: Side,
    writer: Role,
    cipher: PlexCipher,
}

impl ConnStatePlex {
    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Which TLS endpoint writes the records this plex reads.
    pub fn writer(&self) -> Role {
        self.writer
    }

    pub fn cipher(&self) -> &PlexCipher {
        &self.cipher
    }
}

/// One epoch: a pair of plexes plus the epoch it replaced.
#[derive(Debug)]
pub struct ConnStatePeriod {
    epoch: EpochId,
    predecessor: Option<EpochId>,
    client_side: Side,
    cipher_suite: Option<u16>,
    fwd: Arc<ConnStatePlex>,
    rev: Arc<ConnStatePlex>,
}

impl ConnStatePeriod {
    /// Bootstrap epoch with null protection on both sides.
    pub fn initial(epoch: EpochId, client_side: Side) -> Self {
        Self::assemble(epoch, None, client_side, None, PlexCipher::Null, PlexCipher::Null)
    }

    /// Epoch following `predecessor`, keyed from `params` when possible.
    ///
    /// `client_side` is the TCP side acting as TLS client; it decides which
    /// half of the key block each plex receives.
    pub fn negotiated(
        epoch: EpochId,
        predecessor: EpochId,
        params: ConnectionStateParams,
        keylog: Option<&KeyLog>,
        client_side: Side,
    ) -> Self {
        let (client, server) = match params.derive_keys(keylog) {
            Ok((client, server)) => (PlexCipher::Keyed(client), PlexCipher::Keyed(server)),
            Err(reason) => {
                tracing::debug!(%epoch, %reason, "epoch keys unavailable");
                (
                    PlexCipher::Unavailable(reason.clone()),
                    PlexCipher::Unavailable(reason),
                )
            }
        };
        let (fwd, rev) = match client_side {
            Side::Forward => (client, server),
            Side::Reverse => (server, client),
        };
        Self::assemble(
            epoch,
            Some(predecessor),
            client_side,
            params.cipher_suite,
            fwd,
            rev,
        )
    }

    fn assemble(
        epoch: EpochId,
        predecessor: Option<EpochId>,
        client_side: Side,
        cipher_suite: Option<u16>,
        fwd: PlexCipher,
        rev: PlexCipher,
    ) -> Self {
        let plex = |side: Side, cipher| {
            let writer = if side == client_side {
                Role::Client
            } else {
                Role::Server
            };
            Arc::new(ConnStatePlex {
                epoch,
                side,
                writer,
                cipher,
            })
        };
        ConnStatePeriod {
            epoch,
            predecessor,
            client_side,
            cipher_suite,
            fwd: plex(Side::Forward, fwd),
            rev: plex(Side::Reverse, rev),
        }
    }

    pub fn epoch(&self) -> EpochId {
        self.epoch
    }

    pub fn predecessor(&self) -> Option<EpochId> {
        self.predecessor
    }

    pub fn client_side(&self) -> Side {
        self.client_side
    }

    pub fn cipher_suite(&self) -> Option<u16> {
        self.cipher_suite
    }

    pub fn fwd(&self) -> &Arc<ConnStatePlex> {
        &self.fwd
    }

    pub fn rev(&self) -> &Arc<ConnStatePlex> {
        &self.rev
    }

    pub fn plex(&self, side: Side) -> &Arc<ConnStatePlex> {
        match side {
            Side::Forward => &self.fwd,
            Side::Reverse => &self.rev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_params(client_side: Side) -> ConnectionStateParams {
        let mut params = ConnectionStateParams::new();
        params.set_client_random([0x11; 32], client_side);
        params.set_server_random([0x22; 32]);
        params.set_cipher_suite(0xC02F);
        params.set_version(TLS12);
        params
    }

    fn keylog() -> KeyLog {
        let mut kl = KeyLog::default();
        kl.insert([0x11; 32], &[0x33; 48]);
        kl
    }

    #[test]
    fn params_keep_first_write() {
        let mut params = ConnectionStateParams::new();
        assert!(params.is_empty());
        assert!(params.set_client_random([1; 32], Side::Reverse));
        assert!(!params.set_client_random([2; 32], Side::Forward));
        assert!(params.set_cipher_suite(0xC02F));
        assert!(!params.set_cipher_suite(0xC030));
        assert_eq!(params.client_random(), Some(&[1; 32]));
        assert_eq!(params.client_side(), Some(Side::Reverse));
        assert_eq!(params.cipher_suite(), Some(0xC02F));
        assert!(!params.is_empty());
    }

    #[test]
    fn params_apply_hello_events() {
        let mut params = ConnectionStateParams::new();
        params.apply(
            &HandshakeEvent::ClientHello {
                random: [5; 32],
                offers_tls13: false,
            },
            Side::Forward,
        );
        params.apply(
            &HandshakeEvent::ServerHello {
                random: [6; 32],
                cipher_suite: 0xCCA8,
                version: TLS12,
            },
            Side::Reverse,
        );
        assert_eq!(params.client_side(), Some(Side::Forward));
        assert_eq!(params.server_random(), Some(&[6; 32]));
        assert_eq!(params.cipher_suite(), Some(0xCCA8));
        assert_eq!(params.version(), Some(TLS12));
    }

    #[test]
    fn initial_period_is_null_on_both_sides() {
        let period = ConnStatePeriod::initial(EpochId(0), Side::Forward);
        assert_eq!(period.predecessor(), None);
        assert!(period.fwd().cipher().is_null());
        assert!(period.rev().cipher().is_null());
        assert_eq!(period.fwd().writer(), Role::Client);
        assert_eq!(period.rev().writer(), Role::Server);
        assert_eq!(period.plex(Side::Reverse).side(), Side::Reverse);
    }

    #[test]
    fn negotiated_period_is_keyed_with_secret() {
        let kl = keylog();
        let period = ConnStatePeriod::negotiated(
            EpochId(1),
            EpochId(0),
            full_params(Side::Forward),
            Some(&kl),
            Side::Forward,
        );
        assert_eq!(period.predecessor(), Some(EpochId(0)));
        assert_eq!(period.cipher_suite(), Some(0xC02F));
        assert!(period.fwd().cipher().is_keyed());
        assert!(period.rev().cipher().is_keyed());
        assert_eq!(period.fwd().epoch(), EpochId(1));
    }

    #[test]
    fn reverse_client_swaps_writer_roles() {
        let kl = keylog();
        let period = ConnStatePeriod::negotiated(
            EpochId(1),
            EpochId(0),
            full_params(Side::Reverse),
            Some(&kl),
            Side::Reverse,
        );
        assert_eq!(period.client_side(), Side::Reverse);
        assert_eq!(period.fwd().writer(), Role::Server);
        assert_eq!(period.rev().writer(), Role::Client);
    }

    #[test]
    fn missing_secret_marks_both_plexes_unavailable() {
        let period = ConnStatePeriod::negotiated(
            EpochId(1),
            EpochId(0),
            full_params(Side::Forward),
            None,
            Side::Forward,
        );
        for side in [Side::Forward, Side::Reverse] {
            assert_eq!(
                period.plex(side).cipher().unavailable_reason(),
                Some(&DecryptError::MissingSecret)
            );
        }
    }

    #[test]
    fn unavailable_reasons() {
        let kl = keylog();
        let build = |params: ConnectionStateParams| {
            ConnStatePeriod::negotiated(EpochId(1), EpochId(0), params, Some(&kl), Side::Forward)
                .fwd()
                .cipher()
                .unavailable_reason()
                .cloned()
        };

        assert_eq!(
            build(ConnectionStateParams::new()),
            Some(DecryptError::MissingParameter("ClientHello"))
        );

        let mut tls13 = full_params(Side::Forward);
        tls13.version = Some(0x0304);
        assert_eq!(build(tls13), Some(DecryptError::UnsupportedVersion(0x0304)));

        let mut cbc = full_params(Side::Forward);
        cbc.cipher_suite = Some(0x002F);
        assert_eq!(build(cbc), Some(DecryptError::UnsupportedCipherSuite(0x002F)));

        let mut unknown = full_params(Side::Forward);
        unknown.client_random = Some([0x99; 32]);
        assert_eq!(build(unknown), Some(DecryptError::MissingSecret));
    }

    #[test]
    fn epoch_id_display() {
        assert_eq!(EpochId(3).to_string(), "epoch#3");
    }
}
