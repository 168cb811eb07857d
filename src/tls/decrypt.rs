use ring::aead::{self, LessSafeKey, UnboundKey};
use ring::hmac;
use thiserror::Error;
use zeroize::Zeroize;

/// Length of the per-record explicit nonce carried by TLS 1.2 AES-GCM records.
const EXPLICIT_NONCE_LEN: usize = 8;

/// Why a record, or a whole epoch, cannot be decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    #[error("handshake incomplete: {0} not seen")]
    MissingParameter(&'static str),

    #[error("no CLIENT_RANDOM secret in key log")]
    MissingSecret,

    #[error("unsupported cipher suite 0x{0:04x}")]
    UnsupportedCipherSuite(u16),

    #[error("unsupported protocol version 0x{0:04x}")]
    UnsupportedVersion(u16),

    #[error("invalid key material")]
    InvalidKey,

    #[error("record too short for cipher ({0} bytes)")]
    RecordTooShort(usize),

    #[error("record authentication failed")]
    AuthenticationFailed,

    #[error("TLS sequence number overflow")]
    SequenceOverflow,
}

/// Record protection parameters for a TLS 1.2 AEAD cipher suite.
#[derive(Debug, Clone, Copy)]
pub struct CipherSuite {
    pub id: u16,
    pub aead: &'static aead::Algorithm,
    /// HMAC used by the PRF (SHA-256 or SHA-384).
    pub prf: hmac::Algorithm,
    pub key_len: usize,
    /// 4 for AES-GCM (implicit salt + explicit nonce), 12 for ChaCha20-Poly1305.
    pub fixed_iv_len: usize,
}

/// How the 12-byte AEAD nonce is built for each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonceScheme {
    /// RFC 5288: 4-byte salt || 8-byte explicit nonce from the record.
    Explicit,
    /// RFC 7905: 12-byte IV XOR the sequence number.
    Sequence,
}

/// Read-only decryption keys for one direction of one epoch.
///
/// The sequence number is owned by the reader, so a `RecordKeys` can be
/// shared between an epoch and the direction consuming it.
///
/// **Security note:** The IV is zeroized on drop, but `ring::aead::LessSafeKey`
/// does not expose the underlying key bytes, so the key itself persists until
/// the allocator reuses the memory.
pub struct RecordKeys {
    key: LessSafeKey,
    iv: [u8; 12],
    scheme: NonceScheme,
}

impl std::fmt::Debug for RecordKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordKeys")
            .field("algorithm", self.key.algorithm())
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl RecordKeys {
    /// `iv_bytes` is the 4-byte GCM salt or the full 12-byte ChaCha20 IV.
    pub fn new(
        key_bytes: &[u8],
        iv_bytes: &[u8],
        algo: &'static aead::Algorithm,
    ) -> Result<Self, DecryptError> {
        let scheme = match iv_bytes.len() {
            4 => NonceScheme::Explicit,
            12 => NonceScheme::Sequence,
            _ => return Err(DecryptError::InvalidKey),
        };
        let unbound = UnboundKey::new(algo, key_bytes).map_err(|_| DecryptError::InvalidKey)?;
        let mut iv = [0u8; 12];
        iv[..iv_bytes.len()].copy_from_slice(iv_bytes);
        Ok(RecordKeys {
            key: LessSafeKey::new(unbound),
            iv,
            scheme,
        })
    }

    /// Decrypt one TLS 1.2 record fragment.
    ///
    /// AAD is seq(8) || type(1) || version(2) || plaintext_length(2).
    pub fn open(
        &self,
        seq: u64,
        content_type: u8,
        version: u16,
        fragment: &[u8],
    ) -> Result<Vec<u8>, DecryptError> {
        if seq == u64::MAX {
            return Err(DecryptError::SequenceOverflow);
        }
        let tag_len = self.key.algorithm().tag_len();

        let (nonce, body) = match self.scheme {
            NonceScheme::Explicit => {
                if fragment.len() < EXPLICIT_NONCE_LEN + tag_len {
                    return Err(DecryptError::RecordTooShort(fragment.len()));
                }
                let (explicit, body) = fragment.split_at(EXPLICIT_NONCE_LEN);
                (self.explicit_nonce(explicit), body)
            }
            NonceScheme::Sequence => {
                if fragment.len() < tag_len {
                    return Err(DecryptError::RecordTooShort(fragment.len()));
                }
                (self.sequence_nonce(seq), fragment)
            }
        };

        let plaintext_len = u16::try_from(body.len() - tag_len)
            .map_err(|_| DecryptError::RecordTooShort(fragment.len()))?;
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&seq.to_be_bytes());
        aad[8] = content_type;
        aad[9..11].copy_from_slice(&version.to_be_bytes());
        aad[11..].copy_from_slice(&plaintext_len.to_be_bytes());

        let mut in_out = body.to_vec();
        let plaintext = self
            .key
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::from(aad),
                &mut in_out,
            )
            .map_err(|_| DecryptError::AuthenticationFailed)?;
        Ok(plaintext.to_vec())
    }

    fn explicit_nonce(&self, explicit: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.iv[..4]);
        nonce[4..].copy_from_slice(explicit);
        nonce
    }

    fn sequence_nonce(&self, seq: u64) -> [u8; 12] {
        let mut nonce = self.iv;
        for (n, s) in nonce[4..].iter_mut().zip(seq.to_be_bytes()) {
            *n ^= s;
        }
        nonce
    }
}

impl Drop for RecordKeys {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

/// Derive (client_write, server_write) keys from the master secret.
///
/// key_block = PRF(master_secret, "key expansion", server_random + client_random)
/// is split into client key, server key, client IV, server IV.
pub fn derive_tls12_keys(
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
    suite: &CipherSuite,
) -> Result<(RecordKeys, RecordKeys), DecryptError> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);

    let (key_len, iv_len) = (suite.key_len, suite.fixed_iv_len);
    let mut key_block = tls12_prf(
        master_secret,
        b"key expansion",
        &seed,
        2 * key_len + 2 * iv_len,
        suite.prf,
    );

    let (client_key, rest) = key_block.split_at(key_len);
    let (server_key, rest) = rest.split_at(key_len);
    let (client_iv, rest) = rest.split_at(iv_len);
    let server_iv = &rest[..iv_len];

    let result = RecordKeys::new(client_key, client_iv, suite.aead).and_then(|client| {
        RecordKeys::new(server_key, server_iv, suite.aead).map(|server| (client, server))
    });
    key_block.zeroize();
    seed.zeroize();
    result
}

/// TLS 1.2 PRF (RFC 5246 Section 5): P_hash(secret, label + seed).
pub fn tls12_prf(
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    out_len: usize,
    algo: hmac::Algorithm,
) -> Vec<u8> {
    let key = hmac::Key::new(algo, secret);
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    // A(0) = label_seed, A(i) = HMAC(secret, A(i-1))
    let mut a = hmac::sign(&key, &label_seed).as_ref().to_vec();
    let mut result = Vec::with_capacity(out_len);

    while result.len() < out_len {
        let mut ctx = hmac::Context::with_key(&key);
        ctx.update(&a);
        ctx.update(&label_seed);
        result.extend_from_slice(ctx.sign().as_ref());
        let next = hmac::sign(&key, &a).as_ref().to_vec();
        a.zeroize();
        a = next;
    }

    label_seed.zeroize();
    a.zeroize();
    result.truncate(out_len);
    result
}
