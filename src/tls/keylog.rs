use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use zeroize::Zeroize;

/// TLS 1.2 master secrets from an NSS key log (`SSLKEYLOGFILE`), keyed by
/// client random.
///
/// Only `CLIENT_RANDOM` lines are kept; TLS 1.3 traffic secrets and unknown
/// labels are counted and skipped.
#[derive(Default)]
pub struct KeyLog {
    master_secrets: HashMap<[u8; 32], Vec<u8>>,
    skipped: usize,
}

impl std::fmt::Debug for KeyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLog")
            .field("master_secrets", &self.master_secrets.len())
            .field("skipped", &self.skipped)
            .finish()
    }
}

impl Drop for KeyLog {
    fn drop(&mut self) {
        for secret in self.master_secrets.values_mut() {
            secret.zeroize();
        }
    }
}

/// TLS 1.2 master secrets are always 48 bytes.
const MASTER_SECRET_LEN: usize = 48;

impl KeyLog {
    /// Maximum keylog file size (50 MB) to prevent excessive memory allocation.
    const MAX_KEYLOG_SIZE: u64 = 50 * 1024 * 1024;

    pub fn from_file(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)
            .context(format!("Failed to stat keylog: {}", path.display()))?;
        if meta.len() > Self::MAX_KEYLOG_SIZE {
            anyhow::bail!(
                "Keylog file too large ({} bytes, max {}): {}",
                meta.len(),
                Self::MAX_KEYLOG_SIZE,
                path.display()
            );
        }
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read keylog: {}", path.display()))?;
        let keylog = Self::parse(&contents);
        tracing::info!(
            secrets = keylog.len(),
            skipped = keylog.skipped,
            path = %path.display(),
            "loaded key log"
        );
        Ok(keylog)
    }

    /// Parse key log text. Comments, blank lines, and malformed entries are skipped.
    pub fn parse(contents: &str) -> Self {
        let mut keylog = KeyLog::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let entry = match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some("CLIENT_RANDOM"), Some(random), Some(secret), None) => {
                    decode_hex_32(random).zip(decode_hex(secret))
                }
                _ => None,
            };

            match entry {
                Some((client_random, secret)) if secret.len() == MASTER_SECRET_LEN => {
                    keylog.master_secrets.insert(client_random, secret);
                }
                Some((_, mut secret)) => {
                    secret.zeroize();
                    keylog.skipped += 1;
                }
                None => keylog.skipped += 1,
            }
        }

        keylog
    }

    /// Register a master secret directly, e.g. from an in-process key callback.
    pub fn insert(&mut self, client_random: [u8; 32], master_secret: &[u8]) {
        if let Some(mut old) = self
            .master_secrets
            .insert(client_random, master_secret.to_vec())
        {
            old.zeroize();
        }
    }

    pub fn master_secret(&self, client_random: &[u8; 32]) -> Option<&[u8]> {
        self.master_secrets.get(client_random).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.master_secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.master_secrets.is_empty()
    }

    /// Lines that were not usable `CLIENT_RANDOM` entries.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if !s.len().is_multiple_of(2) || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn decode_hex_32(s: &str) -> Option<[u8; 32]> {
    decode_hex(s)?.try_into().ok()
}
