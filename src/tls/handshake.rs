use ring::{aead, hmac};
use tls_parser::{
    TlsExtension, TlsMessage, TlsMessageHandshake, TlsVersion, parse_tls_client_hello_extensions,
    parse_tls_extensions, parse_tls_message_handshake,
};

use super::decrypt::CipherSuite;

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;

/// Handshake header: msg_type(1) + length(3).
const HEADER_LEN: usize = 4;

/// Negotiation fields carried by a hello message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    ClientHello {
        random: [u8; 32],
        /// The client listed TLS 1.3 in supported_versions.
        offers_tls13: bool,
    },
    ServerHello {
        random: [u8; 32],
        cipher_suite: u16,
        /// Negotiated version; 0x0304 when supported_versions selects TLS 1.3.
        version: u16,
    },
}

/// Length of the first complete handshake message in `buf`, header included.
pub(crate) fn complete_message_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let body_len = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]) as usize;
    let total = HEADER_LEN + body_len;
    (buf.len() >= total).then_some(total)
}

/// Decode one complete handshake message. Only hellos produce an event.
pub(crate) fn parse_message(msg: &[u8]) -> Option<HandshakeEvent> {
    if !matches!(msg.first(), Some(&CLIENT_HELLO | &SERVER_HELLO)) {
        return None;
    }
    let (_, parsed) = parse_tls_message_handshake(msg).ok()?;

    match parsed {
        TlsMessage::Handshake(TlsMessageHandshake::ClientHello(ch)) => {
            let random: [u8; 32] = ch.random.try_into().ok()?;
            let offers_tls13 = ch
                .ext
                .and_then(|ext| parse_tls_client_hello_extensions(ext).ok())
                .is_some_and(|(_, exts)| selects_tls13(&exts));
            Some(HandshakeEvent::ClientHello {
                random,
                offers_tls13,
            })
        }
        TlsMessage::Handshake(TlsMessageHandshake::ServerHello(sh)) => {
            let random: [u8; 32] = sh.random.try_into().ok()?;
            let tls13 = sh
                .ext
                .and_then(|ext| parse_tls_extensions(ext).ok())
                .is_some_and(|(_, exts)| selects_tls13(&exts));
            let version = if tls13 {
                TlsVersion::Tls13.0
            } else {
                sh.version.0
            };
            Some(HandshakeEvent::ServerHello {
                random,
                cipher_suite: sh.cipher.0,
                version,
            })
        }
        _ => None,
    }
}

fn selects_tls13(exts: &[TlsExtension<'_>]) -> bool {
    exts.iter().any(|ext| {
        matches!(ext, TlsExtension::SupportedVersions(versions)
            if versions.contains(&TlsVersion::Tls13))
    })
}

/// TLS 1.2 AEAD suites whose records can be opened.
pub fn cipher_suite_params(id: u16) -> Option<CipherSuite> {
    let (aead, prf, key_len, fixed_iv_len) = match id {
        // *_WITH_AES_128_GCM_SHA256: RSA, DHE_RSA, ECDHE_ECDSA, ECDHE_RSA
        0x009C | 0x009E | 0xC02B | 0xC02F => (&aead::AES_128_GCM, hmac::HMAC_SHA256, 16, 4),
        // *_WITH_AES_256_GCM_SHA384
        0x009D | 0x009F | 0xC02C | 0xC030 => (&aead::AES_256_GCM, hmac::HMAC_SHA384, 32, 4),
        // ECDHE_{RSA,ECDSA}_WITH_CHACHA20_POLY1305_SHA256
        0xCCA8 | 0xCCA9 => (&aead::CHACHA20_POLY1305, hmac::HMAC_SHA256, 32, 12),
        _ => return None,
    };
    Some(CipherSuite {
        id,
        aead,
        prf,
        key_len,
        fixed_iv_len,
    })
}

/// IANA name of a cipher suite, for display.
pub fn cipher_suite_name(id: u16) -> Option<&'static str> {
    tls_parser::TlsCipherSuite::from_id(id).map(|suite| suite.name)
}
