//! Encryption at rest for OAuth tokens.
//!
//! Tokens are sealed with AES-256-GCM under a 32-byte key supplied as hex
//! and stored as a small JSON envelope carrying the nonce and ciphertext.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("token key must be 64 hex characters (32 bytes)")]
    InvalidKey,

    #[error("invalid hex: {0}")]
    Hex(String),

    #[error("token envelope: {0}")]
    Envelope(String),

    #[error("seal token")]
    Seal,

    #[error("open token")]
    Open,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; KEY_BYTES],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    pub fn from_hex(raw: &str) -> Result<Self, CryptoError> {
        let decoded = hex_decode(raw)?;
        let key: [u8; KEY_BYTES] = decoded.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { key })
    }

    fn sealing_key(&self) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(LessSafeKey::new(unbound))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let key = self.sealing_key()?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Seal)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut in_out,
        )
        .map_err(|_| CryptoError::Seal)?;

        let envelope = TokenEnvelope {
            version: ENVELOPE_VERSION,
            nonce_hex: hex_encode(&nonce_bytes),
            ciphertext_hex: hex_encode(&in_out),
        };
        serde_json::to_string(&envelope).map_err(|e| CryptoError::Envelope(e.to_string()))
    }

    pub fn decrypt(&self, raw: &str) -> Result<String, CryptoError> {
        let envelope: TokenEnvelope =
            serde_json::from_str(raw).map_err(|e| CryptoError::Envelope(e.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CryptoError::Envelope(format!(
                "unsupported version {}",
                envelope.version
            )));
        }

        let nonce_bytes: [u8; NONCE_BYTES] = hex_decode(&envelope.nonce_hex)?
            .try_into()
            .map_err(|_| CryptoError::Envelope("invalid nonce length".to_string()))?;
        let mut ciphertext = hex_decode(&envelope.ciphertext_hex)?;

        let key = self.sealing_key()?;
        let plaintext = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut ciphertext,
            )
            .map_err(|_| CryptoError::Open)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Open)
    }

    /// Decrypt a stored token, treating empty, missing or unreadable values as absent.
    pub fn decrypt_opt(&self, raw: Option<&str>) -> Option<String> {
        let raw = raw.map(str::trim).filter(|value| !value.is_empty())?;
        self.decrypt(raw).ok().filter(|token| !token.is_empty())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>, CryptoError> {
    let bytes = raw.trim().as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(CryptoError::Hex("length must be even".to_string()));
    }

    bytes
        .chunks(2)
        .map(|pair| {
            let hi = decode_hex_nibble(pair[0]);
            let lo = decode_hex_nibble(pair[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
                _ => Err(CryptoError::Hex("invalid hex digit".to_string())),
            }
        })
        .collect()
}

fn decode_hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) const TEST_KEY_HEX: &str =
    "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
