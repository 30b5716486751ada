//! Symmetric encryption for post-handshake payloads.
//!
//! AES-128 in CFB mode under a pre-shared key known to all peers. Every
//! encrypted message is prefixed with a freshly generated random IV sized to
//! the cipher block; decryption consumes the prefix before transforming the
//! remainder. CFB is a stream mode, so payloads of any length round-trip
//! without padding.

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;

type Aes128CfbEnc = cfb_mode::Encryptor<aes::Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<aes::Aes128>;

/// Pre-shared key length in bytes.
pub const KEY_LEN: usize = 16;

/// IV length in bytes, one AES block.
pub const IV_LEN: usize = 16;

/// Errors when decrypting a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Message shorter than the IV prefix.
    TooShort(usize),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::TooShort(len) => {
                write!(f, "encrypted message too short for IV prefix: {} bytes", len)
            }
        }
    }
}

impl std::error::Error for CryptoError {}

/// Encrypt `plain` under `key`, returning `IV || ciphertext`.
pub fn encrypt(key: &[u8; KEY_LEN], plain: &[u8]) -> Vec<u8> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let mut out = Vec::with_capacity(IV_LEN + plain.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(plain);
    Aes128CfbEnc::new(key.into(), &iv.into()).encrypt(&mut out[IV_LEN..]);
    out
}

/// Strip the IV prefix from `data` and decrypt the remainder.
pub fn decrypt(key: &[u8; KEY_LEN], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < IV_LEN {
        return Err(CryptoError::TooShort(data.len()));
    }
    let iv: [u8; IV_LEN] = data[..IV_LEN].try_into().map_err(|_| CryptoError::TooShort(data.len()))?;
    let mut plain = data[IV_LEN..].to_vec();
    Aes128CfbDec::new(key.into(), &iv.into()).decrypt(&mut plain);
    Ok(plain)
}
