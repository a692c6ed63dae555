//! Payload signing and authenticated encryption.
//!
//! The HMAC is always computed over the plaintext job blob with the raw secret, so
//! verification happens after decryption. The AES key is SHA-256 of the secret,
//! which accepts secrets of any length.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use fibril_types::{CipherId, Payload, UnsupportedCipher};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SealError {
    #[error("secret key is empty")]
    EmptySecret,
    #[error("encryption failed")]
    Encrypt,
}

/// Why a payload was refused by the child.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("payload path is outside the payload directory")]
    OutsidePayloadDir,
    #[error("payload expired ({age_secs}s old, ttl {ttl_secs}s)")]
    Expired { age_secs: i64, ttl_secs: u64 },
    #[error("payload HMAC mismatch")]
    HmacMismatch,
    #[error("payload decryption failed")]
    Decrypt,
    #[error("malformed payload field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error(transparent)]
    UnsupportedCipher(#[from] UnsupportedCipher),
}

impl IntegrityError {
    fn malformed(field: &'static str, reason: impl ToString) -> Self {
        Self::Malformed {
            field,
            reason: reason.to_string(),
        }
    }
}

fn mac_bytes(blob: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .expect("HMAC accepts keys of any length");
    mac.update(blob);
    mac.finalize().into_bytes().to_vec()
}

/// Hex HMAC-SHA256 of `blob`.
#[must_use]
pub fn sign(blob: &[u8], secret: &[u8]) -> String {
    hex::encode(mac_bytes(blob, secret))
}

/// Constant-time comparison of `stored` against the HMAC of `blob`.
#[must_use]
pub fn verify(blob: &[u8], stored: &str, secret: &[u8]) -> bool {
    let Ok(expected) = hex::decode(stored.trim()) else {
        return false;
    };
    let actual = mac_bytes(blob, secret);
    if expected.len() != actual.len() {
        return false;
    }
    expected.ct_eq(actual.as_slice()).into()
}

fn cipher_for(secret: &[u8]) -> Aes256Gcm {
    let key = Sha256::digest(secret);
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
}

/// Build a payload for `blob`, encrypting it when `cipher` is set.
pub fn seal(
    blob: &[u8],
    secret: &[u8],
    cipher: Option<CipherId>,
    label: Option<String>,
    timestamp: i64,
) -> Result<Payload, SealError> {
    if secret.is_empty() {
        return Err(SealError::EmptySecret);
    }
    let hmac = sign(blob, secret);

    let Some(cipher) = cipher else {
        return Ok(Payload {
            content: STANDARD.encode(blob),
            hmac,
            timestamp,
            label,
            encrypted: false,
            nonce: None,
            tag: None,
            cipher: None,
        });
    };

    let nonce_bytes: [u8; 12] = rand::random();
    let mut buffer = blob.to_vec();
    let tag = match cipher {
        CipherId::Aes256Gcm => cipher_for(secret)
            .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), b"", &mut buffer)
            .map_err(|_| SealError::Encrypt)?,
    };

    Ok(Payload {
        content: STANDARD.encode(&buffer),
        hmac,
        timestamp,
        label,
        encrypted: true,
        nonce: Some(STANDARD.encode(nonce_bytes)),
        tag: Some(STANDARD.encode(tag)),
        cipher: Some(cipher.as_str().to_string()),
    })
}

fn decode_field(field: &'static str, value: Option<&str>) -> Result<Vec<u8>, IntegrityError> {
    let value = value.ok_or_else(|| IntegrityError::malformed(field, "missing"))?;
    STANDARD
        .decode(value)
        .map_err(|e| IntegrityError::malformed(field, e))
}

/// Recover and authenticate the job blob carried by `payload`.
pub fn open(payload: &Payload, secret: &[u8]) -> Result<Vec<u8>, IntegrityError> {
    let mut blob = decode_field("c", Some(payload.content.as_str()))?;

    if payload.encrypted {
        let cipher: CipherId = payload
            .cipher
            .as_deref()
            .unwrap_or(CipherId::default().as_str())
            .parse()?;
        let nonce = decode_field("i", payload.nonce.as_deref())?;
        let tag = decode_field("g", payload.tag.as_deref())?;
        if nonce.len() != cipher.nonce_len() {
            return Err(IntegrityError::malformed(
                "i",
                format!("expected {} bytes, got {}", cipher.nonce_len(), nonce.len()),
            ));
        }
        if tag.len() != cipher.tag_len() {
            return Err(IntegrityError::malformed(
                "g",
                format!("expected {} bytes, got {}", cipher.tag_len(), tag.len()),
            ));
        }
        match cipher {
            CipherId::Aes256Gcm => cipher_for(secret)
                .decrypt_in_place_detached(
                    Nonce::from_slice(&nonce),
                    b"",
                    &mut blob,
                    Tag::from_slice(&tag),
                )
                .map_err(|_| IntegrityError::Decrypt)?,
        }
    }

    if !verify(&blob, &payload.hmac, secret) {
        return Err(IntegrityError::HmacMismatch);
    }
    Ok(blob)
}
