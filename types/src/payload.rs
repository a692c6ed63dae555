//! On-disk payload format written by the dispatcher and consumed by the child.
//!
//! Field names are single letters to keep payload files small:
//!
//! ```json
//! {"c":"<base64>","h":"<hex hmac>","t":1700000000,"label":"..","e":true,"i":"..","g":"..","y":"aes-256-gcm"}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[allow(clippy::trivially_copy_pass_by_ref)] // serde's skip_serializing_if passes by reference
fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Base64 of the ciphertext (encrypted) or the serialized job blob (plaintext).
    #[serde(rename = "c")]
    pub content: String,
    /// Hex HMAC-SHA256 over the plaintext blob.
    #[serde(rename = "h")]
    pub hmac: String,
    /// Unix timestamp (seconds) at which the payload was written.
    #[serde(rename = "t")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(rename = "e", default, skip_serializing_if = "is_false")]
    pub encrypted: bool,
    /// Base64 nonce.
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Base64 authentication tag.
    #[serde(rename = "g", default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(rename = "y", default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
}

/// Authenticated ciphers understood by the payload codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CipherId {
    #[default]
    Aes256Gcm,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported payload cipher: {0}")]
pub struct UnsupportedCipher(pub String);

impl CipherId {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
        }
    }

    #[must_use]
    pub const fn nonce_len(self) -> usize {
        match self {
            Self::Aes256Gcm => 12,
        }
    }

    #[must_use]
    pub const fn tag_len(self) -> usize {
        match self {
            Self::Aes256Gcm => 16,
        }
    }
}

impl FromStr for CipherId {
    type Err = UnsupportedCipher;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" => Ok(Self::Aes256Gcm),
            other => Err(UnsupportedCipher(other.to_string())),
        }
    }
}

impl fmt::Display for CipherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
