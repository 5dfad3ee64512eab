/// License parsing and cipher derivation
///
/// A license string is URL-safe base64 (no padding) over a small JSON document:
/// `{"secret": "...", "contract": 1, "expires": 0}`. `expires` is a unix
/// timestamp in seconds, 0 meaning the license never expires.
///
/// The cipher is derived from the license secret and is what the broker uses to
/// encode and decode channel keys.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::LicenseError;
use crate::logger::{self, LogTag};

/// A parsed broker license
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub secret: String,
    pub contract: u32,
    #[serde(default)]
    pub expires: i64,
}

impl License {
    /// Parse an encoded license string
    pub fn parse(encoded: &str) -> Result<Self, LicenseError> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(LicenseError::Empty);
        }

        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| LicenseError::Encoding(e.to_string()))?;

        let license: License =
            serde_json::from_slice(&raw).map_err(|e| LicenseError::Malformed(e.to_string()))?;

        if let Some(expiry) = license.expiry() {
            if expiry <= Utc::now() {
                return Err(LicenseError::Expired(expiry));
            }
        }

        logger::debug(
            LogTag::License,
            &format!(
                "License parsed: contract={}, expires={}",
                license.contract,
                license
                    .expiry()
                    .map(|e| e.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            ),
        );
        Ok(license)
    }

    /// Build a new license and return its encoded form
    pub fn new_encoded(secret: &str, contract: u32, expires: i64) -> String {
        let license = License {
            secret: secret.to_string(),
            contract,
            expires,
        };
        // Serializing a struct of strings and integers cannot fail
        let json = serde_json::to_vec(&license).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        if self.expires <= 0 {
            return None;
        }
        Utc.timestamp_opt(self.expires, 0).single()
    }

    /// Derive the cipher for this license
    pub fn cipher(&self) -> Result<Cipher, LicenseError> {
        if self.secret.is_empty() {
            return Err(LicenseError::InvalidCipher);
        }

        let mut hasher = Sha256::new();
        hasher.update(self.contract.to_be_bytes());
        hasher.update(self.secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Ok(Cipher { key })
    }
}

/// Symmetric key material derived from a license
#[derive(Clone, PartialEq, Eq)]
pub struct Cipher {
    key: [u8; 32],
}

impl Cipher {
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}
