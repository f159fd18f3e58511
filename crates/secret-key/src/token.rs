//! Issuing and decoding key strings.

use std::fmt;

use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use rand::rngs::OsRng;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::digest::{KEY_VERSION, StoredKey, digest_secret};
use crate::error::{KeyError, Result};

/// Bytes of randomness in the secret half of a key.
pub const SECRET_LEN: usize = 32;

const PAYLOAD_LEN: usize = 16 + SECRET_LEN;

const REDACTED: &str = "<redacted>";

/// A freshly issued key. `token` is shown to the account holder exactly once.
#[derive(Clone)]
pub struct IssuedKey {
    pub token: String,
    pub key_id: Uuid,
}

impl fmt::Debug for IssuedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedKey")
            .field("token", &REDACTED)
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// A key string decoded from an inbound request.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PresentedKey {
    #[zeroize(skip)]
    key_id: Uuid,
    #[zeroize(skip)]
    version: i16,
    secret: [u8; SECRET_LEN],
}

impl fmt::Debug for PresentedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentedKey")
            .field("key_id", &self.key_id)
            .field("version", &self.version)
            .field("secret", &REDACTED)
            .finish()
    }
}

impl PresentedKey {
    pub fn key_id(&self) -> Uuid {
        self.key_id
    }

    pub fn version(&self) -> i16 {
        self.version
    }

    pub(crate) fn secret(&self) -> &[u8; SECRET_LEN] {
        &self.secret
    }
}

/// Issues and parses keys carrying a fixed prefix.
#[derive(Debug, Clone)]
pub struct KeyIssuer {
    prefix: String,
}

impl Default for KeyIssuer {
    fn default() -> Self {
        Self::new("sa")
    }
}

impl KeyIssuer {
    /// The prefix must not contain `_`, which separates the token fields.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Generate a new key and the record to persist for it.
    pub fn issue(&self) -> (IssuedKey, StoredKey) {
        let key_id = Uuid::now_v7();

        let mut secret = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);

        let mut payload = [0u8; PAYLOAD_LEN];
        payload[..16].copy_from_slice(key_id.as_bytes());
        payload[16..].copy_from_slice(&secret);

        let token = format!(
            "{}_v{}_{}",
            self.prefix,
            KEY_VERSION,
            BASE32_NOPAD.encode(&payload).to_lowercase()
        );
        let digest = digest_secret(key_id, KEY_VERSION, &secret);

        secret.zeroize();
        payload.zeroize();

        (
            IssuedKey { token, key_id },
            StoredKey {
                key_id,
                version: KEY_VERSION,
                digest,
            },
        )
    }

    /// Decode a key string. This checks shape only; use
    /// [`StoredKey::matches`] to authenticate it.
    pub fn parse(&self, token: &str) -> Result<PresentedKey> {
        let mut fields = token.splitn(3, '_');
        let (Some(prefix), Some(version), Some(payload)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(KeyError::Malformed);
        };

        if prefix != self.prefix {
            return Err(KeyError::WrongPrefix(prefix.to_string()));
        }

        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<i16>().ok())
            .ok_or(KeyError::Malformed)?;
        if version != KEY_VERSION {
            return Err(KeyError::UnsupportedVersion(version));
        }

        let mut decoded = BASE32_NOPAD
            .decode(payload.to_ascii_uppercase().as_bytes())
            .map_err(|_| KeyError::BadEncoding)?;
        if decoded.len() != PAYLOAD_LEN {
            decoded.zeroize();
            return Err(KeyError::Malformed);
        }

        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&decoded[..16]);
        let mut secret = [0u8; SECRET_LEN];
        secret.copy_from_slice(&decoded[16..]);
        decoded.zeroize();

        Ok(PresentedKey {
            key_id: Uuid::from_bytes(id_bytes),
            version,
            secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_has_prefix_version_and_payload() {
        let (issued, _) = KeyIssuer::new("sa").issue();

        let fields: Vec<&str> = issued.token.split('_').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], "sa");
        assert_eq!(fields[1], "v1");
        // 48 bytes of payload encode to ceil(384 / 5) base32 characters.
        assert_eq!(fields[2].len(), 77);
    }

    #[test]
    fn issued_keys_are_unique() {
        let issuer = KeyIssuer::default();
        let (a, a_stored) = issuer.issue();
        let (b, b_stored) = issuer.issue();
        assert_ne!(a.token, b.token);
        assert_ne!(a.key_id, b.key_id);
        assert_ne!(a_stored.digest, b_stored.digest);
    }

    #[test]
    fn parse_recovers_key_id() {
        let issuer = KeyIssuer::new("sa");
        let (issued, stored) = issuer.issue();

        let presented = issuer.parse(&issued.token).unwrap();
        assert_eq!(presented.key_id(), issued.key_id);
        assert_eq!(presented.version(), KEY_VERSION);
        assert!(stored.matches(&presented));
    }

    #[test]
    fn parse_accepts_uppercased_payload() {
        let issuer = KeyIssuer::new("sa");
        let (issued, stored) = issuer.issue();
        let (head, payload) = issued.token.split_at(6);
        let shouted = format!("{head}{}", payload.to_uppercase());

        let presented = issuer.parse(&shouted).unwrap();
        assert!(stored.matches(&presented));
    }

    #[test]
    fn debug_output_hides_secret_material() {
        let issuer = KeyIssuer::new("sa");
        let (issued, _) = issuer.issue();
        let presented = issuer.parse(&issued.token).unwrap();
        let payload = issued.token.trim_start_matches("sa_v1_");

        let issued_debug = format!("{issued:?}");
        assert!(!issued_debug.contains(payload));
        assert!(issued_debug.contains(&issued.key_id.to_string()));

        let presented_debug = format!("{presented:?}");
        assert!(presented_debug.contains("<redacted>"));
        assert!(!presented_debug.contains(&format!("{:?}", presented.secret())));
        assert!(!presented_debug.contains(payload));
    }

    #[test]
    fn parse_rejects_foreign_prefix() {
        let (issued, _) = KeyIssuer::new("lb").issue();
        let err = KeyIssuer::new("sa").parse(&issued.token).unwrap_err();
        assert_eq!(err, KeyError::WrongPrefix("lb".to_string()));
    }

    #[test]
    fn parse_rejects_garbage() {
        let issuer = KeyIssuer::new("sa");
        assert_eq!(issuer.parse("not-a-key").unwrap_err(), KeyError::Malformed);
        assert_eq!(issuer.parse("sa_vX_abc").unwrap_err(), KeyError::Malformed);
        assert_eq!(
            issuer.parse("sa_v9_abc").unwrap_err(),
            KeyError::UnsupportedVersion(9)
        );
        assert_eq!(issuer.parse("sa_v1_0189").unwrap_err(), KeyError::BadEncoding);
    }

    #[test]
    fn parse_rejects_truncated_payload() {
        let issuer = KeyIssuer::new("sa");
        let short = format!("sa_v1_{}", BASE32_NOPAD.encode(&[1u8; 20]).to_lowercase());
        assert_eq!(issuer.parse(&short).unwrap_err(), KeyError::Malformed);
    }
}
