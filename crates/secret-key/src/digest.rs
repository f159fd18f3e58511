//! Digest of the secret half of a key, as persisted by the service.

use sha3::{Digest, Sha3_512};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::token::{PresentedKey, SECRET_LEN};

/// Version tag mixed into every digest and encoded in every token.
pub const KEY_VERSION: i16 = 1;

/// Length of a SHA3-512 digest.
pub const DIGEST_LEN: usize = 64;

/// What the service stores for one issued key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredKey {
    pub key_id: Uuid,
    pub version: i16,
    pub digest: [u8; DIGEST_LEN],
}

impl StoredKey {
    /// Rebuild a stored key from database columns.
    ///
    /// Returns `None` when the digest column has the wrong length.
    pub fn from_parts(key_id: Uuid, version: i16, digest: &[u8]) -> Option<Self> {
        let digest: [u8; DIGEST_LEN] = digest.try_into().ok()?;
        Some(Self {
            key_id,
            version,
            digest,
        })
    }

    /// Check a presented key against this record in constant time.
    pub fn matches(&self, presented: &PresentedKey) -> bool {
        if presented.key_id() != self.key_id || presented.version() != self.version {
            return false;
        }
        let computed = digest_secret(self.key_id, self.version, presented.secret());
        computed.ct_eq(&self.digest).into()
    }
}

/// Hash a secret bound to its key id and version.
///
/// Binding the id stops a digest from one row being replayed against another.
pub(crate) fn digest_secret(
    key_id: Uuid,
    version: i16,
    secret: &[u8; SECRET_LEN],
) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha3_512::new();
    hasher.update(key_id.as_bytes());
    hasher.update(version.to_le_bytes());
    hasher.update(secret);

    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::KeyIssuer;

    #[test]
    fn digest_is_bound_to_key_id() {
        let secret = [7u8; SECRET_LEN];
        let a = digest_secret(Uuid::now_v7(), KEY_VERSION, &secret);
        let b = digest_secret(Uuid::now_v7(), KEY_VERSION, &secret);
        assert_ne!(a, b);
    }

    #[test]
    fn digest_is_bound_to_version() {
        let id = Uuid::now_v7();
        let secret = [7u8; SECRET_LEN];
        assert_ne!(
            digest_secret(id, 1, &secret),
            digest_secret(id, 2, &secret)
        );
    }

    #[test]
    fn tampered_digest_does_not_match() {
        let issuer = KeyIssuer::new("sa");
        let (issued, mut stored) = issuer.issue();
        stored.digest[0] ^= 0xFF;

        let presented = issuer.parse(&issued.token).unwrap();
        assert!(!stored.matches(&presented));
    }

    #[test]
    fn key_from_another_row_does_not_match() {
        let issuer = KeyIssuer::new("sa");
        let (first, _) = issuer.issue();
        let (_, second_stored) = issuer.issue();

        let presented = issuer.parse(&first.token).unwrap();
        assert!(!second_stored.matches(&presented));
    }

    #[test]
    fn from_parts_rejects_short_digest() {
        assert!(StoredKey::from_parts(Uuid::now_v7(), KEY_VERSION, &[0u8; 12]).is_none());
    }
}
