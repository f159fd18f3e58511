//! Bearer secret keys for the inference API.
//!
//! A key is handed to the account holder once, at signup. The service keeps
//! only the public key id and a digest of the secret half, so a leaked
//! database does not leak usable credentials.
//!
//! # Key Format
//!
//! `{prefix}_v{version}_{base32(key_id || secret)}`
//!
//! - `prefix` is a short, non-secret tag (`sa` by default) so operators can
//!   recognise a pasted key at a glance.
//! - `key_id` is a UUIDv7 used to find the stored digest.
//! - `secret` is 32 bytes from the OS random source.
//!
//! # Example
//!
//! ```rust
//! use secret_key::{KeyIssuer, StoredKey};
//!
//! let issuer = KeyIssuer::new("sa");
//! let (issued, stored) = issuer.issue();
//!
//! // `issued.token` goes to the caller, `stored` goes to the database.
//! let presented = issuer.parse(&issued.token).unwrap();
//! assert_eq!(presented.key_id(), stored.key_id);
//! assert!(stored.matches(&presented));
//! ```

mod digest;
mod error;
mod token;

pub use digest::{DIGEST_LEN, KEY_VERSION, StoredKey};
pub use error::{KeyError, Result};
pub use token::{IssuedKey, KeyIssuer, PresentedKey, SECRET_LEN};
