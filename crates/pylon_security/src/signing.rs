//! HMAC-SHA256 signatures for stored scripts and content hashing for audit.
//!
//! The signed message is `name ‖ 0x1f ‖ code`. The ASCII Unit Separator
//! keeps `("ab", "c")` and `("a", "bc")` from producing the same bytes.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SEP: u8 = 0x1f;

/// Script signing key. Wraps the raw bytes so call sites cannot confuse it
/// with other secrets.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self(key.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("SigningKey(..)")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature mismatch")]
    Mismatch,
    #[error("signature is not valid hex")]
    MalformedHex,
}

/// Compute the hex-encoded signature for a script.
pub fn sign_script(key: &SigningKey, name: &str, code: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(name.as_bytes());
    mac.update(&[SEP]);
    mac.update(code.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a stored hex signature in constant time.
pub fn verify_script(
    key: &SigningKey,
    name: &str,
    code: &str,
    signature_hex: &str,
) -> Result<(), SignatureError> {
    let stored = hex::decode(signature_hex).map_err(|_| SignatureError::MalformedHex)?;
    let expected = {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(name.as_bytes());
        mac.update(&[SEP]);
        mac.update(code.as_bytes());
        mac.finalize().into_bytes()
    };
    // Length differences short-circuit; byte comparison is constant time.
    if stored.len() != expected.len() {
        return Err(SignatureError::Mismatch);
    }
    if expected.ct_eq(stored.as_slice()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Derive a per-installation signing key from the installation path and
/// hostname. Deterministic on one machine, different across machines.
///
/// This is the development fallback when no `sign.key` is configured. It is
/// NOT secure for production: anyone who can read the installation path and
/// hostname can reproduce it. Production deployments must set `sign.key`.
pub fn derive_install_key(install_path: &std::path::Path, hostname: &str) -> SigningKey {
    let mut hasher = Sha256::new();
    hasher.update(b"pylon-install-key-v1");
    hasher.update([SEP]);
    hasher.update(install_path.to_string_lossy().as_bytes());
    hasher.update([SEP]);
    hasher.update(hostname.as_bytes());
    SigningKey::new(hasher.finalize().to_vec())
}

/// SHA256 hex digest. Used for audit records, which log a hash of the
/// submitted code rather than the code itself.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn key() -> SigningKey {
        SigningKey::new(b"test-signing-key".to_vec())
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let sig = sign_script(&key(), "hello", "print('hi')");
        assert_eq!(sig.len(), 64); // HMAC-SHA256 = 32 bytes = 64 hex chars
        assert!(verify_script(&key(), "hello", "print('hi')", &sig).is_ok());
    }

    #[test]
    fn test_tampered_code_rejected() {
        let sig = sign_script(&key(), "hello", "print('hi')");
        assert_eq!(
            verify_script(&key(), "hello", "print('ho')", &sig),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_name_code_boundary_unambiguous() {
        // ("ab", "c") and ("a", "bc") must not collide.
        let sig_ab_c = sign_script(&key(), "ab", "c");
        let sig_a_bc = sign_script(&key(), "a", "bc");
        assert_ne!(sig_ab_c, sig_a_bc);
    }

    #[test]
    fn test_mismatch_at_first_and_last_byte() {
        let sig = sign_script(&key(), "s", "code");
        let mut first = sig.clone().into_bytes();
        first[0] = if first[0] == b'0' { b'1' } else { b'0' };
        let first = String::from_utf8(first).unwrap();
        let mut last = sig.into_bytes();
        let tail = last.len() - 1;
        last[tail] = if last[tail] == b'0' { b'1' } else { b'0' };
        let last = String::from_utf8(last).unwrap();

        assert_eq!(
            verify_script(&key(), "s", "code", &first),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_script(&key(), "s", "code", &last),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_malformed_hex_is_distinct() {
        assert_eq!(
            verify_script(&key(), "s", "code", "zz-not-hex"),
            Err(SignatureError::MalformedHex)
        );
    }

    #[test]
    fn test_derived_key_deterministic() {
        let a = derive_install_key(Path::new("/opt/pylon"), "host-a");
        let b = derive_install_key(Path::new("/opt/pylon"), "host-a");
        let c = derive_install_key(Path::new("/opt/pylon"), "host-b");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_sha256_hex() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
