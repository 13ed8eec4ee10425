//! Password sealing of stored values.
//!
//! Values are encrypted with AES-256-GCM. The cipher key is
//! SHA-256(salt || password) with a fresh random salt and nonce per value,
//! so sealing the same value twice yields different ciphertexts. A wrong
//! password fails GCM authentication, which callers observe as "no value".

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::KvError;

/// An encrypted value. All fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedValue {
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

fn cipher_for(password: &str, salt: &[u8]) -> Result<Aes256Gcm, KvError> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let key = hasher.finalize();
    Aes256Gcm::new_from_slice(&key).map_err(|_| KvError::Crypto)
}

/// Encrypt a JSON value under `password`.
pub fn seal(value: &Value, password: &str) -> Result<SealedValue, KvError> {
    let salt: [u8; 16] = rand::random();
    let nonce: [u8; 12] = rand::random();
    let plaintext = serde_json::to_vec(value)?;

    let ciphertext = cipher_for(password, &salt)?
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_ref())
        .map_err(|_| KvError::Crypto)?;

    Ok(SealedValue {
        salt: STANDARD.encode(salt),
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
    })
}

/// Decrypt a sealed value. Any failure (wrong password, corrupt data) is `None`.
pub fn open(sealed: &SealedValue, password: &str) -> Option<Value> {
    let salt = STANDARD.decode(&sealed.salt).ok()?;
    let nonce = STANDARD.decode(&sealed.nonce).ok()?;
    let ciphertext = STANDARD.decode(&sealed.ciphertext).ok()?;
    if nonce.len() != 12 {
        return None;
    }

    let plaintext = cipher_for(password, &salt)
        .ok()?
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .ok()?;
    serde_json::from_slice(&plaintext).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seal_open_roundtrip() {
        let value = json!({"token": "abc", "n": [1, 2, 3]});
        let sealed = seal(&value, "p").unwrap();
        assert_eq!(open(&sealed, "p"), Some(value));
    }

    #[test]
    fn test_wrong_password_is_none() {
        let sealed = seal(&json!("secret"), "right").unwrap();
        assert_eq!(open(&sealed, "wrong"), None);
    }

    #[test]
    fn test_ciphertext_hides_plaintext() {
        let sealed = seal(&json!("plain-marker"), "p").unwrap();
        let serialized = serde_json::to_string(&sealed).unwrap();
        assert!(!serialized.contains("plain-marker"));
    }

    #[test]
    fn test_fresh_nonce_each_seal() {
        let a = seal(&json!(1), "p").unwrap();
        let b = seal(&json!(1), "p").unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_corrupt_data_is_none() {
        let mut sealed = seal(&json!(1), "p").unwrap();
        sealed.nonce = "not base64!".to_string();
        assert_eq!(open(&sealed, "p"), None);
    }
}
