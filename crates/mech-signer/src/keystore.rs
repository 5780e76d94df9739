// SPDX-License-Identifier: MIT OR Apache-2.0
//! scrypt + AES-128-CTR keystore.
//!
//! The operator key is never persisted in plaintext: the on-disk form is a
//! version-3 keystore with an scrypt-derived key, AES-128-CTR ciphertext,
//! and a keccak MAC that is verified before any decryption is attempted.

use aes::Aes128;
use aes::cipher::{KeyIvInit, StreamCipher};
use alloy_primitives::keccak256;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const DKLEN: usize = 32;
const SCRYPT_LOG_N: u8 = 13; // n = 8192
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Errors from keystore handling.
#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    /// File I/O failed.
    #[error("keystore io: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not a valid keystore JSON document.
    #[error("keystore parse: {0}")]
    Parse(#[from] serde_json::Error),
    /// Unsupported cipher or KDF.
    #[error("unsupported keystore: {0}")]
    Unsupported(String),
    /// KDF parameters are out of range.
    #[error("bad kdf params: {0}")]
    BadParams(String),
    /// MAC verification failed; wrong password or corrupted file.
    #[error("mac mismatch (wrong password?)")]
    MacMismatch,
}

/// scrypt parameters as stored on disk (`n` is the cost, not its log).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    /// Derived key length in bytes.
    pub dklen: usize,
    /// CPU/memory cost; must be a power of two.
    pub n: u64,
    /// Parallelization.
    pub p: u32,
    /// Block size.
    pub r: u32,
    /// Hex salt.
    pub salt: String,
}

/// Cipher parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherParams {
    /// Hex initialization vector.
    pub iv: String,
}

/// The `crypto` section of a keystore file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSection {
    /// Cipher name; only `aes-128-ctr` is supported.
    pub cipher: String,
    /// Hex ciphertext.
    pub ciphertext: String,
    /// Cipher parameters.
    pub cipherparams: CipherParams,
    /// KDF name; only `scrypt` is supported.
    pub kdf: String,
    /// KDF parameters.
    pub kdfparams: KdfParams,
    /// Hex keccak MAC over `dk[16..32] ‖ ciphertext`.
    pub mac: String,
}

/// A version-3 keystore document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreFile {
    /// Encrypted key material.
    pub crypto: CryptoSection,
    /// Format version; always 3.
    pub version: u32,
}

fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<Vec<u8>, KeystoreError> {
    if !params.n.is_power_of_two() || params.n < 2 {
        return Err(KeystoreError::BadParams(format!("n={} not a power of two", params.n)));
    }
    if params.dklen < 32 {
        return Err(KeystoreError::BadParams(format!("dklen={} too short", params.dklen)));
    }
    let log_n = params.n.trailing_zeros() as u8;
    let scrypt_params = scrypt::Params::new(log_n, params.r, params.p, params.dklen)
        .map_err(|e| KeystoreError::BadParams(e.to_string()))?;
    let mut dk = vec![0u8; params.dklen];
    scrypt::scrypt(password.as_bytes(), salt, &scrypt_params, &mut dk)
        .map_err(|e| KeystoreError::BadParams(e.to_string()))?;
    Ok(dk)
}

fn mac_of(dk: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + ciphertext.len());
    buf.extend_from_slice(&dk[16..32]);
    buf.extend_from_slice(ciphertext);
    keccak256(&buf).to_vec()
}

/// Encrypt raw key bytes under a password.
pub fn encrypt(key: &[u8], password: &str) -> Result<KeystoreFile, KeystoreError> {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; 32];
    rng.fill_bytes(&mut salt);
    let mut iv = [0u8; 16];
    rng.fill_bytes(&mut iv);

    let params = KdfParams {
        dklen: DKLEN,
        n: 1u64 << SCRYPT_LOG_N,
        p: SCRYPT_P,
        r: SCRYPT_R,
        salt: hex::encode(salt),
    };
    let dk = derive_key(password, &salt, &params)?;
    let cipher_key: [u8; 16] = dk[..16].try_into().expect("dklen checked");

    let mut ciphertext = key.to_vec();
    let mut cipher = Aes128Ctr::new(&cipher_key.into(), &iv.into());
    cipher.apply_keystream(&mut ciphertext);

    let mac = mac_of(&dk, &ciphertext);

    Ok(KeystoreFile {
        crypto: CryptoSection {
            cipher: "aes-128-ctr".to_string(),
            ciphertext: hex::encode(&ciphertext),
            cipherparams: CipherParams { iv: hex::encode(iv) },
            kdf: "scrypt".to_string(),
            kdfparams: params,
            mac: hex::encode(mac),
        },
        version: 3,
    })
}

/// Decrypt a keystore, verifying the MAC before touching the cipher.
pub fn decrypt(file: &KeystoreFile, password: &str) -> Result<Vec<u8>, KeystoreError> {
    if file.crypto.cipher != "aes-128-ctr" {
        return Err(KeystoreError::Unsupported(file.crypto.cipher.clone()));
    }
    if file.crypto.kdf != "scrypt" {
        return Err(KeystoreError::Unsupported(file.crypto.kdf.clone()));
    }

    let salt = hex::decode(&file.crypto.kdfparams.salt)
        .map_err(|e| KeystoreError::BadParams(e.to_string()))?;
    let iv = hex::decode(&file.crypto.cipherparams.iv)
        .map_err(|e| KeystoreError::BadParams(e.to_string()))?;
    let ciphertext = hex::decode(&file.crypto.ciphertext)
        .map_err(|e| KeystoreError::BadParams(e.to_string()))?;
    let expected_mac = hex::decode(&file.crypto.mac)
        .map_err(|e| KeystoreError::BadParams(e.to_string()))?;

    let dk = derive_key(password, &salt, &file.crypto.kdfparams)?;
    if mac_of(&dk, &ciphertext) != expected_mac {
        return Err(KeystoreError::MacMismatch);
    }

    let iv: [u8; 16] = iv
        .try_into()
        .map_err(|_| KeystoreError::BadParams("iv length".to_string()))?;
    let cipher_key: [u8; 16] = dk[..16].try_into().expect("dklen checked");
    let mut plaintext = ciphertext;
    let mut cipher = Aes128Ctr::new(&cipher_key.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// Load and decrypt a keystore file from disk.
pub fn load(path: &Path, password: &str) -> Result<Vec<u8>, KeystoreError> {
    let raw = std::fs::read_to_string(path)?;
    let file: KeystoreFile = serde_json::from_str(&raw)?;
    decrypt(&file, password)
}

/// Encrypt and write a keystore file to disk.
pub fn save(path: &Path, key: &[u8], password: &str) -> Result<(), KeystoreError> {
    let file = encrypt(key, password)?;
    std::fs::write(path, serde_json::to_vec_pretty(&file)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let file = encrypt(&KEY, "hunter2").unwrap();
        assert_eq!(file.version, 3);
        assert_eq!(file.crypto.cipher, "aes-128-ctr");
        let plain = decrypt(&file, "hunter2").unwrap();
        assert_eq!(plain, KEY);
    }

    #[test]
    fn wrong_password_fails_mac_before_decrypt() {
        let file = encrypt(&KEY, "hunter2").unwrap();
        let err = decrypt(&file, "hunter3").unwrap_err();
        assert!(matches!(err, KeystoreError::MacMismatch));
    }

    #[test]
    fn tampered_ciphertext_fails_mac() {
        let mut file = encrypt(&KEY, "pw").unwrap();
        let mut bytes = hex::decode(&file.crypto.ciphertext).unwrap();
        bytes[0] ^= 0xff;
        file.crypto.ciphertext = hex::encode(bytes);
        assert!(matches!(decrypt(&file, "pw").unwrap_err(), KeystoreError::MacMismatch));
    }

    #[test]
    fn unsupported_cipher_is_rejected() {
        let mut file = encrypt(&KEY, "pw").unwrap();
        file.crypto.cipher = "aes-256-gcm".to_string();
        assert!(matches!(
            decrypt(&file, "pw").unwrap_err(),
            KeystoreError::Unsupported(_)
        ));
    }

    #[test]
    fn non_power_of_two_n_is_rejected() {
        let mut file = encrypt(&KEY, "pw").unwrap();
        file.crypto.kdfparams.n = 1000;
        assert!(matches!(
            decrypt(&file, "pw").unwrap_err(),
            KeystoreError::BadParams(_)
        ));
    }

    #[test]
    fn file_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operator.json");
        save(&path, &KEY, "pw").unwrap();
        let plain = load(&path, "pw").unwrap();
        assert_eq!(plain, KEY);
    }
}
