// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-signer
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Operator identity: address derivation from the secp256k1 operator key,
//! eth_sign-style message signatures for Safe transactions, RFC-9421 HTTP
//! message signatures, and the encrypted keystore format.

/// RFC-9421 HTTP message signatures and the verifier side.
pub mod http;
/// scrypt + AES-128-CTR keystore.
pub mod keystore;

use alloy_primitives::{Address, B256, Signature, keccak256};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;

/// Errors from identity handling.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// The private key hex could not be parsed.
    #[error("invalid private key: {0}")]
    InvalidKey(String),
    /// The underlying ECDSA signer failed.
    #[error("signing failed: {0}")]
    Ecdsa(#[from] alloy_signer::Error),
}

/// The operator key, its derived address, and signing operations.
///
/// Constructed once at startup and passed around as an explicit parameter;
/// the key itself never leaves this type.
#[derive(Debug, Clone)]
pub struct OperatorSigner {
    inner: PrivateKeySigner,
    chain_id: u64,
}

impl OperatorSigner {
    /// Build from a hex private key (with or without `0x` prefix).
    pub fn from_hex(key: &str, chain_id: u64) -> Result<Self, SignerError> {
        let inner: PrivateKeySigner = key
            .trim()
            .parse()
            .map_err(|_| SignerError::InvalidKey("not a secp256k1 scalar".to_string()))?;
        Ok(Self { inner, chain_id })
    }

    /// Build from raw key bytes (e.g. decrypted from a keystore).
    pub fn from_bytes(key: &[u8], chain_id: u64) -> Result<Self, SignerError> {
        let inner = PrivateKeySigner::from_slice(key)
            .map_err(|_| SignerError::InvalidKey("not a secp256k1 scalar".to_string()))?;
        Ok(Self { inner, chain_id })
    }

    /// Derived operator address.
    #[must_use]
    pub fn address(&self) -> Address {
        self.inner.address()
    }

    /// Chain id this signer operates on.
    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Key id used in HTTP signatures: `chain_id:address`.
    #[must_use]
    pub fn key_id(&self) -> String {
        format!("{}:{}", self.chain_id, self.address())
    }

    /// Sign a precomputed 32-byte hash (transaction signing path).
    pub fn sign_hash(&self, hash: &B256) -> Result<Signature, SignerError> {
        Ok(self.inner.sign_hash_sync(hash)?)
    }

    /// Sign arbitrary bytes eth_sign style: EIP-191 prefix, keccak, ECDSA.
    ///
    /// Returns the 65-byte `r ‖ s ‖ v` blob with `v ∈ {27, 28}`.
    pub fn sign_message(&self, message: &[u8]) -> Result<[u8; 65], SignerError> {
        let digest = eip191_hash(message);
        let sig = self.inner.sign_hash_sync(&digest)?;
        Ok(signature_bytes(&sig, 0))
    }

    /// Sign a pre-hashed 32-byte payload for a Safe `execTransaction`.
    ///
    /// The Safe signature layout marks eth_sign-style signatures with
    /// `v + 4`, so byte 64 is 31 or 32.
    pub fn sign_safe_hash(&self, hash: B256) -> Result<[u8; 65], SignerError> {
        let digest = eip191_hash(hash.as_slice());
        let sig = self.inner.sign_hash_sync(&digest)?;
        Ok(signature_bytes(&sig, 4))
    }
}

/// EIP-191 personal-message hash: `keccak256("\x19Ethereum Signed
/// Message:\n" ‖ len ‖ message)`.
#[must_use]
pub fn eip191_hash(message: &[u8]) -> B256 {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut buf = Vec::with_capacity(prefix.len() + message.len());
    buf.extend_from_slice(prefix.as_bytes());
    buf.extend_from_slice(message);
    keccak256(&buf)
}

/// Render a signature as `r ‖ s ‖ (27 + parity + bump)`.
#[must_use]
pub fn signature_bytes(sig: &Signature, bump: u8) -> [u8; 65] {
    let mut out = [0u8; 65];
    out[..32].copy_from_slice(&sig.r().to_be_bytes::<32>());
    out[32..64].copy_from_slice(&sig.s().to_be_bytes::<32>());
    out[64] = 27 + u8::from(sig.v()) + bump;
    out
}

/// Parse a 65-byte `r ‖ s ‖ v` blob back into a signature.
///
/// Accepts `v ∈ {27, 28}` and the Safe-marked `{31, 32}` forms.
pub fn signature_from_bytes(bytes: &[u8; 65]) -> Result<Signature, SignerError> {
    let r = alloy_primitives::U256::from_be_slice(&bytes[..32]);
    let s = alloy_primitives::U256::from_be_slice(&bytes[32..64]);
    let parity = match bytes[64] {
        27 | 31 => false,
        28 | 32 => true,
        other => {
            return Err(SignerError::InvalidKey(format!(
                "unsupported recovery byte {other}"
            )));
        }
    };
    Ok(Signature::new(r, s, parity))
}
