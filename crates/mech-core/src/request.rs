// SPDX-License-Identifier: MIT OR Apache-2.0
//! On-chain request model.
//!
//! A [`Request`] is immutable once created by the marketplace; the chain is
//! the only writer (delivery flips the `delivered` flag). The worker never
//! owns request state, it only leases a request while a pipeline runs.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque 32-byte request identifier, rendered as `0x`-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub B256);

impl RequestId {
    /// The zero identifier. Never produced by the marketplace; useful as a
    /// sentinel in tests.
    pub const ZERO: RequestId = RequestId(B256::ZERO);

    /// Interpret the 32 bytes as an unsigned big-endian integer and render
    /// it in decimal. Legacy store deliveries are keyed by this form.
    #[must_use]
    pub fn decimal(&self) -> String {
        U256::from_be_bytes(self.0.0).to_string()
    }

    /// Raw 32-byte view.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl From<B256> for RequestId {
    fn from(value: B256) -> Self {
        Self(value)
    }
}

impl FromStr for RequestId {
    type Err = alloy_primitives::hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(B256::from_str(s)?))
    }
}

/// A unit of work as recorded on chain and mirrored by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Marketplace-assigned identifier.
    pub id: RequestId,
    /// Address that paid for and posted the request.
    pub requester: Address,
    /// Mech the request is directed at (the operator's routing key).
    pub mech: Address,
    /// 32-byte digest of the content-addressed metadata blob.
    pub data: B256,
    /// Workstream this request belongs to, when it has ancestry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workstream_id: Option<String>,
    /// Requests that must be delivered before this one is claimable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<RequestId>,
    /// Set by the chain when a delivery settles. Never unset.
    pub delivered: bool,
    /// Block timestamp of the creating transaction (seconds).
    #[serde(default)]
    pub block_timestamp: i64,
}

impl Request {
    /// `true` when every dependency id in `delivered_set` covers this
    /// request's dependency list.
    pub fn dependencies_satisfied<F>(&self, delivered: F) -> bool
    where
        F: Fn(&RequestId) -> bool,
    {
        self.dependencies.iter().all(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(byte: u8) -> RequestId {
        RequestId(B256::repeat_byte(byte))
    }

    #[test]
    fn decimal_renders_big_endian_integer() {
        let mut raw = [0u8; 32];
        raw[31] = 42;
        assert_eq!(RequestId(B256::from(raw)).decimal(), "42");
    }

    #[test]
    fn decimal_of_zero_is_zero() {
        assert_eq!(RequestId::ZERO.decimal(), "0");
    }

    #[test]
    fn display_is_prefixed_hex() {
        let id = rid(0xab);
        let s = id.to_string();
        assert!(s.starts_with("0x"));
        assert_eq!(s.len(), 66);
    }

    #[test]
    fn parses_from_hex_string() {
        let id = rid(0x11);
        let back: RequestId = id.to_string().parse().unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn serde_roundtrip_as_hex_string() {
        let id = rid(0x5c);
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with("\"0x"));
        let back: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn dependencies_satisfied_consults_every_id() {
        let req = Request {
            id: rid(1),
            requester: Address::ZERO,
            mech: Address::ZERO,
            data: B256::ZERO,
            workstream_id: None,
            dependencies: vec![rid(2), rid(3)],
            delivered: false,
            block_timestamp: 0,
        };
        assert!(req.dependencies_satisfied(|_| true));
        assert!(!req.dependencies_satisfied(|d| *d == rid(2)));
        // No dependencies means trivially satisfied.
        let bare = Request {
            dependencies: vec![],
            ..req
        };
        assert!(bare.dependencies_satisfied(|_| false));
    }
}
