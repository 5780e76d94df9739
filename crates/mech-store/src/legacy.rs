// SPDX-License-Identifier: MIT OR Apache-2.0
//! Legacy CID candidate enumeration.
//!
//! Historic deliveries were stored under heterogeneous codecs: some as raw
//! blocks, some as dag-pb directories containing a file named after the
//! decimal form of the request id. Given only the on-chain 32-byte digest,
//! the resolver enumerates every plausible CID and lets the gateway decide.
//!
//! Encoding notes: base32 CIDs use the lowercase RFC-4648 alphabet without
//! padding, multibase prefix `b`; base16 CIDs carry multibase prefix `f`,
//! so a sha2-256 digest renders as `f01701220…` (dag-pb) or `f01551220…`
//! (raw).

use crate::{DAG_PB_CODEC, RAW_CODEC, StoreError};
use cid::Cid;
use cid::multibase::Base;
use cid::multihash::Multihash;
use mech_core::RequestId;

/// sha2-256 multihash code.
const SHA2_256: u64 = 0x12;

/// Parse a `0x`-prefixed (or bare) 64-char digest hex into bytes.
pub(crate) fn parse_digest(digest_hex: &str) -> Result<[u8; 32], StoreError> {
    let stripped = digest_hex.trim_start_matches("0x");
    let bytes = hex::decode(stripped)
        .map_err(|_| StoreError::InvalidDigest(digest_hex.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| StoreError::InvalidDigest(digest_hex.to_string()))
}

fn cid_for(codec: u64, digest: &[u8; 32]) -> Cid {
    let hash = Multihash::<64>::wrap(SHA2_256, digest).expect("32-byte digest fits");
    Cid::new_v1(codec, hash)
}

/// Enumerate gateway paths for a legacy digest, in probe order.
///
/// With a request id the dag-pb directory candidate comes first, pathed by
/// the decimal request id; the raw and dag-pb base16 probes follow. The
/// caller stops at the first gateway hit.
pub fn candidates(
    digest_hex: &str,
    request_id: Option<&RequestId>,
) -> Result<Vec<String>, StoreError> {
    let digest = parse_digest(digest_hex)?;
    let dag_pb = cid_for(DAG_PB_CODEC, &digest);
    let raw = cid_for(RAW_CODEC, &digest);

    let mut out = Vec::with_capacity(3);
    if let Some(request_id) = request_id {
        let dir = dag_pb
            .to_string_of_base(Base::Base32Lower)
            .expect("base32 encoding is infallible for v1");
        out.push(format!("{dir}/{}", request_id.decimal()));
    }
    out.push(
        raw.to_string_of_base(Base::Base16Lower)
            .expect("base16 encoding is infallible for v1"),
    );
    out.push(
        dag_pb
            .to_string_of_base(Base::Base16Lower)
            .expect("base16 encoding is infallible for v1"),
    );
    Ok(out)
}
