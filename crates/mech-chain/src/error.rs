// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error classification for the pipeline taxonomy.

use mech_core::FaultKind;

/// Chain gateway failures, classified for the worker taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// Transport or node failure; transient.
    #[error("rpc failure: {0}")]
    Rpc(String),
    /// The operator account cannot fund the transaction.
    #[error("insufficient funds")]
    InsufficientFunds,
    /// An `eth_call` reverted (outside the pre-flight path).
    #[error("call reverted{}", reason_suffix(.reason))]
    Reverted {
        /// Decoded revert reason, when the node returned one.
        reason: Option<String>,
    },
    /// The pre-flight simulation of a Safe inner call reverted.
    #[error("simulation reverted{}", reason_suffix(.reason))]
    SimRevert {
        /// Decoded revert reason, when the node returned one.
        reason: Option<String>,
    },
    /// A Safe `execTransaction` reverted on chain.
    #[error("safe transaction reverted{}", reason_suffix(.reason))]
    SafeTxRevert {
        /// Decoded revert reason, when the node returned one.
        reason: Option<String>,
    },
    /// Return data or logs could not be decoded.
    #[error("abi decode: {0}")]
    Decode(String),
    /// Anything else.
    #[error("chain: {0}")]
    Unknown(String),
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {reason}"),
        None => String::new(),
    }
}

impl ChainError {
    /// Map to the worker-wide fault taxonomy.
    #[must_use]
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Self::Rpc(_) => FaultKind::RpcFailure,
            Self::InsufficientFunds => FaultKind::InsufficientFunds,
            Self::SimRevert { .. } => FaultKind::SimRevert,
            Self::SafeTxRevert { .. } | Self::Reverted { .. } => FaultKind::SafeTxRevert,
            Self::Decode(_) | Self::Unknown(_) => FaultKind::Unknown,
        }
    }

    /// `true` when a retry with backoff may help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(ChainError::Rpc("x".into()).fault_kind(), FaultKind::RpcFailure);
        assert_eq!(
            ChainError::InsufficientFunds.fault_kind(),
            FaultKind::InsufficientFunds
        );
        assert_eq!(
            ChainError::SimRevert { reason: None }.fault_kind(),
            FaultKind::SimRevert
        );
        assert_eq!(
            ChainError::SafeTxRevert { reason: None }.fault_kind(),
            FaultKind::SafeTxRevert
        );
        assert_eq!(
            ChainError::Decode("x".into()).fault_kind(),
            FaultKind::Unknown
        );
    }

    #[test]
    fn only_rpc_is_transient() {
        assert!(ChainError::Rpc("x".into()).is_transient());
        assert!(!ChainError::InsufficientFunds.is_transient());
        assert!(!ChainError::SafeTxRevert { reason: None }.is_transient());
    }

    #[test]
    fn revert_reason_is_rendered() {
        let err = ChainError::SimRevert {
            reason: Some("NotStaked()".into()),
        };
        assert!(err.to_string().contains("NotStaked"));
        let bare = ChainError::SimRevert { reason: None };
        assert!(!bare.to_string().contains(':'));
    }
}
