use ethers::types::H256;
use thiserror::Error;

use crate::revert::RevertReason;
use crate::types::{EventId, MessageStatus};

/// Errors raised while talking to a chain node or contract.
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("rpc error in {context}: {message}")]
    Rpc { context: &'static str, message: String },

    #[error("call reverted: {0}")]
    Reverted(RevertReason),

    #[error("transaction {0:#x} dropped from mempool")]
    Dropped(H256),
}

impl ChainError {
    /// RPC failure of `context`, keeping only the error's message.
    pub fn rpc(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Rpc {
            context,
            message: err.to_string(),
        }
    }
}

/// Errors raised while building a signal proof.
#[derive(Error, Debug, Clone)]
pub enum ProofError {
    #[error("{path} failed: {source}")]
    Fetch {
        path: &'static str,
        #[source]
        source: ChainError,
    },

    #[error("block {0:#x} not found")]
    BlockNotFound(H256),

    #[error("malformed block header: {0}")]
    MalformedHeader(&'static str),

    #[error("hop {hop}: no header synced yet")]
    NotSynced { hop: usize },

    #[error("hop {hop}: synced block {synced} is behind required block {required}")]
    Behind { hop: usize, synced: u64, required: u64 },

    #[error("hop {hop}: requested block {requested:#x} but node returned {returned:#x}")]
    RootMismatch {
        hop: usize,
        requested: H256,
        returned: H256,
    },

    #[error("hop {hop}: signal {slot:#x} not present at block {block:#x}")]
    SignalMissing { hop: usize, slot: H256, block: H256 },
}

/// Errors raised while waiting on the confirmation gate.
#[derive(Error, Debug, Clone)]
pub enum GateError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("timed out waiting for {operation} after {seconds} seconds")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("cancelled")]
    Cancelled,
}

/// Errors raised by an [`EventStore`](crate::store::EventStore).
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("illegal status transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: EventId,
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("store backend: {0}")]
    Backend(String),
}

/// Errors raised by a [`MessageQueue`](crate::queue::MessageQueue).
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

/// Startup configuration errors. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(
        "hop lists differ in length: {signal_services} signal services, {taiko_addresses} taiko addresses, {rpc_urls} rpc urls"
    )]
    HopListMismatch {
        signal_services: usize,
        taiko_addresses: usize,
        rpc_urls: usize,
    },

    #[error("{0} must not be the zero address")]
    ZeroAddress(&'static str),

    #[error("invalid rpc url {url}: {reason}")]
    InvalidRpcUrl { url: String, reason: String },

    #[error("{0} must be greater than zero")]
    NonPositive(&'static str),

    #[error("invalid private key: {0}")]
    PrivateKey(String),
}

/// How the processor reacts to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Requeue after the backoff interval, counting against the retry budget.
    Retry,
    /// Mark the event failed and drop it.
    Fail,
    /// Shutdown interrupted the attempt; requeue untouched.
    Cancelled,
}

#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Proof error: {0}")]
    Proof(#[from] ProofError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Message validation error: {0}")]
    ValidationError(String),

    #[error("Timeout waiting for {operation} after {seconds} seconds")]
    Timeout { operation: String, seconds: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<GateError> for RelayerError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Chain(e) => Self::Chain(e),
            GateError::Timeout { operation, seconds } => Self::Timeout {
                operation: operation.to_string(),
                seconds,
            },
            GateError::Cancelled => Self::Cancelled,
        }
    }
}

impl RelayerError {
    /// Whether the attempt that raised this error should be retried.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Cancelled => Disposition::Cancelled,
            Self::ValidationError(_) | Self::Configuration(_) => Disposition::Fail,
            Self::Chain(ChainError::Reverted(reason)) => {
                if reason.is_terminal() {
                    Disposition::Fail
                } else {
                    Disposition::Retry
                }
            }
            Self::Proof(e) => match e {
                ProofError::MalformedHeader(_)
                | ProofError::RootMismatch { .. }
                | ProofError::SignalMissing { hop: 0, .. } => Disposition::Fail,
                // a hop chain may not have relayed the synced header as a signal yet
                ProofError::SignalMissing { .. }
                | ProofError::Fetch { .. }
                | ProofError::BlockNotFound(_)
                | ProofError::NotSynced { .. }
                | ProofError::Behind { .. } => Disposition::Retry,
            },
            Self::Chain(_)
            | Self::Store(_)
            | Self::Queue(_)
            | Self::Timeout { .. }
            | Self::Other(_) => Disposition::Retry,
        }
    }
}

pub type Result<T, E = RelayerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_proof_errors_are_terminal() {
        let err = RelayerError::from(ProofError::RootMismatch {
            hop: 0,
            requested: H256::repeat_byte(1),
            returned: H256::repeat_byte(2),
        });
        assert_eq!(err.disposition(), Disposition::Fail);
    }

    #[test]
    fn transient_errors_are_retried() {
        let fetch = RelayerError::from(ProofError::Fetch {
            path: "block_by_hash",
            source: ChainError::rpc("eth_getBlockByHash", "connection reset"),
        });
        assert_eq!(fetch.disposition(), Disposition::Retry);

        let timeout = RelayerError::from(GateError::Timeout {
            operation: "confirmations",
            seconds: 360,
        });
        assert_eq!(timeout.disposition(), Disposition::Retry);
    }

    #[test]
    fn missing_signal_is_terminal_only_on_the_source() {
        let missing = |hop| {
            RelayerError::from(ProofError::SignalMissing {
                hop,
                slot: H256::repeat_byte(1),
                block: H256::repeat_byte(2),
            })
        };
        assert_eq!(missing(0).disposition(), Disposition::Fail);
        assert_eq!(missing(1).disposition(), Disposition::Retry);
        assert_eq!(missing(2).disposition(), Disposition::Retry);
    }

    #[test]
    fn cancellation_is_its_own_disposition() {
        assert_eq!(
            RelayerError::from(GateError::Cancelled).disposition(),
            Disposition::Cancelled
        );
    }

    #[test]
    fn reverts_follow_reason_table() {
        let done = RelayerError::from(ChainError::Reverted(RevertReason::StatusMismatch));
        assert_eq!(done.disposition(), Disposition::Fail);
        let unknown = RelayerError::from(ChainError::Reverted(RevertReason::Unknown(
            "0xdeadbeef".into(),
        )));
        assert_eq!(unknown.disposition(), Disposition::Retry);
    }
}
