use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Unique identity of a message event: the source transaction and the log index
/// the `MessageSent` event was emitted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventId {
    pub tx_hash: H256,
    pub log_index: u64,
}

impl EventId {
    /// Id of the log at `log_index` in transaction `tx_hash`.
    pub fn new(tx_hash: H256, log_index: u64) -> Self {
        Self { tx_hash, log_index }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}:{}", self.tx_hash, self.log_index)
    }
}

/// Bridge message as emitted on the source chain and consumed by
/// `processMessage` on the destination chain.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: U256,
    pub from: Address,
    pub src_chain_id: u64,
    pub dest_chain_id: u64,
    pub owner: Address,
    pub to: Address,
    pub refund_to: Address,
    pub value: U256,
    /// Processing fee the sender pays whoever relays the message.
    pub fee: U256,
    pub gas_limit: U256,
    pub data: Bytes,
    #[serde(default)]
    pub memo: String,
}

/// A `MessageSent` event discovered on the source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub id: EventId,
    pub message: Message,
    /// Hash of the message, which is the signal recorded by the source signal service.
    pub msg_hash: H256,
    /// Contract that sent the signal (the source bridge).
    pub emitter: Address,
    pub block_number: u64,
    pub block_hash: H256,
}

/// Persisted processing status of a message event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Discovered, never attempted.
    New,
    /// At least one attempt failed with a recoverable error.
    Retriable,
    /// Processed on the destination chain.
    Done,
    /// Gave up; never retried again.
    Failed,
}

impl MessageStatus {
    /// `Done` and `Failed` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// `New` and `Retriable` may move anywhere but back to `New`; `Done` and
    /// `Failed` are sinks.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        match self {
            Self::New | Self::Retriable => next != Self::New,
            Self::Done | Self::Failed => false,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Retriable => "RETRIABLE",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Status the destination bridge reports for a message hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnChainStatus {
    New,
    Retriable,
    Done,
    Failed,
}

impl From<u8> for OnChainStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Retriable,
            2 => Self::Done,
            3 => Self::Failed,
            _ => Self::New,
        }
    }
}

/// Stored state of a message event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event: MessageEvent,
    pub status: MessageStatus,
    /// Number of failed processing attempts so far.
    pub attempts: u32,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
    pub last_error: Option<String>,
}

impl EventRecord {
    /// Fresh record in `New` with no attempts.
    pub fn new(event: MessageEvent) -> Self {
        Self {
            event,
            status: MessageStatus::New,
            attempts: 0,
            updated_at: unix_now(),
            last_error: None,
        }
    }

    /// Id of the underlying event.
    pub fn id(&self) -> EventId {
        self.event.id
    }
}

/// What a message delivers, judged by its recipient on the destination chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Erc20,
    Erc721,
    Erc1155,
    /// Ether or an arbitrary contract call.
    Call,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Erc20 => "erc20",
            Self::Erc721 => "erc721",
            Self::Erc1155 => "erc1155",
            Self::Call => "call",
        };
        f.write_str(s)
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sinks_never_transition() {
        use MessageStatus::*;
        for from in [Done, Failed] {
            for to in [New, Retriable, Done, Failed] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
        for from in [New, Retriable] {
            assert!(!from.can_transition_to(New));
            assert!(from.can_transition_to(Retriable));
            assert!(from.can_transition_to(Done));
            assert!(from.can_transition_to(Failed));
        }
    }

    #[test]
    fn event_id_display() {
        let id = EventId::new(H256::repeat_byte(0xab), 7);
        assert_eq!(id.to_string(), format!("0x{}:7", "ab".repeat(32)));
    }

    #[test]
    fn status_serializes_screaming() {
        let json = serde_json::to_string(&MessageStatus::Retriable).unwrap();
        assert_eq!(json, "\"RETRIABLE\"");
    }
}
