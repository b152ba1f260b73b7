//! Decoding of destination bridge revert data into a [`RevertReason`], and the
//! table deciding which reverts are worth retrying.

use std::fmt;

use ethers::abi::{self, ParamType, Token};
use ethers::utils::{hex, id};

/// Selector of Solidity's `Error(string)`.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Custom errors the bridge reverts with, by signature.
const CUSTOM_ERRORS: &[(&str, RevertReason)] = &[
    ("B_STATUS_MISMATCH()", RevertReason::StatusMismatch),
    ("B_INSUFFICIENT_BALANCE()", RevertReason::InsufficientBalance),
    ("B_FORBIDDEN()", RevertReason::Forbidden),
    ("B_NON_RETRIABLE()", RevertReason::Forbidden),
    ("B_SIGNAL_NOT_RECEIVED()", RevertReason::SignalNotReceived),
    ("B_INVALID_PROOF()", RevertReason::SignalNotReceived),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertReason {
    /// The message was already processed (or failed) on the destination chain.
    StatusMismatch,
    /// The bridge or the relayer could not cover the transfer when it was sent.
    InsufficientBalance,
    /// The caller may not process this message.
    Forbidden,
    /// The destination does not (yet) accept the proof.
    SignalNotReceived,
    /// An `Error(string)` that matched nothing known.
    Message(String),
    /// Undecodable revert data, hex encoded.
    Unknown(String),
}

impl RevertReason {
    /// Decodes revert data returned by the node.
    pub fn decode(data: &[u8]) -> Self {
        if data.len() < 4 {
            return Self::Unknown(format!("0x{}", hex::encode(data)));
        }
        let (selector, payload) = data.split_at(4);

        if selector == ERROR_STRING_SELECTOR {
            if let Ok(tokens) = abi::decode(&[ParamType::String], payload) {
                if let Some(Token::String(message)) = tokens.into_iter().next() {
                    return Self::from_message(&message);
                }
            }
        }

        CUSTOM_ERRORS
            .iter()
            .find(|(signature, _)| id(signature) == selector)
            .map(|(_, reason)| reason.clone())
            .unwrap_or_else(|| Self::Unknown(format!("0x{}", hex::encode(data))))
    }

    /// Classifies a textual reason, as found in `Error(string)` payloads and node
    /// error messages.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("already processed") || lower.contains("b_status_mismatch") {
            Self::StatusMismatch
        } else if lower.contains("insufficient balance")
            || lower.contains("insufficient funds")
            || lower.contains("b_insufficient_balance")
        {
            Self::InsufficientBalance
        } else if lower.contains("b_forbidden") || lower.contains("b_non_retriable") {
            Self::Forbidden
        } else if lower.contains("b_signal_not_received") || lower.contains("b_invalid_proof") {
            Self::SignalNotReceived
        } else {
            Self::Message(message.to_string())
        }
    }

    /// Terminal reasons fail the event immediately. Everything else, including
    /// reasons we cannot decode, is retried until the retry budget runs out.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::StatusMismatch | Self::InsufficientBalance | Self::Forbidden
        )
    }
}

impl fmt::Display for RevertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusMismatch => f.write_str("message already processed"),
            Self::InsufficientBalance => f.write_str("insufficient balance"),
            Self::Forbidden => f.write_str("forbidden"),
            Self::SignalNotReceived => f.write_str("signal not received"),
            Self::Message(m) => f.write_str(m),
            Self::Unknown(data) => write!(f, "unknown revert {data}"),
        }
    }
}
