pub mod bindings;
pub mod chain;
pub mod config;
pub mod error;
pub mod ethereum;
pub mod gate;
pub mod header;
pub mod lock;
pub mod profit;
pub mod proof;
pub mod queue;
pub mod revert;
pub mod service;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use config::{ProcessorArgs, ProcessorConfig};
pub use error::*;
pub use ethereum::connect;
pub use queue::{InMemoryQueue, MessageQueue};
pub use service::{Outcome, Processor, ProcessorSettings};
pub use store::{EventStore, InMemoryStore};
pub use types::*;
