use ethers::types::{Bytes, U256};
use tracing::debug;

use crate::chain::TransactionSender;
use crate::error::ChainError;
use crate::types::Message;

/// Cost of processing a message on the destination chain against the fee it pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    /// Estimated gas of `processMessage`.
    pub gas: U256,
    /// Destination gas price at estimation time.
    pub gas_price: U256,
    /// `gas * gas_price`.
    pub cost: U256,
    /// Fee the message pays the processor.
    pub fee: U256,
}

impl Estimate {
    /// Cost is `gas * gas_price`, saturating.
    pub fn new(gas: U256, gas_price: U256, fee: U256) -> Self {
        Self {
            gas,
            gas_price,
            cost: gas.saturating_mul(gas_price),
            fee,
        }
    }

    /// Whether the fee covers the cost. Breaking even counts.
    pub fn is_profitable(&self) -> bool {
        self.cost <= self.fee
    }
}

/// Gas limit to submit with: the estimate plus a 20% margin.
pub fn gas_with_margin(estimate: U256) -> U256 {
    estimate.saturating_add(estimate / 5)
}

/// Prices a `processMessage` call with the proof attached. Larger proofs cost
/// more gas, so this has to run after proof generation and is never cached.
pub async fn estimate(
    sender: &dyn TransactionSender,
    message: &Message,
    proof: &Bytes,
) -> Result<Estimate, ChainError> {
    let gas_price = sender.gas_price().await?;
    let gas = sender.estimate_process_message(message, proof).await?;
    let estimate = Estimate::new(gas, gas_price, message.fee);
    debug!(
        gas = %estimate.gas,
        gas_price = %estimate.gas_price,
        cost = %estimate.cost,
        fee = %estimate.fee,
        "estimated processing cost"
    );
    Ok(estimate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeBridge, Submission, sample_event};

    #[test]
    fn profitable_when_fee_covers_cost() {
        let e = Estimate::new(U256::from(100_000), U256::from(10), U256::from(1_000_000));
        assert!(e.is_profitable());
        let e = Estimate::new(U256::from(100_000), U256::from(11), U256::from(1_000_000));
        assert!(!e.is_profitable());
    }

    #[test]
    fn cost_saturates() {
        let e = Estimate::new(U256::MAX, U256::from(2), U256::MAX);
        assert_eq!(e.cost, U256::MAX);
    }

    #[test]
    fn margin_is_a_fifth() {
        assert_eq!(gas_with_margin(U256::from(100_000)), U256::from(120_000));
    }

    #[tokio::test]
    async fn estimate_reads_fresh_gas_price() {
        let bridge = FakeBridge::new(Submission::Succeed);
        let event = sample_event(100);
        let proof = Bytes::from(vec![1, 2, 3]);

        let first = estimate(bridge.as_ref(), &event.message, &proof).await.unwrap();
        assert!(first.is_profitable());

        *bridge.gas_price.lock().unwrap() = U256::from(1_000);
        let second = estimate(bridge.as_ref(), &event.message, &proof).await.unwrap();
        assert_eq!(second.cost, U256::from(100_000_000));
        assert!(!second.is_profitable());
    }
}
