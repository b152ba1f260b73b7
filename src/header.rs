use ethers::abi::Token;
use ethers::types::{Address, Block, Bytes, H256, U256};

use crate::error::ProofError;

/// Block header in the layout the destination contracts decode. The mapping
/// from an RPC block is mechanical and must stay bit-exact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub ommers_hash: H256,
    pub beneficiary: Address,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub logs_bloom: [H256; 8],
    pub difficulty: U256,
    pub height: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub mix_hash: H256,
    pub nonce: u64,
    pub base_fee_per_gas: U256,
    pub withdrawals_root: H256,
}

impl BlockHeader {
    /// Fails when the node left out a field the header needs.
    pub fn from_block(block: &Block<H256>) -> Result<Self, ProofError> {
        let height = block
            .number
            .ok_or(ProofError::MalformedHeader("block has no number"))?
            .as_u64();
        if block.hash.is_none() {
            return Err(ProofError::MalformedHeader("block has no hash"));
        }

        let mut logs_bloom = [H256::zero(); 8];
        if let Some(bloom) = block.logs_bloom {
            for (word, chunk) in logs_bloom.iter_mut().zip(bloom.as_bytes().chunks(32)) {
                *word = H256::from_slice(chunk);
            }
        }

        Ok(Self {
            parent_hash: block.parent_hash,
            ommers_hash: block.uncles_hash,
            beneficiary: block.author.unwrap_or_default(),
            state_root: block.state_root,
            transactions_root: block.transactions_root,
            receipts_root: block.receipts_root,
            logs_bloom,
            difficulty: block.difficulty,
            height,
            gas_limit: to_u64(block.gas_limit, "gas limit overflows u64")?,
            gas_used: to_u64(block.gas_used, "gas used overflows u64")?,
            timestamp: to_u64(block.timestamp, "timestamp overflows u64")?,
            extra_data: block.extra_data.clone(),
            mix_hash: block.mix_hash.unwrap_or_default(),
            nonce: block.nonce.map(|n| u64::from_be_bytes(n.0)).unwrap_or_default(),
            base_fee_per_gas: block.base_fee_per_gas.unwrap_or_default(),
            withdrawals_root: block.withdrawals_root.unwrap_or_default(),
        })
    }

    /// ABI tuple in field declaration order.
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::FixedBytes(self.parent_hash.as_bytes().to_vec()),
            Token::FixedBytes(self.ommers_hash.as_bytes().to_vec()),
            Token::Address(self.beneficiary),
            Token::FixedBytes(self.state_root.as_bytes().to_vec()),
            Token::FixedBytes(self.transactions_root.as_bytes().to_vec()),
            Token::FixedBytes(self.receipts_root.as_bytes().to_vec()),
            Token::FixedArray(
                self.logs_bloom
                    .iter()
                    .map(|w| Token::FixedBytes(w.as_bytes().to_vec()))
                    .collect(),
            ),
            Token::Uint(self.difficulty),
            Token::Uint(self.height.into()),
            Token::Uint(self.gas_limit.into()),
            Token::Uint(self.gas_used.into()),
            Token::Uint(self.timestamp.into()),
            Token::Bytes(self.extra_data.to_vec()),
            Token::FixedBytes(self.mix_hash.as_bytes().to_vec()),
            Token::Uint(self.nonce.into()),
            Token::Uint(self.base_fee_per_gas),
            Token::FixedBytes(self.withdrawals_root.as_bytes().to_vec()),
        ])
    }
}

fn to_u64(value: U256, what: &'static str) -> Result<u64, ProofError> {
    if value > U256::from(u64::MAX) {
        return Err(ProofError::MalformedHeader(what));
    }
    Ok(value.low_u64())
}
