//! In-memory fakes of the chain capabilities, shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ethers::types::{Address, Block, Bytes, H256, TransactionReceipt, U64, U256};

use crate::chain::{BlockSource, HeaderSyncer, SignalService, StorageProof, TransactionSender};
use crate::error::{ChainError, StoreError};
use crate::revert::RevertReason;
use crate::store::{EventStore, InMemoryStore};
use crate::types::{EventId, EventRecord, Message, MessageEvent, OnChainStatus};

pub const DEST_CHAIN_ID: u64 = 167;

pub fn sample_event(block_number: u64) -> MessageEvent {
    MessageEvent {
        id: EventId::new(H256::repeat_byte(0x42), 3),
        message: Message {
            id: U256::from(9),
            from: Address::repeat_byte(0x01),
            src_chain_id: 1,
            dest_chain_id: DEST_CHAIN_ID,
            owner: Address::repeat_byte(0x02),
            to: Address::repeat_byte(0x03),
            refund_to: Address::repeat_byte(0x02),
            value: U256::from(1_000),
            fee: U256::from(1_000_000),
            gas_limit: U256::from(500_000),
            data: Bytes::default(),
            memo: String::new(),
        },
        msg_hash: H256::repeat_byte(0x99),
        emitter: Address::repeat_byte(0xb0),
        block_number,
        block_hash: FakeChain::hash_of(block_number),
    }
}

#[derive(Default)]
pub struct FakeChain {
    blocks: Mutex<BTreeMap<u64, Block<H256>>>,
    corrupted: Mutex<HashSet<u64>>,
    fail: AtomicBool,
}

impl FakeChain {
    pub fn with_blocks(range: RangeInclusive<u64>) -> Arc<Self> {
        let chain = Self::default();
        {
            let mut blocks = chain.blocks.lock().unwrap();
            for n in range {
                blocks.insert(n, Self::block(n));
            }
        }
        Arc::new(chain)
    }

    pub fn hash_of(number: u64) -> H256 {
        H256::from_low_u64_be(number + 1)
    }

    /// Inverse of [`FakeChain::hash_of`].
    pub fn number_of(hash: H256) -> u64 {
        hash.to_low_u64_be().saturating_sub(1)
    }

    fn block(number: u64) -> Block<H256> {
        Block {
            hash: Some(Self::hash_of(number)),
            parent_hash: Self::hash_of(number.saturating_sub(1)),
            number: Some(U64::from(number)),
            timestamp: U256::from(1_700_000_000 + number * 12),
            gas_limit: U256::from(30_000_000),
            ..Default::default()
        }
    }

    /// Mines blocks up to and including `number`.
    pub fn advance_to(&self, number: u64) {
        let mut blocks = self.blocks.lock().unwrap();
        let start = blocks.keys().next_back().map(|n| n + 1).unwrap_or_default();
        for n in start..=number {
            blocks.insert(n, Self::block(n));
        }
    }

    /// Makes the node answer `block_by_hash(hash_of(number))` with a block whose
    /// hash differs from the one requested.
    pub fn corrupt_hash(&self, number: u64) {
        self.corrupted.lock().unwrap().insert(number);
    }

    pub fn fail_rpc(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self, context: &'static str) -> Result<(), ChainError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChainError::rpc(context, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlockSource for FakeChain {
    async fn block_by_number(&self, number: Option<u64>) -> Result<Option<Block<H256>>, ChainError> {
        self.check("eth_getBlockByNumber")?;
        let blocks = self.blocks.lock().unwrap();
        Ok(match number {
            Some(n) => blocks.get(&n).cloned(),
            None => blocks.values().next_back().cloned(),
        })
    }

    async fn block_by_hash(&self, hash: H256) -> Result<Option<Block<H256>>, ChainError> {
        self.check("eth_getBlockByHash")?;
        let blocks = self.blocks.lock().unwrap();
        let corrupted = self.corrupted.lock().unwrap();
        Ok(blocks
            .values()
            .find(|b| b.hash == Some(hash))
            .cloned()
            .map(|mut block| {
                let number = block.number.unwrap_or_default().as_u64();
                if corrupted.contains(&number) {
                    block.hash = Some(H256::repeat_byte(0xee));
                }
                block
            }))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.check("eth_blockNumber")?;
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default())
    }
}

/// Syncer whose state is keyed by the block number of its host chain.
pub struct FakeSyncer {
    history: Mutex<BTreeMap<u64, H256>>,
}

impl FakeSyncer {
    pub fn new(hash: H256) -> Arc<Self> {
        Arc::new(Self {
            history: Mutex::new(BTreeMap::from([(0, hash)])),
        })
    }

    /// Replaces the whole history with `hash`.
    pub fn set(&self, hash: H256) {
        *self.history.lock().unwrap() = BTreeMap::from([(0, hash)]);
    }

    /// Syncs `hash` at host block `host_block`; earlier host blocks keep
    /// seeing the previous value.
    pub fn record(&self, host_block: u64, hash: H256) {
        self.history.lock().unwrap().insert(host_block, hash);
    }
}

#[async_trait]
impl HeaderSyncer for FakeSyncer {
    async fn synced_hash(&self, at: Option<H256>) -> Result<H256, ChainError> {
        let history = self.history.lock().unwrap();
        let found = match at {
            Some(hash) => history.range(..=FakeChain::number_of(hash)).next_back(),
            None => history.iter().next_back(),
        };
        Ok(found.map(|(_, hash)| *hash).unwrap_or_default())
    }
}

/// Signal service whose slots take effect from a given block number onward.
#[derive(Default)]
pub struct FakeSignalService {
    values: Mutex<HashMap<H256, BTreeMap<u64, U256>>>,
    failure: Mutex<Option<ChainError>>,
}

impl FakeSignalService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets `slot` at every block.
    pub fn set(&self, slot: H256, value: U256) {
        self.set_from(slot, 0, value);
    }

    pub fn set_from(&self, slot: H256, block: u64, value: U256) {
        self.values
            .lock()
            .unwrap()
            .entry(slot)
            .or_default()
            .insert(block, value);
    }

    pub fn fail_with(&self, err: ChainError) {
        *self.failure.lock().unwrap() = Some(err);
    }
}

#[async_trait]
impl SignalService for FakeSignalService {
    async fn signal_proof(&self, slot: H256, block_hash: H256) -> Result<StorageProof, ChainError> {
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        let value = self
            .values
            .lock()
            .unwrap()
            .get(&slot)
            .and_then(|history| history.range(..=FakeChain::number_of(block_hash)).next_back())
            .map(|(_, value)| *value)
            .unwrap_or_default();
        Ok(StorageProof {
            storage_root: block_hash,
            account_proof: vec![Bytes::from(vec![0x01])],
            storage_proof: vec![Bytes::from(slot.as_bytes().to_vec())],
            value,
        })
    }
}

/// What the fake destination does with a `processMessage` transaction.
#[derive(Debug, Clone)]
pub enum Submission {
    /// Mined with status 1.
    Succeed,
    /// Mined with status 0, reverting with the given reason.
    Revert(RevertReason),
    /// Rejected before broadcast.
    Reject(ChainError),
    /// Broadcast but never mined.
    Hang,
}

pub struct FakeBridge {
    pub gas_price: Mutex<U256>,
    pub gas_estimate: Mutex<U256>,
    pub on_chain: Mutex<OnChainStatus>,
    pub behaviour: Mutex<Submission>,
    pub submissions: Mutex<Vec<(Message, Bytes, U256)>>,
    receipts: Mutex<HashMap<H256, TransactionReceipt>>,
    reverts: Mutex<HashMap<H256, RevertReason>>,
}

impl FakeBridge {
    pub fn new(behaviour: Submission) -> Arc<Self> {
        Arc::new(Self {
            gas_price: Mutex::new(U256::from(1)),
            gas_estimate: Mutex::new(U256::from(100_000)),
            on_chain: Mutex::new(OnChainStatus::New),
            behaviour: Mutex::new(behaviour),
            submissions: Mutex::new(Vec::new()),
            receipts: Mutex::new(HashMap::new()),
            reverts: Mutex::new(HashMap::new()),
        })
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    pub fn set_behaviour(&self, behaviour: Submission) {
        *self.behaviour.lock().unwrap() = behaviour;
    }
}

#[async_trait]
impl TransactionSender for FakeBridge {
    async fn gas_price(&self) -> Result<U256, ChainError> {
        Ok(*self.gas_price.lock().unwrap())
    }

    async fn estimate_process_message(
        &self,
        _message: &Message,
        _proof: &Bytes,
    ) -> Result<U256, ChainError> {
        Ok(*self.gas_estimate.lock().unwrap())
    }

    async fn process_message(
        &self,
        message: &Message,
        proof: &Bytes,
        gas: U256,
    ) -> Result<H256, ChainError> {
        let behaviour = self.behaviour.lock().unwrap().clone();
        if let Submission::Reject(err) = behaviour {
            return Err(err);
        }
        let mut submissions = self.submissions.lock().unwrap();
        submissions.push((message.clone(), proof.clone(), gas));
        let tx_hash = H256::from_low_u64_be(submissions.len() as u64);

        let status = match behaviour {
            Submission::Succeed => Some(1u64),
            Submission::Revert(reason) => {
                self.reverts.lock().unwrap().insert(tx_hash, reason);
                Some(0)
            }
            Submission::Reject(_) | Submission::Hang => None,
        };
        if let Some(status) = status {
            let receipt = TransactionReceipt {
                transaction_hash: tx_hash,
                status: Some(U64::from(status)),
                ..Default::default()
            };
            self.receipts.lock().unwrap().insert(tx_hash, receipt);
        }
        Ok(tx_hash)
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ChainError> {
        Ok(self.receipts.lock().unwrap().get(&tx_hash).cloned())
    }

    async fn revert_reason(&self, tx_hash: H256) -> Result<RevertReason, ChainError> {
        Ok(self
            .reverts
            .lock()
            .unwrap()
            .get(&tx_hash)
            .cloned()
            .unwrap_or(RevertReason::Unknown("0x".into())))
    }

    async fn message_status(&self, _msg_hash: H256) -> Result<OnChainStatus, ChainError> {
        Ok(*self.on_chain.lock().unwrap())
    }
}

/// Store whose reads and writes can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: InMemoryStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            ..Default::default()
        })
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn get(&self, id: &EventId) -> Result<Option<EventRecord>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("read refused".into()));
        }
        self.inner.get(id).await
    }

    async fn save(&self, record: EventRecord) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write refused".into()));
        }
        self.inner.save(record).await
    }
}
