//! ethers-backed implementations of the chain capabilities, and the wiring
//! that turns a [`ProcessorConfig`] into a running [`Processor`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::contract::ContractError;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider, RpcError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{
    Address, Block, BlockId, BlockNumber, Bytes, H256, TransactionReceipt, TransactionRequest, U256,
};
use reqwest::{Client, Url};
use tracing::{debug, info, instrument};

use crate::bindings::{Bridge, TaikoL1, TaikoL2};
use crate::chain::{BlockSource, HeaderSyncer, SignalService, StorageProof, TransactionSender};
use crate::config::ProcessorConfig;
use crate::error::{ChainError, ConfigError};
use crate::gate::ConfirmationGate;
use crate::proof::{ProofBuilder, ProofLink};
use crate::queue::MessageQueue;
use crate::revert::RevertReason;
use crate::service::{Processor, ProcessorSettings};
use crate::store::EventStore;
use crate::types::{Message, OnChainStatus};

pub type HttpProvider = Provider<Http>;
pub type SignerClient = SignerMiddleware<Arc<HttpProvider>, LocalWallet>;

/// Builds an HTTP provider whose requests time out after `timeout`.
pub fn http_provider(url: &Url, timeout: Duration) -> Result<Arc<HttpProvider>, ConfigError> {
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ConfigError::InvalidRpcUrl {
            url: url.to_string(),
            reason: format!("failed to build HTTP client: {e}"),
        })?;
    let http = Http::new_with_client(url.clone(), client);
    Ok(Arc::new(Provider::new(http).interval(Duration::from_millis(100))))
}

fn contract_error<M: Middleware>(context: &'static str, err: ContractError<M>) -> ChainError {
    if let Some(data) = err.as_revert() {
        return ChainError::Reverted(RevertReason::decode(data));
    }
    let message = err.to_string();
    if message.contains("insufficient funds") {
        return ChainError::Reverted(RevertReason::InsufficientBalance);
    }
    ChainError::rpc(context, message)
}

/// Read-only client for one chain.
#[derive(Clone)]
pub struct EthClient {
    provider: Arc<HttpProvider>,
}

impl EthClient {
    /// Wraps a provider built by [`http_provider`].
    pub fn new(provider: Arc<HttpProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl BlockSource for EthClient {
    async fn block_by_number(&self, number: Option<u64>) -> Result<Option<Block<H256>>, ChainError> {
        let id: BlockId = match number {
            Some(n) => BlockNumber::Number(n.into()).into(),
            None => BlockNumber::Latest.into(),
        };
        self.provider
            .get_block(id)
            .await
            .map_err(|e| ChainError::rpc("eth_getBlockByNumber", e))
    }

    async fn block_by_hash(&self, hash: H256) -> Result<Option<Block<H256>>, ChainError> {
        self.provider
            .get_block(hash)
            .await
            .map_err(|e| ChainError::rpc("eth_getBlockByHash", e))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| ChainError::rpc("eth_blockNumber", e))
    }
}

/// Signed client for the destination bridge.
pub struct EthBridge {
    provider: Arc<HttpProvider>,
    contract: Bridge<SignerClient>,
}

impl EthBridge {
    /// Reads go through `provider`; `processMessage` is signed by `signer`.
    pub fn new(address: Address, provider: Arc<HttpProvider>, signer: Arc<SignerClient>) -> Self {
        Self {
            provider,
            contract: Bridge::new(address, signer),
        }
    }
}

#[async_trait]
impl TransactionSender for EthBridge {
    async fn gas_price(&self) -> Result<U256, ChainError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| ChainError::rpc("eth_gasPrice", e))
    }

    async fn estimate_process_message(
        &self,
        message: &Message,
        proof: &Bytes,
    ) -> Result<U256, ChainError> {
        self.contract
            .process_message(message.into(), proof.clone())
            .estimate_gas()
            .await
            .map_err(|e| contract_error("estimateGas processMessage", e))
    }

    async fn process_message(
        &self,
        message: &Message,
        proof: &Bytes,
        gas: U256,
    ) -> Result<H256, ChainError> {
        let call = self
            .contract
            .process_message(message.into(), proof.clone())
            .gas(gas);
        let pending = call
            .send()
            .await
            .map_err(|e| contract_error("processMessage", e))?;
        Ok(pending.tx_hash())
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ChainError> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| ChainError::rpc("eth_getTransactionReceipt", e))
    }

    #[instrument(skip(self))]
    async fn revert_reason(&self, tx_hash: H256) -> Result<RevertReason, ChainError> {
        let tx = self
            .provider
            .get_transaction(tx_hash)
            .await
            .map_err(|e| ChainError::rpc("eth_getTransactionByHash", e))?
            .ok_or(ChainError::Dropped(tx_hash))?;

        let mut request = TransactionRequest::new()
            .from(tx.from)
            .data(tx.input.clone())
            .value(tx.value)
            .gas(tx.gas);
        if let Some(to) = tx.to {
            request = request.to(to);
        }
        let block = tx.block_number.map(|n| BlockId::Number(BlockNumber::Number(n)));

        match self.provider.call(&request.into(), block).await {
            // the replay no longer reverts, so state moved on since the failure
            Ok(_) => Ok(RevertReason::Unknown("replay succeeded".into())),
            Err(err) => {
                let reason = match err.as_error_response().and_then(|e| e.as_revert_data()) {
                    Some(data) => RevertReason::decode(&data),
                    None => RevertReason::from_message(&err.to_string()),
                };
                debug!(%reason, "decoded revert reason");
                Ok(reason)
            }
        }
    }

    async fn message_status(&self, msg_hash: H256) -> Result<OnChainStatus, ChainError> {
        self.contract
            .get_message_status(msg_hash.0)
            .call()
            .await
            .map(OnChainStatus::from)
            .map_err(|e| contract_error("getMessageStatus", e))
    }
}

/// Header syncer contract. On an L1 it records L2 blocks; on an L2 it records
/// L1 blocks and exposes the latest synced height.
pub enum EthHeaderSyncer {
    L1(TaikoL1<HttpProvider>),
    L2(TaikoL2<HttpProvider>),
}

impl EthHeaderSyncer {
    /// `l2` selects the L2 flavour of the syncer contract.
    pub fn new(address: Address, provider: Arc<HttpProvider>, l2: bool) -> Self {
        if l2 {
            Self::L2(TaikoL2::new(address, provider))
        } else {
            Self::L1(TaikoL1::new(address, provider))
        }
    }
}

#[async_trait]
impl HeaderSyncer for EthHeaderSyncer {
    async fn synced_hash(&self, at: Option<H256>) -> Result<H256, ChainError> {
        let block = at.map(BlockId::Hash);
        let hash = match self {
            // block id zero reads the latest synced header
            Self::L1(contract) => {
                let mut call = contract.get_cross_chain_block_hash(U256::zero());
                if let Some(block) = block {
                    call = call.block(block);
                }
                call.call()
                    .await
                    .map_err(|e| contract_error("getCrossChainBlockHash", e))?
            }
            Self::L2(contract) => {
                let mut height = contract.latest_synced_l1_height();
                if let Some(block) = block {
                    height = height.block(block);
                }
                let height = height
                    .call()
                    .await
                    .map_err(|e| contract_error("latestSyncedL1Height", e))?;
                let mut call = contract.get_cross_chain_block_hash(height);
                if let Some(block) = block {
                    call = call.block(block);
                }
                call.call()
                    .await
                    .map_err(|e| contract_error("getCrossChainBlockHash", e))?
            }
        };
        Ok(H256(hash))
    }
}

/// Signal service read through `eth_getProof`.
pub struct EthSignalService {
    provider: Arc<HttpProvider>,
    address: Address,
}

impl EthSignalService {
    /// Signal service at `address` on the chain behind `provider`.
    pub fn new(address: Address, provider: Arc<HttpProvider>) -> Self {
        Self { provider, address }
    }
}

#[async_trait]
impl SignalService for EthSignalService {
    async fn signal_proof(&self, slot: H256, block_hash: H256) -> Result<StorageProof, ChainError> {
        let response = self
            .provider
            .get_proof(self.address, vec![slot], Some(BlockId::Hash(block_hash)))
            .await
            .map_err(|e| ChainError::rpc("eth_getProof", e))?;
        let (storage_proof, value) = response
            .storage_proof
            .into_iter()
            .next()
            .map(|p| (p.proof, p.value))
            .unwrap_or_default();
        Ok(StorageProof {
            storage_root: response.storage_hash,
            account_proof: response.account_proof,
            storage_proof,
            value,
        })
    }
}

/// Connects to every configured chain and assembles the processor.
///
/// Link `i` of the proof path starts on the source chain (`i == 0`) or hop
/// `i - 1`, and ends on hop `i` or, for the last link, the destination.
#[instrument(skip_all, fields(hops = config.hops.len()))]
pub async fn connect(
    config: &ProcessorConfig,
    store: Arc<dyn EventStore>,
    queue: Arc<dyn MessageQueue>,
) -> anyhow::Result<Processor> {
    let timeout = config.eth_client_timeout;
    let src = http_provider(&config.src_rpc_url, timeout)?;
    let dest = http_provider(&config.dest_rpc_url, timeout)?;
    let hops = config
        .hops
        .iter()
        .map(|hop| http_provider(&hop.rpc_url, timeout))
        .collect::<Result<Vec<_>, _>>()?;

    let dest_chain_id = dest.get_chainid().await?.as_u64();
    let wallet = config.signer.clone().with_chain_id(dest_chain_id);
    info!(dest_chain_id, processor = ?wallet.address(), "connected to destination chain");
    let signer = Arc::new(SignerMiddleware::new(dest.clone(), wallet));

    // chains and signal services a link starts from
    let starts = std::iter::once((src.clone(), config.src_signal_service))
        .chain(config.hops.iter().zip(&hops).map(|(hop, p)| (p.clone(), hop.signal_service)));
    // chains and syncers a link ends on
    let ends = config
        .hops
        .iter()
        .zip(&hops)
        .map(|(hop, p)| (p.clone(), hop.taiko_address, false))
        .chain(std::iter::once((dest.clone(), config.dest_taiko, config.enable_taiko_l2)));

    let links = starts
        .zip(ends)
        .map(|((chain, signal_service), (host, syncer_address, l2))| ProofLink {
            chain: Arc::new(EthClient::new(chain.clone())),
            signal_service: Arc::new(EthSignalService::new(signal_service, chain)),
            syncer: Arc::new(EthHeaderSyncer::new(syncer_address, host, l2)),
            syncer_address,
        })
        .collect();

    let settings = ProcessorSettings::from_config(config, dest_chain_id);
    let gate = ConfirmationGate::new(
        config.confirmations,
        config.header_sync_interval,
        config.confirmation_timeout,
    );
    Ok(Processor::new(
        settings,
        gate,
        store,
        queue,
        Arc::new(EthClient::new(src)),
        Arc::new(EthBridge::new(config.dest_bridge, dest, signer)),
        Arc::new(ProofBuilder::new(links)),
    ))
}
