//! Signal proof construction, from the source chain through any number of
//! intermediary chains to the destination.

use std::sync::Arc;

use ethers::abi::{self, Token};
use ethers::types::{Address, Bytes, H256};
use ethers::utils::keccak256;
use tracing::debug;

use crate::chain::{BlockSource, HeaderSyncer, SignalService, StorageProof};
use crate::error::ProofError;
use crate::header::BlockHeader;
use crate::types::MessageEvent;

/// Storage slot the signal service uses for `signal` sent by `app`.
pub fn signal_slot(app: Address, signal: H256) -> H256 {
    let mut packed = Vec::with_capacity(20 + 32);
    packed.extend_from_slice(app.as_bytes());
    packed.extend_from_slice(signal.as_bytes());
    H256(keccak256(packed))
}

/// One step of the path a signal travels. The first link starts on the source
/// chain; link `i` starts on hop chain `i - 1`. Each link ends on the chain that
/// hosts `syncer`, which is the next hop or the destination, so the chain of
/// link `i + 1` is the host of link `i`'s syncer.
#[derive(Clone)]
pub struct ProofLink {
    /// Client for the chain the link starts on.
    pub chain: Arc<dyn BlockSource>,
    /// Signal service on the chain the link starts on.
    pub signal_service: Arc<dyn SignalService>,
    /// Header syncer on the chain the link ends on.
    pub syncer: Arc<dyn HeaderSyncer>,
    /// Address of `syncer`. It is the app that relays synced block hashes as
    /// signals on its chain, so the next link proves a slot keyed by it.
    pub syncer_address: Address,
}

/// A header and the storage proof checked against its state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofSegment {
    /// Block the storage proof is taken at.
    pub block_hash: H256,
    pub header: BlockHeader,
    /// Signal service slot being proven.
    pub slot: H256,
    pub storage_proof: StorageProof,
}

impl ProofSegment {
    fn to_token(&self) -> Token {
        Token::Tuple(vec![
            self.header.to_token(),
            Token::Bytes(abi::encode(&[
                Token::Array(
                    self.storage_proof
                        .account_proof
                        .iter()
                        .map(|node| Token::Bytes(node.to_vec()))
                        .collect(),
                ),
                Token::Array(
                    self.storage_proof
                        .storage_proof
                        .iter()
                        .map(|node| Token::Bytes(node.to_vec()))
                        .collect(),
                ),
            ])),
        ])
    }
}

/// Proof that a message hash was signalled on the source chain, as seen from
/// the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalProof {
    /// Segment proving the message hash on the source chain.
    pub source: ProofSegment,
    /// One segment per intermediary chain, in configured order.
    pub hops: Vec<ProofSegment>,
}

impl SignalProof {
    /// Number of segments, source included.
    pub fn segment_count(&self) -> usize {
        1 + self.hops.len()
    }

    /// ABI encoding handed to `processMessage`.
    pub fn encode(&self) -> Bytes {
        abi::encode(&[
            self.source.to_token(),
            Token::Array(self.hops.iter().map(ProofSegment::to_token).collect()),
        ])
        .into()
    }
}

/// Builds signal proofs along a fixed path of links.
pub struct ProofBuilder {
    links: Vec<ProofLink>,
}

impl ProofBuilder {
    /// `links` must hold the source link first, then one link per hop chain.
    pub fn new(links: Vec<ProofLink>) -> Self {
        Self { links }
    }

    /// The configured path, source link first.
    pub fn links(&self) -> &[ProofLink] {
        &self.links
    }

    /// Block of each link's starting chain that the proof is anchored at,
    /// source first.
    ///
    /// Resolved from the destination backward: the destination's latest
    /// synced hop block, then each earlier syncer's state read at the block
    /// chosen for its host. Every block in the path is therefore known to the
    /// next chain, even while hop chains keep syncing past it.
    pub async fn synced_path(links: &[ProofLink]) -> Result<Vec<H256>, ProofError> {
        let mut path = vec![H256::zero(); links.len()];
        let mut at = None;
        for (hop, link) in links.iter().enumerate().rev() {
            let synced = link
                .syncer
                .synced_hash(at)
                .await
                .map_err(|source| ProofError::Fetch {
                    path: "synced_hash",
                    source,
                })?;
            if synced.is_zero() {
                return Err(ProofError::NotSynced { hop });
            }
            path[hop] = synced;
            at = Some(synced);
        }
        Ok(path)
    }

    /// Fetches a block and converts it into a [`BlockHeader`]. A zero hash
    /// selects the latest block.
    pub async fn block_header(
        chain: &dyn BlockSource,
        hash: H256,
    ) -> Result<(H256, BlockHeader), ProofError> {
        let block = if hash.is_zero() {
            chain
                .block_by_number(None)
                .await
                .map_err(|source| ProofError::Fetch {
                    path: "block_by_number",
                    source,
                })?
        } else {
            chain
                .block_by_hash(hash)
                .await
                .map_err(|source| ProofError::Fetch {
                    path: "block_by_hash",
                    source,
                })?
        };
        let block = block.ok_or(ProofError::BlockNotFound(hash))?;
        let header = BlockHeader::from_block(&block)?;
        Ok((block.hash.unwrap_or_default(), header))
    }

    /// Proves the event's signal at the anchored source block, then each
    /// synced block hash at the anchored hop block.
    #[tracing::instrument(skip_all, fields(event = %event.id))]
    pub async fn build(&self, event: &MessageEvent) -> Result<SignalProof, ProofError> {
        let path = Self::synced_path(&self.links).await?;
        let mut slot = signal_slot(event.emitter, event.msg_hash);
        let mut segments = Vec::with_capacity(self.links.len());

        for (hop, (link, synced)) in self.links.iter().zip(path).enumerate() {
            let (returned, header) = Self::block_header(link.chain.as_ref(), synced).await?;
            if returned != synced {
                return Err(ProofError::RootMismatch {
                    hop,
                    requested: synced,
                    returned,
                });
            }
            if hop == 0 && header.height < event.block_number {
                return Err(ProofError::Behind {
                    hop,
                    synced: header.height,
                    required: event.block_number,
                });
            }

            let storage_proof = link
                .signal_service
                .signal_proof(slot, synced)
                .await
                .map_err(|source| ProofError::Fetch {
                    path: "signal_proof",
                    source,
                })?;
            if storage_proof.value.is_zero() {
                return Err(ProofError::SignalMissing {
                    hop,
                    slot,
                    block: synced,
                });
            }
            debug!(hop, block = header.height, slot = ?slot, "built proof segment");

            segments.push(ProofSegment {
                block_hash: synced,
                header,
                slot,
                storage_proof,
            });
            slot = signal_slot(link.syncer_address, synced);
        }

        let mut segments = segments.into_iter();
        let source = segments
            .next()
            .ok_or(ProofError::MalformedHeader("no proof links configured"))?;
        Ok(SignalProof {
            source,
            hops: segments.collect(),
        })
    }
}
