//! Processor configuration, read from command-line flags with environment
//! variable fallbacks.

use std::time::Duration;

use clap::Parser;
use ethers::signers::LocalWallet;
use ethers::types::Address;
use reqwest::Url;

use crate::error::ConfigError;
use crate::types::MessageKind;

/// Raw processor flags. Not `Debug`: it carries the signing key.
#[derive(Parser, Clone)]
#[command(name = "signal-relayer", about = "Relays bridge messages to their destination chain")]
pub struct ProcessorArgs {
    /// Hex private key of the account that submits `processMessage`.
    #[arg(long = "processor-private-key", env = "PROCESSOR_PRIVATE_KEY", hide_env_values = true)]
    pub processor_private_key: String,

    #[arg(long = "src-rpc-url", env = "SRC_RPC_URL")]
    pub src_rpc_url: String,

    #[arg(long = "dest-rpc-url", env = "DEST_RPC_URL")]
    pub dest_rpc_url: String,

    #[arg(long = "src-signal-service-address", env = "SRC_SIGNAL_SERVICE_ADDRESS")]
    pub src_signal_service_address: Address,

    #[arg(long = "dest-bridge-address", env = "DEST_BRIDGE_ADDRESS")]
    pub dest_bridge_address: Address,

    /// Header syncer on the destination chain.
    #[arg(long = "dest-taiko-address", env = "DEST_TAIKO_ADDRESS")]
    pub dest_taiko_address: Address,

    #[arg(long = "dest-erc20-vault-address", env = "DEST_ERC20_VAULT_ADDRESS")]
    pub dest_erc20_vault_address: Address,

    #[arg(long = "dest-erc721-address", env = "DEST_ERC721_VAULT_ADDRESS")]
    pub dest_erc721_address: Address,

    #[arg(long = "dest-erc1155-address", env = "DEST_ERC1155_VAULT_ADDRESS")]
    pub dest_erc1155_address: Address,

    /// Seconds between polls while waiting on chain state.
    #[arg(long = "header-sync-interval", env = "HEADER_SYNC_INTERVAL_IN_SECONDS", default_value_t = 10)]
    pub header_sync_interval: u64,

    #[arg(long = "confirmations", env = "CONFIRMATIONS_BEFORE_PROCESSING", default_value_t = 3)]
    pub confirmations: u64,

    /// Seconds to wait for confirmations, header sync or a receipt.
    #[arg(long = "confirmation-timeout", env = "CONFIRMATIONS_TIMEOUT_IN_SECONDS", default_value_t = 360)]
    pub confirmation_timeout: u64,

    /// Skip messages whose fee does not cover the processing cost.
    #[arg(long = "profitable-only", env = "PROFITABLE_ONLY")]
    pub profitable_only: bool,

    #[arg(long = "backoff.retry-interval", env = "BACKOFF_RETRY_INTERVAL", default_value_t = 12)]
    pub backoff_retry_interval: u64,

    #[arg(long = "backoff.max-retries", env = "BACKOFF_MAX_RETRIES", default_value_t = 3)]
    pub backoff_max_retries: u32,

    #[arg(long = "queue.prefetch", env = "QUEUE_PREFETCH_COUNT", default_value_t = 1)]
    pub queue_prefetch: usize,

    /// Read the destination header syncer as an L2 anchor contract.
    #[arg(long = "enable-taiko-l2", env = "ENABLE_TAIKO_L2")]
    pub enable_taiko_l2: bool,

    /// Per-request timeout of every RPC client, in seconds.
    #[arg(long = "eth-client-timeout", env = "ETH_CLIENT_TIMEOUT", default_value_t = 10)]
    pub eth_client_timeout: u64,

    #[arg(
        long = "hop-signal-service-addresses",
        env = "HOP_SIGNAL_SERVICE_ADDRESSES",
        value_delimiter = ','
    )]
    pub hop_signal_service_addresses: Vec<Address>,

    #[arg(long = "hop-taiko-addresses", env = "HOP_TAIKO_ADDRESSES", value_delimiter = ',')]
    pub hop_taiko_addresses: Vec<Address>,

    #[arg(long = "hop-rpc-urls", env = "HOP_RPC_URLS", value_delimiter = ',')]
    pub hop_rpc_urls: Vec<String>,
}

/// An intermediary chain between source and destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopConfig {
    /// Signal service on the hop chain.
    pub signal_service: Address,
    /// Header syncer on the hop chain, recording the previous chain's blocks.
    pub taiko_address: Address,
    pub rpc_url: Url,
}

/// Token vaults on the destination chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vaults {
    pub erc20: Address,
    pub erc721: Address,
    pub erc1155: Address,
}

impl Vaults {
    /// Kind of transfer a message to `to` carries.
    pub fn kind_of(&self, to: Address) -> MessageKind {
        if to == self.erc20 {
            MessageKind::Erc20
        } else if to == self.erc721 {
            MessageKind::Erc721
        } else if to == self.erc1155 {
            MessageKind::Erc1155
        } else {
            MessageKind::Call
        }
    }
}

/// Validated processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub signer: LocalWallet,
    pub src_rpc_url: Url,
    pub dest_rpc_url: Url,
    pub src_signal_service: Address,
    pub dest_bridge: Address,
    pub dest_taiko: Address,
    pub vaults: Vaults,
    pub header_sync_interval: Duration,
    pub confirmations: u64,
    pub confirmation_timeout: Duration,
    pub profitable_only: bool,
    pub backoff_retry_interval: Duration,
    pub backoff_max_retries: u32,
    pub queue_prefetch: usize,
    pub enable_taiko_l2: bool,
    pub eth_client_timeout: Duration,
    /// Intermediary chains in the order a signal crosses them.
    pub hops: Vec<HopConfig>,
}

impl TryFrom<ProcessorArgs> for ProcessorConfig {
    type Error = ConfigError;

    fn try_from(args: ProcessorArgs) -> Result<Self, Self::Error> {
        let hop_count = args.hop_signal_service_addresses.len();
        if args.hop_taiko_addresses.len() != hop_count || args.hop_rpc_urls.len() != hop_count {
            return Err(ConfigError::HopListMismatch {
                signal_services: hop_count,
                taiko_addresses: args.hop_taiko_addresses.len(),
                rpc_urls: args.hop_rpc_urls.len(),
            });
        }

        let signer: LocalWallet = args
            .processor_private_key
            .parse()
            .map_err(|e: ethers::signers::WalletError| ConfigError::PrivateKey(e.to_string()))?;

        for (name, address) in [
            ("src signal service address", args.src_signal_service_address),
            ("dest bridge address", args.dest_bridge_address),
            ("dest taiko address", args.dest_taiko_address),
            ("dest erc20 vault address", args.dest_erc20_vault_address),
            ("dest erc721 vault address", args.dest_erc721_address),
            ("dest erc1155 vault address", args.dest_erc1155_address),
        ] {
            non_zero(name, address)?;
        }
        for (name, value) in [
            ("header sync interval", args.header_sync_interval),
            ("confirmation timeout", args.confirmation_timeout),
            ("backoff retry interval", args.backoff_retry_interval),
            ("eth client timeout", args.eth_client_timeout),
            ("queue prefetch", args.queue_prefetch as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::NonPositive(name));
            }
        }

        let hops = args
            .hop_signal_service_addresses
            .into_iter()
            .zip(args.hop_taiko_addresses)
            .zip(args.hop_rpc_urls)
            .map(|((signal_service, taiko_address), url)| {
                non_zero("hop signal service address", signal_service)?;
                non_zero("hop taiko address", taiko_address)?;
                Ok(HopConfig {
                    signal_service,
                    taiko_address,
                    rpc_url: rpc_url(&url)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            signer,
            src_rpc_url: rpc_url(&args.src_rpc_url)?,
            dest_rpc_url: rpc_url(&args.dest_rpc_url)?,
            src_signal_service: args.src_signal_service_address,
            dest_bridge: args.dest_bridge_address,
            dest_taiko: args.dest_taiko_address,
            vaults: Vaults {
                erc20: args.dest_erc20_vault_address,
                erc721: args.dest_erc721_address,
                erc1155: args.dest_erc1155_address,
            },
            header_sync_interval: Duration::from_secs(args.header_sync_interval),
            confirmations: args.confirmations,
            confirmation_timeout: Duration::from_secs(args.confirmation_timeout),
            profitable_only: args.profitable_only,
            backoff_retry_interval: Duration::from_secs(args.backoff_retry_interval),
            backoff_max_retries: args.backoff_max_retries,
            queue_prefetch: args.queue_prefetch,
            enable_taiko_l2: args.enable_taiko_l2,
            eth_client_timeout: Duration::from_secs(args.eth_client_timeout),
            hops,
        })
    }
}

impl ProcessorConfig {
    /// Validates parsed flags. Same as `ProcessorConfig::try_from`.
    pub fn from_args(args: ProcessorArgs) -> Result<Self, ConfigError> {
        Self::try_from(args)
    }
}

fn non_zero(name: &'static str, address: Address) -> Result<(), ConfigError> {
    if address.is_zero() {
        return Err(ConfigError::ZeroAddress(name));
    }
    Ok(())
}

fn rpc_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidRpcUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidRpcUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}
