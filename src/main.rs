use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ethers::middleware::NonceManagerMiddleware;
use ethers::prelude::{Http, LocalWallet, Provider, SignerMiddleware};
use ethers::providers::Middleware;
use ethers::signers::Signer;
use ethers::types::Address;
use eyre::{Result, WrapErr};
use fs2::FileExt;
use tokio_util::sync::CancellationToken;

use keep_ecdsa_client::chain::ethereum::{EthereumChain, EthereumConfig};
use keep_ecdsa_client::chain::KeepChain;
use keep_ecdsa_client::client::Client;
use keep_ecdsa_client::config::{self, ClientConfig};
use keep_ecdsa_client::deployment::NetworkArtifact;
use keep_ecdsa_client::persistence::DiskHandle;
use keep_ecdsa_client::tecdsa::StandaloneSigner;

#[derive(Parser, Debug)]
#[command(
    name = "keep-ecdsa-client",
    version,
    about = "ECDSA keep client: runs key generation and signing for on-chain keeps"
)]
struct Args {
    /// Path to a network artifact JSON (chain id, keep factory address, start block).
    #[arg(long, default_value = "config/network.json")]
    network: PathBuf,

    /// Override RPC URL. If omitted, uses KEEP_CLIENT_RPC_URL or the artifact.
    #[arg(long)]
    rpc_url: Option<String>,

    /// Environment variable name that contains the operator's private key.
    #[arg(long, default_value = "KEEP_CLIENT_PRIVATE_KEY")]
    private_key_env: String,

    /// Directory where signer material is persisted.
    #[arg(long, default_value = "storage")]
    storage: PathBuf,

    /// Block confirmations to wait before acting on an observed event.
    #[arg(long, default_value_t = config::DEFAULT_BLOCK_CONFIRMATIONS)]
    confirmations: u64,

    /// Chain polling interval in seconds.
    #[arg(long, default_value_t = 15)]
    poll_seconds: u64,

    /// Log scan chunk size (blocks per eth_getLogs request).
    #[arg(long, default_value_t = 2000)]
    log_chunk: u64,

    /// Deadline for a single key generation attempt, in seconds.
    #[arg(long, default_value_t = config::DEFAULT_KEY_GENERATION_TIMEOUT.as_secs())]
    key_generation_timeout_seconds: u64,

    /// Deadline for a single signing attempt, in seconds.
    #[arg(long, default_value_t = config::DEFAULT_SIGNING_TIMEOUT.as_secs())]
    signing_timeout_seconds: u64,

    /// How far back the startup sweep looks for keeps still awaiting key
    /// generation, in seconds.
    #[arg(long, default_value_t = config::DEFAULT_AWAITING_KEY_GENERATION_LOOKBACK.as_secs())]
    awaiting_key_generation_lookback_seconds: u64,

    /// Grace period for signing events racing a still-persisting key
    /// generation, in seconds.
    #[arg(long, default_value_t = config::DEFAULT_AWAITING_SIGNATURE_EVENT_CHECK_TIMEOUT.as_secs())]
    awaiting_signature_check_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let artifact = NetworkArtifact::load(&args.network)?;
    let rpc_url = artifact.rpc_url(args.rpc_url.clone())?;
    let factory_address = artifact.keep_factory_address()?;

    let client_config = ClientConfig {
        key_generation_timeout: Duration::from_secs(args.key_generation_timeout_seconds),
        signing_timeout: Duration::from_secs(args.signing_timeout_seconds),
        awaiting_key_generation_lookback: Duration::from_secs(
            args.awaiting_key_generation_lookback_seconds,
        ),
        awaiting_signature_event_check_timeout: Duration::from_secs(
            args.awaiting_signature_check_seconds,
        ),
        block_confirmations: args.confirmations,
        sanctioned_applications: artifact.sanctioned_application_addresses()?,
    };
    client_config
        .validate()
        .wrap_err("invalid configuration")?;

    let private_key = std::env::var(&args.private_key_env).wrap_err_with(|| {
        format!(
            "operator key not found: environment variable {} is unset",
            args.private_key_env
        )
    })?;
    let wallet = private_key
        .parse::<LocalWallet>()
        .wrap_err_with(|| format!("{} does not hold a usable private key", args.private_key_env))?
        .with_chain_id(artifact.chain_id);

    let provider =
        Provider::<Http>::try_from(rpc_url.as_str())?.interval(Duration::from_millis(800));
    preflight_network(&provider, &artifact, factory_address).await?;

    let signer = SignerMiddleware::new(provider, wallet.clone());
    let middleware = Arc::new(NonceManagerMiddleware::new(signer, wallet.address()));

    // DiskHandle::new lays out the storage tree; the instance lock then
    // fences this directory off from any second client.
    let persistence = Arc::new(DiskHandle::new(&args.storage)?);
    let _instance_lock = hold_instance_lock(&args.storage)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    let chain: Arc<dyn KeepChain> = Arc::new(EthereumChain::new(
        middleware,
        wallet.address(),
        EthereumConfig {
            factory: factory_address,
            start_block: artifact.start_block,
            confirmations: args.confirmations,
            poll_interval: Duration::from_secs(args.poll_seconds.max(1)),
            log_chunk_size: args.log_chunk.max(1),
        },
        cancel.clone(),
    ));
    let protocol = Arc::new(StandaloneSigner::new(chain.clone()));

    tracing::info!(
        chain_id = artifact.chain_id,
        factory = ?factory_address,
        operator = ?wallet.address(),
        start_block = artifact.start_block,
        confirmations = args.confirmations,
        "keep client starting"
    );

    let client = Client::new(chain, persistence, protocol, client_config, cancel.clone());
    client.run().await?;

    tracing::info!("keep client stopped");
    Ok(())
}

/// Refuses to start against the wrong network: the RPC must report the
/// artifact's chain id, and the factory address must actually be a deployed
/// contract. Catching either mismatch here beats failing later inside some
/// unrelated call, or signing on a chain the operator never meant to.
async fn preflight_network(
    provider: &Provider<Http>,
    artifact: &NetworkArtifact,
    factory: Address,
) -> Result<()> {
    let reported = provider.get_chainid().await?.as_u64();
    eyre::ensure!(
        reported == artifact.chain_id,
        "the RPC endpoint serves chain {reported}, but the artifact describes chain {}",
        artifact.chain_id
    );

    let factory_code = provider.get_code(factory, None).await?;
    eyre::ensure!(
        !factory_code.is_empty(),
        "keep factory {factory:?} has no code on chain {reported}; wrong address or wrong network"
    );

    Ok(())
}

/// Takes an exclusive advisory lock on a marker file inside the storage
/// root, held for the life of the process. Two clients sharing one signer
/// store would double-sign and clobber each other's material, so a second
/// instance is fenced off before it can touch any keys.
fn hold_instance_lock(storage: &Path) -> Result<std::fs::File> {
    let marker = storage.join(".instance");
    let file = std::fs::File::options()
        .create(true)
        .write(true)
        .open(&marker)
        .wrap_err_with(|| format!("cannot open instance marker {}", marker.display()))?;
    file.try_lock_exclusive().wrap_err_with(|| {
        format!(
            "another keep client already owns {}; refusing to share signer material",
            storage.display()
        )
    })?;
    Ok(file)
}
