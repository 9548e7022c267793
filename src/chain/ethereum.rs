//! Ethereum-backed chain implementation.
//!
//! Reads and submissions go through `abigen`-generated bindings; event
//! subscriptions are polling tasks scanning confirmed logs in chunks, with
//! the chunk size shrinking when an RPC rejects a range.

use std::cmp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ethers::abi::{self, ParamType};
use ethers::contract::{abigen, ContractCall};
use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber, Bytes, Filter, Log, Signature, H256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    ChainError, Digest, EventSubscription, KeepAddress, KeepChain, KeepClosedEvent,
    KeepCreatedEvent, KeepTerminatedEvent, MemberIdentity, SignatureRequestedEvent,
};

// Minimal ABIs: only what the client calls. Return values decode as full
// 32-byte words either way.
abigen!(
    BondedEcdsaKeepFactory,
    r#"[
        function getKeepCount() view returns (uint256)
        function getKeepAtIndex(uint256 index) view returns (address)
        function getKeepOpenedTimestamp(address keep) view returns (uint256)
        function registerMemberCandidate(address application)
    ]"#
);

abigen!(
    BondedEcdsaKeep,
    r#"[
        function isActive() view returns (bool)
        function getPublicKey() view returns (bytes)
        function getMembers() view returns (address[])
        function honestThreshold() view returns (uint256)
        function isAwaitingSignature(bytes32 digest) view returns (bool)
        function digest() view returns (bytes32)
        function submitPublicKey(bytes publicKey)
        function submitSignature(bytes32 r, bytes32 s, uint8 recoveryID)
    ]"#
);

/// Event topic0 for:
/// BondedECDSAKeepCreated(address indexed keepAddress, address[] members, address owner, address application, uint256 honestThreshold)
fn keep_created_topic() -> H256 {
    H256(ethers::utils::keccak256(
        "BondedECDSAKeepCreated(address,address[],address,address,uint256)",
    ))
}

/// SignatureRequested(bytes32 indexed digest)
fn signature_requested_topic() -> H256 {
    H256(ethers::utils::keccak256("SignatureRequested(bytes32)"))
}

fn keep_closed_topic() -> H256 {
    H256(ethers::utils::keccak256("KeepClosed()"))
}

fn keep_terminated_topic() -> H256 {
    H256(ethers::utils::keccak256("KeepTerminated()"))
}

fn log_block_number(log: &Log) -> u64 {
    log.block_number.map(|block| block.as_u64()).unwrap_or_default()
}

fn decode_keep_created(log: &Log) -> Option<KeepCreatedEvent> {
    if log.topics.len() < 2 {
        return None;
    }
    let keep_address = Address::from_slice(&log.topics[1].as_bytes()[12..]);

    let tokens = abi::decode(
        &[
            ParamType::Array(Box::new(ParamType::Address)),
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint(256),
        ],
        log.data.as_ref(),
    )
    .ok()?;
    let mut tokens = tokens.into_iter();

    let members = tokens
        .next()?
        .into_array()?
        .into_iter()
        .map(|token| token.into_address())
        .collect::<Option<Vec<_>>>()?;
    tokens.next()?; // owner
    tokens.next()?; // application
    let honest_threshold = tokens.next()?.into_uint()?;

    Some(KeepCreatedEvent {
        keep_address,
        members,
        honest_threshold: honest_threshold.as_u64(),
        block_number: log_block_number(log),
    })
}

fn decode_signature_requested(log: &Log) -> Option<SignatureRequestedEvent> {
    let digest = *log.topics.get(1)?;
    Some(SignatureRequestedEvent {
        digest,
        block_number: log_block_number(log),
    })
}

#[derive(Debug, Clone)]
pub struct EthereumConfig {
    pub factory: Address,
    /// Block the factory was deployed at; scans never start earlier.
    pub start_block: u64,
    pub confirmations: u64,
    pub poll_interval: Duration,
    /// Blocks per eth_getLogs request.
    pub log_chunk_size: u64,
}

pub struct EthereumChain<M: Middleware> {
    client: Arc<M>,
    factory: BondedEcdsaKeepFactory<M>,
    operator: MemberIdentity,
    config: EthereumConfig,
    submission_locks: StdMutex<HashMap<KeepAddress, Arc<tokio::sync::Mutex<()>>>>,
    cancel: CancellationToken,
}

fn rpc_error(err: impl ToString) -> ChainError {
    ChainError::Rpc(err.to_string())
}

impl<M: Middleware + 'static> EthereumChain<M> {
    pub fn new(
        client: Arc<M>,
        operator: MemberIdentity,
        config: EthereumConfig,
        cancel: CancellationToken,
    ) -> Self {
        let factory = BondedEcdsaKeepFactory::new(config.factory, client.clone());
        Self {
            client,
            factory,
            operator,
            config,
            submission_locks: StdMutex::new(HashMap::new()),
            cancel,
        }
    }

    fn keep_handle(&self, keep: KeepAddress) -> BondedEcdsaKeep<M> {
        BondedEcdsaKeep::new(keep, self.client.clone())
    }

    // The factory serializes per-keep submissions on its side too; holding a
    // local per-keep lock avoids burning gas on doomed competing
    // transactions from our own handlers.
    fn submission_lock(&self, keep: KeepAddress) -> Arc<tokio::sync::Mutex<()>> {
        self.submission_locks
            .lock()
            .expect("submission lock map poisoned")
            .entry(keep)
            .or_default()
            .clone()
    }

    async fn send_and_confirm(
        &self,
        call: ContractCall<M, ()>,
        what: &str,
    ) -> Result<(), ChainError> {
        let pending = call.send().await.map_err(rpc_error)?;
        let receipt = pending.await.map_err(rpc_error)?;
        match receipt {
            Some(receipt) if receipt.status == Some(1u64.into()) => Ok(()),
            Some(_) => Err(ChainError::SubmissionRejected(format!(
                "{what} transaction reverted"
            ))),
            None => Err(ChainError::SubmissionRejected(format!(
                "{what} transaction dropped"
            ))),
        }
    }

    fn subscribe<E, D>(&self, address: Address, topic0: H256, from_block: u64, decode: D) -> EventSubscription<E>
    where
        E: Send + 'static,
        D: Fn(&Log) -> Option<E> + Send + Sync + 'static,
    {
        spawn_log_poller(
            self.client.clone(),
            PollerConfig {
                address,
                topic0,
                topic1: None,
                from_block,
                confirmations: self.config.confirmations,
                poll_interval: self.config.poll_interval,
                log_chunk_size: self.config.log_chunk_size,
            },
            &self.cancel,
            decode,
        )
    }

    async fn subscription_start_block(&self) -> Result<u64, ChainError> {
        let latest = self.current_block().await?;
        Ok(cmp::max(
            self.config.start_block,
            latest.saturating_sub(self.config.confirmations),
        ))
    }
}

#[async_trait]
impl<M: Middleware + 'static> KeepChain for EthereumChain<M> {
    fn address(&self) -> MemberIdentity {
        self.operator
    }

    async fn current_block(&self) -> Result<u64, ChainError> {
        Ok(self
            .client
            .get_block_number()
            .await
            .map_err(rpc_error)?
            .as_u64())
    }

    async fn wait_for_block_height(&self, height: u64) -> Result<(), ChainError> {
        loop {
            if self.current_block().await? >= height {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(ChainError::Rpc("client shutting down".into()));
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    async fn is_active(&self, keep: KeepAddress) -> Result<bool, ChainError> {
        self.keep_handle(keep)
            .is_active()
            .call()
            .await
            .map_err(rpc_error)
    }

    async fn get_public_key(&self, keep: KeepAddress) -> Result<Vec<u8>, ChainError> {
        Ok(self
            .keep_handle(keep)
            .get_public_key()
            .call()
            .await
            .map_err(rpc_error)?
            .to_vec())
    }

    async fn get_members(&self, keep: KeepAddress) -> Result<Vec<MemberIdentity>, ChainError> {
        self.keep_handle(keep)
            .get_members()
            .call()
            .await
            .map_err(rpc_error)
    }

    async fn get_honest_threshold(&self, keep: KeepAddress) -> Result<u64, ChainError> {
        Ok(self
            .keep_handle(keep)
            .honest_threshold()
            .call()
            .await
            .map_err(rpc_error)?
            .as_u64())
    }

    async fn get_opened_timestamp(&self, keep: KeepAddress) -> Result<SystemTime, ChainError> {
        let seconds = self
            .factory
            .get_keep_opened_timestamp(keep)
            .call()
            .await
            .map_err(rpc_error)?;
        Ok(UNIX_EPOCH + Duration::from_secs(seconds.as_u64()))
    }

    async fn get_keep_count(&self) -> Result<u64, ChainError> {
        Ok(self
            .factory
            .get_keep_count()
            .call()
            .await
            .map_err(rpc_error)?
            .as_u64())
    }

    async fn get_keep_at_index(&self, index: u64) -> Result<KeepAddress, ChainError> {
        self.factory
            .get_keep_at_index(index.into())
            .call()
            .await
            .map_err(rpc_error)
    }

    async fn is_awaiting_signature(
        &self,
        keep: KeepAddress,
        digest: Digest,
    ) -> Result<bool, ChainError> {
        self.keep_handle(keep)
            .is_awaiting_signature(digest.to_fixed_bytes())
            .call()
            .await
            .map_err(rpc_error)
    }

    async fn latest_digest(&self, keep: KeepAddress) -> Result<Option<Digest>, ChainError> {
        let digest = H256::from(
            self.keep_handle(keep)
                .digest()
                .call()
                .await
                .map_err(rpc_error)?,
        );
        Ok((digest != H256::zero()).then_some(digest))
    }

    async fn signature_requested_block(
        &self,
        keep: KeepAddress,
        digest: Digest,
    ) -> Result<u64, ChainError> {
        let filter = Filter::new()
            .address(keep)
            .topic0(signature_requested_topic())
            .topic1(digest)
            .from_block(BlockNumber::Number(self.config.start_block.into()));
        let logs = self.client.get_logs(&filter).await.map_err(rpc_error)?;

        logs.iter()
            .rev()
            .find_map(|log| log.block_number)
            .map(|block| block.as_u64())
            .ok_or(ChainError::UnknownDigest { keep, digest })
    }

    async fn submit_keep_public_key(
        &self,
        keep: KeepAddress,
        public_key: Vec<u8>,
    ) -> Result<(), ChainError> {
        let lock = self.submission_lock(keep);
        let _guard = lock.lock().await;

        let call = self
            .keep_handle(keep)
            .submit_public_key(Bytes::from(public_key));
        self.send_and_confirm(call, "public key").await
    }

    async fn submit_signature(
        &self,
        keep: KeepAddress,
        signature: &Signature,
    ) -> Result<(), ChainError> {
        let lock = self.submission_lock(keep);
        let _guard = lock.lock().await;

        let mut r = [0u8; 32];
        signature.r.to_big_endian(&mut r);
        let mut s = [0u8; 32];
        signature.s.to_big_endian(&mut s);
        let recovery_id = if signature.v >= 27 {
            (signature.v - 27) as u8
        } else {
            signature.v as u8
        };

        let call = self.keep_handle(keep).submit_signature(r, s, recovery_id);
        self.send_and_confirm(call, "signature").await
    }

    async fn register_member_candidate(&self, application: Address) -> Result<(), ChainError> {
        let call = self.factory.register_member_candidate(application);
        self.send_and_confirm(call, "member candidate registration")
            .await
    }

    async fn on_keep_created(
        &self,
    ) -> Result<EventSubscription<KeepCreatedEvent>, ChainError> {
        Ok(self.subscribe(
            self.config.factory,
            keep_created_topic(),
            self.config.start_block,
            decode_keep_created,
        ))
    }

    async fn on_signature_requested(
        &self,
        keep: KeepAddress,
    ) -> Result<EventSubscription<SignatureRequestedEvent>, ChainError> {
        let from_block = self.subscription_start_block().await?;
        Ok(self.subscribe(
            keep,
            signature_requested_topic(),
            from_block,
            decode_signature_requested,
        ))
    }

    async fn on_keep_closed(
        &self,
        keep: KeepAddress,
    ) -> Result<EventSubscription<KeepClosedEvent>, ChainError> {
        let from_block = self.subscription_start_block().await?;
        Ok(self.subscribe(keep, keep_closed_topic(), from_block, |log: &Log| {
            Some(KeepClosedEvent {
                block_number: log_block_number(log),
            })
        }))
    }

    async fn on_keep_terminated(
        &self,
        keep: KeepAddress,
    ) -> Result<EventSubscription<KeepTerminatedEvent>, ChainError> {
        let from_block = self.subscription_start_block().await?;
        Ok(self.subscribe(keep, keep_terminated_topic(), from_block, |log: &Log| {
            Some(KeepTerminatedEvent {
                block_number: log_block_number(log),
            })
        }))
    }
}

/// Smallest block window a poller will query with. Failures at this size are
/// treated as real errors rather than range problems.
const MIN_LOG_CHUNK: u64 = 16;

struct PollerConfig {
    address: Address,
    topic0: H256,
    topic1: Option<H256>,
    from_block: u64,
    confirmations: u64,
    poll_interval: Duration,
    log_chunk_size: u64,
}

fn spawn_log_poller<M, E, D>(
    client: Arc<M>,
    config: PollerConfig,
    cancel: &CancellationToken,
    decode: D,
) -> EventSubscription<E>
where
    M: Middleware + 'static,
    E: Send + 'static,
    D: Fn(&Log) -> Option<E> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let token = cancel.child_token();
    let task_token = token.clone();

    tokio::spawn(async move {
        let mut cursor = config.from_block;
        let mut chunk = config.log_chunk_size.max(1);
        loop {
            match poll_round(client.as_ref(), &config, &mut cursor, &mut chunk, &decode, &tx)
                .await
            {
                Ok(true) => {}
                // Receiver dropped: the subscription is gone.
                Ok(false) => return,
                Err(err) => {
                    tracing::warn!(
                        address = ?config.address,
                        error = %err,
                        "event poll failed; will retry"
                    );
                }
            }
            tokio::select! {
                _ = task_token.cancelled() => return,
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    });

    EventSubscription::with_guard(rx, token.drop_guard())
}

// Scans confirmed blocks from the cursor forward, in chunks. Returns false
// once the subscription's receiver is gone.
async fn poll_round<M, E, D>(
    client: &M,
    config: &PollerConfig,
    cursor: &mut u64,
    chunk: &mut u64,
    decode: &D,
    tx: &mpsc::UnboundedSender<E>,
) -> Result<bool, ChainError>
where
    M: Middleware,
    D: Fn(&Log) -> Option<E>,
{
    let latest = client
        .get_block_number()
        .await
        .map_err(rpc_error)?
        .as_u64();
    let target = latest.saturating_sub(config.confirmations);

    while *cursor <= target {
        let end = cmp::min((*cursor).saturating_add(*chunk - 1), target);

        let mut filter = Filter::new()
            .address(config.address)
            .topic0(config.topic0)
            .from_block(BlockNumber::Number((*cursor).into()))
            .to_block(BlockNumber::Number(end.into()));
        if let Some(topic1) = config.topic1 {
            filter = filter.topic1(topic1);
        }

        let logs = match fetch_logs_with_retries(client, &filter).await {
            Ok(logs) => logs,
            Err(err) => {
                // Providers cap how many blocks one query may cover; quarter
                // the window until it fits. Below the floor the problem is
                // not the range, so surface the error instead.
                if *chunk <= MIN_LOG_CHUNK {
                    return Err(err);
                }
                *chunk = (*chunk / 4).max(MIN_LOG_CHUNK);
                tracing::warn!(
                    from = *cursor,
                    to = end,
                    narrowed_to = *chunk,
                    "log query keeps failing; narrowing the block window"
                );
                continue;
            }
        };

        for log in &logs {
            if let Some(event) = decode(log) {
                if tx.send(event).is_err() {
                    return Ok(false);
                }
            }
        }

        *cursor = end.saturating_add(1);
    }

    Ok(true)
}

/// In-place retries per log query. Rate-limited or briefly flaky RPCs tend
/// to recover within a second; anything still failing after this many
/// attempts goes back to the poller, which tries again next round.
const LOG_FETCH_ATTEMPTS: u32 = 4;

async fn fetch_logs_with_retries<M: Middleware>(
    client: &M,
    filter: &Filter,
) -> Result<Vec<Log>, ChainError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match client.get_logs(filter).await {
            Ok(logs) => return Ok(logs),
            Err(err) => err,
        };
        if attempt >= LOG_FETCH_ATTEMPTS {
            return Err(rpc_error(err));
        }
        // Short linear pause: 250ms, then 500ms, then 750ms.
        let pause = Duration::from_millis(250 * u64::from(attempt));
        tracing::warn!(
            attempt,
            pause_ms = pause.as_millis() as u64,
            error = %err,
            "log query failed; trying again shortly"
        );
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use ethers::abi::Token;

    use super::*;

    #[test]
    fn decodes_a_keep_created_log() {
        let keep = Address::repeat_byte(0x22);
        let members = vec![Address::repeat_byte(0x01), Address::repeat_byte(0x02)];
        let owner = Address::repeat_byte(0x03);
        let application = Address::repeat_byte(0x04);

        let log = Log {
            address: Address::repeat_byte(0x0f),
            topics: vec![keep_created_topic(), H256::from(keep)],
            data: Bytes::from(abi::encode(&[
                Token::Array(members.iter().map(|m| Token::Address(*m)).collect()),
                Token::Address(owner),
                Token::Address(application),
                Token::Uint(2u64.into()),
            ])),
            block_number: Some(120u64.into()),
            ..Default::default()
        };

        let event = decode_keep_created(&log).expect("log did not decode");
        assert_eq!(
            event,
            KeepCreatedEvent {
                keep_address: keep,
                members,
                honest_threshold: 2,
                block_number: 120,
            }
        );
    }

    #[test]
    fn malformed_keep_created_logs_are_skipped() {
        let log = Log {
            topics: vec![keep_created_topic()],
            ..Default::default()
        };
        assert!(decode_keep_created(&log).is_none());

        let log = Log {
            topics: vec![keep_created_topic(), H256::zero()],
            data: Bytes::from(vec![0x01, 0x02]),
            ..Default::default()
        };
        assert!(decode_keep_created(&log).is_none());
    }

    #[test]
    fn decodes_a_signature_requested_log() {
        let digest = H256::from_low_u64_be(0x11);
        let log = Log {
            topics: vec![signature_requested_topic(), digest],
            block_number: Some(200u64.into()),
            ..Default::default()
        };

        let event = decode_signature_requested(&log).expect("log did not decode");
        assert_eq!(
            event,
            SignatureRequestedEvent {
                digest,
                block_number: 200,
            }
        );
    }

    #[test]
    fn event_topics_are_distinct() {
        let topics = [
            keep_created_topic(),
            signature_requested_topic(),
            keep_closed_topic(),
            keep_terminated_topic(),
        ];
        for (i, a) in topics.iter().enumerate() {
            for b in &topics[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
