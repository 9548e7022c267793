//! Chain interface consumed by the keep client.
//!
//! The client never talks JSON-RPC directly; everything it needs from the
//! chain goes through [`KeepChain`]. Two implementations exist:
//! [`ethereum::EthereumChain`] for real networks and [`local::LocalChain`],
//! an in-memory chain used by the test suite.

pub mod ethereum;
pub mod local;

use std::time::SystemTime;

use async_trait::async_trait;
use ethers::types::{Address, Signature, H256};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// On-chain address of a keep contract.
pub type KeepAddress = Address;

/// Operator identity as known to the chain.
pub type MemberIdentity = Address;

/// 32-byte message hash a keep is asked to sign.
pub type Digest = H256;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// RPC-level failure. The only transient chain error; everything else is
    /// a definitive answer from the chain.
    #[error("chain rpc failed: {0}")]
    Rpc(String),

    #[error("unknown keep [{0:?}]")]
    UnknownKeep(KeepAddress),

    #[error("no keep at index [{0}]")]
    UnknownKeepIndex(u64),

    #[error("digest [{digest:?}] was never requested for keep [{keep:?}]")]
    UnknownDigest { keep: KeepAddress, digest: Digest },

    #[error("public key already submitted for keep [{0:?}]")]
    PublicKeyAlreadySubmitted(KeepAddress),

    #[error("submission rejected: {0}")]
    SubmissionRejected(String),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Rpc(_))
    }
}

/// New keep created by the factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepCreatedEvent {
    pub keep_address: KeepAddress,
    pub members: Vec<MemberIdentity>,
    pub honest_threshold: u64,
    pub block_number: u64,
}

impl KeepCreatedEvent {
    /// True when the given operator belongs to the keep's signing group.
    pub fn is_member(&self, address: MemberIdentity) -> bool {
        self.members.contains(&address)
    }
}

/// Keep requested a signature over a digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureRequestedEvent {
    pub digest: Digest,
    pub block_number: u64,
}

/// Keep closed gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepClosedEvent {
    pub block_number: u64,
}

/// Keep terminated due to misbehavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepTerminatedEvent {
    pub block_number: u64,
}

/// A live event subscription. Dropping the value unsubscribes: the receiver
/// closes and, for implementations backed by a polling task, the attached
/// guard cancels that task.
pub struct EventSubscription<E> {
    events: mpsc::UnboundedReceiver<E>,
    _canceller: Option<DropGuard>,
}

impl<E> EventSubscription<E> {
    pub fn new(events: mpsc::UnboundedReceiver<E>) -> Self {
        Self {
            events,
            _canceller: None,
        }
    }

    pub fn with_guard(events: mpsc::UnboundedReceiver<E>, guard: DropGuard) -> Self {
        Self {
            events,
            _canceller: Some(guard),
        }
    }

    /// Next event, or `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.events.recv().await
    }
}

/// Everything the keep client needs from the chain.
///
/// Read calls may run in parallel; implementations serialize the per-keep
/// submissions (`submit_keep_public_key`, `submit_signature`) internally.
#[async_trait]
pub trait KeepChain: Send + Sync {
    /// Address of the operator this client signs for.
    fn address(&self) -> MemberIdentity;

    async fn current_block(&self) -> Result<u64, ChainError>;

    /// Resolves once the observed chain height reaches `height`.
    async fn wait_for_block_height(&self, height: u64) -> Result<(), ChainError>;

    async fn is_active(&self, keep: KeepAddress) -> Result<bool, ChainError>;

    /// Group public key registered for the keep; empty until key generation
    /// completed and the submission was mined.
    async fn get_public_key(&self, keep: KeepAddress) -> Result<Vec<u8>, ChainError>;

    async fn get_members(&self, keep: KeepAddress) -> Result<Vec<MemberIdentity>, ChainError>;

    async fn get_honest_threshold(&self, keep: KeepAddress) -> Result<u64, ChainError>;

    async fn get_opened_timestamp(&self, keep: KeepAddress) -> Result<SystemTime, ChainError>;

    async fn get_keep_count(&self) -> Result<u64, ChainError>;

    async fn get_keep_at_index(&self, index: u64) -> Result<KeepAddress, ChainError>;

    /// True while `digest` is the keep's most recently requested digest and
    /// no signature for it has been submitted yet.
    async fn is_awaiting_signature(
        &self,
        keep: KeepAddress,
        digest: Digest,
    ) -> Result<bool, ChainError>;

    /// Most recently requested digest, `None` if the keep never requested a
    /// signature.
    async fn latest_digest(&self, keep: KeepAddress) -> Result<Option<Digest>, ChainError>;

    /// Block at which the signature request for `digest` was observed.
    async fn signature_requested_block(
        &self,
        keep: KeepAddress,
        digest: Digest,
    ) -> Result<u64, ChainError>;

    async fn submit_keep_public_key(
        &self,
        keep: KeepAddress,
        public_key: Vec<u8>,
    ) -> Result<(), ChainError>;

    async fn submit_signature(
        &self,
        keep: KeepAddress,
        signature: &Signature,
    ) -> Result<(), ChainError>;

    /// Registers the operator as a member candidate for the given
    /// application's keeps.
    async fn register_member_candidate(&self, application: Address) -> Result<(), ChainError>;

    async fn on_keep_created(&self)
        -> Result<EventSubscription<KeepCreatedEvent>, ChainError>;

    async fn on_signature_requested(
        &self,
        keep: KeepAddress,
    ) -> Result<EventSubscription<SignatureRequestedEvent>, ChainError>;

    async fn on_keep_closed(
        &self,
        keep: KeepAddress,
    ) -> Result<EventSubscription<KeepClosedEvent>, ChainError>;

    async fn on_keep_terminated(
        &self,
        keep: KeepAddress,
    ) -> Result<EventSubscription<KeepTerminatedEvent>, ChainError>;
}
