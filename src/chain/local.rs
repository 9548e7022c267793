//! In-memory chain used by the test suite.
//!
//! Keeps live in a single mutex-guarded map; block height advances only when
//! a test calls [`LocalChain::mine_block`], which makes confirmation-gate
//! behavior fully deterministic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use ethers::types::{Address, Signature};
use tokio::sync::{mpsc, watch};

use super::{
    ChainError, Digest, EventSubscription, KeepAddress, KeepChain, KeepClosedEvent,
    KeepCreatedEvent, KeepTerminatedEvent, MemberIdentity, SignatureRequestedEvent,
};

struct LocalKeep {
    members: Vec<MemberIdentity>,
    honest_threshold: u64,
    opened_at: SystemTime,
    active: bool,
    public_key: Vec<u8>,
    latest_digest: Option<Digest>,
    digest_blocks: HashMap<Digest, u64>,
    signatures: HashMap<Digest, Signature>,
}

#[derive(Default)]
struct LocalState {
    keeps: HashMap<KeepAddress, LocalKeep>,
    keep_order: Vec<KeepAddress>,
    candidate_registrations: Vec<Address>,
    created_subscribers: Vec<mpsc::UnboundedSender<KeepCreatedEvent>>,
    signature_subscribers: Vec<(KeepAddress, mpsc::UnboundedSender<SignatureRequestedEvent>)>,
    closed_subscribers: Vec<(KeepAddress, mpsc::UnboundedSender<KeepClosedEvent>)>,
    terminated_subscribers: Vec<(KeepAddress, mpsc::UnboundedSender<KeepTerminatedEvent>)>,
}

pub struct LocalChain {
    operator: MemberIdentity,
    height: watch::Sender<u64>,
    state: Mutex<LocalState>,
}

impl LocalChain {
    pub fn connect(operator: MemberIdentity) -> Arc<Self> {
        let (height, _) = watch::channel(0);
        Arc::new(Self {
            operator,
            height,
            state: Mutex::new(LocalState::default()),
        })
    }

    pub fn mine_block(&self) -> u64 {
        self.height.send_modify(|h| *h += 1);
        *self.height.borrow()
    }

    pub fn mine_blocks(&self, count: u64) -> u64 {
        self.height.send_modify(|h| *h += count);
        *self.height.borrow()
    }

    fn block(&self) -> u64 {
        *self.height.borrow()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().expect("local chain lock poisoned")
    }

    pub fn create_keep(
        &self,
        keep: KeepAddress,
        members: Vec<MemberIdentity>,
        honest_threshold: u64,
    ) -> Result<(), ChainError> {
        self.create_keep_opened_at(keep, members, honest_threshold, SystemTime::now())
    }

    pub fn create_keep_opened_at(
        &self,
        keep: KeepAddress,
        members: Vec<MemberIdentity>,
        honest_threshold: u64,
        opened_at: SystemTime,
    ) -> Result<(), ChainError> {
        let block_number = self.block();
        let mut state = self.lock();
        if state.keeps.contains_key(&keep) {
            return Err(ChainError::SubmissionRejected(format!(
                "keep [{keep:?}] already exists"
            )));
        }
        state.keeps.insert(
            keep,
            LocalKeep {
                members: members.clone(),
                honest_threshold,
                opened_at,
                active: true,
                public_key: Vec::new(),
                latest_digest: None,
                digest_blocks: HashMap::new(),
                signatures: HashMap::new(),
            },
        );
        state.keep_order.push(keep);
        let event = KeepCreatedEvent {
            keep_address: keep,
            members,
            honest_threshold,
            block_number,
        };
        state
            .created_subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        Ok(())
    }

    pub fn request_signature(&self, keep: KeepAddress, digest: Digest) -> Result<(), ChainError> {
        let block_number = self.block();
        let mut state = self.lock();
        let entry = state.keeps.get_mut(&keep).ok_or(ChainError::UnknownKeep(keep))?;
        if entry.public_key.is_empty() {
            return Err(ChainError::SubmissionRejected(format!(
                "no public key registered for keep [{keep:?}]"
            )));
        }
        entry.latest_digest = Some(digest);
        entry.digest_blocks.insert(digest, block_number);
        let event = SignatureRequestedEvent {
            digest,
            block_number,
        };
        state
            .signature_subscribers
            .retain(|(k, tx)| *k != keep || tx.send(event).is_ok());
        Ok(())
    }

    pub fn close_keep(&self, keep: KeepAddress) -> Result<(), ChainError> {
        {
            let mut state = self.lock();
            let entry = state.keeps.get_mut(&keep).ok_or(ChainError::UnknownKeep(keep))?;
            entry.active = false;
        }
        self.emit_keep_closed(keep)
    }

    pub fn terminate_keep(&self, keep: KeepAddress) -> Result<(), ChainError> {
        {
            let mut state = self.lock();
            let entry = state.keeps.get_mut(&keep).ok_or(ChainError::UnknownKeep(keep))?;
            entry.active = false;
        }
        self.emit_keep_terminated(keep)
    }

    /// Delivers a closed event without touching keep state. This is how a
    /// notification that later gets reorged out looks to the client.
    pub fn emit_keep_closed(&self, keep: KeepAddress) -> Result<(), ChainError> {
        let block_number = self.block();
        let mut state = self.lock();
        if !state.keeps.contains_key(&keep) {
            return Err(ChainError::UnknownKeep(keep));
        }
        let event = KeepClosedEvent { block_number };
        state
            .closed_subscribers
            .retain(|(k, tx)| *k != keep || tx.send(event).is_ok());
        Ok(())
    }

    pub fn emit_keep_terminated(&self, keep: KeepAddress) -> Result<(), ChainError> {
        let block_number = self.block();
        let mut state = self.lock();
        if !state.keeps.contains_key(&keep) {
            return Err(ChainError::UnknownKeep(keep));
        }
        let event = KeepTerminatedEvent { block_number };
        state
            .terminated_subscribers
            .retain(|(k, tx)| *k != keep || tx.send(event).is_ok());
        Ok(())
    }

    pub fn candidate_registrations(&self) -> Vec<Address> {
        self.lock().candidate_registrations.clone()
    }

    pub fn signature_for(&self, keep: KeepAddress, digest: Digest) -> Option<Signature> {
        self.lock()
            .keeps
            .get(&keep)
            .and_then(|k| k.signatures.get(&digest).copied())
    }

    fn with_keep<T>(
        &self,
        keep: KeepAddress,
        read: impl FnOnce(&LocalKeep) -> T,
    ) -> Result<T, ChainError> {
        let state = self.lock();
        state
            .keeps
            .get(&keep)
            .map(read)
            .ok_or(ChainError::UnknownKeep(keep))
    }
}

#[async_trait]
impl KeepChain for LocalChain {
    fn address(&self) -> MemberIdentity {
        self.operator
    }

    async fn current_block(&self) -> Result<u64, ChainError> {
        Ok(self.block())
    }

    async fn wait_for_block_height(&self, height: u64) -> Result<(), ChainError> {
        let mut heights = self.height.subscribe();
        heights
            .wait_for(|current| *current >= height)
            .await
            .map_err(|_| ChainError::Rpc("block height channel closed".into()))?;
        Ok(())
    }

    async fn is_active(&self, keep: KeepAddress) -> Result<bool, ChainError> {
        self.with_keep(keep, |k| k.active)
    }

    async fn get_public_key(&self, keep: KeepAddress) -> Result<Vec<u8>, ChainError> {
        self.with_keep(keep, |k| k.public_key.clone())
    }

    async fn get_members(&self, keep: KeepAddress) -> Result<Vec<MemberIdentity>, ChainError> {
        self.with_keep(keep, |k| k.members.clone())
    }

    async fn get_honest_threshold(&self, keep: KeepAddress) -> Result<u64, ChainError> {
        self.with_keep(keep, |k| k.honest_threshold)
    }

    async fn get_opened_timestamp(&self, keep: KeepAddress) -> Result<SystemTime, ChainError> {
        self.with_keep(keep, |k| k.opened_at)
    }

    async fn get_keep_count(&self) -> Result<u64, ChainError> {
        Ok(self.lock().keep_order.len() as u64)
    }

    async fn get_keep_at_index(&self, index: u64) -> Result<KeepAddress, ChainError> {
        self.lock()
            .keep_order
            .get(index as usize)
            .copied()
            .ok_or(ChainError::UnknownKeepIndex(index))
    }

    async fn is_awaiting_signature(
        &self,
        keep: KeepAddress,
        digest: Digest,
    ) -> Result<bool, ChainError> {
        self.with_keep(keep, |k| {
            k.latest_digest == Some(digest) && !k.signatures.contains_key(&digest)
        })
    }

    async fn latest_digest(&self, keep: KeepAddress) -> Result<Option<Digest>, ChainError> {
        self.with_keep(keep, |k| k.latest_digest)
    }

    async fn signature_requested_block(
        &self,
        keep: KeepAddress,
        digest: Digest,
    ) -> Result<u64, ChainError> {
        self.with_keep(keep, |k| k.digest_blocks.get(&digest).copied())?
            .ok_or(ChainError::UnknownDigest { keep, digest })
    }

    async fn submit_keep_public_key(
        &self,
        keep: KeepAddress,
        public_key: Vec<u8>,
    ) -> Result<(), ChainError> {
        let mut state = self.lock();
        let entry = state.keeps.get_mut(&keep).ok_or(ChainError::UnknownKeep(keep))?;
        if !entry.public_key.is_empty() {
            return Err(ChainError::PublicKeyAlreadySubmitted(keep));
        }
        entry.public_key = public_key;
        Ok(())
    }

    async fn submit_signature(
        &self,
        keep: KeepAddress,
        signature: &Signature,
    ) -> Result<(), ChainError> {
        let mut state = self.lock();
        let entry = state.keeps.get_mut(&keep).ok_or(ChainError::UnknownKeep(keep))?;
        let digest = entry
            .latest_digest
            .filter(|d| !entry.signatures.contains_key(d))
            .ok_or_else(|| {
                ChainError::SubmissionRejected(format!(
                    "keep [{keep:?}] is not awaiting a signature"
                ))
            })?;
        entry.signatures.insert(digest, *signature);
        Ok(())
    }

    async fn register_member_candidate(&self, application: Address) -> Result<(), ChainError> {
        self.lock().candidate_registrations.push(application);
        Ok(())
    }

    async fn on_keep_created(
        &self,
    ) -> Result<EventSubscription<KeepCreatedEvent>, ChainError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().created_subscribers.push(tx);
        Ok(EventSubscription::new(rx))
    }

    async fn on_signature_requested(
        &self,
        keep: KeepAddress,
    ) -> Result<EventSubscription<SignatureRequestedEvent>, ChainError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().signature_subscribers.push((keep, tx));
        Ok(EventSubscription::new(rx))
    }

    async fn on_keep_closed(
        &self,
        keep: KeepAddress,
    ) -> Result<EventSubscription<KeepClosedEvent>, ChainError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().closed_subscribers.push((keep, tx));
        Ok(EventSubscription::new(rx))
    }

    async fn on_keep_terminated(
        &self,
        keep: KeepAddress,
    ) -> Result<EventSubscription<KeepTerminatedEvent>, ChainError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().terminated_subscribers.push((keep, tx));
        Ok(EventSubscription::new(rx))
    }
}
