//! Shared fixtures for the test suite.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Signature, U256};

use crate::chain::local::LocalChain;
use crate::chain::{Digest, KeepAddress, KeepChain, MemberIdentity};
use crate::registry::KeepsRegistry;
use crate::tecdsa::{MemberId, ProtocolError, SigningProtocol, ThresholdSigner};

pub(crate) fn test_signer(members: &[MemberIdentity]) -> ThresholdSigner {
    ThresholdSigner::new(
        "test-group-1",
        MemberId::new("m-self"),
        members
            .iter()
            .map(|member| MemberId::new(format!("{member:?}")))
            .collect(),
        members.len().saturating_sub(1) as u64,
        b"threshold-key-share".to_vec(),
    )
}

pub(crate) fn test_signer_with_member(member_id: &str) -> ThresholdSigner {
    ThresholdSigner::new(
        "test-group-1",
        MemberId::new(member_id),
        vec![
            MemberId::new("member-1"),
            MemberId::new("member-2"),
            MemberId::new("member-3"),
        ],
        3,
        format!("threshold-key-share-{member_id}").into_bytes(),
    )
}

/// Protocol double that records invocations and settles requests against the
/// chain the way the real protocol would.
pub(crate) struct FakeProtocol {
    chain: Arc<dyn KeepChain>,
    keygens: Mutex<Vec<KeepAddress>>,
    signings: Mutex<Vec<(KeepAddress, Digest)>>,
    fail_keygen: AtomicBool,
}

impl FakeProtocol {
    pub(crate) fn new(chain: Arc<LocalChain>) -> Arc<Self> {
        Arc::new(Self {
            chain,
            keygens: Mutex::new(Vec::new()),
            signings: Mutex::new(Vec::new()),
            fail_keygen: AtomicBool::new(false),
        })
    }

    pub(crate) fn fail_keygen(&self) {
        self.fail_keygen.store(true, Ordering::SeqCst);
    }

    pub(crate) fn keygen_count(&self) -> usize {
        self.keygens.lock().unwrap().len()
    }

    pub(crate) fn signing_count(&self, keep: KeepAddress, digest: Digest) -> usize {
        self.signings
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| **entry == (keep, digest))
            .count()
    }
}

#[async_trait]
impl SigningProtocol for FakeProtocol {
    async fn generate_signer(
        &self,
        keep: KeepAddress,
        members: &[MemberIdentity],
        registry: &KeepsRegistry,
        _timeout: Duration,
    ) -> Result<ThresholdSigner, ProtocolError> {
        self.keygens.lock().unwrap().push(keep);
        if self.fail_keygen.load(Ordering::SeqCst) {
            return Err(ProtocolError::KeyGeneration("injected failure".into()));
        }

        let signer = test_signer(members);
        registry
            .snapshot_signer(keep, &signer)
            .await
            .map_err(|err| ProtocolError::KeyGeneration(err.to_string()))?;
        self.chain.submit_keep_public_key(keep, vec![7; 64]).await?;
        Ok(signer)
    }

    async fn calculate_signature(
        &self,
        keep: KeepAddress,
        _signer: &ThresholdSigner,
        digest: Digest,
        _timeout: Duration,
    ) -> Result<(), ProtocolError> {
        self.signings.lock().unwrap().push((keep, digest));
        let signature = Signature {
            r: U256::from(10),
            s: U256::from(11),
            v: 28,
        };
        self.chain.submit_signature(keep, &signature).await?;
        Ok(())
    }
}

/// Polls `check` until it holds or `deadline` of (tokio) time passes.
pub(crate) async fn eventually<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if check() {
            return true;
        }
        if started.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Mines `blocks` in the background, one every few milliseconds.
pub(crate) fn spawn_miner(chain: Arc<LocalChain>, blocks: u64) {
    tokio::spawn(async move {
        for _ in 0..blocks {
            tokio::time::sleep(Duration::from_millis(20)).await;
            chain.mine_block();
        }
    });
}
