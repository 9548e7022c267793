//! Threshold-ECDSA protocol surface.
//!
//! The lifecycle engine drives key generation and signing through
//! [`SigningProtocol`] and never looks inside a [`ThresholdSigner`] beyond
//! its group metadata. [`StandaloneSigner`] is the non-distributed
//! implementation used by the binary and the tests; a proper multi-party
//! protocol plugs in behind the same trait.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::signers::LocalWallet;
use serde::{Deserialize, Serialize};

use crate::chain::{ChainError, Digest, KeepAddress, KeepChain, MemberIdentity};
use crate::registry::KeepsRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signature calculation failed: {0}")]
    Signing(String),

    #[error("protocol did not complete within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl ProtocolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Chain(err) if err.is_transient())
    }
}

/// Identifier of one signing-group member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol run a message belongs to. Signing runs are keyed by digest so
/// parallel signings on the same keep never cross-talk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolSession {
    KeyGeneration,
    Signing(Digest),
}

/// Session identifier scoping protocol messages to one keep and one run.
pub fn session_id(keep: KeepAddress, session: ProtocolSession) -> String {
    match session {
        ProtocolSession::KeyGeneration => format!("{keep:?}-keygen"),
        ProtocolSession::Signing(digest) => format!("{keep:?}-sign-{digest:?}"),
    }
}

/// One member's share of a keep's threshold key, plus the group metadata
/// needed to participate in signing.
///
/// The share itself is an opaque blob owned by the protocol implementation.
/// Signers are not clonable; the registry hands them out as `Arc` and the
/// only way to copy one is through `marshal`/`unmarshal`.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdSigner {
    group_id: String,
    member_id: MemberId,
    group_member_ids: Vec<MemberId>,
    dishonest_threshold: u64,
    key_share: Vec<u8>,
}

impl ThresholdSigner {
    pub fn new(
        group_id: impl Into<String>,
        member_id: MemberId,
        group_member_ids: Vec<MemberId>,
        dishonest_threshold: u64,
        key_share: Vec<u8>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            member_id,
            group_member_ids,
            dishonest_threshold,
            key_share,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    pub fn group_member_ids(&self) -> &[MemberId] {
        &self.group_member_ids
    }

    pub fn dishonest_threshold(&self) -> u64 {
        self.dishonest_threshold
    }

    pub fn marshal(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Cryptographic side of the keep lifecycle.
///
/// Implementations handle their own peer messaging and submit results to the
/// chain themselves; the engine only learns whether the run succeeded.
#[async_trait]
pub trait SigningProtocol: Send + Sync {
    /// Runs key generation for a keep the operator is a member of. The
    /// implementation snapshots tentative material through `registry` before
    /// publishing the group public key, and returns the signer only once the
    /// chain has the key.
    async fn generate_signer(
        &self,
        keep: KeepAddress,
        members: &[MemberIdentity],
        registry: &KeepsRegistry,
        timeout: Duration,
    ) -> Result<ThresholdSigner, ProtocolError>;

    /// Produces a signature over `digest` and submits it to the chain.
    async fn calculate_signature(
        &self,
        keep: KeepAddress,
        signer: &ThresholdSigner,
        digest: Digest,
        timeout: Duration,
    ) -> Result<(), ProtocolError>;
}

/// Single-party implementation: the "group" key is one freshly generated
/// secp256k1 keypair and the share is its secret scalar.
pub struct StandaloneSigner {
    chain: Arc<dyn KeepChain>,
}

impl StandaloneSigner {
    pub fn new(chain: Arc<dyn KeepChain>) -> Self {
        Self { chain }
    }

    async fn generate(
        &self,
        keep: KeepAddress,
        members: &[MemberIdentity],
        registry: &KeepsRegistry,
    ) -> Result<ThresholdSigner, ProtocolError> {
        let wallet = LocalWallet::new(&mut rand::thread_rng());

        // 64-byte uncompressed public key, without the SEC1 0x04 prefix.
        let encoded = wallet.signer().verifying_key().to_encoded_point(false);
        let public_key = encoded.as_bytes()[1..].to_vec();

        let signer = ThresholdSigner::new(
            session_id(keep, ProtocolSession::KeyGeneration),
            MemberId::new(hex::encode(self.chain.address())),
            members
                .iter()
                .map(|member| MemberId::new(hex::encode(member)))
                .collect(),
            members.len().saturating_sub(1) as u64,
            wallet.signer().to_bytes().to_vec(),
        );

        // Tentative copy on disk before the chain learns the public key, so
        // a crash between submission and commit is recoverable.
        if let Err(err) = registry.snapshot_signer(keep, &signer).await {
            tracing::warn!(
                keep = ?keep,
                error = %err,
                "failed to snapshot signer before public key submission"
            );
        }

        self.chain.submit_keep_public_key(keep, public_key).await?;

        Ok(signer)
    }

    async fn sign(
        &self,
        keep: KeepAddress,
        signer: &ThresholdSigner,
        digest: Digest,
    ) -> Result<(), ProtocolError> {
        tracing::debug!(
            session = %session_id(keep, ProtocolSession::Signing(digest)),
            "calculating signature"
        );

        let wallet = LocalWallet::from_bytes(&signer.key_share)
            .map_err(|err| ProtocolError::Signing(err.to_string()))?;
        let signature = wallet
            .sign_hash(digest)
            .map_err(|err| ProtocolError::Signing(err.to_string()))?;

        self.chain.submit_signature(keep, &signature).await?;
        Ok(())
    }
}

#[async_trait]
impl SigningProtocol for StandaloneSigner {
    async fn generate_signer(
        &self,
        keep: KeepAddress,
        members: &[MemberIdentity],
        registry: &KeepsRegistry,
        timeout: Duration,
    ) -> Result<ThresholdSigner, ProtocolError> {
        tokio::time::timeout(timeout, self.generate(keep, members, registry))
            .await
            .map_err(|_| ProtocolError::Timeout(timeout))?
    }

    async fn calculate_signature(
        &self,
        keep: KeepAddress,
        signer: &ThresholdSigner,
        digest: Digest,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        tokio::time::timeout(timeout, self.sign(keep, signer, digest))
            .await
            .map_err(|_| ProtocolError::Timeout(timeout))?
    }
}
