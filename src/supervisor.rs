//! Per-keep supervision.
//!
//! Each keep the operator participates in gets one supervisor task. The
//! supervisor takes a keep through its life: key generation (when the keep
//! is new), signing on demand (while the keep is active), and archival once
//! the chain confirms the keep closed or was terminated. Subscriptions are
//! held by value, so leaving the active loop tears them down.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chain::{Digest, KeepAddress, KeepChain, MemberIdentity};
use crate::config::ClientConfig;
use crate::confirmation::wait_for_block_confirmations;
use crate::error::ClientError;
use crate::event::{Deduplicator, InFlightClaim, InFlightKey};
use crate::registry::KeepsRegistry;
use crate::retry::do_with_default_retry;
use crate::tecdsa::SigningProtocol;

#[derive(Debug, Clone, Copy)]
enum Retirement {
    Closed,
    Terminated,
}

impl Retirement {
    fn in_flight_key(self, keep: KeepAddress) -> InFlightKey {
        match self {
            Retirement::Closed => InFlightKey::Close(keep),
            Retirement::Terminated => InFlightKey::Terminate(keep),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Retirement::Closed => "closed",
            Retirement::Terminated => "terminated",
        }
    }
}

#[derive(Clone)]
pub struct KeepSupervisor {
    keep: KeepAddress,
    chain: Arc<dyn KeepChain>,
    registry: Arc<KeepsRegistry>,
    deduplicator: Arc<Deduplicator>,
    protocol: Arc<dyn SigningProtocol>,
    config: Arc<ClientConfig>,
    cancel: CancellationToken,
}

impl KeepSupervisor {
    pub fn new(
        keep: KeepAddress,
        chain: Arc<dyn KeepChain>,
        registry: Arc<KeepsRegistry>,
        deduplicator: Arc<Deduplicator>,
        protocol: Arc<dyn SigningProtocol>,
        config: Arc<ClientConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            keep,
            chain,
            registry,
            deduplicator,
            protocol,
            config,
            cancel,
        }
    }

    /// Entry point for a keep that still needs key generation, either fresh
    /// from a creation event (`start_block` set, creation re-confirmed) or
    /// found by the startup sweep (`start_block` empty, already old enough).
    ///
    /// The caller must hold the `KeyGen` claim for this keep.
    pub async fn run_awaiting_keygen(
        self,
        members: Vec<MemberIdentity>,
        honest_threshold: u64,
        start_block: Option<u64>,
        claim: InFlightClaim,
    ) -> Result<(), ClientError> {
        if members.len() < 2 {
            // TODO: #408 single-signer keeps.
            return Err(ClientError::UnsupportedKeepShape {
                keep: self.keep,
                reason: format!("[{}] members; at least 2 are required", members.len()),
            });
        }
        if honest_threshold != members.len() as u64 {
            // TODO: #325 honest thresholds below the group size.
            return Err(ClientError::UnsupportedKeepShape {
                keep: self.keep,
                reason: format!(
                    "honest threshold [{honest_threshold}] does not match group size [{}]",
                    members.len()
                ),
            });
        }

        if let Some(start_block) = start_block {
            let chain = self.chain.clone();
            let keep = self.keep;
            let created = wait_for_block_confirmations(
                self.chain.as_ref(),
                start_block,
                self.config.block_confirmations,
                move || {
                    let chain = chain.clone();
                    async move { chain.is_active(keep).await }
                },
            )
            .await?;
            if !created {
                tracing::warn!(
                    keep = ?self.keep,
                    "keep creation did not confirm; assuming chain reorg"
                );
                return Ok(());
            }
        }

        tracing::info!(
            keep = ?self.keep,
            member = ?self.chain.address(),
            "starting signer generation"
        );

        let signer = self
            .protocol
            .generate_signer(
                self.keep,
                &members,
                &self.registry,
                self.config.key_generation_timeout,
            )
            .await?;

        // A signer that cannot be committed must never be used; bail before
        // any signing subscription exists.
        self.registry.register_signer(self.keep, signer).await?;
        tracing::info!(keep = ?self.keep, "signer registered");
        claim.complete();

        self.run_active().await
    }

    /// Entry point for a keep restored from the registry at startup. The
    /// keep may have closed while the client was down.
    pub async fn run_recovered(self) -> Result<(), ClientError> {
        if !self.chain.is_active(self.keep).await? {
            tracing::info!(keep = ?self.keep, "keep seems no longer active; confirming");

            let current_block = self.chain.current_block().await?;
            let chain = self.chain.clone();
            let keep = self.keep;
            let still_active = wait_for_block_confirmations(
                self.chain.as_ref(),
                current_block,
                self.config.block_confirmations,
                move || {
                    let chain = chain.clone();
                    async move { chain.is_active(keep).await }
                },
            )
            .await?;

            if !still_active {
                tracing::info!(keep = ?self.keep, "confirmed keep is no longer active; archiving");
                self.registry.unregister_keep(self.keep).await?;
                return Ok(());
            }
            tracing::warn!(keep = ?self.keep, "keep is still active");
        }

        self.run_active().await
    }

    async fn run_active(self) -> Result<(), ClientError> {
        // No signing work without a committed signer.
        self.registry.get_signer(self.keep)?;

        let mut signature_requests = self.chain.on_signature_requested(self.keep).await?;
        let mut closed_events = self.chain.on_keep_closed(self.keep).await?;
        let mut terminated_events = self.chain.on_keep_terminated(self.keep).await?;

        let (retired_tx, mut retired_rx) = mpsc::channel::<Retirement>(4);

        // The request that triggered the latest digest may have fired while
        // this client was down; catch up before relying on live events.
        tokio::spawn(self.clone().check_awaiting_signature());

        tracing::info!(keep = ?self.keep, "monitoring keep events");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),

                event = signature_requests.recv() => {
                    let Some(event) = event else {
                        tracing::warn!(keep = ?self.keep, "signature request subscription ended");
                        return Ok(());
                    };
                    tracing::info!(
                        keep = ?self.keep,
                        digest = ?event.digest,
                        block = event.block_number,
                        "new signature requested"
                    );
                    tokio::spawn(
                        self.clone()
                            .handle_signature_request(event.digest, event.block_number),
                    );
                }

                event = closed_events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!(keep = ?self.keep, "keep closed subscription ended");
                        return Ok(());
                    };
                    tracing::info!(
                        keep = ?self.keep,
                        block = event.block_number,
                        "keep closed event received"
                    );
                    tokio::spawn(self.clone().handle_retirement(
                        Retirement::Closed,
                        event.block_number,
                        retired_tx.clone(),
                    ));
                }

                event = terminated_events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!(keep = ?self.keep, "keep terminated subscription ended");
                        return Ok(());
                    };
                    tracing::warn!(
                        keep = ?self.keep,
                        block = event.block_number,
                        "keep terminated event received"
                    );
                    tokio::spawn(self.clone().handle_retirement(
                        Retirement::Terminated,
                        event.block_number,
                        retired_tx.clone(),
                    ));
                }

                retirement = retired_rx.recv() => {
                    if let Some(retirement) = retirement {
                        tracing::info!(
                            keep = ?self.keep,
                            event = retirement.describe(),
                            "unsubscribing from keep events"
                        );
                    }
                    return Ok(());
                }
            }
        }
    }

    /// One signature request, driven to completion under the signing
    /// deadline. Requests for distinct digests run in parallel; duplicates
    /// for the same digest are folded by the deduplicator.
    async fn handle_signature_request(self, digest: Digest, start_block: u64) {
        let result = do_with_default_retry(
            self.config.signing_timeout,
            self.cancel.clone(),
            || {
                let supervisor = self.clone();
                async move { supervisor.sign_once(digest, start_block).await }
            },
        )
        .await;

        match result {
            Ok(()) => {}
            Err(ClientError::Cancelled) => {}
            Err(err) => {
                tracing::error!(
                    keep = ?self.keep,
                    digest = ?digest,
                    error = %err,
                    "failed to generate a signature"
                );
            }
        }
    }

    async fn sign_once(&self, digest: Digest, start_block: u64) -> Result<(), ClientError> {
        let Some(claim) = self
            .deduplicator
            .claim_signing(
                self.config.awaiting_signature_event_check_timeout,
                self.keep,
                digest,
            )
            .await?
        else {
            tracing::info!(
                keep = ?self.keep,
                digest = ?digest,
                "signing request already handled"
            );
            return Ok(());
        };

        let chain = self.chain.clone();
        let keep = self.keep;
        let awaiting = wait_for_block_confirmations(
            self.chain.as_ref(),
            start_block,
            self.config.block_confirmations,
            move || {
                let chain = chain.clone();
                async move { chain.is_awaiting_signature(keep, digest).await }
            },
        )
        .await?;

        if !awaiting {
            // The request sits on an abandoned fork; the work is void.
            tracing::warn!(
                keep = ?self.keep,
                digest = ?digest,
                "keep is not awaiting a signature; assuming chain reorg"
            );
            claim.complete();
            return Ok(());
        }

        let signer = self.registry.get_signer(self.keep)?;
        self.protocol
            .calculate_signature(self.keep, &signer, digest, self.config.signing_timeout)
            .await?;

        claim.complete();
        Ok(())
    }

    /// Synthesizes a signature request for the keep's latest digest if the
    /// chain says one is still outstanding.
    async fn check_awaiting_signature(self) {
        tracing::debug!(keep = ?self.keep, "checking awaiting signature");

        let latest = match self.chain.latest_digest(self.keep).await {
            Ok(Some(digest)) => digest,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(keep = ?self.keep, error = %err, "could not get latest digest");
                return;
            }
        };

        match self.chain.is_awaiting_signature(self.keep, latest).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::error!(
                    keep = ?self.keep,
                    digest = ?latest,
                    error = %err,
                    "could not check awaiting signature"
                );
                return;
            }
        }

        let start_block = match self.chain.signature_requested_block(self.keep, latest).await {
            Ok(block) => block,
            Err(err) => {
                tracing::error!(
                    keep = ?self.keep,
                    digest = ?latest,
                    error = %err,
                    "could not get signature request block"
                );
                return;
            }
        };

        tracing::info!(keep = ?self.keep, digest = ?latest, "awaiting a signature");
        self.handle_signature_request(latest, start_block).await;
    }

    /// Confirms a closed/terminated event against live chain state and, if
    /// it holds, archives the keep and stops the supervisor.
    async fn handle_retirement(
        self,
        retirement: Retirement,
        start_block: u64,
        retired: mpsc::Sender<Retirement>,
    ) {
        let Some(claim) = self
            .deduplicator
            .claim(retirement.in_flight_key(self.keep))
        else {
            tracing::info!(
                keep = ?self.keep,
                event = retirement.describe(),
                "event already handled"
            );
            return;
        };

        let chain = self.chain.clone();
        let keep = self.keep;
        let still_active = match wait_for_block_confirmations(
            self.chain.as_ref(),
            start_block,
            self.config.block_confirmations,
            move || {
                let chain = chain.clone();
                async move { chain.is_active(keep).await }
            },
        )
        .await
        {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::error!(
                    keep = ?self.keep,
                    event = retirement.describe(),
                    error = %err,
                    "failed to confirm keep retirement"
                );
                return;
            }
        };

        if still_active {
            tracing::warn!(
                keep = ?self.keep,
                event = retirement.describe(),
                "keep is still active"
            );
            return;
        }

        // Archive durably before telling anyone the keep is gone.
        if let Err(err) = self.registry.unregister_keep(self.keep).await {
            tracing::error!(keep = ?self.keep, error = %err, "failed to archive keep");
            return;
        }

        claim.complete();
        let _ = retired.send(retirement).await;
    }
}
