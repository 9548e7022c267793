//! Client orchestration.
//!
//! [`Client::run`] wires the whole engine together: it restores keeps from
//! storage, sweeps the chain for keeps that still await key generation,
//! registers the operator as member candidate for the sanctioned
//! applications, and then spawns a supervisor for every keep the operator
//! becomes a member of.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::chain::{KeepAddress, KeepChain, KeepCreatedEvent};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::event::{Deduplicator, InFlightKey};
use crate::persistence::PersistenceHandle;
use crate::registry::KeepsRegistry;
use crate::supervisor::KeepSupervisor;
use crate::tecdsa::SigningProtocol;

#[derive(Clone)]
pub struct Client {
    chain: Arc<dyn KeepChain>,
    registry: Arc<KeepsRegistry>,
    deduplicator: Arc<Deduplicator>,
    protocol: Arc<dyn SigningProtocol>,
    config: Arc<ClientConfig>,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(
        chain: Arc<dyn KeepChain>,
        persistence: Arc<dyn PersistenceHandle>,
        protocol: Arc<dyn SigningProtocol>,
        config: ClientConfig,
        cancel: CancellationToken,
    ) -> Self {
        let registry = Arc::new(KeepsRegistry::new(persistence));
        let deduplicator = Arc::new(Deduplicator::new(registry.clone()));
        Self {
            chain,
            registry,
            deduplicator,
            protocol,
            config: Arc::new(config),
            cancel,
        }
    }

    /// Runs the client until cancellation. Returns early only when startup
    /// state cannot be restored or the chain connection is lost for good.
    pub async fn run(&self) -> Result<(), ClientError> {
        // Subscribe before restoring state so no creation slips through the
        // gap between the two.
        let mut keeps_created = self.chain.on_keep_created().await?;

        self.registry.load_existing().await?;

        for keep in self.registry.get_keeps_addresses() {
            let supervisor = self.supervisor_for(keep);
            tokio::spawn(async move {
                if let Err(err) = supervisor.run_recovered().await {
                    tracing::error!(keep = ?keep, error = %err, "keep recovery failed");
                }
            });
        }

        tokio::spawn(self.clone().check_awaiting_key_generation());

        for application in self.config.sanctioned_applications.clone() {
            let chain = self.chain.clone();
            tokio::spawn(async move {
                match chain.register_member_candidate(application).await {
                    Ok(()) => {
                        tracing::info!(
                            application = ?application,
                            "registered as member candidate"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            application = ?application,
                            error = %err,
                            "failed to register as member candidate"
                        );
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),

                event = keeps_created.recv() => {
                    let Some(event) = event else {
                        tracing::warn!("keep creation subscription ended");
                        return Err(ClientError::Chain(crate::chain::ChainError::Rpc(
                            "keep creation subscription ended".into(),
                        )));
                    };
                    self.handle_keep_created(event);
                }
            }
        }
    }

    fn handle_keep_created(&self, event: KeepCreatedEvent) {
        let KeepCreatedEvent {
            keep_address,
            members,
            honest_threshold,
            block_number,
        } = event;

        tracing::info!(
            keep = ?keep_address,
            members = ?members,
            block = block_number,
            "new keep created"
        );

        if !members.contains(&self.chain.address()) {
            tracing::info!(keep = ?keep_address, "not a signing group member, skipping");
            return;
        }

        let Some(claim) = self.deduplicator.claim(InFlightKey::KeyGen(keep_address)) else {
            tracing::info!(keep = ?keep_address, "key generation request already handled");
            return;
        };

        let supervisor = self.supervisor_for(keep_address);
        tokio::spawn(async move {
            if let Err(err) = supervisor
                .run_awaiting_keygen(members, honest_threshold, Some(block_number), claim)
                .await
            {
                tracing::error!(keep = ?keep_address, error = %err, "keep supervision failed");
            }
        });
    }

    /// Walks the chain's keep list from the newest backwards, stopping at
    /// the lookback horizon, and starts key generation for keeps that still
    /// have no public key and count the operator as member.
    async fn check_awaiting_key_generation(self) {
        let keep_count = match self.chain.get_keep_count().await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, "could not get keep count");
                return;
            }
        };

        for index in (0..keep_count).rev() {
            tracing::debug!(index, "checking awaiting key generation for keep");

            let keep = match self.chain.get_keep_at_index(index).await {
                Ok(keep) => keep,
                Err(err) => {
                    tracing::warn!(index, error = %err, "could not get keep at index");
                    continue;
                }
            };

            let opened_at = match self.chain.get_opened_timestamp(keep).await {
                Ok(opened_at) => opened_at,
                Err(err) => {
                    tracing::warn!(keep = ?keep, error = %err, "could not check opening timestamp");
                    continue;
                }
            };

            // Keeps are listed in creation order; everything before this one
            // is older still.
            if matches!(opened_at.elapsed(), Ok(age) if age > self.config.awaiting_key_generation_lookback)
            {
                tracing::debug!(index, "stopping awaiting key generation check");
                break;
            }

            if let Err(err) = self.check_awaiting_key_generation_for_keep(keep).await {
                tracing::warn!(
                    keep = ?keep,
                    error = %err,
                    "could not check awaiting key generation for keep"
                );
            }
        }
    }

    async fn check_awaiting_key_generation_for_keep(
        &self,
        keep: KeepAddress,
    ) -> Result<(), ClientError> {
        let public_key = self.chain.get_public_key(keep).await?;
        if !public_key.is_empty() {
            return Ok(());
        }

        // Key material on disk with no key on-chain means a submission is
        // either still mining or conflicted. Generating again would be
        // worse; leave it to the operator.
        if self.registry.has_signer(keep) {
            tracing::warn!(
                keep = ?keep,
                "keep public key is not registered on-chain but key material is stored \
                 on disk; skipping key generation; inspect the public key submission \
                 transaction for this keep"
            );
            return Ok(());
        }

        let members = self.chain.get_members(keep).await?;
        if !members.contains(&self.chain.address()) {
            return Ok(());
        }
        let honest_threshold = self.chain.get_honest_threshold(keep).await?;

        let Some(claim) = self.deduplicator.claim(InFlightKey::KeyGen(keep)) else {
            tracing::info!(keep = ?keep, "key generation request already handled");
            return Ok(());
        };

        tracing::info!(keep = ?keep, "keep awaits key generation");
        let supervisor = self.supervisor_for(keep);
        tokio::spawn(async move {
            if let Err(err) = supervisor
                .run_awaiting_keygen(members, honest_threshold, None, claim)
                .await
            {
                tracing::error!(keep = ?keep, error = %err, "keep supervision failed");
            }
        });

        Ok(())
    }

    fn supervisor_for(&self, keep: KeepAddress) -> KeepSupervisor {
        KeepSupervisor::new(
            keep,
            self.chain.clone(),
            self.registry.clone(),
            self.deduplicator.clone(),
            self.protocol.clone(),
            self.config.clone(),
            self.cancel.child_token(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use ethers::types::{Address, H256};

    use super::*;
    use crate::chain::local::LocalChain;
    use crate::persistence::testing::InMemoryHandle;
    use crate::testutil::{eventually, spawn_miner, test_signer, FakeProtocol};

    struct Harness {
        chain: Arc<LocalChain>,
        persistence: Arc<InMemoryHandle>,
        protocol: Arc<FakeProtocol>,
        client: Arc<Client>,
        cancel: CancellationToken,
    }

    fn operator() -> Address {
        Address::repeat_byte(0x01)
    }

    fn other_members() -> (Address, Address) {
        (Address::repeat_byte(0x02), Address::repeat_byte(0x03))
    }

    fn harness() -> Harness {
        let chain = LocalChain::connect(operator());
        let persistence = Arc::new(InMemoryHandle::default());
        let protocol = FakeProtocol::new(chain.clone());
        let cancel = CancellationToken::new();
        let client = Arc::new(Client::new(
            chain.clone(),
            persistence.clone(),
            protocol.clone(),
            ClientConfig::default(),
            cancel.clone(),
        ));
        Harness {
            chain,
            persistence,
            protocol,
            client,
            cancel,
        }
    }

    impl Harness {
        fn start(&self) {
            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(err) = client.run().await {
                    tracing::error!(error = %err, "client stopped");
                }
            });
        }

        async fn settle(&self) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn generates_signer_for_a_new_keep() {
        let harness = harness();
        harness.start();
        harness.settle().await;

        let keep = Address::repeat_byte(0x22);
        let (member_b, member_c) = other_members();
        harness.chain.mine_blocks(100);
        harness
            .chain
            .create_keep(keep, vec![operator(), member_b, member_c], 3)
            .unwrap();
        spawn_miner(harness.chain.clone(), 64);

        assert!(
            eventually(Duration::from_secs(120), || {
                harness.client.registry.has_signer(keep)
            })
            .await
        );

        assert_eq!(harness.protocol.keygen_count(), 1);

        let saved = harness.persistence.saved_entries();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].directory, format!("{keep:?}"));
        assert_eq!(saved[0].name, "membership_m-self");

        // The group public key made it on-chain before the signer was
        // committed.
        assert!(!harness.chain.get_public_key(keep).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_creation_events_run_one_keygen() {
        let harness = harness();
        let keep = Address::repeat_byte(0x22);
        let (member_b, _) = other_members();
        let members = vec![operator(), member_b];

        harness.chain.mine_blocks(100);
        harness.chain.create_keep(keep, members.clone(), 2).unwrap();
        spawn_miner(harness.chain.clone(), 64);

        let event = KeepCreatedEvent {
            keep_address: keep,
            members,
            honest_threshold: 2,
            block_number: 100,
        };
        harness.client.handle_keep_created(event.clone());
        harness.client.handle_keep_created(event);

        assert!(
            eventually(Duration::from_secs(120), || {
                harness.client.registry.has_signer(keep)
            })
            .await
        );
        assert_eq!(harness.protocol.keygen_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_events_for_other_groups_are_ignored() {
        let harness = harness();
        harness.start();
        harness.settle().await;

        let keep = Address::repeat_byte(0x22);
        let (member_b, member_c) = other_members();
        harness
            .chain
            .create_keep(keep, vec![member_b, member_c], 2)
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(harness.protocol.keygen_count(), 0);
        assert!(!harness.client.registry.has_signer(keep));
    }

    #[tokio::test(start_paused = true)]
    async fn reorged_signature_request_is_abandoned() {
        let harness = harness();
        harness.start();
        harness.settle().await;

        let keep = Address::repeat_byte(0x22);
        let (member_b, _) = other_members();
        harness.chain.mine_blocks(100);
        harness
            .chain
            .create_keep(keep, vec![operator(), member_b], 2)
            .unwrap();
        spawn_miner(harness.chain.clone(), 32);
        assert!(
            eventually(Duration::from_secs(120), || {
                harness.client.registry.has_signer(keep)
            })
            .await
        );

        harness.settle().await;

        // Request digest one, then let a competing request replace it one
        // block before its confirmation target: the first request now looks
        // reorged out.
        let reorged = H256::from_low_u64_be(0x11);
        let surviving = H256::from_low_u64_be(0x12);

        harness.chain.mine_block();
        harness.chain.request_signature(keep, reorged).unwrap();
        harness.chain.mine_blocks(11);
        harness.chain.request_signature(keep, surviving).unwrap();
        spawn_miner(harness.chain.clone(), 64);

        assert!(
            eventually(Duration::from_secs(300), || {
                harness.protocol.signing_count(keep, surviving) == 1
            })
            .await
        );
        assert_eq!(harness.protocol.signing_count(keep, reorged), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_recovers_an_outstanding_signature_request() {
        let harness = harness();

        // State left behind by a previous run: committed signer on disk, an
        // active keep on-chain with an unanswered signature request.
        let keep = Address::repeat_byte(0x22);
        let (member_b, _) = other_members();
        let signer = test_signer(&[operator(), member_b]);
        harness.persistence.seed(
            &format!("{keep:?}"),
            "membership_m-self",
            signer.marshal().unwrap(),
        );
        harness
            .chain
            .create_keep(keep, vec![operator(), member_b], 2)
            .unwrap();
        harness
            .chain
            .submit_keep_public_key(keep, vec![7; 64])
            .await
            .unwrap();

        let digest = H256::from_low_u64_be(0x22);
        harness.chain.mine_blocks(500);
        harness.chain.request_signature(keep, digest).unwrap();

        harness.start();
        spawn_miner(harness.chain.clone(), 64);

        assert!(
            eventually(Duration::from_secs(300), || {
                harness.protocol.signing_count(keep, digest) == 1
            })
            .await
        );
        assert!(!harness
            .chain
            .is_awaiting_signature(keep, digest)
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn reorged_close_event_keeps_the_keep_active() {
        let harness = harness();
        harness.start();
        harness.settle().await;

        let keep = Address::repeat_byte(0x22);
        let (member_b, _) = other_members();
        harness.chain.mine_blocks(100);
        harness
            .chain
            .create_keep(keep, vec![operator(), member_b], 2)
            .unwrap();
        spawn_miner(harness.chain.clone(), 32);
        assert!(
            eventually(Duration::from_secs(120), || {
                harness.client.registry.has_signer(keep)
            })
            .await
        );

        harness.settle().await;

        // Closed notification with no matching chain state: after twelve
        // confirmations the keep still reports active.
        harness.chain.emit_keep_closed(keep).unwrap();
        spawn_miner(harness.chain.clone(), 32);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(harness.client.registry.has_signer(keep));
        assert!(harness.persistence.archived_directories().is_empty());

        // The supervisor is still alive and signing.
        let digest = H256::from_low_u64_be(0x33);
        harness.chain.request_signature(keep, digest).unwrap();
        spawn_miner(harness.chain.clone(), 64);
        assert!(
            eventually(Duration::from_secs(300), || {
                harness.protocol.signing_count(keep, digest) == 1
            })
            .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_close_archives_the_keep() {
        let harness = harness();
        harness.start();
        harness.settle().await;

        let keep = Address::repeat_byte(0x22);
        let (member_b, _) = other_members();
        harness.chain.mine_blocks(100);
        harness
            .chain
            .create_keep(keep, vec![operator(), member_b], 2)
            .unwrap();
        spawn_miner(harness.chain.clone(), 32);
        assert!(
            eventually(Duration::from_secs(120), || {
                harness.client.registry.has_signer(keep)
            })
            .await
        );

        harness.settle().await;

        harness.chain.close_keep(keep).unwrap();
        spawn_miner(harness.chain.clone(), 32);

        assert!(
            eventually(Duration::from_secs(120), || {
                !harness.client.registry.has_signer(keep)
            })
            .await
        );
        assert_eq!(
            harness.persistence.archived_directories(),
            vec![format!("{keep:?}")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_keep_shape_is_rejected() {
        let harness = harness();
        harness.start();
        harness.settle().await;

        let keep = Address::repeat_byte(0x23);
        harness.chain.create_keep(keep, vec![operator()], 1).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(harness.protocol.keygen_count(), 0);
        assert!(!harness.client.registry.has_signer(keep));
        assert!(harness.persistence.saved_entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_sweep_finds_keeps_awaiting_key_generation() {
        let harness = harness();
        let (member_b, _) = other_members();

        // Old keep beyond the lookback horizon: never touched, and the sweep
        // stops at it.
        let stale_keep = Address::repeat_byte(0x31);
        let stale_opened = SystemTime::now() - Duration::from_secs(48 * 60 * 60);
        harness
            .chain
            .create_keep_opened_at(stale_keep, vec![operator(), member_b], 2, stale_opened)
            .unwrap();

        // Fresh keep with no public key: picked up by the sweep.
        let fresh_keep = Address::repeat_byte(0x32);
        harness
            .chain
            .create_keep(fresh_keep, vec![operator(), member_b], 2)
            .unwrap();

        harness.start();

        assert!(
            eventually(Duration::from_secs(120), || {
                harness.client.registry.has_signer(fresh_keep)
            })
            .await
        );
        assert_eq!(harness.protocol.keygen_count(), 1);
        assert!(!harness.client.registry.has_signer(stale_keep));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_sweep_skips_keeps_with_local_material() {
        let harness = harness();
        let (member_b, _) = other_members();

        // Public key missing on-chain but material on disk: a submission
        // may still be mining, so the sweep must not regenerate.
        let keep = Address::repeat_byte(0x31);
        harness
            .chain
            .create_keep(keep, vec![operator(), member_b], 2)
            .unwrap();
        let signer = test_signer(&[operator(), member_b]);
        harness.persistence.seed(
            &format!("{keep:?}"),
            "membership_m-self",
            signer.marshal().unwrap(),
        );

        harness.start();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(harness.protocol.keygen_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_keep_is_unregistered_during_recovery() {
        let harness = harness();
        let (member_b, _) = other_members();

        let keep = Address::repeat_byte(0x22);
        harness
            .chain
            .create_keep(keep, vec![operator(), member_b], 2)
            .unwrap();
        harness
            .chain
            .submit_keep_public_key(keep, vec![7; 64])
            .await
            .unwrap();
        harness.chain.close_keep(keep).unwrap();

        let signer = test_signer(&[operator(), member_b]);
        harness.persistence.seed(
            &format!("{keep:?}"),
            "membership_m-self",
            signer.marshal().unwrap(),
        );

        harness.start();
        spawn_miner(harness.chain.clone(), 32);

        assert!(
            eventually(Duration::from_secs(120), || {
                harness.persistence.archived_directories() == vec![format!("{keep:?}")]
            })
            .await
        );
        assert!(!harness.client.registry.has_signer(keep));
    }

    #[tokio::test(start_paused = true)]
    async fn sanctioned_applications_are_registered() {
        let chain = LocalChain::connect(operator());
        let persistence = Arc::new(InMemoryHandle::default());
        let protocol = FakeProtocol::new(chain.clone());
        let cancel = CancellationToken::new();
        let application = Address::repeat_byte(0x77);
        let config = ClientConfig {
            sanctioned_applications: vec![application],
            ..ClientConfig::default()
        };
        let client = Arc::new(Client::new(
            chain.clone(),
            persistence,
            protocol,
            config,
            cancel.clone(),
        ));

        {
            let client = client.clone();
            tokio::spawn(async move {
                let _ = client.run().await;
            });
        }

        assert!(
            eventually(Duration::from_secs(10), || {
                chain.candidate_registrations() == vec![application]
            })
            .await
        );
        cancel.cancel();
    }
}
