//! Registry of keeps this operator holds signer material for.
//!
//! The registry is the only owner of signer material. A signer becomes
//! visible to readers strictly after its durable save succeeded, and
//! persistence I/O always runs outside the map lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;

use crate::chain::KeepAddress;
use crate::persistence::{PersistenceError, PersistenceHandle};
use crate::tecdsa::{MemberId, ThresholdSigner};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("signer for keep [{0:?}] already registered")]
    AlreadyRegistered(KeepAddress),

    #[error("could not find signer for keep [{0:?}]")]
    NotFound(KeepAddress),

    #[error("could not marshal signer for keep [{0:?}]: {1}")]
    Marshal(KeepAddress, String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub struct KeepsRegistry {
    persistence: Arc<dyn PersistenceHandle>,
    signers: Mutex<HashMap<KeepAddress, Arc<ThresholdSigner>>>,
}

fn storage_directory(keep: KeepAddress) -> String {
    format!("{keep:?}")
}

fn membership_file(member_id: &MemberId) -> String {
    format!("membership_{member_id}")
}

impl KeepsRegistry {
    pub fn new(persistence: Arc<dyn PersistenceHandle>) -> Self {
        Self {
            persistence,
            signers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<KeepAddress, Arc<ThresholdSigner>>> {
        self.signers.lock().expect("registry lock poisoned")
    }

    /// Durably commits the signer for a keep, then makes it visible to
    /// readers. On a persistence failure nothing becomes visible and the
    /// caller must not proceed to signing.
    pub async fn register_signer(
        &self,
        keep: KeepAddress,
        signer: ThresholdSigner,
    ) -> Result<(), RegistryError> {
        if self.has_signer(keep) {
            return Err(RegistryError::AlreadyRegistered(keep));
        }

        let bytes = signer
            .marshal()
            .map_err(|err| RegistryError::Marshal(keep, err.to_string()))?;
        self.persistence
            .save(
                &storage_directory(keep),
                &membership_file(signer.member_id()),
                &bytes,
            )
            .await?;

        let mut signers = self.lock();
        if signers.contains_key(&keep) {
            return Err(RegistryError::AlreadyRegistered(keep));
        }
        signers.insert(keep, Arc::new(signer));
        Ok(())
    }

    /// Tentative copy of not-yet-committed signer material. Never visible
    /// through [`KeepsRegistry::get_signer`].
    pub async fn snapshot_signer(
        &self,
        keep: KeepAddress,
        signer: &ThresholdSigner,
    ) -> Result<(), RegistryError> {
        let bytes = signer
            .marshal()
            .map_err(|err| RegistryError::Marshal(keep, err.to_string()))?;
        self.persistence
            .snapshot(
                &storage_directory(keep),
                &membership_file(signer.member_id()),
                &bytes,
            )
            .await?;
        Ok(())
    }

    pub fn get_signer(&self, keep: KeepAddress) -> Result<Arc<ThresholdSigner>, RegistryError> {
        self.lock()
            .get(&keep)
            .cloned()
            .ok_or(RegistryError::NotFound(keep))
    }

    pub fn has_signer(&self, keep: KeepAddress) -> bool {
        self.lock().contains_key(&keep)
    }

    pub fn get_keeps_addresses(&self) -> Vec<KeepAddress> {
        self.lock().keys().copied().collect()
    }

    /// Removes the keep from the registry and archives its material. The
    /// archive is durable before this returns; calling it again for the same
    /// keep is harmless.
    pub async fn unregister_keep(&self, keep: KeepAddress) -> Result<(), RegistryError> {
        self.lock().remove(&keep);
        self.persistence.archive(&storage_directory(keep)).await?;
        Ok(())
    }

    /// Populates the registry from storage. Unreadable or corrupt entries
    /// are logged and skipped; a single bad file must not keep the client
    /// from starting.
    pub async fn load_existing(&self) -> Result<(), RegistryError> {
        let mut entries = self.persistence.read_all().await?;

        while let Some(entry) = entries.next().await {
            let descriptor = match entry {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable signer entry");
                    continue;
                }
            };

            let keep: KeepAddress = match descriptor.directory.parse() {
                Ok(address) => address,
                Err(_) => {
                    tracing::warn!(
                        directory = %descriptor.directory,
                        "skipping storage directory that is not a keep address"
                    );
                    continue;
                }
            };

            let signer = match ThresholdSigner::unmarshal(&descriptor.content) {
                Ok(signer) => signer,
                Err(err) => {
                    tracing::warn!(
                        keep = ?keep,
                        name = %descriptor.name,
                        error = %err,
                        "skipping corrupt signer entry"
                    );
                    continue;
                }
            };

            if self.lock().insert(keep, Arc::new(signer)).is_some() {
                tracing::warn!(
                    keep = ?keep,
                    name = %descriptor.name,
                    "duplicate signer entry; keeping the most recent"
                );
            }
            tracing::info!(keep = ?keep, "loaded signer for keep");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::persistence::testing::InMemoryHandle;
    use crate::persistence::{DataDescriptor, DiskHandle};
    use crate::testutil::test_signer_with_member;

    fn keep_address_1() -> KeepAddress {
        "0x770a9E2F2Aa1eC2d3Ca916Fc3e6A55058A898632"
            .parse()
            .unwrap()
    }

    fn keep_address_2() -> KeepAddress {
        "0x8B3BccB3A3994681A1C1584DE4b4E8b23ed1Ed6d"
            .parse()
            .unwrap()
    }

    fn new_registry() -> (Arc<InMemoryHandle>, KeepsRegistry) {
        let persistence = Arc::new(InMemoryHandle::default());
        let registry = KeepsRegistry::new(persistence.clone());
        (persistence, registry)
    }

    #[tokio::test]
    async fn register_signer_persists_before_exposing() {
        let (persistence, registry) = new_registry();
        let keep = keep_address_1();
        let signer = test_signer_with_member("member-1");
        let expected_bytes = signer.marshal().unwrap();

        registry.register_signer(keep, signer).await.unwrap();

        assert_eq!(
            persistence.saved_entries(),
            vec![DataDescriptor {
                directory: storage_directory(keep),
                name: "membership_member-1".into(),
                content: expected_bytes.clone(),
            }]
        );
        assert!(registry.has_signer(keep));
        assert_eq!(
            registry.get_signer(keep).unwrap().marshal().unwrap(),
            expected_bytes
        );
    }

    #[tokio::test]
    async fn register_signer_rejects_duplicates() {
        let (_, registry) = new_registry();
        let keep = keep_address_1();

        registry
            .register_signer(keep, test_signer_with_member("member-1"))
            .await
            .unwrap();
        let err = registry
            .register_signer(keep, test_signer_with_member("member-2"))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::AlreadyRegistered(k) if k == keep));
    }

    #[tokio::test]
    async fn failed_save_leaves_registry_untouched() {
        let (persistence, registry) = new_registry();
        let keep = keep_address_1();
        persistence.fail_saves.store(true, Ordering::SeqCst);

        let err = registry
            .register_signer(keep, test_signer_with_member("member-1"))
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Persistence(_)));
        assert!(!registry.has_signer(keep));
        assert!(persistence.saved_entries().is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_not_visible_through_get_signer() {
        let (persistence, registry) = new_registry();
        let keep = keep_address_1();
        let signer = test_signer_with_member("member-1");

        registry.snapshot_signer(keep, &signer).await.unwrap();

        assert_eq!(persistence.snapshots.lock().unwrap().len(), 1);
        assert!(!registry.has_signer(keep));
        assert!(matches!(
            registry.get_signer(keep),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unregister_archives_exactly_once() {
        let (persistence, registry) = new_registry();
        let keep = keep_address_1();

        registry
            .register_signer(keep, test_signer_with_member("member-1"))
            .await
            .unwrap();
        registry.unregister_keep(keep).await.unwrap();

        assert!(!registry.has_signer(keep));
        assert!(persistence.saved_entries().is_empty());
        assert_eq!(
            persistence.archived_directories(),
            vec![storage_directory(keep)]
        );

        // Unregistering again is a no-op as far as the registry goes.
        registry.unregister_keep(keep).await.unwrap();
        assert!(!registry.has_signer(keep));
    }

    #[tokio::test]
    async fn get_signer_reports_unknown_keeps() {
        let (_, registry) = new_registry();
        assert!(matches!(
            registry.get_signer(keep_address_1()),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn load_existing_populates_from_storage() {
        let (persistence, registry) = new_registry();
        let signer_1 = test_signer_with_member("member-1");
        let signer_2 = test_signer_with_member("member-2");

        persistence.seed(
            &storage_directory(keep_address_1()),
            "membership_member-1",
            signer_1.marshal().unwrap(),
        );
        persistence.seed(
            &storage_directory(keep_address_2()),
            "membership_member-2",
            signer_2.marshal().unwrap(),
        );

        assert!(registry.get_keeps_addresses().is_empty());
        registry.load_existing().await.unwrap();

        let mut keeps = registry.get_keeps_addresses();
        keeps.sort();
        let mut expected = vec![keep_address_1(), keep_address_2()];
        expected.sort();
        assert_eq!(keeps, expected);

        assert_eq!(
            registry.get_signer(keep_address_1()).unwrap().as_ref(),
            &signer_1
        );
        assert_eq!(
            registry.get_signer(keep_address_2()).unwrap().as_ref(),
            &signer_2
        );
    }

    #[tokio::test]
    async fn load_existing_skips_corrupt_entries() {
        let (persistence, registry) = new_registry();
        let signer = test_signer_with_member("member-1");

        persistence.seed(
            &storage_directory(keep_address_1()),
            "membership_member-1",
            b"not a signer".to_vec(),
        );
        persistence.seed(
            &storage_directory(keep_address_2()),
            "membership_member-1",
            signer.marshal().unwrap(),
        );
        persistence.seed("not-an-address", "membership_member-1", Vec::new());

        registry.load_existing().await.unwrap();

        assert_eq!(registry.get_keeps_addresses(), vec![keep_address_2()]);
    }

    #[tokio::test]
    async fn load_existing_keeps_most_recent_duplicate() {
        let (persistence, registry) = new_registry();
        let stale = test_signer_with_member("member-1");
        let fresh = test_signer_with_member("member-2");

        persistence.seed(
            &storage_directory(keep_address_1()),
            "membership_member-1",
            stale.marshal().unwrap(),
        );
        persistence.seed(
            &storage_directory(keep_address_1()),
            "membership_member-2",
            fresh.marshal().unwrap(),
        );

        registry.load_existing().await.unwrap();

        assert_eq!(
            registry.get_signer(keep_address_1()).unwrap().as_ref(),
            &fresh
        );
    }

    #[tokio::test]
    async fn registered_signer_survives_restart_byte_identical() {
        let base = tempfile::tempdir().unwrap();
        let keep = keep_address_1();
        let signer = test_signer_with_member("member-1");
        let expected_bytes = signer.marshal().unwrap();

        {
            let persistence = Arc::new(DiskHandle::new(base.path()).unwrap());
            let registry = KeepsRegistry::new(persistence);
            registry.register_signer(keep, signer).await.unwrap();
        }

        let persistence = Arc::new(DiskHandle::new(base.path()).unwrap());
        let registry = KeepsRegistry::new(persistence);
        registry.load_existing().await.unwrap();

        assert_eq!(
            registry.get_signer(keep).unwrap().marshal().unwrap(),
            expected_bytes
        );
    }
}
