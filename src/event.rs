//! Deduplication of chain event deliveries.
//!
//! The chain client may deliver the same logical event more than once:
//! duplicated notifications, events replayed after a reorg, or the restart
//! catch-up racing a live subscription. The deduplicator guarantees that for
//! each in-flight key exactly one handler wins the right to run, and that
//! recently finished work is not redone when a late duplicate shows up.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::chain::{Digest, KeepAddress};
use crate::error::ClientError;
use crate::registry::KeepsRegistry;

/// How long a completed key suppresses duplicate deliveries.
const COMPLETED_EVENT_SUPPRESSION: Duration = Duration::from_secs(10 * 60);

/// How often to re-check the registry while waiting for a racing key
/// generation to commit its signer.
const SIGNER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Unit of work that must run at most once at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InFlightKey {
    KeyGen(KeepAddress),
    Sign(KeepAddress, Digest),
    Close(KeepAddress),
    Terminate(KeepAddress),
}

#[derive(Default)]
struct Tracked {
    active: HashSet<InFlightKey>,
    completed: HashMap<InFlightKey, Instant>,
}

pub struct Deduplicator {
    registry: Arc<KeepsRegistry>,
    tracked: Mutex<Tracked>,
}

impl Deduplicator {
    pub fn new(registry: Arc<KeepsRegistry>) -> Self {
        Self {
            registry,
            tracked: Mutex::new(Tracked::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().expect("deduplicator lock poisoned")
    }

    /// Returns `true` exactly once per logical occurrence: callers that get
    /// `false` are looking at a duplicate of work someone else is doing or
    /// recently did.
    pub fn notify_started(&self, key: InFlightKey) -> bool {
        let now = Instant::now();
        let mut tracked = self.lock();
        tracked
            .completed
            .retain(|_, done| now.duration_since(*done) < COMPLETED_EVENT_SUPPRESSION);
        if tracked.completed.contains_key(&key) {
            return false;
        }
        tracked.active.insert(key)
    }

    /// Marks the work done. Late duplicates of the same key are suppressed
    /// for a cool-down window.
    pub fn notify_completed(&self, key: InFlightKey) {
        let mut tracked = self.lock();
        tracked.active.remove(&key);
        tracked.completed.insert(key, Instant::now());
    }

    // Work that did not finish: free the key without suppressing future
    // attempts, so the retry executor can claim it again.
    fn release(&self, key: InFlightKey) {
        self.lock().active.remove(&key);
    }

    /// Like [`Deduplicator::notify_started`] for signing work, but first
    /// waits up to `timeout` for a committed signer to appear in the
    /// registry. Signing events can legitimately arrive while the key
    /// generation that produced the signer is still persisting it.
    pub async fn notify_signing_started(
        &self,
        timeout: Duration,
        keep: KeepAddress,
        digest: Digest,
    ) -> Result<bool, ClientError> {
        let deadline = Instant::now() + timeout;
        while !self.registry.has_signer(keep) {
            if Instant::now() >= deadline {
                return Err(ClientError::AwaitingSigner {
                    keep,
                    waited: timeout,
                });
            }
            let next_check = Instant::now() + SIGNER_CHECK_INTERVAL;
            tokio::time::sleep_until(next_check.min(deadline)).await;
        }

        Ok(self.notify_started(InFlightKey::Sign(keep, digest)))
    }

    /// RAII variant of the start/complete pair. The returned claim releases
    /// the key on drop; call [`InFlightClaim::complete`] once the work is
    /// definitively resolved to arm duplicate suppression.
    pub fn claim(self: &Arc<Self>, key: InFlightKey) -> Option<InFlightClaim> {
        self.notify_started(key).then(|| InFlightClaim {
            deduplicator: Arc::clone(self),
            key,
            completed: false,
        })
    }

    /// Claiming counterpart of [`Deduplicator::notify_signing_started`].
    pub async fn claim_signing(
        self: &Arc<Self>,
        timeout: Duration,
        keep: KeepAddress,
        digest: Digest,
    ) -> Result<Option<InFlightClaim>, ClientError> {
        let started = self
            .notify_signing_started(timeout, keep, digest)
            .await?;
        Ok(started.then(|| InFlightClaim {
            deduplicator: Arc::clone(self),
            key: InFlightKey::Sign(keep, digest),
            completed: false,
        }))
    }
}

/// Exclusive right to handle one in-flight key.
pub struct InFlightClaim {
    deduplicator: Arc<Deduplicator>,
    key: InFlightKey,
    completed: bool,
}

impl InFlightClaim {
    /// The work is done; suppress late duplicates of this key.
    pub fn complete(mut self) {
        self.completed = true;
        self.deduplicator.notify_completed(self.key);
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        if !self.completed {
            self.deduplicator.release(self.key);
        }
    }
}
