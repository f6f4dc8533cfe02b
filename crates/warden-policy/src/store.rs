// store.rs: Atomically swapped active PolicySet.
//
// Readers take a snapshot (an `Arc` clone) and evaluate against it for the
// whole request, so a concurrent reload can never show them a half-merged
// set. The lock is held only for the pointer clone or the pointer swap;
// building the new set happens outside it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::PolicyError;
use crate::loader::PolicyLoader;
use crate::set::PolicySet;

/// Holder of the active policy set.
pub struct PolicyStore {
    loader: PolicyLoader,
    active: RwLock<Arc<PolicySet>>,
    generation: AtomicU64,
}

impl PolicyStore {
    /// Load the initial set. Fails closed if core cannot be established.
    pub fn open(loader: PolicyLoader) -> Result<Self, PolicyError> {
        let set = loader.load(1)?;
        Ok(Self {
            loader,
            active: RwLock::new(Arc::new(set)),
            generation: AtomicU64::new(1),
        })
    }

    /// Current set. Cheap: one `Arc` clone.
    pub fn snapshot(&self) -> Arc<PolicySet> {
        match self.active.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Build a fresh set from disk and swap it in. On failure the previous
    /// set stays active and the error is returned.
    pub fn reload(&self) -> Result<Arc<PolicySet>, PolicyError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let set = match self.loader.load(generation) {
            Ok(set) => Arc::new(set),
            Err(err) => {
                tracing::error!(error = %err, generation, "policy reload failed; keeping previous set");
                return Err(err);
            }
        };
        self.swap(Arc::clone(&set));
        tracing::info!(
            generation,
            fingerprint = %set.fingerprint,
            "policy set reloaded"
        );
        Ok(set)
    }

    /// Validate sources on disk without swapping.
    pub fn check(&self) -> Result<PolicySet, PolicyError> {
        self.loader.check()
    }

    pub fn loader(&self) -> &PolicyLoader {
        &self.loader
    }

    fn swap(&self, set: Arc<PolicySet>) {
        match self.active.write() {
            Ok(mut guard) => *guard = set,
            Err(poisoned) => *poisoned.into_inner() = set,
        }
    }
}
