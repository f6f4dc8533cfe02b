// registry.rs: Recent decisions kept in memory for override lookups.
//
// Override requests name the decision they apply to. Looking that up in
// the audit log means a flush and a full scan, so the gate keeps the last
// few thousand decisions here and only falls back to the log on a miss.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

use crate::decision::PolicyDecision;
use crate::overrides::Fingerprint;

pub const DEFAULT_REGISTRY_CAPACITY: usize = 4096;

/// Bounded FIFO map from decision id to the decision's fingerprint.
pub struct DecisionRegistry {
    capacity: usize,
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<Uuid, Fingerprint>,
    order: VecDeque<Uuid>,
}

impl DecisionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn insert(&self, decision: &PolicyDecision) {
        let mut inner = match self.inner.lock() {
            Ok(i) => i,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner
            .entries
            .insert(decision.decision_id, Fingerprint::of(decision))
            .is_none()
        {
            inner.order.push_back(decision.decision_id);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    pub fn get(&self, decision_id: &Uuid) -> Option<Fingerprint> {
        let inner = match self.inner.lock() {
            Ok(i) => i,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.entries.get(decision_id).cloned()
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(i) => i.entries.len(),
            Err(poisoned) => poisoned.into_inner().entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DecisionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_policy::EvaluationRequest;

    fn decision(action: &str) -> PolicyDecision {
        let req = EvaluationRequest::new(action, "document", "agent-a");
        PolicyDecision::fail_safe(&req, "test", crate::emergency::SystemStateKind::Normal)
    }

    #[test]
    fn evicts_oldest_first() {
        let registry = DecisionRegistry::new(2);
        let a = decision("read");
        let b = decision("write");
        let c = decision("delete");
        registry.insert(&a);
        registry.insert(&b);
        registry.insert(&c);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&a.decision_id).is_none());
        assert_eq!(registry.get(&c.decision_id).unwrap().action, "delete");
    }
}
