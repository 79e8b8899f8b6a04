use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::facts::FactStore;
use crate::run::RunResult;

/// Fingerprint of an action's stable facts.
///
/// Deterministic and order-independent: concrete facts are rendered
/// through a sorted-key JSON object, with lazy slots and the configured
/// volatile names excluded, so two evaluations of the same logical edit
/// collide even when wall-clock-dependent facts differ.
pub fn fingerprint(store: &FactStore, volatile: &HashSet<String>) -> String {
    let mut map = serde_json::Map::new();
    for (name, value) in store.concrete_facts() {
        if volatile.contains(name) {
            continue;
        }
        map.insert(name.to_string(), value.to_json());
    }
    let payload = serde_json::Value::Object(map).to_string();
    hex::encode(Sha256::digest(payload.as_bytes()))
}

struct StashEntry {
    result: RunResult,
    stored_at: Instant,
}

/// Short-TTL cache of run results keyed by fact fingerprint.
///
/// Purely advisory: a miss falls back to full evaluation, so no
/// cross-request locking is needed. Shared between in-flight actions;
/// reads and writes go through one lock.
pub struct EvaluationStash {
    entries: RwLock<HashMap<String, StashEntry>>,
    ttl: Duration,
}

impl EvaluationStash {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a previous run for the same fingerprint, expiring stale
    /// entries on the way.
    pub fn seek(&self, key: &str) -> Option<RunResult> {
        let mut entries = self.entries.write();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => {
                debug!(%key, "stash hit");
                Some(entry.result.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn store(&self, key: &str, result: RunResult) {
        let mut entries = self.entries.write();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.stored_at.elapsed() <= ttl);
        entries.insert(
            key.to_string(),
            StashEntry {
                result,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
