use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{FilterError, Result};
use crate::lazy::{LazyDescriptor, LazyResolver};
use crate::value::FactValue;

/// One entry in the store: either a concrete value or a deferred
/// computation to run on first read.
#[derive(Debug, Clone)]
enum Slot {
    Value(FactValue),
    Lazy(LazyDescriptor),
}

/// Named, typed fact table for a single in-flight action.
///
/// Owned exclusively by one evaluation; never shared across actions. Lazy
/// entries are resolved at most once: after the first read the slot holds
/// the concrete value and the descriptor is gone for good.
#[derive(Debug, Default, Clone)]
pub struct FactStore {
    slots: HashMap<String, Slot>,
    uncharged: Duration,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a concrete fact. Names are case-insensitive.
    pub fn set(&mut self, name: &str, value: impl Into<FactValue>) {
        self.slots.insert(normalize(name), Slot::Value(value.into()));
    }

    /// Declare a fact whose value is computed on first read.
    pub fn set_lazy(&mut self, name: &str, descriptor: LazyDescriptor) {
        self.slots.insert(normalize(name), Slot::Lazy(descriptor));
    }

    /// Whether a name is present at all (concrete or lazy).
    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(&normalize(name))
    }

    /// Read a fact, resolving it first if it is still lazy.
    ///
    /// Resolution is memoized: the descriptor is replaced by the computed
    /// value and every later read returns that same value. A name that was
    /// never set resolves to `Undefined`; with `strict` the miss is also
    /// logged, since it usually means a rule references a fact the host
    /// forgot to seed.
    pub fn get(
        &mut self,
        name: &str,
        strict: bool,
        resolver: &dyn LazyResolver,
    ) -> Result<FactValue> {
        let key = normalize(name);
        match self.slots.get(&key) {
            Some(Slot::Value(value)) => Ok(value.clone()),
            Some(Slot::Lazy(_)) => {
                // Remove the descriptor while computing so a cyclic
                // dependency resolves the inner read as a plain miss
                // instead of recursing forever.
                let Some(Slot::Lazy(descriptor)) = self.slots.remove(&key) else {
                    unreachable!("slot checked above");
                };
                let computed = match resolver.compute(&descriptor, self) {
                    Ok(computed) => computed,
                    Err(error) => {
                        // Put the descriptor back so a retried read fails
                        // the same way instead of turning into a silent
                        // miss.
                        self.slots.insert(key, Slot::Lazy(descriptor));
                        return Err(error);
                    }
                };
                self.uncharged += computed.uncharged;
                debug!(fact = %key, method = descriptor.method.as_str(), "resolved lazy fact");
                self.slots.insert(key, Slot::Value(computed.value.clone()));
                Ok(computed.value)
            }
            None => {
                if strict {
                    warn!("{}", FilterError::UnsetVariable(key));
                }
                Ok(FactValue::Undefined)
            }
        }
    }

    /// Read a fact that must already exist, without triggering resolution.
    pub fn require(&self, name: &str) -> Result<FactValue> {
        match self.slots.get(&normalize(name)) {
            Some(Slot::Value(value)) => Ok(value.clone()),
            _ => Err(FilterError::UnsetVariable(normalize(name))),
        }
    }

    /// Last-writer-wins union over names.
    pub fn merge(&mut self, other: FactStore) {
        self.slots.extend(other.slots);
        self.uncharged += other.uncharged;
    }

    /// Force resolution of every remaining lazy entry and return the
    /// concrete table. Used when the evaluated facts must be persisted
    /// durably alongside a run's log entry.
    pub fn dump_all(&mut self, resolver: &dyn LazyResolver) -> Result<BTreeMap<String, FactValue>> {
        let names: Vec<String> = self.slots.keys().cloned().collect();
        self.resolve(&names, resolver)?;
        Ok(self.concrete_facts().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    /// Force resolution of a selected subset of names.
    pub fn resolve(&mut self, names: &[String], resolver: &dyn LazyResolver) -> Result<()> {
        for name in names {
            self.get(name, false, resolver)?;
        }
        Ok(())
    }

    /// Iterate the facts that are already concrete, skipping lazy slots.
    /// This is the fingerprinting view: deferred values never take part.
    pub fn concrete_facts(&self) -> impl Iterator<Item = (&str, &FactValue)> {
        self.slots.iter().filter_map(|(name, slot)| match slot {
            Slot::Value(value) => Some((name.as_str(), value)),
            Slot::Lazy(_) => None,
        })
    }

    /// Drain the accumulated duration credit for work that was shared with
    /// the host (and therefore must not be billed to filtering).
    pub fn take_uncharged(&mut self) -> Duration {
        std::mem::take(&mut self.uncharged)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}
