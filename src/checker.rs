use crate::error::CheckError;
use crate::facts::FactStore;
use crate::lazy::LazyResolver;

/// Evaluation-cost budget shared by every filter in one run.
///
/// The counter is owned by the run and threaded through by reference;
/// charging it from several filters cannot be evaded by splitting one
/// expensive rule across many filters. Exceeding the limit is recorded,
/// never enforced mid-run, so behaviour stays independent of filter
/// iteration order.
#[derive(Debug, Clone)]
pub struct ConditionCounter {
    used: u32,
    limit: u32,
}

impl ConditionCounter {
    pub fn new(limit: u32) -> Self {
        Self { used: 0, limit }
    }

    pub fn charge(&mut self, conditions: u32) {
        self.used = self.used.saturating_add(conditions);
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn limit_exceeded(&self) -> bool {
        self.used > self.limit
    }
}

/// Result of evaluating one rule against a fact store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatch {
    pub matched: bool,
    pub conditions: u32,
}

/// External collaborator that parses and evaluates rule text.
///
/// The grammar lives outside this crate; implementations pull facts from
/// the store (resolving lazy ones through the resolver) and charge the
/// shared counter for every primitive operation they evaluate.
pub trait RuleChecker: Send + Sync {
    fn check(
        &self,
        rule: &str,
        store: &mut FactStore,
        resolver: &dyn LazyResolver,
        counter: &mut ConditionCounter,
    ) -> Result<RuleMatch, CheckError>;
}

/// Diagnostic checker that treats the rule text as a single fact name and
/// matches when that fact is truthy, charging one condition per probe.
/// Real deployments supply a parser-backed implementation.
#[derive(Debug, Default)]
pub struct ProbeChecker;

impl RuleChecker for ProbeChecker {
    fn check(
        &self,
        rule: &str,
        store: &mut FactStore,
        resolver: &dyn LazyResolver,
        counter: &mut ConditionCounter,
    ) -> Result<RuleMatch, CheckError> {
        counter.charge(1);
        let value = store
            .get(rule.trim(), true, resolver)
            .map_err(|error| CheckError(error.to_string()))?;
        Ok(RuleMatch {
            matched: value.is_truthy(),
            conditions: 1,
        })
    }
}
