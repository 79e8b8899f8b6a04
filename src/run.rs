use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::action::ActionEvent;
use crate::checker::{ConditionCounter, RuleChecker, RuleMatch};
use crate::config::PipelineConfig;
use crate::consequence::Consequence;
use crate::error::{FilterError, Result};
use crate::executor::{ExecutionContext, ExecutorRegistry, LogSink, MemoryLogSink};
use crate::facts::FactStore;
use crate::filter::{Filter, FilterId, FilterLookup};
use crate::lazy::LazyResolver;
use crate::profiler::{EmergencyWatcher, Profiler};
use crate::resolver::{
    resolve_consequences, MemoryThrottleLedger, MemoryWarnTracker, ResolverContext, ThrottleLedger,
    WarnTracker,
};
use crate::stash::{fingerprint, EvaluationStash};

/// Ledger entry for one filter within one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRunInfo {
    pub matched: bool,
    pub conditions: u32,
    /// Wall-clock time attributed to this filter, with host-shared work
    /// already subtracted.
    pub elapsed: Duration,
}

/// Mutable ledger built up while iterating a run's filters, then frozen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub filters: BTreeMap<FilterId, FilterRunInfo>,
    pub total_conditions: u32,
    pub total_time: Duration,
    pub hit_condition_limit: bool,
}

impl RunResult {
    pub fn record(&mut self, id: FilterId, info: FilterRunInfo) {
        self.total_time += info.elapsed;
        self.filters.insert(id, info);
    }

    pub fn matched_ids(&self) -> Vec<FilterId> {
        self.filters
            .iter()
            .filter(|(_, info)| info.matched)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn any_matched(&self) -> bool {
        self.filters.values().any(|info| info.matched)
    }
}

/// What the caller gets back from a filtering run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// No filter matched, or every matched filter resolved to nothing.
    NoAction,
    /// Consequences were resolved and executed.
    Applied {
        consequences: Vec<(FilterId, Vec<Consequence>)>,
        /// User-facing texts surfaced by the executed consequences.
        messages: Vec<String>,
    },
}

/// The filter-evaluation and consequence pipeline.
///
/// Wires the fact store, the external rule checker, the filter lookup,
/// the result stash, the consequence resolver/executors and the
/// profiler into the two operations the host calls. One pipeline serves
/// many concurrent actions; each action brings its own [`FactStore`].
pub struct FilterPipeline {
    config: PipelineConfig,
    lookup: Arc<dyn FilterLookup>,
    checker: Arc<dyn RuleChecker>,
    resolver: Arc<dyn LazyResolver + Send + Sync>,
    stash: EvaluationStash,
    profiler: Profiler,
    watcher: EmergencyWatcher,
    throttles: Arc<dyn ThrottleLedger>,
    warns: Arc<dyn WarnTracker>,
    executors: ExecutorRegistry,
    sink: Arc<dyn LogSink>,
}

impl FilterPipeline {
    pub fn new(
        config: PipelineConfig,
        lookup: Arc<dyn FilterLookup>,
        checker: Arc<dyn RuleChecker>,
        resolver: Arc<dyn LazyResolver + Send + Sync>,
    ) -> Self {
        let stash = EvaluationStash::new(config.stash_ttl);
        let profiler = Profiler::from_config(&config);
        let watcher = EmergencyWatcher::from_config(&config);
        Self {
            lookup,
            checker,
            resolver,
            stash,
            profiler,
            watcher,
            throttles: Arc::new(MemoryThrottleLedger::default()),
            warns: Arc::new(MemoryWarnTracker::default()),
            executors: ExecutorRegistry::with_defaults(),
            sink: Arc::new(MemoryLogSink::default()),
            config,
        }
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_throttle_ledger(mut self, ledger: Arc<dyn ThrottleLedger>) -> Self {
        self.throttles = ledger;
        self
    }

    pub fn with_warn_tracker(mut self, tracker: Arc<dyn WarnTracker>) -> Self {
        self.warns = tracker;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn stash(&self) -> &EvaluationStash {
        &self.stash
    }

    /// Evaluate all filters for this action and apply the resolved
    /// consequences.
    pub fn run_filtering(
        &self,
        action: &ActionEvent,
        facts: &mut FactStore,
    ) -> Result<RunOutcome> {
        let result = self.evaluate(action, facts)?;
        self.profiler.record_run(&action.group, &result);

        let matched = self.matched_filters(&result, &action.group);

        // Circuit-breaker side channel: overblocking filters lose their
        // dangerous consequences from the next run on.
        for id in self
            .watcher
            .overshooting(&self.profiler, &action.group, &matched, Utc::now())
        {
            warn!(filter = %id, "emergency throttling overblocking filter");
            self.lookup.throttle_filter(id);
        }

        if matched.is_empty() {
            return Ok(RunOutcome::NoAction);
        }

        let ctx = ResolverContext {
            config: &self.config,
            action,
            throttles: self.throttles.as_ref(),
            warns: self.warns.as_ref(),
        };
        let mut consequences = resolve_consequences(&matched, &ctx);
        consequences.retain(|(_, list)| !list.is_empty());
        if consequences.is_empty() {
            // Filters matched but every declaration resolved away (none
            // authored, suppressed, or unified into another filter's set).
            return Ok(RunOutcome::NoAction);
        }
        let messages = self.execute_all(action, &consequences);

        Ok(RunOutcome::Applied {
            consequences,
            messages,
        })
    }

    /// Stash-only variant: evaluates and seeds the result cache so the
    /// authoritative run can reuse it, but never resolves or applies
    /// consequences.
    pub fn run_for_caching(&self, action: &ActionEvent, facts: &mut FactStore) -> Result<()> {
        if !self.config.cacheable_actions.contains(&action.kind) {
            debug!(action = %action.kind, "action kind is not cacheable, skipping stash run");
            return Ok(());
        }
        self.evaluate(action, facts)?;
        Ok(())
    }

    /// One full evaluation, wrapped by the stash for cacheable kinds.
    fn evaluate(&self, action: &ActionEvent, facts: &mut FactStore) -> Result<RunResult> {
        let cacheable = self.config.cacheable_actions.contains(&action.kind);
        let key = cacheable.then(|| fingerprint(facts, &self.config.volatile_facts));

        if let Some(key) = &key {
            if let Some(result) = self.stash.seek(key) {
                debug!(action = %action.kind, "reusing stashed evaluation");
                return Ok(result);
            }
        }

        let result = self.run_all(action, facts)?;
        if let Some(key) = &key {
            self.stash.store(key, result.clone());
        }
        Ok(result)
    }

    fn run_all(&self, action: &ActionEvent, facts: &mut FactStore) -> Result<RunResult> {
        let mut counter = ConditionCounter::new(self.config.condition_limit);
        let mut result = RunResult::default();

        let local = self.lookup.active_filters(&action.group, false);
        self.run_pass(&local, facts, &mut counter, &mut result);

        if self.config.run_global && !self.config.is_global_authority {
            let global = self.lookup.active_filters(&action.group, true);
            self.run_pass(&global, facts, &mut counter, &mut result);
        }

        result.total_conditions = counter.used();
        result.hit_condition_limit = counter.limit_exceeded();
        if result.hit_condition_limit {
            // Informational: every filter already got its chance to run.
            warn!(
                "{}",
                FilterError::ConditionLimitExceeded {
                    used: counter.used(),
                    limit: counter.limit(),
                }
            );
        }
        Ok(result)
    }

    fn run_pass(
        &self,
        filters: &[Arc<Filter>],
        facts: &mut FactStore,
        counter: &mut ConditionCounter,
        result: &mut RunResult,
    ) {
        for filter in filters {
            let start = Instant::now();
            let rule_match = match self.checker.check(
                &filter.rule,
                facts,
                self.resolver.as_ref(),
                counter,
            ) {
                Ok(rule_match) => rule_match,
                Err(error) => {
                    warn!(filter = %filter.id, %error, "rule checker failed, treating as non-match");
                    RuleMatch {
                        matched: false,
                        conditions: 0,
                    }
                }
            };

            let uncharged = facts.take_uncharged();
            let elapsed = start.elapsed().checked_sub(uncharged).unwrap_or(Duration::ZERO);
            if rule_match.matched {
                debug!(filter = %filter.id, "filter matched");
            }
            result.record(
                filter.id,
                FilterRunInfo {
                    matched: rule_match.matched,
                    conditions: rule_match.conditions,
                    elapsed,
                },
            );
        }
    }

    /// Map a run result's matched ids back to filter snapshots. Works for
    /// stash-restored results too; filters deleted since the stashed run
    /// simply drop out.
    fn matched_filters(&self, result: &RunResult, group: &str) -> Vec<Arc<Filter>> {
        let mut pool = self.lookup.active_filters(group, false);
        if self.config.run_global && !self.config.is_global_authority {
            pool.extend(self.lookup.active_filters(group, true));
        }
        pool.into_iter()
            .filter(|filter| {
                result
                    .filters
                    .get(&filter.id)
                    .map_or(false, |info| info.matched)
            })
            .collect()
    }

    fn execute_all(
        &self,
        action: &ActionEvent,
        resolved: &[(FilterId, Vec<Consequence>)],
    ) -> Vec<String> {
        let mut messages = Vec::new();
        for (id, consequences) in resolved {
            let mut taken = Vec::new();
            for consequence in consequences {
                let ctx = ExecutionContext {
                    filter: *id,
                    action,
                };
                match self.executors.execute(consequence, &ctx) {
                    Ok(executed) => {
                        if executed.applied {
                            taken.push(consequence.kind());
                            if let Some(message) = executed.message {
                                messages.push(message);
                            }
                            if matches!(consequence, Consequence::Warn { .. }) {
                                self.warns.mark_seen(action.session.as_deref(), *id);
                            }
                        }
                    }
                    Err(error) => {
                        // One failed consequence never rolls back the
                        // others; they are independent by design.
                        warn!(
                            filter = %id,
                            consequence = %consequence.kind(),
                            %error,
                            "consequence execution failed"
                        );
                    }
                }
            }
            self.sink.record(*id, &taken);
        }
        messages
    }
}
