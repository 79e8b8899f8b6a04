//! Filter evaluation and consequence pipeline for moderating user actions.
//!
//! Operators author rules ("filters") in a small expression language; this
//! crate evaluates them against structured facts about an in-flight user
//! action (an edit, account creation, move, delete, upload) and turns the
//! union of triggered consequences into a single coherent set of effects.
//! Facts are supplied through a lazily-computed, memoized store; total
//! evaluation cost is bounded by a condition budget shared across all
//! filters in a run; repeated evaluation of the same logical edit is
//! deduplicated by a short-lived result cache; and a match-rate circuit
//! breaker contains runaway rules.
//!
//! The rule grammar itself lives outside this crate: checkers implement
//! [`RuleChecker`] and are consumed through that narrow contract.

mod action;
mod checker;
mod config;
mod consequence;
mod error;
mod executor;
mod facts;
mod filter;
mod lazy;
mod logging;
mod profiler;
mod resolver;
mod run;
mod stash;
mod value;

pub use action::{ActionEvent, ActionKind};
pub use checker::{ConditionCounter, ProbeChecker, RuleChecker, RuleMatch};
pub use config::PipelineConfig;
pub use consequence::{Consequence, ConsequenceKind, Expiry};
pub use error::{CheckError, ConfigError, ConsequenceError, FilterError, Result};
pub use executor::{
    ConsequenceExecutor, Executed, ExecutionContext, ExecutorRegistry, LogSink, MemoryLogSink,
    RecordingExecutor,
};
pub use facts::FactStore;
pub use filter::{load_filters, Filter, FilterId, FilterLookup, FilterStore};
pub use lazy::{
    Computed, ComputeMethod, Fetched, HostData, HostError, LazyDescriptor, LazyResolver, NullHost,
    StandardResolver,
};
pub use logging::init_tracing;
pub use profiler::{EmergencyWatcher, FilterProfile, Profiler};
pub use resolver::{
    resolve_consequences, MemoryThrottleLedger, MemoryWarnTracker, ResolverContext,
    ThrottleLedger, WarnTracker,
};
pub use run::{FilterPipeline, FilterRunInfo, RunOutcome, RunResult};
pub use stash::{fingerprint, EvaluationStash};
pub use value::FactValue;
