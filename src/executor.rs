use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::action::ActionEvent;
use crate::consequence::{Consequence, ConsequenceKind};
use crate::error::ConsequenceError;
use crate::filter::FilterId;

/// Parameters bound to one consequence execution.
pub struct ExecutionContext<'a> {
    pub filter: FilterId,
    pub action: &'a ActionEvent,
}

/// Outcome of applying one consequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
    pub applied: bool,
    /// Text to surface to the acting user, if any.
    pub message: Option<String>,
}

impl Executed {
    pub fn applied() -> Self {
        Self {
            applied: true,
            message: None,
        }
    }

    pub fn applied_with_message(message: impl Into<String>) -> Self {
        Self {
            applied: true,
            message: Some(message.into()),
        }
    }

    pub fn skipped() -> Self {
        Self {
            applied: false,
            message: None,
        }
    }
}

/// Capability interface for applying one consequence kind. Implementations
/// live host-side (issuing blocks, removing groups, registering tags) and
/// must tolerate being retried.
pub trait ConsequenceExecutor: Send + Sync {
    fn execute(
        &self,
        consequence: &Consequence,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Executed, ConsequenceError>;
}

/// Dispatch table from consequence kind to executor. Custom kinds get
/// their own table keyed by name.
#[derive(Default)]
pub struct ExecutorRegistry {
    handlers: HashMap<ConsequenceKind, Arc<dyn ConsequenceExecutor>>,
    custom: HashMap<String, Arc<dyn ConsequenceExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the message-bearing kinds pre-wired so warn and
    /// disallow surface their text even before the host registers real
    /// side-effecting executors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        let messenger: Arc<dyn ConsequenceExecutor> = Arc::new(MessageExecutor);
        registry.register(ConsequenceKind::Warn, messenger.clone());
        registry.register(ConsequenceKind::Disallow, messenger);
        registry
    }

    pub fn register(&mut self, kind: ConsequenceKind, executor: Arc<dyn ConsequenceExecutor>) {
        self.handlers.insert(kind, executor);
    }

    pub fn register_custom(&mut self, name: &str, executor: Arc<dyn ConsequenceExecutor>) {
        self.custom.insert(name.to_string(), executor);
    }

    /// Apply one consequence. A missing handler is logged and reported as
    /// not applied; it never fails the surrounding run.
    pub fn execute(
        &self,
        consequence: &Consequence,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Executed, ConsequenceError> {
        let handler = match consequence {
            Consequence::Custom { name, .. } => self.custom.get(name),
            other => self.handlers.get(&other.kind()),
        };
        match handler {
            Some(handler) => handler.execute(consequence, ctx),
            None => {
                warn!(
                    filter = %ctx.filter,
                    consequence = %consequence.kind(),
                    "no executor registered, consequence not applied"
                );
                Ok(Executed::skipped())
            }
        }
    }
}

/// Executor for the purely message-bearing kinds.
struct MessageExecutor;

impl ConsequenceExecutor for MessageExecutor {
    fn execute(
        &self,
        consequence: &Consequence,
        _ctx: &ExecutionContext<'_>,
    ) -> Result<Executed, ConsequenceError> {
        match consequence {
            Consequence::Warn { message } | Consequence::Disallow { message } => {
                Ok(Executed::applied_with_message(message.clone()))
            }
            other => Err(ConsequenceError::ExecutionFailed {
                kind: other.kind().to_string(),
                message: "message executor only handles warn/disallow".into(),
            }),
        }
    }
}

/// Test-friendly executor that records everything it is asked to apply.
#[derive(Default)]
pub struct RecordingExecutor {
    applied: RwLock<Vec<(FilterId, ConsequenceKind)>>,
}

impl RecordingExecutor {
    pub fn applied(&self) -> Vec<(FilterId, ConsequenceKind)> {
        self.applied.read().clone()
    }
}

impl ConsequenceExecutor for RecordingExecutor {
    fn execute(
        &self,
        consequence: &Consequence,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Executed, ConsequenceError> {
        self.applied.write().push((ctx.filter, consequence.kind()));
        match consequence {
            Consequence::Warn { message } | Consequence::Disallow { message } => {
                Ok(Executed::applied_with_message(message.clone()))
            }
            _ => Ok(Executed::applied()),
        }
    }
}

/// Receives the per-filter record of actions actually taken, after
/// execution. This is the single source of truth for logging and
/// notification collaborators.
pub trait LogSink: Send + Sync {
    fn record(&self, filter: FilterId, actions: &[ConsequenceKind]);
}

/// In-memory sink for tests and hosts without a log pipeline.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: RwLock<Vec<(FilterId, Vec<ConsequenceKind>)>>,
}

impl MemoryLogSink {
    pub fn entries(&self) -> Vec<(FilterId, Vec<ConsequenceKind>)> {
        self.entries.read().clone()
    }
}

impl LogSink for MemoryLogSink {
    fn record(&self, filter: FilterId, actions: &[ConsequenceKind]) {
        self.entries.write().push((filter, actions.to_vec()));
    }
}
