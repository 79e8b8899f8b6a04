use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use floodgate::{
    ActionEvent, ActionKind, CheckError, ConditionCounter, Consequence, ConsequenceError,
    ConsequenceExecutor, ConsequenceKind, Executed, ExecutionContext, ExecutorRegistry, Expiry,
    FactStore, Filter, FilterId, FilterStore, FilterPipeline, LazyResolver, MemoryLogSink,
    NullHost, PipelineConfig, RuleChecker, RuleMatch, RunOutcome, StandardResolver,
};

/// Probe-style checker that counts how often it is invoked.
struct CountingChecker {
    calls: AtomicU32,
}

impl CountingChecker {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RuleChecker for CountingChecker {
    fn check(
        &self,
        rule: &str,
        store: &mut FactStore,
        resolver: &dyn LazyResolver,
        counter: &mut ConditionCounter,
    ) -> Result<RuleMatch, CheckError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
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

fn filter_with(id: u64, rule: &str, consequences: &[(&str, &[&str])]) -> Filter {
    Filter {
        id: FilterId::Local(id),
        rule: rule.into(),
        group: "default".into(),
        description: None,
        enabled: true,
        deleted: false,
        hidden: false,
        throttled: false,
        consequences: consequences
            .iter()
            .map(|(name, params)| {
                (
                    name.to_string(),
                    params.iter().map(|p| p.to_string()).collect::<Vec<String>>(),
                )
            })
            .collect::<BTreeMap<_, _>>(),
        created_at: Utc::now(),
    }
}

fn resolver() -> Arc<StandardResolver> {
    Arc::new(StandardResolver::new(Box::new(NullHost)))
}

fn edit_facts(page: &str) -> FactStore {
    let mut facts = FactStore::new();
    facts.set("user_name", "Ada");
    facts.set("page_title", page);
    facts.set("flagged", true);
    facts
}

#[test]
fn stash_makes_the_second_evaluation_free() {
    let store = Arc::new(FilterStore::new());
    store.put_filter(filter_with(1, "flagged", &[("tag", &["seen"])]));

    let checker = Arc::new(CountingChecker::new());
    let pipeline = FilterPipeline::new(
        PipelineConfig::default(),
        store,
        checker.clone(),
        resolver(),
    );

    let action = ActionEvent::new(ActionKind::Edit, "Ada", "Main Page");

    // Speculative stash run, then the authoritative one with the same
    // stable facts (plus a differing volatile fact).
    let mut facts = edit_facts("Main Page");
    facts.set("timestamp", 1_000i64);
    pipeline.run_for_caching(&action, &mut facts).unwrap();
    assert_eq!(checker.calls(), 1);

    let mut facts = edit_facts("Main Page");
    facts.set("timestamp", 2_000i64);
    let outcome = pipeline.run_filtering(&action, &mut facts).unwrap();

    // The checker was not consulted again; the result still matched.
    assert_eq!(checker.calls(), 1);
    match outcome {
        RunOutcome::Applied { consequences, .. } => {
            assert_eq!(consequences[0].0, FilterId::Local(1));
        }
        RunOutcome::NoAction => panic!("stashed run should report the match"),
    }

    // A different page is a different logical edit and evaluates fresh.
    let mut facts = edit_facts("Other Page");
    pipeline.run_filtering(&action, &mut facts).unwrap();
    assert_eq!(checker.calls(), 2);
}

#[test]
fn non_cacheable_kinds_skip_the_stash_run() {
    let store = Arc::new(FilterStore::new());
    store.put_filter(filter_with(1, "flagged", &[("tag", &["seen"])]));

    let checker = Arc::new(CountingChecker::new());
    let pipeline = FilterPipeline::new(
        PipelineConfig::default(),
        store,
        checker.clone(),
        resolver(),
    );

    let action = ActionEvent::new(ActionKind::Delete, "Ada", "Main Page");
    let mut facts = edit_facts("Main Page");
    pipeline.run_for_caching(&action, &mut facts).unwrap();

    assert_eq!(checker.calls(), 0);
    assert!(pipeline.stash().is_empty());
}

#[test]
fn blocks_unify_across_filters_end_to_end() {
    let store = Arc::new(FilterStore::new());
    store.put_filter(filter_with(1, "flagged", &[("block", &["1 day"])]));
    store.put_filter(filter_with(2, "flagged", &[("block", &["1 week"])]));
    store.put_filter(filter_with(3, "flagged", &[("block", &["3 days"])]));

    let pipeline = FilterPipeline::new(
        PipelineConfig::default(),
        store,
        Arc::new(CountingChecker::new()),
        resolver(),
    );

    let action = ActionEvent::new(ActionKind::Edit, "Ada", "Main Page");
    let mut facts = edit_facts("Main Page");
    let outcome = pipeline.run_filtering(&action, &mut facts).unwrap();

    let RunOutcome::Applied { consequences, .. } = outcome else {
        panic!("filters should have matched");
    };
    let blocks: Vec<_> = consequences
        .iter()
        .flat_map(|(id, list)| list.iter().map(move |c| (*id, c.clone())))
        .filter(|(_, c)| matches!(c, Consequence::Block { .. }))
        .collect();
    assert_eq!(
        blocks,
        vec![(
            FilterId::Local(2),
            Consequence::Block {
                expiry: Expiry::Seconds(604_800),
                talk_page_blocked: false
            }
        )]
    );
}

#[test]
fn execution_is_reported_to_the_log_sink() {
    let store = Arc::new(FilterStore::new());
    store.put_filter(filter_with(1, "flagged", &[("disallow", &["stop"])]));

    let sink = Arc::new(MemoryLogSink::default());
    let pipeline = FilterPipeline::new(
        PipelineConfig::default(),
        store,
        Arc::new(CountingChecker::new()),
        resolver(),
    )
    .with_log_sink(sink.clone());

    let action = ActionEvent::new(ActionKind::Edit, "Ada", "Main Page");
    let mut facts = edit_facts("Main Page");
    let outcome = pipeline.run_filtering(&action, &mut facts).unwrap();

    let RunOutcome::Applied { messages, .. } = outcome else {
        panic!("filter should have matched");
    };
    assert_eq!(messages, vec!["stop".to_string()]);
    assert_eq!(
        sink.entries(),
        vec![(FilterId::Local(1), vec![ConsequenceKind::Disallow])]
    );
}

/// Executor that refuses everything it is handed.
struct RefusingExecutor;

impl ConsequenceExecutor for RefusingExecutor {
    fn execute(
        &self,
        consequence: &Consequence,
        _ctx: &ExecutionContext<'_>,
    ) -> Result<Executed, ConsequenceError> {
        Err(ConsequenceError::ExecutionFailed {
            kind: consequence.kind().to_string(),
            message: "backend rejected the request".into(),
        })
    }
}

#[test]
fn one_failing_executor_does_not_stop_the_rest() {
    let store = Arc::new(FilterStore::new());
    store.put_filter(filter_with(
        1,
        "flagged",
        &[("disallow", &["stop"]), ("tag", &["seen"])],
    ));

    let mut registry = ExecutorRegistry::with_defaults();
    registry.register(ConsequenceKind::Tag, Arc::new(RefusingExecutor));

    let sink = Arc::new(MemoryLogSink::default());
    let pipeline = FilterPipeline::new(
        PipelineConfig::default(),
        store,
        Arc::new(CountingChecker::new()),
        resolver(),
    )
    .with_executors(registry)
    .with_log_sink(sink.clone());

    let action = ActionEvent::new(ActionKind::Edit, "Ada", "Main Page");
    let mut facts = edit_facts("Main Page");
    let outcome = pipeline.run_filtering(&action, &mut facts).unwrap();

    // The disallow still executed and surfaced its message.
    let RunOutcome::Applied { messages, .. } = outcome else {
        panic!("filter should have matched");
    };
    assert_eq!(messages, vec!["stop".to_string()]);
    // Only the consequence that actually applied reaches the log sink.
    assert_eq!(
        sink.entries(),
        vec![(FilterId::Local(1), vec![ConsequenceKind::Disallow])]
    );
}

#[test]
fn overblocking_filter_is_emergency_throttled() {
    let store = Arc::new(FilterStore::new());
    store.put_filter(filter_with(1, "heavy", &[("degroup", &[]), ("tag", &["h"])]));
    store.put_filter(filter_with(2, "light", &[("degroup", &[])]));

    let mut config = PipelineConfig::default();
    config.emergency_threshold = 0.3;
    config.emergency_min_count = 20;
    config.emergency_grace = chrono::Duration::seconds(86_400);
    // Keep every run fresh: the stash would otherwise dedupe them.
    config.cacheable_actions.clear();

    let pipeline = FilterPipeline::new(
        config,
        store.clone(),
        Arc::new(CountingChecker::new()),
        resolver(),
    );

    for i in 0..100u32 {
        let action = ActionEvent::new(ActionKind::Edit, "Ada", format!("Page {i}"));
        let mut facts = FactStore::new();
        facts.set("heavy", i < 40);
        facts.set("light", i < 5);
        pipeline.run_filtering(&action, &mut facts).unwrap();
    }

    // 40/100 with threshold 0.3 and minimum 20 trips the breaker;
    // 5/100 does not.
    assert!(store.filter(FilterId::Local(1)).unwrap().throttled);
    assert!(!store.filter(FilterId::Local(2)).unwrap().throttled);

    // Going forward the throttled filter keeps its safe consequences
    // but loses the dangerous one.
    let action = ActionEvent::new(ActionKind::Edit, "Ada", "Page x");
    let mut facts = FactStore::new();
    facts.set("heavy", true);
    facts.set("light", false);
    let outcome = pipeline.run_filtering(&action, &mut facts).unwrap();
    let RunOutcome::Applied { consequences, .. } = outcome else {
        panic!("filter should still match");
    };
    let (_, list) = &consequences[0];
    assert_eq!(
        list,
        &vec![Consequence::Tag {
            tags: vec!["h".into()]
        }]
    );
}
