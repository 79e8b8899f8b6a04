use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::action::ActionEvent;
use crate::config::PipelineConfig;
use crate::consequence::{Consequence, ConsequenceKind, Expiry};
use crate::filter::{Filter, FilterId};

/// Tracks throttle buckets. `hit` records one occurrence and reports
/// whether the bucket is now over its rate; a bucket that is *not* over
/// is a throttle that has not yet triggered, which suppresses the
/// filter's other consequences for this run.
pub trait ThrottleLedger: Send + Sync {
    fn hit(&self, key: &str, rate: u32, period: Duration) -> bool;
}

/// Remembers which warnings a session has already been shown. The first
/// encounter shows only the warning; once seen, the filter's remaining
/// consequences take effect.
pub trait WarnTracker: Send + Sync {
    fn seen_before(&self, session: Option<&str>, filter: FilterId) -> bool;
    fn mark_seen(&self, session: Option<&str>, filter: FilterId);
}

/// In-memory throttle ledger with per-bucket fixed windows.
#[derive(Default)]
pub struct MemoryThrottleLedger {
    buckets: RwLock<HashMap<String, (u32, Instant)>>,
}

impl ThrottleLedger for MemoryThrottleLedger {
    fn hit(&self, key: &str, rate: u32, period: Duration) -> bool {
        let mut buckets = self.buckets.write();
        let now = Instant::now();
        let entry = buckets.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) > period {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.0 > rate
    }
}

/// In-memory warn tracker keyed by (session, filter).
#[derive(Default)]
pub struct MemoryWarnTracker {
    seen: RwLock<std::collections::HashSet<(String, FilterId)>>,
}

impl WarnTracker for MemoryWarnTracker {
    fn seen_before(&self, session: Option<&str>, filter: FilterId) -> bool {
        match session {
            Some(session) => self.seen.read().contains(&(session.to_string(), filter)),
            None => false,
        }
    }

    fn mark_seen(&self, session: Option<&str>, filter: FilterId) {
        if let Some(session) = session {
            self.seen.write().insert((session.to_string(), filter));
        }
    }
}

/// Everything the resolver needs besides the matched filters themselves.
pub struct ResolverContext<'a> {
    pub config: &'a PipelineConfig,
    pub action: &'a ActionEvent,
    pub throttles: &'a dyn ThrottleLedger,
    pub warns: &'a dyn WarnTracker,
}

/// Reduce the raw consequence declarations of all matched filters to a
/// coherent, non-contradictory set.
///
/// The reduction applies, in order: remote-origin policy filtering,
/// suppression of dangerous kinds on emergency-throttled filters,
/// disallow suppression, block unification across filters, and
/// disabling-consequence precedence. What remains is bound and returned
/// per filter.
pub fn resolve_consequences(
    matched: &[Arc<Filter>],
    ctx: &ResolverContext<'_>,
) -> Vec<(FilterId, Vec<Consequence>)> {
    let mut resolved: Vec<(FilterId, Vec<Consequence>)> = Vec::with_capacity(matched.len());

    for filter in matched {
        let mut consequences = Vec::new();
        for (name, params) in &filter.consequences {
            let kind = ConsequenceKind::parse(name);

            if filter.id.is_global() && ctx.config.remote_suppressed_kinds.contains(&kind) {
                debug!(filter = %filter.id, consequence = %kind, "suppressed for remote-origin filter");
                continue;
            }
            if filter.throttled && ctx.config.dangerous_kinds.contains(&kind) {
                debug!(filter = %filter.id, consequence = %kind, "suppressed on emergency-throttled filter");
                continue;
            }

            match Consequence::from_raw(name, params) {
                Ok(consequence) => consequences.push(consequence),
                Err(error) => {
                    warn!(filter = %filter.id, consequence = %name, %error, "skipping malformed consequence declaration");
                }
            }
        }

        // A dangerous action subsumes the disallow message.
        let has_dangerous = consequences
            .iter()
            .any(|c| ctx.config.dangerous_kinds.contains(&c.kind()));
        if has_dangerous {
            consequences.retain(|c| !matches!(c, Consequence::Disallow { .. }));
        }

        resolved.push((filter.id, consequences));
    }

    unify_blocks(&mut resolved);

    for (id, consequences) in resolved.iter_mut() {
        apply_disabling_precedence(*id, consequences, ctx);
    }

    resolved
}

/// Keep a single block, the one with the longest requested expiry,
/// attributed to the filter that requested it. Everyone else's blocks are
/// dropped: one action never needs more than one block.
fn unify_blocks(resolved: &mut [(FilterId, Vec<Consequence>)]) {
    let mut winner: Option<(usize, Consequence, Expiry)> = None;
    for (index, (_, consequences)) in resolved.iter().enumerate() {
        for consequence in consequences {
            if let Consequence::Block { expiry, .. } = consequence {
                let longer = match &winner {
                    Some((_, _, best)) => expiry > best,
                    None => true,
                };
                if longer {
                    winner = Some((index, consequence.clone(), *expiry));
                }
            }
        }
    }

    let Some((winning_index, winning_block, _)) = winner else {
        return;
    };
    for (index, (_, consequences)) in resolved.iter_mut().enumerate() {
        consequences.retain(|c| !matches!(c, Consequence::Block { .. }));
        if index == winning_index {
            consequences.push(winning_block.clone());
        }
    }
}

/// Evaluate disabling consequences in priority order. The first one that
/// has not yet triggered replaces the filter's whole set; ones that have
/// already triggered are dropped so the remaining consequences fire.
fn apply_disabling_precedence(
    id: FilterId,
    consequences: &mut Vec<Consequence>,
    ctx: &ResolverContext<'_>,
) {
    loop {
        let candidate = consequences
            .iter()
            .enumerate()
            .filter_map(|(index, c)| c.disabling_priority().map(|priority| (priority, index)))
            .min();
        let Some((_, index)) = candidate else {
            return;
        };

        let picked = consequences[index].clone();
        match picked {
            Consequence::Throttle {
                ref bucket,
                rate,
                period_secs,
                ref dimensions,
            } => {
                let key = throttle_key(bucket, dimensions, ctx.action);
                let period = Duration::from_secs(period_secs.max(0) as u64);
                if ctx.throttles.hit(&key, rate, period) {
                    // Over threshold: the throttle has done its job, the
                    // other consequences take effect.
                    consequences.remove(index);
                } else {
                    debug!(filter = %id, bucket = %bucket, "throttle below rate, suppressing other consequences");
                    consequences.clear();
                    consequences.push(picked);
                    return;
                }
            }
            Consequence::Warn { .. } => {
                if ctx.warns.seen_before(ctx.action.session.as_deref(), id) {
                    consequences.remove(index);
                } else {
                    debug!(filter = %id, "warning not yet shown, suppressing other consequences");
                    consequences.clear();
                    consequences.push(picked);
                    return;
                }
            }
            other => {
                // disabling_priority and this match must agree.
                unreachable!("non-disabling consequence {:?} selected", other.kind());
            }
        }
    }
}

/// Build the ledger key for a throttle bucket from its dimensions.
fn throttle_key(bucket: &str, dimensions: &[String], action: &ActionEvent) -> String {
    let mut parts = vec![bucket.to_string()];
    for dimension in dimensions {
        let value = match dimension.as_str() {
            "user" => action.actor.clone(),
            "page" | "title" => action.target.clone(),
            "ip" => action.ip.clone().unwrap_or_else(|| action.actor.clone()),
            "site" => "site".to_string(),
            other => other.to_string(),
        };
        parts.push(value);
    }
    parts.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn filter_with(id: FilterId, consequences: &[(&str, &[&str])]) -> Arc<Filter> {
        Arc::new(Filter {
            id,
            rule: "probe".into(),
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
        })
    }

    struct NeverOver;
    impl ThrottleLedger for NeverOver {
        fn hit(&self, _: &str, _: u32, _: Duration) -> bool {
            false
        }
    }

    struct AlwaysOver;
    impl ThrottleLedger for AlwaysOver {
        fn hit(&self, _: &str, _: u32, _: Duration) -> bool {
            true
        }
    }

    fn ctx<'a>(
        config: &'a PipelineConfig,
        action: &'a ActionEvent,
        throttles: &'a dyn ThrottleLedger,
        warns: &'a dyn WarnTracker,
    ) -> ResolverContext<'a> {
        ResolverContext {
            config,
            action,
            throttles,
            warns,
        }
    }

    fn edit_action() -> ActionEvent {
        ActionEvent::new(ActionKind::Edit, "Ada", "Main Page").with_session("s-1")
    }

    #[test]
    fn disallow_is_subsumed_by_dangerous_action() {
        let config = PipelineConfig::default();
        let action = edit_action();
        let warns = MemoryWarnTracker::default();
        let filters = vec![filter_with(
            FilterId::Local(1),
            &[("disallow", &[]), ("degroup", &[])],
        )];

        let resolved = resolve_consequences(&filters, &ctx(&config, &action, &NeverOver, &warns));
        assert_eq!(resolved[0].1, vec![Consequence::Degroup]);
    }

    #[test]
    fn blocks_unify_to_the_longest_expiry() {
        let config = PipelineConfig::default();
        let action = edit_action();
        let warns = MemoryWarnTracker::default();
        let filters = vec![
            filter_with(FilterId::Local(1), &[("block", &["1 day"])]),
            filter_with(FilterId::Local(2), &[("block", &["1 week"])]),
            filter_with(FilterId::Local(3), &[("block", &["3 days"])]),
        ];

        let resolved = resolve_consequences(&filters, &ctx(&config, &action, &NeverOver, &warns));
        assert!(resolved[0].1.is_empty());
        assert!(resolved[2].1.is_empty());
        assert_eq!(
            resolved[1].1,
            vec![Consequence::Block {
                expiry: Expiry::Seconds(604_800),
                talk_page_blocked: false
            }]
        );
    }

    #[test]
    fn pending_throttle_suppresses_warn_and_everything_else() {
        let config = PipelineConfig::default();
        let action = edit_action();
        let warns = MemoryWarnTracker::default();
        let filters = vec![filter_with(
            FilterId::Local(4),
            &[
                ("throttle", &["bucket", "3,60", "user"]),
                ("warn", &["be-careful"]),
                ("tag", &["flagged"]),
            ],
        )];

        let resolved = resolve_consequences(&filters, &ctx(&config, &action, &NeverOver, &warns));
        assert_eq!(resolved[0].1.len(), 1);
        assert!(matches!(resolved[0].1[0], Consequence::Throttle { .. }));
    }

    #[test]
    fn triggered_throttle_falls_through_to_warn() {
        let config = PipelineConfig::default();
        let action = edit_action();
        let warns = MemoryWarnTracker::default();
        let filters = vec![filter_with(
            FilterId::Local(4),
            &[
                ("throttle", &["bucket", "3,60", "user"]),
                ("warn", &["be-careful"]),
                ("tag", &["flagged"]),
            ],
        )];

        let resolved = resolve_consequences(&filters, &ctx(&config, &action, &AlwaysOver, &warns));
        // Throttle spent; warning not yet shown, so it suppresses the tag.
        assert_eq!(
            resolved[0].1,
            vec![Consequence::Warn {
                message: "be-careful".into()
            }]
        );
    }

    #[test]
    fn seen_warning_lets_other_consequences_fire() {
        let config = PipelineConfig::default();
        let action = edit_action();
        let warns = MemoryWarnTracker::default();
        warns.mark_seen(Some("s-1"), FilterId::Local(4));
        let filters = vec![filter_with(
            FilterId::Local(4),
            &[("warn", &["be-careful"]), ("tag", &["flagged"])],
        )];

        let resolved = resolve_consequences(&filters, &ctx(&config, &action, &NeverOver, &warns));
        assert_eq!(
            resolved[0].1,
            vec![Consequence::Tag {
                tags: vec!["flagged".into()]
            }]
        );
    }

    #[test]
    fn remote_filters_cannot_trigger_suppressed_kinds() {
        let config = PipelineConfig::default();
        let action = edit_action();
        let warns = MemoryWarnTracker::default();
        let filters = vec![filter_with(
            FilterId::Global(9),
            &[("block", &["1 week"]), ("tag", &["remote-hit"])],
        )];

        let resolved = resolve_consequences(&filters, &ctx(&config, &action, &NeverOver, &warns));
        assert_eq!(
            resolved[0].1,
            vec![Consequence::Tag {
                tags: vec!["remote-hit".into()]
            }]
        );
    }

    #[test]
    fn throttled_filter_loses_dangerous_consequences_only() {
        let config = PipelineConfig::default();
        let action = edit_action();
        let warns = MemoryWarnTracker::default();
        let mut filter = Filter::clone(&filter_with(
            FilterId::Local(6),
            &[("degroup", &[]), ("tag", &["still-tagged"])],
        ));
        filter.throttled = true;
        let filters = vec![Arc::new(filter)];

        let resolved = resolve_consequences(&filters, &ctx(&config, &action, &NeverOver, &warns));
        assert_eq!(
            resolved[0].1,
            vec![Consequence::Tag {
                tags: vec!["still-tagged".into()]
            }]
        );
    }

    #[test]
    fn memory_ledger_trips_after_rate_is_passed() {
        let ledger = MemoryThrottleLedger::default();
        let period = Duration::from_secs(60);
        assert!(!ledger.hit("b:Ada", 2, period));
        assert!(!ledger.hit("b:Ada", 2, period));
        assert!(ledger.hit("b:Ada", 2, period));
        // Different key tracks separately.
        assert!(!ledger.hit("b:Eve", 2, period));
    }
}
