use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::filter::{Filter, FilterId};
use crate::run::RunResult;

/// Running totals for one filter within one group window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterProfile {
    pub runs: u64,
    pub matches: u64,
    pub total_conditions: u64,
    pub total_time: Duration,
}

struct GroupRecord {
    total_actions: u64,
    filters: HashMap<FilterId, FilterProfile>,
    started_at: Instant,
}

impl GroupRecord {
    fn fresh() -> Self {
        Self {
            total_actions: 0,
            filters: HashMap::new(),
            started_at: Instant::now(),
        }
    }
}

/// Aggregates match-rate statistics per filter and per group.
///
/// Counters live in bounded windows: a group record is reset once it is
/// older than the TTL or its action total passes the cap, so long-lived
/// counters can neither grow without bound nor skew the rates the
/// emergency watcher reads. The whole merge happens under one write lock,
/// so concurrent runs never lose updates.
pub struct Profiler {
    groups: RwLock<HashMap<String, GroupRecord>>,
    cap: u64,
    ttl: Duration,
}

impl Profiler {
    pub fn new(cap: u64, ttl: Duration) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            cap,
            ttl,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.profile_cap, config.profile_ttl)
    }

    /// Fold one run's accumulator into the group's window.
    pub fn record_run(&self, group: &str, result: &RunResult) {
        let mut groups = self.groups.write();
        let record = groups
            .entry(group.to_string())
            .or_insert_with(GroupRecord::fresh);

        if record.started_at.elapsed() > self.ttl || record.total_actions >= self.cap {
            debug!(%group, "resetting stale or capped profile window");
            *record = GroupRecord::fresh();
        }

        record.total_actions += 1;
        for (id, info) in &result.filters {
            let profile = record.filters.entry(*id).or_default();
            profile.runs += 1;
            if info.matched {
                profile.matches += 1;
            }
            profile.total_conditions += u64::from(info.conditions);
            profile.total_time += info.elapsed;
        }
    }

    pub fn filter_profile(&self, group: &str, id: FilterId) -> Option<FilterProfile> {
        self.groups
            .read()
            .get(group)
            .and_then(|record| record.filters.get(&id))
            .cloned()
    }

    /// Total actions observed in the group's current window.
    pub fn group_total(&self, group: &str) -> u64 {
        self.groups
            .read()
            .get(group)
            .map(|record| record.total_actions)
            .unwrap_or(0)
    }
}

/// Circuit breaker against overblocking filters.
///
/// A filter whose match rate in the current window passes the threshold,
/// with enough absolute matches, and which is still inside its grace age,
/// gets its dangerous consequences disabled. Decoupled from the author:
/// nobody has to notice a runaway rule for it to be contained.
pub struct EmergencyWatcher {
    threshold: f64,
    min_count: u64,
    grace: chrono::Duration,
}

impl EmergencyWatcher {
    pub fn new(threshold: f64, min_count: u64, grace: chrono::Duration) -> Self {
        Self {
            threshold,
            min_count,
            grace,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.emergency_threshold,
            config.emergency_min_count,
            config.emergency_grace,
        )
    }

    /// The subset of just-matched filters that are overblocking and must
    /// be throttled. Only young local filters qualify: old filters have
    /// earned trust, and remote ones are governed by their own authority.
    pub fn overshooting(
        &self,
        profiler: &Profiler,
        group: &str,
        matched: &[Arc<Filter>],
        now: DateTime<Utc>,
    ) -> Vec<FilterId> {
        let total = profiler.group_total(group);
        if total == 0 {
            return Vec::new();
        }

        matched
            .iter()
            .filter(|filter| !filter.id.is_global() && !filter.throttled)
            .filter(|filter| filter.age(now) < self.grace)
            .filter(|filter| {
                let Some(profile) = profiler.filter_profile(group, filter.id) else {
                    return false;
                };
                let rate = profile.matches as f64 / total as f64;
                rate > self.threshold && profile.matches >= self.min_count
            })
            .map(|filter| filter.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::FilterRunInfo;
    use std::collections::BTreeMap;

    fn young_filter(id: FilterId) -> Arc<Filter> {
        Arc::new(Filter {
            id,
            rule: "probe".into(),
            group: "default".into(),
            description: None,
            enabled: true,
            deleted: false,
            hidden: false,
            throttled: false,
            consequences: BTreeMap::new(),
            created_at: Utc::now(),
        })
    }

    fn run_with(matches: &[(FilterId, bool)]) -> RunResult {
        let mut result = RunResult::default();
        for (id, matched) in matches {
            result.record(
                *id,
                FilterRunInfo {
                    matched: *matched,
                    conditions: 2,
                    elapsed: Duration::from_millis(1),
                },
            );
        }
        result
    }

    #[test]
    fn profiles_accumulate_across_runs() {
        let profiler = Profiler::new(10_000, Duration::from_secs(3_600));
        let id = FilterId::Local(1);
        profiler.record_run("default", &run_with(&[(id, true)]));
        profiler.record_run("default", &run_with(&[(id, false)]));

        let profile = profiler.filter_profile("default", id).unwrap();
        assert_eq!(profile.runs, 2);
        assert_eq!(profile.matches, 1);
        assert_eq!(profile.total_conditions, 4);
        assert_eq!(profiler.group_total("default"), 2);
    }

    #[test]
    fn capped_window_resets_counters() {
        let profiler = Profiler::new(2, Duration::from_secs(3_600));
        let id = FilterId::Local(1);
        for _ in 0..3 {
            profiler.record_run("default", &run_with(&[(id, true)]));
        }
        // Third record hit the cap and started a fresh window.
        assert_eq!(profiler.group_total("default"), 1);
        assert_eq!(profiler.filter_profile("default", id).unwrap().matches, 1);
    }

    #[test]
    fn emergency_trips_on_heavy_matchers_only() {
        let profiler = Profiler::new(10_000, Duration::from_secs(3_600));
        let heavy = FilterId::Local(1);
        let light = FilterId::Local(2);

        for i in 0..100u32 {
            let heavy_matched = i < 40;
            let light_matched = i < 5;
            profiler.record_run(
                "default",
                &run_with(&[(heavy, heavy_matched), (light, light_matched)]),
            );
        }

        let watcher = EmergencyWatcher::new(0.3, 20, chrono::Duration::seconds(86_400));
        let matched = vec![young_filter(heavy), young_filter(light)];
        let throttle = watcher.overshooting(&profiler, "default", &matched, Utc::now());
        assert_eq!(throttle, vec![heavy]);
    }

    #[test]
    fn old_filters_are_trusted() {
        let profiler = Profiler::new(10_000, Duration::from_secs(3_600));
        let id = FilterId::Local(1);
        for _ in 0..50 {
            profiler.record_run("default", &run_with(&[(id, true)]));
        }

        let watcher = EmergencyWatcher::new(0.05, 2, chrono::Duration::seconds(3_600));
        let mut old = Filter::clone(&young_filter(id));
        old.created_at = Utc::now() - chrono::Duration::seconds(7_200);
        let throttle = watcher.overshooting(&profiler, "default", &[Arc::new(old)], Utc::now());
        assert!(throttle.is_empty());
    }
}
