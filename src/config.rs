use std::collections::HashSet;
use std::env;
use std::time::Duration;

use crate::action::ActionKind;
use crate::consequence::ConsequenceKind;
use crate::error::ConfigError;

/// Pipeline-wide tunables.
///
/// Defaults are usable as-is; `from_env` overlays overrides from
/// `FLOODGATE_`-prefixed environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Shared evaluation budget across all filters in one run.
    pub condition_limit: u32,
    /// How long a stashed run result stays valid.
    pub stash_ttl: Duration,
    /// Action kinds whose runs go through the result cache.
    pub cacheable_actions: HashSet<ActionKind>,
    /// Fact names excluded from the stash fingerprint because they vary
    /// between two evaluations of the same logical edit.
    pub volatile_facts: HashSet<String>,
    /// Consequence kinds considered dangerous: they subsume `disallow`
    /// and are what the emergency watcher switches off.
    pub dangerous_kinds: HashSet<ConsequenceKind>,
    /// Consequence kinds suppressed when declared by a remote-origin
    /// (global) filter.
    pub remote_suppressed_kinds: HashSet<ConsequenceKind>,
    /// Whether runs also consult the shared cross-instance filter set.
    pub run_global: bool,
    /// Whether this instance is itself the authority for the shared set
    /// (the authority never re-runs its own filters as remote).
    pub is_global_authority: bool,
    /// Emergency watcher: minimum match rate before a filter is
    /// considered overblocking.
    pub emergency_threshold: f64,
    /// Emergency watcher: minimum absolute match count.
    pub emergency_min_count: u64,
    /// Emergency watcher: filters older than this are trusted.
    pub emergency_grace: chrono::Duration,
    /// Profiler: group-level action total that triggers a counter reset.
    pub profile_cap: u64,
    /// Profiler: counters older than this are stale.
    pub profile_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            condition_limit: 1_000,
            stash_ttl: Duration::from_secs(60),
            cacheable_actions: HashSet::from([ActionKind::Edit]),
            volatile_facts: ["timestamp", "page_views", "user_age", "page_age"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            dangerous_kinds: HashSet::from([
                ConsequenceKind::Block,
                ConsequenceKind::RangeBlock,
                ConsequenceKind::Degroup,
                ConsequenceKind::BlockAutopromote,
            ]),
            remote_suppressed_kinds: HashSet::from([
                ConsequenceKind::Block,
                ConsequenceKind::RangeBlock,
                ConsequenceKind::Degroup,
                ConsequenceKind::BlockAutopromote,
            ]),
            run_global: false,
            is_global_authority: false,
            emergency_threshold: 0.05,
            emergency_min_count: 2,
            emergency_grace: chrono::Duration::seconds(86_400),
            profile_cap: 10_000,
            profile_ttl: Duration::from_secs(3_600),
        }
    }
}

impl PipelineConfig {
    /// Loads configuration overrides from `FLOODGATE_`-prefixed
    /// environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_prefix("FLOODGATE_")
    }

    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let key = |suffix: &str| format!("{prefix}{suffix}");

        let mut config = Self::default();

        if let Some(limit) = read_parsed(&key("CONDITION_LIMIT"))? {
            config.condition_limit = limit;
        }
        if let Some(secs) = read_parsed(&key("STASH_TTL_SECS"))? {
            config.stash_ttl = Duration::from_secs(secs);
        }
        if let Ok(raw) = env::var(key("CACHEABLE_ACTIONS")) {
            let env_key = key("CACHEABLE_ACTIONS");
            let mut kinds = HashSet::new();
            for part in raw.split(',').filter(|part| !part.trim().is_empty()) {
                let kind = ActionKind::parse(part).ok_or_else(|| ConfigError::InvalidEnvVar {
                    key: env_key.clone(),
                    message: format!("unknown action kind '{part}'"),
                })?;
                kinds.insert(kind);
            }
            config.cacheable_actions = kinds;
        }
        if let Ok(raw) = env::var(key("VOLATILE_FACTS")) {
            config.volatile_facts = raw
                .split(',')
                .map(|name| name.trim().to_ascii_lowercase())
                .filter(|name| !name.is_empty())
                .collect();
        }
        if let Some(run_global) = read_parsed(&key("RUN_GLOBAL"))? {
            config.run_global = run_global;
        }
        if let Some(authority) = read_parsed(&key("GLOBAL_AUTHORITY"))? {
            config.is_global_authority = authority;
        }
        if let Some(threshold) = read_parsed(&key("EMERGENCY_THRESHOLD"))? {
            config.emergency_threshold = threshold;
        }
        if let Some(count) = read_parsed(&key("EMERGENCY_MIN_COUNT"))? {
            config.emergency_min_count = count;
        }
        if let Some(secs) = read_parsed::<i64>(&key("EMERGENCY_GRACE_SECS"))? {
            config.emergency_grace = chrono::Duration::seconds(secs);
        }
        if let Some(cap) = read_parsed(&key("PROFILE_CAP"))? {
            config.profile_cap = cap;
        }
        if let Some(secs) = read_parsed(&key("PROFILE_TTL_SECS"))? {
            config.profile_ttl = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn read_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("{err}"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_the_dangerous_set() {
        let config = PipelineConfig::default();
        assert!(config.dangerous_kinds.contains(&ConsequenceKind::Block));
        assert!(config.dangerous_kinds.contains(&ConsequenceKind::Degroup));
        assert!(!config.dangerous_kinds.contains(&ConsequenceKind::Warn));
        assert!(config.cacheable_actions.contains(&ActionKind::Edit));
        assert!(!config.cacheable_actions.contains(&ActionKind::Delete));
    }

    #[test]
    fn env_overrides_apply_with_prefix() {
        env::set_var("FGTEST_CONDITION_LIMIT", "250");
        env::set_var("FGTEST_CACHEABLE_ACTIONS", "edit,move");
        env::set_var("FGTEST_EMERGENCY_THRESHOLD", "0.3");

        let config = PipelineConfig::from_env_with_prefix("FGTEST_").unwrap();
        assert_eq!(config.condition_limit, 250);
        assert!(config.cacheable_actions.contains(&ActionKind::Move));
        assert!((config.emergency_threshold - 0.3).abs() < f64::EPSILON);

        env::remove_var("FGTEST_CONDITION_LIMIT");
        env::remove_var("FGTEST_CACHEABLE_ACTIONS");
        env::remove_var("FGTEST_EMERGENCY_THRESHOLD");
    }

    #[test]
    fn bad_env_values_are_reported() {
        env::set_var("FGBAD_CONDITION_LIMIT", "many");
        let result = PipelineConfig::from_env_with_prefix("FGBAD_");
        assert!(matches!(result, Err(ConfigError::InvalidEnvVar { .. })));
        env::remove_var("FGBAD_CONDITION_LIMIT");
    }
}
