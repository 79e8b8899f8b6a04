use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FilterError, Result};

/// Filter identity. Global filters come from a shared cross-instance set
/// and carry a distinct origin so their ids are never confused with local
/// ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FilterId {
    Local(u64),
    Global(u64),
}

impl FilterId {
    pub fn is_global(&self) -> bool {
        matches!(self, FilterId::Global(_))
    }
}

impl std::fmt::Display for FilterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterId::Local(id) => write!(f, "{id}"),
            FilterId::Global(id) => write!(f, "global-{id}"),
        }
    }
}

/// Immutable snapshot of one operator-authored filter.
///
/// Snapshots are fetched per run and never mutated by the pipeline;
/// authoring happens elsewhere. The `consequences` map carries raw
/// parameter lists exactly as authored; they are validated once, by the
/// consequence resolver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    pub id: FilterId,
    /// Rule text in the external checker's grammar.
    pub rule: String,
    #[serde(default = "Filter::default_group")]
    pub group: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "Filter::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub hidden: bool,
    /// Set by the emergency watcher when the filter is overblocking;
    /// disables its dangerous consequences.
    #[serde(default)]
    pub throttled: bool,
    #[serde(default)]
    pub consequences: BTreeMap<String, Vec<String>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Filter {
    fn default_group() -> String {
        "default".to_string()
    }

    fn default_enabled() -> bool {
        true
    }

    pub fn is_active(&self) -> bool {
        self.enabled && !self.deleted
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

/// Supplies the set of filters a run iterates, and accepts the emergency
/// watcher's circuit-breaker feedback.
pub trait FilterLookup: Send + Sync {
    /// Enabled, non-deleted filters for a group, restricted to one origin.
    fn active_filters(&self, group: &str, global: bool) -> Vec<Arc<Filter>>;

    /// Mark a filter throttled going forward. Returns false when the id is
    /// unknown.
    fn throttle_filter(&self, id: FilterId) -> bool;
}

#[derive(Default)]
struct StoreInner {
    filters: HashMap<FilterId, Arc<Filter>>,
    // Active sets cached per (group, global-origin); invalidated on any
    // mutation.
    active: HashMap<(String, bool), Vec<Arc<Filter>>>,
}

/// In-memory filter lookup with per-group active-set caching.
#[derive(Default, Clone)]
pub struct FilterStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl FilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_filter(&self, filter: Filter) {
        let mut inner = self.inner.write();
        inner.filters.insert(filter.id, Arc::new(filter));
        inner.active.clear();
    }

    pub fn filter(&self, id: FilterId) -> Option<Arc<Filter>> {
        self.inner.read().filters.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().filters.is_empty()
    }

    /// Load filter definitions from a YAML/JSON file or directory.
    pub fn load_path(&self, path: impl AsRef<Path>) -> Result<usize> {
        let filters = load_filters(path)?;
        let count = filters.len();
        for filter in filters {
            self.put_filter(filter);
        }
        Ok(count)
    }
}

impl FilterLookup for FilterStore {
    fn active_filters(&self, group: &str, global: bool) -> Vec<Arc<Filter>> {
        let key = (group.to_string(), global);
        {
            let inner = self.inner.read();
            if let Some(cached) = inner.active.get(&key) {
                return cached.clone();
            }
        }

        let mut inner = self.inner.write();
        let mut set: Vec<Arc<Filter>> = inner
            .filters
            .values()
            .filter(|filter| {
                filter.group == group && filter.is_active() && filter.id.is_global() == global
            })
            .cloned()
            .collect();
        set.sort_by_key(|filter| filter.id);
        inner.active.insert(key, set.clone());
        set
    }

    fn throttle_filter(&self, id: FilterId) -> bool {
        let mut inner = self.inner.write();
        let Some(existing) = inner.filters.get(&id) else {
            return false;
        };
        let mut updated = Filter::clone(existing);
        updated.throttled = true;
        inner.filters.insert(id, Arc::new(updated));
        inner.active.clear();
        true
    }
}

/// Load filters from a file or directory of `.json`/`.yaml`/`.yml` files.
pub fn load_filters(path: impl AsRef<Path>) -> Result<Vec<Filter>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(FilterError::MissingPath(path.display().to_string()));
    }

    let filters = if path.is_dir() {
        load_from_directory(path)?
    } else {
        load_from_file(path)?
    };

    deduplicate(&filters)?;
    Ok(filters)
}

fn load_from_directory(path: &Path) -> Result<Vec<Filter>> {
    let mut eligible = Vec::new();
    for entry in fs::read_dir(path).map_err(|err| FilterError::from_io(path, err))? {
        let entry = entry.map_err(|err| FilterError::from_io(path, err))?;
        let file = entry.path();
        if file.is_dir() {
            continue;
        }
        match file.extension().and_then(|value| value.to_str()) {
            Some("json" | "yaml" | "yml") => eligible.push(file),
            _ => debug!(file = %file.display(), "skipping non-filter file"),
        }
    }
    // Directory iteration order is platform-dependent; sort so the same
    // tree always loads the same way.
    eligible.sort();

    let mut filters = Vec::new();
    for file in eligible {
        filters.append(&mut load_from_file(&file)?);
    }
    Ok(filters)
}

fn load_from_file(path: &Path) -> Result<Vec<Filter>> {
    let raw = fs::read_to_string(path).map_err(|err| FilterError::from_io(path, err))?;
    parse_filters(&raw, path)
}

fn parse_filters(raw: &str, path: &Path) -> Result<Vec<Filter>> {
    if let Ok(doc) = serde_yaml::from_str::<FilterDocument>(raw) {
        return Ok(doc.filters);
    }
    if let Ok(list) = serde_yaml::from_str::<Vec<Filter>>(raw) {
        return Ok(list);
    }
    if let Ok(single) = serde_yaml::from_str::<Filter>(raw) {
        return Ok(vec![single]);
    }
    Err(FilterError::parse_error(
        path.to_path_buf(),
        "expected a filters document, a list, or a single filter",
    ))
}

fn deduplicate(filters: &[Filter]) -> Result<()> {
    let mut seen = HashSet::new();
    for filter in filters {
        if !seen.insert(filter.id) {
            return Err(FilterError::DuplicateFilter(filter.id.to_string()));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct FilterDocument {
    filters: Vec<Filter>,
}
