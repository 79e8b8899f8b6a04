use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::error::{FilterError, Result};
use crate::facts::FactStore;
use crate::value::FactValue;

/// Closed vocabulary of deferred computations. Tags are a versioned wire
/// vocabulary: parsing an unknown tag is a hard failure, never a silent
/// no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComputeMethod {
    Diff,
    AddedLines,
    RemovedLines,
    StripHtml,
    SizeDelta,
    UserAge,
    UserGroups,
    UserEditCount,
    RevisionText,
    PageRestrictions,
    RecentAuthors,
    PageAge,
}

impl ComputeMethod {
    pub fn parse(tag: &str) -> Result<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "diff" => Ok(ComputeMethod::Diff),
            "added-lines" => Ok(ComputeMethod::AddedLines),
            "removed-lines" => Ok(ComputeMethod::RemovedLines),
            "strip-html" => Ok(ComputeMethod::StripHtml),
            "size-delta" => Ok(ComputeMethod::SizeDelta),
            "user-age" => Ok(ComputeMethod::UserAge),
            "user-groups" => Ok(ComputeMethod::UserGroups),
            "user-editcount" => Ok(ComputeMethod::UserEditCount),
            "revision-text-by-id" => Ok(ComputeMethod::RevisionText),
            "get-page-restrictions" => Ok(ComputeMethod::PageRestrictions),
            "load-recent-authors" => Ok(ComputeMethod::RecentAuthors),
            "page-age" => Ok(ComputeMethod::PageAge),
            other => Err(FilterError::UnknownComputeMethod(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeMethod::Diff => "diff",
            ComputeMethod::AddedLines => "added-lines",
            ComputeMethod::RemovedLines => "removed-lines",
            ComputeMethod::StripHtml => "strip-html",
            ComputeMethod::SizeDelta => "size-delta",
            ComputeMethod::UserAge => "user-age",
            ComputeMethod::UserGroups => "user-groups",
            ComputeMethod::UserEditCount => "user-editcount",
            ComputeMethod::RevisionText => "revision-text-by-id",
            ComputeMethod::PageRestrictions => "get-page-restrictions",
            ComputeMethod::RecentAuthors => "load-recent-authors",
            ComputeMethod::PageAge => "page-age",
        }
    }
}

/// Deferred-computation placeholder stored in a [`FactStore`] slot.
///
/// Parameters may name other facts in the same store; pulling them during
/// resolution is how dependency chains such as `diff -> added_lines` are
/// expressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LazyDescriptor {
    pub method: ComputeMethod,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl LazyDescriptor {
    pub fn new(method: ComputeMethod) -> Self {
        Self {
            method,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    fn str_param(&self, key: &str) -> Result<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| FilterError::BadDescriptor {
                method: self.method.as_str().to_string(),
                message: format!("missing string parameter '{key}'"),
            })
    }

    fn int_param(&self, key: &str) -> Result<i64> {
        self.params
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| FilterError::BadDescriptor {
                method: self.method.as_str().to_string(),
                message: format!("missing integer parameter '{key}'"),
            })
    }
}

/// Value produced by a resolver, together with the portion of its cost
/// that was shared with an unrelated host-side operation and therefore
/// must not be billed to filtering.
#[derive(Debug, Clone)]
pub struct Computed {
    pub value: FactValue,
    pub uncharged: Duration,
}

impl Computed {
    pub fn value(value: FactValue) -> Self {
        Self {
            value,
            uncharged: Duration::ZERO,
        }
    }

    pub fn with_uncharged(value: FactValue, uncharged: Duration) -> Self {
        Self { value, uncharged }
    }
}

/// Seam between the fact store and whatever computes deferred facts.
pub trait LazyResolver {
    fn compute(&self, descriptor: &LazyDescriptor, store: &mut FactStore) -> Result<Computed>;
}

/// Error raised by a [`HostData`] lookup. Backward-compatible methods
/// degrade to `Undefined` on this; they never abort the run.
#[derive(Debug, Error)]
#[error("host data lookup failed: {0}")]
pub struct HostError(pub String);

/// A host-fetched value plus the time the host had already spent on it
/// for its own purposes (e.g. a revision parse warmed by the edit itself).
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub shared: Duration,
}

impl<T> Fetched<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            shared: Duration::ZERO,
        }
    }
}

/// Host-side metadata the standard resolver cannot derive from text.
pub trait HostData: Send + Sync {
    /// Seconds since the account was registered.
    fn user_age(&self, user: &str) -> std::result::Result<i64, HostError>;
    fn user_groups(&self, user: &str) -> std::result::Result<Vec<String>, HostError>;
    fn user_edit_count(&self, user: &str) -> std::result::Result<i64, HostError>;
    fn revision_text(&self, revision: i64) -> std::result::Result<Fetched<String>, HostError>;
    fn page_restrictions(
        &self,
        title: &str,
        action: &str,
    ) -> std::result::Result<Vec<String>, HostError>;
    fn recent_authors(&self, title: &str) -> std::result::Result<Vec<String>, HostError>;
    /// Seconds since the page was created.
    fn page_age(&self, title: &str) -> std::result::Result<i64, HostError>;
}

/// Host with no data: every lookup fails and degrades to `Undefined`.
/// Useful for tests and for hosts that only seed concrete facts.
#[derive(Debug, Default)]
pub struct NullHost;

impl HostData for NullHost {
    fn user_age(&self, _: &str) -> std::result::Result<i64, HostError> {
        Err(HostError("no host data".into()))
    }

    fn user_groups(&self, _: &str) -> std::result::Result<Vec<String>, HostError> {
        Err(HostError("no host data".into()))
    }

    fn user_edit_count(&self, _: &str) -> std::result::Result<i64, HostError> {
        Err(HostError("no host data".into()))
    }

    fn revision_text(&self, _: i64) -> std::result::Result<Fetched<String>, HostError> {
        Err(HostError("no host data".into()))
    }

    fn page_restrictions(&self, _: &str, _: &str) -> std::result::Result<Vec<String>, HostError> {
        Err(HostError("no host data".into()))
    }

    fn recent_authors(&self, _: &str) -> std::result::Result<Vec<String>, HostError> {
        Err(HostError("no host data".into()))
    }

    fn page_age(&self, _: &str) -> std::result::Result<i64, HostError> {
        Err(HostError("no host data".into()))
    }
}

/// Default resolver: text-derived methods are computed natively, host
/// metadata goes through the [`HostData`] seam.
pub struct StandardResolver {
    host: Box<dyn HostData>,
}

impl StandardResolver {
    pub fn new(host: Box<dyn HostData>) -> Self {
        Self { host }
    }

    fn fact_text(&self, descriptor: &LazyDescriptor, key: &str, store: &mut FactStore) -> Result<String> {
        let name = descriptor.str_param(key)?.to_string();
        Ok(store.get(&name, true, self)?.render())
    }

    fn degraded<T: Into<FactValue>>(
        &self,
        method: ComputeMethod,
        outcome: std::result::Result<T, HostError>,
    ) -> FactValue {
        match outcome {
            Ok(value) => value.into(),
            Err(error) => {
                warn!(method = method.as_str(), %error, "host lookup failed, fact is undefined");
                FactValue::Undefined
            }
        }
    }
}

impl LazyResolver for StandardResolver {
    fn compute(&self, descriptor: &LazyDescriptor, store: &mut FactStore) -> Result<Computed> {
        let method = descriptor.method;
        let computed = match method {
            ComputeMethod::Diff => {
                let old = self.fact_text(descriptor, "old", store)?;
                let new = self.fact_text(descriptor, "new", store)?;
                Computed::value(line_diff(&old, &new).into())
            }
            ComputeMethod::AddedLines => {
                let diff = self.fact_text(descriptor, "diff", store)?;
                Computed::value(FactValue::List(lines_with_marker(&diff, '+')))
            }
            ComputeMethod::RemovedLines => {
                let diff = self.fact_text(descriptor, "diff", store)?;
                Computed::value(FactValue::List(lines_with_marker(&diff, '-')))
            }
            ComputeMethod::StripHtml => {
                let text = self.fact_text(descriptor, "text", store)?;
                Computed::value(strip_html(&text).into())
            }
            ComputeMethod::SizeDelta => {
                let old = self.fact_text(descriptor, "old", store)?;
                let new = self.fact_text(descriptor, "new", store)?;
                Computed::value(FactValue::Int(new.len() as i64 - old.len() as i64))
            }
            ComputeMethod::UserAge => {
                let user = self.fact_text(descriptor, "user", store)?;
                Computed::value(self.degraded(method, self.host.user_age(&user)))
            }
            ComputeMethod::UserGroups => {
                let user = self.fact_text(descriptor, "user", store)?;
                Computed::value(self.degraded(method, self.host.user_groups(&user)))
            }
            ComputeMethod::UserEditCount => {
                let user = self.fact_text(descriptor, "user", store)?;
                Computed::value(self.degraded(method, self.host.user_edit_count(&user)))
            }
            ComputeMethod::RevisionText => {
                let revision = descriptor.int_param("id")?;
                match self.host.revision_text(revision) {
                    Ok(fetched) => Computed::with_uncharged(fetched.value.into(), fetched.shared),
                    Err(error) => {
                        warn!(method = method.as_str(), %error, "host lookup failed, fact is undefined");
                        Computed::value(FactValue::Undefined)
                    }
                }
            }
            ComputeMethod::PageRestrictions => {
                let title = self.fact_text(descriptor, "title", store)?;
                let action = descriptor.str_param("action").unwrap_or("edit").to_string();
                Computed::value(self.degraded(method, self.host.page_restrictions(&title, &action)))
            }
            ComputeMethod::RecentAuthors => {
                let title = self.fact_text(descriptor, "title", store)?;
                Computed::value(self.degraded(method, self.host.recent_authors(&title)))
            }
            ComputeMethod::PageAge => {
                let title = self.fact_text(descriptor, "title", store)?;
                Computed::value(self.degraded(method, self.host.page_age(&title)))
            }
        };
        Ok(computed)
    }
}

/// Multiset line diff: lines only in `old` come out prefixed `-`, lines
/// only in `new` prefixed `+`.
fn line_diff(old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut out = Vec::new();
    let mut remaining: HashMap<&str, i64> = HashMap::new();
    for line in &new_lines {
        *remaining.entry(line).or_default() += 1;
    }
    for line in &old_lines {
        match remaining.get_mut(line) {
            Some(count) if *count > 0 => *count -= 1,
            _ => out.push(format!("-{line}")),
        }
    }

    let mut remaining: HashMap<&str, i64> = HashMap::new();
    for line in &old_lines {
        *remaining.entry(line).or_default() += 1;
    }
    for line in &new_lines {
        match remaining.get_mut(line) {
            Some(count) if *count > 0 => *count -= 1,
            _ => out.push(format!("+{line}")),
        }
    }

    out.join("\n")
}

fn lines_with_marker(diff: &str, marker: char) -> Vec<FactValue> {
    diff.lines()
        .filter_map(|line| line.strip_prefix(marker))
        .map(FactValue::from)
        .collect()
}

fn strip_html(text: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    let tags = TAGS.get_or_init(|| Regex::new(r"<[^>]*>").expect("static pattern"));
    let stripped = tags.replace_all(text, "");
    stripped
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}
