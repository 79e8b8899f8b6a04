use serde::{Deserialize, Serialize};

use crate::error::ConsequenceError;

/// Consequence vocabulary. Unknown names map to [`ConsequenceKind::Custom`]
/// so third-party kinds can be registered without touching this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsequenceKind {
    Warn,
    Disallow,
    Block,
    RangeBlock,
    Degroup,
    BlockAutopromote,
    Tag,
    Throttle,
    Custom,
}

impl ConsequenceKind {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "warn" => ConsequenceKind::Warn,
            "disallow" => ConsequenceKind::Disallow,
            "block" => ConsequenceKind::Block,
            "rangeblock" => ConsequenceKind::RangeBlock,
            "degroup" => ConsequenceKind::Degroup,
            "blockautopromote" => ConsequenceKind::BlockAutopromote,
            "tag" => ConsequenceKind::Tag,
            "throttle" => ConsequenceKind::Throttle,
            _ => ConsequenceKind::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsequenceKind::Warn => "warn",
            ConsequenceKind::Disallow => "disallow",
            ConsequenceKind::Block => "block",
            ConsequenceKind::RangeBlock => "rangeblock",
            ConsequenceKind::Degroup => "degroup",
            ConsequenceKind::BlockAutopromote => "blockautopromote",
            ConsequenceKind::Tag => "tag",
            ConsequenceKind::Throttle => "throttle",
            ConsequenceKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ConsequenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block expiry. `Infinite` compares greater than any finite duration, so
/// block unification can pick the longest request with plain `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiry {
    Seconds(i64),
    Infinite,
}

impl Expiry {
    /// Parse expiries like `"1 week"`, `"3 days"`, `"30"` (seconds) or
    /// `"infinite"`.
    pub fn parse(raw: &str) -> Result<Self, ConsequenceError> {
        let raw = raw.trim().to_ascii_lowercase();
        if matches!(raw.as_str(), "infinite" | "indefinite" | "never") {
            return Ok(Expiry::Infinite);
        }
        if let Ok(seconds) = raw.parse::<i64>() {
            return Ok(Expiry::Seconds(seconds));
        }

        let mut parts = raw.split_whitespace();
        let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(bad_expiry(&raw));
        };
        let amount: i64 = amount.parse().map_err(|_| bad_expiry(&raw))?;
        let unit_seconds = match unit.trim_end_matches('s') {
            "second" | "sec" => 1,
            "minute" | "min" => 60,
            "hour" => 3_600,
            "day" => 86_400,
            "week" => 604_800,
            "month" => 2_592_000,
            "year" => 31_536_000,
            _ => return Err(bad_expiry(&raw)),
        };
        Ok(Expiry::Seconds(amount * unit_seconds))
    }
}

impl std::fmt::Display for Expiry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expiry::Seconds(seconds) => write!(f, "{seconds} seconds"),
            Expiry::Infinite => f.write_str("infinite"),
        }
    }
}

fn bad_expiry(raw: &str) -> ConsequenceError {
    ConsequenceError::BadParams {
        kind: "block".into(),
        message: format!("unparseable expiry '{raw}'"),
    }
}

/// A concrete effect to apply because one or more filters matched.
///
/// Constructed fresh from a filter's raw parameter lists for exactly one
/// run; only its effects are persisted, via execution and logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Consequence {
    Warn {
        message: String,
    },
    Disallow {
        message: String,
    },
    Block {
        expiry: Expiry,
        talk_page_blocked: bool,
    },
    RangeBlock {
        expiry: Expiry,
    },
    Degroup,
    BlockAutopromote {
        duration_secs: i64,
    },
    Tag {
        tags: Vec<String>,
    },
    Throttle {
        bucket: String,
        rate: u32,
        period_secs: i64,
        dimensions: Vec<String>,
    },
    Custom {
        name: String,
        params: Vec<String>,
    },
}

impl Consequence {
    pub fn kind(&self) -> ConsequenceKind {
        match self {
            Consequence::Warn { .. } => ConsequenceKind::Warn,
            Consequence::Disallow { .. } => ConsequenceKind::Disallow,
            Consequence::Block { .. } => ConsequenceKind::Block,
            Consequence::RangeBlock { .. } => ConsequenceKind::RangeBlock,
            Consequence::Degroup => ConsequenceKind::Degroup,
            Consequence::BlockAutopromote { .. } => ConsequenceKind::BlockAutopromote,
            Consequence::Tag { .. } => ConsequenceKind::Tag,
            Consequence::Throttle { .. } => ConsequenceKind::Throttle,
            Consequence::Custom { .. } => ConsequenceKind::Custom,
        }
    }

    /// Priority among disabling consequences: the one with the lowest
    /// value is evaluated first. `None` for kinds that never disable.
    pub fn disabling_priority(&self) -> Option<u8> {
        match self {
            Consequence::Throttle { .. } => Some(0),
            Consequence::Warn { .. } => Some(1),
            _ => None,
        }
    }

    /// Build a consequence from a filter's raw declaration, validating the
    /// parameter shape once.
    pub fn from_raw(name: &str, params: &[String]) -> Result<Self, ConsequenceError> {
        let kind = ConsequenceKind::parse(name);
        let consequence = match kind {
            ConsequenceKind::Warn => Consequence::Warn {
                message: params
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "floodgate-warning".to_string()),
            },
            ConsequenceKind::Disallow => Consequence::Disallow {
                message: params
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "floodgate-disallowed".to_string()),
            },
            ConsequenceKind::Block => {
                let expiry = params.first().ok_or_else(|| ConsequenceError::BadParams {
                    kind: "block".into(),
                    message: "missing expiry".into(),
                })?;
                Consequence::Block {
                    expiry: Expiry::parse(expiry)?,
                    talk_page_blocked: params.iter().any(|p| p == "talkpage"),
                }
            }
            ConsequenceKind::RangeBlock => {
                let expiry = params.first().ok_or_else(|| ConsequenceError::BadParams {
                    kind: "rangeblock".into(),
                    message: "missing expiry".into(),
                })?;
                Consequence::RangeBlock {
                    expiry: Expiry::parse(expiry)?,
                }
            }
            ConsequenceKind::Degroup => Consequence::Degroup,
            ConsequenceKind::BlockAutopromote => {
                let duration_secs = match params.first() {
                    Some(raw) => raw.parse().map_err(|_| ConsequenceError::BadParams {
                        kind: "blockautopromote".into(),
                        message: format!("unparseable duration '{raw}'"),
                    })?,
                    // Five days, matching the longstanding default.
                    None => 432_000,
                };
                Consequence::BlockAutopromote { duration_secs }
            }
            ConsequenceKind::Tag => {
                if params.is_empty() {
                    return Err(ConsequenceError::BadParams {
                        kind: "tag".into(),
                        message: "at least one tag name is required".into(),
                    });
                }
                Consequence::Tag {
                    tags: params.to_vec(),
                }
            }
            ConsequenceKind::Throttle => {
                let bucket = params.first().ok_or_else(|| ConsequenceError::BadParams {
                    kind: "throttle".into(),
                    message: "missing bucket id".into(),
                })?;
                let pair = params.get(1).ok_or_else(|| ConsequenceError::BadParams {
                    kind: "throttle".into(),
                    message: "missing 'rate,period' pair".into(),
                })?;
                let (rate, period) = pair.split_once(',').ok_or_else(|| {
                    ConsequenceError::BadParams {
                        kind: "throttle".into(),
                        message: format!("expected 'rate,period', got '{pair}'"),
                    }
                })?;
                let rate = rate.trim().parse().map_err(|_| ConsequenceError::BadParams {
                    kind: "throttle".into(),
                    message: format!("unparseable rate '{rate}'"),
                })?;
                let period_secs =
                    period.trim().parse().map_err(|_| ConsequenceError::BadParams {
                        kind: "throttle".into(),
                        message: format!("unparseable period '{period}'"),
                    })?;
                let dimensions = params
                    .iter()
                    .skip(2)
                    .flat_map(|raw| raw.split(','))
                    .map(|dim| dim.trim().to_string())
                    .filter(|dim| !dim.is_empty())
                    .collect();
                Consequence::Throttle {
                    bucket: bucket.clone(),
                    rate,
                    period_secs,
                    dimensions,
                }
            }
            ConsequenceKind::Custom => Consequence::Custom {
                name: name.to_string(),
                params: params.to_vec(),
            },
        };
        Ok(consequence)
    }
}
