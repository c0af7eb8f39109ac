//! Keyword settings and runtime overrides.
//!
//! Settings are persisted as loosely-typed JSON and sanitized on every load:
//! thresholds and windows must be positive integers, otherwise the documented
//! defaults apply.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Threshold used when neither a per-keyword nor a global value is configured.
pub const DEFAULT_THRESHOLD: u32 = 1;

/// Window length in seconds used when nothing else is configured.
pub const DEFAULT_WINDOW_SECS: u32 = 60;

/// A keyword matched as a raw substring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainsKeyword {
    pub keyword: String,
    pub threshold: u32,
    pub window: u32,
}

/// Stored keyword configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSettings {
    /// Exact (word-boundary) keywords
    pub keywords: Vec<String>,
    pub global_threshold: Option<u32>,
    pub per_keyword_thresholds: BTreeMap<String, u32>,
    pub global_window: Option<u32>,
    pub per_keyword_windows: BTreeMap<String, u32>,
    pub contains_keywords: Vec<ContainsKeyword>,
}

impl KeywordSettings {
    /// Build sanitized settings from arbitrary JSON.
    ///
    /// Unknown or malformed fields are dropped rather than rejected.
    pub fn from_value(raw: &Value) -> Self {
        let mut settings = Self::default();
        let Some(obj) = raw.as_object() else {
            return settings;
        };

        settings.keywords = match obj.get("keywords") {
            Some(Value::Array(items)) => items
                .iter()
                .map(value_to_trimmed)
                .filter(|k| !k.is_empty())
                .collect(),
            Some(Value::String(list)) => split_list(list),
            _ => Vec::new(),
        };

        settings.global_threshold = obj
            .get("global_threshold")
            .filter(|v| !v.is_null())
            .map(|v| ensure_positive(v, DEFAULT_THRESHOLD));
        settings.global_window = obj
            .get("global_window")
            .filter(|v| !v.is_null())
            .map(|v| ensure_positive(v, DEFAULT_WINDOW_SECS));

        settings.per_keyword_thresholds =
            sanitize_map(obj.get("per_keyword_thresholds"), DEFAULT_THRESHOLD);
        settings.per_keyword_windows =
            sanitize_map(obj.get("per_keyword_windows"), DEFAULT_WINDOW_SECS);

        if let Some(Value::Array(items)) = obj.get("contains_keywords") {
            let mut seen = HashSet::new();
            for item in items {
                let entry = match item {
                    Value::Object(map) => {
                        let keyword = map.get("keyword").map(value_to_trimmed).unwrap_or_default();
                        ContainsKeyword {
                            keyword,
                            threshold: map
                                .get("threshold")
                                .map(|v| ensure_positive(v, DEFAULT_THRESHOLD))
                                .unwrap_or(DEFAULT_THRESHOLD),
                            window: map
                                .get("window")
                                .map(|v| ensure_positive(v, DEFAULT_WINDOW_SECS))
                                .unwrap_or(DEFAULT_WINDOW_SECS),
                        }
                    }
                    Value::String(s) => ContainsKeyword {
                        keyword: s.trim().to_string(),
                        threshold: DEFAULT_THRESHOLD,
                        window: DEFAULT_WINDOW_SECS,
                    },
                    _ => continue,
                };
                if entry.keyword.is_empty() || !seen.insert(entry.keyword.to_lowercase()) {
                    continue;
                }
                settings.contains_keywords.push(entry);
            }
        }

        settings
    }

    /// Re-run sanitization on already typed settings.
    pub fn sanitized(&self) -> Self {
        match serde_json::to_value(self) {
            Ok(value) => Self::from_value(&value),
            Err(_) => self.clone(),
        }
    }
}

/// Overrides supplied at runtime (environment), merged on top of stored settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOverrides {
    pub keywords: Vec<String>,
    pub global_threshold: Option<u32>,
    pub per_keyword_thresholds: BTreeMap<String, u32>,
    pub global_window: Option<u32>,
    pub per_keyword_windows: BTreeMap<String, u32>,
}

impl RuntimeOverrides {
    /// Read `KEYWORDS`, `KEYWORD_THRESHOLD`, `KEYWORD_THRESHOLDS`,
    /// `KEYWORD_WINDOW` and `KEYWORD_WINDOWS` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`RuntimeOverrides::from_env`] with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let keywords = lookup("KEYWORDS")
            .map(|s| split_list(&s))
            .unwrap_or_default();

        Self {
            keywords,
            global_threshold: lookup("KEYWORD_THRESHOLD").and_then(|s| parse_digits(&s)),
            per_keyword_thresholds: lookup("KEYWORD_THRESHOLDS")
                .map(|s| parse_json_map(&s))
                .unwrap_or_default(),
            global_window: lookup("KEYWORD_WINDOW").and_then(|s| parse_digits(&s)),
            per_keyword_windows: lookup("KEYWORD_WINDOWS")
                .map(|s| parse_json_map(&s))
                .unwrap_or_default(),
        }
    }
}

/// Coerce a JSON value into a positive integer, falling back to `default`.
pub fn ensure_positive(value: &Value, default: u32) -> u32 {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    };
    match parsed {
        Some(v) if v >= 1 => u32::try_from(v).unwrap_or(u32::MAX),
        _ => default,
    }
}

/// Split a comma separated list, dropping blanks.
pub fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn value_to_trimmed(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

fn sanitize_map(raw: Option<&Value>, default: u32) -> BTreeMap<String, u32> {
    let Some(Value::Object(map)) = raw else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(k, v)| {
            let key = k.trim();
            (!key.is_empty()).then(|| (key.to_string(), ensure_positive(v, default)))
        })
        .collect()
}

/// Digits-only positive integer, as accepted for env overrides.
fn parse_digits(input: &str) -> Option<u32> {
    let input = input.trim();
    if input.is_empty() || !input.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    input.parse::<u32>().ok().map(|v| v.max(1))
}

/// JSON object of digit-valued entries, e.g. `{"win": 3, "gg": "5"}`.
fn parse_json_map(input: &str) -> BTreeMap<String, u32> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(input) else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(k, v)| {
            let digits = match v {
                Value::Number(n) => n.as_u64().map(|n| n.to_string()),
                Value::String(s) => Some(s.clone()),
                _ => None,
            }?;
            let value = parse_digits(&digits)?;
            let key = k.trim();
            (!key.is_empty()).then(|| (key.to_string(), value))
        })
        .collect()
}
