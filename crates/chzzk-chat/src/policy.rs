//! Keyword policy: compiled matching rules.
//!
//! The policy is merged once from stored settings and runtime overrides and
//! is immutable afterwards. Attribution is deterministic:
//!
//! 1. Exact rules, in registration order; first match wins.
//! 2. Otherwise Contains rules, in registration order; first match wins.
//!
//! At most one keyword is attributed to a message.

use regex::Regex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

use crate::config::{DEFAULT_THRESHOLD, DEFAULT_WINDOW_SECS, KeywordSettings, RuntimeOverrides};
use crate::error::{ChatError, Result};

/// Identity of a keyword: its lowercased, trimmed text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeywordKey(String);

impl KeywordKey {
    /// Normalize raw keyword text. Returns `None` for blank input.
    pub fn new(raw: &str) -> Option<Self> {
        let key = raw.trim().to_lowercase();
        (!key.is_empty()).then_some(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeywordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a rule is matched against message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Whole token, delimited by non-word characters or text boundaries.
    Exact,
    /// Raw substring anywhere in the text.
    Contains,
}

/// A compiled keyword rule.
#[derive(Debug, Clone)]
pub struct KeywordRule {
    key: KeywordKey,
    display: String,
    mode: MatchMode,
    threshold: u32,
    window_secs: u32,
    pattern: Option<Regex>,
}

impl KeywordRule {
    fn compile(
        key: KeywordKey,
        display: String,
        mode: MatchMode,
        threshold: u32,
        window_secs: u32,
    ) -> Result<Self> {
        let pattern = match mode {
            MatchMode::Exact => Some(word_boundary_pattern(key.as_str())?),
            MatchMode::Contains => None,
        };
        Ok(Self {
            key,
            display,
            mode,
            threshold,
            window_secs,
            pattern,
        })
    }

    pub fn key(&self) -> &KeywordKey {
        &self.key
    }

    /// Text shown in logs and detection records (first registered spelling).
    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn window_secs(&self) -> u32 {
        self.window_secs
    }

    /// `lowered` must be `text.to_lowercase()`.
    fn matches(&self, text: &str, lowered: &str) -> bool {
        match &self.pattern {
            Some(pattern) => pattern.is_match(text),
            None => lowered.contains(self.key.as_str()),
        }
    }
}

/// `(?<!\w)kw(?!\w)` without look-around: a non-word character or a text
/// boundary on each side.
fn word_boundary_pattern(keyword: &str) -> Result<Regex> {
    let pattern = format!(r"(?i)(?:^|\W){}(?:\W|$)", regex::escape(keyword));
    Regex::new(&pattern)
        .map_err(|e| ChatError::config(format!("Invalid keyword pattern for {keyword:?}: {e}")))
}

/// Compiled, immutable set of keyword rules.
#[derive(Debug, Clone, Default)]
pub struct KeywordPolicy {
    exact: Vec<KeywordRule>,
    contains: Vec<KeywordRule>,
    index: FxHashMap<KeywordKey, (MatchMode, usize)>,
    global_threshold: u32,
    global_window_secs: u32,
}

/// Registration-ordered accumulator used while merging sources.
#[derive(Default)]
struct Registry {
    order: Vec<KeywordKey>,
    display: FxHashMap<KeywordKey, String>,
}

impl Registry {
    fn register(&mut self, raw: &str) -> Option<KeywordKey> {
        let key = KeywordKey::new(raw)?;
        if !self.display.contains_key(&key) {
            self.display.insert(key.clone(), raw.trim().to_string());
            self.order.push(key.clone());
        }
        Some(key)
    }
}

impl KeywordPolicy {
    /// Merge stored settings with runtime overrides and compile the rules.
    ///
    /// Later sources win for the same key: stored values, then overrides,
    /// then the explicit values of contains entries.
    pub fn build(settings: &KeywordSettings, overrides: &RuntimeOverrides) -> Result<Self> {
        let mut registry = Registry::default();

        for raw in settings.keywords.iter().chain(overrides.keywords.iter()) {
            registry.register(raw);
        }

        let global_threshold = overrides
            .global_threshold
            .or(settings.global_threshold)
            .unwrap_or(DEFAULT_THRESHOLD)
            .max(1);
        let global_window_secs = overrides
            .global_window
            .or(settings.global_window)
            .unwrap_or(DEFAULT_WINDOW_SECS)
            .max(1);

        let mut thresholds = lowered_map(&settings.per_keyword_thresholds);
        thresholds.extend(lowered_map(&overrides.per_keyword_thresholds));
        let mut windows = lowered_map(&settings.per_keyword_windows);
        windows.extend(lowered_map(&overrides.per_keyword_windows));

        let mut contains_order = Vec::new();
        for entry in &settings.contains_keywords {
            let Some(key) = registry.register(&entry.keyword) else {
                continue;
            };
            if contains_order.contains(&key) {
                continue;
            }
            thresholds.insert(key.clone(), entry.threshold.max(1));
            windows.insert(key.clone(), entry.window.max(1));
            contains_order.push(key);
        }

        // Keys configured only through per-keyword maps still become exact rules.
        for key in thresholds.keys().chain(windows.keys()) {
            registry.register(key.as_str());
        }

        let mut policy = Self {
            global_threshold,
            global_window_secs,
            ..Self::default()
        };

        for key in registry.order.iter().filter(|k| !contains_order.contains(k)) {
            policy.push(&registry, key, MatchMode::Exact, &thresholds, &windows)?;
        }
        for key in &contains_order {
            policy.push(&registry, key, MatchMode::Contains, &thresholds, &windows)?;
        }

        Ok(policy)
    }

    fn push(
        &mut self,
        registry: &Registry,
        key: &KeywordKey,
        mode: MatchMode,
        thresholds: &BTreeMap<KeywordKey, u32>,
        windows: &BTreeMap<KeywordKey, u32>,
    ) -> Result<()> {
        let display = registry
            .display
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string());
        let threshold = thresholds.get(key).copied().unwrap_or(self.global_threshold);
        let window = windows.get(key).copied().unwrap_or(self.global_window_secs);
        let rule = KeywordRule::compile(key.clone(), display, mode, threshold, window)?;

        let rules = match mode {
            MatchMode::Exact => &mut self.exact,
            MatchMode::Contains => &mut self.contains,
        };
        self.index.insert(key.clone(), (mode, rules.len()));
        rules.push(rule);
        Ok(())
    }

    /// Attribute a message to at most one keyword.
    pub fn attribute(&self, text: &str) -> Option<&KeywordRule> {
        let lowered = text.to_lowercase();
        self.exact
            .iter()
            .find(|rule| rule.matches(text, &lowered))
            .or_else(|| self.contains.iter().find(|rule| rule.matches(text, &lowered)))
    }

    pub fn rule(&self, key: &KeywordKey) -> Option<&KeywordRule> {
        let (mode, idx) = self.index.get(key)?;
        match mode {
            MatchMode::Exact => self.exact.get(*idx),
            MatchMode::Contains => self.contains.get(*idx),
        }
    }

    /// All rules: exact rules first, then contains rules, each in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &KeywordRule> {
        self.exact.iter().chain(self.contains.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.contains.is_empty()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.contains.len()
    }

    pub fn global_threshold(&self) -> u32 {
        self.global_threshold
    }

    pub fn global_window_secs(&self) -> u32 {
        self.global_window_secs
    }
}

fn lowered_map(map: &BTreeMap<String, u32>) -> BTreeMap<KeywordKey, u32> {
    map.iter()
        .filter_map(|(k, v)| Some((KeywordKey::new(k)?, (*v).max(1))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainsKeyword;

    fn exact(keywords: &[&str]) -> KeywordSettings {
        KeywordSettings {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        }
    }

    fn contains(keyword: &str, threshold: u32, window: u32) -> ContainsKeyword {
        ContainsKeyword {
            keyword: keyword.to_string(),
            threshold,
            window,
        }
    }

    fn attributed(policy: &KeywordPolicy, text: &str) -> Option<String> {
        policy.attribute(text).map(|r| r.key().to_string())
    }

    #[test]
    fn test_case_insensitive() {
        let policy = KeywordPolicy::build(&exact(&["win"]), &RuntimeOverrides::default()).unwrap();

        assert_eq!(attributed(&policy, "WIN"), Some("win".into()));
        assert_eq!(attributed(&policy, "win"), Some("win".into()));
        assert_eq!(attributed(&policy, "We Win Now"), Some("win".into()));
    }

    #[test]
    fn test_exact_uses_word_boundaries() {
        let policy = KeywordPolicy::build(&exact(&["win"]), &RuntimeOverrides::default()).unwrap();

        assert_eq!(attributed(&policy, "we win now"), Some("win".into()));
        assert_eq!(attributed(&policy, "win!"), Some("win".into()));
        assert_eq!(attributed(&policy, "winner"), None);
        assert_eq!(attributed(&policy, "twin"), None);
        assert_eq!(attributed(&policy, "win_streak"), None);
    }

    #[test]
    fn test_exact_unicode_tokens() {
        let policy = KeywordPolicy::build(&exact(&["ㅋㅋ"]), &RuntimeOverrides::default()).unwrap();

        assert_eq!(attributed(&policy, "와 ㅋㅋ 진짜"), Some("ㅋㅋ".into()));
        assert_eq!(attributed(&policy, "ㅋㅋㅋ"), None);
    }

    #[test]
    fn test_exact_escapes_metacharacters() {
        let policy = KeywordPolicy::build(&exact(&["c++"]), &RuntimeOverrides::default()).unwrap();

        assert_eq!(attributed(&policy, "I like c++ a lot"), Some("c++".into()));
        assert_eq!(attributed(&policy, "I like cpp"), None);
    }

    #[test]
    fn test_contains_matches_substring() {
        let settings = KeywordSettings {
            contains_keywords: vec![contains("pizza", 1, 60)],
            ..Default::default()
        };
        let policy = KeywordPolicy::build(&settings, &RuntimeOverrides::default()).unwrap();

        assert_eq!(attributed(&policy, "pizzaparty"), Some("pizza".into()));
        assert_eq!(attributed(&policy, "PIZZA time"), Some("pizza".into()));
        assert_eq!(policy.rule(&KeywordKey::new("pizza").unwrap()).unwrap().mode(), MatchMode::Contains);
    }

    #[test]
    fn test_exact_has_priority_over_contains() {
        let settings = KeywordSettings {
            keywords: vec!["win".into()],
            contains_keywords: vec![contains("pizza", 1, 60)],
            ..Default::default()
        };
        let policy = KeywordPolicy::build(&settings, &RuntimeOverrides::default()).unwrap();

        assert_eq!(attributed(&policy, "pizza win"), Some("win".into()));
        assert_eq!(attributed(&policy, "pizzawin"), Some("pizza".into()));
    }

    #[test]
    fn test_registration_order_decides_ties() {
        let policy =
            KeywordPolicy::build(&exact(&["gg", "win"]), &RuntimeOverrides::default()).unwrap();
        assert_eq!(attributed(&policy, "win gg"), Some("gg".into()));

        let policy =
            KeywordPolicy::build(&exact(&["win", "gg"]), &RuntimeOverrides::default()).unwrap();
        assert_eq!(attributed(&policy, "gg win"), Some("win".into()));
    }

    #[test]
    fn test_duplicate_keys_collapse() {
        let policy =
            KeywordPolicy::build(&exact(&["Win", "WIN", " win "]), &RuntimeOverrides::default())
                .unwrap();

        assert_eq!(policy.len(), 1);
        assert_eq!(policy.rules().next().unwrap().display(), "Win");
    }

    #[test]
    fn test_defaults_and_overrides() {
        let settings = KeywordSettings {
            keywords: vec!["win".into(), "gg".into()],
            global_threshold: Some(2),
            global_window: Some(30),
            per_keyword_thresholds: [("WIN".to_string(), 5)].into_iter().collect(),
            ..Default::default()
        };
        let overrides = RuntimeOverrides {
            keywords: vec!["lol".into()],
            global_window: Some(10),
            per_keyword_windows: [("gg".to_string(), 99)].into_iter().collect(),
            ..Default::default()
        };
        let policy = KeywordPolicy::build(&settings, &overrides).unwrap();

        let rule = |k: &str| policy.rule(&KeywordKey::new(k).unwrap()).unwrap().clone();
        assert_eq!(rule("win").threshold(), 5);
        assert_eq!(rule("win").window_secs(), 10);
        assert_eq!(rule("gg").threshold(), 2);
        assert_eq!(rule("gg").window_secs(), 99);
        assert_eq!(rule("lol").threshold(), 2);
        assert_eq!(policy.global_window_secs(), 10);
    }

    #[test]
    fn test_contains_entry_values_win() {
        let settings = KeywordSettings {
            keywords: vec!["pizza".into()],
            per_keyword_thresholds: [("pizza".to_string(), 9)].into_iter().collect(),
            contains_keywords: vec![contains("Pizza", 3, 15)],
            ..Default::default()
        };
        let policy = KeywordPolicy::build(&settings, &RuntimeOverrides::default()).unwrap();
        let rule = policy.rule(&KeywordKey::new("pizza").unwrap()).unwrap();

        assert_eq!(policy.len(), 1);
        assert_eq!(rule.mode(), MatchMode::Contains);
        assert_eq!(rule.threshold(), 3);
        assert_eq!(rule.window_secs(), 15);
        assert_eq!(rule.display(), "pizza");
    }

    #[test]
    fn test_map_only_keys_become_exact_rules() {
        let settings = KeywordSettings {
            per_keyword_windows: [("clip".to_string(), 20)].into_iter().collect(),
            ..Default::default()
        };
        let policy = KeywordPolicy::build(&settings, &RuntimeOverrides::default()).unwrap();
        let rule = policy.rule(&KeywordKey::new("clip").unwrap()).unwrap();

        assert_eq!(rule.mode(), MatchMode::Exact);
        assert_eq!(rule.window_secs(), 20);
    }

    #[test]
    fn test_empty_policy() {
        let policy =
            KeywordPolicy::build(&KeywordSettings::default(), &RuntimeOverrides::default())
                .unwrap();
        assert!(policy.is_empty());
        assert!(policy.attribute("anything").is_none());
    }
}
