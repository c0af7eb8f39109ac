//! Persistent keyword settings and cumulative counts.
//!
//! Both live in a single JSON document (`{"config": {...}, "counts": {...}}`).
//! Every write re-reads the document so saving counts never clobbers
//! settings edited by another tool, and vice versa. When the document is
//! missing or unreadable, the older one-value-per-file layout is read instead.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{
    DEFAULT_THRESHOLD, DEFAULT_WINDOW_SECS, KeywordSettings, ensure_positive,
};
use crate::error::Result;

/// Default settings document name.
pub const SETTINGS_FILE: &str = "keyword_settings.json";

const LEGACY_KEYWORDS_TXT: &str = "keywords.txt";
const LEGACY_THRESHOLD_TXT: &str = "keyword_threshold.txt";
const LEGACY_THRESHOLDS_JSON: &str = "keyword_thresholds.json";
const LEGACY_WINDOW_TXT: &str = "keyword_window.txt";
const LEGACY_WINDOWS_JSON: &str = "keyword_windows.json";
const LEGACY_COUNTS_JSON: &str = "keyword_counts.json";

/// Cumulative hit counts keyed by lowercased keyword.
pub type KeywordCounts = BTreeMap<String, u64>;

/// Source of stored keyword settings.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_config(&self) -> Result<KeywordSettings>;

    async fn save_config(&self, settings: &KeywordSettings) -> Result<()>;
}

/// Durable cumulative counts. `save_counts` overwrites the whole map.
#[async_trait]
pub trait CountsStore: Send + Sync {
    async fn load_counts(&self) -> Result<KeywordCounts>;

    async fn save_counts(&self, counts: &KeywordCounts) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize)]
struct SettingsDocument {
    config: KeywordSettings,
    counts: KeywordCounts,
}

/// JSON file backed implementation of [`ConfigStore`] and [`CountsStore`].
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    legacy_dir: PathBuf,
}

impl SettingsStore {
    /// Store at `path`; legacy files are looked up next to it.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let legacy_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self { path, legacy_dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_document(&self) -> SettingsDocument {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(raw) => {
                    let mut doc = sanitize_document(&raw);
                    if doc.counts.is_empty() {
                        doc.counts = self.load_legacy_counts().await;
                    }
                    return doc;
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Settings file is not valid JSON, falling back to legacy files");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Settings file not found, reading legacy files");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read settings file, falling back to legacy files");
            }
        }

        SettingsDocument {
            config: self.load_legacy_config().await,
            counts: self.load_legacy_counts().await,
        }
    }

    async fn write_document(&self, doc: &SettingsDocument) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(doc)?;
        tokio::fs::write(&self.path, text).await?;
        Ok(())
    }

    async fn read_legacy(&self, name: &str) -> Option<String> {
        tokio::fs::read_to_string(self.legacy_dir.join(name))
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    async fn load_legacy_config(&self) -> KeywordSettings {
        let mut raw = serde_json::Map::new();

        if let Some(text) = self.read_legacy(LEGACY_KEYWORDS_TXT).await {
            let keywords: Vec<Value> = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| Value::String(l.to_string()))
                .collect();
            raw.insert("keywords".into(), Value::Array(keywords));
        }
        if let Some(text) = self.read_legacy(LEGACY_THRESHOLD_TXT).await {
            let value = ensure_positive(&Value::String(text), DEFAULT_THRESHOLD);
            raw.insert("global_threshold".into(), value.into());
        }
        if let Some(text) = self.read_legacy(LEGACY_WINDOW_TXT).await {
            let value = ensure_positive(&Value::String(text), DEFAULT_WINDOW_SECS);
            raw.insert("global_window".into(), value.into());
        }
        if let Some(map) = self.read_legacy_json(LEGACY_THRESHOLDS_JSON).await {
            raw.insert("per_keyword_thresholds".into(), map);
        }
        if let Some(map) = self.read_legacy_json(LEGACY_WINDOWS_JSON).await {
            raw.insert("per_keyword_windows".into(), map);
        }

        KeywordSettings::from_value(&Value::Object(raw))
    }

    async fn read_legacy_json(&self, name: &str) -> Option<Value> {
        let text = self.read_legacy(name).await?;
        serde_json::from_str(&text).ok()
    }

    async fn load_legacy_counts(&self) -> KeywordCounts {
        match self.read_legacy_json(LEGACY_COUNTS_JSON).await {
            Some(raw) => sanitize_counts(&raw),
            None => KeywordCounts::new(),
        }
    }
}

#[async_trait]
impl ConfigStore for SettingsStore {
    async fn load_config(&self) -> Result<KeywordSettings> {
        Ok(self.load_document().await.config)
    }

    async fn save_config(&self, settings: &KeywordSettings) -> Result<()> {
        let mut doc = self.load_document().await;
        doc.config = settings.sanitized();
        self.write_document(&doc).await
    }
}

#[async_trait]
impl CountsStore for SettingsStore {
    async fn load_counts(&self) -> Result<KeywordCounts> {
        Ok(self.load_document().await.counts)
    }

    async fn save_counts(&self, counts: &KeywordCounts) -> Result<()> {
        let mut doc = self.load_document().await;
        doc.counts = counts
            .iter()
            .filter(|(k, _)| !k.trim().is_empty())
            .map(|(k, v)| (k.trim().to_lowercase(), *v))
            .collect();
        self.write_document(&doc).await
    }
}

fn sanitize_document(raw: &Value) -> SettingsDocument {
    match raw.as_object() {
        Some(obj) if obj.contains_key("config") || obj.contains_key("counts") => SettingsDocument {
            config: KeywordSettings::from_value(obj.get("config").unwrap_or(&Value::Null)),
            counts: obj.get("counts").map(sanitize_counts).unwrap_or_default(),
        },
        // A bare config object without the wrapper.
        _ => SettingsDocument {
            config: KeywordSettings::from_value(raw),
            counts: KeywordCounts::new(),
        },
    }
}

/// Lowercase keys, drop non-numeric values and clamp negatives to zero.
pub fn sanitize_counts(raw: &Value) -> KeywordCounts {
    let Some(map) = raw.as_object() else {
        return KeywordCounts::new();
    };
    map.iter()
        .filter_map(|(k, v)| {
            let key = k.trim();
            if key.is_empty() {
                return None;
            }
            let count = match v {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
                Value::String(s) => s.trim().parse::<i64>().ok()?,
                _ => return None,
            };
            Some((key.to_lowercase(), count.max(0) as u64))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join(SETTINGS_FILE));

        assert_eq!(store.load_config().await.unwrap(), KeywordSettings::default());
        assert!(store.load_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counts_roundtrip_keeps_config() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join(SETTINGS_FILE));

        let settings = KeywordSettings {
            keywords: vec!["win".into()],
            global_threshold: Some(3),
            ..Default::default()
        };
        store.save_config(&settings).await.unwrap();

        let mut counts = KeywordCounts::new();
        counts.insert("WIN".into(), 6);
        store.save_counts(&counts).await.unwrap();

        assert_eq!(store.load_config().await.unwrap(), settings);
        assert_eq!(store.load_counts().await.unwrap().get("win"), Some(&6));
    }

    #[tokio::test]
    async fn test_bare_config_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        tokio::fs::write(&path, r#"{"keywords": ["gg"], "global_window": 15}"#)
            .await
            .unwrap();

        let config = SettingsStore::new(&path).load_config().await.unwrap();
        assert_eq!(config.keywords, vec!["gg"]);
        assert_eq!(config.global_window, Some(15));
    }

    #[tokio::test]
    async fn test_legacy_files_fallback() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join(LEGACY_KEYWORDS_TXT), "win\n\n gg \n")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(LEGACY_THRESHOLD_TXT), "4").await.unwrap();
        tokio::fs::write(dir.path().join(LEGACY_WINDOWS_JSON), r#"{"win": 10}"#)
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(LEGACY_COUNTS_JSON), r#"{"WIN": 2, "gg": -1}"#)
            .await
            .unwrap();

        let store = SettingsStore::new(dir.path().join(SETTINGS_FILE));
        let config = store.load_config().await.unwrap();
        let counts = store.load_counts().await.unwrap();

        assert_eq!(config.keywords, vec!["win", "gg"]);
        assert_eq!(config.global_threshold, Some(4));
        assert_eq!(config.per_keyword_windows.get("win"), Some(&10));
        assert_eq!(counts.get("win"), Some(&2));
        assert_eq!(counts.get("gg"), Some(&0));
    }

    #[test]
    fn test_sanitize_counts() {
        let counts = sanitize_counts(&json!({ "A": 1, "b": "2", "c": "x", " ": 3, "d": -4 }));
        assert_eq!(counts.get("a"), Some(&1));
        assert_eq!(counts.get("b"), Some(&2));
        assert_eq!(counts.get("d"), Some(&0));
        assert_eq!(counts.len(), 3);
    }
}
