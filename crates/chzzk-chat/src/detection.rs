//! Sliding-window keyword detection.
//!
//! Every attributed hit bumps the keyword's cumulative count and is pushed
//! into a per-keyword window. When the window holds at least `threshold`
//! hits the full cumulative map is persisted and a [`WindowCrossing`] is
//! reported. There is no cooldown: every qualifying hit reports again.

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::policy::{KeywordKey, KeywordPolicy};
use crate::store::{CountsStore, KeywordCounts};

/// Per-keyword counters.
#[derive(Debug, Clone, Default)]
pub struct KeywordState {
    /// All-time hits, persisted on threshold crossings.
    pub cumulative_count: u64,
    /// Hit timestamps inside the current window, oldest first.
    window_hits: VecDeque<DateTime<Utc>>,
}

impl KeywordState {
    fn seeded(cumulative_count: u64) -> Self {
        Self {
            cumulative_count,
            window_hits: VecDeque::new(),
        }
    }

    /// Hits currently inside the window.
    pub fn window_count(&self) -> usize {
        self.window_hits.len()
    }

    /// Record a hit and evict entries older than `at - window`.
    ///
    /// Entries exactly at the boundary are kept. Eviction only looks at the
    /// front of the queue, so a late out-of-order timestamp stays until
    /// everything before it has expired.
    fn push(&mut self, at: DateTime<Utc>, window: Duration) -> usize {
        self.cumulative_count += 1;
        self.window_hits.push_back(at);

        // No cutoff exists below the representable range; nothing expires.
        if let Some(cutoff) = at.checked_sub_signed(window) {
            while self.window_hits.front().is_some_and(|ts| *ts < cutoff) {
                self.window_hits.pop_front();
            }
        }
        self.window_hits.len()
    }
}

/// Outcome of a hit whose window count reached the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCrossing {
    pub key: KeywordKey,
    pub display: String,
    pub window_count: usize,
    pub threshold: u32,
    pub window_secs: u32,
    pub cumulative_count: u64,
}

/// Per-keyword window counters bound to a policy and a counts store.
pub struct DetectionEngine {
    policy: Arc<KeywordPolicy>,
    states: FxHashMap<KeywordKey, KeywordState>,
    counts: Arc<dyn CountsStore>,
}

impl DetectionEngine {
    /// Create an engine with cumulative counts seeded from `seed`.
    ///
    /// Only keywords present in the policy are tracked; counts of keywords
    /// no longer configured are dropped on the next save.
    pub fn new(policy: Arc<KeywordPolicy>, seed: &KeywordCounts, counts: Arc<dyn CountsStore>) -> Self {
        let states = policy
            .rules()
            .map(|rule| {
                let seeded = seed.get(rule.key().as_str()).copied().unwrap_or(0);
                (rule.key().clone(), KeywordState::seeded(seeded))
            })
            .collect();

        Self {
            policy,
            states,
            counts,
        }
    }

    pub fn policy(&self) -> &Arc<KeywordPolicy> {
        &self.policy
    }

    pub fn state(&self, key: &KeywordKey) -> Option<&KeywordState> {
        self.states.get(key)
    }

    /// Record one hit for `key` at `at`.
    ///
    /// Returns `Ok(Some(_))` when the window count reached the threshold and
    /// the counts were persisted. A persistence error is returned as `Err`;
    /// the in-memory increment and eviction are kept either way.
    pub async fn record_hit(
        &mut self,
        key: &KeywordKey,
        at: DateTime<Utc>,
    ) -> Result<Option<WindowCrossing>> {
        let Some(rule) = self.policy.rule(key) else {
            debug!(keyword = %key, "Hit for a keyword outside the policy ignored");
            return Ok(None);
        };
        let threshold = rule.threshold();
        let window_secs = rule.window_secs();
        let display = rule.display().to_string();

        let state = self.states.entry(key.clone()).or_default();
        let window_count = state.push(at, Duration::seconds(i64::from(window_secs)));
        let cumulative_count = state.cumulative_count;

        if window_count < threshold as usize {
            return Ok(None);
        }

        self.counts.save_counts(&self.cumulative_counts()).await?;

        Ok(Some(WindowCrossing {
            key: key.clone(),
            display,
            window_count,
            threshold,
            window_secs,
            cumulative_count,
        }))
    }

    /// Snapshot of all cumulative counts.
    pub fn cumulative_counts(&self) -> KeywordCounts {
        self.states
            .iter()
            .map(|(k, s)| (k.as_str().to_string(), s.cumulative_count))
            .collect()
    }

    /// Drop every window; cumulative counts are untouched.
    pub fn reset_windows(&mut self) {
        for state in self.states.values_mut() {
            state.window_hits.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeywordSettings, RuntimeOverrides};
    use crate::error::ChatError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryCounts {
        saved: Mutex<Vec<KeywordCounts>>,
        fail: bool,
    }

    #[async_trait]
    impl CountsStore for MemoryCounts {
        async fn load_counts(&self) -> Result<KeywordCounts> {
            Ok(self.saved.lock().unwrap().last().cloned().unwrap_or_default())
        }

        async fn save_counts(&self, counts: &KeywordCounts) -> Result<()> {
            if self.fail {
                return Err(ChatError::Io(std::io::Error::other("disk full")));
            }
            self.saved.lock().unwrap().push(counts.clone());
            Ok(())
        }
    }

    fn policy(threshold: u32, window: u32) -> Arc<KeywordPolicy> {
        let settings = KeywordSettings {
            keywords: vec!["win".into()],
            global_threshold: Some(threshold),
            global_window: Some(window),
            ..Default::default()
        };
        Arc::new(KeywordPolicy::build(&settings, &RuntimeOverrides::default()).unwrap())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn key() -> KeywordKey {
        KeywordKey::new("win").unwrap()
    }

    #[tokio::test]
    async fn test_sliding_window_fires_without_suppression() {
        let store = Arc::new(MemoryCounts::default());
        let mut engine = DetectionEngine::new(policy(2, 15), &KeywordCounts::new(), store.clone());

        assert_eq!(engine.record_hit(&key(), at(0)).await.unwrap(), None);
        // Window at t=10 is [-5, 10]: hits at 0 and 10.
        let crossing = engine.record_hit(&key(), at(10)).await.unwrap().unwrap();
        assert_eq!(crossing.window_count, 2);

        // t=20: cutoff 5 evicts 0, window holds [10, 20].
        let crossing = engine.record_hit(&key(), at(20)).await.unwrap().unwrap();
        assert_eq!(crossing.window_count, 2);
        assert_eq!(crossing.threshold, 2);
        assert_eq!(crossing.window_secs, 15);

        // t=30: cutoff 15 evicts 10, window holds [20, 30] and fires again.
        let crossing = engine.record_hit(&key(), at(30)).await.unwrap().unwrap();
        assert_eq!(crossing.window_count, 2);
        assert_eq!(crossing.cumulative_count, 4);

        assert_eq!(store.saved.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_boundary_tie_is_kept() {
        let mut engine = DetectionEngine::new(
            policy(3, 10),
            &KeywordCounts::new(),
            Arc::new(MemoryCounts::default()),
        );

        engine.record_hit(&key(), at(0)).await.unwrap();
        engine.record_hit(&key(), at(5)).await.unwrap();
        let crossing = engine.record_hit(&key(), at(10)).await.unwrap();

        assert_eq!(crossing.map(|c| c.window_count), Some(3));
    }

    #[tokio::test]
    async fn test_earliest_timestamp_does_not_underflow() {
        let mut engine = DetectionEngine::new(
            policy(2, 60),
            &KeywordCounts::new(),
            Arc::new(MemoryCounts::default()),
        );

        assert_eq!(engine.record_hit(&key(), DateTime::<Utc>::MIN_UTC).await.unwrap(), None);
        let crossing = engine.record_hit(&key(), DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(crossing.map(|c| c.window_count), Some(2));

        // A normal hit afterwards evicts the out-of-range ones.
        assert_eq!(engine.record_hit(&key(), at(0)).await.unwrap(), None);
        assert_eq!(engine.state(&key()).unwrap().window_count(), 1);
    }

    #[tokio::test]
    async fn test_seeded_count_is_persisted_incremented() {
        let store = Arc::new(MemoryCounts::default());
        let mut seed = KeywordCounts::new();
        seed.insert("win".into(), 5);
        let mut engine = DetectionEngine::new(policy(1, 60), &seed, store.clone());

        engine.record_hit(&key(), at(0)).await.unwrap();

        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.last().unwrap().get("win"), Some(&6));
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_state() {
        let store = Arc::new(MemoryCounts {
            fail: true,
            ..Default::default()
        });
        let mut engine = DetectionEngine::new(policy(1, 60), &KeywordCounts::new(), store);

        assert!(engine.record_hit(&key(), at(0)).await.is_err());
        let state = engine.state(&key()).unwrap();
        assert_eq!(state.cumulative_count, 1);
        assert_eq!(state.window_count(), 1);
    }

    #[tokio::test]
    async fn test_reset_windows_keeps_cumulative() {
        let mut engine = DetectionEngine::new(
            policy(5, 60),
            &KeywordCounts::new(),
            Arc::new(MemoryCounts::default()),
        );
        engine.record_hit(&key(), at(0)).await.unwrap();
        engine.record_hit(&key(), at(1)).await.unwrap();

        engine.reset_windows();

        let state = engine.state(&key()).unwrap();
        assert_eq!(state.window_count(), 0);
        assert_eq!(state.cumulative_count, 2);
        assert_eq!(engine.cumulative_counts().get("win"), Some(&2));
    }

    #[tokio::test]
    async fn test_unknown_keyword_is_ignored() {
        let mut engine = DetectionEngine::new(
            policy(1, 60),
            &KeywordCounts::new(),
            Arc::new(MemoryCounts::default()),
        );
        let other = KeywordKey::new("lose").unwrap();

        assert_eq!(engine.record_hit(&other, at(0)).await.unwrap(), None);
        assert!(engine.state(&other).is_none());
    }
}
