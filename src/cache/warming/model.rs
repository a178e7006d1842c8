//! Navigation observations and the first-order transition model built on them.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;

/// Observations kept in the rolling log.
pub const OBSERVATION_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationKind {
    Pageview,
    Interaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub kind: ObservationKind,
    /// Page path for pageviews, element identifier for interactions.
    pub target: String,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStats {
    pub views: u64,
    pub dwell_ms: u64,
    pub last_seen_ms: i64,
}

/// Bounded log of what the user did, plus per-path counters that outlive it.
#[derive(Debug, Default)]
pub struct BehaviorLog {
    observations: VecDeque<Observation>,
    paths: HashMap<String, PathStats>,
    current: Option<(String, i64)>,
}

impl BehaviorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pageview(&mut self, path: &str, at_ms: i64) {
        if let Some((previous, since)) = self.current.take()
            && let Some(stats) = self.paths.get_mut(&previous)
        {
            stats.dwell_ms += at_ms.saturating_sub(since).max(0) as u64;
        }
        let stats = self.paths.entry(path.to_string()).or_default();
        stats.views += 1;
        stats.last_seen_ms = at_ms;
        self.current = Some((path.to_string(), at_ms));
        self.push(Observation {
            kind: ObservationKind::Pageview,
            target: path.to_string(),
            at_ms,
        });
    }

    pub fn record_interaction(&mut self, target: &str, at_ms: i64) {
        self.push(Observation {
            kind: ObservationKind::Interaction,
            target: target.to_string(),
            at_ms,
        });
    }

    fn push(&mut self, observation: Observation) {
        if self.observations.len() == OBSERVATION_LIMIT {
            self.observations.pop_front();
        }
        self.observations.push_back(observation);
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn current_path(&self) -> Option<&str> {
        self.current.as_ref().map(|(path, _)| path.as_str())
    }

    pub fn path_stats(&self, path: &str) -> Option<PathStats> {
        self.paths.get(path).copied()
    }

    /// Transition model over consecutive pageviews in the log.
    pub fn transitions(&self) -> TransitionModel {
        let mut model = TransitionModel::default();
        let mut pageviews = self
            .observations
            .iter()
            .filter(|observation| observation.kind == ObservationKind::Pageview)
            .map(|observation| observation.target.as_str());
        let Some(mut previous) = pageviews.next() else {
            return model;
        };
        for next in pageviews {
            if next != previous {
                model.observe(previous, next);
            }
            previous = next;
        }
        model
    }
}

/// Counts of `from → to` page transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionModel {
    counts: BTreeMap<String, BTreeMap<String, u64>>,
}

impl TransitionModel {
    pub fn observe(&mut self, from: &str, to: &str) {
        *self
            .counts
            .entry(from.to_string())
            .or_default()
            .entry(to.to_string())
            .or_default() += 1;
    }

    pub fn total_from(&self, from: &str) -> u64 {
        self.counts
            .get(from)
            .map(|targets| targets.values().sum())
            .unwrap_or(0)
    }

    /// Share of transitions out of `from` that went to `to`; zero when
    /// nothing has left `from` yet.
    pub fn confidence(&self, from: &str, to: &str) -> f64 {
        let total = self.total_from(from);
        if total == 0 {
            return 0.0;
        }
        let count = self
            .counts
            .get(from)
            .and_then(|targets| targets.get(to))
            .copied()
            .unwrap_or(0);
        count as f64 / total as f64
    }

    /// Next paths from `from` whose confidence reaches `threshold`, most
    /// likely first.
    pub fn predictions(&self, from: &str, threshold: f64) -> Vec<(String, f64)> {
        let Some(targets) = self.counts.get(from) else {
            return Vec::new();
        };
        let mut out: Vec<(String, f64)> = targets
            .keys()
            .map(|to| (to.clone(), self.confidence(from, to)))
            .filter(|(_, confidence)| *confidence >= threshold)
            .collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(paths: &[&str]) -> BehaviorLog {
        let mut log = BehaviorLog::new();
        for (index, path) in paths.iter().enumerate() {
            log.record_pageview(path, index as i64 * 1_000);
        }
        log
    }

    #[test]
    fn alternating_pages_predict_each_other() {
        let model = log_of(&["A", "B", "A", "B", "A", "B"]).transitions();
        assert_eq!(model.confidence("A", "B"), 1.0);
        assert_eq!(model.predictions("A", 0.7), vec![("B".to_string(), 1.0)]);
    }

    #[test]
    fn no_transitions_means_no_predictions() {
        let model = log_of(&["A"]).transitions();
        assert_eq!(model.total_from("A"), 0);
        assert_eq!(model.confidence("A", "B"), 0.0);
        assert!(model.predictions("A", 0.7).is_empty());
    }

    #[test]
    fn split_traffic_stays_below_threshold() {
        let model = log_of(&["A", "B", "A", "C", "A", "B"]).transitions();
        assert!((model.confidence("A", "B") - 2.0 / 3.0).abs() < 1e-9);
        assert!(model.predictions("A", 0.7).is_empty());
    }

    #[test]
    fn log_is_bounded_and_tracks_dwell() {
        let mut log = BehaviorLog::new();
        for index in 0..60 {
            log.record_interaction("button", index);
        }
        assert_eq!(log.len(), OBSERVATION_LIMIT);

        log.record_pageview("/a", 1_000);
        log.record_pageview("/b", 4_500);
        let stats = log.path_stats("/a").expect("stats");
        assert_eq!(stats.views, 1);
        assert_eq!(stats.dwell_ms, 3_500);
        assert_eq!(log.current_path(), Some("/b"));
    }
}
