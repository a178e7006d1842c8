use std::collections::BTreeMap;

use serde::Serialize;

use super::counters::{ACCEPTABLE_HIT_RATE, ACCEPTABLE_LATENCY_MS, Counters, Grade};

/// Error rate above which storage quotas are suspected.
pub const ERROR_RATE_LIMIT: f64 = 0.05;
/// Requests a resource needs before its own hit rate is judged.
pub const RESOURCE_MIN_REQUESTS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendationKind {
    EnableWarming,
    OptimizeRetrieval,
    CheckStorageQuotas,
    ReconsiderPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

/// Point-in-time view produced by `TelemetryCollector::report`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub generated_at: i64,
    pub counters: Counters,
    pub hit_rate: f64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub grade: Grade,
    pub recommendations: Vec<Recommendation>,
    pub resources: BTreeMap<String, Counters>,
    pub window_len: usize,
}

pub(super) fn recommendations(
    global: &Counters,
    resources: &BTreeMap<String, Counters>,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    let lookups = global.hits + global.misses;
    if lookups > 0 && global.hit_rate() < ACCEPTABLE_HIT_RATE {
        out.push(Recommendation {
            kind: RecommendationKind::EnableWarming,
            message: format!(
                "hit rate {:.0}% is below {:.0}%; enable warming for frequently missed assets",
                global.hit_rate() * 100.0,
                ACCEPTABLE_HIT_RATE * 100.0
            ),
            resource: None,
        });
    }
    if global.avg_latency_ms() > ACCEPTABLE_LATENCY_MS {
        out.push(Recommendation {
            kind: RecommendationKind::OptimizeRetrieval,
            message: format!(
                "average latency {:.1} ms exceeds {ACCEPTABLE_LATENCY_MS} ms; optimize retrieval",
                global.avg_latency_ms()
            ),
            resource: None,
        });
    }
    if global.error_rate() > ERROR_RATE_LIMIT {
        out.push(Recommendation {
            kind: RecommendationKind::CheckStorageQuotas,
            message: format!(
                "error rate {:.1}% exceeds {:.0}%; check storage quotas",
                global.error_rate() * 100.0,
                ERROR_RATE_LIMIT * 100.0
            ),
            resource: None,
        });
    }
    for (resource, counters) in resources {
        let requests = counters.hits + counters.misses;
        if requests >= RESOURCE_MIN_REQUESTS && counters.hit_rate() < ACCEPTABLE_HIT_RATE {
            out.push(Recommendation {
                kind: RecommendationKind::ReconsiderPolicy,
                message: format!(
                    "{resource} hit rate is {:.0}% over {requests} requests; reconsider its cache policy",
                    counters.hit_rate() * 100.0
                ),
                resource: Some(resource.clone()),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_cache_gets_no_recommendations() {
        assert!(recommendations(&Counters::default(), &BTreeMap::new()).is_empty());
    }

    #[test]
    fn each_rule_fires_independently() {
        let global = Counters {
            hits: 1,
            misses: 9,
            total_requests: 10,
            total_latency_ms: 3_000.0,
            errors: 2,
            ..Counters::default()
        };
        let mut resources = BTreeMap::new();
        resources.insert(
            "/api/clans".to_string(),
            Counters {
                hits: 1,
                misses: 9,
                ..Counters::default()
            },
        );
        resources.insert(
            "/api/rare".to_string(),
            Counters {
                misses: 3,
                ..Counters::default()
            },
        );

        let kinds: Vec<_> = recommendations(&global, &resources)
            .into_iter()
            .map(|rec| (rec.kind, rec.resource))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (RecommendationKind::EnableWarming, None),
                (RecommendationKind::OptimizeRetrieval, None),
                (RecommendationKind::CheckStorageQuotas, None),
                (
                    RecommendationKind::ReconsiderPolicy,
                    Some("/api/clans".to_string())
                ),
            ]
        );
    }
}
