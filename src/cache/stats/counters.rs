use serde::Serialize;

/// Hit/miss bookkeeping, kept globally and per resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub invalidations: u64,
    pub errors: u64,
    pub total_requests: u64,
    pub total_latency_ms: f64,
    pub bytes_saved: u64,
    pub sri_failures: u64,
    pub evictions: u64,
    pub warmed: u64,
    pub warming_failures: u64,
}

impl Counters {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_latency_ms / self.total_requests as f64
    }

    pub fn error_rate(&self) -> f64 {
        let operations = self.total_requests + self.stores;
        if operations == 0 {
            return 0.0;
        }
        self.errors as f64 / operations as f64
    }

    pub(super) fn add_request(&mut self, latency_ms: f64) {
        self.total_requests += 1;
        self.total_latency_ms += latency_ms.max(0.0);
    }
}

/// Letter grade derived from hit rate and average latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

pub const EXCELLENT_HIT_RATE: f64 = 0.95;
pub const GOOD_HIT_RATE: f64 = 0.85;
pub const ACCEPTABLE_HIT_RATE: f64 = 0.70;
pub const POOR_HIT_RATE: f64 = 0.50;

pub const EXCELLENT_LATENCY_MS: f64 = 50.0;
pub const GOOD_LATENCY_MS: f64 = 100.0;
pub const ACCEPTABLE_LATENCY_MS: f64 = 200.0;
pub const POOR_LATENCY_MS: f64 = 500.0;

impl Grade {
    pub fn from_performance(hit_rate: f64, avg_latency_ms: f64) -> Self {
        if hit_rate >= EXCELLENT_HIT_RATE && avg_latency_ms < EXCELLENT_LATENCY_MS {
            Self::A
        } else if hit_rate >= GOOD_HIT_RATE && avg_latency_ms < GOOD_LATENCY_MS {
            Self::B
        } else if hit_rate >= ACCEPTABLE_HIT_RATE && avg_latency_ms < ACCEPTABLE_LATENCY_MS {
            Self::C
        } else if hit_rate >= POOR_HIT_RATE && avg_latency_ms < POOR_LATENCY_MS {
            Self::D
        } else {
            Self::F
        }
    }
}
