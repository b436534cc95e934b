//! Exponential backoff for outbox/inbox retry scheduling (spec §4.2 "retry
//! delay", §4.3). Ported from the teacher's scheduler backoff: same
//! `min(base * multiplier^attempt, max) + jitter` formula, same
//! dependency-free pseudo-random jitter.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base_ms: 500, max_ms: 300_000, multiplier: 2.0, jitter_fraction: 0.25 }
    }
}

/// Next backoff delay for `attempt` (0-indexed retry count).
pub fn next_backoff(attempt: i64, config: &BackoffConfig) -> Duration {
    let base = config.base_ms as f64;
    let raw = base * config.multiplier.powi(attempt.max(0) as i32);
    let capped = raw.min(config.max_ms as f64);

    let jitter_range = capped * config.jitter_fraction;
    let with_jitter = (capped + pseudo_rand(attempt) * jitter_range).max(0.0);

    Duration::from_millis(with_jitter as u64)
}

/// Deterministic pseudo-jitter in `[-0.5, 0.5)`, seeded by `attempt` — avoids
/// pulling in a `rand` dependency for a small spread.
fn pseudo_rand(attempt: i64) -> f64 {
    const A: u64 = 1_664_525;
    const C: u64 = 1_013_904_223;
    const M: u64 = 1u64 << 32;
    let state = A.wrapping_mul(attempt.unsigned_abs()).wrapping_add(C) % M;
    (state as f64 / M as f64) - 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_then_caps() {
        let cfg = BackoffConfig::default();
        assert!(next_backoff(5, &cfg) >= next_backoff(0, &cfg));
        let capped = next_backoff(100, &cfg);
        let headroom = cfg.max_ms + (cfg.max_ms as f64 * cfg.jitter_fraction) as u64;
        assert!(capped.as_millis() as u64 <= headroom);
    }
}
