//! Reconnect backoff: exponential with full jitter.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Consecutive-failure count is capped at this many doublings.
const MAX_EXPONENT: u32 = 6;

/// Compute the delay before the next reconnect attempt.
///
/// `attempt` is the number of consecutive failures so far (0 on the first
/// retry). `jitter` is a caller-supplied sample in `[0.0, 1.0)`, normalized
/// here to the `[0.5, 1.0)` range -- kept as a parameter so the formula is
/// deterministically testable.
pub fn compute_delay(cfg: &ReconnectConfig, attempt: u32, jitter: f64) -> Duration {
    let exponent = attempt.min(MAX_EXPONENT);
    let unjittered = cfg.base.saturating_mul(1u32 << exponent).min(cfg.cap);
    let factor = 0.5 + (jitter.clamp(0.0, 1.0) * 0.5);
    unjittered.mul_f64(factor)
}

/// Sample a fresh `[0.5, 1.0)` jittered delay using the thread RNG.
pub fn next_delay(cfg: &ReconnectConfig, attempt: u32) -> Duration {
    let jitter: f64 = rand::random();
    compute_delay(cfg, attempt, jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ReconnectConfig {
        ReconnectConfig { base: Duration::from_millis(500), cap: Duration::from_secs(10), max_attempts: None }
    }

    #[test]
    fn delay_is_within_half_to_full_of_exponential() {
        let c = cfg();
        for attempt in 0..10 {
            let lo = compute_delay(&c, attempt, 0.0);
            let hi = compute_delay(&c, attempt, 0.999_999);
            let exponent = attempt.min(6);
            let unjittered = c.base.saturating_mul(1u32 << exponent).min(c.cap);
            assert_eq!(lo, unjittered.mul_f64(0.5));
            assert!(hi <= unjittered, "hi {:?} should not exceed unjittered {:?}", hi, unjittered);
            assert!(hi > lo);
        }
    }

    #[test]
    fn delay_never_exceeds_cap() {
        let c = cfg();
        for attempt in 0..20 {
            let d = compute_delay(&c, attempt, 1.0);
            assert!(d <= c.cap, "attempt {attempt} delay {:?} exceeded cap {:?}", d, c.cap);
        }
    }

    #[test]
    fn exponent_caps_at_six_consecutive_failures() {
        let c = cfg();
        let at_six = compute_delay(&c, 6, 1.0);
        let at_twenty = compute_delay(&c, 20, 1.0);
        assert_eq!(at_six, at_twenty);
    }
}
