//! Retry delays for connection attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Delay to wait after failed attempt number `attempt` (1-based).
///
/// Grows as `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
/// With jitter the delay is drawn uniformly from `[0, capped]`.
pub(crate) fn delay_for(config: &BackoffConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let factor = config.multiplier.max(1.0).powi(exponent);
    let capped = (config.initial_delay.as_secs_f64() * factor).min(config.max_delay.as_secs_f64());
    let secs = if config.jitter && capped > 0.0 {
        rand::rng().random_range(0.0..=capped)
    } else {
        capped
    };
    Duration::from_secs_f64(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: false,
        }
    }

    #[test]
    fn grows_exponentially() {
        let config = fixed();
        assert_eq!(delay_for(&config, 1), Duration::from_millis(100));
        assert_eq!(delay_for(&config, 2), Duration::from_millis(200));
        assert_eq!(delay_for(&config, 3), Duration::from_millis(400));
    }

    #[test]
    fn capped_at_max_delay() {
        let config = fixed();
        assert_eq!(delay_for(&config, 5), Duration::from_secs(1));
        assert_eq!(delay_for(&config, u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = BackoffConfig {
            jitter: true,
            ..fixed()
        };
        for attempt in 1..8 {
            let unjittered = delay_for(&fixed(), attempt);
            assert!(delay_for(&config, attempt) <= unjittered);
        }
    }
}
