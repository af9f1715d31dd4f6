use chrono::Duration;
use ring::rand::{SecureRandom, SystemRandom};

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
/// capped at `max`, then jittered into `[delay/2, delay]` by `fraction`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, fraction: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30);
    let multiplier = 1i32 << exponent;
    let ceiling = base
        .checked_mul(multiplier)
        .filter(|delay| *delay <= max)
        .unwrap_or(max);

    let fraction = fraction.clamp(0.0, 1.0);
    let ceiling_ms = ceiling.num_milliseconds();
    let half = ceiling_ms / 2;
    let jittered = half + ((ceiling_ms - half) as f64 * fraction) as i64;
    Duration::milliseconds(jittered)
}

/// Uniform value in `[0, 1]`. Falls back to 1.0 (no jitter) if the system RNG fails.
pub fn jitter_fraction() -> f64 {
    let mut bytes = [0u8; 4];
    match SystemRandom::new().fill(&mut bytes) {
        Ok(()) => f64::from(u32::from_le_bytes(bytes)) / f64::from(u32::MAX),
        Err(_) => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::{backoff_delay, jitter_fraction};

    #[test]
    fn delay_doubles_until_capped() {
        let base = Duration::seconds(30);
        let max = Duration::seconds(600);

        assert_eq!(backoff_delay(1, base, max, 1.0), Duration::seconds(30));
        assert_eq!(backoff_delay(2, base, max, 1.0), Duration::seconds(60));
        assert_eq!(backoff_delay(3, base, max, 1.0), Duration::seconds(120));
        assert_eq!(backoff_delay(6, base, max, 1.0), Duration::seconds(600));
        assert_eq!(backoff_delay(40, base, max, 1.0), Duration::seconds(600));
    }

    #[test]
    fn jitter_stays_within_upper_half() {
        let base = Duration::seconds(30);
        let max = Duration::seconds(600);

        assert_eq!(backoff_delay(2, base, max, 0.0), Duration::seconds(30));
        for _ in 0..32 {
            let fraction = jitter_fraction();
            assert!((0.0..=1.0).contains(&fraction));
            let delay = backoff_delay(3, base, max, fraction);
            assert!(delay >= Duration::seconds(60) && delay <= Duration::seconds(120));
        }
    }
}
