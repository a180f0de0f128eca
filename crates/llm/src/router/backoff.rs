use std::time::Duration;

/// Wait before the attempt following failed attempt number `attempt` (1-based).
///
/// `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1);

    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);

    base.checked_mul(factor).unwrap_or(max).min(max)
}
