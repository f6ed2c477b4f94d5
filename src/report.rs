//! Period-over-period figures for revenue summaries.

use crate::model::Money;

/// Percentage change from `previous` to `current`, rounded to two decimals.
///
/// A zero baseline reports 100 when anything was earned and 0 otherwise.
pub fn growth_percent(previous: Money, current: Money) -> f64 {
    if previous == 0 {
        return if current > 0 { 100.0 } else { 0.0 };
    }
    let raw = (current - previous) as f64 / previous as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_baseline() {
        assert_eq!(growth_percent(0, 250_000), 100.0);
        assert_eq!(growth_percent(0, 0), 0.0);
    }

    #[test]
    fn ordinary_growth_and_decline() {
        assert_eq!(growth_percent(200_000, 300_000), 50.0);
        assert_eq!(growth_percent(300_000, 150_000), -50.0);
        assert_eq!(growth_percent(300_000, 400_000), 33.33);
    }

    #[test]
    fn flat_period() {
        assert_eq!(growth_percent(120_000, 120_000), 0.0);
    }
}
