use chrono::{Datelike, Days, NaiveDate};

/// Returns the Monday of the ISO week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    let offset = date.weekday().num_days_from_monday() as u64;
    date.checked_sub_days(Days::new(offset)).unwrap_or(date)
}

/// Percentage change from `previous` to `current`.
///
/// Undefined (`None`) when the previous value is zero or either input is not
/// finite.
pub fn percent_change(previous: f64, current: f64) -> Option<f64> {
    if previous == 0.0 {
        return None;
    }
    let pct = (current - previous) / previous * 100.0;
    pct.is_finite().then_some(pct)
}

/// Period-over-period changes for an ordered series. The first element is
/// always `None`.
pub fn percent_changes(values: &[f64]) -> Vec<Option<f64>> {
    let mut changes = Vec::with_capacity(values.len());
    for (idx, &value) in values.iter().enumerate() {
        if idx == 0 {
            changes.push(None);
        } else {
            changes.push(percent_change(values[idx - 1], value));
        }
    }
    changes
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Output rounding for percentages (1 dp).
pub fn round_pct(value: f64) -> f64 {
    round_to(value, 1)
}

/// Output rounding for Z-scores (2 dp).
pub fn round_z(value: f64) -> f64 {
    round_to(value, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_week_start_is_monday() {
        // 2025-01-01 is a Wednesday
        let wed = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert_eq!(week_start(wed), NaiveDate::from_ymd_opt(2024, 12, 30).unwrap());

        let mon = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
        assert_eq!(week_start(mon), mon);

        let sun = NaiveDate::from_ymd_opt(2025, 1, 12).unwrap();
        assert_eq!(week_start(sun), mon);
    }

    #[test]
    fn test_percent_change() {
        assert!((percent_change(100.0, 110.0).unwrap() - 10.0).abs() < 1e-9);
        assert!((percent_change(110.0, 99.0).unwrap() + 10.0).abs() < 1e-9);
        assert_eq!(percent_change(0.0, 50.0), None);
        assert_eq!(percent_change(10.0, f64::NAN), None);
    }

    #[test]
    fn test_percent_changes_uses_immediately_preceding_value() {
        let changes = percent_changes(&[100.0, 110.0, 99.0]);
        assert_eq!(changes[0], None);
        assert_eq!(changes[1].map(round_pct), Some(10.0));
        assert_eq!(changes[2].map(round_pct), Some(-10.0));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_pct(12.345), 12.3);
        assert_eq!(round_pct(-4.96), -5.0);
        assert_eq!(round_z(2.3456), 2.35);
        assert_eq!(round_z(-0.004), -0.0);
    }
}
