use crate::aggregator::{regroup_revenue, Rollups, WeeklyDimensionRow, WeeklyTotalRow};
use crate::schema::{AnalysisConfig, AnomalySeverity, Dimension};
use crate::utils::{percent_changes, round_pct, round_z};
use chrono::NaiveDate;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OverallAnomaly {
    pub is_anomaly: bool,
    pub z_score: f64,
    pub severity: AnomalySeverity,
}

impl Default for OverallAnomaly {
    fn default() -> Self {
        Self {
            is_anomaly: false,
            z_score: 0.0,
            severity: AnomalySeverity::Low,
        }
    }
}

/// A flagged entity whose latest week-over-week change is unusual against
/// its own recent history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DriverAnomaly {
    pub dimension: Dimension,
    pub entity: String,
    pub week: NaiveDate,
    pub wow_pct: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnomalyResult {
    pub overall: OverallAnomaly,
    pub drivers: Vec<DriverAnomaly>,
}

impl AnomalyResult {
    pub fn rounded(&self) -> Self {
        Self {
            overall: OverallAnomaly {
                z_score: round_z(self.overall.z_score),
                ..self.overall.clone()
            },
            drivers: self
                .drivers
                .iter()
                .map(|d| DriverAnomaly {
                    wow_pct: round_pct(d.wow_pct),
                    z_score: round_z(d.z_score),
                    ..d.clone()
                })
                .collect(),
        }
    }
}

/// Standard scores using the sample standard deviation.
///
/// Every score is 0 when the deviation is undefined (fewer than two values)
/// or zero (all values identical).
pub fn z_scores(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }

    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let std_dev = variance.sqrt();

    // identical inputs can leave rounding residue instead of an exact zero
    if !std_dev.is_finite() || std_dev <= 1e-12 * mean.abs().max(1.0) {
        return vec![0.0; n];
    }

    values.iter().map(|v| (v - mean) / std_dev).collect()
}

/// Scores the latest week's revenue change against every earlier change.
///
/// Returns the non-anomalous default until `config.min_baseline` changes
/// exist.
pub fn overall_revenue_anomaly(
    weekly_total: &[WeeklyTotalRow],
    config: &AnalysisConfig,
) -> OverallAnomaly {
    let history: Vec<f64> = weekly_total.iter().filter_map(|row| row.wow_pct).collect();

    if history.len() < config.min_baseline {
        debug!(
            "Overall anomaly check skipped: {} WoW points, need {}",
            history.len(),
            config.min_baseline
        );
        return OverallAnomaly::default();
    }

    let latest_z = z_scores(&history).last().copied().unwrap_or(0.0);

    OverallAnomaly {
        is_anomaly: latest_z.abs() >= config.anomaly_threshold,
        z_score: latest_z,
        severity: AnomalySeverity::classify(latest_z, config),
    }
}

/// Per-country check over each country's most recent `config.country_window`
/// changes. Only flagged countries are returned, ordered by name.
pub fn country_revenue_anomalies(
    weekly_by_dimension: &[WeeklyDimensionRow],
    config: &AnalysisConfig,
) -> Vec<DriverAnomaly> {
    let series = regroup_revenue(weekly_by_dimension, |row| row.country.as_str());
    let mut anomalies = Vec::new();

    for (country, weeks) in &series {
        let revenues: Vec<f64> = weeks.values().copied().collect();
        let changes: Vec<(NaiveDate, f64)> = weeks
            .keys()
            .copied()
            .zip(percent_changes(&revenues))
            .filter_map(|(week, pct)| pct.map(|pct| (week, pct)))
            .collect();

        let recent = &changes[changes.len().saturating_sub(config.country_window)..];
        if recent.len() < config.min_baseline {
            debug!(
                "Skipping {}: {} WoW points, need {}",
                country,
                recent.len(),
                config.min_baseline
            );
            continue;
        }

        let window: Vec<f64> = recent.iter().map(|(_, pct)| *pct).collect();
        let scores = z_scores(&window);
        let (Some(&(week, wow_pct)), Some(&latest_z)) = (recent.last(), scores.last()) else {
            continue;
        };

        if latest_z.abs() >= config.anomaly_threshold {
            anomalies.push(DriverAnomaly {
                dimension: Dimension::Country,
                entity: country.clone(),
                week,
                wow_pct,
                z_score: latest_z,
            });
        }
    }

    anomalies
}

/// Runs every anomaly check at full precision. Never fails.
pub fn run_anomalies(rollups: &Rollups, config: &AnalysisConfig) -> AnomalyResult {
    let result = AnomalyResult {
        overall: overall_revenue_anomaly(&rollups.weekly_total, config),
        drivers: country_revenue_anomalies(&rollups.weekly_by_dimension, config),
    };

    debug!(
        "Overall anomaly: {} (z = {:.2}); {} flagged countries",
        result.overall.is_anomaly,
        result.overall.z_score,
        result.drivers.len()
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn week(n: usize) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 6).unwrap() + chrono::Days::new(7 * n as u64)
    }

    fn totals_with_wow(wow: &[f64]) -> Vec<WeeklyTotalRow> {
        let mut rows = vec![WeeklyTotalRow {
            week: week(0),
            revenue: 100.0,
            wow_pct: None,
        }];
        for (i, pct) in wow.iter().enumerate() {
            rows.push(WeeklyTotalRow {
                week: week(i + 1),
                revenue: 100.0,
                wow_pct: Some(*pct),
            });
        }
        rows
    }

    fn country_rows(country: &str, revenues: &[f64]) -> Vec<WeeklyDimensionRow> {
        revenues
            .iter()
            .enumerate()
            .map(|(i, revenue)| WeeklyDimensionRow {
                week: week(i),
                country: country.to_string(),
                channel: "Retail".to_string(),
                store: "Store".to_string(),
                revenue: *revenue,
                units: 0.0,
            })
            .collect()
    }

    #[test]
    fn test_z_scores_zero_variance() {
        assert_eq!(z_scores(&[5.0, 5.0, 5.0, 5.0]), vec![0.0; 4]);
    }

    #[test]
    fn test_z_scores_short_sequences() {
        assert!(z_scores(&[]).is_empty());
        assert_eq!(z_scores(&[42.0]), vec![0.0]);
    }

    #[test]
    fn test_z_scores_use_sample_deviation() {
        // mean 2.5, sample sd = sqrt(5/3)
        let scores = z_scores(&[1.0, 2.0, 3.0, 4.0]);
        let sd = (5.0f64 / 3.0).sqrt();
        assert!((scores[0] - (-1.5 / sd)).abs() < 1e-12);
        assert!((scores[3] - (1.5 / sd)).abs() < 1e-12);
        assert!(scores.iter().all(|z| z.is_finite()));
    }

    #[test]
    fn test_zero_variance_history_is_not_anomalous() {
        let totals = totals_with_wow(&[5.0, 5.0, 5.0, 5.0]);
        let anomaly = overall_revenue_anomaly(&totals, &AnalysisConfig::default());
        assert!(!anomaly.is_anomaly);
        assert_eq!(anomaly.z_score, 0.0);
        assert_eq!(anomaly.severity, AnomalySeverity::Low);
    }

    #[test]
    fn test_insufficient_baseline_returns_default() {
        let totals = totals_with_wow(&[1.0, -2.0, 500.0]);
        let anomaly = overall_revenue_anomaly(&totals, &AnalysisConfig::default());
        assert_eq!(anomaly, OverallAnomaly::default());
    }

    #[test]
    fn test_latest_spike_is_flagged() {
        let totals = totals_with_wow(&[1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, 40.0]);
        let anomaly = overall_revenue_anomaly(&totals, &AnalysisConfig::default());
        assert!(anomaly.is_anomaly);
        assert!(anomaly.z_score >= 2.0);
        assert_ne!(anomaly.severity, AnomalySeverity::Low);
    }

    #[test]
    fn test_severity_high_above_three() {
        let mut wow = vec![0.0; 15];
        wow.push(100.0);
        let totals = totals_with_wow(&wow);
        let anomaly = overall_revenue_anomaly(&totals, &AnalysisConfig::default());
        // z of a lone spike among n values is (n-1)/sqrt(n) = 3.75 for n = 16
        assert!((anomaly.z_score - 3.75).abs() < 1e-9);
        assert_eq!(anomaly.severity, AnomalySeverity::High);
    }

    #[test]
    fn test_country_anomaly_flags_latest_spike() {
        let mut rows = country_rows(
            "USA",
            &[100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0, 200.0],
        );
        rows.extend(country_rows(
            "UK",
            &[100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0, 101.0],
        ));
        let anomalies = country_revenue_anomalies(&rows, &AnalysisConfig::default());

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].entity, "USA");
        assert_eq!(anomalies[0].dimension, Dimension::Country);
        assert_eq!(anomalies[0].week, week(7));
        assert!((anomalies[0].wow_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_country_with_short_history_is_skipped() {
        let rows = country_rows("USA", &[100.0, 100.0, 100.0, 500.0]);
        assert!(country_revenue_anomalies(&rows, &AnalysisConfig::default()).is_empty());
    }

    #[test]
    fn test_country_window_limits_history() {
        // An old spike outside the 4-point window must not dampen the new one.
        let rows = country_rows(
            "USA",
            &[100.0, 300.0, 100.0, 101.0, 100.0, 101.0, 100.0, 180.0],
        );
        let config = AnalysisConfig {
            country_window: 4,
            anomaly_threshold: 1.4,
            ..AnalysisConfig::default()
        };
        let anomalies = country_revenue_anomalies(&rows, &config);
        assert_eq!(anomalies.len(), 1);

        let full = AnalysisConfig {
            country_window: 8,
            anomaly_threshold: 1.4,
            ..AnalysisConfig::default()
        };
        assert!(country_revenue_anomalies(&rows, &full).is_empty());
    }

    #[test]
    fn test_rounded_output() {
        let result = AnomalyResult {
            overall: OverallAnomaly {
                is_anomaly: true,
                z_score: 2.456,
                severity: AnomalySeverity::Moderate,
            },
            drivers: vec![DriverAnomaly {
                dimension: Dimension::Country,
                entity: "USA".to_string(),
                week: week(3),
                wow_pct: 98.76,
                z_score: -2.004,
            }],
        };
        let rounded = result.rounded();
        assert_eq!(rounded.overall.z_score, 2.46);
        assert_eq!(rounded.drivers[0].wow_pct, 98.8);
        assert_eq!(rounded.drivers[0].z_score, -2.0);
    }
}
