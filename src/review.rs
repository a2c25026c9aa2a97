use crate::aggregator::WeeklyTotalRow;
use crate::anomaly::{run_anomalies, AnomalyResult, DriverAnomaly, OverallAnomaly};
use crate::error::Result;
use crate::schema::AnalysisConfig;
use crate::trend::{run_trends, DimensionTrend, OverallTrend, TrendResult, UnitPriceTrend};
use crate::utils::round_pct;
use crate::PreparedData;
use chrono::NaiveDate;
use log::{info, warn};
use serde::{Deserialize, Serialize};

pub const FALLBACK_SUMMARY: &str = "Executive summary could not be generated due to an AI service issue. All deterministic analytics and signals are valid.";

/// The deterministic facts a summary writer may narrate. All values are
/// already rounded for output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryInput<'a> {
    pub analysis_week: NaiveDate,
    pub overall: &'a OverallTrend,
    pub countries: &'a [DimensionTrend],
    pub channels: &'a [DimensionTrend],
    pub unit_price: Option<&'a UnitPriceTrend>,
    pub promotions: &'a [DimensionTrend],
    pub overall_anomaly: &'a OverallAnomaly,
    pub drivers: &'a [DriverAnomaly],
}

impl<'a> SummaryInput<'a> {
    fn new(analysis_week: NaiveDate, trends: &'a TrendResult, anomalies: &'a AnomalyResult) -> Self {
        Self {
            analysis_week,
            overall: &trends.overall,
            countries: &trends.countries,
            channels: &trends.channels,
            unit_price: trends.unit_price.as_ref(),
            promotions: &trends.promotions,
            overall_anomaly: &anomalies.overall,
            drivers: &anomalies.drivers,
        }
    }

    /// Country with the largest week-over-week change.
    pub fn best_country(&self) -> Option<&'a DimensionTrend> {
        self.countries
            .iter()
            .max_by(|a, b| a.wow_pct.total_cmp(&b.wow_pct))
    }

    /// Country with the smallest week-over-week change.
    pub fn worst_country(&self) -> Option<&'a DimensionTrend> {
        self.countries
            .iter()
            .min_by(|a, b| a.wow_pct.total_cmp(&b.wow_pct))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Produces the prose executive summary, typically by calling a language
/// model. Passed explicitly to [`build_review`].
pub trait SummaryWriter {
    fn write_summary(&self, input: &SummaryInput<'_>) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub analysis_week: NaiveDate,
    pub metrics: OverallTrend,
    pub trends: TrendResult,
    pub weekly_total: Vec<WeeklyTotalRow>,
    pub anomalies: AnomalyResult,
    pub executive_summary: String,
    /// False when the fallback summary was used.
    pub summary_generated: bool,
}

impl ReviewReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Assembles the full weekly review.
///
/// Fails only when the overall trend cannot be computed. A missing or
/// failing writer never fails the review; the fallback summary is used.
pub fn build_review(
    prepared: &PreparedData,
    config: &AnalysisConfig,
    writer: Option<&dyn SummaryWriter>,
) -> Result<ReviewReport> {
    let trends = run_trends(&prepared.dataset, &prepared.rollups, config)?.rounded();
    let anomalies = run_anomalies(&prepared.rollups, config).rounded();
    let analysis_week = trends.overall.week;

    let weekly_total = prepared
        .rollups
        .weekly_total
        .iter()
        .map(|row| WeeklyTotalRow {
            wow_pct: row.wow_pct.map(round_pct),
            ..row.clone()
        })
        .collect();

    let input = SummaryInput::new(analysis_week, &trends, &anomalies);
    let generated = match writer {
        Some(writer) => match writer.write_summary(&input) {
            Ok(summary) if !summary.trim().is_empty() => Some(summary.trim().to_string()),
            Ok(_) => {
                warn!("Summary writer returned an empty summary, using fallback");
                None
            }
            Err(e) => {
                warn!("Summary writer failed, using fallback: {}", e);
                None
            }
        },
        None => {
            warn!("No summary writer configured, using fallback");
            None
        }
    };

    info!(
        "Review for week {}: revenue {:+.1}% ({:?}), {} flagged drivers",
        analysis_week,
        trends.overall.wow_pct,
        trends.overall.severity,
        anomalies.drivers.len()
    );

    let summary_generated = generated.is_some();
    Ok(ReviewReport {
        analysis_week,
        metrics: trends.overall.clone(),
        trends,
        weekly_total,
        anomalies,
        executive_summary: generated.unwrap_or_else(|| FALLBACK_SUMMARY.to_string()),
        summary_generated,
    })
}
