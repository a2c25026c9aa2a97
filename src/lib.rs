//! # Weekly Review
//!
//! A library for turning a transaction-level retail sales export into a
//! deterministic weekly performance review: week-over-week trends, Z-score
//! anomaly flags, and a structured query interface over the same data.
//!
//! ## Core Concepts
//!
//! - **Normalization**: day-first date parsing, Monday-anchored week buckets,
//!   numeric coercion, revenue recovery from units × price, dimension sentinels
//! - **Rollups**: revenue/units per (week, country, channel, store) and revenue
//!   per week with its week-over-week change
//! - **Trends**: overall direction/severity, country movers, channel,
//!   promotion and weighted unit-price movements for the latest week
//! - **Anomalies**: Z-scores of the latest week-over-week change against its
//!   own history, overall and per country
//!
//! Every computation is a pure function of the uploaded dataset; nothing is
//! cached between calls. Percentages and Z-scores are kept at full precision
//! internally and rounded once by [`compute_trends`] and
//! [`compute_anomalies`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use weekly_review::*;
//!
//! let table = RawTable::from_path("sales.csv")?;
//! let prepared = prepare(&table)?;
//! let trends = compute_trends(&prepared.dataset, &prepared.rollups)?;
//! let anomalies = compute_anomalies(&prepared.rollups);
//!
//! println!("{:?} {:?}", trends.overall.direction, anomalies.overall.severity);
//! ```

pub mod aggregator;
pub mod anomaly;
pub mod error;
pub mod ingestion;
pub mod normalizer;
pub mod query;
pub mod review;
pub mod schema;
pub mod trend;
pub mod utils;

pub use aggregator::{Rollups, WeeklyDimensionRow, WeeklyTotalRow};
pub use anomaly::{
    country_revenue_anomalies, overall_revenue_anomaly, z_scores, AnomalyResult, DriverAnomaly,
    OverallAnomaly,
};
pub use error::{Result, ReviewError};
pub use ingestion::RawTable;
pub use normalizer::{normalize, NormalizationReport, NormalizedDataset, SalesRecord};
pub use query::*;
pub use review::{build_review, ReviewReport, SummaryInput, SummaryWriter, FALLBACK_SUMMARY};
pub use schema::*;
pub use trend::{
    channel_trends, country_trends, overall_revenue_trend, promotion_trend, unit_price_trend,
    DimensionTrend, OverallTrend, TrendResult, UnitPriceTrend,
};

use chrono::NaiveDate;
use log::{debug, info};

/// A normalized dataset together with the rollups built from it.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedData {
    pub dataset: NormalizedDataset,
    pub rollups: Rollups,
}

impl PreparedData {
    /// The latest week in the data, which the review reports on.
    pub fn analysis_week(&self) -> Option<NaiveDate> {
        self.rollups.analysis_week()
    }
}

/// Runs the pipeline stages with an explicit column contract and thresholds.
#[derive(Debug, Clone, Default)]
pub struct ReviewPipeline {
    pub roles: ColumnRoles,
    pub config: AnalysisConfig,
}

impl ReviewPipeline {
    pub fn new(roles: ColumnRoles, config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { roles, config })
    }

    /// Normalizes `table` and builds both rollups.
    ///
    /// Fails with `Schema` when a required column is absent and with
    /// `EmptyDataset` when no row survives normalization.
    pub fn prepare(&self, table: &RawTable) -> Result<PreparedData> {
        let dataset = normalize(table, &self.roles)?;

        if dataset.is_empty() {
            let report = &dataset.report;
            return Err(ReviewError::EmptyDataset {
                total_rows: report.total_rows,
                unparseable_dates: report.unparseable_dates,
                missing_revenue: report.missing_revenue,
            });
        }

        let rollups = Rollups::build(&dataset.records);

        info!(
            "Prepared {} records across {} weeks",
            dataset.len(),
            rollups.week_count()
        );
        if let Some(week) = rollups.analysis_week() {
            debug!("Analysis week: {}", week);
        }

        Ok(PreparedData { dataset, rollups })
    }

    /// All trend results, rounded for output.
    pub fn compute_trends(
        &self,
        dataset: &NormalizedDataset,
        rollups: &Rollups,
    ) -> Result<TrendResult> {
        let trends = trend::run_trends(dataset, rollups, &self.config)?;
        Ok(trends.rounded())
    }

    /// All anomaly results, rounded for output. Never fails; thin history
    /// yields non-anomalous defaults.
    pub fn compute_anomalies(&self, rollups: &Rollups) -> AnomalyResult {
        anomaly::run_anomalies(rollups, &self.config).rounded()
    }

    pub fn review(
        &self,
        prepared: &PreparedData,
        writer: Option<&dyn SummaryWriter>,
    ) -> Result<ReviewReport> {
        build_review(prepared, &self.config, writer)
    }

    pub fn query(&self, intent: &QueryIntent, prepared: &PreparedData) -> Result<QueryResponse> {
        execute_query(intent, prepared, &self.config)
    }
}

pub fn prepare(table: &RawTable) -> Result<PreparedData> {
    ReviewPipeline::default().prepare(table)
}

pub fn compute_trends(dataset: &NormalizedDataset, rollups: &Rollups) -> Result<TrendResult> {
    ReviewPipeline::default().compute_trends(dataset, rollups)
}

pub fn compute_anomalies(rollups: &Rollups) -> AnomalyResult {
    ReviewPipeline::default().compute_anomalies(rollups)
}
