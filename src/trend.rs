use crate::aggregator::{regroup_revenue, Rollups, WeeklyDimensionRow, WeeklyTotalRow};
use crate::error::{Result, ReviewError};
use crate::normalizer::NormalizedDataset;
use crate::schema::{AnalysisConfig, Dimension, Direction, TrendSeverity};
use crate::utils::{percent_change, percent_changes, round_pct};
use chrono::NaiveDate;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OverallTrend {
    pub metric: String,
    pub level: String,
    pub week: NaiveDate,
    pub wow_pct: f64,
    pub direction: Direction,
    pub severity: TrendSeverity,
}

/// Latest-week movement of one entity (a country, channel or promotion).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DimensionTrend {
    pub dimension: Dimension,
    pub entity: String,
    pub week: NaiveDate,
    pub revenue: f64,
    pub wow_pct: f64,
}

/// Demand and revenue-weighted price movement for the latest week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UnitPriceTrend {
    pub week: NaiveDate,
    pub units_change_pct: Option<f64>,
    pub price_change_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TrendResult {
    pub overall: OverallTrend,
    pub countries: Vec<DimensionTrend>,
    pub channels: Vec<DimensionTrend>,
    pub promotions: Vec<DimensionTrend>,
    pub unit_price: Option<UnitPriceTrend>,
}

impl OverallTrend {
    pub fn rounded(&self) -> Self {
        Self {
            wow_pct: round_pct(self.wow_pct),
            ..self.clone()
        }
    }
}

impl DimensionTrend {
    pub fn rounded(&self) -> Self {
        Self {
            wow_pct: round_pct(self.wow_pct),
            ..self.clone()
        }
    }
}

impl UnitPriceTrend {
    pub fn rounded(&self) -> Self {
        Self {
            week: self.week,
            units_change_pct: self.units_change_pct.map(round_pct),
            price_change_pct: self.price_change_pct.map(round_pct),
        }
    }
}

impl TrendResult {
    /// Copy with every percentage rounded for output. Labels are left as
    /// computed from the full-precision values.
    pub fn rounded(&self) -> Self {
        let round_all = |trends: &[DimensionTrend]| -> Vec<DimensionTrend> {
            trends.iter().map(DimensionTrend::rounded).collect()
        };

        Self {
            overall: self.overall.rounded(),
            countries: round_all(&self.countries),
            channels: round_all(&self.channels),
            promotions: round_all(&self.promotions),
            unit_price: self.unit_price.as_ref().map(UnitPriceTrend::rounded),
        }
    }
}

/// Revenue trend for the latest week.
///
/// Fails with `InsufficientHistory` when there are fewer than two weeks, and
/// with `UndefinedChange` when the preceding week had no revenue.
pub fn overall_revenue_trend(
    weekly_total: &[WeeklyTotalRow],
    config: &AnalysisConfig,
) -> Result<OverallTrend> {
    let weeks = weekly_total.len();
    let (previous, latest) = match weekly_total {
        [.., previous, latest] => (previous, latest),
        _ => return Err(ReviewError::InsufficientHistory { weeks }),
    };

    let pct = latest.wow_pct.ok_or(ReviewError::UndefinedChange {
        week: latest.week,
        previous_week: previous.week,
    })?;

    Ok(OverallTrend {
        metric: "Revenue".to_string(),
        level: "Overall".to_string(),
        week: latest.week,
        wow_pct: pct,
        direction: Direction::from_pct(pct),
        severity: TrendSeverity::classify(pct, config),
    })
}

/// Top and bottom country movers: the best `config.movers` countries in
/// descending order, then the worst `config.movers` starting from the worst.
/// With few countries the two selections overlap.
pub fn country_trends(
    weekly_by_dimension: &[WeeklyDimensionRow],
    config: &AnalysisConfig,
) -> Vec<DimensionTrend> {
    let series = regroup_revenue(weekly_by_dimension, |row| row.country.as_str());
    let mut movers = latest_movements(Dimension::Country, &series);

    // stable, so ties keep alphabetical order
    movers.sort_by(|a, b| b.wow_pct.total_cmp(&a.wow_pct));

    let n = config.movers;
    let head = movers.iter().take(n);
    let tail = movers.iter().rev().take(n);
    head.chain(tail).cloned().collect()
}

/// Every channel's latest-week movement, ordered by channel name.
pub fn channel_trends(weekly_by_dimension: &[WeeklyDimensionRow]) -> Vec<DimensionTrend> {
    let series = regroup_revenue(weekly_by_dimension, |row| row.channel.as_str());
    latest_movements(Dimension::Channel, &series)
}

/// Latest-week movement per promotion label, "No Promotion" included.
///
/// Reads normalized records directly since promotion is not part of the
/// dimension rollup. Empty when the export had no promotion column.
pub fn promotion_trend(dataset: &NormalizedDataset) -> Vec<DimensionTrend> {
    if !dataset.has_promotion {
        return Vec::new();
    }

    let mut series: BTreeMap<String, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
    for record in &dataset.records {
        *series
            .entry(record.promotion.clone())
            .or_default()
            .entry(record.week)
            .or_insert(0.0) += record.revenue;
    }

    latest_movements(Dimension::Promotion, &series)
}

/// Units and average price change for the latest week, where the average
/// price is total revenue over total units (weighted by volume).
pub fn unit_price_trend(weekly_by_dimension: &[WeeklyDimensionRow]) -> Option<UnitPriceTrend> {
    let mut weekly: BTreeMap<NaiveDate, (f64, f64)> = BTreeMap::new();
    for row in weekly_by_dimension {
        let entry = weekly.entry(row.week).or_insert((0.0, 0.0));
        entry.0 += row.revenue;
        entry.1 += row.units;
    }

    let mut latest_two = weekly.iter().rev().take(2);
    let (&week, &(revenue, units)) = latest_two.next()?;
    let (_, &(prev_revenue, prev_units)) = latest_two.next()?;

    let avg_price = |revenue: f64, units: f64| (units != 0.0).then(|| revenue / units);
    let price_change_pct = match (avg_price(prev_revenue, prev_units), avg_price(revenue, units)) {
        (Some(previous), Some(current)) => percent_change(previous, current),
        _ => None,
    };

    Some(UnitPriceTrend {
        week,
        units_change_pct: percent_change(prev_units, units),
        price_change_pct,
    })
}

/// Runs every trend calculation at full precision.
pub fn run_trends(
    dataset: &NormalizedDataset,
    rollups: &Rollups,
    config: &AnalysisConfig,
) -> Result<TrendResult> {
    let overall = overall_revenue_trend(&rollups.weekly_total, config)?;
    let result = TrendResult {
        overall,
        countries: country_trends(&rollups.weekly_by_dimension, config),
        channels: channel_trends(&rollups.weekly_by_dimension),
        promotions: promotion_trend(dataset),
        unit_price: unit_price_trend(&rollups.weekly_by_dimension),
    };

    debug!(
        "Trends for week {}: {} country movers, {} channels, {} promotions",
        result.overall.week,
        result.countries.len(),
        result.channels.len(),
        result.promotions.len()
    );

    Ok(result)
}

/// For each entity, the change between its latest observed week and the one
/// before, kept only when the latest observed week is the latest week across
/// all entities and the change is defined.
fn latest_movements(
    dimension: Dimension,
    series: &BTreeMap<String, BTreeMap<NaiveDate, f64>>,
) -> Vec<DimensionTrend> {
    let Some(latest_week) = series.values().filter_map(|weeks| weeks.keys().last()).max().copied()
    else {
        return Vec::new();
    };

    series
        .iter()
        .filter_map(|(entity, weeks)| {
            let revenues: Vec<f64> = weeks.values().copied().collect();
            let (&week, &revenue) = weeks.iter().last()?;
            if week != latest_week {
                return None;
            }
            let wow_pct = percent_changes(&revenues).last().copied().flatten()?;
            Some(DimensionTrend {
                dimension,
                entity: entity.clone(),
                week,
                revenue,
                wow_pct,
            })
        })
        .collect()
}
