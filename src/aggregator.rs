use crate::normalizer::SalesRecord;
use crate::utils::percent_changes;
use chrono::NaiveDate;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Revenue and units summed per (week, country, channel, store).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WeeklyDimensionRow {
    pub week: NaiveDate,
    pub country: String,
    pub channel: String,
    pub store: String,
    pub revenue: f64,
    pub units: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WeeklyTotalRow {
    pub week: NaiveDate,
    pub revenue: f64,
    /// Change against the preceding week in the rollup; `None` for the first
    /// week or when the preceding week's revenue is zero.
    pub wow_pct: Option<f64>,
}

/// The two canonical rollups every trend and anomaly calculation reads from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollups {
    pub weekly_by_dimension: Vec<WeeklyDimensionRow>,
    pub weekly_total: Vec<WeeklyTotalRow>,
}

impl Rollups {
    pub fn build(records: &[SalesRecord]) -> Self {
        let weekly_by_dimension = weekly_by_dimension(records);
        let weekly_total = weekly_total(&weekly_by_dimension);
        Self {
            weekly_by_dimension,
            weekly_total,
        }
    }

    /// The latest week present, which every review reports on.
    pub fn analysis_week(&self) -> Option<NaiveDate> {
        self.weekly_total.last().map(|row| row.week)
    }

    pub fn week_count(&self) -> usize {
        self.weekly_total.len()
    }
}

type DimensionKey = (NaiveDate, String, String, String);

pub fn weekly_by_dimension(records: &[SalesRecord]) -> Vec<WeeklyDimensionRow> {
    let mut groups: BTreeMap<DimensionKey, (f64, f64)> = BTreeMap::new();

    for record in records {
        let key = (
            record.week,
            record.country.clone(),
            record.channel.clone(),
            record.store.clone(),
        );
        let entry = groups.entry(key).or_insert((0.0, 0.0));
        entry.0 += record.revenue;
        entry.1 += record.units_sold.unwrap_or(0.0);
    }

    debug!(
        "Rolled {} records into {} (week, country, channel, store) groups",
        records.len(),
        groups.len()
    );

    groups
        .into_iter()
        .map(
            |((week, country, channel, store), (revenue, units))| WeeklyDimensionRow {
                week,
                country,
                channel,
                store,
                revenue,
                units,
            },
        )
        .collect()
}

pub fn weekly_total(weekly_by_dimension: &[WeeklyDimensionRow]) -> Vec<WeeklyTotalRow> {
    let mut totals: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for row in weekly_by_dimension {
        *totals.entry(row.week).or_insert(0.0) += row.revenue;
    }

    let revenues: Vec<f64> = totals.values().copied().collect();
    let changes = percent_changes(&revenues);

    totals
        .into_iter()
        .zip(changes)
        .map(|((week, revenue), wow_pct)| WeeklyTotalRow {
            week,
            revenue,
            wow_pct,
        })
        .collect()
}

/// Re-groups the dimension rollup into per-week sums keyed by `entity`.
pub(crate) fn regroup_revenue<F>(
    weekly_by_dimension: &[WeeklyDimensionRow],
    entity: F,
) -> BTreeMap<String, BTreeMap<NaiveDate, f64>>
where
    F: Fn(&WeeklyDimensionRow) -> &str,
{
    let mut series: BTreeMap<String, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
    for row in weekly_by_dimension {
        *series
            .entry(entity(row).to_string())
            .or_default()
            .entry(row.week)
            .or_insert(0.0) += row.revenue;
    }
    series
}
