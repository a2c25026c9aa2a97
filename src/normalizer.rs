use crate::error::{Result, ReviewError};
use crate::ingestion::RawTable;
use crate::schema::{ColumnRoles, NO_PROMOTION, UNKNOWN};
use crate::utils::week_start;
use chrono::{DateTime, NaiveDate, NaiveTime};
use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Day-first formats tried in order. Two-digit-year forms come first because
/// `%Y` would otherwise accept "25" as the year 25.
const DATE_FORMATS: &[&str] = &[
    "%d-%m-%y", "%d/%m/%y", "%d.%m.%y", "%d-%m-%Y", "%d/%m/%Y", "%d.%m.%Y", "%Y-%m-%d", "%Y/%m/%d",
    "%d %b %Y", "%d %B %Y",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"];

/// A single transaction after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SalesRecord {
    pub transaction_id: Option<String>,
    pub date: NaiveDate,
    /// Monday of the week containing `date`.
    pub week: NaiveDate,
    pub country: String,
    pub channel: String,
    pub store: String,
    pub sku: Option<String>,
    pub promotion: String,
    pub units_sold: Option<f64>,
    pub unit_price: Option<f64>,
    pub discount: Option<f64>,
    pub revenue: f64,
    pub margin: Option<f64>,
    pub margin_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NormalizationReport {
    pub total_rows: usize,
    pub unparseable_dates: usize,
    pub recovered_revenue: usize,
    pub missing_revenue: usize,
    pub kept_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedDataset {
    pub records: Vec<SalesRecord>,
    /// Whether the export carried a promotion column at all.
    pub has_promotion: bool,
    pub report: NormalizationReport,
}

impl NormalizedDataset {
    pub fn from_records(records: Vec<SalesRecord>, has_promotion: bool) -> Self {
        let report = NormalizationReport {
            total_rows: records.len(),
            kept_rows: records.len(),
            ..NormalizationReport::default()
        };
        Self {
            records,
            has_promotion,
            report,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Header positions resolved once against the column-role contract.
struct ColumnIndex {
    date: usize,
    revenue: usize,
    country: usize,
    channel: usize,
    store: usize,
    units_sold: Option<usize>,
    unit_price: Option<usize>,
    discount: Option<usize>,
    margin: Option<usize>,
    margin_pct: Option<usize>,
    sku: Option<usize>,
    promotion: Option<usize>,
    transaction_id: Option<usize>,
}

impl ColumnIndex {
    fn resolve(table: &RawTable, roles: &ColumnRoles) -> Result<Self> {
        let missing: Vec<String> = roles
            .required_columns()
            .iter()
            .filter(|name| table.column_index(name).is_none())
            .map(|name| name.to_string())
            .collect();

        if !missing.is_empty() {
            return Err(ReviewError::Schema { missing });
        }

        let required = |name: &str| {
            table
                .column_index(name)
                .ok_or_else(|| ReviewError::Schema {
                    missing: vec![name.to_string()],
                })
        };

        Ok(Self {
            date: required(&roles.time.date)?,
            revenue: required(&roles.metrics.revenue)?,
            country: required(&roles.dimensions.country)?,
            channel: required(&roles.dimensions.channel)?,
            store: required(&roles.dimensions.store)?,
            units_sold: table.column_index(&roles.metrics.units_sold),
            unit_price: table.column_index(&roles.metrics.unit_price),
            discount: table.column_index(&roles.metrics.discount),
            margin: table.column_index(&roles.metrics.margin),
            margin_pct: table.column_index(&roles.metrics.margin_pct),
            sku: table.column_index(&roles.dimensions.sku),
            promotion: table.column_index(&roles.dimensions.promotion),
            transaction_id: table.column_index(&roles.transaction_id),
        })
    }
}

/// Validates the schema and normalizes every row of `table`.
///
/// Rows with an unparseable date, or whose revenue is missing and cannot be
/// rebuilt from units × unit price, are dropped. Only a missing required
/// column fails the call; an empty result is left for the caller to judge.
pub fn normalize(table: &RawTable, roles: &ColumnRoles) -> Result<NormalizedDataset> {
    let index = ColumnIndex::resolve(table, roles)?;
    let mut report = NormalizationReport {
        total_rows: table.rows.len(),
        ..NormalizationReport::default()
    };
    let mut records = Vec::with_capacity(table.rows.len());

    for row in &table.rows {
        let cell = |idx: usize| row.get(idx).and_then(|v| v.as_deref());
        let optional_cell = |idx: Option<usize>| idx.and_then(cell);
        let optional_number = |idx: Option<usize>| optional_cell(idx).and_then(parse_number);

        let Some(date) = cell(index.date).and_then(parse_day_first_date) else {
            report.unparseable_dates += 1;
            continue;
        };

        let units_sold = optional_number(index.units_sold);
        let unit_price = optional_number(index.unit_price);

        let revenue = match cell(index.revenue).and_then(parse_number) {
            Some(revenue) => revenue,
            None => match (units_sold, unit_price) {
                (Some(units), Some(price)) => {
                    report.recovered_revenue += 1;
                    units * price
                }
                _ => {
                    report.missing_revenue += 1;
                    continue;
                }
            },
        };

        let dimension = |idx: usize| cell(idx).unwrap_or(UNKNOWN).to_string();

        records.push(SalesRecord {
            transaction_id: optional_cell(index.transaction_id).map(str::to_string),
            date,
            week: week_start(date),
            country: dimension(index.country),
            channel: dimension(index.channel),
            store: dimension(index.store),
            sku: optional_cell(index.sku).map(str::to_string),
            promotion: optional_cell(index.promotion)
                .unwrap_or(NO_PROMOTION)
                .to_string(),
            units_sold,
            unit_price,
            discount: optional_number(index.discount),
            revenue,
            margin: optional_number(index.margin),
            margin_pct: optional_number(index.margin_pct),
        });
    }

    report.kept_rows = records.len();

    info!(
        "Normalized {} of {} rows",
        report.kept_rows, report.total_rows
    );
    debug!(
        "Dropped {} rows with unparseable dates and {} without revenue; recovered revenue on {} rows",
        report.unparseable_dates, report.missing_revenue, report.recovered_revenue
    );

    Ok(NormalizedDataset {
        records,
        has_promotion: index.promotion.is_some(),
        report,
    })
}

/// Parses a date using the day-first convention. A trailing time of day or a
/// full RFC 3339 timestamp is accepted; only the calendar date is kept.
pub fn parse_day_first_date(raw: &str) -> Option<NaiveDate> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    for format in DATE_FORMATS {
        if let Ok((date, rest)) = NaiveDate::parse_and_remainder(value, format) {
            if rest.is_empty() || is_time_suffix(rest) {
                return Some(date);
            }
        }
    }

    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.date_naive())
}

fn is_time_suffix(rest: &str) -> bool {
    let Some(time) = rest.strip_prefix(' ').or_else(|| rest.strip_prefix('T')) else {
        return false;
    };
    let time = time.trim();
    TIME_FORMATS
        .iter()
        .any(|format| NaiveTime::parse_from_str(time, format).is_ok())
}

/// Lenient numeric coercion: anything that is not a finite number is missing.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}
