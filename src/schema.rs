use crate::error::{Result, ReviewError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Literal used for a missing country, channel or store.
pub const UNKNOWN: &str = "Unknown";

/// Literal used for a missing promotion label.
pub const NO_PROMOTION: &str = "No Promotion";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct TimeRole {
    #[schemars(description = "Transaction date column, parsed day-first and bucketed into Monday-anchored weeks")]
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct MetricRoles {
    #[schemars(description = "Primary metric. Required.")]
    pub revenue: String,

    #[schemars(description = "Units sold. Optional; together with unit_price it recovers a missing revenue.")]
    pub units_sold: String,

    #[schemars(description = "Unit price. Optional.")]
    pub unit_price: String,

    pub discount: String,
    pub margin: String,
    pub margin_pct: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct DimensionRoles {
    #[schemars(description = "Required. Missing values become 'Unknown'.")]
    pub country: String,

    #[schemars(description = "Required. Missing values become 'Unknown'.")]
    pub channel: String,

    #[schemars(description = "Required. Missing values become 'Unknown'.")]
    pub store: String,

    #[schemars(description = "Optional product identifier.")]
    pub sku: String,

    #[schemars(description = "Optional. Missing values become 'No Promotion'.")]
    pub promotion: String,
}

/// The column-role contract of a sales export.
///
/// Column names are case-sensitive. `date`, `revenue`, `country`, `channel`
/// and `store` must be present in the header; everything else is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct ColumnRoles {
    pub time: TimeRole,
    pub metrics: MetricRoles,
    pub dimensions: DimensionRoles,
    pub transaction_id: String,
}

impl Default for ColumnRoles {
    fn default() -> Self {
        Self {
            time: TimeRole {
                date: "Date".to_string(),
            },
            metrics: MetricRoles {
                revenue: "Revenue".to_string(),
                units_sold: "Units Sold".to_string(),
                unit_price: "Unit Price".to_string(),
                discount: "Discount".to_string(),
                margin: "Margin".to_string(),
                margin_pct: "Margin %".to_string(),
            },
            dimensions: DimensionRoles {
                country: "Country".to_string(),
                channel: "Channel".to_string(),
                store: "Store".to_string(),
                sku: "SKU".to_string(),
                promotion: "Promotion".to_string(),
            },
            transaction_id: "transaction_id".to_string(),
        }
    }
}

impl ColumnRoles {
    /// Columns whose absence from the header is fatal, in reporting order.
    pub fn required_columns(&self) -> [&str; 5] {
        [
            self.time.date.as_str(),
            self.metrics.revenue.as_str(),
            self.dimensions.country.as_str(),
            self.dimensions.channel.as_str(),
            self.dimensions.store.as_str(),
        ]
    }
}

/// Thresholds shared by the trend and anomaly calculations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct AnalysisConfig {
    #[schemars(description = "Absolute WoW% below which the overall trend is 'flat'")]
    pub flat_pct: f64,

    #[schemars(description = "Absolute WoW% at or above which the overall trend is 'significant'")]
    pub significant_pct: f64,

    #[schemars(description = "Absolute Z-score at or above which the latest week is anomalous")]
    pub anomaly_threshold: f64,

    #[schemars(description = "Absolute Z-score at or above which an anomaly is 'high' severity")]
    pub high_z: f64,

    #[schemars(description = "Minimum number of WoW% points before any anomaly can be flagged")]
    pub min_baseline: usize,

    #[schemars(description = "Number of most recent WoW% points used per country")]
    pub country_window: usize,

    #[schemars(description = "Number of top and bottom country movers reported")]
    pub movers: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            flat_pct: 2.0,
            significant_pct: 10.0,
            anomaly_threshold: 2.0,
            high_z: 3.0,
            min_baseline: 4,
            country_window: 8,
            movers: 2,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("flat_pct", self.flat_pct),
            ("significant_pct", self.significant_pct),
            ("anomaly_threshold", self.anomaly_threshold),
            ("high_z", self.high_z),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ReviewError::InvalidConfig(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }

        if self.flat_pct > self.significant_pct {
            return Err(ReviewError::InvalidConfig(format!(
                "flat_pct ({}) must not exceed significant_pct ({})",
                self.flat_pct, self.significant_pct
            )));
        }

        if self.min_baseline < 2 {
            return Err(ReviewError::InvalidConfig(format!(
                "min_baseline must be at least 2, got {}",
                self.min_baseline
            )));
        }

        if self.country_window < self.min_baseline {
            return Err(ReviewError::InvalidConfig(format!(
                "country_window ({}) must be at least min_baseline ({})",
                self.country_window, self.min_baseline
            )));
        }

        if self.movers == 0 {
            return Err(ReviewError::InvalidConfig(
                "movers must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Parses a JSON document; omitted fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(AnalysisConfig)
    }
}

/// A grouping a trend or anomaly is reported against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
pub enum Dimension {
    Country,
    Channel,
    Store,
    Promotion,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Dimension::Country => "Country",
            Dimension::Channel => "Channel",
            Dimension::Store => "Store",
            Dimension::Promotion => "Promotion",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Increase,
    Decrease,
}

impl Direction {
    /// A change of exactly zero is reported as a decrease.
    pub fn from_pct(pct: f64) -> Self {
        if pct > 0.0 {
            Direction::Increase
        } else {
            Direction::Decrease
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TrendSeverity {
    Flat,
    Moderate,
    Significant,
}

impl TrendSeverity {
    pub fn classify(pct: f64, config: &AnalysisConfig) -> Self {
        let magnitude = pct.abs();
        if magnitude < config.flat_pct {
            TrendSeverity::Flat
        } else if magnitude < config.significant_pct {
            TrendSeverity::Moderate
        } else {
            TrendSeverity::Significant
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Moderate,
    High,
}

impl AnomalySeverity {
    pub fn classify(z_score: f64, config: &AnalysisConfig) -> Self {
        let magnitude = z_score.abs();
        if magnitude >= config.high_z {
            AnomalySeverity::High
        } else if magnitude >= config.anomaly_threshold {
            AnomalySeverity::Moderate
        } else {
            AnomalySeverity::Low
        }
    }
}
