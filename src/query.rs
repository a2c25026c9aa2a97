use crate::anomaly::run_anomalies;
use crate::error::{Result, ReviewError};
use crate::normalizer::SalesRecord;
use crate::schema::AnalysisConfig;
use crate::trend::{
    channel_trends, country_trends, overall_revenue_trend, promotion_trend, unit_price_trend,
    DimensionTrend,
};
use crate::PreparedData;
use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Upper bound on rows or groups returned by a custom query.
pub const MAX_RESULT_ROWS: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    #[schemars(description = "Which country or region performed best or worst this week")]
    RegionalPerformance,

    #[schemars(description = "How each sales channel moved this week")]
    ChannelPerformance,

    #[schemars(description = "Overall revenue week-over-week change, direction and severity")]
    RevenueTrend,

    #[schemars(description = "Unusual movements overall or by country")]
    AnomalyDetection,

    #[schemars(description = "Revenue movement per promotion, including 'No Promotion'")]
    PromotionImpact,

    #[schemars(description = "Demand (units) and weighted average price movement")]
    PriceDemand,

    #[schemars(
        description = "Ad hoc filter/group/aggregate/sort/limit over transactions. Requires 'custom'."
    )]
    CustomExploration,
}

impl QueryKind {
    pub const ALL: [QueryKind; 7] = [
        QueryKind::RegionalPerformance,
        QueryKind::ChannelPerformance,
        QueryKind::RevenueTrend,
        QueryKind::AnomalyDetection,
        QueryKind::PromotionImpact,
        QueryKind::PriceDemand,
        QueryKind::CustomExploration,
    ];

    /// Sample questions for each kind, for classifier prompts and help text.
    pub fn examples(&self) -> &'static [&'static str] {
        match self {
            QueryKind::RegionalPerformance => &[
                "Which region performed best?",
                "Show me country performance",
            ],
            QueryKind::ChannelPerformance => &[
                "Which channel is growing fastest?",
                "Compare online vs retail performance",
            ],
            QueryKind::RevenueTrend => &[
                "What's the revenue trend?",
                "Is revenue growing or declining?",
            ],
            QueryKind::AnomalyDetection => &[
                "Are there any anomalies?",
                "Which regions show unusual behavior?",
            ],
            QueryKind::PromotionImpact => &[
                "How are promotions performing?",
                "Compare promoted vs non-promoted sales",
            ],
            QueryKind::PriceDemand => &["What's happening with pricing?", "Is demand increasing?"],
            QueryKind::CustomExploration => &[
                "Average revenue by store",
                "Sales where discount > 20%",
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct QueryFilters {
    #[schemars(description = "Case-insensitive entity name to narrow regional results to")]
    #[serde(default)]
    pub entity: Option<String>,
}

/// A classified question, as produced by an [`IntentClassifier`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct QueryIntent {
    pub query_type: QueryKind,

    #[serde(default)]
    pub filters: QueryFilters,

    #[schemars(description = "Classifier confidence between 0.0 and 1.0")]
    #[serde(default)]
    pub confidence: Option<f64>,

    #[schemars(description = "Structured query, required for custom_exploration")]
    #[serde(default)]
    pub custom: Option<CustomQuery>,

    #[serde(default)]
    pub original_query: Option<String>,
}

impl QueryIntent {
    pub fn new(query_type: QueryKind) -> Self {
        Self {
            query_type,
            filters: QueryFilters::default(),
            confidence: None,
            custom: None,
            original_query: None,
        }
    }

    pub fn custom(query: CustomQuery) -> Self {
        Self {
            custom: Some(query),
            ..Self::new(QueryKind::CustomExploration)
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Schema an external classifier must answer with.
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(QueryIntent)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&Self::generate_json_schema())
    }
}

/// Turns a natural-language question into a [`QueryIntent`].
///
/// Implementations wrapping a remote model are constructed by the caller and
/// passed in explicitly.
pub trait IntentClassifier {
    fn classify(&self, question: &str) -> Result<QueryIntent>;
}

/// Keyword-matching classifier for use without a language model. Questions
/// that match no keyword become `custom_exploration` with no structured query.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

const KEYWORDS: &[(QueryKind, &[&str])] = &[
    (QueryKind::AnomalyDetection, &["anomal", "outlier", "unusual"]),
    (QueryKind::PromotionImpact, &["promo"]),
    (QueryKind::PriceDemand, &["price", "pricing", "demand"]),
    (QueryKind::ChannelPerformance, &["channel", "online", "wholesale"]),
    (QueryKind::RegionalPerformance, &["region", "country", "countries"]),
    (
        QueryKind::RevenueTrend,
        &["revenue trend", "week over week", "growing", "declining", "trend"],
    ),
];

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, question: &str) -> Result<QueryIntent> {
        let lowered = question.to_lowercase();
        let matched = KEYWORDS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lowered.contains(w)))
            .map(|(kind, _)| *kind);

        let mut intent = QueryIntent::new(matched.unwrap_or(QueryKind::CustomExploration));
        intent.confidence = Some(if matched.is_some() { 0.6 } else { 0.0 });
        intent.original_query = Some(question.to_string());
        Ok(intent)
    }
}

/// A transaction column a custom query may reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TransactionId,
    Date,
    Week,
    Country,
    Channel,
    Store,
    Sku,
    Promotion,
    UnitsSold,
    UnitPrice,
    Discount,
    Revenue,
    Margin,
    MarginPct,
}

enum FieldValue {
    Text(String),
    Number(f64),
    Missing,
}

impl Field {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Field::UnitsSold
                | Field::UnitPrice
                | Field::Discount
                | Field::Revenue
                | Field::Margin
                | Field::MarginPct
        )
    }

    fn read(&self, record: &SalesRecord) -> FieldValue {
        let text = |v: &str| FieldValue::Text(v.to_string());
        let number = |v: Option<f64>| v.map_or(FieldValue::Missing, FieldValue::Number);
        match self {
            Field::TransactionId => record.transaction_id.as_deref().map_or(FieldValue::Missing, text),
            Field::Date => FieldValue::Text(record.date.format("%Y-%m-%d").to_string()),
            Field::Week => FieldValue::Text(record.week.format("%Y-%m-%d").to_string()),
            Field::Country => text(record.country.as_str()),
            Field::Channel => text(record.channel.as_str()),
            Field::Store => text(record.store.as_str()),
            Field::Sku => record.sku.as_deref().map_or(FieldValue::Missing, text),
            Field::Promotion => text(record.promotion.as_str()),
            Field::UnitsSold => number(record.units_sold),
            Field::UnitPrice => number(record.unit_price),
            Field::Discount => number(record.discount),
            Field::Revenue => FieldValue::Number(record.revenue),
            Field::Margin => number(record.margin),
            Field::MarginPct => number(record.margin_pct),
        }
    }

    fn number(&self, record: &SalesRecord) -> Option<f64> {
        match self.read(record) {
            FieldValue::Number(v) => Some(v),
            _ => None,
        }
    }

    fn key(&self, record: &SalesRecord) -> Option<String> {
        match self.read(record) {
            FieldValue::Text(v) => Some(v),
            FieldValue::Number(v) => Some(v.to_string()),
            FieldValue::Missing => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    #[schemars(description = "Case-insensitive substring match; text fields only")]
    Contains,
}

impl Comparison {
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Ne => ordering != Ordering::Equal,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Ge => ordering != Ordering::Less,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Le => ordering != Ordering::Greater,
            Comparison::Contains => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum QueryValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Predicate {
    pub field: Field,
    pub op: Comparison,
    pub value: QueryValue,
}

impl Predicate {
    fn validate(&self) -> Result<()> {
        match (&self.value, self.field.is_numeric()) {
            (QueryValue::Text(_), true) => Err(ReviewError::InvalidQuery(format!(
                "{:?} is numeric and must be compared with a number",
                self.field
            ))),
            (QueryValue::Number(_), false) => Err(ReviewError::InvalidQuery(format!(
                "{:?} is text and must be compared with text",
                self.field
            ))),
            (QueryValue::Number(_), true) if self.op == Comparison::Contains => {
                Err(ReviewError::InvalidQuery(format!(
                    "'contains' does not apply to numeric field {:?}",
                    self.field
                )))
            }
            _ => Ok(()),
        }
    }

    /// Missing values never match.
    fn matches(&self, record: &SalesRecord) -> bool {
        match (self.field.read(record), &self.value) {
            (FieldValue::Number(actual), QueryValue::Number(expected)) => {
                self.op.holds(actual.total_cmp(expected))
            }
            (FieldValue::Text(actual), QueryValue::Text(expected)) => match self.op {
                Comparison::Contains => actual.to_lowercase().contains(&expected.to_lowercase()),
                op => op.holds(actual.as_str().cmp(expected.as_str())),
            },
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Sum,
    Mean,
    Count,
    Min,
    Max,
    CountDistinct,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Aggregate {
    pub op: AggregateOp,
    #[schemars(description = "Column to aggregate; optional only for 'count'")]
    #[serde(default)]
    pub field: Option<Field>,
}

impl Aggregate {
    fn validate(&self) -> Result<()> {
        match (self.op, self.field) {
            (AggregateOp::Count, _) => Ok(()),
            (AggregateOp::CountDistinct, Some(_)) => Ok(()),
            (op, Some(field)) if field.is_numeric() => {
                debug!("Aggregate {:?} over {:?}", op, field);
                Ok(())
            }
            (op, Some(field)) => Err(ReviewError::InvalidQuery(format!(
                "{:?} needs a numeric field, {:?} is text",
                op, field
            ))),
            (op, None) => Err(ReviewError::InvalidQuery(format!(
                "{:?} needs a field",
                op
            ))),
        }
    }

    fn apply(&self, records: &[&SalesRecord]) -> Option<f64> {
        let values = || -> Vec<f64> {
            self.field
                .map(|field| records.iter().filter_map(|r| field.number(r)).collect())
                .unwrap_or_default()
        };

        match self.op {
            AggregateOp::Count => {
                let count = match self.field {
                    Some(field) => records.iter().filter(|r| field.key(r).is_some()).count(),
                    None => records.len(),
                };
                Some(count as f64)
            }
            AggregateOp::CountDistinct => {
                let field = self.field?;
                let distinct: BTreeSet<String> =
                    records.iter().filter_map(|r| field.key(r)).collect();
                Some(distinct.len() as f64)
            }
            AggregateOp::Sum => Some(values().iter().sum()),
            AggregateOp::Mean => {
                let values = values();
                (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
            }
            AggregateOp::Min => values().into_iter().reduce(f64::min),
            AggregateOp::Max => values().into_iter().reduce(f64::max),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct SortSpec {
    #[schemars(
        description = "Column to sort by. For grouped results omit it to sort by the aggregated value, or use the group_by column to sort by key."
    )]
    #[serde(default)]
    pub field: Option<Field>,

    #[serde(default)]
    pub descending: bool,
}

/// A whitelisted, structured data exploration: filters are ANDed, then rows
/// are optionally grouped and aggregated, sorted and limited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct CustomQuery {
    #[serde(default)]
    pub filters: Vec<Predicate>,

    #[serde(default)]
    pub group_by: Option<Field>,

    #[serde(default)]
    pub aggregate: Option<Aggregate>,

    #[serde(default)]
    pub sort: Option<SortSpec>,

    #[schemars(description = "Maximum rows returned; never more than 50")]
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct GroupRow {
    pub key: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result_type", rename_all = "snake_case")]
pub enum CustomQueryOutput {
    Rows {
        total: usize,
        rows: Vec<SalesRecord>,
    },
    Groups {
        total: usize,
        groups: Vec<GroupRow>,
    },
    Scalar {
        value: Option<f64>,
    },
}

impl CustomQueryOutput {
    pub fn shape(&self) -> String {
        match self {
            CustomQueryOutput::Rows { total, .. } => format!("{} rows", total),
            CustomQueryOutput::Groups { total, .. } => format!("{} groups", total),
            CustomQueryOutput::Scalar { .. } => "single value".to_string(),
        }
    }
}

impl CustomQuery {
    pub fn validate(&self) -> Result<()> {
        for predicate in &self.filters {
            predicate.validate()?;
        }

        if let Some(aggregate) = &self.aggregate {
            aggregate.validate()?;
        }

        if let Some(sort) = &self.sort {
            match (self.group_by, &self.aggregate, sort.field) {
                (Some(group), _, Some(field)) if field != group => {
                    return Err(ReviewError::InvalidQuery(format!(
                        "grouped results sort by value or by {:?}, not {:?}",
                        group, field
                    )));
                }
                (None, Some(_), _) => {
                    return Err(ReviewError::InvalidQuery(
                        "a single aggregated value cannot be sorted".to_string(),
                    ));
                }
                (None, None, None) => {
                    return Err(ReviewError::InvalidQuery(
                        "sorting rows requires a field".to_string(),
                    ));
                }
                _ => {}
            }
        }

        if self.limit == Some(0) {
            return Err(ReviewError::InvalidQuery(
                "limit must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn evaluate(&self, records: &[SalesRecord]) -> Result<CustomQueryOutput> {
        self.validate()?;

        let selected: Vec<&SalesRecord> = records
            .iter()
            .filter(|r| self.filters.iter().all(|p| p.matches(r)))
            .collect();

        let cap = self
            .limit
            .unwrap_or(MAX_RESULT_ROWS)
            .min(MAX_RESULT_ROWS);

        if let Some(group_field) = self.group_by {
            let aggregate = self.aggregate.clone().unwrap_or(Aggregate {
                op: AggregateOp::Count,
                field: None,
            });

            let mut buckets: BTreeMap<String, Vec<&SalesRecord>> = BTreeMap::new();
            for record in &selected {
                if let Some(key) = group_field.key(record) {
                    buckets.entry(key).or_default().push(record);
                }
            }

            let mut groups: Vec<GroupRow> = buckets
                .into_iter()
                .map(|(key, members)| GroupRow {
                    value: aggregate.apply(&members),
                    key,
                })
                .collect();

            if let Some(sort) = &self.sort {
                let by_key = sort.field.is_some();
                let ordering = |a: &GroupRow, b: &GroupRow| {
                    if by_key {
                        a.key.cmp(&b.key)
                    } else {
                        compare_optional(a.value, b.value)
                    }
                };
                if sort.descending {
                    groups.sort_by(|a, b| ordering(b, a));
                } else {
                    groups.sort_by(|a, b| ordering(a, b));
                }
            }

            let total = groups.len();
            groups.truncate(cap);
            return Ok(CustomQueryOutput::Groups { total, groups });
        }

        if let Some(aggregate) = &self.aggregate {
            return Ok(CustomQueryOutput::Scalar {
                value: aggregate.apply(&selected),
            });
        }

        let mut rows: Vec<SalesRecord> = selected.into_iter().cloned().collect();
        if let Some(SortSpec {
            field: Some(field),
            descending,
        }) = &self.sort
        {
            if *descending {
                rows.sort_by(|a, b| compare_records(b, a, *field));
            } else {
                rows.sort_by(|a, b| compare_records(a, b, *field));
            }
        }

        let total = rows.len();
        rows.truncate(cap);
        Ok(CustomQueryOutput::Rows { total, rows })
    }
}

/// Missing values sort first, so they land last when descending. Ties keep
/// their input order in both directions.
fn compare_optional(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare_records(a: &SalesRecord, b: &SalesRecord, field: Field) -> Ordering {
    if field.is_numeric() {
        compare_optional(field.number(a), field.number(b))
    } else {
        field.key(a).cmp(&field.key(b))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub success: bool,
    pub query_type: QueryKind,
    pub data: Value,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResponse {
    fn ok(query_type: QueryKind, data: Value, metadata: Value) -> Self {
        Self {
            success: true,
            query_type,
            data,
            metadata,
            error: None,
        }
    }

    fn failed(query_type: QueryKind, error: &ReviewError) -> Self {
        Self {
            success: false,
            query_type,
            data: Value::Null,
            metadata: json!({}),
            error: Some(error.to_string()),
        }
    }
}

fn rounded(trends: Vec<DimensionTrend>) -> Vec<DimensionTrend> {
    trends.iter().map(DimensionTrend::rounded).collect()
}

/// Routes a classified intent to the matching computation.
///
/// Data problems (too little history, an invalid custom query) are reported
/// as unsuccessful responses; only serialization failures are errors.
pub fn execute_query(
    intent: &QueryIntent,
    prepared: &PreparedData,
    config: &AnalysisConfig,
) -> Result<QueryResponse> {
    let kind = intent.query_type;
    let rollups = &prepared.rollups;
    debug!("Executing {:?} query", kind);

    let response = match kind {
        QueryKind::RegionalPerformance => {
            let mut data = rounded(country_trends(&rollups.weekly_by_dimension, config));
            if let Some(entity) = &intent.filters.entity {
                let needle = entity.to_lowercase();
                data.retain(|t| t.entity.to_lowercase().contains(&needle));
            }
            let metadata = json!({ "total_regions": data.len(), "metric": "Revenue WoW%" });
            QueryResponse::ok(kind, serde_json::to_value(data)?, metadata)
        }
        QueryKind::ChannelPerformance => {
            let data = rounded(channel_trends(&rollups.weekly_by_dimension));
            let metadata = json!({ "total_channels": data.len(), "metric": "Revenue WoW%" });
            QueryResponse::ok(kind, serde_json::to_value(data)?, metadata)
        }
        QueryKind::RevenueTrend => match overall_revenue_trend(&rollups.weekly_total, config) {
            Ok(trend) => {
                let trend = trend.rounded();
                let metadata = json!({
                    "trend_direction": trend.direction,
                    "severity": trend.severity,
                });
                QueryResponse::ok(kind, serde_json::to_value(trend)?, metadata)
            }
            Err(e) => QueryResponse::failed(kind, &e),
        },
        QueryKind::AnomalyDetection => {
            let data = run_anomalies(rollups, config).rounded();
            let metadata = json!({
                "overall_anomaly": data.overall.is_anomaly,
                "driver_anomalies_count": data.drivers.len(),
            });
            QueryResponse::ok(kind, serde_json::to_value(data)?, metadata)
        }
        QueryKind::PromotionImpact => {
            let data = rounded(promotion_trend(&prepared.dataset));
            let metadata = json!({ "promotions_analyzed": data.len() });
            QueryResponse::ok(kind, serde_json::to_value(data)?, metadata)
        }
        QueryKind::PriceDemand => match unit_price_trend(&rollups.weekly_by_dimension) {
            Some(trend) => {
                let trend = trend.rounded();
                let metadata = json!({
                    "units_trend": trend.units_change_pct,
                    "price_trend": trend.price_change_pct,
                });
                QueryResponse::ok(kind, serde_json::to_value(trend)?, metadata)
            }
            None => QueryResponse::failed(
                kind,
                &ReviewError::InsufficientHistory {
                    weeks: rollups.week_count(),
                },
            ),
        },
        QueryKind::CustomExploration => {
            let outcome = intent
                .custom
                .as_ref()
                .ok_or_else(|| {
                    ReviewError::InvalidQuery(
                        "custom exploration needs a structured query".to_string(),
                    )
                })
                .and_then(|query| query.evaluate(&prepared.dataset.records));

            match outcome {
                Ok(output) => {
                    let metadata = json!({
                        "result_shape": output.shape(),
                        "calculation_performed": true,
                    });
                    QueryResponse::ok(kind, serde_json::to_value(output)?, metadata)
                }
                Err(e) => QueryResponse::failed(kind, &e),
            }
        }
    };

    if let Some(error) = &response.error {
        info!("{:?} query unsuccessful: {}", kind, error);
    }

    Ok(response)
}

/// Visualization an answer suggests for its data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    #[schemars(description = "Comparisons between categories")]
    Bar,
    #[schemars(description = "Trends over time")]
    Line,
    #[schemars(description = "Detailed data lists")]
    Table,
    #[schemars(description = "A single value")]
    MetricCard,
    None,
}

/// The narrative part of an answer, as produced by a [`ResponseWriter`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct AnswerDraft {
    #[schemars(description = "Two or three sentences that directly answer the question")]
    pub answer: String,

    #[schemars(description = "Three to five insights citing specific numbers and entities")]
    #[serde(default)]
    pub key_insights: Vec<String>,

    pub chart_suggestion: ChartKind,

    #[schemars(description = "Two or three related questions the user might ask next")]
    #[serde(default)]
    pub follow_up_questions: Vec<String>,
}

impl AnswerDraft {
    /// Fixed answer for a query that could not be executed.
    pub fn for_failure(error: Option<&str>) -> Self {
        Self {
            answer: format!(
                "I couldn't process that query. {}",
                error.unwrap_or("Unknown error")
            ),
            key_insights: vec!["Query execution failed".to_string()],
            chart_suggestion: ChartKind::None,
            follow_up_questions: vec![
                "Try asking about regional performance".to_string(),
                "Or ask about channel trends".to_string(),
            ],
        }
    }

    /// Schema an external writer must answer with.
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(AnswerDraft)
    }
}

/// Turns an executed query into a natural-language answer, typically by
/// calling a language model. Only consulted for successful responses.
pub trait ResponseWriter {
    fn write_answer(&self, question: &str, response: &QueryResponse) -> Result<AnswerDraft>;
}

/// A question, how it was classified, the computed data and its narrative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryAnswer {
    pub user_query: String,
    pub intent: QueryIntent,
    pub answer: String,
    pub key_insights: Vec<String>,
    pub data: Value,
    pub chart_suggestion: ChartKind,
    pub follow_up_questions: Vec<String>,
    pub metadata: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryAnswer {
    fn assemble(
        question: &str,
        intent: QueryIntent,
        response: QueryResponse,
        draft: AnswerDraft,
    ) -> Self {
        Self {
            user_query: question.to_string(),
            intent,
            answer: draft.answer,
            key_insights: draft.key_insights,
            data: response.data,
            chart_suggestion: draft.chart_suggestion,
            follow_up_questions: draft.follow_up_questions,
            metadata: response.metadata,
            success: response.success,
            error: response.error,
        }
    }
}

/// Classifies `question`, executes it, then has `writer` narrate the result.
///
/// Unsuccessful queries get the fixed failure answer without consulting the
/// writer. Classifier and writer errors are returned to the caller.
pub fn process_query(
    classifier: &dyn IntentClassifier,
    writer: &dyn ResponseWriter,
    question: &str,
    prepared: &PreparedData,
    config: &AnalysisConfig,
) -> Result<QueryAnswer> {
    let mut intent = classifier.classify(question)?;
    if intent.original_query.is_none() {
        intent.original_query = Some(question.to_string());
    }
    info!(
        "Classified query as {:?} (confidence {:?})",
        intent.query_type, intent.confidence
    );

    let response = execute_query(&intent, prepared, config)?;
    let draft = if response.success {
        writer.write_answer(question, &response)?
    } else {
        AnswerDraft::for_failure(response.error.as_deref())
    };

    debug!("Answer drafted with {} insights", draft.key_insights.len());
    Ok(QueryAnswer::assemble(question, intent, response, draft))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Rollups;
    use crate::normalizer::NormalizedDataset;
    use crate::utils::week_start;
    use chrono::NaiveDate;

    fn sale(day: u32, country: &str, store: &str, revenue: f64, discount: Option<f64>) -> SalesRecord {
        let date = NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        SalesRecord {
            transaction_id: Some(format!("TXN_{}", day)),
            date,
            week: week_start(date),
            country: country.to_string(),
            channel: "Retail".to_string(),
            store: store.to_string(),
            sku: Some("T3".to_string()),
            promotion: crate::schema::NO_PROMOTION.to_string(),
            units_sold: Some(revenue / 10.0),
            unit_price: Some(10.0),
            discount,
            revenue,
            margin: None,
            margin_pct: None,
        }
    }

    fn prepared() -> PreparedData {
        let records = vec![
            sale(6, "USA", "Walmart", 1000.0, Some(0.0)),
            sale(7, "UK", "Tesco", 800.0, Some(0.4)),
            sale(8, "Canada", "Carrefour", 500.0, None),
            sale(13, "USA", "Walmart", 1200.0, Some(0.1)),
            sale(14, "UK", "Tesco", 600.0, Some(0.35)),
            sale(15, "Canada", "Carrefour", 550.0, Some(0.0)),
        ];
        let rollups = Rollups::build(&records);
        PreparedData {
            dataset: NormalizedDataset::from_records(records, true),
            rollups,
        }
    }

    #[test]
    fn test_intent_schema_generation() {
        let schema = QueryIntent::schema_as_json().unwrap();
        assert!(schema.contains("query_type"));
        assert!(schema.contains("custom_exploration"));
        assert!(schema.contains("group_by"));
    }

    #[test]
    fn test_intent_deserializes_classifier_output() {
        let intent = QueryIntent::from_json_str(
            r#"{
                "query_type": "custom_exploration",
                "confidence": 0.9,
                "custom": {
                    "filters": [{ "field": "discount", "op": "gt", "value": 0.3 }],
                    "group_by": "store",
                    "aggregate": { "op": "sum", "field": "revenue" },
                    "sort": { "descending": true },
                    "limit": 5
                }
            }"#,
        )
        .unwrap();

        assert_eq!(intent.query_type, QueryKind::CustomExploration);
        let custom = intent.custom.unwrap();
        assert_eq!(custom.filters[0].value, QueryValue::Number(0.3));
        assert_eq!(custom.group_by, Some(Field::Store));
    }

    #[test]
    fn test_keyword_classifier() {
        let classifier = KeywordClassifier;
        let kind = |q: &str| classifier.classify(q).unwrap().query_type;

        assert_eq!(kind("Which region performed best?"), QueryKind::RegionalPerformance);
        assert_eq!(kind("Are there any anomalies?"), QueryKind::AnomalyDetection);
        assert_eq!(kind("Show channel breakdown"), QueryKind::ChannelPerformance);
        assert_eq!(kind("How are promotions performing?"), QueryKind::PromotionImpact);
        assert_eq!(kind("Is demand increasing?"), QueryKind::PriceDemand);
        assert_eq!(kind("Is revenue growing or declining?"), QueryKind::RevenueTrend);
        assert_eq!(kind("Top 5 SKUs by margin"), QueryKind::CustomExploration);
    }

    #[test]
    fn test_regional_query_with_entity_filter() {
        let mut intent = QueryIntent::new(QueryKind::RegionalPerformance);
        intent.filters.entity = Some("us".to_string());
        let response = execute_query(&intent, &prepared(), &AnalysisConfig::default()).unwrap();

        assert!(response.success);
        let rows = response.data.as_array().unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r["entity"] == "USA"));
        assert_eq!(rows[0]["wow_pct"], 20.0);
    }

    #[test]
    fn test_revenue_trend_query_reports_insufficient_history() {
        let records = vec![sale(6, "USA", "Walmart", 1000.0, None)];
        let rollups = Rollups::build(&records);
        let single_week = PreparedData {
            dataset: NormalizedDataset::from_records(records, true),
            rollups,
        };
        let response = execute_query(
            &QueryIntent::new(QueryKind::RevenueTrend),
            &single_week,
            &AnalysisConfig::default(),
        )
        .unwrap();

        assert!(!response.success);
        assert!(response.error.unwrap().contains("Insufficient history"));
    }

    #[test]
    fn test_custom_group_sum_sorted_descending() {
        let query = CustomQuery {
            group_by: Some(Field::Store),
            aggregate: Some(Aggregate {
                op: AggregateOp::Sum,
                field: Some(Field::Revenue),
            }),
            sort: Some(SortSpec {
                field: None,
                descending: true,
            }),
            limit: Some(2),
            ..CustomQuery::default()
        };
        match query.evaluate(&prepared().dataset.records).unwrap() {
            CustomQueryOutput::Groups { total, groups } => {
                assert_eq!(total, 3);
                assert_eq!(groups.len(), 2);
                assert_eq!(groups[0].key, "Walmart");
                assert_eq!(groups[0].value, Some(2200.0));
                assert_eq!(groups[1].key, "Tesco");
            }
            other => panic!("expected groups, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_filter_rows() {
        let query = CustomQuery {
            filters: vec![Predicate {
                field: Field::Discount,
                op: Comparison::Gt,
                value: QueryValue::Number(0.3),
            }],
            sort: Some(SortSpec {
                field: Some(Field::Revenue),
                descending: true,
            }),
            ..CustomQuery::default()
        };
        match query.evaluate(&prepared().dataset.records).unwrap() {
            CustomQueryOutput::Rows { total, rows } => {
                assert_eq!(total, 2);
                assert_eq!(rows[0].revenue, 800.0);
                assert_eq!(rows[1].revenue, 600.0);
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_scalar_and_text_filter() {
        let query = CustomQuery {
            filters: vec![Predicate {
                field: Field::Store,
                op: Comparison::Eq,
                value: QueryValue::Text("Walmart".to_string()),
            }],
            aggregate: Some(Aggregate {
                op: AggregateOp::Sum,
                field: Some(Field::Revenue),
            }),
            ..CustomQuery::default()
        };
        assert_eq!(
            query.evaluate(&prepared().dataset.records).unwrap(),
            CustomQueryOutput::Scalar {
                value: Some(2200.0)
            }
        );

        let mean = CustomQuery {
            aggregate: Some(Aggregate {
                op: AggregateOp::Mean,
                field: Some(Field::Discount),
            }),
            ..CustomQuery::default()
        };
        match mean.evaluate(&prepared().dataset.records).unwrap() {
            CustomQueryOutput::Scalar { value } => {
                assert!((value.unwrap() - 0.17).abs() < 1e-9);
            }
            other => panic!("expected scalar, got {:?}", other),
        }
    }

    #[test]
    fn test_custom_query_validation() {
        let bad_compare = CustomQuery {
            filters: vec![Predicate {
                field: Field::Revenue,
                op: Comparison::Eq,
                value: QueryValue::Text("lots".to_string()),
            }],
            ..CustomQuery::default()
        };
        assert!(matches!(
            bad_compare.validate(),
            Err(ReviewError::InvalidQuery(_))
        ));

        let bad_aggregate = CustomQuery {
            aggregate: Some(Aggregate {
                op: AggregateOp::Mean,
                field: Some(Field::Country),
            }),
            ..CustomQuery::default()
        };
        assert!(bad_aggregate.validate().is_err());

        let distinct = CustomQuery {
            aggregate: Some(Aggregate {
                op: AggregateOp::CountDistinct,
                field: Some(Field::Country),
            }),
            ..CustomQuery::default()
        };
        assert_eq!(
            distinct.evaluate(&prepared().dataset.records).unwrap(),
            CustomQueryOutput::Scalar { value: Some(3.0) }
        );
    }

    #[test]
    fn test_invalid_custom_query_is_unsuccessful_response() {
        let intent = QueryIntent::new(QueryKind::CustomExploration);
        let response = execute_query(&intent, &prepared(), &AnalysisConfig::default()).unwrap();
        assert!(!response.success);
        assert_eq!(response.data, Value::Null);
    }

    struct Narrator;

    impl ResponseWriter for Narrator {
        fn write_answer(&self, question: &str, response: &QueryResponse) -> Result<AnswerDraft> {
            Ok(AnswerDraft {
                answer: format!("{} -> {:?}", question, response.query_type),
                key_insights: vec![format!("{} channels", response.metadata["total_channels"])],
                chart_suggestion: ChartKind::Bar,
                follow_up_questions: vec!["Which store drove it?".to_string()],
            })
        }
    }

    struct Silent;

    impl ResponseWriter for Silent {
        fn write_answer(&self, _question: &str, _response: &QueryResponse) -> Result<AnswerDraft> {
            Err(ReviewError::Collaborator("writer must not be called".to_string()))
        }
    }

    #[test]
    fn test_process_query_with_writer() {
        let answer = process_query(
            &KeywordClassifier,
            &Narrator,
            "Which channel is growing fastest?",
            &prepared(),
            &AnalysisConfig::default(),
        )
        .unwrap();

        assert!(answer.success);
        assert_eq!(answer.user_query, "Which channel is growing fastest?");
        assert_eq!(answer.intent.query_type, QueryKind::ChannelPerformance);
        assert_eq!(
            answer.intent.original_query.as_deref(),
            Some("Which channel is growing fastest?")
        );
        assert_eq!(
            answer.answer,
            "Which channel is growing fastest? -> ChannelPerformance"
        );
        assert_eq!(answer.key_insights, vec!["1 channels".to_string()]);
        assert_eq!(answer.chart_suggestion, ChartKind::Bar);
        assert_eq!(answer.metadata["total_channels"], 1);
        assert_eq!(answer.data.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_query_gets_fixed_answer_without_writer() {
        let answer = process_query(
            &KeywordClassifier,
            &Silent,
            "Top 5 SKUs by margin",
            &prepared(),
            &AnalysisConfig::default(),
        )
        .unwrap();

        assert!(!answer.success);
        assert_eq!(answer.intent.query_type, QueryKind::CustomExploration);
        assert_eq!(
            answer.answer,
            "I couldn't process that query. Invalid query: custom exploration needs a structured query"
        );
        assert_eq!(answer.key_insights, vec!["Query execution failed".to_string()]);
        assert_eq!(answer.chart_suggestion, ChartKind::None);
        assert_eq!(answer.follow_up_questions.len(), 2);
        assert_eq!(answer.data, Value::Null);

        let json = serde_json::to_value(&answer).unwrap();
        assert_eq!(json["chart_suggestion"], "none");
    }

    #[test]
    fn test_failure_answer_without_error_text() {
        let draft = AnswerDraft::for_failure(None);
        assert_eq!(draft.answer, "I couldn't process that query. Unknown error");
    }

    #[test]
    fn test_descending_sort_keeps_ties_in_order() {
        let groups = CustomQuery {
            group_by: Some(Field::Store),
            aggregate: Some(Aggregate {
                op: AggregateOp::Count,
                field: None,
            }),
            sort: Some(SortSpec {
                field: None,
                descending: true,
            }),
            ..CustomQuery::default()
        };
        match groups.evaluate(&prepared().dataset.records).unwrap() {
            CustomQueryOutput::Groups { groups, .. } => {
                let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
                assert_eq!(keys, vec!["Carrefour", "Tesco", "Walmart"]);
            }
            other => panic!("expected groups, got {:?}", other),
        }

        let rows = CustomQuery {
            sort: Some(SortSpec {
                field: Some(Field::Channel),
                descending: true,
            }),
            ..CustomQuery::default()
        };
        match rows.evaluate(&prepared().dataset.records).unwrap() {
            CustomQueryOutput::Rows { rows, .. } => {
                let revenues: Vec<f64> = rows.iter().map(|r| r.revenue).collect();
                assert_eq!(revenues, vec![1000.0, 800.0, 500.0, 1200.0, 600.0, 550.0]);
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }
}
