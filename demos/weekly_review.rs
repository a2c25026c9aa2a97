use anyhow::Context;
use weekly_review::*;

/// Answers from the response metadata alone, for running without a model.
struct MetadataWriter;

impl ResponseWriter for MetadataWriter {
    fn write_answer(&self, _question: &str, response: &QueryResponse) -> Result<AnswerDraft> {
        let insights: Vec<String> = response
            .metadata
            .as_object()
            .map(|fields| fields.iter().map(|(k, v)| format!("{}: {}", k, v)).collect())
            .unwrap_or_default();

        Ok(AnswerDraft {
            answer: format!("Computed a {:?} answer.", response.query_type),
            key_insights: insights,
            chart_suggestion: ChartKind::Table,
            follow_up_questions: Vec::new(),
        })
    }
}

fn usage() -> anyhow::Error {
    anyhow::anyhow!("usage: weekly_review <sales.csv> [question]")
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or_else(usage)?;
    let question = args.collect::<Vec<_>>().join(" ");

    let table = RawTable::from_path(&path).with_context(|| format!("reading {}", path))?;
    println!("📄 Loaded {} rows from {}", table.len(), path);

    let pipeline = ReviewPipeline::default();
    let prepared = pipeline.prepare(&table)?;
    let report = prepared.dataset.report.clone();
    println!(
        "✅ Kept {} rows ({} unparseable dates, {} recovered revenue, {} missing revenue)",
        report.kept_rows, report.unparseable_dates, report.recovered_revenue, report.missing_revenue
    );

    let review = pipeline.review(&prepared, None)?;
    println!("\n📅 Week of {}", review.analysis_week);
    println!(
        "   Revenue {:+.1}% ({:?}, {:?})",
        review.metrics.wow_pct, review.metrics.direction, review.metrics.severity
    );

    println!("\n🌍 Country movers:");
    for trend in &review.trends.countries {
        println!("   {:<20} {:+.1}%", trend.entity, trend.wow_pct);
    }

    println!("\n🛒 Channels:");
    for trend in &review.trends.channels {
        println!("   {:<20} {:+.1}%", trend.entity, trend.wow_pct);
    }

    println!(
        "\n🚨 Overall anomaly: {} (z = {:.2}, {:?})",
        review.anomalies.overall.is_anomaly,
        review.anomalies.overall.z_score,
        review.anomalies.overall.severity
    );
    for driver in &review.anomalies.drivers {
        println!(
            "   {} {}: {:+.1}% (z = {:.2})",
            driver.dimension, driver.entity, driver.wow_pct, driver.z_score
        );
    }

    if !question.is_empty() {
        let answer = process_query(
            &KeywordClassifier,
            &MetadataWriter,
            &question,
            &prepared,
            &pipeline.config,
        )?;
        println!("\n❓ {}", question);
        println!("💬 {}", answer.answer);
        println!("{}", serde_json::to_string_pretty(&answer.data)?);
    }

    std::fs::write("weekly_review.json", review.to_json()?)?;
    println!("\n💾 Full review written to weekly_review.json");

    Ok(())
}
