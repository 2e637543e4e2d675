use std::sync::Arc;

use vercel_runtime::Error;

use keyword_autopilot_rust::db::MySqlStore;
use keyword_autopilot_rust::health_service::DEFAULT_DAYS_BACK;
use keyword_autopilot_rust::providers::google_ads::GoogleAdsClient;
use keyword_autopilot_rust::telemetry::init_tracing;
use keyword_autopilot_rust::Autopilot;

fn validate_database_url() -> Result<(), Error> {
  let url = std::env::var("TIDB_DATABASE_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .unwrap_or_default();
  let trimmed = url.trim();
  if trimmed.is_empty() {
    return Err(Box::new(std::io::Error::other(
      "Missing TIDB_DATABASE_URL (or DATABASE_URL)",
    )) as Error);
  }
  if !trimmed.contains("://") {
    return Err(Box::new(std::io::Error::other(
      "Invalid TIDB_DATABASE_URL/DATABASE_URL (expected URL scheme like mysql://...)",
    )) as Error);
  }
  Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
  args
    .iter()
    .position(|a| a == flag)
    .and_then(|idx| args.get(idx + 1))
    .cloned()
}

fn money(micros: i64) -> String {
  format!("{:.2}", micros as f64 / 1_000_000.0)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  init_tracing();
  validate_database_url()?;
  let args: Vec<String> = std::env::args().collect();

  let customer_id = parse_flag_value(&args, "--customer-id")
    .or_else(|| parse_flag_value(&args, "--customer"))
    .unwrap_or_default();
  if customer_id.trim().is_empty() {
    eprintln!("Missing required --customer-id");
    eprintln!("Example: cargo run --bin local_score_once -- --customer-id 1234567890 --days 30");
    return Ok(());
  }
  let customer_id = customer_id.trim().replace('-', "");
  let days = parse_flag_value(&args, "--days")
    .and_then(|v| v.parse::<i64>().ok())
    .unwrap_or(DEFAULT_DAYS_BACK)
    .clamp(1, 365);
  let ingest = args.iter().any(|a| a == "--ingest");

  let mut autopilot = Autopilot::new(Arc::new(MySqlStore::from_env().await?));
  if ingest {
    match GoogleAdsClient::from_env().await? {
      Some(client) => autopilot = autopilot.with_platform(Arc::new(client)),
      None => {
        eprintln!("--ingest needs GOOGLE_ADS_DEVELOPER_TOKEN and the OAuth credentials");
        return Ok(());
      }
    }
    let ingested = autopilot.ingest_keyword_metrics(&customer_id, days).await?;
    println!("ingested {ingested} metric rows");
  }

  let scores = autopilot.calculate_health_scores_for_account(&customer_id, days).await;
  println!("scored {} keywords for {customer_id} over {days} days", scores.len());

  println!("\nquick wins:");
  for s in autopilot.get_quick_wins(&customer_id, Some(10)).await? {
    println!("  {:>5.1}  {}  ({})", s.health_score, s.keyword_text, s.category.as_str());
  }

  println!("\nvampires:");
  for s in autopilot.get_vampire_keywords(&customer_id).await? {
    println!(
      "  {:>5.1}  {}  spent {} with {} clicks",
      s.health_score,
      s.keyword_text,
      money(s.total_spend_micros),
      s.total_clicks
    );
  }

  println!("\nbid recommendations:");
  for rec in autopilot.get_bid_recommendations(&customer_id, days).await? {
    println!(
      "  {}  {} -> {}  ({:+.1}%, {} risk)",
      rec.keyword_text,
      money(rec.current_bid_micros),
      money(rec.recommended_bid_micros),
      rec.change_percent,
      rec.risk_level.as_str()
    );
  }

  Ok(())
}
