use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::autopilot::Autopilot;
use crate::error::{EngineError, EngineResult};
use crate::health_score::score_keyword;
use crate::metric_rollup::aggregate_metrics;
use crate::models::{Benchmark, HealthScore};
use crate::recommendations::{bid_recommendations, quick_wins, saturation_alerts, vampire_keywords, BidRecommendation};
use crate::store::CleanupReport;

pub const DEFAULT_DAYS_BACK: i64 = 30;
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountScoringResult {
  pub customer_id: String,
  pub metrics_ingested: usize,
  pub keywords_scored: usize,
  pub ingestion_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DailyScoringReport {
  pub accounts: Vec<AccountScoringResult>,
  pub keywords_scored: usize,
  pub cleanup: Option<CleanupReport>,
}

impl Autopilot {
  /// Scores every keyword of the account over the window and appends the snapshots.
  /// Storage problems are logged and yield an empty list.
  pub async fn calculate_health_scores_for_account(&self, customer_id: &str, days_back: i64) -> Vec<HealthScore> {
    let metrics = match self.store.get_keyword_metrics(customer_id, days_back).await {
      Ok(m) => m,
      Err(e) => {
        tracing::error!(customer_id, error = %e, "failed to load keyword metrics");
        return Vec::new();
      }
    };
    if metrics.is_empty() {
      tracing::info!(customer_id, days_back, "no keyword metrics in window");
      return Vec::new();
    }

    let benchmark = match self.store.get_account_benchmarks(customer_id).await {
      Ok(Some(b)) => b,
      Ok(None) => {
        tracing::warn!(customer_id, "no benchmarks configured, using defaults");
        Benchmark::default_for(customer_id)
      }
      Err(e) => {
        tracing::warn!(customer_id, error = %e, "failed to load benchmarks, using defaults");
        Benchmark::default_for(customer_id)
      }
    };

    let calculated_at = Utc::now();
    let scores: Vec<HealthScore> = aggregate_metrics(&metrics)
      .iter()
      .map(|rollup| score_keyword(rollup, &benchmark, calculated_at))
      .collect();

    if let Err(e) = self.store.bulk_insert_health_scores(&scores).await {
      tracing::error!(customer_id, error = %e, "failed to persist health scores");
      return Vec::new();
    }

    tracing::info!(customer_id, keywords = scores.len(), "health scores calculated");
    scores
  }

  async fn latest(&self, customer_id: &str) -> EngineResult<Vec<HealthScore>> {
    self.store.get_latest_health_scores(customer_id, usize::MAX).await
  }

  pub async fn get_quick_wins(&self, customer_id: &str, limit: Option<usize>) -> EngineResult<Vec<HealthScore>> {
    let latest = self.latest(customer_id).await?;
    Ok(quick_wins(&latest, limit.unwrap_or(self.recommendation.quick_win_limit)))
  }

  pub async fn get_vampire_keywords(&self, customer_id: &str) -> EngineResult<Vec<HealthScore>> {
    let latest = self.latest(customer_id).await?;
    Ok(vampire_keywords(
      &latest,
      self.recommendation.vampire_min_spend_micros,
      self.recommendation.vampire_min_clicks,
    ))
  }

  pub async fn get_saturation_alerts(&self, customer_id: &str) -> EngineResult<Vec<HealthScore>> {
    let latest = self.latest(customer_id).await?;
    Ok(saturation_alerts(&latest, self.recommendation.saturation_percentile))
  }

  /// Current bids come from the metrics window, so it should match the one used for scoring.
  pub async fn get_bid_recommendations(&self, customer_id: &str, days_back: i64) -> EngineResult<Vec<BidRecommendation>> {
    let latest = self.latest(customer_id).await?;
    if latest.is_empty() {
      return Ok(Vec::new());
    }
    let metrics = self.store.get_keyword_metrics(customer_id, days_back).await?;
    let rollups = aggregate_metrics(&metrics);
    Ok(bid_recommendations(&latest, &rollups, &self.recommendation))
  }

  pub async fn get_health_score_summary(&self, customer_id: &str) -> EngineResult<BTreeMap<String, i64>> {
    self.store.get_health_score_summary(customer_id).await
  }

  /// Pulls `days_back` days of keyword rows from the platform and upserts them.
  pub async fn ingest_keyword_metrics(&self, customer_id: &str, days_back: i64) -> EngineResult<usize> {
    let platform = self
      .platform
      .as_ref()
      .ok_or_else(|| EngineError::InvalidConfig("ads platform not configured".to_string()))?;
    let end = Utc::now().date_naive();
    let start = end - Duration::days(days_back.max(0));

    let records = platform.fetch_keyword_metrics(customer_id, start, end).await?;
    let written = self.store.upsert_keyword_metrics(&records).await?;
    tracing::info!(customer_id, rows = written, %start, %end, "keyword metrics ingested");
    Ok(written)
  }

  pub async fn upsert_benchmarks(&self, benchmark: &Benchmark) -> EngineResult<()> {
    benchmark.validate()?;
    self.store.upsert_benchmarks(benchmark).await
  }

  pub async fn cleanup_old_data(&self, days_to_keep: i64) -> EngineResult<CleanupReport> {
    if days_to_keep < 1 {
      return Err(EngineError::InvalidRequest(format!(
        "days_to_keep must be at least 1, got {days_to_keep}"
      )));
    }
    let report = self.store.cleanup_old_data(days_to_keep).await?;
    tracing::info!(
      days_to_keep,
      metrics_deleted = report.metrics_deleted,
      scores_deleted = report.scores_deleted,
      "old keyword data removed"
    );
    Ok(report)
  }

  /// Ingests (when a platform is configured) and scores each account, then applies retention.
  /// An empty `customer_ids` scores every account with metrics in the window.
  pub async fn run_daily_scoring(
    &self,
    customer_ids: &[String],
    days_back: i64,
    retention_days: Option<i64>,
  ) -> EngineResult<DailyScoringReport> {
    let accounts = if customer_ids.is_empty() {
      self.store.customers_with_recent_metrics(days_back).await?
    } else {
      customer_ids.to_vec()
    };

    let mut report = DailyScoringReport::default();
    for customer_id in accounts {
      let mut result = AccountScoringResult {
        customer_id: customer_id.clone(),
        ..Default::default()
      };

      if self.platform.is_some() {
        match self.ingest_keyword_metrics(&customer_id, days_back).await {
          Ok(n) => result.metrics_ingested = n,
          Err(e) => {
            tracing::warn!(customer_id = customer_id.as_str(), error = %e, "metric ingestion failed, scoring stored data");
            result.ingestion_error = Some(e.to_string());
          }
        }
      }

      let scores = self.calculate_health_scores_for_account(&customer_id, days_back).await;
      result.keywords_scored = scores.len();
      report.keywords_scored += scores.len();
      report.accounts.push(result);
    }

    if let Some(days) = retention_days {
      report.cleanup = Some(self.cleanup_old_data(days).await?);
    }
    Ok(report)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::memory_store::MemoryStore;
  use crate::models::{HealthCategory, MetricRecord, QualityScore, RecommendedAction};
  use crate::store::{MetricsSource, ScoreStore};
  use std::sync::Arc;

  pub(crate) const CUSTOMER: &str = "1234567890";

  /// One day of metrics `days_ago` days before today.
  pub(crate) fn recent(keyword: &str, days_ago: i64, clicks: i64, cost_micros: i64, conversions: f64) -> MetricRecord {
    MetricRecord {
      customer_id: CUSTOMER.to_string(),
      campaign_id: "111".to_string(),
      ad_group_id: "222".to_string(),
      criterion_id: Some("333".to_string()),
      keyword_text: keyword.to_string(),
      match_type: "PHRASE".to_string(),
      status: "ENABLED".to_string(),
      quality_score: QualityScore::Present(9.0),
      impressions: 500,
      clicks,
      cost_micros,
      conversions,
      conversion_value: conversions * 30.0,
      ctr: clicks as f64 / 500.0,
      avg_cpc_micros: if clicks > 0 { cost_micros / clicks } else { 0 },
      cpc_bid_micros: Some(1_000_000),
      date: Utc::now().date_naive() - Duration::days(days_ago),
    }
  }

  /// 20 strong days: 400 clicks, 20 conversions, CPA well under target.
  pub(crate) fn strong_keyword(keyword: &str) -> Vec<MetricRecord> {
    (1..=20).map(|d| recent(keyword, d, 20, 40_000, 1.0)).collect()
  }

  /// 10 days of spend without conversions: 30 clicks, 300 currency units.
  pub(crate) fn vampire_keyword(keyword: &str) -> Vec<MetricRecord> {
    (1..=10)
      .map(|d| {
        let mut r = recent(keyword, d, 3, 30_000_000, 0.0);
        r.quality_score = QualityScore::Present(5.0);
        r
      })
      .collect()
  }

  async fn seeded(records: &[MetricRecord]) -> (Arc<MemoryStore>, Autopilot) {
    let store = Arc::new(MemoryStore::new());
    store.upsert_keyword_metrics(records).await.unwrap();
    let autopilot = Autopilot::new(store.clone());
    (store, autopilot)
  }

  #[tokio::test]
  async fn scores_and_persists_each_keyword() {
    let mut records = strong_keyword("running shoes");
    records.extend(vampire_keyword("free shoes"));
    let (store, autopilot) = seeded(&records).await;

    let scores = autopilot.calculate_health_scores_for_account(CUSTOMER, 30).await;
    assert_eq!(scores.len(), 2);
    assert_eq!(store.all_scores().await.len(), 2);

    let strong = scores.iter().find(|s| s.keyword_text == "running shoes").unwrap();
    assert_eq!(strong.category, HealthCategory::Excellent);
    assert_eq!(strong.recommended_action, RecommendedAction::IncreaseBid);
    assert!(strong.health_score > 80.0 && strong.health_score <= 100.0);

    let vampire = scores.iter().find(|s| s.keyword_text == "free shoes").unwrap();
    assert_eq!(vampire.category, HealthCategory::Critical);
    assert_eq!(vampire.recommended_action, RecommendedAction::PauseKeyword);
  }

  #[tokio::test]
  async fn rescoring_appends_snapshots_without_changing_latest() {
    let (store, autopilot) = seeded(&strong_keyword("running shoes")).await;
    let first = autopilot.calculate_health_scores_for_account(CUSTOMER, 30).await;
    let second = autopilot.calculate_health_scores_for_account(CUSTOMER, 30).await;

    assert_eq!(store.all_scores().await.len(), 2);
    assert_eq!(first[0].health_score, second[0].health_score);
    let latest = store.get_latest_health_scores(CUSTOMER, 10).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].calculated_at, second[0].calculated_at);
  }

  #[tokio::test]
  async fn empty_window_and_storage_failure_yield_no_scores() {
    let (store, autopilot) = seeded(&[]).await;
    assert!(autopilot.calculate_health_scores_for_account(CUSTOMER, 30).await.is_empty());

    store.upsert_keyword_metrics(&strong_keyword("running shoes")).await.unwrap();
    store.set_fail_writes(true);
    assert!(autopilot.calculate_health_scores_for_account(CUSTOMER, 30).await.is_empty());
    assert!(store.all_scores().await.is_empty());
  }

  #[tokio::test]
  async fn views_read_latest_scores() {
    let mut records = strong_keyword("running shoes");
    records.extend(vampire_keyword("free shoes"));
    let (_store, autopilot) = seeded(&records).await;
    autopilot.calculate_health_scores_for_account(CUSTOMER, 30).await;

    let vampires = autopilot.get_vampire_keywords(CUSTOMER).await.unwrap();
    assert_eq!(vampires.len(), 1);
    assert_eq!(vampires[0].keyword_text, "free shoes");

    let recs = autopilot.get_bid_recommendations(CUSTOMER, 30).await.unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].keyword_text, "running shoes");
    assert_eq!(recs[0].current_bid_micros, 1_000_000);
    assert_eq!(recs[0].recommended_bid_micros, 1_300_000);
    assert_eq!(recs[0].change_percent, 30.0);

    let summary = autopilot.get_health_score_summary(CUSTOMER).await.unwrap();
    assert_eq!(summary.get("excellent"), Some(&1));
    assert_eq!(summary.get("critical"), Some(&1));
  }

  #[tokio::test]
  async fn custom_benchmarks_are_validated_and_used() {
    let (_store, autopilot) = seeded(&vampire_keyword("free shoes")).await;

    let mut bad = Benchmark::default_for(CUSTOMER);
    bad.target_conv_rate = 0.0;
    assert!(autopilot.upsert_benchmarks(&bad).await.is_err());

    let mut lenient = Benchmark::default_for(CUSTOMER);
    lenient.target_cpa_micros = 500_000_000.0;
    autopilot.upsert_benchmarks(&lenient).await.unwrap();

    // Spend stays under the target CPA, so the zero-conversion pause override no longer applies.
    let scores = autopilot.calculate_health_scores_for_account(CUSTOMER, 30).await;
    assert_ne!(scores[0].recommended_action, RecommendedAction::PauseKeyword);
  }

  #[tokio::test]
  async fn daily_scoring_discovers_accounts_and_applies_retention() {
    let mut records = strong_keyword("running shoes");
    records.push(recent("old keyword", 120, 5, 5_000, 0.0));
    let (store, autopilot) = seeded(&records).await;

    let report = autopilot.run_daily_scoring(&[], 30, Some(90)).await.unwrap();
    assert_eq!(report.accounts.len(), 1);
    assert_eq!(report.accounts[0].customer_id, CUSTOMER);
    assert_eq!(report.accounts[0].metrics_ingested, 0);
    assert_eq!(report.keywords_scored, 1);
    assert_eq!(report.cleanup.as_ref().map(|c| c.metrics_deleted), Some(1));
    assert_eq!(store.get_keyword_metrics(CUSTOMER, 365).await.unwrap().len(), 20);

    assert!(autopilot.cleanup_old_data(0).await.is_err());
  }
}
