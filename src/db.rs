use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{mysql::MySqlPoolOptions, MySqlPool};
use tokio::sync::OnceCell;

use crate::config::GuardrailsConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
  ActionStatus, ActionType, Benchmark, HealthCategory, HealthScore, MetricRecord, OptimizationAction, QualityScore,
  RecommendedAction, RiskLevel, RiskTolerance,
};
use crate::recommendations::latest_scores;
use crate::store::{
  ActionStore, BenchmarkStore, CleanupReport, ConfigStore, MaintenanceStore, MetricsSource, ScoreStore,
  StatusUpdate,
};

static POOL: OnceCell<MySqlPool> = OnceCell::const_new();

const GUARDRAILS_CONFIG_KEY: &str = "default";

async fn ensure_schema(pool: &MySqlPool) -> EngineResult<()> {
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS keyword_metrics_history (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        customer_id VARCHAR(32) NOT NULL,
        campaign_id VARCHAR(32) NOT NULL,
        ad_group_id VARCHAR(32) NOT NULL,
        criterion_id VARCHAR(32) NULL,
        keyword_text VARCHAR(255) NOT NULL,
        match_type VARCHAR(16) NOT NULL DEFAULT '',
        status VARCHAR(16) NOT NULL DEFAULT '',
        quality_score DOUBLE NULL,
        impressions BIGINT NOT NULL,
        clicks BIGINT NOT NULL,
        cost_micros BIGINT NOT NULL,
        conversions DOUBLE NOT NULL,
        conversion_value DOUBLE NOT NULL,
        ctr DOUBLE NOT NULL,
        avg_cpc_micros BIGINT NOT NULL,
        cpc_bid_micros BIGINT NULL,
        metric_date DATE NOT NULL,
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        UNIQUE KEY uq_keyword_metrics_day (customer_id, campaign_id, ad_group_id, keyword_text, metric_date),
        KEY idx_keyword_metrics_customer_date (customer_id, metric_date)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS keyword_benchmarks (
        customer_id VARCHAR(32) PRIMARY KEY,
        target_conv_rate DOUBLE NOT NULL,
        target_cpa_micros DOUBLE NOT NULL,
        benchmark_ctr DOUBLE NOT NULL,
        min_quality_score DOUBLE NOT NULL,
        seasonality_factor DOUBLE NOT NULL DEFAULT 1,
        risk_tolerance VARCHAR(16) NOT NULL DEFAULT 'moderate',
        industry VARCHAR(64) NOT NULL DEFAULT 'general',
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS keyword_health_scores (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        customer_id VARCHAR(32) NOT NULL,
        campaign_id VARCHAR(32) NOT NULL,
        ad_group_id VARCHAR(32) NOT NULL,
        keyword_text VARCHAR(255) NOT NULL,
        health_score DOUBLE NOT NULL,
        conv_rate_score DOUBLE NOT NULL,
        cpa_score DOUBLE NOT NULL,
        ctr_score DOUBLE NOT NULL,
        volume_score DOUBLE NOT NULL,
        quality_score_points DOUBLE NOT NULL,
        confidence DOUBLE NOT NULL,
        category VARCHAR(16) NOT NULL,
        recommended_action VARCHAR(32) NOT NULL,
        action_priority INT NOT NULL,
        period_start DATE NOT NULL,
        period_end DATE NOT NULL,
        total_spend_micros BIGINT NOT NULL,
        total_conversions DOUBLE NOT NULL,
        total_clicks BIGINT NOT NULL,
        calculated_at TIMESTAMP(6) NOT NULL,
        KEY idx_health_scores_keyword (customer_id, campaign_id, ad_group_id, keyword_text, calculated_at),
        KEY idx_health_scores_calculated (calculated_at)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS optimization_actions (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        execution_id VARCHAR(64) NOT NULL,
        customer_id VARCHAR(32) NOT NULL,
        campaign_id VARCHAR(32) NOT NULL,
        ad_group_id VARCHAR(32) NOT NULL,
        criterion_id VARCHAR(32) NULL,
        keyword_text VARCHAR(255) NOT NULL,
        action_type VARCHAR(16) NOT NULL,
        old_bid_micros BIGINT NOT NULL,
        new_bid_micros BIGINT NOT NULL,
        change_percent DOUBLE NOT NULL,
        justification TEXT NOT NULL,
        health_score_before DOUBLE NOT NULL,
        risk_level VARCHAR(16) NOT NULL,
        status VARCHAR(16) NOT NULL DEFAULT 'pending',
        dry_run BOOLEAN NOT NULL DEFAULT FALSE,
        external_operation_id VARCHAR(255) NULL,
        error_message TEXT NULL,
        created_at TIMESTAMP(3) NOT NULL,
        executed_at TIMESTAMP(3) NULL,
        KEY idx_optimization_actions_execution (execution_id),
        KEY idx_optimization_actions_status (status, customer_id)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS guardrails_config (
        config_key VARCHAR(32) PRIMARY KEY,
        params_json TEXT NOT NULL,
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3)
      );
    "#,
  )
  .execute(pool)
  .await?;

  Ok(())
}

pub async fn get_pool() -> EngineResult<&'static MySqlPool> {
  POOL
    .get_or_try_init(|| async {
      let url = std::env::var("TIDB_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map_err(|_| EngineError::Storage("Missing TIDB_DATABASE_URL (or DATABASE_URL)".to_string()))?;

      let pool = MySqlPoolOptions::new().max_connections(5).connect(&url).await?;

      ensure_schema(&pool).await?;
      Ok::<_, EngineError>(pool)
    })
    .await
}

fn sql_limit(limit: usize) -> i64 {
  i64::try_from(limit).unwrap_or(i64::MAX)
}

fn corrupt(table: &str, column: &str, value: &str) -> EngineError {
  EngineError::Storage(format!("unexpected {column} {value:?} in {table}"))
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct MetricRow {
  customer_id: String,
  campaign_id: String,
  ad_group_id: String,
  criterion_id: Option<String>,
  keyword_text: String,
  match_type: String,
  status: String,
  quality_score: Option<f64>,
  impressions: i64,
  clicks: i64,
  cost_micros: i64,
  conversions: f64,
  conversion_value: f64,
  ctr: f64,
  avg_cpc_micros: i64,
  cpc_bid_micros: Option<i64>,
  metric_date: NaiveDate,
}

impl From<MetricRow> for MetricRecord {
  fn from(r: MetricRow) -> Self {
    MetricRecord {
      customer_id: r.customer_id,
      campaign_id: r.campaign_id,
      ad_group_id: r.ad_group_id,
      criterion_id: r.criterion_id,
      keyword_text: r.keyword_text,
      match_type: r.match_type,
      status: r.status,
      quality_score: QualityScore::from_raw(r.quality_score),
      impressions: r.impressions,
      clicks: r.clicks,
      cost_micros: r.cost_micros,
      conversions: r.conversions,
      conversion_value: r.conversion_value,
      ctr: r.ctr,
      avg_cpc_micros: r.avg_cpc_micros,
      cpc_bid_micros: r.cpc_bid_micros,
      date: r.metric_date,
    }
  }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BenchmarkRow {
  customer_id: String,
  target_conv_rate: f64,
  target_cpa_micros: f64,
  benchmark_ctr: f64,
  min_quality_score: f64,
  seasonality_factor: f64,
  risk_tolerance: String,
  industry: String,
}

impl BenchmarkRow {
  fn into_model(self) -> EngineResult<Benchmark> {
    let risk_tolerance = RiskTolerance::parse(&self.risk_tolerance)
      .ok_or_else(|| corrupt("keyword_benchmarks", "risk_tolerance", &self.risk_tolerance))?;
    Ok(Benchmark {
      customer_id: self.customer_id,
      target_conv_rate: self.target_conv_rate,
      target_cpa_micros: self.target_cpa_micros,
      benchmark_ctr: self.benchmark_ctr,
      min_quality_score: self.min_quality_score,
      seasonality_factor: self.seasonality_factor,
      risk_tolerance,
      industry: self.industry,
    })
  }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct HealthScoreRow {
  customer_id: String,
  campaign_id: String,
  ad_group_id: String,
  keyword_text: String,
  health_score: f64,
  conv_rate_score: f64,
  cpa_score: f64,
  ctr_score: f64,
  volume_score: f64,
  quality_score_points: f64,
  confidence: f64,
  category: String,
  recommended_action: String,
  action_priority: i32,
  period_start: NaiveDate,
  period_end: NaiveDate,
  total_spend_micros: i64,
  total_conversions: f64,
  total_clicks: i64,
  calculated_at: DateTime<Utc>,
}

impl HealthScoreRow {
  fn into_model(self) -> EngineResult<HealthScore> {
    let category = HealthCategory::parse(&self.category)
      .ok_or_else(|| corrupt("keyword_health_scores", "category", &self.category))?;
    let recommended_action = RecommendedAction::parse(&self.recommended_action)
      .ok_or_else(|| corrupt("keyword_health_scores", "recommended_action", &self.recommended_action))?;
    Ok(HealthScore {
      customer_id: self.customer_id,
      campaign_id: self.campaign_id,
      ad_group_id: self.ad_group_id,
      keyword_text: self.keyword_text,
      health_score: self.health_score,
      conv_rate_score: self.conv_rate_score,
      cpa_score: self.cpa_score,
      ctr_score: self.ctr_score,
      volume_score: self.volume_score,
      quality_score_points: self.quality_score_points,
      confidence: self.confidence,
      category,
      recommended_action,
      action_priority: self.action_priority,
      period_start: self.period_start,
      period_end: self.period_end,
      total_spend_micros: self.total_spend_micros,
      total_conversions: self.total_conversions,
      total_clicks: self.total_clicks,
      calculated_at: self.calculated_at,
    })
  }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ActionRow {
  id: i64,
  execution_id: String,
  customer_id: String,
  campaign_id: String,
  ad_group_id: String,
  criterion_id: Option<String>,
  keyword_text: String,
  action_type: String,
  old_bid_micros: i64,
  new_bid_micros: i64,
  change_percent: f64,
  justification: String,
  health_score_before: f64,
  risk_level: String,
  status: String,
  dry_run: bool,
  external_operation_id: Option<String>,
  error_message: Option<String>,
  created_at: DateTime<Utc>,
  executed_at: Option<DateTime<Utc>>,
}

impl ActionRow {
  fn into_model(self) -> EngineResult<OptimizationAction> {
    let action_type = ActionType::parse(&self.action_type)
      .ok_or_else(|| corrupt("optimization_actions", "action_type", &self.action_type))?;
    let risk_level =
      RiskLevel::parse(&self.risk_level).ok_or_else(|| corrupt("optimization_actions", "risk_level", &self.risk_level))?;
    let status =
      ActionStatus::parse(&self.status).ok_or_else(|| corrupt("optimization_actions", "status", &self.status))?;
    Ok(OptimizationAction {
      id: self.id,
      execution_id: self.execution_id,
      customer_id: self.customer_id,
      campaign_id: self.campaign_id,
      ad_group_id: self.ad_group_id,
      criterion_id: self.criterion_id,
      keyword_text: self.keyword_text,
      action_type,
      old_bid_micros: self.old_bid_micros,
      new_bid_micros: self.new_bid_micros,
      change_percent: self.change_percent,
      justification: self.justification,
      health_score_before: self.health_score_before,
      risk_level,
      status,
      dry_run: self.dry_run,
      external_operation_id: self.external_operation_id,
      error_message: self.error_message,
      created_at: self.created_at,
      executed_at: self.executed_at,
    })
  }
}

const ACTION_COLUMNS: &str = "id, execution_id, customer_id, campaign_id, ad_group_id, criterion_id, keyword_text, \
  action_type, old_bid_micros, new_bid_micros, change_percent, justification, health_score_before, risk_level, \
  status, dry_run, external_operation_id, error_message, created_at, executed_at";

pub async fn fetch_keyword_metrics(pool: &MySqlPool, customer_id: &str, since: NaiveDate) -> EngineResult<Vec<MetricRecord>> {
  let rows = sqlx::query_as::<_, MetricRow>(
    r#"
      SELECT customer_id, campaign_id, ad_group_id, criterion_id, keyword_text, match_type, status,
             quality_score, impressions, clicks, cost_micros, conversions, conversion_value, ctr,
             avg_cpc_micros, cpc_bid_micros, metric_date
      FROM keyword_metrics_history
      WHERE customer_id = ? AND metric_date >= ?
      ORDER BY campaign_id, ad_group_id, keyword_text, metric_date
    "#,
  )
  .bind(customer_id)
  .bind(since)
  .fetch_all(pool)
  .await?;

  Ok(rows.into_iter().map(MetricRecord::from).collect())
}

pub async fn upsert_keyword_metric_rows(pool: &MySqlPool, records: &[MetricRecord]) -> EngineResult<usize> {
  let mut tx = pool.begin().await?;
  for r in records {
    sqlx::query(
      r#"
        INSERT INTO keyword_metrics_history (
          customer_id, campaign_id, ad_group_id, criterion_id, keyword_text, match_type, status,
          quality_score, impressions, clicks, cost_micros, conversions, conversion_value, ctr,
          avg_cpc_micros, cpc_bid_micros, metric_date
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
          criterion_id = VALUES(criterion_id),
          match_type = VALUES(match_type),
          status = VALUES(status),
          quality_score = VALUES(quality_score),
          impressions = VALUES(impressions),
          clicks = VALUES(clicks),
          cost_micros = VALUES(cost_micros),
          conversions = VALUES(conversions),
          conversion_value = VALUES(conversion_value),
          ctr = VALUES(ctr),
          avg_cpc_micros = VALUES(avg_cpc_micros),
          cpc_bid_micros = VALUES(cpc_bid_micros),
          updated_at = CURRENT_TIMESTAMP(3);
      "#,
    )
    .bind(&r.customer_id)
    .bind(&r.campaign_id)
    .bind(&r.ad_group_id)
    .bind(&r.criterion_id)
    .bind(&r.keyword_text)
    .bind(&r.match_type)
    .bind(&r.status)
    .bind(r.quality_score.value())
    .bind(r.impressions)
    .bind(r.clicks)
    .bind(r.cost_micros)
    .bind(r.conversions)
    .bind(r.conversion_value)
    .bind(r.ctr)
    .bind(r.avg_cpc_micros)
    .bind(r.cpc_bid_micros)
    .bind(r.date)
    .execute(&mut *tx)
    .await?;
  }
  tx.commit().await?;
  Ok(records.len())
}

pub async fn fetch_benchmark(pool: &MySqlPool, customer_id: &str) -> EngineResult<Option<Benchmark>> {
  let row = sqlx::query_as::<_, BenchmarkRow>(
    r#"
      SELECT customer_id, target_conv_rate, target_cpa_micros, benchmark_ctr, min_quality_score,
             seasonality_factor, risk_tolerance, industry
      FROM keyword_benchmarks
      WHERE customer_id = ?
      LIMIT 1;
    "#,
  )
  .bind(customer_id)
  .fetch_optional(pool)
  .await?;

  row.map(BenchmarkRow::into_model).transpose()
}

pub async fn upsert_benchmark(pool: &MySqlPool, b: &Benchmark) -> EngineResult<()> {
  sqlx::query(
    r#"
      INSERT INTO keyword_benchmarks (
        customer_id, target_conv_rate, target_cpa_micros, benchmark_ctr, min_quality_score,
        seasonality_factor, risk_tolerance, industry
      )
      VALUES (?, ?, ?, ?, ?, ?, ?, ?)
      ON DUPLICATE KEY UPDATE
        target_conv_rate = VALUES(target_conv_rate),
        target_cpa_micros = VALUES(target_cpa_micros),
        benchmark_ctr = VALUES(benchmark_ctr),
        min_quality_score = VALUES(min_quality_score),
        seasonality_factor = VALUES(seasonality_factor),
        risk_tolerance = VALUES(risk_tolerance),
        industry = VALUES(industry),
        updated_at = CURRENT_TIMESTAMP(3);
    "#,
  )
  .bind(&b.customer_id)
  .bind(b.target_conv_rate)
  .bind(b.target_cpa_micros)
  .bind(b.benchmark_ctr)
  .bind(b.min_quality_score)
  .bind(b.seasonality_factor)
  .bind(b.risk_tolerance.as_str())
  .bind(&b.industry)
  .execute(pool)
  .await?;
  Ok(())
}

pub async fn insert_health_scores(pool: &MySqlPool, scores: &[HealthScore]) -> EngineResult<usize> {
  let mut tx = pool.begin().await?;
  for s in scores {
    sqlx::query(
      r#"
        INSERT INTO keyword_health_scores (
          customer_id, campaign_id, ad_group_id, keyword_text, health_score, conv_rate_score, cpa_score,
          ctr_score, volume_score, quality_score_points, confidence, category, recommended_action,
          action_priority, period_start, period_end, total_spend_micros, total_conversions, total_clicks,
          calculated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
      "#,
    )
    .bind(&s.customer_id)
    .bind(&s.campaign_id)
    .bind(&s.ad_group_id)
    .bind(&s.keyword_text)
    .bind(s.health_score)
    .bind(s.conv_rate_score)
    .bind(s.cpa_score)
    .bind(s.ctr_score)
    .bind(s.volume_score)
    .bind(s.quality_score_points)
    .bind(s.confidence)
    .bind(s.category.as_str())
    .bind(s.recommended_action.as_str())
    .bind(s.action_priority)
    .bind(s.period_start)
    .bind(s.period_end)
    .bind(s.total_spend_micros)
    .bind(s.total_conversions)
    .bind(s.total_clicks)
    .bind(s.calculated_at)
    .execute(&mut *tx)
    .await?;
  }
  tx.commit().await?;
  Ok(scores.len())
}

pub async fn fetch_latest_health_scores(pool: &MySqlPool, customer_id: &str, limit: usize) -> EngineResult<Vec<HealthScore>> {
  let rows = sqlx::query_as::<_, HealthScoreRow>(
    r#"
      SELECT s.customer_id, s.campaign_id, s.ad_group_id, s.keyword_text, s.health_score, s.conv_rate_score,
             s.cpa_score, s.ctr_score, s.volume_score, s.quality_score_points, s.confidence, s.category,
             s.recommended_action, s.action_priority, s.period_start, s.period_end, s.total_spend_micros,
             s.total_conversions, s.total_clicks, s.calculated_at
      FROM keyword_health_scores s
      JOIN (
        SELECT campaign_id, ad_group_id, keyword_text, MAX(calculated_at) AS max_at
        FROM keyword_health_scores
        WHERE customer_id = ?
        GROUP BY campaign_id, ad_group_id, keyword_text
      ) latest
        ON s.campaign_id = latest.campaign_id
       AND s.ad_group_id = latest.ad_group_id
       AND s.keyword_text = latest.keyword_text
       AND s.calculated_at = latest.max_at
      WHERE s.customer_id = ?
      ORDER BY s.campaign_id, s.ad_group_id, s.keyword_text
      LIMIT ?;
    "#,
  )
  .bind(customer_id)
  .bind(customer_id)
  .bind(sql_limit(limit))
  .fetch_all(pool)
  .await?;

  let scores = rows
    .into_iter()
    .map(HealthScoreRow::into_model)
    .collect::<EngineResult<Vec<_>>>()?;
  // Collapses rows sharing the same max timestamp.
  Ok(latest_scores(&scores))
}

pub async fn fetch_health_score_summary(pool: &MySqlPool, customer_id: &str) -> EngineResult<BTreeMap<String, i64>> {
  let rows = sqlx::query_as::<_, (String, i64)>(
    r#"
      SELECT s.category, COUNT(*) AS n
      FROM keyword_health_scores s
      JOIN (
        SELECT campaign_id, ad_group_id, keyword_text, MAX(calculated_at) AS max_at
        FROM keyword_health_scores
        WHERE customer_id = ?
        GROUP BY campaign_id, ad_group_id, keyword_text
      ) latest
        ON s.campaign_id = latest.campaign_id
       AND s.ad_group_id = latest.ad_group_id
       AND s.keyword_text = latest.keyword_text
       AND s.calculated_at = latest.max_at
      WHERE s.customer_id = ?
      GROUP BY s.category;
    "#,
  )
  .bind(customer_id)
  .bind(customer_id)
  .fetch_all(pool)
  .await?;

  Ok(rows.into_iter().collect())
}

pub async fn insert_actions(pool: &MySqlPool, actions: &[OptimizationAction]) -> EngineResult<Vec<i64>> {
  let mut tx = pool.begin().await?;
  let mut ids = Vec::with_capacity(actions.len());
  for a in actions {
    let result = sqlx::query(
      r#"
        INSERT INTO optimization_actions (
          execution_id, customer_id, campaign_id, ad_group_id, criterion_id, keyword_text, action_type,
          old_bid_micros, new_bid_micros, change_percent, justification, health_score_before, risk_level,
          status, dry_run, external_operation_id, error_message, created_at, executed_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
      "#,
    )
    .bind(&a.execution_id)
    .bind(&a.customer_id)
    .bind(&a.campaign_id)
    .bind(&a.ad_group_id)
    .bind(&a.criterion_id)
    .bind(&a.keyword_text)
    .bind(a.action_type.as_str())
    .bind(a.old_bid_micros)
    .bind(a.new_bid_micros)
    .bind(a.change_percent)
    .bind(&a.justification)
    .bind(a.health_score_before)
    .bind(a.risk_level.as_str())
    .bind(a.status.as_str())
    .bind(a.dry_run)
    .bind(&a.external_operation_id)
    .bind(&a.error_message)
    .bind(a.created_at)
    .bind(a.executed_at)
    .execute(&mut *tx)
    .await?;
    ids.push(result.last_insert_id() as i64);
  }
  tx.commit().await?;
  Ok(ids)
}

pub async fn update_action(pool: &MySqlPool, id: i64, update: &StatusUpdate) -> EngineResult<()> {
  let mut tx = pool.begin().await?;
  let current = sqlx::query_as::<_, (String,)>("SELECT status FROM optimization_actions WHERE id = ? FOR UPDATE;")
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| EngineError::Storage(format!("optimization action {id} not found")))?;

  let from = ActionStatus::parse(&current.0).ok_or_else(|| corrupt("optimization_actions", "status", &current.0))?;
  if !from.can_transition_to(update.status) {
    return Err(EngineError::InvalidTransition {
      id,
      from,
      to: update.status,
    });
  }

  sqlx::query(
    r#"
      UPDATE optimization_actions
      SET status = ?,
          external_operation_id = COALESCE(?, external_operation_id),
          error_message = COALESCE(?, error_message),
          executed_at = COALESCE(?, executed_at)
      WHERE id = ? AND status = ?;
    "#,
  )
  .bind(update.status.as_str())
  .bind(&update.external_operation_id)
  .bind(&update.error_message)
  .bind(update.executed_at)
  .bind(id)
  .bind(from.as_str())
  .execute(&mut *tx)
  .await?;

  tx.commit().await?;
  Ok(())
}

pub async fn fetch_actions_for_execution(pool: &MySqlPool, execution_id: &str) -> EngineResult<Vec<OptimizationAction>> {
  let sql = format!("SELECT {ACTION_COLUMNS} FROM optimization_actions WHERE execution_id = ? ORDER BY id;");
  let rows = sqlx::query_as::<_, ActionRow>(&sql)
    .bind(execution_id)
    .fetch_all(pool)
    .await?;
  rows.into_iter().map(ActionRow::into_model).collect()
}

pub async fn fetch_pending_actions(pool: &MySqlPool, customer_id: Option<&str>) -> EngineResult<Vec<OptimizationAction>> {
  let rows = match customer_id {
    Some(customer_id) => {
      let sql = format!(
        "SELECT {ACTION_COLUMNS} FROM optimization_actions WHERE status = 'pending' AND customer_id = ? ORDER BY id;"
      );
      sqlx::query_as::<_, ActionRow>(&sql)
        .bind(customer_id)
        .fetch_all(pool)
        .await?
    }
    None => {
      let sql = format!("SELECT {ACTION_COLUMNS} FROM optimization_actions WHERE status = 'pending' ORDER BY id;");
      sqlx::query_as::<_, ActionRow>(&sql).fetch_all(pool).await?
    }
  };
  rows.into_iter().map(ActionRow::into_model).collect()
}

pub async fn fetch_guardrails_params_json(pool: &MySqlPool) -> EngineResult<Option<String>> {
  let row = sqlx::query_as::<_, (String,)>("SELECT params_json FROM guardrails_config WHERE config_key = ? LIMIT 1;")
    .bind(GUARDRAILS_CONFIG_KEY)
    .fetch_optional(pool)
    .await?;
  Ok(row.map(|r| r.0))
}

pub async fn upsert_guardrails_params(pool: &MySqlPool, params_json: &str) -> EngineResult<()> {
  sqlx::query(
    r#"
      INSERT INTO guardrails_config (config_key, params_json)
      VALUES (?, ?)
      ON DUPLICATE KEY UPDATE
        params_json = VALUES(params_json),
        updated_at = CURRENT_TIMESTAMP(3);
    "#,
  )
  .bind(GUARDRAILS_CONFIG_KEY)
  .bind(params_json)
  .execute(pool)
  .await?;
  Ok(())
}

/// Store backed by TiDB/MySQL.
#[derive(Debug, Clone)]
pub struct MySqlStore {
  pool: &'static MySqlPool,
}

impl MySqlStore {
  pub fn new(pool: &'static MySqlPool) -> Self {
    Self { pool }
  }

  pub async fn from_env() -> EngineResult<Self> {
    Ok(Self::new(get_pool().await?))
  }
}

#[async_trait]
impl MetricsSource for MySqlStore {
  async fn get_keyword_metrics(&self, customer_id: &str, days_back: i64) -> EngineResult<Vec<MetricRecord>> {
    let since = Utc::now().date_naive() - Duration::days(days_back.max(0));
    fetch_keyword_metrics(self.pool, customer_id, since).await
  }

  async fn upsert_keyword_metrics(&self, records: &[MetricRecord]) -> EngineResult<usize> {
    upsert_keyword_metric_rows(self.pool, records).await
  }

  async fn customers_with_recent_metrics(&self, days_back: i64) -> EngineResult<Vec<String>> {
    let since = Utc::now().date_naive() - Duration::days(days_back.max(0));
    let rows = sqlx::query_as::<_, (String,)>(
      "SELECT DISTINCT customer_id FROM keyword_metrics_history WHERE metric_date >= ? ORDER BY customer_id;",
    )
    .bind(since)
    .fetch_all(self.pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
  }
}

#[async_trait]
impl BenchmarkStore for MySqlStore {
  async fn get_account_benchmarks(&self, customer_id: &str) -> EngineResult<Option<Benchmark>> {
    fetch_benchmark(self.pool, customer_id).await
  }

  async fn upsert_benchmarks(&self, benchmark: &Benchmark) -> EngineResult<()> {
    upsert_benchmark(self.pool, benchmark).await
  }
}

#[async_trait]
impl ScoreStore for MySqlStore {
  async fn bulk_insert_health_scores(&self, scores: &[HealthScore]) -> EngineResult<usize> {
    insert_health_scores(self.pool, scores).await
  }

  async fn get_latest_health_scores(&self, customer_id: &str, limit: usize) -> EngineResult<Vec<HealthScore>> {
    fetch_latest_health_scores(self.pool, customer_id, limit).await
  }

  async fn get_health_score_summary(&self, customer_id: &str) -> EngineResult<BTreeMap<String, i64>> {
    fetch_health_score_summary(self.pool, customer_id).await
  }
}

#[async_trait]
impl ActionStore for MySqlStore {
  async fn insert_optimization_actions(&self, actions: &[OptimizationAction]) -> EngineResult<Vec<i64>> {
    insert_actions(self.pool, actions).await
  }

  async fn update_action_status(&self, id: i64, update: StatusUpdate) -> EngineResult<()> {
    update_action(self.pool, id, &update).await
  }

  async fn get_actions_for_execution(&self, execution_id: &str) -> EngineResult<Vec<OptimizationAction>> {
    fetch_actions_for_execution(self.pool, execution_id).await
  }

  async fn get_pending_actions(&self, customer_id: Option<&str>) -> EngineResult<Vec<OptimizationAction>> {
    fetch_pending_actions(self.pool, customer_id).await
  }
}

#[async_trait]
impl ConfigStore for MySqlStore {
  async fn load_guardrails_config(&self) -> EngineResult<Option<GuardrailsConfig>> {
    match fetch_guardrails_params_json(self.pool).await? {
      Some(json) => Ok(Some(serde_json::from_str(&json)?)),
      None => Ok(None),
    }
  }

  async fn save_guardrails_config(&self, cfg: &GuardrailsConfig) -> EngineResult<()> {
    let json = serde_json::to_string(cfg)?;
    upsert_guardrails_params(self.pool, &json).await
  }
}

#[async_trait]
impl MaintenanceStore for MySqlStore {
  async fn cleanup_old_data(&self, days_to_keep: i64) -> EngineResult<CleanupReport> {
    let cutoff_day = Utc::now().date_naive() - Duration::days(days_to_keep.max(0));
    let cutoff_at = Utc::now() - Duration::days(days_to_keep.max(0));

    let metrics = sqlx::query("DELETE FROM keyword_metrics_history WHERE metric_date < ?;")
      .bind(cutoff_day)
      .execute(self.pool)
      .await?;
    let scores = sqlx::query("DELETE FROM keyword_health_scores WHERE calculated_at < ?;")
      .bind(cutoff_at)
      .execute(self.pool)
      .await?;

    Ok(CleanupReport {
      metrics_deleted: metrics.rows_affected(),
      scores_deleted: scores.rows_affected(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn score_row(category: &str) -> HealthScoreRow {
    HealthScoreRow {
      customer_id: "1".to_string(),
      campaign_id: "2".to_string(),
      ad_group_id: "3".to_string(),
      keyword_text: "boots".to_string(),
      health_score: 72.5,
      conv_rate_score: 80.0,
      cpa_score: 70.0,
      ctr_score: 60.0,
      volume_score: 50.0,
      quality_score_points: 90.0,
      confidence: 0.9,
      category: category.to_string(),
      recommended_action: "monitor".to_string(),
      action_priority: 3,
      period_start: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
      period_end: NaiveDate::from_ymd_opt(2026, 3, 30).unwrap(),
      total_spend_micros: 10,
      total_conversions: 1.0,
      total_clicks: 5,
      calculated_at: Utc::now(),
    }
  }

  #[test]
  fn stored_score_strings_map_to_enums() {
    let score = score_row("good").into_model().unwrap();
    assert_eq!(score.category, HealthCategory::Good);
    assert_eq!(score.recommended_action, RecommendedAction::Monitor);

    let err = score_row("stellar").into_model().unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));
    assert!(err.to_string().contains("stellar"));
  }

  #[test]
  fn null_quality_score_reads_as_missing() {
    let row = MetricRow {
      customer_id: "1".to_string(),
      campaign_id: "2".to_string(),
      ad_group_id: "3".to_string(),
      criterion_id: None,
      keyword_text: "boots".to_string(),
      match_type: "EXACT".to_string(),
      status: "ENABLED".to_string(),
      quality_score: None,
      impressions: 100,
      clicks: 4,
      cost_micros: 4_000,
      conversions: 0.0,
      conversion_value: 0.0,
      ctr: 0.04,
      avg_cpc_micros: 1_000,
      cpc_bid_micros: Some(1_200),
      metric_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
    };
    let rec = MetricRecord::from(row);
    assert_eq!(rec.quality_score, QualityScore::Missing);
    assert_eq!(rec.cpc_bid_micros, Some(1_200));
  }

  #[test]
  fn limits_fit_sql_bind_range() {
    assert_eq!(sql_limit(50), 50);
    assert_eq!(sql_limit(usize::MAX), i64::MAX);
  }
}
