use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::GuardrailsConfig;
use crate::error::EngineResult;
use crate::models::{ActionStatus, Benchmark, HealthScore, MetricRecord, OptimizationAction};

#[async_trait]
pub trait MetricsSource: Send + Sync {
  /// Records dated within the last `days_back` days (inclusive of today).
  async fn get_keyword_metrics(&self, customer_id: &str, days_back: i64) -> EngineResult<Vec<MetricRecord>>;

  /// Inserts or supersedes rows keyed by (customer, campaign, ad group, keyword, date).
  async fn upsert_keyword_metrics(&self, records: &[MetricRecord]) -> EngineResult<usize>;

  async fn customers_with_recent_metrics(&self, days_back: i64) -> EngineResult<Vec<String>>;
}

#[async_trait]
pub trait BenchmarkStore: Send + Sync {
  async fn get_account_benchmarks(&self, customer_id: &str) -> EngineResult<Option<Benchmark>>;

  async fn upsert_benchmarks(&self, benchmark: &Benchmark) -> EngineResult<()>;
}

#[async_trait]
pub trait ScoreStore: Send + Sync {
  /// Appends every score as a new snapshot.
  async fn bulk_insert_health_scores(&self, scores: &[HealthScore]) -> EngineResult<usize>;

  /// Newest snapshot per keyword, ordered by (campaign, ad group, keyword).
  async fn get_latest_health_scores(&self, customer_id: &str, limit: usize) -> EngineResult<Vec<HealthScore>>;

  /// Number of latest snapshots per category.
  async fn get_health_score_summary(&self, customer_id: &str) -> EngineResult<BTreeMap<String, i64>>;
}

/// Fields written together with a status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
  pub status: ActionStatus,
  pub external_operation_id: Option<String>,
  pub error_message: Option<String>,
  pub executed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
  pub fn completed(operation_id: Option<String>) -> Self {
    Self {
      status: ActionStatus::Completed,
      external_operation_id: operation_id,
      error_message: None,
      executed_at: Some(Utc::now()),
    }
  }

  pub fn failed(error: impl Into<String>) -> Self {
    Self {
      status: ActionStatus::Failed,
      external_operation_id: None,
      error_message: Some(error.into()),
      executed_at: Some(Utc::now()),
    }
  }

  pub fn rolled_back() -> Self {
    Self {
      status: ActionStatus::RolledBack,
      external_operation_id: None,
      error_message: None,
      executed_at: None,
    }
  }
}

#[async_trait]
pub trait ActionStore: Send + Sync {
  /// Returns the assigned ids in input order.
  async fn insert_optimization_actions(&self, actions: &[OptimizationAction]) -> EngineResult<Vec<i64>>;

  /// Fails with `InvalidTransition` unless the current status may move to `update.status`.
  async fn update_action_status(&self, id: i64, update: StatusUpdate) -> EngineResult<()>;

  async fn get_actions_for_execution(&self, execution_id: &str) -> EngineResult<Vec<OptimizationAction>>;

  async fn get_pending_actions(&self, customer_id: Option<&str>) -> EngineResult<Vec<OptimizationAction>>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
  async fn load_guardrails_config(&self) -> EngineResult<Option<GuardrailsConfig>>;

  async fn save_guardrails_config(&self, cfg: &GuardrailsConfig) -> EngineResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
  pub metrics_deleted: u64,
  pub scores_deleted: u64,
}

#[async_trait]
pub trait MaintenanceStore: Send + Sync {
  /// Drops metric rows and score snapshots older than `days_to_keep` days.
  async fn cleanup_old_data(&self, days_to_keep: i64) -> EngineResult<CleanupReport>;
}

/// Everything the engine needs from persistence.
pub trait KeywordStore: MetricsSource + BenchmarkStore + ScoreStore + ActionStore + ConfigStore + MaintenanceStore {}

impl<T> KeywordStore for T where
  T: MetricsSource + BenchmarkStore + ScoreStore + ActionStore + ConfigStore + MaintenanceStore + ?Sized
{
}
