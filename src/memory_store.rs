//! In-process store for tests and local dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use tokio::sync::RwLock;

use crate::config::GuardrailsConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{ActionStatus, Benchmark, HealthScore, MetricRecord, OptimizationAction};
use crate::recommendations::latest_scores;
use crate::store::{
  ActionStore, BenchmarkStore, CleanupReport, ConfigStore, MaintenanceStore, MetricsSource, ScoreStore,
  StatusUpdate,
};

type MetricKey = (String, String, String, String, NaiveDate);

fn metric_key(r: &MetricRecord) -> MetricKey {
  (
    r.customer_id.clone(),
    r.campaign_id.clone(),
    r.ad_group_id.clone(),
    r.keyword_text.clone(),
    r.date,
  )
}

fn window_start(days_back: i64) -> NaiveDate {
  Utc::now().date_naive() - Duration::days(days_back.max(0))
}

#[derive(Debug, Default)]
pub struct MemoryStore {
  metrics: Arc<RwLock<BTreeMap<MetricKey, MetricRecord>>>,
  benchmarks: Arc<RwLock<HashMap<String, Benchmark>>>,
  scores: Arc<RwLock<Vec<HealthScore>>>,
  actions: Arc<RwLock<Vec<OptimizationAction>>>,
  guardrails: Arc<RwLock<Option<GuardrailsConfig>>>,
  fail_writes: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Makes every subsequent write fail, to exercise storage-outage paths.
  pub fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  fn check_writable(&self) -> EngineResult<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(EngineError::Storage("store unavailable".to_string()));
    }
    Ok(())
  }

  pub async fn all_scores(&self) -> Vec<HealthScore> {
    self.scores.read().await.clone()
  }

  pub async fn all_actions(&self) -> Vec<OptimizationAction> {
    self.actions.read().await.clone()
  }
}

#[async_trait]
impl MetricsSource for MemoryStore {
  async fn get_keyword_metrics(&self, customer_id: &str, days_back: i64) -> EngineResult<Vec<MetricRecord>> {
    let since = window_start(days_back);
    let metrics = self.metrics.read().await;
    Ok(
      metrics
        .values()
        .filter(|r| r.customer_id == customer_id && r.date >= since)
        .cloned()
        .collect(),
    )
  }

  async fn upsert_keyword_metrics(&self, records: &[MetricRecord]) -> EngineResult<usize> {
    self.check_writable()?;
    let mut metrics = self.metrics.write().await;
    for r in records {
      metrics.insert(metric_key(r), r.clone());
    }
    Ok(records.len())
  }

  async fn customers_with_recent_metrics(&self, days_back: i64) -> EngineResult<Vec<String>> {
    let since = window_start(days_back);
    let metrics = self.metrics.read().await;
    let mut out: Vec<String> = metrics
      .values()
      .filter(|r| r.date >= since)
      .map(|r| r.customer_id.clone())
      .collect();
    out.sort();
    out.dedup();
    Ok(out)
  }
}

#[async_trait]
impl BenchmarkStore for MemoryStore {
  async fn get_account_benchmarks(&self, customer_id: &str) -> EngineResult<Option<Benchmark>> {
    Ok(self.benchmarks.read().await.get(customer_id).cloned())
  }

  async fn upsert_benchmarks(&self, benchmark: &Benchmark) -> EngineResult<()> {
    self.check_writable()?;
    self
      .benchmarks
      .write()
      .await
      .insert(benchmark.customer_id.clone(), benchmark.clone());
    Ok(())
  }
}

#[async_trait]
impl ScoreStore for MemoryStore {
  async fn bulk_insert_health_scores(&self, scores: &[HealthScore]) -> EngineResult<usize> {
    self.check_writable()?;
    self.scores.write().await.extend_from_slice(scores);
    Ok(scores.len())
  }

  async fn get_latest_health_scores(&self, customer_id: &str, limit: usize) -> EngineResult<Vec<HealthScore>> {
    let scores = self.scores.read().await;
    let mine: Vec<HealthScore> = scores.iter().filter(|s| s.customer_id == customer_id).cloned().collect();
    let mut latest = latest_scores(&mine);
    latest.truncate(limit);
    Ok(latest)
  }

  async fn get_health_score_summary(&self, customer_id: &str) -> EngineResult<BTreeMap<String, i64>> {
    let latest = self.get_latest_health_scores(customer_id, usize::MAX).await?;
    let mut out = BTreeMap::new();
    for s in latest {
      *out.entry(s.category.as_str().to_string()).or_insert(0) += 1;
    }
    Ok(out)
  }
}

#[async_trait]
impl ActionStore for MemoryStore {
  async fn insert_optimization_actions(&self, actions: &[OptimizationAction]) -> EngineResult<Vec<i64>> {
    self.check_writable()?;
    let mut stored = self.actions.write().await;
    let mut ids = Vec::with_capacity(actions.len());
    for a in actions {
      let id = stored.len() as i64 + 1;
      let mut row = a.clone();
      row.id = id;
      stored.push(row);
      ids.push(id);
    }
    Ok(ids)
  }

  async fn update_action_status(&self, id: i64, update: StatusUpdate) -> EngineResult<()> {
    self.check_writable()?;
    let mut stored = self.actions.write().await;
    let action = stored
      .iter_mut()
      .find(|a| a.id == id)
      .ok_or_else(|| EngineError::Storage(format!("optimization action {id} not found")))?;
    if !action.status.can_transition_to(update.status) {
      return Err(EngineError::InvalidTransition {
        id,
        from: action.status,
        to: update.status,
      });
    }
    action.status = update.status;
    if update.external_operation_id.is_some() {
      action.external_operation_id = update.external_operation_id;
    }
    if update.error_message.is_some() {
      action.error_message = update.error_message;
    }
    if update.executed_at.is_some() {
      action.executed_at = update.executed_at;
    }
    Ok(())
  }

  async fn get_actions_for_execution(&self, execution_id: &str) -> EngineResult<Vec<OptimizationAction>> {
    let stored = self.actions.read().await;
    Ok(stored.iter().filter(|a| a.execution_id == execution_id).cloned().collect())
  }

  async fn get_pending_actions(&self, customer_id: Option<&str>) -> EngineResult<Vec<OptimizationAction>> {
    let stored = self.actions.read().await;
    Ok(
      stored
        .iter()
        .filter(|a| a.status == ActionStatus::Pending)
        .filter(|a| customer_id.map_or(true, |c| a.customer_id == c))
        .cloned()
        .collect(),
    )
  }
}

#[async_trait]
impl ConfigStore for MemoryStore {
  async fn load_guardrails_config(&self) -> EngineResult<Option<GuardrailsConfig>> {
    Ok(self.guardrails.read().await.clone())
  }

  async fn save_guardrails_config(&self, cfg: &GuardrailsConfig) -> EngineResult<()> {
    self.check_writable()?;
    *self.guardrails.write().await = Some(cfg.clone());
    Ok(())
  }
}

#[async_trait]
impl MaintenanceStore for MemoryStore {
  async fn cleanup_old_data(&self, days_to_keep: i64) -> EngineResult<CleanupReport> {
    self.check_writable()?;
    let cutoff_day = window_start(days_to_keep);
    let cutoff_at = Utc::now() - Duration::days(days_to_keep.max(0));

    let mut metrics = self.metrics.write().await;
    let before = metrics.len();
    metrics.retain(|_, r| r.date >= cutoff_day);
    let metrics_deleted = (before - metrics.len()) as u64;

    let mut scores = self.scores.write().await;
    let before = scores.len();
    scores.retain(|s| s.calculated_at >= cutoff_at);
    let scores_deleted = (before - scores.len()) as u64;

    Ok(CleanupReport {
      metrics_deleted,
      scores_deleted,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::metric_rollup::tests::record;
  use crate::models::ChangeRequest;

  #[tokio::test]
  async fn upsert_supersedes_same_day_row() {
    let store = MemoryStore::new();
    let mut r = record("shoes", 1);
    r.date = Utc::now().date_naive();
    store.upsert_keyword_metrics(&[r.clone()]).await.unwrap();
    r.clicks = 99;
    store.upsert_keyword_metrics(&[r.clone()]).await.unwrap();

    let rows = store.get_keyword_metrics(&r.customer_id, 7).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].clicks, 99);
    assert_eq!(
      store.customers_with_recent_metrics(7).await.unwrap(),
      vec![r.customer_id.clone()]
    );
  }

  #[tokio::test]
  async fn metrics_outside_window_are_excluded() {
    let store = MemoryStore::new();
    let mut old = record("shoes", 1);
    old.date = Utc::now().date_naive() - Duration::days(40);
    store.upsert_keyword_metrics(&[old.clone()]).await.unwrap();
    assert!(store.get_keyword_metrics(&old.customer_id, 30).await.unwrap().is_empty());

    let report = store.cleanup_old_data(30).await.unwrap();
    assert_eq!(report.metrics_deleted, 1);
  }

  #[tokio::test]
  async fn status_updates_respect_transitions() {
    let store = MemoryStore::new();
    let req = ChangeRequest::bid_change("c", "1", "2", "shoes", 1_000_000, 1_100_000, 80.0);
    let ids = store
      .insert_optimization_actions(&[OptimizationAction::pending("exec-1", &req, false, Utc::now())])
      .await
      .unwrap();
    assert_eq!(ids, vec![1]);
    assert_eq!(store.get_pending_actions(Some("c")).await.unwrap().len(), 1);
    assert!(store.get_pending_actions(Some("other")).await.unwrap().is_empty());

    store
      .update_action_status(1, StatusUpdate::completed(Some("op-1".to_string())))
      .await
      .unwrap();
    let err = store.update_action_status(1, StatusUpdate::failed("late")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));

    store.update_action_status(1, StatusUpdate::rolled_back()).await.unwrap();
    let actions = store.get_actions_for_execution("exec-1").await.unwrap();
    assert_eq!(actions[0].status, ActionStatus::RolledBack);
    assert_eq!(actions[0].external_operation_id.as_deref(), Some("op-1"));
  }

  #[tokio::test]
  async fn failing_writes_surface_storage_errors() {
    let store = MemoryStore::new();
    store.set_fail_writes(true);
    let err = store.bulk_insert_health_scores(&[]).await.unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));
  }
}
