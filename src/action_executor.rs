use std::collections::{BTreeMap, HashSet};

use chrono::{Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::autopilot::Autopilot;
use crate::config::{GuardrailsConfig, GuardrailsConfigPatch};
use crate::error::{EngineError, EngineResult, PlatformError};
use crate::guardrails::{validate_change_request, BidLimits, GuardrailContext, ValidatedChangeRequest};
use crate::models::{ActionStatus, ActionType, ChangeRequest, OptimizationAction};
use crate::store::StatusUpdate;

type KeywordKey = (String, String, String);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionError {
  pub keyword: String,
  pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
  pub action_id: i64,
  pub customer_id: String,
  pub keyword: String,
  pub action_type: ActionType,
  pub status: ActionStatus,
  pub old_bid_micros: i64,
  pub new_bid_micros: i64,
  pub operation_id: Option<String>,
  pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
  pub execution_id: String,
  pub total_requests: usize,
  pub successful: usize,
  pub failed: usize,
  pub skipped: usize,
  pub errors: Vec<ExecutionError>,
  pub actions: Vec<ActionOutcome>,
  pub dry_run: bool,
  pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
  NotFound,
  InProgress,
  Completed,
  PartiallyFailed,
  RolledBack,
  PartiallyRolledBack,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatusReport {
  pub execution_id: String,
  pub status: ExecutionState,
  pub total_actions: usize,
  pub status_breakdown: BTreeMap<String, usize>,
  pub actions: Vec<OptimizationAction>,
}

fn keyword_key(campaign_id: &str, ad_group_id: &str, keyword_text: &str) -> KeywordKey {
  (campaign_id.to_string(), ad_group_id.to_string(), keyword_text.to_string())
}

pub fn execution_state(actions: &[OptimizationAction]) -> ExecutionState {
  if actions.is_empty() {
    return ExecutionState::NotFound;
  }
  let count = |status: ActionStatus| actions.iter().filter(|a| a.status == status).count();
  if count(ActionStatus::Failed) > 0 {
    ExecutionState::PartiallyFailed
  } else if count(ActionStatus::Pending) > 0 {
    ExecutionState::InProgress
  } else if count(ActionStatus::Completed) == actions.len() {
    ExecutionState::Completed
  } else if count(ActionStatus::RolledBack) == actions.len() {
    ExecutionState::RolledBack
  } else {
    ExecutionState::PartiallyRolledBack
  }
}

impl Autopilot {
  /// Stored config when present and valid, otherwise defaults with `GUARDRAIL_*` overrides.
  pub async fn get_guardrails_config(&self) -> EngineResult<GuardrailsConfig> {
    match self.store.load_guardrails_config().await? {
      Some(cfg) => match cfg.validate() {
        Ok(()) => Ok(cfg),
        Err(e) => {
          tracing::warn!(error = %e, "stored guardrails config is invalid, using environment defaults");
          Ok(GuardrailsConfig::from_env())
        }
      },
      None => Ok(GuardrailsConfig::from_env()),
    }
  }

  pub async fn update_guardrails_config(&self, patch: &GuardrailsConfigPatch) -> EngineResult<GuardrailsConfig> {
    let current = self.get_guardrails_config().await?;
    let next = current.apply(patch)?;
    self.store.save_guardrails_config(&next).await?;
    tracing::info!(
      max_bid_change_percent = next.max_bid_change_percent,
      min_bid_micros = next.min_bid_micros,
      max_bid_micros = next.max_bid_micros,
      conversion_exclusion_days = next.conversion_exclusion_days,
      min_health_for_increase = next.min_health_for_increase,
      "guardrails config updated"
    );
    Ok(next)
  }

  /// Keywords of the account with any conversion inside the exclusion window.
  async fn recently_converting(&self, customer_id: &str, days: i64) -> EngineResult<HashSet<KeywordKey>> {
    if days <= 0 {
      return Ok(HashSet::new());
    }
    let since = Utc::now().date_naive() - Duration::days(days);
    let metrics = self.store.get_keyword_metrics(customer_id, days).await?;
    Ok(
      metrics
        .iter()
        .filter(|r| r.date >= since && r.conversions > 0.0)
        .map(|r| keyword_key(&r.campaign_id, &r.ad_group_id, &r.keyword_text))
        .collect(),
    )
  }

  /// Validates each request against the guardrails and applies the survivors.
  /// Contract violations reject the whole batch before anything is persisted.
  pub async fn execute_bid_changes(
    &self,
    requests: &[ChangeRequest],
    execution_id: Option<String>,
    dry_run: bool,
  ) -> EngineResult<ExecutionReport> {
    for req in requests {
      req.check_contract()?;
    }

    let execution_id = execution_id
      .map(|id| id.trim().to_string())
      .filter(|id| !id.is_empty())
      .unwrap_or_else(|| Uuid::new_v4().to_string());
    let cfg = self.get_guardrails_config().await?;
    tracing::info!(
      execution_id = execution_id.as_str(),
      requests = requests.len(),
      dry_run,
      "executing change requests"
    );

    let mut contexts: BTreeMap<String, (BidLimits, HashSet<KeywordKey>)> = BTreeMap::new();
    for req in requests {
      if contexts.contains_key(&req.customer_id) {
        continue;
      }
      let floor = self.currency.resolve(&req.customer_id).await;
      let limits = BidLimits::for_currency(&cfg, &floor);
      let converting = self
        .recently_converting(&req.customer_id, cfg.conversion_exclusion_days)
        .await?;
      contexts.insert(req.customer_id.clone(), (limits, converting));
    }

    let mut validated = Vec::new();
    let mut errors = Vec::new();
    for req in requests {
      let Some((limits, converting)) = contexts.get(&req.customer_id) else {
        continue;
      };
      let ctx = GuardrailContext {
        limits: limits.clone(),
        has_recent_conversions: converting.contains(&keyword_key(&req.campaign_id, &req.ad_group_id, &req.keyword_text)),
      };
      match validate_change_request(req, &cfg, &ctx) {
        Ok(v) => validated.push(v),
        Err(violation) => {
          tracing::info!(
            execution_id = execution_id.as_str(),
            keyword = req.keyword_text.as_str(),
            reason = %violation,
            "change request rejected by guardrails"
          );
          errors.push(ExecutionError {
            keyword: req.keyword_text.clone(),
            error: violation.to_string(),
          });
        }
      }
    }
    let skipped = errors.len();

    let actions = self.execute_validated(&execution_id, validated, dry_run).await?;

    let successful = actions.iter().filter(|a| a.status == ActionStatus::Completed).count();
    let failed = actions.iter().filter(|a| a.status == ActionStatus::Failed).count();
    errors.extend(actions.iter().filter_map(|a| {
      a.error.as_ref().map(|e| ExecutionError {
        keyword: a.keyword.clone(),
        error: e.clone(),
      })
    }));

    tracing::info!(
      execution_id = execution_id.as_str(),
      successful,
      failed,
      skipped,
      dry_run,
      "execution finished"
    );

    Ok(ExecutionReport {
      execution_id,
      total_requests: requests.len(),
      successful,
      failed,
      skipped,
      errors,
      actions,
      dry_run,
      success: successful > 0 || failed == 0,
    })
  }

  /// Records every request as pending, then applies them grouped by customer.
  async fn execute_validated(
    &self,
    execution_id: &str,
    requests: Vec<ValidatedChangeRequest>,
    dry_run: bool,
  ) -> EngineResult<Vec<ActionOutcome>> {
    if requests.is_empty() {
      return Ok(Vec::new());
    }

    let now = Utc::now();
    let pending: Vec<OptimizationAction> = requests
      .iter()
      .map(|r| OptimizationAction::pending(execution_id, r.request(), dry_run, now))
      .collect();
    let ids = self.store.insert_optimization_actions(&pending).await?;
    if ids.len() != pending.len() {
      return Err(EngineError::Storage(format!(
        "expected {} action ids, store returned {}",
        pending.len(),
        ids.len()
      )));
    }

    let mut by_customer: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, r) in requests.iter().enumerate() {
      by_customer.entry(r.request().customer_id.as_str()).or_default().push(idx);
    }

    let mut outcomes = Vec::with_capacity(requests.len());
    for (customer_id, indices) in by_customer {
      tracing::debug!(customer_id, actions = indices.len(), "applying changes for account");
      for idx in indices {
        let req = requests[idx].request();
        let id = ids[idx];

        let (update, operation_id, error) = if dry_run {
          (StatusUpdate::completed(None), None, None)
        } else {
          match self.apply_change(&requests[idx]).await {
            Ok(op) => (StatusUpdate::completed(Some(op.clone())), Some(op), None),
            Err(e) => {
              tracing::warn!(
                execution_id,
                customer_id,
                keyword = req.keyword_text.as_str(),
                error = %e,
                "change failed on ads platform"
              );
              (StatusUpdate::failed(e.to_string()), None, Some(e.to_string()))
            }
          }
        };
        let status = update.status;
        self.store.update_action_status(id, update).await?;

        outcomes.push(ActionOutcome {
          action_id: id,
          customer_id: req.customer_id.clone(),
          keyword: req.keyword_text.clone(),
          action_type: req.action_type,
          status,
          old_bid_micros: req.current_bid_micros,
          new_bid_micros: req.proposed_bid_micros,
          operation_id,
          error,
        });
      }
    }
    Ok(outcomes)
  }

  /// Sends one change to the platform, resolving the criterion id when the request lacks it.
  pub(crate) async fn apply_change(&self, validated: &ValidatedChangeRequest) -> Result<String, PlatformError> {
    let req = validated.request();
    let platform = self
      .platform
      .as_ref()
      .ok_or_else(|| PlatformError::new(None, "ads platform not configured"))?;

    let criterion_id = match req.criterion_id.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
      Some(c) => c.to_string(),
      None => platform
        .lookup_criterion_id(&req.customer_id, &req.ad_group_id, &req.keyword_text)
        .await?
        .ok_or_else(|| {
          PlatformError::new(
            None,
            format!("keyword '{}' not found in ad group {}", req.keyword_text, req.ad_group_id),
          )
        })?,
    };

    match req.action_type {
      ActionType::BidChange => {
        platform
          .update_keyword_bid(&req.customer_id, &req.ad_group_id, &criterion_id, req.proposed_bid_micros)
          .await
      }
      ActionType::Pause => platform.pause_keyword(&req.customer_id, &req.ad_group_id, &criterion_id).await,
    }
  }

  pub async fn get_execution_status(&self, execution_id: &str) -> EngineResult<ExecutionStatusReport> {
    let actions = self.store.get_actions_for_execution(execution_id).await?;
    let mut status_breakdown = BTreeMap::new();
    for a in &actions {
      *status_breakdown.entry(a.status.as_str().to_string()).or_insert(0) += 1;
    }
    Ok(ExecutionStatusReport {
      execution_id: execution_id.to_string(),
      status: execution_state(&actions),
      total_actions: actions.len(),
      status_breakdown,
      actions,
    })
  }
}
