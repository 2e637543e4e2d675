use serde::Serialize;

use crate::action_executor::ExecutionError;
use crate::autopilot::Autopilot;
use crate::error::EngineResult;
use crate::guardrails::ValidatedChangeRequest;
use crate::models::{ActionStatus, ActionType, ChangeRequest, OptimizationAction, RiskLevel};
use crate::store::StatusUpdate;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
  pub execution_id: String,
  pub total_actions: usize,
  pub rolled_back: usize,
  pub failed_rollback: usize,
  pub skipped: usize,
  pub errors: Vec<ExecutionError>,
}

/// Request that puts the bid back to what it was before `action`.
pub fn inverse_request(action: &OptimizationAction) -> ChangeRequest {
  let mut req = ChangeRequest::bid_change(
    &action.customer_id,
    &action.campaign_id,
    &action.ad_group_id,
    &action.keyword_text,
    action.new_bid_micros,
    action.old_bid_micros,
    action.health_score_before,
  );
  req.criterion_id = action.criterion_id.clone();
  req.justification = format!("Rollback of action {} ({})", action.id, action.execution_id);
  req.risk_level = RiskLevel::Low;
  req
}

impl Autopilot {
  /// Restores the previous bid of every completed bid change in the execution.
  /// Pauses and actions that never completed are left alone.
  pub async fn rollback_execution(&self, execution_id: &str) -> EngineResult<RollbackReport> {
    let actions = self.store.get_actions_for_execution(execution_id).await?;
    let mut report = RollbackReport {
      execution_id: execution_id.to_string(),
      total_actions: actions.len(),
      ..Default::default()
    };
    if actions.is_empty() {
      tracing::warn!(execution_id, "no actions recorded for execution");
      return Ok(report);
    }

    for action in &actions {
      if action.status != ActionStatus::Completed || action.action_type != ActionType::BidChange {
        report.skipped += 1;
        continue;
      }

      if action.dry_run {
        self.store.update_action_status(action.id, StatusUpdate::rolled_back()).await?;
        report.rolled_back += 1;
        continue;
      }

      if action.old_bid_micros <= 0 {
        report.failed_rollback += 1;
        report.errors.push(ExecutionError {
          keyword: action.keyword_text.clone(),
          error: "no previous bid recorded".to_string(),
        });
        continue;
      }

      let restore = ValidatedChangeRequest::restorative(inverse_request(action));
      match self.apply_change(&restore).await {
        Ok(_) => {
          self.store.update_action_status(action.id, StatusUpdate::rolled_back()).await?;
          report.rolled_back += 1;
        }
        Err(e) => {
          tracing::warn!(
            execution_id,
            action_id = action.id,
            keyword = action.keyword_text.as_str(),
            error = %e,
            "rollback failed on ads platform"
          );
          report.failed_rollback += 1;
          report.errors.push(ExecutionError {
            keyword: action.keyword_text.clone(),
            error: e.to_string(),
          });
        }
      }
    }

    tracing::info!(
      execution_id,
      rolled_back = report.rolled_back,
      failed_rollback = report.failed_rollback,
      skipped = report.skipped,
      "rollback finished"
    );
    Ok(report)
  }
}
