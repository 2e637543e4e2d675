use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Quality score used when deciding actions for a keyword that reports none.
pub const NEUTRAL_QUALITY_SCORE: f64 = 5.0;

/// Largest gap allowed between a stated `change_percent` and the one implied by the bids.
/// Covers rounding the percent to one decimal.
pub const CHANGE_PERCENT_TOLERANCE: f64 = 0.05;

/// Platform quality score (1-10). "No data" is kept apart from any reported value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<f64>")]
pub enum QualityScore {
  Present(f64),
  Missing,
}

impl QualityScore {
  /// Zero, negative and non-finite values are reported by the platform when it has no data.
  pub fn from_raw(value: Option<f64>) -> Self {
    match value {
      Some(v) if v.is_finite() && v > 0.0 => QualityScore::Present(v),
      _ => QualityScore::Missing,
    }
  }

  pub fn value(&self) -> Option<f64> {
    match self {
      QualityScore::Present(v) => Some(*v),
      QualityScore::Missing => None,
    }
  }

  pub fn or_neutral(&self) -> f64 {
    self.value().unwrap_or(NEUTRAL_QUALITY_SCORE)
  }
}

impl Default for QualityScore {
  fn default() -> Self {
    QualityScore::Missing
  }
}

impl From<Option<f64>> for QualityScore {
  fn from(value: Option<f64>) -> Self {
    QualityScore::from_raw(value)
  }
}

impl From<QualityScore> for Option<f64> {
  fn from(value: QualityScore) -> Self {
    value.value()
  }
}

/// One day of keyword performance as ingested from the ads platform. Money is in micros.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
  pub customer_id: String,
  pub campaign_id: String,
  pub ad_group_id: String,
  #[serde(default)]
  pub criterion_id: Option<String>,
  pub keyword_text: String,
  #[serde(default)]
  pub match_type: String,
  #[serde(default)]
  pub status: String,
  #[serde(default)]
  pub quality_score: QualityScore,
  pub impressions: i64,
  pub clicks: i64,
  pub cost_micros: i64,
  pub conversions: f64,
  #[serde(default)]
  pub conversion_value: f64,
  pub ctr: f64,
  pub avg_cpc_micros: i64,
  #[serde(default)]
  pub cpc_bid_micros: Option<i64>,
  pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
  Conservative,
  Moderate,
  Aggressive,
}

impl RiskTolerance {
  pub fn as_str(&self) -> &'static str {
    match self {
      RiskTolerance::Conservative => "conservative",
      RiskTolerance::Moderate => "moderate",
      RiskTolerance::Aggressive => "aggressive",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value.trim().to_ascii_lowercase().as_str() {
      "conservative" => Some(RiskTolerance::Conservative),
      "moderate" => Some(RiskTolerance::Moderate),
      "aggressive" => Some(RiskTolerance::Aggressive),
      _ => None,
    }
  }
}

/// Per-account targets the component scores are measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Benchmark {
  pub customer_id: String,
  pub target_conv_rate: f64,
  pub target_cpa_micros: f64,
  pub benchmark_ctr: f64,
  pub min_quality_score: f64,
  pub seasonality_factor: f64,
  pub risk_tolerance: RiskTolerance,
  pub industry: String,
}

impl Benchmark {
  pub fn default_for(customer_id: &str) -> Self {
    Self {
      customer_id: customer_id.to_string(),
      target_conv_rate: 0.02,
      target_cpa_micros: 200_000.0,
      benchmark_ctr: 0.03,
      min_quality_score: 5.0,
      seasonality_factor: 1.0,
      risk_tolerance: RiskTolerance::Moderate,
      industry: "general".to_string(),
    }
  }

  pub fn validate(&self) -> EngineResult<()> {
    if self.customer_id.trim().is_empty() {
      return Err(EngineError::InvalidConfig("benchmark customer_id is required".to_string()));
    }
    if !(self.target_conv_rate.is_finite() && self.target_conv_rate > 0.0 && self.target_conv_rate <= 1.0) {
      return Err(EngineError::InvalidConfig(format!(
        "target_conv_rate must be in (0, 1], got {}",
        self.target_conv_rate
      )));
    }
    if !(self.target_cpa_micros.is_finite() && self.target_cpa_micros > 0.0) {
      return Err(EngineError::InvalidConfig(format!(
        "target_cpa_micros must be positive, got {}",
        self.target_cpa_micros
      )));
    }
    if !(self.benchmark_ctr.is_finite() && self.benchmark_ctr > 0.0 && self.benchmark_ctr <= 1.0) {
      return Err(EngineError::InvalidConfig(format!(
        "benchmark_ctr must be in (0, 1], got {}",
        self.benchmark_ctr
      )));
    }
    if !(1.0..=10.0).contains(&self.min_quality_score) {
      return Err(EngineError::InvalidConfig(format!(
        "min_quality_score must be in [1, 10], got {}",
        self.min_quality_score
      )));
    }
    if !(self.seasonality_factor.is_finite() && self.seasonality_factor > 0.0) {
      return Err(EngineError::InvalidConfig(format!(
        "seasonality_factor must be positive, got {}",
        self.seasonality_factor
      )));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCategory {
  Excellent,
  Good,
  Warning,
  Critical,
}

impl HealthCategory {
  pub fn as_str(&self) -> &'static str {
    match self {
      HealthCategory::Excellent => "excellent",
      HealthCategory::Good => "good",
      HealthCategory::Warning => "warning",
      HealthCategory::Critical => "critical",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "excellent" => Some(HealthCategory::Excellent),
      "good" => Some(HealthCategory::Good),
      "warning" => Some(HealthCategory::Warning),
      "critical" => Some(HealthCategory::Critical),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
  IncreaseBid,
  Monitor,
  Optimize,
  DecreaseBid,
  PauseKeyword,
  ImproveQuality,
}

impl RecommendedAction {
  pub fn as_str(&self) -> &'static str {
    match self {
      RecommendedAction::IncreaseBid => "increase_bid",
      RecommendedAction::Monitor => "monitor",
      RecommendedAction::Optimize => "optimize",
      RecommendedAction::DecreaseBid => "decrease_bid",
      RecommendedAction::PauseKeyword => "pause_keyword",
      RecommendedAction::ImproveQuality => "improve_quality",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "increase_bid" => Some(RecommendedAction::IncreaseBid),
      "monitor" => Some(RecommendedAction::Monitor),
      "optimize" => Some(RecommendedAction::Optimize),
      "decrease_bid" => Some(RecommendedAction::DecreaseBid),
      "pause_keyword" => Some(RecommendedAction::PauseKeyword),
      "improve_quality" => Some(RecommendedAction::ImproveQuality),
      _ => None,
    }
  }
}

/// One scoring run for one keyword. Rows are appended, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
  pub customer_id: String,
  pub campaign_id: String,
  pub ad_group_id: String,
  pub keyword_text: String,
  pub health_score: f64,
  pub conv_rate_score: f64,
  pub cpa_score: f64,
  pub ctr_score: f64,
  pub volume_score: f64,
  pub quality_score_points: f64,
  pub confidence: f64,
  pub category: HealthCategory,
  pub recommended_action: RecommendedAction,
  pub action_priority: i32,
  pub period_start: NaiveDate,
  pub period_end: NaiveDate,
  pub total_spend_micros: i64,
  pub total_conversions: f64,
  pub total_clicks: i64,
  pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
  Low,
  Medium,
  High,
}

impl Default for RiskLevel {
  fn default() -> Self {
    RiskLevel::Medium
  }
}

impl RiskLevel {
  pub fn as_str(&self) -> &'static str {
    match self {
      RiskLevel::Low => "low",
      RiskLevel::Medium => "medium",
      RiskLevel::High => "high",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "low" => Some(RiskLevel::Low),
      "medium" => Some(RiskLevel::Medium),
      "high" => Some(RiskLevel::High),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
  BidChange,
  Pause,
}

impl Default for ActionType {
  fn default() -> Self {
    ActionType::BidChange
  }
}

impl ActionType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ActionType::BidChange => "bid_change",
      ActionType::Pause => "pause",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "bid_change" => Some(ActionType::BidChange),
      "pause" => Some(ActionType::Pause),
      _ => None,
    }
  }
}

/// A proposed bid change or pause. Bids are in micros of the account currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
  pub customer_id: String,
  pub campaign_id: String,
  pub ad_group_id: String,
  #[serde(default)]
  pub criterion_id: Option<String>,
  pub keyword_text: String,
  #[serde(default)]
  pub action_type: ActionType,
  #[serde(default)]
  pub current_bid_micros: i64,
  #[serde(default)]
  pub proposed_bid_micros: i64,
  #[serde(default)]
  pub change_percent: f64,
  #[serde(default)]
  pub justification: String,
  #[serde(default)]
  pub risk_level: RiskLevel,
  #[serde(default)]
  pub health_score: f64,
}

impl ChangeRequest {
  /// Builds a bid change with `change_percent` derived from the two bids.
  pub fn bid_change(
    customer_id: &str,
    campaign_id: &str,
    ad_group_id: &str,
    keyword_text: &str,
    current_bid_micros: i64,
    proposed_bid_micros: i64,
    health_score: f64,
  ) -> Self {
    let mut req = Self {
      customer_id: customer_id.to_string(),
      campaign_id: campaign_id.to_string(),
      ad_group_id: ad_group_id.to_string(),
      criterion_id: None,
      keyword_text: keyword_text.to_string(),
      action_type: ActionType::BidChange,
      current_bid_micros,
      proposed_bid_micros,
      change_percent: 0.0,
      justification: String::new(),
      risk_level: RiskLevel::Medium,
      health_score,
    };
    req.change_percent = req.implied_change_percent().unwrap_or(0.0);
    req
  }

  pub fn pause(customer_id: &str, campaign_id: &str, ad_group_id: &str, keyword_text: &str, health_score: f64) -> Self {
    Self {
      customer_id: customer_id.to_string(),
      campaign_id: campaign_id.to_string(),
      ad_group_id: ad_group_id.to_string(),
      criterion_id: None,
      keyword_text: keyword_text.to_string(),
      action_type: ActionType::Pause,
      current_bid_micros: 0,
      proposed_bid_micros: 0,
      change_percent: 0.0,
      justification: String::new(),
      risk_level: RiskLevel::Medium,
      health_score,
    }
  }

  /// Percent change implied by the bids; `None` when the current bid is unknown.
  pub fn implied_change_percent(&self) -> Option<f64> {
    if self.current_bid_micros <= 0 {
      return None;
    }
    let delta = (self.proposed_bid_micros - self.current_bid_micros) as f64;
    Some(delta * 100.0 / self.current_bid_micros as f64)
  }

  pub fn is_increase(&self) -> bool {
    self.action_type == ActionType::BidChange && self.proposed_bid_micros > self.current_bid_micros
  }

  /// Rejects requests that are structurally broken rather than merely unsafe.
  pub fn check_contract(&self) -> EngineResult<()> {
    let who = if self.keyword_text.is_empty() {
      "<empty keyword>"
    } else {
      self.keyword_text.as_str()
    };
    for (name, value) in [
      ("customer_id", &self.customer_id),
      ("campaign_id", &self.campaign_id),
      ("ad_group_id", &self.ad_group_id),
      ("keyword_text", &self.keyword_text),
    ] {
      if value.trim().is_empty() {
        return Err(EngineError::InvalidRequest(format!("{name} is required ({who})")));
      }
    }
    if !self.change_percent.is_finite() || !self.health_score.is_finite() {
      return Err(EngineError::InvalidRequest(format!("non-finite change_percent or health_score ({who})")));
    }
    if self.action_type == ActionType::BidChange {
      if self.current_bid_micros <= 0 || self.proposed_bid_micros <= 0 {
        return Err(EngineError::InvalidRequest(format!(
          "bid change needs positive current and proposed bids ({who})"
        )));
      }
      if let Some(implied) = self.implied_change_percent() {
        if (implied - self.change_percent).abs() > CHANGE_PERCENT_TOLERANCE + 1e-9 {
          return Err(EngineError::InvalidRequest(format!(
            "change_percent {:.2} does not match bids ({:.2} implied) ({who})",
            self.change_percent, implied
          )));
        }
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
  Pending,
  Completed,
  Failed,
  RolledBack,
}

impl ActionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      ActionStatus::Pending => "pending",
      ActionStatus::Completed => "completed",
      ActionStatus::Failed => "failed",
      ActionStatus::RolledBack => "rolled_back",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "pending" => Some(ActionStatus::Pending),
      "completed" => Some(ActionStatus::Completed),
      "failed" => Some(ActionStatus::Failed),
      "rolled_back" => Some(ActionStatus::RolledBack),
      _ => None,
    }
  }

  /// pending -> completed | failed, completed -> rolled_back. Nothing else.
  pub fn can_transition_to(&self, next: ActionStatus) -> bool {
    matches!(
      (self, next),
      (ActionStatus::Pending, ActionStatus::Completed)
        | (ActionStatus::Pending, ActionStatus::Failed)
        | (ActionStatus::Completed, ActionStatus::RolledBack)
    )
  }
}

impl std::fmt::Display for ActionStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Audit record for one change request inside an execution batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationAction {
  pub id: i64,
  pub execution_id: String,
  pub customer_id: String,
  pub campaign_id: String,
  pub ad_group_id: String,
  pub criterion_id: Option<String>,
  pub keyword_text: String,
  pub action_type: ActionType,
  pub old_bid_micros: i64,
  pub new_bid_micros: i64,
  pub change_percent: f64,
  pub justification: String,
  pub health_score_before: f64,
  pub risk_level: RiskLevel,
  pub status: ActionStatus,
  pub dry_run: bool,
  pub external_operation_id: Option<String>,
  pub error_message: Option<String>,
  pub created_at: DateTime<Utc>,
  pub executed_at: Option<DateTime<Utc>>,
}

impl OptimizationAction {
  /// New `pending` record for `req`; the store assigns `id` on insert.
  pub fn pending(execution_id: &str, req: &ChangeRequest, dry_run: bool, now: DateTime<Utc>) -> Self {
    Self {
      id: 0,
      execution_id: execution_id.to_string(),
      customer_id: req.customer_id.clone(),
      campaign_id: req.campaign_id.clone(),
      ad_group_id: req.ad_group_id.clone(),
      criterion_id: req.criterion_id.clone(),
      keyword_text: req.keyword_text.clone(),
      action_type: req.action_type,
      old_bid_micros: req.current_bid_micros,
      new_bid_micros: req.proposed_bid_micros,
      change_percent: req.change_percent,
      justification: req.justification.clone(),
      health_score_before: req.health_score,
      risk_level: req.risk_level,
      status: ActionStatus::Pending,
      dry_run,
      external_operation_id: None,
      error_message: None,
      created_at: now,
      executed_at: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_quality_score_is_not_zero() {
    assert_eq!(QualityScore::from_raw(None), QualityScore::Missing);
    assert_eq!(QualityScore::from_raw(Some(0.0)), QualityScore::Missing);
    assert_eq!(QualityScore::from_raw(Some(7.0)), QualityScore::Present(7.0));
    assert_eq!(QualityScore::Missing.or_neutral(), NEUTRAL_QUALITY_SCORE);
    assert_eq!(QualityScore::Present(3.0).or_neutral(), 3.0);
  }

  #[test]
  fn quality_score_serializes_as_nullable_number() {
    let json = serde_json::to_value(QualityScore::Missing).unwrap();
    assert!(json.is_null());
    let parsed: QualityScore = serde_json::from_str("8").unwrap();
    assert_eq!(parsed, QualityScore::Present(8.0));
  }

  #[test]
  fn action_status_transitions_are_one_directional() {
    use ActionStatus::*;
    assert!(Pending.can_transition_to(Completed));
    assert!(Pending.can_transition_to(Failed));
    assert!(Completed.can_transition_to(RolledBack));

    assert!(!Completed.can_transition_to(Pending));
    assert!(!Failed.can_transition_to(Completed));
    assert!(!Failed.can_transition_to(RolledBack));
    assert!(!RolledBack.can_transition_to(Completed));
    assert!(!Pending.can_transition_to(RolledBack));
  }

  #[test]
  fn bid_change_derives_change_percent() {
    let req = ChangeRequest::bid_change("c", "1", "2", "shoes", 1_000_000, 1_300_000, 80.0);
    assert_eq!(req.change_percent, 30.0);
    assert!(req.is_increase());
    assert!(req.check_contract().is_ok());
  }

  #[test]
  fn contract_rejects_missing_ids_and_mismatched_percent() {
    let mut req = ChangeRequest::bid_change("c", "1", "2", "shoes", 1_000_000, 1_100_000, 80.0);
    req.ad_group_id = String::new();
    assert!(matches!(req.check_contract(), Err(EngineError::InvalidRequest(_))));

    let mut req = ChangeRequest::bid_change("c", "1", "2", "shoes", 1_000_000, 1_100_000, 80.0);
    req.change_percent = 25.0;
    assert!(matches!(req.check_contract(), Err(EngineError::InvalidRequest(_))));

    let req = ChangeRequest::bid_change("c", "1", "2", "shoes", 0, 1_100_000, 80.0);
    assert!(req.check_contract().is_err());
  }

  #[test]
  fn contract_tolerates_only_one_decimal_rounding() {
    let mut req = ChangeRequest::bid_change("c", "1", "2", "shoes", 1_000_000, 1_123_456, 80.0);
    req.change_percent = 12.3;
    assert!(req.check_contract().is_ok());

    let mut req = ChangeRequest::bid_change("c", "1", "2", "shoes", 1_000_000, 1_304_900, 80.0);
    req.change_percent = 30.0;
    assert!(matches!(req.check_contract(), Err(EngineError::InvalidRequest(_))));
  }

  #[test]
  fn pause_request_needs_no_bids() {
    let req = ChangeRequest::pause("c", "1", "2", "shoes", 10.0);
    assert!(req.check_contract().is_ok());
    assert!(!req.is_increase());
  }

  #[test]
  fn default_benchmark_is_valid() {
    let b = Benchmark::default_for("123");
    assert!(b.validate().is_ok());
    assert_eq!(b.target_cpa_micros, 200_000.0);

    let mut bad = b.clone();
    bad.min_quality_score = 11.0;
    assert!(bad.validate().is_err());
  }
}
