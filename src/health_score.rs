use chrono::{DateTime, Utc};

use crate::metric_rollup::KeywordRollup;
use crate::models::{Benchmark, HealthCategory, HealthScore, QualityScore, RecommendedAction};

pub const W_CONV_RATE: f64 = 0.30;
pub const W_CPA: f64 = 0.30;
pub const W_CTR: f64 = 0.20;
pub const W_VOLUME: f64 = 0.10;
pub const W_QUALITY: f64 = 0.10;

const CONFIDENCE_CLICKS: f64 = 50.0;
const CONFIDENCE_DAYS: f64 = 14.0;
const CONFIDENCE_IMPRESSIONS: f64 = 1000.0;

const VOLUME_CLICKS: f64 = 100.0;
const VOLUME_IMPRESSIONS: f64 = 5000.0;

pub fn round_to(value: f64, decimals: i32) -> f64 {
  let factor = 10f64.powi(decimals);
  (value * factor).round() / factor
}

fn clamp_score(value: f64) -> f64 {
  if value.is_finite() {
    value.clamp(0.0, 100.0)
  } else {
    0.0
  }
}

fn saturating_ratio(value: f64, full_at: f64) -> f64 {
  if value.is_finite() {
    (value / full_at).clamp(0.0, 1.0)
  } else {
    0.0
  }
}

/// Statistical confidence in [0, 1] from click volume, active days and reach.
pub fn calculate_confidence(clicks: i64, days_active: i64, impressions: i64) -> f64 {
  let c = 0.5 * saturating_ratio(clicks as f64, CONFIDENCE_CLICKS)
    + 0.3 * saturating_ratio(days_active as f64, CONFIDENCE_DAYS)
    + 0.2 * saturating_ratio(impressions as f64, CONFIDENCE_IMPRESSIONS);
  round_to(c, 3).clamp(0.0, 1.0)
}

pub fn conversion_rate_score(actual: f64, target: f64) -> f64 {
  if !(target > 0.0) {
    return 50.0;
  }
  let ratio = actual / target;
  let score = if ratio >= 1.5 {
    100.0
  } else if ratio >= 1.0 {
    70.0 + (ratio - 1.0) * 60.0
  } else if ratio >= 0.5 {
    30.0 + (ratio - 0.5) * 80.0
  } else {
    ratio * 60.0
  };
  clamp_score(score)
}

/// Lower CPA is better. `None` (no conversions) scores 0.
pub fn cpa_score(actual: Option<f64>, target: f64) -> f64 {
  let Some(actual) = actual else {
    return 0.0;
  };
  if !(target > 0.0) || !actual.is_finite() {
    return 0.0;
  }
  let ratio = actual / target;
  let score = if ratio <= 0.5 {
    100.0
  } else if ratio <= 1.0 {
    70.0 + (1.0 - ratio) * 60.0
  } else if ratio <= 2.0 {
    30.0 + (2.0 - ratio) * 40.0
  } else {
    (30.0 - (ratio - 2.0) * 15.0).max(0.0)
  };
  clamp_score(score)
}

pub fn ctr_score(actual: f64, benchmark: f64) -> f64 {
  if !(benchmark > 0.0) {
    return 50.0;
  }
  let ratio = actual / benchmark;
  let score = if ratio >= 2.0 {
    100.0
  } else if ratio >= 1.0 {
    60.0 + (ratio - 1.0) * 40.0
  } else if ratio >= 0.5 {
    20.0 + (ratio - 0.5) * 80.0
  } else {
    ratio * 40.0
  };
  clamp_score(score)
}

pub fn volume_score(clicks: i64, impressions: i64) -> f64 {
  clamp_score(
    saturating_ratio(clicks as f64, VOLUME_CLICKS) * 50.0
      + saturating_ratio(impressions as f64, VOLUME_IMPRESSIONS) * 50.0,
  )
}

/// Missing quality score contributes nothing to the raw score.
pub fn quality_score_points(qs: QualityScore) -> f64 {
  let Some(qs) = qs.value() else {
    return 0.0;
  };
  let score = if qs >= 8.0 {
    100.0
  } else if qs >= 6.0 {
    60.0 + (qs - 6.0) * 20.0
  } else if qs >= 4.0 {
    20.0 + (qs - 4.0) * 20.0
  } else {
    qs * 5.0
  };
  clamp_score(score)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentScores {
  pub conv_rate: f64,
  pub cpa: f64,
  pub ctr: f64,
  pub volume: f64,
  pub quality: f64,
}

impl ComponentScores {
  pub fn for_rollup(rollup: &KeywordRollup, benchmark: &Benchmark) -> Self {
    Self {
      conv_rate: conversion_rate_score(rollup.conv_rate, benchmark.target_conv_rate),
      cpa: cpa_score(rollup.cpa_micros, benchmark.target_cpa_micros),
      ctr: ctr_score(rollup.avg_ctr, benchmark.benchmark_ctr),
      volume: volume_score(rollup.total_clicks, rollup.total_impressions),
      quality: quality_score_points(rollup.avg_quality_score),
    }
  }

  pub fn weighted(&self) -> f64 {
    W_CONV_RATE * clamp_score(self.conv_rate)
      + W_CPA * clamp_score(self.cpa)
      + W_CTR * clamp_score(self.ctr)
      + W_VOLUME * clamp_score(self.volume)
      + W_QUALITY * clamp_score(self.quality)
  }
}

/// Weighted components times confidence, in [0, 100].
pub fn combine(components: &ComponentScores, confidence: f64) -> f64 {
  let confidence = if confidence.is_finite() {
    confidence.clamp(0.0, 1.0)
  } else {
    0.0
  };
  clamp_score(round_to(components.weighted() * confidence, 3))
}

/// Base mapping from score, then the first matching override.
pub fn categorize(
  health_score: f64,
  rollup: &KeywordRollup,
  benchmark: &Benchmark,
) -> (HealthCategory, RecommendedAction, i32) {
  let (mut category, mut action, mut priority) = if health_score >= 80.0 {
    (HealthCategory::Excellent, RecommendedAction::IncreaseBid, 1)
  } else if health_score >= 60.0 {
    (HealthCategory::Good, RecommendedAction::Monitor, 3)
  } else if health_score >= 40.0 {
    (HealthCategory::Warning, RecommendedAction::Optimize, 2)
  } else {
    (HealthCategory::Critical, RecommendedAction::DecreaseBid, 1)
  };

  let spend = rollup.total_cost_micros as f64;
  let efficient = rollup.cpa_micros.is_some_and(|cpa| cpa <= benchmark.target_cpa_micros * 0.7);

  if rollup.total_conversions <= 0.0 && spend > benchmark.target_cpa_micros {
    category = HealthCategory::Critical;
    action = RecommendedAction::PauseKeyword;
    priority = 1;
  } else if rollup.conv_rate >= benchmark.target_conv_rate * 1.5 && efficient {
    category = HealthCategory::Excellent;
    action = RecommendedAction::IncreaseBid;
    priority = 1;
  } else if rollup.avg_quality_score.or_neutral() < benchmark.min_quality_score {
    if matches!(category, HealthCategory::Excellent | HealthCategory::Good) {
      category = HealthCategory::Warning;
    }
    action = RecommendedAction::ImproveQuality;
    priority = 2;
  }

  (category, action, priority)
}

pub fn score_keyword(rollup: &KeywordRollup, benchmark: &Benchmark, calculated_at: DateTime<Utc>) -> HealthScore {
  let components = ComponentScores::for_rollup(rollup, benchmark);
  let confidence = calculate_confidence(rollup.total_clicks, rollup.days_active, rollup.total_impressions);
  let health_score = combine(&components, confidence);
  let (category, recommended_action, action_priority) = categorize(health_score, rollup, benchmark);

  HealthScore {
    customer_id: rollup.customer_id.clone(),
    campaign_id: rollup.campaign_id.clone(),
    ad_group_id: rollup.ad_group_id.clone(),
    keyword_text: rollup.keyword_text.clone(),
    health_score,
    conv_rate_score: round_to(components.conv_rate, 3),
    cpa_score: round_to(components.cpa, 3),
    ctr_score: round_to(components.ctr, 3),
    volume_score: round_to(components.volume, 3),
    quality_score_points: round_to(components.quality, 3),
    confidence,
    category,
    recommended_action,
    action_priority,
    period_start: rollup.period_start,
    period_end: rollup.period_end,
    total_spend_micros: rollup.total_cost_micros,
    total_conversions: rollup.total_conversions,
    total_clicks: rollup.total_clicks,
    calculated_at,
  }
}
