use std::collections::HashMap;

use serde::Serialize;

use crate::health_score::round_to;
use crate::metric_rollup::KeywordRollup;
use crate::models::{ActionType, ChangeRequest, HealthCategory, HealthScore, RecommendedAction, RiskLevel};

#[derive(Debug, Clone)]
pub struct RecommendationConfig {
  pub quick_win_limit: usize,
  pub vampire_min_spend_micros: i64,
  pub vampire_min_clicks: i64,
  pub saturation_percentile: f64,
  pub bid_recommendation_limit: usize,
  pub min_change_percent: f64,
  pub high_spend_micros: i64,
}

impl Default for RecommendationConfig {
  fn default() -> Self {
    Self {
      quick_win_limit: 20,
      vampire_min_spend_micros: 200_000_000,
      vampire_min_clicks: 20,
      saturation_percentile: 90.0,
      bid_recommendation_limit: 50,
      min_change_percent: 5.0,
      high_spend_micros: 500_000_000,
    }
  }
}

type KeywordKey = (String, String, String);

fn score_key(s: &HealthScore) -> KeywordKey {
  (s.campaign_id.clone(), s.ad_group_id.clone(), s.keyword_text.clone())
}

/// Newest snapshot per keyword, ordered by (campaign, ad group, keyword).
pub fn latest_scores(scores: &[HealthScore]) -> Vec<HealthScore> {
  let mut latest: HashMap<KeywordKey, &HealthScore> = HashMap::new();
  for s in scores {
    latest
      .entry(score_key(s))
      .and_modify(|cur| {
        if s.calculated_at > cur.calculated_at {
          *cur = s;
        }
      })
      .or_insert(s);
  }
  let mut out: Vec<HealthScore> = latest.into_values().cloned().collect();
  out.sort_by(|a, b| score_key(a).cmp(&score_key(b)));
  out
}

pub fn quick_wins(scores: &[HealthScore], limit: usize) -> Vec<HealthScore> {
  let mut out: Vec<HealthScore> = scores
    .iter()
    .filter(|s| {
      (40.0..80.0).contains(&s.health_score)
        && s.action_priority <= 2
        && matches!(
          s.recommended_action,
          RecommendedAction::IncreaseBid | RecommendedAction::Optimize | RecommendedAction::ImproveQuality
        )
    })
    .cloned()
    .collect();
  out.sort_by(|a, b| {
    let ia = a.health_score * a.total_spend_micros as f64;
    let ib = b.health_score * b.total_spend_micros as f64;
    ib.total_cmp(&ia)
  });
  out.truncate(limit);
  out
}

pub fn vampire_keywords(scores: &[HealthScore], min_spend_micros: i64, min_clicks: i64) -> Vec<HealthScore> {
  let mut out: Vec<HealthScore> = scores
    .iter()
    .filter(|s| s.total_conversions <= 0.0 && s.total_spend_micros >= min_spend_micros && s.total_clicks >= min_clicks)
    .cloned()
    .collect();
  out.sort_by(|a, b| b.total_spend_micros.cmp(&a.total_spend_micros));
  out
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
  if values.is_empty() {
    return None;
  }
  let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
  if sorted.is_empty() {
    return None;
  }
  sorted.sort_by(|a, b| a.total_cmp(b));
  let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
  let lo = rank.floor() as usize;
  let hi = rank.ceil() as usize;
  Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

pub fn saturation_alerts(scores: &[HealthScore], pct: f64) -> Vec<HealthScore> {
  let clicks: Vec<f64> = scores.iter().map(|s| s.total_clicks as f64).collect();
  let Some(threshold) = percentile(&clicks, pct) else {
    return Vec::new();
  };
  let mut out: Vec<HealthScore> = scores
    .iter()
    .filter(|s| {
      s.total_clicks as f64 >= threshold
        && s.ctr_score < 40.0
        && matches!(s.category, HealthCategory::Warning | HealthCategory::Critical)
    })
    .cloned()
    .collect();
  out.sort_by(|a, b| b.total_clicks.cmp(&a.total_clicks));
  out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BidRecommendation {
  pub customer_id: String,
  pub campaign_id: String,
  pub ad_group_id: String,
  pub criterion_id: Option<String>,
  pub keyword_text: String,
  pub current_bid_micros: i64,
  pub recommended_bid_micros: i64,
  pub change_percent: f64,
  pub health_score: f64,
  pub justification: String,
  pub risk_level: RiskLevel,
}

impl BidRecommendation {
  pub fn to_change_request(&self) -> ChangeRequest {
    ChangeRequest {
      customer_id: self.customer_id.clone(),
      campaign_id: self.campaign_id.clone(),
      ad_group_id: self.ad_group_id.clone(),
      criterion_id: self.criterion_id.clone(),
      keyword_text: self.keyword_text.clone(),
      action_type: ActionType::BidChange,
      current_bid_micros: self.current_bid_micros,
      proposed_bid_micros: self.recommended_bid_micros,
      change_percent: self.change_percent,
      justification: self.justification.clone(),
      risk_level: self.risk_level,
      health_score: self.health_score,
    }
  }
}

/// 1.1..1.3 for strong keywords marked for increase, 0.9..0.7 for weak ones marked for decrease.
pub fn bid_multiplier(score: &HealthScore) -> f64 {
  match score.recommended_action {
    RecommendedAction::IncreaseBid if score.health_score >= 70.0 => {
      (1.1 + 0.01 * (score.health_score - 70.0)).min(1.3)
    }
    RecommendedAction::DecreaseBid if score.health_score < 40.0 => {
      (0.9 - 0.01 * (40.0 - score.health_score)).max(0.7)
    }
    _ => 1.0,
  }
}

pub fn bid_justification(score: &HealthScore, change_percent: f64) -> String {
  if change_percent > 0.0 {
    format!(
      "Increase bid {:.1}% - Health Score: {:.1}, Conv Rate: {:.1}, CPA: {:.1}",
      change_percent.abs(),
      score.health_score,
      score.conv_rate_score,
      score.cpa_score
    )
  } else {
    format!(
      "Decrease bid {:.1}% - Health Score: {:.1}, low performance detected",
      change_percent.abs(),
      score.health_score
    )
  }
}

pub fn assess_bid_risk(score: &HealthScore, change_percent: f64, high_spend_micros: i64) -> RiskLevel {
  let factors = [
    score.total_spend_micros > high_spend_micros,
    score.confidence < 0.7,
    change_percent.abs() > 20.0,
  ]
  .iter()
  .filter(|f| **f)
  .count();
  match factors {
    0 => RiskLevel::Low,
    1 => RiskLevel::Medium,
    _ => RiskLevel::High,
  }
}

/// Bid changes for the latest scores of keywords whose current bid is known.
pub fn bid_recommendations(
  scores: &[HealthScore],
  rollups: &[KeywordRollup],
  cfg: &RecommendationConfig,
) -> Vec<BidRecommendation> {
  let by_key: HashMap<(&str, &str, &str), &KeywordRollup> = rollups.iter().map(|r| (r.key(), r)).collect();

  let mut out = Vec::new();
  for score in latest_scores(scores) {
    let Some(rollup) = by_key.get(&(
      score.campaign_id.as_str(),
      score.ad_group_id.as_str(),
      score.keyword_text.as_str(),
    )) else {
      continue;
    };
    let Some(current) = rollup.current_bid_micros() else {
      continue;
    };

    let multiplier = bid_multiplier(&score);
    if ((multiplier - 1.0) * 100.0).abs() < cfg.min_change_percent {
      continue;
    }

    // Round toward the current bid so the realised change never exceeds the multiplier.
    let raw = current as f64 * multiplier;
    let recommended = (if multiplier > 1.0 { raw.floor() } else { raw.ceil() }) as i64;
    if recommended <= 0 || recommended == current {
      continue;
    }
    let change_percent = round_to((recommended - current) as f64 * 100.0 / current as f64, 1);

    out.push(BidRecommendation {
      customer_id: score.customer_id.clone(),
      campaign_id: score.campaign_id.clone(),
      ad_group_id: score.ad_group_id.clone(),
      criterion_id: rollup.criterion_id.clone(),
      keyword_text: score.keyword_text.clone(),
      current_bid_micros: current,
      recommended_bid_micros: recommended,
      change_percent,
      health_score: score.health_score,
      justification: bid_justification(&score, change_percent),
      risk_level: assess_bid_risk(&score, change_percent, cfg.high_spend_micros),
    });
  }

  out.sort_by(|a, b| b.change_percent.abs().total_cmp(&a.change_percent.abs()));
  out.truncate(cfg.bid_recommendation_limit);
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::health_score::tests::rollup;
  use chrono::{Duration, NaiveDate, Utc};

  fn score(keyword: &str, health: f64, action: RecommendedAction, priority: i32) -> HealthScore {
    HealthScore {
      customer_id: "1234567890".to_string(),
      campaign_id: "111".to_string(),
      ad_group_id: "222".to_string(),
      keyword_text: keyword.to_string(),
      health_score: health,
      conv_rate_score: 50.0,
      cpa_score: 50.0,
      ctr_score: 50.0,
      volume_score: 50.0,
      quality_score_points: 60.0,
      confidence: 0.9,
      category: if health >= 80.0 {
        HealthCategory::Excellent
      } else if health >= 60.0 {
        HealthCategory::Good
      } else if health >= 40.0 {
        HealthCategory::Warning
      } else {
        HealthCategory::Critical
      },
      recommended_action: action,
      action_priority: priority,
      period_start: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
      period_end: NaiveDate::from_ymd_opt(2026, 3, 30).unwrap(),
      total_spend_micros: 100_000,
      total_conversions: 2.0,
      total_clicks: 50,
      calculated_at: Utc::now(),
    }
  }

  #[test]
  fn quick_wins_filter_and_rank_by_impact() {
    let mut a = score("a", 55.0, RecommendedAction::Optimize, 2);
    a.total_spend_micros = 10_000;
    let mut b = score("b", 45.0, RecommendedAction::ImproveQuality, 2);
    b.total_spend_micros = 90_000;
    let c = score("c", 85.0, RecommendedAction::IncreaseBid, 1);
    let d = score("d", 65.0, RecommendedAction::Monitor, 3);
    let e = score("e", 79.9, RecommendedAction::IncreaseBid, 1);

    let wins = quick_wins(&[a, b, c, d, e], 20);
    let names: Vec<&str> = wins.iter().map(|s| s.keyword_text.as_str()).collect();
    assert_eq!(names, vec!["e", "b", "a"]);

    let wins = quick_wins(&wins, 1);
    assert_eq!(wins.len(), 1);
  }

  #[test]
  fn vampires_need_spend_clicks_and_no_conversions() {
    let mut a = score("a", 10.0, RecommendedAction::PauseKeyword, 1);
    a.total_conversions = 0.0;
    a.total_spend_micros = 300_000_000;
    a.total_clicks = 60;
    let mut b = score("b", 10.0, RecommendedAction::PauseKeyword, 1);
    b.total_conversions = 0.0;
    b.total_spend_micros = 900_000_000;
    b.total_clicks = 25;
    let mut few_clicks = score("c", 10.0, RecommendedAction::PauseKeyword, 1);
    few_clicks.total_conversions = 0.0;
    few_clicks.total_spend_micros = 900_000_000;
    few_clicks.total_clicks = 5;
    let mut cheap = score("e", 10.0, RecommendedAction::PauseKeyword, 1);
    cheap.total_conversions = 0.0;
    cheap.total_spend_micros = 150_000_000;
    cheap.total_clicks = 60;
    let converting = score("d", 10.0, RecommendedAction::DecreaseBid, 1);

    let cfg = RecommendationConfig::default();
    let out = vampire_keywords(&[a, b, few_clicks, cheap, converting], cfg.vampire_min_spend_micros, cfg.vampire_min_clicks);
    let names: Vec<&str> = out.iter().map(|s| s.keyword_text.as_str()).collect();
    assert_eq!(names, vec!["b", "a"]);
  }

  #[test]
  fn percentile_interpolates_linearly() {
    let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
    assert!((percentile(&values, 90.0).unwrap() - 9.1).abs() < 1e-9);
    assert_eq!(percentile(&values, 100.0), Some(10.0));
    assert_eq!(percentile(&values, 0.0), Some(1.0));
    assert_eq!(percentile(&[], 90.0), None);
  }

  #[test]
  fn saturation_flags_high_click_low_ctr_keywords() {
    let mut scores: Vec<HealthScore> = (0..9)
      .map(|i| {
        let mut s = score(&format!("k{i}"), 50.0, RecommendedAction::Optimize, 2);
        s.total_clicks = 10 + i;
        s
      })
      .collect();
    let mut hot = score("hot", 35.0, RecommendedAction::DecreaseBid, 1);
    hot.total_clicks = 1_000;
    hot.ctr_score = 20.0;
    scores.push(hot);
    let mut healthy = score("healthy", 90.0, RecommendedAction::IncreaseBid, 1);
    healthy.total_clicks = 2_000;
    healthy.ctr_score = 10.0;
    scores.push(healthy);

    let out = saturation_alerts(&scores, 90.0);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].keyword_text, "hot");
  }

  #[test]
  fn latest_scores_keeps_newest_snapshot() {
    let mut old = score("a", 30.0, RecommendedAction::DecreaseBid, 1);
    old.calculated_at = Utc::now() - Duration::days(1);
    let new = score("a", 75.0, RecommendedAction::IncreaseBid, 1);
    let out = latest_scores(&[old, new]);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].health_score, 75.0);
  }

  #[test]
  fn multiplier_bounds() {
    assert!((bid_multiplier(&score("a", 70.0, RecommendedAction::IncreaseBid, 1)) - 1.1).abs() < 1e-12);
    assert!((bid_multiplier(&score("a", 100.0, RecommendedAction::IncreaseBid, 1)) - 1.3).abs() < 1e-12);
    assert!((bid_multiplier(&score("a", 0.0, RecommendedAction::DecreaseBid, 1)) - 0.7).abs() < 1e-12);
    assert!((bid_multiplier(&score("a", 39.0, RecommendedAction::DecreaseBid, 1)) - 0.89).abs() < 1e-12);
    assert_eq!(bid_multiplier(&score("a", 65.0, RecommendedAction::IncreaseBid, 1)), 1.0);
    assert_eq!(bid_multiplier(&score("a", 65.0, RecommendedAction::Monitor, 3)), 1.0);
  }

  #[test]
  fn bid_risk_counts_factors() {
    let high_spend = RecommendationConfig::default().high_spend_micros;
    let base = |spend: i64, confidence: f64| {
      let mut s = score("a", 75.0, RecommendedAction::IncreaseBid, 1);
      s.total_spend_micros = spend;
      s.confidence = confidence;
      s
    };
    let cases = [
      // (spend micros, confidence, change %, expected)
      (100_000_000, 0.9, 10.0, RiskLevel::Low),
      (100_000_000, 0.7, 20.0, RiskLevel::Low),
      (500_000_000, 0.9, -20.0, RiskLevel::Low),
      (600_000, 0.9, 10.0, RiskLevel::Low),
      (600_000_000, 0.9, 10.0, RiskLevel::Medium),
      (100_000_000, 0.69, 10.0, RiskLevel::Medium),
      (100_000_000, 0.9, 20.1, RiskLevel::Medium),
      (100_000_000, 0.9, -25.0, RiskLevel::Medium),
      (600_000_000, 0.5, 10.0, RiskLevel::High),
      (100_000_000, 0.5, -25.0, RiskLevel::High),
      (600_000_000, 0.5, 25.0, RiskLevel::High),
    ];
    for (spend, confidence, change, expected) in cases {
      assert_eq!(
        assess_bid_risk(&base(spend, confidence), change, high_spend),
        expected,
        "spend={spend} confidence={confidence} change={change}"
      );
    }
  }

  #[test]
  fn bid_recommendations_use_current_bid_and_rank_by_change() {
    let mut r_up = rollup();
    r_up.keyword_text = "up".to_string();
    r_up.latest_cpc_bid_micros = Some(1_000_000);
    let mut r_down = rollup();
    r_down.keyword_text = "down".to_string();
    r_down.latest_cpc_bid_micros = Some(2_000_000);
    let mut r_none = rollup();
    r_none.keyword_text = "flat".to_string();

    let mut up = score("up", 80.0, RecommendedAction::IncreaseBid, 1);
    up.confidence = 0.95;
    let mut down = score("down", 10.0, RecommendedAction::DecreaseBid, 1);
    down.total_spend_micros = 900_000_000;
    let flat = score("flat", 65.0, RecommendedAction::Monitor, 3);
    let orphan = score("orphan", 90.0, RecommendedAction::IncreaseBid, 1);

    let recs = bid_recommendations(&[up, down, flat, orphan], &[r_up, r_down, r_none], &RecommendationConfig::default());
    assert_eq!(recs.len(), 2);

    assert_eq!(recs[0].keyword_text, "down");
    assert_eq!(recs[0].recommended_bid_micros, 1_400_000);
    assert_eq!(recs[0].change_percent, -30.0);
    assert_eq!(recs[0].risk_level, RiskLevel::High);
    assert!(recs[0].justification.starts_with("Decrease bid 30.0%"));

    assert_eq!(recs[1].keyword_text, "up");
    assert_eq!(recs[1].recommended_bid_micros, 1_200_000);
    assert_eq!(recs[1].change_percent, 20.0);
    assert_eq!(recs[1].risk_level, RiskLevel::Low);
    assert!(recs[1].justification.starts_with("Increase bid 20.0% - Health Score: 80.0"));

    let req = recs[1].to_change_request();
    assert_eq!(req.criterion_id.as_deref(), Some("333"));
    assert!(req.check_contract().is_ok());
  }
}
