use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::models::{MetricRecord, QualityScore};

/// Per-keyword totals over a lookback window. Computed fresh each run, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordRollup {
  pub customer_id: String,
  pub campaign_id: String,
  pub ad_group_id: String,
  pub keyword_text: String,
  pub criterion_id: Option<String>,
  pub match_type: String,
  pub total_impressions: i64,
  pub total_clicks: i64,
  pub total_cost_micros: i64,
  pub total_conversions: f64,
  pub total_conversion_value: f64,
  pub avg_ctr: f64,
  pub avg_cpc_micros: f64,
  pub avg_quality_score: QualityScore,
  pub days_active: i64,
  pub record_count: i64,
  pub conv_rate: f64,
  /// `None` when the keyword has no conversions.
  pub cpa_micros: Option<f64>,
  pub latest_cpc_bid_micros: Option<i64>,
  pub period_start: NaiveDate,
  pub period_end: NaiveDate,
}

impl KeywordRollup {
  /// Explicit max CPC when known, otherwise the average CPC paid.
  pub fn current_bid_micros(&self) -> Option<i64> {
    if let Some(bid) = self.latest_cpc_bid_micros.filter(|b| *b > 0) {
      return Some(bid);
    }
    let avg = self.avg_cpc_micros.round();
    if avg.is_finite() && avg > 0.0 {
      Some(avg as i64)
    } else {
      None
    }
  }

  pub fn key(&self) -> (&str, &str, &str) {
    (&self.campaign_id, &self.ad_group_id, &self.keyword_text)
  }
}

#[derive(Default)]
struct Acc {
  customer_id: String,
  criterion_id: Option<String>,
  match_type: String,
  impressions: i64,
  clicks: i64,
  cost_micros: i64,
  conversions: f64,
  conversion_value: f64,
  ctr_sum: f64,
  cpc_sum: f64,
  qs_sum: f64,
  qs_count: i64,
  dates: BTreeSet<NaiveDate>,
  records: i64,
  latest_bid: Option<(NaiveDate, i64)>,
}

fn finite_or_zero(v: f64) -> f64 {
  if v.is_finite() {
    v
  } else {
    0.0
  }
}

/// Groups daily records by (campaign, ad group, keyword). Output is ordered by that key.
pub fn aggregate_metrics(records: &[MetricRecord]) -> Vec<KeywordRollup> {
  let mut groups: BTreeMap<(String, String, String), Acc> = BTreeMap::new();

  for r in records {
    let acc = groups
      .entry((r.campaign_id.clone(), r.ad_group_id.clone(), r.keyword_text.clone()))
      .or_default();

    if acc.records == 0 {
      acc.customer_id = r.customer_id.clone();
      acc.match_type = r.match_type.clone();
    }
    if let Some(crit) = r.criterion_id.as_ref().filter(|c| !c.is_empty()) {
      acc.criterion_id = Some(crit.clone());
    }

    acc.impressions += r.impressions.max(0);
    acc.clicks += r.clicks.max(0);
    acc.cost_micros += r.cost_micros.max(0);
    acc.conversions += finite_or_zero(r.conversions).max(0.0);
    acc.conversion_value += finite_or_zero(r.conversion_value).max(0.0);
    acc.ctr_sum += finite_or_zero(r.ctr);
    acc.cpc_sum += r.avg_cpc_micros as f64;
    if let Some(qs) = r.quality_score.value() {
      acc.qs_sum += qs;
      acc.qs_count += 1;
    }
    acc.dates.insert(r.date);
    acc.records += 1;

    if let Some(bid) = r.cpc_bid_micros.filter(|b| *b > 0) {
      match acc.latest_bid {
        Some((dt, _)) if dt > r.date => {}
        _ => acc.latest_bid = Some((r.date, bid)),
      }
    }
  }

  groups
    .into_iter()
    .filter_map(|((campaign_id, ad_group_id, keyword_text), acc)| {
      let period_start = *acc.dates.iter().next()?;
      let period_end = *acc.dates.iter().next_back()?;
      let n = acc.records as f64;

      let conv_rate = if acc.clicks > 0 {
        acc.conversions / acc.clicks as f64
      } else {
        0.0
      };
      let cpa_micros = if acc.conversions > 0.0 {
        Some(acc.cost_micros as f64 / acc.conversions)
      } else {
        None
      };
      let avg_quality_score = if acc.qs_count > 0 {
        QualityScore::from_raw(Some(acc.qs_sum / acc.qs_count as f64))
      } else {
        QualityScore::Missing
      };

      Some(KeywordRollup {
        customer_id: acc.customer_id,
        campaign_id,
        ad_group_id,
        keyword_text,
        criterion_id: acc.criterion_id,
        match_type: acc.match_type,
        total_impressions: acc.impressions,
        total_clicks: acc.clicks,
        total_cost_micros: acc.cost_micros,
        total_conversions: acc.conversions,
        total_conversion_value: acc.conversion_value,
        avg_ctr: acc.ctr_sum / n,
        avg_cpc_micros: acc.cpc_sum / n,
        avg_quality_score,
        days_active: acc.dates.len() as i64,
        record_count: acc.records,
        conv_rate,
        cpa_micros,
        latest_cpc_bid_micros: acc.latest_bid.map(|(_, b)| b),
        period_start,
        period_end,
      })
    })
    .collect()
}
