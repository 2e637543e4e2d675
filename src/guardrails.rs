use thiserror::Error;

use crate::config::GuardrailsConfig;
use crate::currency::CurrencyFloor;
use crate::models::{ActionType, ChangeRequest};

/// Guardrail bounds expressed in the account's own currency.
#[derive(Debug, Clone, PartialEq)]
pub struct BidLimits {
  pub currency: String,
  pub min_bid_micros: i64,
  pub max_bid_micros: i64,
  pub min_delta_micros: i64,
}

impl BidLimits {
  pub fn for_currency(cfg: &GuardrailsConfig, floor: &CurrencyFloor) -> Self {
    Self {
      currency: floor.code.clone(),
      min_bid_micros: floor.scale(cfg.min_bid_micros).max(floor.min_bid_micros),
      max_bid_micros: floor.scale(cfg.max_bid_micros),
      min_delta_micros: floor.scale(cfg.min_bid_delta_micros),
    }
  }
}

#[derive(Debug, Clone)]
pub struct GuardrailContext {
  pub limits: BidLimits,
  pub has_recent_conversions: bool,
}

fn money(micros: &i64, currency: &str) -> String {
  format!("{:.2} {currency}", *micros as f64 / 1_000_000.0)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardrailViolation {
  #[error("bid change of {change_percent:.2}% exceeds the {max_percent}% limit")]
  ChangeTooLarge { change_percent: f64, max_percent: f64 },

  #[error("new bid {} is below the minimum {}", money(.bid_micros, .currency), money(.min_micros, .currency))]
  BelowMinimum {
    bid_micros: i64,
    min_micros: i64,
    currency: String,
  },

  #[error("new bid {} exceeds the maximum {}", money(.bid_micros, .currency), money(.max_micros, .currency))]
  AboveMaximum {
    bid_micros: i64,
    max_micros: i64,
    currency: String,
  },

  #[error("bid change of {} is below the minimum step {}", money(.delta_micros, .currency), money(.min_delta_micros, .currency))]
  ChangeTooSmall {
    delta_micros: i64,
    min_delta_micros: i64,
    currency: String,
  },

  #[error("keyword has conversions in the last {days} days")]
  RecentConversions { days: i64 },

  #[error("health score {health_score:.1} is below {min_health:.1} required to raise the bid")]
  HealthTooLowForIncrease { health_score: f64, min_health: f64 },
}

/// A request that passed every guardrail, or a restorative rollback request.
/// The executor only accepts this type.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedChangeRequest(ChangeRequest);

impl ValidatedChangeRequest {
  pub fn request(&self) -> &ChangeRequest {
    &self.0
  }

  pub fn into_inner(self) -> ChangeRequest {
    self.0
  }

  /// Rollback restores a previously applied bid, so guardrails do not apply.
  pub(crate) fn restorative(req: ChangeRequest) -> Self {
    Self(req)
  }
}

/// Runs the checks in order and reports the first one that fails.
/// Pause requests are only subject to the recent-conversion exclusion.
pub fn validate_change_request(
  req: &ChangeRequest,
  cfg: &GuardrailsConfig,
  ctx: &GuardrailContext,
) -> Result<ValidatedChangeRequest, GuardrailViolation> {
  if req.action_type == ActionType::Pause {
    if ctx.has_recent_conversions {
      return Err(GuardrailViolation::RecentConversions {
        days: cfg.conversion_exclusion_days,
      });
    }
    return Ok(ValidatedChangeRequest(req.clone()));
  }

  // The bids are authoritative; the stated percent only counts when it is larger.
  let change_percent = match req.implied_change_percent() {
    Some(implied) if implied.abs() > req.change_percent.abs() => implied,
    _ => req.change_percent,
  };
  if change_percent.abs() > cfg.max_bid_change_percent {
    return Err(GuardrailViolation::ChangeTooLarge {
      change_percent,
      max_percent: cfg.max_bid_change_percent,
    });
  }

  let limits = &ctx.limits;
  if req.proposed_bid_micros < limits.min_bid_micros {
    return Err(GuardrailViolation::BelowMinimum {
      bid_micros: req.proposed_bid_micros,
      min_micros: limits.min_bid_micros,
      currency: limits.currency.clone(),
    });
  }
  if req.proposed_bid_micros > limits.max_bid_micros {
    return Err(GuardrailViolation::AboveMaximum {
      bid_micros: req.proposed_bid_micros,
      max_micros: limits.max_bid_micros,
      currency: limits.currency.clone(),
    });
  }

  let delta = (req.proposed_bid_micros - req.current_bid_micros).abs();
  if delta < limits.min_delta_micros {
    return Err(GuardrailViolation::ChangeTooSmall {
      delta_micros: delta,
      min_delta_micros: limits.min_delta_micros,
      currency: limits.currency.clone(),
    });
  }

  if ctx.has_recent_conversions {
    return Err(GuardrailViolation::RecentConversions {
      days: cfg.conversion_exclusion_days,
    });
  }

  if req.is_increase() && req.health_score < cfg.min_health_for_increase {
    return Err(GuardrailViolation::HealthTooLowForIncrease {
      health_score: req.health_score,
      min_health: cfg.min_health_for_increase,
    });
  }

  Ok(ValidatedChangeRequest(req.clone()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::currency::currency_floor;

  fn usd_ctx() -> GuardrailContext {
    GuardrailContext {
      limits: BidLimits::for_currency(&GuardrailsConfig::default(), &currency_floor("USD")),
      has_recent_conversions: false,
    }
  }

  fn req(current: i64, proposed: i64, health: f64) -> ChangeRequest {
    ChangeRequest::bid_change("1234567890", "111", "222", "running shoes", current, proposed, health)
  }

  #[test]
  fn limits_scale_with_currency() {
    let cfg = GuardrailsConfig::default();
    let usd = BidLimits::for_currency(&cfg, &currency_floor("USD"));
    assert_eq!(usd.min_bid_micros, 100_000);
    assert_eq!(usd.max_bid_micros, 100_000_000);
    assert_eq!(usd.min_delta_micros, 50_000);

    let cop = BidLimits::for_currency(&cfg, &currency_floor("COP"));
    assert_eq!(cop.min_bid_micros, 400_000_000);
    assert_eq!(cop.max_bid_micros, 400_000_000_000);
    assert_eq!(cop.min_delta_micros, 200_000_000);
  }

  #[test]
  fn thirty_five_percent_increase_hits_the_cap() {
    let err = validate_change_request(&req(1_000_000, 1_350_000, 90.0), &GuardrailsConfig::default(), &usd_ctx())
      .unwrap_err();
    assert!(matches!(err, GuardrailViolation::ChangeTooLarge { .. }));
    assert!(err.to_string().contains("30%"));
  }

  #[test]
  fn cap_boundary_is_inclusive() {
    let cfg = GuardrailsConfig::default();
    assert!(validate_change_request(&req(1_000_000, 1_300_000, 90.0), &cfg, &usd_ctx()).is_ok());

    let mut over = req(1_000_000, 1_300_100, 90.0);
    assert_eq!(over.change_percent, 30.01);
    assert!(matches!(
      validate_change_request(&over, &cfg, &usd_ctx()),
      Err(GuardrailViolation::ChangeTooLarge { .. })
    ));

    // The cap applies whatever the other fields say.
    over.health_score = 100.0;
    over.proposed_bid_micros = 700_000;
    over.change_percent = -30.01;
    assert!(matches!(
      validate_change_request(&over, &cfg, &usd_ctx()),
      Err(GuardrailViolation::ChangeTooLarge { .. })
    ));
  }

  #[test]
  fn cap_uses_the_actual_bid_move() {
    let cfg = GuardrailsConfig::default();
    let mut understated = req(1_000_000, 1_304_900, 90.0);
    understated.change_percent = 30.0;
    let err = validate_change_request(&understated, &cfg, &usd_ctx()).unwrap_err();
    match err {
      GuardrailViolation::ChangeTooLarge { change_percent, .. } => assert!((change_percent - 30.49).abs() < 1e-9),
      other => panic!("unexpected violation: {other:?}"),
    }

    let mut understated_cut = req(1_000_000, 695_000, 10.0);
    understated_cut.change_percent = -30.0;
    assert!(matches!(
      validate_change_request(&understated_cut, &cfg, &usd_ctx()),
      Err(GuardrailViolation::ChangeTooLarge { .. })
    ));
  }

  #[test]
  fn health_boundary_for_increases() {
    let cfg = GuardrailsConfig::default();
    assert!(validate_change_request(&req(1_000_000, 1_100_000, 40.0), &cfg, &usd_ctx()).is_ok());
    assert!(matches!(
      validate_change_request(&req(1_000_000, 1_100_000, 39.9), &cfg, &usd_ctx()),
      Err(GuardrailViolation::HealthTooLowForIncrease { .. })
    ));
    // Decreases are allowed for unhealthy keywords.
    assert!(validate_change_request(&req(1_000_000, 800_000, 5.0), &cfg, &usd_ctx()).is_ok());
  }

  #[test]
  fn absolute_bounds_and_minimum_step() {
    let cfg = GuardrailsConfig::default();
    assert!(matches!(
      validate_change_request(&req(120_000, 90_000, 50.0), &cfg, &usd_ctx()),
      Err(GuardrailViolation::BelowMinimum { .. })
    ));
    assert!(matches!(
      validate_change_request(&req(90_000_000, 110_000_000, 90.0), &cfg, &usd_ctx()),
      Err(GuardrailViolation::AboveMaximum { .. })
    ));
    assert!(matches!(
      validate_change_request(&req(1_000_000, 1_040_000, 90.0), &cfg, &usd_ctx()),
      Err(GuardrailViolation::ChangeTooSmall { .. })
    ));
  }

  #[test]
  fn high_denomination_currency_uses_its_own_floor() {
    let cfg = GuardrailsConfig::default();
    let ctx = GuardrailContext {
      limits: BidLimits::for_currency(&cfg, &currency_floor("COP")),
      has_recent_conversions: false,
    };
    // 300 COP would pass a USD floor but is far below the COP minimum.
    let err = validate_change_request(&req(350_000_000, 300_000_000, 50.0), &cfg, &ctx).unwrap_err();
    assert!(matches!(err, GuardrailViolation::BelowMinimum { .. }));
    assert!(err.to_string().contains("COP"));
  }

  #[test]
  fn recent_conversions_block_changes_and_pauses() {
    let cfg = GuardrailsConfig::default();
    let mut ctx = usd_ctx();
    ctx.has_recent_conversions = true;
    assert!(matches!(
      validate_change_request(&req(1_000_000, 800_000, 20.0), &cfg, &ctx),
      Err(GuardrailViolation::RecentConversions { days: 7 })
    ));

    let pause = ChangeRequest::pause("1234567890", "111", "222", "running shoes", 5.0);
    assert!(validate_change_request(&pause, &cfg, &ctx).is_err());
    assert!(validate_change_request(&pause, &cfg, &usd_ctx()).is_ok());
  }
}
