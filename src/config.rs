use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Safety bounds for automated bid changes. Money is USD-equivalent micros and is scaled
/// per account currency before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailsConfig {
  pub max_bid_change_percent: f64,
  pub min_bid_micros: i64,
  pub max_bid_micros: i64,
  pub min_bid_delta_micros: i64,
  pub conversion_exclusion_days: i64,
  pub min_health_for_increase: f64,
}

impl Default for GuardrailsConfig {
  fn default() -> Self {
    Self {
      max_bid_change_percent: 30.0,
      min_bid_micros: 100_000,
      max_bid_micros: 100_000_000,
      min_bid_delta_micros: 50_000,
      conversion_exclusion_days: 7,
      min_health_for_increase: 40.0,
    }
  }
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardrailsConfigPatch {
  #[serde(default)]
  pub max_bid_change_percent: Option<f64>,
  #[serde(default)]
  pub min_bid_micros: Option<i64>,
  #[serde(default)]
  pub max_bid_micros: Option<i64>,
  #[serde(default)]
  pub min_bid_delta_micros: Option<i64>,
  #[serde(default)]
  pub conversion_exclusion_days: Option<i64>,
  #[serde(default)]
  pub min_health_for_increase: Option<f64>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
  let raw = std::env::var(key).ok()?;
  let trimmed = raw.trim();
  if trimmed.is_empty() {
    return None;
  }
  match trimmed.parse::<T>() {
    Ok(v) => Some(v),
    Err(_) => {
      tracing::warn!(key, value = trimmed, "ignoring unparseable guardrail override");
      None
    }
  }
}

impl GuardrailsConfig {
  /// Defaults overridden by `GUARDRAIL_*` variables. An invalid combination falls back to defaults.
  pub fn from_env() -> Self {
    let patch = GuardrailsConfigPatch {
      max_bid_change_percent: env_parse("GUARDRAIL_MAX_BID_CHANGE_PERCENT"),
      min_bid_micros: env_parse("GUARDRAIL_MIN_BID_MICROS"),
      max_bid_micros: env_parse("GUARDRAIL_MAX_BID_MICROS"),
      min_bid_delta_micros: env_parse("GUARDRAIL_MIN_BID_DELTA_MICROS"),
      conversion_exclusion_days: env_parse("GUARDRAIL_CONVERSION_EXCLUSION_DAYS"),
      min_health_for_increase: env_parse("GUARDRAIL_MIN_HEALTH_FOR_INCREASE"),
    };
    match Self::default().apply(&patch) {
      Ok(cfg) => cfg,
      Err(e) => {
        tracing::warn!(error = %e, "invalid guardrail overrides in environment, using defaults");
        Self::default()
      }
    }
  }

  pub fn validate(&self) -> EngineResult<()> {
    if !(self.max_bid_change_percent.is_finite()
      && self.max_bid_change_percent > 0.0
      && self.max_bid_change_percent <= 100.0)
    {
      return Err(EngineError::InvalidConfig(format!(
        "max_bid_change_percent must be in (0, 100], got {}",
        self.max_bid_change_percent
      )));
    }
    if self.min_bid_micros <= 0 {
      return Err(EngineError::InvalidConfig(format!(
        "min_bid_micros must be positive, got {}",
        self.min_bid_micros
      )));
    }
    if self.max_bid_micros <= self.min_bid_micros {
      return Err(EngineError::InvalidConfig(format!(
        "max_bid_micros ({}) must exceed min_bid_micros ({})",
        self.max_bid_micros, self.min_bid_micros
      )));
    }
    if self.min_bid_delta_micros < 0 {
      return Err(EngineError::InvalidConfig(format!(
        "min_bid_delta_micros must not be negative, got {}",
        self.min_bid_delta_micros
      )));
    }
    if !(0..=90).contains(&self.conversion_exclusion_days) {
      return Err(EngineError::InvalidConfig(format!(
        "conversion_exclusion_days must be in [0, 90], got {}",
        self.conversion_exclusion_days
      )));
    }
    if !(0.0..=100.0).contains(&self.min_health_for_increase) {
      return Err(EngineError::InvalidConfig(format!(
        "min_health_for_increase must be in [0, 100], got {}",
        self.min_health_for_increase
      )));
    }
    Ok(())
  }

  /// Returns the patched config, or an error leaving `self` untouched.
  pub fn apply(&self, patch: &GuardrailsConfigPatch) -> EngineResult<Self> {
    let mut next = self.clone();
    if let Some(v) = patch.max_bid_change_percent {
      next.max_bid_change_percent = v;
    }
    if let Some(v) = patch.min_bid_micros {
      next.min_bid_micros = v;
    }
    if let Some(v) = patch.max_bid_micros {
      next.max_bid_micros = v;
    }
    if let Some(v) = patch.min_bid_delta_micros {
      next.min_bid_delta_micros = v;
    }
    if let Some(v) = patch.conversion_exclusion_days {
      next.conversion_exclusion_days = v;
    }
    if let Some(v) = patch.min_health_for_increase {
      next.min_health_for_increase = v;
    }
    next.validate()?;
    Ok(next)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let cfg = GuardrailsConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.max_bid_change_percent, 30.0);
    assert_eq!(cfg.conversion_exclusion_days, 7);
  }

  #[test]
  fn patch_updates_only_given_fields() {
    let cfg = GuardrailsConfig::default();
    let patch: GuardrailsConfigPatch = serde_json::from_str(r#"{"max_bid_change_percent": 20}"#).unwrap();
    let next = cfg.apply(&patch).unwrap();
    assert_eq!(next.max_bid_change_percent, 20.0);
    assert_eq!(next.min_bid_micros, cfg.min_bid_micros);
  }

  #[test]
  fn invalid_patch_is_rejected() {
    let cfg = GuardrailsConfig::default();
    let patch = GuardrailsConfigPatch {
      max_bid_micros: Some(50_000),
      ..Default::default()
    };
    assert!(matches!(cfg.apply(&patch), Err(EngineError::InvalidConfig(_))));

    let patch = GuardrailsConfigPatch {
      max_bid_change_percent: Some(f64::NAN),
      ..Default::default()
    };
    assert!(cfg.apply(&patch).is_err());
  }

  #[test]
  fn unknown_patch_keys_fail_to_parse() {
    let parsed = serde_json::from_str::<GuardrailsConfigPatch>(r#"{"max_bid": 3}"#);
    assert!(parsed.is_err());
  }
}
