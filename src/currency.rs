use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::EngineResult;

pub const GENERIC_MIN_BID_MICROS: i64 = 100_000;
pub const DEFAULT_CURRENCY: &str = "USD";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// (ISO code, units of the currency per USD used to scale USD-denominated limits).
const CURRENCY_FACTORS: &[(&str, i64)] = &[
  ("USD", 1),
  ("EUR", 1),
  ("GBP", 1),
  ("COP", 4_000),
  ("MXN", 20),
  ("BRL", 5),
  ("ARS", 1_000),
  ("CLP", 1_000),
  ("PEN", 5),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyFloor {
  pub code: String,
  pub min_bid_micros: i64,
  pub usd_factor: i64,
}

impl CurrencyFloor {
  /// Scales a USD-equivalent amount into this currency.
  pub fn scale(&self, usd_micros: i64) -> i64 {
    usd_micros.saturating_mul(self.usd_factor)
  }
}

/// Unknown codes get the generic floor and no scaling.
pub fn currency_floor(code: &str) -> CurrencyFloor {
  let code = code.trim().to_ascii_uppercase();
  let factor = CURRENCY_FACTORS
    .iter()
    .find(|(c, _)| *c == code)
    .map(|(_, f)| *f);
  match factor {
    Some(usd_factor) => CurrencyFloor {
      min_bid_micros: GENERIC_MIN_BID_MICROS.saturating_mul(usd_factor),
      code,
      usd_factor,
    },
    None => CurrencyFloor {
      code,
      min_bid_micros: GENERIC_MIN_BID_MICROS,
      usd_factor: 1,
    },
  }
}

#[async_trait]
pub trait CurrencySource: Send + Sync {
  async fn get_account_currency(&self, customer_id: &str) -> EngineResult<String>;
}

/// Per-account currency lookups with a TTL cache owned by the resolver.
pub struct CurrencyResolver {
  source: Option<Arc<dyn CurrencySource>>,
  ttl: Duration,
  cache: Mutex<HashMap<String, (String, Instant)>>,
}

impl CurrencyResolver {
  pub fn new(source: Option<Arc<dyn CurrencySource>>, ttl: Duration) -> Self {
    Self {
      source,
      ttl,
      cache: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_default_ttl(source: Option<Arc<dyn CurrencySource>>) -> Self {
    Self::new(source, DEFAULT_CACHE_TTL)
  }

  fn cached(&self, customer_id: &str) -> Option<String> {
    let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
    cache
      .get(customer_id)
      .filter(|(_, at)| at.elapsed() < self.ttl)
      .map(|(code, _)| code.clone())
  }

  /// Currency code for the account; lookup failures fall back to USD and are not cached.
  pub async fn resolve_code(&self, customer_id: &str) -> String {
    if let Some(code) = self.cached(customer_id) {
      return code;
    }
    let Some(source) = self.source.as_ref() else {
      return DEFAULT_CURRENCY.to_string();
    };
    match source.get_account_currency(customer_id).await {
      Ok(code) if !code.trim().is_empty() => {
        let code = code.trim().to_ascii_uppercase();
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(customer_id.to_string(), (code.clone(), Instant::now()));
        code
      }
      Ok(_) => {
        tracing::warn!(customer_id, "empty currency code from ads platform, assuming USD");
        DEFAULT_CURRENCY.to_string()
      }
      Err(e) => {
        tracing::warn!(customer_id, error = %e, "currency lookup failed, assuming USD");
        DEFAULT_CURRENCY.to_string()
      }
    }
  }

  pub async fn resolve(&self, customer_id: &str) -> CurrencyFloor {
    currency_floor(&self.resolve_code(customer_id).await)
  }

  pub fn invalidate(&self, customer_id: &str) {
    let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
    cache.remove(customer_id);
  }

  pub fn clear(&self) {
    let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
    cache.clear();
  }
}
