use std::sync::Arc;

use crate::currency::{CurrencyResolver, CurrencySource};
use crate::db::MySqlStore;
use crate::error::EngineResult;
use crate::providers::google_ads::GoogleAdsClient;
use crate::providers::AdsPlatform;
use crate::recommendations::RecommendationConfig;
use crate::store::KeywordStore;

/// Entry point for scoring, recommendations, execution and rollback.
/// Scoring lives in `health_service`, execution in `action_executor`, undo in `rollback`.
pub struct Autopilot {
  pub(crate) store: Arc<dyn KeywordStore>,
  pub(crate) platform: Option<Arc<dyn AdsPlatform>>,
  pub(crate) currency: CurrencyResolver,
  pub(crate) recommendation: RecommendationConfig,
}

impl Autopilot {
  pub fn new(store: Arc<dyn KeywordStore>) -> Self {
    Self {
      store,
      platform: None,
      currency: CurrencyResolver::with_default_ttl(None),
      recommendation: RecommendationConfig::default(),
    }
  }

  /// MySQL-backed instance. Google Ads is attached when its credentials are present;
  /// a failed token refresh is logged and the instance runs without a platform.
  pub async fn from_env() -> EngineResult<Self> {
    let store = MySqlStore::from_env().await?;
    let autopilot = Self::new(Arc::new(store));
    match GoogleAdsClient::from_env().await {
      Ok(Some(client)) => {
        let client = Arc::new(client);
        Ok(autopilot.with_platform(client.clone()).with_currency_source(client))
      }
      Ok(None) => Ok(autopilot),
      Err(e) => {
        tracing::warn!(error = %e, "google ads client unavailable");
        Ok(autopilot)
      }
    }
  }

  pub fn with_platform(mut self, platform: Arc<dyn AdsPlatform>) -> Self {
    self.platform = Some(platform);
    self
  }

  pub fn with_currency_source(mut self, source: Arc<dyn CurrencySource>) -> Self {
    self.currency = CurrencyResolver::with_default_ttl(Some(source));
    self
  }

  pub fn with_recommendation_config(mut self, cfg: RecommendationConfig) -> Self {
    self.recommendation = cfg;
    self
  }

  pub fn store(&self) -> &Arc<dyn KeywordStore> {
    &self.store
  }

  pub fn has_platform(&self) -> bool {
    self.platform.is_some()
  }

  pub fn currency(&self) -> &CurrencyResolver {
    &self.currency
  }
}
