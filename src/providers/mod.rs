use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::PlatformError;
use crate::models::MetricRecord;

pub mod google_ads;
pub mod google_ads_auth;

/// Keyword-level reads and mutations against the ads platform.
#[async_trait]
pub trait AdsPlatform: Send + Sync {
  /// Criterion id of a keyword inside an ad group, if the keyword exists and is not removed.
  async fn lookup_criterion_id(
    &self,
    customer_id: &str,
    ad_group_id: &str,
    keyword_text: &str,
  ) -> Result<Option<String>, PlatformError>;

  /// Sets the keyword's max CPC. Returns the platform's resource name for the mutated criterion.
  async fn update_keyword_bid(
    &self,
    customer_id: &str,
    ad_group_id: &str,
    criterion_id: &str,
    new_bid_micros: i64,
  ) -> Result<String, PlatformError>;

  async fn pause_keyword(&self, customer_id: &str, ad_group_id: &str, criterion_id: &str) -> Result<String, PlatformError>;

  /// Daily keyword rows for `start..=end`.
  async fn fetch_keyword_metrics(
    &self,
    customer_id: &str,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<MetricRecord>, PlatformError>;
}
