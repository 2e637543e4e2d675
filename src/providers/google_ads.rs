use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use serde_json::{json, Value};

use crate::currency::CurrencySource;
use crate::error::{EngineError, EngineResult, PlatformError};
use crate::models::{MetricRecord, QualityScore};
use crate::providers::google_ads_auth::{google_ads_oauth_client, refresh_access_token, GOOGLE_TOKEN_URL};
use crate::providers::AdsPlatform;

pub const DEFAULT_API_BASE_URL: &str = "https://googleads.googleapis.com/v17/";
const MAX_SEARCH_PAGES: usize = 20;

#[derive(Debug, Clone)]
pub struct GoogleAdsConfig {
  pub developer_token: String,
  pub client_id: String,
  pub client_secret: String,
  pub refresh_token: String,
  pub login_customer_id: Option<String>,
  pub api_base_url: String,
  pub token_url: String,
}

fn env_trimmed(key: &str) -> Option<String> {
  std::env::var(key)
    .ok()
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
}

impl GoogleAdsConfig {
  /// `None` when no developer token is configured; the engine then runs without a platform.
  pub fn from_env_optional() -> Result<Option<Self>, PlatformError> {
    let Some(developer_token) = env_trimmed("GOOGLE_ADS_DEVELOPER_TOKEN") else {
      return Ok(None);
    };
    let client_id = env_trimmed("GOOGLE_ADS_CLIENT_ID")
      .ok_or_else(|| PlatformError::new(None, "Missing GOOGLE_ADS_CLIENT_ID"))?;
    let client_secret = env_trimmed("GOOGLE_ADS_CLIENT_SECRET")
      .ok_or_else(|| PlatformError::new(None, "Missing GOOGLE_ADS_CLIENT_SECRET"))?;
    let refresh_token = env_trimmed("GOOGLE_ADS_REFRESH_TOKEN")
      .ok_or_else(|| PlatformError::new(None, "Missing GOOGLE_ADS_REFRESH_TOKEN"))?;

    Ok(Some(Self {
      developer_token,
      client_id,
      client_secret,
      refresh_token,
      login_customer_id: env_trimmed("GOOGLE_ADS_LOGIN_CUSTOMER_ID").map(|v| v.replace('-', "")),
      api_base_url: env_trimmed("GOOGLE_ADS_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
      token_url: env_trimmed("GOOGLE_ADS_TOKEN_URL").unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string()),
    }))
  }
}

/// Google Ads REST client holding a short-lived access token.
#[derive(Debug, Clone)]
pub struct GoogleAdsClient {
  base_url: String,
  developer_token: String,
  login_customer_id: Option<String>,
  access_token: String,
}

pub fn normalize_customer_id(customer_id: &str) -> Result<String, PlatformError> {
  let cleaned: String = customer_id.chars().filter(|c| *c != '-' && !c.is_whitespace()).collect();
  if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
    return Err(PlatformError::new(None, format!("invalid customer id: {customer_id:?}")));
  }
  Ok(cleaned)
}

fn numeric_id(kind: &str, value: &str) -> Result<String, PlatformError> {
  let trimmed = value.trim();
  if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
    return Err(PlatformError::new(None, format!("invalid {kind}: {value:?}")));
  }
  Ok(trimmed.to_string())
}

pub fn escape_gaql_string(value: &str) -> String {
  value.replace('\\', "\\\\").replace('\'', "\\'")
}

pub fn criterion_resource_name(customer_id: &str, ad_group_id: &str, criterion_id: &str) -> String {
  format!("customers/{customer_id}/adGroupCriteria/{ad_group_id}~{criterion_id}")
}

fn extract_error_message(body: &[u8]) -> String {
  serde_json::from_slice::<Value>(body)
    .ok()
    .and_then(|v| {
      v.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
    })
    .unwrap_or_else(|| String::from_utf8_lossy(body).to_string())
}

/// int64 fields arrive as JSON strings over REST.
fn json_i64(v: Option<&Value>) -> Option<i64> {
  match v? {
    Value::String(s) => s.parse::<i64>().ok(),
    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
    _ => None,
  }
}

fn json_f64(v: Option<&Value>) -> Option<f64> {
  match v? {
    Value::String(s) => s.parse::<f64>().ok(),
    Value::Number(n) => n.as_f64(),
    _ => None,
  }
}

fn json_str(v: Option<&Value>) -> Option<String> {
  match v? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

pub fn keyword_metrics_query(start: NaiveDate, end: NaiveDate) -> String {
  format!(
    "SELECT campaign.id, ad_group.id, ad_group_criterion.criterion_id, ad_group_criterion.keyword.text, \
     ad_group_criterion.keyword.match_type, ad_group_criterion.status, ad_group_criterion.quality_info.quality_score, \
     ad_group_criterion.cpc_bid_micros, metrics.impressions, metrics.clicks, metrics.cost_micros, metrics.conversions, \
     metrics.conversions_value, metrics.ctr, metrics.average_cpc, segments.date \
     FROM keyword_view \
     WHERE segments.date BETWEEN '{}' AND '{}' AND ad_group_criterion.status != 'REMOVED'",
    start.format("%Y-%m-%d"),
    end.format("%Y-%m-%d")
  )
}

/// Maps one `keyword_view` search row. Rows missing identifiers or the date are dropped.
pub fn parse_metric_row(customer_id: &str, row: &Value) -> Option<MetricRecord> {
  let criterion = row.get("adGroupCriterion");
  let keyword = criterion.and_then(|c| c.get("keyword"));
  let metrics = row.get("metrics");
  let metric = |name: &str| metrics.and_then(|m| m.get(name));

  let date = row
    .get("segments")
    .and_then(|s| s.get("date"))
    .and_then(|d| d.as_str())
    .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())?;

  Some(MetricRecord {
    customer_id: customer_id.to_string(),
    campaign_id: json_str(row.get("campaign").and_then(|c| c.get("id")))?,
    ad_group_id: json_str(row.get("adGroup").and_then(|a| a.get("id")))?,
    criterion_id: json_str(criterion.and_then(|c| c.get("criterionId"))),
    keyword_text: json_str(keyword.and_then(|k| k.get("text")))?,
    match_type: json_str(keyword.and_then(|k| k.get("matchType"))).unwrap_or_default(),
    status: json_str(criterion.and_then(|c| c.get("status"))).unwrap_or_default(),
    quality_score: QualityScore::from_raw(json_f64(
      criterion.and_then(|c| c.get("qualityInfo")).and_then(|q| q.get("qualityScore")),
    )),
    impressions: json_i64(metric("impressions")).unwrap_or(0),
    clicks: json_i64(metric("clicks")).unwrap_or(0),
    cost_micros: json_i64(metric("costMicros")).unwrap_or(0),
    conversions: json_f64(metric("conversions")).unwrap_or(0.0),
    conversion_value: json_f64(metric("conversionsValue")).unwrap_or(0.0),
    ctr: json_f64(metric("ctr")).unwrap_or(0.0),
    avg_cpc_micros: json_i64(metric("averageCpc")).unwrap_or(0),
    cpc_bid_micros: json_i64(criterion.and_then(|c| c.get("cpcBidMicros"))),
    date,
  })
}

impl GoogleAdsClient {
  pub fn new(base_url: &str, developer_token: &str, login_customer_id: Option<String>, access_token: &str) -> Self {
    let mut base_url = base_url.trim().to_string();
    if !base_url.ends_with('/') {
      base_url.push('/');
    }
    Self {
      base_url,
      developer_token: developer_token.to_string(),
      login_customer_id,
      access_token: access_token.to_string(),
    }
  }

  pub async fn connect(cfg: &GoogleAdsConfig) -> Result<Self, PlatformError> {
    let oauth = google_ads_oauth_client(&cfg.client_id, &cfg.client_secret, &cfg.token_url)?;
    let access_token = refresh_access_token(&oauth, &cfg.refresh_token).await?;
    Ok(Self::new(
      &cfg.api_base_url,
      &cfg.developer_token,
      cfg.login_customer_id.clone(),
      &access_token,
    ))
  }

  pub async fn from_env() -> Result<Option<Self>, PlatformError> {
    match GoogleAdsConfig::from_env_optional()? {
      Some(cfg) => Ok(Some(Self::connect(&cfg).await?)),
      None => Ok(None),
    }
  }

  fn endpoint(&self, customer_id: &str, method: &str) -> String {
    format!("{}customers/{customer_id}/{method}", self.base_url)
  }

  async fn post_json(&self, url: &str, payload: &Value) -> Result<Value, PlatformError> {
    let body = serde_json::to_vec(payload).map_err(|e| PlatformError::new(None, e.to_string()))?;

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
      .with_native_roots()
      .map_err(|e| PlatformError::new(None, e.to_string()))?
      .https_or_http()
      .enable_http1()
      .build();
    let client =
      hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

    let mut builder = Request::builder()
      .method(Method::POST)
      .uri(url)
      .header(AUTHORIZATION, format!("Bearer {}", self.access_token))
      .header("developer-token", self.developer_token.as_str())
      .header(CONTENT_TYPE, "application/json")
      .header(ACCEPT, "application/json");
    if let Some(login) = self.login_customer_id.as_deref() {
      builder = builder.header("login-customer-id", login);
    }
    let req = builder
      .body(Full::new(Bytes::from(body)))
      .map_err(|e| PlatformError::new(None, e.to_string()))?;

    let resp = client
      .request(req)
      .await
      .map_err(|e| PlatformError::new(None, e.to_string()))?;

    let status = resp.status();
    let body_bytes = resp
      .into_body()
      .collect()
      .await
      .map_err(|e| PlatformError::new(Some(status.as_u16()), e.to_string()))?
      .to_bytes();

    if status != StatusCode::OK {
      return Err(PlatformError::new(Some(status.as_u16()), extract_error_message(&body_bytes)));
    }

    serde_json::from_slice(&body_bytes)
      .map_err(|e| PlatformError::new(Some(status.as_u16()), format!("invalid json response: {e}")))
  }

  /// Runs a GAQL query, following page tokens.
  pub async fn search(&self, customer_id: &str, query: &str) -> Result<Vec<Value>, PlatformError> {
    let customer_id = normalize_customer_id(customer_id)?;
    let url = self.endpoint(&customer_id, "googleAds:search");

    let mut rows = Vec::new();
    let mut page_token: Option<String> = None;
    for _ in 0..MAX_SEARCH_PAGES {
      let mut payload = json!({ "query": query });
      if let Some(token) = page_token.as_deref() {
        payload["pageToken"] = Value::String(token.to_string());
      }
      let page = self.post_json(&url, &payload).await?;
      if let Some(results) = page.get("results").and_then(|r| r.as_array()) {
        rows.extend(results.iter().cloned());
      }
      page_token = page
        .get("nextPageToken")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string());
      if page_token.is_none() {
        return Ok(rows);
      }
    }
    tracing::warn!(customer_id = customer_id.as_str(), pages = MAX_SEARCH_PAGES, "search truncated at page limit");
    Ok(rows)
  }

  async fn mutate_criterion(&self, customer_id: &str, update: Value, update_mask: &str) -> Result<String, PlatformError> {
    let url = self.endpoint(customer_id, "adGroupCriteria:mutate");
    let payload = json!({
      "operations": [{ "update": update, "updateMask": update_mask }],
    });
    let resp = self.post_json(&url, &payload).await?;
    resp
      .get("results")
      .and_then(|r| r.as_array())
      .and_then(|r| r.first())
      .and_then(|r| r.get("resourceName"))
      .and_then(|n| n.as_str())
      .map(|n| n.to_string())
      .ok_or_else(|| PlatformError::new(Some(200), "mutate response carried no resourceName"))
  }

  pub async fn fetch_currency_code(&self, customer_id: &str) -> Result<String, PlatformError> {
    let rows = self
      .search(customer_id, "SELECT customer.currency_code FROM customer LIMIT 1")
      .await?;
    rows
      .first()
      .and_then(|r| r.get("customer"))
      .and_then(|c| c.get("currencyCode"))
      .and_then(|c| c.as_str())
      .map(|c| c.to_string())
      .ok_or_else(|| PlatformError::new(None, format!("no currency code for customer {customer_id}")))
  }
}

#[async_trait]
impl AdsPlatform for GoogleAdsClient {
  async fn lookup_criterion_id(
    &self,
    customer_id: &str,
    ad_group_id: &str,
    keyword_text: &str,
  ) -> Result<Option<String>, PlatformError> {
    let ad_group_id = numeric_id("ad group id", ad_group_id)?;
    let query = format!(
      "SELECT ad_group_criterion.criterion_id FROM ad_group_criterion \
       WHERE ad_group.id = {ad_group_id} AND ad_group_criterion.keyword.text = '{}' \
       AND ad_group_criterion.status != 'REMOVED' LIMIT 1",
      escape_gaql_string(keyword_text)
    );
    let rows = self.search(customer_id, &query).await?;
    Ok(
      rows
        .first()
        .and_then(|r| json_str(r.get("adGroupCriterion").and_then(|c| c.get("criterionId")))),
    )
  }

  async fn update_keyword_bid(
    &self,
    customer_id: &str,
    ad_group_id: &str,
    criterion_id: &str,
    new_bid_micros: i64,
  ) -> Result<String, PlatformError> {
    if new_bid_micros <= 0 {
      return Err(PlatformError::new(None, format!("refusing non-positive bid {new_bid_micros}")));
    }
    let customer_id = normalize_customer_id(customer_id)?;
    let resource = criterion_resource_name(
      &customer_id,
      &numeric_id("ad group id", ad_group_id)?,
      &numeric_id("criterion id", criterion_id)?,
    );
    let update = json!({ "resourceName": resource, "cpcBidMicros": new_bid_micros.to_string() });
    self.mutate_criterion(&customer_id, update, "cpc_bid_micros").await
  }

  async fn pause_keyword(&self, customer_id: &str, ad_group_id: &str, criterion_id: &str) -> Result<String, PlatformError> {
    let customer_id = normalize_customer_id(customer_id)?;
    let resource = criterion_resource_name(
      &customer_id,
      &numeric_id("ad group id", ad_group_id)?,
      &numeric_id("criterion id", criterion_id)?,
    );
    let update = json!({ "resourceName": resource, "status": "PAUSED" });
    self.mutate_criterion(&customer_id, update, "status").await
  }

  async fn fetch_keyword_metrics(
    &self,
    customer_id: &str,
    start: NaiveDate,
    end: NaiveDate,
  ) -> Result<Vec<MetricRecord>, PlatformError> {
    let normalized = normalize_customer_id(customer_id)?;
    let rows = self.search(&normalized, &keyword_metrics_query(start, end)).await?;
    let total = rows.len();
    let records: Vec<MetricRecord> = rows.iter().filter_map(|r| parse_metric_row(&normalized, r)).collect();
    if records.len() < total {
      tracing::warn!(
        customer_id = normalized.as_str(),
        dropped = total - records.len(),
        "dropped keyword rows without identifiers"
      );
    }
    Ok(records)
  }
}

#[async_trait]
impl CurrencySource for GoogleAdsClient {
  async fn get_account_currency(&self, customer_id: &str) -> EngineResult<String> {
    self.fetch_currency_code(customer_id).await.map_err(EngineError::Platform)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use hyper::body::Incoming;
  use hyper::server::conn::http1;
  use hyper::service::service_fn;
  use hyper::Response;
  use hyper_util::rt::TokioIo;
  use tokio::net::TcpListener;

  fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
      .status(status)
      .header("content-type", "application/json")
      .body(Full::new(Bytes::from(body.to_string())))
      .unwrap()
  }

  async fn route(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let token_ok = req.headers().get("developer-token").and_then(|v| v.to_str().ok()) == Some("dev-token");
    let auth_ok = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some("Bearer token123");
    if !token_ok || !auth_ok {
      return Ok(json_response(
        StatusCode::UNAUTHORIZED,
        json!({"error": {"code": 401, "message": "missing credentials"}}),
      ));
    }

    let path = req.uri().path().to_string();
    let body = req.into_body().collect().await?.to_bytes();
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    if path == "/customers/1234567890/googleAds:search" {
      let query = payload["query"].as_str().unwrap_or("");
      if query.contains("customer.currency_code") {
        return Ok(json_response(
          StatusCode::OK,
          json!({"results": [{"customer": {"currencyCode": "COP"}}]}),
        ));
      }
      if query.contains("FROM ad_group_criterion") {
        if query.contains("'missing'") {
          return Ok(json_response(StatusCode::OK, json!({})));
        }
        return Ok(json_response(
          StatusCode::OK,
          json!({"results": [{"adGroupCriterion": {"criterionId": "333"}}]}),
        ));
      }
      let row = |date: &str, clicks: &str| {
        json!({
          "campaign": {"id": "111"},
          "adGroup": {"id": "222"},
          "adGroupCriterion": {
            "criterionId": "333",
            "status": "ENABLED",
            "keyword": {"text": "running shoes", "matchType": "PHRASE"},
            "qualityInfo": {"qualityScore": 8},
            "cpcBidMicros": "1500000"
          },
          "metrics": {
            "impressions": "1000", "clicks": clicks, "costMicros": "250000",
            "conversions": 2.0, "conversionsValue": 40.5, "ctr": 0.02, "averageCpc": 12500.0
          },
          "segments": {"date": date}
        })
      };
      if payload.get("pageToken").is_none() {
        return Ok(json_response(
          StatusCode::OK,
          json!({"results": [row("2026-03-01", "20"), {"campaign": {"id": "111"}}], "nextPageToken": "p2"}),
        ));
      }
      return Ok(json_response(StatusCode::OK, json!({"results": [row("2026-03-02", "25")]})));
    }

    if path == "/customers/1234567890/adGroupCriteria:mutate" {
      let op = &payload["operations"][0];
      if op["update"]["cpcBidMicros"] == json!("1") {
        return Ok(json_response(
          StatusCode::BAD_REQUEST,
          json!({"error": {"code": 400, "message": "Bid is below the minimum", "status": "INVALID_ARGUMENT"}}),
        ));
      }
      let name = op["update"]["resourceName"].clone();
      return Ok(json_response(StatusCode::OK, json!({"results": [{"resourceName": name}]})));
    }

    Ok(json_response(StatusCode::NOT_FOUND, json!({"error": {"message": "not found"}})))
  }

  async fn spawn_mock() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      loop {
        let Ok((stream, _)) = listener.accept().await else {
          return;
        };
        tokio::spawn(async move {
          let _ = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service_fn(route))
            .await;
        });
      }
    });
    format!("http://{addr}/")
  }

  #[test]
  fn parses_rest_row_with_string_int64_fields() {
    let row = json!({
      "campaign": {"id": "9"},
      "adGroup": {"id": "8"},
      "adGroupCriterion": {"criterionId": "7", "keyword": {"text": "boots", "matchType": "EXACT"}},
      "metrics": {"impressions": "10", "clicks": "2", "costMicros": "3000", "ctr": 0.2},
      "segments": {"date": "2026-01-05"}
    });
    let rec = parse_metric_row("42", &row).unwrap();
    assert_eq!(rec.campaign_id, "9");
    assert_eq!(rec.criterion_id.as_deref(), Some("7"));
    assert_eq!(rec.clicks, 2);
    assert_eq!(rec.cost_micros, 3000);
    assert_eq!(rec.quality_score, QualityScore::Missing);
    assert_eq!(rec.cpc_bid_micros, None);
    assert!(parse_metric_row("42", &json!({"campaign": {"id": "9"}})).is_none());
  }

  #[test]
  fn ids_and_strings_are_sanitized() {
    assert_eq!(normalize_customer_id("123-456-7890").unwrap(), "1234567890");
    assert!(normalize_customer_id("12a").is_err());
    assert_eq!(escape_gaql_string("kid's shoes"), "kid\\'s shoes");
    assert_eq!(criterion_resource_name("1", "2", "3"), "customers/1/adGroupCriteria/2~3");
  }

  #[tokio::test]
  async fn fetches_metrics_across_pages() {
    let base = spawn_mock().await;
    let client = GoogleAdsClient::new(&base, "dev-token", Some("999".to_string()), "token123");
    let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

    let rows = client.fetch_keyword_metrics("123-456-7890", start, end).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].clicks, 20);
    assert_eq!(rows[1].clicks, 25);
    assert_eq!(rows[0].quality_score, QualityScore::Present(8.0));
    assert_eq!(rows[0].cpc_bid_micros, Some(1_500_000));
    assert_eq!(rows[0].avg_cpc_micros, 12_500);
    assert_eq!(rows[0].customer_id, "1234567890");
  }

  #[tokio::test]
  async fn mutates_bids_and_status() {
    let base = spawn_mock().await;
    let client = GoogleAdsClient::new(&base, "dev-token", None, "token123");

    let name = client.update_keyword_bid("1234567890", "222", "333", 1_200_000).await.unwrap();
    assert_eq!(name, "customers/1234567890/adGroupCriteria/222~333");

    let name = client.pause_keyword("1234567890", "222", "333").await.unwrap();
    assert!(name.ends_with("222~333"));

    let err = client.update_keyword_bid("1234567890", "222", "333", 1).await.unwrap_err();
    assert_eq!(err.status, Some(400));
    assert!(err.message.contains("below the minimum"));
  }

  #[tokio::test]
  async fn looks_up_criterion_and_currency() {
    let base = spawn_mock().await;
    let client = GoogleAdsClient::new(&base, "dev-token", None, "token123");

    let found = client.lookup_criterion_id("1234567890", "222", "running shoes").await.unwrap();
    assert_eq!(found.as_deref(), Some("333"));
    let missing = client.lookup_criterion_id("1234567890", "222", "missing").await.unwrap();
    assert_eq!(missing, None);

    assert_eq!(client.get_account_currency("1234567890").await.unwrap(), "COP");
  }

  #[tokio::test]
  async fn surfaces_auth_failures_with_status() {
    let base = spawn_mock().await;
    let client = GoogleAdsClient::new(&base, "wrong", None, "token123");
    let err = client.fetch_currency_code("1234567890").await.unwrap_err();
    assert_eq!(err.status, Some(401));
    assert_eq!(err.message, "missing credentials");
  }
}
