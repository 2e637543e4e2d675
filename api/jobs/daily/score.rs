use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use keyword_autopilot_rust::health_service::{DEFAULT_DAYS_BACK, DEFAULT_RETENTION_DAYS};
use keyword_autopilot_rust::telemetry::init_tracing;
use keyword_autopilot_rust::{Autopilot, EngineError};

fn bearer_token(header_value: Option<&str>) -> Option<&str> {
  let value = header_value?;
  value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Result<Response<ResponseBody>, Error> {
  Ok(
    Response::builder()
      .status(status)
      .header("content-type", "application/json; charset=utf-8")
      .body(ResponseBody::from(value))?,
  )
}

fn has_tidb_url() -> bool {
  std::env::var("TIDB_DATABASE_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .map(|v| !v.is_empty())
    .unwrap_or(false)
}

fn engine_error_response(err: EngineError) -> Result<Response<ResponseBody>, Error> {
  let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  json_response(
    status,
    serde_json::json!({"ok": false, "error": err.code(), "message": err.to_string()}),
  )
}

#[derive(Deserialize, Default)]
struct DailyScoreRequest {
  #[serde(default)]
  customer_ids: Vec<String>,
  #[serde(default)]
  days_back: Option<i64>,
  #[serde(default)]
  retention_days: Option<i64>,
}

async fn handle_daily_score(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
  if method != Method::POST {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");
  if expected.is_empty() || provided != expected {
    return json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    );
  }

  let parsed: DailyScoreRequest = if body.is_empty() {
    DailyScoreRequest::default()
  } else {
    match serde_json::from_slice(&body) {
      Ok(v) => v,
      Err(e) => {
        return json_response(
          StatusCode::BAD_REQUEST,
          serde_json::json!({"ok": false, "error": "bad_request", "message": format!("invalid json body: {e}")}),
        )
      }
    }
  };
  let customer_ids = parsed
    .customer_ids
    .iter()
    .map(|id| id.trim().to_string())
    .filter(|id| !id.is_empty())
    .collect::<Vec<_>>();
  let days_back = parsed.days_back.unwrap_or(DEFAULT_DAYS_BACK).clamp(1, 365);
  let retention_days = parsed.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);

  if !has_tidb_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let autopilot = Autopilot::from_env().await?;
  match autopilot
    .run_daily_scoring(&customer_ids, days_back, Some(retention_days))
    .await
  {
    Ok(report) => json_response(
      StatusCode::OK,
      serde_json::json!({"ok": true, "days_back": days_back, "report": report}),
    ),
    Err(e) => engine_error_response(e),
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  init_tracing();
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_daily_score(&method, &headers, bytes).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  run(service_fn(handler)).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn returns_unauthorized_when_missing_internal_token() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let headers = HeaderMap::new();
    let body = Bytes::from_static(br#"{}"#);
    let response = handle_daily_score(&Method::POST, &headers, body).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn rejects_get() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    let response = handle_daily_score(&Method::GET, &headers, Bytes::new()).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
  }
}
