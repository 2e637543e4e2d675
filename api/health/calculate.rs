use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use keyword_autopilot_rust::health_service::DEFAULT_DAYS_BACK;
use keyword_autopilot_rust::telemetry::init_tracing;
use keyword_autopilot_rust::Autopilot;

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

#[derive(Deserialize)]
struct CalculateRequest {
  customer_id: String,
  #[serde(default)]
  days_back: Option<i64>,
}

async fn handle_calculate(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
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

  let parsed: CalculateRequest = match serde_json::from_slice(&body) {
    Ok(v) => v,
    Err(e) => {
      return json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({"ok": false, "error": "bad_request", "message": format!("invalid json body: {e}")}),
      )
    }
  };
  let customer_id = parsed.customer_id.trim().to_string();
  if customer_id.is_empty() {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "customer_id is required"}),
    );
  }
  let days_back = parsed.days_back.unwrap_or(DEFAULT_DAYS_BACK).clamp(1, 365);

  if !has_tidb_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let autopilot = Autopilot::from_env().await?;
  let scores = autopilot.calculate_health_scores_for_account(&customer_id, days_back).await;

  json_response(
    StatusCode::OK,
    serde_json::json!({
      "ok": true,
      "customer_id": customer_id,
      "days_back": days_back,
      "keywords_scored": scores.len(),
      "scores": scores,
    }),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  init_tracing();
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_calculate(&method, &headers, bytes).await
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
    let body = Bytes::from_static(br#"{"customer_id":"1234567890"}"#);
    let response = handle_calculate(&Method::POST, &headers, body).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn rejects_missing_customer_id() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    let body = Bytes::from_static(br#"{"customer_id":"  "}"#);
    let response = handle_calculate(&Method::POST, &headers, body).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }
}
