use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use keyword_autopilot_rust::models::ChangeRequest;
use keyword_autopilot_rust::telemetry::init_tracing;
use keyword_autopilot_rust::{Autopilot, EngineError};

const MAX_REQUESTS_PER_EXECUTION: usize = 500;

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

#[derive(Deserialize)]
struct ExecuteRequest {
  requests: Vec<ChangeRequest>,
  #[serde(default)]
  execution_id: Option<String>,
  #[serde(default)]
  dry_run: bool,
}

async fn handle_execute(method: &Method, headers: &HeaderMap, body: Bytes) -> Result<Response<ResponseBody>, Error> {
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

  let parsed: ExecuteRequest = match serde_json::from_slice(&body) {
    Ok(v) => v,
    Err(e) => {
      return json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({"ok": false, "error": "bad_request", "message": format!("invalid json body: {e}")}),
      )
    }
  };
  if parsed.requests.is_empty() {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "requests must not be empty"}),
    );
  }
  if parsed.requests.len() > MAX_REQUESTS_PER_EXECUTION {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({
        "ok": false,
        "error": "bad_request",
        "message": format!("at most {MAX_REQUESTS_PER_EXECUTION} requests per execution")
      }),
    );
  }

  if !has_tidb_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let autopilot = Autopilot::from_env().await?;
  match autopilot
    .execute_bid_changes(&parsed.requests, parsed.execution_id, parsed.dry_run)
    .await
  {
    Ok(report) => json_response(
      StatusCode::OK,
      serde_json::json!({"ok": true, "execution": report}),
    ),
    Err(e) => engine_error_response(e),
  }
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  init_tracing();
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_execute(&method, &headers, bytes).await
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
    let body = Bytes::from_static(br#"{"requests":[]}"#);
    let response = handle_execute(&Method::POST, &headers, body).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn rejects_empty_request_list() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());
    let body = Bytes::from_static(br#"{"requests":[],"dry_run":true}"#);
    let response = handle_execute(&Method::POST, &headers, body).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }
}
