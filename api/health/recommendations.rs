use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
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

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
  let q = query?;
  for pair in q.split('&') {
    let mut it = pair.splitn(2, '=');
    let k = it.next().unwrap_or("");
    let v = it.next().unwrap_or("");
    if k == key {
      return Some(v.replace('+', " "));
    }
  }
  None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
  QuickWins,
  Vampires,
  Saturation,
  Bids,
  Summary,
}

fn parse_view(raw: &str) -> Option<View> {
  match raw.trim() {
    "quick_wins" | "" => Some(View::QuickWins),
    "vampires" => Some(View::Vampires),
    "saturation" => Some(View::Saturation),
    "bids" => Some(View::Bids),
    "summary" => Some(View::Summary),
    _ => None,
  }
}

async fn handle_recommendations(
  method: &Method,
  headers: &HeaderMap,
  uri: &hyper::Uri,
) -> Result<Response<ResponseBody>, Error> {
  if method != Method::GET {
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

  let customer_id = query_param(uri.query(), "customer_id").unwrap_or_default();
  if customer_id.trim().is_empty() {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "customer_id is required"}),
    );
  }
  let view_raw = query_param(uri.query(), "type").unwrap_or_default();
  let Some(view) = parse_view(&view_raw) else {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({
        "ok": false,
        "error": "bad_request",
        "message": "type must be one of quick_wins, vampires, saturation, bids, summary"
      }),
    );
  };
  let limit = query_param(uri.query(), "limit").and_then(|v| v.parse::<usize>().ok());
  let days_back = query_param(uri.query(), "days_back")
    .and_then(|v| v.parse::<i64>().ok())
    .unwrap_or(DEFAULT_DAYS_BACK)
    .clamp(1, 365);

  if !has_tidb_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let autopilot = Autopilot::from_env().await?;
  let customer_id = customer_id.trim();
  let items = match view {
    View::QuickWins => serde_json::to_value(autopilot.get_quick_wins(customer_id, limit).await?)?,
    View::Vampires => serde_json::to_value(autopilot.get_vampire_keywords(customer_id).await?)?,
    View::Saturation => serde_json::to_value(autopilot.get_saturation_alerts(customer_id).await?)?,
    View::Bids => serde_json::to_value(autopilot.get_bid_recommendations(customer_id, days_back).await?)?,
    View::Summary => serde_json::to_value(autopilot.get_health_score_summary(customer_id).await?)?,
  };

  json_response(
    StatusCode::OK,
    serde_json::json!({"ok": true, "customer_id": customer_id, "type": view_raw, "items": items}),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  init_tracing();
  let method = req.method().clone();
  let headers = req.headers().clone();
  let uri = req.uri().clone();
  let _bytes = req.into_body().collect().await?.to_bytes();
  handle_recommendations(&method, &headers, &uri).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  run(service_fn(handler)).await
}
