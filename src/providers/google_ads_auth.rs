use oauth2::basic::BasicClient;
use oauth2::{ClientId, ClientSecret, EndpointNotSet, EndpointSet, RefreshToken, TokenResponse, TokenUrl};

use crate::error::PlatformError;

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub type GoogleAdsOAuthClient = BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Only the token endpoint is configured; consent happens outside this service.
pub fn google_ads_oauth_client(
  client_id: &str,
  client_secret: &str,
  token_url: &str,
) -> Result<GoogleAdsOAuthClient, PlatformError> {
  if client_id.trim().is_empty() {
    return Err(PlatformError::new(None, "Missing GOOGLE_ADS_CLIENT_ID"));
  }
  if client_secret.trim().is_empty() {
    return Err(PlatformError::new(None, "Missing GOOGLE_ADS_CLIENT_SECRET"));
  }
  let token_url = TokenUrl::new(token_url.to_string()).map_err(|e| PlatformError::new(None, e.to_string()))?;

  Ok(
    BasicClient::new(ClientId::new(client_id.trim().to_string()))
      .set_client_secret(ClientSecret::new(client_secret.trim().to_string()))
      .set_token_uri(token_url),
  )
}

pub async fn refresh_access_token(client: &GoogleAdsOAuthClient, refresh_token: &str) -> Result<String, PlatformError> {
  if refresh_token.trim().is_empty() {
    return Err(PlatformError::new(None, "Missing GOOGLE_ADS_REFRESH_TOKEN"));
  }
  let http_client = oauth2::reqwest::ClientBuilder::new()
    .redirect(oauth2::reqwest::redirect::Policy::none())
    .build()
    .map_err(|e| PlatformError::new(None, e.to_string()))?;

  let token = client
    .exchange_refresh_token(&RefreshToken::new(refresh_token.trim().to_string()))
    .request_async(&http_client)
    .await
    .map_err(|e| PlatformError::new(Some(401), format!("token refresh failed: {e}")))?;

  Ok(token.access_token().secret().to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use http_body_util::Full;
  use hyper::body::Incoming;
  use hyper::server::conn::http1;
  use hyper::service::service_fn;
  use hyper::{Request, Response, StatusCode};
  use hyper_util::rt::TokioIo;
  use tokio::net::TcpListener;

  #[test]
  fn rejects_missing_client_credentials() {
    assert!(google_ads_oauth_client("", "secret", GOOGLE_TOKEN_URL).is_err());
    assert!(google_ads_oauth_client("id", " ", GOOGLE_TOKEN_URL).is_err());
    assert!(google_ads_oauth_client("id", "secret", GOOGLE_TOKEN_URL).is_ok());
  }

  #[tokio::test]
  async fn refreshes_access_token_against_mock_token_endpoint() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let task = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      http1::Builder::new()
        .serve_connection(
          TokioIo::new(stream),
          service_fn(|_req: Request<Incoming>| async move {
            let body = r#"{"access_token":"ya29.fresh","token_type":"Bearer","expires_in":3599}"#;
            Ok::<_, hyper::Error>(
              Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .unwrap(),
            )
          }),
        )
        .await
        .unwrap();
    });

    let client = google_ads_oauth_client("id", "secret", &format!("http://{addr}/token")).unwrap();
    let token = refresh_access_token(&client, "refresh-123").await.unwrap();
    assert_eq!(token, "ya29.fresh");

    task.await.unwrap();
  }
}
