//! Request forwarder: issues the upstream call with buffered-or-streamed
//! bodies, explicit connect/total deadlines, and cancellation on client
//! disconnect.

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use std::time::Duration;

use crate::error::AppError;

/// Whether the forwarder is allowed to retry this exact body on a
/// different account. Large/streamed bodies commit to no-failover the
/// moment the first byte is sent upstream.
///
/// `Streaming` can't derive `Clone` — it wraps a one-shot `axum::body::Body`
/// — so it is never reconstructed once consumed; callers that need to retry
/// a request across accounts must only hold a `Streaming` body for the last
/// attempt they're willing to make.
#[derive(Debug)]
pub enum BodySource {
    Buffered(Bytes),
    Empty,
    Streaming(Body),
}

impl BodySource {
    /// `threshold` is `Config::buffered_body_threshold_bytes` (default
    /// 1 MiB). Bodies at or under the threshold are buffered up front so
    /// they can be replayed against a different account on failover; bodies
    /// over the threshold stream straight through and forfeit failover the
    /// moment the first byte reaches the upstream connection.
    pub fn is_replayable(&self, threshold: usize) -> bool {
        match self {
            BodySource::Empty => true,
            BodySource::Buffered(bytes) => bytes.len() <= threshold,
            BodySource::Streaming(_) => false,
        }
    }
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: reqwest::Response,
}

pub struct RequestForwarder {
    client: reqwest::Client,
    connect_timeout: Duration,
    total_timeout: Duration,
}

impl RequestForwarder {
    pub fn new(connect_timeout: Duration, total_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .expect("reqwest client builds with static config");
        Self {
            client,
            connect_timeout,
            total_timeout,
        }
    }

    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: BodySource,
    ) -> Result<UpstreamResponse, AppError> {
        let mut builder = self.client.request(method, url).headers(headers);
        builder = match body {
            BodySource::Buffered(bytes) if !bytes.is_empty() => builder.body(bytes),
            BodySource::Streaming(body) => {
                builder.body(reqwest::Body::wrap_stream(body.into_data_stream()))
            }
            _ => builder,
        };

        let send = builder.send();
        let response = match tokio::time::timeout(self.total_timeout, send).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) if err.is_timeout() || err.is_connect() => {
                return Err(AppError::Upstream(format!("connect failed: {err}")))
            }
            Ok(Err(err)) => return Err(AppError::Upstream(err.to_string())),
            Err(_) => {
                return Err(AppError::Upstream(format!(
                    "request exceeded total timeout of {:?}",
                    self.total_timeout
                )))
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        Ok(UpstreamResponse {
            status,
            headers,
            body: response,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_buffered_body_is_replayable() {
        let body = BodySource::Buffered(Bytes::from_static(b"hello"));
        assert!(body.is_replayable(1024 * 1024));
    }

    #[test]
    fn body_over_threshold_is_not_replayable() {
        let body = BodySource::Buffered(Bytes::from(vec![0u8; 2048]));
        assert!(!body.is_replayable(1024));
    }

    #[test]
    fn empty_body_always_replayable() {
        assert!(BodySource::Empty.is_replayable(0));
    }

    #[tokio::test]
    async fn forward_returns_upstream_status_and_body() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::POST).path("/v1/messages");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"ok":true}"#);
        });

        let forwarder = RequestForwarder::new(Duration::from_secs(5), Duration::from_secs(10));
        let url = format!("{}/v1/messages", server.base_url());
        let response = forwarder
            .forward(
                Method::POST,
                &url,
                HeaderMap::new(),
                BodySource::Buffered(Bytes::from_static(b"{}")),
            )
            .await
            .expect("forward succeeds");

        assert_eq!(response.status, StatusCode::OK);
        let body = response.body.text().await.unwrap();
        assert_eq!(body, r#"{"ok":true}"#);
        mock.assert();
    }

    #[tokio::test]
    async fn forward_surfaces_connect_failure_as_upstream_error() {
        let forwarder = RequestForwarder::new(Duration::from_millis(50), Duration::from_secs(1));
        let result = forwarder
            .forward(
                Method::GET,
                "http://127.0.0.1:1",
                HeaderMap::new(),
                BodySource::Empty,
            )
            .await;

        assert!(matches!(result, Err(AppError::Upstream(_))));
    }
}
