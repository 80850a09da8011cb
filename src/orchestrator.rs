//! Pipeline orchestrator: the top-level per-request state machine.
//!
//! receive -> select candidates -> loop attempts -> emit response ->
//! enqueue usage record. This is the one place that knows about all the
//! other components at once; everything else is a narrow collaborator.

use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, Method, Request, Response, StatusCode};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::balancer::LoadBalancer;
use crate::classifier::{Decision, ResponseClassifier};
use crate::config::{Config, RequestCountResetPolicy};
use crate::forwarder::{BodySource, RequestForwarder};
use crate::models::{RequestMeta, UsageRecord};
use crate::provider::ProviderAdapter;
use crate::store::Store;
use crate::tee::{SharedTeeBuffer, TeeBuffer, TeeStream};
use crate::token::SharedTokenManager;
use crate::writer::{WriteOp, WriterHandle};

const DISCONNECT_DRAIN_CAP_SECS: u64 = 2;

pub struct Orchestrator {
    store: Arc<Store>,
    balancer: LoadBalancer,
    adapter: ProviderAdapter,
    forwarder: RequestForwarder,
    token_manager: SharedTokenManager,
    writer: WriterHandle,
    tee_buffer_bytes: usize,
    buffered_body_threshold_bytes: usize,
    /// Idle timeout for reading a non-streaming response body after headers
    /// arrive; streaming responses have none, since a slow SSE producer is
    /// normal, not stuck.
    forward_idle_timeout: Duration,
    /// Whether a lazily-cleared rate limit also resets `request_count`.
    clear_request_count_on_reset: bool,
    /// Account id used by the most recent successful request, tracked
    /// in-process since the balancer itself is stateless.
    session_leader: RwLock<Option<Uuid>>,
    /// How long a session stays "live" after its last touch; used both by
    /// the balancer's leader check and here to decide whether a successful
    /// attempt continues that session or starts a fresh one.
    session_ttl: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        config: &Config,
        token_manager: SharedTokenManager,
        writer: WriterHandle,
    ) -> Self {
        Self {
            store,
            balancer: LoadBalancer::new(config.session_ttl()),
            adapter: ProviderAdapter::new(config.upstream_base_url.clone()),
            forwarder: RequestForwarder::new(
                config.forward_connect_timeout(),
                config.forward_total_timeout(),
            ),
            token_manager,
            writer,
            tee_buffer_bytes: config.tee_buffer_bytes,
            buffered_body_threshold_bytes: config.buffered_body_threshold_bytes,
            forward_idle_timeout: config.forward_idle_timeout(),
            clear_request_count_on_reset: matches!(
                config.request_count_reset_policy,
                RequestCountResetPolicy::ClearOnRateLimitReset
            ),
            session_leader: RwLock::new(None),
            session_ttl: config.session_ttl(),
        }
    }

    #[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        let method = req.method().clone();
        let uri = req.uri().clone();
        let incoming_headers = req.headers().clone();
        let meta = RequestMeta::new(method.to_string(), uri.path().to_string());

        let (body_source, had_body) = match self.buffer_body(&incoming_headers, req.into_body()).await {
            Ok(v) => v,
            Err(_) => {
                return error_response(StatusCode::BAD_REQUEST, "failed to read request body")
            }
        };

        let accounts = match self.store.list_accounts().await {
            Ok(a) => a,
            Err(err) => {
                warn!(error = %err, "failed to list accounts for selection");
                Vec::new()
            }
        };

        let now = Utc::now();
        for account_id in LoadBalancer::expired_rate_limits(&accounts, now) {
            self.writer
                .enqueue(WriteOp::ClearRateLimit {
                    account_id,
                    reset_request_count: self.clear_request_count_on_reset,
                })
                .await;
        }

        let leader = *self.session_leader.read().await;
        let candidates = self.balancer.select(&accounts, now, leader);

        if candidates.is_empty() {
            return self
                .unauthenticated_pass_through(&meta, method, &uri, incoming_headers, body_source, start)
                .await;
        }

        self.run_attempts(
            &meta,
            method,
            &uri,
            incoming_headers,
            body_source,
            had_body,
            candidates,
            start,
            leader,
            now,
        )
        .await
    }

    /// Buffers bodies at or under the configured threshold (default 1 MiB)
    /// so they can be replayed against a different account on failover;
    /// anything larger — or of unknown (chunked) length — streams straight
    /// through unbounded, forfeiting failover once the first byte reaches
    /// the upstream connection.
    async fn buffer_body(
        &self,
        headers: &HeaderMap,
        body: Body,
    ) -> Result<(BodySource, bool), axum::Error> {
        let content_length = headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<usize>().ok());

        match content_length {
            Some(0) => Ok((BodySource::Empty, false)),
            Some(len) if len <= self.buffered_body_threshold_bytes => {
                let bytes = to_bytes(body, len).await.map_err(axum::Error::new)?;
                Ok((BodySource::Buffered(bytes), true))
            }
            _ => Ok((BodySource::Streaming(body), true)),
        }
    }

    /// No eligible accounts: forward without credentials and record the
    /// result with `account_id=null` rather than rejecting the request.
    async fn unauthenticated_pass_through(
        &self,
        meta: &RequestMeta,
        method: Method,
        uri: &axum::http::Uri,
        incoming_headers: HeaderMap,
        body_source: BodySource,
        start: Instant,
    ) -> Response<Body> {
        let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let url = self.adapter.build_url(path_and_query, None);
        let headers = self.adapter.prepare_headers(&incoming_headers, None, None);

        match self.forwarder.forward(method, &url, headers, body_source).await {
            Ok(upstream) => self.stream_response(upstream, meta, None, start, 1).await,
            Err(err) => {
                warn!(error = %err, "unauthenticated pass-through failed");
                self.finalize(meta, None, StatusCode::BAD_GATEWAY.as_u16(), start, 1, false)
                    .await;
                error_response(StatusCode::BAD_GATEWAY, "upstream unavailable")
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempts(
        &self,
        meta: &RequestMeta,
        method: Method,
        uri: &axum::http::Uri,
        incoming_headers: HeaderMap,
        body_source: BodySource,
        _had_body: bool,
        candidates: Vec<crate::models::Account>,
        start: Instant,
        leader: Option<Uuid>,
        now: chrono::DateTime<Utc>,
    ) -> Response<Body> {
        let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/").to_string();
        let total = candidates.len();
        let replayable = body_source.is_replayable(self.buffered_body_threshold_bytes);
        let mut body_source = Some(body_source);

        for (attempt_index, account) in candidates.into_iter().enumerate() {
            let is_last = attempt_index + 1 == total;
            let attempts = (attempt_index + 1) as i64;

            let token = self.token_manager.get_valid_access_token(&account).await;
            let (access_token, api_key) = match token {
                Ok(t) if account.api_key.is_some() => (None, Some(t)),
                Ok(t) => (Some(t), None),
                Err(_) => {
                    // AuthError or TransientAuthError: this account is
                    // unusable for this request; try the next candidate.
                    if is_last {
                        self.finalize(
                            meta,
                            Some(account.id),
                            StatusCode::BAD_GATEWAY.as_u16(),
                            start,
                            attempts,
                            false,
                        )
                        .await;
                        return error_response(
                            StatusCode::BAD_GATEWAY,
                            "all accounts failed authentication",
                        );
                    }
                    continue;
                }
            };

            let url = self.adapter.build_url(&path_and_query, account.base_url.as_deref());
            let headers = self.adapter.prepare_headers(
                &incoming_headers,
                access_token.as_deref(),
                api_key.as_deref(),
            );

            // Replayable bodies (buffered, under threshold) are cheaply
            // re-cloned per attempt; a streaming body is taken exactly once,
            // at the attempt that actually reaches the forwarder, since
            // forwarding it forfeits failover and no later iteration needs it.
            let this_body = if replayable {
                match body_source.as_ref() {
                    Some(BodySource::Buffered(bytes)) => BodySource::Buffered(bytes.clone()),
                    _ => BodySource::Empty,
                }
            } else {
                body_source
                    .take()
                    .expect("non-replayable body is consumed at most once per request")
            };

            let forward_result = self
                .forwarder
                .forward(method.clone(), &url, headers, this_body)
                .await;

            let upstream = match forward_result {
                Ok(resp) => resp,
                Err(_) => {
                    if !is_last && replayable {
                        continue;
                    }
                    self.finalize(
                        meta,
                        Some(account.id),
                        StatusCode::BAD_GATEWAY.as_u16(),
                        start,
                        attempts,
                        false,
                    )
                    .await;
                    return error_response(StatusCode::BAD_GATEWAY, "upstream request failed");
                }
            };

            let classifier = ResponseClassifier::new(&self.adapter, &self.writer);
            let status = upstream.status.as_u16();
            let still_same_session = leader == Some(account.id)
                && account
                    .session_start
                    .map(|s| now.signed_duration_since(s) < chrono_duration(self.session_ttl))
                    .unwrap_or(false);
            let start_new_session = !still_same_session;
            let decision = classifier
                .classify(account.id, status, &upstream.headers, start_new_session)
                .await;

            match decision {
                Decision::Success => {
                    *self.session_leader.write().await = Some(account.id);
                    return self
                        .stream_response(upstream, meta, Some(account.id), start, attempts)
                        .await;
                }
                Decision::Failover(_reason) => {
                    // More candidates and a replayable body: try the next
                    // one. Otherwise the last upstream response is returned
                    // to the client verbatim.
                    if !is_last && replayable {
                        continue;
                    }
                    return self
                        .stream_response(upstream, meta, Some(account.id), start, attempts)
                        .await;
                }
            }
        }

        error_response(StatusCode::BAD_GATEWAY, "all accounts exhausted")
    }

    /// Builds the client-facing response and arranges for exactly one
    /// `UsageRecord` to be enqueued once this response is actually done:
    /// immediately for a buffered body, or after the stream reaches EOF
    /// (or is cancelled) for a streaming one — never at the moment headers
    /// came back, since a tee's `truncated` flag and true duration aren't
    /// known until then.
    async fn stream_response(
        &self,
        upstream: crate::forwarder::UpstreamResponse,
        meta: &RequestMeta,
        account_id: Option<Uuid>,
        start: Instant,
        attempts: i64,
    ) -> Response<Body> {
        let is_streaming = self.adapter.is_streaming(&upstream.headers);
        let status = upstream.status;
        let mut builder = Response::builder().status(status);
        for (name, value) in upstream.headers.iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }

        if !is_streaming {
            let bytes = match tokio::time::timeout(self.forward_idle_timeout, upstream.body.bytes()).await
            {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(_)) | Err(_) => Default::default(),
            };
            self.finalize(meta, account_id, status.as_u16(), start, attempts, false)
                .await;
            return builder.body(Body::from(bytes)).unwrap_or_default();
        }

        let accounting: SharedTeeBuffer = Arc::new(Mutex::new(TeeBuffer::new(self.tee_buffer_bytes)));
        let accounting_fallback = accounting.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let byte_stream = upstream.body.bytes_stream();
        let teed = TeeStream::new(byte_stream, accounting, done_tx);

        let writer = self.writer.clone();
        let meta = meta.clone();
        let status_code = status.as_u16();
        tokio::spawn(async move {
            // On client disconnect mid-stream we still want to record
            // whatever usage the tee saw. `done` normally fires the instant
            // the stream is dropped, but cap the wait so a wedged upstream
            // can never hold this task (and the eventual UsageRecord) open
            // indefinitely.
            let truncated = match tokio::time::timeout(
                Duration::from_secs(DISCONNECT_DRAIN_CAP_SECS),
                done_rx,
            )
            .await
            {
                Ok(outcome) => outcome.unwrap_or(false),
                Err(_) => accounting_fallback
                    .lock()
                    .map(|b| b.snapshot().1)
                    .unwrap_or(false),
            };
            let record = UsageRecord {
                request_id: meta.id,
                account_id,
                path: meta.path.clone(),
                method: meta.method.clone(),
                status: status_code as i64,
                timestamp: meta.timestamp,
                duration_ms: start.elapsed().as_millis() as i64,
                input_tokens: None,
                output_tokens: None,
                cost_estimate: None,
                agent: meta.agent_hint.clone(),
                attempts,
                truncated,
            };
            info!(
                request_id = %meta.id,
                account_id = ?account_id,
                status = status_code,
                attempts,
                truncated,
                "streaming request finalized"
            );
            writer
                .enqueue(WriteOp::InsertUsageRecord(Box::new(record)))
                .await;
        });

        builder.body(Body::from_stream(teed)).unwrap_or_default()
    }

    async fn finalize(
        &self,
        meta: &RequestMeta,
        account_id: Option<Uuid>,
        status: u16,
        start: Instant,
        attempts: i64,
        truncated: bool,
    ) {
        let record = UsageRecord {
            request_id: meta.id,
            account_id,
            path: meta.path.clone(),
            method: meta.method.clone(),
            status: status as i64,
            timestamp: meta.timestamp,
            duration_ms: start.elapsed().as_millis() as i64,
            input_tokens: None,
            output_tokens: None,
            cost_estimate: None,
            agent: meta.agent_hint.clone(),
            attempts,
            truncated,
        };
        info!(
            request_id = %meta.id,
            account_id = ?account_id,
            status,
            attempts,
            "request finalized"
        );
        self.writer
            .enqueue(WriteOp::InsertUsageRecord(Box::new(record)))
            .await;
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::max_value())
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "transfer-encoding" | "keep-alive" | "te" | "trailer" | "upgrade"
    )
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": { "type": "upstream_unavailable", "message": message }
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}
