//! Response classifier: turns a raw upstream response plus the account
//! that produced it into a routing decision, and enqueues whatever
//! account-metadata mutations follow from that decision.

use axum::http::HeaderMap;
use chrono::Utc;
use uuid::Uuid;

use crate::models::FailoverReason;
use crate::provider::ProviderAdapter;
use crate::writer::{WriteOp, WriterHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Success,
    Failover(FailoverReason),
}

pub struct ResponseClassifier<'a> {
    adapter: &'a ProviderAdapter,
    writer: &'a WriterHandle,
}

impl<'a> ResponseClassifier<'a> {
    pub fn new(adapter: &'a ProviderAdapter, writer: &'a WriterHandle) -> Self {
        Self { adapter, writer }
    }

    pub async fn classify(
        &self,
        account_id: Uuid,
        status: u16,
        headers: &HeaderMap,
        start_new_session: bool,
    ) -> Decision {
        let signal = self.adapter.parse_rate_limit(status, headers);

        if signal.is_rate_limited {
            if let Some(reset_at) = signal.reset_at {
                self.writer
                    .enqueue(WriteOp::MarkRateLimited {
                        account_id,
                        reset_at,
                    })
                    .await;
                self.writer
                    .enqueue(WriteOp::UpdateRateLimitMeta {
                        account_id,
                        status_tag: signal.status_tag.clone(),
                        reset_at: Some(reset_at),
                        remaining: signal.remaining,
                    })
                    .await;
                return Decision::Failover(FailoverReason::RateLimit);
            }
        }

        if status != 200 {
            return Decision::Failover(FailoverReason::NonSuccess);
        }

        self.writer
            .enqueue(WriteOp::IncrementUsage {
                account_id,
                by: 1,
                mark_session: true,
                start_new_session,
            })
            .await;

        if signal.status_tag.is_some() || signal.remaining.is_some() {
            self.writer
                .enqueue(WriteOp::UpdateRateLimitMeta {
                    account_id,
                    status_tag: signal.status_tag,
                    reset_at: None,
                    remaining: signal.remaining,
                })
                .await;
        }

        if let Some(new_tier) = self.adapter.extract_tier_info(headers) {
            self.writer
                .enqueue(WriteOp::SetTier {
                    account_id,
                    tier: new_tier,
                })
                .await;
        }

        Decision::Success
    }
}

/// `true` when `reset_at` has already passed. Shared by the balancer's
/// eligibility filter and its lazy-clear scan so the two can't disagree on
/// what "expired" means.
pub fn rate_limit_expired(reset_at: Option<chrono::DateTime<Utc>>, now: chrono::DateTime<Utc>) -> bool {
    reset_at.map(|r| r <= now).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, Tier};
    use crate::store::Store;
    use crate::writer::Writer;
    use axum::http::HeaderValue;
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup() -> (Arc<Store>, WriterHandle, Uuid) {
        let store = Arc::new(Store::connect_in_memory().await);
        let account = Account {
            id: Uuid::new_v4(),
            name: "classifier-test".to_string(),
            provider: "anthropic".to_string(),
            tier: Tier::One,
            auth_type_raw: "api_key".to_string(),
            refresh_token: None,
            access_token: None,
            expires_at: None,
            api_key: Some("sk-test".to_string()),
            base_url: None,
            paused: false,
            rate_limit_status: None,
            rate_limit_reset_at: None,
            rate_limit_remaining: None,
            rate_limit_override_limit: None,
            rate_limit_override_window_minutes: None,
            session_start: None,
            session_request_count: 0,
            request_count: 0,
            total_requests: 0,
        };
        store.insert_account(&account).await.unwrap();
        let writer = Writer::spawn(store.clone(), 128, 64, Duration::from_millis(20));
        (store, writer, account.id)
    }

    #[tokio::test]
    async fn success_increments_usage_and_clears_nothing() {
        let (store, writer, account_id) = setup().await;
        let adapter = ProviderAdapter::new("https://api.default.test");
        let classifier = ResponseClassifier::new(&adapter, &writer);

        let decision = classifier.classify(account_id, 200, &HeaderMap::new(), true).await;
        assert_eq!(decision, Decision::Success);

        writer.shutdown().await;
        let fetched = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(fetched.total_requests, 1);
        assert!(fetched.rate_limit_reset_at.is_none());
    }

    #[tokio::test]
    async fn rate_limit_with_reset_marks_account_and_fails_over() {
        let (store, writer, account_id) = setup().await;
        let adapter = ProviderAdapter::new("https://api.default.test");
        let classifier = ResponseClassifier::new(&adapter, &writer);

        let mut headers = HeaderMap::new();
        headers.insert("retry-after-reset", HeaderValue::from_static("4102444800"));
        let decision = classifier.classify(account_id, 429, &headers, true).await;
        assert_eq!(decision, Decision::Failover(FailoverReason::RateLimit));

        writer.shutdown().await;
        let fetched = store.get_account(account_id).await.unwrap().unwrap();
        assert!(fetched.rate_limit_reset_at.is_some());
    }

    /// A 429 response must carry both a rate-limit signal and a parseable
    /// reset time to take the rate-limit branch; with no parseable reset it
    /// falls through to the generic non-success failover instead, and
    /// nothing is enqueued.
    #[tokio::test]
    async fn rate_limited_without_reset_at_falls_through_to_non_success() {
        let (store, writer, account_id) = setup().await;
        let adapter = ProviderAdapter::new("https://api.default.test");
        let classifier = ResponseClassifier::new(&adapter, &writer);

        let decision = classifier.classify(account_id, 429, &HeaderMap::new(), true).await;
        assert_eq!(decision, Decision::Failover(FailoverReason::NonSuccess));

        writer.shutdown().await;
        let fetched = store.get_account(account_id).await.unwrap().unwrap();
        assert!(fetched.rate_limit_reset_at.is_none());
    }

    #[tokio::test]
    async fn non_success_status_fails_over_without_marking_rate_limit() {
        let (store, writer, account_id) = setup().await;
        let adapter = ProviderAdapter::new("https://api.default.test");
        let classifier = ResponseClassifier::new(&adapter, &writer);

        let decision = classifier.classify(account_id, 529, &HeaderMap::new(), true).await;
        assert_eq!(decision, Decision::Failover(FailoverReason::NonSuccess));

        writer.shutdown().await;
        let fetched = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(fetched.total_requests, 0);
    }
}
