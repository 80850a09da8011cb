//! Admin HTTP surface: account management, usage pagination, log
//! streaming, and the direct-account-creation path that stands in for the
//! out-of-scope OAuth provisioning UI.

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Account, Page, PageParams, RedactedAccount, Tier};
use crate::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn list_accounts(State(state): State<AppState>) -> AppResult<Json<Vec<RedactedAccount>>> {
    let accounts = state.store.list_accounts().await?;
    Ok(Json(accounts.iter().map(Account::to_redacted).collect()))
}

pub async fn pause_account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<axum::http::StatusCode> {
    require_account(&state, id).await?;
    state.store.set_paused(id, true).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn resume_account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<axum::http::StatusCode> {
    require_account(&state, id).await?;
    state.store.set_paused(id, false).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SetTierRequest {
    pub tier: i64,
}

pub async fn set_tier(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SetTierRequest>,
) -> AppResult<axum::http::StatusCode> {
    require_account(&state, id).await?;
    Tier::try_from(payload.tier).map_err(|e| AppError::Validation(e.to_string()))?;
    state
        .store
        .set_tier(state.store.pool(), id, payload.tier)
        .await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitOverrideRequest {
    pub enabled: bool,
    pub custom_limit: Option<i64>,
    pub reset_window_minutes: Option<i64>,
}

pub async fn set_rate_limit_override(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RateLimitOverrideRequest>,
) -> AppResult<axum::http::StatusCode> {
    require_account(&state, id).await?;
    if payload.enabled {
        state
            .store
            .set_rate_limit_override(id, payload.custom_limit, payload.reset_window_minutes)
            .await?;
    } else {
        state.store.set_rate_limit_override(id, None, None).await?;
    }
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DeleteAccountRequest {
    pub confirm_name: String,
}

pub async fn delete_account(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(payload): Json<DeleteAccountRequest>,
) -> AppResult<axum::http::StatusCode> {
    if payload.confirm_name != name {
        return Err(AppError::Validation(
            "confirm_name does not match account name".to_string(),
        ));
    }
    let deleted = state.store.delete_account_by_name(&name).await?;
    if !deleted {
        return Err(AppError::NotFound(format!("account {name} not found")));
    }
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn list_requests(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> AppResult<Json<Page<crate::models::UsageRecord>>> {
    let (items, total) = state.store.list_usage(&params).await?;
    Ok(Json(Page {
        items,
        total,
        limit: params.limit_or_default(),
        offset: params.offset_or_default(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DirectAccountRequest {
    pub name: String,
    pub tier: i64,
    pub api_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DirectAccountResponse {
    pub id: Uuid,
}

/// `POST /api/accounts/direct` — the one provisioning path implemented in
/// full; OAuth init/complete are stubbed below since modeling an external
/// authorization-code dance is out of scope here.
pub async fn create_direct_account(
    State(state): State<AppState>,
    Json(payload): Json<DirectAccountRequest>,
) -> AppResult<(axum::http::StatusCode, Json<DirectAccountResponse>)> {
    let tier = Tier::try_from(payload.tier).map_err(|e| AppError::Validation(e.to_string()))?;

    let account = Account {
        id: Uuid::new_v4(),
        name: payload.name,
        provider: "anthropic".to_string(),
        tier,
        auth_type_raw: "api_key".to_string(),
        refresh_token: None,
        access_token: None,
        expires_at: None,
        api_key: Some(payload.api_key),
        base_url: payload.base_url,
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

    state.store.insert_account(&account).await?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(DirectAccountResponse { id: account.id }),
    ))
}

pub async fn oauth_init() -> AppError {
    AppError::NotImplemented(
        "OAuth provisioning is out of scope; use POST /api/accounts/direct".to_string(),
    )
}

pub async fn oauth_complete() -> AppError {
    AppError::NotImplemented(
        "OAuth provisioning is out of scope; use POST /api/accounts/direct".to_string(),
    )
}

/// `GET /api/logs/stream` — tails the process's own log output and
/// republishes new lines as SSE. See [`crate::logging`] for the writer side.
pub async fn logs_stream(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.logging.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter_map(|line| async move { line.ok().map(|l| Ok(Event::default().data(l))) });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn require_account(state: &AppState, id: Uuid) -> AppResult<()> {
    state
        .store
        .get_account(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("account {id} not found")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::logging::LoggingHandle;
    use crate::orchestrator::Orchestrator;
    use crate::store::Store;
    use crate::token::TokenManager;
    use crate::writer::Writer;
    use std::sync::Arc;

    async fn test_state() -> AppState {
        let store = Arc::new(Store::connect_in_memory().await);
        let config = Config::default();
        let writer = Writer::spawn(store.clone(), 128, 64, Duration::from_millis(20));
        let token_manager = Arc::new(TokenManager::new(
            reqwest::Client::new(),
            config.oauth_token_url.clone(),
            config.oauth_client_id.clone(),
            writer.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            &config,
            token_manager,
            writer,
        ));
        AppState {
            store,
            orchestrator,
            logging: Arc::new(LoggingHandle::test_handle()),
        }
    }

    async fn seed_account(state: &AppState, name: &str) -> Uuid {
        let account = Account {
            id: Uuid::new_v4(),
            name: name.to_string(),
            provider: "anthropic".to_string(),
            tier: crate::models::Tier::One,
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
        state.store.insert_account(&account).await.unwrap();
        account.id
    }

    /// A client sending camelCase field names must not silently
    /// deserialize them to `None`.
    #[test]
    fn rate_limit_override_request_accepts_camel_case_wire_fields() {
        let payload: RateLimitOverrideRequest = serde_json::from_str(
            r#"{"enabled":true,"customLimit":500,"resetWindowMinutes":60}"#,
        )
        .unwrap();
        assert!(payload.enabled);
        assert_eq!(payload.custom_limit, Some(500));
        assert_eq!(payload.reset_window_minutes, Some(60));
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips() {
        let state = test_state().await;
        let id = seed_account(&state, "pausable").await;

        pause_account(State(state.clone()), Path(id)).await.unwrap();
        let fetched = state.store.get_account(id).await.unwrap().unwrap();
        assert!(fetched.paused);

        resume_account(State(state.clone()), Path(id)).await.unwrap();
        let fetched = state.store.get_account(id).await.unwrap().unwrap();
        assert!(!fetched.paused);
    }

    #[tokio::test]
    async fn set_tier_rejects_invalid_tier_before_touching_the_store() {
        let state = test_state().await;
        let id = seed_account(&state, "tierable").await;

        let result = set_tier(
            State(state.clone()),
            Path(id),
            Json(SetTierRequest { tier: 7 }),
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let fetched = state.store.get_account(id).await.unwrap().unwrap();
        assert_eq!(fetched.tier.weight(), 1);
    }

    #[tokio::test]
    async fn set_tier_applies_a_valid_tier() {
        let state = test_state().await;
        let id = seed_account(&state, "tierable2").await;

        set_tier(
            State(state.clone()),
            Path(id),
            Json(SetTierRequest { tier: 20 }),
        )
        .await
        .unwrap();

        let fetched = state.store.get_account(id).await.unwrap().unwrap();
        assert_eq!(fetched.tier.weight(), 20);
    }

    #[tokio::test]
    async fn rate_limit_override_enabled_false_clears_existing_override() {
        let state = test_state().await;
        let id = seed_account(&state, "overridable").await;
        state
            .store
            .set_rate_limit_override(id, Some(100), Some(30))
            .await
            .unwrap();

        set_rate_limit_override(
            State(state.clone()),
            Path(id),
            Json(RateLimitOverrideRequest {
                enabled: false,
                custom_limit: Some(999),
                reset_window_minutes: Some(999),
            }),
        )
        .await
        .unwrap();

        let fetched = state.store.get_account(id).await.unwrap().unwrap();
        assert!(fetched.rate_limit_override_limit.is_none());
    }

    #[tokio::test]
    async fn delete_account_rejects_mismatched_confirm_name() {
        let state = test_state().await;
        seed_account(&state, "deleteme").await;

        let result = delete_account(
            State(state.clone()),
            Path("deleteme".to_string()),
            Json(DeleteAccountRequest {
                confirm_name: "not-it".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(state
            .store
            .get_account_by_name("deleteme")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn delete_account_removes_on_matching_confirm_name() {
        let state = test_state().await;
        seed_account(&state, "deleteme2").await;

        delete_account(
            State(state.clone()),
            Path("deleteme2".to_string()),
            Json(DeleteAccountRequest {
                confirm_name: "deleteme2".to_string(),
            }),
        )
        .await
        .unwrap();

        assert!(state
            .store
            .get_account_by_name("deleteme2")
            .await
            .unwrap()
            .is_none());
    }
}
