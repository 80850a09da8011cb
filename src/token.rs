//! Token manager: produces a valid upstream access token per account,
//! performing single-flight OAuth refresh when the cached token has
//! expired.
//!
//! The single-flight pattern follows the notes in the design doc: a short
//! lock guards a map of per-account "refresh in progress" broadcast
//! futures. A caller either finds no entry (starts a refresh and inserts
//! one), or finds one and awaits it — never both drive a network call.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::Account;
use crate::writer::{WriteOp, WriterHandle};

const SKEW: ChronoDuration = ChronoDuration::seconds(60);
const REFRESH_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct RefreshResult {
    access_token: String,
    expires_at: DateTime<Utc>,
}

type RefreshOutcome = Result<RefreshResult, String>;

/// Process-wide, keyed by account id. Each entry exists only while a
/// refresh for that account is in flight.
struct InFlight {
    refreshes: Mutex<HashMap<Uuid, broadcast::Sender<RefreshOutcome>>>,
}

pub struct TokenManager {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    writer: WriterHandle,
    in_flight: InFlight,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, token_url: String, client_id: String, writer: WriterHandle) -> Self {
        Self {
            http,
            token_url,
            client_id,
            writer,
            in_flight: InFlight {
                refreshes: Mutex::new(HashMap::new()),
            },
        }
    }

    /// Returns a valid access token, refreshing if necessary.
    pub async fn get_valid_access_token(&self, account: &Account) -> Result<String, AppError> {
        if let Some(api_key) = &account.api_key {
            return Ok(api_key.clone());
        }

        let expires_at = account
            .expires_at
            .ok_or_else(|| AppError::Auth("oauth account missing expires_at".to_string()))?;

        if Utc::now() < expires_at - SKEW {
            return account
                .access_token
                .clone()
                .ok_or_else(|| AppError::Auth("oauth account missing access_token".to_string()));
        }

        let refresh_token = account
            .refresh_token
            .clone()
            .ok_or_else(|| AppError::Auth("oauth account missing refresh_token".to_string()))?;

        let outcome = self.refresh_single_flight(account.id, refresh_token).await;
        match outcome {
            Ok(result) => Ok(result.access_token),
            Err(message) => Err(classify_refresh_error(&message)),
        }
    }

    /// Ensures at most one network call per account id is in flight at a
    /// time; concurrent callers subscribe to the same broadcast result.
    async fn refresh_single_flight(&self, account_id: Uuid, refresh_token: String) -> RefreshOutcome {
        let mut maybe_rx = None;
        {
            let mut refreshes = self.in_flight.refreshes.lock().await;
            if let Some(tx) = refreshes.get(&account_id) {
                maybe_rx = Some(tx.subscribe());
            } else {
                let (tx, _rx) = broadcast::channel(1);
                refreshes.insert(account_id, tx);
            }
        }

        if let Some(mut rx) = maybe_rx {
            return rx
                .recv()
                .await
                .unwrap_or_else(|_| Err("refresh broadcast dropped".to_string()));
        }

        let outcome = self.do_refresh(account_id, &refresh_token).await;

        let tx = {
            let mut refreshes = self.in_flight.refreshes.lock().await;
            refreshes.remove(&account_id)
        };
        if let Some(tx) = tx {
            let _ = tx.send(outcome.clone());
        }

        outcome
    }

    /// Performs the actual token endpoint exchange. Never holds the
    /// in-flight map lock across this call.
    async fn do_refresh(&self, account_id: Uuid, refresh_token: &str) -> RefreshOutcome {
        let request = self
            .http
            .post(&self.token_url)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": self.client_id,
            }))
            .send();

        let response = match tokio::time::timeout(REFRESH_DEADLINE, request).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => return Err(format!("transient:{err}")),
            Err(_) => return Err("transient:refresh timed out".to_string()),
        };

        let status = response.status();
        if status.is_client_error() {
            return Err(format!("auth:refresh rejected with status {status}"));
        }
        if !status.is_success() {
            return Err(format!("transient:refresh failed with status {status}"));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
            refresh_token: Option<String>,
        }

        let parsed: TokenResponse = match response.json().await {
            Ok(v) => v,
            Err(err) => return Err(format!("transient:{err}")),
        };

        let expires_at = Utc::now() + ChronoDuration::seconds(parsed.expires_in);

        self.writer
            .enqueue(WriteOp::UpdateTokens {
                account_id,
                access_token: parsed.access_token.clone(),
                expires_at,
                refresh_token: parsed.refresh_token,
            })
            .await;

        Ok(RefreshResult {
            access_token: parsed.access_token,
            expires_at,
        })
    }
}

fn classify_refresh_error(message: &str) -> AppError {
    if let Some(rest) = message.strip_prefix("auth:") {
        AppError::Auth(rest.to_string())
    } else if let Some(rest) = message.strip_prefix("transient:") {
        AppError::TransientAuth(rest.to_string())
    } else {
        AppError::TransientAuth(message.to_string())
    }
}

pub type SharedTokenManager = Arc<TokenManager>;
