//! Write Batcher (part of C12)
//!
//! Coalesces contiguous mutations into a single commit. Callers submit a
//! unit of work; the batcher holds it open for a short window (or until
//! `max_ops` accumulate), then runs everything queued in one transaction,
//! each unit wrapped in its own `SAVEPOINT` so one failing unit doesn't roll
//! back its neighbors. Every unit still produces exactly one ledger entry
//! and units run in submission order.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Transaction;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{EngineError, Result};
use crate::storage::Pool;

type Op = Box<dyn FnOnce(&Transaction) -> Result<Value> + Send>;

struct Request {
    op: Op,
    reply: oneshot::Sender<Result<Value>>,
}

/// A handle to the background batching task. Cheap to clone; every clone
/// shares the same queue.
#[derive(Clone)]
pub struct WriteBatcher {
    tx: mpsc::UnboundedSender<Request>,
}

impl WriteBatcher {
    pub fn spawn(pool: Arc<Pool>, flush: Duration, max_ops: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(pool, rx, flush, max_ops));
        Self { tx }
    }

    /// Queue `op` and await its result. `op` runs inside a transaction
    /// shared with other units submitted in the same window, but is
    /// isolated from their failures via a savepoint.
    pub async fn submit<F>(&self, op: F) -> Result<Value>
    where
        F: FnOnce(&Transaction) -> Result<Value> + Send + 'static,
    {
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(Request { op: Box::new(op), reply })
            .map_err(|_| EngineError::internal("write batcher has shut down"))?;
        reply_rx
            .await
            .map_err(|_| EngineError::internal("write batcher dropped its reply"))?
    }
}

fn run_in_savepoint(tx: &Transaction, op: Op) -> Result<Value> {
    tx.execute_batch("SAVEPOINT batch_unit")?;
    match op(tx) {
        Ok(value) => {
            tx.execute_batch("RELEASE SAVEPOINT batch_unit")?;
            Ok(value)
        }
        Err(e) => {
            let _ = tx.execute_batch("ROLLBACK TO SAVEPOINT batch_unit; RELEASE SAVEPOINT batch_unit");
            Err(e)
        }
    }
}

async fn run(pool: Arc<Pool>, mut rx: mpsc::UnboundedReceiver<Request>, flush: Duration, max_ops: usize) {
    let max_ops = max_ops.max(1);
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = tokio::time::Instant::now() + flush;
        while batch.len() < max_ops {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(req)) => batch.push(req),
                _ => break,
            }
        }

        // `with_transaction` may retry this closure if `BEGIN`/`COMMIT`
        // itself hits a transient busy/locked error — guard the batch behind
        // a take-once cell so a retried call never re-runs (and so never
        // double-executes) the queued ops. A retry that lands after the
        // batch already ran just re-commits an empty, no-op transaction.
        let pending = std::sync::Mutex::new(Some(batch));
        let outcome = pool
            .with_transaction(move |tx| {
                let Some(items) = pending.lock().expect("batch mutex poisoned").take() else {
                    return Ok(Vec::new());
                };
                let mut replies = Vec::with_capacity(items.len());
                for req in items {
                    let result = run_in_savepoint(tx, req.op);
                    replies.push((req.reply, result));
                }
                Ok(replies)
            })
            .await;

        if let Ok(replies) = outcome {
            for (reply, result) in replies {
                let _ = reply.send(result);
            }
        }
        // If the outer transaction itself failed to commit (rare: a pool
        // acquisition or disk error), the queued senders were consumed by
        // the closure above and dropped with it; each caller's `submit`
        // then observes a "dropped reply" error instead of hanging.
    }
}
