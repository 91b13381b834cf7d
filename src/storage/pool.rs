//! Storage Backend (C4)
//!
//! A bounded pool of `rusqlite::Connection`s behind `with_connection`/
//! `with_transaction`. Acquisition is async (a `tokio::sync::Semaphore`
//! permit plus a blocking-pool handoff); the connection itself never
//! crosses a suspension point while checked out, matching the "no lock held
//! across an await" rule for this store.
//!
//! `f` runs behind a bounded retry-with-backoff loop: a SQLite busy/locked
//! error (`EngineError::is_transient`) re-runs `f` on a fresh acquisition up
//! to `MAX_ATTEMPTS` times before giving up and surfacing
//! `EngineError::TransientBackend`. This requires `f` itself to be safely
//! re-runnable (`Fn`, not `FnOnce`) — every call site in this crate already
//! only borrows its captured state rather than consuming it, so this holds
//! without further changes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::timeout;

use crate::error::{EngineError, Result};
use crate::storage::migrations;

/// Bounded retry count for transient (busy/locked) database errors, plus the
/// starting backoff; each subsequent attempt waits `BASE_BACKOFF * attempt`.
const MAX_ATTEMPTS: u32 = 4;
const BASE_BACKOFF: Duration = Duration::from_millis(20);

struct Slot {
    conn: Connection,
}

struct Shared {
    path: String,
    in_memory: bool,
    slots: std::sync::Mutex<Vec<Slot>>,
}

/// A bounded pool of connections to a single SQLite database file.
///
/// Connections are handed out one at a time via `with_connection`; the
/// store's single-writer rule is enforced by SQLite itself (WAL mode allows
/// concurrent readers but serializes writers), the pool just bounds how many
/// connections exist at once and how long a caller waits for one.
pub struct Pool {
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl Pool {
    /// Open (creating if necessary) the database at `path`, run all pending
    /// migrations, and prewarm `size` connections.
    pub fn open(path: impl AsRef<Path>, size: usize, acquire_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let in_memory = path.as_os_str() == ":memory:";
        let path_str = path.to_string_lossy().to_string();

        if !in_memory {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let size = size.max(1);
        let mut slots = Vec::with_capacity(size);
        for i in 0..size {
            // An in-memory pool of >1 connections would each see an
            // independent empty database, so only the first connection is
            // real there; callers that want in-memory concurrency should
            // keep pool_size at 1 for Config::in_memory.
            if in_memory && i > 0 {
                break;
            }
            let mut conn = open_one(&path_str, in_memory)?;
            if i == 0 {
                migrations::apply_migrations(&mut conn)?;
            }
            slots.push(Slot { conn });
        }
        let available = slots.len();

        Ok(Self {
            shared: Arc::new(Shared {
                path: path_str,
                in_memory,
                slots: std::sync::Mutex::new(slots),
            }),
            semaphore: Arc::new(Semaphore::new(available)),
            acquire_timeout,
        })
    }

    /// Scoped acquisition: `f` runs with an exclusive connection, which is
    /// returned to the pool on every exit path, including panics inside `f`.
    ///
    /// A busy/locked error retries `f` on a fresh acquisition, with backoff,
    /// up to `MAX_ATTEMPTS` times before surfacing
    /// `EngineError::TransientBackend`. `f` must tolerate being called more
    /// than once — only the case of a non-transient error or the final
    /// exhausted attempt reaches the caller.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let permit = self.acquire_permit().await?;
            let shared = Arc::clone(&self.shared);
            let f = Arc::clone(&f);
            let result = tokio::task::spawn_blocking(move || {
                let mut guard = shared.slots.lock().expect("pool mutex poisoned");
                let mut slot = guard.pop().expect("permit implies a free slot");
                drop(guard);

                if !health_check(&slot.conn) {
                    // Best-effort replacement. If re-opening also fails, keep
                    // the broken connection in play and let `f` surface the
                    // underlying database error.
                    if let Ok(fresh) = open_one(&shared.path, shared.in_memory) {
                        slot.conn = fresh;
                    }
                }

                let outcome = f(&slot.conn);

                shared.slots.lock().expect("pool mutex poisoned").push(slot);
                outcome
            })
            .await
            .map_err(|e| EngineError::internal(format!("pool worker panicked: {e}")))?;
            drop(permit);

            match result {
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let backoff = BASE_BACKOFF * attempt;
                    tracing::warn!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "transient database error, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(EngineError::TransientBackend(format!(
                        "database still busy/locked after {MAX_ATTEMPTS} attempts: {e}"
                    )));
                }
                other => return other,
            }
        }
    }

    /// Like `with_connection`, but wraps `f` in a transaction: commits on
    /// `Ok`, rolls back on `Err`. Inherits `with_connection`'s bounded retry,
    /// so `f` may run more than once if an earlier attempt's `BEGIN`/`COMMIT`
    /// hit a transient error before `f` itself ran.
    pub async fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&rusqlite::Transaction<'_>) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        self.with_connection(move |conn| {
            // SAFETY-free: `unchecked_transaction` avoids requiring `&mut
            // Connection`, matching the shared `&Connection` surface the
            // rest of this module exposes.
            let tx = conn.unchecked_transaction()?;
            let result = f(&tx);
            match result {
                Ok(value) => {
                    tx.commit()?;
                    Ok(value)
                }
                Err(e) => {
                    let _ = tx.rollback();
                    Err(e)
                }
            }
        })
        .await
    }

    async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>> {
        match timeout(self.acquire_timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(EngineError::internal("pool semaphore closed")),
            Err(_) => Err(EngineError::ResourceExhausted(
                "timed out waiting for a database connection".into(),
            )),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.shared.in_memory
    }
}

fn open_one(path: &str, in_memory: bool) -> Result<Connection> {
    let conn = if in_memory {
        Connection::open_in_memory()?
    } else {
        Connection::open(path)?
    };
    configure_connection(&conn)?;
    Ok(conn)
}

/// Pragmas applied to every connection on open: WAL journaling, a bounded
/// busy-timeout instead of an immediate `SQLITE_BUSY`, foreign-key
/// enforcement, and NORMAL synchronous mode (safe under WAL, faster than
/// FULL).
fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn health_check(conn: &Connection) -> bool {
    conn.query_row("SELECT 1", [], |_| Ok(())).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_connection_roundtrips() {
        let pool = Pool::open(":memory:", 1, Duration::from_secs(1)).unwrap();
        let n: i64 = pool
            .with_connection(|conn| Ok(conn.query_row("SELECT 1+1", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn with_transaction_rolls_back_on_error() {
        let pool = Pool::open(":memory:", 1, Duration::from_secs(1)).unwrap();
        pool.with_connection(|conn| {
            conn.execute_batch("CREATE TABLE t (x INTEGER)")?;
            Ok(())
        })
        .await
        .unwrap();

        let outcome: Result<()> = pool
            .with_transaction(|tx| {
                tx.execute("INSERT INTO t (x) VALUES (1)", [])?;
                Err(EngineError::invalid_input("rollback me"))
            })
            .await;
        assert!(outcome.is_err());

        let count: i64 = pool
            .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn with_transaction_commits_on_success() {
        let pool = Pool::open(":memory:", 1, Duration::from_secs(1)).unwrap();
        pool.with_connection(|conn| {
            conn.execute_batch("CREATE TABLE t (x INTEGER)")?;
            Ok(())
        })
        .await
        .unwrap();

        pool.with_transaction(|tx| {
            tx.execute("INSERT INTO t (x) VALUES (1)", [])?;
            Ok(())
        })
        .await
        .unwrap();

        let count: i64 = pool
            .with_connection(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    fn busy_error() -> EngineError {
        EngineError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error { code: rusqlite::ErrorCode::DatabaseBusy, extended_code: 5 },
            None,
        ))
    }

    #[tokio::test]
    async fn transient_errors_retry_then_succeed() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let pool = Pool::open(":memory:", 1, Duration::from_secs(1)).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_for_closure = Arc::clone(&attempts);

        let n: i64 = pool
            .with_connection(move |conn| {
                if attempts_for_closure.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(busy_error());
                }
                Ok(conn.query_row("SELECT 1+1", [], |r| r.get(0))?)
            })
            .await
            .unwrap();

        assert_eq!(n, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transient_errors_exhaust_into_transient_backend() {
        let pool = Pool::open(":memory:", 1, Duration::from_secs(1)).unwrap();
        let result: Result<()> = pool.with_connection(|_conn| Err(busy_error())).await;
        assert!(matches!(result, Err(EngineError::TransientBackend(_))));
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let pool = Pool::open(":memory:", 1, Duration::from_secs(1)).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_for_closure = Arc::clone(&attempts);

        let result: Result<()> = pool
            .with_connection(move |_conn| {
                attempts_for_closure.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::invalid_input("not a busy error"))
            })
            .await;

        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
