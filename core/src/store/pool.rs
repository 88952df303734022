//! Async access to the ledger.
//!
//! Each call borrows one pooled connection on tokio's blocking pool, so
//! independent queries issued concurrently run in parallel up to the pool
//! size. An in-memory database gets a single connection (a second one would
//! be a different database).

use super::Ledger;
use crate::{
    config::DatabaseConfig,
    error::{RecoveryError, RecoveryResult},
};
use log::debug;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct PoolInner {
    ledgers: Vec<Mutex<Ledger>>,
    next:    AtomicUsize,
}

#[derive(Clone)]
pub struct StorePool {
    inner: Arc<PoolInner>,
}

impl StorePool {
    /// Open `pool_size` connections to `config.path` and migrate through
    /// the first. `:memory:` is mapped to a single private connection.
    pub fn open(config: &DatabaseConfig) -> RecoveryResult<Self> {
        if config.pool_size == 0 {
            return Err(RecoveryError::config("database.pool_size must be at least 1"));
        }
        if config.path == ":memory:" {
            let ledger = Ledger::in_memory()?;
            ledger.migrate()?;
            return Ok(Self::from_ledger(ledger));
        }
        let timeout = Duration::from_millis(config.busy_timeout_ms);
        let first = Ledger::open(&config.path, timeout)?;
        first.migrate()?;
        let mut ledgers = vec![Mutex::new(first)];
        for _ in 1..config.pool_size {
            ledgers.push(Mutex::new(Ledger::open(&config.path, timeout)?));
        }
        debug!("opened {} connections to {}", ledgers.len(), config.path);
        Ok(Self::from_ledgers(ledgers))
    }

    /// Wrap an already prepared ledger. Used by tests and by callers that
    /// manage the schema themselves.
    pub fn from_ledger(ledger: Ledger) -> Self {
        Self::from_ledgers(vec![Mutex::new(ledger)])
    }

    fn from_ledgers(ledgers: Vec<Mutex<Ledger>>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                ledgers,
                next: AtomicUsize::new(0),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.ledgers.len()
    }

    /// Run `f` against one connection on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> RecoveryResult<T>
    where
        F: FnOnce(&Ledger) -> RecoveryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let slot = inner.next.fetch_add(1, Ordering::Relaxed) % inner.ledgers.len();
            let ledger = inner.ledgers[slot].lock();
            f(&ledger)
        })
        .await?
    }

    /// Run `f` synchronously on the first connection. For setup code that
    /// is not inside a runtime (seeding, tests).
    pub fn with_ledger<T>(&self, f: impl FnOnce(&Ledger) -> RecoveryResult<T>) -> RecoveryResult<T> {
        let ledger = self.inner.ledgers[0].lock();
        f(&ledger)
    }
}
