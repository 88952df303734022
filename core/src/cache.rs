//! Process-local TTL cache for computed analytics views.
//!
//! RULE: The cache is infallible. A miss is the only failure mode, so a
//! storage error can never hide behind it, and nothing but successfully
//! computed values is ever stored.
//!
//! Expiry is lazy on read and eager on the periodic sweep. The sweeper is
//! owned by the cache instance and stopped through `shutdown`.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Build a cache key of the form `prefix:part:part…`.
pub fn cache_key(prefix: &str, parts: &[&str]) -> String {
    let mut key = String::from(prefix);
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

/// Anything that can drop cached entries by key prefix.
pub trait Invalidate: Send + Sync {
    fn invalidate_prefix(&self, prefix: &str) -> usize;
}

struct CacheEntry<V> {
    value:      V,
    expires_at: DateTime<Utc>,
}

enum SweepMessage {
    Shutdown,
}

struct Sweeper {
    tx:   mpsc::Sender<SweepMessage>,
    task: JoinHandle<()>,
}

pub struct QueryCache<V> {
    entries:     Mutex<HashMap<String, CacheEntry<V>>>,
    default_ttl: Duration,
    clock:       Arc<dyn Clock>,
    sweeper:     Mutex<Option<Sweeper>>,
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
    pub fn new(default_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
            clock,
            sweeper: Mutex::new(None),
        }
    }

    /// The value for `key` if present and not yet expired.
    /// An expired entry is removed on the way out.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if now < entry.expires_at => {
                debug!("cache hit {key}");
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                debug!("cache expired {key}");
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let step = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let expires_at = self.clock.now() + step;
        self.entries
            .lock()
            .insert(key.into(), CacheEntry { value, expires_at });
    }

    /// Remove one key, or everything when `key` is `None`.
    pub fn clear(&self, key: Option<&str>) {
        let mut entries = self.entries.lock();
        match key {
            Some(k) => {
                entries.remove(k);
            }
            None => entries.clear(),
        }
    }

    /// Remove every key starting with `prefix`. Returns how many went.
    pub fn clear_by_prefix(&self, prefix: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        before - entries.len()
    }

    /// Drop every expired entry. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now < e.expires_at);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("cache sweep removed {removed} entries");
        }
        removed
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the periodic sweeper. A second call is a no-op.
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel::<SweepMessage>(1);
        let task = tokio::spawn(Self::sweep_loop(Arc::downgrade(self), interval, rx));
        *slot = Some(Sweeper { tx, task });
    }

    async fn sweep_loop(cache: Weak<Self>, interval: Duration, mut rx: mpsc::Receiver<SweepMessage>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match cache.upgrade() {
                        Some(cache) => { cache.sweep(); }
                        None => break,
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Some(SweepMessage::Shutdown) | None => break,
                    }
                }
            }
        }
        debug!("cache sweeper stopped");
    }

    /// Stop the sweeper and drop every entry.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(Sweeper { tx, task }) = sweeper {
            let _ = tx.send(SweepMessage::Shutdown).await;
            let _ = task.await;
        }
        self.clear(None);
    }
}

impl<V: Clone + Send + Sync + 'static> Invalidate for QueryCache<V> {
    fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.clear_by_prefix(prefix)
    }
}
