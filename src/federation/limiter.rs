//! Concurrency limiters
//!
//! Two flavors: a plain counting limiter for bounding CPU work, and a
//! key-scoped limiter that caps global fan-out while allowing at most
//! one in-flight operation per key. The keyed form preserves FIFO
//! ordering to a given peer without letting a slow peer block others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

/// Plain counting limiter
pub struct Limiter {
    sem: Arc<Semaphore>,
}

impl Limiter {
    pub fn new(permits: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Acquire a slot; released when the guard drops.
    pub async fn start(&self) -> OwnedSemaphorePermit {
        self.sem
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore closed")
    }
}

/// Key-scoped limiter: global cap of `permits`, at most one holder per key
pub struct KeyedLimiter {
    sem: Arc<Semaphore>,
    keys: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of a keyed operation
pub struct KeyedGuard {
    _permit: OwnedSemaphorePermit,
    _key_lock: OwnedMutexGuard<()>,
}

impl KeyedLimiter {
    pub fn new(permits: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(permits)),
            keys: StdMutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut keys = self.keys.lock().expect("keyed limiter poisoned");
        if keys.len() > 1024 {
            keys.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        keys.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Serialize on `key`, then take a global permit. Waiters for a busy
    /// key queue on the key lock without consuming global permits, so a
    /// backlog to one peer cannot starve the others.
    pub async fn start_key(&self, key: &str) -> KeyedGuard {
        let key_lock = self.key_lock(key).lock_owned().await;
        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("keyed limiter semaphore closed");
        KeyedGuard {
            _permit: permit,
            _key_lock: key_lock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn keyed_limiter_serializes_same_key() {
        let limiter = Arc::new(KeyedLimiter::new(8));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = limiter.start_key("same-peer").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keyed_limiter_allows_distinct_keys_in_parallel() {
        let limiter = Arc::new(KeyedLimiter::new(8));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..4 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = limiter.start_key(&format!("peer-{i}")).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn keyed_limiter_respects_global_cap() {
        let limiter = Arc::new(KeyedLimiter::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..6 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = limiter.start_key(&format!("peer-{i}")).await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
