use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

/// Per-key mutual exclusion with double-checked work-elision.
///
/// One `KeyedSingleflight` instance always produces the same result type
/// `T` for a given key (each engine owns exactly one, keyed by symbol or
/// date). Two maps underpin it: a never-shrinking table of per-key
/// exclusive locks (used when `once = false`, plain mutual exclusion), and
/// a table of in-flight calls (used when `once = true`) that coalesces
/// concurrent callers onto a single execution of `work`. A call entry is
/// removed once `work` completes, so the next, non-overlapping invocation
/// for that key runs fresh rather than replaying a stale cached result.
pub struct KeyedSingleflight<K, T> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
    calls: Mutex<HashMap<K, Arc<OnceCell<T>>>>,
}

impl<K, T> Default for KeyedSingleflight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> KeyedSingleflight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the exclusive lock for `key`, run `work`, release. When
    /// `once` is true, concurrent callers for the same key that arrive
    /// while `work` is still running share its result instead of queueing
    /// to run their own copy.
    pub async fn execute<F, Fut>(&self, key: K, once: bool, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !once {
            let lock = self.lock_for(key).await;
            let _guard = lock.lock().await;
            return work().await;
        }

        let call = self.call_for(key.clone()).await;
        let value = call.get_or_init(work).await.clone();
        self.retire_call(&key, &call).await;
        value
    }

    async fn lock_for(&self, key: K) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    async fn call_for(&self, key: K) -> Arc<OnceCell<T>> {
        let mut calls = self.calls.lock().await;
        Arc::clone(calls.entry(key).or_insert_with(|| Arc::new(OnceCell::new())))
    }

    async fn retire_call(&self, key: &K, call: &Arc<OnceCell<T>>) {
        let mut calls = self.calls.lock().await;
        if let Some(current) = calls.get(key) {
            if Arc::ptr_eq(current, call) {
                calls.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn once_coalesces_concurrent_callers() {
        let sf: Arc<KeyedSingleflight<String, i32>> = Arc::new(KeyedSingleflight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = Arc::clone(&sf);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                sf.execute("AAPL".to_string(), true, || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        42
                    }
                })
                .await
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        assert!(results.iter().all(|&r| r == 42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subsequent_non_overlapping_calls_rerun_work() {
        let sf: KeyedSingleflight<String, i32> = KeyedSingleflight::new();
        let calls = AtomicUsize::new(0);

        let first = sf
            .execute("MSFT".to_string(), true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                1
            })
            .await;
        let second = sf
            .execute("MSFT".to_string(), true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                2
            })
            .await;

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn without_once_every_caller_runs_work_but_serializes() {
        let sf: Arc<KeyedSingleflight<String, usize>> = Arc::new(KeyedSingleflight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let sf = Arc::clone(&sf);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                sf.execute("GOOG".to_string(), false, || {
                    let calls = Arc::clone(&calls);
                    async move { calls.fetch_add(1, Ordering::SeqCst) }
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
