//! Keyed single-flight execution.
//!
//! Concurrent plan preparations for the same `projectId:action` must not
//! each call the generator; the first caller runs the work and the rest
//! await its result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

/// Deduplicates concurrent async work by key. Results are broadcast to all
/// waiters; the winning caller's value is what everyone sees.
pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    inflight: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` under `key`, or await the in-flight run for that key.
    ///
    /// If the in-flight leader disappears without publishing (cancelled
    /// task), one waiter promotes itself and runs its own `work`.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send,
    {
        let mut work = Some(work);
        loop {
            let leader_tx = {
                let mut inflight = self.inflight.lock().await;
                if let Some(rx) = inflight.get(key) {
                    Err(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    Ok(tx)
                }
            };

            match leader_tx {
                Ok(tx) => {
                    let work = work.take().expect("leader runs once");
                    let value = work().await;
                    // Remove before broadcasting so late arrivals start fresh.
                    self.inflight.lock().await.remove(key);
                    let _ = tx.send(Some(value.clone()));
                    return value;
                }
                Err(mut rx) => {
                    loop {
                        if let Some(value) = rx.borrow().clone() {
                            return value;
                        }
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    if let Some(value) = rx.borrow().clone() {
                        return value;
                    }
                    // Leader vanished without a value; clear the stale slot
                    // and contend for leadership.
                    let mut inflight = self.inflight.lock().await;
                    if inflight
                        .get(key)
                        .is_some_and(|slot| slot.has_changed().is_err())
                    {
                        inflight.remove(key);
                    }
                }
            }
        }
    }
}

/// Shared handle used across preparation tasks.
pub type SharedSingleFlight<T> = Arc<SingleFlight<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flight
                    .run("p1:echo", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flight = SingleFlight::<&'static str>::new();
        let a = flight.run("k1", || async { "a" }).await;
        let b = flight.run("k2", || async { "b" }).await;
        assert_eq!((a, b), ("a", "b"));
    }

    #[tokio::test]
    async fn test_sequential_runs_not_deduped() {
        let flight = SingleFlight::<u32>::new();
        let calls = AtomicU32::new(0);
        for _ in 0..3 {
            flight
                .run("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst)
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
