//! Coalesces concurrent slow-loader invocations for the same key.
//!
//! At most one loader call is in flight per key at any moment. Every other
//! caller for that key subscribes to the in-flight "topic" and receives the
//! same result the executor gets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

use crate::error::{CacheError, ErrorHook, LoaderError};
use crate::value::CacheValue;

pub type LoadResult = Result<Arc<dyn CacheValue>, LoaderError>;

/// A user-supplied slow producer. Must be safe to invoke from a background
/// task and may await arbitrarily long.
pub type Loader = Arc<dyn Fn() -> BoxFuture<'static, LoadResult> + Send + Sync>;

struct Topic {
    subscribers: Vec<oneshot::Sender<LoadResult>>,
}

/// Per-key loader coalescing with a bounded wait.
pub struct SingleFlight {
    topics: Arc<Mutex<HashMap<Arc<str>, Topic>>>,
    max_wait: Duration,
    on_error: Option<ErrorHook>,
}

impl SingleFlight {
    pub fn new(max_wait: Duration, on_error: Option<ErrorHook>) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            max_wait,
            on_error,
        }
    }

    /// Run (or join) `loader` for `key`. Returns `(value, was_slow)` where
    /// `was_slow` is `true` only for the caller that actually executed the
    /// loader.
    pub async fn get(&self, key: &Arc<str>, loader: Loader) -> Result<(Arc<dyn CacheValue>, bool), CacheError> {
        if key.is_empty() {
            return Err(CacheError::InvalidParam("key must not be empty".into()));
        }

        let (tx, rx) = oneshot::channel();
        let was_slow;
        {
            let mut topics = self.topics.lock().await;
            if let Some(topic) = topics.get_mut(key.as_ref()) {
                topic.subscribers.push(tx);
                was_slow = false;
            } else {
                topics.insert(key.clone(), Topic { subscribers: vec![tx] });
                was_slow = true;
            }
        }

        if was_slow {
            self.spawn_executor(key.clone(), loader);
        }

        match timeout(self.max_wait, rx).await {
            Ok(Ok(result)) => result.map(|v| (v, was_slow)).map_err(CacheError::Loader),
            Ok(Err(_)) => Err(CacheError::Loader(LoaderError::from_message(
                "single-flight topic was dropped before publishing",
            ))),
            Err(_) => Err(CacheError::SlowCallTimeout),
        }
    }

    /// Runs `loader` in its own task (so a panic is caught as a `JoinError`
    /// rather than poisoning this task), then publishes the result to every
    /// subscriber attached to the topic at that moment and removes the
    /// topic. The timer race inside `get` never cancels this task: a caller
    /// that times out still gets its subscription serviced once the loader
    /// completes, it just isn't waiting around to see it. A recovered panic
    /// is additionally reported to the configured `on_error` hook, the same
    /// way a cron refresher's recovered panic is — the caller that joined the
    /// oneshot already sees the panic surfaced as a `CacheError::Loader`, but
    /// there is no guarantee anyone was still attached to the topic to
    /// observe it.
    fn spawn_executor(&self, key: Arc<str>, loader: Loader) {
        let topics = Arc::clone(&self.topics);
        let on_error = self.on_error.clone();
        tokio::spawn(async move {
            let loader_task = tokio::spawn(async move { loader().await });
            let result: LoadResult = match loader_task.await {
                Ok(r) => r,
                Err(join_err) => {
                    let err = LoaderError::from_message(format!("loader task panicked: {join_err}"));
                    if let Some(hook) = &on_error {
                        hook(Arc::clone(&key), CacheError::Loader(err.clone()));
                    }
                    Err(err)
                }
            };

            let mut topics = topics.lock().await;
            if let Some(topic) = topics.remove(key.as_ref()) {
                for tx in topic.subscribers {
                    let _ = tx.send(result.clone());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn value(s: &str) -> Arc<dyn CacheValue> {
        Arc::new(s.to_owned())
    }

    #[tokio::test]
    async fn single_caller_runs_loader_and_is_slow() {
        let sf = SingleFlight::new(StdDuration::from_secs(5), None);
        let loader: Loader = Arc::new(|| Box::pin(async { Ok(value("v")) }));
        let (v, slow) = sf.get(&Arc::from("k"), loader).await.unwrap();
        assert_eq!(CacheValue::len(&*v), 1);
        assert!(slow);
    }

    #[tokio::test]
    async fn concurrent_callers_coalesce_to_one_loader_invocation() {
        let sf = Arc::new(SingleFlight::new(StdDuration::from_secs(5), None));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_loader = Arc::clone(&calls);
        let loader: Loader = Arc::new(move || {
            let calls = Arc::clone(&calls_for_loader);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(StdDuration::from_millis(50)).await;
                Ok(value("v"))
            })
        });

        let key: Arc<str> = Arc::from("k");
        let mut handles = Vec::new();
        for _ in 0..50 {
            let sf = Arc::clone(&sf);
            let loader = Arc::clone(&loader);
            let key = key.clone();
            handles.push(tokio::spawn(async move { sf.get(&key, loader).await }));
        }

        let mut slow_count = 0;
        for h in handles {
            let (v, slow) = h.await.unwrap().unwrap();
            assert_eq!(CacheValue::len(&*v), 1);
            if slow {
                slow_count += 1;
            }
        }
        assert_eq!(slow_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executor_times_out_while_loader_keeps_running() {
        let sf = SingleFlight::new(StdDuration::from_millis(50), None);
        let loader: Loader = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(StdDuration::from_millis(200)).await;
                Ok(value("late"))
            })
        });
        let err = sf.get(&Arc::from("k"), loader).await.unwrap_err();
        assert!(matches!(err, CacheError::SlowCallTimeout));
    }

    #[tokio::test]
    async fn loader_error_is_propagated_to_executor() {
        let sf = SingleFlight::new(StdDuration::from_secs(5), None);
        let loader: Loader = Arc::new(|| {
            Box::pin(async { Err(LoaderError::from_message("boom")) })
        });
        let err = sf.get(&Arc::from("k"), loader).await.unwrap_err();
        match err {
            CacheError::Loader(e) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let sf = SingleFlight::new(StdDuration::from_secs(5), None);
        let loader: Loader = Arc::new(|| Box::pin(async { Ok(value("v")) }));
        let err = sf.get(&Arc::from(""), loader).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidParam(_)));
    }

    #[tokio::test]
    async fn late_subscriber_still_gets_delivered() {
        // A caller that subscribes after the executor's own timeout has
        // fired, but before the loader has finished, still gets the value.
        let sf = Arc::new(SingleFlight::new(StdDuration::from_millis(30), None));
        let loader: Loader = Arc::new(|| {
            Box::pin(async {
                tokio::time::sleep(StdDuration::from_millis(100)).await;
                Ok(value("v"))
            })
        });

        let key: Arc<str> = Arc::from("k");
        let executor_err = sf.get(&key, Arc::clone(&loader)).await.unwrap_err();
        assert!(matches!(executor_err, CacheError::SlowCallTimeout));

        // Join shortly after, while the loader is still running in the background.
        let (v, slow) = sf.get(&key, loader).await.unwrap();
        assert!(!slow);
        assert_eq!(CacheValue::len(&*v), 1);
    }

    #[tokio::test]
    async fn panicking_loader_is_reported_through_the_error_hook() {
        let reported: Arc<Mutex<Vec<(Arc<str>, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let reported_for_hook = Arc::clone(&reported);
        let on_error: ErrorHook = Arc::new(move |key, err| {
            let reported = Arc::clone(&reported_for_hook);
            let entry = (key, err.to_string());
            tokio::spawn(async move { reported.lock().await.push(entry) });
        });
        let sf = SingleFlight::new(StdDuration::from_secs(5), Some(on_error));
        let loader: Loader = Arc::new(|| Box::pin(async { panic!("loader blew up") }));

        let err = sf.get(&Arc::from("k"), loader).await.unwrap_err();
        assert!(matches!(err, CacheError::Loader(_)));

        // Give the hook's spawned task a chance to run.
        for _ in 0..50 {
            if !reported.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        let reported = reported.lock().await;
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].0.as_ref(), "k");
        assert!(reported[0].1.contains("panicked"));
    }
}
