//! Periodic background refreshers.
//!
//! A cron task owns no state of its own: it just calls back into the
//! [`crate::cache::Cache`] it was registered against on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::error::CacheError;
use crate::single_flight::Loader;

/// Handle to a running refresher; dropping it does not stop the task, call
/// [`CronHandle::abort`] for that.
pub struct CronHandle {
    join: JoinHandle<()>,
}

impl CronHandle {
    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Spawn a task that calls `loader` immediately, stores its result under
/// `key` with `ttl_secs` via `on_success`, then repeats every `period` until
/// aborted. A loader error or panic is reported to `on_error` instead of
/// stopping the loop.
pub(crate) fn spawn<S, E>(
    key: Arc<str>,
    period: Duration,
    loader: Loader,
    on_success: S,
    on_error: E,
) -> CronHandle
where
    S: Fn(Arc<str>, Arc<dyn crate::value::CacheValue>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    E: Fn(Arc<str>, CacheError) + Send + Sync + 'static,
{
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; `register_cron`'s contract is
        // "run once now, then on every tick after that".
        loop {
            ticker.tick().await;
            let task = tokio::spawn({
                let loader = Arc::clone(&loader);
                async move { loader().await }
            });
            match task.await {
                Ok(Ok(value)) => on_success(Arc::clone(&key), value).await,
                Ok(Err(e)) => on_error(Arc::clone(&key), CacheError::Loader(e)),
                Err(join_err) => on_error(
                    Arc::clone(&key),
                    CacheError::Loader(crate::error::LoaderError::from_message(format!(
                        "cron loader panicked: {join_err}"
                    ))),
                ),
            }
        }
    });
    CronHandle { join }
}
