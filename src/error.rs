//! Error taxonomy for the cache engine, single-flight coordinator, and
//! regulation registry.

use std::fmt;
use std::sync::Arc;

/// An opaque, cloneable wrapper around a caller-supplied loader error.
///
/// Single-flight must fan the same error out to an executor and N
/// subscribers, so the underlying `dyn Error` is held behind an `Arc` rather
/// than cloned.
#[derive(Clone)]
pub struct LoaderError(pub Arc<dyn std::error::Error + Send + Sync + 'static>);

impl LoaderError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }

    pub fn from_message(msg: impl Into<String>) -> Self {
        #[derive(Debug)]
        struct Msg(String);
        impl fmt::Display for Msg {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
        impl std::error::Error for Msg {}
        Self(Arc::new(Msg(msg.into())))
    }
}

impl fmt::Debug for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors surfaced by the cache engine, single-flight coordinator, and
/// regulation registry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("value is larger than the cache's maximum capacity")]
    ValueLargerThanCapacity,

    #[error("key already exists")]
    KeyAlreadyExists,

    #[error("key does not exist")]
    KeyNotExists,

    #[error("regulation already registered for this key")]
    RegulationAlreadyExists,

    #[error("slow call timed out before the loader completed")]
    SlowCallTimeout,

    #[error("loader error: {0}")]
    Loader(LoaderError),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Callback fired when a background task (cron refresher, sweeper, or a
/// single-flight loader's recovered panic) hits an error. The default, if
/// none is supplied, is a `tracing::error!` event.
pub type ErrorHook = Arc<dyn Fn(Arc<str>, CacheError) + Send + Sync>;
