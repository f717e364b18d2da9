//! The "regulation" catalog: a registered key maps to a loader and a default
//! TTL, so callers can ask for a key without carrying its loader around.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{CacheError, Result};
use crate::single_flight::{Loader, SingleFlight};
use crate::value::CacheValue;

struct Regulation {
    loader: Loader,
    default_ttl_secs: u64,
}

/// Catalog of key -> (loader, default TTL), sitting in front of a
/// [`SingleFlight`] coordinator.
pub(crate) struct RegulationRegistry {
    regulations: RwLock<HashMap<Arc<str>, Regulation>>,
    single_flight: SingleFlight,
}

impl RegulationRegistry {
    pub fn new(single_flight: SingleFlight) -> Self {
        Self {
            regulations: RwLock::new(HashMap::new()),
            single_flight,
        }
    }

    pub async fn register(&self, key: Arc<str>, default_ttl_secs: u64, loader: Loader) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidParam("key must not be empty".into()));
        }
        let mut regs = self.regulations.write().await;
        if regs.contains_key(key.as_ref()) {
            return Err(CacheError::RegulationAlreadyExists);
        }
        regs.insert(
            key,
            Regulation {
                loader,
                default_ttl_secs,
            },
        );
        Ok(())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.regulations.read().await.contains_key(key)
    }

    /// Resolve `key` via its registered loader. Returns `None` if `key` has
    /// no regulation. On success, `should_save` is `true` only for the
    /// caller that actually ran the loader (the rest joined an in-flight
    /// call or, in the non-racing path, would read the value the engine
    /// already cached).
    pub async fn get(&self, key: &Arc<str>) -> Result<Option<(Arc<dyn CacheValue>, bool, u64)>> {
        let (loader, ttl) = {
            let regs = self.regulations.read().await;
            match regs.get(key.as_ref()) {
                Some(r) => (Arc::clone(&r.loader), r.default_ttl_secs),
                None => return Ok(None),
            }
        };
        let (value, should_save) = self.single_flight.get(key, loader).await?;
        Ok(Some((value, should_save, ttl)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sf() -> SingleFlight {
        SingleFlight::new(Duration::from_secs(5), None)
    }

    #[tokio::test]
    async fn unregistered_key_returns_none() {
        let reg = RegulationRegistry::new(sf());
        let result = reg.get(&Arc::from("missing")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn register_then_get_invokes_loader() {
        let reg = RegulationRegistry::new(sf());
        let loader: Loader = Arc::new(|| Box::pin(async { Ok(Arc::new("v".to_owned()) as Arc<dyn CacheValue>) }));
        reg.register(Arc::from("k"), 30, loader).await.unwrap();
        let (v, should_save, ttl) = reg.get(&Arc::from("k")).await.unwrap().unwrap();
        assert_eq!(CacheValue::len(&*v), 1);
        assert!(should_save);
        assert_eq!(ttl, 30);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let reg = RegulationRegistry::new(sf());
        let loader: Loader = Arc::new(|| Box::pin(async { Ok(Arc::new("v".to_owned()) as Arc<dyn CacheValue>) }));
        reg.register(Arc::from("k"), 30, Arc::clone(&loader)).await.unwrap();
        let err = reg.register(Arc::from("k"), 30, loader).await.unwrap_err();
        assert!(matches!(err, CacheError::RegulationAlreadyExists));
    }

    #[tokio::test]
    async fn empty_key_registration_is_rejected() {
        let reg = RegulationRegistry::new(sf());
        let loader: Loader = Arc::new(|| Box::pin(async { Ok(Arc::new("v".to_owned()) as Arc<dyn CacheValue>) }));
        let err = reg.register(Arc::from(""), 30, loader).await.unwrap_err();
        assert!(matches!(err, CacheError::InvalidParam(_)));
    }
}
