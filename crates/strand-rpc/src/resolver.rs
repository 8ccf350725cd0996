//! Partition resolution for URI destinations.
//!
//! A URI destination names a logical service; a [`PartitionResolver`] maps
//! a partition hash to the concrete endpoint currently serving it. The
//! resolver's internals (meta-server lookups, caches) live outside this
//! crate; the engine only consumes this interface and reports access
//! failures back so the resolver can refresh its view.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::addr::{HostAddr, UriAddress};
use crate::error::ErrCode;
use crate::message::Gpid;

/// Outcome of one partition resolution.
#[derive(Debug, Clone)]
pub struct ResolveResult {
    /// `Ok` on success; the terminal error otherwise.
    pub err: ErrCode,
    /// Partition identity of the resolved destination.
    pub gpid: Gpid,
    /// Destination serving the partition; usually an ip or group address.
    pub addr: HostAddr,
}

impl ResolveResult {
    /// A failed resolution carrying only an error.
    pub fn failed(err: ErrCode) -> Self {
        ResolveResult {
            err,
            gpid: Gpid::default(),
            addr: HostAddr::Invalid,
        }
    }
}

/// Maps partition hashes to concrete destinations for one URI.
#[async_trait]
pub trait PartitionResolver: Send + Sync + 'static {
    /// Resolve `partition_hash` within `timeout_ms`.
    async fn resolve(&self, partition_hash: u64, timeout_ms: i32) -> ResolveResult;

    /// Report that a call to a previously resolved partition failed, so
    /// stale routing state can be invalidated.
    fn on_access_failure(&self, partition_index: i32, err: ErrCode);
}

/// Process-wide table of resolvers keyed by URI.
pub struct UriResolverManager {
    resolvers: RwLock<HashMap<String, Arc<dyn PartitionResolver>>>,
}

impl UriResolverManager {
    pub(crate) fn new() -> Self {
        UriResolverManager {
            resolvers: RwLock::new(HashMap::new()),
        }
    }

    /// Attach `resolver` to `uri`, making it available both through this
    /// manager and through the address handle itself.
    pub fn attach(&self, uri: &Arc<UriAddress>, resolver: Arc<dyn PartitionResolver>) {
        uri.set_resolver(resolver.clone());
        self.resolvers
            .write()
            .unwrap()
            .insert(uri.uri().to_string(), resolver);
    }

    /// The resolver registered for `uri`, if any.
    pub fn get(&self, uri: &str) -> Option<Arc<dyn PartitionResolver>> {
        self.resolvers.read().unwrap().get(uri).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::EndPoint;

    struct FixedResolver {
        target: EndPoint,
    }

    #[async_trait]
    impl PartitionResolver for FixedResolver {
        async fn resolve(&self, _partition_hash: u64, _timeout_ms: i32) -> ResolveResult {
            ResolveResult {
                err: ErrCode::Ok,
                gpid: Gpid {
                    app_id: 1,
                    partition_index: 0,
                },
                addr: HostAddr::Ip(self.target),
            }
        }

        fn on_access_failure(&self, _partition_index: i32, _err: ErrCode) {}
    }

    #[tokio::test]
    async fn test_attach_and_resolve() {
        let manager = UriResolverManager::new();
        let uri = UriAddress::new("strand://inventory");
        let target = EndPoint::localhost(40100);
        manager.attach(&uri, Arc::new(FixedResolver { target }));

        assert!(uri.resolver().is_some());
        let resolver = manager.get("strand://inventory").unwrap();
        let result = resolver.resolve(7, 1000).await;
        assert_eq!(result.err, ErrCode::Ok);
        assert!(matches!(result.addr, HostAddr::Ip(ep) if ep == target));
    }

    #[test]
    fn test_unknown_uri_has_no_resolver() {
        let manager = UriResolverManager::new();
        assert!(manager.get("strand://nowhere").is_none());
    }
}
