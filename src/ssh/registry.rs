use crate::error::AppError;
use crate::ssh::transport::RemoteChannel;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    channels: Mutex<HashMap<ChannelId, Arc<dyn RemoteChannel>>>,
}

/// Every channel open against the current session, so disconnect can
/// close them all. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: Arc<dyn RemoteChannel>) -> ChannelId {
        let id = ChannelId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.channels.lock().insert(id, channel);
        tracing::trace!(channel = %id, "Registered channel");
        id
    }

    pub fn unregister(&self, id: ChannelId) -> Option<Arc<dyn RemoteChannel>> {
        self.inner.channels.lock().remove(&id)
    }

    /// Register and get a guard that unregisters and closes on drop
    pub fn lease(&self, channel: Arc<dyn RemoteChannel>) -> ChannelLease {
        let id = self.register(channel.clone());
        ChannelLease {
            id,
            channel,
            registry: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered channel. The registry is always left empty;
    /// individual close failures are logged and returned.
    pub fn close_all(&self) -> Vec<(ChannelId, AppError)> {
        let drained: Vec<_> = self.inner.channels.lock().drain().collect();
        let mut failures = Vec::new();

        for (id, channel) in drained {
            if let Err(e) = channel.close() {
                tracing::warn!(channel = %id, error = %e, "Failed to close channel");
                failures.push((id, e));
            }
        }

        failures
    }
}

/// Scoped registration of one channel
pub struct ChannelLease {
    id: ChannelId,
    channel: Arc<dyn RemoteChannel>,
    registry: ChannelRegistry,
}

impl ChannelLease {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn channel(&self) -> &Arc<dyn RemoteChannel> {
        &self.channel
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        // Already drained by close_all means it was already closed
        if self.registry.unregister(self.id).is_some() {
            if let Err(e) = self.channel.close() {
                tracing::debug!(channel = %self.id, error = %e, "Channel close on release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChannel;

    #[test]
    fn test_close_all_clears_despite_failures() {
        let registry = ChannelRegistry::new();
        let good = FakeChannel::with_output("");
        let bad = FakeChannel::with_output("");
        bad.fail_close();
        let good2 = FakeChannel::with_output("");

        registry.register(good.clone());
        registry.register(bad.clone());
        registry.register(good2.clone());
        assert_eq!(registry.len(), 3);

        let failures = registry.close_all();
        assert_eq!(failures.len(), 1);
        assert!(registry.is_empty());
        assert_eq!(good.close_calls(), 1);
        assert_eq!(bad.close_calls(), 1);
        assert_eq!(good2.close_calls(), 1);
    }

    #[test]
    fn test_lease_releases_once() {
        let registry = ChannelRegistry::new();
        let channel = FakeChannel::with_output("");
        {
            let lease = registry.lease(channel.clone());
            assert_eq!(registry.len(), 1);
            assert_eq!(lease.id(), lease.id());
        }
        assert!(registry.is_empty());
        assert_eq!(channel.close_calls(), 1);

        let lease = registry.lease(channel.clone());
        registry.close_all();
        drop(lease);
        assert_eq!(channel.close_calls(), 2);
    }
}
