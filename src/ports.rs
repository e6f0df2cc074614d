use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PreviewError;
use crate::store::RecordStore;

/// Chooses host ports for preview containers.
///
/// The bundled [`LocalPortAllocator`] is only safe for a single orchestrator
/// instance; running several against one record store needs a central
/// allocator behind this trait.
#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// First port in `min..=max` that is neither reserved in the store nor
    /// bound on this host.
    async fn allocate(&self, min: u16, max: u16) -> Result<u16, PreviewError>;

    /// True when something on this host is bound to `port`.
    fn is_held(&self, port: u16) -> bool;
}

/// Sequential scan over the record store and the loopback interface.
pub struct LocalPortAllocator {
    store: Arc<dyn RecordStore>,
}

impl LocalPortAllocator {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    async fn reserved(&self, port: u16) -> Result<bool, PreviewError> {
        Ok(self.store.find_preview_by_port(port, true).await?.is_some())
    }
}

/// Binds and immediately releases a listener on `port`.
fn can_bind(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[async_trait]
impl PortAllocator for LocalPortAllocator {
    async fn allocate(&self, min: u16, max: u16) -> Result<u16, PreviewError> {
        for port in min..=max {
            if self.reserved(port).await? {
                continue;
            }
            if !can_bind(port) {
                tracing::debug!(port, "Port bound by another process");
                continue;
            }
            // The store may have changed while we were probing the socket.
            if self.reserved(port).await? {
                continue;
            }
            return Ok(port);
        }
        Err(PreviewError::PortExhausted { min, max })
    }

    fn is_held(&self, port: u16) -> bool {
        !can_bind(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewPreview, PreviewPatch, PreviewStatus};
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn bind_any() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn reserve(store: &MemoryStore, pr_number: u64, port: u16, status: PreviewStatus) {
        let p = store
            .upsert_preview(NewPreview {
                project_id: Uuid::new_v4(),
                pr_number,
                head_ref: "main".to_string(),
            })
            .await
            .unwrap();
        store
            .update_preview(
                p.id,
                PreviewPatch {
                    status: Some(status),
                    port: Some(Some(port)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_when_reserved_and_bound() {
        let (_listener, bound) = bind_any();
        let reserved_port = bound - 1;
        let store = Arc::new(MemoryStore::new());
        reserve(&store, 1, reserved_port, PreviewStatus::Live).await;

        let allocator = LocalPortAllocator::new(store);
        let err = allocator.allocate(reserved_port, bound).await.unwrap_err();
        assert!(matches!(
            err,
            PreviewError::PortExhausted { min, max } if min == reserved_port && max == bound
        ));
    }

    #[tokio::test]
    async fn skips_os_bound_port() {
        let (listener, bound) = bind_any();
        let store = Arc::new(MemoryStore::new());
        let allocator = LocalPortAllocator::new(store);

        assert!(allocator.is_held(bound));
        assert!(allocator.allocate(bound, bound).await.is_err());

        drop(listener);
        assert!(!allocator.is_held(bound));
        assert_eq!(allocator.allocate(bound, bound).await.unwrap(), bound);
    }

    #[tokio::test]
    async fn deleted_previews_do_not_reserve() {
        let (listener, port) = bind_any();
        drop(listener);
        let store = Arc::new(MemoryStore::new());
        reserve(&store, 1, port, PreviewStatus::Deleted).await;

        let allocator = LocalPortAllocator::new(store.clone());
        assert_eq!(allocator.allocate(port, port).await.unwrap(), port);

        reserve(&store, 2, port, PreviewStatus::Error).await;
        assert!(allocator.allocate(port, port).await.is_err());
    }

    #[tokio::test]
    async fn empty_range_is_exhausted() {
        let allocator = LocalPortAllocator::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            allocator.allocate(6001, 6000).await,
            Err(PreviewError::PortExhausted { .. })
        ));
    }
}
