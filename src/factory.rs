//! Collaborator traits: how resources are made, checked and observed

use std::sync::Arc;
use std::time::Duration;

use crate::errors::BoxError;

/// Creates, validates and closes the resources a pool manages.
///
/// Implementations are called from pool worker threads as well as from
/// callers of `acquire`, so they must be thread-safe. Creation may be slow;
/// it never runs on the caller's acquire path unless fail-fast start-up is
/// enabled.
///
/// # Examples
///
/// ```
/// use esox_connpool::{BoxError, ResourceFactory};
/// use std::net::TcpStream;
/// use std::time::Duration;
///
/// struct TcpFactory {
///     addr: String,
/// }
///
/// impl ResourceFactory for TcpFactory {
///     type Resource = TcpStream;
///
///     fn create(&self) -> Result<TcpStream, BoxError> {
///         Ok(TcpStream::connect(&self.addr)?)
///     }
///
///     fn validate(&self, stream: &mut TcpStream, _timeout: Duration) -> bool {
///         stream.peer_addr().is_ok()
///     }
/// }
/// ```
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    fn create(&self) -> Result<Self::Resource, BoxError>;

    /// Liveness probe. Must give up within `timeout`.
    fn validate(&self, resource: &mut Self::Resource, timeout: Duration) -> bool;

    fn close(&self, resource: Self::Resource) {
        drop(resource);
    }

    /// Called right before a resource is handed to a caller.
    fn on_acquire(&self, _resource: &mut Self::Resource) {}

    /// Called when a resource comes back; an error retires the resource.
    fn reset(&self, _resource: &mut Self::Resource) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Receives timing events from the pool's hot paths. Must not block.
pub trait Observer: Send + Sync + 'static {
    fn on_resource_created(&self, _elapsed: Duration) {}

    fn on_acquire_wait(&self, _waited: Duration) {}

    fn on_usage(&self, _held: Duration) {}

    fn on_timeout(&self) {}
}

impl<T: ResourceFactory> ResourceFactory for Arc<T> {
    type Resource = T::Resource;

    fn create(&self) -> Result<Self::Resource, BoxError> {
        (**self).create()
    }

    fn validate(&self, resource: &mut Self::Resource, timeout: Duration) -> bool {
        (**self).validate(resource, timeout)
    }

    fn close(&self, resource: Self::Resource) {
        (**self).close(resource)
    }

    fn on_acquire(&self, resource: &mut Self::Resource) {
        (**self).on_acquire(resource)
    }

    fn reset(&self, resource: &mut Self::Resource) -> Result<(), BoxError> {
        (**self).reset(resource)
    }
}
