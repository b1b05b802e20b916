//! Acquirer trait for abstracting local and distributed implementations.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AcquireError;

/// Decides whether work for a key may proceed right now.
///
/// This trait abstracts over the in-process [`KeyedLocalAdmitter`] and the
/// store-backed [`DistributedAdmitter`] so the HTTP layer can work with either.
///
/// `Ok(false)` is an ordinary denial. An error means no decision could be
/// made.
///
/// [`KeyedLocalAdmitter`]: super::KeyedLocalAdmitter
/// [`DistributedAdmitter`]: super::DistributedAdmitter
#[async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(&self, cancel: &CancellationToken, key: &str) -> Result<bool, AcquireError>;
}

#[async_trait]
impl<A: Acquirer + ?Sized> Acquirer for Arc<A> {
    async fn acquire(&self, cancel: &CancellationToken, key: &str) -> Result<bool, AcquireError> {
        (**self).acquire(cancel, key).await
    }
}

#[async_trait]
impl<A: Acquirer + ?Sized> Acquirer for Box<A> {
    async fn acquire(&self, cancel: &CancellationToken, key: &str) -> Result<bool, AcquireError> {
        (**self).acquire(cancel, key).await
    }
}
