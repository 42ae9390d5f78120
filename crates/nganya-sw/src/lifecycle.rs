//! Extendable lifecycle events.
//!
//! An install or activate transition is not finished when its handler
//! returns but when every future registered with
//! [`ExtendableEvent::wait_until`] has resolved.

use futures::future::{try_join_all, BoxFuture, FutureExt};
use std::future::Future;

use crate::CacheError;

/// Lifecycle event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Install,
    Activate,
}

/// Lifecycle event carrying outstanding work.
pub struct ExtendableEvent<'a> {
    kind: LifecycleKind,
    pending: Vec<BoxFuture<'a, Result<(), CacheError>>>,
}

impl<'a> ExtendableEvent<'a> {
    pub fn new(kind: LifecycleKind) -> Self {
        Self {
            kind,
            pending: Vec::new(),
        }
    }

    pub fn kind(&self) -> LifecycleKind {
        self.kind
    }

    /// Extend the event's lifetime until `work` resolves.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = Result<(), CacheError>> + Send + 'a,
    {
        self.pending.push(work.boxed());
    }

    /// Number of registered obligations.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Resolve once every obligation has resolved, or fail with the first error.
    pub async fn settle(self) -> Result<(), CacheError> {
        try_join_all(self.pending).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ExtendableEvent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtendableEvent")
            .field("kind", &self.kind)
            .field("pending", &self.pending.len())
            .finish()
    }
}
