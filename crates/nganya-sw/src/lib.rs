//! # Nganya Service Worker
//!
//! Offline asset cache for the Nganya Groove site.
//!
//! ## Features
//!
//! - **Precache**: fetch a fixed manifest into a named cache generation, all or nothing
//! - **Lifecycle**: install, activate, fetch as explicit state transitions
//! - **Eviction**: activation destroys every generation with a different name
//! - **Fetch Interception**: cache hit served as-is, miss passed to the network
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost ── HostEvent ──→ CacheManager
//!                                        ├── Registration
//!                                        │       ├── installing
//!                                        │       ├── waiting
//!                                        │       └── active
//!                                        ├── CacheStore (generations)
//!                                        │       └── request key → CacheEntry
//!                                        └── Fetcher (network)
//! ```

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use url::Url;

pub use nganya_net::NetError;

pub mod host;
pub mod lifecycle;
pub mod manager;
pub mod manifest;
pub mod storage;

pub use host::{HostEvent, HostHandle, ServiceWorkerHost};
pub use lifecycle::{ExtendableEvent, LifecycleKind};
pub use manager::{ActivationOutcome, CacheManager, FetchResponse};
pub use manifest::{request_key, PrecacheManifest, WorkerVersion};
pub use storage::{Cache, CacheEntry, CacheStorage, CacheStore, DiskCacheStorage, StorageError};

// ==================== Errors ====================

/// Errors that can occur in asset cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A manifest URL could not be fetched; the install is aborted.
    #[error("Precache of {url} failed: {source}")]
    InstallFetch {
        url: Url,
        #[source]
        source: NetError,
    },

    /// A stale generation could not be destroyed during activation.
    #[error("Eviction of cache {name:?} failed: {source}")]
    ActivationEviction {
        name: String,
        #[source]
        source: StorageError,
    },

    /// Cache miss and the network fetch failed.
    #[error(transparent)]
    FetchPath(NetError),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("State error: {0}")]
    State(String),

    #[error("Host stopped")]
    HostClosed,
}

// ==================== Types ====================

/// Unique identifier for a worker generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Not installed, or install aborted.
    #[default]
    Uninstalled,
    /// Precaching the manifest.
    Installing,
    /// Installed but not yet active.
    Waiting,
    /// Evicting stale generations.
    Activating,
    /// Serving fetches.
    Active,
    /// Superseded by a newer generation.
    Redundant,
}

/// A worker bound to one cache generation.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,

    /// Generation this worker precaches into and serves from.
    pub cache_name: String,

    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            cache_name: cache_name.into(),
            state: ServiceWorkerState::Uninstalled,
            state_changed_at: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Active
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// Installing, waiting and active worker slots for one origin.
#[derive(Debug, Default, Clone)]
pub struct Registration {
    pub installing: Option<ServiceWorker>,
    pub waiting: Option<ServiceWorker>,
    pub active: Option<ServiceWorker>,

    /// Pages controlled by the active worker.
    pub clients: usize,

    /// Promote the waiting worker without waiting for clients to leave.
    pub skip_waiting: bool,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation the active worker serves from.
    pub fn active_cache_name(&self) -> Option<&str> {
        self.active.as_ref().map(|w| w.cache_name.as_str())
    }

    /// Start installing a new worker.
    pub fn begin_install(&mut self, cache_name: &str) -> Result<ServiceWorkerId, CacheError> {
        if self.installing.is_some() {
            return Err(CacheError::State("an install is already in progress".to_string()));
        }
        let mut worker = ServiceWorker::new(cache_name);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        self.installing = Some(worker);
        Ok(id)
    }

    /// Transition installing to waiting.
    ///
    /// Returns the previously waiting worker, now redundant.
    pub fn install_complete(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Waiting);
        self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Drop the installing worker after a failed install.
    pub fn install_failed(&mut self) -> Option<ServiceWorker> {
        self.installing.take().map(|mut worker| {
            worker.set_state(ServiceWorkerState::Uninstalled);
            worker
        })
    }

    /// Whether the waiting worker may be promoted now.
    pub fn ready_to_activate(&self) -> bool {
        self.waiting.is_some() && (self.active.is_none() || self.clients == 0 || self.skip_waiting)
    }

    /// Mark the waiting worker as activating.
    pub fn begin_activation(&mut self) -> Option<(ServiceWorkerId, String)> {
        let worker = self.waiting.as_mut()?;
        if worker.state == ServiceWorkerState::Activating {
            return None;
        }
        worker.set_state(ServiceWorkerState::Activating);
        Some((worker.id, worker.cache_name.clone()))
    }

    /// Return the activating worker to waiting.
    pub fn activation_failed(&mut self) {
        if let Some(worker) = self.waiting.as_mut() {
            worker.set_state(ServiceWorkerState::Waiting);
        }
    }

    /// Promote the activating worker.
    ///
    /// Returns the previously active worker, now redundant.
    pub fn activation_complete(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Active);
        self.skip_waiting = false;
        self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        })
    }

    /// Reinstate a generation that was active before a restart.
    ///
    /// Returns `None` if a worker is already active.
    pub fn restore_active(&mut self, cache_name: &str) -> Option<ServiceWorkerId> {
        if self.active.is_some() {
            return None;
        }
        let mut worker = ServiceWorker::new(cache_name);
        worker.set_state(ServiceWorkerState::Active);
        let id = worker.id;
        self.active = Some(worker);
        Some(id)
    }

    pub fn client_attached(&mut self) -> usize {
        self.clients += 1;
        self.clients
    }

    pub fn client_detached(&mut self) -> usize {
        self.clients = self.clients.saturating_sub(1);
        self.clients
    }
}

// ==================== Events ====================

/// Notifications emitted by the cache manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    StateChange {
        worker_id: ServiceWorkerId,
        cache_name: String,
        new_state: ServiceWorkerState,
    },
    InstallFailed {
        cache_name: String,
        reason: String,
    },
    GenerationEvicted {
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_worker_creation() {
        let worker = ServiceWorker::new("v1");

        assert_eq!(worker.cache_name, "v1");
        assert_eq!(worker.state, ServiceWorkerState::Uninstalled);
        assert!(!worker.is_active());
    }

    #[test]
    fn test_service_worker_ids_are_unique() {
        assert_ne!(ServiceWorker::new("v1").id, ServiceWorker::new("v1").id);
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut registration = Registration::new();

        registration.begin_install("v1").unwrap();
        assert_eq!(
            registration.installing.as_ref().unwrap().state,
            ServiceWorkerState::Installing
        );

        // Installing -> Waiting
        assert!(registration.install_complete().is_none());
        assert!(registration.installing.is_none());
        assert_eq!(
            registration.waiting.as_ref().unwrap().state,
            ServiceWorkerState::Waiting
        );
        assert!(registration.ready_to_activate());

        // Waiting -> Activating -> Active
        let (_, name) = registration.begin_activation().unwrap();
        assert_eq!(name, "v1");
        assert!(registration.activation_complete().is_none());
        assert!(registration.active.as_ref().unwrap().is_active());
        assert_eq!(registration.active_cache_name(), Some("v1"));
    }

    #[test]
    fn test_second_install_rejected_while_installing() {
        let mut registration = Registration::new();
        registration.begin_install("v1").unwrap();
        assert!(matches!(
            registration.begin_install("v2"),
            Err(CacheError::State(_))
        ));
    }

    #[test]
    fn test_install_failed_returns_to_uninstalled() {
        let mut registration = Registration::new();
        registration.begin_install("v1").unwrap();

        let worker = registration.install_failed().unwrap();
        assert_eq!(worker.state, ServiceWorkerState::Uninstalled);
        assert!(registration.installing.is_none());
        assert!(registration.waiting.is_none());
    }

    #[test]
    fn test_new_install_replaces_waiting() {
        let mut registration = Registration::new();
        registration.begin_install("v1").unwrap();
        registration.install_complete();
        registration.begin_install("v2").unwrap();

        let replaced = registration.install_complete().unwrap();
        assert_eq!(replaced.cache_name, "v1");
        assert!(replaced.is_redundant());
        assert_eq!(registration.waiting.as_ref().unwrap().cache_name, "v2");
    }

    #[test]
    fn test_activation_supersedes_active() {
        let mut registration = Registration::new();
        for name in ["v1", "v2"] {
            registration.begin_install(name).unwrap();
            registration.install_complete();
            registration.begin_activation();
            registration.activation_complete();
        }

        assert_eq!(registration.active_cache_name(), Some("v2"));
        assert!(registration.waiting.is_none());
    }

    #[test]
    fn test_activation_waits_for_clients() {
        let mut registration = Registration::new();
        registration.begin_install("v1").unwrap();
        registration.install_complete();
        registration.begin_activation();
        registration.activation_complete();

        registration.client_attached();
        registration.begin_install("v2").unwrap();
        registration.install_complete();
        assert!(!registration.ready_to_activate());

        registration.skip_waiting = true;
        assert!(registration.ready_to_activate());
        registration.skip_waiting = false;

        assert_eq!(registration.client_detached(), 0);
        assert!(registration.ready_to_activate());
    }

    #[test]
    fn test_activation_failed_restores_waiting() {
        let mut registration = Registration::new();
        registration.begin_install("v1").unwrap();
        registration.install_complete();
        registration.begin_activation().unwrap();
        assert!(registration.begin_activation().is_none());

        registration.activation_failed();
        assert_eq!(
            registration.waiting.as_ref().unwrap().state,
            ServiceWorkerState::Waiting
        );
        assert!(registration.active.is_none());
    }

    #[test]
    fn test_restore_active_only_when_none_active() {
        let mut registration = Registration::new();
        assert!(registration.restore_active("v1").is_some());
        assert_eq!(registration.active_cache_name(), Some("v1"));
        assert!(registration.active.as_ref().unwrap().is_active());

        assert!(registration.restore_active("v0").is_none());
        assert_eq!(registration.active_cache_name(), Some("v1"));
    }

    #[test]
    fn test_client_detach_saturates() {
        let mut registration = Registration::new();
        assert_eq!(registration.client_detached(), 0);
    }
}
