//! Asset cache manager: install, activate and fetch interception.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use nganya_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::lifecycle::{ExtendableEvent, LifecycleKind};
use crate::manifest::{request_key, WorkerVersion};
use crate::storage::{CacheEntry, CacheStore};
use crate::{CacheError, Registration, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState};

// ==================== Fetch Response ====================

/// Response handed back to the page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Served from the active generation.
    pub from_cache: bool,
}

impl FetchResponse {
    /// Create a response from a cache entry.
    pub fn from_cache(entry: &CacheEntry) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in &entry.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                headers.append(n, v);
            }
        }

        Self {
            url: entry.url.clone(),
            status: StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
            headers,
            body: Bytes::from(entry.body.clone()),
            from_cache: true,
        }
    }

    /// Pass a network response through unchanged.
    pub fn from_network(response: Response) -> Self {
        Self {
            url: response.url.to_string(),
            status: response.status,
            headers: response.headers,
            body: response.body,
            from_cache: false,
        }
    }
}

/// Result of an activation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The waiting generation became active.
    Activated {
        cache_name: String,
        /// Stale generations destroyed.
        evicted: Vec<String>,
    },
    /// No generation was waiting.
    NothingWaiting,
    /// The active generation still controls clients.
    Deferred { clients: usize },
}

// ==================== Manager ====================

/// Offline asset cache for one origin.
///
/// Install and activate are the only operations that write to the store;
/// they are serialized by a transition lock. Fetch interception only reads.
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    registration: RwLock<Registration>,
    transition: Mutex<()>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                store,
                fetcher,
                registration: RwLock::new(Registration::new()),
                transition: Mutex::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Copy of the current worker slots.
    pub async fn registration(&self) -> Registration {
        self.registration.read().await.clone()
    }

    /// Generation currently serving fetches.
    pub async fn active_cache(&self) -> Option<String> {
        self.registration
            .read()
            .await
            .active_cache_name()
            .map(str::to_owned)
    }

    /// Resume serving from the generation the store recorded as active.
    ///
    /// Call once after construction. Returns the restored generation, or
    /// `None` if nothing was recorded or a worker is already active.
    pub async fn restore(&self) -> Result<Option<String>, CacheError> {
        let _transition = self.transition.lock().await;

        let Some(name) = self.store.active().await? else {
            debug!("No active generation to restore");
            return Ok(None);
        };
        let Some(id) = self.registration.write().await.restore_active(&name) else {
            return Ok(None);
        };

        self.emit_state(id, &name, ServiceWorkerState::Active);
        info!(cache = %name, "Restored active generation");
        Ok(Some(name))
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, cache_name: &str, new_state: ServiceWorkerState) {
        debug!(cache = %cache_name, state = ?new_state, "Worker state changed");
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            cache_name: cache_name.to_string(),
            new_state,
        });
    }

    // ==================== Install ====================

    /// Install a worker version: precache its manifest into its generation.
    ///
    /// Succeeds only if every manifest URL is fetched with a 2xx status and
    /// the whole batch is committed. On failure nothing is stored and the
    /// previously active generation keeps serving.
    pub async fn install(&self, version: &WorkerVersion) -> Result<(), CacheError> {
        let _transition = self.transition.lock().await;
        let name = version.cache_name.as_str();

        let id = self.registration.write().await.begin_install(name)?;
        self.emit_state(id, name, ServiceWorkerState::Installing);
        info!(cache = %name, assets = version.manifest.len(), "Installing");

        let mut event = ExtendableEvent::new(LifecycleKind::Install);
        event.wait_until(self.precache(version));

        match event.settle().await {
            Ok(()) => {
                let replaced = self.registration.write().await.install_complete();
                self.emit_state(id, name, ServiceWorkerState::Waiting);
                if let Some(old) = replaced {
                    self.emit_state(old.id, &old.cache_name, ServiceWorkerState::Redundant);
                }
                info!(cache = %name, "Installed");
                Ok(())
            }
            Err(e) => {
                self.registration.write().await.install_failed();
                self.emit_state(id, name, ServiceWorkerState::Uninstalled);
                self.emit(ServiceWorkerEvent::InstallFailed {
                    cache_name: name.to_string(),
                    reason: e.to_string(),
                });
                warn!(cache = %name, error = %e, "Install failed");
                Err(e)
            }
        }
    }

    async fn precache(&self, version: &WorkerVersion) -> Result<(), CacheError> {
        let fetches = version.manifest.urls().iter().map(|url| self.precache_one(url));
        let entries = try_join_all(fetches).await?;
        self.store.put_all(&version.cache_name, entries).await?;
        Ok(())
    }

    async fn precache_one(&self, url: &Url) -> Result<CacheEntry, CacheError> {
        let response = self
            .fetcher
            .fetch(Request::get(url.clone()))
            .await
            .and_then(Response::error_for_status)
            .map_err(|source| CacheError::InstallFetch {
                url: url.clone(),
                source,
            })?;

        trace!(url = %url, status = %response.status, bytes = response.body.len(), "Precached");
        Ok(CacheEntry::from_response(request_key(url), &response))
    }

    // ==================== Activate ====================

    /// Promote the waiting generation and destroy every other generation.
    ///
    /// A no-op when nothing is waiting. If eviction fails the waiting worker
    /// stays waiting and the error is returned. On success the store records
    /// the new generation as active.
    pub async fn activate(&self) -> Result<ActivationOutcome, CacheError> {
        let _transition = self.transition.lock().await;

        let Some((id, name)) = self.registration.write().await.begin_activation() else {
            debug!("Nothing waiting to activate");
            return Ok(ActivationOutcome::NothingWaiting);
        };
        self.emit_state(id, &name, ServiceWorkerState::Activating);

        let mut evicted = Vec::new();
        let mut event = ExtendableEvent::new(LifecycleKind::Activate);
        event.wait_until(self.commit_activation(&name, &mut evicted));
        let settled = event.settle().await;

        if let Err(e) = settled {
            self.registration.write().await.activation_failed();
            self.emit_state(id, &name, ServiceWorkerState::Waiting);
            warn!(cache = %name, error = %e, "Activation failed");
            return Err(e);
        }

        let superseded = self.registration.write().await.activation_complete();
        self.emit_state(id, &name, ServiceWorkerState::Active);
        if let Some(old) = superseded {
            self.emit_state(old.id, &old.cache_name, ServiceWorkerState::Redundant);
        }
        for stale in &evicted {
            self.emit(ServiceWorkerEvent::GenerationEvicted {
                name: stale.clone(),
            });
        }

        info!(cache = %name, evicted = evicted.len(), "Activated");
        Ok(ActivationOutcome::Activated {
            cache_name: name,
            evicted,
        })
    }

    /// Activate only if the active generation controls no clients,
    /// or skip-waiting was requested.
    pub async fn activate_if_ready(&self) -> Result<ActivationOutcome, CacheError> {
        {
            let registration = self.registration.read().await;
            if registration.waiting.is_none() {
                return Ok(ActivationOutcome::NothingWaiting);
            }
            if !registration.ready_to_activate() {
                debug!(clients = registration.clients, "Activation deferred");
                return Ok(ActivationOutcome::Deferred {
                    clients: registration.clients,
                });
            }
        }
        self.activate().await
    }

    async fn commit_activation(
        &self,
        current: &str,
        evicted: &mut Vec<String>,
    ) -> Result<(), CacheError> {
        self.evict_stale(current, evicted).await?;
        self.store.set_active(current).await?;
        Ok(())
    }

    async fn evict_stale(&self, current: &str, evicted: &mut Vec<String>) -> Result<(), CacheError> {
        let stale: Vec<String> = self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != current)
            .collect();

        let deletions = stale.iter().map(|name| async move {
            self.store
                .delete(name)
                .await
                .map_err(|source| CacheError::ActivationEviction {
                    name: name.clone(),
                    source,
                })?;
            debug!(cache = %name, "Evicted stale generation");
            Ok::<_, CacheError>(name.clone())
        });

        evicted.extend(try_join_all(deletions).await?);
        Ok(())
    }

    // ==================== Clients ====================

    /// Promote the waiting generation on the next activation attempt
    /// regardless of clients.
    pub async fn skip_waiting(&self) {
        self.registration.write().await.skip_waiting = true;
    }

    pub async fn client_attached(&self) -> usize {
        self.registration.write().await.client_attached()
    }

    pub async fn client_detached(&self) -> usize {
        self.registration.write().await.client_detached()
    }

    // ==================== Fetch ====================

    /// Serve a request from the active generation, or from the network.
    ///
    /// A hit never touches the network. A miss is fetched and returned as-is
    /// without being written back. Network errors surface unchanged.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchResponse, CacheError> {
        if let Some(hit) = self.lookup(&request).await {
            return Ok(hit);
        }

        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(CacheError::FetchPath)?;
        Ok(FetchResponse::from_network(response))
    }

    async fn lookup(&self, request: &Request) -> Option<FetchResponse> {
        if request.method != Method::GET {
            return None;
        }
        let name = self.active_cache().await?;
        let key = request_key(&request.url);

        match self.store.match_request(&name, &key).await {
            Ok(Some(entry)) => {
                trace!(url = %key, cache = %name, "Cache hit");
                Some(FetchResponse::from_cache(&entry))
            }
            Ok(None) => {
                trace!(url = %key, cache = %name, "Cache miss");
                None
            }
            Err(e) => {
                warn!(url = %key, cache = %name, error = %e, "Cache lookup failed");
                None
            }
        }
    }
}
