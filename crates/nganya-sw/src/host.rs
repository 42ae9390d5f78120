//! Host event loop.
//!
//! The host delivers lifecycle and fetch events to a [`CacheManager`]. Each
//! event runs in its own task, so fetches keep being answered while an
//! install is in flight; the manager serializes the transitions itself.

use std::sync::Arc;

use nganya_net::Request;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::manager::{ActivationOutcome, CacheManager, FetchResponse};
use crate::manifest::WorkerVersion;
use crate::CacheError;

type Reply<T> = oneshot::Sender<Result<T, CacheError>>;

/// Events the host environment fires at the worker.
#[derive(Debug)]
pub enum HostEvent {
    /// A new worker version was detected.
    Install {
        version: WorkerVersion,
        reply: Reply<()>,
    },
    /// Promote the waiting generation once the active one has no clients.
    Activate { reply: Reply<ActivationOutcome> },
    /// Promote the waiting generation now.
    SkipWaiting { reply: Reply<ActivationOutcome> },
    /// A page came under control.
    ClientAttached { reply: Reply<usize> },
    /// A page went away; activates a waiting generation after the last one.
    ClientDetached { reply: Reply<ActivationOutcome> },
    /// The page issued a request.
    Fetch {
        request: Request,
        reply: Reply<FetchResponse>,
    },
}

/// Runs the event loop for one manager.
pub struct ServiceWorkerHost;

impl ServiceWorkerHost {
    /// Spawn the event loop. It ends when every [`HostHandle`] is dropped.
    pub fn spawn(manager: Arc<CacheManager>, buffer: usize) -> (HostHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let task = tokio::spawn(Self::run(manager, rx));
        (HostHandle { tx }, task)
    }

    async fn run(manager: Arc<CacheManager>, mut rx: mpsc::Receiver<HostEvent>) {
        info!("Host started");
        while let Some(event) = rx.recv().await {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { Self::dispatch(&manager, event).await });
        }
        debug!("Host stopped");
    }

    async fn dispatch(manager: &CacheManager, event: HostEvent) {
        match event {
            HostEvent::Install { version, reply } => {
                let _ = reply.send(manager.install(&version).await);
            }
            HostEvent::Activate { reply } => {
                let _ = reply.send(manager.activate_if_ready().await);
            }
            HostEvent::SkipWaiting { reply } => {
                manager.skip_waiting().await;
                let _ = reply.send(manager.activate_if_ready().await);
            }
            HostEvent::ClientAttached { reply } => {
                let _ = reply.send(Ok(manager.client_attached().await));
            }
            HostEvent::ClientDetached { reply } => {
                let remaining = manager.client_detached().await;
                let outcome = if remaining == 0 {
                    manager.activate_if_ready().await
                } else {
                    Ok(ActivationOutcome::Deferred { clients: remaining })
                };
                let _ = reply.send(outcome);
            }
            HostEvent::Fetch { request, reply } => {
                let _ = reply.send(manager.handle_fetch(request).await);
            }
        }
    }
}

/// Sender side of the host loop.
#[derive(Debug, Clone)]
pub struct HostHandle {
    tx: mpsc::Sender<HostEvent>,
}

impl HostHandle {
    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> HostEvent) -> Result<T, CacheError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CacheError::HostClosed)?;
        rx.await.map_err(|_| CacheError::HostClosed)?
    }

    /// Fire the install event and wait for it to settle.
    pub async fn install(&self, version: WorkerVersion) -> Result<(), CacheError> {
        self.call(|reply| HostEvent::Install { version, reply }).await
    }

    /// Fire the activate event and wait for it to settle.
    pub async fn activate(&self) -> Result<ActivationOutcome, CacheError> {
        self.call(|reply| HostEvent::Activate { reply }).await
    }

    pub async fn skip_waiting(&self) -> Result<ActivationOutcome, CacheError> {
        self.call(|reply| HostEvent::SkipWaiting { reply }).await
    }

    pub async fn client_attached(&self) -> Result<usize, CacheError> {
        self.call(|reply| HostEvent::ClientAttached { reply }).await
    }

    pub async fn client_detached(&self) -> Result<ActivationOutcome, CacheError> {
        self.call(|reply| HostEvent::ClientDetached { reply }).await
    }

    /// Fire a fetch event and wait for the response.
    pub async fn fetch(&self, request: Request) -> Result<FetchResponse, CacheError> {
        self.call(|reply| HostEvent::Fetch { request, reply }).await
    }
}
