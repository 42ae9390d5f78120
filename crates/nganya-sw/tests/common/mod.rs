//! Shared fixtures: a scripted network and a store whose deletes can fail.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use nganya_net::{Fetcher, NetError, Request, RequestId, Response, Url};
use nganya_sw::{
    CacheEntry, CacheManager, CacheStorage, CacheStore, PrecacheManifest, ServiceWorkerEvent,
    StorageError, WorkerVersion,
};
use tokio::sync::mpsc;

pub const ORIGIN: &str = "https://nganya.example/";

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn version(name: &str, paths: &[&str]) -> WorkerVersion {
    let manifest = PrecacheManifest::resolve(&Url::parse(ORIGIN).unwrap(), paths).unwrap();
    WorkerVersion::new(name, manifest)
}

enum Route {
    Respond { status: u16, body: &'static str },
    Fail(&'static str),
}

/// Scripted [`Fetcher`] that counts every call.
#[derive(Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<String>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, path: &str, body: &'static str) -> &Self {
        self.serve_status(path, 200, body)
    }

    pub fn serve_status(&self, path: &str, status: u16, body: &'static str) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url(path).to_string(), Route::Respond { status, body });
        self
    }

    pub fn fail(&self, path: &str, reason: &'static str) -> &Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url(path).to_string(), Route::Fail(reason));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        let target = url(path).to_string();
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|u| **u == target)
            .count()
    }
}

#[async_trait]
impl Fetcher for MockNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let key = request.url.to_string();
        self.calls.lock().unwrap().push(key.clone());

        let routes = self.routes.lock().unwrap();
        match routes.get(&key) {
            Some(Route::Respond { status, body }) => {
                let mut headers = HeaderMap::new();
                headers.insert("content-type", HeaderValue::from_static("text/plain"));
                headers.insert("x-served-by", HeaderValue::from_static("origin"));
                Ok(Response {
                    request_id: RequestId::new(),
                    url: request.url,
                    status: StatusCode::from_u16(*status).unwrap(),
                    headers,
                    body: Bytes::from_static((*body).as_bytes()),
                })
            }
            Some(Route::Fail(reason)) => Err(NetError::RequestFailed(reason.to_string())),
            None => Err(NetError::RequestFailed(format!("offline: {key}"))),
        }
    }
}

/// In-memory store whose deletes fail while `fail_deletes` is set.
#[derive(Default)]
pub struct FlakyStore {
    inner: CacheStorage,
    pub fail_deletes: AtomicBool,
}

#[async_trait]
impl CacheStore for FlakyStore {
    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys().await
    }

    async fn has(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.has(name).await
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError> {
        self.inner.put_all(name, entries).await
    }

    async fn match_request(
        &self,
        name: &str,
        key: &str,
    ) -> Result<Option<CacheEntry>, StorageError> {
        self.inner.match_request(name, key).await
    }

    async fn entry_count(&self, name: &str) -> Result<usize, StorageError> {
        self.inner.entry_count(name).await
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only storage",
            )));
        }
        self.inner.delete(name).await
    }

    async fn active(&self) -> Result<Option<String>, StorageError> {
        self.inner.active().await
    }

    async fn set_active(&self, name: &str) -> Result<(), StorageError> {
        self.inner.set_active(name).await
    }
}

pub fn manager_with(
    store: Arc<dyn CacheStore>,
    network: Arc<MockNetwork>,
) -> (CacheManager, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
    CacheManager::new(store, network)
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
