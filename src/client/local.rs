//! In-process transport
//!
//! Serves expansion and artifact requests from handlers registered per
//! endpoint url, without any network. Used to embed an expansion service in
//! the same process and as the stub transport in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::debug;

use super::{check_remote_error, ArtifactClient, ChunkStream, ClientFactory, ExpansionClient};
use crate::artifact::ArtifactStore;
use crate::error::{ExpansionError, Result};
use crate::proto::{
    ApiServiceDescriptor, ExpansionRequest, ExpansionResponse, GetArtifactRequest,
    ResolveArtifactsRequest, ResolveArtifactsResponse,
};

/// Server-side expansion logic. Returning `Err` reports an expansion failure.
pub trait ExpansionHandler: Send + Sync {
    fn expand(&self, request: &ExpansionRequest) -> anyhow::Result<ExpansionResponse>;
}

impl<F> ExpansionHandler for F
where
    F: Fn(&ExpansionRequest) -> anyhow::Result<ExpansionResponse> + Send + Sync,
{
    fn expand(&self, request: &ExpansionRequest) -> anyhow::Result<ExpansionResponse> {
        self(request)
    }
}

/// Factory over registered in-process services.
#[derive(Default, Clone)]
pub struct LocalClientFactory {
    expansion: HashMap<String, Arc<dyn ExpansionHandler>>,
    artifacts: HashMap<String, Arc<ArtifactStore>>,
    open: Arc<AtomicUsize>,
}

impl LocalClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expansion_service(
        mut self,
        url: impl Into<String>,
        handler: impl ExpansionHandler + 'static,
    ) -> Self {
        self.expansion.insert(url.into(), Arc::new(handler));
        self
    }

    pub fn with_artifact_store(mut self, url: impl Into<String>, store: ArtifactStore) -> Self {
        self.artifacts.insert(url.into(), Arc::new(store));
        self
    }

    /// Number of clients handed out and not yet closed.
    pub fn open_clients(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    fn connection(&self) -> Connection {
        self.open.fetch_add(1, Ordering::SeqCst);
        Connection {
            open: self.open.clone(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ClientFactory for LocalClientFactory {
    async fn expansion_client(
        &self,
        endpoint: &ApiServiceDescriptor,
    ) -> Result<Box<dyn ExpansionClient>> {
        let handler = self
            .expansion
            .get(&endpoint.url)
            .cloned()
            .ok_or_else(|| ExpansionError::transport(&endpoint.url, "no expansion service registered"))?;
        Ok(Box::new(LocalExpansionClient {
            url: endpoint.url.clone(),
            handler,
            connection: self.connection(),
        }))
    }

    async fn artifact_client(
        &self,
        endpoint: &ApiServiceDescriptor,
    ) -> Result<Box<dyn ArtifactClient>> {
        let store = self
            .artifacts
            .get(&endpoint.url)
            .cloned()
            .ok_or_else(|| ExpansionError::transport(&endpoint.url, "no artifact service registered"))?;
        Ok(Box::new(LocalArtifactClient {
            url: endpoint.url.clone(),
            store,
            connection: self.connection(),
        }))
    }
}

/// Tracks one open client against the factory's counter.
struct Connection {
    open: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl Connection {
    fn ensure_open(&self, url: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ExpansionError::transport(url, "client is closed"))
        } else {
            Ok(())
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct LocalExpansionClient {
    url: String,
    handler: Arc<dyn ExpansionHandler>,
    connection: Connection,
}

#[async_trait]
impl ExpansionClient for LocalExpansionClient {
    async fn expand(&self, request: ExpansionRequest) -> Result<ExpansionResponse> {
        self.connection.ensure_open(&self.url)?;
        debug!("Local expansion at {} for namespace {}", self.url, request.namespace);
        let response = self
            .handler
            .expand(&request)
            .map_err(|e| ExpansionError::RemoteExpansion {
                message: format!("{:#}", e),
            })?;
        check_remote_error(response)
    }

    fn close(&self) {
        self.connection.close();
    }
}

pub struct LocalArtifactClient {
    url: String,
    store: Arc<ArtifactStore>,
    connection: Connection,
}

#[async_trait]
impl ArtifactClient for LocalArtifactClient {
    async fn resolve_artifacts(
        &self,
        request: ResolveArtifactsRequest,
    ) -> Result<ResolveArtifactsResponse> {
        self.connection.ensure_open(&self.url)?;
        let replacements = self
            .store
            .resolve(&request.artifacts, &request.preferred_urns)?;
        Ok(ResolveArtifactsResponse { replacements })
    }

    async fn get_artifact(&self, request: GetArtifactRequest) -> Result<ChunkStream> {
        self.connection.ensure_open(&self.url)?;
        let artifact = request.artifact.unwrap_or_default();
        let chunks = self.store.chunks(&artifact)?;
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    fn close(&self) {
        self.connection.close();
    }
}
