//! gRPC transport
//!
//! Thin tonic clients for `ExpansionService` and `ArtifactRetrievalService`.
//! Each client owns one channel; `close()` drops it.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, info};

use super::{check_remote_error, ArtifactClient, ChunkStream, ClientFactory, ExpansionClient};
use crate::config::ExpansionConfig;
use crate::error::{ExpansionError, Result};
use crate::proto::artifact::v1::artifact_retrieval_service_client::ArtifactRetrievalServiceClient;
use crate::proto::expansion::v1::expansion_service_client::ExpansionServiceClient;
use crate::proto::{
    ApiServiceDescriptor, ExpansionRequest, ExpansionResponse, GetArtifactRequest,
    ResolveArtifactsRequest, ResolveArtifactsResponse,
};

/// Connects tonic clients with the configured timeouts.
#[derive(Debug, Clone)]
pub struct GrpcClientFactory {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl GrpcClientFactory {
    pub fn new(config: &ExpansionConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    async fn connect(&self, endpoint: &ApiServiceDescriptor) -> Result<(String, Channel)> {
        let url = normalize_url(&endpoint.url)?;
        let channel = Endpoint::from_shared(url.clone())
            .map_err(|e| ExpansionError::transport(&url, e))?
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .connect()
            .await
            .map_err(|e| ExpansionError::transport(&url, e))?;
        debug!("Connected to {}", url);
        Ok((url, channel))
    }
}

impl Default for GrpcClientFactory {
    fn default() -> Self {
        Self::new(&ExpansionConfig::default())
    }
}

#[async_trait]
impl ClientFactory for GrpcClientFactory {
    async fn expansion_client(
        &self,
        endpoint: &ApiServiceDescriptor,
    ) -> Result<Box<dyn ExpansionClient>> {
        let (url, channel) = self.connect(endpoint).await?;
        Ok(Box::new(GrpcExpansionClient {
            url,
            client: Mutex::new(Some(ExpansionServiceClient::new(channel))),
        }))
    }

    async fn artifact_client(
        &self,
        endpoint: &ApiServiceDescriptor,
    ) -> Result<Box<dyn ArtifactClient>> {
        let (url, channel) = self.connect(endpoint).await?;
        Ok(Box::new(GrpcArtifactClient {
            url,
            client: Mutex::new(Some(ArtifactRetrievalServiceClient::new(channel))),
        }))
    }
}

/// Accepts bare `host:port` descriptors as well as full urls.
fn normalize_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ExpansionError::transport("<unset>", "no endpoint url configured"));
    }
    if url.contains("://") {
        Ok(url.to_string())
    } else {
        Ok(format!("http://{}", url))
    }
}

/// Takes a clone of the channel-backed client, or fails if it was closed.
fn checkout<T: Clone>(slot: &Mutex<Option<T>>, url: &str) -> Result<T> {
    slot.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(|| ExpansionError::transport(url, "client is closed"))
}

fn release<T>(slot: &Mutex<Option<T>>, url: &str) {
    if slot.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
        debug!("Released channel to {}", url);
    }
}

fn is_transport_code(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled | Code::Aborted
    )
}

fn expansion_status(url: &str, status: Status) -> ExpansionError {
    if is_transport_code(status.code()) {
        ExpansionError::transport(url, status)
    } else {
        ExpansionError::RemoteExpansion {
            message: format!("{:?}: {}", status.code(), status.message()),
        }
    }
}

fn artifact_status(url: &str, status: Status) -> ExpansionError {
    if status.code() == Code::NotFound {
        ExpansionError::ArtifactNotFound {
            artifact: status.message().to_string(),
        }
    } else {
        ExpansionError::transport(url, status)
    }
}

pub struct GrpcExpansionClient {
    url: String,
    client: Mutex<Option<ExpansionServiceClient<Channel>>>,
}

#[async_trait]
impl ExpansionClient for GrpcExpansionClient {
    async fn expand(&self, request: ExpansionRequest) -> Result<ExpansionResponse> {
        let mut client = checkout(&self.client, &self.url)?;
        info!("Expand at {} (namespace {})", self.url, request.namespace);
        let response = client
            .expand(request)
            .await
            .map_err(|s| expansion_status(&self.url, s))?
            .into_inner();
        check_remote_error(response)
    }

    fn close(&self) {
        release(&self.client, &self.url);
    }
}

pub struct GrpcArtifactClient {
    url: String,
    client: Mutex<Option<ArtifactRetrievalServiceClient<Channel>>>,
}

#[async_trait]
impl ArtifactClient for GrpcArtifactClient {
    async fn resolve_artifacts(
        &self,
        request: ResolveArtifactsRequest,
    ) -> Result<ResolveArtifactsResponse> {
        let mut client = checkout(&self.client, &self.url)?;
        Ok(client
            .resolve_artifacts(request)
            .await
            .map_err(|s| artifact_status(&self.url, s))?
            .into_inner())
    }

    async fn get_artifact(&self, request: GetArtifactRequest) -> Result<ChunkStream> {
        let mut client = checkout(&self.client, &self.url)?;
        let stream = client
            .get_artifact(request)
            .await
            .map_err(|s| artifact_status(&self.url, s))?
            .into_inner();
        let url = self.url.clone();
        // The stream holds its own channel handle; dropping it mid-way cancels the call.
        Ok(stream
            .map(move |chunk| {
                chunk
                    .map(|c| c.data)
                    .map_err(|s| artifact_status(&url, s))
            })
            .boxed())
    }

    fn close(&self) {
        release(&self.client, &self.url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("localhost:8097").unwrap(), "http://localhost:8097");
        assert_eq!(normalize_url("https://svc:443").unwrap(), "https://svc:443");
        assert!(matches!(
            normalize_url("  "),
            Err(ExpansionError::Transport { .. })
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            expansion_status("u", Status::unavailable("down")),
            ExpansionError::Transport { .. }
        ));
        assert!(matches!(
            expansion_status("u", Status::invalid_argument("bad payload")),
            ExpansionError::RemoteExpansion { .. }
        ));
        assert!(matches!(
            artifact_status("u", Status::not_found("file lib.jar")),
            ExpansionError::ArtifactNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let config = ExpansionConfig {
            connect_timeout_ms: 200,
            ..Default::default()
        };
        let factory = GrpcClientFactory::new(&config);
        // Port 1 on loopback is never an expansion service.
        let err = factory
            .expansion_client(&ApiServiceDescriptor {
                url: "127.0.0.1:1".to_string(),
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExpansionError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_artifact_connect_refused_is_transport_error() {
        let config = ExpansionConfig {
            connect_timeout_ms: 200,
            ..Default::default()
        };
        let factory = GrpcClientFactory::new(&config);
        let err = factory
            .artifact_client(&ApiServiceDescriptor {
                url: "127.0.0.1:1".to_string(),
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExpansionError::Transport { .. }));
    }
}
