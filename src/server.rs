//! Expansion / Artifact gRPC Server Wrappers
//!
//! Bridges an in-process `ExpansionHandler` and `ArtifactStore` to the
//! generated tonic services. Thin translation layer, no expansion logic.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::artifact::ArtifactStore;
use crate::client::ExpansionHandler;
use crate::error::{ExpansionError, Result};
use crate::proto::artifact::v1::artifact_retrieval_service_server::{
    ArtifactRetrievalService, ArtifactRetrievalServiceServer,
};
use crate::proto::expansion::v1::expansion_service_server::{
    ExpansionService, ExpansionServiceServer,
};
use crate::proto::{
    ExpansionRequest, ExpansionResponse, GetArtifactRequest, GetArtifactResponse,
    ResolveArtifactsRequest, ResolveArtifactsResponse,
};

pub struct ExpansionGrpcService {
    handler: Arc<dyn ExpansionHandler>,
}

impl ExpansionGrpcService {
    pub fn new(handler: Arc<dyn ExpansionHandler>) -> Self {
        Self { handler }
    }
}

#[tonic::async_trait]
impl ExpansionService for ExpansionGrpcService {
    async fn expand(
        &self,
        request: Request<ExpansionRequest>,
    ) -> Result<Response<ExpansionResponse>, Status> {
        let req = request.into_inner();
        let response = match self.handler.expand(&req) {
            Ok(response) => response,
            // Failures travel in-band so the caller sees the handler's message verbatim.
            Err(e) => {
                warn!("Expansion in namespace {} failed: {:#}", req.namespace, e);
                ExpansionResponse {
                    error: format!("{:#}", e),
                    ..Default::default()
                }
            }
        };
        Ok(Response::new(response))
    }
}

pub struct ArtifactGrpcService {
    store: Arc<ArtifactStore>,
}

impl ArtifactGrpcService {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self { store }
    }
}

fn to_status(err: ExpansionError) -> Status {
    match err {
        ExpansionError::ArtifactNotFound { artifact } => Status::not_found(artifact),
        other => Status::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl ArtifactRetrievalService for ArtifactGrpcService {
    type GetArtifactStream = BoxStream<'static, Result<GetArtifactResponse, Status>>;

    async fn resolve_artifacts(
        &self,
        request: Request<ResolveArtifactsRequest>,
    ) -> Result<Response<ResolveArtifactsResponse>, Status> {
        let req = request.into_inner();
        let replacements = self
            .store
            .resolve(&req.artifacts, &req.preferred_urns)
            .map_err(to_status)?;
        Ok(Response::new(ResolveArtifactsResponse { replacements }))
    }

    async fn get_artifact(
        &self,
        request: Request<GetArtifactRequest>,
    ) -> Result<Response<Self::GetArtifactStream>, Status> {
        let artifact = request.into_inner().artifact.unwrap_or_default();
        let chunks = self.store.chunks(&artifact).map_err(to_status)?;
        let stream = stream::iter(
            chunks
                .into_iter()
                .map(|data| Ok(GetArtifactResponse { data })),
        );
        Ok(Response::new(stream.boxed()))
    }
}

/// Hosts both services on one listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn ExpansionHandler>,
    store: Arc<ArtifactStore>,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| ExpansionError::transport("<listener>", e))?;
    info!("Expansion service listening at {}", addr);

    tonic::transport::Server::builder()
        .add_service(ExpansionServiceServer::new(ExpansionGrpcService::new(handler)))
        .add_service(ArtifactRetrievalServiceServer::new(ArtifactGrpcService::new(store)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .map_err(|e| ExpansionError::transport(addr.to_string(), e))
}
