//! Remote Service Clients
//!
//! Capability interfaces for the two remote services an expansion talks to.
//! Concrete transports (gRPC, in-process) are picked by a `ClientFactory`
//! keyed on the endpoint descriptor.

pub mod grpc;
pub mod local;

pub use grpc::GrpcClientFactory;
pub use local::{ExpansionHandler, LocalClientFactory};

use std::ops::Deref;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{ExpansionError, Result};
use crate::proto::{
    ApiServiceDescriptor, ExpansionRequest, ExpansionResponse, GetArtifactRequest,
    ResolveArtifactsRequest, ResolveArtifactsResponse,
};

/// Artifact content as an in-order, finite stream of byte chunks.
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>>>;

/// One unary `Expand` exchange per call, no retries.
#[async_trait]
pub trait ExpansionClient: Send + Sync {
    async fn expand(&self, request: ExpansionRequest) -> Result<ExpansionResponse>;

    /// Release the underlying connection. Further calls fail with `Transport`.
    fn close(&self);
}

#[async_trait]
pub trait ArtifactClient: Send + Sync {
    /// Either the full resolved list or a failure.
    async fn resolve_artifacts(
        &self,
        request: ResolveArtifactsRequest,
    ) -> Result<ResolveArtifactsResponse>;

    /// Re-invoking with the same request restarts the stream from the first byte.
    async fn get_artifact(&self, request: GetArtifactRequest) -> Result<ChunkStream>;

    fn close(&self);
}

/// Produces clients for a given endpoint.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn expansion_client(
        &self,
        endpoint: &ApiServiceDescriptor,
    ) -> Result<Box<dyn ExpansionClient>>;

    async fn artifact_client(&self, endpoint: &ApiServiceDescriptor)
        -> Result<Box<dyn ArtifactClient>>;

    /// Releases resources held by the factory itself, such as pooled channels.
    /// The bundled factories pool nothing: each client owns its connection and
    /// releases it through its own `close`, so this leaves issued clients usable.
    fn close(&self) {}
}

/// Anything holding a connection that must be released.
pub trait Release {
    fn release(&self);
}

impl Release for dyn ExpansionClient {
    fn release(&self) {
        self.close();
    }
}

impl Release for dyn ArtifactClient {
    fn release(&self) {
        self.close();
    }
}

/// Closes the wrapped client when dropped, so every exit path releases it.
pub struct ScopedClient<C: ?Sized + Release> {
    inner: Box<C>,
}

impl<C: ?Sized + Release> ScopedClient<C> {
    pub fn new(inner: Box<C>) -> Self {
        Self { inner }
    }
}

impl<C: ?Sized + Release> Deref for ScopedClient<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.inner
    }
}

impl<C: ?Sized + Release> Drop for ScopedClient<C> {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// Turns an in-band error report into `RemoteExpansion`.
pub fn check_remote_error(response: ExpansionResponse) -> Result<ExpansionResponse> {
    if response.error.is_empty() {
        Ok(response)
    } else {
        Err(ExpansionError::RemoteExpansion {
            message: response.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl ExpansionClient for Counting {
        async fn expand(&self, _request: ExpansionRequest) -> Result<ExpansionResponse> {
            Err(ExpansionError::transport("test", "refused"))
        }

        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_scoped_client_closes_on_error_path() {
        let closes = Arc::new(AtomicUsize::new(0));
        let result = {
            let client: ScopedClient<dyn ExpansionClient> =
                ScopedClient::new(Box::new(Counting(closes.clone())));
            client.expand(ExpansionRequest::default()).await
        };
        assert!(result.is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_in_band_error_becomes_remote_expansion() {
        let response = ExpansionResponse {
            error: "unknown urn".to_string(),
            ..Default::default()
        };
        match check_remote_error(response) {
            Err(ExpansionError::RemoteExpansion { message }) => assert_eq!(message, "unknown urn"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert!(check_remote_error(ExpansionResponse::default()).is_ok());
    }
}
