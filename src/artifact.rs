//! Artifact Resolution
//!
//! Helpers a provisioning step uses to materialize the binary dependencies of
//! an expanded transform's environment, plus the in-memory `ArtifactStore`
//! served by the local transport and the gRPC server adapter.

use std::collections::BTreeMap;

use futures::StreamExt;
use prost::Message;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::client::ArtifactClient;
use crate::config::ExpansionConfig;
use crate::error::{ExpansionError, Result};
use crate::proto::{
    ArtifactFilePayload, ArtifactInformation, ArtifactUrlPayload, Environment, GetArtifactRequest,
    ResolveArtifactsRequest,
};

pub const FILE_ARTIFACT_URN: &str = "beam:artifact:type:file:v1";
pub const URL_ARTIFACT_URN: &str = "beam:artifact:type:url:v1";
pub const STAGING_TO_ROLE_URN: &str = "beam:artifact:role:staging_to:v1";

/// Chunk size used when streaming artifact content.
pub const DEFAULT_CHUNK_SIZE: usize = 64 << 10;

/// Resolves every dependency of `environment` into concrete artifacts.
pub async fn resolve_environment(
    client: &dyn ArtifactClient,
    environment: &Environment,
    preferred_urns: &[String],
) -> Result<Vec<ArtifactInformation>> {
    if environment.dependencies.is_empty() {
        return Ok(Vec::new());
    }
    let response = client
        .resolve_artifacts(ResolveArtifactsRequest {
            artifacts: environment.dependencies.clone(),
            preferred_urns: preferred_urns.to_vec(),
        })
        .await?;
    info!(
        "Resolved {} environment dependencies into {} artifacts",
        environment.dependencies.len(),
        response.replacements.len()
    );
    Ok(response.replacements)
}

/// Pulls the whole chunk stream and checks the sha256 the artifact declares, if any.
pub async fn fetch_artifact(
    client: &dyn ArtifactClient,
    artifact: &ArtifactInformation,
) -> Result<Vec<u8>> {
    let mut stream = client
        .get_artifact(GetArtifactRequest {
            artifact: Some(artifact.clone()),
        })
        .await?;

    let mut content = Vec::new();
    let mut chunks = 0usize;
    while let Some(chunk) = stream.next().await {
        content.extend_from_slice(&chunk?);
        chunks += 1;
    }
    debug!("Fetched {} ({} bytes in {} chunks)", describe(artifact), content.len(), chunks);

    if let Some(expected) = declared_sha256(artifact) {
        let actual = hex::encode(Sha256::digest(&content));
        if !actual.eq_ignore_ascii_case(&expected) {
            return Err(ExpansionError::Transport {
                endpoint: describe(artifact),
                detail: format!("sha256 mismatch: expected {}, got {}", expected, actual),
            });
        }
    }
    Ok(content)
}

/// A `beam:artifact:type:file:v1` descriptor carrying the content's sha256.
pub fn file_artifact(path: &str, content: &[u8]) -> ArtifactInformation {
    let payload = ArtifactFilePayload {
        path: path.to_string(),
        sha256: hex::encode(Sha256::digest(content)),
    };
    ArtifactInformation {
        type_urn: FILE_ARTIFACT_URN.to_string(),
        type_payload: payload.encode_to_vec(),
        role_urn: STAGING_TO_ROLE_URN.to_string(),
        role_payload: Vec::new(),
    }
}

/// A `beam:artifact:type:url:v1` descriptor.
pub fn url_artifact(url: &str, sha256: Option<&str>) -> ArtifactInformation {
    let payload = ArtifactUrlPayload {
        url: url.to_string(),
        sha256: sha256.unwrap_or_default().to_string(),
    };
    ArtifactInformation {
        type_urn: URL_ARTIFACT_URN.to_string(),
        type_payload: payload.encode_to_vec(),
        role_urn: String::new(),
        role_payload: Vec::new(),
    }
}

/// Short human readable name for logs and errors.
pub fn describe(artifact: &ArtifactInformation) -> String {
    match artifact.type_urn.as_str() {
        FILE_ARTIFACT_URN => match ArtifactFilePayload::decode(artifact.type_payload.as_slice()) {
            Ok(p) => format!("file {}", p.path),
            Err(_) => artifact.type_urn.clone(),
        },
        URL_ARTIFACT_URN => match ArtifactUrlPayload::decode(artifact.type_payload.as_slice()) {
            Ok(p) => format!("url {}", p.url),
            Err(_) => artifact.type_urn.clone(),
        },
        other => format!("{} ({} byte payload)", other, artifact.type_payload.len()),
    }
}

fn declared_sha256(artifact: &ArtifactInformation) -> Option<String> {
    let sha = match artifact.type_urn.as_str() {
        FILE_ARTIFACT_URN => ArtifactFilePayload::decode(artifact.type_payload.as_slice())
            .ok()?
            .sha256,
        URL_ARTIFACT_URN => ArtifactUrlPayload::decode(artifact.type_payload.as_slice())
            .ok()?
            .sha256,
        _ => return None,
    };
    (!sha.is_empty()).then_some(sha)
}

/// Artifacts are keyed by their encoded descriptor.
fn key(artifact: &ArtifactInformation) -> Vec<u8> {
    artifact.encode_to_vec()
}

/// In-memory artifact service state.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    contents: BTreeMap<Vec<u8>, Vec<u8>>,
    replacements: BTreeMap<Vec<u8>, Vec<ArtifactInformation>>,
    chunk_size: usize,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self {
            contents: BTreeMap::new(),
            replacements: BTreeMap::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Empty store streaming in chunks of `config.artifact_chunk_size`.
    pub fn from_config(config: &ExpansionConfig) -> Self {
        Self::new().with_chunk_size(config.artifact_chunk_size)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Stores retrievable content for `artifact`.
    pub fn insert(&mut self, artifact: &ArtifactInformation, content: impl Into<Vec<u8>>) {
        self.contents.insert(key(artifact), content.into());
    }

    /// Declares that `artifact` resolves to `replacements` (possibly none).
    pub fn insert_resolution(
        &mut self,
        artifact: &ArtifactInformation,
        replacements: Vec<ArtifactInformation>,
    ) {
        self.replacements.insert(key(artifact), replacements);
    }

    /// Resolves each requested artifact. When `preferred_urns` is non-empty and a
    /// resolution offers artifacts of a preferred type, only those are kept.
    pub fn resolve(
        &self,
        requested: &[ArtifactInformation],
        preferred_urns: &[String],
    ) -> Result<Vec<ArtifactInformation>> {
        let mut resolved = Vec::new();
        for artifact in requested {
            let k = key(artifact);
            let candidates = match self.replacements.get(&k) {
                Some(replacements) => replacements.clone(),
                None if self.contents.contains_key(&k) => vec![artifact.clone()],
                None => {
                    return Err(ExpansionError::ArtifactNotFound {
                        artifact: describe(artifact),
                    })
                }
            };
            let preferred: Vec<ArtifactInformation> = candidates
                .iter()
                .filter(|c| preferred_urns.contains(&c.type_urn))
                .cloned()
                .collect();
            if preferred.is_empty() {
                resolved.extend(candidates);
            } else {
                resolved.extend(preferred);
            }
        }
        Ok(resolved)
    }

    pub fn content(&self, artifact: &ArtifactInformation) -> Result<&[u8]> {
        self.contents
            .get(&key(artifact))
            .map(Vec::as_slice)
            .ok_or_else(|| ExpansionError::ArtifactNotFound {
                artifact: describe(artifact),
            })
    }

    /// Content split into `chunk_size` pieces, in order.
    pub fn chunks(&self, artifact: &ArtifactInformation) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .content(artifact)?
            .chunks(self.chunk_size)
            .map(<[u8]>::to_vec)
            .collect())
    }
}
