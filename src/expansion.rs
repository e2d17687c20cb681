//! Expansion Driver
//!
//! Runs one placeholder through prefix allocation, request construction, the
//! remote call and the merge, and finalizes a graph holding any number of
//! placeholders. Remote calls may overlap; merges are always applied one at a
//! time against the latest graph value.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::client::ScopedClient;
use crate::error::{ExpansionError, Result};
use crate::external::PendingExternal;
use crate::graph::IdKind;
use crate::merge::{self, MergedExpansion};
use crate::namespace::{self, NamespaceAllocator};
use crate::proto::{ExpansionRequest, ExpansionResponse, PTransform, Pipeline};
use crate::request::build_request;

/// A finished remote call, not yet merged.
#[derive(Debug, Clone)]
pub struct ExpansionCall {
    pub placeholder_id: String,
    pub unique_name: String,
    /// Single-use prefix committed to this call.
    pub prefix: String,
    pub request: ExpansionRequest,
    pub response: ExpansionResponse,
}

/// Allocates a prefix, builds the request and performs the remote `Expand`.
///
/// The client is released on every exit path. `graph` is only read.
#[tracing::instrument(skip_all, fields(transform = %pending.unique_name, urn = %pending.transform.spec().urn))]
pub async fn request_expansion(
    graph: &Pipeline,
    pending: &PendingExternal,
    allocator: &dyn NamespaceAllocator,
) -> Result<ExpansionCall> {
    let placeholder = placeholder(graph, &pending.id)?;
    let ext = &pending.transform;

    let prefix = namespace::fresh_prefix(allocator, ext.namespace_seed(), graph);
    debug!("Allocated namespace {}", prefix);

    let request = build_request(
        &pending.unique_name,
        ext.spec(),
        &placeholder.inputs,
        graph,
        &graph.requirements,
        &prefix,
    )?;

    let client = ScopedClient::new(ext.factory().expansion_client(ext.endpoint()).await?);
    info!("Requesting expansion at {:?}", ext.endpoint().url);
    let response = client.expand(request.clone()).await?;

    Ok(ExpansionCall {
        placeholder_id: pending.id.clone(),
        unique_name: pending.unique_name.clone(),
        prefix,
        request,
        response,
    })
}

/// Validates `call` against `graph` and returns the merged graph.
pub fn merge_expansion(graph: &Pipeline, call: ExpansionCall) -> Result<MergedExpansion> {
    merge::merge(graph, &call.placeholder_id, &call.request, call.response)
}

/// Expands a single placeholder. Failures name the external transform.
pub async fn expand(
    graph: &Pipeline,
    pending: &PendingExternal,
    allocator: &dyn NamespaceAllocator,
) -> Result<MergedExpansion> {
    let call = request_expansion(graph, pending, allocator)
        .await
        .map_err(|e| e.in_transform(&pending.unique_name))?;
    merge_expansion(graph, call).map_err(|e| e.in_transform(&pending.unique_name))
}

/// Expands every placeholder in `pending` and returns the resulting graph.
///
/// Placeholders are processed in waves: a wave holds those whose inputs are not
/// produced by another placeholder still waiting, so downstream expansions see
/// their inputs' real descriptors. Calls within a wave run concurrently and are
/// merged in `pending` order. The first failure aborts the whole finalization.
#[tracing::instrument(skip_all, fields(placeholders = pending.len()))]
pub async fn finalize(
    graph: &Pipeline,
    pending: &[PendingExternal],
    allocator: &dyn NamespaceAllocator,
) -> Result<Pipeline> {
    let mut current = graph.clone();
    let mut remaining: Vec<&PendingExternal> = pending.iter().collect();
    let mut wave_number = 0;

    while !remaining.is_empty() {
        wave_number += 1;
        let (wave, rest) = next_wave(&current, remaining);
        remaining = rest;
        debug!("Wave {}: {} expansions", wave_number, wave.len());

        let calls = join_all(wave.iter().map(|p| {
            let current = &current;
            async move {
                request_expansion(current, p, allocator)
                    .await
                    .map_err(|e| e.in_transform(&p.unique_name))
            }
        }))
        .await;

        let mut next = current.clone();
        for (call, p) in calls.into_iter().zip(&wave) {
            let merged = merge_expansion(&next, call?).map_err(|e| e.in_transform(&p.unique_name))?;
            next = merged.pipeline;
        }
        current = next;
    }

    info!("Finalized {} external transforms", pending.len());
    Ok(current)
}

/// Splits `remaining` into the placeholders ready to expand now and the rest.
///
/// Always makes progress: if nothing is ready the first placeholder runs alone.
fn next_wave<'a>(
    graph: &Pipeline,
    remaining: Vec<&'a PendingExternal>,
) -> (Vec<&'a PendingExternal>, Vec<&'a PendingExternal>) {
    let transforms = graph.components.as_ref().map(|c| &c.transforms);
    let node = |p: &PendingExternal| transforms.and_then(|t| t.get(&p.id));

    let unexpanded_outputs: BTreeSet<&String> = remaining
        .iter()
        .filter_map(|p| node(*p))
        .flat_map(|t| t.outputs.values())
        .collect();

    let (mut ready, mut waiting): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|p| {
        node(*p)
            .map(|t| !t.inputs.values().any(|pc| unexpanded_outputs.contains(pc)))
            .unwrap_or(true)
    });

    if ready.is_empty() && !waiting.is_empty() {
        ready.push(waiting.remove(0));
    }
    (ready, waiting)
}

fn placeholder<'a>(graph: &'a Pipeline, id: &str) -> Result<&'a PTransform> {
    graph
        .components
        .as_ref()
        .and_then(|c| c.transforms.get(id))
        .ok_or_else(|| ExpansionError::UnresolvedReference {
            kind: IdKind::Transform,
            id: id.to_string(),
            referrer: "expansion placeholder".to_string(),
        })
}

/// A caller graph shared between tasks that issue expansions independently.
///
/// Every merge holds the lock for its whole duration, so merges never interleave.
#[derive(Debug, Clone, Default)]
pub struct SharedPipeline {
    inner: Arc<Mutex<Pipeline>>,
}

impl SharedPipeline {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            inner: Arc::new(Mutex::new(pipeline)),
        }
    }

    pub async fn snapshot(&self) -> Pipeline {
        self.inner.lock().await.clone()
    }

    /// Merges a finished call into the current graph value.
    pub async fn apply(&self, call: ExpansionCall) -> Result<MergedExpansion> {
        let mut guard = self.inner.lock().await;
        let unique_name = call.unique_name.clone();
        let merged = merge_expansion(&guard, call).map_err(|e| e.in_transform(unique_name))?;
        *guard = merged.pipeline.clone();
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientFactory, LocalClientFactory};
    use crate::external::ExternalTransform;
    use crate::namespace::CountingNamespace;
    use crate::proto::{ApiServiceDescriptor, Coder, FunctionSpec, PCollection};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    const URL: &str = "local:expander";

    /// Expands any transform into one leaf `Create` producing `out`.
    fn create(request: &ExpansionRequest) -> anyhow::Result<ExpansionResponse> {
        let ns = &request.namespace;
        let requested = request.transform.clone().unwrap_or_default();
        let coder = format!("{ns}varint");
        let out = format!("{ns}out");

        let mut root = PTransform {
            unique_name: requested.unique_name.clone(),
            spec: Some(FunctionSpec {
                urn: "beam:transform:create:v1".into(),
                payload: b"1,2,3".to_vec(),
            }),
            inputs: requested.inputs.clone(),
            ..Default::default()
        };
        root.outputs.insert("out".into(), out.clone());

        let mut response = ExpansionResponse {
            transform: Some(root.clone()),
            requirements: vec!["R1".into()],
            ..Default::default()
        };
        let components = response.components.get_or_insert_with(Default::default);
        components.transforms.insert(format!("{ns}Create"), root);
        components.pcollections.insert(
            out.clone(),
            PCollection {
                unique_name: out,
                coder_id: coder.clone(),
                ..Default::default()
            },
        );
        components.coders.insert(
            coder,
            Coder {
                spec: Some(FunctionSpec {
                    urn: "beam:coder:varint:v1".into(),
                    payload: vec![],
                }),
                ..Default::default()
            },
        );
        Ok(response)
    }

    fn external(factory: Arc<dyn ClientFactory>) -> ExternalTransform {
        ExternalTransform::of("beam:transform:create:v1", Vec::new(), "ext", factory)
            .with_endpoint(ApiServiceDescriptor { url: URL.into() })
            .with_outputs(["out"])
    }

    #[tokio::test]
    async fn test_expand_single_placeholder() {
        let factory = Arc::new(LocalClientFactory::new().with_expansion_service(URL, create));
        let ext = external(factory.clone());
        let (graph, pending) = ext.apply(&Pipeline::default(), "Numbers", BTreeMap::new()).unwrap();

        let merged = expand(&graph, &pending, &CountingNamespace::new()).await.unwrap();

        let comps = merged.pipeline.components.as_ref().unwrap();
        assert_eq!(merged.root_id, "Numbers");
        assert_eq!(
            comps.transforms["Numbers"].spec.as_ref().unwrap().payload,
            b"1,2,3"
        );
        assert_eq!(comps.transforms["Numbers"].outputs["out"], "Numbers.out");
        assert_eq!(comps.pcollections["Numbers.out"].coder_id, "ext#1#varint");
        assert_eq!(merged.pipeline.requirements, vec!["R1"]);
        assert_eq!(factory.open_clients(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_names_transform() {
        let factory = Arc::new(LocalClientFactory::new().with_expansion_service(
            URL,
            |_: &ExpansionRequest| -> anyhow::Result<ExpansionResponse> {
                anyhow::bail!("unknown urn")
            },
        ));
        let ext = external(factory.clone());
        let (graph, pending) = ext.apply(&Pipeline::default(), "Numbers", BTreeMap::new()).unwrap();

        let err = finalize(&graph, &[pending], &CountingNamespace::new()).await.unwrap_err();

        assert!(matches!(err, ExpansionError::Expansion { ref transform, .. } if transform == "Numbers"));
        assert!(matches!(err.root_cause(), ExpansionError::RemoteExpansion { message } if message.contains("unknown urn")));
        assert_eq!(factory.open_clients(), 0);
    }

    #[tokio::test]
    async fn test_finalize_orders_dependent_placeholders() {
        let seen: Arc<StdMutex<Vec<ExpansionRequest>>> = Arc::default();
        let recorder = seen.clone();
        let factory = Arc::new(LocalClientFactory::new().with_expansion_service(
            URL,
            move |req: &ExpansionRequest| -> anyhow::Result<ExpansionResponse> {
                recorder.lock().unwrap().push(req.clone());
                create(req)
            },
        ));
        let ext = external(factory);

        let (graph, first) = ext.apply(&Pipeline::default(), "A", BTreeMap::new()).unwrap();
        let mut inputs = BTreeMap::new();
        inputs.insert("input".to_string(), "A.out".to_string());
        let (graph, second) = ext.apply(&graph, "B", inputs).unwrap();

        // Pass the dependent one first; finalize still expands A before B.
        let result = finalize(&graph, &[second, first], &CountingNamespace::new()).await.unwrap();

        let requests = seen.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].transform.as_ref().unwrap().unique_name, "A");
        let b_request = requests[1].components.as_ref().unwrap();
        assert_eq!(b_request.pcollections["A.out"].coder_id, requests[0].namespace.clone() + "varint");
        assert!(b_request.coders.contains_key(&(requests[0].namespace.clone() + "varint")));

        let comps = result.components.unwrap();
        assert_eq!(comps.transforms["B"].inputs["input"], "A.out");
        assert_eq!(result.requirements, vec!["R1"]);
        // Input graph is a value; it still holds both placeholders.
        assert_eq!(
            graph.components.unwrap().transforms["A"].spec.as_ref().unwrap().payload,
            Vec::<u8>::new()
        );
    }

    #[tokio::test]
    async fn test_shared_pipeline_serializes_merges() {
        let factory = Arc::new(LocalClientFactory::new().with_expansion_service(URL, create));
        let ext = external(factory);
        let (graph, a) = ext.apply(&Pipeline::default(), "A", BTreeMap::new()).unwrap();
        let (graph, b) = ext.apply(&graph, "B", BTreeMap::new()).unwrap();
        let allocator = Arc::new(CountingNamespace::new());
        let shared = SharedPipeline::new(graph);

        let mut handles = Vec::new();
        for pending in [a, b] {
            let shared = shared.clone();
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                let snapshot = shared.snapshot().await;
                let call = request_expansion(&snapshot, &pending, allocator.as_ref()).await?;
                shared.apply(call).await.map(|m| m.introduced)
            }));
        }

        let mut introduced = Vec::new();
        for handle in handles {
            introduced.push(handle.await.unwrap().unwrap());
        }
        assert!(introduced[0].is_disjoint(&introduced[1]));

        let comps = shared.snapshot().await.components.unwrap();
        assert!(comps.transforms["A"].spec.as_ref().unwrap().payload == b"1,2,3");
        assert!(comps.transforms["B"].spec.as_ref().unwrap().payload == b"1,2,3");
    }

    #[tokio::test]
    async fn test_missing_placeholder_is_unresolved() {
        let factory = Arc::new(LocalClientFactory::new().with_expansion_service(URL, create));
        let ext = external(factory);
        let (_, pending) = ext.apply(&Pipeline::default(), "A", BTreeMap::new()).unwrap();

        let err = request_expansion(&Pipeline::default(), &pending, &CountingNamespace::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExpansionError::UnresolvedReference { kind: IdKind::Transform, .. }));
    }
}
