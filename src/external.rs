//! External Transforms
//!
//! Caller-side entry point. An `ExternalTransform` names a transform by urn and
//! payload; applying it to a graph inserts a placeholder node that is replaced
//! by the remote expansion when the graph is finalized.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::client::ClientFactory;
use crate::error::{ExpansionError, Result};
use crate::graph::IdKind;
use crate::proto::{ApiServiceDescriptor, FunctionSpec, PCollection, PTransform, Pipeline};

/// A transform whose implementation lives behind an expansion service.
#[derive(Clone)]
pub struct ExternalTransform {
    spec: FunctionSpec,
    namespace_seed: String,
    endpoint: ApiServiceDescriptor,
    factory: Arc<dyn ClientFactory>,
    output_tags: Vec<String>,
}

impl ExternalTransform {
    pub fn of(
        urn: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        namespace_seed: impl Into<String>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            spec: FunctionSpec {
                urn: urn.into(),
                payload: payload.into(),
            },
            namespace_seed: namespace_seed.into(),
            endpoint: ApiServiceDescriptor::default(),
            factory,
            output_tags: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: ApiServiceDescriptor) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Output tags the expansion must produce. Downstream transforms can consume
    /// the placeholder's outputs before expansion; the ids stay valid afterwards.
    pub fn with_outputs<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn spec(&self) -> &FunctionSpec {
        &self.spec
    }

    pub fn namespace_seed(&self) -> &str {
        &self.namespace_seed
    }

    pub fn endpoint(&self) -> &ApiServiceDescriptor {
        &self.endpoint
    }

    pub fn factory(&self) -> &Arc<dyn ClientFactory> {
        &self.factory
    }

    /// Inserts the placeholder as a new top-level node of a copy of `graph`.
    ///
    /// `inputs` maps input tags to pcollection ids that must already exist.
    pub fn apply(
        &self,
        graph: &Pipeline,
        unique_name: &str,
        inputs: BTreeMap<String, String>,
    ) -> Result<(Pipeline, PendingExternal)> {
        let mut out = graph.clone();
        let components = out.components.get_or_insert_with(Default::default);

        for (tag, pc) in &inputs {
            if !components.pcollections.contains_key(pc) {
                return Err(ExpansionError::UnresolvedReference {
                    kind: IdKind::PCollection,
                    id: pc.clone(),
                    referrer: format!("input '{}' of '{}'", tag, unique_name),
                });
            }
        }

        let id = unused_id(unique_name, |candidate| components.transforms.contains_key(candidate));
        let mut outputs = BTreeMap::new();
        for tag in &self.output_tags {
            let pc_id = unused_id(&format!("{}.{}", id, tag), |candidate| {
                components.pcollections.contains_key(candidate)
            });
            components.pcollections.insert(
                pc_id.clone(),
                PCollection {
                    unique_name: pc_id.clone(),
                    ..Default::default()
                },
            );
            outputs.insert(tag.clone(), pc_id);
        }

        components.transforms.insert(
            id.clone(),
            PTransform {
                unique_name: unique_name.to_string(),
                spec: Some(self.spec.clone()),
                inputs,
                outputs,
                ..Default::default()
            },
        );
        out.root_transform_ids.push(id.clone());
        debug!("Applied external transform {} ({}) as {}", unique_name, self.spec.urn, id);

        Ok((
            out,
            PendingExternal {
                id,
                unique_name: unique_name.to_string(),
                transform: self.clone(),
            },
        ))
    }
}

impl fmt::Debug for ExternalTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalTransform")
            .field("urn", &self.spec.urn)
            .field("namespace_seed", &self.namespace_seed)
            .field("endpoint", &self.endpoint.url)
            .field("output_tags", &self.output_tags)
            .finish_non_exhaustive()
    }
}

/// Handle to a placeholder waiting for expansion.
#[derive(Debug, Clone)]
pub struct PendingExternal {
    /// Placeholder transform id in the caller graph.
    pub id: String,
    pub unique_name: String,
    pub transform: ExternalTransform,
}

/// `base`, or `base2`, `base3`, ... whichever is free first.
fn unused_id(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LocalClientFactory;

    fn factory() -> Arc<dyn ClientFactory> {
        Arc::new(LocalClientFactory::new())
    }

    #[test]
    fn test_apply_inserts_placeholder_and_outputs() {
        let ext = ExternalTransform::of("beam:transform:kafka_read:v1", b"cfg".to_vec(), "kafka", factory())
            .with_outputs(["out"]);
        let graph = Pipeline::default();

        let (graph, pending) = ext.apply(&graph, "ReadKafka", BTreeMap::new()).unwrap();
        let comps = graph.components.as_ref().unwrap();

        assert_eq!(pending.id, "ReadKafka");
        let node = &comps.transforms["ReadKafka"];
        assert_eq!(node.spec.as_ref().unwrap().urn, "beam:transform:kafka_read:v1");
        assert_eq!(node.spec.as_ref().unwrap().payload, b"cfg");
        assert_eq!(node.outputs["out"], "ReadKafka.out");
        assert!(comps.pcollections.contains_key("ReadKafka.out"));
        assert_eq!(graph.root_transform_ids, vec!["ReadKafka"]);
    }

    #[test]
    fn test_apply_twice_gets_distinct_ids() {
        let ext = ExternalTransform::of("urn", Vec::new(), "", factory()).with_outputs(["out"]);
        let (graph, first) = ext.apply(&Pipeline::default(), "Ext", BTreeMap::new()).unwrap();
        let (graph, second) = ext.apply(&graph, "Ext", BTreeMap::new()).unwrap();

        assert_eq!(first.id, "Ext");
        assert_eq!(second.id, "Ext2");
        let comps = graph.components.unwrap();
        assert_eq!(comps.transforms["Ext2"].outputs["out"], "Ext2.out");
        assert_eq!(comps.transforms["Ext2"].unique_name, "Ext");
    }

    #[test]
    fn test_apply_rejects_unknown_input() {
        let ext = ExternalTransform::of("urn", Vec::new(), "", factory());
        let mut inputs = BTreeMap::new();
        inputs.insert("input".to_string(), "missing".to_string());
        let before = Pipeline::default();

        let err = ext.apply(&before, "Ext", inputs).unwrap_err();
        assert!(matches!(err, ExpansionError::UnresolvedReference { .. }));
    }
}
