//! Response Validation & Graph Merge
//!
//! Validation runs to completion before anything is built, and the merge
//! produces a new `Pipeline` value from the caller's graph and the returned
//! fragment. The caller's graph is never touched, so a rejected response
//! leaves it exactly as it was.
//!
//! Ids in the fragment fall into three groups:
//! - shared: components the caller shipped in the request (inputs and their
//!   coders, windowing strategies, environments). They may be returned, but
//!   only unchanged, and references to them resolve against the caller graph.
//! - the root: the one transform matching `response.transform`. It takes over
//!   the placeholder's id, and its outputs take over the placeholder's output
//!   pcollection ids, so existing edges stay valid.
//! - everything else: must be new to the caller graph.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::error::{ExpansionError, Result, Violation};
use crate::graph::{self, IdKind, Relabeling};
use crate::proto::{Components, ExpansionRequest, ExpansionResponse, PTransform, Pipeline};

/// A response that passed every structural check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedExpansion {
    /// Id of the root inside the returned fragment.
    pub fragment_root_id: String,
}

/// Result of a successful merge.
#[derive(Debug, Clone)]
pub struct MergedExpansion {
    pub pipeline: Pipeline,
    /// Id of the expanded root in `pipeline`; always the placeholder's id.
    pub root_id: String,
    /// Ids the expansion added to the caller graph.
    pub introduced: BTreeSet<(IdKind, String)>,
    /// Requirements that were not declared before the merge.
    pub new_requirements: Vec<String>,
}

/// Checks `response` against the caller graph and the request that produced it.
pub fn validate(
    caller: &Pipeline,
    placeholder_id: &str,
    request: &ExpansionRequest,
    response: &ExpansionResponse,
) -> Result<ValidatedExpansion> {
    let empty = Components::default();
    let graph = caller.components.as_ref().unwrap_or(&empty);
    let placeholder = placeholder(graph, placeholder_id)?;
    let fragment = response.components.as_ref().unwrap_or(&empty);
    let shared = request.components.as_ref().unwrap_or(&empty);

    let mut violations = Vec::new();

    let root_id = locate_root(fragment, response.transform.as_ref(), &mut violations);
    if let Some(root_id) = &root_id {
        let requested_inputs = request
            .transform
            .as_ref()
            .map(|t| &t.inputs)
            .unwrap_or(&placeholder.inputs);
        check_root(
            &fragment.transforms[root_id],
            requested_inputs,
            placeholder,
            &mut violations,
        );
    }

    // Caller inputs keep their single producer.
    for (tid, transform) in &fragment.transforms {
        for (tag, pc) in &transform.outputs {
            if graph::contains(shared, IdKind::PCollection, pc) {
                violations.push(Violation::OutputAliasesInput {
                    transform: tid.clone(),
                    tag: tag.clone(),
                    pcollection: pc.clone(),
                });
            }
        }
    }

    for reference in graph::references(fragment) {
        let resolves = graph::contains(fragment, reference.kind, &reference.id)
            || (graph::contains(shared, reference.kind, &reference.id)
                && graph::contains(graph, reference.kind, &reference.id));
        if !resolves {
            violations.push(Violation::DanglingReference {
                kind: reference.kind,
                id: reference.id,
                referrer: reference.referrer,
            });
        }
    }

    for (kind, id) in graph::ids(fragment) {
        if !graph::contains(graph, kind, id) {
            continue;
        }
        // The root may already be keyed under the placeholder id it replaces.
        if kind == IdKind::Transform && id == placeholder_id && root_id.as_deref() == Some(id) {
            continue;
        }
        if !graph::contains(shared, kind, id) {
            violations.push(Violation::IdCollision {
                kind,
                id: id.to_string(),
            });
        } else if !graph::same_entry(fragment, graph, kind, id) {
            violations.push(Violation::SharedComponentRedefined {
                kind,
                id: id.to_string(),
            });
        }
    }

    match root_id {
        Some(fragment_root_id) if violations.is_empty() => {
            Ok(ValidatedExpansion { fragment_root_id })
        }
        _ => {
            warn!(
                "Rejected expansion of {} with {} violations",
                placeholder_id,
                violations.len()
            );
            Err(ExpansionError::InvalidExpansionResponse { violations })
        }
    }
}

/// Validates, then builds the merged graph.
pub fn merge(
    caller: &Pipeline,
    placeholder_id: &str,
    request: &ExpansionRequest,
    response: ExpansionResponse,
) -> Result<MergedExpansion> {
    let validated = validate(caller, placeholder_id, request, &response)?;

    let original = caller.components.clone().unwrap_or_default();
    let placeholder = placeholder(&original, placeholder_id)?.clone();
    let fragment = response.components.unwrap_or_default();

    let mut relabeling = Relabeling::new();
    relabeling.insert(IdKind::Transform, validated.fragment_root_id.as_str(), placeholder_id);
    if let Some(root) = fragment.transforms.get(&validated.fragment_root_id) {
        for (tag, pc) in &root.outputs {
            if let Some(declared) = placeholder.outputs.get(tag) {
                relabeling.insert(IdKind::PCollection, pc.as_str(), declared.as_str());
            }
        }
    }
    let fragment = graph::relabel(fragment, &relabeling);

    let introduced: BTreeSet<(IdKind, String)> = graph::ids(&fragment)
        .filter(|(kind, id)| !graph::contains(&original, *kind, id))
        .map(|(kind, id)| (kind, id.to_string()))
        .collect();

    let mut merged = original;
    merged.transforms.remove(placeholder_id);
    for (id, mut transform) in fragment.transforms {
        if id == placeholder_id && !placeholder.unique_name.is_empty() {
            transform.unique_name = placeholder.unique_name.clone();
        }
        merged.transforms.insert(id, transform);
    }
    merged.pcollections.extend(fragment.pcollections);
    merged.windowing_strategies.extend(fragment.windowing_strategies);
    merged.coders.extend(fragment.coders);
    merged.environments.extend(fragment.environments);

    let requirements = graph::union_requirements(&caller.requirements, &response.requirements);
    let new_requirements: Vec<String> = graph::union_requirements(&[], &response.requirements)
        .into_iter()
        .filter(|urn| !caller.requirements.contains(urn))
        .collect();

    info!(
        "Merged expansion of {}: {} new ids, {} new requirements",
        placeholder_id,
        introduced.len(),
        new_requirements.len()
    );
    debug!("Root {} relabeled to {}", validated.fragment_root_id, placeholder_id);

    Ok(MergedExpansion {
        pipeline: Pipeline {
            components: Some(merged),
            root_transform_ids: caller.root_transform_ids.clone(),
            requirements,
        },
        root_id: placeholder_id.to_string(),
        introduced,
        new_requirements,
    })
}

fn placeholder<'a>(graph: &'a Components, placeholder_id: &str) -> Result<&'a PTransform> {
    graph
        .transforms
        .get(placeholder_id)
        .ok_or_else(|| ExpansionError::UnresolvedReference {
            kind: IdKind::Transform,
            id: placeholder_id.to_string(),
            referrer: "expansion placeholder".to_string(),
        })
}

/// Finds the single fragment transform structurally equal to the designated root.
fn locate_root(
    fragment: &Components,
    designated: Option<&PTransform>,
    violations: &mut Vec<Violation>,
) -> Option<String> {
    let Some(designated) = designated else {
        violations.push(Violation::MissingRoot);
        return None;
    };

    let candidates: Vec<&String> = fragment
        .transforms
        .iter()
        .filter(|(_, t)| same_shape(t, designated))
        .map(|(id, _)| id)
        .collect();

    match candidates.as_slice() {
        [] => {
            violations.push(Violation::RootNotInFragment);
            None
        }
        [only] => Some((*only).clone()),
        many => {
            violations.push(Violation::AmbiguousRoot {
                candidates: many.iter().map(|id| id.to_string()).collect(),
            });
            None
        }
    }
}

/// Structural equality; the display name is not part of a transform's identity.
fn same_shape(a: &PTransform, b: &PTransform) -> bool {
    a.spec == b.spec
        && a.inputs == b.inputs
        && a.outputs == b.outputs
        && a.subtransforms == b.subtransforms
        && a.environment_id == b.environment_id
}

fn check_root(
    root: &PTransform,
    requested_inputs: &BTreeMap<String, String>,
    placeholder: &PTransform,
    violations: &mut Vec<Violation>,
) {
    let tags: BTreeSet<&String> = requested_inputs.keys().chain(root.inputs.keys()).collect();
    for tag in tags {
        let expected = requested_inputs.get(tag);
        let actual = root.inputs.get(tag);
        if expected != actual {
            violations.push(Violation::RootInputsMismatch {
                tag: tag.clone(),
                expected: expected.cloned(),
                actual: actual.cloned(),
            });
        }
    }

    if !placeholder.outputs.is_empty() {
        let expected: Vec<String> = placeholder.outputs.keys().cloned().collect();
        let actual: Vec<String> = root.outputs.keys().cloned().collect();
        if expected != actual {
            violations.push(Violation::RootOutputsMismatch { expected, actual });
        }
    }
}
