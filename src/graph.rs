//! Graph Reference Model
//!
//! Treats a `Components` set as a graph of typed ids. Everything the validator
//! and the request builder need to know about "who points at whom" lives here.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::proto::Components;

/// The mapping of `Components` an id lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdKind {
    Transform,
    PCollection,
    WindowingStrategy,
    Coder,
    Environment,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdKind::Transform => "transform",
            IdKind::PCollection => "pcollection",
            IdKind::WindowingStrategy => "windowing strategy",
            IdKind::Coder => "coder",
            IdKind::Environment => "environment",
        };
        f.write_str(name)
    }
}

/// An edge from some component to the id it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub kind: IdKind,
    pub id: String,
    /// Human readable description of the referring component and field.
    pub referrer: String,
}

impl Reference {
    fn new(kind: IdKind, id: &str, referrer: String) -> Self {
        Self {
            kind,
            id: id.to_string(),
            referrer,
        }
    }
}

/// Every reference made from inside `components`. Empty ids mean "unset" and are skipped.
pub fn references(components: &Components) -> Vec<Reference> {
    let mut refs = Vec::new();

    for (tid, transform) in &components.transforms {
        for sub in &transform.subtransforms {
            refs.push(Reference::new(
                IdKind::Transform,
                sub,
                format!("transform '{}' subtransforms", tid),
            ));
        }
        for (tag, pc) in &transform.inputs {
            refs.push(Reference::new(
                IdKind::PCollection,
                pc,
                format!("transform '{}' input '{}'", tid, tag),
            ));
        }
        for (tag, pc) in &transform.outputs {
            refs.push(Reference::new(
                IdKind::PCollection,
                pc,
                format!("transform '{}' output '{}'", tid, tag),
            ));
        }
        if !transform.environment_id.is_empty() {
            refs.push(Reference::new(
                IdKind::Environment,
                &transform.environment_id,
                format!("transform '{}' environment", tid),
            ));
        }
    }

    for (pid, pcollection) in &components.pcollections {
        if !pcollection.coder_id.is_empty() {
            refs.push(Reference::new(
                IdKind::Coder,
                &pcollection.coder_id,
                format!("pcollection '{}' coder", pid),
            ));
        }
        if !pcollection.windowing_strategy_id.is_empty() {
            refs.push(Reference::new(
                IdKind::WindowingStrategy,
                &pcollection.windowing_strategy_id,
                format!("pcollection '{}' windowing strategy", pid),
            ));
        }
    }

    for (wid, strategy) in &components.windowing_strategies {
        if !strategy.window_coder_id.is_empty() {
            refs.push(Reference::new(
                IdKind::Coder,
                &strategy.window_coder_id,
                format!("windowing strategy '{}' window coder", wid),
            ));
        }
        if !strategy.environment_id.is_empty() {
            refs.push(Reference::new(
                IdKind::Environment,
                &strategy.environment_id,
                format!("windowing strategy '{}' environment", wid),
            ));
        }
    }

    for (cid, coder) in &components.coders {
        for component in &coder.component_coder_ids {
            refs.push(Reference::new(
                IdKind::Coder,
                component,
                format!("coder '{}' components", cid),
            ));
        }
    }

    refs
}

pub fn contains(components: &Components, kind: IdKind, id: &str) -> bool {
    match kind {
        IdKind::Transform => components.transforms.contains_key(id),
        IdKind::PCollection => components.pcollections.contains_key(id),
        IdKind::WindowingStrategy => components.windowing_strategies.contains_key(id),
        IdKind::Coder => components.coders.contains_key(id),
        IdKind::Environment => components.environments.contains_key(id),
    }
}

/// Every id defined by `components`, tagged with its kind.
pub fn ids(components: &Components) -> impl Iterator<Item = (IdKind, &str)> + '_ {
    let transforms = components.transforms.keys().map(|k| (IdKind::Transform, k.as_str()));
    let pcollections = components.pcollections.keys().map(|k| (IdKind::PCollection, k.as_str()));
    let strategies = components
        .windowing_strategies
        .keys()
        .map(|k| (IdKind::WindowingStrategy, k.as_str()));
    let coders = components.coders.keys().map(|k| (IdKind::Coder, k.as_str()));
    let environments = components.environments.keys().map(|k| (IdKind::Environment, k.as_str()));

    transforms
        .chain(pcollections)
        .chain(strategies)
        .chain(coders)
        .chain(environments)
}

/// Whether `kind`/`id` is defined identically in both component sets.
pub fn same_entry(a: &Components, b: &Components, kind: IdKind, id: &str) -> bool {
    match kind {
        IdKind::Transform => a.transforms.get(id) == b.transforms.get(id),
        IdKind::PCollection => a.pcollections.get(id) == b.pcollections.get(id),
        IdKind::WindowingStrategy => {
            a.windowing_strategies.get(id) == b.windowing_strategies.get(id)
        }
        IdKind::Coder => a.coders.get(id) == b.coders.get(id),
        IdKind::Environment => a.environments.get(id) == b.environments.get(id),
    }
}

/// A consistent renaming of ids, per kind.
#[derive(Debug, Clone, Default)]
pub struct Relabeling {
    renames: BTreeMap<(IdKind, String), String>,
}

impl Relabeling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: IdKind, from: impl Into<String>, to: impl Into<String>) {
        let from = from.into();
        let to = to.into();
        if from != to {
            self.renames.insert((kind, from), to);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }

    /// The new name of `id`, or `id` itself when it is not renamed.
    pub fn apply(&self, kind: IdKind, id: &str) -> String {
        self.renames
            .get(&(kind, id.to_string()))
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    fn apply_opt(&self, kind: IdKind, id: &str) -> String {
        if id.is_empty() {
            String::new()
        } else {
            self.apply(kind, id)
        }
    }
}

/// Renames keys and every reference in `components`.
pub fn relabel(components: Components, relabeling: &Relabeling) -> Components {
    if relabeling.is_empty() {
        return components;
    }

    let mut out = Components::default();

    for (id, mut transform) in components.transforms {
        transform.subtransforms = transform
            .subtransforms
            .iter()
            .map(|s| relabeling.apply(IdKind::Transform, s))
            .collect();
        for pc in transform.inputs.values_mut().chain(transform.outputs.values_mut()) {
            *pc = relabeling.apply(IdKind::PCollection, pc);
        }
        transform.environment_id = relabeling.apply_opt(IdKind::Environment, &transform.environment_id);
        out.transforms.insert(relabeling.apply(IdKind::Transform, &id), transform);
    }

    for (id, mut pcollection) in components.pcollections {
        pcollection.coder_id = relabeling.apply_opt(IdKind::Coder, &pcollection.coder_id);
        pcollection.windowing_strategy_id = relabeling
            .apply_opt(IdKind::WindowingStrategy, &pcollection.windowing_strategy_id);
        out.pcollections.insert(relabeling.apply(IdKind::PCollection, &id), pcollection);
    }

    for (id, mut strategy) in components.windowing_strategies {
        strategy.window_coder_id = relabeling.apply_opt(IdKind::Coder, &strategy.window_coder_id);
        strategy.environment_id = relabeling.apply_opt(IdKind::Environment, &strategy.environment_id);
        out.windowing_strategies
            .insert(relabeling.apply(IdKind::WindowingStrategy, &id), strategy);
    }

    for (id, mut coder) in components.coders {
        coder.component_coder_ids = coder
            .component_coder_ids
            .iter()
            .map(|c| relabeling.apply(IdKind::Coder, c))
            .collect();
        out.coders.insert(relabeling.apply(IdKind::Coder, &id), coder);
    }

    for (id, environment) in components.environments {
        out.environments.insert(relabeling.apply(IdKind::Environment, &id), environment);
    }

    out
}

/// Order-stable union: everything in `existing`, then unseen entries of `incoming`.
pub fn union_requirements(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    existing
        .iter()
        .chain(incoming)
        .filter(|urn| seen.insert(urn.as_str()))
        .cloned()
        .collect()
}
