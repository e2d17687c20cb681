//! Expansion Request Builder
//!
//! Packs an unexpanded transform together with the slice of the caller graph
//! the expansion service needs to interpret its inputs.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{ExpansionError, Result};
use crate::graph::IdKind;
use crate::proto::{Components, ExpansionRequest, FunctionSpec, PTransform, Pipeline};

/// Builds a self-contained `ExpansionRequest`.
///
/// `declared_inputs` maps input tags to pcollection ids of `caller`. Each input
/// is shipped with its descriptor plus the transitive closure of coders,
/// windowing strategies and environments it depends on.
pub fn build_request(
    unique_name: &str,
    spec: &FunctionSpec,
    declared_inputs: &BTreeMap<String, String>,
    caller: &Pipeline,
    known_requirements: &[String],
    prefix: &str,
) -> Result<ExpansionRequest> {
    let empty = Components::default();
    let graph = caller.components.as_ref().unwrap_or(&empty);

    let mut closure = Closure::new(graph);
    for (tag, pc) in declared_inputs {
        closure.pcollection(pc, &format!("input '{}' of '{}'", tag, unique_name))?;
    }
    let components = closure.finish();

    debug!(
        "Built expansion request for {}: {} inputs, {} coders, {} windowing strategies, {} environments",
        unique_name,
        components.pcollections.len(),
        components.coders.len(),
        components.windowing_strategies.len(),
        components.environments.len()
    );

    Ok(ExpansionRequest {
        components: Some(components),
        transform: Some(PTransform {
            unique_name: unique_name.to_string(),
            spec: Some(spec.clone()),
            inputs: declared_inputs.clone(),
            ..Default::default()
        }),
        namespace: prefix.to_string(),
        requirements: known_requirements.to_vec(),
    })
}

/// Collects components reachable from a set of pcollections.
struct Closure<'a> {
    graph: &'a Components,
    out: Components,
    visited: BTreeSet<(IdKind, String)>,
}

impl<'a> Closure<'a> {
    fn new(graph: &'a Components) -> Self {
        Self {
            graph,
            out: Components::default(),
            visited: BTreeSet::new(),
        }
    }

    fn first_visit(&mut self, kind: IdKind, id: &str) -> bool {
        self.visited.insert((kind, id.to_string()))
    }

    fn pcollection(&mut self, id: &str, referrer: &str) -> Result<()> {
        if !self.first_visit(IdKind::PCollection, id) {
            return Ok(());
        }
        let pc = self
            .graph
            .pcollections
            .get(id)
            .ok_or_else(|| unresolved(IdKind::PCollection, id, referrer))?;
        let owner = format!("pcollection '{}'", id);
        if !pc.coder_id.is_empty() {
            self.coder(&pc.coder_id, &owner)?;
        }
        if !pc.windowing_strategy_id.is_empty() {
            self.windowing_strategy(&pc.windowing_strategy_id, &owner)?;
        }
        self.out.pcollections.insert(id.to_string(), pc.clone());
        Ok(())
    }

    fn coder(&mut self, id: &str, referrer: &str) -> Result<()> {
        if !self.first_visit(IdKind::Coder, id) {
            return Ok(());
        }
        let coder = self
            .graph
            .coders
            .get(id)
            .ok_or_else(|| unresolved(IdKind::Coder, id, referrer))?;
        let owner = format!("coder '{}'", id);
        for component in &coder.component_coder_ids {
            self.coder(component, &owner)?;
        }
        self.out.coders.insert(id.to_string(), coder.clone());
        Ok(())
    }

    fn windowing_strategy(&mut self, id: &str, referrer: &str) -> Result<()> {
        if !self.first_visit(IdKind::WindowingStrategy, id) {
            return Ok(());
        }
        let strategy = self
            .graph
            .windowing_strategies
            .get(id)
            .ok_or_else(|| unresolved(IdKind::WindowingStrategy, id, referrer))?;
        let owner = format!("windowing strategy '{}'", id);
        if !strategy.window_coder_id.is_empty() {
            self.coder(&strategy.window_coder_id, &owner)?;
        }
        if !strategy.environment_id.is_empty() {
            self.environment(&strategy.environment_id, &owner)?;
        }
        self.out
            .windowing_strategies
            .insert(id.to_string(), strategy.clone());
        Ok(())
    }

    fn environment(&mut self, id: &str, referrer: &str) -> Result<()> {
        if !self.first_visit(IdKind::Environment, id) {
            return Ok(());
        }
        let environment = self
            .graph
            .environments
            .get(id)
            .ok_or_else(|| unresolved(IdKind::Environment, id, referrer))?;
        self.out.environments.insert(id.to_string(), environment.clone());
        Ok(())
    }

    fn finish(self) -> Components {
        self.out
    }
}

fn unresolved(kind: IdKind, id: &str, referrer: &str) -> ExpansionError {
    ExpansionError::UnresolvedReference {
        kind,
        id: id.to_string(),
        referrer: referrer.to_string(),
    }
}
