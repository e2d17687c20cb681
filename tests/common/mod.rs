//! Shared fixtures: a caller graph and stub expansion handlers.
#![allow(dead_code)]

use xlang_expansion::graph;
use xlang_expansion::proto::{
    Coder, Components, Environment, ExpansionRequest, ExpansionResponse, FunctionSpec,
    PCollection, PTransform, Pipeline, WindowingStrategy,
};

pub const EXPANDER_URL: &str = "local:expander";
pub const ARTIFACTS_URL: &str = "local:artifacts";

fn spec(urn: &str, payload: &[u8]) -> Option<FunctionSpec> {
    Some(FunctionSpec {
        urn: urn.to_string(),
        payload: payload.to_vec(),
    })
}

/// `Read` produces `words` (coder `str`, windowing `global`, environment `py`).
/// The graph already declares requirement `R0`.
pub fn caller_graph() -> Pipeline {
    let mut c = Components::default();
    c.environments.insert(
        "py".into(),
        Environment {
            urn: "beam:env:docker:v1".into(),
            payload: b"python:3.11".to_vec(),
            ..Default::default()
        },
    );
    c.coders.insert(
        "str".into(),
        Coder {
            spec: spec("beam:coder:string_utf8:v1", b""),
            ..Default::default()
        },
    );
    c.coders.insert(
        "window".into(),
        Coder {
            spec: spec("beam:coder:global_window:v1", b""),
            ..Default::default()
        },
    );
    c.windowing_strategies.insert(
        "global".into(),
        WindowingStrategy {
            window_fn: spec("beam:window_fn:global_windows:v1", b""),
            window_coder_id: "window".into(),
            environment_id: "py".into(),
            ..Default::default()
        },
    );
    c.pcollections.insert(
        "words".into(),
        PCollection {
            unique_name: "Read.out".into(),
            coder_id: "str".into(),
            windowing_strategy_id: "global".into(),
            ..Default::default()
        },
    );
    let mut read = PTransform {
        unique_name: "Read".into(),
        spec: spec("beam:transform:read:v1", b"words.txt"),
        environment_id: "py".into(),
        ..Default::default()
    };
    read.outputs.insert("out".into(), "words".into());
    c.transforms.insert("Read".into(), read);

    Pipeline {
        components: Some(c),
        root_transform_ids: vec!["Read".into()],
        requirements: vec!["R0".into()],
    }
}

/// Adds a `Sink` consuming `pcollection`.
pub fn with_sink(mut pipeline: Pipeline, pcollection: &str) -> Pipeline {
    let mut sink = PTransform {
        unique_name: "Sink".into(),
        spec: spec("beam:transform:write:v1", b""),
        ..Default::default()
    };
    sink.inputs.insert("in".into(), pcollection.to_string());
    pipeline
        .components
        .get_or_insert_with(Default::default)
        .transforms
        .insert("Sink".into(), sink);
    pipeline.root_transform_ids.push("Sink".into());
    pipeline
}

/// Expands anything into a single leaf that emits `{1,2,3}` on output `out`,
/// declaring requirement `R1`.
pub fn numbers(request: &ExpansionRequest) -> anyhow::Result<ExpansionResponse> {
    let ns = &request.namespace;
    let requested = request.transform.clone().unwrap_or_default();
    let out = format!("{ns}numbers");
    let coder = format!("{ns}varint");

    let mut root = PTransform {
        unique_name: requested.unique_name.clone(),
        spec: spec("beam:transform:create:v1", b"1,2,3"),
        inputs: requested.inputs.clone(),
        ..Default::default()
    };
    root.outputs.insert("out".into(), out.clone());

    let mut components = Components::default();
    components.transforms.insert(format!("{ns}Create"), root.clone());
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
            spec: spec("beam:coder:varint:v1", b""),
            ..Default::default()
        },
    );

    Ok(ExpansionResponse {
        components: Some(components),
        transform: Some(root),
        requirements: vec!["R1".into()],
        error: String::new(),
    })
}

/// Like `numbers`, but also returns a transform reading a pcollection that is
/// neither in the fragment nor among the request's inputs.
pub fn dangling(request: &ExpansionRequest) -> anyhow::Result<ExpansionResponse> {
    let mut response = numbers(request)?;
    let mut stray = PTransform {
        unique_name: "Stray".into(),
        ..Default::default()
    };
    stray.inputs.insert("in".into(), "ghost".into());
    response
        .components
        .get_or_insert_with(Default::default)
        .transforms
        .insert(format!("{}Stray", request.namespace), stray);
    Ok(response)
}

/// True when every reference inside `pipeline` resolves.
pub fn is_closed(pipeline: &Pipeline) -> bool {
    let empty = Components::default();
    let components = pipeline.components.as_ref().unwrap_or(&empty);
    graph::references(components)
        .iter()
        .all(|r| graph::contains(components, r.kind, &r.id))
}
