//! Generated wire types
//!
//! `pipeline.v1` is the graph exchanged with expansion services, `expansion.v1`
//! and `artifact.v1` are the two RPC surfaces. Every protobuf map is generated
//! as a `BTreeMap`.

pub mod pipeline {
    pub mod v1 {
        tonic::include_proto!("pipeline.v1");
    }
}

pub mod expansion {
    pub mod v1 {
        tonic::include_proto!("expansion.v1");
    }
}

pub mod artifact {
    pub mod v1 {
        tonic::include_proto!("artifact.v1");
    }
}

pub use artifact::v1::{
    GetArtifactRequest, GetArtifactResponse, ResolveArtifactsRequest, ResolveArtifactsResponse,
};
pub use expansion::v1::{ExpansionRequest, ExpansionResponse};
pub use pipeline::v1::{
    ApiServiceDescriptor, ArtifactFilePayload, ArtifactInformation, ArtifactUrlPayload,
    Boundedness, Coder, Components, Environment, FunctionSpec, PCollection, PTransform, Pipeline,
    WindowingStrategy,
};
