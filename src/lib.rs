//! Cross-Environment Transform Expansion
//!
//! Lets a pipeline under construction include transforms implemented by a
//! remote expansion service:
//! - Placeholder nodes for external transforms
//! - Namespaced expansion requests carrying the inputs' closure
//! - Validate-then-merge of the returned subgraph
//! - Artifact resolution and chunked retrieval for the expanded environments

pub mod artifact;
pub mod client;
pub mod config;
pub mod error;
pub mod expansion;
pub mod external;
pub mod graph;
pub mod merge;
pub mod namespace;
pub mod proto;
pub mod request;
pub mod server;
pub mod telemetry;

// Re-exports for convenience
pub use client::{ClientFactory, GrpcClientFactory, LocalClientFactory};
pub use config::ExpansionConfig;
pub use error::{ExpansionError, Result, Violation};
pub use expansion::{finalize, ExpansionCall, SharedPipeline};
pub use external::{ExternalTransform, PendingExternal};
pub use namespace::{CountingNamespace, NamespaceAllocator, RandomNamespace};
