//! Error taxonomy for expansion and artifact retrieval.
//!
//! Every variant is terminal for the expansion attempt that produced it:
//! nothing in this crate retries. The caller's graph is never modified when
//! one of these is returned.

use std::fmt;

use thiserror::Error;

use crate::graph::IdKind;

pub type Result<T, E = ExpansionError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ExpansionError {
    /// The request could not be built: the caller graph lacks something it references.
    #[error("unresolved reference: {kind} '{id}' (referenced by {referrer})")]
    UnresolvedReference {
        kind: IdKind,
        id: String,
        referrer: String,
    },

    /// Connection, timeout or stream failure on either RPC.
    #[error("transport error talking to '{endpoint}': {detail}")]
    Transport { endpoint: String, detail: String },

    /// The expansion service said it could not expand the transform.
    #[error("remote expansion failed: {message}")]
    RemoteExpansion { message: String },

    /// The response breaks a structural invariant; nothing was merged.
    #[error("invalid expansion response: {}", render_violations(.violations))]
    InvalidExpansionResponse { violations: Vec<Violation> },

    /// The artifact service does not know the requested artifact.
    #[error("artifact not found: {artifact}")]
    ArtifactNotFound { artifact: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Names the external transform whose expansion failed.
    #[error("expansion of external transform '{transform}' failed: {source}")]
    Expansion {
        transform: String,
        #[source]
        source: Box<ExpansionError>,
    },
}

impl ExpansionError {
    pub fn transport(endpoint: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn in_transform(self, transform: impl Into<String>) -> Self {
        Self::Expansion {
            transform: transform.into(),
            source: Box::new(self),
        }
    }

    /// The underlying failure, with every `Expansion` wrapper removed.
    pub fn root_cause(&self) -> &ExpansionError {
        match self {
            Self::Expansion { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Violations carried by an `InvalidExpansionResponse`, if that is the root cause.
    pub fn violations(&self) -> &[Violation] {
        match self.root_cause() {
            Self::InvalidExpansionResponse { violations } => violations,
            _ => &[],
        }
    }
}

/// One way an expansion response can be structurally wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The response does not designate a root transform at all.
    MissingRoot,
    /// No transform in the fragment matches the designated root.
    RootNotInFragment,
    /// Several fragment transforms match the designated root.
    AmbiguousRoot { candidates: Vec<String> },
    RootInputsMismatch { tag: String, expected: Option<String>, actual: Option<String> },
    RootOutputsMismatch { expected: Vec<String>, actual: Vec<String> },
    /// A returned transform writes to one of the caller's own input pcollections.
    OutputAliasesInput { transform: String, tag: String, pcollection: String },
    DanglingReference { kind: IdKind, id: String, referrer: String },
    IdCollision { kind: IdKind, id: String },
    /// A caller-supplied component came back with different content.
    SharedComponentRedefined { kind: IdKind, id: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingRoot => write!(f, "response does not designate a root transform"),
            Violation::RootNotInFragment => {
                write!(f, "designated root transform is not among the returned transforms")
            }
            Violation::AmbiguousRoot { candidates } => {
                write!(f, "designated root matches several transforms: {}", candidates.join(", "))
            }
            Violation::RootInputsMismatch { tag, expected, actual } => write!(
                f,
                "root input '{}' is {:?}, expected {:?}",
                tag, actual, expected
            ),
            Violation::RootOutputsMismatch { expected, actual } => write!(
                f,
                "root output tags [{}] do not match expected [{}]",
                actual.join(", "),
                expected.join(", ")
            ),
            Violation::OutputAliasesInput { transform, tag, pcollection } => write!(
                f,
                "output '{}' of transform '{}' reuses caller input pcollection '{}'",
                tag, transform, pcollection
            ),
            Violation::DanglingReference { kind, id, referrer } => {
                write!(f, "{} '{}' referenced by {} does not resolve", kind, id, referrer)
            }
            Violation::IdCollision { kind, id } => {
                write!(f, "{} '{}' already exists in the caller graph", kind, id)
            }
            Violation::SharedComponentRedefined { kind, id } => {
                write!(f, "caller-supplied {} '{}' was returned with different content", kind, id)
            }
        }
    }
}

fn render_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_nested_context() {
        let err = ExpansionError::RemoteExpansion {
            message: "no such urn".to_string(),
        }
        .in_transform("inner")
        .in_transform("outer");

        assert!(matches!(err.root_cause(), ExpansionError::RemoteExpansion { .. }));
        let rendered = err.to_string();
        assert!(rendered.contains("outer"));
        assert!(rendered.contains("no such urn"));
    }

    #[test]
    fn test_violations_are_listed_in_message() {
        let err = ExpansionError::InvalidExpansionResponse {
            violations: vec![
                Violation::MissingRoot,
                Violation::IdCollision {
                    kind: IdKind::PCollection,
                    id: "pc".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("does not designate a root"));
        assert!(msg.contains("pcollection 'pc' already exists"));
        assert_eq!(err.violations().len(), 2);
    }
}
