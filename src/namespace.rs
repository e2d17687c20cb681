//! Namespace Allocation
//!
//! Every expansion call gets its own id prefix. Allocators are plain values the
//! caller owns and passes around; there is no process-wide counter.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::graph;
use crate::proto::Pipeline;

/// Terminates every prefix. Ordinary graph construction never mints ids containing it.
pub const NAMESPACE_SEPARATOR: char = '#';

const DEFAULT_SEED: &str = "external";

/// Source of single-use id prefixes.
///
/// Implementations must return a distinct prefix on every call, including
/// concurrent calls, regardless of the seed passed in.
pub trait NamespaceAllocator: Send + Sync {
    fn next(&self, seed: &str) -> String;
}

/// Deterministic allocator: `{seed}#{n}#` with a shared monotonically increasing `n`.
#[derive(Debug, Default)]
pub struct CountingNamespace {
    counter: AtomicU64,
}

impl CountingNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting after `start`, e.g. to continue a previous session.
    pub fn starting_after(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }
}

impl NamespaceAllocator for CountingNamespace {
    fn next(&self, seed: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format_prefix(seed, &n.to_string())
    }
}

/// Collision-resistant allocator keyed by a random v4 uuid per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNamespace;

impl NamespaceAllocator for RandomNamespace {
    fn next(&self, seed: &str) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        format_prefix(seed, &token)
    }
}

fn format_prefix(seed: &str, token: &str) -> String {
    let seed = if seed.is_empty() { DEFAULT_SEED } else { seed };
    format!("{seed}{sep}{token}{sep}", sep = NAMESPACE_SEPARATOR)
}

/// Draws prefixes until one is not a prefix of any id already in `graph`.
///
/// Rejected prefixes are simply wasted.
pub fn fresh_prefix(allocator: &dyn NamespaceAllocator, seed: &str, graph: &Pipeline) -> String {
    loop {
        let prefix = allocator.next(seed);
        let taken = graph
            .components
            .as_ref()
            .map(|c| graph::ids(c).any(|(_, id)| id.starts_with(&prefix)))
            .unwrap_or(false);
        if !taken {
            return prefix;
        }
        debug!("Namespace prefix {} already used by the caller graph, drawing another", prefix);
    }
}
