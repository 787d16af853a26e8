use thiserror::Error;

use crate::id::NodeId;
use crate::sync::SyncScope;

/// Errors raised while a data model is being defined or queried.
///
/// These cover the definitional phase only. Once a model is built, runtime
/// walks (freeze, absorb, traversal) treat inconsistencies as programming
/// errors and panic instead, so a fuzzing campaign never silently continues
/// on a corrupted graph.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Two subnodes of the same parent and configuration share a name.
    #[error("duplicate sibling name '{name}' under '{parent}'")]
    DuplicateSiblingName { parent: String, name: String },

    /// The same subnode was declared twice with different quantity intervals.
    #[error("conflicting quantity for '{name}': ({a_min},{a_max:?}) vs ({b_min},{b_max:?})")]
    ConflictingQuantity {
        name: String,
        a_min: u64,
        a_max: Option<u64>,
        b_min: u64,
        b_max: Option<u64>,
    },

    /// A quantity interval with `min > max`.
    #[error("invalid quantity interval: min {min} > max {max}")]
    InvalidQuantity { min: u64, max: u64 },

    /// A shape without sections, or a grammar without shapes.
    #[error("empty grammar for '{name}': {reason}")]
    EmptyGrammar { name: String, reason: String },

    /// A node handle that does not belong to this graph.
    #[error("node not found: NodeId({id})", id = id.0)]
    NodeNotFound { id: NodeId },

    /// The requested configuration was never set on the node.
    #[error("configuration '{config}' not set on node '{name}'")]
    ConfigNotSet { name: String, config: String },

    /// A sync relation attached under a scope it cannot serve.
    #[error("sync relation not usable for scope {scope:?}")]
    UnsupportedSyncRelation { scope: SyncScope },

    /// An operation that only makes sense for another internals kind.
    #[error("node '{name}' is {found}, operation needs {expected}")]
    KindMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },

    /// A value codec refused the value handed to it.
    #[error("codec rejected value: {reason}")]
    ValueRejected { reason: String },
}
