use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable handle to a node in a [`ModelGraph`](crate::graph::ModelGraph) arena.
///
/// Handles are plain indices into an append-only arena, so they stay valid
/// for the lifetime of the graph and survive `fork()` unchanged. A `NodeId`
/// from one graph must never be used with another graph that is not a fork
/// of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Handle to an entanglement group inside a [`ModelGraph`](crate::graph::ModelGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(idx: usize) -> Self {
        NodeId(idx as u32)
    }
}

impl GroupId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(idx: usize) -> Self {
        GroupId(idx as u32)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_index_roundtrip() {
        let id = NodeId::from_index(42);
        assert_eq!(id.0, 42);
        assert_eq!(id.index(), 42);
    }

    #[test]
    fn display_prints_bare_value() {
        assert_eq!(NodeId(7).to_string(), "7");
        assert_eq!(GroupId(3).to_string(), "3");
    }
}
