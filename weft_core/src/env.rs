use std::collections::{BTreeMap, HashMap, HashSet};

use crate::id::NodeId;
use crate::sync::{Corruption, CorruptionKind};

/// Delayed jobs that re-check existence conditions once their source
/// nodes hold values.
pub const DJOB_PRIO_EXISTENCE: u32 = 100;
/// Delayed jobs that run trigger-last generators.
pub const DJOB_PRIO_GENERATOR: u32 = 200;
/// Delayed jobs that refresh drawn-quantity bookkeeping once every
/// expansion has settled.
pub const DJOB_PRIO_BOOKKEEPING: u32 = 300;

#[derive(Debug, Clone)]
pub(crate) enum DelayedJob {
    /// Re-evaluate the existence condition of `template` and swap the
    /// `placeholder` sitting in `nonterm`'s expansion for real
    /// instances (or drop it).
    ResolveExistence {
        nonterm: NodeId,
        placeholder: NodeId,
        template: NodeId,
    },
    /// Recount instances per template for `nonterm` after placeholders
    /// were resolved.
    RefreshBookkeeping { nonterm: NodeId },
    /// Run a generator that asked to be expanded after its siblings.
    TriggerGenerator { node: NodeId },
}

/// Shared runtime state for one [`ModelGraph`](crate::graph::ModelGraph).
///
/// The environment carries everything that crosses node boundaries
/// during a freeze or an absorption: planned corruptions, the delayed
/// job queue, per-node drawn quantity/size records, the exhaustion
/// registry and freeze re-entrancy counters. It is forked together
/// with its graph, never shared between graphs.
#[derive(Debug, Clone, Default)]
pub struct Env {
    corrupt_table: HashMap<NodeId, Corruption>,
    djobs: BTreeMap<u32, Vec<DelayedJob>>,
    drawn_qty: HashMap<NodeId, u64>,
    drawn_size: HashMap<NodeId, u64>,
    exhausted: HashSet<NodeId>,
    freeze_depth: HashMap<NodeId, u32>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plans a corruption hook against `id`. One hook per node; a
    /// second registration replaces the first.
    pub fn add_corruption(&mut self, id: NodeId, hook: Corruption) {
        self.corrupt_table.insert(id, hook);
    }

    pub fn remove_corruption(&mut self, id: NodeId) -> Option<Corruption> {
        self.corrupt_table.remove(&id)
    }

    /// The hook planned for `id`, if it is of the requested kind.
    pub fn corruption(&self, id: NodeId, kind: CorruptionKind) -> Option<&Corruption> {
        self.corrupt_table
            .get(&id)
            .filter(|hook| hook.kind() == kind)
    }

    pub fn has_corruptions(&self) -> bool {
        !self.corrupt_table.is_empty()
    }

    pub(crate) fn enqueue_job(&mut self, priority: u32, job: DelayedJob) {
        self.djobs.entry(priority).or_default().push(job);
    }

    /// Pops the pending batch with the lowest priority value. Jobs
    /// within a batch keep their enqueue order.
    pub(crate) fn take_next_jobs(&mut self) -> Option<(u32, Vec<DelayedJob>)> {
        self.djobs.pop_first()
    }

    pub fn has_pending_jobs(&self) -> bool {
        !self.djobs.is_empty()
    }

    /// Records how many instances of `id` the last resolution produced
    /// and how many bytes they serialized to.
    pub fn set_drawn(&mut self, id: NodeId, qty: u64, size: u64) {
        self.drawn_qty.insert(id, qty);
        self.drawn_size.insert(id, size);
    }

    pub fn drawn_qty(&self, id: NodeId) -> Option<u64> {
        self.drawn_qty.get(&id).copied()
    }

    pub fn drawn_size(&self, id: NodeId) -> Option<u64> {
        self.drawn_size.get(&id).copied()
    }

    pub fn clear_drawn(&mut self, id: NodeId) {
        self.drawn_qty.remove(&id);
        self.drawn_size.remove(&id);
    }

    pub fn note_exhausted(&mut self, id: NodeId) {
        self.exhausted.insert(id);
    }

    pub fn clear_exhausted(&mut self, id: NodeId) {
        self.exhausted.remove(&id);
    }

    pub fn is_exhausted(&self, id: NodeId) -> bool {
        self.exhausted.contains(&id)
    }

    pub fn exhausted_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.exhausted.iter().copied()
    }

    /// Marks `id` as being frozen. Returns true when the node is
    /// already somewhere up the current freeze stack, which is the
    /// recursion-cut signal for self-referencing grammars.
    pub(crate) fn begin_freeze(&mut self, id: NodeId) -> bool {
        let depth = self.freeze_depth.entry(id).or_insert(0);
        let reentered = *depth > 0;
        *depth += 1;
        reentered
    }

    pub(crate) fn end_freeze(&mut self, id: NodeId) {
        if let Some(depth) = self.freeze_depth.get_mut(&id) {
            *depth -= 1;
            if *depth == 0 {
                self.freeze_depth.remove(&id);
            }
        }
    }

    /// Mirrors tracking entries onto cloned nodes so a clone that kept
    /// its frozen state also keeps its bookkeeping.
    pub(crate) fn copy_tracking(&mut self, map: &HashMap<NodeId, NodeId>) {
        for (old, new) in map {
            if let Some(qty) = self.drawn_qty.get(old).copied() {
                self.drawn_qty.insert(*new, qty);
            }
            if let Some(size) = self.drawn_size.get(old).copied() {
                self.drawn_size.insert(*new, size);
            }
            if self.exhausted.contains(old) {
                self.exhausted.insert(*new);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn jobs_drain_lowest_priority_first_in_fifo_order() {
        let mut env = Env::new();
        env.enqueue_job(
            DJOB_PRIO_GENERATOR,
            DelayedJob::TriggerGenerator { node: NodeId(9) },
        );
        env.enqueue_job(
            DJOB_PRIO_EXISTENCE,
            DelayedJob::ResolveExistence {
                nonterm: NodeId(1),
                placeholder: NodeId(2),
                template: NodeId(3),
            },
        );
        env.enqueue_job(
            DJOB_PRIO_EXISTENCE,
            DelayedJob::ResolveExistence {
                nonterm: NodeId(1),
                placeholder: NodeId(4),
                template: NodeId(5),
            },
        );

        let (priority, batch) = env.take_next_jobs().unwrap();
        assert_eq!(priority, DJOB_PRIO_EXISTENCE);
        assert_eq!(batch.len(), 2);
        match &batch[0] {
            DelayedJob::ResolveExistence { placeholder, .. } => {
                assert_eq!(*placeholder, NodeId(2), "first enqueued runs first")
            }
            other => panic!("unexpected job {:?}", other),
        }

        let (priority, _) = env.take_next_jobs().unwrap();
        assert_eq!(priority, DJOB_PRIO_GENERATOR);
        assert!(!env.has_pending_jobs());
    }

    #[test]
    fn freeze_reentrancy_is_detected_per_node() {
        let mut env = Env::new();
        assert!(!env.begin_freeze(NodeId(1)));
        assert!(env.begin_freeze(NodeId(1)), "second entry is re-entrant");
        assert!(!env.begin_freeze(NodeId(2)), "other nodes are unaffected");
        env.end_freeze(NodeId(1));
        env.end_freeze(NodeId(1));
        assert!(!env.begin_freeze(NodeId(1)), "fully unwound");
    }

    #[test]
    fn corruption_lookup_is_kind_filtered() {
        let mut env = Env::new();
        env.add_corruption(NodeId(3), Corruption::QtySync(Arc::new(|qty| qty * 2)));
        assert!(env.corruption(NodeId(3), CorruptionKind::QtySync).is_some());
        assert!(
            env.corruption(NodeId(3), CorruptionKind::SizeSync).is_none(),
            "hook of another kind must not be returned"
        );
        assert!(env.remove_corruption(NodeId(3)).is_some());
        assert!(!env.has_corruptions());
    }

    #[test]
    fn drawn_tracking_roundtrip_and_copy() {
        let mut env = Env::new();
        env.set_drawn(NodeId(1), 3, 12);
        env.note_exhausted(NodeId(1));

        let mut map = HashMap::new();
        map.insert(NodeId(1), NodeId(7));
        env.copy_tracking(&map);

        assert_eq!(env.drawn_qty(NodeId(7)), Some(3));
        assert_eq!(env.drawn_size(NodeId(7)), Some(12));
        assert!(env.is_exhausted(NodeId(7)));

        env.clear_drawn(NodeId(7));
        assert_eq!(env.drawn_qty(NodeId(7)), None);
    }
}
