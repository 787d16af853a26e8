use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};

use rand_core::RngCore;
use serde_json::json;

use crate::config::EngineConfig;
use crate::env::{DJOB_PRIO_GENERATOR, DelayedJob, Env};
use crate::error::ModelError;
use crate::id::{GroupId, NodeId};
use crate::node::{
    Attribute, CustoFlag, FuncFn, GenFn, InternalsKind, InternalsVariant, Node, NodeInternals,
};
use crate::nonterm::{NonTermPayload, PlacedChild, Separator, Shape};
use crate::sync::{SyncRelation, SyncScope};
use crate::value::{AbsorbConstraints, AbsorbOutcome, AbsorbStatus};

/// Options for [`ModelGraph::clone_node`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CloneOptions {
    /// Discard frozen values and expansion state; the clone starts as
    /// a pristine template.
    pub ignore_frozen_state: bool,
    /// When part of the cloned subtree is entangled with nodes outside
    /// it, let the clones join the original group instead of dropping
    /// the relationship.
    pub accept_external_entanglement: bool,
}

/// Options for [`ModelGraph::unfreeze`].
#[derive(Debug, Clone, Copy)]
pub struct UnfreezeOptions {
    /// Walk into children instead of only clearing this node's value.
    pub recursive: bool,
    /// Keep chosen shapes and instance counts; only values advance.
    pub dont_change_state: bool,
    /// Keep chosen shapes and leaf values, but re-run existence and
    /// quantity synchronization on the next freeze.
    pub reevaluate_constraints: bool,
    /// Do not propagate the unfreeze to entangled nodes.
    pub ignore_entanglement: bool,
}

impl Default for UnfreezeOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            dont_change_state: false,
            reevaluate_constraints: false,
            ignore_entanglement: false,
        }
    }
}

/// Owning arena for one data model: every node lives here, handles are
/// indices, and the whole graph (nodes, environment, entanglement
/// groups) forks as one unit.
///
/// The arena is append-only. Nodes abandoned by a rolled-back
/// absorption or a regenerated generator stay allocated but
/// unreferenced; models are rebuilt from their description for
/// long-running campaigns, so the slack is bounded and harmless.
#[derive(Debug, Clone)]
pub struct ModelGraph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) env: Env,
    pub(crate) groups: Vec<Option<HashSet<NodeId>>>,
    pub(crate) config: EngineConfig,
    pub(crate) in_djob_phase: bool,
    freeze_nesting: u32,
}

impl Default for ModelGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            nodes: Vec::new(),
            env: Env::new(),
            groups: Vec::new(),
            config,
            in_djob_phase: false,
            freeze_nesting: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Env {
        &mut self.env
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Deep-copies the graph, environment included. Handles taken from
    /// the original address the corresponding nodes in the fork.
    pub fn fork(&self) -> ModelGraph {
        self.clone()
    }

    // ------------------------------------------------------------------
    // Node management
    // ------------------------------------------------------------------

    fn push_node(&mut self, node: Node) -> NodeId {
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Declares a node without contents. Internals stay unset until
    /// one of the `set_internals`/`add_*` calls fills them in.
    pub fn add_node(&mut self, name: impl Into<String>) -> NodeId {
        self.push_node(Node::new(name))
    }

    pub fn add_empty(&mut self, name: impl Into<String>) -> NodeId {
        let id = self.add_node(name);
        self.node_mut(id).set_internals(crate::node::DEFAULT_CONFIG, NodeInternals::empty());
        id
    }

    pub fn add_typed(
        &mut self,
        name: impl Into<String>,
        codec: Box<dyn crate::value::ValueCodec>,
    ) -> NodeId {
        let id = self.add_node(name);
        self.node_mut(id).set_internals(crate::node::DEFAULT_CONFIG, NodeInternals::typed(codec));
        id
    }

    pub fn add_func(&mut self, name: impl Into<String>, func: FuncFn, args: Vec<NodeId>) -> NodeId {
        let id = self.add_node(name);
        self.node_mut(id)
            .set_internals(crate::node::DEFAULT_CONFIG, NodeInternals::func(func, args));
        id
    }

    pub fn add_genfunc(
        &mut self,
        name: impl Into<String>,
        generator: GenFn,
        args: Vec<NodeId>,
    ) -> NodeId {
        let id = self.add_node(name);
        self.node_mut(id)
            .set_internals(crate::node::DEFAULT_CONFIG, NodeInternals::genfunc(generator, args));
        id
    }

    /// Builds a non-terminal from its shape grammar. Construction-time
    /// inconsistencies (duplicate sibling names, conflicting quantity
    /// re-declarations, empty grammars) are rejected here, never at
    /// freeze time.
    pub fn add_nonterm(
        &mut self,
        name: impl Into<String>,
        shapes: Vec<Shape>,
    ) -> Result<NodeId, ModelError> {
        let name = name.into();
        self.validate_shapes(&name, &shapes)?;
        let id = self.add_node(name);
        self.node_mut(id).set_internals(
            crate::node::DEFAULT_CONFIG,
            NodeInternals::nonterm(NonTermPayload::new(shapes, None)),
        );
        Ok(id)
    }

    pub fn add_nonterm_with_separator(
        &mut self,
        name: impl Into<String>,
        shapes: Vec<Shape>,
        separator: Separator,
    ) -> Result<NodeId, ModelError> {
        let name = name.into();
        self.validate_shapes(&name, &shapes)?;
        // Separator nodes are found through their attribute.
        if let Some(internals) = self.node_mut(separator.node).internals_mut() {
            internals.set_attr(Attribute::Separator);
        }
        let id = self.add_node(name);
        self.node_mut(id).set_internals(
            crate::node::DEFAULT_CONFIG,
            NodeInternals::nonterm(NonTermPayload::new(shapes, Some(separator))),
        );
        Ok(id)
    }

    /// Immutable access to a node. Panics when the handle does not
    /// belong to this graph, which always indicates mixed-up graphs.
    pub fn node(&self, id: NodeId) -> &Node {
        match self.nodes.get(id.index()) {
            Some(node) => node,
            None => panic!("NodeId({id}) does not belong to this graph"),
        }
    }

    pub fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id.index()) {
            Some(node) => node,
            None => panic!("NodeId({id}) does not belong to this graph"),
        }
    }

    /// Sets (or replaces) the internals of one configuration. Like
    /// attribute changes, the new contents are mirrored onto the whole
    /// entanglement group (each member gets its own copy) unless told
    /// otherwise.
    pub fn set_internals(
        &mut self,
        id: NodeId,
        config: &str,
        internals: NodeInternals,
        ignore_entanglement: bool,
    ) {
        let members = if ignore_entanglement {
            vec![id]
        } else {
            self.group_members(id)
        };
        for member in members {
            self.node_mut(member).set_internals(config, internals.clone());
        }
    }

    pub fn rename(&mut self, id: NodeId, name: impl Into<String>) {
        self.node_mut(id).name = name.into();
    }

    pub fn set_semantics<I, S>(&mut self, id: NodeId, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_mut(id).semantics = tags.into_iter().map(Into::into).collect();
    }

    pub fn set_fuzz_weight(&mut self, id: NodeId, weight: u8) {
        self.node_mut(id).fuzz_weight = weight;
    }

    pub(crate) fn stamp_depth(&mut self, id: NodeId, depth: u32) {
        self.node_mut(id).depth = Some(depth);
    }

    /// Registers a sync relation on the node's active configuration.
    pub fn register_sync(
        &mut self,
        id: NodeId,
        scope: SyncScope,
        relation: SyncRelation,
    ) -> Result<(), ModelError> {
        let name = self.node(id).name().to_string();
        match self.node_mut(id).internals_mut() {
            Some(internals) => internals.set_sync(scope, relation),
            None => Err(ModelError::ConfigNotSet {
                name,
                config: crate::node::DEFAULT_CONFIG.to_string(),
            }),
        }
    }

    /// Forces a concrete value onto a typed leaf. The value becomes
    /// both the codec's current value and the frozen cache, so the
    /// next freeze returns it unchanged.
    pub fn set_value(&mut self, id: NodeId, value: &[u8]) -> Result<(), ModelError> {
        let name = self.node(id).name().to_string();
        let node = self.node_mut(id);
        let Some(internals) = node.internals_mut() else {
            return Err(ModelError::KindMismatch {
                name,
                expected: "typed value",
                found: "undefined",
            });
        };
        match internals.codec_mut() {
            Some(codec) => {
                codec.set_value(value)?;
                internals.set_frozen(value.to_vec());
                Ok(())
            }
            None => Err(ModelError::KindMismatch {
                name,
                expected: "typed value",
                found: internals.kind().label(),
            }),
        }
    }

    /// Frozen value accessor; `None` until the node has been frozen
    /// (or absorbed into).
    pub fn value(&self, id: NodeId) -> Option<&[u8]> {
        self.node(id).internals().and_then(NodeInternals::frozen)
    }

    // ------------------------------------------------------------------
    // Entanglement
    // ------------------------------------------------------------------

    fn make_group(&mut self, ids: Vec<NodeId>) -> GroupId {
        let group = GroupId::from_index(self.groups.len());
        self.groups.push(Some(ids.iter().copied().collect()));
        for id in ids {
            self.node_mut(id).group = Some(group);
        }
        group
    }

    fn attach_to_group(&mut self, id: NodeId, group: GroupId) {
        if let Some(Some(members)) = self.groups.get_mut(group.index()) {
            members.insert(id);
        }
        self.node_mut(id).group = Some(group);
    }

    /// Entangles two nodes. Groups are merged when both nodes already
    /// belong to one, so entanglement stays symmetric and transitive.
    pub fn entangle(&mut self, a: NodeId, b: NodeId) {
        if a == b {
            return;
        }
        match (self.node(a).group, self.node(b).group) {
            (None, None) => {
                self.make_group(vec![a, b]);
            }
            (Some(group), None) => self.attach_to_group(b, group),
            (None, Some(group)) => self.attach_to_group(a, group),
            (Some(ga), Some(gb)) if ga != gb => {
                let moved: Vec<NodeId> = match self.groups[gb.index()].take() {
                    Some(members) => members.into_iter().collect(),
                    None => Vec::new(),
                };
                for id in moved {
                    self.attach_to_group(id, ga);
                }
            }
            _ => {}
        }
    }

    /// Removes `id` from its group. A group left with a single member
    /// is dissolved.
    pub fn disentangle(&mut self, id: NodeId) {
        let Some(group) = self.node(id).group else {
            return;
        };
        self.node_mut(id).group = None;
        let last = match self.groups.get_mut(group.index()) {
            Some(Some(members)) => {
                members.remove(&id);
                if members.len() == 1 {
                    members.iter().next().copied()
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some(last) = last {
            self.node_mut(last).group = None;
            self.groups[group.index()] = None;
        }
    }

    /// The full entanglement group of `id`, itself included, in handle
    /// order.
    pub fn entangled_with(&self, id: NodeId) -> Vec<NodeId> {
        self.group_members(id)
    }

    pub(crate) fn group_members(&self, id: NodeId) -> Vec<NodeId> {
        match self.node(id).group {
            Some(group) => match &self.groups[group.index()] {
                Some(members) => {
                    let mut members: Vec<NodeId> = members.iter().copied().collect();
                    members.sort_unstable();
                    members
                }
                None => vec![id],
            },
            None => vec![id],
        }
    }

    // ------------------------------------------------------------------
    // Entanglement-propagating state changes
    // ------------------------------------------------------------------

    /// Sets an attribute, propagating to the whole entanglement group
    /// unless told otherwise.
    pub fn set_attr(&mut self, id: NodeId, attr: Attribute, ignore_entanglement: bool) {
        let members = if ignore_entanglement {
            vec![id]
        } else {
            self.group_members(id)
        };
        for member in members {
            if let Some(internals) = self.node_mut(member).internals_mut() {
                internals.set_attr(attr);
            }
        }
    }

    pub fn clear_attr(&mut self, id: NodeId, attr: Attribute, ignore_entanglement: bool) {
        let members = if ignore_entanglement {
            vec![id]
        } else {
            self.group_members(id)
        };
        for member in members {
            if let Some(internals) = self.node_mut(member).internals_mut() {
                internals.clear_attr(attr);
            }
        }
    }

    /// Toggles a customization flag on the active configuration.
    /// Customization is per-node and never propagates through
    /// entanglement groups.
    pub fn set_custo_flag(&mut self, id: NodeId, flag: CustoFlag, on: bool) {
        if let Some(internals) = self.node_mut(id).internals_mut() {
            if on {
                internals.custo_mut().set(flag);
            } else {
                internals.custo_mut().clear(flag);
            }
        }
    }

    /// Switches the active configuration. Entangled members lacking
    /// the configuration are skipped with a trace; generators forward
    /// the switch to their generated node when customized to.
    pub fn switch_config(
        &mut self,
        id: NodeId,
        config: &str,
        ignore_entanglement: bool,
    ) -> Result<(), ModelError> {
        if !self.node(id).has_config(config) {
            return Err(ModelError::ConfigNotSet {
                name: self.node(id).name().to_string(),
                config: config.to_string(),
            });
        }
        let members = if ignore_entanglement {
            vec![id]
        } else {
            self.group_members(id)
        };
        for member in members {
            if !self.node(member).has_config(config) {
                tracing::debug!(
                    node = %member,
                    config,
                    "entangled node lacks the configuration, skipping"
                );
                continue;
            }
            self.node_mut(member).current = config.to_string();

            let forward = match self.node(member).internals() {
                Some(internals) => match &internals.variant {
                    InternalsVariant::GenFunc { generated, .. }
                        if internals.custo().has(CustoFlag::ForwardConfChange) =>
                    {
                        *generated
                    }
                    _ => None,
                },
                None => None,
            };
            if let Some(inner) = forward {
                if self.node(inner).has_config(config) {
                    self.switch_config(inner, config, true)?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Freeze
    // ------------------------------------------------------------------

    /// Computes (or returns the cached) value of `id` and every node
    /// below it. Delayed jobs queued during the pass (postponed
    /// existence checks, trigger-last generators) run once the
    /// outermost freeze returns, after which the value is recomputed
    /// with the settled structure.
    pub fn freeze(&mut self, id: NodeId, rng: &mut dyn RngCore) -> Vec<u8> {
        self.freeze_nesting += 1;
        let mut value = self.freeze_node(id, rng);
        self.freeze_nesting -= 1;
        if self.freeze_nesting == 0 && self.env.has_pending_jobs() {
            self.run_delayed_jobs(rng);
            value = self.freeze_node(id, rng);
        }
        value
    }

    /// Serialized byte form of the subtree under `id`.
    pub fn to_bytes(&mut self, id: NodeId, rng: &mut dyn RngCore) -> Vec<u8> {
        self.freeze(id, rng)
    }

    pub(crate) fn freeze_node(&mut self, id: NodeId, rng: &mut dyn RngCore) -> Vec<u8> {
        if self.env.begin_freeze(id) {
            // Already up the freeze stack: recursion cut, yield what we
            // have instead of recursing forever.
            let value = self
                .node(id)
                .internals()
                .and_then(NodeInternals::frozen)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            self.env.end_freeze(id);
            return value;
        }
        let value = self.freeze_dispatch(id, rng);
        self.env.end_freeze(id);
        value
    }

    fn freeze_dispatch(&mut self, id: NodeId, rng: &mut dyn RngCore) -> Vec<u8> {
        let node = self.node(id);
        let Some(internals) = node.internals() else {
            tracing::warn!(node = %id, name = node.name(), "freezing a node without internals");
            return Vec::new();
        };
        if internals.is_attr_set(Attribute::Disabled) {
            return Vec::new();
        }
        if internals.is_attr_set(Attribute::Freezable) {
            if let Some(value) = internals.frozen() {
                return value.to_vec();
            }
        }
        match internals.kind() {
            InternalsKind::Empty => Vec::new(),
            InternalsKind::Typed => self.freeze_typed(id, rng),
            InternalsKind::Func => self.freeze_func(id, rng),
            InternalsKind::GenFunc => self.freeze_genfunc(id, rng),
            InternalsKind::NonTerm => self.freeze_nonterm(id, rng),
        }
    }

    fn freeze_typed(&mut self, id: NodeId, rng: &mut dyn RngCore) -> Vec<u8> {
        let (value, exhausted) = {
            let internals = match self.node_mut(id).internals_mut() {
                Some(internals) => internals,
                None => unreachable!("dispatch guarantees internals"),
            };
            let freezable = internals.is_attr_set(Attribute::Freezable);
            let codec = match internals.codec_mut() {
                Some(codec) => codec,
                None => unreachable!("typed internals always carry a codec"),
            };
            let value = codec.produce(rng);
            let exhausted = codec.is_exhausted();
            if freezable {
                internals.set_frozen(value.clone());
            }
            (value, exhausted)
        };
        if exhausted {
            self.env.note_exhausted(id);
        }
        value
    }

    fn freeze_func(&mut self, id: NodeId, rng: &mut dyn RngCore) -> Vec<u8> {
        let (func, args, freezable) = {
            let internals = match self.node(id).internals() {
                Some(internals) => internals,
                None => unreachable!("dispatch guarantees internals"),
            };
            match &internals.variant {
                InternalsVariant::Func { func, args } => (
                    func.clone(),
                    args.clone(),
                    internals.is_attr_set(Attribute::Freezable),
                ),
                _ => unreachable!("dispatch guarantees a function node"),
            }
        };
        let mut inputs = Vec::with_capacity(args.len());
        for arg in &args {
            inputs.push(self.freeze_node(*arg, rng));
        }
        let value = match catch_unwind(AssertUnwindSafe(|| func(&inputs))) {
            Ok(Ok(value)) => value,
            Ok(Err(error)) => {
                tracing::warn!(node = %id, %error, "function node failed, substituting empty value");
                Vec::new()
            }
            Err(payload) => {
                tracing::warn!(
                    node = %id,
                    panic = %panic_message(payload.as_ref()),
                    "function node panicked, substituting empty value"
                );
                Vec::new()
            }
        };
        if freezable {
            if let Some(internals) = self.node_mut(id).internals_mut() {
                internals.set_frozen(value.clone());
            }
        }
        value
    }

    fn freeze_genfunc(&mut self, id: NodeId, rng: &mut dyn RngCore) -> Vec<u8> {
        let (generated, trigger_last, freezable, depth) = {
            let internals = match self.node(id).internals() {
                Some(internals) => internals,
                None => unreachable!("dispatch guarantees internals"),
            };
            match &internals.variant {
                InternalsVariant::GenFunc { generated, .. } => (
                    *generated,
                    internals.custo().has(CustoFlag::TriggerLast),
                    internals.is_attr_set(Attribute::Freezable),
                    self.node(id).depth.unwrap_or(0),
                ),
                _ => unreachable!("dispatch guarantees a generator node"),
            }
        };

        if let Some(inner) = generated {
            let value = self.freeze_node(inner, rng);
            if freezable {
                if let Some(internals) = self.node_mut(id).internals_mut() {
                    internals.set_frozen(value.clone());
                }
            }
            return value;
        }

        if trigger_last && !self.in_djob_phase {
            self.env
                .enqueue_job(DJOB_PRIO_GENERATOR, DelayedJob::TriggerGenerator { node: id });
            return Vec::new();
        }

        if depth >= self.config.generation.max_depth {
            tracing::warn!(node = %id, depth, "generator recursion cut at depth limit");
            return Vec::new();
        }

        let Some(root) = self.generate_now(id) else {
            return Vec::new();
        };
        self.stamp_depth(root, depth + 1);
        let value = self.freeze_node(root, rng);
        if freezable {
            if let Some(internals) = self.node_mut(id).internals_mut() {
                internals.set_frozen(value.clone());
            }
        }
        value
    }

    /// Runs a generator closure and stores the produced root. Failures
    /// and panics are contained: the node simply yields nothing this
    /// cycle.
    pub(crate) fn generate_now(&mut self, id: NodeId) -> Option<NodeId> {
        let (generator, args) = {
            let internals = self.node(id).internals()?;
            match &internals.variant {
                InternalsVariant::GenFunc {
                    generator, args, ..
                } => (generator.clone(), args.clone()),
                _ => return None,
            }
        };
        let produced = match catch_unwind(AssertUnwindSafe(|| generator(self, &args))) {
            Ok(Ok(root)) => Some(root),
            Ok(Err(error)) => {
                tracing::warn!(node = %id, %error, "generator failed, node yields nothing");
                None
            }
            Err(payload) => {
                tracing::warn!(
                    node = %id,
                    panic = %panic_message(payload.as_ref()),
                    "generator panicked, node yields nothing"
                );
                None
            }
        };
        if let Some(root) = produced {
            if let Some(internals) = self.node_mut(id).internals_mut() {
                if let InternalsVariant::GenFunc { generated, .. } = &mut internals.variant {
                    *generated = Some(root);
                }
            }
        }
        produced
    }

    pub(crate) fn run_delayed_jobs(&mut self, rng: &mut dyn RngCore) {
        self.in_djob_phase = true;
        let mut passes = 0u32;
        while let Some((priority, batch)) = self.env.take_next_jobs() {
            passes += 1;
            assert!(
                passes <= 64,
                "delayed-job queue is not draining (stuck at priority {priority})"
            );
            for job in batch {
                match job {
                    DelayedJob::ResolveExistence {
                        nonterm,
                        placeholder,
                        template,
                    } => self.run_existence_job(nonterm, placeholder, template, rng),
                    DelayedJob::RefreshBookkeeping { nonterm } => {
                        self.refresh_bookkeeping(nonterm)
                    }
                    DelayedJob::TriggerGenerator { node } => {
                        let _ = self.freeze_node(node, rng);
                    }
                }
            }
        }
        self.in_djob_phase = false;
    }

    // ------------------------------------------------------------------
    // Unfreeze / reset
    // ------------------------------------------------------------------

    /// Clears cached values so the next freeze recomputes them. How
    /// much structure survives is controlled by `opts`; the operation
    /// propagates to entangled nodes unless told otherwise.
    pub fn unfreeze(&mut self, id: NodeId, opts: &UnfreezeOptions) {
        let members = if opts.ignore_entanglement {
            vec![id]
        } else {
            self.group_members(id)
        };
        let mut visited = HashSet::new();
        for member in members {
            self.unfreeze_single(member, opts, &mut visited);
        }
    }

    fn unfreeze_single(&mut self, id: NodeId, opts: &UnfreezeOptions, visited: &mut HashSet<NodeId>) {
        if !visited.insert(id) {
            return;
        }
        let Some(kind) = self.node(id).kind() else {
            return;
        };
        match kind {
            InternalsKind::Empty => {}
            InternalsKind::Typed | InternalsKind::Func => {
                // Constraint re-evaluation keeps leaf values.
                if !opts.reevaluate_constraints {
                    if let Some(internals) = self.node_mut(id).internals_mut() {
                        internals.clear_frozen();
                    }
                }
            }
            InternalsKind::GenFunc => {
                let (reset_on_unfreeze, generated) = match self.node(id).internals() {
                    Some(internals) => match &internals.variant {
                        InternalsVariant::GenFunc { generated, .. } => (
                            internals.custo().has(CustoFlag::ResetOnUnfreeze),
                            *generated,
                        ),
                        _ => (false, None),
                    },
                    None => (false, None),
                };
                if let Some(internals) = self.node_mut(id).internals_mut() {
                    internals.clear_frozen();
                }
                if opts.dont_change_state || opts.reevaluate_constraints {
                    if opts.recursive {
                        if let Some(inner) = generated {
                            self.unfreeze_single(inner, opts, visited);
                        }
                    }
                } else if reset_on_unfreeze {
                    if let Some(internals) = self.node_mut(id).internals_mut() {
                        if let InternalsVariant::GenFunc { generated, .. } =
                            &mut internals.variant
                        {
                            *generated = None;
                        }
                    }
                } else if opts.recursive {
                    if let Some(inner) = generated {
                        self.unfreeze_single(inner, opts, visited);
                    }
                }
            }
            InternalsKind::NonTerm => {
                let (expanded, templates, separator) = {
                    let internals = match self.node(id).internals() {
                        Some(internals) => internals,
                        None => return,
                    };
                    let payload = match internals.nonterm_payload() {
                        Some(payload) => payload,
                        None => return,
                    };
                    (
                        payload.expanded.clone(),
                        payload.template_nodes(),
                        payload.separator.as_ref().map(|s| s.node),
                    )
                };
                if let Some(internals) = self.node_mut(id).internals_mut() {
                    internals.clear_frozen();
                }
                if opts.dont_change_state {
                    if opts.recursive {
                        for child in expanded.into_iter().flatten() {
                            self.unfreeze_single(child.node, opts, visited);
                        }
                    }
                } else {
                    let full = !opts.reevaluate_constraints;
                    if let Some(internals) = self.node_mut(id).internals_mut() {
                        if let Some(payload) = internals.nonterm_payload_mut() {
                            payload.expanded = None;
                            if full {
                                payload.chosen_shape = None;
                                payload.reuse_shape = false;
                            } else {
                                payload.reuse_shape = payload.chosen_shape.is_some();
                            }
                        }
                    }
                    if let Some(placed) = &expanded {
                        self.release_instances(placed);
                    }
                    self.env.clear_drawn(id);
                    for template in &templates {
                        self.env.clear_drawn(*template);
                    }
                    if opts.recursive {
                        for template in templates {
                            self.unfreeze_single(template, opts, visited);
                        }
                        if full {
                            if let Some(sep) = separator {
                                self.unfreeze_single(sep, opts, visited);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Hard reset: value caches, codec walks, expansions, bookkeeping
    /// and exhaustion records all go back to their initial state.
    pub fn reset_state(&mut self, id: NodeId, recursive: bool) {
        let mut visited = HashSet::new();
        self.reset_state_inner(id, recursive, &mut visited);
    }

    fn reset_state_inner(&mut self, id: NodeId, recursive: bool, visited: &mut HashSet<NodeId>) {
        if !visited.insert(id) {
            return;
        }
        let mut children: Vec<NodeId> = Vec::new();
        let mut abandoned: Option<Vec<PlacedChild>> = None;
        if let Some(internals) = self.node_mut(id).internals_mut() {
            internals.clear_frozen();
            if let Some(codec) = internals.codec_mut() {
                codec.reset();
            }
            match &mut internals.variant {
                InternalsVariant::GenFunc { generated, .. } => {
                    children.extend(*generated);
                }
                InternalsVariant::NonTerm(payload) => {
                    abandoned = payload.expanded.take();
                    payload.chosen_shape = None;
                    payload.reuse_shape = false;
                    payload.cycle.clear();
                    payload.cycle_started = false;
                    children.extend(payload.template_nodes());
                    children.extend(payload.separator.as_ref().map(|s| s.node));
                }
                _ => {}
            }
        }
        if let Some(placed) = &abandoned {
            self.release_instances(placed);
        }
        self.env.clear_drawn(id);
        self.env.clear_exhausted(id);
        if recursive {
            for child in children {
                self.reset_state_inner(child, true, visited);
            }
        }
    }

    // ------------------------------------------------------------------
    // Absorption
    // ------------------------------------------------------------------

    /// Parses `blob` back into the model rooted at `id`. On success the
    /// subtree holds the absorbed values as its frozen state; on reject
    /// every touched node has been rolled back.
    pub fn absorb(
        &mut self,
        id: NodeId,
        blob: &[u8],
        csts: &AbsorbConstraints,
    ) -> AbsorbOutcome {
        let mut outcome = self.absorb_node(id, blob, csts);
        if outcome.is_success() && outcome.size > 0 && outcome.end() == blob.len() {
            outcome.status = AbsorbStatus::FullyAbsorbed;
        }
        outcome
    }

    pub(crate) fn absorb_node(
        &mut self,
        id: NodeId,
        blob: &[u8],
        csts: &AbsorbConstraints,
    ) -> AbsorbOutcome {
        let node = self.node(id);
        let Some(internals) = node.internals() else {
            tracing::warn!(node = %id, name = node.name(), "absorbing into a node without internals");
            return AbsorbOutcome::matched(0, 0);
        };
        if internals.is_attr_set(Attribute::Disabled) {
            return AbsorbOutcome::matched(0, 0);
        }
        match internals.kind() {
            InternalsKind::Empty => AbsorbOutcome::matched(0, 0),
            InternalsKind::Typed => self.absorb_typed(id, blob, csts),
            InternalsKind::Func => self.absorb_func(id, blob, csts),
            InternalsKind::GenFunc => self.absorb_genfunc(id, blob, csts),
            InternalsKind::NonTerm => self.absorb_nonterm(id, blob, csts),
        }
    }

    fn absorb_typed(
        &mut self,
        id: NodeId,
        blob: &[u8],
        csts: &AbsorbConstraints,
    ) -> AbsorbOutcome {
        let internals = match self.node_mut(id).internals_mut() {
            Some(internals) => internals,
            None => unreachable!("dispatch guarantees internals"),
        };
        let codec = match internals.codec_mut() {
            Some(codec) => codec,
            None => unreachable!("typed internals always carry a codec"),
        };
        let outcome = codec.absorb(blob, csts);
        if outcome.is_success() {
            let value = codec.current().map(<[u8]>::to_vec).unwrap_or_default();
            internals.set_frozen(value);
        }
        outcome
    }

    /// A function node can only be absorbed by recomputing it: all
    /// arguments must already hold values, and the blob must start
    /// with the recomputed output.
    fn absorb_func(
        &mut self,
        id: NodeId,
        blob: &[u8],
        csts: &AbsorbConstraints,
    ) -> AbsorbOutcome {
        let (func, args) = {
            let internals = match self.node(id).internals() {
                Some(internals) => internals,
                None => unreachable!("dispatch guarantees internals"),
            };
            match &internals.variant {
                InternalsVariant::Func { func, args } => (func.clone(), args.clone()),
                _ => unreachable!("dispatch guarantees a function node"),
            }
        };
        let mut inputs = Vec::with_capacity(args.len());
        for arg in &args {
            match self.node(*arg).internals().and_then(NodeInternals::frozen) {
                Some(value) => inputs.push(value.to_vec()),
                None => {
                    tracing::debug!(node = %id, arg = %arg, "function argument has no value yet");
                    return AbsorbOutcome::rejected();
                }
            }
        }
        let expected = match catch_unwind(AssertUnwindSafe(|| func(&inputs))) {
            Ok(Ok(value)) => value,
            _ => return AbsorbOutcome::rejected(),
        };
        if expected.is_empty() {
            return AbsorbOutcome::matched(0, 0);
        }
        let matches = if csts.contents {
            blob.starts_with(&expected)
        } else {
            blob.len() >= expected.len()
        };
        if !matches {
            return AbsorbOutcome::rejected();
        }
        let taken = blob[..expected.len()].to_vec();
        if let Some(internals) = self.node_mut(id).internals_mut() {
            internals.set_frozen(taken);
        }
        AbsorbOutcome::matched(0, expected.len())
    }

    fn absorb_genfunc(
        &mut self,
        id: NodeId,
        blob: &[u8],
        csts: &AbsorbConstraints,
    ) -> AbsorbOutcome {
        let generated = {
            let internals = match self.node(id).internals() {
                Some(internals) => internals,
                None => unreachable!("dispatch guarantees internals"),
            };
            match &internals.variant {
                InternalsVariant::GenFunc { generated, .. } => *generated,
                _ => unreachable!("dispatch guarantees a generator node"),
            }
        };
        let inner = match generated {
            Some(inner) => inner,
            None => match self.generate_now(id) {
                Some(inner) => inner,
                None => return AbsorbOutcome::rejected(),
            },
        };
        let outcome = self.absorb_node(inner, blob, csts);
        if outcome.is_success() {
            let value = self
                .node(inner)
                .internals()
                .and_then(NodeInternals::frozen)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            if let Some(internals) = self.node_mut(id).internals_mut() {
                internals.set_frozen(value);
            }
        }
        outcome
    }

    // ------------------------------------------------------------------
    // Cloning
    // ------------------------------------------------------------------

    /// Clones the subtree rooted at `root` inside the same graph.
    ///
    /// The copy preserves identity relationships instead of
    /// duplicating them naively:
    /// - argument references into the cloned subtree are remapped to
    ///   the clones, external ones are kept (or pulled in when the
    ///   node is customized with `CloneExtNodeArgs`);
    /// - entangled nodes cloned together stay entangled together;
    /// - sync relations are remapped the same way.
    ///
    /// Returns the new root plus the full old-to-new handle map.
    pub fn clone_node(
        &mut self,
        root: NodeId,
        opts: &CloneOptions,
    ) -> (NodeId, HashMap<NodeId, NodeId>) {
        let mut map = HashMap::new();
        let mut created = Vec::new();
        let new_root = self.copy_rec(root, opts, &mut map, &mut created);
        self.remap_args(opts, &mut map, &mut created);
        self.rebuild_entanglement(opts, &map);
        let targets: Vec<NodeId> = map.values().copied().collect();
        for new_id in targets {
            let node = self.node_mut(new_id);
            for internals in node.configs.values_mut() {
                for relation in internals.sync.values_mut() {
                    relation.remap(&map);
                }
            }
        }
        if !opts.ignore_frozen_state {
            self.env.copy_tracking(&map);
        }
        (new_root, map)
    }

    fn copy_rec(
        &mut self,
        old: NodeId,
        opts: &CloneOptions,
        map: &mut HashMap<NodeId, NodeId>,
        created: &mut Vec<NodeId>,
    ) -> NodeId {
        if let Some(done) = map.get(&old) {
            return *done;
        }
        // Reserve the slot first so self-referencing grammars terminate.
        let new_id = NodeId::from_index(self.nodes.len());
        map.insert(old, new_id);
        created.push(new_id);
        let placeholder = Node::new(self.node(old).name().to_string());
        self.nodes.push(placeholder);

        let mut copy = self.node(old).clone();
        copy.group = None;
        let config_names: Vec<String> = copy.configs.keys().cloned().collect();
        for config in config_names {
            let Some(internals) = copy.configs.get_mut(&config) else {
                continue;
            };
            let keep_frozen = !opts.ignore_frozen_state
                && (internals.kind() != InternalsKind::NonTerm
                    || internals.custo().has(CustoFlag::FrozenCopy));
            if !keep_frozen {
                internals.clear_frozen();
            }
            match &mut internals.variant {
                InternalsVariant::Empty | InternalsVariant::Typed { .. } => {}
                InternalsVariant::Func { .. } => {}
                InternalsVariant::GenFunc { generated, .. } => {
                    if !keep_frozen {
                        *generated = None;
                    } else if let Some(inner) = generated {
                        *inner = self.copy_rec(*inner, opts, map, created);
                    }
                }
                InternalsVariant::NonTerm(payload) => {
                    for shape in &mut payload.shapes {
                        for section in &mut shape.sections {
                            for entry in &mut section.entries {
                                entry.node = self.copy_rec(entry.node, opts, map, created);
                            }
                        }
                    }
                    if let Some(sep) = &mut payload.separator {
                        sep.node = self.copy_rec(sep.node, opts, map, created);
                    }
                    if keep_frozen {
                        if let Some(expanded) = &mut payload.expanded {
                            for placed in expanded {
                                placed.node = self.copy_rec(placed.node, opts, map, created);
                                if let Some(template) = &mut placed.template {
                                    *template = self.copy_rec(*template, opts, map, created);
                                }
                            }
                        }
                    } else {
                        payload.expanded = None;
                        payload.chosen_shape = None;
                        payload.reuse_shape = false;
                    }
                }
            }
        }
        self.nodes[new_id.index()] = copy;
        new_id
    }

    fn remap_args(
        &mut self,
        opts: &CloneOptions,
        map: &mut HashMap<NodeId, NodeId>,
        created: &mut Vec<NodeId>,
    ) {
        let mut queue: Vec<NodeId> = created.clone();
        while let Some(current) = queue.pop() {
            let config_names: Vec<String> = self.node(current).configs.keys().cloned().collect();
            for config in config_names {
                let snapshot = match self.node(current).internals_for(&config) {
                    Some(internals) => match &internals.variant {
                        InternalsVariant::Func { args, .. }
                        | InternalsVariant::GenFunc { args, .. } => Some((
                            args.clone(),
                            internals.custo().has(CustoFlag::CloneExtNodeArgs),
                        )),
                        _ => None,
                    },
                    None => None,
                };
                let Some((args, pull_external)) = snapshot else {
                    continue;
                };
                let mut new_args = Vec::with_capacity(args.len());
                for arg in args {
                    if let Some(mapped) = map.get(&arg) {
                        new_args.push(*mapped);
                    } else if pull_external {
                        let mut grown = Vec::new();
                        let cloned = self.copy_rec(arg, opts, map, &mut grown);
                        queue.extend(grown.iter().copied());
                        created.extend(grown);
                        new_args.push(cloned);
                    } else {
                        // External reference, kept pointing at the original.
                        new_args.push(arg);
                    }
                }
                if let Some(internals) = self.node_mut(current).configs.get_mut(&config) {
                    match &mut internals.variant {
                        InternalsVariant::Func { args, .. }
                        | InternalsVariant::GenFunc { args, .. } => *args = new_args,
                        _ => {}
                    }
                }
            }
        }
    }

    fn rebuild_entanglement(&mut self, opts: &CloneOptions, map: &HashMap<NodeId, NodeId>) {
        let mut touched: HashMap<GroupId, Vec<NodeId>> = HashMap::new();
        for (old, new) in map {
            if let Some(group) = self.node(*old).group {
                touched.entry(group).or_default().push(*new);
            }
        }
        for (group, mut images) in touched {
            images.sort_unstable();
            let group_size = self.groups[group.index()]
                .as_ref()
                .map(HashSet::len)
                .unwrap_or(0);
            let fully_internal = images.len() == group_size;
            if !fully_internal && opts.accept_external_entanglement {
                for image in images {
                    self.attach_to_group(image, group);
                }
                continue;
            }
            if !fully_internal {
                tracing::warn!(
                    group = %group,
                    cloned = images.len(),
                    total = group_size,
                    "dropping entanglement with nodes outside the cloned subtree"
                );
            }
            if images.len() >= 2 {
                self.make_group(images);
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Structural JSON dump of the subtree under `id`, frozen values
    /// included. Shared nodes appear once; later encounters are
    /// emitted as references.
    pub fn describe(&self, id: NodeId) -> serde_json::Value {
        let mut visited = HashSet::new();
        self.describe_rec(id, &mut visited)
    }

    fn describe_rec(&self, id: NodeId, visited: &mut HashSet<NodeId>) -> serde_json::Value {
        let node = self.node(id);
        if !visited.insert(id) {
            return json!({ "ref": id.0, "name": node.name() });
        }
        let Some(internals) = node.internals() else {
            return json!({ "id": id.0, "name": node.name(), "kind": "undefined" });
        };
        let attrs: Vec<String> = internals
            .attrs()
            .iter()
            .map(|attr| format!("{attr:?}"))
            .collect();
        let sync: Vec<String> = {
            let mut scopes: Vec<String> = internals
                .sync
                .keys()
                .map(|scope| format!("{scope:?}"))
                .collect();
            scopes.sort_unstable();
            scopes
        };
        let mut out = json!({
            "id": id.0,
            "name": node.name(),
            "config": node.current_config(),
            "kind": internals.kind().label(),
            "attrs": attrs,
        });
        if !sync.is_empty() {
            out["sync"] = json!(sync);
        }
        if !node.semantics().is_empty() {
            let mut tags: Vec<&str> = node.semantics().iter().map(String::as_str).collect();
            tags.sort_unstable();
            out["semantics"] = json!(tags);
        }
        if let Some(value) = internals.frozen() {
            out["value"] = json!(hex_string(value));
        }
        match &internals.variant {
            InternalsVariant::Func { args, .. } => {
                out["args"] = json!(args.iter().map(|a| a.0).collect::<Vec<_>>());
            }
            InternalsVariant::GenFunc {
                args, generated, ..
            } => {
                out["args"] = json!(args.iter().map(|a| a.0).collect::<Vec<_>>());
                if let Some(inner) = generated {
                    out["generated"] = self.describe_rec(*inner, visited);
                }
            }
            InternalsVariant::NonTerm(payload) => {
                if let Some(expanded) = &payload.expanded {
                    out["children"] = json!(
                        expanded
                            .iter()
                            .map(|placed| self.describe_rec(placed.node, visited))
                            .collect::<Vec<_>>()
                    );
                } else {
                    out["shapes"] = json!(
                        payload
                            .shapes
                            .iter()
                            .map(|shape| {
                                json!({
                                    "weight": shape.weight,
                                    "sections": shape
                                        .sections
                                        .iter()
                                        .map(|section| {
                                            json!({
                                                "combinator": format!("{:?}", section.combinator),
                                                "entries": section
                                                    .entries
                                                    .iter()
                                                    .map(|entry| {
                                                        json!({
                                                            "node": self.describe_rec(entry.node, visited),
                                                            "min": entry.qty.min,
                                                            "max": entry.qty.max,
                                                        })
                                                    })
                                                    .collect::<Vec<_>>(),
                                            })
                                        })
                                        .collect::<Vec<_>>(),
                                })
                            })
                            .collect::<Vec<_>>()
                    );
                }
            }
            _ => {}
        }
        out
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

pub(crate) fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Weighted index pick. Zero-weight entries are never chosen unless
/// every weight is zero, in which case the draw is uniform.
pub(crate) fn weighted_pick(rng: &mut dyn RngCore, weights: &[u64]) -> usize {
    use rand::Rng;

    assert!(!weights.is_empty(), "weighted pick over an empty slice");
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return rng.random_range(0..weights.len());
    }
    let mut ticket = rng.random_range(0..total);
    for (idx, weight) in weights.iter().enumerate() {
        if ticket < *weight {
            return idx;
        }
        ticket -= *weight;
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{BytesValue, Endianness, UIntValue};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::from_seed([0u8; 32])
    }

    #[test]
    fn freeze_caches_and_unfreeze_advances() {
        let mut graph = ModelGraph::new();
        let id = graph.add_typed("field", Box::new(BytesValue::new(["one", "two"])));
        let mut rng = rng();

        let first = graph.freeze(id, &mut rng);
        assert_eq!(first, b"one");
        assert_eq!(
            graph.freeze(id, &mut rng),
            first,
            "second freeze must return the cached value"
        );

        graph.unfreeze(id, &UnfreezeOptions::default());
        assert_eq!(
            graph.freeze(id, &mut rng),
            b"two",
            "unfreeze advances the deterministic walk"
        );
    }

    #[test]
    fn non_freezable_node_redraws_every_time() {
        let mut graph = ModelGraph::new();
        let id = graph.add_typed("field", Box::new(BytesValue::new(["a", "b"])));
        graph.clear_attr(id, Attribute::Freezable, true);
        let mut rng = rng();

        assert_eq!(graph.freeze(id, &mut rng), b"a");
        assert_eq!(
            graph.freeze(id, &mut rng),
            b"b",
            "without Freezable each freeze draws anew"
        );
        assert!(graph.value(id).is_none(), "nothing may be cached");
    }

    #[test]
    fn disabled_node_yields_nothing() {
        let mut graph = ModelGraph::new();
        let id = graph.add_typed("field", Box::new(BytesValue::new(["data"])));
        graph.set_attr(id, Attribute::Disabled, true);
        let mut rng = rng();
        assert!(graph.freeze(id, &mut rng).is_empty());
    }

    #[test]
    fn func_node_computes_over_frozen_args() {
        let mut graph = ModelGraph::new();
        let a = graph.add_typed("a", Box::new(BytesValue::new(["left"])));
        let b = graph.add_typed("b", Box::new(BytesValue::new(["right"])));
        let func = graph.add_func(
            "joined",
            Arc::new(|inputs: &[Vec<u8>]| {
                let mut out = Vec::new();
                for input in inputs {
                    out.extend_from_slice(input);
                }
                Ok(out)
            }),
            vec![a, b],
        );
        let mut rng = rng();
        assert_eq!(graph.freeze(func, &mut rng), b"leftright");
        assert_eq!(graph.value(a), Some(&b"left"[..]), "args were frozen too");
    }

    #[test]
    fn func_panic_is_contained() {
        let mut graph = ModelGraph::new();
        let a = graph.add_typed("a", Box::new(BytesValue::new(["x"])));
        let func = graph.add_func(
            "boom",
            Arc::new(|_inputs: &[Vec<u8>]| panic!("callback exploded")),
            vec![a],
        );
        let mut rng = rng();
        assert_eq!(
            graph.freeze(func, &mut rng),
            b"",
            "a panicking callback degrades to an empty value"
        );
    }

    #[test]
    fn func_error_is_contained() {
        let mut graph = ModelGraph::new();
        let func = graph.add_func(
            "fails",
            Arc::new(|_inputs: &[Vec<u8>]| Err(anyhow::anyhow!("no value today"))),
            vec![],
        );
        let mut rng = rng();
        assert_eq!(graph.freeze(func, &mut rng), b"");
    }

    #[test]
    fn self_referential_argument_is_cut_instead_of_recursing() {
        let mut graph = ModelGraph::new();
        let leaf = graph.add_typed("leaf", Box::new(BytesValue::new(["x"])));
        let echo = graph.add_func(
            "echo",
            Arc::new(|inputs: &[Vec<u8>]| Ok(inputs.concat())),
            vec![],
        );
        let msg = graph
            .add_nonterm(
                "msg",
                vec![Shape::ordered(vec![
                    crate::nonterm::SubnodeRef::one(leaf),
                    crate::nonterm::SubnodeRef::one(echo),
                ])],
            )
            .unwrap();
        // echo reads its own enclosing message.
        graph.set_internals(
            echo,
            crate::node::DEFAULT_CONFIG,
            NodeInternals::func(Arc::new(|inputs: &[Vec<u8>]| Ok(inputs.concat())), vec![msg]),
            false,
        );

        assert_eq!(
            graph.freeze(msg, &mut rng()),
            b"x",
            "the nested freeze of a node already on the stack yields empty"
        );
    }

    #[test]
    fn genfunc_generates_once_and_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut graph = ModelGraph::new();
        let generator = graph.add_genfunc(
            "maker",
            Arc::new(move |graph: &mut ModelGraph, _args: &[NodeId]| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(graph.add_typed("made", Box::new(BytesValue::new(["gen"]))))
            }),
            vec![],
        );
        let mut rng = rng();
        assert_eq!(graph.freeze(generator, &mut rng), b"gen");
        assert_eq!(graph.freeze(generator, &mut rng), b"gen");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "generator ran exactly once");
    }

    #[test]
    fn genfunc_regenerates_after_unfreeze_by_default() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut graph = ModelGraph::new();
        let generator = graph.add_genfunc(
            "maker",
            Arc::new(move |graph: &mut ModelGraph, _args: &[NodeId]| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(graph.add_typed(
                    format!("made{n}"),
                    Box::new(BytesValue::new([format!("gen{n}")])),
                ))
            }),
            vec![],
        );
        let mut rng = rng();
        assert_eq!(graph.freeze(generator, &mut rng), b"gen0");
        graph.unfreeze(generator, &UnfreezeOptions::default());
        assert_eq!(
            graph.freeze(generator, &mut rng),
            b"gen1",
            "ResetOnUnfreeze discards the generated subtree"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn genfunc_keeps_subtree_when_custo_cleared() {
        let mut graph = ModelGraph::new();
        let generator = graph.add_genfunc(
            "maker",
            Arc::new(|graph: &mut ModelGraph, _args: &[NodeId]| {
                Ok(graph.add_typed("made", Box::new(BytesValue::new(["v1", "v2"]))))
            }),
            vec![],
        );
        if let Some(internals) = graph.node_mut(generator).internals_mut() {
            internals.custo_mut().clear(CustoFlag::ResetOnUnfreeze);
        }
        let mut rng = rng();
        assert_eq!(graph.freeze(generator, &mut rng), b"v1");
        graph.unfreeze(generator, &UnfreezeOptions::default());
        assert_eq!(
            graph.freeze(generator, &mut rng),
            b"v2",
            "same generated leaf advances instead of being rebuilt"
        );
    }

    #[test]
    fn trigger_last_generator_waits_for_the_delayed_phase() {
        let mut graph = ModelGraph::new();
        let maker = graph.add_genfunc(
            "maker",
            Arc::new(|graph: &mut ModelGraph, _args: &[NodeId]| {
                Ok(graph.add_typed("made", Box::new(BytesValue::new(["late"]))))
            }),
            vec![],
        );
        graph.set_custo_flag(maker, CustoFlag::TriggerLast, true);

        let value = graph.freeze(maker, &mut rng());
        assert_eq!(value, b"late", "the queued job expanded before freeze returned");
        assert!(graph.find_by_path(maker, "maker/made").is_some());
    }

    #[test]
    fn set_value_pins_leaf_and_rejects_non_leaves() {
        let mut graph = ModelGraph::new();
        let leaf = graph.add_typed("leaf", Box::new(BytesValue::new(["default"])));
        graph.set_value(leaf, b"pinned").unwrap();
        let mut rng = rng();
        assert_eq!(graph.freeze(leaf, &mut rng), b"pinned");

        let empty = graph.add_empty("hole");
        let err = graph.set_value(empty, b"x").unwrap_err();
        assert!(matches!(err, ModelError::KindMismatch { .. }));
    }

    #[test]
    fn entangle_is_symmetric_and_transitive() {
        let mut graph = ModelGraph::new();
        let a = graph.add_empty("a");
        let b = graph.add_empty("b");
        let c = graph.add_empty("c");
        let d = graph.add_empty("d");

        graph.entangle(a, b);
        graph.entangle(c, d);
        assert_eq!(graph.entangled_with(a), vec![a, b]);

        // Merging two groups through one edge links all four.
        graph.entangle(b, c);
        assert_eq!(graph.entangled_with(d), vec![a, b, c, d]);

        graph.disentangle(a);
        assert_eq!(graph.entangled_with(a), vec![a]);
        assert_eq!(graph.entangled_with(d), vec![b, c, d]);
    }

    #[test]
    fn dissolving_a_two_member_group_clears_both() {
        let mut graph = ModelGraph::new();
        let a = graph.add_empty("a");
        let b = graph.add_empty("b");
        graph.entangle(a, b);
        graph.disentangle(a);
        assert_eq!(graph.entangled_with(b), vec![b]);
        assert!(graph.node(b).group().is_none());
    }

    #[test]
    fn attribute_changes_propagate_through_entanglement() {
        let mut graph = ModelGraph::new();
        let a = graph.add_typed("a", Box::new(BytesValue::new(["x"])));
        let b = graph.add_typed("b", Box::new(BytesValue::new(["y"])));
        graph.entangle(a, b);

        graph.set_attr(a, Attribute::Determinist, false);
        let check = |graph: &ModelGraph, id: NodeId| {
            graph
                .node(id)
                .internals()
                .map(|i| i.is_attr_set(Attribute::Determinist))
                .unwrap_or(false)
        };
        assert!(check(&graph, a));
        assert!(check(&graph, b), "attribute reached the entangled node");

        graph.clear_attr(b, Attribute::Determinist, true);
        assert!(check(&graph, a), "ignore_entanglement limits the change");
        assert!(!check(&graph, b));
    }

    #[test]
    fn set_internals_mirrors_configurations_across_the_group() {
        let mut graph = ModelGraph::new();
        let a = graph.add_typed("a", Box::new(BytesValue::new(["main"])));
        let b = graph.add_typed("b", Box::new(BytesValue::new(["main"])));
        graph.entangle(a, b);

        let alt = NodeInternals::typed(Box::new(BytesValue::new(["alt"])));
        graph.set_internals(a, "alt", alt, false);
        assert!(graph.node(a).has_config("alt"));
        assert!(graph.node(b).has_config("alt"), "peer received its own copy");

        graph.set_internals(a, "solo", NodeInternals::empty(), true);
        assert!(graph.node(a).has_config("solo"));
        assert!(!graph.node(b).has_config("solo"), "opt-out leaves the peer untouched");
    }

    #[test]
    fn unfreeze_propagates_through_entanglement() {
        let mut graph = ModelGraph::new();
        let a = graph.add_typed("a", Box::new(BytesValue::new(["a1", "a2"])));
        let b = graph.add_typed("b", Box::new(BytesValue::new(["b1", "b2"])));
        graph.entangle(a, b);
        let mut rng = rng();
        graph.freeze(a, &mut rng);
        graph.freeze(b, &mut rng);

        graph.unfreeze(a, &UnfreezeOptions::default());
        assert!(graph.value(b).is_none(), "entangled value was cleared too");

        graph.freeze(a, &mut rng);
        graph.freeze(b, &mut rng);
        graph.unfreeze(
            a,
            &UnfreezeOptions {
                ignore_entanglement: true,
                ..Default::default()
            },
        );
        assert!(graph.value(b).is_some(), "opt-out leaves the peer frozen");
    }

    #[test]
    fn switch_config_requires_and_propagates_configs() {
        let mut graph = ModelGraph::new();
        let a = graph.add_typed("a", Box::new(BytesValue::new(["main"])));
        let alt = || NodeInternals::typed(Box::new(BytesValue::new(["alt"])));
        graph.set_internals(a, "alt", alt(), false);
        let b = graph.add_typed("b", Box::new(BytesValue::new(["main"])));
        graph.set_internals(b, "alt", alt(), false);
        let c = graph.add_typed("c", Box::new(BytesValue::new(["main-only"])));
        graph.entangle(a, b);
        graph.entangle(a, c);

        graph.switch_config(a, "alt", false).unwrap();
        assert_eq!(graph.node(a).current_config(), "alt");
        assert_eq!(graph.node(b).current_config(), "alt");
        assert_eq!(
            graph.node(c).current_config(),
            crate::node::DEFAULT_CONFIG,
            "nodes without the configuration are skipped"
        );

        let err = graph.switch_config(c, "alt", false).unwrap_err();
        assert!(matches!(err, ModelError::ConfigNotSet { .. }));
    }

    #[test]
    fn clone_remaps_internal_args_and_keeps_external_ones() {
        let mut graph = ModelGraph::new();
        let external = graph.add_typed("external", Box::new(BytesValue::new(["ext"])));
        let inner = graph.add_typed("inner", Box::new(BytesValue::new(["in"])));
        let func = graph.add_func(
            "combine",
            Arc::new(|inputs: &[Vec<u8>]| Ok(inputs.concat())),
            vec![inner, external],
        );
        let parent = graph
            .add_nonterm(
                "parent",
                vec![Shape::ordered(vec![
                    crate::nonterm::SubnodeRef::one(inner),
                    crate::nonterm::SubnodeRef::one(func),
                ])],
            )
            .unwrap();

        let (clone, map) = graph.clone_node(parent, &CloneOptions::default());
        assert_ne!(clone, parent);
        let cloned_func = map[&func];
        let args = graph
            .node(cloned_func)
            .internals()
            .and_then(|i| i.args().map(<[NodeId]>::to_vec))
            .unwrap();
        assert_eq!(args[0], map[&inner], "internal arg remapped to the clone");
        assert_eq!(args[1], external, "external arg still points outside");
    }

    #[test]
    fn clone_pulls_external_args_when_customized() {
        let mut graph = ModelGraph::new();
        let external = graph.add_typed("external", Box::new(BytesValue::new(["ext"])));
        let func = graph.add_func(
            "reader",
            Arc::new(|inputs: &[Vec<u8>]| Ok(inputs.concat())),
            vec![external],
        );
        if let Some(internals) = graph.node_mut(func).internals_mut() {
            internals.custo_mut().set(CustoFlag::CloneExtNodeArgs);
        }

        let (clone, map) = graph.clone_node(func, &CloneOptions::default());
        let args = graph
            .node(clone)
            .internals()
            .and_then(|i| i.args().map(<[NodeId]>::to_vec))
            .unwrap();
        assert_ne!(args[0], external, "external arg was pulled into the clone");
        assert_eq!(args[0], map[&external]);
    }

    #[test]
    fn clone_keeps_internal_entanglement_and_drops_external() {
        let mut graph = ModelGraph::new();
        let a = graph.add_typed("a", Box::new(BytesValue::new(["a"])));
        let b = graph.add_typed("b", Box::new(BytesValue::new(["b"])));
        let outsider = graph.add_typed("outsider", Box::new(BytesValue::new(["o"])));
        graph.entangle(a, b);
        graph.entangle(a, outsider);
        let parent = graph
            .add_nonterm(
                "parent",
                vec![Shape::ordered(vec![
                    crate::nonterm::SubnodeRef::one(a),
                    crate::nonterm::SubnodeRef::one(b),
                ])],
            )
            .unwrap();

        let (_, map) = graph.clone_node(parent, &CloneOptions::default());
        let ca = map[&a];
        let cb = map[&b];
        assert_eq!(
            graph.entangled_with(ca),
            vec![ca, cb],
            "clones are entangled among themselves only"
        );
        assert_eq!(
            graph.entangled_with(a),
            vec![a, b, outsider],
            "original group is untouched"
        );
    }

    #[test]
    fn clone_joins_original_group_when_external_accepted() {
        let mut graph = ModelGraph::new();
        let a = graph.add_typed("a", Box::new(BytesValue::new(["a"])));
        let outsider = graph.add_typed("outsider", Box::new(BytesValue::new(["o"])));
        graph.entangle(a, outsider);

        let (clone, _) = graph.clone_node(
            a,
            &CloneOptions {
                accept_external_entanglement: true,
                ..Default::default()
            },
        );
        assert_eq!(graph.entangled_with(clone), vec![a, outsider, clone]);
    }

    #[test]
    fn clone_remaps_sync_sources_inside_the_subtree() {
        let mut graph = ModelGraph::new();
        let flag = graph.add_typed("flag", Box::new(BytesValue::new(["on", "off"])));
        let dependent = graph.add_typed("dependent", Box::new(BytesValue::new(["d"])));
        graph
            .register_sync(
                dependent,
                SyncScope::Existence,
                SyncRelation::Existence(crate::sync::SyncExistence::single(
                    flag,
                    Some(crate::sync::ValueCondition::raw(["on"])),
                )),
            )
            .unwrap();
        let parent = graph
            .add_nonterm(
                "parent",
                vec![Shape::ordered(vec![
                    crate::nonterm::SubnodeRef::one(flag),
                    crate::nonterm::SubnodeRef::one(dependent),
                ])],
            )
            .unwrap();

        let (_, map) = graph.clone_node(parent, &CloneOptions::default());
        let cloned_dep = map[&dependent];
        let relation = graph
            .node(cloned_dep)
            .internals()
            .and_then(|i| i.sync_relation(SyncScope::Existence).cloned())
            .unwrap();
        assert_eq!(relation.sources(), vec![map[&flag]]);
    }

    #[test]
    fn clone_without_frozen_state_starts_pristine() {
        let mut graph = ModelGraph::new();
        let leaf = graph.add_typed("leaf", Box::new(BytesValue::new(["v1", "v2"])));
        let mut rng = rng();
        graph.freeze(leaf, &mut rng);

        let (stateful, _) = graph.clone_node(leaf, &CloneOptions::default());
        assert_eq!(
            graph.value(stateful),
            Some(&b"v1"[..]),
            "default clone keeps the frozen value"
        );

        let (pristine, _) = graph.clone_node(
            leaf,
            &CloneOptions {
                ignore_frozen_state: true,
                ..Default::default()
            },
        );
        assert!(graph.value(pristine).is_none());
    }

    #[test]
    fn fork_is_independent_but_handle_compatible() {
        let mut graph = ModelGraph::new();
        let leaf = graph.add_typed("leaf", Box::new(BytesValue::new(["v1", "v2"])));
        let mut rng = rng();
        graph.freeze(leaf, &mut rng);

        let mut fork = graph.fork();
        assert_eq!(fork.value(leaf), Some(&b"v1"[..]));
        fork.unfreeze(leaf, &UnfreezeOptions::default());
        fork.freeze(leaf, &mut rng);
        assert_eq!(fork.value(leaf), Some(&b"v2"[..]));
        assert_eq!(
            graph.value(leaf),
            Some(&b"v1"[..]),
            "the original graph is untouched"
        );
    }

    #[test]
    fn absorb_typed_roundtrip_via_uint() {
        let mut graph = ModelGraph::new();
        let field = graph.add_typed(
            "field",
            Box::new(UIntValue::new(2, Endianness::Big, vec![0x0102, 0x0304])),
        );
        let outcome = graph.absorb(field, &[0x03, 0x04], &AbsorbConstraints::full());
        assert_eq!(outcome.status, AbsorbStatus::FullyAbsorbed);
        assert_eq!(graph.value(field), Some(&[0x03, 0x04][..]));
    }

    #[test]
    fn absorb_func_verifies_recomputed_value() {
        let mut graph = ModelGraph::new();
        let a = graph.add_typed("a", Box::new(BytesValue::new(["ab"])));
        let func = graph.add_func(
            "echo",
            Arc::new(|inputs: &[Vec<u8>]| Ok(inputs.concat())),
            vec![a],
        );
        // Argument has no value yet: nothing to verify against.
        assert_eq!(
            graph
                .absorb(func, b"ab", &AbsorbConstraints::full())
                .status,
            AbsorbStatus::Reject
        );

        let mut rng = rng();
        graph.freeze(a, &mut rng);
        assert_eq!(
            graph
                .absorb(func, b"ab", &AbsorbConstraints::full())
                .status,
            AbsorbStatus::FullyAbsorbed
        );
        assert_eq!(
            graph
                .absorb(func, b"zz", &AbsorbConstraints::full())
                .status,
            AbsorbStatus::Reject
        );
    }

    #[test]
    fn describe_reports_structure_and_values() {
        let mut graph = ModelGraph::new();
        let leaf = graph.add_typed("leaf", Box::new(BytesValue::new(["hi"])));
        graph.set_semantics(leaf, ["greeting"]);
        let mut rng = rng();
        graph.freeze(leaf, &mut rng);

        let description = graph.describe(leaf);
        assert_eq!(description["name"], "leaf");
        assert_eq!(description["kind"], "typed value");
        assert_eq!(description["value"], "6869");
        assert_eq!(description["semantics"][0], "greeting");
    }

    #[test]
    fn weighted_pick_respects_weights() {
        let mut rng = rng();
        let weights = [0u64, 5, 0];
        for _ in 0..32 {
            assert_eq!(
                weighted_pick(&mut rng, &weights),
                1,
                "only the non-zero weight may win"
            );
        }
    }

    #[test]
    #[should_panic(expected = "does not belong to this graph")]
    fn foreign_handle_panics() {
        let graph = ModelGraph::new();
        let _ = graph.node(NodeId(99));
    }
}
