use std::cmp::Reverse;
use std::collections::HashMap;

use rand::Rng;
use rand::seq::SliceRandom;
use rand_core::RngCore;

use crate::env::{DJOB_PRIO_BOOKKEEPING, DJOB_PRIO_EXISTENCE, DelayedJob};
use crate::error::ModelError;
use crate::graph::{CloneOptions, ModelGraph, weighted_pick};
use crate::id::NodeId;
use crate::node::{Attribute, Customization, CustoFlag};
use crate::sync::{Corruption, CorruptionKind, ExistenceClause, SyncRelation, SyncScope};
use crate::value::{AbsorbConstraints, AbsorbOutcome};

/// How a section arranges its entries when the tree is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    /// Entries expand in declaration order.
    Ordered,
    /// Entries expand in a shuffled order, but all instances of one
    /// entry stay adjacent.
    UnorderedSet,
    /// All instances of all entries are interleaved freely.
    FullyRandom,
    /// Exactly one entry is selected, by weight.
    PickOne,
}

/// Instance-count bounds for one entry. `max == None` means unbounded;
/// generation caps it at the configured infinity limit, absorption lets
/// the data (and the attempt budget) decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QtySpec {
    pub min: u64,
    pub max: Option<u64>,
}

impl QtySpec {
    pub fn fixed(n: u64) -> Self {
        Self {
            min: n,
            max: Some(n),
        }
    }

    pub fn range(min: u64, max: u64) -> Result<Self, ModelError> {
        if max < min {
            return Err(ModelError::InvalidQuantity { min, max });
        }
        Ok(Self {
            min,
            max: Some(max),
        })
    }

    pub fn at_least(min: u64) -> Self {
        Self { min, max: None }
    }
}

/// One template reference inside a section.
#[derive(Debug, Clone)]
pub struct SubnodeRef {
    pub node: NodeId,
    pub qty: QtySpec,
    /// Selection weight, read by `PickOne` sections and ignored
    /// elsewhere.
    pub weight: u32,
}

impl SubnodeRef {
    pub fn one(node: NodeId) -> Self {
        Self {
            node,
            qty: QtySpec::fixed(1),
            weight: 1,
        }
    }

    pub fn with_qty(node: NodeId, qty: QtySpec) -> Self {
        Self {
            node,
            qty,
            weight: 1,
        }
    }

    pub fn weighted(node: NodeId, qty: QtySpec, weight: u32) -> Self {
        Self { node, qty, weight }
    }
}

#[derive(Debug, Clone)]
pub struct Section {
    pub combinator: Combinator,
    /// Repeated instances become clones named `name:2`, `name:3`, ...
    /// instead of sharing the template node.
    pub unique: bool,
    pub entries: Vec<SubnodeRef>,
}

impl Section {
    pub fn new(combinator: Combinator, entries: Vec<SubnodeRef>) -> Self {
        Self {
            combinator,
            unique: true,
            entries,
        }
    }
}

/// One alternative expansion of a non-terminal.
#[derive(Debug, Clone)]
pub struct Shape {
    pub weight: u32,
    pub sections: Vec<Section>,
}

impl Shape {
    pub fn new(weight: u32, sections: Vec<Section>) -> Self {
        Self { weight, sections }
    }

    /// Single ordered section with weight 1. The common case.
    pub fn ordered(entries: Vec<SubnodeRef>) -> Self {
        Self::new(1, vec![Section::new(Combinator::Ordered, entries)])
    }

    pub(crate) fn template_nodes(&self) -> Vec<NodeId> {
        let mut seen = Vec::new();
        for section in &self.sections {
            for entry in &section.entries {
                if !seen.contains(&entry.node) {
                    seen.push(entry.node);
                }
            }
        }
        seen
    }
}

/// Delimiter node woven between the instances of a non-terminal.
#[derive(Debug, Clone)]
pub struct Separator {
    pub node: NodeId,
    /// Also place one before the first instance.
    pub prefix: bool,
    /// Also place one after the last instance.
    pub suffix: bool,
    /// Clone the separator per occurrence instead of sharing one node.
    pub unique: bool,
}

impl Separator {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            prefix: true,
            suffix: true,
            unique: false,
        }
    }
}

/// One child slot of an expanded non-terminal.
#[derive(Debug, Clone)]
pub struct PlacedChild {
    pub node: NodeId,
    /// The grammar template this instance came from; `None` for
    /// separators.
    pub template: Option<NodeId>,
    pub is_separator: bool,
    /// Placeholder still waiting for a delayed existence verdict.
    pub(crate) pending: bool,
}

impl PlacedChild {
    fn instance(node: NodeId, template: NodeId) -> Self {
        Self {
            node,
            template: Some(template),
            is_separator: false,
            pending: false,
        }
    }

    fn separator(node: NodeId) -> Self {
        Self {
            node,
            template: None,
            is_separator: true,
            pending: false,
        }
    }

    fn pending(node: NodeId, template: NodeId) -> Self {
        Self {
            node,
            template: Some(template),
            is_separator: false,
            pending: true,
        }
    }
}

/// Grammar and expansion state of a non-terminal node.
#[derive(Debug, Clone, Default)]
pub struct NonTermPayload {
    pub(crate) shapes: Vec<Shape>,
    pub(crate) separator: Option<Separator>,
    /// Resolved children, present once the node has been expanded.
    pub(crate) expanded: Option<Vec<PlacedChild>>,
    pub(crate) chosen_shape: Option<usize>,
    /// One-shot flag set by a re-evaluating unfreeze: the next
    /// resolution keeps the previous shape.
    pub(crate) reuse_shape: bool,
    /// Shapes not yet consumed in the current walk cycle of a finite
    /// non-terminal.
    pub(crate) cycle: Vec<usize>,
    pub(crate) cycle_started: bool,
}

impl NonTermPayload {
    pub(crate) fn new(shapes: Vec<Shape>, separator: Option<Separator>) -> Self {
        Self {
            shapes,
            separator,
            ..Self::default()
        }
    }

    /// Distinct templates across all shapes, in declaration order.
    /// The separator is not a template.
    pub(crate) fn template_nodes(&self) -> Vec<NodeId> {
        let mut seen = Vec::new();
        for shape in &self.shapes {
            for template in shape.template_nodes() {
                if !seen.contains(&template) {
                    seen.push(template);
                }
            }
        }
        seen
    }

    /// Resolved child handles, when the node has been expanded.
    pub fn children(&self) -> Option<Vec<NodeId>> {
        self.expanded
            .as_ref()
            .map(|placed| placed.iter().map(|p| p.node).collect())
    }

    pub fn shape_index(&self) -> Option<usize> {
        self.chosen_shape
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExistenceState {
    Exists,
    Missing,
    /// The verdict needs a source value that does not exist yet.
    Deferred,
}

struct ResolveCx {
    nt: NodeId,
    determinist: bool,
    separator: Option<Separator>,
    placed: Vec<PlacedChild>,
    instance_total: u64,
    separators_placed: u64,
    deferred: bool,
}

// ----------------------------------------------------------------------
// Grammar validation
// ----------------------------------------------------------------------

impl ModelGraph {
    pub(crate) fn validate_shapes(&self, name: &str, shapes: &[Shape]) -> Result<(), ModelError> {
        if shapes.is_empty() {
            return Err(ModelError::EmptyGrammar {
                name: name.to_string(),
                reason: "a non-terminal needs at least one shape".into(),
            });
        }
        for shape in shapes {
            if shape.sections.is_empty() {
                return Err(ModelError::EmptyGrammar {
                    name: name.to_string(),
                    reason: "a shape needs at least one section".into(),
                });
            }
            let mut by_name: HashMap<&str, NodeId> = HashMap::new();
            let mut by_node: HashMap<NodeId, QtySpec> = HashMap::new();
            for section in &shape.sections {
                if section.entries.is_empty() {
                    return Err(ModelError::EmptyGrammar {
                        name: name.to_string(),
                        reason: "a section needs at least one entry".into(),
                    });
                }
                for entry in &section.entries {
                    if let Some(max) = entry.qty.max {
                        if max < entry.qty.min {
                            return Err(ModelError::InvalidQuantity {
                                min: entry.qty.min,
                                max,
                            });
                        }
                    }
                    let child = self
                        .try_node(entry.node)
                        .ok_or(ModelError::NodeNotFound { id: entry.node })?;
                    let child_name = child.name();
                    match by_name.get(child_name) {
                        Some(&seen) if seen != entry.node => {
                            return Err(ModelError::DuplicateSiblingName {
                                parent: name.to_string(),
                                name: child_name.to_string(),
                            });
                        }
                        _ => {
                            by_name.insert(child_name, entry.node);
                        }
                    }
                    match by_node.get(&entry.node) {
                        Some(seen) if *seen != entry.qty => {
                            return Err(ModelError::ConflictingQuantity {
                                name: child_name.to_string(),
                                a_min: seen.min,
                                a_max: seen.max,
                                b_min: entry.qty.min,
                                b_max: entry.qty.max,
                            });
                        }
                        _ => {
                            by_node.insert(entry.node, entry.qty);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Generation
// ----------------------------------------------------------------------

impl ModelGraph {
    pub(crate) fn freeze_nonterm(&mut self, id: NodeId, rng: &mut dyn RngCore) -> Vec<u8> {
        self.resolve_nonterm(id, rng);
        let children: Vec<PlacedChild> = {
            let payload = self.node(id).internals().and_then(|i| i.nonterm_payload());
            match payload {
                Some(payload) => payload.expanded.clone().unwrap_or_default(),
                None => Vec::new(),
            }
        };
        let depth = self.node(id).depth().unwrap_or(0);
        for placed in &children {
            self.stamp_depth(placed.node, depth + 1);
        }
        let mut values = Vec::with_capacity(children.len());
        for placed in &children {
            values.push(self.freeze_node(placed.node, rng));
        }
        self.apply_size_write_backs(&children, &values);
        let mut out = Vec::new();
        for (placed, value) in children.iter().zip(&values) {
            // a size write-back may have replaced a frozen value after
            // the first pass collected it
            match self.node(placed.node).internals().and_then(|i| i.frozen()) {
                Some(frozen) => out.extend_from_slice(frozen),
                None => out.extend_from_slice(value),
            }
        }
        self.register_drawn(id, &children, &values, out.len() as u64);
        let freezable = self
            .node(id)
            .internals()
            .is_some_and(|i| i.is_attr_set(Attribute::Freezable));
        // caching with jobs still queued would pin bytes that a delayed
        // existence verdict is about to invalidate
        if freezable && !self.env.has_pending_jobs() {
            if let Some(internals) = self.node_mut(id).internals_mut() {
                internals.set_frozen(out.clone());
            }
        }
        out
    }

    fn resolve_nonterm(&mut self, id: NodeId, rng: &mut dyn RngCore) {
        let (shapes, separator, already) = {
            let Some(payload) = self.node(id).internals().and_then(|i| i.nonterm_payload())
            else {
                return;
            };
            (
                payload.shapes.clone(),
                payload.separator.clone(),
                payload.expanded.is_some(),
            )
        };
        if already || shapes.is_empty() {
            return;
        }
        let determinist = self
            .node(id)
            .internals()
            .is_some_and(|i| i.is_attr_set(Attribute::Determinist));
        let shape_idx = self.choose_shape(id, &shapes, determinist, rng);
        let mut cx = ResolveCx {
            nt: id,
            determinist,
            separator,
            placed: Vec::new(),
            instance_total: 0,
            separators_placed: 0,
            deferred: false,
        };
        for section in &shapes[shape_idx].sections {
            self.resolve_section(&mut cx, section, rng);
        }
        if cx.instance_total > 0 && cx.separator.as_ref().is_some_and(|s| s.suffix) {
            self.place_separator(&mut cx);
        }
        let ResolveCx {
            placed, deferred, ..
        } = cx;
        if let Some(payload) = self
            .node_mut(id)
            .internals_mut()
            .and_then(|i| i.nonterm_payload_mut())
        {
            payload.expanded = Some(placed);
            payload.chosen_shape = Some(shape_idx);
        }
        if deferred {
            self.env.enqueue_job(
                DJOB_PRIO_BOOKKEEPING,
                DelayedJob::RefreshBookkeeping { nonterm: id },
            );
        }
    }

    fn choose_shape(
        &mut self,
        id: NodeId,
        shapes: &[Shape],
        determinist: bool,
        rng: &mut dyn RngCore,
    ) -> usize {
        let reused = {
            let payload = self
                .node_mut(id)
                .internals_mut()
                .and_then(|i| i.nonterm_payload_mut());
            match payload {
                Some(payload) if payload.reuse_shape => {
                    payload.reuse_shape = false;
                    payload.chosen_shape
                }
                _ => None,
            }
        };
        if let Some(idx) = reused {
            if idx < shapes.len() {
                return idx;
            }
        }
        let finite = self
            .node(id)
            .internals()
            .is_some_and(|i| i.is_attr_set(Attribute::Finite));
        if finite {
            return self.next_cycled_shape(id, shapes, determinist, rng);
        }
        if determinist {
            let mut best = 0;
            for (i, shape) in shapes.iter().enumerate().skip(1) {
                if shape.weight > shapes[best].weight {
                    best = i;
                }
            }
            best
        } else {
            let weights: Vec<u64> = shapes.iter().map(|s| u64::from(s.weight)).collect();
            weighted_pick(rng, &weights)
        }
    }

    /// Walks the shapes of a finite non-terminal without repetition.
    /// Once every shape has been consumed the node is reported
    /// exhausted and the cycle starts over.
    fn next_cycled_shape(
        &mut self,
        id: NodeId,
        shapes: &[Shape],
        determinist: bool,
        rng: &mut dyn RngCore,
    ) -> usize {
        let (mut cycle, started) = {
            let payload = self.node(id).internals().and_then(|i| i.nonterm_payload());
            match payload {
                Some(payload) => (payload.cycle.clone(), payload.cycle_started),
                None => (Vec::new(), false),
            }
        };
        if cycle.is_empty() {
            if started {
                self.env.note_exhausted(id);
            }
            let mut order: Vec<usize> = (0..shapes.len()).collect();
            order.sort_by_key(|&i| Reverse(shapes[i].weight));
            cycle = order;
        }
        let pick = if determinist || cycle.len() == 1 {
            0
        } else {
            let weights: Vec<u64> = cycle
                .iter()
                .map(|&i| u64::from(shapes[i].weight))
                .collect();
            weighted_pick(rng, &weights)
        };
        let idx = cycle.remove(pick);
        if let Some(payload) = self
            .node_mut(id)
            .internals_mut()
            .and_then(|i| i.nonterm_payload_mut())
        {
            payload.cycle = cycle;
            payload.cycle_started = true;
        }
        idx
    }

    fn resolve_section(&mut self, cx: &mut ResolveCx, section: &Section, rng: &mut dyn RngCore) {
        match section.combinator {
            Combinator::Ordered => {
                for entry in &section.entries {
                    self.resolve_entry(cx, section, entry, rng);
                }
            }
            Combinator::PickOne => {
                if section.entries.is_empty() {
                    return;
                }
                let pick = if cx.determinist {
                    let mut best = 0;
                    for (i, entry) in section.entries.iter().enumerate().skip(1) {
                        if entry.weight > section.entries[best].weight {
                            best = i;
                        }
                    }
                    best
                } else {
                    let weights: Vec<u64> = section
                        .entries
                        .iter()
                        .map(|e| u64::from(e.weight))
                        .collect();
                    weighted_pick(rng, &weights)
                };
                self.resolve_entry(cx, section, &section.entries[pick], rng);
            }
            Combinator::UnorderedSet => {
                let mut order: Vec<usize> = (0..section.entries.len()).collect();
                if !cx.determinist {
                    order.shuffle(rng);
                }
                for i in order {
                    self.resolve_entry(cx, section, &section.entries[i], rng);
                }
            }
            Combinator::FullyRandom => self.resolve_fully_random(cx, section, rng),
        }
    }

    fn resolve_fully_random(
        &mut self,
        cx: &mut ResolveCx,
        section: &Section,
        rng: &mut dyn RngCore,
    ) {
        enum Plan {
            Skip,
            Defer,
            Count(u64),
        }
        let mut plans = Vec::with_capacity(section.entries.len());
        for entry in &section.entries {
            let plan = match self.existence_state(entry.node) {
                ExistenceState::Missing => {
                    self.env.set_drawn(entry.node, 0, 0);
                    Plan::Skip
                }
                ExistenceState::Deferred => Plan::Defer,
                ExistenceState::Exists => {
                    let count = self.draw_count(entry.node, entry.qty, cx.determinist, rng);
                    self.env.set_drawn(entry.node, count, 0);
                    Plan::Count(count)
                }
            };
            plans.push(plan);
        }
        let mut sequence = Vec::new();
        for (i, plan) in plans.iter().enumerate() {
            if let Plan::Count(count) = plan {
                for _ in 0..*count {
                    sequence.push(i);
                }
            }
        }
        if !cx.determinist {
            sequence.shuffle(rng);
        }
        let mut ordinals = vec![0u64; section.entries.len()];
        for i in sequence {
            let ordinal = ordinals[i];
            ordinals[i] += 1;
            self.place_instance(cx, section, section.entries[i].node, ordinal);
        }
        for (i, plan) in plans.iter().enumerate() {
            if matches!(plan, Plan::Defer) {
                self.place_pending(cx, section.entries[i].node);
            }
        }
    }

    fn resolve_entry(
        &mut self,
        cx: &mut ResolveCx,
        section: &Section,
        entry: &SubnodeRef,
        rng: &mut dyn RngCore,
    ) {
        match self.existence_state(entry.node) {
            ExistenceState::Missing => {
                self.env.set_drawn(entry.node, 0, 0);
            }
            ExistenceState::Deferred => self.place_pending(cx, entry.node),
            ExistenceState::Exists => {
                let count = self.draw_count(entry.node, entry.qty, cx.determinist, rng);
                // registered before the section finishes so that
                // quantity syncs placed later in the same pass see it
                self.env.set_drawn(entry.node, count, 0);
                for ordinal in 0..count {
                    self.place_instance(cx, section, entry.node, ordinal);
                }
            }
        }
    }

    fn place_instance(
        &mut self,
        cx: &mut ResolveCx,
        section: &Section,
        template: NodeId,
        ordinal: u64,
    ) {
        if self.separator_due(cx) {
            self.place_separator(cx);
        }
        let node = if ordinal == 0 || !section.unique {
            template
        } else {
            self.instance_clone(cx.nt, template, ordinal)
        };
        cx.placed.push(PlacedChild::instance(node, template));
        cx.instance_total += 1;
    }

    fn separator_due(&self, cx: &ResolveCx) -> bool {
        match &cx.separator {
            Some(sep) => cx.instance_total > 0 || sep.prefix,
            None => false,
        }
    }

    fn place_separator(&mut self, cx: &mut ResolveCx) {
        let Some(sep) = cx.separator.clone() else {
            return;
        };
        let node = if sep.unique && cx.separators_placed > 0 {
            self.instance_clone(cx.nt, sep.node, cx.separators_placed)
        } else {
            sep.node
        };
        cx.placed.push(PlacedChild::separator(node));
        cx.separators_placed += 1;
    }

    /// Clones a template for its `ordinal`-th repetition. The clone is
    /// pristine and renamed `name:2`, `name:3`, ... to keep sibling
    /// names unambiguous. Component instances join the template's
    /// entanglement group so a mutation aimed at one repetition can
    /// reach the others; separator repetitions stay independent.
    fn instance_clone(&mut self, nt: NodeId, template: NodeId, ordinal: u64) -> NodeId {
        // accept_external_entanglement: repetitions after the second
        // clone a template that is already entangled with its earlier
        // instances, and the copy must join that group rather than
        // severing it.
        let opts = CloneOptions {
            ignore_frozen_state: true,
            accept_external_entanglement: true,
        };
        let (clone, _) = self.clone_node(template, &opts);
        let name = format!("{}:{}", self.node(template).name(), ordinal + 1);
        self.rename(clone, name);
        let custo = self
            .node(nt)
            .internals()
            .map(|i| i.custo())
            .unwrap_or_else(Customization::nonterm_defaults);
        if !custo.has(CustoFlag::MutableClone) {
            if let Some(internals) = self.node_mut(clone).internals_mut() {
                internals.clear_attr(Attribute::Mutable);
            }
        }
        if custo.has(CustoFlag::CycleClone) {
            self.reset_state(clone, true);
        }
        let is_separator = self
            .node(template)
            .internals()
            .is_some_and(|i| i.is_attr_set(Attribute::Separator));
        if !is_separator {
            self.entangle(template, clone);
        }
        clone
    }

    /// Detaches abandoned instance clones from their template's
    /// entanglement group. Called whenever an expansion is discarded,
    /// otherwise the group would keep every clone ever placed.
    pub(crate) fn release_instances(&mut self, placed: &[PlacedChild]) {
        for child in placed {
            if child.template.is_some_and(|t| t != child.node) {
                self.disentangle(child.node);
            }
        }
    }

    fn place_pending(&mut self, cx: &mut ResolveCx, template: NodeId) {
        if self.separator_due(cx) {
            self.place_separator(cx);
        }
        let name = format!("{}.pending", self.node(template).name());
        let placeholder = self.add_empty(name);
        self.set_attr(placeholder, Attribute::Disabled, true);
        cx.placed.push(PlacedChild::pending(placeholder, template));
        cx.instance_total += 1;
        self.env.enqueue_job(
            DJOB_PRIO_EXISTENCE,
            DelayedJob::ResolveExistence {
                nonterm: cx.nt,
                placeholder,
                template,
            },
        );
        cx.deferred = true;
    }

    fn draw_count(
        &mut self,
        template: NodeId,
        qty: QtySpec,
        determinist: bool,
        rng: &mut dyn RngCore,
    ) -> u64 {
        if let Some(synced) = self.synced_qty_gen(template, rng) {
            // a corrupted or hostile count field must not blow the tree
            // up past the infinity limit
            let cap = self
                .config
                .generation
                .infinity_limit
                .max(qty.max.unwrap_or(0));
            return synced.min(cap);
        }
        let (mut min, mut max) = (qty.min, qty.max);
        if let Some(Corruption::NodeQty(adjust)) =
            self.env.corruption(template, CorruptionKind::NodeQty)
        {
            let adjusted = adjust(min, max);
            min = adjusted.0;
            max = adjusted.1;
        }
        let infinity = self.config.generation.infinity_limit;
        let hi = match max {
            Some(hi) => hi,
            None => min.max(infinity),
        };
        let (lo, hi) = if hi < min { (hi, hi) } else { (min, hi) };
        if determinist {
            lo + (hi - lo + 1) / 2
        } else {
            rng.random_range(lo..=hi)
        }
    }

    /// Count imposed by a quantity sync, if the template carries one.
    fn synced_qty_gen(&mut self, template: NodeId, rng: &mut dyn RngCore) -> Option<u64> {
        let relation = {
            let internals = self.node(template).internals()?;
            internals
                .sync_relation(SyncScope::QuantityFrom)
                .or_else(|| internals.sync_relation(SyncScope::Quantity))
                .cloned()?
        };
        let count = match relation {
            SyncRelation::QtyFrom(sync) => {
                let value = match self.node(sync.source).internals().and_then(|i| i.as_int()) {
                    Some(value) => Some(value),
                    None => {
                        self.freeze_node(sync.source, rng);
                        self.node(sync.source).internals().and_then(|i| i.as_int())
                    }
                };
                let value = match value {
                    Some(value) => value,
                    None => {
                        tracing::debug!(
                            source = %sync.source,
                            "quantity sync source has no integer value, using 0"
                        );
                        0
                    }
                };
                value.saturating_add(sync.base_qty).max(0) as u64
            }
            SyncRelation::Node(source) => match self.env.drawn_qty(source) {
                Some(count) => count,
                None => {
                    tracing::debug!(
                        source = %source,
                        "quantity sync source not placed yet, assuming one instance"
                    );
                    1
                }
            },
            _ => return None,
        };
        match self.env.corruption(template, CorruptionKind::QtySync) {
            Some(Corruption::QtySync(adjust)) => Some(adjust(count)),
            _ => Some(count),
        }
    }

    fn apply_size_write_backs(&mut self, children: &[PlacedChild], values: &[Vec<u8>]) {
        for (placed, value) in children.iter().zip(values) {
            if placed.is_separator || placed.pending {
                continue;
            }
            let Some(template) = placed.template else {
                continue;
            };
            let sync = self
                .node(template)
                .internals()
                .and_then(|i| i.sync_relation(SyncScope::Size))
                .cloned();
            let Some(SyncRelation::Size(sync)) = sync else {
                continue;
            };
            let mut size = value.len() as u64;
            if let Some(Corruption::SizeSync(adjust)) =
                self.env.corruption(sync.source, CorruptionKind::SizeSync)
            {
                size = adjust(size);
            }
            let target = (size as i64).saturating_add(sync.base_size);
            let updated = {
                let internals = self.node_mut(sync.source).internals_mut();
                match internals.and_then(|i| i.codec_mut()) {
                    Some(codec) => {
                        if codec.set_int(target) {
                            codec.current().map(<[u8]>::to_vec)
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            };
            match updated {
                Some(frozen) => {
                    if let Some(internals) = self.node_mut(sync.source).internals_mut() {
                        internals.set_frozen(frozen);
                    }
                }
                None => {
                    tracing::debug!(
                        source = %sync.source,
                        target,
                        "size sync target does not take integer writes"
                    );
                }
            }
        }
    }

    /// Records per-template instance counts and byte sizes, plus the
    /// non-terminal's own totals. Templates of the chosen shape that
    /// matched nothing read as zero rather than unknown.
    fn register_drawn(
        &mut self,
        id: NodeId,
        children: &[PlacedChild],
        values: &[Vec<u8>],
        total: u64,
    ) {
        let mut counts: HashMap<NodeId, (u64, u64)> = HashMap::new();
        let chosen_templates = {
            let payload = self.node(id).internals().and_then(|i| i.nonterm_payload());
            match payload {
                Some(payload) => match payload.chosen_shape {
                    Some(si) => payload
                        .shapes
                        .get(si)
                        .map(Shape::template_nodes)
                        .unwrap_or_default(),
                    None => payload.template_nodes(),
                },
                None => Vec::new(),
            }
        };
        for template in chosen_templates {
            counts.entry(template).or_insert((0, 0));
        }
        for (placed, value) in children.iter().zip(values) {
            if placed.is_separator || placed.pending {
                continue;
            }
            let Some(template) = placed.template else {
                continue;
            };
            let entry = counts.entry(template).or_insert((0, 0));
            entry.0 += 1;
            let size = self
                .node(placed.node)
                .internals()
                .and_then(|i| i.frozen())
                .map_or(value.len(), <[u8]>::len);
            entry.1 += size as u64;
        }
        for (template, (qty, size)) in counts {
            self.env.set_drawn(template, qty, size);
        }
        self.env.set_drawn(id, 1, total);
    }

    // ------------------------------------------------------------------
    // Existence
    // ------------------------------------------------------------------

    fn existence_state(&self, template: NodeId) -> ExistenceState {
        let Some(internals) = self.node(template).internals() else {
            return ExistenceState::Exists;
        };
        let state = if let Some(relation) = internals.sync_relation(SyncScope::Existence) {
            self.eval_existence(relation, false)
        } else if let Some(relation) = internals.sync_relation(SyncScope::Inexistence) {
            self.eval_existence(relation, true)
        } else {
            ExistenceState::Exists
        };
        if self
            .env
            .corruption(template, CorruptionKind::ExistCond)
            .is_some()
        {
            return invert_existence(state);
        }
        state
    }

    fn eval_existence(&self, relation: &SyncRelation, invert: bool) -> ExistenceState {
        let state = match relation {
            SyncRelation::Node(source) => {
                if self.node_present(*source) {
                    ExistenceState::Exists
                } else {
                    ExistenceState::Missing
                }
            }
            SyncRelation::Existence(sync) => {
                let mut deferred = false;
                let mut any = false;
                let mut all = true;
                for clause in &sync.clauses {
                    match self.eval_clause(clause) {
                        None => deferred = true,
                        Some(true) => any = true,
                        Some(false) => all = false,
                    }
                }
                if deferred {
                    // a settled clause can already decide the verdict:
                    // under AND one false is enough, under OR one true
                    if sync.all_required && !all {
                        ExistenceState::Missing
                    } else if !sync.all_required && any {
                        ExistenceState::Exists
                    } else {
                        ExistenceState::Deferred
                    }
                } else if sync.all_required {
                    if all {
                        ExistenceState::Exists
                    } else {
                        ExistenceState::Missing
                    }
                } else if any {
                    ExistenceState::Exists
                } else {
                    ExistenceState::Missing
                }
            }
            _ => ExistenceState::Exists,
        };
        if invert { invert_existence(state) } else { state }
    }

    fn eval_clause(&self, clause: &ExistenceClause) -> Option<bool> {
        let internals = self.node(clause.source).internals();
        match &clause.condition {
            Some(condition) => {
                let frozen = internals.and_then(|i| i.frozen());
                let codec = internals.and_then(|i| i.codec());
                if frozen.is_none() && !codec.is_some_and(|c| c.current().is_some()) {
                    return None;
                }
                Some(condition.evaluate(frozen, codec))
            }
            None => Some(self.node_present(clause.source)),
        }
    }

    fn node_present(&self, source: NodeId) -> bool {
        let Some(node) = self.try_node(source) else {
            return false;
        };
        if node
            .internals()
            .is_some_and(|i| i.is_attr_set(Attribute::Disabled))
        {
            return false;
        }
        self.env.drawn_qty(source) != Some(0)
    }

    // ------------------------------------------------------------------
    // Delayed jobs
    // ------------------------------------------------------------------

    pub(crate) fn run_existence_job(
        &mut self,
        nonterm: NodeId,
        placeholder: NodeId,
        template: NodeId,
        rng: &mut dyn RngCore,
    ) {
        // the verdict is final once the sources have values
        let sources = self
            .node(template)
            .internals()
            .and_then(|i| {
                i.sync_relation(SyncScope::Existence)
                    .or_else(|| i.sync_relation(SyncScope::Inexistence))
                    .map(SyncRelation::sources)
            })
            .unwrap_or_default();
        for source in sources {
            let has_value = self.node(source).internals().is_some_and(|i| {
                i.frozen().is_some() || i.codec().and_then(|c| c.current()).is_some()
            });
            if !has_value {
                self.freeze_node(source, rng);
            }
        }
        let exists = matches!(self.existence_state(template), ExistenceState::Exists);
        let position = self
            .node(nonterm)
            .internals()
            .and_then(|i| i.nonterm_payload())
            .and_then(|p| p.expanded.as_ref())
            .and_then(|placed| placed.iter().position(|p| p.node == placeholder));
        let Some(position) = position else {
            tracing::warn!(
                nonterm = %nonterm,
                placeholder = %placeholder,
                "placeholder vanished before its existence was resolved"
            );
            return;
        };
        if !exists {
            self.remove_placeholder(nonterm, position);
            self.env.set_drawn(template, 0, 0);
            return;
        }
        let (qty, unique) = self.entry_spec(nonterm, template);
        let determinist = self
            .node(nonterm)
            .internals()
            .is_some_and(|i| i.is_attr_set(Attribute::Determinist));
        let count = self.draw_count(template, qty, determinist, rng);
        if count == 0 {
            self.remove_placeholder(nonterm, position);
            self.env.set_drawn(template, 0, 0);
            return;
        }
        let (separator, mut seps_placed) = {
            let payload = self.node(nonterm).internals().and_then(|i| i.nonterm_payload());
            let separator = payload.and_then(|p| p.separator.clone());
            let placed = payload
                .and_then(|p| p.expanded.as_ref())
                .map(|placed| placed.iter().filter(|p| p.is_separator).count() as u64)
                .unwrap_or(0);
            (separator, placed)
        };
        let mut replacement = Vec::new();
        for ordinal in 0..count {
            if ordinal > 0 {
                if let Some(sep) = &separator {
                    let node = if sep.unique && seps_placed > 0 {
                        self.instance_clone(nonterm, sep.node, seps_placed)
                    } else {
                        sep.node
                    };
                    seps_placed += 1;
                    replacement.push(PlacedChild::separator(node));
                }
            }
            let node = if ordinal == 0 || !unique {
                template
            } else {
                self.instance_clone(nonterm, template, ordinal)
            };
            replacement.push(PlacedChild::instance(node, template));
        }
        if let Some(payload) = self
            .node_mut(nonterm)
            .internals_mut()
            .and_then(|i| i.nonterm_payload_mut())
        {
            if let Some(expanded) = &mut payload.expanded {
                expanded.splice(position..=position, replacement);
            }
        }
        self.env.set_drawn(template, count, 0);
    }

    fn remove_placeholder(&mut self, nonterm: NodeId, position: usize) {
        if let Some(payload) = self
            .node_mut(nonterm)
            .internals_mut()
            .and_then(|i| i.nonterm_payload_mut())
        {
            let Some(expanded) = &mut payload.expanded else {
                return;
            };
            expanded.remove(position);
            if position > 0
                && expanded
                    .get(position - 1)
                    .is_some_and(|p| p.is_separator)
            {
                // the separator that introduced the vanished instance
                expanded.remove(position - 1);
            } else if position == 0
                && expanded.first().is_some_and(|p| p.is_separator)
                && payload.separator.as_ref().is_some_and(|s| !s.prefix)
            {
                expanded.remove(0);
            }
            if expanded.iter().all(|p| p.is_separator) {
                expanded.clear();
            }
        }
    }

    /// Quantity and uniqueness the grammar declares for `template`,
    /// searched in the chosen shape first.
    fn entry_spec(&self, nonterm: NodeId, template: NodeId) -> (QtySpec, bool) {
        let payload = self.node(nonterm).internals().and_then(|i| i.nonterm_payload());
        if let Some(payload) = payload {
            let shapes: Vec<&Shape> = match payload.chosen_shape {
                Some(si) => payload.shapes.get(si).into_iter().collect(),
                None => payload.shapes.iter().collect(),
            };
            for shape in shapes {
                for section in &shape.sections {
                    for entry in &section.entries {
                        if entry.node == template {
                            return (entry.qty, section.unique);
                        }
                    }
                }
            }
        }
        (QtySpec::fixed(1), true)
    }

    pub(crate) fn refresh_bookkeeping(&mut self, nonterm: NodeId) {
        let children: Vec<PlacedChild> = {
            let payload = self.node(nonterm).internals().and_then(|i| i.nonterm_payload());
            match payload.and_then(|p| p.expanded.clone()) {
                Some(children) => children,
                None => return,
            }
        };
        let sizes: Vec<Vec<u8>> = children
            .iter()
            .map(|placed| {
                self.node(placed.node)
                    .internals()
                    .and_then(|i| i.frozen())
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default()
            })
            .collect();
        let total: usize = sizes.iter().map(Vec::len).sum();
        self.register_drawn(nonterm, &children, &sizes, total as u64);
    }
}

// ----------------------------------------------------------------------
// Absorption
// ----------------------------------------------------------------------

/// A node flagged `AbsPostpone` whose bytes are only known once a later
/// sibling has matched; it then claims the gap in front of that match.
#[derive(Debug, Clone, Copy)]
struct PendingPostpone {
    template: NodeId,
    insert_at: usize,
    min_required: u64,
}

struct AbsorbFrame {
    cursor: usize,
    placed: Vec<PlacedChild>,
    instance_total: u64,
    separators_placed: u64,
    pending_postpone: Option<PendingPostpone>,
    /// Nodes whose codec or frozen state this attempt has touched, in
    /// touch order. Rolling back resets a suffix of this list.
    touched: Vec<NodeId>,
    counts: HashMap<NodeId, (u64, u64)>,
}

impl AbsorbFrame {
    fn new() -> Self {
        Self {
            cursor: 0,
            placed: Vec::new(),
            instance_total: 0,
            separators_placed: 0,
            pending_postpone: None,
            touched: Vec::new(),
            counts: HashMap::new(),
        }
    }

    fn mark(&self) -> Mark {
        Mark {
            cursor: self.cursor,
            placed: self.placed.len(),
            instance_total: self.instance_total,
            separators_placed: self.separators_placed,
            touched: self.touched.len(),
            pending: self.pending_postpone,
        }
    }
}

/// Snapshot of an [`AbsorbFrame`] taken before a speculative step.
struct Mark {
    cursor: usize,
    placed: usize,
    instance_total: u64,
    separators_placed: u64,
    touched: usize,
    pending: Option<PendingPostpone>,
}

struct AbsorbCx<'a> {
    nt: NodeId,
    window: &'a [u8],
    csts: AbsorbConstraints,
    separator: Option<Separator>,
}

fn restore_count(frame: &mut AbsorbFrame, template: NodeId, prev: Option<(u64, u64)>) {
    match prev {
        Some(prev) => {
            frame.counts.insert(template, prev);
        }
        None => {
            frame.counts.remove(&template);
        }
    }
}

impl ModelGraph {
    pub(crate) fn absorb_nonterm(
        &mut self,
        id: NodeId,
        blob: &[u8],
        csts: &AbsorbConstraints,
    ) -> AbsorbOutcome {
        let (shapes, separator) = {
            let Some(payload) = self.node(id).internals().and_then(|i| i.nonterm_payload())
            else {
                return AbsorbOutcome::rejected();
            };
            (payload.shapes.clone(), payload.separator.clone())
        };
        if shapes.is_empty() {
            return AbsorbOutcome::rejected();
        }
        let forced = if csts.size {
            csts.forced_size.map(|f| f as usize)
        } else {
            None
        };
        let window = match forced {
            Some(forced) => {
                if blob.len() < forced {
                    return AbsorbOutcome::rejected();
                }
                &blob[..forced]
            }
            None => blob,
        };
        let child_csts = AbsorbConstraints {
            forced_size: None,
            ..*csts
        };
        let mut order: Vec<usize> = (0..shapes.len()).collect();
        order.sort_by_key(|&i| Reverse(shapes[i].weight));
        for si in order {
            let cx = AbsorbCx {
                nt: id,
                window,
                csts: child_csts,
                separator: separator.clone(),
            };
            let Some(frame) = self.try_absorb_shape(&cx, &shapes[si]) else {
                continue;
            };
            if let Some(forced) = forced {
                if frame.cursor != forced {
                    self.rollback_frame(frame);
                    continue;
                }
            }
            let AbsorbFrame {
                cursor: consumed,
                placed,
                mut counts,
                ..
            } = frame;
            for template in shapes[si].template_nodes() {
                counts.entry(template).or_insert((0, 0));
            }
            for (template, (qty, size)) in counts {
                self.env.set_drawn(template, qty, size);
            }
            self.env.set_drawn(id, 1, consumed as u64);
            let mut previous = None;
            if let Some(internals) = self.node_mut(id).internals_mut() {
                internals.set_frozen(window[..consumed].to_vec());
                if let Some(payload) = internals.nonterm_payload_mut() {
                    previous = payload.expanded.replace(placed);
                    payload.chosen_shape = Some(si);
                    payload.reuse_shape = false;
                }
            }
            if let Some(previous) = previous {
                self.release_instances(&previous);
            }
            return AbsorbOutcome::matched(0, consumed);
        }
        AbsorbOutcome::rejected()
    }

    fn try_absorb_shape(&mut self, cx: &AbsorbCx<'_>, shape: &Shape) -> Option<AbsorbFrame> {
        let mut frame = AbsorbFrame::new();
        for section in &shape.sections {
            let ok = match section.combinator {
                Combinator::Ordered => self.absorb_ordered(cx, &mut frame, section),
                Combinator::PickOne => self.absorb_pick_one(cx, &mut frame, section),
                Combinator::UnorderedSet => self.absorb_unordered(cx, &mut frame, section, true),
                Combinator::FullyRandom => self.absorb_unordered(cx, &mut frame, section, false),
            };
            if !ok {
                self.rollback_frame(frame);
                return None;
            }
        }
        if !self.absorb_trailing_postpone(cx, &mut frame) {
            self.rollback_frame(frame);
            return None;
        }
        if !self.absorb_suffix_separator(cx, &mut frame) {
            self.rollback_frame(frame);
            return None;
        }
        Some(frame)
    }

    fn rollback_frame(&mut self, mut frame: AbsorbFrame) {
        for node in frame.touched.drain(..) {
            self.reset_state(node, true);
        }
        self.release_instances(&frame.placed);
    }

    fn rollback_to(&mut self, frame: &mut AbsorbFrame, mark: Mark) {
        // a gap claim since the mark inserted one child out of order
        let claimed_since_mark = mark.pending.is_some() && frame.pending_postpone.is_none();
        for node in frame.touched.drain(mark.touched..) {
            self.reset_state(node, true);
        }
        if claimed_since_mark {
            if let Some(pending) = mark.pending {
                if pending.insert_at < frame.placed.len() {
                    let claimed = frame.placed.remove(pending.insert_at);
                    self.release_instances(std::slice::from_ref(&claimed));
                }
            }
        }
        let abandoned = frame.placed.split_off(mark.placed);
        self.release_instances(&abandoned);
        frame.pending_postpone = mark.pending;
        frame.cursor = mark.cursor;
        frame.instance_total = mark.instance_total;
        frame.separators_placed = mark.separators_placed;
    }

    fn absorb_ordered(
        &mut self,
        cx: &AbsorbCx<'_>,
        frame: &mut AbsorbFrame,
        section: &Section,
    ) -> bool {
        for entry in &section.entries {
            if !self.absorb_entry(cx, frame, section, entry) {
                return false;
            }
        }
        true
    }

    /// Matches as many instances of one entry as the data and its
    /// quantity bounds allow. Returns false when the minimum could not
    /// be met; the frame is back at the entry's start in that case.
    fn absorb_entry(
        &mut self,
        cx: &AbsorbCx<'_>,
        frame: &mut AbsorbFrame,
        section: &Section,
        entry: &SubnodeRef,
    ) -> bool {
        if matches!(self.existence_state(entry.node), ExistenceState::Missing) {
            frame.counts.entry(entry.node).or_insert((0, 0));
            return true;
        }
        if frame.pending_postpone.is_none()
            && self
                .node(entry.node)
                .internals()
                .is_some_and(|i| i.is_attr_set(Attribute::AbsPostpone))
        {
            let min_required = if cx.csts.structure { entry.qty.min } else { 0 };
            frame.pending_postpone = Some(PendingPostpone {
                template: entry.node,
                insert_at: frame.placed.len(),
                min_required,
            });
            return true;
        }
        let (min, max) = match self.synced_qty_abs(entry.node, frame) {
            Some(n) => (if cx.csts.structure { n } else { 0 }, n),
            None => {
                let min = if cx.csts.structure { entry.qty.min } else { 0 };
                (min, entry.qty.max.unwrap_or(u64::MAX))
            }
        };
        let forced_child = self.synced_size_abs(entry.node);
        let entry_mark = frame.mark();
        let counts_before = frame.counts.get(&entry.node).copied();
        let mut count = 0u64;
        let mut attempts = 0u64;
        while count < max {
            if attempts >= self.config.absorption.max_attempts {
                break;
            }
            attempts += 1;
            let mark = frame.mark();
            if self.separator_due_abs(cx, frame) && !self.absorb_separator(cx, frame) {
                break;
            }
            let node = if count > 0 && section.unique {
                self.instance_clone(cx.nt, entry.node, count)
            } else {
                entry.node
            };
            frame.touched.push(node);
            let child_csts = AbsorbConstraints {
                forced_size: forced_child,
                ..cx.csts
            };
            let rest = &cx.window[frame.cursor..];
            let outcome = self.absorb_node(node, rest, &child_csts);
            if !outcome.is_success() {
                self.rollback_to(frame, mark);
                break;
            }
            if outcome.offset > 0 {
                let claimed = match frame.pending_postpone {
                    Some(pending) => self.claim_gap(cx, frame, pending, outcome.offset),
                    None => false,
                };
                if !claimed {
                    self.rollback_to(frame, mark);
                    break;
                }
            }
            frame.cursor += outcome.size;
            frame.placed.push(PlacedChild::instance(node, entry.node));
            frame.instance_total += 1;
            let slot = frame.counts.entry(entry.node).or_insert((0, 0));
            slot.0 += 1;
            slot.1 += outcome.size as u64;
            count += 1;
            if outcome.size == 0 {
                // matched the empty value; repeating would never advance
                break;
            }
        }
        if count < min {
            self.rollback_to(frame, entry_mark);
            restore_count(frame, entry.node, counts_before);
            return false;
        }
        true
    }

    /// Hands the unclaimed bytes in front of a match to the postponed
    /// node. The gap must be consumed exactly.
    fn claim_gap(
        &mut self,
        cx: &AbsorbCx<'_>,
        frame: &mut AbsorbFrame,
        pending: PendingPostpone,
        gap: usize,
    ) -> bool {
        let slice = &cx.window[frame.cursor..frame.cursor + gap];
        let csts = AbsorbConstraints {
            contents: false,
            size: true,
            forced_size: Some(gap as u64),
            ..cx.csts
        };
        frame.touched.push(pending.template);
        let outcome = self.absorb_node(pending.template, slice, &csts);
        if !outcome.is_success() || outcome.offset != 0 || outcome.size != gap {
            // the caller's rollback resets the touched node
            return false;
        }
        frame.placed.insert(
            pending.insert_at,
            PlacedChild::instance(pending.template, pending.template),
        );
        frame.instance_total += 1;
        let slot = frame.counts.entry(pending.template).or_insert((0, 0));
        slot.0 += 1;
        slot.1 += gap as u64;
        frame.cursor += gap;
        frame.pending_postpone = None;
        true
    }

    /// A postponed node that never saw a gap gets one last chance at
    /// the remaining bytes; its bytes then sit at the tail, so the
    /// placed child goes to the end of the list.
    fn absorb_trailing_postpone(&mut self, cx: &AbsorbCx<'_>, frame: &mut AbsorbFrame) -> bool {
        let Some(pending) = frame.pending_postpone.take() else {
            return true;
        };
        let rest = &cx.window[frame.cursor..];
        if rest.is_empty() {
            return pending.min_required == 0;
        }
        frame.touched.push(pending.template);
        let outcome = self.absorb_node(pending.template, rest, &cx.csts);
        if outcome.is_success() && outcome.offset == 0 && outcome.size > 0 {
            frame.cursor += outcome.size;
            frame
                .placed
                .push(PlacedChild::instance(pending.template, pending.template));
            frame.instance_total += 1;
            let slot = frame.counts.entry(pending.template).or_insert((0, 0));
            slot.0 += 1;
            slot.1 += outcome.size as u64;
            return true;
        }
        self.reset_state(pending.template, true);
        pending.min_required == 0
    }

    fn absorb_suffix_separator(&mut self, cx: &AbsorbCx<'_>, frame: &mut AbsorbFrame) -> bool {
        let due = frame.instance_total > 0 && cx.separator.as_ref().is_some_and(|s| s.suffix);
        if !due {
            return true;
        }
        if self.absorb_separator(cx, frame) {
            return true;
        }
        // a missing suffix right at the end of the window is tolerated;
        // anywhere else it breaks the structure
        frame.cursor == cx.window.len() || !cx.csts.structure
    }

    fn absorb_pick_one(
        &mut self,
        cx: &AbsorbCx<'_>,
        frame: &mut AbsorbFrame,
        section: &Section,
    ) -> bool {
        let mut order: Vec<usize> = (0..section.entries.len()).collect();
        order.sort_by_key(|&i| Reverse(section.entries[i].weight));
        let mut zero_entry: Option<usize> = None;
        for i in order {
            let entry = &section.entries[i];
            let mark = frame.mark();
            let counts_before = frame.counts.get(&entry.node).copied();
            let before = frame.cursor;
            if self.absorb_entry(cx, frame, section, entry) {
                if frame.cursor > before {
                    return true;
                }
                // an empty match only wins if no other entry consumes
                if zero_entry.is_none() {
                    zero_entry = Some(i);
                }
                self.rollback_to(frame, mark);
                restore_count(frame, entry.node, counts_before);
            }
        }
        if let Some(i) = zero_entry {
            return self.absorb_entry(cx, frame, section, &section.entries[i]);
        }
        !cx.csts.structure
    }

    /// Shared scan for `UnorderedSet` (`adjacent`) and `FullyRandom`.
    /// Rounds run until no entry makes progress; an adjacent section
    /// exhausts an entry on first contact, a free one gives every entry
    /// a turn per round.
    fn absorb_unordered(
        &mut self,
        cx: &AbsorbCx<'_>,
        frame: &mut AbsorbFrame,
        section: &Section,
        adjacent: bool,
    ) -> bool {
        let n = section.entries.len();
        let mut done = vec![false; n];
        let mut counts = vec![0u64; n];
        let mut missing = vec![false; n];
        for (i, entry) in section.entries.iter().enumerate() {
            if matches!(self.existence_state(entry.node), ExistenceState::Missing) {
                frame.counts.entry(entry.node).or_insert((0, 0));
                done[i] = true;
                missing[i] = true;
            }
        }
        let mut attempts = 0u64;
        loop {
            let mut progressed = false;
            for (i, entry) in section.entries.iter().enumerate() {
                if done[i] {
                    continue;
                }
                let max = entry.qty.max.unwrap_or(u64::MAX);
                while counts[i] < max {
                    if attempts >= self.config.absorption.max_attempts {
                        done[i] = true;
                        break;
                    }
                    attempts += 1;
                    if !self.absorb_one_unordered(cx, frame, section, entry, counts[i]) {
                        if adjacent && counts[i] > 0 {
                            // adjacent instances ended, the entry is over
                            done[i] = true;
                        }
                        break;
                    }
                    counts[i] += 1;
                    progressed = true;
                    if !adjacent {
                        break;
                    }
                }
                if counts[i] >= max {
                    done[i] = true;
                }
            }
            if !progressed || done.iter().all(|&d| d) {
                break;
            }
        }
        if cx.csts.structure {
            for (i, entry) in section.entries.iter().enumerate() {
                if !missing[i] && counts[i] < entry.qty.min {
                    return false;
                }
            }
        }
        true
    }

    fn absorb_one_unordered(
        &mut self,
        cx: &AbsorbCx<'_>,
        frame: &mut AbsorbFrame,
        section: &Section,
        entry: &SubnodeRef,
        ordinal: u64,
    ) -> bool {
        let mark = frame.mark();
        if self.separator_due_abs(cx, frame) && !self.absorb_separator(cx, frame) {
            return false;
        }
        let node = if ordinal > 0 && section.unique {
            self.instance_clone(cx.nt, entry.node, ordinal)
        } else {
            entry.node
        };
        frame.touched.push(node);
        let child_csts = AbsorbConstraints {
            forced_size: self.synced_size_abs(entry.node),
            ..cx.csts
        };
        let rest = &cx.window[frame.cursor..];
        let outcome = self.absorb_node(node, rest, &child_csts);
        // out-of-order bytes belong to some other entry; gaps are never
        // claimed inside an unordered section
        if !outcome.is_success() || outcome.offset > 0 || outcome.size == 0 {
            self.rollback_to(frame, mark);
            return false;
        }
        frame.cursor += outcome.size;
        frame.placed.push(PlacedChild::instance(node, entry.node));
        frame.instance_total += 1;
        let slot = frame.counts.entry(entry.node).or_insert((0, 0));
        slot.0 += 1;
        slot.1 += outcome.size as u64;
        true
    }

    fn separator_due_abs(&self, cx: &AbsorbCx<'_>, frame: &AbsorbFrame) -> bool {
        match &cx.separator {
            Some(sep) => frame.instance_total > 0 || sep.prefix,
            None => false,
        }
    }

    fn absorb_separator(&mut self, cx: &AbsorbCx<'_>, frame: &mut AbsorbFrame) -> bool {
        let Some(sep) = cx.separator.clone() else {
            return true;
        };
        let mark = frame.mark();
        let node = if sep.unique && frame.separators_placed > 0 {
            self.instance_clone(cx.nt, sep.node, frame.separators_placed)
        } else {
            sep.node
        };
        frame.touched.push(node);
        let rest = &cx.window[frame.cursor..];
        let outcome = self.absorb_node(node, rest, &cx.csts);
        if outcome.is_success() && outcome.offset == 0 {
            frame.cursor += outcome.size;
            frame.placed.push(PlacedChild::separator(node));
            frame.separators_placed += 1;
            true
        } else {
            self.rollback_to(frame, mark);
            false
        }
    }

    /// Count imposed by a quantity sync during absorption. Counts
    /// already matched in this frame win over stale generation-side
    /// bookkeeping; corruption hooks do not apply when parsing.
    fn synced_qty_abs(&self, template: NodeId, frame: &AbsorbFrame) -> Option<u64> {
        let relation = self.node(template).internals().and_then(|i| {
            i.sync_relation(SyncScope::QuantityFrom)
                .or_else(|| i.sync_relation(SyncScope::Quantity))
        })?;
        match relation {
            SyncRelation::QtyFrom(sync) => {
                let value = self.node(sync.source).internals().and_then(|i| i.as_int())?;
                Some(value.saturating_add(sync.base_qty).max(0) as u64)
            }
            SyncRelation::Node(source) => frame
                .counts
                .get(source)
                .map(|c| c.0)
                .or_else(|| self.env.drawn_qty(*source)),
            _ => None,
        }
    }

    fn synced_size_abs(&self, template: NodeId) -> Option<u64> {
        let relation = self
            .node(template)
            .internals()
            .and_then(|i| i.sync_relation(SyncScope::Size))?;
        let SyncRelation::Size(sync) = relation else {
            return None;
        };
        let value = self.node(sync.source).internals().and_then(|i| i.as_int())?;
        Some(value.saturating_sub(sync.base_size).max(0) as u64)
    }
}

fn invert_existence(state: ExistenceState) -> ExistenceState {
    match state {
        ExistenceState::Exists => ExistenceState::Missing,
        ExistenceState::Missing => ExistenceState::Exists,
        ExistenceState::Deferred => ExistenceState::Deferred,
    }
}
