use std::cmp::Reverse;
use std::collections::HashSet;

use regex::Regex;

use crate::graph::ModelGraph;
use crate::id::NodeId;
use crate::node::{Attribute, CustoFlag, InternalsKind, InternalsVariant, NodeInternals};
use crate::sync::SyncScope;

/// Structural filter over a node's active configuration. Every listed
/// requirement must hold; empty lists are neutral.
#[derive(Debug, Clone, Default)]
pub struct InternalsCriteria {
    /// Attributes that must all be set.
    pub mandatory_attrs: Vec<Attribute>,
    /// Attributes that must all be clear.
    pub negative_attrs: Vec<Attribute>,
    /// Customization flags that must all be set.
    pub mandatory_custo: Vec<CustoFlag>,
    /// Customization flags that must all be clear.
    pub negative_custo: Vec<CustoFlag>,
    /// Allow-list of internals kinds; empty admits every kind.
    pub kinds: Vec<InternalsKind>,
    /// Allow-list of codec kinds (see [`crate::value::ValueCodec::kind`]);
    /// non-empty restricts matches to typed leaves.
    pub codec_kinds: Vec<&'static str>,
    /// Sync scopes a matching node must carry a relation for.
    pub required_sync: Vec<SyncScope>,
    /// Sync scopes a matching node must not carry a relation for.
    pub negative_sync: Vec<SyncScope>,
}

impl InternalsCriteria {
    pub fn matches(&self, internals: &NodeInternals) -> bool {
        if self.mandatory_attrs.iter().any(|&a| !internals.is_attr_set(a)) {
            return false;
        }
        if self.negative_attrs.iter().any(|&a| internals.is_attr_set(a)) {
            return false;
        }
        let custo = internals.custo();
        if self.mandatory_custo.iter().any(|&f| !custo.has(f)) {
            return false;
        }
        if self.negative_custo.iter().any(|&f| custo.has(f)) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&internals.kind()) {
            return false;
        }
        if !self.codec_kinds.is_empty()
            && !internals
                .codec()
                .is_some_and(|codec| self.codec_kinds.contains(&codec.kind()))
        {
            return false;
        }
        if self
            .required_sync
            .iter()
            .any(|&scope| internals.sync_relation(scope).is_none())
        {
            return false;
        }
        if self
            .negative_sync
            .iter()
            .any(|&scope| internals.sync_relation(scope).is_some())
        {
            return false;
        }
        true
    }
}

/// Filter over a node's semantic tags. Each non-empty set gates
/// independently.
#[derive(Debug, Clone, Default)]
pub struct SemanticsCriteria {
    /// Tags that must all be present.
    pub mandatory: Vec<String>,
    /// At least one of these tags must be present.
    pub one_of: Vec<String>,
    /// Exactly one of these tags must be present.
    pub exclusive: Vec<String>,
    /// Tags that must all be absent.
    pub negative: Vec<String>,
}

impl SemanticsCriteria {
    pub fn matches(&self, tags: &HashSet<String>) -> bool {
        if self.mandatory.iter().any(|tag| !tags.contains(tag)) {
            return false;
        }
        if !self.one_of.is_empty() && !self.one_of.iter().any(|tag| tags.contains(tag)) {
            return false;
        }
        if !self.exclusive.is_empty()
            && self.exclusive.iter().filter(|tag| tags.contains(*tag)).count() != 1
        {
            return false;
        }
        if self.negative.iter().any(|tag| tags.contains(tag)) {
            return false;
        }
        true
    }
}

/// Parameters for [`ModelGraph::reachable_nodes`]. The default query
/// matches every reachable node.
#[derive(Debug, Clone, Default)]
pub struct ReachableQuery {
    pub internals: Option<InternalsCriteria>,
    pub semantics: Option<SemanticsCriteria>,
    /// Matched against root-relative `a/b/c` paths; a node is admitted
    /// when at least one of its paths matches.
    pub path_regex: Option<Regex>,
    /// Walk depth below the root; defaults to the configured
    /// generation depth ceiling.
    pub max_depth: Option<u32>,
    /// Keep first-encountered order instead of sorting by fuzz weight
    /// and name.
    pub respect_order: bool,
}

impl ModelGraph {
    /// Depth-first selection of the nodes under `root` that satisfy
    /// `query`. Unless the query asks for structure order, nodes with
    /// a fuzz weight above one come first (heaviest first) and the
    /// rest follow alphabetically. An unknown root yields an empty
    /// result.
    pub fn reachable_nodes(&self, root: NodeId, query: &ReachableQuery) -> Vec<NodeId> {
        let cap = query.max_depth.unwrap_or(self.config.generation.max_depth);
        let mut included = Vec::new();
        let mut settled = HashSet::new();
        for (id, path) in self.paths_capped(root, cap) {
            if settled.contains(&id) {
                continue;
            }
            if let Some(regex) = &query.path_regex {
                if !regex.is_match(&path) {
                    // Another path to the same node may still match.
                    continue;
                }
            }
            if self.satisfies(id, query) {
                included.push(id);
            }
            settled.insert(id);
        }
        if query.respect_order {
            return included;
        }
        let mut heavy: Vec<NodeId> = included
            .iter()
            .copied()
            .filter(|&id| self.node(id).fuzz_weight() > 1)
            .collect();
        heavy.sort_by_key(|&id| Reverse(self.node(id).fuzz_weight()));
        let mut rest: Vec<NodeId> = included
            .into_iter()
            .filter(|&id| self.node(id).fuzz_weight() <= 1)
            .collect();
        rest.sort_by(|&a, &b| self.node(a).name().cmp(self.node(b).name()));
        heavy.extend(rest);
        heavy
    }

    /// All root-relative paths under `root`, one entry per (node,
    /// path) pair in structure order. Shared nodes show up once per
    /// path; cycles are cut.
    pub fn paths_from(&self, root: NodeId) -> Vec<(NodeId, String)> {
        self.paths_capped(root, self.config.generation.max_depth)
    }

    /// First root-relative path leading to `target`, in structure
    /// order.
    pub fn node_path(&self, root: NodeId, target: NodeId) -> Option<String> {
        self.paths_from(root)
            .into_iter()
            .find(|(id, _)| *id == target)
            .map(|(_, path)| path)
    }

    /// Resolves an exact `a/b/c` path to its node. Missing paths give
    /// `None`, never an error.
    pub fn find_by_path(&self, root: NodeId, path: &str) -> Option<NodeId> {
        self.paths_from(root)
            .into_iter()
            .find(|(_, candidate)| candidate == path)
            .map(|(id, _)| id)
    }

    fn paths_capped(&self, root: NodeId, max_depth: u32) -> Vec<(NodeId, String)> {
        let mut out = Vec::new();
        let Some(node) = self.try_node(root) else {
            return out;
        };
        let mut stack = Vec::new();
        self.paths_rec(root, node.name().to_string(), max_depth, &mut stack, &mut out);
        out
    }

    fn paths_rec(
        &self,
        id: NodeId,
        path: String,
        remaining: u32,
        stack: &mut Vec<NodeId>,
        out: &mut Vec<(NodeId, String)>,
    ) {
        if stack.contains(&id) {
            return;
        }
        out.push((id, path.clone()));
        if remaining == 0 {
            return;
        }
        stack.push(id);
        for child in self.structural_children(id) {
            if self.try_node(child).is_none() {
                continue;
            }
            let child_path = format!("{path}/{}", self.node(child).name());
            self.paths_rec(child, child_path, remaining - 1, stack, out);
        }
        stack.pop();
    }

    /// Children the walk descends into: expanded instances (or, before
    /// expansion, the grammar's templates and separator) for
    /// non-terminals, the produced subtree for generators. Function
    /// and generator arguments are inputs, not structure.
    fn structural_children(&self, id: NodeId) -> Vec<NodeId> {
        let Some(internals) = self.node(id).internals() else {
            return Vec::new();
        };
        match &internals.variant {
            InternalsVariant::NonTerm(payload) => match &payload.expanded {
                Some(placed) => placed.iter().map(|p| p.node).collect(),
                None => {
                    let mut nodes = payload.template_nodes();
                    if let Some(sep) = &payload.separator {
                        if !nodes.contains(&sep.node) {
                            nodes.push(sep.node);
                        }
                    }
                    nodes
                }
            },
            InternalsVariant::GenFunc { generated, .. } => generated.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    fn satisfies(&self, id: NodeId, query: &ReachableQuery) -> bool {
        let node = self.node(id);
        if let Some(criteria) = &query.internals {
            match node.internals() {
                Some(internals) if criteria.matches(internals) => {}
                _ => return false,
            }
        }
        if let Some(criteria) = &query.semantics {
            if !criteria.matches(node.semantics()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use regex::Regex;

    use super::*;
    use crate::nonterm::{QtySpec, Shape, SubnodeRef};
    use crate::sync::{SyncExistence, SyncRelation};
    use crate::value::{BytesValue, Endianness, UIntValue};

    fn rng(seed: u8) -> ChaCha8Rng {
        ChaCha8Rng::from_seed([seed; 32])
    }

    fn names<'g>(graph: &'g ModelGraph, ids: &[NodeId]) -> Vec<&'g str> {
        ids.iter().map(|&id| graph.node(id).name()).collect()
    }

    /// msg = kind, body; body = data, crc.
    fn message_model() -> (ModelGraph, [NodeId; 5]) {
        let mut graph = ModelGraph::new();
        let kind = graph.add_typed("kind", Box::new(BytesValue::new(["T1"])));
        let data = graph.add_typed("data", Box::new(BytesValue::new(["payload"])));
        let crc = graph.add_typed("crc", Box::new(BytesValue::new(["CC"])));
        let body = graph
            .add_nonterm(
                "body",
                vec![Shape::ordered(vec![
                    SubnodeRef::one(data),
                    SubnodeRef::one(crc),
                ])],
            )
            .unwrap();
        let msg = graph
            .add_nonterm(
                "msg",
                vec![Shape::ordered(vec![
                    SubnodeRef::one(kind),
                    SubnodeRef::one(body),
                ])],
            )
            .unwrap();
        (graph, [msg, kind, body, data, crc])
    }

    #[test]
    fn structure_order_is_a_preorder_walk() {
        let (graph, [msg, ..]) = message_model();
        let query = ReachableQuery {
            respect_order: true,
            ..Default::default()
        };
        let ids = graph.reachable_nodes(msg, &query);
        assert_eq!(names(&graph, &ids), ["msg", "kind", "body", "data", "crc"]);
    }

    #[test]
    fn default_order_puts_heavy_nodes_first_then_names() {
        let (mut graph, [msg, kind, _, _, crc]) = message_model();
        graph.set_fuzz_weight(crc, 5);
        graph.set_fuzz_weight(kind, 3);
        let ids = graph.reachable_nodes(msg, &ReachableQuery::default());
        assert_eq!(
            names(&graph, &ids),
            ["crc", "kind", "body", "data", "msg"],
            "weights above one lead (descending), the rest sort by name"
        );
    }

    #[test]
    fn attribute_criteria_filter_both_ways() {
        let (mut graph, [msg, _, _, data, _]) = message_model();
        graph.clear_attr(data, Attribute::Mutable, false);

        let mutable_only = ReachableQuery {
            internals: Some(InternalsCriteria {
                mandatory_attrs: vec![Attribute::Mutable],
                ..Default::default()
            }),
            ..Default::default()
        };
        let ids = graph.reachable_nodes(msg, &mutable_only);
        assert_eq!(names(&graph, &ids), ["body", "crc", "kind", "msg"]);

        let frozen_only = ReachableQuery {
            internals: Some(InternalsCriteria {
                negative_attrs: vec![Attribute::Mutable],
                ..Default::default()
            }),
            ..Default::default()
        };
        let ids = graph.reachable_nodes(msg, &frozen_only);
        assert_eq!(names(&graph, &ids), ["data"]);
    }

    #[test]
    fn kind_allow_list_selects_matching_internals() {
        let (graph, [msg, ..]) = message_model();
        let query = ReachableQuery {
            internals: Some(InternalsCriteria {
                kinds: vec![InternalsKind::NonTerm],
                ..Default::default()
            }),
            ..Default::default()
        };
        let ids = graph.reachable_nodes(msg, &query);
        assert_eq!(names(&graph, &ids), ["body", "msg"]);
    }

    #[test]
    fn codec_kind_refines_the_typed_allow_list() {
        let mut graph = ModelGraph::new();
        let tag = graph.add_typed("tag", Box::new(BytesValue::new(["T"])));
        let count = graph.add_typed(
            "count",
            Box::new(UIntValue::fixed(1, Endianness::Big, 7)),
        );
        let rec = graph
            .add_nonterm(
                "rec",
                vec![Shape::ordered(vec![
                    SubnodeRef::one(tag),
                    SubnodeRef::one(count),
                ])],
            )
            .unwrap();

        let query = ReachableQuery {
            internals: Some(InternalsCriteria {
                codec_kinds: vec!["uint"],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(names(&graph, &graph.reachable_nodes(rec, &query)), ["count"]);
    }

    #[test]
    fn sync_presence_criteria_find_the_synced_node() {
        let (mut graph, [msg, kind, _, data, _]) = message_model();
        graph
            .register_sync(
                data,
                SyncScope::Existence,
                SyncRelation::Existence(SyncExistence::single(kind, None)),
            )
            .unwrap();

        let with_existence = ReachableQuery {
            internals: Some(InternalsCriteria {
                required_sync: vec![SyncScope::Existence],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(names(&graph, &graph.reachable_nodes(msg, &with_existence)), ["data"]);

        let without = ReachableQuery {
            internals: Some(InternalsCriteria {
                negative_sync: vec![SyncScope::Existence],
                ..Default::default()
            }),
            ..Default::default()
        };
        let ids = graph.reachable_nodes(msg, &without);
        assert_eq!(names(&graph, &ids), ["body", "crc", "kind", "msg"]);
    }

    #[test]
    fn custo_criteria_follow_flag_changes() {
        let (mut graph, [msg, _, body, _, _]) = message_model();
        let query = ReachableQuery {
            internals: Some(InternalsCriteria {
                mandatory_custo: vec![CustoFlag::FrozenCopy],
                ..Default::default()
            }),
            ..Default::default()
        };
        let ids = graph.reachable_nodes(msg, &query);
        assert_eq!(
            names(&graph, &ids),
            ["body", "msg"],
            "non-terminals carry FrozenCopy by default"
        );

        graph.set_custo_flag(body, CustoFlag::FrozenCopy, false);
        let ids = graph.reachable_nodes(msg, &query);
        assert_eq!(names(&graph, &ids), ["msg"]);
    }

    #[test]
    fn semantics_criteria_gate_on_tag_sets() {
        let (mut graph, [msg, kind, _, data, crc]) = message_model();
        graph.set_semantics(kind, ["header", "id"]);
        graph.set_semantics(data, ["payload"]);
        graph.set_semantics(crc, ["checksum", "payload"]);

        let query = |criteria: SemanticsCriteria| ReachableQuery {
            semantics: Some(criteria),
            ..Default::default()
        };

        let mandatory = query(SemanticsCriteria {
            mandatory: vec!["payload".into()],
            ..Default::default()
        });
        assert_eq!(names(&graph, &graph.reachable_nodes(msg, &mandatory)), ["crc", "data"]);

        let one_of = query(SemanticsCriteria {
            one_of: vec!["header".into(), "checksum".into()],
            ..Default::default()
        });
        assert_eq!(names(&graph, &graph.reachable_nodes(msg, &one_of)), ["crc", "kind"]);

        let negative = query(SemanticsCriteria {
            negative: vec!["payload".into()],
            ..Default::default()
        });
        assert_eq!(
            names(&graph, &graph.reachable_nodes(msg, &negative)),
            ["body", "kind", "msg"],
            "untagged nodes pass a purely negative filter"
        );

        let exclusive = query(SemanticsCriteria {
            exclusive: vec!["checksum".into(), "payload".into()],
            ..Default::default()
        });
        assert_eq!(
            names(&graph, &graph.reachable_nodes(msg, &exclusive)),
            ["data"],
            "crc carries both tags, kind carries neither"
        );
    }

    #[test]
    fn path_regex_restricts_to_the_matching_subtree() {
        let (graph, [msg, ..]) = message_model();
        let query = ReachableQuery {
            path_regex: Some(Regex::new(r"^msg/body(/|$)").unwrap()),
            respect_order: true,
            ..Default::default()
        };
        let ids = graph.reachable_nodes(msg, &query);
        assert_eq!(names(&graph, &ids), ["body", "data", "crc"]);
    }

    #[test]
    fn max_depth_limits_the_walk() {
        let (graph, [msg, ..]) = message_model();
        let query = ReachableQuery {
            max_depth: Some(1),
            respect_order: true,
            ..Default::default()
        };
        let ids = graph.reachable_nodes(msg, &query);
        assert_eq!(names(&graph, &ids), ["msg", "kind", "body"]);
    }

    #[test]
    fn paths_follow_expanded_instances_after_freeze() {
        let mut graph = ModelGraph::new();
        let item = graph.add_typed("item", Box::new(BytesValue::new(["i"])));
        let list = graph
            .add_nonterm(
                "list",
                vec![Shape::ordered(vec![SubnodeRef::with_qty(
                    item,
                    QtySpec::fixed(2),
                )])],
            )
            .unwrap();
        graph.freeze(list, &mut rng(3));

        let clone = graph.find_by_path(list, "list/item:2");
        assert!(clone.is_some(), "second instance should be addressable");
        assert_eq!(
            graph.node_path(list, clone.unwrap()).as_deref(),
            Some("list/item:2")
        );
        assert_eq!(graph.find_by_path(list, "list/item"), Some(item));
    }

    #[test]
    fn generated_subtree_appears_once_produced() {
        let mut graph = ModelGraph::new();
        let maker = graph.add_genfunc(
            "maker",
            Arc::new(|graph: &mut ModelGraph, _args: &[NodeId]| {
                Ok(graph.add_typed("made", Box::new(BytesValue::new(["gen"]))))
            }),
            vec![],
        );
        let before = graph.reachable_nodes(maker, &ReachableQuery::default());
        assert_eq!(names(&graph, &before), ["maker"]);

        graph.freeze(maker, &mut rng(0));
        let after = graph.reachable_nodes(maker, &ReachableQuery::default());
        assert_eq!(names(&graph, &after), ["made", "maker"]);
        assert!(graph.find_by_path(maker, "maker/made").is_some());
    }

    #[test]
    fn missing_targets_yield_empty_results() {
        let (graph, [msg, ..]) = message_model();
        assert!(graph.reachable_nodes(NodeId(9999), &ReachableQuery::default()).is_empty());
        assert_eq!(graph.node_path(NodeId(9999), msg), None);
        assert_eq!(graph.node_path(msg, NodeId(9999)), None);
        assert_eq!(graph.find_by_path(msg, "msg/nope"), None);
    }
}
