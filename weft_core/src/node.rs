use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::ModelError;
use crate::graph::ModelGraph;
use crate::id::{GroupId, NodeId};
use crate::nonterm::NonTermPayload;
use crate::sync::{SyncRelation, SyncScope};
use crate::value::ValueCodec;

/// Name of the configuration every node starts on.
pub const DEFAULT_CONFIG: &str = "MAIN";

/// Behavioral switches carried by every node configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Value may be cached once computed.
    Freezable,
    /// Mutation strategies may touch this node.
    Mutable,
    /// Values are enumerated instead of drawn.
    Determinist,
    /// The value walk terminates and signals exhaustion.
    Finite,
    /// Marks automatically inserted separator nodes.
    Separator,
    /// Node contributes nothing while disabled.
    Disabled,
    /// During absorption the node may be deferred until a later
    /// sibling finds its own match, then claims the skipped bytes.
    AbsPostpone,
    /// Display/reporting hint, no engine semantics.
    Highlight,
}

/// Compact set of [`Attribute`] switches.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AttrFlags(u16);

impl AttrFlags {
    const ALL: [Attribute; 8] = [
        Attribute::Freezable,
        Attribute::Mutable,
        Attribute::Determinist,
        Attribute::Finite,
        Attribute::Separator,
        Attribute::Disabled,
        Attribute::AbsPostpone,
        Attribute::Highlight,
    ];

    fn bit(attr: Attribute) -> u16 {
        1 << (attr as u16)
    }

    pub fn empty() -> Self {
        AttrFlags(0)
    }

    /// Freezable and Mutable, the switches every fresh node carries.
    pub fn defaults() -> Self {
        AttrFlags::empty()
            .with(Attribute::Freezable)
            .with(Attribute::Mutable)
    }

    pub fn with(mut self, attr: Attribute) -> Self {
        self.set(attr);
        self
    }

    pub fn set(&mut self, attr: Attribute) {
        self.0 |= Self::bit(attr);
    }

    pub fn clear(&mut self, attr: Attribute) {
        self.0 &= !Self::bit(attr);
    }

    pub fn has(&self, attr: Attribute) -> bool {
        self.0 & Self::bit(attr) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Attribute> + '_ {
        Self::ALL.into_iter().filter(|attr| self.has(*attr))
    }
}

impl fmt::Debug for AttrFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Per-kind behavior refinements. Unlike [`Attribute`]s these only
/// matter for specific internals kinds; unrelated flags are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CustoFlag {
    /// Non-terminal: instance clones stay mutable.
    MutableClone,
    /// Non-terminal: cloning the node copies its frozen state unless
    /// the clone call explicitly discards it.
    FrozenCopy,
    /// Non-terminal: instance clones restart their own value cycles.
    CycleClone,
    /// Generator: switching this node's configuration forwards the
    /// switch to the generated node.
    ForwardConfChange,
    /// Function/generator: cloning pulls argument nodes living outside
    /// the cloned subtree into the clone.
    CloneExtNodeArgs,
    /// Generator: unfreezing discards the generated node so the next
    /// freeze generates afresh.
    ResetOnUnfreeze,
    /// Generator: generation is deferred until the enclosing expansion
    /// settled (runs in the delayed-job phase).
    TriggerLast,
}

/// Compact set of [`CustoFlag`] switches.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Customization(u16);

impl Customization {
    const ALL: [CustoFlag; 7] = [
        CustoFlag::MutableClone,
        CustoFlag::FrozenCopy,
        CustoFlag::CycleClone,
        CustoFlag::ForwardConfChange,
        CustoFlag::CloneExtNodeArgs,
        CustoFlag::ResetOnUnfreeze,
        CustoFlag::TriggerLast,
    ];

    fn bit(flag: CustoFlag) -> u16 {
        1 << (flag as u16)
    }

    pub fn empty() -> Self {
        Customization(0)
    }

    pub fn nonterm_defaults() -> Self {
        Customization::empty()
            .with(CustoFlag::MutableClone)
            .with(CustoFlag::FrozenCopy)
    }

    pub fn genfunc_defaults() -> Self {
        Customization::empty()
            .with(CustoFlag::ForwardConfChange)
            .with(CustoFlag::ResetOnUnfreeze)
    }

    pub fn with(mut self, flag: CustoFlag) -> Self {
        self.set(flag);
        self
    }

    pub fn set(&mut self, flag: CustoFlag) {
        self.0 |= Self::bit(flag);
    }

    pub fn clear(&mut self, flag: CustoFlag) {
        self.0 &= !Self::bit(flag);
    }

    pub fn has(&self, flag: CustoFlag) -> bool {
        self.0 & Self::bit(flag) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = CustoFlag> + '_ {
        Self::ALL.into_iter().filter(|flag| self.has(*flag))
    }
}

impl fmt::Debug for Customization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Discriminant of [`InternalsVariant`], used by selection criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalsKind {
    Empty,
    Typed,
    Func,
    GenFunc,
    NonTerm,
}

impl InternalsKind {
    pub fn label(&self) -> &'static str {
        match self {
            InternalsKind::Empty => "empty",
            InternalsKind::Typed => "typed value",
            InternalsKind::Func => "function",
            InternalsKind::GenFunc => "generator",
            InternalsKind::NonTerm => "non-terminal",
        }
    }
}

/// Value transformation over the frozen values of argument nodes.
pub type FuncFn = Arc<dyn Fn(&[Vec<u8>]) -> Result<Vec<u8>, anyhow::Error> + Send + Sync>;

/// Node factory invoked at freeze time. Receives the owning graph so
/// it can build arbitrary subtrees, and the argument handles.
pub type GenFn =
    Arc<dyn Fn(&mut ModelGraph, &[NodeId]) -> Result<NodeId, anyhow::Error> + Send + Sync>;

/// The closed set of node contents.
#[derive(Clone)]
pub enum InternalsVariant {
    /// Declared but contentless; contributes nothing when frozen.
    Empty,
    /// Terminal leaf owning a value codec.
    Typed { codec: Box<dyn ValueCodec> },
    /// Value computed from other nodes' frozen values.
    Func { func: FuncFn, args: Vec<NodeId> },
    /// Subtree computed on demand; `generated` caches the produced
    /// root between freezes.
    GenFunc {
        generator: GenFn,
        args: Vec<NodeId>,
        generated: Option<NodeId>,
    },
    /// Recursive composition via a shape grammar.
    NonTerm(NonTermPayload),
}

impl fmt::Debug for InternalsVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InternalsVariant::Empty => f.write_str("Empty"),
            InternalsVariant::Typed { codec } => {
                f.debug_struct("Typed").field("codec", codec).finish()
            }
            InternalsVariant::Func { args, .. } => f
                .debug_struct("Func")
                .field("args", args)
                .finish_non_exhaustive(),
            InternalsVariant::GenFunc {
                args, generated, ..
            } => f
                .debug_struct("GenFunc")
                .field("args", args)
                .field("generated", generated)
                .finish_non_exhaustive(),
            InternalsVariant::NonTerm(payload) => {
                f.debug_tuple("NonTerm").field(payload).finish()
            }
        }
    }
}

/// One configuration of a node: its contents plus everything that
/// modulates how the contents behave.
#[derive(Debug, Clone)]
pub struct NodeInternals {
    pub(crate) attrs: AttrFlags,
    pub(crate) custo: Customization,
    pub(crate) sync: HashMap<SyncScope, SyncRelation>,
    pub(crate) frozen: Option<Vec<u8>>,
    pub(crate) variant: InternalsVariant,
}

impl NodeInternals {
    fn with_variant(variant: InternalsVariant, custo: Customization) -> Self {
        Self {
            attrs: AttrFlags::defaults(),
            custo,
            sync: HashMap::new(),
            frozen: None,
            variant,
        }
    }

    pub fn empty() -> Self {
        Self::with_variant(InternalsVariant::Empty, Customization::empty())
    }

    pub fn typed(codec: Box<dyn ValueCodec>) -> Self {
        Self::with_variant(InternalsVariant::Typed { codec }, Customization::empty())
    }

    pub fn func(func: FuncFn, args: Vec<NodeId>) -> Self {
        Self::with_variant(
            InternalsVariant::Func { func, args },
            Customization::empty(),
        )
    }

    pub fn genfunc(generator: GenFn, args: Vec<NodeId>) -> Self {
        Self::with_variant(
            InternalsVariant::GenFunc {
                generator,
                args,
                generated: None,
            },
            Customization::genfunc_defaults(),
        )
    }

    pub fn nonterm(payload: NonTermPayload) -> Self {
        Self::with_variant(
            InternalsVariant::NonTerm(payload),
            Customization::nonterm_defaults(),
        )
    }

    pub fn kind(&self) -> InternalsKind {
        match self.variant {
            InternalsVariant::Empty => InternalsKind::Empty,
            InternalsVariant::Typed { .. } => InternalsKind::Typed,
            InternalsVariant::Func { .. } => InternalsKind::Func,
            InternalsVariant::GenFunc { .. } => InternalsKind::GenFunc,
            InternalsVariant::NonTerm(_) => InternalsKind::NonTerm,
        }
    }

    pub fn attrs(&self) -> AttrFlags {
        self.attrs
    }

    pub fn custo(&self) -> Customization {
        self.custo
    }

    pub fn custo_mut(&mut self) -> &mut Customization {
        &mut self.custo
    }

    pub fn is_attr_set(&self, attr: Attribute) -> bool {
        self.attrs.has(attr)
    }

    /// Flips an attribute on. Determinism toggles are forwarded to the
    /// codec so the walk mode stays coherent.
    pub fn set_attr(&mut self, attr: Attribute) {
        self.attrs.set(attr);
        if attr == Attribute::Determinist {
            if let Some(codec) = self.codec_mut() {
                codec.make_determinist();
            }
        }
    }

    pub fn clear_attr(&mut self, attr: Attribute) {
        self.attrs.clear(attr);
        if attr == Attribute::Determinist {
            if let Some(codec) = self.codec_mut() {
                codec.make_random();
            }
        }
    }

    pub fn frozen(&self) -> Option<&[u8]> {
        self.frozen.as_deref()
    }

    pub(crate) fn set_frozen(&mut self, value: Vec<u8>) {
        self.frozen = Some(value);
    }

    pub(crate) fn clear_frozen(&mut self) {
        self.frozen = None;
    }

    pub fn sync_relation(&self, scope: SyncScope) -> Option<&SyncRelation> {
        self.sync.get(&scope)
    }

    pub(crate) fn set_sync(
        &mut self,
        scope: SyncScope,
        relation: SyncRelation,
    ) -> Result<(), ModelError> {
        if !relation.fits_scope(scope) {
            return Err(ModelError::UnsupportedSyncRelation { scope });
        }
        self.sync.insert(scope, relation);
        Ok(())
    }

    pub fn codec(&self) -> Option<&dyn ValueCodec> {
        match &self.variant {
            InternalsVariant::Typed { codec } => Some(codec.as_ref()),
            _ => None,
        }
    }

    pub fn codec_mut(&mut self) -> Option<&mut (dyn ValueCodec + 'static)> {
        match &mut self.variant {
            InternalsVariant::Typed { codec } => Some(codec.as_mut()),
            _ => None,
        }
    }

    pub fn nonterm_payload(&self) -> Option<&NonTermPayload> {
        match &self.variant {
            InternalsVariant::NonTerm(payload) => Some(payload),
            _ => None,
        }
    }

    pub(crate) fn nonterm_payload_mut(&mut self) -> Option<&mut NonTermPayload> {
        match &mut self.variant {
            InternalsVariant::NonTerm(payload) => Some(payload),
            _ => None,
        }
    }

    pub fn args(&self) -> Option<&[NodeId]> {
        match &self.variant {
            InternalsVariant::Func { args, .. } | InternalsVariant::GenFunc { args, .. } => {
                Some(args)
            }
            _ => None,
        }
    }

    /// Integer reading of the current value, when the contents expose
    /// one.
    pub fn as_int(&self) -> Option<i64> {
        self.codec().and_then(|codec| codec.as_int())
    }
}

/// A node of the data model. Everything behavioral lives in the
/// per-configuration [`NodeInternals`]; the node itself carries only
/// identity-level state (name, semantics, entanglement membership,
/// fuzzing weight).
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) configs: HashMap<String, NodeInternals>,
    pub(crate) current: String,
    pub(crate) group: Option<GroupId>,
    pub(crate) fuzz_weight: u8,
    pub(crate) depth: Option<u32>,
    pub(crate) semantics: HashSet<String>,
}

impl Node {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            configs: HashMap::new(),
            current: DEFAULT_CONFIG.to_string(),
            group: None,
            fuzz_weight: 1,
            depth: None,
            semantics: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn current_config(&self) -> &str {
        &self.current
    }

    pub fn config_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.configs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn has_config(&self, config: &str) -> bool {
        self.configs.contains_key(config)
    }

    /// Internals of the active configuration. `None` while the node
    /// has only been declared.
    pub fn internals(&self) -> Option<&NodeInternals> {
        self.configs.get(&self.current)
    }

    pub fn internals_mut(&mut self) -> Option<&mut NodeInternals> {
        self.configs.get_mut(&self.current)
    }

    pub fn internals_for(&self, config: &str) -> Option<&NodeInternals> {
        self.configs.get(config)
    }

    pub(crate) fn set_internals(&mut self, config: impl Into<String>, internals: NodeInternals) {
        self.configs.insert(config.into(), internals);
    }

    pub fn kind(&self) -> Option<InternalsKind> {
        self.internals().map(NodeInternals::kind)
    }

    pub fn semantics(&self) -> &HashSet<String> {
        &self.semantics
    }

    pub fn fuzz_weight(&self) -> u8 {
        self.fuzz_weight
    }

    /// Depth below the last frozen root, refreshed during resolution.
    pub fn depth(&self) -> Option<u32> {
        self.depth
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::BytesValue;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    #[test]
    fn attr_flags_default_to_freezable_and_mutable() {
        let flags = AttrFlags::defaults();
        assert!(flags.has(Attribute::Freezable));
        assert!(flags.has(Attribute::Mutable));
        assert!(!flags.has(Attribute::Determinist));
        assert_eq!(flags.iter().count(), 2);
    }

    #[test]
    fn attr_flags_set_and_clear_are_independent() {
        let mut flags = AttrFlags::empty();
        flags.set(Attribute::Disabled);
        flags.set(Attribute::Separator);
        flags.clear(Attribute::Disabled);
        assert!(!flags.has(Attribute::Disabled));
        assert!(flags.has(Attribute::Separator));
    }

    #[test]
    fn custo_defaults_differ_per_kind() {
        let nonterm = NodeInternals::nonterm(NonTermPayload::default());
        assert!(nonterm.custo().has(CustoFlag::MutableClone));
        assert!(nonterm.custo().has(CustoFlag::FrozenCopy));
        assert!(!nonterm.custo().has(CustoFlag::TriggerLast));

        let empty = NodeInternals::empty();
        assert_eq!(empty.custo().iter().count(), 0);
    }

    #[test]
    fn determinist_attr_reaches_the_codec() {
        let mut internals = NodeInternals::typed(Box::new(BytesValue::new(["a", "b"])));
        internals.clear_attr(Attribute::Determinist);

        let mut rng = ChaCha8Rng::from_seed([3u8; 32]);
        // Random mode may repeat; determinist mode must alternate.
        internals.set_attr(Attribute::Determinist);
        let codec = internals.codec_mut().unwrap();
        assert_eq!(codec.produce(&mut rng), b"a");
        assert_eq!(codec.produce(&mut rng), b"b");
    }

    #[test]
    fn sync_registration_rejects_scope_mismatch() {
        let mut internals = NodeInternals::empty();
        let err = internals
            .set_sync(
                SyncScope::Size,
                SyncRelation::Node(crate::id::NodeId(1)),
            )
            .unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedSyncRelation { .. }));

        internals
            .set_sync(
                SyncScope::Quantity,
                SyncRelation::Node(crate::id::NodeId(1)),
            )
            .unwrap();
        assert!(internals.sync_relation(SyncScope::Quantity).is_some());
    }

    #[test]
    fn node_starts_on_main_with_no_internals() {
        let node = Node::new("field");
        assert_eq!(node.current_config(), DEFAULT_CONFIG);
        assert!(node.internals().is_none());
        assert_eq!(node.fuzz_weight(), 1);
    }
}
