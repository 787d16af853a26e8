use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::id::NodeId;
use crate::value::ValueCodec;

/// The node property a sync relation constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncScope {
    /// Instance count mirrors another node's drawn count.
    Quantity,
    /// Instance count is computed from another node's integer value.
    QuantityFrom,
    /// Byte length is tied to another node's integer value.
    Size,
    /// The node only exists when a condition over other nodes holds.
    Existence,
    /// The node only exists when the condition does not hold.
    Inexistence,
}

/// Predicate over another node's current value.
#[derive(Debug, Clone)]
pub enum ValueCondition {
    /// Matches when the raw byte value is one of `ok`.
    Raw { ok: Vec<Vec<u8>>, negated: bool },
    /// Matches when the integer reading is one of `ok`.
    Int { ok: Vec<i64>, negated: bool },
    /// Matches when every listed sub-field carries one of its allowed
    /// values. Only meaningful against bit-striped codecs.
    BitField {
        checks: Vec<(usize, Vec<u64>)>,
        negated: bool,
    },
}

impl ValueCondition {
    pub fn raw<I, B>(ok: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        ValueCondition::Raw {
            ok: ok.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn int<I>(ok: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        ValueCondition::Int {
            ok: ok.into_iter().collect(),
            negated: false,
        }
    }

    pub fn bitfield<I>(checks: I) -> Self
    where
        I: IntoIterator<Item = (usize, Vec<u64>)>,
    {
        ValueCondition::BitField {
            checks: checks.into_iter().collect(),
            negated: false,
        }
    }

    /// Inverts the condition.
    pub fn negate(mut self) -> Self {
        match &mut self {
            ValueCondition::Raw { negated, .. }
            | ValueCondition::Int { negated, .. }
            | ValueCondition::BitField { negated, .. } => *negated = !*negated,
        }
        self
    }

    /// Evaluates the condition against a source node's state. A source
    /// without a usable value never matches the base predicate (the
    /// negated form then holds).
    pub(crate) fn evaluate(
        &self,
        frozen: Option<&[u8]>,
        codec: Option<&dyn ValueCodec>,
    ) -> bool {
        let base = match self {
            ValueCondition::Raw { ok, .. } => {
                let value = frozen.or_else(|| codec.and_then(|c| c.current()));
                match value {
                    Some(value) => ok.iter().any(|candidate| candidate == value),
                    None => false,
                }
            }
            ValueCondition::Int { ok, .. } => match codec.and_then(|c| c.as_int()) {
                Some(value) => ok.contains(&value),
                None => false,
            },
            ValueCondition::BitField { checks, .. } => match codec {
                Some(codec) => checks.iter().all(|(idx, allowed)| {
                    codec
                        .subfield(*idx)
                        .is_some_and(|value| allowed.contains(&value))
                }),
                None => false,
            },
        };
        let negated = match self {
            ValueCondition::Raw { negated, .. }
            | ValueCondition::Int { negated, .. }
            | ValueCondition::BitField { negated, .. } => *negated,
        };
        base != negated
    }
}

/// `quantity = max(0, source_value + base_qty)`.
#[derive(Debug, Clone)]
pub struct SyncQtyFrom {
    pub source: NodeId,
    pub base_qty: i64,
}

impl SyncQtyFrom {
    pub fn new(source: NodeId, base_qty: i64) -> Self {
        Self { source, base_qty }
    }
}

/// `size = max(0, source_value - base_size)` when absorbing, and the
/// reverse write-back (`source_value = size + base_size`) when the
/// model is frozen.
#[derive(Debug, Clone)]
pub struct SyncSize {
    pub source: NodeId,
    pub base_size: i64,
    // TODO: honor this once an encoding layer exists; today raw and
    // encoded sizes coincide.
    pub apply_to_encoded_size: bool,
}

impl SyncSize {
    pub fn new(source: NodeId, base_size: i64) -> Self {
        Self {
            source,
            base_size,
            apply_to_encoded_size: false,
        }
    }
}

/// One source of an existence condition, optionally value-guarded.
/// Without a condition the clause holds when the source node is present
/// and enabled in the resolved tree.
#[derive(Debug, Clone)]
pub struct ExistenceClause {
    pub source: NodeId,
    pub condition: Option<ValueCondition>,
}

/// Multi-clause existence condition. `all_required` selects between
/// AND and OR over the clauses.
#[derive(Debug, Clone)]
pub struct SyncExistence {
    pub clauses: Vec<ExistenceClause>,
    pub all_required: bool,
}

impl SyncExistence {
    pub fn single(source: NodeId, condition: Option<ValueCondition>) -> Self {
        Self {
            clauses: vec![ExistenceClause { source, condition }],
            all_required: true,
        }
    }

    pub fn all<I>(clauses: I) -> Self
    where
        I: IntoIterator<Item = ExistenceClause>,
    {
        Self {
            clauses: clauses.into_iter().collect(),
            all_required: true,
        }
    }

    pub fn any<I>(clauses: I) -> Self
    where
        I: IntoIterator<Item = ExistenceClause>,
    {
        Self {
            clauses: clauses.into_iter().collect(),
            all_required: false,
        }
    }
}

/// How a synced node relates to its source(s). Which relations are
/// legal depends on the [`SyncScope`] they are registered under, see
/// [`SyncRelation::fits_scope`].
#[derive(Debug, Clone)]
pub enum SyncRelation {
    /// Plain reference to another node. Under `Quantity` it means
    /// "same drawn count"; under `Existence`/`Inexistence` it means
    /// "present iff the source is present" (or absent, respectively).
    Node(NodeId),
    QtyFrom(SyncQtyFrom),
    Size(SyncSize),
    Existence(SyncExistence),
}

impl SyncRelation {
    pub(crate) fn fits_scope(&self, scope: SyncScope) -> bool {
        matches!(
            (scope, self),
            (SyncScope::Quantity, SyncRelation::Node(_))
                | (SyncScope::QuantityFrom, SyncRelation::QtyFrom(_))
                | (SyncScope::Size, SyncRelation::Size(_))
                | (SyncScope::Existence, SyncRelation::Node(_))
                | (SyncScope::Existence, SyncRelation::Existence(_))
                | (SyncScope::Inexistence, SyncRelation::Node(_))
        )
    }

    /// All nodes this relation reads from.
    pub fn sources(&self) -> Vec<NodeId> {
        match self {
            SyncRelation::Node(id) => vec![*id],
            SyncRelation::QtyFrom(s) => vec![s.source],
            SyncRelation::Size(s) => vec![s.source],
            SyncRelation::Existence(s) => s.clauses.iter().map(|c| c.source).collect(),
        }
    }

    /// Rewrites source handles through a clone map, leaving handles
    /// outside the map untouched (they keep pointing at the original
    /// nodes).
    pub(crate) fn remap(&mut self, map: &HashMap<NodeId, NodeId>) {
        let remap_one = |id: &mut NodeId| {
            if let Some(new_id) = map.get(id) {
                *id = *new_id;
            }
        };
        match self {
            SyncRelation::Node(id) => remap_one(id),
            SyncRelation::QtyFrom(s) => remap_one(&mut s.source),
            SyncRelation::Size(s) => remap_one(&mut s.source),
            SyncRelation::Existence(s) => {
                for clause in &mut s.clauses {
                    remap_one(&mut clause.source);
                }
            }
        }
    }
}

/// Adjusts a derived count or size.
pub type QtyAdjuster = Arc<dyn Fn(u64) -> u64 + Send + Sync>;
/// Adjusts a quantity interval before an instance count is drawn.
pub type BoundsAdjuster = Arc<dyn Fn(u64, Option<u64>) -> (u64, Option<u64>) + Send + Sync>;

/// A corruption hook registered against one node. Hooks intercept
/// constraint resolution right where the constraint is applied, which
/// lets a fuzzing strategy produce "almost conforming" outputs.
#[derive(Clone)]
pub enum Corruption {
    /// Flip the evaluated existence decision.
    ExistCond,
    /// Rewrite a quantity derived through a `Quantity`/`QuantityFrom`
    /// sync.
    QtySync(QtyAdjuster),
    /// Rewrite a subnode's declared (min, max) interval.
    NodeQty(BoundsAdjuster),
    /// Rewrite a size derived through a `Size` sync.
    SizeSync(QtyAdjuster),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    ExistCond,
    QtySync,
    NodeQty,
    SizeSync,
}

impl Corruption {
    pub fn kind(&self) -> CorruptionKind {
        match self {
            Corruption::ExistCond => CorruptionKind::ExistCond,
            Corruption::QtySync(_) => CorruptionKind::QtySync,
            Corruption::NodeQty(_) => CorruptionKind::NodeQty,
            Corruption::SizeSync(_) => CorruptionKind::SizeSync,
        }
    }
}

impl fmt::Debug for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Corruption::{:?}", self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{AbsorbConstraints, AbsorbOutcome, Endianness, UIntValue};
    use crate::error::ModelError;
    use rand_core::RngCore;

    #[test]
    fn fits_scope_accepts_only_documented_combinations() {
        let node = SyncRelation::Node(NodeId(1));
        assert!(node.fits_scope(SyncScope::Quantity));
        assert!(node.fits_scope(SyncScope::Existence));
        assert!(node.fits_scope(SyncScope::Inexistence));
        assert!(!node.fits_scope(SyncScope::Size));

        let qty_from = SyncRelation::QtyFrom(SyncQtyFrom::new(NodeId(1), -1));
        assert!(qty_from.fits_scope(SyncScope::QuantityFrom));
        assert!(!qty_from.fits_scope(SyncScope::Quantity));

        let size = SyncRelation::Size(SyncSize::new(NodeId(1), 0));
        assert!(size.fits_scope(SyncScope::Size));
        assert!(!size.fits_scope(SyncScope::Existence));

        let exist = SyncRelation::Existence(SyncExistence::single(NodeId(1), None));
        assert!(exist.fits_scope(SyncScope::Existence));
        assert!(!exist.fits_scope(SyncScope::Inexistence));
    }

    #[test]
    fn raw_condition_matches_frozen_value() {
        let cond = ValueCondition::raw(["on", "ON"]);
        assert!(cond.evaluate(Some(b"on"), None));
        assert!(!cond.evaluate(Some(b"off"), None));
        assert!(!cond.evaluate(None, None), "no value means no match");

        let negated = ValueCondition::raw(["on"]).negate();
        assert!(!negated.evaluate(Some(b"on"), None));
        assert!(negated.evaluate(Some(b"off"), None));
        assert!(
            negated.evaluate(None, None),
            "negated condition holds when the source has no value"
        );
    }

    #[test]
    fn int_condition_reads_codec_integer() {
        let mut codec = UIntValue::new(1, Endianness::Big, vec![4]);
        assert!(codec.set_value(&[4]).is_ok());
        let cond = ValueCondition::int([4, 6]);
        assert!(cond.evaluate(None, Some(&codec as &dyn ValueCodec)));
        let cond = ValueCondition::int([5]);
        assert!(!cond.evaluate(None, Some(&codec as &dyn ValueCodec)));
    }

    #[derive(Debug, Clone)]
    struct StripedCodec;

    impl crate::value::ValueCodec for StripedCodec {
        fn kind(&self) -> &'static str {
            "striped"
        }
        fn produce(&mut self, _rng: &mut dyn RngCore) -> Vec<u8> {
            vec![0]
        }
        fn current(&self) -> Option<&[u8]> {
            None
        }
        fn set_value(&mut self, _value: &[u8]) -> Result<(), ModelError> {
            Ok(())
        }
        fn absorb(&mut self, _blob: &[u8], _csts: &AbsorbConstraints) -> AbsorbOutcome {
            AbsorbOutcome::rejected()
        }
        fn make_determinist(&mut self) {}
        fn make_random(&mut self) {}
        fn rewind(&mut self) {}
        fn is_exhausted(&self) -> bool {
            false
        }
        fn reset(&mut self) {}
        fn box_clone(&self) -> Box<dyn crate::value::ValueCodec> {
            Box::new(self.clone())
        }
        fn subfield(&self, idx: usize) -> Option<u64> {
            // Two sub-fields carrying 3 and 7.
            match idx {
                0 => Some(3),
                1 => Some(7),
                _ => None,
            }
        }
    }

    #[test]
    fn bitfield_condition_requires_every_listed_subfield() {
        let codec = StripedCodec;
        let cond = ValueCondition::bitfield([(0, vec![3]), (1, vec![6, 7])]);
        assert!(cond.evaluate(None, Some(&codec as &dyn ValueCodec)));
        let cond = ValueCondition::bitfield([(0, vec![3]), (1, vec![6])]);
        assert!(!cond.evaluate(None, Some(&codec as &dyn ValueCodec)));
        let cond = ValueCondition::bitfield([(9, vec![0])]);
        assert!(
            !cond.evaluate(None, Some(&codec as &dyn ValueCodec)),
            "unknown sub-field"
        );
    }

    #[test]
    fn remap_rewrites_only_mapped_sources() {
        let mut map = HashMap::new();
        map.insert(NodeId(1), NodeId(10));

        let mut rel = SyncRelation::Existence(SyncExistence::all([
            ExistenceClause {
                source: NodeId(1),
                condition: None,
            },
            ExistenceClause {
                source: NodeId(2),
                condition: None,
            },
        ]));
        rel.remap(&map);
        assert_eq!(rel.sources(), vec![NodeId(10), NodeId(2)]);
    }

    #[test]
    fn corruption_debug_shows_kind_only() {
        let hook = Corruption::QtySync(Arc::new(|qty| qty + 1));
        assert_eq!(format!("{:?}", hook), "Corruption::QtySync");
        assert_eq!(hook.kind(), CorruptionKind::QtySync);
    }
}
