pub mod config;
pub mod criteria;
pub mod env;
pub mod error;
pub mod graph;
pub mod id;
pub mod node;
pub mod nonterm;
pub mod sync;
pub mod value;

pub use config::{AbsorptionSettings, EngineConfig, GenerationSettings};
pub use criteria::{InternalsCriteria, ReachableQuery, SemanticsCriteria};
pub use env::{DJOB_PRIO_BOOKKEEPING, DJOB_PRIO_EXISTENCE, DJOB_PRIO_GENERATOR, Env};
pub use error::ModelError;
pub use graph::{CloneOptions, ModelGraph, UnfreezeOptions};
pub use id::{GroupId, NodeId};
pub use node::{
    Attribute, CustoFlag, Customization, FuncFn, GenFn, InternalsKind, Node, NodeInternals,
};
pub use nonterm::{Combinator, QtySpec, Section, Separator, Shape, SubnodeRef};
pub use sync::{
    Corruption, CorruptionKind, ExistenceClause, SyncExistence, SyncQtyFrom, SyncRelation,
    SyncScope, SyncSize, ValueCondition,
};
pub use value::{
    AbsorbConstraints, AbsorbOutcome, AbsorbStatus, BytesValue, Endianness, UIntValue, ValueCodec,
};
