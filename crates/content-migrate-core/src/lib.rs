//! Row transformation core for migrating content from a legacy relational
//! schema into a new one with freshly assigned identifiers.
//!
//! Everything here is row-at-a-time and free of I/O. Mapping lookups, legacy
//! extraction and destination writes go through the traits in [`interfaces`].

mod aggregate;
mod batch;
mod entity;
mod error;
mod hierarchy;
pub mod interfaces;
mod path;
mod pipeline;
mod plan;
mod profile;
mod record;
mod resolver;

pub use aggregate::{
    AttributeMap, EmbeddedReference, FieldOrder, FieldShape, SatelliteAggregator, ShapeKind,
};
pub use batch::{BatchRunner, EntityCounts, RunSummary};
pub use entity::{EntityTypeTag, IdentifierMapping, LegacyId, LinkId, NewId};
pub use error::MigrateError;
pub use hierarchy::{
    HierarchyColumns, HierarchyNode, HierarchyOutcome, HierarchyReconstructor, ResolvedHierarchy,
    TreeRef, MAX_TREE_DEPTH,
};
pub use interfaces::{
    Destination, IdMapStore, LegacyLink, NodeTypeLookup, ParentContentLookup, RowSource,
};
pub use path::{PathRewrite, PathRewriter, PathRule, PathTarget, Segment, PATH_RULES};
pub use pipeline::{
    ExtractedRow, RowOutcome, RowPipeline, RowStage, SkipReason, SkipSignal, TransformedRow,
};
pub use plan::{MigrationPlan, RowErrorPolicy, DEFAULT_MAX_PASSES, DEFAULT_ORDER};
pub use profile::{
    builtin_profiles, profile, EntityProfile, PathColumn, ReferencePolicy, ReferenceRule,
    ReferenceTarget,
};
pub use record::{
    CompositeFieldValue, LegacyRow, Record, SatelliteRecord, ScalarValue, SubValue, TARGET_ID_KEY,
};
pub use resolver::{IdResolver, MemoryIdMap, Resolution};
