//! Collaborator seams consumed and produced by the transformation core.
//!
//! The core never performs I/O itself. Extraction, mapping lookups, tree-table
//! joins and destination writes all go through these traits and are injected
//! when a [`crate::RowPipeline`] or [`crate::BatchRunner`] is constructed.
use crate::{
    EntityProfile, EntityTypeTag, FieldShape, LegacyId, LegacyRow, LinkId, MigrateError, NewId,
    SatelliteRecord, TransformedRow,
};

/// Read side of the persisted identifier map.
pub trait IdMapStore {
    /// Look up the new id recorded for `(entity_type, legacy_id)`.
    ///
    /// # Errors
    /// Returns [`MigrateError::Store`] when the backing store cannot be queried.
    /// A missing mapping is `Ok(None)`.
    fn lookup(
        &self,
        entity_type: EntityTypeTag,
        legacy_id: LegacyId,
    ) -> Result<Option<NewId>, MigrateError>;
}

impl<T: IdMapStore + ?Sized> IdMapStore for &T {
    fn lookup(
        &self,
        entity_type: EntityTypeTag,
        legacy_id: LegacyId,
    ) -> Result<Option<NewId>, MigrateError> {
        (**self).lookup(entity_type, legacy_id)
    }
}

/// One legacy outline link as stored in the menu/outline tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyLink {
    pub link_id: LinkId,
    pub parent_link_id: LinkId,
    /// Content entity attached to this link, if the link is not structural-only.
    pub entity_id: Option<LegacyId>,
}

/// Abstraction over the legacy tree-table join used to walk outline ancestors.
pub trait ParentContentLookup {
    /// # Errors
    /// Returns [`MigrateError::Extraction`] when the legacy store cannot be queried.
    fn link(&self, link_id: LinkId) -> Result<Option<LegacyLink>, MigrateError>;
}

/// Discovers the concrete node type of a legacy node id.
pub trait NodeTypeLookup {
    /// Returns `Ok(None)` when no legacy node has this id or its bundle is not migrated.
    ///
    /// # Errors
    /// Returns [`MigrateError::Extraction`] when the legacy store cannot be queried.
    fn node_type(&self, legacy_id: LegacyId) -> Result<Option<EntityTypeTag>, MigrateError>;
}

/// Generic row extraction service parameterized by an [`EntityProfile`].
pub trait RowSource {
    /// Base rows for one entity type, in the profile's extraction order.
    ///
    /// # Errors
    /// Returns [`MigrateError::Extraction`] on query failure.
    fn rows(&self, profile: &EntityProfile) -> Result<Vec<LegacyRow>, MigrateError>;

    /// Satellite records of one field for one parent entity.
    ///
    /// # Errors
    /// Returns [`MigrateError::Extraction`] on query failure.
    fn satellites(
        &self,
        shape: &FieldShape,
        parent: LegacyId,
    ) -> Result<Vec<SatelliteRecord>, MigrateError>;
}

/// Destination side: persists a transformed row and records its mapping.
pub trait Destination {
    /// Persist `row`, record `(entity_type, row.legacy_id) -> new id` in the
    /// identifier map, and return the new id.
    ///
    /// The persisted row must carry the assigned id wherever it refers to itself
    /// (see [`TransformedRow::assign_new_id`]).
    ///
    /// # Errors
    /// Returns [`MigrateError::Destination`] when the write fails.
    fn write(&self, entity_type: EntityTypeTag, row: &TransformedRow)
        -> Result<NewId, MigrateError>;
}
