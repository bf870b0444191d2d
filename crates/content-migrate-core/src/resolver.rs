use std::cell::RefCell;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{EntityTypeTag, IdMapStore, IdentifierMapping, LegacyId, MigrateError, NewId};

/// Outcome of resolving one legacy reference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", content = "new_id", rename_all = "snake_case")]
pub enum Resolution {
    Resolved(NewId),
    /// No mapping exists yet: the referenced entity has not been migrated.
    Unresolved,
}

impl Resolution {
    #[must_use]
    pub fn new_id(self) -> Option<NewId> {
        match self {
            Self::Resolved(id) => Some(id),
            Self::Unresolved => None,
        }
    }

    #[must_use]
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Optional-reference policy: an unresolved reference degrades to [`NewId::NONE`].
    #[must_use]
    pub fn or_none(self) -> NewId {
        self.new_id().unwrap_or(NewId::NONE)
    }
}

/// Typed, read-only view over an [`IdMapStore`].
#[derive(Clone, Copy)]
pub struct IdResolver<'a> {
    store: &'a dyn IdMapStore,
}

impl<'a> IdResolver<'a> {
    #[must_use]
    pub fn new(store: &'a dyn IdMapStore) -> Self {
        Self { store }
    }

    /// Resolve a legacy id to its destination id.
    ///
    /// [`LegacyId::NONE`] always resolves to [`NewId::NONE`] without touching the store.
    ///
    /// # Errors
    /// Propagates [`MigrateError::Store`] from the underlying store.
    pub fn resolve(
        &self,
        entity_type: EntityTypeTag,
        legacy_id: LegacyId,
    ) -> Result<Resolution, MigrateError> {
        if legacy_id.is_none() {
            return Ok(Resolution::Resolved(NewId::NONE));
        }

        Ok(match self.store.lookup(entity_type, legacy_id)? {
            Some(new_id) => Resolution::Resolved(new_id),
            None => Resolution::Unresolved,
        })
    }
}

/// In-memory, append-only identifier map.
///
/// Used for dry runs and tests; interior mutability lets one instance serve as
/// both the lookup side and the recording side of an in-process destination.
#[derive(Debug, Default)]
pub struct MemoryIdMap {
    entries: RefCell<BTreeMap<(EntityTypeTag, LegacyId), NewId>>,
}

impl MemoryIdMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one mapping.
    ///
    /// # Errors
    /// Returns [`MigrateError::Store`] for the reserved legacy id `0` or when a
    /// mapping for the same key already exists.
    pub fn insert(
        &self,
        entity_type: EntityTypeTag,
        legacy_id: LegacyId,
        new_id: NewId,
    ) -> Result<(), MigrateError> {
        if legacy_id.is_none() {
            return Err(MigrateError::Store(format!(
                "legacy id 0 is reserved and cannot be mapped ({entity_type})"
            )));
        }

        let mut entries = self.entries.borrow_mut();
        if entries.contains_key(&(entity_type, legacy_id)) {
            return Err(MigrateError::Store(format!(
                "mapping already exists for {entity_type}/{legacy_id}"
            )));
        }
        entries.insert((entity_type, legacy_id), new_id);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    #[must_use]
    pub fn mappings(&self) -> Vec<IdentifierMapping> {
        self.entries
            .borrow()
            .iter()
            .map(|(&(entity_type, legacy_id), &new_id)| IdentifierMapping {
                entity_type,
                legacy_id,
                new_id,
            })
            .collect()
    }
}

impl IdMapStore for MemoryIdMap {
    fn lookup(
        &self,
        entity_type: EntityTypeTag,
        legacy_id: LegacyId,
    ) -> Result<Option<NewId>, MigrateError> {
        Ok(self.entries.borrow().get(&(entity_type, legacy_id)).copied())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use proptest::prelude::*;

    use super::*;

    struct CountingStore {
        inner: MemoryIdMap,
        lookups: Cell<usize>,
    }

    impl IdMapStore for CountingStore {
        fn lookup(
            &self,
            entity_type: EntityTypeTag,
            legacy_id: LegacyId,
        ) -> Result<Option<NewId>, MigrateError> {
            self.lookups.set(self.lookups.get() + 1);
            self.inner.lookup(entity_type, legacy_id)
        }
    }

    struct FailingStore;

    impl IdMapStore for FailingStore {
        fn lookup(&self, _: EntityTypeTag, _: LegacyId) -> Result<Option<NewId>, MigrateError> {
            Err(MigrateError::Store("connection reset".to_string()))
        }
    }

    #[test]
    fn missing_mapping_is_unresolved_not_an_error() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        store.insert(EntityTypeTag::User, LegacyId(7), NewId(42))?;
        let resolver = IdResolver::new(&store);

        assert_eq!(
            resolver.resolve(EntityTypeTag::User, LegacyId(7))?,
            Resolution::Resolved(NewId(42))
        );
        assert_eq!(resolver.resolve(EntityTypeTag::User, LegacyId(8))?, Resolution::Unresolved);
        assert_eq!(resolver.resolve(EntityTypeTag::File, LegacyId(7))?, Resolution::Unresolved);
        Ok(())
    }

    #[test]
    fn store_failures_propagate() {
        let resolver = IdResolver::new(&FailingStore);
        let result = resolver.resolve(EntityTypeTag::File, LegacyId(3));
        assert!(matches!(result, Err(MigrateError::Store(_))));
    }

    #[test]
    fn memory_map_is_append_only() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        store.insert(EntityTypeTag::File, LegacyId(1), NewId(10))?;
        assert!(store.insert(EntityTypeTag::File, LegacyId(1), NewId(11)).is_err());
        assert!(store.insert(EntityTypeTag::File, LegacyId::NONE, NewId(12)).is_err());
        assert_eq!(store.lookup(EntityTypeTag::File, LegacyId(1))?, Some(NewId(10)));
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn optional_policy_degrades_to_none() {
        assert_eq!(Resolution::Unresolved.or_none(), NewId::NONE);
        assert_eq!(Resolution::Resolved(NewId(5)).or_none(), NewId(5));
    }

    proptest! {
        #[test]
        fn property_zero_resolves_to_zero_without_store_access(index in 0_usize..EntityTypeTag::ALL.len()) {
            let store = CountingStore { inner: MemoryIdMap::new(), lookups: Cell::new(0) };
            let resolver = IdResolver::new(&store);
            let resolved = resolver.resolve(EntityTypeTag::ALL[index], LegacyId::NONE);
            prop_assert_eq!(resolved, Ok(Resolution::Resolved(NewId::NONE)));
            prop_assert_eq!(store.lookups.get(), 0);
        }

        #[test]
        fn property_resolution_is_stable_once_mapped(legacy in 1_u32..10_000, new in 1_u32..10_000, later in 1_u32..10_000) {
            let store = MemoryIdMap::new();
            prop_assert!(store.insert(EntityTypeTag::NodeArticle, LegacyId(legacy), NewId(new)).is_ok());
            let first = IdResolver::new(&store).resolve(EntityTypeTag::NodeArticle, LegacyId(legacy));

            // Unrelated appends must not change an established resolution.
            if later != legacy {
                prop_assert!(store.insert(EntityTypeTag::NodeArticle, LegacyId(later), NewId(new + 1)).is_ok());
            }
            prop_assert!(store.insert(EntityTypeTag::NodeArticle, LegacyId(legacy), NewId(new + 2)).is_err());
            let second = IdResolver::new(&store).resolve(EntityTypeTag::NodeArticle, LegacyId(legacy));

            prop_assert_eq!(first.clone(), Ok(Resolution::Resolved(NewId(new))));
            prop_assert_eq!(first, second);
        }
    }
}
