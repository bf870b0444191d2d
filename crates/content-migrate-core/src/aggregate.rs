use serde::{Deserialize, Serialize};

use crate::{
    CompositeFieldValue, EntityTypeTag, IdResolver, LegacyId, MigrateError, Resolution,
    SatelliteRecord, ScalarValue, SubValue, TARGET_ID_KEY,
};

/// Declares how the satellite records of one field fold into a [`CompositeFieldValue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldShape {
    /// Destination field name.
    pub field: String,
    /// Legacy satellite query; binds the parent's legacy id as `:parent`.
    pub query: String,
    pub kind: ShapeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeKind {
    /// One sub-value per satellite record.
    Structured {
        attributes: Vec<AttributeMap>,
        reference: Option<EmbeddedReference>,
        order: FieldOrder,
    },
    /// One or more records each carrying a delimiter-joined id list in `column`.
    MergedIdList { column: String, delimiter: char, entity_type: EntityTypeTag },
}

/// Copies satellite column `column` into sub-value key `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMap {
    pub column: String,
    pub key: String,
}

/// A satellite column holding a legacy id that must be resolved before emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedReference {
    pub column: String,
    pub key: String,
    pub entity_type: EntityTypeTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "order", rename_all = "snake_case")]
pub enum FieldOrder {
    /// Output follows extraction order; it carries no business meaning.
    Extraction,
    /// Output is stably sorted by an explicit sequence column.
    Sequence { column: String },
}

impl FieldShape {
    #[must_use]
    pub fn structured(field: &str, query: &str) -> Self {
        Self {
            field: field.to_string(),
            query: query.to_string(),
            kind: ShapeKind::Structured {
                attributes: Vec::new(),
                reference: None,
                order: FieldOrder::Extraction,
            },
        }
    }

    #[must_use]
    pub fn merged(field: &str, query: &str, column: &str, entity_type: EntityTypeTag) -> Self {
        Self {
            field: field.to_string(),
            query: query.to_string(),
            kind: ShapeKind::MergedIdList { column: column.to_string(), delimiter: ',', entity_type },
        }
    }

    /// Adds `column -> key` to a structured shape. No-op on merged shapes.
    #[must_use]
    pub fn attribute(mut self, column: &str, key: &str) -> Self {
        if let ShapeKind::Structured { attributes, .. } = &mut self.kind {
            attributes.push(AttributeMap { column: column.to_string(), key: key.to_string() });
        }
        self
    }

    #[must_use]
    pub fn reference(mut self, column: &str, entity_type: EntityTypeTag) -> Self {
        if let ShapeKind::Structured { reference, .. } = &mut self.kind {
            *reference = Some(EmbeddedReference {
                column: column.to_string(),
                key: TARGET_ID_KEY.to_string(),
                entity_type,
            });
        }
        self
    }

    #[must_use]
    pub fn ordered_by(mut self, column: &str) -> Self {
        if let ShapeKind::Structured { order, .. } = &mut self.kind {
            *order = FieldOrder::Sequence { column: column.to_string() };
        }
        self
    }

    /// Entity type this field's embedded references point at, if any.
    #[must_use]
    pub fn target_type(&self) -> Option<EntityTypeTag> {
        match &self.kind {
            ShapeKind::Structured { reference, .. } => {
                reference.as_ref().map(|reference| reference.entity_type)
            }
            ShapeKind::MergedIdList { entity_type, .. } => Some(*entity_type),
        }
    }
}

/// Folds satellite records into composite field values.
#[derive(Clone, Copy)]
pub struct SatelliteAggregator<'a> {
    resolver: IdResolver<'a>,
}

impl<'a> SatelliteAggregator<'a> {
    #[must_use]
    pub fn new(resolver: IdResolver<'a>) -> Self {
        Self { resolver }
    }

    /// Aggregate `records` (all belonging to `parent`) according to `shape`.
    ///
    /// Sub-values whose embedded reference is `0` or not yet migrated are
    /// dropped, so the output never holds more items than there are input
    /// references.
    ///
    /// # Errors
    /// Propagates identifier map failures. Unresolved references are not errors.
    pub fn aggregate(
        &self,
        parent: LegacyId,
        records: &[SatelliteRecord],
        shape: &FieldShape,
    ) -> Result<CompositeFieldValue, MigrateError> {
        match &shape.kind {
            ShapeKind::Structured { attributes, reference, order } => self.aggregate_structured(
                parent,
                records,
                &shape.field,
                attributes,
                reference.as_ref(),
                order,
            ),
            ShapeKind::MergedIdList { column, delimiter, entity_type } => {
                self.aggregate_merged(parent, records, &shape.field, column, *delimiter, *entity_type)
            }
        }
    }

    fn aggregate_structured(
        &self,
        parent: LegacyId,
        records: &[SatelliteRecord],
        field: &str,
        attributes: &[AttributeMap],
        reference: Option<&EmbeddedReference>,
        order: &FieldOrder,
    ) -> Result<CompositeFieldValue, MigrateError> {
        let mut ordered: Vec<&SatelliteRecord> = records.iter().collect();
        if let FieldOrder::Sequence { column } = order {
            // NULL or missing sequence values sort after every numbered record.
            ordered.sort_by_key(|record| {
                record.get(column).and_then(ScalarValue::as_i64).unwrap_or(i64::MAX)
            });
        }

        let mut value = CompositeFieldValue::new();
        let mut dropped = 0_usize;
        for record in ordered {
            let mut item: SubValue = attributes
                .iter()
                .map(|attribute| {
                    let scalar = record.get(&attribute.column).cloned().unwrap_or(ScalarValue::Null);
                    (attribute.key.clone(), scalar)
                })
                .collect();

            if let Some(reference) = reference {
                let Some(legacy_id) = embedded_id(record, &reference.column) else {
                    dropped += 1;
                    continue;
                };
                match self.resolver.resolve(reference.entity_type, legacy_id)? {
                    Resolution::Resolved(new_id) if !new_id.is_none() => {
                        item.insert(reference.key.clone(), new_id.into());
                    }
                    _ => {
                        dropped += 1;
                        continue;
                    }
                }
            }

            value.push(item);
        }

        log_dropped(parent, field, dropped);
        Ok(value)
    }

    fn aggregate_merged(
        &self,
        parent: LegacyId,
        records: &[SatelliteRecord],
        field: &str,
        column: &str,
        delimiter: char,
        entity_type: EntityTypeTag,
    ) -> Result<CompositeFieldValue, MigrateError> {
        let mut value = CompositeFieldValue::new();
        let mut dropped = 0_usize;

        for legacy_id in records.iter().flat_map(|record| split_merged(record.get(column), delimiter))
        {
            let Some(legacy_id) = legacy_id else {
                dropped += 1;
                continue;
            };
            match self.resolver.resolve(entity_type, legacy_id)? {
                Resolution::Resolved(new_id) if !new_id.is_none() => {
                    value.push(SubValue::from([(TARGET_ID_KEY.to_string(), new_id.into())]));
                }
                _ => dropped += 1,
            }
        }

        log_dropped(parent, field, dropped);
        Ok(value)
    }
}

/// Reads an embedded reference column; `None` for null, zero or unreadable ids.
fn embedded_id(record: &SatelliteRecord, column: &str) -> Option<LegacyId> {
    record.id(column).ok().filter(|id| !id.is_none())
}

/// Splits one legacy merged value into ids.
///
/// Null yields nothing. Empty tokens are skipped; unparsable or zero tokens
/// yield `None` so the caller can count them as dropped.
fn split_merged(value: Option<&ScalarValue>, delimiter: char) -> Vec<Option<LegacyId>> {
    match value {
        None | Some(ScalarValue::Null) => Vec::new(),
        Some(ScalarValue::Integer(raw)) => {
            vec![u32::try_from(*raw).ok().map(LegacyId).filter(|id| !id.is_none())]
        }
        Some(ScalarValue::Text(raw)) => raw
            .split(delimiter)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| {
                let parsed = token.parse::<LegacyId>().ok().filter(|id| !id.is_none());
                if parsed.is_none() {
                    tracing::warn!(token, "ignoring malformed id in merged value");
                }
                parsed
            })
            .collect(),
        Some(ScalarValue::Real(raw)) => {
            tracing::warn!(value = raw, "ignoring non-integer merged value");
            vec![None]
        }
    }
}

fn log_dropped(parent: LegacyId, field: &str, dropped: usize) {
    if dropped > 0 {
        tracing::debug!(
            parent = parent.0,
            field,
            dropped,
            "dropped satellite sub-values with unavailable references"
        );
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{MemoryIdMap, NewId, Record};

    fn tag_shape() -> FieldShape {
        FieldShape::merged("field_tags", "SELECT 1", "tids", EntityTypeTag::TaxonomyTerm)
    }

    fn image_shape() -> FieldShape {
        FieldShape::structured("field_image", "SELECT 1")
            .attribute("alt", "alt")
            .attribute("title", "title")
            .reference("fid", EntityTypeTag::File)
            .ordered_by("delta")
    }

    fn ids(value: &CompositeFieldValue) -> Vec<u32> {
        value.target_ids()
    }

    #[test]
    fn merged_tags_drop_each_unresolved_occurrence() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        store.insert(EntityTypeTag::TaxonomyTerm, LegacyId(4), NewId(1))?;
        store.insert(EntityTypeTag::TaxonomyTerm, LegacyId(12), NewId(3))?;
        let aggregator = SatelliteAggregator::new(IdResolver::new(&store));

        let records = vec![Record::new().with("tids", "4,7,7,12")];
        let value = aggregator.aggregate(LegacyId(1), &records, &tag_shape())?;
        assert_eq!(ids(&value), vec![1, 3]);
        Ok(())
    }

    #[test]
    fn resolved_duplicates_are_preserved() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        store.insert(EntityTypeTag::TaxonomyTerm, LegacyId(4), NewId(1))?;
        let aggregator = SatelliteAggregator::new(IdResolver::new(&store));

        let records = vec![Record::new().with("tids", " 4, ,4,oops,0")];
        let value = aggregator.aggregate(LegacyId(1), &records, &tag_shape())?;
        assert_eq!(ids(&value), vec![1, 1]);
        Ok(())
    }

    #[test]
    fn null_or_absent_merged_value_is_empty() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        let aggregator = SatelliteAggregator::new(IdResolver::new(&store));

        let null_row = vec![Record::new().with("tids", ScalarValue::Null)];
        assert!(aggregator.aggregate(LegacyId(1), &null_row, &tag_shape())?.is_empty());
        assert!(aggregator.aggregate(LegacyId(1), &[], &tag_shape())?.is_empty());
        assert!(aggregator.aggregate(LegacyId(1), &[], &image_shape())?.is_empty());
        Ok(())
    }

    #[test]
    fn images_keep_attributes_and_sequence_order() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        store.insert(EntityTypeTag::File, LegacyId(30), NewId(300))?;
        store.insert(EntityTypeTag::File, LegacyId(31), NewId(310))?;
        let aggregator = SatelliteAggregator::new(IdResolver::new(&store));

        let records = vec![
            Record::new().with("delta", 1_i64).with("fid", 31_i64).with("alt", "second"),
            Record::new().with("delta", 2_i64).with("fid", 99_i64).with("alt", "unmigrated"),
            Record::new().with("delta", 0_i64).with("fid", 30_i64).with("alt", "first"),
        ];
        let value = aggregator.aggregate(LegacyId(5), &records, &image_shape())?;

        assert_eq!(ids(&value), vec![300, 310]);
        let first = &value.items()[0];
        assert_eq!(first.get("alt"), Some(&ScalarValue::from("first")));
        assert_eq!(first.get("title"), Some(&ScalarValue::Null));
        Ok(())
    }

    #[test]
    fn null_sequence_value_sorts_after_numbered_records() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        for (legacy, new) in [(30, 300), (31, 310), (32, 320)] {
            store.insert(EntityTypeTag::File, LegacyId(legacy), NewId(new))?;
        }
        let aggregator = SatelliteAggregator::new(IdResolver::new(&store));

        let records = vec![
            Record::new().with("delta", ScalarValue::Null).with("fid", 32_i64),
            Record::new().with("delta", 1_i64).with("fid", 31_i64),
            Record::new().with("fid", 30_i64),
            Record::new().with("delta", 0_i64).with("fid", 30_i64),
        ];
        let value = aggregator.aggregate(LegacyId(5), &records, &image_shape())?;

        assert_eq!(ids(&value), vec![300, 310, 320, 300]);
        Ok(())
    }

    #[test]
    fn zero_reference_is_dropped_not_emitted_as_none() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        let aggregator = SatelliteAggregator::new(IdResolver::new(&store));
        let records = vec![Record::new().with("delta", 0_i64).with("fid", 0_i64)];
        assert!(aggregator.aggregate(LegacyId(5), &records, &image_shape())?.is_empty());
        Ok(())
    }

    #[test]
    fn structured_shape_without_reference_keeps_every_record() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        let aggregator = SatelliteAggregator::new(IdResolver::new(&store));
        let shape = FieldShape::structured("body", "SELECT 1")
            .attribute("body_value", "value")
            .attribute("body_format", "format");
        let records = vec![Record::new().with("body_value", "<p>hi</p>").with("body_format", "html")];

        let value = aggregator.aggregate(LegacyId(5), &records, &shape)?;
        assert_eq!(value.len(), 1);
        assert_eq!(value.items()[0].get("value"), Some(&ScalarValue::from("<p>hi</p>")));
        Ok(())
    }

    proptest! {
        #[test]
        fn property_aggregation_never_grows_cardinality(
            tids in proptest::collection::vec(0_u32..20, 0..16),
            mapped in proptest::collection::btree_set(1_u32..20, 0..10),
        ) {
            let store = MemoryIdMap::new();
            for legacy in &mapped {
                prop_assert!(store.insert(EntityTypeTag::File, LegacyId(*legacy), NewId(legacy + 100)).is_ok());
                prop_assert!(store.insert(EntityTypeTag::TaxonomyTerm, LegacyId(*legacy), NewId(legacy + 100)).is_ok());
            }
            let aggregator = SatelliteAggregator::new(IdResolver::new(&store));

            let records: Vec<Record> = tids
                .iter()
                .enumerate()
                .map(|(delta, fid)| Record::new().with("delta", i64::try_from(delta).unwrap_or(0)).with("fid", i64::from(*fid)))
                .collect();
            let images = aggregator.aggregate(LegacyId(1), &records, &image_shape());
            prop_assert!(images.is_ok());
            let images = images.unwrap_or_default();
            prop_assert!(images.len() <= records.len());

            let merged: Vec<String> = tids.iter().map(ToString::to_string).collect();
            let tag_rows = vec![Record::new().with("tids", merged.join(","))];
            let tags = aggregator.aggregate(LegacyId(1), &tag_rows, &tag_shape());
            prop_assert!(tags.is_ok());
            prop_assert!(tags.unwrap_or_default().len() <= tids.len());
        }
    }
}
