use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};

use crate::{
    CompositeFieldValue, EntityProfile, EntityTypeTag, HierarchyNode, HierarchyOutcome,
    HierarchyReconstructor, IdMapStore, IdResolver, LegacyId, LegacyRow, MigrateError, NewId,
    NodeTypeLookup, ParentContentLookup, PathRewrite, PathRewriter, ReferencePolicy,
    ReferenceRule, ReferenceTarget, Resolution, ResolvedHierarchy, RowSource,
    SatelliteAggregator, SatelliteRecord, ScalarValue,
};

/// Lifecycle stage of one row, reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStage {
    Extracted,
    Enriched,
    Resolved,
    Emitted,
    Skipped,
}

impl RowStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extracted => "extracted",
            Self::Enriched => "enriched",
            Self::Resolved => "resolved",
            Self::Emitted => "emitted",
            Self::Skipped => "skipped",
        }
    }
}

/// One legacy row together with its satellite records, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedRow {
    pub row: LegacyRow,
    pub satellites: BTreeMap<String, Vec<SatelliteRecord>>,
}

impl ExtractedRow {
    #[must_use]
    pub fn new(row: LegacyRow) -> Self {
        Self { row, satellites: BTreeMap::new() }
    }

    #[must_use]
    pub fn with_satellites(mut self, field: &str, records: Vec<SatelliteRecord>) -> Self {
        self.satellites.insert(field.to_string(), records);
        self
    }

    /// Fetch every satellite field declared by `profile` for `row`.
    ///
    /// # Errors
    /// Propagates extraction failures and a missing or invalid id column.
    pub fn fetch(
        source: &dyn RowSource,
        profile: &EntityProfile,
        row: LegacyRow,
    ) -> Result<Self, MigrateError> {
        let legacy_id = row.id(&profile.id_column)?;
        let mut extracted = Self::new(row);
        for shape in &profile.fields {
            let records = source.satellites(shape, legacy_id)?;
            extracted.satellites.insert(shape.field.clone(), records);
        }
        Ok(extracted)
    }
}

/// Destination-ready row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRow {
    pub entity_type: EntityTypeTag,
    pub legacy_id: LegacyId,
    /// Every legacy column, verbatim.
    pub scalars: BTreeMap<String, ScalarValue>,
    pub composites: BTreeMap<String, CompositeFieldValue>,
    /// Resolved id per reference column. `0` means no reference.
    pub references: BTreeMap<String, NewId>,
    pub paths: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hierarchy: Option<ResolvedHierarchy>,
}

impl TransformedRow {
    /// Settle references that depend on the row's own new id, once the destination assigned it.
    pub fn assign_new_id(&mut self, new_id: NewId) {
        if let Some(hierarchy) = self.hierarchy.as_mut() {
            hierarchy.assign(new_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    OwningEntityUnresolved { column: String, entity_type: EntityTypeTag, legacy_id: LegacyId },
    UnknownOwnerBundle { column: String, bundle: Option<String> },
    ReferenceUnresolved { column: String, entity_type: EntityTypeTag, legacy_id: LegacyId },
    HierarchyDeferred { legacy_id: LegacyId },
    PathTargetUnresolved { column: String, entity_type: EntityTypeTag, legacy_id: LegacyId },
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OwningEntityUnresolved { column, entity_type, legacy_id } => {
                write!(f, "owning entity unresolved: {column} -> {entity_type}/{legacy_id}")
            }
            Self::UnknownOwnerBundle { column, bundle } => match bundle {
                Some(bundle) => write!(f, "owner bundle `{bundle}` in {column} is not migrated"),
                None => write!(f, "owner bundle column {column} is empty"),
            },
            Self::ReferenceUnresolved { column, entity_type, legacy_id } => {
                write!(f, "required reference unresolved: {column} -> {entity_type}/{legacy_id}")
            }
            Self::HierarchyDeferred { legacy_id } => {
                write!(f, "parent content {legacy_id} not migrated yet")
            }
            Self::PathTargetUnresolved { column, entity_type, legacy_id } => {
                write!(f, "path target unresolved: {column} -> {entity_type}/{legacy_id}")
            }
        }
    }
}

/// Retry-later directive for one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipSignal {
    pub entity_type: EntityTypeTag,
    pub legacy_id: LegacyId,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Emitted(TransformedRow),
    Skipped(SkipSignal),
}

/// Hard dependencies resolved before enrichment.
#[derive(Default)]
struct Gates {
    references: BTreeMap<String, NewId>,
    paths: BTreeMap<String, String>,
    hierarchy: Option<ResolvedHierarchy>,
}

/// Composes resolution, aggregation, hierarchy and path rewriting over one row.
pub struct RowPipeline<'a> {
    resolver: IdResolver<'a>,
    aggregator: SatelliteAggregator<'a>,
    hierarchy: HierarchyReconstructor<'a>,
    paths: PathRewriter<'a>,
}

impl<'a> RowPipeline<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn IdMapStore,
        links: &'a dyn ParentContentLookup,
        nodes: &'a dyn NodeTypeLookup,
    ) -> Self {
        let resolver = IdResolver::new(store);
        Self {
            resolver,
            aggregator: SatelliteAggregator::new(resolver),
            hierarchy: HierarchyReconstructor::new(resolver, links),
            paths: PathRewriter::new(resolver, nodes),
        }
    }

    #[must_use]
    pub fn resolver(&self) -> IdResolver<'a> {
        self.resolver
    }

    /// Transform one extracted row.
    ///
    /// A row is skipped, with no partial output, when a hard dependency is not
    /// migrated yet. Otherwise every satellite field, reference, path and
    /// outline position is resolved and the row is emitted.
    ///
    /// # Errors
    /// Returns [`MigrateError::Validation`] for rows without a usable id and
    /// propagates identifier map and lookup failures.
    pub fn transform(
        &self,
        profile: &EntityProfile,
        extracted: &ExtractedRow,
    ) -> Result<RowOutcome, MigrateError> {
        let entity_type = profile.entity_type;
        let row = &extracted.row;
        let legacy_id = row.id(&profile.id_column)?;
        if legacy_id.is_none() {
            return Err(MigrateError::Validation(format!(
                "{entity_type} row has no legacy id in `{}`",
                profile.id_column
            )));
        }

        tracing::trace!(%entity_type, legacy_id = legacy_id.0, stage = RowStage::Extracted.as_str());
        let mut gates = match self.gate(profile, row, legacy_id)? {
            ControlFlow::Continue(gates) => gates,
            ControlFlow::Break(reason) => {
                tracing::debug!(
                    %entity_type,
                    legacy_id = legacy_id.0,
                    stage = RowStage::Skipped.as_str(),
                    %reason,
                    "row skipped"
                );
                return Ok(RowOutcome::Skipped(SkipSignal { entity_type, legacy_id, reason }));
            }
        };

        let mut composites = BTreeMap::new();
        for shape in &profile.fields {
            let records = extracted.satellites.get(&shape.field).map_or(&[][..], Vec::as_slice);
            let value = self.aggregator.aggregate(legacy_id, records, shape)?;
            composites.insert(shape.field.clone(), value);
        }
        tracing::trace!(%entity_type, legacy_id = legacy_id.0, stage = RowStage::Enriched.as_str());

        for rule in profile.references.iter().filter(|rule| !rule.policy.is_hard()) {
            let new_id = match &rule.target {
                ReferenceTarget::Fixed { entity_type: target } => {
                    self.resolver.resolve(*target, row.id(&rule.column)?)?.or_none()
                }
                ReferenceTarget::NodeBundle { column } => {
                    match row.text(column).and_then(EntityTypeTag::from_node_bundle) {
                        Some(target) => {
                            self.resolver.resolve(target, row.id(&rule.column)?)?.or_none()
                        }
                        None => NewId::NONE,
                    }
                }
            };
            gates.references.insert(rule.column.clone(), new_id);
        }
        for path_column in profile.paths.iter().filter(|path| !path.policy.is_hard()) {
            if let Some(path) = row.text(&path_column.column) {
                gates.paths.insert(path_column.column.clone(), self.paths.rewrite(path)?);
            }
        }
        tracing::trace!(%entity_type, legacy_id = legacy_id.0, stage = RowStage::Resolved.as_str());

        Ok(RowOutcome::Emitted(TransformedRow {
            entity_type,
            legacy_id,
            scalars: row.columns().clone(),
            composites,
            references: gates.references,
            paths: gates.paths,
            hierarchy: gates.hierarchy,
        }))
    }

    /// Resolve every hard dependency, breaking out on the first unresolved one.
    fn gate(
        &self,
        profile: &EntityProfile,
        row: &LegacyRow,
        legacy_id: LegacyId,
    ) -> Result<ControlFlow<SkipReason, Gates>, MigrateError> {
        let mut gates = Gates::default();

        for rule in profile.references.iter().filter(|rule| rule.policy.is_hard()) {
            match self.hard_reference(rule, row)? {
                ControlFlow::Continue(new_id) => {
                    gates.references.insert(rule.column.clone(), new_id);
                }
                ControlFlow::Break(reason) => return Ok(ControlFlow::Break(reason)),
            }
        }

        if let Some(columns) = &profile.hierarchy {
            let node = HierarchyNode::from_row(row, columns, legacy_id)?;
            match self.hierarchy.reconstruct_parent(&node, profile.entity_type)? {
                HierarchyOutcome::Resolved(resolved) => gates.hierarchy = Some(resolved),
                HierarchyOutcome::Deferred { legacy_id } => {
                    return Ok(ControlFlow::Break(SkipReason::HierarchyDeferred { legacy_id }));
                }
            }
        }

        for path_column in profile.paths.iter().filter(|path| path.policy.is_hard()) {
            let Some(path) = row.text(&path_column.column) else {
                continue;
            };
            match self.paths.classify(path)? {
                PathRewrite::Unresolved { entity_type, legacy_id, .. } => {
                    return Ok(ControlFlow::Break(SkipReason::PathTargetUnresolved {
                        column: path_column.column.clone(),
                        entity_type,
                        legacy_id,
                    }));
                }
                outcome => {
                    gates.paths.insert(path_column.column.clone(), outcome.into_path());
                }
            }
        }

        Ok(ControlFlow::Continue(gates))
    }

    fn hard_reference(
        &self,
        rule: &ReferenceRule,
        row: &LegacyRow,
    ) -> Result<ControlFlow<SkipReason, NewId>, MigrateError> {
        let target = match &rule.target {
            ReferenceTarget::Fixed { entity_type } => *entity_type,
            ReferenceTarget::NodeBundle { column } => {
                let bundle = row.text(column);
                match bundle.and_then(EntityTypeTag::from_node_bundle) {
                    Some(target) => target,
                    None => {
                        return Ok(ControlFlow::Break(SkipReason::UnknownOwnerBundle {
                            column: column.clone(),
                            bundle: bundle.map(str::to_string),
                        }));
                    }
                }
            }
        };

        let legacy_id = row.id(&rule.column)?;
        Ok(match self.resolver.resolve(target, legacy_id)? {
            Resolution::Resolved(new_id) => ControlFlow::Continue(new_id),
            Resolution::Unresolved => {
                let column = rule.column.clone();
                ControlFlow::Break(match rule.policy {
                    ReferencePolicy::Owner => {
                        SkipReason::OwningEntityUnresolved { column, entity_type: target, legacy_id }
                    }
                    ReferencePolicy::Required | ReferencePolicy::Optional => {
                        SkipReason::ReferenceUnresolved { column, entity_type: target, legacy_id }
                    }
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::{profile, LegacyLink, LinkId, MemoryIdMap, Record, TreeRef, TARGET_ID_KEY};

    #[derive(Default)]
    struct Legacy {
        links: BTreeMap<LinkId, LegacyLink>,
        nodes: BTreeMap<LegacyId, EntityTypeTag>,
    }

    impl ParentContentLookup for Legacy {
        fn link(&self, link_id: LinkId) -> Result<Option<LegacyLink>, MigrateError> {
            Ok(self.links.get(&link_id).copied())
        }
    }

    impl NodeTypeLookup for Legacy {
        fn node_type(&self, legacy_id: LegacyId) -> Result<Option<EntityTypeTag>, MigrateError> {
            Ok(self.nodes.get(&legacy_id).copied())
        }
    }

    fn comment_row(cid: i64, nid: i64, bundle: &str) -> ExtractedRow {
        ExtractedRow::new(
            Record::new()
                .with("cid", cid)
                .with("pid", 0_i64)
                .with("nid", nid)
                .with("uid", 3_i64)
                .with("subject", "hello")
                .with("node_type", bundle),
        )
        .with_satellites(
            "comment_body",
            vec![Record::new().with("comment_body_value", "body").with("comment_body_format", "plain")],
        )
    }

    fn article_row(nid: i64, tids: &str) -> ExtractedRow {
        ExtractedRow::new(Record::new().with("nid", nid).with("uid", 3_i64).with("title", "t"))
            .with_satellites("field_tags", vec![Record::new().with("tids", tids)])
    }

    fn emitted(outcome: RowOutcome) -> TransformedRow {
        match outcome {
            RowOutcome::Emitted(row) => row,
            RowOutcome::Skipped(signal) => panic!("unexpected skip: {}", signal.reason),
        }
    }

    #[test]
    fn comment_with_unmigrated_owner_is_skipped() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        let legacy = Legacy::default();
        let pipeline = RowPipeline::new(&store, &legacy, &legacy);

        let outcome = pipeline.transform(&profile(EntityTypeTag::Comment), &comment_row(1, 5, "article"))?;
        let RowOutcome::Skipped(signal) = outcome else {
            panic!("comment without owner must not be emitted");
        };
        assert_eq!(
            signal.reason,
            SkipReason::OwningEntityUnresolved {
                column: "nid".to_string(),
                entity_type: EntityTypeTag::NodeArticle,
                legacy_id: LegacyId(5),
            }
        );
        assert!(signal.reason.to_string().starts_with("owning entity unresolved"));
        Ok(())
    }

    #[test]
    fn comment_owner_resolves_through_its_bundle_partition() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        store.insert(EntityTypeTag::NodeBook, LegacyId(5), NewId(50))?;
        let legacy = Legacy::default();
        let pipeline = RowPipeline::new(&store, &legacy, &legacy);
        let comment = profile(EntityTypeTag::Comment);

        let row = emitted(pipeline.transform(&comment, &comment_row(1, 5, "book"))?);
        assert_eq!(row.references.get("nid"), Some(&NewId(50)));
        assert_eq!(row.references.get("uid"), Some(&NewId::NONE));
        assert_eq!(row.references.get("pid"), Some(&NewId::NONE));
        assert_eq!(row.composites.get("comment_body").map(CompositeFieldValue::len), Some(1));
        assert_eq!(row.scalars.get("subject"), Some(&ScalarValue::from("hello")));

        // Same id in another bundle's partition does not count as the owner.
        let skipped = pipeline.transform(&comment, &comment_row(2, 5, "page"))?;
        assert!(matches!(skipped, RowOutcome::Skipped(_)));

        let unknown = pipeline.transform(&comment, &comment_row(3, 5, "forum"))?;
        let RowOutcome::Skipped(signal) = unknown else {
            panic!("unknown bundle must skip");
        };
        assert!(matches!(signal.reason, SkipReason::UnknownOwnerBundle { .. }));
        Ok(())
    }

    #[test]
    fn article_tags_are_aggregated_and_missing_fields_are_empty() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        store.insert(EntityTypeTag::TaxonomyTerm, LegacyId(4), NewId(1))?;
        store.insert(EntityTypeTag::TaxonomyTerm, LegacyId(12), NewId(3))?;
        store.insert(EntityTypeTag::User, LegacyId(3), NewId(30))?;
        let legacy = Legacy::default();
        let pipeline = RowPipeline::new(&store, &legacy, &legacy);

        let row = emitted(pipeline.transform(&profile(EntityTypeTag::NodeArticle), &article_row(9, "4,7,7,12"))?);
        assert_eq!(row.composites.get("field_tags").map(CompositeFieldValue::target_ids), Some(vec![1, 3]));
        assert_eq!(row.composites.get("field_image"), Some(&CompositeFieldValue::new()));
        assert_eq!(row.references.get("uid"), Some(&NewId(30)));
        assert_eq!(
            row.composites["field_tags"].items()[0].get(TARGET_ID_KEY),
            Some(&ScalarValue::Integer(1))
        );
        Ok(())
    }

    #[test]
    fn book_page_under_unmigrated_parent_is_deferred() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        let mut legacy = Legacy::default();
        legacy.links.insert(
            LinkId(1),
            LegacyLink { link_id: LinkId(1), parent_link_id: LinkId::ROOT, entity_id: Some(LegacyId(10)) },
        );
        let pipeline = RowPipeline::new(&store, &legacy, &legacy);
        let book = profile(EntityTypeTag::NodeBook);

        let mut child = Record::new()
            .with("nid", 11_i64)
            .with("uid", 0_i64)
            .with("bid", 10_i64)
            .with("mlid", 2_i64)
            .with("plid", 1_i64)
            .with("depth", 2_i64)
            .with("weight", 0_i64)
            .with("p1", 1_i64)
            .with("p2", 2_i64);
        for index in 3..=9 {
            child.insert(&format!("p{index}"), 0_i64);
        }
        let child = ExtractedRow::new(child);

        let outcome = pipeline.transform(&book, &child)?;
        let RowOutcome::Skipped(signal) = outcome else {
            panic!("child of an unmigrated page must be deferred");
        };
        assert_eq!(signal.reason, SkipReason::HierarchyDeferred { legacy_id: LegacyId(10) });

        store.insert(EntityTypeTag::NodeBook, LegacyId(10), NewId(100))?;
        let row = emitted(pipeline.transform(&book, &child)?);
        let hierarchy = row.hierarchy.unwrap_or_else(|| panic!("book rows carry an outline"));
        assert_eq!(hierarchy.parent_new_id, NewId(100));
        assert_eq!(hierarchy.tree, TreeRef::Entity(NewId(100)));
        Ok(())
    }

    #[test]
    fn url_alias_waits_for_its_target_and_passes_unsupported_paths() -> Result<(), MigrateError> {
        let store = MemoryIdMap::new();
        let mut legacy = Legacy::default();
        legacy.nodes.insert(LegacyId(123), EntityTypeTag::NodePage);
        let pipeline = RowPipeline::new(&store, &legacy, &legacy);
        let alias = profile(EntityTypeTag::UrlAlias);
        let row = |pid: i64, source: &str| {
            ExtractedRow::new(Record::new().with("pid", pid).with("source", source).with("alias", "about"))
        };

        assert!(matches!(pipeline.transform(&alias, &row(1, "node/123"))?, RowOutcome::Skipped(_)));

        store.insert(EntityTypeTag::NodePage, LegacyId(123), NewId(8))?;
        let rewritten = emitted(pipeline.transform(&alias, &row(1, "node/123"))?);
        assert_eq!(rewritten.paths.get("source").map(String::as_str), Some("node/8"));

        let passed = emitted(pipeline.transform(&alias, &row(2, "file/3"))?);
        assert_eq!(passed.paths.get("source").map(String::as_str), Some("file/3"));
        Ok(())
    }

    #[test]
    fn row_without_id_is_a_validation_error() {
        let store = MemoryIdMap::new();
        let legacy = Legacy::default();
        let pipeline = RowPipeline::new(&store, &legacy, &legacy);
        let result = pipeline.transform(&profile(EntityTypeTag::User), &ExtractedRow::new(Record::new().with("uid", 0_i64)));
        assert!(matches!(result, Err(MigrateError::Validation(_))));
    }

    proptest! {
        #[test]
        fn property_transform_is_idempotent(
            nid in 1_u32..500,
            tids in proptest::collection::vec(0_u32..30, 0..8),
            mapped in proptest::collection::btree_set(1_u32..30, 0..10),
        ) {
            let store = MemoryIdMap::new();
            for legacy in &mapped {
                prop_assert!(store.insert(EntityTypeTag::TaxonomyTerm, LegacyId(*legacy), NewId(legacy * 2)).is_ok());
            }
            let legacy = Legacy::default();
            let pipeline = RowPipeline::new(&store, &legacy, &legacy);
            let article = profile(EntityTypeTag::NodeArticle);
            let merged: Vec<String> = tids.iter().map(ToString::to_string).collect();
            let row = article_row(i64::from(nid), &merged.join(","));

            let first = pipeline.transform(&article, &row);
            let second = pipeline.transform(&article, &row);
            prop_assert!(first.is_ok());
            prop_assert_eq!(first, second);
        }
    }
}
