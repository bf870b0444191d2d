use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    profile, Destination, EntityProfile, EntityTypeTag, ExtractedRow, LegacyRow, MigrateError,
    MigrationPlan, RowErrorPolicy, RowOutcome, RowPipeline, RowSource, SkipSignal,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub extracted: u64,
    pub emitted: u64,
    pub already_migrated: u64,
    /// Rows still skipped when the run ended.
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub passes: u32,
    pub entities: BTreeMap<EntityTypeTag, EntityCounts>,
    pub still_skipped: Vec<SkipSignal>,
}

impl RunSummary {
    #[must_use]
    pub fn total_emitted(&self) -> u64 {
        self.entities.values().map(|counts| counts.emitted).sum()
    }

    #[must_use]
    pub fn total_failed(&self) -> u64 {
        self.entities.values().map(|counts| counts.failed).sum()
    }
}

struct Pending {
    extracted: ExtractedRow,
    signal: SkipSignal,
}

enum Step {
    Emitted,
    AlreadyMigrated,
    Skipped(Pending),
}

/// Drives a [`MigrationPlan`] through the pipeline and owns retry scheduling.
pub struct BatchRunner<'a> {
    pipeline: &'a RowPipeline<'a>,
    source: &'a dyn RowSource,
    destination: &'a dyn Destination,
}

impl<'a> BatchRunner<'a> {
    #[must_use]
    pub fn new(
        pipeline: &'a RowPipeline<'a>,
        source: &'a dyn RowSource,
        destination: &'a dyn Destination,
    ) -> Self {
        Self { pipeline, source, destination }
    }

    /// Execute `plan`: one ordered sweep, then retry passes over skipped rows
    /// until a pass emits nothing or `max_passes` is reached.
    ///
    /// # Errors
    /// Returns [`MigrateError::Config`] for an invalid plan, and the first
    /// row-level failure when the plan's error policy is `abort`.
    pub fn run(&self, plan: &MigrationPlan) -> Result<RunSummary, MigrateError> {
        plan.validate()?;

        let mut summary = RunSummary { passes: 1, ..RunSummary::default() };
        let mut pending = Vec::new();

        for entity_type in &plan.order {
            let profile = profile(*entity_type);
            let counts = summary.entities.entry(*entity_type).or_default();
            tracing::info!(%entity_type, "migrating entity type");

            let rows = match self.source.rows(&profile) {
                Ok(rows) => rows,
                Err(err) => {
                    fail(plan.on_row_error, counts, *entity_type, err)?;
                    continue;
                }
            };
            counts.extracted = u64::try_from(rows.len()).unwrap_or(u64::MAX);

            for row in rows {
                match self.first_attempt(&profile, row) {
                    Ok(Step::Emitted) => counts.emitted += 1,
                    Ok(Step::AlreadyMigrated) => counts.already_migrated += 1,
                    Ok(Step::Skipped(skipped)) => pending.push(skipped),
                    Err(err) => fail(plan.on_row_error, counts, *entity_type, err)?,
                }
            }
        }

        while !pending.is_empty() && summary.passes < plan.max_passes {
            summary.passes += 1;
            let before = pending.len();
            let mut still_pending = Vec::new();
            let mut progressed = false;

            for row in pending {
                let entity_type = row.signal.entity_type;
                let profile = profile(entity_type);
                let counts = summary.entities.entry(entity_type).or_default();
                match self.emit(&profile, row.extracted) {
                    Ok(Step::Emitted) => {
                        counts.emitted += 1;
                        progressed = true;
                    }
                    Ok(Step::AlreadyMigrated) => counts.already_migrated += 1,
                    Ok(Step::Skipped(skipped)) => still_pending.push(skipped),
                    Err(err) => fail(plan.on_row_error, counts, entity_type, err)?,
                }
            }

            tracing::info!(
                pass = summary.passes,
                retried = before,
                remaining = still_pending.len(),
                "retry pass finished"
            );
            pending = still_pending;
            if !progressed {
                break;
            }
        }

        for row in pending {
            let counts = summary.entities.entry(row.signal.entity_type).or_default();
            counts.skipped += 1;
            tracing::warn!(
                entity_type = %row.signal.entity_type,
                legacy_id = row.signal.legacy_id.0,
                reason = %row.signal.reason,
                "row left unmigrated"
            );
            summary.still_skipped.push(row.signal);
        }
        Ok(summary)
    }

    fn first_attempt(&self, profile: &EntityProfile, row: LegacyRow) -> Result<Step, MigrateError> {
        let legacy_id = row.id(&profile.id_column)?;
        if !legacy_id.is_none()
            && self.pipeline.resolver().resolve(profile.entity_type, legacy_id)?.is_resolved()
        {
            return Ok(Step::AlreadyMigrated);
        }

        let extracted = ExtractedRow::fetch(self.source, profile, row)?;
        self.emit(profile, extracted)
    }

    fn emit(&self, profile: &EntityProfile, extracted: ExtractedRow) -> Result<Step, MigrateError> {
        match self.pipeline.transform(profile, &extracted)? {
            RowOutcome::Emitted(row) => {
                let new_id = self.destination.write(profile.entity_type, &row)?;
                tracing::debug!(
                    entity_type = %profile.entity_type,
                    legacy_id = row.legacy_id.0,
                    new_id = new_id.0,
                    "row emitted"
                );
                Ok(Step::Emitted)
            }
            RowOutcome::Skipped(signal) => Ok(Step::Skipped(Pending { extracted, signal })),
        }
    }
}

fn fail(
    policy: RowErrorPolicy,
    counts: &mut EntityCounts,
    entity_type: EntityTypeTag,
    err: MigrateError,
) -> Result<(), MigrateError> {
    match policy {
        RowErrorPolicy::Abort => Err(err),
        RowErrorPolicy::Continue => {
            tracing::warn!(%entity_type, error = %err, "row failed; continuing");
            counts.failed += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        FieldShape, IdMapStore, LegacyId, LegacyLink, LinkId, MemoryIdMap, NewId, NodeTypeLookup,
        ParentContentLookup, Record, SatelliteRecord, SkipReason, TransformedRow, TreeRef,
    };

    #[derive(Default)]
    struct Legacy {
        rows: BTreeMap<EntityTypeTag, Vec<Record>>,
        satellites: BTreeMap<(String, LegacyId), Vec<Record>>,
        links: BTreeMap<LinkId, LegacyLink>,
        failing: Option<EntityTypeTag>,
    }

    impl Legacy {
        fn with_link(&mut self, link: u32, parent: u32, entity: u32) -> &mut Self {
            self.links.insert(
                LinkId(link),
                LegacyLink {
                    link_id: LinkId(link),
                    parent_link_id: LinkId(parent),
                    entity_id: Some(LegacyId(entity)),
                },
            );
            self
        }
    }

    impl RowSource for Legacy {
        fn rows(&self, profile: &EntityProfile) -> Result<Vec<LegacyRow>, MigrateError> {
            if self.failing == Some(profile.entity_type) {
                return Err(MigrateError::Extraction("table is locked".to_string()));
            }
            Ok(self.rows.get(&profile.entity_type).cloned().unwrap_or_default())
        }

        fn satellites(
            &self,
            shape: &FieldShape,
            parent: LegacyId,
        ) -> Result<Vec<SatelliteRecord>, MigrateError> {
            Ok(self.satellites.get(&(shape.field.clone(), parent)).cloned().unwrap_or_default())
        }
    }

    impl ParentContentLookup for Legacy {
        fn link(&self, link_id: LinkId) -> Result<Option<LegacyLink>, MigrateError> {
            Ok(self.links.get(&link_id).copied())
        }
    }

    impl NodeTypeLookup for Legacy {
        fn node_type(&self, _: LegacyId) -> Result<Option<EntityTypeTag>, MigrateError> {
            Ok(None)
        }
    }

    struct Recorder<'a> {
        map: &'a MemoryIdMap,
        next: Cell<u32>,
        written: RefCell<Vec<TransformedRow>>,
    }

    impl<'a> Recorder<'a> {
        fn new(map: &'a MemoryIdMap) -> Self {
            Self { map, next: Cell::new(1), written: RefCell::new(Vec::new()) }
        }
    }

    impl Destination for Recorder<'_> {
        fn write(&self, entity_type: EntityTypeTag, row: &TransformedRow) -> Result<NewId, MigrateError> {
            let new_id = NewId(self.next.get());
            self.next.set(new_id.0 + 1);
            self.map.insert(entity_type, row.legacy_id, new_id)?;
            let mut row = row.clone();
            row.assign_new_id(new_id);
            self.written.borrow_mut().push(row);
            Ok(new_id)
        }
    }

    fn comment(cid: i64, nid: i64) -> Record {
        Record::new()
            .with("cid", cid)
            .with("pid", 0_i64)
            .with("nid", nid)
            .with("uid", 0_i64)
            .with("node_type", "page")
    }

    fn book_page(nid: i64, path: &[i64], bid: i64) -> Record {
        let mlid = path.last().copied().unwrap_or(0);
        let plid = if path.len() > 1 { path[path.len() - 2] } else { 0 };
        let mut row = Record::new()
            .with("nid", nid)
            .with("uid", 0_i64)
            .with("bid", bid)
            .with("mlid", mlid)
            .with("plid", plid)
            .with("depth", i64::try_from(path.len()).unwrap_or(0))
            .with("weight", 0_i64);
        for slot in 1..=9_usize {
            row.insert(&format!("p{slot}"), path.get(slot - 1).copied().unwrap_or(0));
        }
        row
    }

    fn page(nid: i64) -> Record {
        Record::new().with("nid", nid).with("uid", 0_i64).with("title", "page")
    }

    #[test]
    fn out_of_order_rows_are_retried_in_later_passes() -> Result<(), MigrateError> {
        let mut legacy = Legacy::default();
        legacy.with_link(1, 0, 10).with_link(2, 1, 11);
        // The child page is extracted before the page it hangs under.
        legacy.rows.insert(
            EntityTypeTag::NodeBook,
            vec![book_page(11, &[1, 2], 10), book_page(10, &[1], 10)],
        );

        let map = MemoryIdMap::new();
        let destination = Recorder::new(&map);
        let pipeline = RowPipeline::new(&map, &legacy, &legacy);
        let runner = BatchRunner::new(&pipeline, &legacy, &destination);

        let summary = runner
            .run(&MigrationPlan { order: vec![EntityTypeTag::NodeBook], ..MigrationPlan::default() })?;
        assert_eq!(summary.passes, 2);
        assert_eq!(summary.entities[&EntityTypeTag::NodeBook].emitted, 2);
        assert!(summary.still_skipped.is_empty());

        let written = destination.written.borrow();
        let child = written.iter().find(|row| row.legacy_id == LegacyId(11));
        let parent = child.and_then(|row| row.hierarchy).map(|hierarchy| hierarchy.parent_new_id);
        assert_eq!(parent, map.lookup(EntityTypeTag::NodeBook, LegacyId(10))?);
        Ok(())
    }

    #[test]
    fn written_book_roots_carry_their_own_new_id_as_tree() -> Result<(), MigrateError> {
        let mut legacy = Legacy::default();
        legacy.with_link(1, 0, 20).with_link(2, 1, 21);
        legacy.rows.insert(
            EntityTypeTag::NodeBook,
            vec![book_page(20, &[1], 20), book_page(21, &[1, 2], 20)],
        );

        let map = MemoryIdMap::new();
        let destination = Recorder::new(&map);
        let pipeline = RowPipeline::new(&map, &legacy, &legacy);
        BatchRunner::new(&pipeline, &legacy, &destination)
            .run(&MigrationPlan { order: vec![EntityTypeTag::NodeBook], ..MigrationPlan::default() })?;

        let Some(root_id) = map.lookup(EntityTypeTag::NodeBook, LegacyId(20))? else {
            panic!("book root was not migrated");
        };
        assert!(!root_id.is_none());
        let written = destination.written.borrow();
        for legacy_id in [LegacyId(20), LegacyId(21)] {
            let tree = written
                .iter()
                .find(|row| row.legacy_id == legacy_id)
                .and_then(|row| row.hierarchy)
                .map(|hierarchy| hierarchy.tree);
            assert_eq!(tree, Some(TreeRef::Entity(root_id)), "tree of book {legacy_id}");
        }
        Ok(())
    }

    #[test]
    fn term_parent_with_higher_id_is_retried_not_flattened() -> Result<(), MigrateError> {
        let mut legacy = Legacy::default();
        legacy.rows.insert(EntityTypeTag::TaxonomyVocabulary, vec![Record::new().with("vid", 1_i64)]);
        legacy.rows.insert(
            EntityTypeTag::TaxonomyTerm,
            vec![
                Record::new().with("tid", 4_i64).with("vid", 1_i64).with("parent", 9_i64),
                Record::new().with("tid", 9_i64).with("vid", 1_i64).with("parent", 0_i64),
            ],
        );

        let map = MemoryIdMap::new();
        let destination = Recorder::new(&map);
        let pipeline = RowPipeline::new(&map, &legacy, &legacy);
        let summary = BatchRunner::new(&pipeline, &legacy, &destination).run(&MigrationPlan {
            order: vec![EntityTypeTag::TaxonomyVocabulary, EntityTypeTag::TaxonomyTerm],
            ..MigrationPlan::default()
        })?;
        assert_eq!(summary.passes, 2);
        assert!(summary.still_skipped.is_empty());

        let parent_id = map.lookup(EntityTypeTag::TaxonomyTerm, LegacyId(9))?;
        let written = destination.written.borrow();
        let child = written
            .iter()
            .find(|row| row.entity_type == EntityTypeTag::TaxonomyTerm && row.legacy_id == LegacyId(4));
        assert_eq!(child.and_then(|row| row.references.get("parent").copied()), parent_id);
        let root = written
            .iter()
            .find(|row| row.entity_type == EntityTypeTag::TaxonomyTerm && row.legacy_id == LegacyId(9));
        assert_eq!(root.and_then(|row| row.references.get("parent").copied()), Some(NewId::NONE));
        Ok(())
    }

    #[test]
    fn rows_that_never_resolve_are_reported_after_a_stalled_pass() -> Result<(), MigrateError> {
        let mut legacy = Legacy::default();
        legacy.rows.insert(EntityTypeTag::NodePage, vec![page(5)]);
        legacy.rows.insert(EntityTypeTag::Comment, vec![comment(1, 5), comment(2, 6)]);

        let map = MemoryIdMap::new();
        let destination = Recorder::new(&map);
        let pipeline = RowPipeline::new(&map, &legacy, &legacy);
        let runner = BatchRunner::new(&pipeline, &legacy, &destination);

        let plan = MigrationPlan {
            order: vec![EntityTypeTag::NodePage, EntityTypeTag::Comment],
            max_passes: 5,
            on_row_error: RowErrorPolicy::Abort,
        };
        let summary = runner.run(&plan)?;
        let comments = summary.entities[&EntityTypeTag::Comment];
        assert_eq!(comments.extracted, 2);
        assert_eq!(comments.emitted, 1);
        assert_eq!(comments.skipped, 1);
        assert_eq!(summary.passes, 2);
        assert!(matches!(
            summary.still_skipped[0].reason,
            SkipReason::OwningEntityUnresolved { legacy_id: LegacyId(6), .. }
        ));
        Ok(())
    }

    #[test]
    fn reruns_do_not_emit_twice() -> Result<(), MigrateError> {
        let mut legacy = Legacy::default();
        legacy.rows.insert(EntityTypeTag::NodePage, vec![page(5), page(6)]);

        let map = MemoryIdMap::new();
        let destination = Recorder::new(&map);
        let pipeline = RowPipeline::new(&map, &legacy, &legacy);
        let runner = BatchRunner::new(&pipeline, &legacy, &destination);
        let plan = MigrationPlan { order: vec![EntityTypeTag::NodePage], ..MigrationPlan::default() };

        assert_eq!(runner.run(&plan)?.total_emitted(), 2);
        let again = runner.run(&plan)?;
        assert_eq!(again.total_emitted(), 0);
        assert_eq!(again.entities[&EntityTypeTag::NodePage].already_migrated, 2);
        assert_eq!(destination.written.borrow().len(), 2);
        Ok(())
    }

    #[test]
    fn satellites_are_fetched_per_row() -> Result<(), MigrateError> {
        let mut legacy = Legacy::default();
        legacy.rows.insert(EntityTypeTag::NodePage, vec![page(5)]);
        legacy.satellites.insert(
            ("body".to_string(), LegacyId(5)),
            vec![Record::new().with("body_value", "text").with("body_format", "html")],
        );

        let map = MemoryIdMap::new();
        let destination = Recorder::new(&map);
        let pipeline = RowPipeline::new(&map, &legacy, &legacy);
        BatchRunner::new(&pipeline, &legacy, &destination)
            .run(&MigrationPlan { order: vec![EntityTypeTag::NodePage], ..MigrationPlan::default() })?;

        let written = destination.written.borrow();
        assert_eq!(written[0].composites.get("body").map(|body| body.len()), Some(1));
        Ok(())
    }

    #[test]
    fn row_error_policy_decides_between_abort_and_continue() -> Result<(), MigrateError> {
        let mut legacy = Legacy {
            failing: Some(EntityTypeTag::User),
            ..Legacy::default()
        };
        legacy.rows.insert(EntityTypeTag::NodePage, vec![page(5), Record::new().with("nid", "bad")]);

        let map = MemoryIdMap::new();
        let destination = Recorder::new(&map);
        let pipeline = RowPipeline::new(&map, &legacy, &legacy);
        let runner = BatchRunner::new(&pipeline, &legacy, &destination);

        let abort = MigrationPlan {
            order: vec![EntityTypeTag::User, EntityTypeTag::NodePage],
            ..MigrationPlan::default()
        };
        assert!(matches!(runner.run(&abort), Err(MigrateError::Extraction(_))));

        let proceed = MigrationPlan { on_row_error: RowErrorPolicy::Continue, ..abort };
        let summary = runner.run(&proceed)?;
        assert_eq!(summary.entities[&EntityTypeTag::User].failed, 1);
        assert_eq!(summary.entities[&EntityTypeTag::NodePage].failed, 1);
        assert_eq!(summary.entities[&EntityTypeTag::NodePage].emitted, 1);
        assert_eq!(summary.total_failed(), 2);
        Ok(())
    }
}
