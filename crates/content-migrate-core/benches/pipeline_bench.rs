use content_migrate_core::{
    profile, EntityTypeTag, ExtractedRow, LegacyId, LegacyLink, LinkId, MemoryIdMap, MigrateError,
    NewId, NodeTypeLookup, ParentContentLookup, PathRewriter, Record, RowOutcome, RowPipeline,
};
use criterion::{criterion_group, criterion_main, Criterion};

struct NoLegacy;

impl ParentContentLookup for NoLegacy {
    fn link(&self, _: LinkId) -> Result<Option<LegacyLink>, MigrateError> {
        Ok(None)
    }
}

impl NodeTypeLookup for NoLegacy {
    fn node_type(&self, legacy_id: LegacyId) -> Result<Option<EntityTypeTag>, MigrateError> {
        Ok((legacy_id.0 % 2 == 0).then_some(EntityTypeTag::NodeArticle))
    }
}

fn mk_store() -> MemoryIdMap {
    let store = MemoryIdMap::new();
    for legacy in 1..=1_000 {
        for tag in [EntityTypeTag::TaxonomyTerm, EntityTypeTag::File, EntityTypeTag::User] {
            if let Err(err) = store.insert(tag, LegacyId(legacy), NewId(legacy + 10_000)) {
                panic!("benchmark fixture mapping failed: {err}");
            }
        }
        if legacy % 2 == 0 {
            if let Err(err) = store.insert(EntityTypeTag::NodeArticle, LegacyId(legacy), NewId(legacy))
            {
                panic!("benchmark fixture mapping failed: {err}");
            }
        }
    }
    store
}

fn mk_article(index: u32) -> ExtractedRow {
    let tids = (0..12).map(|offset| ((index + offset) % 1_200).to_string()).collect::<Vec<_>>();
    let images = (0..4_i64)
        .map(|delta| {
            Record::new()
                .with("delta", delta)
                .with("field_image_fid", i64::from(index) + delta)
                .with("alt", "alt text")
                .with("title", "title text")
        })
        .collect();

    ExtractedRow::new(
        Record::new()
            .with("nid", i64::from(index) + 1)
            .with("uid", i64::from(index % 50) + 1)
            .with("title", "benchmark article"),
    )
    .with_satellites("field_tags", vec![Record::new().with("tids", tids.join(","))])
    .with_satellites("field_image", images)
}

fn bench_article_pipeline(c: &mut Criterion) {
    let store = mk_store();
    let legacy = NoLegacy;
    let pipeline = RowPipeline::new(&store, &legacy, &legacy);
    let article = profile(EntityTypeTag::NodeArticle);
    let rows = (0..1_000).map(mk_article).collect::<Vec<_>>();

    c.bench_function("article_pipeline_1000_rows", |b| {
        b.iter(|| {
            for row in &rows {
                match pipeline.transform(&article, row) {
                    Ok(RowOutcome::Emitted(_)) => {}
                    Ok(RowOutcome::Skipped(signal)) => {
                        panic!("benchmark row unexpectedly skipped: {}", signal.reason)
                    }
                    Err(err) => panic!("benchmark transform failed: {err}"),
                }
            }
        });
    });
}

fn bench_path_rewrite(c: &mut Criterion) {
    let store = mk_store();
    let legacy = NoLegacy;
    let rewriter = PathRewriter::new(content_migrate_core::IdResolver::new(&store), &legacy);
    let paths = (1..=1_000)
        .map(|index| match index % 4 {
            0 => format!("node/{index}"),
            1 => format!("taxonomy/term/{index}"),
            2 => format!("user/{index}"),
            _ => format!("file/{index}"),
        })
        .collect::<Vec<_>>();

    c.bench_function("path_rewrite_1000_paths", |b| {
        b.iter(|| {
            for path in &paths {
                if let Err(err) = rewriter.rewrite(path) {
                    panic!("benchmark rewrite failed: {err}");
                }
            }
        });
    });
}

criterion_group!(pipeline_benches, bench_article_pipeline, bench_path_rewrite);
criterion_main!(pipeline_benches);
