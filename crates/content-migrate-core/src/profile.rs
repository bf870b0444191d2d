//! Static per-entity-type configuration: the legacy query, the satellite
//! field shapes, and which columns are references, paths or outline positions.
//!
//! Queries target the legacy Drupal 7 table layout. Satellite queries bind the
//! parent's legacy id as `:parent`.
use serde::{Deserialize, Serialize};

use crate::{EntityTypeTag, FieldShape, HierarchyColumns};

/// What happens to a row when a reference cannot be resolved yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePolicy {
    /// The owning entity; the row is skipped until it is migrated.
    Owner,
    /// A hard dependency; the row is skipped until it is migrated.
    Required,
    /// Emitted as `0` when not migrated.
    Optional,
}

impl ReferencePolicy {
    #[must_use]
    pub fn is_hard(self) -> bool {
        matches!(self, Self::Owner | Self::Required)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ReferenceTarget {
    Fixed { entity_type: EntityTypeTag },
    /// A node reference whose mapping partition is picked by the legacy bundle in `column`.
    NodeBundle { column: String },
}

/// A scalar row column holding a legacy id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRule {
    pub column: String,
    pub target: ReferenceTarget,
    pub policy: ReferencePolicy,
}

/// A row column holding an internal path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathColumn {
    pub column: String,
    pub policy: ReferencePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityProfile {
    pub entity_type: EntityTypeTag,
    /// Column holding the row's own legacy id.
    pub id_column: String,
    pub query: String,
    /// Entity types that must be migrated first.
    pub depends_on: Vec<EntityTypeTag>,
    pub fields: Vec<FieldShape>,
    pub references: Vec<ReferenceRule>,
    pub paths: Vec<PathColumn>,
    pub hierarchy: Option<HierarchyColumns>,
}

impl EntityProfile {
    fn new(entity_type: EntityTypeTag, id_column: &str, query: &str) -> Self {
        Self {
            entity_type,
            id_column: id_column.to_string(),
            query: query.to_string(),
            depends_on: Vec::new(),
            fields: Vec::new(),
            references: Vec::new(),
            paths: Vec::new(),
            hierarchy: None,
        }
    }

    fn depends_on(mut self, tags: &[EntityTypeTag]) -> Self {
        self.depends_on.extend_from_slice(tags);
        self
    }

    fn field(mut self, shape: FieldShape) -> Self {
        self.fields.push(shape);
        self
    }

    fn reference(mut self, column: &str, entity_type: EntityTypeTag, policy: ReferencePolicy) -> Self {
        self.references.push(ReferenceRule {
            column: column.to_string(),
            target: ReferenceTarget::Fixed { entity_type },
            policy,
        });
        self
    }

    #[must_use]
    pub fn field_shape(&self, name: &str) -> Option<&FieldShape> {
        self.fields.iter().find(|shape| shape.field == name)
    }
}

/// Built-in profile for `entity_type`.
#[must_use]
pub fn profile(entity_type: EntityTypeTag) -> EntityProfile {
    match entity_type {
        EntityTypeTag::TaxonomyVocabulary => vocabulary(),
        EntityTypeTag::TaxonomyTerm => term(),
        EntityTypeTag::User => user(),
        EntityTypeTag::File => file(),
        EntityTypeTag::NodeArticle => article(),
        EntityTypeTag::NodePage => page(),
        EntityTypeTag::NodeWebsite => website(),
        EntityTypeTag::NodeBook => book(),
        EntityTypeTag::Comment => comment(),
        EntityTypeTag::UrlAlias => url_alias(),
    }
}

#[must_use]
pub fn builtin_profiles() -> Vec<EntityProfile> {
    EntityTypeTag::ALL.into_iter().map(profile).collect()
}

const NODE_COLUMNS: &str = "n.nid, n.vid, n.type, n.language, n.title, n.uid, n.status, \
                            n.created, n.changed, n.promote, n.sticky";

fn node_query(bundle: &str) -> String {
    format!("SELECT {NODE_COLUMNS} FROM node n WHERE n.type = '{bundle}' ORDER BY n.nid")
}

fn body() -> FieldShape {
    FieldShape::structured(
        "body",
        "SELECT body_value, body_summary, body_format FROM field_data_body \
         WHERE entity_id = :parent ORDER BY delta",
    )
    .attribute("body_value", "value")
    .attribute("body_summary", "summary")
    .attribute("body_format", "format")
}

fn merged_terms(field: &str, table: &str, column: &str) -> FieldShape {
    FieldShape::merged(
        field,
        &format!("SELECT GROUP_CONCAT({column}) AS tids FROM {table} WHERE entity_id = :parent"),
        "tids",
        EntityTypeTag::TaxonomyTerm,
    )
}

fn attachments() -> FieldShape {
    FieldShape::structured(
        "field_attachment",
        "SELECT delta, field_attachment_fid, field_attachment_display, \
         field_attachment_description FROM field_data_field_attachment \
         WHERE entity_id = :parent ORDER BY delta",
    )
    .attribute("field_attachment_display", "display")
    .attribute("field_attachment_description", "description")
    .reference("field_attachment_fid", EntityTypeTag::File)
    .ordered_by("delta")
}

fn vocabulary() -> EntityProfile {
    EntityProfile::new(
        EntityTypeTag::TaxonomyVocabulary,
        "vid",
        "SELECT vid, name, machine_name, description, hierarchy, module, weight \
         FROM taxonomy_vocabulary ORDER BY vid",
    )
}

fn term() -> EntityProfile {
    EntityProfile::new(
        EntityTypeTag::TaxonomyTerm,
        "tid",
        "SELECT t.tid, t.vid, t.name, t.description, t.format, t.weight, \
         COALESCE(h.parent, 0) AS parent FROM taxonomy_term_data t \
         LEFT JOIN taxonomy_term_hierarchy h ON h.tid = t.tid ORDER BY t.tid",
    )
    .depends_on(&[EntityTypeTag::TaxonomyVocabulary])
    .reference("vid", EntityTypeTag::TaxonomyVocabulary, ReferencePolicy::Required)
    .reference("parent", EntityTypeTag::TaxonomyTerm, ReferencePolicy::Required)
}

fn user() -> EntityProfile {
    EntityProfile::new(
        EntityTypeTag::User,
        "uid",
        "SELECT uid, name, pass, mail, signature, signature_format, created, access, login, \
         status, timezone, language, picture, init FROM users WHERE uid > 0 ORDER BY uid",
    )
}

fn file() -> EntityProfile {
    EntityProfile::new(
        EntityTypeTag::File,
        "fid",
        "SELECT fid, uid, filename, uri, filemime, filesize, status, timestamp \
         FROM file_managed ORDER BY fid",
    )
    .depends_on(&[EntityTypeTag::User])
    .reference("uid", EntityTypeTag::User, ReferencePolicy::Optional)
}

fn article() -> EntityProfile {
    EntityProfile::new(EntityTypeTag::NodeArticle, "nid", &node_query("article"))
        .depends_on(&[EntityTypeTag::User, EntityTypeTag::File, EntityTypeTag::TaxonomyTerm])
        .reference("uid", EntityTypeTag::User, ReferencePolicy::Optional)
        .field(body())
        .field(merged_terms("field_tags", "field_data_field_tags", "field_tags_tid"))
        .field(
            FieldShape::structured(
                "field_image",
                "SELECT i.delta, i.field_image_fid, \
                 a.field_file_image_alt_text_value AS alt, \
                 t.field_file_image_title_text_value AS title, \
                 i.field_image_width AS width, i.field_image_height AS height \
                 FROM field_data_field_image i \
                 LEFT JOIN field_data_field_file_image_alt_text a ON a.entity_id = i.field_image_fid \
                 LEFT JOIN field_data_field_file_image_title_text t ON t.entity_id = i.field_image_fid \
                 WHERE i.entity_id = :parent ORDER BY i.delta",
            )
            .attribute("alt", "alt")
            .attribute("title", "title")
            .attribute("width", "width")
            .attribute("height", "height")
            .reference("field_image_fid", EntityTypeTag::File)
            .ordered_by("delta"),
        )
        .field(attachments())
}

fn page() -> EntityProfile {
    EntityProfile::new(EntityTypeTag::NodePage, "nid", &node_query("page"))
        .depends_on(&[EntityTypeTag::User, EntityTypeTag::File])
        .reference("uid", EntityTypeTag::User, ReferencePolicy::Optional)
        .field(body())
        .field(attachments())
}

fn website() -> EntityProfile {
    EntityProfile::new(EntityTypeTag::NodeWebsite, "nid", &node_query("website"))
        .depends_on(&[EntityTypeTag::User, EntityTypeTag::File, EntityTypeTag::TaxonomyTerm])
        .reference("uid", EntityTypeTag::User, ReferencePolicy::Optional)
        .field(body())
        .field(merged_terms(
            "field_website_type",
            "field_data_field_website_type",
            "field_website_type_tid",
        ))
        .field(merged_terms(
            "field_website_technology",
            "field_data_field_website_technology",
            "field_website_technology_tid",
        ))
        .field(
            FieldShape::structured(
                "field_website_image",
                "SELECT delta, field_website_image_fid, field_website_image_alt AS alt, \
                 field_website_image_title AS title, field_website_image_width AS width, \
                 field_website_image_height AS height FROM field_data_field_website_image \
                 WHERE entity_id = :parent ORDER BY delta",
            )
            .attribute("alt", "alt")
            .attribute("title", "title")
            .attribute("width", "width")
            .attribute("height", "height")
            .reference("field_website_image_fid", EntityTypeTag::File)
            .ordered_by("delta"),
        )
        .field(
            FieldShape::structured(
                "field_website_link",
                "SELECT delta, field_website_link_url AS url, \
                 field_website_link_title AS title FROM field_data_field_website_link \
                 WHERE entity_id = :parent ORDER BY delta",
            )
            .attribute("url", "uri")
            .attribute("title", "title")
            .ordered_by("delta"),
        )
        .field(
            FieldShape::structured(
                "field_website_dev_date",
                "SELECT delta, field_website_dev_date_value AS start_date, \
                 field_website_dev_date_value2 AS end_date FROM field_data_field_website_dev_date \
                 WHERE entity_id = :parent ORDER BY delta",
            )
            .attribute("start_date", "value")
            .attribute("end_date", "end_value")
            .ordered_by("delta"),
        )
}

fn book() -> EntityProfile {
    let mut profile = EntityProfile::new(
        EntityTypeTag::NodeBook,
        "nid",
        "SELECT b.nid, b.bid, ml.mlid, ml.plid, ml.weight, ml.has_children, ml.depth, \
         ml.p1, ml.p2, ml.p3, ml.p4, ml.p5, ml.p6, ml.p7, ml.p8, ml.p9, \
         n.vid, n.type, n.language, n.title, n.uid, n.status, n.created, n.changed, \
         n.promote, n.sticky \
         FROM book b \
         INNER JOIN menu_links ml ON b.mlid = ml.mlid \
         INNER JOIN node n ON b.nid = n.nid \
         WHERE n.type = 'book' \
         ORDER BY ml.p1, ml.p2, ml.p3, ml.p4, ml.p5, ml.p6, ml.p7, ml.p8, ml.p9",
    )
    .depends_on(&[EntityTypeTag::User, EntityTypeTag::TaxonomyTerm])
    .reference("uid", EntityTypeTag::User, ReferencePolicy::Optional)
    .field(body())
    .field(merged_terms("field_tags", "field_data_field_tags", "field_tags_tid"));
    profile.hierarchy = Some(HierarchyColumns::outline());
    profile
}

fn comment() -> EntityProfile {
    let mut depends_on = vec![EntityTypeTag::User];
    depends_on.extend(EntityTypeTag::NODES);

    let mut profile = EntityProfile::new(
        EntityTypeTag::Comment,
        "cid",
        "SELECT c.cid, c.pid, c.nid, c.uid, c.subject, c.hostname, c.created, c.changed, \
         c.status, c.thread, c.name, c.mail, c.homepage, n.type AS node_type \
         FROM comment c INNER JOIN node n ON c.nid = n.nid ORDER BY c.created, c.cid",
    )
    .depends_on(&depends_on)
    .reference("uid", EntityTypeTag::User, ReferencePolicy::Optional)
    .reference("pid", EntityTypeTag::Comment, ReferencePolicy::Required)
    .field(
        FieldShape::structured(
            "comment_body",
            "SELECT comment_body_value, comment_body_format FROM field_data_comment_body \
             WHERE entity_id = :parent ORDER BY delta",
        )
        .attribute("comment_body_value", "value")
        .attribute("comment_body_format", "format"),
    );
    profile.references.insert(
        0,
        ReferenceRule {
            column: "nid".to_string(),
            target: ReferenceTarget::NodeBundle { column: "node_type".to_string() },
            policy: ReferencePolicy::Owner,
        },
    );
    profile
}

fn url_alias() -> EntityProfile {
    let mut depends_on = EntityTypeTag::NODES.to_vec();
    depends_on.extend([EntityTypeTag::User, EntityTypeTag::TaxonomyTerm]);

    let mut profile = EntityProfile::new(
        EntityTypeTag::UrlAlias,
        "pid",
        "SELECT pid, source, alias, language FROM url_alias ORDER BY pid",
    )
    .depends_on(&depends_on);
    profile
        .paths
        .push(PathColumn { column: "source".to_string(), policy: ReferencePolicy::Required });
    profile
}
