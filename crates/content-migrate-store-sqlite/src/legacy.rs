use std::path::Path;

use anyhow::{Context, Result};
use content_migrate_core::{
    EntityProfile, EntityTypeTag, FieldShape, LegacyId, LegacyLink, LegacyRow, LinkId,
    MigrateError, NodeTypeLookup, ParentContentLookup, Record, RowSource, SatelliteRecord,
    ScalarValue,
};
use rusqlite::types::ValueRef;
use rusqlite::{named_params, params, Connection, OpenFlags, OptionalExtension, Params};

/// Legacy tables read by the built-in entity profiles.
///
/// Only the columns the profiles select are declared. Useful for fixtures and
/// for checking a dump before pointing a run at it.
pub const LEGACY_SCHEMA_SQL: &str = r"
CREATE TABLE users (
  uid INTEGER PRIMARY KEY,
  name TEXT NOT NULL DEFAULT '',
  pass TEXT NOT NULL DEFAULT '',
  mail TEXT DEFAULT '',
  signature TEXT NOT NULL DEFAULT '',
  signature_format TEXT,
  created INTEGER NOT NULL DEFAULT 0,
  access INTEGER NOT NULL DEFAULT 0,
  login INTEGER NOT NULL DEFAULT 0,
  status INTEGER NOT NULL DEFAULT 0,
  timezone TEXT,
  language TEXT NOT NULL DEFAULT '',
  picture INTEGER NOT NULL DEFAULT 0,
  init TEXT DEFAULT ''
);

CREATE TABLE taxonomy_vocabulary (
  vid INTEGER PRIMARY KEY,
  name TEXT NOT NULL DEFAULT '',
  machine_name TEXT NOT NULL DEFAULT '',
  description TEXT,
  hierarchy INTEGER NOT NULL DEFAULT 0,
  module TEXT NOT NULL DEFAULT '',
  weight INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE taxonomy_term_data (
  tid INTEGER PRIMARY KEY,
  vid INTEGER NOT NULL DEFAULT 0,
  name TEXT NOT NULL DEFAULT '',
  description TEXT,
  format TEXT,
  weight INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE taxonomy_term_hierarchy (
  tid INTEGER NOT NULL DEFAULT 0,
  parent INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (tid, parent)
);

CREATE TABLE file_managed (
  fid INTEGER PRIMARY KEY,
  uid INTEGER NOT NULL DEFAULT 0,
  filename TEXT NOT NULL DEFAULT '',
  uri TEXT NOT NULL DEFAULT '',
  filemime TEXT NOT NULL DEFAULT '',
  filesize INTEGER NOT NULL DEFAULT 0,
  status INTEGER NOT NULL DEFAULT 0,
  timestamp INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE node (
  nid INTEGER PRIMARY KEY,
  vid INTEGER,
  type TEXT NOT NULL DEFAULT '',
  language TEXT NOT NULL DEFAULT '',
  title TEXT NOT NULL DEFAULT '',
  uid INTEGER NOT NULL DEFAULT 0,
  status INTEGER NOT NULL DEFAULT 1,
  created INTEGER NOT NULL DEFAULT 0,
  changed INTEGER NOT NULL DEFAULT 0,
  promote INTEGER NOT NULL DEFAULT 0,
  sticky INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE field_data_body (
  entity_id INTEGER NOT NULL,
  delta INTEGER NOT NULL DEFAULT 0,
  body_value TEXT,
  body_summary TEXT,
  body_format TEXT
);

CREATE TABLE field_data_field_tags (
  entity_id INTEGER NOT NULL,
  delta INTEGER NOT NULL DEFAULT 0,
  field_tags_tid INTEGER
);

CREATE TABLE field_data_field_image (
  entity_id INTEGER NOT NULL,
  delta INTEGER NOT NULL DEFAULT 0,
  field_image_fid INTEGER,
  field_image_width INTEGER,
  field_image_height INTEGER
);

CREATE TABLE field_data_field_file_image_alt_text (
  entity_id INTEGER NOT NULL,
  field_file_image_alt_text_value TEXT
);

CREATE TABLE field_data_field_file_image_title_text (
  entity_id INTEGER NOT NULL,
  field_file_image_title_text_value TEXT
);

CREATE TABLE field_data_field_attachment (
  entity_id INTEGER NOT NULL,
  delta INTEGER NOT NULL DEFAULT 0,
  field_attachment_fid INTEGER,
  field_attachment_display INTEGER NOT NULL DEFAULT 1,
  field_attachment_description TEXT
);

CREATE TABLE field_data_field_website_type (
  entity_id INTEGER NOT NULL,
  delta INTEGER NOT NULL DEFAULT 0,
  field_website_type_tid INTEGER
);

CREATE TABLE field_data_field_website_technology (
  entity_id INTEGER NOT NULL,
  delta INTEGER NOT NULL DEFAULT 0,
  field_website_technology_tid INTEGER
);

CREATE TABLE field_data_field_website_image (
  entity_id INTEGER NOT NULL,
  delta INTEGER NOT NULL DEFAULT 0,
  field_website_image_fid INTEGER,
  field_website_image_alt TEXT,
  field_website_image_title TEXT,
  field_website_image_width INTEGER,
  field_website_image_height INTEGER
);

CREATE TABLE field_data_field_website_link (
  entity_id INTEGER NOT NULL,
  delta INTEGER NOT NULL DEFAULT 0,
  field_website_link_url TEXT,
  field_website_link_title TEXT
);

CREATE TABLE field_data_field_website_dev_date (
  entity_id INTEGER NOT NULL,
  delta INTEGER NOT NULL DEFAULT 0,
  field_website_dev_date_value TEXT,
  field_website_dev_date_value2 TEXT
);

CREATE TABLE menu_links (
  mlid INTEGER PRIMARY KEY,
  plid INTEGER NOT NULL DEFAULT 0,
  weight INTEGER NOT NULL DEFAULT 0,
  has_children INTEGER NOT NULL DEFAULT 0,
  depth INTEGER NOT NULL DEFAULT 0,
  p1 INTEGER NOT NULL DEFAULT 0,
  p2 INTEGER NOT NULL DEFAULT 0,
  p3 INTEGER NOT NULL DEFAULT 0,
  p4 INTEGER NOT NULL DEFAULT 0,
  p5 INTEGER NOT NULL DEFAULT 0,
  p6 INTEGER NOT NULL DEFAULT 0,
  p7 INTEGER NOT NULL DEFAULT 0,
  p8 INTEGER NOT NULL DEFAULT 0,
  p9 INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE book (
  mlid INTEGER PRIMARY KEY,
  nid INTEGER NOT NULL UNIQUE,
  bid INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE comment (
  cid INTEGER PRIMARY KEY,
  pid INTEGER NOT NULL DEFAULT 0,
  nid INTEGER NOT NULL DEFAULT 0,
  uid INTEGER NOT NULL DEFAULT 0,
  subject TEXT NOT NULL DEFAULT '',
  hostname TEXT NOT NULL DEFAULT '',
  created INTEGER NOT NULL DEFAULT 0,
  changed INTEGER NOT NULL DEFAULT 0,
  status INTEGER NOT NULL DEFAULT 1,
  thread TEXT NOT NULL DEFAULT '',
  name TEXT,
  mail TEXT,
  homepage TEXT
);

CREATE TABLE field_data_comment_body (
  entity_id INTEGER NOT NULL,
  delta INTEGER NOT NULL DEFAULT 0,
  comment_body_value TEXT,
  comment_body_format TEXT
);

CREATE TABLE url_alias (
  pid INTEGER PRIMARY KEY,
  source TEXT NOT NULL DEFAULT '',
  alias TEXT NOT NULL DEFAULT '',
  language TEXT NOT NULL DEFAULT ''
);
";

/// Read-only view of a legacy database, driven by entity profiles.
pub struct SqliteLegacySource {
    conn: Connection,
}

impl SqliteLegacySource {
    /// Open a legacy database read-only.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open legacy database at {}", path.display()))?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    fn query_records<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Record>> {
        let mut stmt =
            self.conn.prepare(sql).with_context(|| format!("failed to prepare legacy query: {sql}"))?;
        let names = stmt.column_names().into_iter().map(str::to_string).collect::<Vec<_>>();

        let mut rows = stmt.query(params).context("failed to run legacy query")?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().context("failed to read legacy row")? {
            let mut record = Record::new();
            for (index, name) in names.iter().enumerate() {
                let value = row
                    .get_ref(index)
                    .with_context(|| format!("failed to read legacy column `{name}`"))?;
                record.insert(name, scalar(value));
            }
            records.push(record);
        }
        Ok(records)
    }
}

fn scalar(value: ValueRef<'_>) -> ScalarValue {
    match value {
        ValueRef::Null => ScalarValue::Null,
        ValueRef::Integer(value) => ScalarValue::Integer(value),
        ValueRef::Real(value) => ScalarValue::Real(value),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            ScalarValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn extraction(err: &anyhow::Error) -> MigrateError {
    MigrateError::Extraction(format!("{err:#}"))
}

impl RowSource for SqliteLegacySource {
    fn rows(&self, profile: &EntityProfile) -> Result<Vec<LegacyRow>, MigrateError> {
        self.query_records(&profile.query, [])
            .with_context(|| format!("failed to extract {} rows", profile.entity_type))
            .map_err(|err| extraction(&err))
    }

    fn satellites(
        &self,
        shape: &FieldShape,
        parent: LegacyId,
    ) -> Result<Vec<SatelliteRecord>, MigrateError> {
        self.query_records(&shape.query, named_params! { ":parent": i64::from(parent.0) })
            .with_context(|| format!("failed to extract `{}` for {parent}", shape.field))
            .map_err(|err| extraction(&err))
    }
}

impl ParentContentLookup for SqliteLegacySource {
    fn link(&self, link_id: LinkId) -> Result<Option<LegacyLink>, MigrateError> {
        let row = self
            .conn
            .query_row(
                "SELECT ml.mlid, ml.plid, b.nid FROM menu_links ml
                 LEFT JOIN book b ON b.mlid = ml.mlid
                 WHERE ml.mlid = ?1",
                params![i64::from(link_id.0)],
                |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, Option<i64>>(2)?))
                },
            )
            .optional()
            .with_context(|| format!("failed to read outline link {link_id}"))
            .map_err(|err| extraction(&err))?;

        let Some((mlid, plid, nid)) = row else {
            return Ok(None);
        };
        let id = |raw: i64| {
            u32::try_from(raw).map_err(|_| {
                MigrateError::Extraction(format!("outline link {link_id} has an invalid id: {raw}"))
            })
        };
        Ok(Some(LegacyLink {
            link_id: LinkId(id(mlid)?),
            parent_link_id: LinkId(id(plid)?),
            entity_id: nid.map(id).transpose()?.map(LegacyId),
        }))
    }
}

impl NodeTypeLookup for SqliteLegacySource {
    fn node_type(&self, legacy_id: LegacyId) -> Result<Option<EntityTypeTag>, MigrateError> {
        let bundle = self
            .conn
            .query_row(
                "SELECT type FROM node WHERE nid = ?1",
                params![i64::from(legacy_id.0)],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read node type of {legacy_id}"))
            .map_err(|err| extraction(&err))?;

        Ok(bundle.as_deref().and_then(EntityTypeTag::from_node_bundle))
    }
}
