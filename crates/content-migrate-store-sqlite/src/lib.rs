use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use content_migrate_core::{
    Destination, EntityTypeTag, IdMapStore, IdentifierMapping, LegacyId, MigrateError,
    MigrationPlan, NewId, RunSummary, TransformedRow,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

mod legacy;

pub use legacy::{SqliteLegacySource, LEGACY_SCHEMA_SQL};

const LATEST_SCHEMA_VERSION: i64 = 2;

const ID_MAP_FILE: &str = "id_map.ndjson";
const ENTITIES_FILE: &str = "migrated_entities.ndjson";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS id_map (
  partition TEXT NOT NULL,
  legacy_id INTEGER NOT NULL CHECK (legacy_id > 0),
  new_id INTEGER NOT NULL CHECK (new_id >= 0),
  created_at TEXT NOT NULL,
  PRIMARY KEY (partition, legacy_id)
);

CREATE INDEX IF NOT EXISTS idx_id_map_new_id ON id_map(partition, new_id);

CREATE TRIGGER IF NOT EXISTS id_map_no_update
BEFORE UPDATE ON id_map
BEGIN
  SELECT RAISE(ABORT, 'id_map is append-only');
END;

CREATE TRIGGER IF NOT EXISTS id_map_no_delete
BEFORE DELETE ON id_map
BEGIN
  SELECT RAISE(ABORT, 'id_map is append-only');
END;
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS migrated_entities (
  new_id INTEGER PRIMARY KEY AUTOINCREMENT,
  entity_type TEXT NOT NULL,
  legacy_id INTEGER NOT NULL CHECK (legacy_id > 0),
  document_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (entity_type, legacy_id)
);

CREATE TABLE IF NOT EXISTS migration_runs (
  run_id TEXT PRIMARY KEY,
  started_at TEXT NOT NULL,
  finished_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  plan_json TEXT NOT NULL,
  summary_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_migration_runs_started_at ON migration_runs(started_at);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MapStats {
    pub total: u64,
    pub partitions: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_mappings: usize,
    pub skipped_existing_mappings: usize,
    pub imported_entities: usize,
    pub skipped_existing_entities: usize,
}

/// One persisted destination document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigratedEntity {
    pub new_id: NewId,
    pub entity_type: EntityTypeTag,
    pub legacy_id: LegacyId,
    pub created_at: String,
    pub document: TransformedRow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    /// Destination documents whose mapping row is missing.
    pub unmapped_entities: u64,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub plan: MigrationPlan,
    pub summary: Option<RunSummary>,
}

impl SqliteStore {
    /// Open the target database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer
    /// than this build supports.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in [(1_i64, MIGRATION_001_SQL), (2_i64, MIGRATION_002_SQL)] {
            if version < target {
                self.apply_migration(target, sql)?;
                tracing::info!(version = target, "applied schema migration");
            }
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now_rfc3339()?],
        )
        .with_context(|| format!("failed to record migration version {version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        Ok(())
    }

    /// Record one `(entity type, legacy id) -> new id` association.
    ///
    /// # Errors
    /// Returns an error for the reserved legacy id `0`, when a mapping for the
    /// key already exists, or when the insert fails.
    pub fn insert_mapping(&self, mapping: &IdentifierMapping) -> Result<()> {
        insert_mapping(&self.conn, mapping, &now_rfc3339()?)
    }

    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn lookup_mapping(
        &self,
        entity_type: EntityTypeTag,
        legacy_id: LegacyId,
    ) -> Result<Option<NewId>> {
        let new_id = self
            .conn
            .query_row(
                "SELECT new_id FROM id_map WHERE partition = ?1 AND legacy_id = ?2",
                params![entity_type.partition(), i64::from(legacy_id.0)],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up mapping for {entity_type}/{legacy_id}"))?;

        new_id.map(|raw| to_u32(raw, "new_id").map(NewId)).transpose()
    }

    /// List mappings ordered by partition and legacy id, optionally restricted to one type.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_mappings(&self, entity_type: Option<EntityTypeTag>) -> Result<Vec<IdentifierMapping>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT partition, legacy_id, new_id FROM id_map
                 WHERE ?1 IS NULL OR partition = ?1
                 ORDER BY partition, legacy_id",
            )
            .context("failed to prepare mapping listing")?;
        let rows = stmt.query_map(params![entity_type.map(EntityTypeTag::partition)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut mappings = Vec::new();
        for row in rows {
            let (partition, legacy_id, new_id) = row.context("failed to read mapping row")?;
            mappings.push(IdentifierMapping {
                entity_type: parse_partition(&partition)?,
                legacy_id: LegacyId(to_u32(legacy_id, "legacy_id")?),
                new_id: NewId(to_u32(new_id, "new_id")?),
            });
        }
        Ok(mappings)
    }

    /// Mapping counts per partition.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn stats(&self) -> Result<MapStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT partition, COUNT(*) FROM id_map GROUP BY partition ORDER BY partition")
            .context("failed to prepare mapping stats")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut partitions = BTreeMap::new();
        for row in rows {
            let (partition, count) = row.context("failed to read mapping stats row")?;
            partitions.insert(partition, u64::try_from(count).unwrap_or(0));
        }
        Ok(MapStats { total: partitions.values().sum(), partitions })
    }

    /// Persist a transformed row and its mapping in one transaction.
    ///
    /// The document's autoincrement key becomes the new id, and the stored
    /// document carries it wherever the row refers to itself.
    ///
    /// # Errors
    /// Returns an error when the row was already written or any insert fails.
    pub fn write_entity(&self, entity_type: EntityTypeTag, row: &TransformedRow) -> Result<NewId> {
        if row.legacy_id.is_none() {
            return Err(anyhow!("cannot persist {entity_type} row with legacy id 0"));
        }
        let now = now_rfc3339()?;

        let tx = self.conn.unchecked_transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO migrated_entities(entity_type, legacy_id, document_json, created_at)
             VALUES (?1, ?2, '{}', ?3)",
            params![entity_type.as_str(), i64::from(row.legacy_id.0), now],
        )
        .with_context(|| format!("failed to insert {entity_type}/{} document", row.legacy_id))?;
        let new_id = NewId(to_u32(tx.last_insert_rowid(), "new_id")?);

        // The key is only known after the insert; self references are filled in from it.
        let mut assigned = row.clone();
        assigned.assign_new_id(new_id);
        let document =
            serde_json::to_string(&assigned).context("failed to serialize entity document")?;
        tx.execute(
            "UPDATE migrated_entities SET document_json = ?1 WHERE new_id = ?2",
            params![document, i64::from(new_id.0)],
        )
        .with_context(|| format!("failed to store {entity_type}/{} document", row.legacy_id))?;

        insert_mapping(
            &tx,
            &IdentifierMapping { entity_type, legacy_id: row.legacy_id, new_id },
            &now,
        )?;
        tx.commit().context("failed to commit entity write")?;
        Ok(new_id)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or its document cannot be decoded.
    pub fn load_entity(&self, new_id: NewId) -> Result<Option<MigratedEntity>> {
        let row = self
            .conn
            .query_row(
                "SELECT new_id, entity_type, legacy_id, created_at, document_json
                 FROM migrated_entities WHERE new_id = ?1",
                params![i64::from(new_id.0)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load migrated entity {new_id}"))?;

        row.map(decode_entity).transpose()
    }

    fn list_entities(&self) -> Result<Vec<MigratedEntity>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT new_id, entity_type, legacy_id, created_at, document_json
                 FROM migrated_entities ORDER BY new_id",
            )
            .context("failed to prepare entity listing")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(decode_entity(row.context("failed to read entity row")?)?);
        }
        Ok(entities)
    }

    /// Open a run ledger entry.
    ///
    /// # Errors
    /// Returns an error when the plan cannot be serialized or the insert fails.
    pub fn begin_run(&self, plan: &MigrationPlan) -> Result<RunId> {
        let run_id = RunId::new();
        self.conn
            .execute(
                "INSERT INTO migration_runs(run_id, started_at, status, plan_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    run_id.to_string(),
                    now_rfc3339()?,
                    RunStatus::Running.as_str(),
                    serde_json::to_string(plan).context("failed to serialize migration plan")?,
                ],
            )
            .context("failed to record run start")?;
        Ok(run_id)
    }

    /// Close a run ledger entry.
    ///
    /// # Errors
    /// Returns an error when the run does not exist or the update fails.
    pub fn finish_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        summary: Option<&RunSummary>,
    ) -> Result<()> {
        let summary_json = summary
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize run summary")?;
        let updated = self
            .conn
            .execute(
                "UPDATE migration_runs SET finished_at = ?2, status = ?3, summary_json = ?4
                 WHERE run_id = ?1",
                params![run_id.to_string(), now_rfc3339()?, status.as_str(), summary_json],
            )
            .context("failed to record run finish")?;
        if updated == 0 {
            return Err(anyhow!("unknown run id {run_id}"));
        }
        Ok(())
    }

    /// Runs ordered by start time, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, started_at, finished_at, status, plan_json, summary_json
                 FROM migration_runs ORDER BY started_at DESC, run_id DESC",
            )
            .context("failed to prepare run listing")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut runs = Vec::new();
        for row in rows {
            let (run_id, started_at, finished_at, status, plan_json, summary_json) =
                row.context("failed to read run row")?;
            runs.push(RunRecord {
                run_id: RunId(
                    Ulid::from_string(&run_id).with_context(|| format!("invalid ULID: {run_id}"))?,
                ),
                started_at,
                finished_at,
                status: RunStatus::parse(&status)?,
                plan: serde_json::from_str(&plan_json).context("failed to decode run plan")?,
                summary: summary_json
                    .map(|json| serde_json::from_str(&json))
                    .transpose()
                    .context("failed to decode run summary")?,
            });
        }
        Ok(runs)
    }

    /// Export mappings and documents as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let mappings = self.list_mappings(None)?;
        let entities = self.list_entities()?;

        let map_digest = write_ndjson_file(&out_dir.join(ID_MAP_FILE), &mappings)?;
        let entity_digest = write_ndjson_file(&out_dir.join(ENTITIES_FILE), &entities)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: ID_MAP_FILE.to_string(),
                    sha256: map_digest.0,
                    records: map_digest.1,
                },
                ExportFileDigest {
                    path: ENTITIES_FILE.to_string(),
                    sha256: entity_digest.0,
                    records: entity_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when the manifest does not verify, a row already exists
    /// and `skip_existing` is off, or any write fails.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let entities = read_ndjson_file::<MigratedEntity>(&in_dir.join(ENTITIES_FILE))?;
        let mappings = read_ndjson_file::<IdentifierMapping>(&in_dir.join(ID_MAP_FILE))?;

        let mut summary = ImportSummary {
            imported_mappings: 0,
            skipped_existing_mappings: 0,
            imported_entities: 0,
            skipped_existing_entities: 0,
        };

        let tx = self.conn.transaction().context("failed to start import transaction")?;
        for entity in entities {
            let exists = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM migrated_entities WHERE entity_type = ?1 AND legacy_id = ?2)",
                    params![entity.entity_type.as_str(), i64::from(entity.legacy_id.0)],
                    |row| row.get::<_, i64>(0),
                )
                .context("failed to check for existing entity")?;
            if exists == 1 {
                if skip_existing {
                    summary.skipped_existing_entities += 1;
                    continue;
                }
                return Err(anyhow!(
                    "entity already exists for {}/{}",
                    entity.entity_type,
                    entity.legacy_id
                ));
            }

            tx.execute(
                "INSERT INTO migrated_entities(new_id, entity_type, legacy_id, document_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    i64::from(entity.new_id.0),
                    entity.entity_type.as_str(),
                    i64::from(entity.legacy_id.0),
                    serde_json::to_string(&entity.document)
                        .context("failed to serialize entity document")?,
                    entity.created_at,
                ],
            )
            .with_context(|| format!("failed to import entity {}", entity.new_id))?;
            summary.imported_entities += 1;
        }

        let now = now_rfc3339()?;
        for mapping in mappings {
            if mapping_exists(&tx, mapping.entity_type, mapping.legacy_id)? {
                if skip_existing {
                    summary.skipped_existing_mappings += 1;
                    continue;
                }
                return Err(anyhow!(
                    "mapping already exists for {}/{}",
                    mapping.entity_type,
                    mapping.legacy_id
                ));
            }
            insert_mapping(&tx, &mapping, &now)?;
            summary.imported_mappings += 1;
        }
        tx.commit().context("failed to commit snapshot import")?;

        Ok(summary)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()
    }

    /// Run quick-check, mapping coverage and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let unmapped_entities = if schema_status.current_version >= 2 {
            self.count_unmapped_entities()?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            unmapped_entities,
            schema_status,
        })
    }

    fn count_unmapped_entities(&self) -> Result<u64> {
        let mut unmapped = 0_u64;
        for entity in self.list_entity_keys()? {
            let (entity_type, legacy_id, new_id) = entity;
            if self.lookup_mapping(entity_type, legacy_id)? != Some(new_id) {
                unmapped += 1;
            }
        }
        Ok(unmapped)
    }

    fn list_entity_keys(&self) -> Result<Vec<(EntityTypeTag, LegacyId, NewId)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT entity_type, legacy_id, new_id FROM migrated_entities ORDER BY new_id")
            .context("failed to prepare entity key listing")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut keys = Vec::new();
        for row in rows {
            let (entity_type, legacy_id, new_id) = row.context("failed to read entity key")?;
            keys.push((
                parse_entity_type(&entity_type)?,
                LegacyId(to_u32(legacy_id, "legacy_id")?),
                NewId(to_u32(new_id, "new_id")?),
            ));
        }
        Ok(keys)
    }
}

impl IdMapStore for SqliteStore {
    fn lookup(
        &self,
        entity_type: EntityTypeTag,
        legacy_id: LegacyId,
    ) -> Result<Option<NewId>, MigrateError> {
        self.lookup_mapping(entity_type, legacy_id)
            .map_err(|err| MigrateError::Store(format!("{err:#}")))
    }
}

impl Destination for SqliteStore {
    fn write(
        &self,
        entity_type: EntityTypeTag,
        row: &TransformedRow,
    ) -> Result<NewId, MigrateError> {
        self.write_entity(entity_type, row)
            .map_err(|err| MigrateError::Destination(format!("{err:#}")))
    }
}

fn insert_mapping(conn: &Connection, mapping: &IdentifierMapping, created_at: &str) -> Result<()> {
    if mapping.legacy_id.is_none() {
        return Err(anyhow!(
            "legacy id 0 is reserved and cannot be mapped ({})",
            mapping.entity_type
        ));
    }
    if mapping_exists(conn, mapping.entity_type, mapping.legacy_id)? {
        return Err(anyhow!(
            "mapping already exists for {}/{}",
            mapping.entity_type,
            mapping.legacy_id
        ));
    }

    conn.execute(
        "INSERT INTO id_map(partition, legacy_id, new_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            mapping.entity_type.partition(),
            i64::from(mapping.legacy_id.0),
            i64::from(mapping.new_id.0),
            created_at,
        ],
    )
    .with_context(|| {
        format!("failed to insert mapping for {}/{}", mapping.entity_type, mapping.legacy_id)
    })?;
    Ok(())
}

fn mapping_exists(conn: &Connection, entity_type: EntityTypeTag, legacy_id: LegacyId) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM id_map WHERE partition = ?1 AND legacy_id = ?2)",
            params![entity_type.partition(), i64::from(legacy_id.0)],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check mapping for {entity_type}/{legacy_id}"))?;
    Ok(exists == 1)
}

fn decode_entity(row: (i64, String, i64, String, String)) -> Result<MigratedEntity> {
    let (new_id, entity_type, legacy_id, created_at, document_json) = row;
    Ok(MigratedEntity {
        new_id: NewId(to_u32(new_id, "new_id")?),
        entity_type: parse_entity_type(&entity_type)?,
        legacy_id: LegacyId(to_u32(legacy_id, "legacy_id")?),
        created_at,
        document: serde_json::from_str(&document_json)
            .with_context(|| format!("failed to decode document for entity {new_id}"))?,
    })
}

fn parse_partition(raw: &str) -> Result<EntityTypeTag> {
    EntityTypeTag::from_partition(raw).ok_or_else(|| anyhow!("unknown id map partition: {raw}"))
}

fn parse_entity_type(raw: &str) -> Result<EntityTypeTag> {
    EntityTypeTag::parse(raw).ok_or_else(|| anyhow!("unknown entity type: {raw}"))
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("{column} out of range: {value}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version != LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; expected {LATEST_SCHEMA_VERSION}",
            manifest.schema_version
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [ID_MAP_FILE, ENTITIES_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
