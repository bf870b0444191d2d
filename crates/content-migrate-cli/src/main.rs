use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use content_migrate_core::{
    builtin_profiles, profile, BatchRunner, EntityTypeTag, IdResolver, LegacyId, MigrationPlan,
    PathRewriter, RowErrorPolicy, RowPipeline,
};
use content_migrate_store_sqlite::{RunStatus, SqliteLegacySource, SqliteStore};
use serde_json::Value;

mod config;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "dmig")]
#[command(about = "Legacy content migration CLI")]
struct Cli {
    /// Identifier map and destination database.
    #[arg(long, default_value = "./content_migrate.sqlite3")]
    target_db: PathBuf,

    /// SQLite copy of the legacy schema (opened read-only).
    #[arg(long)]
    legacy_db: Option<PathBuf>,

    /// YAML migration plan; the built-in order is used when absent.
    #[arg(long)]
    plan: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Map {
        #[command(subcommand)]
        command: MapCommand,
    },
    Path {
        #[command(subcommand)]
        command: PathCommand,
    },
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
    Run(RunArgs),
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum MapCommand {
    Lookup {
        #[arg(long)]
        entity_type: EntityTypeTag,
        #[arg(long)]
        legacy_id: LegacyId,
    },
    List {
        #[arg(long)]
        entity_type: Option<EntityTypeTag>,
    },
    Stats,
}

#[derive(Debug, Subcommand)]
enum PathCommand {
    Rewrite {
        #[arg(long)]
        path: String,
    },
}

#[derive(Debug, Subcommand)]
enum ProfileCommand {
    List,
    Show {
        #[arg(long)]
        entity_type: EntityTypeTag,
    },
}

#[derive(Debug, Subcommand)]
enum PlanCommand {
    Show,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Restrict the run to these entity types, keeping plan order.
    #[arg(long = "only")]
    only: Vec<EntityTypeTag>,
    #[arg(long)]
    max_passes: Option<u32>,
    #[arg(long, default_value_t = false)]
    continue_on_error: bool,
}

#[derive(Debug, Subcommand)]
enum RunsCommand {
    List,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    config::init_tracing(cli.log_level.as_deref())?;

    match &cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.target_db)?;
            run_db(command, &mut store)
        }
        Command::Map { command } => {
            let mut store = SqliteStore::open(&cli.target_db)?;
            store.migrate()?;
            run_map(command, &store)
        }
        Command::Path { command } => {
            let mut store = SqliteStore::open(&cli.target_db)?;
            store.migrate()?;
            let legacy = open_legacy(&cli)?;
            run_path(command, &store, &legacy)
        }
        Command::Profile { command } => run_profile(command),
        Command::Plan { command } => match command {
            PlanCommand::Show => run_plan_show(&cli),
        },
        Command::Run(args) => run_migration(&cli, args),
        Command::Runs { command } => match command {
            RunsCommand::List => {
                let mut store = SqliteStore::open(&cli.target_db)?;
                store.migrate()?;
                emit_json(serde_json::json!({ "runs": store.list_runs()? }))
            }
        },
    }
}

fn open_legacy(cli: &Cli) -> Result<SqliteLegacySource> {
    let Some(path) = cli.legacy_db.as_ref() else {
        return Err(anyhow!("--legacy-db is required for this command"));
    };
    SqliteLegacySource::open(path)
}

fn run_db(command: &DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(args, store),
        DbCommand::Export(args) => {
            store.migrate()?;
            let manifest = store.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({ "out_dir": args.out, "manifest": manifest }))
        }
        DbCommand::Import(args) => {
            let summary = store.import_snapshot(&args.input, args.skip_existing)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "skip_existing": args.skip_existing,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({ "backup_path": args.out, "status": "ok" }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_map(command: &MapCommand, store: &SqliteStore) -> Result<()> {
    match command {
        MapCommand::Lookup { entity_type, legacy_id } => {
            let new_id = store.lookup_mapping(*entity_type, *legacy_id)?;
            emit_json(serde_json::json!({
                "entity_type": entity_type,
                "legacy_id": legacy_id,
                "found": new_id.is_some(),
                "new_id": new_id
            }))
        }
        MapCommand::List { entity_type } => {
            let mappings = store.list_mappings(*entity_type)?;
            emit_json(serde_json::json!({ "count": mappings.len(), "mappings": mappings }))
        }
        MapCommand::Stats => emit_json(
            serde_json::to_value(store.stats()?).context("failed to serialize mapping stats")?,
        ),
    }
}

fn run_path(command: &PathCommand, store: &SqliteStore, legacy: &SqliteLegacySource) -> Result<()> {
    match command {
        PathCommand::Rewrite { path } => {
            let rewriter = PathRewriter::new(IdResolver::new(store), legacy);
            let outcome = rewriter.classify(path).map_err(|err| anyhow!(err))?;
            emit_json(serde_json::json!({ "input": path, "outcome": outcome }))
        }
    }
}

fn run_profile(command: &ProfileCommand) -> Result<()> {
    match command {
        ProfileCommand::List => {
            let profiles = builtin_profiles()
                .into_iter()
                .map(|profile| {
                    serde_json::json!({
                        "entity_type": profile.entity_type,
                        "id_column": profile.id_column,
                        "depends_on": profile.depends_on,
                        "fields": profile.fields.iter().map(|shape| shape.field.as_str()).collect::<Vec<_>>(),
                        "hierarchy": profile.hierarchy.is_some()
                    })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "profiles": profiles }))
        }
        ProfileCommand::Show { entity_type } => emit_json(
            serde_json::to_value(profile(*entity_type)).context("failed to serialize profile")?,
        ),
    }
}

fn run_plan_show(cli: &Cli) -> Result<()> {
    let plan = config::load_plan(cli.plan.as_deref())?;
    emit_json(serde_json::json!({
        "source": cli.plan.as_ref().map_or_else(|| "builtin".to_string(), |path| path.display().to_string()),
        "plan": plan
    }))
}

fn effective_plan(cli: &Cli, args: &RunArgs) -> Result<MigrationPlan> {
    let mut plan = config::load_plan(cli.plan.as_deref())?;
    if !args.only.is_empty() {
        plan = plan.restricted(&args.only).map_err(|err| anyhow!(err))?;
    }
    if let Some(max_passes) = args.max_passes {
        plan.max_passes = max_passes;
    }
    if args.continue_on_error {
        plan.on_row_error = RowErrorPolicy::Continue;
    }
    plan.validate().map_err(|err| anyhow!("invalid migration plan: {err}"))?;
    Ok(plan)
}

fn run_migration(cli: &Cli, args: &RunArgs) -> Result<()> {
    let plan = effective_plan(cli, args)?;
    let legacy = open_legacy(cli)?;
    let mut store = SqliteStore::open(&cli.target_db)?;
    store.migrate()?;

    let run_id = store.begin_run(&plan)?;
    tracing::info!(%run_id, types = plan.order.len(), "migration run started");

    let outcome = {
        let pipeline = RowPipeline::new(&store, &legacy, &legacy);
        BatchRunner::new(&pipeline, &legacy, &store).run(&plan)
    };

    match outcome {
        Ok(summary) => {
            store.finish_run(run_id, RunStatus::Completed, Some(&summary))?;
            tracing::info!(
                %run_id,
                passes = summary.passes,
                emitted = summary.total_emitted(),
                still_skipped = summary.still_skipped.len(),
                "migration run completed"
            );
            emit_json(serde_json::json!({
                "run_id": run_id,
                "status": RunStatus::Completed,
                "plan": plan,
                "summary": summary
            }))
        }
        Err(err) => {
            store.finish_run(run_id, RunStatus::Failed, None)?;
            Err(anyhow!(err)).with_context(|| format!("migration run {run_id} failed"))
        }
    }
}
