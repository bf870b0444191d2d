use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use content_migrate_core::MigrationPlan;
use tracing_subscriber::EnvFilter;

/// Load the migration plan from YAML, or fall back to the built-in order.
///
/// # Errors
/// Returns an error when the file cannot be read, does not parse, or the plan
/// fails validation.
pub fn load_plan(path: Option<&Path>) -> Result<MigrationPlan> {
    let plan = match path {
        Some(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read plan file {}", path.display()))?;
            serde_yaml::from_str::<MigrationPlan>(&body)
                .with_context(|| format!("failed to parse plan file {}", path.display()))?
        }
        None => MigrationPlan::default(),
    };
    plan.validate().map_err(|err| anyhow!("invalid migration plan: {err}"))?;
    Ok(plan)
}

/// Install the stderr log subscriber. `--log-level` wins over `RUST_LOG`.
///
/// # Errors
/// Returns an error for an unparsable filter directive.
pub fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level directive: {level}"))?,
        None => EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}
