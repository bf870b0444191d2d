use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{profile, EntityTypeTag, MigrateError};

pub const DEFAULT_MAX_PASSES: u32 = 3;

/// Dependency order used when no plan file is given.
pub const DEFAULT_ORDER: [EntityTypeTag; 10] = [
    EntityTypeTag::TaxonomyVocabulary,
    EntityTypeTag::TaxonomyTerm,
    EntityTypeTag::User,
    EntityTypeTag::File,
    EntityTypeTag::NodeArticle,
    EntityTypeTag::NodePage,
    EntityTypeTag::NodeWebsite,
    EntityTypeTag::NodeBook,
    EntityTypeTag::Comment,
    EntityTypeTag::UrlAlias,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorPolicy {
    /// Stop the run on the first row-level I/O failure.
    #[default]
    Abort,
    /// Count the failure and keep going.
    Continue,
}

/// Runtime configuration for one migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationPlan {
    pub order: Vec<EntityTypeTag>,
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,
    #[serde(default)]
    pub on_row_error: RowErrorPolicy,
}

fn default_max_passes() -> u32 {
    DEFAULT_MAX_PASSES
}

impl Default for MigrationPlan {
    fn default() -> Self {
        Self {
            order: DEFAULT_ORDER.to_vec(),
            max_passes: DEFAULT_MAX_PASSES,
            on_row_error: RowErrorPolicy::Abort,
        }
    }
}

impl MigrationPlan {
    /// Reject plans the batch runner cannot execute safely.
    ///
    /// Dependencies that are not part of the plan are assumed to be migrated
    /// already; only dependencies listed after their dependents are rejected.
    ///
    /// # Errors
    /// Returns [`MigrateError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<(), MigrateError> {
        if self.order.is_empty() {
            return Err(MigrateError::Config("plan order must not be empty".to_string()));
        }
        if self.max_passes == 0 {
            return Err(MigrateError::Config("max_passes must be at least 1".to_string()));
        }

        let mut seen = BTreeSet::new();
        for entity_type in &self.order {
            if !seen.insert(*entity_type) {
                return Err(MigrateError::Config(format!(
                    "entity type {entity_type} appears more than once in the plan"
                )));
            }
        }

        for (position, entity_type) in self.order.iter().enumerate() {
            for dependency in profile(*entity_type).depends_on {
                let later = self.order[position + 1..].contains(&dependency);
                if later {
                    return Err(MigrateError::Config(format!(
                        "{entity_type} is ordered before its dependency {dependency}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Keep only `only` (in plan order). An empty filter keeps everything.
    ///
    /// # Errors
    /// Returns [`MigrateError::Config`] when a requested type is not in the plan.
    pub fn restricted(&self, only: &[EntityTypeTag]) -> Result<Self, MigrateError> {
        if only.is_empty() {
            return Ok(self.clone());
        }
        if let Some(missing) = only.iter().find(|tag| !self.order.contains(tag)) {
            return Err(MigrateError::Config(format!("{missing} is not part of the plan")));
        }
        Ok(Self {
            order: self.order.iter().copied().filter(|tag| only.contains(tag)).collect(),
            ..self.clone()
        })
    }
}
