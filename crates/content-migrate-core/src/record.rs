use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{LegacyId, LinkId, MigrateError, NewId};

/// Sub-value key carrying a resolved reference inside a composite field item.
pub const TARGET_ID_KEY: &str = "target_id";

/// One scalar column value as read from the legacy store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ScalarValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer view; numeric text is accepted because merged and joined legacy
    /// columns frequently come back as strings.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Text(value) => value.trim().parse().ok(),
            Self::Null | Self::Real(_) => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NewId> for ScalarValue {
    fn from(value: NewId) -> Self {
        Self::Integer(i64::from(value.0))
    }
}

impl<T: Into<ScalarValue>> From<Option<T>> for ScalarValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A flat column-name to scalar mapping: one legacy base row or one satellite row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    columns: BTreeMap<String, ScalarValue>,
}

/// One legacy base-entity record (e.g. one node).
pub type LegacyRow = Record;

/// One child-table record attached to a legacy entity by its legacy id.
pub type SatelliteRecord = Record;

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, column: &str, value: impl Into<ScalarValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: &str, value: impl Into<ScalarValue>) {
        self.columns.insert(column.to_string(), value.into());
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&ScalarValue> {
        self.columns.get(column)
    }

    #[must_use]
    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(ScalarValue::as_str)
    }

    #[must_use]
    pub fn columns(&self) -> &BTreeMap<String, ScalarValue> {
        &self.columns
    }

    #[must_use]
    pub fn into_columns(self) -> BTreeMap<String, ScalarValue> {
        self.columns
    }

    /// Read an integer column. `NULL` reads as `0`, the legacy "none" value.
    ///
    /// # Errors
    /// Returns [`MigrateError::Validation`] when the column is absent or not numeric.
    pub fn integer(&self, column: &str) -> Result<i64, MigrateError> {
        let value = self
            .get(column)
            .ok_or_else(|| MigrateError::Validation(format!("missing column `{column}`")))?;
        if value.is_null() {
            return Ok(0);
        }
        value.as_i64().ok_or_else(|| {
            MigrateError::Validation(format!("column `{column}` is not an integer: {value:?}"))
        })
    }

    /// Read a legacy id column. `NULL` and `0` both read as [`LegacyId::NONE`].
    ///
    /// # Errors
    /// Returns [`MigrateError::Validation`] when the column is absent, negative,
    /// or does not fit the id range.
    pub fn id(&self, column: &str) -> Result<LegacyId, MigrateError> {
        let raw = self.integer(column)?;
        u32::try_from(raw).map(LegacyId).map_err(|_| {
            MigrateError::Validation(format!("column `{column}` is not a valid legacy id: {raw}"))
        })
    }

    /// Read a link id column (`NULL`/`0` is the root marker).
    ///
    /// # Errors
    /// Same conditions as [`Record::id`].
    pub fn link(&self, column: &str) -> Result<LinkId, MigrateError> {
        self.id(column).map(|id| LinkId(id.0))
    }
}

impl FromIterator<(String, ScalarValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, ScalarValue)>>(iter: I) -> Self {
        Self { columns: iter.into_iter().collect() }
    }
}

/// One structured item inside a composite field, keyed by sub-value name.
pub type SubValue = BTreeMap<String, ScalarValue>;

/// Aggregated value of one multivalue field on one entity.
///
/// An empty sequence and "field not present" are equivalent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeFieldValue {
    items: Vec<SubValue>,
}

impl CompositeFieldValue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: SubValue) {
        self.items.push(item);
    }

    #[must_use]
    pub fn items(&self) -> &[SubValue] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Resolved `target_id` of every item that carries one, in item order.
    #[must_use]
    pub fn target_ids(&self) -> Vec<u32> {
        self.items
            .iter()
            .filter_map(|item| item.get(TARGET_ID_KEY).and_then(ScalarValue::as_i64))
            .filter_map(|value| u32::try_from(value).ok())
            .collect()
    }
}
