/// Failures that abort the current row (or, for `Config`, the whole run).
///
/// A missing id mapping is not an error; it is reported through
/// [`crate::Resolution::Unresolved`] and the per-field policies built on it.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrateError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("id map store error: {0}")]
    Store(String),
    #[error("extraction error: {0}")]
    Extraction(String),
    #[error("destination error: {0}")]
    Destination(String),
    #[error("configuration error: {0}")]
    Config(String),
}
