//! Domain errors raised by the model, scoring and dashboard layers

use thiserror::Error;

/// Result type for the typed model operations
pub type ChurnResult<T> = std::result::Result<T, ChurnError>;

/// Errors that can occur while fitting, validating or applying the churn model
#[derive(Error, Debug)]
pub enum ChurnError {
    /// The label vector does not line up with the feature rows
    #[error("Label count mismatch: {rows} feature rows but {labels} labels")]
    LabelMismatch { rows: usize, labels: usize },

    /// A label other than 0 or 1 was found
    #[error("Invalid label at row {row}: expected 0 or 1, got {value}")]
    InvalidLabel { row: usize, value: f64 },

    /// Binary classification needs both classes present
    #[error("Labels must contain both classes (found {positives} positive, {negatives} negative)")]
    MissingClasses { positives: usize, negatives: usize },

    /// Stratified folds need enough members of every class
    #[error("Insufficient data: need at least {required} samples of each class, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// Feature columns differ from the ones the model was trained on
    #[error("Feature schema mismatch: missing {missing:?}, unexpected {unexpected:?}")]
    SchemaMismatch {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    /// An input feature collides with a column the scorer writes
    #[error("Feature column '{name}' clashes with a prediction output column")]
    ReservedColumn { name: String },

    /// Number of features does not match the fitted parameters
    #[error("Shape mismatch: expected {expected} features, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// The model bundle was written by an incompatible version
    #[error("Unsupported model bundle version {found} (expected {expected})")]
    BundleVersion { found: u32, expected: u32 },

    /// The Newton system could not be solved
    #[error("Solver failed: Hessian is not positive definite")]
    SingularSystem,

    /// Invalid parameter value
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error(transparent)]
    Linfa(#[from] linfa::error::Error),
}

impl ChurnError {
    pub(crate) fn invalid_parameter(name: &str, reason: impl Into<String>) -> Self {
        ChurnError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
