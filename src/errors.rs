use thiserror::Error;

#[derive(Debug, Error)]
pub enum GroveError {
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidParameter { field: &'static str, reason: String },
    #[error("Distribution {distribution} requires a {expected} response")]
    DistributionMismatch {
        distribution: String,
        expected: &'static str,
    },
    #[error("Training round cancelled: {0}")]
    Cancelled(String),
    #[error("Unable to write model to file: {0}")]
    UnableToWrite(String),
    #[error("Unable to read model from a file {0}")]
    UnableToRead(String),
}

impl GroveError {
    pub fn invalid<S: Into<String>>(field: &'static str, reason: S) -> Self {
        GroveError::InvalidParameter {
            field,
            reason: reason.into(),
        }
    }
}
