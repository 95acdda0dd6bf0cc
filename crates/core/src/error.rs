use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid mapping for table {table}: {reason}")]
    InvalidMapping { table: String, reason: String },

    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
