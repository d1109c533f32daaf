use thiserror::Error;

/// Engine-level failure taxonomy. Every variant carries enough context
/// (entity kind plus id/hash) to be rendered without re-deriving state.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{entity} is no longer modifiable: {id}")]
    NotModifiable { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("store error: {0}")]
    Store(String),

    #[error("gateway error: {0}")]
    Gateway(String),
}

impl MarketError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    pub fn not_modifiable(entity: &'static str, id: impl ToString) -> Self {
        Self::NotModifiable { entity, id: id.to_string() }
    }

    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::InvalidState(detail.into())
    }

    pub fn invalid_parameter(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter { name, reason: reason.into() }
    }
}

impl From<anyhow::Error> for MarketError {
    fn from(value: anyhow::Error) -> Self {
        Self::Store(value.to_string())
    }
}

impl From<sqlx::Error> for MarketError {
    fn from(value: sqlx::Error) -> Self {
        match value {
            sqlx::Error::RowNotFound => Self::Store("row not found".to_string()),
            other => Self::Store(other.to_string()),
        }
    }
}
