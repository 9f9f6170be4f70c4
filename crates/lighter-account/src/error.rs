use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("REST error: {0}")]
    Rest(#[from] lighter_rest::RestError),

    #[error("User stream closed")]
    StreamClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type AccountResult<T> = Result<T, AccountError>;
