use thiserror::Error;

#[derive(Error, Debug)]
pub enum NlqError {
    #[error("Invalid connection config: {0}")]
    ConfigInvalid(String),

    #[error("No handler installed for backend kind '{0}'")]
    UnsupportedKind(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection is not connected: {0}")]
    NotConnected(String),

    #[error("Connection not found: {0}")]
    NotFound(String),

    #[error("Connection id already exists: {0}")]
    DuplicateId(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Plan rejected: {0}")]
    PlanInvalid(String),

    #[error("Tool call failed: {0}")]
    ToolCallFailed(String),

    #[error("Workspace SQL error: {0}")]
    WorkspaceSql(String),

    #[error("Reflection budget exhausted after {0} plans")]
    BudgetExhausted(usize),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for NlqError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NlqError::Timeout(err.to_string())
        } else {
            NlqError::Http(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for NlqError {
    fn from(err: rusqlite::Error) -> Self {
        NlqError::WorkspaceSql(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NlqError>;
