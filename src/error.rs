use thiserror::Error;

/// Errors raised by the durable event storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlite(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or persisting the device registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the RPC dispatcher, shaped so they map directly onto
/// the `{error, code}` reply the cloud expects.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("connector not found")]
    ConnectorNotFound,
    #[error("Method not found")]
    MethodNotFound,
    #[error("{0}")]
    Handler(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl RpcError {
    pub fn code(&self) -> i32 {
        match self {
            RpcError::ConnectorNotFound | RpcError::MethodNotFound => 404,
            RpcError::InvalidParams(_) => 400,
            RpcError::Handler(_) => 500,
        }
    }
}
