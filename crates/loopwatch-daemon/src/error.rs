use std::path::PathBuf;

use thiserror::Error;

/// Failure to start watching a project root.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("project root does not exist or is not a directory: {0}")]
    RootMissing(PathBuf),
    #[error("cannot resolve project root {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),
}

/// Failure on a single client connection. Always scoped to that connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
