use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO Error at {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Database Pool Error: {0}")]
    DbPool(#[from] r2d2::Error),

    #[error("Database Error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Watcher Error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Ignore Rule Error: {0}")]
    Ignore(#[from] ignore::Error),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Not a media file: {}", .0.display())]
    NotMedia(PathBuf),

    #[error("Fingerprint Error: {0}")]
    Fingerprint(String),

    #[error("Album directory for user '{user}' does not exist: {}", path.display())]
    MissingRoot { user: String, path: PathBuf },

    #[error("Path Error: {0}")]
    Path(String),

    #[error("Initialization Failed: {0}")]
    Init(String),
}

impl Error {
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoAt {
            path: path.into(),
            source,
        }
    }

    /// True when the error is an I/O failure caused by a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Io(err) | Error::IoAt { source: err, .. } => {
                err.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}
