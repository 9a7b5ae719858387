use thiserror::Error;

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Extract error: {0}")]
    Extract(String),

    #[error("Descriptor error: {0}")]
    Descriptor(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Watermark store error: {0}")]
    Watermark(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

pub type Result<T> = std::result::Result<T, RefreshError>;

/// Conditions under which a datasource cannot be resumed safely; the
/// datasource is skipped and the run continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionViolation {
    #[error("datasource not found on the server")]
    DatasourceNotFound,

    #[error("datasource does not contain an extract")]
    NoExtract,

    #[error("extract is not backed by the expected engine (found '{0}')")]
    WrongExtractEngine(String),

    #[error("extract has no refresh history")]
    MissingRefreshHistory,

    #[error("no last update value is stored, please provide one")]
    MissingWatermark,

    #[error("descriptor names no source database connection")]
    NoSourceConnection,

    #[error("no database configuration named '{0}'")]
    UnknownDatabase(String),
}
