use thiserror::Error;

/// Errors raised by the session, its statements and the importer.
#[derive(Debug, Error)]
pub enum Error {
    /// A SQLite primitive returned an unexpected status; carries `sqlite3_errmsg`.
    #[error("{0}")]
    Engine(String),

    /// A bound value has no SQLite storage class.
    #[error("Wrong API use : {0}")]
    BindingType(String),

    #[error("exec: Missing query string")]
    MissingQuery,

    #[error("statement {0} is not open")]
    UnknownStatement(u64),

    #[error("cannot read schema of table '{table}': {message}")]
    Schema { table: String, message: String },

    #[error("import: {0}")]
    InvalidImport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
