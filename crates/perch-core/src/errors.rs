use std::path::PathBuf;

/// Core error type for the bot engine.
///
/// Adapter crates map their specific errors into this type so the runtime can
/// classify failures consistently (fatal at startup vs isolated at shutdown).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Required configuration is missing or malformed. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("config file not readable: {0}")]
    AccessDenied(PathBuf),

    #[error("ini syntax error on line {line}: {message}")]
    IniSyntax { line: usize, message: String },

    #[error("runtime already started")]
    AlreadyStarted,

    #[error("extension {0:?} is already loaded")]
    AlreadyLoaded(String),

    #[error("no extension named {0:?}")]
    UnknownExtension(String),

    /// An extension's setup hook failed. Partial registration has already
    /// been rolled back; the original cause is preserved underneath.
    #[error("failed to load extension {name:?}")]
    LoadFailure {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// A single extension hook failed for a reason of its own.
    #[error("extension error: {0}")]
    Extension(String),

    /// A pool could not accept or complete work (e.g. submission after
    /// `close_all`, or a worker died before delivering a result).
    #[error("pool error: {0}")]
    Pool(String),

    /// One pool failed to shut down. Isolated: siblings still close.
    #[error("failed to close {pool} pool: {message}")]
    PoolClose { pool: &'static str, message: String },

    /// The shutdown registry has already been drained; late registrations
    /// are rejected rather than silently queued.
    #[error("shutdown registry already drained")]
    RegistryDrained,

    #[error("command {0:?} is already registered")]
    DuplicateCommand(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
