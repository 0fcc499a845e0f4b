use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlipstreamError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Run not found: {0} #{1}")]
    RunNotFound(String, i64),

    #[error("Home directory must be an absolute path: {0}")]
    RelativeHome(String),

    #[error(
        "Found legacy node configuration directory cfg/nodes. \
         Nodes have been replaced by contexts, please migrate to cfg/contexts"
    )]
    LegacyNodeConfig,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SlipstreamError>;
