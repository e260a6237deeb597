use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("wire protocol error: {0}")]
    Wire(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("server is not ready")]
    NotReady,

    #[error("no such database: {0}")]
    NoSuchDb(String),

    #[error("database already exists: {0}")]
    DbExists(String),

    #[error("invalid argument: {0}")]
    ArgInvalid(String),

    #[error("invalid batch state: {0}")]
    BatchState(String),

    #[error("expected {expected} entries, buffer holds {actual}")]
    BatchSizeMismatch { expected: usize, actual: usize },

    #[error("batch exceeds {0} entries")]
    BatchTooLarge(usize),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("cluster descriptor mismatch: {0}")]
    ClusterMismatch(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KvError {
    /// Stable error tag carried in wire responses so clients can match on
    /// the kind without parsing free text.
    pub fn tag(&self) -> &'static str {
        match self {
            KvError::Config(_) => "CONFIG",
            KvError::Wire(_) => "WIRE",
            KvError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            KvError::NotReady => "NOT_READY",
            KvError::NoSuchDb(_) => "NO_SUCH_DB",
            KvError::DbExists(_) => "DB_EXISTS",
            KvError::ArgInvalid(_) => "ARG_INVALID",
            KvError::BatchState(_) => "BATCH_STATE",
            KvError::BatchSizeMismatch { .. } => "BATCH_SIZE_MISMATCH",
            KvError::BatchTooLarge(_) => "BATCH_TOO_LARGE",
            KvError::Engine(_) => "ENGINE",
            KvError::Wal(_) => "WAL",
            KvError::ClusterMismatch(_) => "CLUSTER_MISMATCH",
            KvError::Internal(_) => "INTERNAL",
            KvError::Io(_) => "INTERNAL",
        }
    }

    /// Process exit code for errors that are fatal at startup or during a
    /// durable commit.
    pub fn exit_code(&self) -> i32 {
        match self {
            KvError::Config(_) | KvError::ArgInvalid(_) => 1,
            KvError::ClusterMismatch(_) => 2,
            KvError::Wal(_) => 3,
            KvError::Engine(_) => 4,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable() {
        assert_eq!(KvError::NotReady.tag(), "NOT_READY");
        assert_eq!(
            KvError::BatchSizeMismatch {
                expected: 1,
                actual: 2
            }
            .tag(),
            "BATCH_SIZE_MISMATCH"
        );
        assert_eq!(KvError::NoSuchDb("x".into()).tag(), "NO_SUCH_DB");
    }

    #[test]
    fn exit_codes_match_startup_contract() {
        assert_eq!(KvError::Config("bad".into()).exit_code(), 1);
        assert_eq!(KvError::ClusterMismatch("peer".into()).exit_code(), 2);
        assert_eq!(KvError::Wal("replay".into()).exit_code(), 3);
        assert_eq!(KvError::Engine("open".into()).exit_code(), 4);
    }
}
