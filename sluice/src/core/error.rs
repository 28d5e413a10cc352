pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not set")]
    ConfigMissing(String),

    #[error("invalid value for `{key}`: {reason}")]
    ConfigInvalid { key: String, reason: String },

    #[error("persist failed for {ranges}: {source}")]
    Persist {
        ranges: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("commit failed for {ranges}: {source}")]
    Commit {
        ranges: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("queue error. {0}")]
    Queue(#[source] anyhow::Error),

    #[error("storage error. {0}")]
    Storage(#[source] anyhow::Error),

    #[error("restart budget exhausted after {restarts} restarts, last error: {last}")]
    RestartsExhausted { restarts: u32, last: Box<Error> },

    #[error("worker thread {0} panicked")]
    Panicked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid<K, R>(key: K, reason: R) -> Self
    where
        K: ToString,
        R: ToString,
    {
        Error::ConfigInvalid {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}
