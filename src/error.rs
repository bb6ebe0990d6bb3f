use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid training option `{option}`: {reason}")]
    Config {
        option: &'static str,
        reason: String,
    },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Model cannot be exported: {0}")]
    Export(String),

    #[error("Failed to build training thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    pub(crate) fn config(option: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            option,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
