use crate::xlsx::DecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    BadInput(String),
    #[error("could not decode {file_name}: {source}")]
    Decode {
        file_name: String,
        #[source]
        source: DecodeError,
    },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("run {run_id} was cancelled")]
    RunCancelled { run_id: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl PipelineError {
    /// Error code carried in the IPC error object.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::BadInput(_) => "bad_params",
            PipelineError::Decode { .. } => "decode_failed",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::InvalidState(_) => "invalid_state",
            PipelineError::RunCancelled { .. } => "run_cancelled",
            PipelineError::Store(_) => "db_failed",
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Store(e.into())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
