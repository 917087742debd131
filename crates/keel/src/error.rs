use crate::exec::ExecError;
use crate::executor::ExecutorError;
use crate::identity::{SyncError, ValidationError};
use crate::migration::BuildError;
use crate::order::OrderError;
use crate::plan::ReadError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid schema: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("cannot build migration: {0}")]
    Build(#[from] BuildError),

    #[error("cannot execute migration: {0}")]
    Exec(#[from] ExecError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("statement failed: {0}")]
    Executor(#[from] ExecutorError),
}

impl From<SyncError> for Error {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Validation(e) => Error::Validation(e),
            SyncError::Store(e) => Error::Store(e),
        }
    }
}
