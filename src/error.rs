use thiserror::Error;

use crate::config::LoadError;
use crate::infra::error::InfraError;
use crate::remote::RemoteError;

/// Top-level failure of the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("scenario failed: {0}")]
    Scenario(#[from] RemoteError),
    #[error("failed to encode output: {0}")]
    Output(#[from] serde_json::Error),
}
