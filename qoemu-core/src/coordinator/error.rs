use std::path::PathBuf;

use thiserror::Error;

use crate::capture::CaptureError;
use crate::device::DeviceError;
use crate::error::ConfigError;
use crate::netem::ShapingError;
use crate::params::{ParamError, StimulusKey};
use crate::postprocess::PostProcessError;
use crate::tools::ToolError;
use crate::usecase::UseCaseError;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no parameters for {0}")]
    MissingParameters(StimulusKey),
    #[error(
        "measured bias {bias_ms:.1}ms exceeds the target delays (dul {dul}ms, ddl {ddl}ms)"
    )]
    BiasExceedsTarget { bias_ms: f64, dul: f64, ddl: f64 },
    #[error("generation requested but no device is configured")]
    DeviceUnavailable,
    #[error("capture task failed: {0}")]
    CaptureTask(#[from] tokio::task::JoinError),
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Params(#[from] ParamError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Shaping(#[from] ShapingError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    UseCase(#[from] UseCaseError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    PostProcess(#[from] PostProcessError),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
