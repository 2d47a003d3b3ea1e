pub mod artifact;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod netem;
pub mod params;
pub mod postprocess;
pub mod tools;
pub mod usecase;

pub use artifact::{ArtifactNamer, Step};
pub use capture::{CaptureError, CaptureResult, CaptureSource, ScreenRecorder, WindowRecorder};
pub use config::{load_config, EmulatorType, NetemSection, QoemuConfig, QoemuSection};
pub use coordinator::{
    Coordinator, CoordinatorError, CoordinatorResult, EntryOutcome, EntryReport, Environment,
    RunRequest, RunSummary, Stage,
};
pub use device::{
    build_device, DeviceError, DeviceResult, DeviceVariant, MobileDevice, Orientation,
};
pub use error::{ConfigError, Result};
pub use netem::{
    Connection, ShapingController, ShapingError, ShapingProfile, ShapingRegistry, ShapingResult,
};
pub use params::{
    ParamError, ParamResult, ParameterStore, ParameterTable, StimulusKey, StimulusParameters,
};
pub use postprocess::{
    FfmpegPostProcessor, PostProcess, PostProcessError, PostProcessResult, TrimRequest,
};
pub use tools::{
    required_tools, CommandRunner, ProcessHandle, ProcessOutput, SystemCommandRunner, ToolError,
    ToolGateway, ToolKind, ToolOutput, ToolResult,
};
pub use usecase::{
    Interaction, InteractionRunner, StandardUseCases, UseCase, UseCaseError, UseCaseFactory,
    UseCaseKind, UseCaseResult, UseCaseState, UseCaseType,
};
