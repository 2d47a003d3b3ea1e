//! Campaign engine: runs generation and post-processing for every selected entry.
//!
//! Entries are processed one after another. Within the generation of one
//! entry the screen capture runs as a separate task next to the use case,
//! and a fault anywhere triggers the cleanup chain before the next entry
//! starts.

mod error;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactNamer, Step};
use crate::capture::{CaptureSource, ScreenRecorder, WindowRecorder};
use crate::config::QoemuConfig;
use crate::device::{build_device, DeviceVariant, MobileDevice};
use crate::netem::{Connection, ShapingController, ShapingProfile, ShapingRegistry};
use crate::params::{ParameterStore, StimulusKey, StimulusParameters};
use crate::postprocess::{FfmpegPostProcessor, PostProcess, PostProcessError, TrimRequest};
use crate::tools::ToolGateway;
use crate::usecase::{StandardUseCases, UseCase, UseCaseFactory};

pub use error::{CoordinatorError, CoordinatorResult};
pub use types::{EntryOutcome, EntryReport, RunRequest, RunSummary, Stage};

/// Everything a run touches, constructed once and handed to the [`Coordinator`].
pub struct Environment {
    pub config: QoemuConfig,
    pub shaping: ShapingController,
    pub device: Option<Arc<dyn MobileDevice>>,
    pub recorder: Option<Arc<dyn ScreenRecorder>>,
    pub use_cases: Arc<dyn UseCaseFactory>,
    pub postprocessor: Arc<dyn PostProcess>,
    pub parameters: Arc<dyn ParameterStore>,
}

impl Environment {
    /// Production wiring on top of located tools.
    pub fn from_config(
        config: QoemuConfig,
        gateway: Arc<ToolGateway>,
        parameters: Arc<dyn ParameterStore>,
    ) -> CoordinatorResult<Self> {
        let registry = Arc::new(ShapingRegistry::new(config.netem.max_virtual_devices));
        let shaping = ShapingController::new(Arc::clone(&gateway), registry, &config.netem);
        let device = build_device(&config, Arc::clone(&gateway));
        let recorder = device.as_ref().map(|device| {
            Arc::new(WindowRecorder::new(
                Arc::clone(&gateway),
                CaptureSource::for_variant(device.variant()),
                device.window_title(),
                &config.qoemu,
            )) as Arc<dyn ScreenRecorder>
        });
        let use_cases = Arc::new(StandardUseCases {
            warmup_url: config.qoemu.youtube_warmup_url.clone(),
            resolution_override: config.qoemu.resolution_override.clone(),
        });
        let postprocessor = Arc::new(FfmpegPostProcessor::new(gateway, &config.qoemu)?);
        Ok(Self {
            config,
            shaping,
            device,
            recorder,
            use_cases,
            postprocessor,
            parameters,
        })
    }
}

/// Resources held by one generation attempt, released by the cleanup chain.
struct Session {
    use_case: UseCase,
    connection: Option<Connection>,
    launched: bool,
}

pub struct Coordinator {
    env: Environment,
    namer: ArtifactNamer,
}

impl Coordinator {
    pub fn new(env: Environment) -> CoordinatorResult<Self> {
        let variant = env
            .device
            .as_ref()
            .map(|device| device.variant())
            .or_else(|| DeviceVariant::from_config(env.config.qoemu.emulator_type))
            .ok_or(CoordinatorError::DeviceUnavailable)?;
        let namer = ArtifactNamer::new(
            env.config.qoemu.video_capture_path.clone(),
            variant,
            env.config.qoemu.release_tag.clone(),
        );
        Ok(Self { env, namer })
    }

    pub fn namer(&self) -> &ArtifactNamer {
        &self.namer
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Runs every selected `(type, table, entry)` in order.
    ///
    /// Per-entry faults end up in the summary; only faults that prevent the
    /// run from starting are returned as errors.
    pub async fn start(&self, request: &RunRequest) -> CoordinatorResult<RunSummary> {
        if request.generate && (self.env.device.is_none() || self.env.recorder.is_none()) {
            return Err(CoordinatorError::DeviceUnavailable);
        }
        let dir = self.namer.dir();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| CoordinatorError::Io {
                path: dir.to_path_buf(),
                source,
            })?;

        let run_id = Uuid::new_v4();
        let keys = self.select(request);
        info!(
            %run_id,
            entries = keys.len(),
            generate = request.generate,
            postprocess = request.postprocess,
            overwrite = request.overwrite,
            "starting run"
        );
        let mut summary = RunSummary::new(run_id);
        for key in keys {
            let outcome = self.run_entry(&key, request).await;
            match &outcome {
                EntryOutcome::Skipped => info!(%run_id, key = %key, "entry skipped, artifacts present"),
                EntryOutcome::Completed { produced } => {
                    info!(%run_id, key = %key, produced = produced.len(), "entry completed")
                }
                EntryOutcome::Failed { stage, error } => {
                    warn!(%run_id, key = %key, %stage, error = %error, "entry failed")
                }
            }
            summary.entries.push(EntryReport { key, outcome });
        }
        info!(
            %run_id,
            completed = summary.completed(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "run finished"
        );
        Ok(summary)
    }

    fn select(&self, request: &RunRequest) -> Vec<StimulusKey> {
        let mut keys = Vec::new();
        for type_id in &request.types {
            for table_id in &request.tables {
                match &request.entries {
                    Some(entries) => keys.extend(
                        entries
                            .iter()
                            .map(|entry| StimulusKey::new(type_id, table_id, entry)),
                    ),
                    None => keys.extend(self.env.parameters.entries(type_id, table_id)),
                }
            }
        }
        keys
    }

    fn wanted_steps(params: &StimulusParameters, request: &RunRequest) -> Vec<Step> {
        let mut steps = Vec::new();
        if request.generate {
            steps.push(Step::P0);
        }
        if request.postprocess {
            steps.push(Step::P1);
            if params.needs_synthetic_buffering() {
                steps.push(Step::P2);
            }
            steps.push(Step::P3);
        }
        steps
    }

    /// Existing artifact usable for `key` at `step`, never when overwriting.
    fn reusable(&self, key: &StimulusKey, step: Step, overwrite: bool) -> Option<PathBuf> {
        if overwrite {
            return None;
        }
        self.namer.resolve(key, step, self.env.parameters.as_ref())
    }

    async fn run_entry(&self, key: &StimulusKey, request: &RunRequest) -> EntryOutcome {
        let Some(params) = self.env.parameters.get(key).cloned() else {
            return EntryOutcome::Failed {
                stage: Stage::Lookup,
                error: CoordinatorError::MissingParameters(key.clone()).to_string(),
            };
        };
        let wanted = Self::wanted_steps(&params, request);
        if wanted
            .iter()
            .all(|step| self.reusable(key, *step, request.overwrite).is_some())
        {
            return EntryOutcome::Skipped;
        }

        let mut produced = Vec::new();
        if request.generate && self.reusable(key, Step::P0, request.overwrite).is_none() {
            match self.generate(key, &params).await {
                Ok(path) => produced.push(path),
                Err(err) => {
                    return EntryOutcome::Failed {
                        stage: Stage::Generate,
                        error: err.to_string(),
                    }
                }
            }
        }
        if request.postprocess {
            if let Err((stage, err)) = self
                .postprocess(key, &params, request.overwrite, &mut produced)
                .await
            {
                return EntryOutcome::Failed {
                    stage,
                    error: err.to_string(),
                };
            }
        }
        EntryOutcome::Completed { produced }
    }

    async fn generate(
        &self,
        key: &StimulusKey,
        params: &StimulusParameters,
    ) -> CoordinatorResult<PathBuf> {
        let device = self
            .env
            .device
            .as_deref()
            .ok_or(CoordinatorError::DeviceUnavailable)?;
        let recorder = self
            .env
            .recorder
            .as_ref()
            .ok_or(CoordinatorError::DeviceUnavailable)?;
        let output = self.namer.path(key, Step::P0);
        let mut session = Session {
            use_case: self.env.use_cases.build(key, params)?,
            connection: None,
            launched: false,
        };
        info!(key = %key, output = %output.display(), "generating stimulus");
        let result = self
            .generate_with(device, recorder, key, params, &output, &mut session)
            .await;
        if let Err(err) = &result {
            warn!(key = %key, error = %err, "generation failed, cleaning up");
            self.cleanup(device, &mut session).await;
            discard_partial(&output).await;
        }
        result.map(|()| output)
    }

    async fn generate_with(
        &self,
        device: &dyn MobileDevice,
        recorder: &Arc<dyn ScreenRecorder>,
        key: &StimulusKey,
        params: &StimulusParameters,
        output: &Path,
        session: &mut Session,
    ) -> CoordinatorResult<()> {
        let settings = &self.env.config.qoemu;
        session.launched = true;
        device
            .launch(
                session.use_case.orientation(),
                session.use_case.needs_playstore(),
            )
            .await?;

        let bias_ms = device.measure_rtt(&settings.ping_host).await? / 2.0;
        if bias_ms > params.dul || bias_ms > params.ddl {
            return Err(CoordinatorError::BiasExceedsTarget {
                bias_ms,
                dul: params.dul,
                ddl: params.ddl,
            });
        }

        let connection = session.connection.insert(
            self.env
                .shaping
                .open(&key.to_string(), &self.env.config.netem.net_device_name)
                .await?,
        );
        connection.set(ShapingProfile {
            t_init: params.t_init,
            rul: params.rul,
            rdl: params.rdl,
            dul: params.dul - bias_ms,
            ddl: params.ddl - bias_ms,
        });
        session.use_case.prepare(device).await?;
        connection.enable().await?;

        let margin = settings.capture_margin();
        let duration = params.duration();
        let capture = {
            let recorder = Arc::clone(recorder);
            let path = output.to_path_buf();
            tokio::spawn(async move { recorder.record(&path, duration + margin * 2).await })
        };
        let executed = session.use_case.execute(device, margin, duration).await;
        let captured = capture.await;
        executed?;
        captured??;

        connection.disable().await?;
        session.use_case.shutdown(device).await?;
        if let Some(mut connection) = session.connection.take() {
            connection.close().await;
        }
        device.shutdown().await?;
        session.launched = false;
        Ok(())
    }

    /// Best-effort teardown; every step runs and failures are only logged.
    async fn cleanup(&self, device: &dyn MobileDevice, session: &mut Session) {
        if let Some(mut connection) = session.connection.take() {
            if let Err(err) = connection.disable().await {
                warn!(connection = %connection.name(), error = %err, "cleanup: disabling shaping failed");
            }
            connection.close().await;
        }
        if session.launched {
            if let Err(err) = session.use_case.abort(device).await {
                warn!(error = %err, "cleanup: use case shutdown failed");
            }
            if let Err(err) = device.shutdown().await {
                warn!(error = %err, "cleanup: device shutdown failed");
            }
            session.launched = false;
        }
    }

    async fn postprocess(
        &self,
        key: &StimulusKey,
        params: &StimulusParameters,
        overwrite: bool,
        produced: &mut Vec<PathBuf>,
    ) -> Result<(), (Stage, CoordinatorError)> {
        let postprocessor = &self.env.postprocessor;

        let trimmed = match self.reusable(key, Step::P1, overwrite) {
            Some(existing) => existing,
            None => {
                let fail = |err: PostProcessError| (Stage::Trim, CoordinatorError::from(err));
                let input = self
                    .namer
                    .resolve(key, Step::P0, self.env.parameters.as_ref())
                    .ok_or_else(|| {
                        fail(PostProcessError::MissingInput(self.namer.path(key, Step::P0)))
                    })?;
                let output = self.namer.path(key, Step::P1);
                postprocessor
                    .trim_and_normalize(&TrimRequest {
                        key,
                        input: &input,
                        output: &output,
                        expected: params.duration(),
                        min_start: self.env.config.qoemu.capture_margin(),
                    })
                    .await
                    .map_err(fail)?;
                produced.push(output.clone());
                output
            }
        };

        let buffered = if params.needs_synthetic_buffering() {
            match self.reusable(key, Step::P2, overwrite) {
                Some(existing) => existing,
                None => {
                    let output = self.namer.path(key, Step::P2);
                    postprocessor
                        .synthesize_buffering(&trimmed, &output, params)
                        .await
                        .map_err(|err| (Stage::Buffering, CoordinatorError::from(err)))?;
                    produced.push(output.clone());
                    output
                }
            }
        } else {
            trimmed
        };

        if self.reusable(key, Step::P3, overwrite).is_none() {
            let output = self.namer.path(key, Step::P3);
            postprocessor
                .reset_timestamps(&buffered, &output)
                .await
                .map_err(|err| (Stage::Timestamps, CoordinatorError::from(err)))?;
            produced.push(output);
        }
        Ok(())
    }
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "removed partial capture"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove partial capture"),
    }
}
