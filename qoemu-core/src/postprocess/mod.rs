//! Offline steps turning a raw capture into presentable stimuli.
//!
//! `P1` trims to the detected content and normalizes loudness, `P2` splices
//! in synthetic buffering, `P3` resets presentation timestamps. Every step
//! writes to a staging file next to its output and renames on success, so a
//! failed step never leaves a truncated artifact behind.

pub mod buffering;
pub mod start;
pub mod trigger;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::QoemuSection;
use crate::params::{StimulusKey, StimulusParameters};
use crate::tools::{argv, ToolError, ToolGateway, ToolKind};

pub use buffering::{buffering_filter, plan_pauses, Pause, VideoInfo};
pub use start::{FrameInfo, StartDetector};
pub use trigger::{select_best, NEW_SCENE_FRAME_THRESHOLD};

const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(600);
/// Half-width of the window searched for the trigger frame around the expected end.
const END_SEARCH: Duration = Duration::from_secs(5);

pub type PostProcessResult<T> = Result<T, PostProcessError>;

#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("no start of content detected")]
    StartNotDetected,
    #[error("start of content detected at the search minimum ({at:.3}s)")]
    StartAtMinimum { at: f64 },
    #[error("input artifact {0} is missing")]
    MissingInput(PathBuf),
    #[error("unexpected probe output: {0}")]
    Probe(String),
    #[error("image processing error: {0}")]
    Image(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PostProcessError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PostProcessError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Inputs of the trim and loudness step.
#[derive(Debug, Clone, Copy)]
pub struct TrimRequest<'a> {
    pub key: &'a StimulusKey,
    pub input: &'a Path,
    pub output: &'a Path,
    /// Nominal content length from the parameter record.
    pub expected: Duration,
    /// Content cannot start before this point of the capture.
    pub min_start: Duration,
}

#[async_trait]
pub trait PostProcess: Send + Sync {
    /// `P0 -> P1`
    async fn trim_and_normalize(&self, request: &TrimRequest<'_>) -> PostProcessResult<()>;

    /// `P1 -> P2`
    async fn synthesize_buffering(
        &self,
        input: &Path,
        output: &Path,
        params: &StimulusParameters,
    ) -> PostProcessResult<()>;

    /// `P1|P2 -> P3`
    async fn reset_timestamps(&self, input: &Path, output: &Path) -> PostProcessResult<()>;
}

pub struct FfmpegPostProcessor {
    gateway: Arc<ToolGateway>,
    detector: StartDetector,
    target_volume: f64,
    erase: Vec<(f64, f64)>,
    trigger_dir: PathBuf,
    spinner: Option<PathBuf>,
    frame_rate: u32,
}

impl FfmpegPostProcessor {
    pub fn new(gateway: Arc<ToolGateway>, settings: &QoemuSection) -> crate::Result<Self> {
        Ok(Self {
            gateway,
            detector: StartDetector::new(
                settings.vid_start_detect_thr_size_normal_relevance,
                settings.vid_start_detect_thr_size_high_relevance,
                settings.vid_start_detect_thr_nr_frames,
            ),
            target_volume: settings.audio_target_volume,
            erase: settings.audio_erase_regions()?,
            trigger_dir: settings.trigger_image_path.clone(),
            spinner: settings.buffering_spinner_path.clone(),
            frame_rate: settings.capture_frame_rate,
        })
    }

    async fn ffmpeg(&self, args: Vec<String>) -> PostProcessResult<String> {
        let output = self
            .gateway
            .run_with_timeout(ToolKind::Ffmpeg, &args, TRANSCODE_TIMEOUT)
            .await?;
        Ok(output.stderr)
    }

    async fn ffprobe(&self, args: Vec<String>) -> PostProcessResult<String> {
        let output = self
            .gateway
            .run_with_timeout(ToolKind::Ffprobe, &args, TRANSCODE_TIMEOUT)
            .await?;
        Ok(output.stdout)
    }

    async fn probe_frames(&self, input: &Path) -> PostProcessResult<Vec<FrameInfo>> {
        let json = self
            .ffprobe(argv([
                "-v".to_string(),
                "error".into(),
                "-select_streams".into(),
                "v:0".into(),
                "-show_frames".into(),
                "-show_entries".into(),
                "frame=key_frame,pts_time,pkt_pts_time,pkt_size".into(),
                "-of".into(),
                "json".into(),
                input.to_string_lossy().to_string(),
            ]))
            .await?;
        start::parse_probe_frames(&json)
    }

    async fn probe_video(&self, input: &Path) -> PostProcessResult<VideoInfo> {
        let json = self
            .ffprobe(argv([
                "-v".to_string(),
                "error".into(),
                "-select_streams".into(),
                "v:0".into(),
                "-show_entries".into(),
                "stream=width,height,r_frame_rate:format=duration".into(),
                "-of".into(),
                "json".into(),
                input.to_string_lossy().to_string(),
            ]))
            .await?;
        buffering::parse_video_info(&json)
    }

    /// Locates the trigger frame near `expected_end`; `None` when nothing could be compared.
    async fn find_trigger_end(
        &self,
        input: &Path,
        reference: &Path,
        not_before: f64,
        expected_end: f64,
    ) -> PostProcessResult<Option<f64>> {
        let window_start = (expected_end - END_SEARCH.as_secs_f64()).max(not_before);
        let window = expected_end + END_SEARCH.as_secs_f64() - window_start;
        let scratch = tempfile::tempdir().map_err(|err| PostProcessError::io(input, err))?;
        let pattern = scratch.path().join("frame_%05d.png");
        self.ffmpeg(argv([
            "-y".to_string(),
            "-v".into(),
            "error".into(),
            "-ss".into(),
            format!("{window_start:.3}"),
            "-i".into(),
            input.to_string_lossy().to_string(),
            "-t".into(),
            format!("{window:.3}"),
            "-vf".into(),
            format!("fps={}", self.frame_rate),
            "-f".into(),
            "image2".into(),
            pattern.to_string_lossy().to_string(),
        ]))
        .await?;

        let frame_dir = scratch.path().to_path_buf();
        let reference = reference.to_path_buf();
        let scores = tokio::task::spawn_blocking(move || -> PostProcessResult<Vec<u64>> {
            let mut frames: Vec<PathBuf> = std::fs::read_dir(&frame_dir)
                .map_err(|err| PostProcessError::io(&frame_dir, err))?
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
                .collect();
            frames.sort();
            if frames.is_empty() {
                return Ok(Vec::new());
            }
            let reference = trigger::load_reference(&reference)?;
            frames
                .iter()
                .map(|frame| {
                    let image = trigger::load_reference(frame)?;
                    Ok(trigger::match_score(&image, &reference))
                })
                .collect()
        })
        .await
        .map_err(|err| PostProcessError::Image(format!("frame scoring aborted: {err}")))??;
        drop(scratch);

        Ok(select_best(&scores)
            .map(|index| window_start + index as f64 / f64::from(self.frame_rate)))
    }
}

/// Hidden sibling of `output` that keeps the container extension.
fn staging_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    output.with_file_name(format!(".partial-{name}"))
}

async fn commit(staging: &Path, output: &Path) -> PostProcessResult<()> {
    tokio::fs::rename(staging, output)
        .await
        .map_err(|err| PostProcessError::io(output, err))
}

async fn discard(staging: &Path) {
    if let Err(err) = tokio::fs::remove_file(staging).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %staging.display(), error = %err, "failed to remove staging file");
        }
    }
}

fn require_input(input: &Path) -> PostProcessResult<()> {
    if input.is_file() {
        Ok(())
    } else {
        Err(PostProcessError::MissingInput(input.to_path_buf()))
    }
}

impl FfmpegPostProcessor {
    async fn trim_inner(&self, request: &TrimRequest<'_>, staging: &Path) -> PostProcessResult<()> {
        let frames = self.probe_frames(request.input).await?;
        let min_start = request.min_start.as_secs_f64();
        let t_start = self.detector.detect(&frames, min_start)?;
        let expected_end = t_start + request.expected.as_secs_f64();
        let t_end = match trigger::trigger_image_for(&self.trigger_dir, request.key) {
            Some(reference) => {
                match self
                    .find_trigger_end(request.input, &reference, t_start, expected_end)
                    .await?
                {
                    Some(end) if end > t_start => end,
                    _ => {
                        warn!(key = %request.key, "trigger image not matched, using nominal end");
                        expected_end
                    }
                }
            }
            None => expected_end,
        };
        info!(key = %request.key, t_start, t_end, "content window detected");

        let scratch = tempfile::tempdir().map_err(|err| PostProcessError::io(staging, err))?;
        let trimmed = scratch.path().join("trimmed.avi");
        self.ffmpeg(argv([
            "-y".to_string(),
            "-v".into(),
            "error".into(),
            "-ss".into(),
            format!("{t_start:.3}"),
            "-i".into(),
            request.input.to_string_lossy().to_string(),
            "-t".into(),
            format!("{:.3}", t_end - t_start),
            "-c".into(),
            "copy".into(),
            trimmed.to_string_lossy().to_string(),
        ]))
        .await?;

        let report = self
            .ffmpeg(argv([
                "-v".to_string(),
                "info".into(),
                "-i".into(),
                trimmed.to_string_lossy().to_string(),
                "-vn".into(),
                "-af".into(),
                "volumedetect".into(),
                "-f".into(),
                "null".into(),
                "-".into(),
            ]))
            .await?;
        let max_volume = buffering::parse_max_volume(&report)
            .ok_or_else(|| PostProcessError::Probe("volumedetect reported no max_volume".into()))?;
        let gain = self.target_volume - max_volume;
        debug!(key = %request.key, max_volume, gain, "loudness measured");

        self.ffmpeg(argv([
            "-y".to_string(),
            "-v".into(),
            "error".into(),
            "-i".into(),
            trimmed.to_string_lossy().to_string(),
            "-c:v".into(),
            "copy".into(),
            "-af".into(),
            buffering::loudness_filter(gain, &self.erase),
            "-c:a".into(),
            "pcm_s16le".into(),
            staging.to_string_lossy().to_string(),
        ]))
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PostProcess for FfmpegPostProcessor {
    async fn trim_and_normalize(&self, request: &TrimRequest<'_>) -> PostProcessResult<()> {
        require_input(request.input)?;
        let staging = staging_path(request.output);
        match self.trim_inner(request, &staging).await {
            Ok(()) => commit(&staging, request.output).await,
            Err(err) => {
                discard(&staging).await;
                Err(err)
            }
        }
    }

    async fn synthesize_buffering(
        &self,
        input: &Path,
        output: &Path,
        params: &StimulusParameters,
    ) -> PostProcessResult<()> {
        require_input(input)?;
        let video = self.probe_video(input).await?;
        let pauses = plan_pauses(params, video.duration);
        let spinner = self.spinner.as_deref().filter(|path| path.is_file());
        info!(
            input = %input.display(),
            pauses = pauses.len(),
            spinner = spinner.is_some(),
            "synthesizing buffering"
        );
        let mut args = argv([
            "-y".to_string(),
            "-v".into(),
            "error".into(),
            "-i".into(),
            input.to_string_lossy().to_string(),
        ]);
        if let Some(spinner) = spinner {
            args.extend(argv([
                "-loop".to_string(),
                "1".into(),
                "-i".into(),
                spinner.to_string_lossy().to_string(),
            ]));
        }
        let staging = staging_path(output);
        args.extend(argv([
            "-filter_complex".to_string(),
            buffering_filter(&pauses, &video, spinner.is_some()),
            "-map".into(),
            "[outv]".into(),
            "-map".into(),
            "[outa]".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-crf".into(),
            "18".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-c:a".into(),
            "pcm_s16le".into(),
            staging.to_string_lossy().to_string(),
        ]));
        match self.ffmpeg(args).await {
            Ok(_) => commit(&staging, output).await,
            Err(err) => {
                discard(&staging).await;
                Err(err)
            }
        }
    }

    async fn reset_timestamps(&self, input: &Path, output: &Path) -> PostProcessResult<()> {
        require_input(input)?;
        let staging = staging_path(output);
        let result = self
            .ffmpeg(argv([
                "-y".to_string(),
                "-v".into(),
                "error".into(),
                "-i".into(),
                input.to_string_lossy().to_string(),
                "-vf".into(),
                "setpts=PTS-STARTPTS".into(),
                "-af".into(),
                "asetpts=PTS-STARTPTS".into(),
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
                "-crf".into(),
                "18".into(),
                "-c:a".into(),
                "pcm_s16le".into(),
                "-avoid_negative_ts".into(),
                "make_zero".into(),
                staging.to_string_lossy().to_string(),
            ]))
            .await;
        match result {
            Ok(_) => commit(&staging, output).await,
            Err(err) => {
                discard(&staging).await;
                Err(err)
            }
        }
    }
}
