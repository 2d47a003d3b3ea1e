//! Records the window showing the device into a lossless capture file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::QoemuSection;
use crate::device::DeviceVariant;
use crate::tools::{argv, ToolError, ToolGateway, ToolKind};

/// Slack on top of the recording length before ffmpeg is considered hung.
const FFMPEG_GRACE: Duration = Duration::from_secs(30);

pub type CaptureResult<T> = Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no window titled '{title}' found")]
    WindowNotFound { title: String },
    #[error("capture {path} is empty")]
    EmptyCapture { path: PathBuf },
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("capture file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ScreenRecorder: Send + Sync {
    /// Records for `duration` into `output`; returns when recording finished.
    async fn record(&self, output: &Path, duration: Duration) -> CaptureResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    EmulatorWindow,
    DeviceMirror,
}

impl CaptureSource {
    pub fn for_variant(variant: DeviceVariant) -> Self {
        match variant {
            DeviceVariant::RealDevice => CaptureSource::DeviceMirror,
            DeviceVariant::Emulator | DeviceVariant::Genymotion => CaptureSource::EmulatorWindow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl WindowGeometry {
    /// Parses `xdotool getwindowgeometry --shell` output.
    pub fn parse_shell(output: &str) -> Option<Self> {
        let mut x = None;
        let mut y = None;
        let mut width = None;
        let mut height = None;
        for line in output.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            match key {
                "X" => x = value.parse().ok(),
                "Y" => y = value.parse().ok(),
                "WIDTH" => width = value.parse().ok(),
                "HEIGHT" => height = value.parse().ok(),
                _ => {}
            }
        }
        Some(Self {
            x: x?,
            y: y?,
            width: width?,
            height: height?,
        })
    }

    /// Region size rounded down to even values as required by the encoder.
    fn even_size(&self) -> (u32, u32) {
        (self.width & !1, self.height & !1)
    }
}

/// Captures a window located by title substring through `xdotool` and `ffmpeg x11grab`.
pub struct WindowRecorder {
    gateway: Arc<ToolGateway>,
    source: CaptureSource,
    title: String,
    display: String,
    frame_rate: u32,
}

impl WindowRecorder {
    pub fn new(
        gateway: Arc<ToolGateway>,
        source: CaptureSource,
        title: impl Into<String>,
        settings: &QoemuSection,
    ) -> Self {
        Self {
            gateway,
            source,
            title: title.into(),
            display: settings.display.clone(),
            frame_rate: settings.capture_frame_rate,
        }
    }

    async fn locate(&self) -> CaptureResult<(String, WindowGeometry)> {
        let not_found = || CaptureError::WindowNotFound {
            title: self.title.clone(),
        };
        let search = self
            .gateway
            .run(
                ToolKind::Xdotool,
                &argv(["search", "--name", self.title.as_str()]),
            )
            .await
            .map_err(|err| match err {
                ToolError::NonZeroExit { .. } => not_found(),
                other => other.into(),
            })?;
        let window = search
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(not_found)?
            .to_string();

        if let Err(err) = self
            .gateway
            .run(
                ToolKind::Xdotool,
                &argv(["windowactivate", "--sync", window.as_str()]),
            )
            .await
        {
            warn!(window = %window, error = %err, "could not raise capture window");
        }

        let geometry = self
            .gateway
            .run(
                ToolKind::Xdotool,
                &argv(["getwindowgeometry", "--shell", window.as_str()]),
            )
            .await?;
        let geometry = WindowGeometry::parse_shell(&geometry.stdout).ok_or_else(|| {
            ToolError::UnexpectedOutput {
                tool: ToolKind::Xdotool.binary(),
                detail: format!("no geometry in '{}'", geometry.stdout.trim()),
            }
        })?;
        Ok((window, geometry))
    }

    fn ffmpeg_args(&self, geometry: &WindowGeometry, output: &Path, duration: Duration) -> Vec<String> {
        let (width, height) = geometry.even_size();
        argv([
            "-y".to_string(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "x11grab".into(),
            "-framerate".into(),
            self.frame_rate.to_string(),
            "-video_size".into(),
            format!("{width}x{height}"),
            "-i".into(),
            format!("{}+{},{}", self.display, geometry.x, geometry.y),
            "-f".into(),
            "pulse".into(),
            "-i".into(),
            "default".into(),
            "-t".into(),
            format!("{:.3}", duration.as_secs_f64()),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-qp".into(),
            "0".into(),
            "-c:a".into(),
            "pcm_s16le".into(),
            output.to_string_lossy().to_string(),
        ])
    }
}

#[async_trait]
impl ScreenRecorder for WindowRecorder {
    async fn record(&self, output: &Path, duration: Duration) -> CaptureResult<()> {
        let (window, geometry) = self.locate().await?;
        info!(
            source = ?self.source,
            window = %window,
            width = geometry.width,
            height = geometry.height,
            duration_s = duration.as_secs_f64(),
            output = %output.display(),
            "recording screen"
        );
        self.gateway
            .run_with_timeout(
                ToolKind::Ffmpeg,
                &self.ffmpeg_args(&geometry, output, duration),
                duration + FFMPEG_GRACE,
            )
            .await?;
        let size = tokio::fs::metadata(output)
            .await
            .map_err(|source| CaptureError::Io {
                path: output.to_path_buf(),
                source,
            })?
            .len();
        if size == 0 {
            return Err(CaptureError::EmptyCapture {
                path: output.to_path_buf(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{CommandRunner, ProcessHandle, ProcessOutput};
    use std::sync::Mutex;

    struct DesktopRunner {
        window_present: bool,
        commands: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for DesktopRunner {
        async fn run(
            &self,
            program: &Path,
            args: &[String],
            _limit: Duration,
        ) -> std::io::Result<ProcessOutput> {
            self.commands.lock().unwrap().push(args.to_vec());
            let ok = |stdout: &str| ProcessOutput {
                code: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            };
            match (program.to_string_lossy().as_ref(), args[0].as_str()) {
                ("xdotool", "search") if !self.window_present => Ok(ProcessOutput {
                    code: Some(1),
                    ..Default::default()
                }),
                ("xdotool", "search") => Ok(ok("71303175\n")),
                ("xdotool", "getwindowgeometry") => Ok(ok(
                    "WINDOW=71303175\nX=120\nY=64\nWIDTH=541\nHEIGHT=1081\nSCREEN=0\n",
                )),
                ("ffmpeg", _) => {
                    let output = args.last().cloned().unwrap_or_default();
                    std::fs::write(output, b"RIFF")?;
                    Ok(ok(""))
                }
                _ => Ok(ok("")),
            }
        }

        async fn spawn(
            &self,
            _program: &Path,
            _args: &[String],
        ) -> std::io::Result<Box<dyn ProcessHandle>> {
            Err(std::io::ErrorKind::Unsupported.into())
        }
    }

    fn recorder(window_present: bool) -> (WindowRecorder, Arc<DesktopRunner>) {
        let runner = Arc::new(DesktopRunner {
            window_present,
            commands: Mutex::new(Vec::new()),
        });
        let gateway = Arc::new(ToolGateway::with_runner(runner.clone()));
        let recorder = WindowRecorder::new(
            gateway,
            CaptureSource::EmulatorWindow,
            "Android Emulator - qoemu",
            &QoemuSection::default(),
        );
        (recorder, runner)
    }

    #[test]
    fn parses_shell_geometry() {
        let geometry =
            WindowGeometry::parse_shell("WINDOW=1\nX=10\nY=20\nWIDTH=301\nHEIGHT=600\n").unwrap();
        assert_eq!(geometry.even_size(), (300, 600));
        assert_eq!(WindowGeometry::parse_shell("X=1\nY=2\n"), None);
    }

    #[tokio::test]
    async fn records_window_region() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("VS-A-1_E1-S-1_P0.avi");
        let (recorder, runner) = recorder(true);
        recorder
            .record(&output, Duration::from_secs(34))
            .await
            .unwrap();
        let commands = runner.commands.lock().unwrap();
        assert_eq!(commands[1], vec!["windowactivate", "--sync", "71303175"]);
        let ffmpeg = commands.last().unwrap().join(" ");
        assert!(ffmpeg.contains("-video_size 540x1080 -i :0.0+120,64"));
        assert!(ffmpeg.contains("-framerate 30"));
        assert!(ffmpeg.contains("-t 34.000"));
    }

    #[tokio::test]
    async fn missing_window_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (recorder, runner) = recorder(false);
        let err = recorder
            .record(&dir.path().join("out.avi"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::WindowNotFound { .. }));
        assert_eq!(runner.commands.lock().unwrap().len(), 1);
    }
}
