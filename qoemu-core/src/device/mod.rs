//! Uniform control over the three device backends.
//!
//! Backends only implement lifecycle and raw shell access; every input and
//! measurement primitive is expressed once on top of `shell` in the trait's
//! provided methods.

pub mod adb;
pub mod emulator;
pub mod genymotion;
pub mod real;
#[cfg(test)]
mod testing;
pub mod ui;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::{EmulatorType, QoemuConfig};
use crate::tools::{argv, ToolError, ToolGateway};

pub use adb::Adb;
pub use emulator::{AndroidEmulator, AvdConfig};
pub use genymotion::Genymotion;
pub use real::RealDevice;
pub use ui::{parse_ui_dump, Bounds, UiNode};

pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device has no network address after {after:?}")]
    LaunchTimeout { after: Duration },
    #[error("round-trip measurement failed: {0}")]
    MeasurementFailed(String),
    #[error("invalid device configuration {path}: {detail}")]
    Config { path: PathBuf, detail: String },
    #[error("device file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// The backend a stimulus was recorded with; part of every artifact name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceVariant {
    Emulator,
    Genymotion,
    RealDevice,
}

impl DeviceVariant {
    pub fn tag(self) -> char {
        match self {
            DeviceVariant::Emulator => 'S',
            DeviceVariant::Genymotion => 'G',
            DeviceVariant::RealDevice => 'R',
        }
    }

    pub fn from_config(emulator_type: EmulatorType) -> Option<Self> {
        match emulator_type {
            EmulatorType::Emulator => Some(DeviceVariant::Emulator),
            EmulatorType::Genymotion => Some(DeviceVariant::Genymotion),
            EmulatorType::RealDevice => Some(DeviceVariant::RealDevice),
            EmulatorType::None => None,
        }
    }
}

impl fmt::Display for DeviceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceVariant::Emulator => "emulator",
            DeviceVariant::Genymotion => "genymotion",
            DeviceVariant::RealDevice => "realdevice",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        }
    }

    /// Value of `settings system user_rotation`.
    fn rotation(self) -> u8 {
        match self {
            Orientation::Portrait => 0,
            Orientation::Landscape => 1,
        }
    }
}

pub mod keycode {
    pub const HOME: u32 = 3;
    pub const BACK: u32 = 4;
    pub const DPAD_DOWN: u32 = 20;
    pub const ENTER: u32 = 66;
    pub const MENU: u32 = 82;
    pub const MEDIA_PLAY_PAUSE: u32 = 85;
    pub const WAKEUP: u32 = 224;
}

const MEDIA_STREAM_MUSIC: u8 = 3;
const RTT_PROBES: u32 = 15;

#[async_trait]
pub trait MobileDevice: Send + Sync {
    fn variant(&self) -> DeviceVariant;

    /// Substring of the on-screen window showing this device.
    fn window_title(&self) -> String;

    /// Starts the device and returns once it has a usable network address.
    async fn launch(&self, orientation: Orientation, playstore: bool) -> DeviceResult<()>;

    /// Stops the device. Calling it on a stopped device is a no-op.
    async fn shutdown(&self) -> DeviceResult<()>;

    /// Runs one `adb shell` command and returns its stdout.
    async fn shell(&self, command: &[String]) -> DeviceResult<String>;

    async fn ip_address(&self) -> DeviceResult<Option<Ipv4Addr>> {
        let output = self
            .shell(&argv(["ip", "-f", "inet", "addr", "show", "wlan0"]))
            .await?;
        Ok(adb::parse_inet_address(&output))
    }

    /// Average round-trip time in milliseconds to `host`.
    async fn measure_rtt(&self, host: &str) -> DeviceResult<f64> {
        if let Err(err) = self.shell(&argv(["ping", "-c", "1", host])).await {
            debug!(host, error = %err, "warm-up ping failed");
        }
        let output = self
            .shell(&argv([
                "ping".to_string(),
                "-c".into(),
                RTT_PROBES.to_string(),
                "-i".into(),
                "0.2".into(),
                host.into(),
            ]))
            .await
            .map_err(|err| DeviceError::MeasurementFailed(err.to_string()))?;
        let rtt = parse_ping_average(&output).ok_or_else(|| {
            DeviceError::MeasurementFailed(format!("no average in ping output: {}", output.trim()))
        })?;
        info!(host, rtt_ms = rtt, "measured round-trip time");
        Ok(rtt)
    }

    async fn input_keyevent(&self, code: u32) -> DeviceResult<()> {
        self.shell(&argv(["input".to_string(), "keyevent".into(), code.to_string()]))
            .await
            .map(|_| ())
    }

    async fn unlock(&self) -> DeviceResult<()> {
        self.input_keyevent(keycode::WAKEUP).await?;
        self.shell(&argv(["wm", "dismiss-keyguard"])).await.map(|_| ())
    }

    /// Sends `rate` UDP datagrams of `size` bytes per second to `host:port` for `duration`.
    ///
    /// The sender runs detached on the device; this call returns immediately.
    async fn generate_udp_keepalive(
        &self,
        host: &str,
        size: usize,
        rate: u32,
        duration: Duration,
        port: u16,
    ) -> DeviceResult<()> {
        if rate == 0 {
            return Ok(());
        }
        let count = (duration.as_secs_f64() * f64::from(rate)).ceil() as u64;
        let interval = 1.0 / f64::from(rate);
        let script = format!(
            "i=0; while [ $i -lt {count} ]; do head -c {size} /dev/zero | nc -u -w 1 {host} {port}; sleep {interval:.3}; i=$((i+1)); done"
        );
        self.shell(&argv([
            "nohup".to_string(),
            "sh".into(),
            "-c".into(),
            format!("'{script}'"),
            ">/dev/null".into(),
            "2>&1".into(),
            "&".into(),
        ]))
        .await
        .map(|_| ())
    }

    async fn tap(&self, x: i32, y: i32) -> DeviceResult<()> {
        self.shell(&argv([
            "input".to_string(),
            "tap".into(),
            x.to_string(),
            y.to_string(),
        ]))
        .await
        .map(|_| ())
    }

    async fn swipe(&self, from: (i32, i32), to: (i32, i32), millis: u64) -> DeviceResult<()> {
        self.shell(&argv([
            "input".to_string(),
            "swipe".into(),
            from.0.to_string(),
            from.1.to_string(),
            to.0.to_string(),
            to.1.to_string(),
            millis.to_string(),
        ]))
        .await
        .map(|_| ())
    }

    async fn input_text(&self, text: &str) -> DeviceResult<()> {
        self.shell(&argv(["input".to_string(), "text".into(), adb::escape_input_text(text)]))
            .await
            .map(|_| ())
    }

    async fn dump_ui(&self) -> DeviceResult<Vec<UiNode>> {
        let output = self
            .shell(&argv(["uiautomator", "dump", "/dev/tty"]))
            .await?;
        Ok(parse_ui_dump(&output))
    }

    async fn start_activity(&self, component: &str) -> DeviceResult<()> {
        self.shell(&argv(["am", "start", "-W", "-n", component]))
            .await
            .map(|_| ())
    }

    async fn open_url(&self, url: &str, package: Option<&str>) -> DeviceResult<()> {
        let mut command = argv([
            "am".to_string(),
            "start".into(),
            "-a".into(),
            "android.intent.action.VIEW".into(),
            "-d".into(),
            format!("'{url}'"),
        ]);
        if let Some(package) = package {
            command.push(package.to_string());
        }
        self.shell(&command).await.map(|_| ())
    }

    async fn force_stop(&self, package: &str) -> DeviceResult<()> {
        self.shell(&argv(["am", "force-stop", package]))
            .await
            .map(|_| ())
    }

    async fn clear_app(&self, package: &str) -> DeviceResult<()> {
        self.shell(&argv(["pm", "clear", package])).await.map(|_| ())
    }

    async fn set_auto_time(&self, enabled: bool) -> DeviceResult<()> {
        let value = if enabled { "1" } else { "0" };
        self.shell(&argv(["settings", "put", "global", "auto_time", value]))
            .await
            .map(|_| ())
    }

    async fn set_clock(&self, at: DateTime<Utc>) -> DeviceResult<()> {
        self.shell(&argv([
            "date".to_string(),
            at.format("%m%d%H%M%Y.%S").to_string(),
        ]))
        .await
        .map(|_| ())
    }

    async fn set_media_volume(&self, level: u8) -> DeviceResult<()> {
        self.shell(&argv([
            "cmd".to_string(),
            "media_session".into(),
            "volume".into(),
            "--stream".into(),
            MEDIA_STREAM_MUSIC.to_string(),
            "--set".into(),
            level.to_string(),
        ]))
        .await
        .map(|_| ())
    }

    /// Locks the screen rotation through system settings.
    async fn apply_orientation(&self, orientation: Orientation) -> DeviceResult<()> {
        self.shell(&argv(["settings", "put", "system", "accelerometer_rotation", "0"]))
            .await?;
        self.shell(&argv([
            "settings".to_string(),
            "put".into(),
            "system".into(),
            "user_rotation".into(),
            orientation.rotation().to_string(),
        ]))
        .await
        .map(|_| ())
    }
}

/// Polls the device until it reports a wireless address or `limit` elapses.
pub async fn wait_for_address(
    device: &dyn MobileDevice,
    limit: Duration,
    poll: Duration,
) -> DeviceResult<Ipv4Addr> {
    let deadline = Instant::now() + limit;
    loop {
        match device.ip_address().await {
            Ok(Some(address)) => {
                info!(%address, "device has network address");
                return Ok(address);
            }
            Ok(None) => debug!("device has no address yet"),
            Err(err) => debug!(error = %err, "address query failed"),
        }
        if Instant::now() >= deadline {
            return Err(DeviceError::LaunchTimeout { after: limit });
        }
        sleep(poll).await;
    }
}

fn parse_ping_average(output: &str) -> Option<f64> {
    static AVERAGE: OnceLock<Regex> = OnceLock::new();
    let regex = AVERAGE.get_or_init(|| {
        Regex::new(r"=\s*[0-9.]+/([0-9.]+)/[0-9.]+").expect("valid regex")
    });
    regex
        .captures(output)
        .and_then(|captures| captures.get(1))
        .and_then(|average| average.as_str().parse().ok())
}

/// Builds the configured backend.
pub fn build_device(
    config: &QoemuConfig,
    gateway: Arc<ToolGateway>,
) -> Option<Arc<dyn MobileDevice>> {
    let variant = DeviceVariant::from_config(config.qoemu.emulator_type)?;
    let adb = Adb::new(Arc::clone(&gateway), config.qoemu.adb_device_serial.clone());
    let device: Arc<dyn MobileDevice> = match variant {
        DeviceVariant::Emulator => Arc::new(AndroidEmulator::new(adb, gateway, &config.qoemu)),
        DeviceVariant::Genymotion => Arc::new(Genymotion::new(adb, gateway, &config.qoemu)),
        DeviceVariant::RealDevice => Arc::new(RealDevice::new(adb, gateway, &config.qoemu)),
    };
    Some(device)
}
