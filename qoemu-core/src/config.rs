use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

const MAX_CAPTURE_MARGIN_S: f64 = 3600.0;

/// Top-level configuration document with its `QOEMU` and `NETEM` tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QoemuConfig {
    #[serde(rename = "QOEMU", default)]
    pub qoemu: QoemuSection,
    #[serde(rename = "NETEM", default)]
    pub netem: NetemSection,
}

impl QoemuConfig {
    pub fn validate(&self) -> Result<()> {
        let q = &self.qoemu;
        if q.vid_start_detect_thr_size_normal_relevance
            >= q.vid_start_detect_thr_size_high_relevance
        {
            return Err(ConfigError::invalid(
                "VidStartDetectThrSizeNormalRelevance",
                "must be lower than VidStartDetectThrSizeHighRelevance",
            ));
        }
        if q.vid_start_detect_thr_nr_frames == 0 {
            return Err(ConfigError::invalid(
                "VidStartDetectThrNrFrames",
                "must be at least 1",
            ));
        }
        if q.capture_frame_rate == 0 {
            return Err(ConfigError::invalid("CaptureFrameRate", "must be positive"));
        }
        if !(q.capture_margin.is_finite()
            && (0.0..=MAX_CAPTURE_MARGIN_S).contains(&q.capture_margin))
        {
            return Err(ConfigError::invalid(
                "CaptureMargin",
                format!("must be between 0 and {MAX_CAPTURE_MARGIN_S} seconds"),
            ));
        }
        if q.release_tag.is_empty() || q.release_tag.contains(['_', '-', '/']) {
            return Err(ConfigError::invalid(
                "ReleaseTag",
                "must be non-empty and free of '_', '-' and '/'",
            ));
        }
        q.audio_erase_regions()?;
        if self.netem.max_virtual_devices == 0 {
            return Err(ConfigError::invalid("MaxVirtualDevices", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmulatorType {
    #[default]
    None,
    Emulator,
    Genymotion,
    RealDevice,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QoemuSection {
    #[serde(rename = "AVDPath")]
    pub avd_path: PathBuf,
    pub avd_name: String,
    pub video_capture_path: PathBuf,
    pub trigger_image_path: PathBuf,
    pub parameter_file: PathBuf,
    pub emulator_type: EmulatorType,
    pub adb_device_serial: Option<String>,
    pub show_device_frame: bool,
    pub show_device_screen_mirror: bool,
    pub resolution_override: Option<String>,
    pub vid_start_detect_thr_size_normal_relevance: u64,
    pub vid_start_detect_thr_size_high_relevance: u64,
    pub vid_start_detect_thr_nr_frames: u32,
    pub audio_target_volume: f64,
    pub audio_erase_start_stop: Option<String>,
    pub release_tag: String,
    pub ping_host: String,
    pub capture_frame_rate: u32,
    pub capture_margin: f64,
    pub launch_timeout: u64,
    #[serde(rename = "YouTubeWarmupUrl")]
    pub youtube_warmup_url: String,
    pub buffering_spinner_path: Option<PathBuf>,
    pub display: String,
}

impl Default for QoemuSection {
    fn default() -> Self {
        Self {
            avd_path: PathBuf::from("avd"),
            avd_name: "qoemu_pixel".into(),
            video_capture_path: PathBuf::from("captures"),
            trigger_image_path: PathBuf::from("triggers"),
            parameter_file: PathBuf::from("parameters.csv"),
            emulator_type: EmulatorType::None,
            adb_device_serial: None,
            show_device_frame: false,
            show_device_screen_mirror: true,
            resolution_override: None,
            vid_start_detect_thr_size_normal_relevance: 4_000,
            vid_start_detect_thr_size_high_relevance: 15_000,
            vid_start_detect_thr_nr_frames: 10,
            audio_target_volume: -2.0,
            audio_erase_start_stop: None,
            release_tag: "1".into(),
            ping_host: "8.8.8.8".into(),
            capture_frame_rate: 30,
            capture_margin: 2.0,
            launch_timeout: 120,
            youtube_warmup_url: "https://www.youtube.com/watch?v=aqz-KE-bpKQ".into(),
            buffering_spinner_path: None,
            display: ":0.0".into(),
        }
    }
}

impl QoemuSection {
    /// Margin recorded around each stimulus; unvalidated values collapse to zero.
    pub fn capture_margin(&self) -> Duration {
        Duration::try_from_secs_f64(self.capture_margin).unwrap_or_default()
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout)
    }

    /// Parses `AudioEraseStartStop` (`a-b,c-d`, seconds) into muted regions.
    pub fn audio_erase_regions(&self) -> Result<Vec<(f64, f64)>> {
        let Some(raw) = self.audio_erase_start_stop.as_deref() else {
            return Ok(Vec::new());
        };
        let mut regions = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|part| !part.is_empty()) {
            let (start, stop) = part.split_once('-').ok_or_else(|| {
                ConfigError::invalid("AudioEraseStartStop", format!("'{part}' is not a-b"))
            })?;
            let parse = |value: &str| {
                value.trim().parse::<f64>().map_err(|_| {
                    ConfigError::invalid(
                        "AudioEraseStartStop",
                        format!("'{value}' is not a number of seconds"),
                    )
                })
            };
            let (start, stop) = (parse(start)?, parse(stop)?);
            if start < 0.0 || stop <= start {
                return Err(ConfigError::invalid(
                    "AudioEraseStartStop",
                    format!("region {start}-{stop} is empty or negative"),
                ));
            }
            regions.push((start, stop));
        }
        Ok(regions)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetemSection {
    pub net_device_name: String,
    pub excluded_ports: Vec<u16>,
    pub net_em_sanity_check: bool,
    pub max_virtual_devices: usize,
    pub sudo_prefix: bool,
}

impl Default for NetemSection {
    fn default() -> Self {
        Self {
            net_device_name: "eth0".into(),
            excluded_ports: vec![22, 5900],
            net_em_sanity_check: true,
            max_virtual_devices: 3,
            sudo_prefix: true,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<QoemuConfig> {
    let config: QoemuConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
