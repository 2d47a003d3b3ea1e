use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    wait_for_address, Adb, DeviceError, DeviceResult, DeviceVariant, MobileDevice, Orientation,
};
use crate::config::QoemuSection;
use crate::tools::{argv, ProcessHandle, ToolGateway, ToolKind};

const ADDRESS_POLL: Duration = Duration::from_secs(1);
const PLAYSTORE_KEY: &str = "PlayStore.enabled";
const SYSTEM_IMAGE_KEY: &str = "image.sysdir.1";
const DEVICE_PROFILE_KEY: &str = "hw.device.name";
const DEFAULT_DEVICE_PROFILE: &str = "pixel_3";
const LCD_DENSITY: &str = "440";

/// `config.ini` of an AVD: `key=value` lines without sections, order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvdConfig {
    entries: Vec<(String, String)>,
}

impl AvdConfig {
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let (key, value) = line.split_once('=')?;
                let key = key.trim();
                (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(candidate, _)| candidate == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    pub fn playstore(&self) -> bool {
        self.get(PLAYSTORE_KEY)
            .is_some_and(|value| value.eq_ignore_ascii_case("true") || value == "yes")
    }

    /// Applies the launch settings recorded for every stimulus.
    pub fn apply(&mut self, orientation: Orientation, playstore: bool, show_frame: bool) {
        let yes_no = |flag: bool| if flag { "yes" } else { "no" };
        self.set("hw.initialOrientation", orientation.as_str());
        self.set("hw.keyboard", "yes");
        self.set("hw.lcd.density", LCD_DENSITY);
        self.set("hw.gpu.enabled", "yes");
        self.set("hw.gpu.mode", "host");
        self.set(PLAYSTORE_KEY, if playstore { "true" } else { "false" });
        self.set("showDeviceFrame", yes_no(show_frame));
    }

    /// `avdmanager` package for the configured system image with the requested store flavour.
    ///
    /// `system-images/android-30/google_apis/x86_64/` becomes
    /// `system-images;android-30;google_apis_playstore;x86_64` when `playstore` is set.
    pub fn system_image_package(&self, playstore: bool) -> Option<String> {
        let sysdir = self.get(SYSTEM_IMAGE_KEY)?;
        let mut parts: Vec<String> = sysdir
            .trim_matches('/')
            .split('/')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();
        if parts.len() != 4 {
            return None;
        }
        let tag = parts[2].trim_end_matches("_playstore").to_string();
        parts[2] = if playstore {
            format!("{tag}_playstore")
        } else {
            tag
        };
        Some(parts.join(";"))
    }
}

/// Managed Android SDK emulator.
pub struct AndroidEmulator {
    adb: Adb,
    gateway: Arc<ToolGateway>,
    avd_path: PathBuf,
    avd_name: String,
    show_frame: bool,
    launch_timeout: Duration,
    process: Mutex<Option<Box<dyn ProcessHandle>>>,
}

impl AndroidEmulator {
    pub fn new(adb: Adb, gateway: Arc<ToolGateway>, settings: &QoemuSection) -> Self {
        Self {
            adb,
            gateway,
            avd_path: settings.avd_path.clone(),
            avd_name: settings.avd_name.clone(),
            show_frame: settings.show_device_frame,
            launch_timeout: settings.launch_timeout(),
            process: Mutex::new(None),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.avd_path
            .join(format!("{}.avd", self.avd_name))
            .join("config.ini")
    }

    async fn read_config(path: &Path) -> DeviceResult<AvdConfig> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DeviceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(AvdConfig::parse(&content))
    }

    async fn write_config(path: &Path, config: &AvdConfig) -> DeviceResult<()> {
        tokio::fs::write(path, config.render())
            .await
            .map_err(|source| DeviceError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Deletes and re-creates the AVD with a system image of the other store flavour.
    async fn recreate(&self, current: &AvdConfig, playstore: bool) -> DeviceResult<()> {
        let path = self.config_path();
        let package = current
            .system_image_package(playstore)
            .ok_or_else(|| DeviceError::Config {
                path: path.clone(),
                detail: format!("{SYSTEM_IMAGE_KEY} does not name a system image"),
            })?;
        let profile = current
            .get(DEVICE_PROFILE_KEY)
            .unwrap_or(DEFAULT_DEVICE_PROFILE)
            .to_string();
        info!(avd = %self.avd_name, %package, "re-creating virtual device");
        self.gateway
            .run(
                ToolKind::Avdmanager,
                &argv(["delete", "avd", "-n", self.avd_name.as_str()]),
            )
            .await?;
        let avd_dir = self.avd_path.join(format!("{}.avd", self.avd_name));
        self.gateway
            .run_with_timeout(
                ToolKind::Avdmanager,
                &argv([
                    "create".to_string(),
                    "avd".into(),
                    "--force".into(),
                    "-n".into(),
                    self.avd_name.clone(),
                    "-k".into(),
                    package,
                    "-d".into(),
                    profile,
                    "-p".into(),
                    avd_dir.to_string_lossy().to_string(),
                ]),
                self.launch_timeout,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MobileDevice for AndroidEmulator {
    fn variant(&self) -> DeviceVariant {
        DeviceVariant::Emulator
    }

    fn window_title(&self) -> String {
        format!("Android Emulator - {}", self.avd_name)
    }

    async fn launch(&self, orientation: Orientation, playstore: bool) -> DeviceResult<()> {
        let path = self.config_path();
        let mut config = Self::read_config(&path).await?;
        if config.playstore() != playstore {
            self.recreate(&config, playstore).await?;
            config = Self::read_config(&path).await?;
        }
        config.apply(orientation, playstore, self.show_frame);
        Self::write_config(&path, &config).await?;

        let mut process = self.process.lock().await;
        if process.is_none() {
            let mut args = argv([
                "-avd",
                self.avd_name.as_str(),
                "-no-snapshot",
                "-no-boot-anim",
            ]);
            if !self.show_frame {
                args.push("-no-skin".into());
            }
            info!(avd = %self.avd_name, orientation = orientation.as_str(), playstore, "starting emulator");
            *process = Some(self.gateway.spawn(ToolKind::Emulator, &args).await?);
        }
        drop(process);

        self.adb.wait_for_device(self.launch_timeout).await?;
        self.adb.wait_for_boot(self.launch_timeout).await?;
        self.unlock().await?;
        wait_for_address(self, self.launch_timeout, ADDRESS_POLL).await?;
        Ok(())
    }

    async fn shutdown(&self) -> DeviceResult<()> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };
        if let Err(err) = self.adb.emu_kill().await {
            warn!(avd = %self.avd_name, error = %err, "emulator console kill failed");
        }
        process.stop().await.map_err(|source| DeviceError::Io {
            path: PathBuf::from(ToolKind::Emulator.binary()),
            source,
        })?;
        info!(avd = %self.avd_name, "emulator stopped");
        Ok(())
    }

    async fn shell(&self, command: &[String]) -> DeviceResult<String> {
        self.adb.shell(command).await
    }
}
