use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::{
    wait_for_address, Adb, DeviceError, DeviceResult, DeviceVariant, MobileDevice, Orientation,
};
use crate::config::QoemuSection;
use crate::tools::{argv, ProcessHandle, ToolGateway, ToolKind};

const ADDRESS_POLL: Duration = Duration::from_secs(1);
pub const MIRROR_WINDOW_TITLE: &str = "qoemu-mirror";

/// Physical handset reachable over adb, shown on screen through `scrcpy`.
pub struct RealDevice {
    adb: Adb,
    gateway: Arc<ToolGateway>,
    show_mirror: bool,
    launch_timeout: Duration,
    mirror: Mutex<Option<Box<dyn ProcessHandle>>>,
}

impl RealDevice {
    pub fn new(adb: Adb, gateway: Arc<ToolGateway>, settings: &QoemuSection) -> Self {
        Self {
            adb,
            gateway,
            show_mirror: settings.show_device_screen_mirror,
            launch_timeout: settings.launch_timeout(),
            mirror: Mutex::new(None),
        }
    }

    fn mirror_args(&self) -> Vec<String> {
        let mut args = argv(["--window-title", MIRROR_WINDOW_TITLE, "--stay-awake"]);
        if let Some(serial) = self.adb.serial() {
            args.push("--serial".into());
            args.push(serial.to_string());
        }
        args
    }
}

#[async_trait]
impl MobileDevice for RealDevice {
    fn variant(&self) -> DeviceVariant {
        DeviceVariant::RealDevice
    }

    fn window_title(&self) -> String {
        MIRROR_WINDOW_TITLE.to_string()
    }

    async fn launch(&self, orientation: Orientation, _playstore: bool) -> DeviceResult<()> {
        self.adb.wait_for_device(self.launch_timeout).await?;
        self.unlock().await?;
        self.apply_orientation(orientation).await?;
        if self.show_mirror {
            let mut mirror = self.mirror.lock().await;
            if mirror.is_none() {
                info!(serial = ?self.adb.serial(), "starting screen mirror");
                *mirror = Some(self.gateway.spawn(ToolKind::Scrcpy, &self.mirror_args()).await?);
            }
        }
        wait_for_address(self, self.launch_timeout, ADDRESS_POLL).await?;
        Ok(())
    }

    async fn shutdown(&self) -> DeviceResult<()> {
        let Some(mut mirror) = self.mirror.lock().await.take() else {
            return Ok(());
        };
        mirror.stop().await.map_err(|source| DeviceError::Io {
            path: PathBuf::from(ToolKind::Scrcpy.binary()),
            source,
        })?;
        info!("screen mirror stopped");
        Ok(())
    }

    async fn shell(&self, command: &[String]) -> DeviceResult<String> {
        self.adb.shell(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::{wire, DeviceRig};

    fn handset(rig: &Arc<DeviceRig>, show_mirror: bool) -> RealDevice {
        let settings = QoemuSection {
            adb_device_serial: Some("R58M".into()),
            show_device_screen_mirror: show_mirror,
            ..QoemuSection::default()
        };
        let (adb, gateway) = wire(rig, &settings);
        RealDevice::new(adb, gateway, &settings)
    }

    #[tokio::test]
    async fn mirror_is_started_once_and_stopped_on_shutdown() {
        let rig = Arc::new(DeviceRig::default());
        let device = handset(&rig, true);
        device.launch(Orientation::Portrait, false).await.unwrap();
        device.launch(Orientation::Portrait, false).await.unwrap();
        assert_eq!(
            rig.lines_starting("spawn"),
            vec!["spawn scrcpy --window-title qoemu-mirror --stay-awake --serial R58M"]
        );
        assert!(
            rig.position("adb -s R58M shell settings put system user_rotation 0")
                < rig.position("spawn scrcpy --window-title qoemu-mirror --stay-awake --serial R58M")
        );

        device.shutdown().await.unwrap();
        device.shutdown().await.unwrap();
        assert_eq!(rig.lines_starting("stop"), vec!["stop scrcpy"]);
        assert_eq!(rig.journal().last().map(String::as_str), Some("stop scrcpy"));
    }

    #[tokio::test]
    async fn no_mirror_when_disabled() {
        let rig = Arc::new(DeviceRig::default());
        let device = handset(&rig, false);
        device.launch(Orientation::Landscape, false).await.unwrap();
        device.shutdown().await.unwrap();
        assert!(rig.lines_starting("spawn").is_empty());
        assert!(rig.lines_starting("stop").is_empty());
        rig.position("adb -s R58M shell ip -f inet addr show wlan0");
    }
}
