use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{wait_for_address, Adb, DeviceResult, DeviceVariant, MobileDevice, Orientation};
use crate::config::QoemuSection;
use crate::tools::{argv, ToolGateway, ToolKind};

const ADDRESS_POLL: Duration = Duration::from_secs(1);

/// Genymotion virtual device driven through `gmtool`.
pub struct Genymotion {
    adb: Adb,
    gateway: Arc<ToolGateway>,
    name: String,
    launch_timeout: Duration,
    running: AtomicBool,
}

impl Genymotion {
    pub fn new(adb: Adb, gateway: Arc<ToolGateway>, settings: &QoemuSection) -> Self {
        Self {
            adb,
            gateway,
            name: settings.avd_name.clone(),
            launch_timeout: settings.launch_timeout(),
            running: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MobileDevice for Genymotion {
    fn variant(&self) -> DeviceVariant {
        DeviceVariant::Genymotion
    }

    fn window_title(&self) -> String {
        self.name.clone()
    }

    async fn launch(&self, orientation: Orientation, playstore: bool) -> DeviceResult<()> {
        if playstore {
            warn!(device = %self.name, "play store images are not managed for genymotion devices");
        }
        if !self.running.load(Ordering::SeqCst) {
            info!(device = %self.name, "starting genymotion device");
            self.gateway
                .run_with_timeout(
                    ToolKind::Gmtool,
                    &argv(["admin", "start", self.name.as_str()]),
                    self.launch_timeout,
                )
                .await?;
            self.running.store(true, Ordering::SeqCst);
        }
        self.adb.wait_for_device(self.launch_timeout).await?;
        self.adb.wait_for_boot(self.launch_timeout).await?;
        self.apply_orientation(orientation).await?;
        self.unlock().await?;
        wait_for_address(self, self.launch_timeout, ADDRESS_POLL).await?;
        Ok(())
    }

    async fn shutdown(&self) -> DeviceResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.gateway
            .run(ToolKind::Gmtool, &argv(["admin", "stop", self.name.as_str()]))
            .await?;
        info!(device = %self.name, "genymotion device stopped");
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

    fn genymotion(rig: &Arc<DeviceRig>) -> Genymotion {
        let settings = QoemuSection {
            avd_name: "Pixel3".into(),
            adb_device_serial: Some("192.168.56.101:5555".into()),
            ..QoemuSection::default()
        };
        let (adb, gateway) = wire(rig, &settings);
        Genymotion::new(adb, gateway, &settings)
    }

    #[tokio::test]
    async fn starts_once_and_stops_once() {
        let rig = Arc::new(DeviceRig::default());
        let device = genymotion(&rig);
        device.launch(Orientation::Landscape, false).await.unwrap();
        device.launch(Orientation::Landscape, false).await.unwrap();
        assert_eq!(rig.lines_starting("gmtool"), vec!["gmtool admin start Pixel3"]);

        let started = rig.position("gmtool admin start Pixel3");
        let attached = rig.position("adb -s 192.168.56.101:5555 wait-for-device");
        let rotated =
            rig.position("adb -s 192.168.56.101:5555 shell settings put system user_rotation 1");
        let woken = rig.position("adb -s 192.168.56.101:5555 shell input keyevent 224");
        assert!(started < attached && attached < rotated && rotated < woken);

        device.shutdown().await.unwrap();
        device.shutdown().await.unwrap();
        assert_eq!(
            rig.lines_starting("gmtool"),
            vec!["gmtool admin start Pixel3", "gmtool admin stop Pixel3"]
        );
    }

    #[tokio::test]
    async fn shutdown_of_idle_device_is_silent() {
        let rig = Arc::new(DeviceRig::default());
        genymotion(&rig).shutdown().await.unwrap();
        assert!(rig.journal().is_empty());
    }
}
