//! Scripted device shared by the use case tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::device::{DeviceResult, DeviceVariant, MobileDevice, Orientation};

/// Answers UI dumps from a queue of screens, then from a fallback screen.
/// Every shell command is journaled with the (paused) clock reading.
pub(super) struct ScreenDevice {
    journal: Mutex<Vec<(Instant, String)>>,
    screens: Mutex<VecDeque<String>>,
    fallback: String,
}

impl ScreenDevice {
    pub(super) fn showing(fallback: String) -> Self {
        Self {
            journal: Mutex::new(Vec::new()),
            screens: Mutex::new(VecDeque::new()),
            fallback,
        }
    }

    /// Serves `screen` for the next `dumps` UI dumps before the fallback.
    pub(super) fn first_showing(self, screen: String, dumps: usize) -> Self {
        self.screens
            .lock()
            .unwrap()
            .extend(std::iter::repeat(screen).take(dumps));
        self
    }

    /// Journaled commands other than UI dumps.
    pub(super) fn actions(&self) -> Vec<String> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .map(|(_, line)| line.clone())
            .filter(|line| !line.starts_with("uiautomator"))
            .collect()
    }

    /// When `line` was first sent.
    pub(super) fn sent_at(&self, line: &str) -> Instant {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .find(|(_, sent)| sent == line)
            .map(|(at, _)| *at)
            .unwrap_or_else(|| panic!("'{line}' was never sent"))
    }
}

/// Builds a dump whose nodes all share the bounds `[0,0][100,100]`.
/// Each entry is `(resource id, text)`; an empty id leaves the node without one.
pub(super) fn screen(nodes: &[(&str, &str)]) -> String {
    let mut xml = String::from("<hierarchy rotation=\"0\">");
    for (id, text) in nodes {
        let resource_id = if id.is_empty() {
            String::new()
        } else {
            format!("com.example:id/{id}")
        };
        xml.push_str(&format!(
            r#"<node text="{text}" resource-id="{resource_id}" class="android.view.View" content-desc="" bounds="[0,0][100,100]" />"#
        ));
    }
    xml.push_str("</hierarchy>");
    xml
}

#[async_trait]
impl MobileDevice for ScreenDevice {
    fn variant(&self) -> DeviceVariant {
        DeviceVariant::Emulator
    }

    fn window_title(&self) -> String {
        "screens".into()
    }

    async fn launch(&self, _: Orientation, _: bool) -> DeviceResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> DeviceResult<()> {
        Ok(())
    }

    async fn shell(&self, command: &[String]) -> DeviceResult<String> {
        let line = command.join(" ");
        self.journal
            .lock()
            .unwrap()
            .push((Instant::now(), line.clone()));
        if line.starts_with("uiautomator") {
            let next = self.screens.lock().unwrap().pop_front();
            return Ok(next.unwrap_or_else(|| self.fallback.clone()));
        }
        Ok(String::new())
    }
}
