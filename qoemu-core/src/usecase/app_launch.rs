use std::time::Duration;

use regex::Regex;
use tokio::time::{sleep_until, Instant};
use tracing::info;

use super::interaction::{Interaction, InteractionRunner};
use super::{fixed_clock, UseCaseError, UseCaseResult};
use crate::device::{keycode, MobileDevice};
use crate::tools::argv;

/// Package name to the label shown in the system app list.
const APP_LABELS: [(&str, &str); 8] = [
    ("com.google.android.youtube", "YouTube"),
    ("com.android.chrome", "Chrome"),
    ("com.google.android.apps.maps", "Maps"),
    ("com.instagram.android", "Instagram"),
    ("com.facebook.katana", "Facebook"),
    ("com.spotify.music", "Spotify"),
    ("com.whatsapp", "WhatsApp"),
    ("com.twitter.android", "X"),
];

pub fn app_label(package: &str) -> Option<&'static str> {
    APP_LABELS
        .iter()
        .find(|(candidate, _)| *candidate == package)
        .map(|(_, label)| *label)
}

#[derive(Debug, Clone)]
pub struct AppLaunch {
    component: String,
    package: String,
    label: &'static str,
    script: Vec<Interaction>,
}

impl AppLaunch {
    /// Accepts `package/activity` (the component `am start -n` takes).
    pub fn from_link(link: &str) -> UseCaseResult<Self> {
        let component = link.trim();
        let (package, activity) = component.split_once('/').ok_or_else(|| {
            UseCaseError::InvalidParameter(format!("'{component}' is not package/activity"))
        })?;
        if package.is_empty() || activity.is_empty() {
            return Err(UseCaseError::InvalidParameter(format!(
                "'{component}' is not package/activity"
            )));
        }
        let label = app_label(package).ok_or_else(|| {
            UseCaseError::InvalidParameter(format!("no settings label known for {package}"))
        })?;
        Ok(Self {
            component: component.to_string(),
            package: package.to_string(),
            label,
            script: Vec::new(),
        })
    }

    pub fn with_script(mut self, script: Vec<Interaction>) -> Self {
        self.script = script;
        self
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    fn cache_reset_script(&self) -> UseCaseResult<Vec<Interaction>> {
        let storage = Regex::new(r"^Storage").map_err(|err| {
            UseCaseError::InvalidParameter(format!("storage label: {err}"))
        })?;
        Ok(vec![
            Interaction::tap_text(self.label),
            Interaction::tap_pattern(storage),
            Interaction::tap_text("Clear cache").then_key(keycode::HOME),
        ])
    }

    pub(super) async fn prepare(
        &self,
        device: &dyn MobileDevice,
        runner: &InteractionRunner,
    ) -> UseCaseResult<()> {
        device.force_stop(&self.package).await?;
        device.set_auto_time(false).await?;
        device.set_clock(fixed_clock()).await?;
        device
            .shell(&argv([
                "am",
                "start",
                "-a",
                "android.settings.MANAGE_APPLICATIONS_SETTINGS",
            ]))
            .await?;
        runner.run(device, &self.cache_reset_script()?).await?;
        info!(package = %self.package, "app cache reset");
        Ok(())
    }

    pub(super) async fn execute(
        &self,
        device: &dyn MobileDevice,
        runner: &InteractionRunner,
        duration: Duration,
    ) -> UseCaseResult<()> {
        let deadline = Instant::now() + duration;
        device.start_activity(&self.component).await?;
        runner.run(device, &self.script).await?;
        sleep_until(deadline).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usecase::testing::{screen, ScreenDevice};

    #[test]
    fn parses_component_links() {
        let app = AppLaunch::from_link("com.spotify.music/.MainActivity").unwrap();
        assert_eq!(app.package(), "com.spotify.music");
        assert_eq!(app.component(), "com.spotify.music/.MainActivity");
        assert_eq!(app.label, "Spotify");

        assert!(matches!(
            AppLaunch::from_link("com.spotify.music"),
            Err(UseCaseError::InvalidParameter(_))
        ));
        assert!(matches!(
            AppLaunch::from_link("org.unknown.app/.Main"),
            Err(UseCaseError::InvalidParameter(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_clears_cache_through_settings() {
        let device = ScreenDevice::showing(screen(&[
            ("", "Spotify"),
            ("", "Storage &amp; cache"),
            ("", "Clear cache"),
        ]));
        let app = AppLaunch::from_link("com.spotify.music/.MainActivity").unwrap();
        app.prepare(&device, &InteractionRunner::default())
            .await
            .unwrap();
        assert_eq!(
            device.actions(),
            vec![
                "am force-stop com.spotify.music",
                "settings put global auto_time 0",
                "date 010112002021.00",
                "am start -a android.settings.MANAGE_APPLICATIONS_SETTINGS",
                "input tap 50 50",
                "input tap 50 50",
                "input tap 50 50",
                "input keyevent 3",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_clear_button_times_out() {
        let device = ScreenDevice::showing(screen(&[("", "Spotify"), ("", "Storage")]));
        let app = AppLaunch::from_link("com.spotify.music/.MainActivity").unwrap();
        let started = Instant::now();
        let err = app
            .prepare(&device, &InteractionRunner::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UseCaseError::UiElementNotFound { element } if element == "text 'Clear cache'"
        ));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(!device.actions().contains(&"input keyevent 3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_starts_component_and_runs_to_deadline() {
        let device = ScreenDevice::showing(screen(&[("", "Home")]));
        let app = AppLaunch::from_link("com.spotify.music/.MainActivity")
            .unwrap()
            .with_script(vec![Interaction::tap_text("Home").after(Duration::from_secs(2))]);
        let started = Instant::now();
        app.execute(&device, &InteractionRunner::default(), Duration::from_secs(6))
            .await
            .unwrap();
        assert_eq!(
            device.actions(),
            vec!["am start -W -n com.spotify.music/.MainActivity", "input tap 50 50"]
        );
        assert_eq!(
            device.sent_at("input tap 50 50") - started,
            Duration::from_secs(2)
        );
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }
}
