use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::debug;
use url::Url;

use super::interaction::{Interaction, InteractionRunner, Swipe};
use super::{fixed_clock, UseCaseResult};
use crate::device::{keycode, MobileDevice};

pub(super) const PACKAGE: &str = "com.android.chrome";
const MAIN_ACTIVITY: &str = "com.android.chrome/com.google.android.apps.chrome.Main";
const URL_BAR_ID: &str = "url_bar";
const SCROLL_PAUSE: Duration = Duration::from_secs(4);

/// Per-site interactions that run after the page was requested.
const SITE_SCRIPTS: [(&str, SiteScript); 2] = [
    ("en.wikipedia.org", SiteScript::Scroll { times: 2 }),
    ("www.spiegel.de", SiteScript::Scroll { times: 3 }),
];

#[derive(Debug, Clone, Copy)]
enum SiteScript {
    Scroll { times: u8 },
}

impl SiteScript {
    fn interactions(self) -> Vec<Interaction> {
        match self {
            SiteScript::Scroll { times } => (0..times)
                .map(|_| {
                    Interaction::swipe(Swipe {
                        from: (540, 1600),
                        to: (540, 600),
                        millis: 400,
                    })
                    .after(SCROLL_PAUSE)
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebBrowsing {
    url: String,
    script: Vec<Interaction>,
}

impl WebBrowsing {
    pub fn new(url: &str) -> Self {
        let host = Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_string));
        let script = host
            .and_then(|host| {
                SITE_SCRIPTS
                    .iter()
                    .find(|(site, _)| *site == host)
                    .map(|(_, script)| script.interactions())
            })
            .unwrap_or_default();
        Self {
            url: url.to_string(),
            script,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn script(&self) -> &[Interaction] {
        &self.script
    }

    fn clear_cache_script() -> Vec<Interaction> {
        vec![
            Interaction::tap_id("tab_switcher_button"),
            Interaction::tap_id("menu_button"),
            Interaction::tap_text("Close all tabs"),
            Interaction::tap_id("menu_button"),
            Interaction::tap_text("History"),
            Interaction::tap_text("Clear browsing data…"),
            Interaction::tap_id("clear_button"),
            Interaction::until_gone("clear_button").then_key(keycode::BACK),
        ]
    }

    pub(super) async fn prepare(
        &self,
        device: &dyn MobileDevice,
        runner: &InteractionRunner,
    ) -> UseCaseResult<()> {
        device.set_auto_time(false).await?;
        device.set_clock(fixed_clock()).await?;
        device.force_stop(PACKAGE).await?;
        device.start_activity(MAIN_ACTIVITY).await?;
        runner.run(device, &Self::clear_cache_script()).await
    }

    pub(super) async fn execute(
        &self,
        device: &dyn MobileDevice,
        runner: &InteractionRunner,
        duration: Duration,
    ) -> UseCaseResult<()> {
        let deadline = Instant::now() + duration;
        debug!(url = %self.url, "requesting page");
        runner
            .run(
                device,
                &[Interaction::tap_id(URL_BAR_ID)
                    .then_type(self.url.as_str())
                    .then_key(keycode::ENTER)],
            )
            .await?;
        runner.run(device, &self.script).await?;
        sleep_until(deadline).await;
        Ok(())
    }
}
