use std::time::Duration;

use regex::Regex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info};
use url::Url;

use super::interaction::{Interaction, InteractionRunner};
use super::{UseCaseError, UseCaseResult};
use crate::device::{keycode, MobileDevice};

pub(super) const PACKAGE: &str = "com.google.android.youtube";
const PLAYER_ID: &str = "watch_player";
const OVERFLOW_ID: &str = "player_overflow_button";
const FULLSCREEN_ID: &str = "fullscreen_button";
const MEDIA_VOLUME: u8 = 8;
const WARMUP_LOAD: Duration = Duration::from_secs(8);
const SETTLE: Duration = Duration::from_secs(3);
/// Time before the end of the budget at which the resolution label is brought up.
const LABEL_LEAD: Duration = Duration::from_secs(3);

/// Appends a `t=` start offset to the query, keeping any fragment in place.
pub fn url_with_offset(url: &str, seconds: u64) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed
                .query_pairs_mut()
                .append_pair("t", &seconds.to_string());
            parsed.into()
        }
        Err(_) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{url}{separator}t={seconds}")
        }
    }
}

#[derive(Debug, Clone)]
pub struct YouTube {
    url: String,
    start: Duration,
    resolution: Option<String>,
    warmup_url: String,
}

impl YouTube {
    pub fn new(url: &str, start: Duration, resolution: Option<&str>, warmup_url: &str) -> Self {
        Self {
            url: url.to_string(),
            start,
            resolution: resolution
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            warmup_url: warmup_url.to_string(),
        }
    }

    pub fn resolution(&self) -> Option<&str> {
        self.resolution.as_deref()
    }

    pub fn target_url(&self) -> String {
        url_with_offset(&self.url, self.start.as_secs())
    }

    fn resolution_script(&self, resolution: &str) -> UseCaseResult<Vec<Interaction>> {
        let label = resolution.trim_end_matches('p');
        let pattern = Regex::new(&format!(r"^{}p(\d+)?\b", regex::escape(label)))
            .map_err(|err| UseCaseError::InvalidParameter(format!("resolution '{resolution}': {err}")))?;
        let quality = Regex::new(r"^Quality").map_err(|err| {
            UseCaseError::InvalidParameter(format!("quality label: {err}"))
        })?;
        let advanced = Regex::new(r"^Advanced").map_err(|err| {
            UseCaseError::InvalidParameter(format!("advanced label: {err}"))
        })?;
        Ok(vec![
            Interaction::tap_id(PLAYER_ID),
            Interaction::tap_id(OVERFLOW_ID),
            Interaction::tap_pattern(quality),
            Interaction::tap_pattern(advanced),
            Interaction::tap_pattern(pattern),
        ])
    }

    pub(super) async fn prepare(
        &self,
        device: &dyn MobileDevice,
        runner: &InteractionRunner,
    ) -> UseCaseResult<()> {
        device.force_stop(PACKAGE).await?;
        device.clear_app(PACKAGE).await?;
        device.open_url(&self.warmup_url, Some(PACKAGE)).await?;
        runner
            .run(
                device,
                &[
                    Interaction::tap_id(PLAYER_ID).after(WARMUP_LOAD),
                    Interaction::tap_id(FULLSCREEN_ID),
                ],
            )
            .await?;
        device.input_keyevent(keycode::MEDIA_PLAY_PAUSE).await?;
        device.set_media_volume(MEDIA_VOLUME).await?;
        if let Some(resolution) = &self.resolution {
            info!(resolution = %resolution, "selecting fixed resolution");
            runner
                .run(device, &self.resolution_script(resolution)?)
                .await?;
        }
        sleep(SETTLE).await;
        Ok(())
    }

    pub(super) async fn execute(
        &self,
        device: &dyn MobileDevice,
        runner: &InteractionRunner,
        duration: Duration,
    ) -> UseCaseResult<()> {
        let deadline = Instant::now() + duration;
        let target = self.target_url();
        debug!(url = %target, "opening video");
        device.open_url(&target, Some(PACKAGE)).await?;
        if self.resolution.is_some() && duration > LABEL_LEAD {
            sleep_until(deadline - LABEL_LEAD).await;
            device.input_keyevent(keycode::MEDIA_PLAY_PAUSE).await?;
            runner
                .run(
                    device,
                    &[
                        Interaction::tap_id(PLAYER_ID).within(LABEL_LEAD),
                        Interaction::tap_id(OVERFLOW_ID).within(LABEL_LEAD),
                    ],
                )
                .await?;
        }
        sleep_until(deadline).await;
        Ok(())
    }
}
