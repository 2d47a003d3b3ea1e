//! Declarative UI interaction records and the interpreter that plays them back.

use std::fmt;
use std::time::Duration;

use regex::Regex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::{UseCaseError, UseCaseResult};
use crate::device::{MobileDevice, UiNode};

pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub enum TextMatch {
    Exact(String),
    Pattern(Regex),
}

impl TextMatch {
    fn matches(&self, value: &str) -> bool {
        match self {
            TextMatch::Exact(expected) => value == expected,
            TextMatch::Pattern(regex) => regex.is_match(value),
        }
    }
}

impl fmt::Display for TextMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextMatch::Exact(text) => write!(f, "text '{text}'"),
            TextMatch::Pattern(regex) => write!(f, "text /{}/", regex.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Swipe {
    pub from: (i32, i32),
    pub to: (i32, i32),
    pub millis: u64,
}

/// One step of a UI script. Every part is optional; present parts run in field order.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub delay: Option<Duration>,
    pub delay_until_gone: Option<String>,
    pub trigger_id: Option<String>,
    pub trigger_text: Option<TextMatch>,
    pub input_text: Option<String>,
    pub keycode: Option<u32>,
    pub swipe: Option<Swipe>,
    pub max_wait: Duration,
    pub touch: bool,
}

impl Default for Interaction {
    fn default() -> Self {
        Self {
            delay: None,
            delay_until_gone: None,
            trigger_id: None,
            trigger_text: None,
            input_text: None,
            keycode: None,
            swipe: None,
            max_wait: DEFAULT_MAX_WAIT,
            touch: true,
        }
    }
}

impl Interaction {
    pub fn wait(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn tap_id(id: impl Into<String>) -> Self {
        Self {
            trigger_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn tap_text(text: impl Into<String>) -> Self {
        Self {
            trigger_text: Some(TextMatch::Exact(text.into())),
            ..Self::default()
        }
    }

    pub fn tap_pattern(pattern: Regex) -> Self {
        Self {
            trigger_text: Some(TextMatch::Pattern(pattern)),
            ..Self::default()
        }
    }

    pub fn key(code: u32) -> Self {
        Self {
            keycode: Some(code),
            ..Self::default()
        }
    }

    pub fn type_text(text: impl Into<String>) -> Self {
        Self {
            input_text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn swipe(swipe: Swipe) -> Self {
        Self {
            swipe: Some(swipe),
            ..Self::default()
        }
    }

    pub fn until_gone(id: impl Into<String>) -> Self {
        Self {
            delay_until_gone: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn within(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn then_type(mut self, text: impl Into<String>) -> Self {
        self.input_text = Some(text.into());
        self
    }

    pub fn then_key(mut self, code: u32) -> Self {
        self.keycode = Some(code);
        self
    }

    /// Waits for the trigger without touching it.
    pub fn observe_only(mut self) -> Self {
        self.touch = false;
        self
    }

    fn has_trigger(&self) -> bool {
        self.trigger_id.is_some() || self.trigger_text.is_some()
    }

    fn matches(&self, node: &UiNode) -> bool {
        let id_ok = self.trigger_id.as_deref().map_or(true, |id| node.has_id(id));
        let text_ok = self.trigger_text.as_ref().map_or(true, |matcher| {
            matcher.matches(&node.text) || matcher.matches(&node.content_desc)
        });
        id_ok && text_ok
    }

    fn describe(&self) -> String {
        match (&self.trigger_id, &self.trigger_text) {
            (Some(id), Some(text)) => format!("id '{id}' with {text}"),
            (Some(id), None) => format!("id '{id}'"),
            (None, Some(text)) => text.to_string(),
            (None, None) => "<no trigger>".into(),
        }
    }
}

/// Plays interaction scripts against a device, polling its UI tree.
#[derive(Debug, Clone, Copy)]
pub struct InteractionRunner {
    poll: Duration,
}

impl Default for InteractionRunner {
    fn default() -> Self {
        Self { poll: DEFAULT_POLL }
    }
}

impl InteractionRunner {
    pub fn new(poll: Duration) -> Self {
        Self { poll }
    }

    pub async fn run(
        &self,
        device: &dyn MobileDevice,
        script: &[Interaction],
    ) -> UseCaseResult<()> {
        for step in script {
            self.step(device, step).await?;
        }
        Ok(())
    }

    async fn step(&self, device: &dyn MobileDevice, step: &Interaction) -> UseCaseResult<()> {
        if let Some(delay) = step.delay {
            sleep(delay).await;
        }
        if let Some(id) = &step.delay_until_gone {
            self.wait_until_gone(device, id, step.max_wait).await?;
        }
        if step.has_trigger() {
            let node = self.find(device, step).await?;
            if step.touch {
                let (x, y) = node.bounds.center();
                debug!(element = %step.describe(), x, y, "touching element");
                device.tap(x, y).await?;
            }
        }
        if let Some(text) = &step.input_text {
            device.input_text(text).await?;
        }
        if let Some(code) = step.keycode {
            device.input_keyevent(code).await?;
        }
        if let Some(swipe) = step.swipe {
            device.swipe(swipe.from, swipe.to, swipe.millis).await?;
        }
        Ok(())
    }

    async fn find(&self, device: &dyn MobileDevice, step: &Interaction) -> UseCaseResult<UiNode> {
        let deadline = Instant::now() + step.max_wait;
        loop {
            let nodes = device.dump_ui().await?;
            if let Some(node) = nodes.into_iter().find(|node| step.matches(node)) {
                return Ok(node);
            }
            if Instant::now() >= deadline {
                return Err(UseCaseError::UiElementNotFound {
                    element: step.describe(),
                });
            }
            sleep(self.poll).await;
        }
    }

    async fn wait_until_gone(
        &self,
        device: &dyn MobileDevice,
        id: &str,
        max_wait: Duration,
    ) -> UseCaseResult<()> {
        let deadline = Instant::now() + max_wait;
        loop {
            let nodes = device.dump_ui().await?;
            if !nodes.iter().any(|node| node.has_id(id)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(UseCaseError::UiElementNotFound {
                    element: format!("disappearance of id '{id}'"),
                });
            }
            sleep(self.poll).await;
        }
    }
}
