//! Scripted device interactions recorded as stimuli.
//!
//! Every use case walks `Created -> Prepared -> Executed -> Shutdown`. Any
//! other transition is refused with [`UseCaseError::BadState`].

mod app_launch;
pub mod interaction;
#[cfg(test)]
mod testing;
mod ui_tracing;
mod web;
mod youtube;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::device::{DeviceError, MobileDevice, Orientation};
use crate::params::{StimulusKey, StimulusParameters};

pub use app_launch::{app_label, AppLaunch};
pub use interaction::{Interaction, InteractionRunner, Swipe, TextMatch};
pub use ui_tracing::UiTracing;
pub use web::WebBrowsing;
pub use youtube::{url_with_offset, YouTube};

pub type UseCaseResult<T> = Result<T, UseCaseError>;

#[derive(Debug, Error)]
pub enum UseCaseError {
    #[error("use case cannot move from {from} to {to}")]
    BadState {
        from: UseCaseState,
        to: UseCaseState,
    },
    #[error("ui element not found: {element}")]
    UiElementNotFound { element: String },
    #[error("invalid use case parameter: {0}")]
    InvalidParameter(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseCaseState {
    Created,
    Prepared,
    Executed,
    Shutdown,
}

impl UseCaseState {
    pub fn can_transition(self, to: UseCaseState) -> bool {
        matches!(
            (self, to),
            (UseCaseState::Created, UseCaseState::Prepared)
                | (UseCaseState::Prepared, UseCaseState::Executed)
                | (UseCaseState::Executed, UseCaseState::Shutdown)
        )
    }
}

impl fmt::Display for UseCaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UseCaseState::Created => "created",
            UseCaseState::Prepared => "prepared",
            UseCaseState::Executed => "executed",
            UseCaseState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Stimulus type identifier as used in parameter keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseCaseType {
    YouTube,
    WebBrowsing,
    AppLaunch,
    UiTracing,
}

impl UseCaseType {
    pub fn id(self) -> &'static str {
        match self {
            UseCaseType::YouTube => "VS",
            UseCaseType::WebBrowsing => "WB",
            UseCaseType::AppLaunch => "AL",
            UseCaseType::UiTracing => "UT",
        }
    }
}

impl FromStr for UseCaseType {
    type Err = UseCaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "VS" => Ok(UseCaseType::YouTube),
            "WB" => Ok(UseCaseType::WebBrowsing),
            "AL" => Ok(UseCaseType::AppLaunch),
            "UT" => Ok(UseCaseType::UiTracing),
            other => Err(UseCaseError::InvalidParameter(format!(
                "unknown stimulus type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum UseCaseKind {
    YouTube(YouTube),
    WebBrowsing(WebBrowsing),
    AppLaunch(AppLaunch),
    UiTracing(UiTracing),
}

/// Inputs for [`UseCase::build`].
#[derive(Debug, Clone, Copy)]
pub struct UseCaseSpec<'a> {
    pub use_case: UseCaseType,
    pub link: &'a str,
    pub start: Duration,
    pub resolution: Option<&'a str>,
    pub warmup_url: &'a str,
}

/// Fixed wall clock set on the device so captured status bars match across sessions.
pub(crate) fn fixed_clock() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_609_502_400, 0).unwrap_or_default()
}

#[derive(Debug)]
pub struct UseCase {
    kind: UseCaseKind,
    state: UseCaseState,
    runner: InteractionRunner,
}

impl UseCase {
    pub fn new(kind: UseCaseKind) -> Self {
        Self {
            kind,
            state: UseCaseState::Created,
            runner: InteractionRunner::default(),
        }
    }

    pub fn build(spec: UseCaseSpec<'_>) -> UseCaseResult<Self> {
        if spec.link.trim().is_empty() && spec.use_case != UseCaseType::UiTracing {
            return Err(UseCaseError::InvalidParameter("link is empty".into()));
        }
        let kind = match spec.use_case {
            UseCaseType::YouTube => UseCaseKind::YouTube(YouTube::new(
                spec.link,
                spec.start,
                spec.resolution,
                spec.warmup_url,
            )),
            UseCaseType::WebBrowsing => UseCaseKind::WebBrowsing(WebBrowsing::new(spec.link)),
            UseCaseType::AppLaunch => UseCaseKind::AppLaunch(AppLaunch::from_link(spec.link)?),
            UseCaseType::UiTracing => UseCaseKind::UiTracing(UiTracing::default()),
        };
        Ok(Self::new(kind))
    }

    pub fn with_runner(mut self, runner: InteractionRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn kind(&self) -> &UseCaseKind {
        &self.kind
    }

    pub fn state(&self) -> UseCaseState {
        self.state
    }

    pub fn orientation(&self) -> Orientation {
        match self.kind {
            UseCaseKind::YouTube(_) => Orientation::Landscape,
            _ => Orientation::Portrait,
        }
    }

    pub fn needs_playstore(&self) -> bool {
        matches!(self.kind, UseCaseKind::AppLaunch(_))
    }

    fn enter(&mut self, to: UseCaseState) -> UseCaseResult<()> {
        if !self.state.can_transition(to) {
            return Err(UseCaseError::BadState {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub async fn prepare(&mut self, device: &dyn MobileDevice) -> UseCaseResult<()> {
        self.enter(UseCaseState::Prepared)?;
        info!(state = %self.state, "preparing use case");
        let runner = self.runner;
        match &self.kind {
            UseCaseKind::YouTube(youtube) => youtube.prepare(device, &runner).await,
            UseCaseKind::WebBrowsing(web) => web.prepare(device, &runner).await,
            UseCaseKind::AppLaunch(app) => app.prepare(device, &runner).await,
            UseCaseKind::UiTracing(trace) => trace.prepare(device, &runner).await,
        }
    }

    /// Waits `lead_in`, then drives the use case for `duration`.
    pub async fn execute(
        &mut self,
        device: &dyn MobileDevice,
        lead_in: Duration,
        duration: Duration,
    ) -> UseCaseResult<()> {
        self.enter(UseCaseState::Executed)?;
        sleep(lead_in).await;
        info!(duration_s = duration.as_secs_f64(), "executing use case");
        let runner = self.runner;
        match &self.kind {
            UseCaseKind::YouTube(youtube) => youtube.execute(device, &runner, duration).await,
            UseCaseKind::WebBrowsing(web) => web.execute(device, &runner, duration).await,
            UseCaseKind::AppLaunch(app) => app.execute(device, &runner, duration).await,
            UseCaseKind::UiTracing(trace) => trace.execute(device, &runner, duration).await,
        }
    }

    pub async fn shutdown(&mut self, device: &dyn MobileDevice) -> UseCaseResult<()> {
        self.enter(UseCaseState::Shutdown)?;
        self.restore(device).await
    }

    /// Teardown after a fault: valid from every state but `Shutdown`.
    ///
    /// Automatic time is restored even when `prepare` never completed.
    pub async fn abort(&mut self, device: &dyn MobileDevice) -> UseCaseResult<()> {
        if self.state == UseCaseState::Shutdown {
            return Ok(());
        }
        if self.state == UseCaseState::Executed {
            return self.shutdown(device).await;
        }
        warn!(state = %self.state, "aborting use case");
        self.state = UseCaseState::Shutdown;
        self.restore(device).await
    }

    async fn restore(&self, device: &dyn MobileDevice) -> UseCaseResult<()> {
        if let Some(package) = self.package() {
            if let Err(err) = device.force_stop(package).await {
                warn!(package, error = %err, "failed to stop app during shutdown");
            }
        }
        device.set_auto_time(true).await?;
        info!("use case shut down");
        Ok(())
    }

    fn package(&self) -> Option<&str> {
        match &self.kind {
            UseCaseKind::YouTube(_) => Some(youtube::PACKAGE),
            UseCaseKind::WebBrowsing(_) => Some(web::PACKAGE),
            UseCaseKind::AppLaunch(app) => Some(app.package()),
            UseCaseKind::UiTracing(_) => None,
        }
    }
}

/// Builds the use case for one parameter record.
pub trait UseCaseFactory: Send + Sync {
    fn build(&self, key: &StimulusKey, params: &StimulusParameters) -> UseCaseResult<UseCase>;
}

#[derive(Debug, Clone)]
pub struct StandardUseCases {
    pub warmup_url: String,
    pub resolution_override: Option<String>,
}

impl UseCaseFactory for StandardUseCases {
    fn build(&self, key: &StimulusKey, params: &StimulusParameters) -> UseCaseResult<UseCase> {
        let resolution = self
            .resolution_override
            .as_deref()
            .or(params.resolution.as_deref());
        UseCase::build(UseCaseSpec {
            use_case: key.type_id.parse()?,
            link: &params.link,
            start: params.start,
            resolution,
            warmup_url: &self.warmup_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceResult, DeviceVariant};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Silent {
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MobileDevice for Silent {
        fn variant(&self) -> DeviceVariant {
            DeviceVariant::RealDevice
        }

        fn window_title(&self) -> String {
            String::new()
        }

        async fn launch(&self, _: Orientation, _: bool) -> DeviceResult<()> {
            Ok(())
        }

        async fn shutdown(&self) -> DeviceResult<()> {
            Ok(())
        }

        async fn shell(&self, command: &[String]) -> DeviceResult<String> {
            self.commands.lock().unwrap().push(command.join(" "));
            Ok(String::new())
        }
    }

    fn tracing_case() -> UseCase {
        UseCase::new(UseCaseKind::UiTracing(UiTracing::default()))
    }

    #[test]
    fn only_forward_transitions_are_allowed() {
        use UseCaseState::*;
        let all = [Created, Prepared, Executed, Shutdown];
        for from in all {
            for to in all {
                let allowed = matches!(
                    (from, to),
                    (Created, Prepared) | (Prepared, Executed) | (Executed, Shutdown)
                );
                assert_eq!(from.can_transition(to), allowed, "{from} -> {to}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_rejects_out_of_order_calls() {
        let device = Silent::default();
        let mut use_case = tracing_case();
        assert!(matches!(
            use_case.execute(&device, Duration::ZERO, Duration::ZERO).await,
            Err(UseCaseError::BadState {
                from: UseCaseState::Created,
                to: UseCaseState::Executed
            })
        ));
        use_case.prepare(&device).await.unwrap();
        assert!(matches!(
            use_case.prepare(&device).await,
            Err(UseCaseError::BadState { .. })
        ));
        use_case
            .execute(&device, Duration::from_secs(1), Duration::from_secs(3))
            .await
            .unwrap();
        use_case.shutdown(&device).await.unwrap();
        assert_eq!(use_case.state(), UseCaseState::Shutdown);
        assert!(matches!(
            use_case.shutdown(&device).await,
            Err(UseCaseError::BadState { .. })
        ));
        assert!(matches!(
            use_case.prepare(&device).await,
            Err(UseCaseError::BadState { .. })
        ));
    }

    #[tokio::test]
    async fn abort_restores_time_from_any_state() {
        let device = Silent::default();
        let mut use_case = tracing_case();
        use_case.abort(&device).await.unwrap();
        assert_eq!(use_case.state(), UseCaseState::Shutdown);
        use_case.abort(&device).await.unwrap();
        let commands = device.commands.lock().unwrap();
        assert_eq!(
            commands
                .iter()
                .filter(|line| *line == "settings put global auto_time 1")
                .count(),
            1
        );
    }

    #[test]
    fn factory_maps_type_ids() {
        let factory = StandardUseCases {
            warmup_url: "https://www.youtube.com/watch?v=warm".into(),
            resolution_override: Some("720p".into()),
        };
        let params = StimulusParameters {
            link: "https://www.youtube.com/watch?v=abc".into(),
            ..Default::default()
        };
        let use_case = factory
            .build(&StimulusKey::new("VS", "A", "1"), &params)
            .unwrap();
        assert_eq!(use_case.orientation(), Orientation::Landscape);
        assert!(!use_case.needs_playstore());
        match use_case.kind() {
            UseCaseKind::YouTube(youtube) => assert_eq!(youtube.resolution(), Some("720p")),
            other => panic!("unexpected kind {other:?}"),
        }

        let err = factory
            .build(&StimulusKey::new("XX", "A", "1"), &params)
            .unwrap_err();
        assert!(matches!(err, UseCaseError::InvalidParameter(_)));
    }
}
