//! Shaping of one physical interface through `tc netem`.
//!
//! `tc` only shapes egress queues, so inbound traffic of the physical
//! interface is redirected packet for packet onto an `ifb` mirror whose own
//! egress discipline then represents the downstream direction.
//!
//! Both roots carry the same layout: a three band `prio` qdisc whose third
//! band holds the `netem` discipline. Excluded ports are steered into the
//! first band and bypass shaping entirely.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::NetemSection;
use crate::tools::{argv, ToolError, ToolGateway, ToolKind};

pub const MAX_VIRTUAL_DEVICES: usize = 3;

const MIRROR_PREFIX: &str = "ifb";
const ROOT_HANDLE: &str = "1:";
const SHAPED_BAND: &str = "1:3";
const BYPASS_BAND: &str = "1:1";
const NETEM_HANDLE: &str = "30:";
const INGRESS_HANDLE: &str = "ffff:";
const NETEM_QUEUE_LIMIT: &str = "100000";

const ALREADY_GONE_MARKERS: [&str; 4] = [
    "No such file or directory",
    "Cannot find specified qdisc",
    "Cannot delete qdisc with handle of zero",
    "Invalid handle",
];

pub type ShapingResult<T> = Result<T, ShapingError>;

#[derive(Debug, Error)]
pub enum ShapingError {
    #[error("interface {iface} is already shaped by another connection")]
    DeviceBusy { iface: String },
    #[error("interface {iface} does not exist")]
    DeviceMissing { iface: String },
    #[error("all {max} virtual mirror devices are in use")]
    NoVirtualAvailable { max: usize },
    #[error("insufficient privileges for traffic control: {detail}")]
    PrivilegeDenied { detail: String },
    #[error("shaping parameters incomplete: {0}")]
    Incomplete(String),
    #[error("connection {0} is already closed")]
    Closed(String),
    #[error(transparent)]
    Tool(#[from] ToolError),
}

/// Effective shaping parameters after bias compensation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapingProfile {
    pub t_init: u64,
    /// kbit/s
    pub rul: f64,
    /// kbit/s
    pub rdl: f64,
    /// ms
    pub dul: f64,
    /// ms
    pub ddl: f64,
}

impl ShapingProfile {
    fn check(&self) -> ShapingResult<()> {
        for (name, rate) in [("rul", self.rul), ("rdl", self.rdl)] {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(ShapingError::Incomplete(format!("{name} is unset")));
            }
        }
        for (name, delay) in [("dul", self.dul), ("ddl", self.ddl)] {
            if !(delay.is_finite() && delay >= 0.0) {
                return Err(ShapingError::Incomplete(format!("{name} is unset")));
            }
        }
        Ok(())
    }
}

/// Process-wide bookkeeping of shaped interfaces and mirror slots.
#[derive(Debug)]
pub struct ShapingRegistry {
    state: Mutex<RegistryState>,
    module: OnceCell<()>,
}

#[derive(Debug)]
struct RegistryState {
    used: HashSet<String>,
    slots: Vec<Option<String>>,
}

impl ShapingRegistry {
    pub fn new(pool_size: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                used: HashSet::new(),
                slots: vec![None; pool_size],
            }),
            module: OnceCell::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pool_size(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn in_use(&self, iface: &str) -> bool {
        self.lock().used.contains(iface)
    }

    pub fn free_slots(&self) -> usize {
        self.lock().slots.iter().filter(|slot| slot.is_none()).count()
    }

    fn acquire(&self, iface: &str) -> ShapingResult<usize> {
        let mut state = self.lock();
        if state.used.contains(iface) {
            return Err(ShapingError::DeviceBusy {
                iface: iface.to_string(),
            });
        }
        let max = state.slots.len();
        let slot = state
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ShapingError::NoVirtualAvailable { max })?;
        state.slots[slot] = Some(iface.to_string());
        state.used.insert(iface.to_string());
        Ok(slot)
    }

    fn release(&self, iface: &str, slot: usize) {
        let mut state = self.lock();
        if state.slots.get(slot).and_then(Option::as_deref) == Some(iface) {
            state.slots[slot] = None;
        }
        state.used.remove(iface);
    }
}

impl Default for ShapingRegistry {
    fn default() -> Self {
        Self::new(MAX_VIRTUAL_DEVICES)
    }
}

#[derive(Clone)]
pub struct ShapingController {
    gateway: Arc<ToolGateway>,
    registry: Arc<ShapingRegistry>,
    excluded_ports: Vec<u16>,
    sanity_check: bool,
}

impl fmt::Debug for ShapingController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapingController")
            .field("registry", &self.registry)
            .field("excluded_ports", &self.excluded_ports)
            .field("sanity_check", &self.sanity_check)
            .finish()
    }
}

impl ShapingController {
    pub fn new(
        gateway: Arc<ToolGateway>,
        registry: Arc<ShapingRegistry>,
        netem: &NetemSection,
    ) -> Self {
        Self {
            gateway,
            registry,
            excluded_ports: netem.excluded_ports.clone(),
            sanity_check: netem.net_em_sanity_check,
        }
    }

    pub fn registry(&self) -> &Arc<ShapingRegistry> {
        &self.registry
    }

    async fn ensure_module(&self) -> ShapingResult<()> {
        let pool_size = self.registry.pool_size();
        self.registry
            .module
            .get_or_try_init(|| async {
                info!(pool_size, "loading ifb module");
                self.gateway
                    .run(
                        ToolKind::Modprobe,
                        &argv(["ifb".to_string(), format!("numifbs={pool_size}")]),
                    )
                    .await
                    .map(|_| ())
                    .map_err(|err| classify(err, "ifb"))
            })
            .await
            .map(|_| ())
    }

    /// Removes the mirror module loaded by the first `open`.
    pub async fn cleanup_module(&self) -> ShapingResult<()> {
        info!("unloading ifb module");
        self.gateway
            .run(ToolKind::Modprobe, &argv(["-r", "ifb"]))
            .await
            .map(|_| ())
            .map_err(|err| classify(err, "ifb"))
    }

    /// Removes disciplines an interrupted run left on `iface`, then the mirror module.
    pub async fn purge(&self, iface: &str) -> ShapingResult<()> {
        for kind in ["root", "ingress"] {
            match self
                .gateway
                .run(ToolKind::Tc, &argv(["qdisc", "del", "dev", iface, kind]))
                .await
            {
                Ok(_) => info!(iface, kind, "removed leftover discipline"),
                Err(err) if already_gone(&err) => {}
                Err(err) => return Err(classify(err, iface)),
            }
        }
        self.cleanup_module().await
    }

    /// Acquires a mirror and installs empty disciplines on both directions of `iface`.
    ///
    /// On failure everything installed so far is removed again before the
    /// error is returned.
    pub async fn open(&self, name: &str, iface: &str) -> ShapingResult<Connection> {
        self.ensure_module().await?;
        let slot = self.registry.acquire(iface)?;
        let mut connection = Connection {
            name: name.to_string(),
            iface: iface.to_string(),
            mirror: format!("{MIRROR_PREFIX}{slot}"),
            slot,
            gateway: Arc::clone(&self.gateway),
            registry: Arc::clone(&self.registry),
            excluded_ports: self.excluded_ports.clone(),
            sanity_check: self.sanity_check,
            installed: Installed::default(),
            profile: None,
            applied: None,
            closed: false,
        };
        if let Err(err) = connection.install().await {
            warn!(connection = %connection.name, iface, error = %err, "open failed, removing partial shaping");
            connection.close().await;
            return Err(err);
        }
        info!(connection = %connection.name, iface, mirror = %connection.mirror, "shaping path opened");
        Ok(connection)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Installed {
    mirror_up: bool,
    ingress: bool,
    root: bool,
    mirror_root: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Applied {
    Empty,
    Shaped(ShapingProfile),
}

/// One shaped network path: physical interface plus its `ifb` mirror.
pub struct Connection {
    name: String,
    iface: String,
    mirror: String,
    slot: usize,
    gateway: Arc<ToolGateway>,
    registry: Arc<ShapingRegistry>,
    excluded_ports: Vec<u16>,
    sanity_check: bool,
    installed: Installed,
    profile: Option<ShapingProfile>,
    applied: Option<Applied>,
    closed: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("iface", &self.iface)
            .field("mirror", &self.mirror)
            .field("installed", &self.installed)
            .field("profile", &self.profile)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn mirror(&self) -> &str {
        &self.mirror
    }

    async fn tc(&self, args: Vec<String>) -> ShapingResult<()> {
        self.gateway
            .run(ToolKind::Tc, &args)
            .await
            .map(|_| ())
            .map_err(|err| classify(err, &self.iface))
    }

    async fn ip(&self, args: Vec<String>) -> ShapingResult<()> {
        self.gateway
            .run(ToolKind::Ip, &args)
            .await
            .map(|_| ())
            .map_err(|err| classify(err, &self.iface))
    }

    async fn install(&mut self) -> ShapingResult<()> {
        self.ip(argv(["link", "show", "dev", self.iface.as_str()]))
            .await
            .map_err(|err| match err {
                ShapingError::Tool(ToolError::NonZeroExit { .. }) => ShapingError::DeviceMissing {
                    iface: self.iface.clone(),
                },
                other => other,
            })?;
        self.reset().await?;

        self.ip(argv(["link", "set", "dev", self.mirror.as_str(), "up"]))
            .await?;
        self.installed.mirror_up = true;

        self.tc(argv([
            "qdisc",
            "add",
            "dev",
            self.iface.as_str(),
            "handle",
            INGRESS_HANDLE,
            "ingress",
        ]))
        .await?;
        self.installed.ingress = true;
        self.tc(argv([
            "filter",
            "add",
            "dev",
            self.iface.as_str(),
            "parent",
            INGRESS_HANDLE,
            "protocol",
            "all",
            "u32",
            "match",
            "u32",
            "0",
            "0",
            "action",
            "mirred",
            "egress",
            "redirect",
            "dev",
            self.mirror.as_str(),
        ]))
        .await?;

        self.installed.root = true;
        self.install_root(&self.iface.clone()).await?;
        self.installed.mirror_root = true;
        self.install_root(&self.mirror.clone()).await?;
        self.applied = Some(Applied::Empty);
        Ok(())
    }

    /// Removes pre-existing root and ingress disciplines; "no such discipline" is fine.
    async fn reset(&self) -> ShapingResult<()> {
        for kind in ["root", "ingress"] {
            match self
                .tc(argv(["qdisc", "del", "dev", self.iface.as_str(), kind]))
                .await
            {
                Ok(()) => debug!(iface = %self.iface, kind, "removed stale discipline"),
                Err(ShapingError::Tool(ToolError::NonZeroExit { .. })) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn install_root(&self, dev: &str) -> ShapingResult<()> {
        self.tc(argv([
            "qdisc", "add", "dev", dev, "root", "handle", ROOT_HANDLE, "prio", "bands", "3",
        ]))
        .await?;
        self.tc(argv([
            "qdisc",
            "add",
            "dev",
            dev,
            "parent",
            SHAPED_BAND,
            "handle",
            NETEM_HANDLE,
            "netem",
        ]))
        .await?;
        for port in &self.excluded_ports {
            for direction in ["sport", "dport"] {
                self.tc(argv([
                    "filter".to_string(),
                    "add".into(),
                    "dev".into(),
                    dev.into(),
                    "parent".into(),
                    ROOT_HANDLE.into(),
                    "protocol".into(),
                    "ip".into(),
                    "prio".into(),
                    "1".into(),
                    "u32".into(),
                    "match".into(),
                    "ip".into(),
                    direction.into(),
                    port.to_string(),
                    "0xffff".into(),
                    "flowid".into(),
                    BYPASS_BAND.into(),
                ]))
                .await?;
            }
        }
        self.tc(argv([
            "filter", "add", "dev", dev, "parent", ROOT_HANDLE, "protocol", "all", "prio", "2",
            "u32", "match", "u32", "0", "0", "flowid", SHAPED_BAND,
        ]))
        .await
    }

    async fn replace_netem(&self, dev: &str, params: &[String]) -> ShapingResult<()> {
        let mut args = argv([
            "qdisc",
            "replace",
            "dev",
            dev,
            "parent",
            SHAPED_BAND,
            "handle",
            NETEM_HANDLE,
            "netem",
        ]);
        args.extend(params.iter().cloned());
        self.tc(args).await
    }

    /// Records the parameters without touching the kernel.
    pub fn set(&mut self, profile: ShapingProfile) {
        self.profile = Some(profile);
    }

    pub async fn enable(&mut self) -> ShapingResult<()> {
        if self.closed {
            return Err(ShapingError::Closed(self.name.clone()));
        }
        let profile = self
            .profile
            .ok_or_else(|| ShapingError::Incomplete("no parameters set".into()))?;
        profile.check()?;
        if self.applied == Some(Applied::Shaped(profile)) {
            debug!(connection = %self.name, "shaping already enabled with equal parameters");
            return Ok(());
        }
        let upstream = netem_params(profile.dul, profile.rul);
        let downstream = netem_params(profile.ddl, profile.rdl);
        // Unknown until both directions are written.
        self.applied = None;
        self.replace_netem(&self.iface.clone(), &upstream).await?;
        self.replace_netem(&self.mirror.clone(), &downstream).await?;
        self.applied = Some(Applied::Shaped(profile));
        info!(
            connection = %self.name,
            rul = profile.rul,
            rdl = profile.rdl,
            dul = profile.dul,
            ddl = profile.ddl,
            "shaping enabled"
        );
        if self.sanity_check {
            self.sanity_check(&profile).await;
        }
        Ok(())
    }

    /// Rewrites both disciplines to pass traffic unshaped; the mirror stays allocated.
    pub async fn disable(&mut self) -> ShapingResult<()> {
        if self.closed {
            return Err(ShapingError::Closed(self.name.clone()));
        }
        if self.applied == Some(Applied::Empty) {
            return Ok(());
        }
        let upstream = self.replace_netem(&self.iface.clone(), &[]).await;
        let downstream = self.replace_netem(&self.mirror.clone(), &[]).await;
        upstream.and(downstream)?;
        self.applied = Some(Applied::Empty);
        info!(connection = %self.name, "shaping disabled");
        Ok(())
    }

    /// Reads back the installed upstream discipline and warns when it does not match.
    pub async fn sanity_check(&self, profile: &ShapingProfile) -> bool {
        let output = match self
            .gateway
            .run(ToolKind::Tc, &argv(["qdisc", "show", "dev", self.iface.as_str()]))
            .await
        {
            Ok(output) => output.stdout,
            Err(err) => {
                warn!(iface = %self.iface, error = %err, "netem sanity check could not read qdiscs");
                return false;
            }
        };
        let expected_delay = format!("delay {}", format_delay(profile.dul));
        let healthy = output.contains("netem") && (profile.dul == 0.0 || output.contains(&expected_delay));
        if !healthy {
            warn!(iface = %self.iface, expected = %expected_delay, installed = %output.trim(), "netem sanity check failed");
        }
        healthy
    }

    /// Removes everything that was installed and releases the mirror slot.
    ///
    /// Every step runs even if an earlier one fails; failures are logged.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        let iface = self.iface.clone();
        let mirror = self.mirror.clone();
        if self.installed.root {
            self.remove(argv(["qdisc", "del", "dev", iface.as_str(), "root"]))
                .await;
        }
        if self.installed.ingress {
            self.remove(argv(["qdisc", "del", "dev", iface.as_str(), "ingress"]))
                .await;
        }
        if self.installed.mirror_root {
            self.remove(argv(["qdisc", "del", "dev", mirror.as_str(), "root"]))
                .await;
        }
        if self.installed.mirror_up {
            if let Err(err) = self
                .ip(argv(["link", "set", "dev", mirror.as_str(), "down"]))
                .await
            {
                warn!(mirror = %mirror, error = %err, "failed to bring mirror down");
            }
        }
        self.installed = Installed::default();
        self.applied = None;
        self.registry.release(&iface, self.slot);
        self.closed = true;
        info!(connection = %self.name, iface = %iface, "shaping path closed");
    }

    async fn remove(&self, args: Vec<String>) {
        match self.tc(args.clone()).await {
            Ok(()) => {}
            Err(ShapingError::Tool(err)) if already_gone(&err) => {}
            Err(err) => warn!(command = %args.join(" "), error = %err, "failed to remove discipline"),
        }
    }
}

fn netem_params(delay_ms: f64, rate_kbit: f64) -> Vec<String> {
    vec![
        "delay".into(),
        format_delay(delay_ms),
        "rate".into(),
        format_rate(rate_kbit),
        "limit".into(),
        NETEM_QUEUE_LIMIT.into(),
    ]
}

fn format_delay(ms: f64) -> String {
    if ms.fract() == 0.0 {
        format!("{}ms", ms as u64)
    } else {
        format!("{}us", (ms * 1000.0).round() as u64)
    }
}

fn format_rate(kbit: f64) -> String {
    if kbit.fract() == 0.0 {
        format!("{}kbit", kbit as u64)
    } else {
        format!("{}bit", (kbit * 1000.0).round() as u64)
    }
}

fn already_gone(err: &ToolError) -> bool {
    err.stderr()
        .is_some_and(|stderr| ALREADY_GONE_MARKERS.iter().any(|marker| stderr.contains(marker)))
}

fn classify(err: ToolError, iface: &str) -> ShapingError {
    if err.is_permission_denied() {
        return ShapingError::PrivilegeDenied {
            detail: err.to_string(),
        };
    }
    let missing = err.stderr().is_some_and(|stderr| {
        stderr.contains("Cannot find device") || stderr.contains("does not exist")
    });
    if missing {
        return ShapingError::DeviceMissing {
            iface: iface.to_string(),
        };
    }
    ShapingError::Tool(err)
}
