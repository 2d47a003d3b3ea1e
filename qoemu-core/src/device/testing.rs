//! Tool runner that stands in for adb and the device managers in tests.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::QoemuSection;
use crate::device::Adb;
use crate::tools::{CommandRunner, ProcessHandle, ProcessOutput, ToolGateway};

type Hook = Box<dyn Fn(&[String]) + Send + Sync>;

/// Journals `program args...` for every call and answers the boot and
/// address queries of a healthy device. Spawned processes show up as
/// `spawn program args...`, their shutdown as `stop program`.
#[derive(Default)]
pub(super) struct DeviceRig {
    journal: Arc<Mutex<Vec<String>>>,
    hook: Option<Hook>,
}

impl DeviceRig {
    /// Runs `hook` with the arguments of every completed call.
    pub(super) fn with_hook(hook: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        Self {
            journal: Arc::default(),
            hook: Some(Box::new(hook)),
        }
    }

    pub(super) fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub(super) fn lines_starting(&self, prefix: &str) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter(|line| line.starts_with(prefix))
            .collect()
    }

    pub(super) fn position(&self, line: &str) -> usize {
        self.journal()
            .iter()
            .position(|sent| sent == line)
            .unwrap_or_else(|| panic!("'{line}' not in {:?}", self.journal()))
    }
}

fn line(program: &Path, args: &[String]) -> String {
    let mut parts = vec![program.to_string_lossy().to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

struct RigProcess {
    program: String,
    journal: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ProcessHandle for RigProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn stop(&mut self) -> std::io::Result<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("stop {}", self.program));
        Ok(())
    }
}

pub(super) struct RigRunner(pub(super) Arc<DeviceRig>);

#[async_trait]
impl CommandRunner for RigRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        _limit: Duration,
    ) -> std::io::Result<ProcessOutput> {
        let sent = line(program, args);
        self.0.journal.lock().unwrap().push(sent.clone());
        if let Some(hook) = &self.0.hook {
            hook(args);
        }
        let stdout = if sent.ends_with("getprop sys.boot_completed") {
            "1\n".to_string()
        } else if sent.ends_with("ip -f inet addr show wlan0") {
            "    inet 10.0.2.16/24 brd 10.0.2.255 scope global wlan0\n".to_string()
        } else {
            String::new()
        };
        Ok(ProcessOutput {
            code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }

    async fn spawn(
        &self,
        program: &Path,
        args: &[String],
    ) -> std::io::Result<Box<dyn ProcessHandle>> {
        self.0
            .journal
            .lock()
            .unwrap()
            .push(format!("spawn {}", line(program, args)));
        Ok(Box::new(RigProcess {
            program: program.to_string_lossy().to_string(),
            journal: self.0.journal.clone(),
        }))
    }
}

/// Gateway and adb wired to `rig`.
pub(super) fn wire(rig: &Arc<DeviceRig>, settings: &QoemuSection) -> (Adb, Arc<ToolGateway>) {
    let gateway = Arc::new(ToolGateway::with_runner(Arc::new(RigRunner(rig.clone()))));
    let adb = Adb::new(gateway.clone(), settings.adb_device_serial.clone());
    (adb, gateway)
}
