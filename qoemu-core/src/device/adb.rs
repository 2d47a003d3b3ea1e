use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::debug;

use super::{DeviceError, DeviceResult};
use crate::tools::{argv, ToolGateway, ToolKind};

const BOOT_POLL: Duration = Duration::from_secs(2);

/// Device bridge bound to one serial (or the only attached device).
#[derive(Debug, Clone)]
pub struct Adb {
    gateway: Arc<ToolGateway>,
    serial: Option<String>,
}

impl Adb {
    pub fn new(gateway: Arc<ToolGateway>, serial: Option<String>) -> Self {
        Self { gateway, serial }
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn command(&self, args: &[String]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = &self.serial {
            full.push("-s".to_string());
            full.push(serial.clone());
        }
        full.extend(args.iter().cloned());
        full
    }

    pub async fn run(&self, args: &[String]) -> DeviceResult<String> {
        let output = self.gateway.run(ToolKind::Adb, &self.command(args)).await?;
        Ok(output.stdout)
    }

    pub async fn shell(&self, command: &[String]) -> DeviceResult<String> {
        let mut args = vec!["shell".to_string()];
        args.extend(command.iter().cloned());
        self.run(&args).await
    }

    pub async fn wait_for_device(&self, limit: Duration) -> DeviceResult<()> {
        self.gateway
            .run_with_timeout(ToolKind::Adb, &self.command(&argv(["wait-for-device"])), limit)
            .await
            .map(|_| ())
            .map_err(|err| match err {
                crate::tools::ToolError::Timeout { after, .. } => {
                    DeviceError::LaunchTimeout { after }
                }
                other => other.into(),
            })
    }

    /// Polls `sys.boot_completed` until the system reports a finished boot.
    pub async fn wait_for_boot(&self, limit: Duration) -> DeviceResult<()> {
        let deadline = Instant::now() + limit;
        loop {
            match self
                .shell(&argv(["getprop", "sys.boot_completed"]))
                .await
            {
                Ok(value) if value.trim() == "1" => return Ok(()),
                Ok(_) => debug!("boot not completed yet"),
                Err(err) => debug!(error = %err, "boot state unavailable"),
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::LaunchTimeout { after: limit });
            }
            sleep(BOOT_POLL).await;
        }
    }

    pub async fn emu_kill(&self) -> DeviceResult<()> {
        self.run(&argv(["emu", "kill"])).await.map(|_| ())
    }
}

/// Extracts the IPv4 address from `ip -f inet addr show` output.
pub fn parse_inet_address(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("inet ")?;
        let address = rest.split_whitespace().next()?;
        address.split('/').next()?.parse().ok()
    })
}

/// Escapes text for `input text`, which treats `%s` as a space.
pub fn escape_input_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            ' ' => escaped.push_str("%s"),
            '\'' | '"' | '&' | '(' | ')' | ';' | '<' | '>' | '|' | '*' | '\\' | '$' | '`' | '?'
            | '~' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wlan_address() {
        let output = "3: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n    inet 192.168.1.42/24 brd 192.168.1.255 scope global wlan0\n       valid_lft forever preferred_lft forever\n";
        assert_eq!(
            parse_inet_address(output),
            Some(Ipv4Addr::new(192, 168, 1, 42))
        );
        assert_eq!(parse_inet_address("Device \"wlan0\" does not exist."), None);
        assert_eq!(parse_inet_address(""), None);
    }

    #[test]
    fn escapes_shell_sensitive_text() {
        assert_eq!(escape_input_text("a b"), "a%sb");
        assert_eq!(escape_input_text("x&y"), "x\\&y");
        assert_eq!(escape_input_text("https://example.org/?q=1"), "https://example.org/\\?q=1");
    }
}
