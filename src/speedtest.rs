//! Running the speedtest CLI and parsing its output.
//!
//! Two CLIs are supported: Ookla's official `speedtest` and the Python
//! `speedtest-cli`. Executables are looked up in a few well-known install
//! locations and on `PATH`, then tried in order on every attempt.
//!
//! The runner never returns an error: a run where every attempt failed is a
//! [`SpeedtestOutcome`] with `success == false` and the last error message.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SpeedtestConfig;

const KNOWN_LOCATIONS: &[&str] = &[
    "/usr/bin/speedtest",
    "/usr/local/bin/speedtest",
    "/opt/homebrew/bin/speedtest",
    "/snap/bin/speedtest",
    "/usr/bin/speedtest-cli",
    "/usr/local/bin/speedtest-cli",
];

const COMMAND_NAMES: &[&str] = &["speedtest", "speedtest-cli"];

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes per second in one megabit per second.
const BYTES_PER_MBIT: f64 = 125_000.0;

/// Result of one speedtest run on this host.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedtestOutcome {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub server_name: String,
    pub server_location: String,
    pub isp: String,
    pub success: bool,
    pub error_message: Option<String>,
}

impl SpeedtestOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            download_mbps: 0.0,
            upload_mbps: 0.0,
            ping_ms: 0.0,
            server_name: String::new(),
            server_location: String::new(),
            isp: String::new(),
            success: false,
            error_message: Some(message.into()),
        }
    }

    /// "name (location)", or just the name when the two are the same.
    pub fn test_server_label(&self) -> String {
        if self.server_location.is_empty() || self.server_location == self.server_name {
            self.server_name.clone()
        } else {
            format!("{} ({})", self.server_name, self.server_location)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Ookla,
    SpeedtestCli,
}

impl Flavor {
    fn of(command: &Path) -> Self {
        let is_cli = command
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains("speedtest-cli"));
        if is_cli {
            Flavor::SpeedtestCli
        } else {
            Flavor::Ookla
        }
    }
}

/// Find installed speedtest executables, known locations first.
pub fn discover_commands() -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = KNOWN_LOCATIONS
        .iter()
        .map(PathBuf::from)
        .filter(|path| path.is_file())
        .collect();

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        for name in COMMAND_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() && !found.contains(&candidate) {
                found.push(candidate);
            }
        }
    }

    found
}

/// Runs the speedtest with retries.
#[derive(Debug, Clone)]
pub struct SpeedtestRunner {
    config: SpeedtestConfig,
    commands: Vec<PathBuf>,
}

impl SpeedtestRunner {
    pub fn new(config: SpeedtestConfig) -> Self {
        let commands = discover_commands();
        info!(commands = ?commands, "Discovered speedtest commands");
        Self::with_commands(config, commands)
    }

    pub fn with_commands(config: SpeedtestConfig, commands: Vec<PathBuf>) -> Self {
        Self { config, commands }
    }

    /// Run until one command produces a parseable result.
    ///
    /// Every command is tried once per round; rounds are separated by
    /// `retry_delay` seconds.
    pub async fn run(&self) -> SpeedtestOutcome {
        if self.commands.is_empty() {
            let message =
                "No speedtest command found. Please install speedtest-cli or the official speedtest";
            warn!("{message}");
            return SpeedtestOutcome::failure(message);
        }

        let rounds = self.config.retry_count.max(1);
        let mut last_error = String::from("no attempt made");

        for round in 1..=rounds {
            for command in &self.commands {
                info!(
                    command = %command.display(),
                    round,
                    rounds,
                    "Running speedtest"
                );

                match self.attempt(command).await {
                    Ok(outcome) => {
                        info!(
                            download_mbps = outcome.download_mbps,
                            upload_mbps = outcome.upload_mbps,
                            ping_ms = outcome.ping_ms,
                            "Speedtest succeeded"
                        );
                        return outcome;
                    }
                    Err(e) => {
                        warn!(command = %command.display(), error = %e, "Speedtest attempt failed");
                        last_error = e.to_string();
                    }
                }
            }

            if round < rounds {
                debug!(delay_secs = self.config.retry_delay, "Waiting before retry");
                tokio::time::sleep(Duration::from_secs(self.config.retry_delay)).await;
            }
        }

        let message = format!("All speedtest attempts failed. Last error: {last_error}");
        warn!("{message}");
        SpeedtestOutcome::failure(message)
    }

    async fn attempt(&self, command: &Path) -> anyhow::Result<SpeedtestOutcome> {
        let flavor = Flavor::of(command);
        let mut args: Vec<String> = Vec::new();

        if let Some(server) = self.config.servers.first() {
            let flag = match flavor {
                Flavor::SpeedtestCli => "--server",
                Flavor::Ookla => "--server-id",
            };
            args.extend([flag.to_string(), server.to_string()]);
        }

        match flavor {
            Flavor::SpeedtestCli => args.push("--simple".to_string()),
            Flavor::Ookla => {
                if supports_json(command).await {
                    args.push("--format=json".to_string());
                }
            }
        }

        let timeout = Duration::from_secs(self.config.timeout);
        let output = tokio::time::timeout(
            timeout,
            Command::new(command).args(&args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| anyhow!("timed out after {}s", timeout.as_secs()))?
        .with_context(|| format!("failed to start {}", command.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("exited with {}: {}", output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_output(&stdout).ok_or_else(|| anyhow!("could not parse speedtest output"))
    }
}

/// Ookla builds from 1.1 on can print JSON.
async fn supports_json(command: &Path) -> bool {
    let version_check = Command::new(command)
        .arg("--version")
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(VERSION_CHECK_TIMEOUT, version_check).await {
        Ok(Ok(output)) => {
            let text = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            ["1.1", "1.2", "2."].iter().any(|v| text.contains(v))
        }
        _ => false,
    }
}

/// Parse any supported output format. `None` if neither speed can be found.
pub fn parse_output(output: &str) -> Option<SpeedtestOutcome> {
    if output.trim_start().starts_with('{') {
        match parse_ookla_json(output) {
            Some(outcome) => return Some(outcome),
            None => debug!("Output looked like JSON but did not match the Ookla format"),
        }
    }
    parse_text(output)
}

#[derive(Deserialize)]
struct OoklaReport {
    download: OoklaTransfer,
    upload: OoklaTransfer,
    #[serde(default)]
    ping: OoklaPing,
    #[serde(default)]
    server: OoklaServer,
    isp: Option<String>,
}

#[derive(Deserialize)]
struct OoklaTransfer {
    /// Bytes per second.
    bandwidth: f64,
}

#[derive(Default, Deserialize)]
struct OoklaPing {
    #[serde(default)]
    latency: f64,
}

#[derive(Default, Deserialize)]
struct OoklaServer {
    name: Option<String>,
    location: Option<String>,
}

fn parse_ookla_json(output: &str) -> Option<SpeedtestOutcome> {
    let report: OoklaReport = serde_json::from_str(output.trim()).ok()?;
    Some(SpeedtestOutcome {
        download_mbps: report.download.bandwidth / BYTES_PER_MBIT,
        upload_mbps: report.upload.bandwidth / BYTES_PER_MBIT,
        ping_ms: report.ping.latency,
        server_name: report.server.name.unwrap_or_else(unknown),
        server_location: report.server.location.unwrap_or_else(unknown),
        isp: report.isp.unwrap_or_else(unknown),
        success: true,
        error_message: None,
    })
}

/// Line-oriented parse of `speedtest-cli --simple` and human-readable output.
///
/// Later lines override earlier ones.
fn parse_text(output: &str) -> Option<SpeedtestOutcome> {
    let mut download = None;
    let mut upload = None;
    let mut ping = None;
    let mut server = None;
    let mut isp = None;

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(v) = value_after(line, "download:", &["mbit/s", "mbps"]) {
            download = Some(v);
        }
        if let Some(v) = value_after(line, "upload:", &["mbit/s", "mbps"]) {
            upload = Some(v);
        }
        if let Some(v) = value_after(line, "latency:", &["ms"])
            .or_else(|| value_after(line, "ping:", &["ms"]))
        {
            ping = Some(v);
        }
        if line.contains("Server:") {
            server = line.split_once(':').map(|(_, rest)| rest.trim().to_string());
        }
        if line.contains("ISP:") {
            isp = line.split_once(':').map(|(_, rest)| rest.trim().to_string());
        }
    }

    let server = server.unwrap_or_else(unknown);
    Some(SpeedtestOutcome {
        download_mbps: download?,
        upload_mbps: upload?,
        ping_ms: ping.unwrap_or(0.0),
        server_name: server.clone(),
        server_location: server,
        isp: isp.unwrap_or_else(unknown),
        success: true,
        error_message: None,
    })
}

/// Number that follows `label` (case-insensitive), if the token after it is
/// one of `units`.
fn value_after(line: &str, label: &str, units: &[&str]) -> Option<f64> {
    let lower = line.to_ascii_lowercase();
    let start = lower.find(label)? + label.len();
    let mut tokens = lower[start..].split_whitespace();
    let value = tokens.next()?.parse().ok()?;
    let unit = tokens.next()?;
    units.contains(&unit).then_some(value)
}

fn unknown() -> String {
    "Unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const OOKLA_JSON: &str = r#"{
        "type": "result",
        "ping": {"jitter": 0.5, "latency": 12.3},
        "download": {"bandwidth": 12500000, "bytes": 100000000, "elapsed": 8000},
        "upload": {"bandwidth": 6250000, "bytes": 50000000, "elapsed": 8000},
        "isp": "Test ISP",
        "server": {"id": 1234, "name": "Test Server", "location": "Moscow", "country": "Russia"}
    }"#;

    const SIMPLE: &str = "Ping: 15.2 ms\nDownload: 95.34 Mbit/s\nUpload: 40.12 Mbit/s\n";

    const OOKLA_TEXT: &str = "
   Speedtest by Ookla

      Server: Telia - Helsinki (id: 1234)
         ISP: Hetzner Online
Idle Latency:     3.02 ms   (jitter: 0.10ms, low: 2.95ms, high: 3.11ms)
    Download:   933.42 Mbps (data used: 1.1 GB)
      Upload:   611.87 Mbps (data used: 700.2 MB)
 Packet Loss:     0.0%
";

    fn config(retry_count: u32) -> SpeedtestConfig {
        SpeedtestConfig {
            timeout: 5,
            servers: Vec::new(),
            retry_count,
            retry_delay: 0,
        }
    }

    #[test]
    fn test_parse_ookla_json() {
        let outcome = parse_output(OOKLA_JSON).unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.download_mbps, 100.0);
        assert_eq!(outcome.upload_mbps, 50.0);
        assert_eq!(outcome.ping_ms, 12.3);
        assert_eq!(outcome.isp, "Test ISP");
        assert_eq!(outcome.test_server_label(), "Test Server (Moscow)");
    }

    #[test]
    fn test_parse_simple_output() {
        let outcome = parse_output(SIMPLE).unwrap();

        assert_eq!(outcome.download_mbps, 95.34);
        assert_eq!(outcome.upload_mbps, 40.12);
        assert_eq!(outcome.ping_ms, 15.2);
        assert_eq!(outcome.server_name, "Unknown");
        assert_eq!(outcome.test_server_label(), "Unknown");
    }

    #[test]
    fn test_parse_human_readable_output() {
        let outcome = parse_output(OOKLA_TEXT).unwrap();

        assert_eq!(outcome.download_mbps, 933.42);
        assert_eq!(outcome.upload_mbps, 611.87);
        assert_eq!(outcome.ping_ms, 3.02);
        assert_eq!(outcome.server_name, "Telia - Helsinki (id: 1234)");
        assert_eq!(outcome.isp, "Hetzner Online");
    }

    #[test]
    fn test_json_without_bandwidth_falls_back_to_text() {
        assert!(parse_output(r#"{"error": "Cannot read from socket"}"#).is_none());
    }

    #[test]
    fn test_parse_requires_both_speeds() {
        assert!(parse_output("Ping: 15.2 ms\nDownload: 95.34 Mbit/s\n").is_none());
        assert!(parse_output("Retrieving speedtest.net configuration...").is_none());
        assert!(parse_output("Download: fast Mbit/s\nUpload: 1 Mbit/s").is_none());
    }

    #[test]
    fn test_flavor_detection() {
        assert_eq!(
            Flavor::of(Path::new("/usr/bin/speedtest-cli")),
            Flavor::SpeedtestCli
        );
        assert_eq!(Flavor::of(Path::new("/usr/bin/speedtest")), Flavor::Ookla);
    }

    #[tokio::test]
    async fn test_no_commands_is_failure_outcome() {
        let runner = SpeedtestRunner::with_commands(config(3), Vec::new());
        let outcome = runner.run().await;

        assert!(!outcome.success);
        assert!(outcome.error_message.unwrap().contains("No speedtest command"));
    }

    #[tokio::test]
    async fn test_missing_binary_exhausts_retries() {
        let runner = SpeedtestRunner::with_commands(
            config(2),
            vec![PathBuf::from("/nonexistent/speedtest-cli")],
        );
        let outcome = runner.run().await;

        assert!(!outcome.success);
        assert_eq!(outcome.download_mbps, 0.0);
        let message = outcome.error_message.unwrap();
        assert!(message.starts_with("All speedtest attempts failed"));
        assert!(message.contains("failed to start"));
    }
}
