use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use qoemu_core::{
    load_config, required_tools, Coordinator, CoordinatorError, EntryOutcome, Environment,
    ParamError, ParameterTable, QoemuConfig, RunRequest, RunSummary, ShapingController,
    ShapingError, ShapingRegistry, ToolError, ToolGateway, ToolKind,
};

pub type Result<T> = std::result::Result<T, AppError>;

/// Entry selector meaning "every entry of the table".
pub const ALL_ENTRIES: &str = "ALL";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] qoemu_core::ConfigError),
    #[error("parameter file error: {0}")]
    Params(#[from] ParamError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("tool error: {0}")]
    Tool(#[from] ToolError),
    #[error("shaping error: {0}")]
    Shaping(#[from] ShapingError),
    #[error("run error: {0}")]
    Run(#[from] CoordinatorError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{failed} of {total} entries failed")]
    EntriesFailed { failed: usize, total: usize },
}

impl AppError {
    /// `1` for faults detected before anything ran, `2` for faults during a run.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_)
            | AppError::Params(_)
            | AppError::InvalidArgument(_)
            | AppError::Tool(ToolError::Missing { .. })
            | AppError::Run(CoordinatorError::Config(_))
            | AppError::Run(CoordinatorError::DeviceUnavailable) => 1,
            _ => 2,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "QoEmu stimuli campaign coordinator", long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "configs/qoemu.toml")]
    pub config: PathBuf,
    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
    /// Output format of the result
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate and post-process stimuli
    Run(RunArgs),
    /// Validate the parameter file and exit
    CheckParams(ParamFileArgs),
    /// Remove shaping state left behind by an interrupted run
    Cleanup,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ParamFileArgs {
    /// Parameter file; defaults to `ParameterFile` from the configuration
    #[arg(long = "parameterfile")]
    pub parameter_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    /// Stimulus type(s), comma separated (e.g. `VS` or `VS,WB`)
    #[arg(value_name = "TYPE")]
    pub type_id: String,
    /// Table id(s), comma separated
    #[arg(value_name = "TABLE")]
    pub table: String,
    /// Entry id(s), comma separated, or `ALL`
    #[arg(value_name = "ENTRY", default_value = ALL_ENTRIES)]
    pub entry: String,
    /// Regenerate artifacts that already exist
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,
    /// Skip capturing new stimuli
    #[arg(long = "skipgenerate", default_value_t = false)]
    pub skip_generate: bool,
    /// Skip the post-processing steps
    #[arg(long = "skippostprocessing", default_value_t = false)]
    pub skip_postprocessing: bool,
    #[command(flatten)]
    pub params: ParamFileArgs,
    /// Only validate the parameter file
    #[arg(long = "check-params", default_value_t = false)]
    pub check_params: bool,
}

impl RunArgs {
    pub fn request(&self) -> Result<RunRequest> {
        let types = split_list(&self.type_id, "TYPE")?;
        let tables = split_list(&self.table, "TABLE")?;
        let entries = if self.entry.eq_ignore_ascii_case(ALL_ENTRIES) {
            None
        } else {
            Some(split_list(&self.entry, "ENTRY")?)
        };
        if self.skip_generate && self.skip_postprocessing {
            return Err(AppError::InvalidArgument(
                "--skipgenerate together with --skippostprocessing leaves nothing to do".into(),
            ));
        }
        Ok(RunRequest::new(types, tables, entries)
            .generate(!self.skip_generate)
            .postprocess(!self.skip_postprocessing)
            .overwrite(self.overwrite))
    }
}

fn split_list(value: &str, name: &str) -> Result<Vec<String>> {
    let items: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    if items.is_empty() {
        return Err(AppError::InvalidArgument(format!("{name} must not be empty")));
    }
    if let Some(bad) = items
        .iter()
        .find(|item| !item.chars().all(|ch| ch.is_ascii_alphanumeric()))
    {
        return Err(AppError::InvalidArgument(format!(
            "{name} '{bad}' must be alphanumeric"
        )));
    }
    Ok(items)
}

/// Installs the global subscriber on stderr; `RUST_LOG` overrides the `info` default.
pub fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

pub async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::CheckParams(args) => {
            let report = check_params(&cli.config, args)?;
            render(&report, cli.format)?;
        }
        Commands::Run(args) if args.check_params => {
            let report = check_params(&cli.config, &args.params)?;
            render(&report, cli.format)?;
        }
        Commands::Run(args) => {
            let summary = run_campaign(&cli.config, args).await?;
            render(&summary, cli.format)?;
            if !summary.is_success() {
                return Err(AppError::EntriesFailed {
                    failed: summary.failed(),
                    total: summary.entries.len(),
                });
            }
        }
        Commands::Cleanup => {
            let report = cleanup(&cli.config).await?;
            render(&report, cli.format)?;
        }
    }
    Ok(())
}

fn parameter_path(config_path: &Path, args: &ParamFileArgs) -> Result<PathBuf> {
    match &args.parameter_file {
        Some(path) => Ok(path.clone()),
        None => Ok(load_config(config_path)?.qoemu.parameter_file),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub status: &'static str,
    pub path: PathBuf,
    pub entries: usize,
}

pub fn check_params(config_path: &Path, args: &ParamFileArgs) -> Result<CheckReport> {
    let path = parameter_path(config_path, args)?;
    let table = ParameterTable::load(&path)?;
    info!(path = %path.display(), entries = table.len(), "parameter file is valid");
    Ok(CheckReport {
        status: "ok",
        path,
        entries: table.len(),
    })
}

async fn run_campaign(config_path: &Path, args: &RunArgs) -> Result<RunSummary> {
    let request = args.request()?;
    let config = load_config(config_path)?;
    let parameter_file = args
        .params
        .parameter_file
        .clone()
        .unwrap_or_else(|| config.qoemu.parameter_file.clone());
    let table = ParameterTable::load(&parameter_file)?;
    info!(path = %parameter_file.display(), entries = table.len(), "loaded parameter file");

    let tools = if request.generate {
        required_tools(config.qoemu.emulator_type)
    } else {
        vec![ToolKind::Ffmpeg, ToolKind::Ffprobe]
    };
    let gateway = Arc::new(ToolGateway::locate(&tools, config.netem.sudo_prefix)?);
    let env = Environment::from_config(config, gateway, Arc::new(table))?;
    let coordinator = Coordinator::new(env)?;
    Ok(coordinator.start(&request).await?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub iface: String,
    pub status: &'static str,
}

async fn cleanup(config_path: &Path) -> Result<CleanupReport> {
    let config: QoemuConfig = load_config(config_path)?;
    let gateway = Arc::new(ToolGateway::locate(
        &[ToolKind::Tc, ToolKind::Ip, ToolKind::Modprobe],
        config.netem.sudo_prefix,
    )?);
    let shaping = ShapingController::new(
        gateway,
        Arc::new(ShapingRegistry::new(config.netem.max_virtual_devices)),
        &config.netem,
    );
    shaping.purge(&config.netem.net_device_name).await?;
    Ok(CleanupReport {
        iface: config.netem.net_device_name,
        status: "clean",
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

impl DisplayFallback for CheckReport {
    fn display(&self) -> String {
        self.status.to_string()
    }
}

impl DisplayFallback for CleanupReport {
    fn display(&self) -> String {
        format!("{}: {}", self.iface, self.status)
    }
}

impl DisplayFallback for RunSummary {
    fn display(&self) -> String {
        let mut out = format!(
            "run {}: {} completed, {} skipped, {} failed",
            self.run_id,
            self.completed(),
            self.skipped(),
            self.failed()
        );
        for entry in &self.entries {
            let _ = match &entry.outcome {
                EntryOutcome::Skipped => write!(out, "\n  {:<12} skipped", entry.key.to_string()),
                EntryOutcome::Completed { produced } => write!(
                    out,
                    "\n  {:<12} completed ({} artifacts)",
                    entry.key.to_string(),
                    produced.len()
                ),
                EntryOutcome::Failed { stage, error } => write!(
                    out,
                    "\n  {:<12} failed at {stage}: {error}",
                    entry.key.to_string()
                ),
            };
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qoemu_core::{EntryReport, Stage, StimulusKey};
    use std::fs;
    use tempfile::TempDir;

    const VALID: &str = "\
key;t_init;rul;rdl;dul;ddl;link;start;end
VS-A-1;0;1000;5000;50;50;https://www.youtube.com/watch?v=abc;00:00:10;00:00:40
VS-A-2;2000;1000;5000;50;50;https://www.youtube.com/watch?v=abc;00:00:10;00:00:40
";

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("qoemuctl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn run_arguments_map_onto_request() {
        let cli = parse(&[
            "--config",
            "lab.toml",
            "run",
            "VS",
            "A",
            "1,3",
            "--overwrite",
            "--skippostprocessing",
            "--parameterfile",
            "p.csv",
        ]);
        assert_eq!(cli.config, PathBuf::from("lab.toml"));
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.params.parameter_file, Some(PathBuf::from("p.csv")));
        let request = args.request().unwrap();
        assert_eq!(request.types, vec!["VS"]);
        assert_eq!(request.entries, Some(vec!["1".to_string(), "3".to_string()]));
        assert!(request.generate && request.overwrite && !request.postprocess);
    }

    #[test]
    fn missing_entry_selects_all() {
        let cli = parse(&["run", "VS,WB", "A"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let request = args.request().unwrap();
        assert_eq!(request.types, vec!["VS", "WB"]);
        assert_eq!(request.entries, None);
        let all = parse(&["run", "VS", "A", "all"]);
        let Commands::Run(args) = all.command else {
            panic!("expected run");
        };
        assert_eq!(args.request().unwrap().entries, None);
    }

    #[test]
    fn contradictory_or_malformed_selection_is_rejected() {
        let Commands::Run(args) =
            parse(&["run", "VS", "A", "--skipgenerate", "--skippostprocessing"]).command
        else {
            panic!("expected run");
        };
        let err = args.request().unwrap_err();
        assert_eq!(err.exit_code(), 1);

        let Commands::Run(args) = parse(&["run", "V-S", "A"]).command else {
            panic!("expected run");
        };
        assert!(matches!(args.request(), Err(AppError::InvalidArgument(_))));
    }

    #[test]
    fn check_params_accepts_valid_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "params.csv", VALID);
        let report = check_params(
            &dir.path().join("absent.toml"),
            &ParamFileArgs {
                parameter_file: Some(path.clone()),
            },
        )
        .unwrap();
        assert_eq!(report.status, "ok");
        assert_eq!(report.entries, 2);
        assert_eq!(report.display(), "ok");
    }

    #[test]
    fn check_params_rejects_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "params.csv",
            "key;t_init;rul;rdl;dul;ddl\nVS-A-1;0;fast;5000;50;50\n",
        );
        let err = check_params(
            &dir.path().join("absent.toml"),
            &ParamFileArgs {
                parameter_file: Some(path),
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Params(ParamError::InvalidValue { .. })));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn check_params_falls_back_to_configured_file() {
        let dir = TempDir::new().unwrap();
        let params = write(&dir, "params.csv", VALID);
        let config = write(
            &dir,
            "qoemu.toml",
            &format!("[QOEMU]\nParameterFile = {:?}\n", params.display().to_string()),
        );
        let report = check_params(&config, &ParamFileArgs { parameter_file: None }).unwrap();
        assert_eq!(report.path, params);
    }

    #[tokio::test]
    async fn run_flag_only_checks_parameters() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "params.csv", VALID);
        let cli = parse(&[
            "--config",
            dir.path().join("absent.toml").to_str().unwrap(),
            "run",
            "VS",
            "A",
            "--check-params",
            "--parameterfile",
            path.to_str().unwrap(),
        ]);
        run(cli).await.unwrap();
    }

    #[test]
    fn runtime_failures_exit_with_two() {
        assert_eq!(
            AppError::EntriesFailed {
                failed: 1,
                total: 3
            }
            .exit_code(),
            2
        );
        assert_eq!(
            AppError::Tool(ToolError::Missing { tool: "tc" }).exit_code(),
            1
        );
        assert_eq!(
            AppError::Run(CoordinatorError::MissingParameters(StimulusKey::new(
                "VS", "A", "1"
            )))
            .exit_code(),
            2
        );
    }

    #[test]
    fn summary_text_lists_every_entry() {
        let mut summary = RunSummary::new(uuid_nil());
        summary.entries.push(EntryReport {
            key: StimulusKey::new("VS", "A", "1"),
            outcome: EntryOutcome::Completed {
                produced: vec![PathBuf::from("a"), PathBuf::from("b")],
            },
        });
        summary.entries.push(EntryReport {
            key: StimulusKey::new("VS", "A", "2"),
            outcome: EntryOutcome::Failed {
                stage: Stage::Trim,
                error: "no start of content detected".into(),
            },
        });
        let text = summary.display();
        assert!(text.contains("1 completed, 0 skipped, 1 failed"));
        assert!(text.contains("VS-A-1       completed (2 artifacts)"));
        assert!(text.contains("VS-A-2       failed at trim: no start of content detected"));
    }

    fn uuid_nil() -> uuid::Uuid {
        uuid::Uuid::nil()
    }
}
