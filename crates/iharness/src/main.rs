//! iharness - icommands test harness
//!
//! Command-line helpers around the harness library: environment file
//! conversion, server log inspection and transfer interruption.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use eyre::{bail, WrapErr};
use iharness::executor::{CommandEnv, CommandSpec};
use iharness::interrupt::{run_until_file_reaches_size, InterruptConfig, InterruptOutcome};
use iharness::log_monitor::{self, LogBookmark};
use iharness_core::codec::{self, EnvFormat};
use iharness_core::{ClientProfile, EnvironmentDocument, HarnessConfig, ProtocolVersion};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "iharness", about = "icommands test harness utilities", version)]
struct Cli {
    /// Harness config file (key=value)
    #[arg(long, global = true, env = "IHARNESS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Client environment documents
    Env {
        #[command(subcommand)]
        command: EnvCommand,
    },
    /// Server log inspection
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
    /// Run a command and stop it once a file reaches a size
    Interrupt {
        /// File to watch
        #[arg(long)]
        watch: PathBuf,

        /// Size in bytes at which to interrupt
        #[arg(long)]
        threshold: u64,

        /// Seconds to wait for the file to reach the threshold
        #[arg(long, default_value = "30")]
        timeout_sec: u64,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Print the client-configuration era of a service version
    VersionEra {
        /// Version such as 4.1.8 (defaults to the configured version)
        version: Option<String>,
    },
}

#[derive(Subcommand)]
enum EnvCommand {
    /// Convert an environment file between formats
    Convert {
        /// Input format: legacy or structured
        #[arg(long, value_parser = parse_format)]
        from: EnvFormat,

        /// Output format: legacy or structured
        #[arg(long, value_parser = parse_format)]
        to: EnvFormat,

        input: PathBuf,

        /// Output file (stdout when omitted)
        output: Option<PathBuf>,
    },
    /// Print the default client environment for a user
    Show {
        #[arg(long)]
        user: String,

        #[arg(long)]
        zone: String,

        /// Host (defaults to the configured hostname)
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        ssl: bool,

        /// Output format: legacy or structured
        #[arg(long, value_parser = parse_format, default_value = "structured")]
        format: EnvFormat,
    },
}

#[derive(Subcommand)]
enum LogCommand {
    /// Print the current size of a log file (or the newest server log in a directory)
    Bookmark { path: PathBuf },
    /// Count occurrences of a message after a bookmark
    Count {
        path: PathBuf,
        message: String,

        /// Byte offset to start from
        #[arg(long, default_value = "0")]
        since: u64,

        /// Treat the message as a regular expression
        #[arg(long)]
        regex: bool,
    },
}

fn parse_format(value: &str) -> Result<EnvFormat, String> {
    value.parse().map_err(|e| format!("{e}"))
}

fn load_config(path: Option<&Path>) -> eyre::Result<HarnessConfig> {
    let mut config = HarnessConfig::default();
    if let Some(path) = path {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
    }
    Ok(config)
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: HarnessConfig) -> eyre::Result<()> {
    match command {
        Command::Env { command } => run_env(command, &config),
        Command::Log { command } => run_log(command),
        Command::Interrupt {
            watch,
            threshold,
            timeout_sec,
            command,
        } => run_interrupt(&config, &watch, threshold, timeout_sec, command).await,
        Command::VersionEra { version } => {
            let version: ProtocolVersion = match version {
                Some(v) => v.parse()?,
                None => config.protocol_version()?,
            };
            let era = version.era()?;
            println!("{version} {}", era.as_str());
            println!(
                "{}={}",
                era.environment_file_var(),
                era.environment_file_name()
            );
            println!(
                "{}={}",
                era.authentication_file_var(),
                era.authentication_file_name()
            );
            Ok(())
        }
    }
}

fn run_env(command: EnvCommand, config: &HarnessConfig) -> eyre::Result<()> {
    match command {
        EnvCommand::Convert {
            from,
            to,
            input,
            output,
        } => {
            let doc = codec::decode(&input, from)
                .wrap_err_with(|| format!("failed to read {}", input.display()))?;
            match output {
                Some(path) => {
                    codec::write_document(&path, &doc, to)?;
                    info!(
                        input = %input.display(),
                        output = %path.display(),
                        fields = doc.len(),
                        "converted {} -> {}",
                        from.as_str(),
                        to.as_str()
                    );
                }
                None => print_document(&doc, to)?,
            }
            Ok(())
        }
        EnvCommand::Show {
            user,
            zone,
            host,
            ssl,
            format,
        } => {
            let profile = ClientProfile {
                port: config.port,
                default_resource: config.default_resource.clone(),
                use_ssl: ssl || config.use_ssl,
                ..ClientProfile::new(user, host.unwrap_or_else(|| config.hostname.clone()), zone)
            };
            print_document(&EnvironmentDocument::for_client(&profile), format)
        }
    }
}

fn print_document(doc: &EnvironmentDocument, format: EnvFormat) -> eyre::Result<()> {
    let bytes = codec::encode(doc, format)?;
    println!("{}", String::from_utf8_lossy(&bytes).trim_end());
    Ok(())
}

fn run_log(command: LogCommand) -> eyre::Result<()> {
    match command {
        LogCommand::Bookmark { path } => {
            let log = log_monitor::resolve_log_path(&path)?;
            let bookmark = LogBookmark::capture(&log)?;
            println!("{} {}", bookmark.path().display(), bookmark.offset());
        }
        LogCommand::Count {
            path,
            message,
            since,
            regex,
        } => {
            let log = log_monitor::resolve_log_path(&path)?;
            let bookmark = LogBookmark::at(log, since);
            let count = if regex {
                let pattern = regex::bytes::Regex::new(&message)
                    .wrap_err_with(|| format!("invalid pattern {message:?}"))?;
                bookmark.count_matches(&pattern)?
            } else {
                bookmark.count_occurrences(&message)?
            };
            println!("{count}");
        }
    }
    Ok(())
}

async fn run_interrupt(
    config: &HarnessConfig,
    watch: &Path,
    threshold: u64,
    timeout_sec: u64,
    command: Vec<String>,
) -> eyre::Result<()> {
    let interrupt = InterruptConfig::new(threshold)
        .with_timeout(Duration::from_secs(timeout_sec))
        .with_terminate_grace(config.terminate_grace());
    let env = match &config.icommands_dir {
        Some(dir) => CommandEnv::inherit().with_search_dir(dir),
        None => CommandEnv::inherit(),
    };

    let outcome =
        run_until_file_reaches_size(&CommandSpec::Argv(command), &env, watch, &interrupt).await?;
    match outcome {
        InterruptOutcome::Interrupted {
            elapsed,
            observed_size,
            ..
        } => {
            println!(
                "interrupted after {:.3}s at {observed_size} bytes",
                elapsed.as_secs_f64()
            );
            Ok(())
        }
        InterruptOutcome::TimedOut {
            elapsed,
            diagnostics,
        } => bail!(
            "timed out after {:.3}s\n{diagnostics}",
            elapsed.as_secs_f64()
        ),
        InterruptOutcome::ExitedEarly { state, diagnostics } => {
            bail!("command ended ({state:?}) before reaching the threshold\n{diagnostics}")
        }
    }
}
