mod art;
mod automaton;
mod cleanup;
mod cli;
mod config;
mod logging;
mod process;
mod runner;
mod signals;
mod step;
mod template;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cleanup::CleanupPolicy;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ttpengine")]
#[command(about = "Run adversary-emulation procedures, including scripted terminal dialogues")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project directory holding .ttp-engine/config.toml (defaults to current)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t)]
    output: cli::OutputMode,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress normal output
    #[arg(long, global = true)]
    quiet: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a procedure
    Run {
        /// Procedure file
        file: PathBuf,

        /// Procedure argument, repeatable
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Ceiling for each interactive dialogue, in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Bound on each prompt wait, in seconds
        #[arg(long)]
        prompt_timeout: Option<u64>,

        /// Timeout for non-interactive commands, in seconds
        #[arg(long)]
        command_timeout: Option<u64>,

        /// When registered cleanups run
        #[arg(long, value_enum)]
        cleanup_policy: Option<CleanupPolicy>,

        /// Shell used to run commands
        #[arg(long)]
        shell: Option<String>,

        /// Write a timestamped log for this run
        #[arg(long)]
        save_log: bool,
    },

    /// Validate a procedure without running it
    Validate {
        /// Procedure file
        file: PathBuf,
    },

    /// Convert a technique directory into a procedure
    Convert {
        /// Technique directory, or an identifier when --art-config is given
        technique: String,

        /// Directory converted procedures are written under
        #[arg(long)]
        output_root: Option<PathBuf>,

        /// YAML file locating the technique corpus
        #[arg(long)]
        art_config: Option<PathBuf>,
    },

    /// Encode an ability record into base64 abilities and vars (printed as JSON)
    Abilities {
        /// JSON ability record
        record: PathBuf,

        /// Technique file whose tests are expanded per platform
        #[arg(long)]
        technique: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Run {
            file,
            save_log: true,
            ..
        } if cli.log_file.is_none() => {
            let stem = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "run".to_string());
            Some(logging::default_log_path(&stem)?)
        }
        _ => cli.log_file.clone(),
    };
    logging::init_logging(cli.debug, cli.quiet, log_file)?;

    let config = config::EngineConfig::load(cli.dir.as_deref())?;
    let mode = if cli.quiet && cli.output == cli::OutputMode::Console {
        cli::OutputMode::Quiet
    } else {
        cli.output
    };
    let handler = cli::create_handler(mode);

    let code = match cli.command {
        Commands::Run {
            file,
            args,
            timeout,
            prompt_timeout,
            command_timeout,
            cleanup_policy,
            shell,
            save_log: _,
        } => {
            let mut settings = config.settings();
            if let Some(secs) = timeout {
                settings.expect_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = prompt_timeout {
                settings.prompt_timeout = Some(Duration::from_secs(secs));
            }
            if let Some(secs) = command_timeout {
                settings.command_timeout = Duration::from_secs(secs);
            }
            if let Some(policy) = cleanup_policy {
                settings.cleanup_policy = policy;
            }
            if let Some(shell) = shell {
                settings.shell = shell;
            }

            let cancel = signals::CancellationToken::new();
            tokio::spawn(signals::setup_signal_handlers(cancel.clone()));

            cli::run_ttp(&file, &args, settings, cancel, &*handler)
                .await
                .unwrap_or_else(|e| {
                    eprintln!("✗ {}", e);
                    1
                })
        }

        Commands::Validate { file } => cli::validate_ttp(&file, &*handler),

        Commands::Convert {
            technique,
            output_root,
            art_config,
        } => {
            let output_root = output_root
                .or_else(|| config.art.output_root.clone())
                .or_else(cli::default_output_root)
                .ok_or_else(|| {
                    anyhow::anyhow!("Could not determine an output root; pass --output-root")
                })?;
            cli::convert_technique(&technique, art_config.as_deref(), &output_root, &*handler)
                .unwrap_or_else(|e| {
                    eprintln!("✗ {}", e);
                    1
                })
        }

        Commands::Abilities { record, technique } => {
            cli::generate_abilities(&record, technique.as_deref(), &*handler).unwrap_or_else(|e| {
                eprintln!("✗ {}", e);
                1
            })
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
