mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::EXIT_FAILURE;
use std::path::PathBuf;
use std::process::ExitCode;
use toolrig_core::install_signal_handler;

#[derive(Debug, Parser)]
#[command(
    name = "toolrig",
    version,
    about = "Self-healing provisioning for containerised chip-design toolchains"
)]
struct Cli {
    /// Workspace root holding the runtime repository, PDKs and run logs.
    #[arg(long, env = "WORKSPACE_ROOT", global = true)]
    workspace: Option<PathBuf>,

    /// Configuration file (default: <workspace>/toolrig.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision the toolchain and verify it with the smoke-test design.
    Run,
    /// Provision, then run the flow or an interactive session for one design.
    Design {
        /// Design identifier (directory name under designs/).
        id: String,
        /// 1 = full flow, 2 = interactive session. Prompted for when omitted.
        #[arg(long)]
        mode: Option<String>,
    },
    /// Check the host, prerequisites and workspace without changing anything.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("TOOLRIG_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let target = commands::Target {
        workspace: cli.workspace,
        config: cli.config,
    };
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Run => commands::run::run(&target, json_output),
        Commands::Design { id, mode } => {
            commands::design::run(&target, &id, mode.as_deref(), json_output)
        }
        Commands::Doctor => commands::doctor::run(&target, json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
