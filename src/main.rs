use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use agent_pulse::app;
use agent_pulse::cli::{Cli, Commands, OutputFormat};
use agent_pulse::config::{self, MonitorConfig};
use agent_pulse::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("agent-pulse error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = MonitorConfig::load_or_init()?;
    let runtime = config::runtime_settings();
    let root = config::resolve_root(cli.root.as_deref());

    match cli.command {
        Some(Commands::Run {
            prompt,
            cwd,
            agent,
            format,
        }) => app::run_agent(&config, &runtime, root, &prompt, cwd.as_deref(), &agent, format),
        Some(Commands::Status) => {
            app::print_status(&config, &runtime, &root)?;
            Ok(0)
        }
        Some(Commands::Sessions { limit }) => {
            app::print_sessions(&config, &runtime, &root, limit)?;
            Ok(0)
        }
        Some(Commands::Usage { path }) => {
            app::print_file_usage(&config, &path)?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&config, &runtime, &root),
        Some(Commands::Watch { session, format }) => {
            app::run_watch(&config, runtime, root, session, format)?;
            Ok(0)
        }
        None => {
            app::run_watch(&config, runtime, root, None, OutputFormat::default())?;
            Ok(0)
        }
    }
}
