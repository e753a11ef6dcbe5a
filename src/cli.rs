use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "agent-pulse",
    version,
    about = "Follow the live coding-agent session log and report activity and token usage"
)]
pub struct Cli {
    /// Directory holding session logs (defaults to ~/.claude/projects).
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow the active session and stream events to stdout (default).
    Watch {
        /// Pin a session id instead of following the busiest log.
        #[arg(long, value_name = "SESSION_ID")]
        session: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Start an agent on a prompt and classify its streamed output live.
    Run {
        prompt: String,
        /// Working directory for the agent.
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,
        /// Agent executable to launch.
        #[arg(long, value_name = "PROGRAM", default_value = crate::live::DEFAULT_AGENT)]
        agent: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
    /// Print a one-shot snapshot of the active session and usage windows.
    Status,
    /// List recently modified sessions, newest first.
    Sessions {
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },
    /// Print token usage for a single session log.
    Usage {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Run health diagnostics for the log root and file watching.
    Doctor,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}
