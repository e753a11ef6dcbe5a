use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use notify::{RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::cli::OutputFormat;
use crate::config::{self, MonitorConfig, RuntimeSettings};
use crate::live::{LiveRun, agent_command};
use crate::monitor::{MonitorCommand, MonitorHandle, MonitorSession};
use crate::notifier::{JsonLinesNotifier, Notifier, TextNotifier};
use crate::scanner::{ScanFilter, recent_sessions, scan_session_files};
use crate::selector::ActiveSessionSelector;
use crate::usage::{UsageAggregator, UsageGauge, UsageSettings, compute_file_usage};
use crate::util::{format_age, format_model_name, format_tokens, progress_bar};

fn stdout_notifier(format: OutputFormat) -> Box<dyn Notifier> {
    match format {
        OutputFormat::Json => Box::new(JsonLinesNotifier::new(io::stdout())),
        OutputFormat::Text => Box::new(TextNotifier::new(io::stdout())),
    }
}

pub fn run_watch(
    config: &MonitorConfig,
    runtime: RuntimeSettings,
    root: PathBuf,
    session: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let mut monitor = MonitorSession::new(root, config, runtime, stdout_notifier(format));
    monitor.select_session(session, Instant::now());

    let handle = monitor.handle();
    let stop = handle.clone();
    install_stop_signal(move || stop.stop())?;
    spawn_command_reader(handle);

    monitor.run();
    Ok(())
}

/// Runs the agent to completion and mirrors its exit code.
pub fn run_agent(
    config: &MonitorConfig,
    runtime: &RuntimeSettings,
    root: PathBuf,
    prompt: &str,
    cwd: Option<&Path>,
    agent: &str,
    format: OutputFormat,
) -> Result<u8> {
    let mut live = LiveRun::new(root, config, runtime, stdout_notifier(format));
    let handle = live.handle();
    install_stop_signal(move || handle.stop())?;

    let code = live.run(agent_command(agent, prompt, cwd))?;
    Ok(code.map_or(1, |code| u8::try_from(code).unwrap_or(1)))
}

pub fn print_status(config: &MonitorConfig, runtime: &RuntimeSettings, root: &Path) -> Result<()> {
    let filter = ScanFilter::from_markers(&config.markers);
    let candidates = scan_session_files(root, runtime.active_window, &filter);
    let mut selector = ActiveSessionSelector::new();
    let active = selector.select(&candidates);

    println!("agent-pulse status");
    println!("root: {}", root.display());
    println!("config: {}", config::config_path().display());
    println!("active_candidates: {}", candidates.len());

    let mut aggregator = UsageAggregator::new(UsageSettings::new(root.to_path_buf(), config, runtime));
    aggregator.track_file(active.map(|file| file.path.as_path()));
    aggregator.refresh_weekly_blocking(Instant::now());
    aggregator.refresh_context(true);
    let usage = aggregator.snapshot();

    match active {
        Some(file) => {
            println!("active_session: {} ({})", file.id, file.project);
            println!(
                "last_write: {}",
                format_age(chrono::DateTime::<chrono::Utc>::from(file.mtime))
            );
        }
        None => println!("active_session: none"),
    }
    if let Some(model) = usage.model.as_deref() {
        println!("model: {}", format_model_name(model));
    }

    print_gauge("session (5h)", &usage.gauges.session);
    print_gauge("weekly", &usage.gauges.weekly);
    print_gauge(
        &format!("weekly {}", config.markers.model_family),
        &usage.gauges.model_family_weekly,
    );
    print_gauge("context", &usage.gauges.context);
    for (model, tokens) in &usage.weekly_by_model {
        println!("  {:<28} {}", format_model_name(model), format_tokens(*tokens));
    }
    Ok(())
}

pub fn print_sessions(
    config: &MonitorConfig,
    runtime: &RuntimeSettings,
    root: &Path,
    limit: Option<usize>,
) -> Result<()> {
    let filter = ScanFilter::from_markers(&config.markers);
    let files = scan_session_files(root, runtime.recent_window, &filter);
    let sessions = recent_sessions(&files, limit.unwrap_or(runtime.recent_limit));

    if sessions.is_empty() {
        println!("No sessions under {} in the recent window.", root.display());
        return Ok(());
    }
    for session in sessions {
        println!(
            "{}  {:<32}  {}",
            session.id,
            session.project,
            format_age(session.mtime)
        );
    }
    Ok(())
}

pub fn print_file_usage(config: &MonitorConfig, path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("session log not found: {}", path.display());
    }
    let usage = compute_file_usage(path, &config.markers.model_family);

    println!("file: {}", path.display());
    println!("messages: {}", usage.message_count);
    println!("output_tokens: {}", format_tokens(usage.output_tokens));
    println!("input_tokens: {}", format_tokens(usage.input_tokens));
    println!(
        "{}_output_tokens: {}",
        config.markers.model_family,
        format_tokens(usage.model_family_output_tokens)
    );
    print_gauge(
        "context",
        &UsageGauge::new(usage.last_input_tokens, config.limits.context_tokens),
    );
    for (model, tokens) in &usage.output_by_model {
        println!("  {:<28} {}", format_model_name(model), format_tokens(*tokens));
    }
    Ok(())
}

pub fn doctor(config: &MonitorConfig, runtime: &RuntimeSettings, root: &Path) -> Result<u8> {
    let mut issues = 0u8;

    println!("agent-pulse doctor");
    println!("config_path: {}", config::config_path().display());
    println!("root: {}", root.display());

    if root.is_dir() {
        println!("[OK] Session root is accessible.");
    } else {
        issues += 1;
        println!("[WARN] Session root does not exist or is not a directory.");
    }

    let filter = ScanFilter::from_markers(&config.markers);
    let recent = scan_session_files(root, runtime.recent_window, &filter);
    if recent.is_empty() {
        println!("[INFO] No session logs modified in the recent window.");
    } else {
        println!("[OK] {} session log(s) in the recent window.", recent.len());
    }

    if root.is_dir() {
        match watcher_probe(root) {
            Ok(()) => println!("[OK] File change notifications available."),
            Err(err) => {
                issues += 1;
                println!("[WARN] File change notifications unavailable ({err:#}); polling only.");
            }
        }
    }

    if issues == 0 {
        println!("Doctor: healthy");
        Ok(0)
    } else {
        println!("Doctor: {issues} issue(s) found");
        Ok(1)
    }
}

fn watcher_probe(root: &Path) -> Result<()> {
    let mut watcher = notify::recommended_watcher(|_event: notify::Result<notify::Event>| {})
        .context("failed to create file watcher")?;
    watcher
        .watch(root, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;
    Ok(())
}

fn print_gauge(label: &str, gauge: &UsageGauge) {
    println!(
        "{label:<16} [{}] {:>5.1}%  {} / {}",
        progress_bar(gauge.used_percent, 20),
        gauge.used_percent,
        format_tokens(gauge.used_tokens),
        format_tokens(gauge.limit_tokens)
    );
}

/// `select <id>`, `unselect` and `quit` lines from stdin.
pub fn parse_command(line: &str) -> Option<MonitorCommand> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?.to_ascii_lowercase();
    let argument = parts.next();
    match (verb.as_str(), argument) {
        ("select", Some(id)) => Some(MonitorCommand::Select(Some(id.to_string()))),
        ("unselect", None) => Some(MonitorCommand::Select(None)),
        ("quit" | "stop", None) => Some(MonitorCommand::Stop),
        _ => None,
    }
}

fn spawn_command_reader(handle: MonitorHandle) {
    let spawned = thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                match parse_command(&line) {
                    Some(MonitorCommand::Select(session)) => handle.select_session(session),
                    Some(MonitorCommand::Stop) => {
                        handle.stop();
                        break;
                    }
                    Some(MonitorCommand::FileChanged(_)) => {}
                    None if line.trim().is_empty() => {}
                    None => warn!(command = %line.trim(), "unknown command"),
                }
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "stdin commands unavailable");
    }
}

fn install_stop_signal<F>(stop: F) -> Result<()>
where
    F: Fn() + Send + 'static,
{
    ctrlc::set_handler(move || {
        info!("stop requested");
        stop();
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_commands_parse() {
        assert_eq!(
            parse_command("select 7f3a"),
            Some(MonitorCommand::Select(Some("7f3a".to_string())))
        );
        assert_eq!(parse_command("  UNSELECT "), Some(MonitorCommand::Select(None)));
        assert_eq!(parse_command("quit"), Some(MonitorCommand::Stop));
        assert_eq!(parse_command("select"), None);
        assert_eq!(parse_command("dance now"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn file_usage_rejects_missing_file() {
        let tmp = tempfile::TempDir::new().expect("temp dir");
        let err = print_file_usage(&MonitorConfig::default(), &tmp.path().join("nope.jsonl"))
            .expect_err("missing file");
        assert!(err.to_string().contains("not found"));
    }
}
