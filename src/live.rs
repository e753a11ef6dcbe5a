//! Runs an agent as a child process and classifies its `stream-json` stdout as it arrives.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::classifier::{ActivityState, Classifier, ClassifierTimings, Signal, ToolRules};
use crate::config::{MonitorConfig, RuntimeSettings};
use crate::monitor::forward_signals;
use crate::notifier::{MonitorEvent, Notifier};
use crate::usage::{UsageAggregator, UsageSettings};

pub const DEFAULT_AGENT: &str = "claude";

/// `<agent> -p <prompt> --output-format stream-json --verbose`, optionally inside `cwd`.
pub fn agent_command(agent: &str, prompt: &str, cwd: Option<&Path>) -> Command {
    let mut command = Command::new(agent);
    command.args(["-p", prompt, "--output-format", "stream-json", "--verbose"]);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    command
}

enum LiveInput {
    Line(String),
    Closed,
    Stop,
}

/// Cloneable stop switch for a running [`LiveRun`].
#[derive(Clone)]
pub struct LiveHandle {
    tx: Sender<LiveInput>,
}

impl LiveHandle {
    /// Kills the child; the run ends once its stdout closes.
    pub fn stop(&self) {
        let _ = self.tx.send(LiveInput::Stop);
    }
}

pub struct LiveRun<N: Notifier> {
    classifier: Classifier,
    usage: UsageAggregator,
    notifier: N,
    poll_interval: Duration,
    tx: Sender<LiveInput>,
    rx: Receiver<LiveInput>,
}

impl<N: Notifier> LiveRun<N> {
    pub fn new(
        root: PathBuf,
        config: &MonitorConfig,
        runtime: &RuntimeSettings,
        notifier: N,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            classifier: Classifier::new(
                ToolRules::from_config(&config.tools),
                ClassifierTimings::from_runtime(runtime),
                &config.markers,
                Instant::now(),
            ),
            usage: UsageAggregator::new(UsageSettings::new(root, config, runtime)),
            notifier,
            poll_interval: runtime.poll_interval,
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> LiveHandle {
        LiveHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn state(&self) -> ActivityState {
        self.classifier.state()
    }

    /// Spawns `command`, classifies each complete stdout line, and returns the exit code.
    pub fn run(&mut self, mut command: Command) -> Result<Option<i32>> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = command.spawn().with_context(|| {
            format!("failed to start {}", command.get_program().to_string_lossy())
        })?;
        let stdout = child.stdout.take().context("agent stdout was not captured")?;
        spawn_stdout_reader(stdout, self.tx.clone())?;

        let pid = child.id();
        info!(pid, "agent started");
        self.notifier.notify(MonitorEvent::AgentStarted { pid });

        let mut next_tick = Instant::now() + self.poll_interval;
        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(timeout) {
                Ok(LiveInput::Line(line)) => {
                    let signals = self.classifier.classify_line(&line, Instant::now());
                    self.dispatch(signals);
                }
                Ok(LiveInput::Stop) => {
                    info!(pid, "stopping agent");
                    if let Err(err) = child.kill() {
                        warn!(pid, error = %err, "failed to kill agent");
                    }
                }
                Ok(LiveInput::Closed) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let now = Instant::now();
                    let signals = self.classifier.tick(now);
                    self.dispatch(signals);
                    if self.usage.poll_weekly(now) {
                        self.publish_usage();
                    }
                    next_tick = now + self.poll_interval;
                }
            }
        }

        let status = child.wait().context("failed to wait for agent")?;
        let signals = self.classifier.flush_pending(Instant::now());
        self.dispatch(signals);

        let code = status.code();
        info!(pid, ?code, "agent exited");
        self.notifier.notify(MonitorEvent::AgentExited { code });
        Ok(code)
    }

    fn dispatch(&mut self, signals: Vec<Signal>) {
        if forward_signals(signals, &mut self.usage, &mut self.notifier) {
            self.publish_usage();
        }
    }

    fn publish_usage(&mut self) {
        self.notifier
            .notify(MonitorEvent::UsageUpdate(self.usage.snapshot()));
    }
}

fn spawn_stdout_reader<R: Read + Send + 'static>(stdout: R, tx: Sender<LiveInput>) -> Result<()> {
    thread::Builder::new()
        .name("agent-stdout".to_string())
        .spawn(move || {
            read_stdout_lines(BufReader::new(stdout), &tx);
            let _ = tx.send(LiveInput::Closed);
        })
        .context("failed to spawn agent stdout reader")?;
    Ok(())
}

/// Only newline-terminated lines are forwarded; an unterminated tail at EOF is dropped.
fn read_stdout_lines<R: BufRead>(mut reader: R, tx: &Sender<LiveInput>) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) if buf.last() != Some(&b'\n') => {
                debug!(len = buf.len(), "dropping unterminated agent output");
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if !line.is_empty() && tx.send(LiveInput::Line(line.to_string())).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(error = %err, "agent stdout read failed");
                break;
            }
        }
    }
}
