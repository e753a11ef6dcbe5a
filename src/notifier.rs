//! Downstream delivery of monitor events.

use std::io::Write;
use std::sync::mpsc::Sender;

use serde::Serialize;
use tracing::debug;

use crate::classifier::StateChange;
use crate::scanner::SessionSummary;
use crate::usage::{AggregateUsage, ContextResetReason};
use crate::util::{format_age, format_model_name, format_tokens, now_local, truncate};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    WatchStatus {
        watching: bool,
        file: Option<String>,
    },
    StateChange(StateChange),
    UsageUpdate(AggregateUsage),
    SessionsList {
        sessions: Vec<SessionSummary>,
    },
    ToolError {
        tool: Option<String>,
    },
    GitCommit {
        message: String,
    },
    ContextReset {
        reason: ContextResetReason,
    },
    AgentStarted {
        pid: u32,
    },
    AgentExited {
        code: Option<i32>,
    },
}

pub trait Notifier {
    fn notify(&mut self, event: MonitorEvent);
}

impl Notifier for Vec<MonitorEvent> {
    fn notify(&mut self, event: MonitorEvent) {
        self.push(event);
    }
}

impl<N: Notifier + ?Sized> Notifier for Box<N> {
    fn notify(&mut self, event: MonitorEvent) {
        (**self).notify(event);
    }
}

/// Forwards events to another thread; a dropped receiver silently discards them.
pub struct ChannelNotifier {
    tx: Sender<MonitorEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: Sender<MonitorEvent>) -> Self {
        Self { tx }
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&mut self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }
}

/// One JSON object per line.
pub struct JsonLinesNotifier<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesNotifier<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Notifier for JsonLinesNotifier<W> {
    fn notify(&mut self, event: MonitorEvent) {
        let written = serde_json::to_writer(&mut self.out, &event)
            .map_err(std::io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"))
            .and_then(|()| self.out.flush());
        if let Err(err) = written {
            debug!(error = %err, "failed to write event");
        }
    }
}

/// Human-readable lines for a terminal.
pub struct TextNotifier<W: Write> {
    out: W,
}

impl<W: Write> TextNotifier<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Notifier for TextNotifier<W> {
    fn notify(&mut self, event: MonitorEvent) {
        let line = format!("[{}] {}", now_local(), describe(&event));
        if let Err(err) = writeln!(self.out, "{line}").and_then(|()| self.out.flush()) {
            debug!(error = %err, "failed to write event");
        }
    }
}

pub fn describe(event: &MonitorEvent) -> String {
    match event {
        MonitorEvent::WatchStatus { watching: false, .. } => "stopped watching".to_string(),
        MonitorEvent::WatchStatus { file: None, .. } => "watching, no active session".to_string(),
        MonitorEvent::WatchStatus {
            file: Some(file), ..
        } => format!("watching {file}"),
        MonitorEvent::StateChange(change) => format!("state {} -> {}", change.from, change.to),
        MonitorEvent::UsageUpdate(usage) => {
            let model = usage
                .model
                .as_deref()
                .map(format_model_name)
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "usage {model} | session {} ({:.0}%) | week {} ({:.0}%) | family {} | context {} ({:.0}% left)",
                format_tokens(usage.session_tokens),
                usage.gauges.session.used_percent,
                format_tokens(usage.weekly_tokens),
                usage.gauges.weekly.used_percent,
                format_tokens(usage.sonnet_weekly),
                format_tokens(usage.current_session_context),
                usage.gauges.context.remaining_percent,
            )
        }
        MonitorEvent::SessionsList { sessions } => {
            let newest = sessions
                .first()
                .map(|session| format!(", newest {} ({})", session.id, format_age(session.mtime)))
                .unwrap_or_default();
            format!("{} recent sessions{newest}", sessions.len())
        }
        MonitorEvent::ToolError { tool } => {
            format!("tool error in {}", tool.as_deref().unwrap_or("unknown tool"))
        }
        MonitorEvent::GitCommit { message } => format!("commit: {}", truncate(message, 72)),
        MonitorEvent::ContextReset { reason } => match reason {
            ContextResetReason::Compacted => "context compacted".to_string(),
            ContextResetReason::Full => "context window full".to_string(),
        },
        MonitorEvent::AgentStarted { pid } => format!("agent started (pid {pid})"),
        MonitorEvent::AgentExited { code: Some(code) } => format!("agent exited with code {code}"),
        MonitorEvent::AgentExited { code: None } => "agent terminated by signal".to_string(),
    }
}
