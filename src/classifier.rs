use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::commit::{extract_commit_message, is_commit_command};
use crate::config::{MarkerConfig, RuntimeSettings, ToolsConfig};
use crate::event::{EventEnvelope, ToolUse, UsageBlock, parse_line};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityState {
    #[default]
    Idle,
    Thinking,
    Delegating,
    Coding,
    MultiAgent,
    Planning,
    Done,
    Interrupted,
}

impl ActivityState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Thinking => "THINKING",
            Self::Delegating => "DELEGATING",
            Self::Coding => "CODING",
            Self::MultiAgent => "MULTI_AGENT",
            Self::Planning => "PLANNING",
            Self::Done => "DONE",
            Self::Interrupted => "INTERRUPTED",
        }
    }

    /// States the inactivity timeout forces to `Done`.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Thinking | Self::Delegating | Self::Coding | Self::MultiAgent | Self::Planning
        )
    }

    fn settles_to_idle(self) -> bool {
        matches!(self, Self::Done | Self::Interrupted)
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub from: ActivityState,
    pub to: ActivityState,
    pub at: DateTime<Utc>,
}

/// Side effects of classifying one event or one timer tick, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    StateChanged(StateChange),
    ToolError { tool: Option<String> },
    GitCommit { message: String },
    ModelObserved(String),
    TurnUsage(UsageBlock),
}

#[derive(Debug, Clone)]
pub struct ToolRules {
    coding: BTreeSet<String>,
    delegation: BTreeSet<String>,
    planning: BTreeSet<String>,
    exit_planning: BTreeSet<String>,
    shell: String,
}

impl ToolRules {
    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self {
            coding: tools.coding.clone(),
            delegation: tools.delegation.clone(),
            planning: tools.planning.clone(),
            exit_planning: tools.exit_planning.clone(),
            shell: tools.shell.clone(),
        }
    }
}

impl Default for ToolRules {
    fn default() -> Self {
        Self::from_config(&ToolsConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifierTimings {
    pub done_debounce: Duration,
    pub inactivity_timeout: Duration,
    pub settle_timeout: Duration,
}

impl ClassifierTimings {
    pub fn from_runtime(runtime: &RuntimeSettings) -> Self {
        Self {
            done_debounce: runtime.done_debounce,
            inactivity_timeout: runtime.inactivity_timeout,
            settle_timeout: runtime.settle_timeout,
        }
    }
}

impl Default for ClassifierTimings {
    fn default() -> Self {
        Self::from_runtime(&RuntimeSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierSnapshot {
    pub state: ActivityState,
    pub workers: usize,
    pub pending_tool_calls: usize,
    pub done_pending: bool,
    pub quiet_for: Duration,
}

#[derive(Debug)]
pub struct Classifier {
    rules: ToolRules,
    timings: ClassifierTimings,
    interrupt_marker: String,
    state: ActivityState,
    state_entered_at: Instant,
    last_activity_at: Instant,
    done_deadline: Option<Instant>,
    workers: usize,
    pending_calls: HashMap<String, String>,
}

impl Classifier {
    pub fn new(
        rules: ToolRules,
        timings: ClassifierTimings,
        markers: &MarkerConfig,
        now: Instant,
    ) -> Self {
        Self {
            rules,
            timings,
            interrupt_marker: markers.interrupt.clone(),
            state: ActivityState::Idle,
            state_entered_at: now,
            last_activity_at: now,
            done_deadline: None,
            workers: 0,
            pending_calls: HashMap::new(),
        }
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn snapshot(&self, now: Instant) -> ClassifierSnapshot {
        ClassifierSnapshot {
            state: self.state,
            workers: self.workers,
            pending_tool_calls: self.pending_calls.len(),
            done_pending: self.done_deadline.is_some(),
            quiet_for: now.saturating_duration_since(self.last_activity_at),
        }
    }

    /// Unparseable lines leave state and timers untouched.
    pub fn classify_line(&mut self, line: &str, now: Instant) -> Vec<Signal> {
        match parse_line(line) {
            Some(event) => self.classify(&event, now),
            None => {
                debug!(len = line.len(), "dropping unparseable line");
                Vec::new()
            }
        }
    }

    pub fn classify(&mut self, event: &EventEnvelope, now: Instant) -> Vec<Signal> {
        debug!(kind = event.kind(), state = %self.state, "classifying event");
        let mut signals = Vec::new();
        self.last_activity_at = now;
        self.done_deadline = None;

        match event {
            EventEnvelope::System(_) => {
                if let Some(model) = event.model() {
                    signals.push(Signal::ModelObserved(model.to_string()));
                }
            }
            EventEnvelope::Assistant(_) => self.classify_assistant(event, now, &mut signals),
            EventEnvelope::User(_) => self.classify_user(event, now, &mut signals),
            EventEnvelope::Result(_) => {
                if let Some(usage) = event.usage() {
                    signals.push(Signal::TurnUsage(usage.clone()));
                }
                self.schedule_done(now);
            }
        }

        signals
    }

    /// Fires debounced and timeout-driven transitions that are due at `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<Signal> {
        let mut signals = Vec::new();

        if let Some(deadline) = self.done_deadline {
            if now >= deadline {
                self.done_deadline = None;
                signals.extend(self.transition(ActivityState::Done, now));
            }
        } else if self.state.is_busy()
            && now.saturating_duration_since(self.last_activity_at)
                >= self.timings.inactivity_timeout
        {
            debug!(state = %self.state, "inactivity timeout");
            signals.extend(self.transition(ActivityState::Done, now));
        }

        if self.state.settles_to_idle()
            && self.done_deadline.is_none()
            && now.saturating_duration_since(self.state_entered_at) >= self.timings.settle_timeout
            && now.saturating_duration_since(self.last_activity_at) >= self.timings.settle_timeout
        {
            signals.extend(self.transition(ActivityState::Idle, now));
        }

        signals
    }

    /// Drops any pending completion, e.g. when the tailed file changes.
    pub fn cancel_pending(&mut self) {
        self.done_deadline = None;
    }

    /// Completes a pending turn immediately; for when no further events can arrive.
    pub fn flush_pending(&mut self, now: Instant) -> Vec<Signal> {
        match self.done_deadline.take() {
            Some(_) => self.transition(ActivityState::Done, now).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn classify_assistant(&mut self, event: &EventEnvelope, now: Instant, signals: &mut Vec<Signal>) {
        if let Some(model) = event.model() {
            signals.push(Signal::ModelObserved(model.to_string()));
        }

        let mut saw_tool = false;
        for tool in event.tool_uses() {
            saw_tool = true;
            self.apply_tool_use(tool, now, signals);
        }

        if !saw_tool
            && event.has_text()
            && matches!(self.state, ActivityState::Idle | ActivityState::Done)
        {
            signals.extend(self.transition(ActivityState::Thinking, now));
        }

        if event.is_turn_end() {
            self.schedule_done(now);
        }
    }

    fn apply_tool_use(&mut self, tool: ToolUse<'_>, now: Instant, signals: &mut Vec<Signal>) {
        if !tool.id.is_empty() {
            self.pending_calls
                .insert(tool.id.to_string(), tool.name.to_string());
        }

        if tool.name == self.rules.shell
            && let Some(command) = tool.command()
            && is_commit_command(command)
        {
            signals.push(Signal::GitCommit {
                message: extract_commit_message(command),
            });
        }

        let delegation = self.rules.delegation.contains(tool.name);
        let target = if self.rules.planning.contains(tool.name) {
            Some(ActivityState::Planning)
        } else if self.rules.exit_planning.contains(tool.name) {
            Some(ActivityState::Thinking)
        } else if delegation {
            Some(if self.workers == 0 {
                ActivityState::Delegating
            } else {
                ActivityState::MultiAgent
            })
        } else if self.rules.coding.contains(tool.name) && self.state != ActivityState::Planning {
            Some(ActivityState::Coding)
        } else {
            None
        };

        if let Some(target) = target
            && let Some(change) = self.transition(target, now)
        {
            if delegation {
                self.workers += 1;
            }
            signals.push(change);
        }
    }

    fn classify_user(&mut self, event: &EventEnvelope, now: Instant, signals: &mut Vec<Signal>) {
        let mut saw_result = false;
        for result in event.tool_results() {
            saw_result = true;
            let tool = self.pending_calls.remove(result.tool_use_id);
            if result.is_error {
                signals.push(Signal::ToolError { tool });
            }
        }
        if saw_result {
            return;
        }

        let target = if event.text_starts_with(&self.interrupt_marker) {
            ActivityState::Interrupted
        } else {
            ActivityState::Thinking
        };
        signals.extend(self.transition(target, now));
    }

    fn schedule_done(&mut self, now: Instant) {
        self.done_deadline = Some(now + self.timings.done_debounce);
    }

    fn transition(&mut self, to: ActivityState, now: Instant) -> Option<Signal> {
        if self.state == to && to != ActivityState::MultiAgent {
            return None;
        }

        let from = self.state;
        self.state = to;
        self.state_entered_at = now;
        match to {
            ActivityState::Idle => self.workers = 0,
            ActivityState::Done => self.pending_calls.clear(),
            _ => {}
        }
        debug!(%from, %to, workers = self.workers, "state transition");
        Some(Signal::StateChanged(StateChange {
            from,
            to,
            at: Utc::now(),
        }))
    }
}
