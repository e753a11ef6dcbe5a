use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Instant;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::classifier::{ActivityState, Classifier, ClassifierTimings, Signal, ToolRules};
use crate::config::{MonitorConfig, RuntimeSettings};
use crate::notifier::{MonitorEvent, Notifier};
use crate::scanner::{ScanFilter, SessionFile, recent_sessions, scan_session_files};
use crate::selector::ActiveSessionSelector;
use crate::tail::TailCursor;
use crate::usage::{UsageAggregator, UsageSettings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCommand {
    FileChanged(PathBuf),
    Select(Option<String>),
    Stop,
}

/// Cloneable input side of a running [`MonitorSession`].
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    tx: Sender<MonitorCommand>,
}

impl MonitorHandle {
    pub fn select_session(&self, session: Option<String>) {
        let _ = self.tx.send(MonitorCommand::Select(session));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(MonitorCommand::Stop);
    }
}

struct ActiveTarget {
    file: SessionFile,
    cursor: TailCursor,
    // dropping the watcher ends the subscription
    _subscription: Option<RecommendedWatcher>,
}

/// Owns every piece of pipeline state: selector, cursor, classifier, usage cache.
pub struct MonitorSession<N: Notifier> {
    root: PathBuf,
    runtime: RuntimeSettings,
    filter: ScanFilter,
    selector: ActiveSessionSelector,
    classifier: Classifier,
    usage: UsageAggregator,
    notifier: N,
    active: Option<ActiveTarget>,
    watching: bool,
    push_enabled: bool,
    tick_count: u64,
    tx: Sender<MonitorCommand>,
    rx: Receiver<MonitorCommand>,
}

impl<N: Notifier> MonitorSession<N> {
    pub fn new(
        root: PathBuf,
        config: &MonitorConfig,
        runtime: RuntimeSettings,
        notifier: N,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let classifier = Classifier::new(
            ToolRules::from_config(&config.tools),
            ClassifierTimings::from_runtime(&runtime),
            &config.markers,
            Instant::now(),
        );
        let usage = UsageAggregator::new(UsageSettings::new(root.clone(), config, &runtime));
        Self {
            filter: ScanFilter::from_markers(&config.markers),
            root,
            runtime,
            selector: ActiveSessionSelector::new(),
            classifier,
            usage,
            notifier,
            active: None,
            watching: false,
            push_enabled: true,
            tick_count: 0,
            tx,
            rx,
        }
    }

    /// Relies on the poll tick alone, without file-change subscriptions.
    pub fn without_push(mut self) -> Self {
        self.push_enabled = false;
        self
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    pub fn active_file(&self) -> Option<&SessionFile> {
        self.active.as_ref().map(|active| &active.file)
    }

    pub fn state(&self) -> ActivityState {
        self.classifier.state()
    }

    pub fn watch(&mut self, now: Instant) {
        if self.watching {
            return;
        }
        self.watching = true;
        self.tick_count = 0;
        info!(root = %self.root.display(), "watch started");
        self.notifier.notify(MonitorEvent::WatchStatus {
            watching: true,
            file: None,
        });
        self.tick(now);
    }

    pub fn unwatch(&mut self) {
        if !self.watching {
            return;
        }
        self.watching = false;
        self.detach();
        info!("watch stopped");
        self.notifier.notify(MonitorEvent::WatchStatus {
            watching: false,
            file: None,
        });
    }

    /// Pins a session id, or clears the pin with `None`, and reselects immediately.
    pub fn select_session(&mut self, session: Option<String>, now: Instant) {
        self.selector.pin(session);
        if self.watching {
            self.rescan(now);
            self.refresh_usage(now, false);
        }
    }

    pub fn tick(&mut self, now: Instant) {
        if !self.watching {
            return;
        }
        let scan_every = self.runtime.scan_every_ticks.max(1);
        let sessions_every = self.runtime.sessions_every_ticks.max(1);

        if self.active.is_none() || self.tick_count % scan_every == 0 {
            self.rescan(now);
        }
        if self.tick_count % sessions_every == 0 {
            self.publish_sessions_list();
        }
        self.tick_count = self.tick_count.wrapping_add(1);

        self.tail_active(now);
        let signals = self.classifier.tick(now);
        self.dispatch(signals);
        self.refresh_usage(now, false);
    }

    /// Push path; events for anything but the current target are stale and ignored.
    pub fn on_file_changed(&mut self, path: &Path, now: Instant) {
        if !self.watching {
            return;
        }
        if self.active_file().is_none_or(|file| file.path != path) {
            debug!(path = %path.display(), "ignoring change for inactive file");
            return;
        }
        self.tail_active(now);
        self.refresh_usage(now, false);
    }

    /// Blocks until a stop command arrives, ticking on the poll interval.
    pub fn run(&mut self) {
        self.watch(Instant::now());
        let poll = self.runtime.poll_interval;
        let mut next_tick = Instant::now() + poll;

        loop {
            let timeout = next_tick.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(timeout) {
                Ok(MonitorCommand::FileChanged(path)) => self.on_file_changed(&path, Instant::now()),
                Ok(MonitorCommand::Select(session)) => {
                    self.select_session(session, Instant::now())
                }
                Ok(MonitorCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    self.tick(Instant::now());
                    next_tick = Instant::now() + poll;
                }
            }
        }

        self.unwatch();
    }

    fn rescan(&mut self, now: Instant) {
        let mut candidates =
            scan_session_files(&self.root, self.runtime.active_window, &self.filter);
        // a pinned session stays selectable for as long as the sessions list offers it
        if let Some(pinned) = self.selector.pinned()
            && !candidates.iter().any(|file| file.matches(pinned))
        {
            let recent = scan_session_files(&self.root, self.runtime.recent_window, &self.filter);
            candidates.extend(recent.into_iter().filter(|file| file.matches(pinned)));
        }
        let chosen = self.selector.select(&candidates).cloned();

        match chosen {
            Some(file) => {
                if let Some(active) = self.active.as_mut()
                    && active.file.path == file.path
                {
                    active.file = file;
                } else {
                    self.switch_to(file, now);
                }
            }
            None => {
                let gone = self
                    .active
                    .as_ref()
                    .is_some_and(|active| !active.file.path.exists());
                if gone {
                    info!("active session file disappeared");
                    self.detach();
                    self.usage.track_file(None);
                    self.notifier.notify(MonitorEvent::WatchStatus {
                        watching: true,
                        file: None,
                    });
                }
            }
        }
    }

    fn switch_to(&mut self, file: SessionFile, now: Instant) {
        self.detach();

        let cursor = TailCursor::attach(&file.path);
        let subscription = if self.push_enabled {
            self.subscribe(&file.path)
        } else {
            None
        };
        info!(
            session = %file.id,
            project = %file.project,
            offset = cursor.offset(),
            "switched active session"
        );

        self.notifier.notify(MonitorEvent::WatchStatus {
            watching: true,
            file: Some(file.file_name()),
        });
        self.usage.track_file(Some(&file.path));
        self.active = Some(ActiveTarget {
            file,
            cursor,
            _subscription: subscription,
        });
        self.refresh_usage(now, true);
    }

    /// Lines already tailed from the old target must not complete a turn on the next one.
    fn detach(&mut self) {
        self.classifier.cancel_pending();
        if let Some(previous) = self.active.take() {
            debug!(path = %previous.cursor.path().display(), "detached from session file");
        }
    }

    fn subscribe(&self, path: &Path) -> Option<RecommendedWatcher> {
        let tx = self.tx.clone();
        let target = path.to_path_buf();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                    let _ = tx.send(MonitorCommand::FileChanged(target.clone()));
                }
                Ok(_) => {}
                Err(err) => debug!(error = %err, "file watcher error"),
            }
        });

        match watcher.and_then(|mut watcher| {
            watcher.watch(path, RecursiveMode::NonRecursive)?;
            Ok(watcher)
        }) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "file change notifications unavailable, relying on polling"
                );
                None
            }
        }
    }

    fn tail_active(&mut self, now: Instant) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let lines = active.cursor.read_new();
        if lines.is_empty() {
            return;
        }

        let mut signals = Vec::new();
        for line in &lines {
            signals.extend(self.classifier.classify_line(line, now));
        }
        self.dispatch(signals);
    }

    fn dispatch(&mut self, signals: Vec<Signal>) {
        forward_signals(signals, &mut self.usage, &mut self.notifier);
    }

    fn refresh_usage(&mut self, now: Instant, force_context: bool) {
        let weekly_updated = self.usage.poll_weekly(now);
        let context_updated = self.usage.refresh_context(force_context);
        if let Some(reason) = self.usage.take_context_reset() {
            info!(?reason, "context reset detected");
            self.notifier.notify(MonitorEvent::ContextReset { reason });
        }
        if weekly_updated || context_updated {
            self.notifier
                .notify(MonitorEvent::UsageUpdate(self.usage.snapshot()));
        }
    }

    fn publish_sessions_list(&mut self) {
        let files = scan_session_files(&self.root, self.runtime.recent_window, &self.filter);
        let sessions = recent_sessions(&files, self.runtime.recent_limit);
        self.notifier.notify(MonitorEvent::SessionsList { sessions });
    }
}

/// Routes classifier output: visible signals to the notifier, usage facts to the aggregator.
/// Returns true when a finished turn reported usage.
pub(crate) fn forward_signals<N: Notifier>(
    signals: Vec<Signal>,
    usage: &mut UsageAggregator,
    notifier: &mut N,
) -> bool {
    let mut turn_finished = false;
    for signal in signals {
        match signal {
            Signal::StateChanged(change) => notifier.notify(MonitorEvent::StateChange(change)),
            Signal::ToolError { tool } => notifier.notify(MonitorEvent::ToolError { tool }),
            Signal::GitCommit { message } => {
                info!(%message, "commit detected");
                notifier.notify(MonitorEvent::GitCommit { message })
            }
            Signal::ModelObserved(model) => usage.observe_model(&model),
            Signal::TurnUsage(block) => {
                usage.observe_turn_usage(&block);
                turn_finished = true;
            }
        }
    }
    turn_finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::ChannelNotifier;
    use std::fs;
    use std::io::Write;
    use std::thread;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write_aged(path: &Path, content: &str, age: Duration) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write log");
        let file = fs::File::options().write(true).open(path).expect("open");
        file.set_modified(SystemTime::now() - age).expect("set mtime");
    }

    fn append(path: &Path, line: &str) {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(path)
            .expect("open append");
        writeln!(file, "{line}").expect("append");
    }

    fn session(root: &Path) -> MonitorSession<Vec<MonitorEvent>> {
        let runtime = RuntimeSettings {
            scan_every_ticks: 1,
            ..RuntimeSettings::default()
        };
        MonitorSession::new(root.to_path_buf(), &MonitorConfig::default(), runtime, Vec::new())
            .without_push()
    }

    fn watched_files(events: &[MonitorEvent]) -> Vec<Option<String>> {
        events
            .iter()
            .filter_map(|event| match event {
                MonitorEvent::WatchStatus {
                    watching: true,
                    file,
                } => Some(file.clone()),
                _ => None,
            })
            .collect()
    }

    fn state_changes(events: &[MonitorEvent]) -> Vec<(ActivityState, ActivityState)> {
        events
            .iter()
            .filter_map(|event| match event {
                MonitorEvent::StateChange(change) => Some((change.from, change.to)),
                _ => None,
            })
            .collect()
    }

    const PROMPT: &str = r#"{"type":"user","message":{"role":"user","content":"add a test"}}"#;
    const EDIT: &str = r#"{"type":"assistant","message":{"id":"m1","model":"claude-sonnet-4-5","content":[{"type":"tool_use","id":"t1","name":"Edit","input":{"file_path":"src/lib.rs"}}],"usage":{"input_tokens":50,"output_tokens":20,"cache_read_input_tokens":1000}}}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","usage":{"input_tokens":50,"output_tokens":20}}"#;

    #[test]
    fn growing_session_is_selected_and_drives_idle_thinking_coding() {
        let tmp = TempDir::new().expect("temp dir");
        let root = tmp.path();
        let a = root.join("proj/a.jsonl");
        let b = root.join("proj/b.jsonl");
        write_aged(&a, "{}\n", Duration::from_secs(600));
        write_aged(&b, "{}\n", Duration::from_secs(300));
        write_aged(&root.join("session-memory/c.jsonl"), "{}\n", Duration::from_secs(1));

        let mut monitor = session(root);
        let t0 = Instant::now();
        monitor.watch(t0);
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("b"));

        append(&b, PROMPT);
        monitor.tick(t0 + Duration::from_millis(500));
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("b"));

        append(&b, EDIT);
        monitor.tick(t0 + Duration::from_millis(1_000));

        let events = monitor.notifier();
        assert_eq!(
            state_changes(events),
            vec![
                (ActivityState::Idle, ActivityState::Thinking),
                (ActivityState::Thinking, ActivityState::Coding),
            ]
        );
        assert_eq!(monitor.state(), ActivityState::Coding);
        assert_eq!(
            watched_files(events),
            vec![None, Some("b.jsonl".to_string())]
        );
        let usage = events
            .iter()
            .rev()
            .find_map(|event| match event {
                MonitorEvent::UsageUpdate(usage) => Some(usage),
                _ => None,
            })
            .expect("usage update");
        assert_eq!(usage.current_session_context, 1_050);
        assert_eq!(usage.model.as_deref(), Some("claude-sonnet-4-5"));
    }

    #[test]
    fn history_before_attach_is_not_replayed() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("proj/s.jsonl");
        write_aged(&path, &format!("{PROMPT}\n{EDIT}\n"), Duration::from_secs(5));

        let mut monitor = session(tmp.path());
        let t0 = Instant::now();
        monitor.watch(t0);
        monitor.tick(t0 + Duration::from_secs(1));

        assert!(state_changes(monitor.notifier()).is_empty());
        assert_eq!(monitor.state(), ActivityState::Idle);
    }

    #[test]
    fn pin_switches_target_and_growth_cannot_steal_it() {
        let tmp = TempDir::new().expect("temp dir");
        let quiet = tmp.path().join("proj/quiet.jsonl");
        let busy = tmp.path().join("proj/busy.jsonl");
        write_aged(&quiet, "{}\n", Duration::from_secs(200));
        write_aged(&busy, "{}\n", Duration::from_secs(1));

        let mut monitor = session(tmp.path());
        let t0 = Instant::now();
        monitor.watch(t0);
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("busy"));

        monitor.select_session(Some("quiet".to_string()), t0);
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("quiet"));

        append(&busy, PROMPT);
        monitor.tick(t0 + Duration::from_secs(1));
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("quiet"));
        assert!(state_changes(monitor.notifier()).is_empty());

        monitor.select_session(None, t0 + Duration::from_secs(2));
        append(&busy, PROMPT);
        monitor.tick(t0 + Duration::from_secs(3));
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("busy"));
    }

    #[test]
    fn empty_root_reports_watching_without_file() {
        let tmp = TempDir::new().expect("temp dir");
        let mut monitor = session(tmp.path());
        let t0 = Instant::now();
        monitor.watch(t0);
        monitor.tick(t0 + Duration::from_secs(1));

        assert!(monitor.active_file().is_none());
        assert_eq!(watched_files(monitor.notifier()), vec![None]);
        assert!(monitor.notifier().iter().any(|event| matches!(
            event,
            MonitorEvent::SessionsList { sessions } if sessions.is_empty()
        )));
    }

    #[test]
    fn deleted_target_detaches_when_no_candidates_remain() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("proj/s.jsonl");
        write_aged(&path, "{}\n", Duration::from_secs(5));

        let mut monitor = session(tmp.path());
        let t0 = Instant::now();
        monitor.watch(t0);
        fs::remove_file(&path).expect("remove");
        monitor.tick(t0 + Duration::from_secs(1));

        assert!(monitor.active_file().is_none());
        assert_eq!(
            watched_files(monitor.notifier()),
            vec![None, Some("s.jsonl".to_string()), None]
        );
    }

    #[test]
    fn stale_push_events_are_ignored_and_unwatch_stops_ticks() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("proj/s.jsonl");
        write_aged(&path, "{}\n", Duration::from_secs(5));

        let mut monitor = session(tmp.path());
        let t0 = Instant::now();
        monitor.watch(t0);
        append(&path, PROMPT);
        monitor.on_file_changed(&tmp.path().join("proj/other.jsonl"), t0);
        assert!(state_changes(monitor.notifier()).is_empty());

        monitor.on_file_changed(&path, t0);
        assert_eq!(monitor.state(), ActivityState::Thinking);

        monitor.unwatch();
        assert!(!monitor.is_watching());
        let before = monitor.notifier().len();
        append(&path, EDIT);
        monitor.tick(t0 + Duration::from_secs(1));
        assert_eq!(monitor.notifier().len(), before);
        assert!(matches!(
            monitor.notifier().last(),
            Some(MonitorEvent::WatchStatus { watching: false, .. })
        ));
    }

    #[test]
    fn run_loop_exits_on_stop_command() {
        let tmp = TempDir::new().expect("temp dir");
        let mut monitor = session(tmp.path());
        let handle = monitor.handle();
        handle.select_session(Some("nothing".to_string()));
        handle.stop();

        monitor.run();

        assert!(!monitor.is_watching());
        let events = monitor.notifier();
        assert!(matches!(
            events.first(),
            Some(MonitorEvent::WatchStatus { watching: true, .. })
        ));
        assert!(matches!(
            events.last(),
            Some(MonitorEvent::WatchStatus { watching: false, .. })
        ));
    }

    #[test]
    fn pinned_session_outside_active_window_is_followed() {
        let tmp = TempDir::new().expect("temp dir");
        let old = tmp.path().join("proj/old.jsonl");
        let new = tmp.path().join("proj/new.jsonl");
        write_aged(&old, "{}\n", Duration::from_secs(2 * 3_600));
        write_aged(&new, "{}\n", Duration::from_secs(5));

        let mut monitor = session(tmp.path());
        let t0 = Instant::now();
        monitor.watch(t0);
        let offered: Vec<String> = monitor
            .notifier()
            .iter()
            .find_map(|event| match event {
                MonitorEvent::SessionsList { sessions } => {
                    Some(sessions.iter().map(|s| s.id.clone()).collect())
                }
                _ => None,
            })
            .expect("sessions list");
        assert_eq!(offered, vec!["new".to_string(), "old".to_string()]);
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("new"));

        monitor.select_session(Some("old".to_string()), t0);
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("old"));

        append(&new, PROMPT);
        monitor.tick(t0 + Duration::from_secs(1));
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("old"));

        append(&old, PROMPT);
        monitor.tick(t0 + Duration::from_secs(2));
        assert_eq!(monitor.state(), ActivityState::Thinking);
    }

    #[test]
    fn switching_target_drops_pending_completion() {
        let tmp = TempDir::new().expect("temp dir");
        let a = tmp.path().join("proj/a.jsonl");
        let b = tmp.path().join("proj/b.jsonl");
        write_aged(&a, "{}\n", Duration::from_secs(5));
        write_aged(&b, "{}\n", Duration::from_secs(600));

        let mut monitor = session(tmp.path());
        let t0 = Instant::now();
        monitor.watch(t0);
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("a"));

        append(&a, EDIT);
        append(&a, RESULT);
        monitor.tick(t0);
        assert_eq!(monitor.state(), ActivityState::Coding);

        monitor.select_session(Some("b".to_string()), t0);
        assert_eq!(monitor.active_file().map(|f| f.id.as_str()), Some("b"));

        monitor.tick(t0 + Duration::from_secs(4));
        assert_eq!(monitor.state(), ActivityState::Coding);
        assert!(
            !state_changes(monitor.notifier())
                .iter()
                .any(|(_, to)| *to == ActivityState::Done)
        );
    }

    #[test]
    fn file_change_notification_delivers_lines_between_ticks() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("proj/s.jsonl");
        write_aged(&path, "{}\n", Duration::from_secs(5));

        // no poll tick lands during the test, so only the watcher can deliver the line
        let runtime = RuntimeSettings {
            poll_interval: Duration::from_secs(600),
            ..RuntimeSettings::default()
        };
        let (tx, rx) = mpsc::channel();
        let mut monitor = MonitorSession::new(
            tmp.path().to_path_buf(),
            &MonitorConfig::default(),
            runtime,
            ChannelNotifier::new(tx),
        );
        let handle = monitor.handle();
        let worker = thread::spawn(move || monitor.run());

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut attached = false;
        let mut thinking = false;
        while Instant::now() < deadline && !thinking {
            let Ok(event) = rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
            else {
                break;
            };
            match event {
                MonitorEvent::WatchStatus {
                    file: Some(file), ..
                } if !attached => {
                    assert_eq!(file, "s.jsonl");
                    attached = true;
                    append(&path, PROMPT);
                }
                MonitorEvent::StateChange(change) if change.to == ActivityState::Thinking => {
                    thinking = true;
                }
                _ => {}
            }
        }

        handle.stop();
        worker.join().expect("monitor thread");
        assert!(attached);
        assert!(thinking);
    }
}
