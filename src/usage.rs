use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{MonitorConfig, RuntimeSettings, UsageLimits};
use crate::event::{EventEnvelope, UsageBlock, parse_line};
use crate::scanner::{ScanFilter, scan_session_files_at};

/// Share of the context budget a drop must exceed to count as a compaction.
const COMPACTION_DROP_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub output_tokens: u64,
    pub input_tokens: u64,
    pub model_family_output_tokens: u64,
    pub message_count: u64,
    pub last_input_tokens: u64,
    pub output_by_model: BTreeMap<String, u64>,
}

/// Folds events of one file into a [`UsageSnapshot`].
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    family_marker: String,
    current_model: Option<String>,
    seen_messages: HashSet<String>,
    snapshot: UsageSnapshot,
}

impl UsageAccumulator {
    pub fn new(family_marker: &str) -> Self {
        Self {
            family_marker: family_marker.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn apply_line(&mut self, line: &str) {
        if let Some(event) = parse_line(line) {
            self.apply(&event);
        }
    }

    pub fn apply(&mut self, event: &EventEnvelope) {
        if let Some(model) = event.model() {
            self.current_model = Some(model.to_string());
        }
        if !matches!(event, EventEnvelope::Assistant(_)) {
            return;
        }
        let Some(usage) = event.usage() else {
            return;
        };
        if let Some(id) = event.message_id()
            && !self.seen_messages.insert(id.to_string())
        {
            return;
        }

        let output = usage.output();
        let snapshot = &mut self.snapshot;
        snapshot.output_tokens = snapshot.output_tokens.saturating_add(output);
        snapshot.input_tokens = snapshot.input_tokens.saturating_add(usage.billed_input());
        snapshot.message_count += 1;
        snapshot.last_input_tokens = usage.context_tokens();

        if let Some(model) = self.current_model.as_deref() {
            if !self.family_marker.is_empty()
                && model.to_ascii_lowercase().contains(&self.family_marker)
            {
                snapshot.model_family_output_tokens =
                    snapshot.model_family_output_tokens.saturating_add(output);
            }
            let entry = snapshot
                .output_by_model
                .entry(model.to_string())
                .or_insert(0);
            *entry = entry.saturating_add(output);
        }
    }

    pub fn current_model(&self) -> Option<&str> {
        self.current_model.as_deref()
    }

    pub fn snapshot(&self) -> &UsageSnapshot {
        &self.snapshot
    }

    pub fn finish(self) -> UsageSnapshot {
        self.snapshot
    }
}

/// Streams one file; unreadable files count as empty.
pub fn compute_file_usage(path: &Path, family_marker: &str) -> UsageSnapshot {
    let mut accumulator = UsageAccumulator::new(family_marker);
    match File::open(path) {
        Ok(file) => {
            read_lines(BufReader::new(file), &mut accumulator, true);
        }
        Err(err) => debug!(path = %path.display(), error = %err, "skipping unreadable log"),
    }
    accumulator.finish()
}

/// Applies newline-terminated lines and returns the bytes they covered. A trailing
/// unterminated line is applied only when `include_partial` is set and never counted.
fn read_lines<R: Read>(
    mut reader: BufReader<R>,
    accumulator: &mut UsageAccumulator,
    include_partial: bool,
) -> u64 {
    let mut consumed = 0;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(read) => {
                let complete = buf.last() == Some(&b'\n');
                if complete || include_partial {
                    accumulator.apply_line(&String::from_utf8_lossy(&buf));
                }
                if !complete {
                    break;
                }
                consumed += read as u64;
            }
            Err(err) => {
                debug!(error = %err, "stopped reading usage lines");
                break;
            }
        }
    }
    consumed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindows {
    pub session: Duration,
    pub weekly: Duration,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct WeeklyUsage {
    pub session_tokens: u64,
    pub weekly_tokens: u64,
    pub model_family_weekly: u64,
    pub weekly_by_model: BTreeMap<String, u64>,
    pub files_scanned: usize,
}

/// Reads every log in the weekly window. Expensive.
pub fn compute_weekly_usage(
    root: &Path,
    filter: &ScanFilter,
    windows: UsageWindows,
    family_marker: &str,
    now: SystemTime,
) -> WeeklyUsage {
    let files = scan_session_files_at(root, windows.weekly, filter, now);
    let session_cutoff = now
        .checked_sub(windows.session)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut weekly = WeeklyUsage {
        files_scanned: files.len(),
        ..WeeklyUsage::default()
    };
    for file in &files {
        let usage = compute_file_usage(&file.path, family_marker);
        weekly.weekly_tokens = weekly.weekly_tokens.saturating_add(usage.output_tokens);
        weekly.model_family_weekly = weekly
            .model_family_weekly
            .saturating_add(usage.model_family_output_tokens);
        if file.mtime >= session_cutoff {
            weekly.session_tokens = weekly.session_tokens.saturating_add(usage.output_tokens);
        }
        for (model, tokens) in usage.output_by_model {
            let entry = weekly.weekly_by_model.entry(model).or_insert(0);
            *entry = entry.saturating_add(tokens);
        }
    }
    debug!(
        files = weekly.files_scanned,
        weekly_tokens = weekly.weekly_tokens,
        "weekly usage computed"
    );
    weekly
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct UsageGauge {
    pub used_tokens: u64,
    pub limit_tokens: u64,
    pub used_percent: f64,
    pub remaining_percent: f64,
}

impl UsageGauge {
    pub fn new(used_tokens: u64, limit_tokens: u64) -> Self {
        let used_percent = if limit_tokens == 0 {
            0.0
        } else {
            (used_tokens as f64 / limit_tokens as f64 * 100.0).clamp(0.0, 100.0)
        };
        Self {
            used_tokens,
            limit_tokens,
            used_percent,
            remaining_percent: 100.0 - used_percent,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct UsageGauges {
    pub session: UsageGauge,
    pub weekly: UsageGauge,
    pub model_family_weekly: UsageGauge,
    pub context: UsageGauge,
}

/// Weekly figures and the live context size, always published together.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AggregateUsage {
    pub session_tokens: u64,
    pub weekly_tokens: u64,
    pub sonnet_weekly: u64,
    pub current_session_context: u64,
    pub weekly_by_model: BTreeMap<String, u64>,
    pub model: Option<String>,
    pub last_turn_output_tokens: Option<u64>,
    pub gauges: UsageGauges,
    pub weekly_computed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextResetReason {
    Compacted,
    Full,
}

#[derive(Debug, Clone)]
pub struct UsageSettings {
    pub root: PathBuf,
    pub filter: ScanFilter,
    pub family_marker: String,
    pub windows: UsageWindows,
    pub ttl: Duration,
    pub limits: UsageLimits,
}

impl UsageSettings {
    pub fn new(root: PathBuf, config: &MonitorConfig, runtime: &RuntimeSettings) -> Self {
        Self {
            root,
            filter: ScanFilter::from_markers(&config.markers),
            family_marker: config.markers.model_family.clone(),
            windows: UsageWindows {
                session: runtime.session_window,
                weekly: runtime.recent_window,
            },
            ttl: runtime.usage_ttl,
            limits: config.limits,
        }
    }

    fn compute_weekly(&self) -> WeeklyUsage {
        compute_weekly_usage(
            &self.root,
            &self.filter,
            self.windows,
            &self.family_marker,
            SystemTime::now(),
        )
    }
}

/// Incremental reader over the tailed file's usage; only complete lines are consumed.
#[derive(Debug, Default)]
struct ContextTracker {
    path: Option<PathBuf>,
    cursor: u64,
    observed_size: Option<u64>,
    accumulator: UsageAccumulator,
    tokens: u64,
}

impl ContextTracker {
    fn reset(&mut self, path: Option<PathBuf>, family_marker: &str) {
        *self = Self {
            path,
            accumulator: UsageAccumulator::new(family_marker),
            ..Self::default()
        };
    }
}

#[derive(Debug)]
pub struct UsageAggregator {
    settings: UsageSettings,
    weekly: WeeklyUsage,
    weekly_computed_at: Option<Instant>,
    weekly_computed_wall: Option<DateTime<Utc>>,
    worker: Option<Receiver<WeeklyUsage>>,
    context: ContextTracker,
    model: Option<String>,
    last_turn_output: Option<u64>,
    pending_reset: Option<ContextResetReason>,
}

impl UsageAggregator {
    pub fn new(settings: UsageSettings) -> Self {
        let mut context = ContextTracker::default();
        context.reset(None, &settings.family_marker);
        Self {
            settings,
            weekly: WeeklyUsage::default(),
            weekly_computed_at: None,
            weekly_computed_wall: None,
            worker: None,
            context,
            model: None,
            last_turn_output: None,
            pending_reset: None,
        }
    }

    pub fn observe_model(&mut self, model: &str) {
        self.model = Some(model.to_string());
    }

    /// Records a finished turn and forces the next context refresh to re-check the file.
    pub fn observe_turn_usage(&mut self, usage: &UsageBlock) {
        self.last_turn_output = Some(usage.output());
        self.context.observed_size = None;
    }

    /// Switches the context tracker to another file and expires the weekly cache.
    pub fn track_file(&mut self, path: Option<&Path>) {
        self.context
            .reset(path.map(Path::to_path_buf), &self.settings.family_marker);
        self.invalidate();
    }

    pub fn invalidate(&mut self) {
        self.weekly_computed_at = None;
    }

    pub fn weekly_is_stale(&self, now: Instant) -> bool {
        self.weekly_computed_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.settings.ttl)
    }

    /// Collects a finished background computation, or starts one when the cache is stale.
    /// Returns true when new weekly figures landed.
    pub fn poll_weekly(&mut self, now: Instant) -> bool {
        if let Some(rx) = &self.worker {
            match rx.try_recv() {
                Ok(weekly) => {
                    self.worker = None;
                    self.store_weekly(weekly, now);
                    return true;
                }
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => {
                    warn!("weekly usage worker exited without a result");
                    self.worker = None;
                }
            }
        }

        if self.weekly_is_stale(now) {
            self.spawn_weekly_worker(now);
        }
        false
    }

    pub fn refresh_weekly_blocking(&mut self, now: Instant) {
        let weekly = self.settings.compute_weekly();
        self.worker = None;
        self.store_weekly(weekly, now);
    }

    fn store_weekly(&mut self, weekly: WeeklyUsage, now: Instant) {
        self.weekly = weekly;
        self.weekly_computed_at = Some(now);
        self.weekly_computed_wall = Some(Utc::now());
    }

    fn spawn_weekly_worker(&mut self, now: Instant) {
        let (tx, rx) = mpsc::channel();
        let settings = self.settings.clone();
        let spawned = thread::Builder::new()
            .name("weekly-usage".to_string())
            .spawn(move || {
                let _ = tx.send(settings.compute_weekly());
            });
        match spawned {
            Ok(_) => self.worker = Some(rx),
            Err(err) => {
                warn!(error = %err, "failed to spawn weekly usage worker");
                // back off for one TTL instead of retrying every tick
                self.weekly_computed_at = Some(now);
            }
        }
    }

    /// Reads new usage from the tracked file when it changed size, or from scratch when forced.
    /// Returns true when the context figure was recomputed.
    pub fn refresh_context(&mut self, force: bool) -> bool {
        let Some(path) = self.context.path.clone() else {
            return false;
        };
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "context file unavailable");
                return false;
            }
        };
        if !force && self.context.observed_size == Some(size) {
            return false;
        }
        if force || size < self.context.cursor {
            self.context.reset(Some(path.clone()), &self.settings.family_marker);
        }

        let previous = self.context.tokens;
        match File::open(&path) {
            Ok(mut file) => {
                if let Err(err) = file.seek(SeekFrom::Start(self.context.cursor)) {
                    debug!(path = %path.display(), error = %err, "context seek failed");
                    return false;
                }
                let unread = size.saturating_sub(self.context.cursor);
                self.context.cursor += read_lines(
                    BufReader::new(file.take(unread)),
                    &mut self.context.accumulator,
                    false,
                );
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "context open failed");
                return false;
            }
        }
        self.context.observed_size = Some(size);
        self.context.tokens = self.context.accumulator.snapshot().last_input_tokens;
        if let Some(model) = self.context.accumulator.current_model() {
            self.model = Some(model.to_string());
        }
        self.detect_reset(previous, self.context.tokens);
        true
    }

    fn detect_reset(&mut self, previous: u64, current: u64) {
        let limit = self.settings.limits.context_tokens;
        if limit == 0 {
            return;
        }
        let drop_threshold = limit as f64 * COMPACTION_DROP_RATIO;
        if current < previous && (previous - current) as f64 > drop_threshold {
            self.pending_reset = Some(ContextResetReason::Compacted);
        } else if current >= limit && previous < limit {
            self.pending_reset = Some(ContextResetReason::Full);
        }
    }

    pub fn take_context_reset(&mut self) -> Option<ContextResetReason> {
        self.pending_reset.take()
    }

    pub fn context_tokens(&self) -> u64 {
        self.context.tokens
    }

    pub fn snapshot(&self) -> AggregateUsage {
        let limits = &self.settings.limits;
        AggregateUsage {
            session_tokens: self.weekly.session_tokens,
            weekly_tokens: self.weekly.weekly_tokens,
            sonnet_weekly: self.weekly.model_family_weekly,
            current_session_context: self.context.tokens,
            weekly_by_model: self.weekly.weekly_by_model.clone(),
            model: self.model.clone(),
            last_turn_output_tokens: self.last_turn_output,
            gauges: UsageGauges {
                session: UsageGauge::new(self.weekly.session_tokens, limits.session_tokens),
                weekly: UsageGauge::new(self.weekly.weekly_tokens, limits.weekly_tokens),
                model_family_weekly: UsageGauge::new(
                    self.weekly.model_family_weekly,
                    limits.model_family_weekly_tokens,
                ),
                context: UsageGauge::new(self.context.tokens, limits.context_tokens),
            },
            weekly_computed_at: self.weekly_computed_wall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn assistant(id: &str, model: &str, input: u64, output: u64, cache_read: u64) -> String {
        format!(
            r#"{{"type":"assistant","message":{{"id":"{id}","model":"{model}","content":[],"usage":{{"input_tokens":{input},"output_tokens":{output},"cache_read_input_tokens":{cache_read},"cache_creation_input_tokens":0}}}}}}"#
        )
    }

    fn write_log(path: &Path, lines: &[String], age: Duration) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(path, body).expect("write log");
        let file = File::options().write(true).open(path).expect("open");
        file.set_modified(SystemTime::now() - age).expect("set mtime");
    }

    fn settings(root: &Path) -> UsageSettings {
        UsageSettings::new(
            root.to_path_buf(),
            &MonitorConfig::default(),
            &RuntimeSettings::default(),
        )
    }

    #[test]
    fn last_input_tokens_is_last_turn_not_sum() {
        let mut acc = UsageAccumulator::new("sonnet");
        for (i, input) in [100_u64, 150, 400].into_iter().enumerate() {
            acc.apply_line(&assistant(&format!("m{i}"), "claude-opus-4", input, 10, 0));
        }
        let snapshot = acc.finish();
        assert_eq!(snapshot.last_input_tokens, 400);
        assert_eq!(snapshot.input_tokens, 650);
        assert_eq!(snapshot.output_tokens, 30);
        assert_eq!(snapshot.message_count, 3);
    }

    #[test]
    fn family_tokens_follow_active_model() {
        let mut acc = UsageAccumulator::new("sonnet");
        acc.apply_line(r#"{"type":"system","model":"claude-sonnet-4-5"}"#);
        acc.apply_line(
            r#"{"type":"assistant","message":{"id":"a","content":[],"usage":{"output_tokens":7}}}"#,
        );
        acc.apply_line(&assistant("b", "claude-opus-4-1", 1, 5, 0));
        acc.apply_line(&assistant("c", "Claude-Sonnet-4", 1, 3, 0));

        let snapshot = acc.finish();
        assert_eq!(snapshot.model_family_output_tokens, 10);
        assert_eq!(snapshot.output_by_model.get("claude-opus-4-1"), Some(&5));
        assert_eq!(snapshot.output_by_model.get("claude-sonnet-4-5"), Some(&7));
    }

    #[test]
    fn repeated_message_ids_count_once() {
        let mut acc = UsageAccumulator::new("sonnet");
        acc.apply_line(&assistant("dup", "claude-sonnet-4", 10, 4, 90));
        acc.apply_line(&assistant("dup", "claude-sonnet-4", 10, 4, 90));
        acc.apply_line("garbage");
        let snapshot = acc.finish();
        assert_eq!(snapshot.output_tokens, 4);
        assert_eq!(snapshot.message_count, 1);
        assert_eq!(snapshot.last_input_tokens, 100);
    }

    #[test]
    fn weekly_usage_splits_session_and_week_windows() {
        let tmp = TempDir::new().expect("temp dir");
        let root = tmp.path();
        write_log(
            &root.join("p/recent.jsonl"),
            &[assistant("r", "claude-sonnet-4", 1, 100, 0)],
            Duration::from_secs(3_600),
        );
        write_log(
            &root.join("p/days.jsonl"),
            &[assistant("d", "claude-opus-4", 1, 1_000, 0)],
            Duration::from_secs(3 * 86_400),
        );
        write_log(
            &root.join("p/ancient.jsonl"),
            &[assistant("x", "claude-opus-4", 1, 50_000, 0)],
            Duration::from_secs(30 * 86_400),
        );

        let weekly = settings(root).compute_weekly();

        assert_eq!(weekly.files_scanned, 2);
        assert_eq!(weekly.weekly_tokens, 1_100);
        assert_eq!(weekly.session_tokens, 100);
        assert_eq!(weekly.model_family_weekly, 100);
        assert_eq!(weekly.weekly_by_model.get("claude-opus-4"), Some(&1_000));
    }

    #[test]
    fn weekly_cache_honours_ttl_and_invalidation() {
        let tmp = TempDir::new().expect("temp dir");
        let mut aggregator = UsageAggregator::new(settings(tmp.path()));
        let t0 = Instant::now();
        assert!(aggregator.weekly_is_stale(t0));

        aggregator.refresh_weekly_blocking(t0);
        assert!(!aggregator.weekly_is_stale(t0 + Duration::from_secs(59)));
        assert!(aggregator.weekly_is_stale(t0 + Duration::from_secs(60)));

        aggregator.refresh_weekly_blocking(t0);
        aggregator.invalidate();
        assert!(aggregator.weekly_is_stale(t0));
    }

    #[test]
    fn background_weekly_worker_delivers_result() {
        let tmp = TempDir::new().expect("temp dir");
        write_log(
            &tmp.path().join("p/a.jsonl"),
            &[assistant("a", "claude-sonnet-4", 1, 42, 0)],
            Duration::from_secs(60),
        );
        let mut aggregator = UsageAggregator::new(settings(tmp.path()));
        let t0 = Instant::now();

        assert!(!aggregator.poll_weekly(t0));
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut landed = false;
        while Instant::now() < deadline {
            if aggregator.poll_weekly(t0) {
                landed = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert!(landed);
        assert_eq!(aggregator.snapshot().weekly_tokens, 42);
        assert!(aggregator.snapshot().weekly_computed_at.is_some());
        assert!(!aggregator.poll_weekly(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn context_refresh_reads_only_appended_complete_lines() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("p/live.jsonl");
        write_log(
            &path,
            &[assistant("a", "claude-sonnet-4", 100, 1, 0)],
            Duration::ZERO,
        );
        let mut aggregator = UsageAggregator::new(settings(tmp.path()));
        aggregator.track_file(Some(&path));

        assert!(aggregator.refresh_context(true));
        assert_eq!(aggregator.context_tokens(), 100);
        assert!(!aggregator.refresh_context(false));

        let mut file = fs::OpenOptions::new().append(true).open(&path).expect("open");
        let next = assistant("b", "claude-sonnet-4", 150, 1, 250);
        file.write_all(next[..20].as_bytes()).expect("partial");
        assert!(aggregator.refresh_context(false));
        assert_eq!(aggregator.context_tokens(), 100);

        file.write_all(next[20..].as_bytes()).expect("rest");
        file.write_all(b"\n").expect("newline");
        assert!(aggregator.refresh_context(false));
        assert_eq!(aggregator.context_tokens(), 400);
        assert_eq!(aggregator.snapshot().model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(aggregator.snapshot().gauges.context.limit_tokens, 167_000);
    }

    #[test]
    fn large_context_drop_is_reported_as_compaction() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("p/live.jsonl");
        write_log(
            &path,
            &[assistant("a", "claude-sonnet-4", 10, 1, 150_000)],
            Duration::ZERO,
        );
        let mut aggregator = UsageAggregator::new(settings(tmp.path()));
        aggregator.track_file(Some(&path));
        aggregator.refresh_context(true);
        assert_eq!(aggregator.take_context_reset(), None);

        let mut file = fs::OpenOptions::new().append(true).open(&path).expect("open");
        writeln!(file, "{}", assistant("b", "claude-sonnet-4", 10, 1, 20_000)).expect("append");
        aggregator.refresh_context(false);

        assert_eq!(
            aggregator.take_context_reset(),
            Some(ContextResetReason::Compacted)
        );
        assert_eq!(aggregator.take_context_reset(), None);
    }

    #[test]
    fn crossing_the_budget_is_reported_as_full() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("p/live.jsonl");
        write_log(
            &path,
            &[assistant("a", "claude-sonnet-4", 10, 1, 150_000)],
            Duration::ZERO,
        );
        let mut aggregator = UsageAggregator::new(settings(tmp.path()));
        aggregator.track_file(Some(&path));
        aggregator.refresh_context(true);

        let mut file = fs::OpenOptions::new().append(true).open(&path).expect("open");
        writeln!(file, "{}", assistant("b", "claude-sonnet-4", 10, 1, 170_000)).expect("append");
        aggregator.refresh_context(false);

        assert_eq!(aggregator.take_context_reset(), Some(ContextResetReason::Full));
        let gauge = aggregator.snapshot().gauges.context;
        assert_eq!(gauge.used_percent, 100.0);
        assert_eq!(gauge.remaining_percent, 0.0);
    }

    #[test]
    fn file_already_over_budget_reports_full_on_first_read() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("p/live.jsonl");
        write_log(
            &path,
            &[assistant("a", "claude-sonnet-4", 10, 1, 180_000)],
            Duration::ZERO,
        );
        let mut aggregator = UsageAggregator::new(settings(tmp.path()));
        aggregator.track_file(Some(&path));
        aggregator.refresh_context(true);

        assert_eq!(aggregator.take_context_reset(), Some(ContextResetReason::Full));
        assert_eq!(aggregator.take_context_reset(), None);
    }

    #[test]
    fn gauge_handles_zero_limit() {
        let gauge = UsageGauge::new(10, 0);
        assert_eq!(gauge.used_percent, 0.0);
        assert_eq!(gauge.remaining_percent, 100.0);
        assert_eq!(UsageGauge::new(225_000, 450_000).used_percent, 50.0);
    }
}
