use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_POLL_MILLIS: u64 = 500;
const DEFAULT_SCAN_EVERY_TICKS: u64 = 10;
const DEFAULT_SESSIONS_EVERY_TICKS: u64 = 60;
const DEFAULT_ACTIVE_WINDOW_SECONDS: u64 = 30 * 60;
const DEFAULT_RECENT_WINDOW_SECONDS: u64 = 7 * 24 * 3_600;
const DEFAULT_SESSION_WINDOW_SECONDS: u64 = 5 * 3_600;
const DEFAULT_USAGE_TTL_SECONDS: u64 = 60;
const MIN_USAGE_TTL_SECONDS: u64 = 5;
const DEFAULT_DONE_DEBOUNCE_MILLIS: u64 = 3_000;
const DEFAULT_INACTIVITY_SECONDS: u64 = 120;
const DEFAULT_SETTLE_SECONDS: u64 = 60;
const DEFAULT_RECENT_LIMIT: u64 = 20;
const CONFIG_SCHEMA_VERSION: u32 = 1;
const CONFIG_FILE_NAME: &str = "agent-pulse.json";

const DEFAULT_CODING_TOOLS: [&str; 9] = [
    "Edit",
    "Write",
    "Bash",
    "Read",
    "Glob",
    "Grep",
    "NotebookEdit",
    "WebFetch",
    "WebSearch",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub schema_version: u32,
    pub limits: UsageLimits,
    pub tools: ToolsConfig,
    pub markers: MarkerConfig,
}

/// Token budgets each usage window is measured against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UsageLimits {
    pub session_tokens: u64,
    pub weekly_tokens: u64,
    pub model_family_weekly_tokens: u64,
    pub context_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    pub coding: BTreeSet<String>,
    pub delegation: BTreeSet<String>,
    pub planning: BTreeSet<String>,
    pub exit_planning: BTreeSet<String>,
    pub shell: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MarkerConfig {
    pub model_family: String,
    pub excluded_dir: String,
    pub subagent: String,
    pub interrupt: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub scan_every_ticks: u64,
    pub sessions_every_ticks: u64,
    pub active_window: Duration,
    pub recent_window: Duration,
    pub session_window: Duration,
    pub usage_ttl: Duration,
    pub done_debounce: Duration,
    pub inactivity_timeout: Duration,
    pub settle_timeout: Duration,
    pub recent_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            limits: UsageLimits::default(),
            tools: ToolsConfig::default(),
            markers: MarkerConfig::default(),
        }
    }
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            session_tokens: 450_000,
            weekly_tokens: 5_000_000,
            model_family_weekly_tokens: 2_000_000,
            context_tokens: 167_000,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            coding: name_set(&DEFAULT_CODING_TOOLS),
            delegation: name_set(&["Task"]),
            planning: name_set(&["EnterPlanMode"]),
            exit_planning: name_set(&["ExitPlanMode"]),
            shell: "Bash".to_string(),
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            model_family: "sonnet".to_string(),
            excluded_dir: "session-memory".to_string(),
            subagent: "subagent".to_string(),
            interrupt: "[Request interrupted".to_string(),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_MILLIS),
            scan_every_ticks: DEFAULT_SCAN_EVERY_TICKS,
            sessions_every_ticks: DEFAULT_SESSIONS_EVERY_TICKS,
            active_window: Duration::from_secs(DEFAULT_ACTIVE_WINDOW_SECONDS),
            recent_window: Duration::from_secs(DEFAULT_RECENT_WINDOW_SECONDS),
            session_window: Duration::from_secs(DEFAULT_SESSION_WINDOW_SECONDS),
            usage_ttl: Duration::from_secs(DEFAULT_USAGE_TTL_SECONDS),
            done_debounce: Duration::from_millis(DEFAULT_DONE_DEBOUNCE_MILLIS),
            inactivity_timeout: Duration::from_secs(DEFAULT_INACTIVITY_SECONDS),
            settle_timeout: Duration::from_secs(DEFAULT_SETTLE_SECONDS),
            recent_limit: DEFAULT_RECENT_LIMIT as usize,
        }
    }
}

impl MonitorConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(cfg_path: &Path) -> Result<Self> {
        if cfg_path.exists() {
            let raw = fs::read_to_string(cfg_path)
                .with_context(|| format!("failed to read {}", cfg_path.display()))?;
            let mut parsed: MonitorConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", cfg_path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_to(cfg_path)?;
            }
            Ok(parsed)
        } else {
            let cfg = MonitorConfig::default();
            cfg.save_to(cfg_path)?;
            Ok(cfg)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        let default_limits = UsageLimits::default();
        for (value, fallback) in [
            (&mut self.limits.session_tokens, default_limits.session_tokens),
            (&mut self.limits.weekly_tokens, default_limits.weekly_tokens),
            (
                &mut self.limits.model_family_weekly_tokens,
                default_limits.model_family_weekly_tokens,
            ),
            (&mut self.limits.context_tokens, default_limits.context_tokens),
        ] {
            if *value == 0 {
                *value = fallback;
                changed = true;
            }
        }

        let default_tools = ToolsConfig::default();
        for (set, fallback) in [
            (&mut self.tools.coding, default_tools.coding),
            (&mut self.tools.delegation, default_tools.delegation),
            (&mut self.tools.planning, default_tools.planning),
            (&mut self.tools.exit_planning, default_tools.exit_planning),
        ] {
            if normalize_name_set(set, fallback) {
                changed = true;
            }
        }
        if normalize_string(&mut self.tools.shell, &default_tools.shell) {
            changed = true;
        }

        let default_markers = MarkerConfig::default();
        if self.markers.model_family.chars().any(|c| c.is_ascii_uppercase()) {
            self.markers.model_family.make_ascii_lowercase();
            changed = true;
        }
        for (value, fallback) in [
            (&mut self.markers.model_family, &default_markers.model_family),
            (&mut self.markers.excluded_dir, &default_markers.excluded_dir),
            (&mut self.markers.subagent, &default_markers.subagent),
            (&mut self.markers.interrupt, &default_markers.interrupt),
        ] {
            if normalize_string(value, fallback) {
                changed = true;
            }
        }

        changed
    }
}

pub fn runtime_settings() -> RuntimeSettings {
    let usage_ttl = env_u64("AGENT_PULSE_USAGE_TTL_SECONDS", DEFAULT_USAGE_TTL_SECONDS)
        .max(MIN_USAGE_TTL_SECONDS);
    RuntimeSettings {
        poll_interval: env_millis("AGENT_PULSE_POLL_MILLIS", DEFAULT_POLL_MILLIS),
        scan_every_ticks: env_u64("AGENT_PULSE_SCAN_EVERY_TICKS", DEFAULT_SCAN_EVERY_TICKS),
        sessions_every_ticks: env_u64(
            "AGENT_PULSE_SESSIONS_EVERY_TICKS",
            DEFAULT_SESSIONS_EVERY_TICKS,
        ),
        active_window: env_secs("AGENT_PULSE_ACTIVE_WINDOW_SECONDS", DEFAULT_ACTIVE_WINDOW_SECONDS),
        recent_window: env_secs("AGENT_PULSE_RECENT_WINDOW_SECONDS", DEFAULT_RECENT_WINDOW_SECONDS),
        session_window: env_secs(
            "AGENT_PULSE_SESSION_WINDOW_SECONDS",
            DEFAULT_SESSION_WINDOW_SECONDS,
        ),
        usage_ttl: Duration::from_secs(usage_ttl),
        done_debounce: env_millis("AGENT_PULSE_DONE_DEBOUNCE_MILLIS", DEFAULT_DONE_DEBOUNCE_MILLIS),
        inactivity_timeout: env_secs("AGENT_PULSE_INACTIVITY_SECONDS", DEFAULT_INACTIVITY_SECONDS),
        settle_timeout: env_secs("AGENT_PULSE_SETTLE_SECONDS", DEFAULT_SETTLE_SECONDS),
        recent_limit: env_u64("AGENT_PULSE_RECENT_LIMIT", DEFAULT_RECENT_LIMIT) as usize,
    }
}

pub fn claude_home() -> PathBuf {
    if let Ok(custom) = env::var("CLAUDE_CONFIG_DIR") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

pub fn projects_root() -> PathBuf {
    claude_home().join("projects")
}

pub fn resolve_root(flag: Option<&Path>) -> PathBuf {
    flag.filter(|path| !path.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(projects_root)
}

pub fn config_path() -> PathBuf {
    claude_home().join(CONFIG_FILE_NAME)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_u64(name, default))
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(env_u64(name, default))
}

fn name_set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn normalize_name_set(set: &mut BTreeSet<String>, fallback: BTreeSet<String>) -> bool {
    let normalized: BTreeSet<String> = set
        .iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    let normalized = if normalized.is_empty() {
        fallback
    } else {
        normalized
    };
    if *set != normalized {
        *set = normalized;
        return true;
    }
    false
}

fn normalize_string(value: &mut String, fallback: &str) -> bool {
    let trimmed = value.trim();
    let normalized = (if trimmed.is_empty() { fallback } else { trimmed }).to_string();
    if *value != normalized {
        *value = normalized;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_cover_known_tool_sets() {
        let cfg = MonitorConfig::default();
        assert!(cfg.tools.coding.contains("Bash"));
        assert!(cfg.tools.coding.contains("WebSearch"));
        assert!(cfg.tools.delegation.contains("Task"));
        assert_eq!(cfg.tools.shell, "Bash");
        assert_eq!(cfg.limits.context_tokens, 167_000);
        assert_eq!(cfg.markers.interrupt, "[Request interrupted");
    }

    #[test]
    fn migration_fills_empty_values_and_lowercases_family() {
        let mut cfg = MonitorConfig {
            schema_version: 0,
            limits: UsageLimits {
                weekly_tokens: 0,
                ..UsageLimits::default()
            },
            tools: ToolsConfig {
                coding: BTreeSet::new(),
                delegation: name_set(&[" Task ", ""]),
                shell: "  ".to_string(),
                ..ToolsConfig::default()
            },
            markers: MarkerConfig {
                model_family: " Sonnet ".to_string(),
                subagent: String::new(),
                ..MarkerConfig::default()
            },
        };

        assert!(cfg.normalize_and_migrate());
        assert_eq!(cfg.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(cfg.limits.weekly_tokens, 5_000_000);
        assert_eq!(cfg.tools.coding, ToolsConfig::default().coding);
        assert_eq!(cfg.tools.delegation, name_set(&["Task"]));
        assert_eq!(cfg.tools.shell, "Bash");
        assert_eq!(cfg.markers.model_family, "sonnet");
        assert_eq!(cfg.markers.subagent, "subagent");
        assert!(!cfg.normalize_and_migrate());
    }

    #[test]
    fn load_or_init_writes_defaults_then_reads_partial_file() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("nested").join(CONFIG_FILE_NAME);

        let created = MonitorConfig::load_or_init_at(&path).expect("init");
        assert_eq!(created, MonitorConfig::default());
        assert!(path.exists());

        fs::write(&path, r#"{"schema_version":1,"limits":{"context_tokens":200000}}"#)
            .expect("write partial");
        let loaded = MonitorConfig::load_or_init_at(&path).expect("load");
        assert_eq!(loaded.limits.context_tokens, 200_000);
        assert_eq!(loaded.limits.session_tokens, 450_000);
        assert_eq!(loaded.tools, ToolsConfig::default());
    }

    #[test]
    fn invalid_config_json_is_reported() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{not json").expect("write");
        let err = MonitorConfig::load_or_init_at(&path).expect_err("invalid json");
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[test]
    fn explicit_root_flag_wins() {
        assert_eq!(
            resolve_root(Some(Path::new("/tmp/logs"))),
            PathBuf::from("/tmp/logs")
        );
    }
}
