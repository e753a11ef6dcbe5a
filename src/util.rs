use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tracing_subscriber::{EnvFilter, fmt};

/// Logs go to stderr; stdout carries the event stream.
pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

/// `claude-sonnet-4-5-20250929` becomes `Sonnet 4.5`; date stamps are dropped.
pub fn format_model_name(model_id: &str) -> String {
    let trimmed = model_id.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }

    let mut words: Vec<String> = Vec::new();
    let mut version: Vec<&str> = Vec::new();
    for part in trimmed.split('-').filter(|part| !part.is_empty()) {
        let lower = part.to_ascii_lowercase();
        if lower == "claude" || is_date_stamp(part) {
            continue;
        }
        if part.chars().all(|ch| ch.is_ascii_digit()) {
            version.push(part);
            continue;
        }
        if !version.is_empty() {
            words.push(version.join("."));
            version.clear();
        }
        words.push(capitalize(&lower));
    }
    if !version.is_empty() {
        words.push(version.join("."));
    }

    if words.is_empty() {
        trimmed.to_string()
    } else {
        words.join(" ")
    }
}

fn is_date_stamp(part: &str) -> bool {
    part.len() == 8 && part.chars().all(|ch| ch.is_ascii_digit())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    format!("{}{}", first.to_ascii_uppercase(), chars.as_str())
}

pub fn format_age(at: DateTime<Utc>) -> String {
    let now = Utc::now();
    if at >= now {
        return "just now".to_string();
    }
    let delta = (now - at).to_std().unwrap_or_default();
    format!("{} ago", human_duration(delta))
}

pub fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn progress_bar(percent: f64, width: usize) -> String {
    let pct = percent.clamp(0.0, 100.0);
    let filled = ((pct / 100.0) * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("{}{}", "#".repeat(filled), "-".repeat(empty))
}

pub fn truncate(input: &str, max_len: usize) -> String {
    if input.chars().count() <= max_len {
        return input.to_string();
    }
    if max_len <= 3 {
        return input.chars().take(max_len).collect();
    }
    let head: String = input.chars().take(max_len - 3).collect();
    format!("{head}...")
}

pub fn now_local() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_formatting() {
        assert_eq!(format_tokens(999), "999");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(1_500_000), "1.5M");
    }

    #[test]
    fn model_name_formatting() {
        assert_eq!(format_model_name("claude-sonnet-4-5-20250929"), "Sonnet 4.5");
        assert_eq!(format_model_name("claude-opus-4-1"), "Opus 4.1");
        assert_eq!(format_model_name("claude-3-5-haiku-20241022"), "3.5 Haiku");
        assert_eq!(format_model_name("  "), "unknown");
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(human_duration(Duration::from_secs(42)), "42s");
        assert_eq!(human_duration(Duration::from_secs(3_720)), "1h 2m");
        assert_eq!(human_duration(Duration::from_secs(90_000)), "1d 1h");
    }

    #[test]
    fn progress_and_truncate() {
        assert_eq!(progress_bar(50.0, 10), "#####-----");
        assert_eq!(progress_bar(250.0, 4), "####");
        assert_eq!(truncate("commit message", 9), "commit...");
        assert_eq!(truncate("short", 9), "short");
    }
}
