//! Best-effort commit detection in shell commands. Exotic quoting may fall through to the
//! generic message.

use std::sync::LazyLock;

use regex::Regex;

pub const FALLBACK_COMMIT_MESSAGE: &str = "code committed";

static COMMIT_COMMAND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bgit\s+commit(?:\s|$)").expect("valid commit regex"));

static HEREDOC_MESSAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"cat\s*<<-?\s*'?EOF'?[^\n]*\n([\s\S]*?)\n\s*EOF").expect("valid heredoc regex")
});

static FLAG_MESSAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"git\s+commit.*?(?:\s-[A-Za-z]*m|--message)[\s=]+["']([^"'\n]+)"#)
        .expect("valid message flag regex")
});

pub fn is_commit_command(command: &str) -> bool {
    COMMIT_COMMAND_RE.is_match(command)
}

/// Heredoc body wins over an inline `-m`, since agents pass multi-line messages that way.
pub fn extract_commit_message(command: &str) -> String {
    if let Some(body) = HEREDOC_MESSAGE_RE
        .captures(command)
        .and_then(|caps| caps.get(1))
        && let Some(first_line) = body
            .as_str()
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
    {
        return first_line.to_string();
    }

    FLAG_MESSAGE_RE
        .captures(command)
        .and_then(|caps| caps.get(1))
        .map(|message| message.as_str().trim().to_string())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| FALLBACK_COMMIT_MESSAGE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_commit_commands_only() {
        assert!(is_commit_command("git add -A && git commit -m \"x\""));
        assert!(is_commit_command("git commit"));
        assert!(!is_commit_command("git commit-tree abc"));
        assert!(!is_commit_command("git status"));
    }

    #[test]
    fn extracts_heredoc_first_line() {
        let command = "git commit -m \"$(cat <<'EOF'\nFix tail offset handling\n\nLonger body.\nEOF\n)\"";
        assert_eq!(extract_commit_message(command), "Fix tail offset handling");
    }

    #[test]
    fn extracts_inline_message_flag() {
        assert_eq!(
            extract_commit_message("git commit -am \"Add selector pin\""),
            "Add selector pin"
        );
        assert_eq!(
            extract_commit_message("git commit -m 'single quoted'"),
            "single quoted"
        );
        assert_eq!(
            extract_commit_message("git commit --message=\"long form\""),
            "long form"
        );
    }

    #[test]
    fn falls_back_to_generic_message() {
        assert_eq!(extract_commit_message("git commit"), FALLBACK_COMMIT_MESSAGE);
        assert_eq!(
            extract_commit_message("git commit -F msg.txt"),
            FALLBACK_COMMIT_MESSAGE
        );
    }
}
