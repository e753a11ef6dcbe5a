//! Typed views over one session-log line.
//!
//! Lines are tagged by `type`; anything outside the four known kinds fails to parse and is
//! dropped by the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventEnvelope {
    System(SystemEvent),
    Assistant(MessageEvent),
    User(MessageEvent),
    Result(ResultEvent),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEvent {
    pub message: Option<Message>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    pub is_error: Option<bool>,
    pub model: Option<String>,
    pub usage: Option<UsageBlock>,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub id: Option<String>,
    pub role: Option<String>,
    pub model: Option<String>,
    pub content: Option<MessageContent>,
    pub usage: Option<UsageBlock>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBlock {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
}

impl UsageBlock {
    pub fn output(&self) -> u64 {
        self.output_tokens.unwrap_or(0)
    }

    /// Fresh input billed for the turn: uncached input plus cache writes.
    pub fn billed_input(&self) -> u64 {
        self.input_tokens
            .unwrap_or(0)
            .saturating_add(self.cache_creation_input_tokens.unwrap_or(0))
    }

    /// Whole conversation as sent on this turn.
    pub fn context_tokens(&self) -> u64 {
        self.billed_input()
            .saturating_add(self.cache_read_input_tokens.unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToolUse<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub input: &'a Value,
}

impl<'a> ToolUse<'a> {
    pub fn command(&self) -> Option<&'a str> {
        self.input.get("command").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToolResult<'a> {
    pub tool_use_id: &'a str,
    pub is_error: bool,
}

pub fn parse_line(line: &str) -> Option<EventEnvelope> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

impl EventEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::Result(_) => "result",
        }
    }

    fn message(&self) -> Option<&Message> {
        match self {
            Self::Assistant(event) | Self::User(event) => event.message.as_ref(),
            Self::Result(event) => event.message.as_ref(),
            Self::System(_) => None,
        }
    }

    fn blocks(&self) -> &[ContentBlock] {
        match self.message().and_then(|message| message.content.as_ref()) {
            Some(MessageContent::Blocks(blocks)) => blocks,
            _ => &[],
        }
    }

    /// Model id carried by the line, preferring the message's own model.
    pub fn model(&self) -> Option<&str> {
        let own = match self {
            Self::System(event) => event.model.as_deref(),
            Self::Assistant(event) | Self::User(event) => event.model.as_deref(),
            Self::Result(event) => event.model.as_deref(),
        };
        self.message()
            .and_then(|message| message.model.as_deref())
            .or(own)
            .map(str::trim)
            .filter(|model| !model.is_empty() && *model != "<synthetic>")
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message().and_then(|message| message.id.as_deref())
    }

    pub fn usage(&self) -> Option<&UsageBlock> {
        let from_message = self.message().and_then(|message| message.usage.as_ref());
        match self {
            Self::Result(event) => event.usage.as_ref().or(from_message),
            Self::Assistant(_) => from_message,
            _ => None,
        }
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = ToolUse<'_>> {
        let blocks: &[ContentBlock] = match self {
            Self::Assistant(_) => self.blocks(),
            _ => &[],
        };
        blocks.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(ToolUse { id, name, input }),
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = ToolResult<'_>> {
        let blocks: &[ContentBlock] = match self {
            Self::User(_) => self.blocks(),
            _ => &[],
        };
        blocks.iter().filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => Some(ToolResult {
                tool_use_id,
                is_error: is_error.unwrap_or(false),
            }),
            _ => None,
        })
    }

    fn texts(&self) -> impl Iterator<Item = &str> {
        let whole = match self.message().and_then(|message| message.content.as_ref()) {
            Some(MessageContent::Text(text)) => Some(text.as_str()),
            _ => None,
        };
        whole.into_iter().chain(self.blocks().iter().filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        }))
    }

    pub fn has_text(&self) -> bool {
        self.texts().any(|text| !text.trim().is_empty())
    }

    pub fn text_starts_with(&self, marker: &str) -> bool {
        !marker.is_empty() && self.texts().any(|text| text.trim_start().starts_with(marker))
    }

    /// Assistant message that ended the turn without asking for a tool.
    pub fn is_turn_end(&self) -> bool {
        matches!(self, Self::Assistant(_))
            && self
                .message()
                .and_then(|message| message.stop_reason.as_deref())
                == Some("end_turn")
            && self.tool_uses().next().is_none()
    }
}
