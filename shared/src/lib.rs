use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Protocol constants shared between the service and its tooling
pub mod protocol;

// Bot command vocabulary
pub mod commands;
pub use commands::Command;

/// Author of a stored conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown conversation role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Result of a stats query: what a user has spent and what they may spend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub seconds_spent_blocks: i64,
    pub seconds_limit: i64,
    pub characters_spent_blocks: i64,
    pub characters_limit: i64,
    pub tokens_spent: i64,
    pub tokens_limit: i64,
}

impl UsageStats {
    /// Human-readable summary sent in reply to `/stats`
    pub fn render(&self, seconds_per_block: u32, characters_per_block: u32) -> String {
        format!(
            "Character blocks spent ({} characters each): {} of {}\n\
             Second blocks spent ({} seconds each): {} of {}\n\
             Tokens spent: {} of {}",
            characters_per_block,
            self.characters_spent_blocks,
            self.characters_limit,
            seconds_per_block,
            self.seconds_spent_blocks,
            self.seconds_limit,
            self.tokens_spent,
            self.tokens_limit,
        )
    }
}

/// Which reply keyboard accompanies a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Keyboard {
    Main,
    Debug,
}

impl Keyboard {
    /// Button rows, top to bottom
    pub fn layout(&self) -> &'static [&'static [Command]] {
        match self {
            Keyboard::Main => &[&[Command::Stats], &[Command::Help, Command::ToggleDebug]],
            Keyboard::Debug => &[
                &[Command::Stt, Command::Tts],
                &[Command::GetLogsWarning, Command::GetLogsInfo],
                &[Command::Help, Command::ToggleDebug],
            ],
        }
    }
}

/// Payload of an outbound reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplyBody {
    Text { text: String },
    Voice { audio: Vec<u8> },
    Document { file_name: String, bytes: Vec<u8> },
}

/// One reply to one inbound message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub body: ReplyBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Keyboard>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            body: ReplyBody::Text { text: text.into() },
            keyboard: None,
        }
    }

    pub fn voice(audio: Vec<u8>) -> Self {
        Self {
            body: ReplyBody::Voice { audio },
            keyboard: None,
        }
    }

    pub fn document(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            body: ReplyBody::Document {
                file_name: file_name.into(),
                bytes,
            },
            keyboard: None,
        }
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            ReplyBody::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_voice(&self) -> bool {
        matches!(self.body, ReplyBody::Voice { .. })
    }
}
