//! Bot command vocabulary and parsing of `/command` messages.

use std::fmt;

/// A slash command understood by the bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Start,
    Help,
    Stats,
    ToggleDebug,
    Stt,
    Tts,
    GetLogsWarning,
    GetLogsInfo,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Start,
        Command::Help,
        Command::Stats,
        Command::ToggleDebug,
        Command::Stt,
        Command::Tts,
        Command::GetLogsWarning,
        Command::GetLogsInfo,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Help => "help",
            Command::Stats => "stats",
            Command::ToggleDebug => "toggle_debug",
            Command::Stt => "stt",
            Command::Tts => "tts",
            Command::GetLogsWarning => "get_logs_warning",
            Command::GetLogsInfo => "get_logs_info",
        }
    }

    /// Parse the leading command of a message.
    ///
    /// Accepts `/name`, `/name@BotName` and trailing arguments. Returns `None`
    /// for non-command text and for commands the bot does not know.
    pub fn parse(text: &str) -> Option<Command> {
        let first = text.split_whitespace().next()?;
        let name = first.strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);

        Command::ALL
            .into_iter()
            .find(|command| command.name().eq_ignore_ascii_case(name))
    }

    /// Commands that are only served while the user is in debug mode
    pub fn requires_debug_mode(&self) -> bool {
        matches!(self, Command::Stt | Command::Tts)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.name())
    }
}
