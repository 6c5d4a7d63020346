/// Number of prior conversation turns sent to the chat backend as context.
pub const DEFAULT_CONTEXT_TURNS: usize = 10;

/// Seconds of voice audio per billing block.
pub const DEFAULT_SECONDS_PER_BLOCK: u32 = 15;

/// Characters of synthesized text per billing block.
pub const DEFAULT_CHARACTERS_PER_BLOCK: u32 = 250;

/// Visible file names for log documents sent to the debug user.
pub const WARNING_LOG_DOCUMENT_NAME: &str = "logs_warning.log";
pub const INFO_LOG_DOCUMENT_NAME: &str = "logs_info.log";
