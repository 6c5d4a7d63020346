//! Startup configuration.
//!
//! Every value can be given as a CLI flag or an environment variable (a
//! `.env` file is loaded before parsing). The parsed [`Settings`] is split into
//! small immutable structs handed to the components that need them.

use clap::Parser;
use shared::protocol::{
    DEFAULT_CHARACTERS_PER_BLOCK, DEFAULT_CONTEXT_TURNS, DEFAULT_SECONDS_PER_BLOCK,
};
use std::path::PathBuf;
use std::time::Duration;

use crate::units::BlockSizes;

const DEFAULT_SYSTEM_PROMPT: &str = "You are here to support the user. Be polite, lift their mood \
and keep it short. Never say that you are ready to support them or to lift their mood.";

#[derive(Parser, Debug, Clone)]
#[command(name = "support-bot")]
#[command(about = "Support chat bot with voice and per-user quotas")]
pub struct Settings {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Bot API token
    #[arg(long, env = "BOT_TOKEN", hide_env_values = true)]
    pub bot_token: String,

    /// Bot API base URL
    #[arg(long, env = "BOT_API_URL", default_value = "https://api.telegram.org")]
    pub bot_api_url: String,

    /// Long-polling timeout for getUpdates, in seconds
    #[arg(long, env = "POLL_TIMEOUT_SECS", default_value_t = 30)]
    pub poll_timeout_secs: u64,

    /// Platform user allowed to download the log files
    #[arg(long, env = "DEBUG_USER_ID")]
    pub debug_user_id: i64,

    /// Directory holding warning.log and info.log
    #[arg(long, env = "LOGS_DIR", default_value = "logs")]
    pub logs_dir: PathBuf,

    /// Timeout applied to every backend request, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    // Speech to text
    #[arg(long, env = "STT_API_KEY", hide_env_values = true)]
    pub stt_api_key: String,
    #[arg(long, env = "STT_FOLDER_ID")]
    pub stt_folder_id: String,
    #[arg(
        long,
        env = "STT_URL",
        default_value = "https://stt.api.cloud.yandex.net/speech/v1/stt:recognize"
    )]
    pub stt_url: String,
    #[arg(long, env = "STT_LANGUAGE", default_value = "ru-RU")]
    pub stt_language: String,
    #[arg(long, env = "STT_SECONDS_IN_BLOCK", default_value_t = DEFAULT_SECONDS_PER_BLOCK)]
    pub stt_seconds_in_block: u32,

    // Text to speech
    #[arg(long, env = "TTS_API_KEY", hide_env_values = true)]
    pub tts_api_key: String,
    #[arg(long, env = "TTS_FOLDER_ID")]
    pub tts_folder_id: String,
    #[arg(
        long,
        env = "TTS_URL",
        default_value = "https://tts.api.cloud.yandex.net/speech/v1/tts:synthesize"
    )]
    pub tts_url: String,
    #[arg(long, env = "TTS_LANGUAGE", default_value = "ru-RU")]
    pub tts_language: String,
    #[arg(long, env = "TTS_VOICE", default_value = "filipp")]
    pub tts_voice: String,
    #[arg(long, env = "TTS_CHARACTERS_IN_BLOCK", default_value_t = DEFAULT_CHARACTERS_PER_BLOCK)]
    pub tts_characters_in_block: u32,

    // Chat completion
    #[arg(long, env = "GPT_API_KEY", hide_env_values = true)]
    pub gpt_api_key: String,
    #[arg(long, env = "GPT_FOLDER_ID")]
    pub gpt_folder_id: String,
    #[arg(
        long,
        env = "GPT_URL",
        default_value = "https://llm.api.cloud.yandex.net/foundationModels/v1/completion"
    )]
    pub gpt_url: String,
    #[arg(
        long,
        env = "GPT_TOKENIZE_URL",
        default_value = "https://llm.api.cloud.yandex.net/foundationModels/v1/tokenize"
    )]
    pub gpt_tokenize_url: String,
    #[arg(long, env = "GPT_MODEL", default_value = "yandexgpt-lite")]
    pub gpt_model: String,
    #[arg(long, env = "GPT_TEMPERATURE", default_value_t = 1.0)]
    pub gpt_temperature: f32,
    #[arg(long, env = "GPT_RESPONSE_MAX_TOKENS", default_value_t = 300)]
    pub gpt_response_max_tokens: u32,
    #[arg(long, env = "GPT_SYSTEM_PROMPT", default_value = DEFAULT_SYSTEM_PROMPT)]
    pub gpt_system_prompt: String,
    /// Prior turns sent with every prompt
    #[arg(long, env = "GPT_CONTEXT_TURNS", default_value_t = DEFAULT_CONTEXT_TURNS)]
    pub gpt_context_turns: usize,

    // Per-request ceilings
    #[arg(long, env = "REQUEST_MAX_SECOND_BLOCKS", default_value_t = 2)]
    pub request_max_second_blocks: i64,
    #[arg(long, env = "REQUEST_MAX_CHARACTER_BLOCKS", default_value_t = 5)]
    pub request_max_character_blocks: i64,
    #[arg(long, env = "REQUEST_MAX_TOKENS", default_value_t = 300)]
    pub request_max_tokens: i64,

    // Per-user lifetime ceilings
    #[arg(long, env = "SECOND_BLOCKS_LIMIT_BY_USER", default_value_t = 25)]
    pub second_blocks_limit_by_user: i64,
    #[arg(long, env = "CHARACTER_BLOCKS_LIMIT_BY_USER", default_value_t = 20)]
    pub character_blocks_limit_by_user: i64,
    #[arg(long, env = "TOKENS_LIMIT_BY_USER", default_value_t = 2500)]
    pub tokens_limit_by_user: i64,

    /// Maximum number of registered users
    #[arg(long, env = "MAX_USERS_AMOUNT_LIMIT", default_value_t = 10)]
    pub max_users_amount_limit: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),

    #[error("{0} must not be negative")]
    Negative(&'static str),
}

/// Per-request and per-user ceilings plus the global user cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quotas {
    pub request_max_second_blocks: i64,
    pub request_max_character_blocks: i64,
    pub request_max_tokens: i64,
    pub user_second_blocks: i64,
    pub user_character_blocks: i64,
    pub user_tokens: i64,
    pub max_users: i64,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            request_max_second_blocks: 2,
            request_max_character_blocks: 5,
            request_max_tokens: 300,
            user_second_blocks: 25,
            user_character_blocks: 20,
            user_tokens: 2500,
            max_users: 10,
        }
    }
}

/// Chat completion parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ChatParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            model: "yandexgpt-lite".to_string(),
            temperature: 1.0,
            max_tokens: 300,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Connection details for one backend service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub url: String,
    pub api_key: String,
    pub folder_id: String,
    pub language: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub service: ServiceConfig,
    pub voice: String,
}

/// Bot API endpoint and credentials
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_url: String,
    pub token: String,
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GptConfig {
    pub completion_url: String,
    pub tokenize_url: String,
    pub api_key: String,
    pub folder_id: String,
    pub timeout: Duration,
    pub params: ChatParams,
}

impl Settings {
    /// Reject values that would make billing or context windowing meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stt_seconds_in_block == 0 {
            return Err(ConfigError::NotPositive("STT_SECONDS_IN_BLOCK"));
        }
        if self.tts_characters_in_block == 0 {
            return Err(ConfigError::NotPositive("TTS_CHARACTERS_IN_BLOCK"));
        }
        if self.gpt_context_turns == 0 {
            return Err(ConfigError::NotPositive("GPT_CONTEXT_TURNS"));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::NotPositive("REQUEST_TIMEOUT_SECS"));
        }

        let ceilings = [
            ("REQUEST_MAX_SECOND_BLOCKS", self.request_max_second_blocks),
            ("REQUEST_MAX_CHARACTER_BLOCKS", self.request_max_character_blocks),
            ("REQUEST_MAX_TOKENS", self.request_max_tokens),
            ("SECOND_BLOCKS_LIMIT_BY_USER", self.second_blocks_limit_by_user),
            ("CHARACTER_BLOCKS_LIMIT_BY_USER", self.character_blocks_limit_by_user),
            ("TOKENS_LIMIT_BY_USER", self.tokens_limit_by_user),
            ("MAX_USERS_AMOUNT_LIMIT", self.max_users_amount_limit),
        ];
        for (name, value) in ceilings {
            if value < 0 {
                return Err(ConfigError::Negative(name));
            }
        }

        Ok(())
    }

    pub fn quotas(&self) -> Quotas {
        Quotas {
            request_max_second_blocks: self.request_max_second_blocks,
            request_max_character_blocks: self.request_max_character_blocks,
            request_max_tokens: self.request_max_tokens,
            user_second_blocks: self.second_blocks_limit_by_user,
            user_character_blocks: self.character_blocks_limit_by_user,
            user_tokens: self.tokens_limit_by_user,
            max_users: self.max_users_amount_limit,
        }
    }

    pub fn block_sizes(&self) -> BlockSizes {
        BlockSizes {
            seconds_per_block: self.stt_seconds_in_block,
            characters_per_block: self.tts_characters_in_block,
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn telegram(&self) -> TelegramConfig {
        TelegramConfig {
            api_url: self.bot_api_url.trim_end_matches('/').to_string(),
            token: self.bot_token.clone(),
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
        }
    }

    pub fn stt(&self) -> ServiceConfig {
        ServiceConfig {
            url: self.stt_url.clone(),
            api_key: self.stt_api_key.clone(),
            folder_id: self.stt_folder_id.clone(),
            language: self.stt_language.clone(),
            timeout: self.request_timeout(),
        }
    }

    pub fn tts(&self) -> TtsConfig {
        TtsConfig {
            service: ServiceConfig {
                url: self.tts_url.clone(),
                api_key: self.tts_api_key.clone(),
                folder_id: self.tts_folder_id.clone(),
                language: self.tts_language.clone(),
                timeout: self.request_timeout(),
            },
            voice: self.tts_voice.clone(),
        }
    }

    pub fn gpt(&self) -> GptConfig {
        GptConfig {
            completion_url: self.gpt_url.clone(),
            tokenize_url: self.gpt_tokenize_url.clone(),
            api_key: self.gpt_api_key.clone(),
            folder_id: self.gpt_folder_id.clone(),
            timeout: self.request_timeout(),
            params: ChatParams {
                model: self.gpt_model.clone(),
                temperature: self.gpt_temperature,
                max_tokens: self.gpt_response_max_tokens,
                system_prompt: self.gpt_system_prompt.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 17] = [
        "support-bot",
        "--database-url",
        "postgres://localhost/bot",
        "--bot-token",
        "123:abc",
        "--debug-user-id",
        "42",
        "--stt-api-key",
        "stt-key",
        "--stt-folder-id",
        "folder",
        "--tts-api-key",
        "tts-key",
        "--tts-folder-id",
        "folder",
        "--gpt-api-key",
        "gpt-key",
    ];

    fn parse(extra: &[&str]) -> Settings {
        let mut args: Vec<&str> = REQUIRED.to_vec();
        args.extend(["--gpt-folder-id", "folder"]);
        args.extend_from_slice(extra);
        Settings::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults_match_the_documented_quotas() {
        let settings = parse(&[]);
        assert_eq!(settings.quotas(), Quotas::default());
        assert_eq!(settings.block_sizes(), BlockSizes::default());
        assert_eq!(settings.gpt().params, ChatParams::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn flags_override_defaults() {
        let settings = parse(&["--tokens-limit-by-user", "100", "--stt-seconds-in-block", "10"]);
        assert_eq!(settings.quotas().user_tokens, 100);
        assert_eq!(settings.block_sizes().seconds_per_block, 10);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let settings = parse(&["--tts-characters-in-block", "0"]);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::NotPositive("TTS_CHARACTERS_IN_BLOCK"))
        ));
    }

    #[test]
    fn negative_ceiling_is_rejected() {
        let settings = parse(&["--request-max-tokens=-1"]);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Negative("REQUEST_MAX_TOKENS"))
        ));
    }

    #[test]
    fn bot_api_url_loses_its_trailing_slash() {
        let settings = parse(&["--bot-api-url", "http://localhost:8081/"]);
        let telegram = settings.telegram();
        assert_eq!(telegram.api_url, "http://localhost:8081");
        assert_eq!(telegram.token, "123:abc");
        assert_eq!(telegram.poll_timeout, Duration::from_secs(30));
    }

    #[test]
    fn missing_required_value_fails_to_parse() {
        assert!(Settings::try_parse_from(["support-bot"]).is_err());
    }
}
