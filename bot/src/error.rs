//! Error types shared by the validators and the pipeline.
//!
//! Every error carries a `user_message()` that is safe to send to the end
//! user. Backend and database details only ever go to the log.

use std::fmt;

use crate::ledger::LedgerError;

/// Reply used whenever a backend or the database fails
pub const GENERIC_FAILURE_MESSAGE: &str =
    "An error occurred, please try again later or contact support";

/// Longest request excerpt written to the log next to a backend failure
const LOG_EXCERPT_CHARS: usize = 100;

/// External backend a capability client talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Stt,
    Tts,
    Gpt,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Service::Stt => "STT",
            Service::Tts => "TTS",
            Service::Gpt => "GPT",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// Connection, TLS or timeout failure before a status was received
    Transport(String),
    /// Backend answered with a non-success status code
    Status(u16),
    /// Backend answered 200 with a body we could not understand
    Decode(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Transport(msg) => write!(f, "transport error: {}", msg),
            FailureCause::Status(code) => write!(f, "incorrect status code {}", code),
            FailureCause::Decode(msg) => write!(f, "undecodable response: {}", msg),
        }
    }
}

/// A single failed round-trip to an external backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{service} request failed: {cause}")]
pub struct BackendFailure {
    pub service: Service,
    pub cause: FailureCause,
}

impl BackendFailure {
    /// Build the failure and log it with the request context that caused it
    pub fn logged(service: Service, cause: FailureCause, context: &str) -> Self {
        tracing::error!(
            service = %service,
            context = %excerpt(context),
            "{} request failed: {}",
            service,
            cause
        );
        Self { service, cause }
    }

    pub fn user_message(&self) -> &'static str {
        GENERIC_FAILURE_MESSAGE
    }
}

/// Truncate request context for logging
pub fn excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(LOG_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// A request that would go over one of the six consumption ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QuotaExceeded {
    #[error("voice message of {cost} second blocks exceeds the per-request ceiling of {limit}")]
    RequestSecondBlocks { cost: i64, limit: i64 },

    #[error("text of {cost} character blocks exceeds the per-request ceiling of {limit}")]
    RequestCharacterBlocks { cost: i64, limit: i64 },

    #[error("prompt of {cost} tokens exceeds the per-request ceiling of {limit}")]
    RequestTokens { cost: i64, limit: i64 },

    #[error("{spent} spent + {cost} second blocks exceeds the user ceiling of {limit}")]
    UserSecondBlocks { spent: i64, cost: i64, limit: i64 },

    #[error("{spent} spent + {cost} character blocks exceeds the user ceiling of {limit}")]
    UserCharacterBlocks { spent: i64, cost: i64, limit: i64 },

    #[error("{spent} spent + {cost} tokens exceeds the user ceiling of {limit}")]
    UserTokens { spent: i64, cost: i64, limit: i64 },
}

impl QuotaExceeded {
    pub fn user_message(&self) -> &'static str {
        match self {
            QuotaExceeded::RequestSecondBlocks { .. } => {
                "Your voice message is too long, please shorten your request"
            }
            QuotaExceeded::RequestCharacterBlocks { .. } => {
                "The text is too long to be voiced, please shorten your request"
            }
            QuotaExceeded::RequestTokens { .. } => {
                "Your message is too long, please shorten your request"
            }
            QuotaExceeded::UserSecondBlocks { .. } => {
                "Sorry, you have used up your allowance of voice messages (counted by total \
                 duration).\nYou can no longer use this feature"
            }
            QuotaExceeded::UserCharacterBlocks { .. } => {
                "Sorry, you have used up your allowance of voiced characters.\nYou can no \
                 longer use this feature"
            }
            QuotaExceeded::UserTokens { .. } => {
                "Sorry, you have used up your allowance of tokens.\nYou can no longer use \
                 this feature"
            }
        }
    }
}

/// Why a unit of work stopped before producing its payload
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("quota exceeded: {0}")]
    Quota(#[from] QuotaExceeded),

    #[error("registered user limit of {max_users} reached")]
    Capacity { max_users: i64 },

    #[error(transparent)]
    Backend(#[from] BackendFailure),

    #[error("ledger failure: {0}")]
    Persistence(#[from] LedgerError),
}

impl PipelineError {
    /// Quota and capacity rejections are expected outcomes, not faults
    pub fn is_rejection(&self) -> bool {
        matches!(self, PipelineError::Quota(_) | PipelineError::Capacity { .. })
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::Quota(quota) => quota.user_message(),
            PipelineError::Capacity { .. } => {
                "Sorry, the bot has a limit on the number of users and it has been reached"
            }
            PipelineError::Backend(failure) => failure.user_message(),
            PipelineError::Persistence(_) => GENERIC_FAILURE_MESSAGE,
        }
    }
}
