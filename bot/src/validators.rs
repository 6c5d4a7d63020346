//! Ordered validator chains guarding every billed stage.
//!
//! A chain evaluates its validators in the order they were added and stops at
//! the first one that rejects. The guarded action runs only when every
//! validator passed. A validator fails closed: if it cannot compute what it
//! needs (a tokenizer or database failure), that failure is the rejection.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

use crate::config::Quotas;
use crate::error::{BackendFailure, PipelineError, QuotaExceeded};
use crate::ledger::Ledger;
use crate::services::ChatCompletion;
use crate::units::BlockSizes;

#[async_trait]
pub trait Validator<R: Sync>: Send + Sync {
    async fn validate(&self, request: &R) -> Result<(), PipelineError>;
}

pub struct ValidatorChain<R: Sync> {
    validators: Vec<Box<dyn Validator<R>>>,
}

impl<R: Sync> Default for ValidatorChain<R> {
    fn default() -> Self {
        Self {
            validators: Vec::new(),
        }
    }
}

impl<R: Sync> ValidatorChain<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a validator; it runs after every validator already in the chain
    pub fn then(mut self, validator: impl Validator<R> + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    /// Run every validator in order, stopping at the first rejection
    pub async fn check(&self, request: &R) -> Result<(), PipelineError> {
        for validator in &self.validators {
            if let Err(err) = validator.validate(request).await {
                if err.is_rejection() {
                    info!("Request rejected: {}", err);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Run `action` only if the whole chain passes
    pub async fn guard<T, F, Fut>(&self, request: &R, action: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.check(request).await?;
        action().await
    }
}

fn fits(spent: i64, cost: i64, limit: i64) -> bool {
    spent.saturating_add(cost) <= limit
}

// ============================================================================
// Requests
// ============================================================================

/// A platform identity asking to be served
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    pub external_id: i64,
}

/// A voice message about to be billed for transcription
#[derive(Debug, Clone, Copy)]
pub struct VoiceRequest {
    pub user_id: Uuid,
    pub blocks: i64,
}

impl VoiceRequest {
    pub fn new(user_id: Uuid, duration_seconds: u32, sizes: &BlockSizes) -> Self {
        Self {
            user_id,
            blocks: sizes.seconds_to_blocks(duration_seconds),
        }
    }
}

/// Text about to be billed for synthesis
#[derive(Debug, Clone, Copy)]
pub struct SpeechRequest {
    pub user_id: Uuid,
    pub blocks: i64,
}

impl SpeechRequest {
    pub fn new(user_id: Uuid, text: &str, sizes: &BlockSizes) -> Self {
        Self {
            user_id,
            blocks: sizes.text_to_blocks(text),
        }
    }
}

/// A prompt about to be sent to the chat backend.
///
/// The token cost needs a tokenizer round-trip, so it is computed on first use
/// and shared by every validator in the chain.
#[derive(Debug)]
pub struct PromptRequest {
    pub user_id: Uuid,
    pub text: String,
    tokens: OnceCell<i64>,
}

impl PromptRequest {
    pub fn new(user_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            user_id,
            text: text.into(),
            tokens: OnceCell::new(),
        }
    }

    pub async fn token_cost(&self, chat: &dyn ChatCompletion) -> Result<i64, BackendFailure> {
        self.tokens
            .get_or_try_init(|| chat.count_prompt_tokens(&self.text))
            .await
            .copied()
    }
}

// ============================================================================
// Global capacity
// ============================================================================

/// Admits known users always and new users only while there is room
pub struct MaxUsersValidator {
    pub ledger: Arc<dyn Ledger>,
    pub max_users: i64,
}

#[async_trait]
impl Validator<Admission> for MaxUsersValidator {
    async fn validate(&self, request: &Admission) -> Result<(), PipelineError> {
        if self.ledger.find_user(request.external_id).await?.is_some() {
            return Ok(());
        }
        let registered = self.ledger.count_users().await?;
        if registered < self.max_users {
            Ok(())
        } else {
            Err(PipelineError::Capacity {
                max_users: self.max_users,
            })
        }
    }
}

// ============================================================================
// Voice duration
// ============================================================================

pub struct RequestSecondBlocksValidator {
    pub limit: i64,
}

#[async_trait]
impl Validator<VoiceRequest> for RequestSecondBlocksValidator {
    async fn validate(&self, request: &VoiceRequest) -> Result<(), PipelineError> {
        if request.blocks <= self.limit {
            return Ok(());
        }
        Err(QuotaExceeded::RequestSecondBlocks {
            cost: request.blocks,
            limit: self.limit,
        }
        .into())
    }
}

pub struct UserSecondBlocksValidator {
    pub ledger: Arc<dyn Ledger>,
    pub limit: i64,
}

#[async_trait]
impl Validator<VoiceRequest> for UserSecondBlocksValidator {
    async fn validate(&self, request: &VoiceRequest) -> Result<(), PipelineError> {
        let spent = self.ledger.user(request.user_id).await?.seconds_spent_blocks;
        if fits(spent, request.blocks, self.limit) {
            return Ok(());
        }
        Err(QuotaExceeded::UserSecondBlocks {
            spent,
            cost: request.blocks,
            limit: self.limit,
        }
        .into())
    }
}

// ============================================================================
// Synthesized characters
// ============================================================================

pub struct RequestCharacterBlocksValidator {
    pub limit: i64,
}

#[async_trait]
impl Validator<SpeechRequest> for RequestCharacterBlocksValidator {
    async fn validate(&self, request: &SpeechRequest) -> Result<(), PipelineError> {
        if request.blocks <= self.limit {
            return Ok(());
        }
        Err(QuotaExceeded::RequestCharacterBlocks {
            cost: request.blocks,
            limit: self.limit,
        }
        .into())
    }
}

pub struct UserCharacterBlocksValidator {
    pub ledger: Arc<dyn Ledger>,
    pub limit: i64,
}

#[async_trait]
impl Validator<SpeechRequest> for UserCharacterBlocksValidator {
    async fn validate(&self, request: &SpeechRequest) -> Result<(), PipelineError> {
        let spent = self.ledger.user(request.user_id).await?.characters_spent_blocks;
        if fits(spent, request.blocks, self.limit) {
            return Ok(());
        }
        Err(QuotaExceeded::UserCharacterBlocks {
            spent,
            cost: request.blocks,
            limit: self.limit,
        }
        .into())
    }
}

// ============================================================================
// Chat tokens
// ============================================================================

pub struct RequestTokensValidator {
    pub chat: Arc<dyn ChatCompletion>,
    pub limit: i64,
}

#[async_trait]
impl Validator<PromptRequest> for RequestTokensValidator {
    async fn validate(&self, request: &PromptRequest) -> Result<(), PipelineError> {
        let cost = request.token_cost(self.chat.as_ref()).await?;
        if cost <= self.limit {
            return Ok(());
        }
        Err(QuotaExceeded::RequestTokens {
            cost,
            limit: self.limit,
        }
        .into())
    }
}

/// Rejects a user whose allowance is already spent, from the ledger alone,
/// so an exhausted user never costs a tokenizer call.
pub struct TokenAllowanceValidator {
    pub ledger: Arc<dyn Ledger>,
    pub limit: i64,
}

#[async_trait]
impl Validator<PromptRequest> for TokenAllowanceValidator {
    async fn validate(&self, request: &PromptRequest) -> Result<(), PipelineError> {
        let spent = self.ledger.user(request.user_id).await?.tokens_spent;
        if spent < self.limit {
            return Ok(());
        }
        Err(QuotaExceeded::UserTokens {
            spent,
            cost: 0,
            limit: self.limit,
        }
        .into())
    }
}

pub struct UserTokensValidator {
    pub ledger: Arc<dyn Ledger>,
    pub chat: Arc<dyn ChatCompletion>,
    pub limit: i64,
}

#[async_trait]
impl Validator<PromptRequest> for UserTokensValidator {
    async fn validate(&self, request: &PromptRequest) -> Result<(), PipelineError> {
        let spent = self.ledger.user(request.user_id).await?.tokens_spent;
        let cost = request.token_cost(self.chat.as_ref()).await?;
        if fits(spent, cost, self.limit) {
            return Ok(());
        }
        Err(QuotaExceeded::UserTokens {
            spent,
            cost,
            limit: self.limit,
        }
        .into())
    }
}

// ============================================================================
// Canonical chains
// ============================================================================

/// The four chains used by the pipeline, in their canonical order:
/// global capacity, then per-request size, then per-user cumulative spend.
/// The prompt chain opens with the ledger-only allowance check because its
/// size check needs the tokenizer.
pub struct Chains {
    pub admission: ValidatorChain<Admission>,
    pub voice: ValidatorChain<VoiceRequest>,
    pub prompt: ValidatorChain<PromptRequest>,
    pub speech: ValidatorChain<SpeechRequest>,
}

impl Chains {
    pub fn new(ledger: Arc<dyn Ledger>, chat: Arc<dyn ChatCompletion>, quotas: &Quotas) -> Self {
        Self {
            admission: ValidatorChain::new().then(MaxUsersValidator {
                ledger: ledger.clone(),
                max_users: quotas.max_users,
            }),
            voice: ValidatorChain::new()
                .then(RequestSecondBlocksValidator {
                    limit: quotas.request_max_second_blocks,
                })
                .then(UserSecondBlocksValidator {
                    ledger: ledger.clone(),
                    limit: quotas.user_second_blocks,
                }),
            prompt: ValidatorChain::new()
                .then(TokenAllowanceValidator {
                    ledger: ledger.clone(),
                    limit: quotas.user_tokens,
                })
                .then(RequestTokensValidator {
                    chat: chat.clone(),
                    limit: quotas.request_max_tokens,
                })
                .then(UserTokensValidator {
                    ledger: ledger.clone(),
                    chat,
                    limit: quotas.user_tokens,
                }),
            speech: ValidatorChain::new()
                .then(RequestCharacterBlocksValidator {
                    limit: quotas.request_max_character_blocks,
                })
                .then(UserCharacterBlocksValidator {
                    ledger,
                    limit: quotas.user_character_blocks,
                }),
        }
    }
}
