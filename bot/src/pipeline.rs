//! Stage sequencing for one inbound message.
//!
//! Every stage runs behind its validator chain, calls exactly one backend and,
//! only once that call succeeded, commits what it cost in a single ledger
//! transaction. Whatever happens, the caller gets exactly one [`Reply`].

use shared::{Reply, UsageStats};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::Quotas;
use crate::error::PipelineError;
use crate::ledger::Ledger;
use crate::models::{Turn, UsageField, User};
use crate::services::{ChatCompletion, SpeechToText, TextToSpeech};
use crate::units::BlockSizes;
use crate::validators::{Admission, Chains, PromptRequest, SpeechRequest, VoiceRequest};

/// Where a unit of work is. Only used for tracing; nothing is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Transcribing,
    LimitCheck,
    Completing,
    Synthesizing,
    Done,
    Aborted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Received => "received",
            Stage::Transcribing => "transcribing",
            Stage::LimitCheck => "limit_check",
            Stage::Completing => "completing",
            Stage::Synthesizing => "synthesizing",
            Stage::Done => "done",
            Stage::Aborted => "aborted",
        })
    }
}

/// The three capability clients the pipeline drives
#[derive(Clone)]
pub struct Backends {
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub chat: Arc<dyn ChatCompletion>,
}

pub struct Pipeline {
    ledger: Arc<dyn Ledger>,
    backends: Backends,
    chains: Chains,
    quotas: Quotas,
    sizes: BlockSizes,
    context_turns: usize,
}

impl Pipeline {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        backends: Backends,
        quotas: Quotas,
        sizes: BlockSizes,
        context_turns: usize,
    ) -> Self {
        let chains = Chains::new(ledger.clone(), backends.chat.clone(), &quotas);
        Self {
            ledger,
            backends,
            chains,
            quotas,
            sizes,
            context_turns,
        }
    }

    pub fn block_sizes(&self) -> &BlockSizes {
        &self.sizes
    }

    /// Global capacity gate alone; never creates a user
    pub async fn check_capacity(&self, external_id: i64) -> Result<(), PipelineError> {
        self.chains.admission.check(&Admission { external_id }).await
    }

    /// Pass the global capacity gate, then get or create the user.
    ///
    /// The ledger re-checks the cap atomically with the insert, so a newcomer
    /// racing past the chain is still refused.
    pub async fn admit(&self, external_id: i64) -> Result<User, PipelineError> {
        self.check_capacity(external_id).await?;
        let max_users = self.quotas.max_users;
        self.ledger
            .admit_user(external_id, max_users)
            .await?
            .ok_or(PipelineError::Capacity { max_users })
    }

    /// Current spend against the lifetime ceilings
    pub async fn stats(&self, external_id: i64) -> Result<UsageStats, PipelineError> {
        let user = self.admit(external_id).await?;
        Ok(user.stats(&self.quotas))
    }

    /// Text message: chat completion, answered with text
    pub async fn handle_text(&self, external_id: i64, text: &str) -> Reply {
        trace_stage(Stage::Received, external_id);
        finish(external_id, self.run_text(external_id, text).await)
    }

    /// Voice message: transcription, chat completion, then synthesis of the answer
    pub async fn handle_voice(&self, external_id: i64, audio: &[u8], duration_seconds: u32) -> Reply {
        trace_stage(Stage::Received, external_id);
        finish(
            external_id,
            self.run_voice(external_id, audio, duration_seconds).await,
        )
    }

    /// Debug mode: transcription only, answered with the transcript
    pub async fn transcribe_only(
        &self,
        external_id: i64,
        audio: &[u8],
        duration_seconds: u32,
    ) -> Reply {
        trace_stage(Stage::Received, external_id);
        finish(
            external_id,
            self.run_transcription(external_id, audio, duration_seconds)
                .await,
        )
    }

    /// Debug mode: synthesis only, answered with audio
    pub async fn synthesize_only(&self, external_id: i64, text: &str) -> Reply {
        trace_stage(Stage::Received, external_id);
        finish(external_id, self.run_synthesis(external_id, text).await)
    }

    async fn run_text(&self, external_id: i64, text: &str) -> Result<Reply, PipelineError> {
        let user = self.admit(external_id).await?;
        let answer = self.complete(&user, text).await?;
        Ok(Reply::text(answer))
    }

    async fn run_transcription(
        &self,
        external_id: i64,
        audio: &[u8],
        duration_seconds: u32,
    ) -> Result<Reply, PipelineError> {
        let user = self.admit(external_id).await?;
        let transcript = self.transcribe(&user, audio, duration_seconds).await?;
        Ok(Reply::text(transcript))
    }

    async fn run_synthesis(&self, external_id: i64, text: &str) -> Result<Reply, PipelineError> {
        let user = self.admit(external_id).await?;
        let audio = self.synthesize(&user, text).await?;
        Ok(Reply::voice(audio))
    }

    async fn run_voice(
        &self,
        external_id: i64,
        audio: &[u8],
        duration_seconds: u32,
    ) -> Result<Reply, PipelineError> {
        let user = self.admit(external_id).await?;
        let transcript = self.transcribe(&user, audio, duration_seconds).await?;
        let answer = self.complete(&user, &transcript).await?;

        match self.synthesize(&user, &answer).await {
            Ok(audio) => Ok(Reply::voice(audio)),
            Err(PipelineError::Backend(failure)) => {
                warn!(
                    external_id,
                    "Answering with text, synthesis failed: {}", failure
                );
                Ok(Reply::text(answer))
            }
            Err(err) => Err(err),
        }
    }

    async fn transcribe(
        &self,
        user: &User,
        audio: &[u8],
        duration_seconds: u32,
    ) -> Result<String, PipelineError> {
        trace_stage(Stage::LimitCheck, user.external_id);
        let request = VoiceRequest::new(user.id, duration_seconds, &self.sizes);
        let blocks = request.blocks;

        self.chains
            .voice
            .guard(&request, move || async move {
                trace_stage(Stage::Transcribing, user.external_id);
                let transcript = self.backends.stt.transcribe(audio).await?;
                self.ledger
                    .increment_usage(user.id, UsageField::SecondBlocks, blocks)
                    .await?;
                Ok::<_, PipelineError>(transcript)
            })
            .await
    }

    async fn complete(&self, user: &User, prompt: &str) -> Result<String, PipelineError> {
        trace_stage(Stage::LimitCheck, user.external_id);
        let request = PromptRequest::new(user.id, prompt);

        self.chains
            .prompt
            .guard(&request, move || async move {
                trace_stage(Stage::Completing, user.external_id);
                let context = self.context(user.id).await?;
                let completion = self.backends.chat.complete(prompt, &context).await?;
                self.ledger
                    .commit_chat_round(user.id, completion.tokens_spent, prompt, &completion.text)
                    .await?;
                Ok::<_, PipelineError>(completion.text)
            })
            .await
    }

    async fn synthesize(&self, user: &User, text: &str) -> Result<Vec<u8>, PipelineError> {
        trace_stage(Stage::LimitCheck, user.external_id);
        let request = SpeechRequest::new(user.id, text, &self.sizes);
        let blocks = request.blocks;

        self.chains
            .speech
            .guard(&request, move || async move {
                trace_stage(Stage::Synthesizing, user.external_id);
                let audio = self.backends.tts.synthesize(text).await?;
                self.ledger
                    .increment_usage(user.id, UsageField::CharacterBlocks, blocks)
                    .await?;
                Ok::<_, PipelineError>(audio)
            })
            .await
    }

    /// The most recent turns in chronological order
    async fn context(&self, user_id: Uuid) -> Result<Vec<Turn>, PipelineError> {
        let rows = self
            .ledger
            .list_recent_turns(user_id, self.context_turns)
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| match row.to_turn() {
                Ok(turn) => Some(turn),
                Err(e) => {
                    warn!("Skipping stored turn {}: {}", row.id, e);
                    None
                }
            })
            .collect())
    }
}

fn trace_stage(stage: Stage, external_id: i64) {
    debug!(external_id, stage = %stage, "pipeline stage");
}

fn finish(external_id: i64, result: Result<Reply, PipelineError>) -> Reply {
    match result {
        Ok(reply) => {
            trace_stage(Stage::Done, external_id);
            reply
        }
        Err(err) => {
            trace_stage(Stage::Aborted, external_id);
            // Rejections are logged by the chain and backend failures by their client.
            if let PipelineError::Persistence(e) = &err {
                error!(external_id, "Ledger failure, aborting request: {}", e);
            }
            Reply::text(err.user_message())
        }
    }
}
