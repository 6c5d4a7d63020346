//! Capability clients for the speech-to-text, text-to-speech and chat backends.
//!
//! The pipeline only sees the traits below; the Yandex Cloud implementations
//! live in the submodules. A client makes exactly one attempt per call and
//! turns every failure into a logged [`BackendFailure`].

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{BackendFailure, FailureCause, Service};
use crate::models::Turn;

pub mod gpt;
pub mod stt;
pub mod tts;

pub use gpt::YandexGpt;
pub use stt::YandexStt;
pub use tts::YandexTts;

/// Speech-to-Text interface
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one complete voice message
    async fn transcribe(&self, audio: &[u8]) -> Result<String, BackendFailure>;
}

/// Text-to-Speech interface
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize text into an audio payload
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, BackendFailure>;
}

/// Reply of the chat backend and what it cost
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens_spent: i64,
}

/// Chat completion interface
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    /// Answer `prompt` given the prior turns of the conversation
    async fn complete(&self, prompt: &str, context: &[Turn]) -> Result<Completion, BackendFailure>;

    /// Count the tokens `text` occupies for this model
    async fn count_prompt_tokens(&self, text: &str) -> Result<i64, BackendFailure>;
}

pub(crate) fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("Falling back to default HTTP client: {}", e);
            reqwest::Client::new()
        })
}

pub(crate) fn api_key_header(api_key: &str) -> String {
    format!("Api-Key {}", api_key)
}

/// Send a request and require a 200 answer
pub(crate) async fn send(
    service: Service,
    request: RequestBuilder,
    context: &str,
) -> Result<Response, BackendFailure> {
    let response = request.send().await.map_err(|e| {
        BackendFailure::logged(service, FailureCause::Transport(e.to_string()), context)
    })?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(BackendFailure::logged(
            service,
            FailureCause::Status(status.as_u16()),
            context,
        ));
    }

    Ok(response)
}

pub(crate) async fn decode_json<T: DeserializeOwned>(
    service: Service,
    response: Response,
    context: &str,
) -> Result<T, BackendFailure> {
    response.json::<T>().await.map_err(|e| {
        BackendFailure::logged(service, FailureCause::Decode(e.to_string()), context)
    })
}
