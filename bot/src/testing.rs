//! Scripted capability fakes that count their calls.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{BackendFailure, FailureCause, Service};
use crate::models::Turn;
use crate::services::{ChatCompletion, Completion, SpeechToText, TextToSpeech};

fn failure(service: Service) -> BackendFailure {
    BackendFailure {
        service,
        cause: FailureCause::Status(500),
    }
}

pub struct FakeStt {
    transcript: Option<String>,
    calls: AtomicUsize,
}

impl FakeStt {
    pub fn returning(transcript: &str) -> Self {
        Self {
            transcript: Some(transcript.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            transcript: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for FakeStt {
    async fn transcribe(&self, _audio: &[u8]) -> Result<String, BackendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.transcript.clone().ok_or_else(|| failure(Service::Stt))
    }
}

pub struct FakeTts {
    audio: Option<Vec<u8>>,
    calls: AtomicUsize,
}

impl FakeTts {
    pub fn returning(audio: &[u8]) -> Self {
        Self {
            audio: Some(audio.to_vec()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            audio: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextToSpeech for FakeTts {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, BackendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.audio.clone().ok_or_else(|| failure(Service::Tts))
    }
}

pub struct FakeChat {
    reply: Option<Completion>,
    token_count: Option<i64>,
    tokenize_calls: AtomicUsize,
    complete_calls: AtomicUsize,
    last_context: Mutex<Vec<Turn>>,
}

impl Default for FakeChat {
    fn default() -> Self {
        Self {
            reply: Some(Completion {
                text: "reply".to_string(),
                tokens_spent: 10,
            }),
            token_count: Some(10),
            tokenize_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
            last_context: Mutex::new(Vec::new()),
        }
    }
}

impl FakeChat {
    pub fn with_token_count(count: i64) -> Self {
        Self {
            token_count: Some(count),
            ..Self::default()
        }
    }

    pub fn replying(mut self, text: &str, tokens_spent: i64) -> Self {
        self.reply = Some(Completion {
            text: text.to_string(),
            tokens_spent,
        });
        self
    }

    pub fn failing_completion(mut self) -> Self {
        self.reply = None;
        self
    }

    pub fn failing_tokenizer(mut self) -> Self {
        self.token_count = None;
        self
    }

    pub fn tokenize_calls(&self) -> usize {
        self.tokenize_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    /// Context turns passed to the most recent completion
    pub fn last_context(&self) -> Vec<Turn> {
        self.last_context.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatCompletion for FakeChat {
    async fn complete(&self, _prompt: &str, context: &[Turn]) -> Result<Completion, BackendFailure> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_context.lock().unwrap() = context.to_vec();
        self.reply.clone().ok_or_else(|| failure(Service::Gpt))
    }

    async fn count_prompt_tokens(&self, _text: &str) -> Result<i64, BackendFailure> {
        self.tokenize_calls.fetch_add(1, Ordering::SeqCst);
        self.token_count.ok_or_else(|| failure(Service::Gpt))
    }
}
