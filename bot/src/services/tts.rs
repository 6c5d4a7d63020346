//! Yandex SpeechKit synthesis.

use async_trait::async_trait;
use tracing::info;

use super::{api_key_header, build_client, send, TextToSpeech};
use crate::config::TtsConfig;
use crate::error::{BackendFailure, FailureCause, Service};

pub struct YandexTts {
    client: reqwest::Client,
    config: TtsConfig,
}

impl YandexTts {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            client: build_client(config.service.timeout),
            config,
        }
    }
}

#[async_trait]
impl TextToSpeech for YandexTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, BackendFailure> {
        let service = &self.config.service;
        let request = self
            .client
            .post(&service.url)
            .header("Authorization", api_key_header(&service.api_key))
            .form(&[
                ("text", text),
                ("lang", service.language.as_str()),
                ("voice", self.config.voice.as_str()),
                ("folderId", service.folder_id.as_str()),
            ]);

        let response = send(Service::Tts, request, text).await?;
        let audio = response.bytes().await.map_err(|e| {
            BackendFailure::logged(Service::Tts, FailureCause::Transport(e.to_string()), text)
        })?;

        info!("TTS request success");
        Ok(audio.to_vec())
    }
}
