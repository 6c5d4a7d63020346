//! Yandex SpeechKit synchronous recognition.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{api_key_header, build_client, decode_json, send, SpeechToText};
use crate::config::ServiceConfig;
use crate::error::{BackendFailure, Service};

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    result: String,
}

pub struct YandexStt {
    client: reqwest::Client,
    config: ServiceConfig,
}

impl YandexStt {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            client: build_client(config.timeout),
            config,
        }
    }
}

#[async_trait]
impl SpeechToText for YandexStt {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, BackendFailure> {
        let request = self
            .client
            .post(&self.config.url)
            .header("Authorization", api_key_header(&self.config.api_key))
            .query(&[
                ("lang", self.config.language.as_str()),
                ("folderId", self.config.folder_id.as_str()),
            ])
            .body(audio.to_vec());

        let context = format!("{} bytes of audio", audio.len());
        let response = send(Service::Stt, request, &context).await?;
        let body: RecognizeResponse = decode_json(Service::Stt, response, &context).await?;

        info!("STT request success");
        Ok(body.result)
    }
}
