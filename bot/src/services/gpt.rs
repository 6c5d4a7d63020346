//! YandexGPT completion and tokenization.

use async_trait::async_trait;
use serde::de::{self, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use shared::Role;
use tracing::info;

use super::{api_key_header, build_client, decode_json, send, ChatCompletion, Completion};
use crate::config::GptConfig;
use crate::error::{BackendFailure, FailureCause, Service};
use crate::models::Turn;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionOptions {
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompletionRequest<'a> {
    model_uri: &'a str,
    completion_options: CompletionOptions,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    result: CompletionResult,
}

#[derive(Debug, Deserialize)]
struct CompletionResult {
    alternatives: Vec<Alternative>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    message: AlternativeMessage,
}

#[derive(Debug, Deserialize)]
struct AlternativeMessage {
    text: String,
}

// The API encodes int64 counters as JSON strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Usage {
    #[serde(deserialize_with = "int_or_string")]
    completion_tokens: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenizeRequest<'a> {
    model_uri: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenizeResponse {
    tokens: Vec<IgnoredAny>,
}

fn int_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(n) => Ok(n),
        IntOrString::Str(s) => s.parse().map_err(de::Error::custom),
    }
}

pub struct YandexGpt {
    client: reqwest::Client,
    model_uri: String,
    config: GptConfig,
}

impl YandexGpt {
    pub fn new(config: GptConfig) -> Self {
        Self {
            client: build_client(config.timeout),
            model_uri: format!("gpt://{}/{}", config.folder_id, config.params.model),
            config,
        }
    }

    fn messages<'a>(&'a self, prompt: &'a str, context: &'a [Turn]) -> Vec<ApiMessage<'a>> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        messages.push(ApiMessage {
            role: "system",
            text: &self.config.params.system_prompt,
        });
        messages.extend(context.iter().map(|turn| ApiMessage {
            role: turn.role.as_str(),
            text: &turn.text,
        }));
        messages.push(ApiMessage {
            role: Role::User.as_str(),
            text: prompt,
        });
        messages
    }
}

#[async_trait]
impl ChatCompletion for YandexGpt {
    async fn complete(&self, prompt: &str, context: &[Turn]) -> Result<Completion, BackendFailure> {
        let params = &self.config.params;
        let body = CompletionRequest {
            model_uri: &self.model_uri,
            completion_options: CompletionOptions {
                temperature: params.temperature,
                max_tokens: params.max_tokens,
                stream: false,
            },
            messages: self.messages(prompt, context),
        };

        let request = self
            .client
            .post(&self.config.completion_url)
            .header("Authorization", api_key_header(&self.config.api_key))
            .json(&body);

        let response = send(Service::Gpt, request, prompt).await?;
        let body: CompletionResponse = decode_json(Service::Gpt, response, prompt).await?;

        let text = body
            .result
            .alternatives
            .into_iter()
            .next()
            .map(|alternative| alternative.message.text)
            .ok_or_else(|| {
                BackendFailure::logged(
                    Service::Gpt,
                    FailureCause::Decode("no alternatives in completion".to_string()),
                    prompt,
                )
            })?;

        info!("GPT request success");
        Ok(Completion {
            text,
            tokens_spent: body.result.usage.completion_tokens,
        })
    }

    async fn count_prompt_tokens(&self, text: &str) -> Result<i64, BackendFailure> {
        let request = self
            .client
            .post(&self.config.tokenize_url)
            .header("Authorization", api_key_header(&self.config.api_key))
            .json(&TokenizeRequest {
                model_uri: &self.model_uri,
                text,
            });

        let response = send(Service::Gpt, request, text).await?;
        let body: TokenizeResponse = decode_json(Service::Gpt, response, text).await?;

        Ok(body.tokens.len() as i64)
    }
}
