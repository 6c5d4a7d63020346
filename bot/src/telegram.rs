//! Thin Bot API client: long polling, replies and file transfer.

use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::{Keyboard, Reply, ReplyBody};
use std::time::Duration;

use crate::config::TelegramConfig;

/// Slack added on top of the long-poll timeout for the HTTP request itself
const POLL_REQUEST_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("network error: {0}")]
    Network(String),

    #[error("Bot API error {status}: {description}")]
    Api { status: u16, description: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("file {0} has no download path")]
    MissingFilePath(String),
}

impl From<reqwest::Error> for TelegramError {
    fn from(e: reqwest::Error) -> Self {
        TelegramError::Network(e.to_string())
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<Sender>,
    pub chat: Chat,
    pub text: Option<String>,
    pub voice: Option<Voice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sender {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub file_id: String,
    pub duration: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct File {
    pub file_id: String,
    pub file_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct KeyboardButton {
    text: String,
}

#[derive(Debug, Serialize)]
struct ReplyKeyboardMarkup {
    keyboard: Vec<Vec<KeyboardButton>>,
    resize_keyboard: bool,
}

impl From<Keyboard> for ReplyKeyboardMarkup {
    fn from(keyboard: Keyboard) -> Self {
        Self {
            keyboard: keyboard
                .layout()
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|command| KeyboardButton {
                            text: command.to_string(),
                        })
                        .collect()
                })
                .collect(),
            resize_keyboard: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct ReplyParameters {
    message_id: i64,
    allow_sending_without_reply: bool,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_parameters: Option<ReplyParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<ReplyKeyboardMarkup>,
}

#[derive(Debug, Serialize)]
struct GetUpdates<'a> {
    offset: i64,
    timeout: u64,
    allowed_updates: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct GetFile<'a> {
    file_id: &'a str,
}

// ============================================================================
// Client
// ============================================================================

pub struct TelegramClient {
    client: Client,
    config: TelegramConfig,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> Self {
        let client = Client::builder()
            .timeout(config.poll_timeout + POLL_REQUEST_SLACK)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self { client, config }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.config.api_url, self.config.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.config.api_url, self.config.token, file_path
        )
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, TelegramError> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TelegramError::Network(e.to_string()))?;

        // The API answers errors with the same envelope and a non-200 status.
        let envelope: ApiResponse<T> = serde_json::from_slice(&body)
            .map_err(|e| TelegramError::Parse(format!("status {}: {}", status, e)))?;

        match envelope {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(TelegramError::Api {
                status,
                description: description.unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        let request = self.client.post(self.method_url("getUpdates")).json(&GetUpdates {
            offset,
            timeout: self.config.poll_timeout.as_secs(),
            allowed_updates: &["message"],
        });
        self.call(request).await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        reply_to: Option<i64>,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<(), TelegramError> {
        let request = self.client.post(self.method_url("sendMessage")).json(&SendMessage {
            chat_id,
            text,
            reply_parameters: reply_to.map(|message_id| ReplyParameters {
                message_id,
                allow_sending_without_reply: true,
            }),
            reply_markup: keyboard.map(ReplyKeyboardMarkup::from),
        });
        self.call::<serde_json::Value>(request).await?;
        Ok(())
    }

    pub async fn send_voice(
        &self,
        chat_id: i64,
        audio: Vec<u8>,
        keyboard: Option<Keyboard>,
    ) -> Result<(), TelegramError> {
        let part = Part::bytes(audio)
            .file_name("voice.ogg")
            .mime_str("audio/ogg")?;
        let form = with_keyboard(
            Form::new().text("chat_id", chat_id.to_string()).part("voice", part),
            keyboard,
        )?;
        let request = self.client.post(self.method_url("sendVoice")).multipart(form);
        self.call::<serde_json::Value>(request).await?;
        Ok(())
    }

    pub async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        keyboard: Option<Keyboard>,
    ) -> Result<(), TelegramError> {
        let part = Part::bytes(bytes).file_name(file_name.to_string());
        let form = with_keyboard(
            Form::new()
                .text("chat_id", chat_id.to_string())
                .part("document", part),
            keyboard,
        )?;
        let request = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form);
        self.call::<serde_json::Value>(request).await?;
        Ok(())
    }

    /// Deliver one reply in the form its body asks for
    pub async fn send_reply(
        &self,
        chat_id: i64,
        reply_to: i64,
        reply: Reply,
    ) -> Result<(), TelegramError> {
        match reply.body {
            ReplyBody::Text { text } => {
                self.send_message(chat_id, Some(reply_to), &text, reply.keyboard)
                    .await
            }
            ReplyBody::Voice { audio } => self.send_voice(chat_id, audio, reply.keyboard).await,
            ReplyBody::Document { file_name, bytes } => {
                self.send_document(chat_id, &file_name, bytes, reply.keyboard)
                    .await
            }
        }
    }

    pub async fn get_file(&self, file_id: &str) -> Result<File, TelegramError> {
        let request = self
            .client
            .post(self.method_url("getFile"))
            .json(&GetFile { file_id });
        self.call(request).await
    }

    /// Resolve a file id and download its contents
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>, TelegramError> {
        let file = self.get_file(file_id).await?;
        let path = file
            .file_path
            .ok_or_else(|| TelegramError::MissingFilePath(file.file_id.clone()))?;

        let response = self.client.get(self.file_url(&path)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TelegramError::Api {
                status: status.as_u16(),
                description: format!("download of {} failed", path),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

fn with_keyboard(form: Form, keyboard: Option<Keyboard>) -> Result<Form, TelegramError> {
    match keyboard {
        Some(keyboard) => {
            let markup = serde_json::to_string(&ReplyKeyboardMarkup::from(keyboard))
                .map_err(|e| TelegramError::Parse(e.to_string()))?;
            Ok(form.text("reply_markup", markup))
        }
        None => Ok(form),
    }
}
