//! Long-polling loop feeding updates to the router.
//!
//! Updates are handled concurrently, one task each, while a per-user mutex
//! keeps the messages of a single user strictly sequential.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::GENERIC_FAILURE_MESSAGE;
use crate::router::{Content, Router};
use crate::telegram::{Message, TelegramClient};
use shared::Reply;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct Dispatcher {
    router: Arc<Router>,
    client: Arc<TelegramClient>,
    user_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>, client: Arc<TelegramClient>) -> Self {
        Self {
            router,
            client,
            user_locks: DashMap::new(),
        }
    }

    fn user_lock(&self, external_id: i64) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(external_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Poll forever; transport errors are logged and retried with backoff
    pub async fn run(self: Arc<Self>) {
        let mut offset = 0;
        let mut backoff = INITIAL_BACKOFF;
        info!("Polling for updates");

        loop {
            match self.client.get_updates(offset).await {
                Ok(updates) => {
                    backoff = INITIAL_BACKOFF;
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        if let Some(message) = update.message {
                            let dispatcher = self.clone();
                            tokio::spawn(async move { dispatcher.dispatch(message).await });
                        }
                    }
                }
                Err(e) => {
                    warn!("getUpdates failed, retrying in {:?}: {}", backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn dispatch(&self, message: Message) {
        let Some(sender) = message.from.as_ref() else {
            return;
        };
        let external_id = sender.id;
        let chat_id = message.chat.id;
        let message_id = message.message_id;

        let lock = self.user_lock(external_id);
        {
            let _serialized = lock.lock().await;
            self.answer(&message, external_id, chat_id, message_id).await;
        }
        drop(lock);
        self.release_user_lock(external_id);
    }

    async fn answer(&self, message: &Message, external_id: i64, chat_id: i64, message_id: i64) {
        let reply = match self.content(message).await {
            Some(Ok(content)) => self.router.handle(external_id, content).await,
            Some(Err(reply)) => reply,
            None => return,
        };

        if let Err(e) = self.client.send_reply(chat_id, message_id, reply).await {
            error!(external_id, "Failed to deliver reply: {}", e);
        }
    }

    /// Forget the lock once no task holds or waits on it
    fn release_user_lock(&self, external_id: i64) {
        self.user_locks
            .remove_if(&external_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Text or downloaded voice; `None` for messages the bot ignores
    async fn content(&self, message: &Message) -> Option<Result<Content, Reply>> {
        if let Some(voice) = &message.voice {
            return Some(match self.client.download(&voice.file_id).await {
                Ok(audio) => Ok(Content::Voice {
                    audio,
                    duration_seconds: voice.duration,
                }),
                Err(e) => {
                    error!("Failed to download voice {}: {}", voice.file_id, e);
                    Err(Reply::text(GENERIC_FAILURE_MESSAGE))
                }
            });
        }
        message.text.clone().map(|text| Ok(Content::Text(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Quotas, TelegramConfig};
    use crate::ledger::memory::MemoryLedger;
    use crate::logging::LogFiles;
    use crate::pipeline::{Backends, Pipeline};
    use crate::telegram::{Chat, Sender, Voice};
    use crate::testing::{FakeChat, FakeStt, FakeTts};
    use crate::units::BlockSizes;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher(server: &MockServer, chat: Arc<FakeChat>) -> Dispatcher {
        let pipeline = Pipeline::new(
            Arc::new(MemoryLedger::new()),
            Backends {
                stt: Arc::new(FakeStt::returning("heard")),
                tts: Arc::new(FakeTts::returning(b"OggS")),
                chat,
            },
            Quotas::default(),
            BlockSizes::default(),
            10,
        );
        let router = Router::new(
            Arc::new(pipeline),
            0,
            LogFiles::in_dir(std::path::Path::new("unused-logs")),
        );
        let client = TelegramClient::new(TelegramConfig {
            api_url: server.uri(),
            token: "t".to_string(),
            poll_timeout: Duration::from_secs(1),
        });
        Dispatcher::new(Arc::new(router), Arc::new(client))
    }

    fn message(text: Option<&str>, voice: Option<Voice>) -> Message {
        Message {
            message_id: 10,
            from: Some(Sender { id: 77 }),
            chat: Chat { id: 77 },
            text: text.map(str::to_string),
            voice,
        }
    }

    fn sent() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": {"message_id": 11}}))
    }

    #[tokio::test]
    async fn text_is_answered_in_reply_to_the_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bott/sendMessage"))
            .and(body_partial_json(json!({
                "chat_id": 77,
                "text": "answer",
                "reply_parameters": {"message_id": 10}
            })))
            .respond_with(sent())
            .expect(1)
            .mount(&server)
            .await;

        let chat = Arc::new(FakeChat::default().replying("answer", 5));
        dispatcher(&server, chat.clone())
            .dispatch(message(Some("hi"), None))
            .await;

        assert_eq!(chat.complete_calls(), 1);
    }

    #[tokio::test]
    async fn failed_voice_download_gets_the_generic_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bott/getFile"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "description": "Bad Request: invalid file_id"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bott/sendMessage"))
            .and(body_partial_json(json!({"text": GENERIC_FAILURE_MESSAGE})))
            .respond_with(sent())
            .expect(1)
            .mount(&server)
            .await;

        let chat = Arc::new(FakeChat::default());
        let voice = Voice {
            file_id: "broken".to_string(),
            duration: 5,
        };
        dispatcher(&server, chat.clone())
            .dispatch(message(None, Some(voice)))
            .await;

        assert_eq!(chat.tokenize_calls(), 0);
    }

    #[tokio::test]
    async fn messages_without_text_or_voice_are_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sent())
            .expect(0)
            .mount(&server)
            .await;

        dispatcher(&server, Arc::new(FakeChat::default()))
            .dispatch(message(None, None))
            .await;
    }

    #[tokio::test]
    async fn user_locks_are_released_after_dispatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bott/sendMessage"))
            .respond_with(sent())
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&server, Arc::new(FakeChat::default()));
        dispatcher.dispatch(message(Some("hi"), None)).await;
        dispatcher.dispatch(message(None, None)).await;

        assert!(dispatcher.user_locks.is_empty());
    }

    #[tokio::test]
    async fn held_user_lock_survives_release() {
        let server = MockServer::start().await;
        let dispatcher = dispatcher(&server, Arc::new(FakeChat::default()));

        let held = dispatcher.user_lock(77);
        dispatcher.release_user_lock(77);
        assert_eq!(dispatcher.user_locks.len(), 1);

        drop(held);
        dispatcher.release_user_lock(77);
        assert!(dispatcher.user_locks.is_empty());
    }
}
