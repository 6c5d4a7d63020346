//! Command routing and per-user UI mode.
//!
//! UI mode and pending next-step handlers live in memory only and are lost on
//! restart. Every inbound message produces exactly one [`Reply`].

use dashmap::DashMap;
use rand::seq::SliceRandom;
use shared::protocol::{INFO_LOG_DOCUMENT_NAME, WARNING_LOG_DOCUMENT_NAME};
use shared::{Command, Keyboard, Reply};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::GENERIC_FAILURE_MESSAGE;
use crate::logging::LogFiles;
use crate::pipeline::Pipeline;

const HELP_TEXT: &str = "Hi, I'm a support bot! I'll do my best to keep your spirits up. \
Just write or say something and I'll answer. \
(Every user has usage limits, there's no way around it)\n\n\
Here are my commands:\n\
/help or /start - list of all commands (you are here)\n\
/stats - usage statistics (spent tokens and so on)\n\n\
The debug zone starts here, if you are not sure you need these commands, don't use them:\n\
/toggle_debug - switch debug mode (debug commands become available, automatic answers are turned off)\n\
Only available in debug mode:\n\
/stt - test speech recognition\n\
/tts - test speech synthesis\n\
Log retrieval is not available to everyone:\n\
/get_logs_warning - log file from the warning level up\n\
/get_logs_info - log file from the info level up\n";

const REMARKS: [&str; 6] = [
    "Oh, cool!",
    "Well noticed!",
    "You took the words right out of my mouth",
    "You're so smart after all",
    "Surely something clever",
    "How concise!",
];

const UNKNOWN_HINT: &str =
    "\n\nIf you wanted me to do something, I didn't recognize the command, please check /help";

const MODE_TOGGLED: &str = "Debug mode toggled";
const SEND_VOICE: &str = "Send a voice message to test";
const SEND_TEXT: &str = "Send a text message to test";
const EXPECTED_VOICE: &str = "Expected a voice message, the test was cancelled";
const EXPECTED_TEXT: &str = "Expected a text message, the test was cancelled";
const EMPTY_LOG: &str = "The log file is empty!";

/// Per-user UI mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Debug,
}

impl Mode {
    fn keyboard(self) -> Keyboard {
        match self {
            Mode::Normal => Keyboard::Main,
            Mode::Debug => Keyboard::Debug,
        }
    }
}

/// What the next message of a user is consumed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStep {
    Transcribe,
    Synthesize,
}

/// Inbound message content, independent of the transport
#[derive(Debug, Clone)]
pub enum Content {
    Text(String),
    Voice { audio: Vec<u8>, duration_seconds: u32 },
}

pub struct Router {
    pipeline: Arc<Pipeline>,
    modes: DashMap<i64, Mode>,
    pending: DashMap<i64, PendingStep>,
    debug_user_id: i64,
    logs: LogFiles,
}

impl Router {
    pub fn new(pipeline: Arc<Pipeline>, debug_user_id: i64, logs: LogFiles) -> Self {
        Self {
            pipeline,
            modes: DashMap::new(),
            pending: DashMap::new(),
            debug_user_id,
            logs,
        }
    }

    /// Unset mode counts as normal
    pub fn mode(&self, external_id: i64) -> Mode {
        self.modes
            .get(&external_id)
            .map(|mode| *mode)
            .unwrap_or(Mode::Normal)
    }

    pub async fn handle(&self, external_id: i64, content: Content) -> Reply {
        let command = match &content {
            Content::Text(text) => Command::parse(text),
            Content::Voice { .. } => None,
        };

        // A pending step consumes the next message unless that message is a command.
        if command.is_none() {
            if let Some((_, step)) = self.pending.remove(&external_id) {
                return self.run_step(external_id, step, content).await;
            }
        } else {
            self.pending.remove(&external_id);
        }

        if let Some(command) = command {
            return self.command(external_id, command).await;
        }

        if self.mode(external_id) == Mode::Debug {
            return self.unknown(external_id);
        }

        match content {
            Content::Text(text) => self.pipeline.handle_text(external_id, &text).await,
            Content::Voice {
                audio,
                duration_seconds,
            } => {
                self.pipeline
                    .handle_voice(external_id, &audio, duration_seconds)
                    .await
            }
        }
    }

    async fn command(&self, external_id: i64, command: Command) -> Reply {
        if command.requires_debug_mode() && self.mode(external_id) != Mode::Debug {
            return self.unknown(external_id);
        }

        match command {
            Command::Start | Command::Help => {
                let mode = *self.modes.entry(external_id).or_insert(Mode::Normal);
                Reply::text(HELP_TEXT).with_keyboard(mode.keyboard())
            }
            Command::Stats => match self.pipeline.stats(external_id).await {
                Ok(stats) => {
                    let sizes = self.pipeline.block_sizes();
                    Reply::text(stats.render(sizes.seconds_per_block, sizes.characters_per_block))
                }
                Err(e) => {
                    if !e.is_rejection() {
                        error!(external_id, "Stats query failed: {}", e);
                    }
                    Reply::text(e.user_message())
                }
            },
            Command::ToggleDebug => {
                if let Err(e) = self.pipeline.check_capacity(external_id).await {
                    return Reply::text(e.user_message());
                }
                let mode = match self.mode(external_id) {
                    Mode::Debug => Mode::Normal,
                    Mode::Normal => Mode::Debug,
                };
                self.modes.insert(external_id, mode);
                info!(external_id, ?mode, "UI mode toggled");
                Reply::text(MODE_TOGGLED).with_keyboard(mode.keyboard())
            }
            Command::Stt => self.await_step(external_id, PendingStep::Transcribe).await,
            Command::Tts => self.await_step(external_id, PendingStep::Synthesize).await,
            Command::GetLogsWarning => {
                self.send_log(external_id, &self.logs.warning, WARNING_LOG_DOCUMENT_NAME)
                    .await
            }
            Command::GetLogsInfo => {
                self.send_log(external_id, &self.logs.info, INFO_LOG_DOCUMENT_NAME)
                    .await
            }
        }
    }

    async fn await_step(&self, external_id: i64, step: PendingStep) -> Reply {
        if let Err(e) = self.pipeline.check_capacity(external_id).await {
            return Reply::text(e.user_message());
        }
        self.pending.insert(external_id, step);
        Reply::text(match step {
            PendingStep::Transcribe => SEND_VOICE,
            PendingStep::Synthesize => SEND_TEXT,
        })
    }

    async fn run_step(&self, external_id: i64, step: PendingStep, content: Content) -> Reply {
        let reply = match (step, content) {
            (
                PendingStep::Transcribe,
                Content::Voice {
                    audio,
                    duration_seconds,
                },
            ) => {
                self.pipeline
                    .transcribe_only(external_id, &audio, duration_seconds)
                    .await
            }
            (PendingStep::Synthesize, Content::Text(text)) => {
                self.pipeline.synthesize_only(external_id, &text).await
            }
            (PendingStep::Transcribe, _) => Reply::text(EXPECTED_VOICE),
            (PendingStep::Synthesize, _) => Reply::text(EXPECTED_TEXT),
        };
        reply.with_keyboard(Keyboard::Debug)
    }

    async fn send_log(&self, external_id: i64, path: &Path, file_name: &str) -> Reply {
        if external_id != self.debug_user_id {
            return self.unknown(external_id);
        }

        match tokio::fs::read(path).await {
            Ok(bytes) if !bytes.is_empty() => Reply::document(file_name, bytes),
            Ok(_) => Reply::text(EMPTY_LOG),
            Err(e) if e.kind() == ErrorKind::NotFound => Reply::text(EMPTY_LOG),
            Err(e) => {
                error!("Failed to read {}: {}", path.display(), e);
                Reply::text(GENERIC_FAILURE_MESSAGE)
            }
        }
    }

    fn unknown(&self, external_id: i64) -> Reply {
        let remark = REMARKS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(REMARKS[0]);
        Reply::text(format!("{}{}", remark, UNKNOWN_HINT))
            .with_keyboard(self.mode(external_id).keyboard())
    }
}
