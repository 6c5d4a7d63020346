mod config;
mod db;
mod error;
mod ledger;
mod logging;
mod models;
mod pipeline;
mod polling;
mod router;
mod schema;
mod services;
mod telegram;
mod units;
mod validators;

#[cfg(test)]
mod testing;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;

use crate::config::Settings;
use crate::db::PgLedger;
use crate::logging::LogFiles;
use crate::pipeline::{Backends, Pipeline};
use crate::polling::Dispatcher;
use crate::router::Router;
use crate::services::{YandexGpt, YandexStt, YandexTts};
use crate::telegram::TelegramClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before clap reads them
    dotenvy::dotenv().ok();

    let settings = Settings::parse();
    settings.validate().context("Invalid configuration")?;

    let log_files = LogFiles::in_dir(&settings.logs_dir);
    let _log_guard = logging::init(&log_files)?;

    // Create database pool and bring the schema up to date
    let pool = db::create_pool(&settings.database_url)?;
    let applied = db::run_migrations(&pool)?;
    if applied.is_empty() {
        tracing::info!("Database schema is up to date");
    } else {
        tracing::info!("Applied {} migration(s): {}", applied.len(), applied.join(", "));
    }

    let backends = Backends {
        stt: Arc::new(YandexStt::new(settings.stt())),
        tts: Arc::new(YandexTts::new(settings.tts())),
        chat: Arc::new(YandexGpt::new(settings.gpt())),
    };

    let pipeline = Pipeline::new(
        Arc::new(PgLedger::new(pool)),
        backends,
        settings.quotas(),
        settings.block_sizes(),
        settings.gpt_context_turns,
    );

    let router = Router::new(Arc::new(pipeline), settings.debug_user_id, log_files);
    let client = TelegramClient::new(settings.telegram());
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(router), Arc::new(client)));

    tracing::info!(
        "Bot started (max {} users)",
        settings.max_users_amount_limit
    );

    tokio::select! {
        _ = dispatcher.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
