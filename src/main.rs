use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;

use airdrop_bot::bot::{Database, Dispatcher as EventDispatcher, RecipeAiClient, Stage, telegram};
use airdrop_bot::config::Config;
use airdrop_bot::telegram_log;

/// How often old idempotency keys are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

struct BotState {
    dispatcher: EventDispatcher<RecipeAiClient>,
    bot_username: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let bot = Bot::new(&config.bot_token);

    // Setup logging
    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("airdrop-bot")
        .filename_suffix("log")
        .build(&config.log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            eprintln!("Failed to open log directory {:?}: {e}", config.log_dir);
            return ExitCode::FAILURE;
        }
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        );

    if let Some(log_chat_id) = config.log_chat_id {
        let tg_layer = telegram_log::TelegramLogLayer::new(bot.clone(), log_chat_id);
        registry.with(tg_layer).init();
    } else {
        registry.init();
    }

    info!("🚀 Starting airdrop-bot...");
    info!(
        "Recipe AI at {} (timeout {:?}, {} retr{})",
        config.recipe_ai_base_url,
        config.retry.timeout,
        config.retry.max_retries,
        if config.retry.max_retries == 1 { "y" } else { "ies" }
    );

    // Without a store no event may be accepted
    let db = match Database::open(&config.db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to open database {:?}: {e}", config.db_path);
            return ExitCode::FAILURE;
        }
    };

    match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            if !me.username().eq_ignore_ascii_case(&config.bot_username) {
                warn!("BOT_USERNAME is @{} but the token belongs to @{}", config.bot_username, me.username());
            }
        }
        Err(e) => warn!("Failed to get bot info: {e}"),
    }
    telegram::register_commands(&bot).await;

    let pruner = {
        let db = db.clone();
        let retention = config.event_retention;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                match db.prune_events(retention) {
                    Ok(0) => {}
                    Ok(n) => info!("Pruned {n} processed event(s)"),
                    Err(e) => warn!("Event pruning failed: {e}"),
                }
            }
        })
    };

    let state = Arc::new(BotState {
        dispatcher: EventDispatcher::new(db.clone(), RecipeAiClient::new(config.recipe_ai_base_url.clone(), config.retry)),
        bot_username: config.bot_username.clone(),
    });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handle_message));

    // Ctrl-C stops polling and waits for in-flight handlers
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    pruner.abort();
    let _ = pruner.await;

    match Arc::try_unwrap(db) {
        Ok(db) => match db.close() {
            Ok(()) => info!("Database closed"),
            Err(e) => error!("Failed to close database: {e}"),
        },
        Err(_) => warn!("Database still referenced at shutdown"),
    }

    info!("👋 Stopped");
    ExitCode::SUCCESS
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(event) = telegram::inbound_event(&msg, &state.bot_username) else {
        return Ok(());
    };

    let chat_id = ChatId(event.chat_id);
    let user_id = event.user_id;
    let outcome = state.dispatcher.handle(event).await;
    if outcome.stage == Stage::Failed {
        info!("Replying to {user_id} with failure message");
    }

    if let Err(e) = telegram::send_reply(&bot, chat_id, &outcome.reply).await {
        warn!("Failed to send reply to {user_id}: {e}");
    }

    Ok(())
}
