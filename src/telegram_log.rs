//! Forward WARN/ERROR events of this crate to an operator chat.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::bot::telegram::{MAX_CHUNK_UNITS, split_message};

/// Lines queued before new ones are dropped.
const QUEUE_CAPACITY: usize = 256;

/// Lines per Telegram message.
const MAX_BATCH: usize = 20;

pub struct TelegramLogLayer {
    tx: mpsc::Sender<String>,
}

impl TelegramLogLayer {
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(QUEUE_CAPACITY);

        tokio::spawn(async move {
            let mut batch: Vec<String> = Vec::new();
            while let Some(line) = rx.recv().await {
                batch.push(line);
                // Collect whatever else arrived in the meantime
                while batch.len() < MAX_BATCH {
                    match rx.try_recv() {
                        Ok(line) => batch.push(line),
                        Err(_) => break,
                    }
                }
                send_log(&bot, chat_id, &batch.join("\n")).await;
                batch.clear();
                // Stay clear of Telegram's per-chat rate limit
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        Self { tx }
    }
}

async fn send_log(bot: &Bot, chat_id: ChatId, text: &str) {
    let Some(text) = split_message(text, MAX_CHUNK_UNITS).into_iter().next() else {
        return;
    };
    if let Err(e) = bot.send_message(chat_id, text).await {
        // Not through tracing, that would loop back here
        eprintln!("Failed to send log to Telegram: {e}");
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if self.message.is_empty() {
            self.message = format!("{} = {:?}", field.name(), value);
        } else {
            self.message.push_str(&format!(", {} = {:?}", field.name(), value));
        }
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // teloxide and reqwest log their own send failures
        if *metadata.level() > Level::WARN || !metadata.target().starts_with(env!("CARGO_CRATE_NAME")) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let prefix = if *metadata.level() == Level::ERROR { "❌" } else { "⚠️" };
        if self.tx.try_send(format!("{prefix} {}", visitor.message)).is_err() {
            eprintln!("Log queue full, message dropped");
        }
    }
}
