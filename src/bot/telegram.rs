//! Telegram side of the bot: update -> event, reply -> messages.

use teloxide::prelude::*;
use teloxide::types::{KeyboardButton, KeyboardMarkup, MenuButton};
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

use crate::bot::event::{Command, InboundEvent, Input, MENU_CHAT, MENU_HELP, MENU_STATUS, MENU_STOP};

/// Telegram caps a message at 4096 UTF-16 units; stay well below.
pub const MAX_CHUNK_UNITS: usize = 4000;

/// Turn a Telegram message into an event. Only private chats are served.
pub fn inbound_event(msg: &Message, bot_username: &str) -> Option<InboundEvent> {
    if !msg.chat.is_private() {
        return None;
    }
    let user = msg.from.as_ref()?;
    if user.is_bot {
        return None;
    }

    let input = match msg.text() {
        Some(text) => Input::parse(text, bot_username)?,
        None => Input::Unsupported,
    };

    Some(InboundEvent {
        key: InboundEvent::key_for(msg.chat.id.0, msg.id.0 as i64),
        chat_id: msg.chat.id.0,
        user_id: user.id.0 as i64,
        username: user.username.clone(),
        input,
    })
}

pub fn menu_keyboard() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(MENU_CHAT), KeyboardButton::new(MENU_STOP)],
        vec![KeyboardButton::new(MENU_STATUS), KeyboardButton::new(MENU_HELP)],
    ])
    .resize_keyboard()
}

/// Send a reply, split into as many messages as needed, menu on the last one.
pub async fn send_reply(bot: &Bot, chat_id: ChatId, text: &str) -> ResponseResult<()> {
    let chunks = split_message(text, MAX_CHUNK_UNITS);
    let last = chunks.len().saturating_sub(1);
    for (i, chunk) in chunks.into_iter().enumerate() {
        let request = bot.send_message(chat_id, chunk);
        if i == last {
            request.reply_markup(menu_keyboard()).await?;
        } else {
            request.await?;
        }
    }
    Ok(())
}

/// Split on line boundaries where possible, never inside a char.
/// `max_units` counts UTF-16 code units, the way Telegram measures length.
pub fn split_message(text: &str, max_units: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = utf16_len(line);
        if current_len + line_len <= max_units {
            current.push_str(line);
            current_len += line_len;
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= max_units {
            current.push_str(line);
            current_len = line_len;
            continue;
        }
        // A single line longer than the limit
        for c in line.chars() {
            let c_len = c.len_utf16();
            if current_len + c_len > max_units && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current.push(c);
            current_len += c_len;
        }
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Register the command list and show it behind the menu button.
pub async fn register_commands(bot: &Bot) {
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to set bot commands: {e}");
    }
    if let Err(e) = bot.set_chat_menu_button().menu_button(MenuButton::Commands).await {
        warn!("Failed to set menu button: {e}");
    }
    info!("Registered {} bot commands", Command::bot_commands().len());
}
