//! Inbound events as the dispatcher sees them.

use std::sync::LazyLock;

use regex::Regex;
use teloxide::utils::command::{BotCommands, ParseError};

use crate::bot::recipe_ai::Level;

pub const MENU_CHAT: &str = "🤖 Chat";
pub const MENU_STOP: &str = "🛑 Stop";
pub const MENU_STATUS: &str = "📊 Status";
pub const MENU_HELP: &str = "❓ Help";

/// Menu labels, with or without the emoji.
static MENU_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:🤖\s*)?(chat)$|^(?:🛑\s*)?(stop)$|^(?:📊\s*)?(status)$|^(?:❓\s*)?(help)$")
        .expect("menu regex")
});

static TASTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(spiciness|spicy|saltiness|salty)\s+(low|normal|high)$").expect("taste regex")
});

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "open the main menu")]
    Start(String),
    #[command(description = "chat with Recipe AI")]
    Chat,
    #[command(description = "leave Recipe AI chat")]
    Stop,
    #[command(description = "show your profile")]
    Status,
    #[command(description = "set a taste, e.g. /taste spiciness high")]
    Taste(String),
    #[command(description = "show this text")]
    Help,
}

/// What the user sent, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(Command),
    Text(String),
    /// A slash command this bot does not know.
    UnknownCommand(String),
    /// A known command with unparsable arguments.
    BadArguments(String),
    /// Photo, sticker, voice and the like.
    Unsupported,
}

impl Input {
    /// Parse message text. `None` means the text is addressed to another bot.
    pub fn parse(text: &str, bot_username: &str) -> Option<Self> {
        let text = text.trim();

        if text.starts_with('/') {
            return match Command::parse(text, bot_username) {
                Ok(command) => Some(Input::Command(command)),
                Err(ParseError::WrongBotName(_)) => None,
                Err(ParseError::UnknownCommand(name)) => Some(Input::UnknownCommand(name)),
                Err(e) => Some(Input::BadArguments(e.to_string())),
            };
        }

        if let Some(caps) = MENU_RE.captures(text) {
            let command = if caps.get(1).is_some() {
                Command::Chat
            } else if caps.get(2).is_some() {
                Command::Stop
            } else if caps.get(3).is_some() {
                Command::Status
            } else {
                Command::Help
            };
            return Some(Input::Command(command));
        }

        Some(Input::Text(text.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Taste {
    Spiciness,
    Saltiness,
}

impl Taste {
    pub fn as_str(&self) -> &'static str {
        match self {
            Taste::Spiciness => "spiciness",
            Taste::Saltiness => "saltiness",
        }
    }
}

/// Parse `/taste` arguments such as `spicy high`.
pub fn parse_taste(args: &str) -> Option<(Taste, Level)> {
    let caps = TASTE_RE.captures(args.trim())?;
    let taste = if caps[1].to_lowercase().starts_with("spic") {
        Taste::Spiciness
    } else {
        Taste::Saltiness
    };
    Some((taste, Level::parse(&caps[2])?))
}

/// One user-originated update.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Unique per Telegram message; redeliveries carry the same key.
    pub key: String,
    pub chat_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub input: Input,
}

impl InboundEvent {
    pub fn key_for(chat_id: i64, message_id: i64) -> String {
        format!("{chat_id}:{message_id}")
    }
}
