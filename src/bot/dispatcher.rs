//! Event dispatcher - validates an inbound event, consults Recipe AI when
//! needed and commits the result before anything is sent back.
//!
//! Every event ends in exactly one reply: either `Responded` after the
//! storage commit, or `Failed` with a message that never claims success.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};

use crate::bot::database::{Database, Exchange, Mode, Mutation, Preferences, StorageError, UserState, WriteOutcome};
use crate::bot::event::{Command, InboundEvent, Input, Taste, parse_taste};
use crate::bot::locks::UserLocks;
use crate::bot::recipe_ai::{ChatRequest, ExternalError, Level, MAX_MESSAGE_CHARS, RecipeAi};

pub const WELCOME_TEXT: &str = "Welcome! Use the menu below.\n\n\
    • Chat: ask Recipe AI about ingredients, steps and substitutions\n\
    • Status: see your profile and taste settings\n\
    • Help: list all commands";

pub const CHAT_INTRO_TEXT: &str = "🤖 Recipe AI Chat\n\n\
    Send me a message about recipes (ingredients, steps, substitutions, etc.).\n\
    To exit, press Stop.";

pub const CHAT_EXIT_TEXT: &str = "Recipe AI chat closed. Use the menu below.";

pub const IDLE_HINT_TEXT: &str = "Use the menu buttons below.";

pub const EXTERNAL_FAILURE_TEXT: &str = "Recipe AI is not available right now. Please try again later.";

pub const STORAGE_FAILURE_TEXT: &str = "⚠️ Internal error: your request was not saved. Please try again.";

const TASTE_USAGE: &str = "Usage: /taste <spiciness|saltiness> <low|normal|high>";

/// Lifecycle of one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validated,
    ExternalCallPending,
    Persisting,
    Responded,
    Failed,
}

#[derive(Debug)]
pub enum DispatchError {
    /// Bad input; nothing was called or written.
    Validation(String),
    External(ExternalError),
    Storage(StorageError),
}

impl DispatchError {
    /// Text shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            DispatchError::Validation(msg) => msg.clone(),
            DispatchError::External(ExternalError::Validation(msg)) => {
                format!("Your message can't be sent to Recipe AI: {msg}.")
            }
            DispatchError::External(_) => EXTERNAL_FAILURE_TEXT.to_string(),
            DispatchError::Storage(_) => STORAGE_FAILURE_TEXT.to_string(),
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Validation(e) => write!(f, "validation: {e}"),
            DispatchError::External(e) => write!(f, "recipe ai: {e}"),
            DispatchError::Storage(e) => write!(f, "storage: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Validation(_) => None,
            DispatchError::External(e) => Some(e),
            DispatchError::Storage(e) => Some(e),
        }
    }
}

impl From<ExternalError> for DispatchError {
    fn from(e: ExternalError) -> Self {
        DispatchError::External(e)
    }
}

impl From<StorageError> for DispatchError {
    fn from(e: StorageError) -> Self {
        DispatchError::Storage(e)
    }
}

/// Result of handling one event.
#[derive(Debug)]
pub struct Outcome {
    /// `Responded` or `Failed`.
    pub stage: Stage,
    pub reply: String,
    pub error: Option<DispatchError>,
    /// The event was committed before and its stored reply is replayed.
    pub replayed: bool,
}

/// A validated event, decided before any side effect.
#[derive(Debug, Clone, PartialEq)]
enum Action {
    Start,
    EnterChat,
    LeaveChat,
    Help,
    Status,
    SetTaste(Taste, Level),
    AskRecipeAi(String),
    Hint,
}

pub struct Dispatcher<A> {
    db: Arc<Database>,
    ai: A,
    locks: UserLocks,
}

impl<A: RecipeAi> Dispatcher<A> {
    pub fn new(db: Arc<Database>, ai: A) -> Self {
        Self { db, ai, locks: UserLocks::new() }
    }

    /// Handle one event to completion. Events of the same user are processed
    /// one at a time in arrival order.
    pub async fn handle(&self, event: InboundEvent) -> Outcome {
        let _guard = self.locks.lock(event.user_id).await;
        let mut stage = Stage::Received;

        match self.process(&event, &mut stage).await {
            Ok((reply, replayed)) => {
                debug!("Event {} responded (replayed: {replayed})", event.key);
                Outcome { stage: Stage::Responded, reply, error: None, replayed }
            }
            Err(e) => {
                match &e {
                    DispatchError::Validation(msg) => info!("Event {} rejected: {msg}", event.key),
                    DispatchError::External(err) => warn!("Event {} failed at {stage:?}: {err}", event.key),
                    DispatchError::Storage(err) => error!("Event {} failed at {stage:?}: {err}", event.key),
                }
                Outcome { stage: Stage::Failed, reply: e.user_message(), error: Some(e), replayed: false }
            }
        }
    }

    async fn process(&self, event: &InboundEvent, stage: &mut Stage) -> Result<(String, bool), DispatchError> {
        if let Some(reply) = self.db.processed_reply(&event.key)? {
            info!("Event {} redelivered, replaying stored reply", event.key);
            return Ok((reply, true));
        }

        let state = self.db.read_state(event.user_id)?;
        let action = validate(&event.input, state.as_ref())?;
        *stage = Stage::Validated;
        debug!("Event {} validated as {:?}", event.key, action);

        let mut mutation = Mutation { username: event.username.clone(), ..Default::default() };
        let reply = match action {
            Action::Start => {
                if state.is_none() {
                    info!("New user {} ({:?})", event.user_id, event.username);
                }
                mutation.mode = Some(Mode::Idle);
                WELCOME_TEXT.to_string()
            }
            Action::EnterChat => {
                mutation.mode = Some(Mode::Chat);
                CHAT_INTRO_TEXT.to_string()
            }
            Action::LeaveChat => {
                mutation.mode = Some(Mode::Idle);
                CHAT_EXIT_TEXT.to_string()
            }
            Action::Help => help_text(),
            Action::Status => status_text(state.as_ref()),
            Action::SetTaste(taste, level) => {
                let mut preferences = state.as_ref().map(|s| s.preferences).unwrap_or_default();
                match taste {
                    Taste::Spiciness => preferences.spiciness = level,
                    Taste::Saltiness => preferences.saltiness = level,
                }
                mutation.preferences = Some(preferences);
                format!("✅ {} set to {}.", capitalize(taste.as_str()), level.as_str())
            }
            Action::AskRecipeAi(question) => {
                *stage = Stage::ExternalCallPending;
                let preferences = state.as_ref().map(|s| s.preferences).unwrap_or_default();
                let request = ChatRequest {
                    message: question.clone(),
                    user_id: event.user_id.to_string(),
                    spiciness: preferences.spiciness,
                    saltiness: preferences.saltiness,
                };
                let answer = self.ai.chat(&request).await?.render();
                mutation.exchange = Some(Exchange { question, answer: answer.clone() });
                answer
            }
            Action::Hint => IDLE_HINT_TEXT.to_string(),
        };

        *stage = Stage::Persisting;
        match self.db.write_state(event.user_id, &event.key, &mutation, &reply)? {
            WriteOutcome::Committed => Ok((reply, false)),
            WriteOutcome::Duplicate { reply } => Ok((reply, true)),
        }
    }
}

fn validate(input: &Input, state: Option<&UserState>) -> Result<Action, DispatchError> {
    let mode = state.map(|s| s.mode).unwrap_or_default();
    match input {
        Input::Command(Command::Start(payload)) => {
            if !payload.is_empty() {
                debug!("Start payload ignored: {payload}");
            }
            Ok(Action::Start)
        }
        Input::Command(Command::Chat) => Ok(Action::EnterChat),
        Input::Command(Command::Stop) => Ok(Action::LeaveChat),
        Input::Command(Command::Status) => Ok(Action::Status),
        Input::Command(Command::Help) => Ok(Action::Help),
        Input::Command(Command::Taste(args)) => parse_taste(args)
            .map(|(taste, level)| Action::SetTaste(taste, level))
            .ok_or_else(|| DispatchError::Validation(TASTE_USAGE.to_string())),
        Input::Text(text) if text.is_empty() => Err(DispatchError::Validation("Please send a text message.".into())),
        Input::Text(text) if mode == Mode::Chat => {
            if text.chars().count() > MAX_MESSAGE_CHARS {
                return Err(DispatchError::Validation(format!(
                    "Your message is too long. Please keep it under {MAX_MESSAGE_CHARS} characters."
                )));
            }
            Ok(Action::AskRecipeAi(text.clone()))
        }
        Input::Text(_) => Ok(Action::Hint),
        Input::UnknownCommand(name) => Err(DispatchError::Validation(format!(
            "Unknown command /{name}. Send /help to see what I can do."
        ))),
        Input::BadArguments(e) => Err(DispatchError::Validation(format!("Couldn't read that command: {e}."))),
        Input::Unsupported => Err(DispatchError::Validation("Please send a text message.".into())),
    }
}

fn help_text() -> String {
    format!("{}\n\nOr use the menu buttons below.", Command::descriptions())
}

fn status_text(state: Option<&UserState>) -> String {
    let registered = state
        .map(|s| s.created_at)
        .unwrap_or_else(Utc::now)
        .format("%Y-%m-%d %H:%M UTC");
    let mode = state.map(|s| s.mode).unwrap_or_default();
    let preferences: Preferences = state.map(|s| s.preferences).unwrap_or_default();
    let exchanges = state.map(|s| s.exchange_count).unwrap_or(0);

    format!(
        "📊 Status\n\n\
         Registered: {registered}\n\
         Recipe AI chat: {}\n\
         Spiciness: {}\n\
         Saltiness: {}\n\
         Questions asked: {exchanges}",
        if mode == Mode::Chat { "on" } else { "off" },
        preferences.spiciness.as_str(),
        preferences.saltiness.as_str(),
    )
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
