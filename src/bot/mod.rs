//! Bot core - relays Telegram messages to Recipe AI and keeps per-user state.

pub mod database;
pub mod dispatcher;
pub mod event;
pub mod locks;
pub mod recipe_ai;
pub mod telegram;

#[cfg(test)]
mod tests;

pub use database::Database;
pub use dispatcher::{Dispatcher, Outcome, Stage};
pub use event::{Command, InboundEvent, Input};
pub use recipe_ai::{RecipeAi, RecipeAiClient, RetryPolicy};
