//! Scenario tests for the dispatcher: one event in, one reply out, and the
//! store only changes when the whole event succeeded.
//!
//! Run with: cargo test bot::tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::database::{Database, Mode, StorageError};
use super::dispatcher::{
    CHAT_INTRO_TEXT, DispatchError, Dispatcher, EXTERNAL_FAILURE_TEXT, IDLE_HINT_TEXT, STORAGE_FAILURE_TEXT, Stage,
    WELCOME_TEXT,
};
use super::event::{Command, InboundEvent, Input};
use super::recipe_ai::{ChatReply, ChatRequest, ExternalError, Level, RecipeAi};

/// Recipe AI stand-in that plays back scripted results.
#[derive(Default)]
struct FakeAi {
    script: Mutex<VecDeque<Result<ChatReply, ExternalError>>>,
    requests: Mutex<Vec<ChatRequest>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeAi {
    fn answering(answers: &[&str]) -> Self {
        let fake = Self::default();
        for a in answers {
            fake.push(Ok(ChatReply { answer: a.to_string(), suggestions: vec![] }));
        }
        fake
    }

    fn failing(error: ExternalError) -> Self {
        let fake = Self::default();
        fake.push(Err(error));
        fake
    }

    fn push(&self, result: Result<ChatReply, ExternalError>) {
        self.script.lock().unwrap().push_back(result);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RecipeAi for FakeAi {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Err(ExternalError::Connection("script exhausted".into())))
    }
}

impl RecipeAi for Arc<FakeAi> {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, ExternalError> {
        (**self).chat(request).await
    }
}

fn dispatcher(ai: FakeAi) -> (Dispatcher<Arc<FakeAi>>, Arc<FakeAi>, Arc<Database>) {
    let db = Arc::new(Database::in_memory().unwrap());
    let ai = Arc::new(ai);
    (Dispatcher::new(db.clone(), ai.clone()), ai, db)
}

fn event(user_id: i64, message_id: i64, input: Input) -> InboundEvent {
    InboundEvent {
        key: InboundEvent::key_for(user_id, message_id),
        chat_id: user_id,
        user_id,
        username: Some(format!("user{user_id}")),
        input,
    }
}

fn command(user_id: i64, message_id: i64, command: Command) -> InboundEvent {
    event(user_id, message_id, Input::Command(command))
}

fn text(user_id: i64, message_id: i64, text: &str) -> InboundEvent {
    event(user_id, message_id, Input::Text(text.to_string()))
}

// =============================================================================
// FIRST CONTACT
// =============================================================================

mod first_contact {
    use super::*;

    #[tokio::test]
    async fn test_new_user_start_creates_state() {
        let (d, ai, db) = dispatcher(FakeAi::default());

        let outcome = d.handle(command(42, 1, Command::Start(String::new()))).await;

        assert_eq!(outcome.stage, Stage::Responded);
        assert_eq!(outcome.reply, WELCOME_TEXT);
        assert!(outcome.error.is_none());
        let state = db.read_state(42).unwrap().expect("user 42 should exist");
        assert_eq!(state.username.as_deref(), Some("user42"));
        assert_eq!(state.mode, Mode::Idle);
        assert_eq!(state.event_count, 1);
        assert_eq!(state.exchange_count, 0);
        assert_eq!(ai.calls(), 0);
    }

    #[tokio::test]
    async fn test_username_follows_the_sender() {
        let (d, _ai, db) = dispatcher(FakeAi::default());
        d.handle(command(44, 1, Command::Start(String::new()))).await;

        let mut anonymous = command(44, 2, Command::Status);
        anonymous.username = None;
        let outcome = d.handle(anonymous).await;

        assert_eq!(outcome.stage, Stage::Responded);
        let state = db.read_state(44).unwrap().unwrap();
        assert_eq!(state.username, None);
        assert_eq!(state.event_count, 2);
    }

    #[tokio::test]
    async fn test_plain_text_from_new_user_gets_hint() {
        let (d, ai, db) = dispatcher(FakeAi::default());

        let outcome = d.handle(text(43, 1, "hello")).await;

        assert_eq!(outcome.stage, Stage::Responded);
        assert_eq!(outcome.reply, IDLE_HINT_TEXT);
        assert!(db.read_state(43).unwrap().is_some());
        assert_eq!(ai.calls(), 0);
    }
}

// =============================================================================
// RECIPE AI CHAT
// =============================================================================

mod recipe_chat {
    use super::*;

    #[tokio::test]
    async fn test_chat_round_trip_is_persisted() {
        let (d, ai, db) = dispatcher(FakeAi::answering(&["Boil the pasta for 9 minutes."]));

        let intro = d.handle(command(42, 1, Command::Chat)).await;
        assert_eq!(intro.reply, CHAT_INTRO_TEXT);

        let outcome = d.handle(text(42, 2, "How long for spaghetti?")).await;

        assert_eq!(outcome.stage, Stage::Responded);
        assert_eq!(outcome.reply, "Boil the pasta for 9 minutes.");
        assert_eq!(ai.calls(), 1);
        let state = db.read_state(42).unwrap().unwrap();
        assert_eq!(state.mode, Mode::Chat);
        assert_eq!(state.exchange_count, 1);
        assert_eq!(state.event_count, 2);
    }

    #[tokio::test]
    async fn test_preferences_are_forwarded() {
        let (d, ai, _db) = dispatcher(FakeAi::answering(&["ok"]));

        d.handle(command(42, 1, Command::Taste("spicy high".into()))).await;
        d.handle(command(42, 2, Command::Chat)).await;
        d.handle(text(42, 3, "curry?")).await;

        let requests = ai.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message, "curry?");
        assert_eq!(requests[0].user_id, "42");
        assert_eq!(requests[0].spiciness, Level::High);
        assert_eq!(requests[0].saltiness, Level::Normal);
    }

    #[tokio::test]
    async fn test_stop_leaves_chat_mode() {
        let (d, ai, db) = dispatcher(FakeAi::default());

        d.handle(command(42, 1, Command::Chat)).await;
        d.handle(command(42, 2, Command::Stop)).await;
        let outcome = d.handle(text(42, 3, "still there?")).await;

        assert_eq!(outcome.reply, IDLE_HINT_TEXT);
        assert_eq!(db.read_state(42).unwrap().unwrap().mode, Mode::Idle);
        assert_eq!(ai.calls(), 0);
    }
}

// =============================================================================
// ALL-OR-NOTHING WITH RESPECT TO RECIPE AI
// =============================================================================

mod external_failures {
    use super::*;

    async fn assert_failure_leaves_state(error: ExternalError) {
        let (d, _ai, db) = dispatcher(FakeAi::failing(error));
        d.handle(command(42, 1, Command::Chat)).await;
        let before = db.read_state(42).unwrap().unwrap();

        let outcome = d.handle(text(42, 2, "risotto?")).await;

        assert_eq!(outcome.stage, Stage::Failed);
        assert_eq!(outcome.reply, EXTERNAL_FAILURE_TEXT);
        assert!(matches!(outcome.error, Some(DispatchError::External(_))));
        assert_eq!(db.read_state(42).unwrap().unwrap(), before);
        assert!(db.processed_reply("42:2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_http_500_changes_nothing() {
        assert_failure_leaves_state(ExternalError::Service { status: 500, body: "boom".into() }).await;
    }

    #[tokio::test]
    async fn test_timeout_changes_nothing() {
        assert_failure_leaves_state(ExternalError::Timeout).await;
    }

    #[tokio::test]
    async fn test_malformed_response_changes_nothing() {
        assert_failure_leaves_state(ExternalError::Malformed("no answer".into())).await;
    }

    #[tokio::test]
    async fn test_failed_event_can_be_retried_by_user() {
        let ai = FakeAi::failing(ExternalError::Timeout);
        ai.push(Ok(ChatReply { answer: "second time lucky".into(), suggestions: vec![] }));
        let (d, _ai, _db) = dispatcher(ai);
        d.handle(command(42, 1, Command::Chat)).await;

        assert_eq!(d.handle(text(42, 2, "soup?")).await.stage, Stage::Failed);
        let retry = d.handle(text(42, 3, "soup?")).await;
        assert_eq!(retry.stage, Stage::Responded);
        assert_eq!(retry.reply, "second time lucky");
    }
}

// =============================================================================
// STORAGE FAILURES
// =============================================================================

mod storage_failures {
    use super::*;

    #[tokio::test]
    async fn test_write_failure_rolls_back_and_reports_internal_error() {
        let (d, ai, db) = dispatcher(FakeAi::answering(&["an answer the user must not see"]));
        d.handle(command(42, 1, Command::Chat)).await;
        let before = db.read_state(42).unwrap().unwrap();

        db.fail_exchange_inserts();
        let outcome = d.handle(text(42, 2, "bread?")).await;

        assert_eq!(ai.calls(), 1);
        assert_eq!(outcome.stage, Stage::Failed);
        assert_eq!(outcome.reply, STORAGE_FAILURE_TEXT);
        assert!(matches!(outcome.error, Some(DispatchError::Storage(StorageError::Sqlite(_)))));
        assert_eq!(db.read_state(42).unwrap().unwrap(), before);
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

mod validation {
    use super::*;

    #[tokio::test]
    async fn test_invalid_input_fails_without_side_effects() {
        let (d, ai, db) = dispatcher(FakeAi::default());

        for input in [
            Input::UnknownCommand("wallet".into()),
            Input::Unsupported,
            Input::Command(Command::Taste("sweetness max".into())),
            Input::BadArguments("too many arguments".into()),
        ] {
            let outcome = d.handle(event(7, 1, input.clone())).await;
            assert_eq!(outcome.stage, Stage::Failed, "{input:?}");
            assert!(matches!(outcome.error, Some(DispatchError::Validation(_))));
            assert!(!outcome.reply.is_empty());
        }

        assert!(db.read_state(7).unwrap().is_none());
        assert_eq!(ai.calls(), 0);
    }

    #[tokio::test]
    async fn test_overlong_chat_message_is_rejected_locally() {
        let (d, ai, _db) = dispatcher(FakeAi::answering(&["unused"]));
        d.handle(command(42, 1, Command::Chat)).await;

        let outcome = d.handle(text(42, 2, &"a".repeat(5000))).await;

        assert_eq!(outcome.stage, Stage::Failed);
        assert!(outcome.reply.contains("too long"));
        assert_eq!(ai.calls(), 0);
    }

    #[tokio::test]
    async fn test_taste_usage_is_shown() {
        let (d, _ai, _db) = dispatcher(FakeAi::default());
        let outcome = d.handle(command(1, 1, Command::Taste(String::new()))).await;
        assert!(outcome.reply.contains("/taste"));
    }
}

// =============================================================================
// IDEMPOTENCE
// =============================================================================

mod idempotence {
    use super::*;

    #[tokio::test]
    async fn test_redelivery_replays_reply_without_mutation() {
        let (d, ai, db) = dispatcher(FakeAi::answering(&["Use arborio rice."]));
        d.handle(command(42, 1, Command::Chat)).await;

        let first = d.handle(text(42, 2, "risotto rice?")).await;
        let after_first = db.read_state(42).unwrap().unwrap();
        let second = d.handle(text(42, 2, "risotto rice?")).await;

        assert_eq!(first.reply, second.reply);
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(second.stage, Stage::Responded);
        assert_eq!(ai.calls(), 1);
        assert_eq!(db.read_state(42).unwrap().unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_redelivered_command_is_not_reapplied() {
        let (d, _ai, db) = dispatcher(FakeAi::default());
        d.handle(command(42, 1, Command::Chat)).await;
        d.handle(command(42, 2, Command::Stop)).await;

        // Redelivery of the earlier /chat must not flip the mode back
        let outcome = d.handle(command(42, 1, Command::Chat)).await;

        assert!(outcome.replayed);
        assert_eq!(outcome.reply, CHAT_INTRO_TEXT);
        let state = db.read_state(42).unwrap().unwrap();
        assert_eq!(state.mode, Mode::Idle);
        assert_eq!(state.event_count, 2);
    }
}

// =============================================================================
// CONCURRENCY
// =============================================================================

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn test_events_of_one_user_are_processed_in_order() {
        let ai = FakeAi { delay: Some(Duration::from_millis(30)), ..FakeAi::answering(&["first", "second"]) };
        let (d, _ai, db) = dispatcher(ai);
        let d = Arc::new(d);
        d.handle(command(42, 1, Command::Chat)).await;

        let a = tokio::spawn({
            let d = d.clone();
            async move { d.handle(text(42, 2, "q1")).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = tokio::spawn({
            let d = d.clone();
            async move { d.handle(text(42, 3, "q2")).await }
        });

        assert_eq!(a.await.unwrap().reply, "first");
        assert_eq!(b.await.unwrap().reply, "second");
        assert_eq!(db.read_state(42).unwrap().unwrap().exchange_count, 2);
    }

    #[tokio::test]
    async fn test_different_users_do_not_wait_for_each_other() {
        let ai = FakeAi { delay: Some(Duration::from_millis(200)), ..FakeAi::answering(&["slow"]) };
        let (d, _ai, _db) = dispatcher(ai);
        let d = Arc::new(d);
        d.handle(command(1, 1, Command::Chat)).await;

        let slow = tokio::spawn({
            let d = d.clone();
            async move { d.handle(text(1, 2, "slow question")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fast = tokio::time::timeout(Duration::from_millis(100), d.handle(command(2, 1, Command::Help))).await;
        assert!(fast.is_ok(), "user 2 was blocked by user 1");
        assert_eq!(slow.await.unwrap().stage, Stage::Responded);
    }

    #[tokio::test]
    async fn test_every_event_gets_exactly_one_reply() {
        let (d, _ai, _db) = dispatcher(FakeAi::answering(&["a", "b", "c"]));
        let d = Arc::new(d);

        let mut handles = Vec::new();
        for user in 1..=10 {
            let d = d.clone();
            handles.push(tokio::spawn(async move {
                vec![
                    d.handle(command(user, 1, Command::Start(String::new()))).await,
                    d.handle(command(user, 2, Command::Status)).await,
                    d.handle(text(user, 3, "hi")).await,
                ]
            }));
        }

        for h in handles {
            let outcomes = h.await.unwrap();
            assert_eq!(outcomes.len(), 3);
            assert!(outcomes.iter().all(|o| o.stage == Stage::Responded && !o.reply.is_empty()));
        }
    }
}

// =============================================================================
// STATUS AND HELP
// =============================================================================

mod info_commands {
    use super::*;

    #[tokio::test]
    async fn test_status_reflects_state() {
        let (d, _ai, _db) = dispatcher(FakeAi::answering(&["x"]));
        d.handle(command(42, 1, Command::Taste("saltiness low".into()))).await;
        d.handle(command(42, 2, Command::Chat)).await;
        d.handle(text(42, 3, "q")).await;

        let outcome = d.handle(command(42, 4, Command::Status)).await;

        assert!(outcome.reply.contains("Recipe AI chat: on"));
        assert!(outcome.reply.contains("Saltiness: low"));
        assert!(outcome.reply.contains("Spiciness: normal"));
        assert!(outcome.reply.contains("Questions asked: 1"));
    }

    #[tokio::test]
    async fn test_help_lists_commands() {
        let (d, _ai, _db) = dispatcher(FakeAi::default());
        let outcome = d.handle(command(42, 1, Command::Help)).await;
        for name in ["/start", "/chat", "/stop", "/status", "/taste", "/help"] {
            assert!(outcome.reply.contains(name), "missing {name}");
        }
    }
}
