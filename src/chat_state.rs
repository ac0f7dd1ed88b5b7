//! Conversation state driven by stream frames.
//!
//! Each conversation is keyed by its session id and only changes through
//! [`ChatState::dispatch`]. Frames tagged with a request sequence number lower
//! than the newest one already applied are dropped, so a superseded stream
//! cannot write into the visible reply.

use log::debug;
use std::collections::HashMap;

use crate::frame::{ContextRecord, ProposedAction, StreamFrame, StreamStatus};
use crate::models::conversations::{
    ChatRole, DisplayMessage, PendingMessage, ReplyStatus, SettledMessage,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ChatAction {
    /// The user sent a prompt; opens a new turn.
    Prompt(String),
    Start,
    Context(Vec<ContextRecord>),
    Draft(String),
    ProposedActions(Vec<ProposedAction>),
    End,
    Error(String),
    /// The body closed without a terminal status frame.
    Interrupted,
}

impl From<StreamFrame> for ChatAction {
    fn from(frame: StreamFrame) -> Self {
        match frame {
            StreamFrame::Status { status, reason } => match status {
                StreamStatus::StreamStart => ChatAction::Start,
                StreamStatus::StreamEnd => ChatAction::End,
                StreamStatus::StreamError => {
                    ChatAction::Error(reason.unwrap_or_else(|| "stream error".to_string()))
                }
            },
            StreamFrame::Context { context } => ChatAction::Context(context),
            StreamFrame::Draft { draft } => ChatAction::Draft(draft),
            StreamFrame::ProposedActions { proposed_actions } => {
                ChatAction::ProposedActions(proposed_actions)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Applied,
    /// Older than the newest request already applied to the conversation.
    Stale,
    /// Arrived after the turn it belongs to was closed.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TurnPhase {
    #[default]
    Idle,
    Open,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationView {
    messages: Vec<DisplayMessage>,
    context: Vec<ContextRecord>,
    latest_seq: Option<u64>,
    phase: TurnPhase,
    turn_seq: Option<u64>,
    reply_index: Option<usize>,
}

impl ConversationView {
    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    pub fn context(&self) -> &[ContextRecord] {
        &self.context
    }

    pub fn latest_seq(&self) -> Option<u64> {
        self.latest_seq
    }

    pub fn is_streaming(&self) -> bool {
        self.messages.iter().any(DisplayMessage::is_streaming)
    }

    pub fn last_assistant(&self) -> Option<&DisplayMessage> {
        self.messages.iter().rev().find(|msg| msg.role() == ChatRole::Assistant)
    }

    /// The assistant reply to the most recent prompt, once one has arrived.
    /// Unlike [`Self::last_assistant`] this never returns an earlier turn's
    /// reply while the newest prompt is still waiting for its first draft.
    pub fn current_reply(&self) -> Option<&DisplayMessage> {
        match self.messages.iter().rposition(DisplayMessage::is_user) {
            Some(prompt) => self.messages[prompt + 1..]
                .iter()
                .find(|msg| msg.role() == ChatRole::Assistant),
            None => self.last_assistant(),
        }
    }

    fn apply(&mut self, seq: Option<u64>, action: ChatAction) -> Dispatch {
        if let Some(seq) = seq {
            match self.latest_seq {
                Some(latest) if seq < latest => return Dispatch::Stale,
                Some(latest) if seq == latest => {}
                _ => {
                    // a newer request supersedes whatever is still streaming
                    self.close_turn(ReplyStatus::Incomplete);
                    self.latest_seq = Some(seq);
                    self.phase = TurnPhase::Idle;
                    self.turn_seq = Some(seq);
                }
            }
        }

        match action {
            ChatAction::Prompt(content) => {
                self.close_turn(ReplyStatus::Incomplete);
                self.messages.push(DisplayMessage::user(content));
                self.open_turn(seq);
                Dispatch::Applied
            }
            ChatAction::Start => match self.phase {
                TurnPhase::Open => Dispatch::Applied,
                TurnPhase::Closed if seq.is_some() && seq == self.turn_seq => Dispatch::Ignored,
                TurnPhase::Idle | TurnPhase::Closed => {
                    self.open_turn(seq);
                    Dispatch::Applied
                }
            },
            ChatAction::Context(records) => {
                self.context = records;
                Dispatch::Applied
            }
            ChatAction::Draft(text) => {
                if !self.accepts_reply_frames(seq) {
                    return Dispatch::Ignored;
                }
                if let Some(reply) = self.pending_reply(seq) {
                    // an empty draft is treated as no draft at all
                    reply.has_draft = !text.is_empty();
                    reply.content = text;
                }
                Dispatch::Applied
            }
            ChatAction::ProposedActions(actions) => {
                if !self.accepts_reply_frames(seq) {
                    return Dispatch::Ignored;
                }
                if let Some(reply) = self.pending_reply(seq) {
                    reply.proposed_actions = actions;
                }
                Dispatch::Applied
            }
            ChatAction::End => {
                if self.phase == TurnPhase::Closed {
                    return Dispatch::Ignored;
                }
                self.finalize_reply();
                self.phase = TurnPhase::Closed;
                Dispatch::Applied
            }
            ChatAction::Error(reason) => {
                if self.phase == TurnPhase::Closed {
                    return Dispatch::Ignored;
                }
                if let Some(reply) = self.pending_reply(seq) {
                    reply.status = ReplyStatus::Errored(reason);
                }
                self.reply_index = None;
                self.phase = TurnPhase::Closed;
                Dispatch::Applied
            }
            ChatAction::Interrupted => {
                if self.phase == TurnPhase::Closed {
                    return Dispatch::Ignored;
                }
                if let Some(reply) = self.pending_reply(seq) {
                    reply.status = ReplyStatus::Incomplete;
                }
                self.reply_index = None;
                self.phase = TurnPhase::Closed;
                Dispatch::Applied
            }
        }
    }

    fn open_turn(&mut self, seq: Option<u64>) {
        self.phase = TurnPhase::Open;
        self.turn_seq = seq.or(self.turn_seq);
        self.reply_index = None;
    }

    fn accepts_reply_frames(&mut self, seq: Option<u64>) -> bool {
        match self.phase {
            TurnPhase::Open => true,
            TurnPhase::Idle => {
                // start frame was lost or skipped
                self.open_turn(seq);
                true
            }
            TurnPhase::Closed => false,
        }
    }

    fn pending_reply(&mut self, seq: Option<u64>) -> Option<&mut PendingMessage> {
        let reusable = self
            .reply_index
            .and_then(|index| self.messages.get(index))
            .is_some_and(|msg| matches!(msg, DisplayMessage::Pending(_)));
        if !reusable {
            self.messages.push(DisplayMessage::Pending(PendingMessage::new(seq)));
            self.reply_index = Some(self.messages.len() - 1);
        }

        let index = self.reply_index?;
        match self.messages.get_mut(index) {
            Some(DisplayMessage::Pending(reply)) => Some(reply),
            _ => None,
        }
    }

    fn finalize_reply(&mut self) {
        let Some(index) = self.reply_index.take() else {
            return;
        };
        let Some(DisplayMessage::Pending(reply)) = self.messages.get(index) else {
            return;
        };

        if reply.has_draft {
            let settled = SettledMessage {
                role: ChatRole::Assistant,
                content: reply.content.clone(),
                proposed_actions: reply.proposed_actions.clone(),
                created_at: reply.created_at,
            };
            self.messages[index] = DisplayMessage::Settled(settled);
        } else {
            debug!("Stream ended without a draft; dropping empty reply");
            self.messages.remove(index);
        }
    }

    fn close_turn(&mut self, status: ReplyStatus) {
        if self.phase != TurnPhase::Open {
            return;
        }
        if let Some(index) = self.reply_index.take() {
            if let Some(DisplayMessage::Pending(reply)) = self.messages.get_mut(index) {
                if reply.status == ReplyStatus::Streaming {
                    reply.status = status;
                }
            }
        }
        self.phase = TurnPhase::Closed;
    }
}

#[derive(Debug, Default)]
pub struct ChatState {
    conversations: HashMap<String, ConversationView>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&mut self, session_id: &str, seq: Option<u64>, action: ChatAction) -> Dispatch {
        let conversation = self.conversations.entry(session_id.to_string()).or_default();
        let outcome = conversation.apply(seq, action);
        if outcome != Dispatch::Applied {
            debug!("Frame for session {session_id} not applied: {outcome:?} (seq {seq:?})");
        }
        outcome
    }

    pub fn conversation(&self, session_id: &str) -> Option<&ConversationView> {
        self.conversations.get(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    const SESSION: &str = "session-1";

    fn record(id: &str, title: &str) -> ContextRecord {
        ContextRecord {
            id: id.to_string(),
            title: title.to_string(),
            priority: None,
            stage: None,
            created_at: Utc::now(),
        }
    }

    fn run(state: &mut ChatState, seq: Option<u64>, actions: Vec<ChatAction>) {
        for action in actions {
            state.dispatch(SESSION, seq, action);
        }
    }

    #[test]
    fn test_plan_my_day_turn_settles_on_last_draft() {
        let mut state = ChatState::new();
        run(
            &mut state,
            Some(1),
            vec![
                ChatAction::Prompt("Plan my day".to_string()),
                ChatAction::Start,
                ChatAction::Context(vec![record("t1", "Email"), record("t2", "Gym")]),
                ChatAction::Draft("Analyzing".to_string()),
                ChatAction::Draft("Analyzing your day".to_string()),
                ChatAction::ProposedActions(vec![ProposedAction {
                    action: "createTask".to_string(),
                    input: json!({ "title": "Plan my day" }),
                }]),
                ChatAction::End,
            ],
        );

        let view = state.conversation(SESSION).unwrap();
        assert_eq!(view.messages().len(), 2);
        assert!(view.messages()[0].is_user());
        let reply = view.last_assistant().unwrap();
        assert_eq!(reply.content(), "Analyzing your day");
        assert_eq!(reply.status(), None);
        assert_eq!(reply.proposed_actions().len(), 1);
        assert_eq!(view.context().len(), 2);
        assert!(!view.is_streaming());
    }

    #[test]
    fn test_draft_replaces_instead_of_appending() {
        let mut state = ChatState::new();
        run(
            &mut state,
            None,
            vec![
                ChatAction::Start,
                ChatAction::Draft("one".to_string()),
                ChatAction::Draft("two".to_string()),
            ],
        );

        let view = state.conversation(SESSION).unwrap();
        assert_eq!(view.messages().len(), 1);
        assert_eq!(view.messages()[0].content(), "two");
        assert!(view.is_streaming());
    }

    #[test]
    fn test_stream_without_draft_leaves_no_reply() {
        let mut state = ChatState::new();
        run(
            &mut state,
            Some(1),
            vec![
                ChatAction::Prompt("hello".to_string()),
                ChatAction::Start,
                ChatAction::Context(Vec::new()),
                ChatAction::End,
            ],
        );

        let view = state.conversation(SESSION).unwrap();
        assert_eq!(view.messages().len(), 1);
        assert!(view.last_assistant().is_none());
    }

    #[test]
    fn test_closed_without_end_is_marked_incomplete() {
        let mut state = ChatState::new();
        run(
            &mut state,
            Some(1),
            vec![
                ChatAction::Start,
                ChatAction::Draft("partial".to_string()),
                ChatAction::Interrupted,
            ],
        );

        let reply = state.conversation(SESSION).unwrap().last_assistant().unwrap();
        assert_eq!(reply.content(), "partial");
        assert_eq!(reply.status(), Some(&ReplyStatus::Incomplete));
    }

    #[test]
    fn test_error_frame_is_rendered_inline() {
        let mut state = ChatState::new();
        run(
            &mut state,
            None,
            vec![ChatAction::Start, ChatAction::Error("timeout".to_string())],
        );

        let reply = state.conversation(SESSION).unwrap().last_assistant().unwrap();
        assert_eq!(reply.status(), Some(&ReplyStatus::Errored("timeout".to_string())));
    }

    #[test]
    fn test_frames_after_end_are_ignored() {
        let mut state = ChatState::new();
        run(
            &mut state,
            Some(3),
            vec![ChatAction::Start, ChatAction::Draft("final".to_string()), ChatAction::End],
        );

        assert_eq!(
            state.dispatch(SESSION, Some(3), ChatAction::Draft("late".to_string())),
            Dispatch::Ignored
        );
        assert_eq!(state.dispatch(SESSION, Some(3), ChatAction::Interrupted), Dispatch::Ignored);
        assert_eq!(
            state.conversation(SESSION).unwrap().last_assistant().unwrap().content(),
            "final"
        );
    }

    #[test]
    fn test_superseded_stream_cannot_touch_newer_reply() {
        let mut state = ChatState::new();
        run(
            &mut state,
            Some(1),
            vec![
                ChatAction::Prompt("first".to_string()),
                ChatAction::Start,
                ChatAction::Draft("first answer".to_string()),
            ],
        );
        run(
            &mut state,
            Some(2),
            vec![
                ChatAction::Prompt("second".to_string()),
                ChatAction::Start,
                ChatAction::Draft("second answer".to_string()),
            ],
        );

        assert_eq!(
            state.dispatch(SESSION, Some(1), ChatAction::Draft("first, continued".to_string())),
            Dispatch::Stale
        );
        assert_eq!(state.dispatch(SESSION, Some(1), ChatAction::End), Dispatch::Stale);

        let view = state.conversation(SESSION).unwrap();
        let contents: Vec<&str> = view.messages().iter().map(DisplayMessage::content).collect();
        assert_eq!(contents, vec!["first", "first answer", "second", "second answer"]);
        assert_eq!(view.messages()[1].status(), Some(&ReplyStatus::Incomplete));
        assert!(view.messages()[3].is_streaming());
        assert_eq!(view.latest_seq(), Some(2));
    }

    #[test]
    fn test_current_reply_skips_previous_turn() {
        let mut state = ChatState::new();
        run(
            &mut state,
            Some(1),
            vec![
                ChatAction::Prompt("first".to_string()),
                ChatAction::Start,
                ChatAction::Draft("answer one".to_string()),
                ChatAction::End,
            ],
        );
        run(
            &mut state,
            Some(2),
            vec![ChatAction::Prompt("second".to_string()), ChatAction::Start],
        );

        let view = state.conversation(SESSION).unwrap();
        assert_eq!(view.last_assistant().map(DisplayMessage::content), Some("answer one"));
        assert!(view.current_reply().is_none());

        state.dispatch(SESSION, Some(2), ChatAction::Draft("answer two".to_string()));
        let view = state.conversation(SESSION).unwrap();
        assert_eq!(view.current_reply().map(DisplayMessage::content), Some("answer two"));
    }

    #[test]
    fn test_empty_draft_counts_as_no_reply() {
        let mut state = ChatState::new();
        run(
            &mut state,
            Some(1),
            vec![
                ChatAction::Prompt("hello".to_string()),
                ChatAction::Start,
                ChatAction::Draft("thinking".to_string()),
                ChatAction::Draft(String::new()),
                ChatAction::End,
            ],
        );

        let view = state.conversation(SESSION).unwrap();
        assert_eq!(view.messages().len(), 1);
        assert!(view.last_assistant().is_none());
    }

    #[test]
    fn test_late_draft_after_error_is_ignored() {
        let mut state = ChatState::new();
        run(
            &mut state,
            Some(1),
            vec![
                ChatAction::Prompt("hello".to_string()),
                ChatAction::Start,
                ChatAction::Draft("partial".to_string()),
                ChatAction::ProposedActions(vec![ProposedAction {
                    action: "createTask".to_string(),
                    input: json!({ "title": "hello" }),
                }]),
                ChatAction::Error("model unavailable".to_string()),
            ],
        );
        assert_eq!(
            state.dispatch(SESSION, Some(1), ChatAction::Draft("late".to_string())),
            Dispatch::Ignored
        );

        let view = state.conversation(SESSION).unwrap();
        assert_eq!(view.messages().len(), 2);
        let reply = view.current_reply().unwrap();
        assert_eq!(reply.content(), "partial");
        assert_eq!(reply.status(), Some(&ReplyStatus::Errored("model unavailable".to_string())));
    }

    #[test]
    fn test_sessions_are_isolated() {
        let mut state = ChatState::new();
        state.dispatch("a", Some(5), ChatAction::Draft("for a".to_string()));
        assert_eq!(state.dispatch("b", Some(1), ChatAction::Draft("for b".to_string())), Dispatch::Applied);

        assert_eq!(state.conversation("a").unwrap().messages()[0].content(), "for a");
        assert_eq!(state.conversation("b").unwrap().messages()[0].content(), "for b");
    }

    #[test]
    fn test_frame_conversion() {
        assert_eq!(ChatAction::from(StreamFrame::start()), ChatAction::Start);
        assert_eq!(ChatAction::from(StreamFrame::end()), ChatAction::End);
        assert_eq!(
            ChatAction::from(StreamFrame::error("cancelled")),
            ChatAction::Error("cancelled".to_string())
        );
        assert_eq!(
            ChatAction::from(StreamFrame::draft("x")),
            ChatAction::Draft("x".to_string())
        );
    }
}
