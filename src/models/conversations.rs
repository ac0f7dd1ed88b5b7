use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::frame::ProposedAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
            ChatRole::System => write!(f, "system"),
        }
    }
}

/// Row of `ai_sessions`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionView {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Row of `ai_messages`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MessageView {
    pub session_id: String,
    pub role: ChatRole,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
}

// insert types; ids and timestamps are assigned by the database
#[derive(Debug, Serialize, Clone)]
pub struct NewSession {
    pub user_id: String,
    pub title: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    Streaming,
    /// The body closed before a terminal status frame arrived.
    Incomplete,
    Errored(String),
}

/// Assistant reply that is still being streamed, or that never finished.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub id: String,
    pub seq: Option<u64>,
    pub content: String,
    pub has_draft: bool,
    pub proposed_actions: Vec<ProposedAction>,
    pub status: ReplyStatus,
    pub created_at: DateTime<Utc>,
}

impl PendingMessage {
    pub fn new(seq: Option<u64>) -> Self {
        PendingMessage {
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            content: String::new(),
            has_draft: false,
            proposed_actions: Vec::new(),
            status: ReplyStatus::Streaming,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettledMessage {
    pub role: ChatRole,
    pub content: String,
    pub proposed_actions: Vec<ProposedAction>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayMessage {
    Settled(SettledMessage),
    Pending(PendingMessage),
}

impl DisplayMessage {
    pub fn user(content: impl Into<String>) -> Self {
        DisplayMessage::Settled(SettledMessage {
            role: ChatRole::User,
            content: content.into(),
            proposed_actions: Vec::new(),
            created_at: Utc::now(),
        })
    }

    pub fn content(&self) -> &str {
        match self {
            DisplayMessage::Settled(msg) => &msg.content,
            DisplayMessage::Pending(msg) => &msg.content,
        }
    }

    pub fn role(&self) -> ChatRole {
        match self {
            DisplayMessage::Settled(msg) => msg.role,
            DisplayMessage::Pending(_) => ChatRole::Assistant,
        }
    }

    pub fn proposed_actions(&self) -> &[ProposedAction] {
        match self {
            DisplayMessage::Settled(msg) => &msg.proposed_actions,
            DisplayMessage::Pending(msg) => &msg.proposed_actions,
        }
    }

    pub fn is_streaming(&self) -> bool {
        match self {
            DisplayMessage::Settled(_) => false,
            DisplayMessage::Pending(msg) => msg.status == ReplyStatus::Streaming,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role() == ChatRole::User
    }

    pub fn status(&self) -> Option<&ReplyStatus> {
        match self {
            DisplayMessage::Settled(_) => None,
            DisplayMessage::Pending(msg) => Some(&msg.status),
        }
    }
}
