//! Persistence of copilot conversations.
//!
//! Messages are append-only. User turns are written as soon as they are sent;
//! an assistant turn is written once, after its stream completed, with the
//! last draft as content.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info};
use postgrest::Postgrest;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::conversations::{ChatRole, MessageView, NewMessage, NewSession, SessionView};
use crate::supabase::{execute, execute_json};

pub const DEFAULT_SESSION_TITLE: &str = "Chat";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("session {0} does not exist")]
    UnknownSession(String),
    #[error("session belongs to {expected}, not {actual}")]
    OwnerMismatch { expected: String, actual: String },
    #[error("persistence failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a session for `owner` and returns its id.
    async fn create_session(&self, owner: &str) -> Result<String, LedgerError>;

    async fn append_message(&self, session_id: &str, role: ChatRole, content: &str) -> Result<(), LedgerError>;

    /// Messages of a session in the order they were appended.
    async fn messages(&self, session_id: &str) -> Result<Vec<MessageView>, LedgerError>;
}

/// Stores sessions in `ai_sessions` and messages in `ai_messages`.
pub struct PostgrestSessionStore {
    client: Postgrest,
    access_token: Option<String>,
}

impl PostgrestSessionStore {
    pub fn new(client: Postgrest) -> Self {
        Self {
            client,
            access_token: None,
        }
    }

    /// Sends the caller's own token so row-level policies apply.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn table(&self, name: &str) -> postgrest::Builder {
        let builder = self.client.from(name);
        match &self.access_token {
            Some(token) => builder.auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl SessionStore for PostgrestSessionStore {
    async fn create_session(&self, owner: &str) -> Result<String, LedgerError> {
        let body = serde_json::to_string(&[NewSession {
            user_id: owner.to_string(),
            title: DEFAULT_SESSION_TITLE.to_string(),
        }])
        .map_err(|e| LedgerError::Backend(e.to_string()))?;

        let session: SessionView = execute_json(self.table("ai_sessions").insert(body).single())
            .await
            .map_err(LedgerError::Backend)?;

        info!("Created copilot session {} for {owner}", session.id);
        Ok(session.id)
    }

    async fn append_message(&self, session_id: &str, role: ChatRole, content: &str) -> Result<(), LedgerError> {
        let body = serde_json::to_string(&NewMessage {
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
        })
        .map_err(|e| LedgerError::Backend(e.to_string()))?;

        execute(self.table("ai_messages").insert(body))
            .await
            .map_err(LedgerError::Backend)?;
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<MessageView>, LedgerError> {
        let query = self
            .table("ai_messages")
            .select("session_id,role,content,created_at")
            .eq("session_id", session_id)
            .order("created_at.asc");

        execute_json(query).await.map_err(LedgerError::Backend)
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, SessionView>,
    messages: DashMap<String, Vec<MessageView>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionView> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, owner: &str) -> Result<String, LedgerError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            SessionView {
                id: id.clone(),
                user_id: owner.to_string(),
                title: Some(DEFAULT_SESSION_TITLE.to_string()),
                created_at: Some(Utc::now()),
            },
        );
        Ok(id)
    }

    async fn append_message(&self, session_id: &str, role: ChatRole, content: &str) -> Result<(), LedgerError> {
        if !self.sessions.contains_key(session_id) {
            return Err(LedgerError::UnknownSession(session_id.to_string()));
        }
        self.messages
            .entry(session_id.to_string())
            .or_default()
            .push(MessageView {
                session_id: session_id.to_string(),
                role,
                content: content.to_string(),
                created_at: Some(Utc::now()),
            });
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<MessageView>, LedgerError> {
        if !self.sessions.contains_key(session_id) {
            return Err(LedgerError::UnknownSession(session_id.to_string()));
        }
        Ok(self
            .messages
            .get(session_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
struct BoundSession {
    id: String,
    owner: String,
}

/// Session bookkeeping for one assistant panel.
///
/// The session is created lazily on first use and reused for the lifetime of
/// the ledger. A new panel gets a new ledger, and with it a new session,
/// unless it was built with [`SessionLedger::resume`].
pub struct SessionLedger {
    store: Arc<dyn SessionStore>,
    session: Mutex<Option<BoundSession>>,
}

impl SessionLedger {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            session: Mutex::new(None),
        }
    }

    pub fn resume(store: Arc<dyn SessionStore>, owner: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session: Mutex::new(Some(BoundSession {
                id: session_id.into(),
                owner: owner.into(),
            })),
        }
    }

    /// Returns the panel's session, creating it for `owner` on first call.
    pub async fn ensure_session(&self, owner: &str) -> Result<String, LedgerError> {
        let mut session = self.session.lock().await;
        if let Some(bound) = session.as_ref() {
            if bound.owner != owner {
                return Err(LedgerError::OwnerMismatch {
                    expected: bound.owner.clone(),
                    actual: owner.to_string(),
                });
            }
            return Ok(bound.id.clone());
        }

        let id = self.store.create_session(owner).await?;
        *session = Some(BoundSession {
            id: id.clone(),
            owner: owner.to_string(),
        });
        Ok(id)
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|bound| bound.id.clone())
    }

    pub async fn append_message(&self, session_id: &str, role: ChatRole, content: &str) -> Result<(), LedgerError> {
        self.store.append_message(session_id, role, content).await
    }

    /// Persists the final draft of a completed stream. Returns whether a
    /// message was written; a stream that produced no draft writes nothing.
    pub async fn record_reply(&self, session_id: &str, final_draft: Option<&str>) -> Result<bool, LedgerError> {
        match final_draft {
            Some(content) if !content.is_empty() => {
                self.store.append_message(session_id, ChatRole::Assistant, content).await?;
                Ok(true)
            }
            _ => {
                debug!("No draft to persist for session {session_id}");
                Ok(false)
            }
        }
    }

    pub async fn history(&self) -> Result<Vec<MessageView>, LedgerError> {
        match self.session_id().await {
            Some(id) => self.store.messages(&id).await,
            None => Ok(Vec::new()),
        }
    }
}
