//! Consumer side of the copilot stream.
//!
//! [`CopilotClient`] posts a prompt, feeds the response body through the
//! frame decoder into the conversation reducer, and records the turn in the
//! session ledger once the stream has finished.

use log::{debug, info, warn};
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::chat_state::{ChatAction, ChatState, ConversationView};
use crate::config::ClientConfig;
use crate::consumer::{drive_stream, StreamTermination};
use crate::frame::{ProposedAction, StreamFrame, StreamStatus};
use crate::ledger::{LedgerError, MemorySessionStore, PostgrestSessionStore, SessionLedger, SessionStore};
use crate::models::conversations::ChatRole;
use crate::supabase::build_client;
use crate::types::{ActionRequest, CopilotRequest, ErrorBody, STREAM_ID_HEADER};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("no copilot stream in flight")]
    NothingInFlight,
}

/// How a turn ended, as far as the client could tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    /// The body closed before `stream-end`.
    Incomplete,
    Errored(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub seq: u64,
    pub stream_id: String,
    pub status: TurnStatus,
    pub termination: StreamTermination,
    /// Last draft received for this turn.
    pub final_draft: Option<String>,
    pub proposed_actions: Vec<ProposedAction>,
    pub persisted: bool,
    /// Persistence problems. They never interrupt the stream.
    pub warnings: Vec<String>,
}

impl TurnOutcome {
    pub fn is_complete(&self) -> bool {
        self.status == TurnStatus::Completed
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    seq: u64,
    stream_id: String,
    token: CancellationToken,
}

/// What the frame callback saw of the current turn.
#[derive(Debug, Default)]
struct TurnTrace {
    last_draft: Option<String>,
    proposed_actions: Vec<ProposedAction>,
    terminal: Option<TurnStatus>,
}

impl TurnTrace {
    fn observe(&mut self, frame: &StreamFrame) {
        if self.terminal.is_some() {
            // the reducer closes the turn on the first terminal frame
            return;
        }
        match frame {
            StreamFrame::Draft { draft } => self.last_draft = Some(draft.clone()),
            StreamFrame::ProposedActions { proposed_actions } => {
                self.proposed_actions = proposed_actions.clone();
            }
            StreamFrame::Status { status, reason } => match status {
                StreamStatus::StreamStart => {}
                StreamStatus::StreamEnd => {
                    self.terminal.get_or_insert(TurnStatus::Completed);
                }
                StreamStatus::StreamError => {
                    let reason = reason.clone().unwrap_or_else(|| "stream error".to_string());
                    self.terminal.get_or_insert(TurnStatus::Errored(reason));
                }
            },
            StreamFrame::Context { .. } => {}
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One assistant panel talking to a copilot server.
pub struct CopilotClient {
    http: reqwest::Client,
    config: ClientConfig,
    conversation_key: String,
    ledger: Option<SessionLedger>,
    state: Mutex<ChatState>,
    next_seq: AtomicU64,
    in_flight: Mutex<Option<InFlight>>,
}

impl CopilotClient {
    pub fn new(config: ClientConfig, ledger: Option<SessionLedger>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            conversation_key: uuid::Uuid::new_v4().to_string(),
            ledger,
            state: Mutex::new(ChatState::new()),
            next_seq: AtomicU64::new(0),
            in_flight: Mutex::new(None),
        }
    }

    /// Persists to Supabase when it is configured, otherwise to memory for
    /// the life of the process. Without an owner nothing is persisted.
    pub fn from_config(config: ClientConfig) -> Self {
        let ledger = config.owner.as_ref().map(|_| {
            let store: Arc<dyn SessionStore> = match (&config.supabase, &config.access_token) {
                (Some(supabase), Some(token)) => {
                    Arc::new(PostgrestSessionStore::new(build_client(supabase)).with_access_token(token.clone()))
                }
                (Some(supabase), None) => Arc::new(PostgrestSessionStore::new(build_client(supabase))),
                (None, _) => Arc::new(MemorySessionStore::new()),
            };
            SessionLedger::new(store)
        });
        Self::new(config, ledger)
    }

    pub fn ledger(&self) -> Option<&SessionLedger> {
        self.ledger.as_ref()
    }

    /// Key of this panel's conversation in the reducer.
    pub fn conversation_key(&self) -> &str {
        &self.conversation_key
    }

    pub fn conversation(&self) -> Option<ConversationView> {
        lock(&self.state).conversation(&self.conversation_key).cloned()
    }

    pub async fn send_prompt(&self, prompt: &str) -> Result<TurnOutcome, ClientError> {
        self.send_prompt_with(prompt, |_| {}).await
    }

    /// Sends `prompt` and streams the reply, calling `on_update` with the
    /// conversation after every applied frame.
    ///
    /// A prompt sent while another is still streaming supersedes it: the
    /// earlier read is cancelled and its frames can no longer change the
    /// conversation.
    pub async fn send_prompt_with<F>(&self, prompt: &str, mut on_update: F) -> Result<TurnOutcome, ClientError>
    where
        F: FnMut(&ConversationView),
    {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let stream_id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();

        if let Some(previous) = lock(&self.in_flight).replace(InFlight {
            seq,
            stream_id: stream_id.clone(),
            token: token.clone(),
        }) {
            debug!("Prompt {seq} supersedes in-flight prompt {}", previous.seq);
            previous.token.cancel();
        }

        self.dispatch(Some(seq), ChatAction::Prompt(prompt.to_string()));

        let mut warnings = Vec::new();
        let session_id = self.persist_user_message(prompt, &mut warnings).await;

        let response = match self.post_prompt(prompt, seq, &stream_id).await {
            Ok(response) => response,
            Err(e) => {
                self.dispatch(Some(seq), ChatAction::Error(e.to_string()));
                self.clear_in_flight(seq);
                return Err(e);
            }
        };

        let mut trace = TurnTrace::default();
        let termination = drive_stream(
            Box::pin(response.bytes_stream()),
            self.config.idle_timeout,
            &token,
            |envelope| {
                if envelope.seq.is_some() && envelope.seq != Some(seq) {
                    debug!("Dropping frame for seq {:?} while reading seq {seq}", envelope.seq);
                    return;
                }
                trace.observe(&envelope.frame);

                let mut state = lock(&self.state);
                state.dispatch(&self.conversation_key, Some(seq), envelope.frame.into());
                if let Some(view) = state.conversation(&self.conversation_key) {
                    on_update(view);
                }
            },
        )
        .await;

        let status = match (&termination, trace.terminal.take()) {
            (_, Some(status)) => status,
            (StreamTermination::Closed, None) => {
                self.dispatch(Some(seq), ChatAction::Interrupted);
                TurnStatus::Incomplete
            }
            (StreamTermination::Cancelled, None) => {
                self.dispatch(Some(seq), ChatAction::Error("cancelled".to_string()));
                TurnStatus::Cancelled
            }
            (StreamTermination::TimedOut, None) => {
                self.dispatch(Some(seq), ChatAction::Error("timeout".to_string()));
                TurnStatus::Errored("timeout".to_string())
            }
            (StreamTermination::Transport(e), None) => {
                self.dispatch(Some(seq), ChatAction::Error(e.clone()));
                TurnStatus::Errored(e.clone())
            }
        };
        if let Some(view) = lock(&self.state).conversation(&self.conversation_key) {
            on_update(view);
        }
        self.clear_in_flight(seq);

        let persisted = match (&status, &session_id, &self.ledger) {
            (TurnStatus::Completed, Some(session_id), Some(ledger)) => {
                match ledger.record_reply(session_id, trace.last_draft.as_deref()).await {
                    Ok(written) => written,
                    Err(e) => {
                        warn!("Failed to persist assistant reply: {e}");
                        warnings.push(format!("assistant reply not saved: {e}"));
                        false
                    }
                }
            }
            _ => false,
        };

        info!("Copilot turn {seq} finished: {status:?} ({termination})");
        Ok(TurnOutcome {
            seq,
            stream_id,
            status,
            termination,
            final_draft: trace.last_draft,
            proposed_actions: trace.proposed_actions,
            persisted,
            warnings,
        })
    }

    /// Stops reading the in-flight stream and asks the server to stop
    /// producing it.
    pub async fn cancel(&self) -> Result<(), ClientError> {
        let in_flight = lock(&self.in_flight).clone().ok_or(ClientError::NothingInFlight)?;
        in_flight.token.cancel();
        self.cancel_remote(&in_flight.stream_id).await
    }

    pub async fn cancel_remote(&self, stream_id: &str) -> Result<(), ClientError> {
        let request = self
            .http
            .post(format!("{}/api/ai/cancel-stream", self.config.base_url))
            .query(&[("stream_id", stream_id)]);
        let response = self.authorize(request).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }

    /// Runs a proposed action after the user confirmed it.
    pub async fn execute_action(&self, proposed: &ProposedAction) -> Result<Value, ClientError> {
        let body = ActionRequest {
            action: proposed.action.clone(),
            input: proposed.input.clone(),
        };
        let request = self
            .http
            .post(format!("{}/api/ai/actions", self.config.base_url))
            .json(&body);
        let response = Self::check_status(self.authorize(request).send().await?).await?;
        Ok(response.json().await?)
    }

    fn dispatch(&self, seq: Option<u64>, action: ChatAction) {
        lock(&self.state).dispatch(&self.conversation_key, seq, action);
    }

    fn clear_in_flight(&self, seq: u64) {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.as_ref().is_some_and(|current| current.seq == seq) {
            *in_flight = None;
        }
    }

    async fn persist_user_message(&self, prompt: &str, warnings: &mut Vec<String>) -> Option<String> {
        let (ledger, owner) = match (&self.ledger, &self.config.owner) {
            (Some(ledger), Some(owner)) => (ledger, owner),
            _ => return None,
        };

        let session_id = match ledger.ensure_session(owner).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to open copilot session: {e}");
                warnings.push(format!("session not available: {e}"));
                return None;
            }
        };

        if let Err(e) = ledger.append_message(&session_id, ChatRole::User, prompt).await {
            warn!("Failed to persist user message: {e}");
            warnings.push(format!("user message not saved: {e}"));
        }
        Some(session_id)
    }

    async fn post_prompt(&self, prompt: &str, seq: u64, stream_id: &str) -> Result<reqwest::Response, ClientError> {
        let body = CopilotRequest {
            prompt: prompt.to_string(),
            seq: Some(seq),
            stream_id: Some(stream_id.to_string()),
        };
        let request = self
            .http
            .post(format!("{}/api/ai/copilot", self.config.base_url))
            .json(&body);

        let response = Self::check_status(self.authorize(request).send().await?).await?;
        if let Some(echoed) = response.headers().get(STREAM_ID_HEADER) {
            debug!("Streaming {:?} for seq {seq}", echoed);
        }
        Ok(response)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.access_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }
}
