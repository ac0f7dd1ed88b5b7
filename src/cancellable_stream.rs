use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio_util::sync::CancellationToken;

use crate::{auth::MaybeClaims, state::AppState, types::ErrorBody};

#[derive(Debug, Clone)]
struct StreamHandle {
    token: CancellationToken,
    owner: Option<String>,
    generation: u64,
}

/// A stream's entry in the registry, held by whoever runs its producer.
#[derive(Debug, Clone)]
pub struct RegisteredStream {
    pub id: String,
    pub token: CancellationToken,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    /// The stream was opened by someone else.
    Forbidden,
}

/// Live copilot streams by id.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<DashMap<String, StreamHandle>>,
    generations: Arc<AtomicU64>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream. An id that is still registered is cancelled and
    /// replaced.
    pub fn register_stream(&self, id: String, owner: Option<String>) -> RegisteredStream {
        let token = CancellationToken::new();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let handle = StreamHandle {
            token: token.clone(),
            owner,
            generation,
        };
        if let Some(previous) = self.streams.insert(id.clone(), handle) {
            debug!("Stream id {id} reused, cancelling the previous stream");
            previous.token.cancel();
        }
        RegisteredStream { id, token, generation }
    }

    /// Forgets a finished stream. A replacement registered under the same id
    /// is left alone.
    pub fn release(&self, stream: &RegisteredStream) {
        self.streams
            .remove_if(&stream.id, |_, handle| handle.generation == stream.generation);
    }

    pub fn cancel_stream(&self, id: &str, requester: Option<&str>) -> CancelOutcome {
        let allowed = match self.streams.get(id) {
            None => return CancelOutcome::NotFound,
            Some(handle) => match (&handle.owner, requester) {
                (None, _) => true,
                (Some(owner), Some(requester)) => owner == requester,
                (Some(_), None) => false,
            },
        };
        if !allowed {
            return CancelOutcome::Forbidden;
        }

        match self.streams.remove(id) {
            Some((_, handle)) => {
                handle.token.cancel();
                CancelOutcome::Cancelled
            }
            None => CancelOutcome::NotFound,
        }
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

pub async fn cancel_stream(
    State(state): State<AppState>,
    MaybeClaims(claims): MaybeClaims,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(stream_id) = params.get("stream_id") else {
        return (StatusCode::BAD_REQUEST, Json(ErrorBody::new("No stream ID provided"))).into_response();
    };

    let requester = claims.as_ref().map(|c| c.user_id());
    match state.streams.cancel_stream(stream_id, requester) {
        CancelOutcome::Cancelled => {
            info!("Cancelled stream {stream_id}");
            (StatusCode::OK, "Stream cancelled").into_response()
        }
        CancelOutcome::NotFound => {
            debug!("Cancel requested for unknown stream {stream_id}");
            (StatusCode::OK, "Stream not found").into_response()
        }
        CancelOutcome::Forbidden => {
            warn!("Refused to cancel stream {stream_id} for another caller");
            (StatusCode::FORBIDDEN, Json(ErrorBody::new("Stream belongs to another user"))).into_response()
        }
    }
}
