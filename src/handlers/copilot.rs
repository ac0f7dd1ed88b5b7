use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use log::{info, warn};
use tracing::Instrument;

use crate::{
    auth::MaybeClaims,
    handlers::{parse_body, ApiError},
    producer::{frame_channel, produce_copilot_stream, CopilotTurn, ProducerOptions},
    state::AppState,
    types::{CopilotRequest, STREAM_ID_HEADER},
};

pub const STREAM_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// `POST /api/ai/copilot`: answers with newline-delimited frames, written
/// as the producer emits them.
pub async fn copilot_stream_handler(
    State(state): State<AppState>,
    MaybeClaims(claims): MaybeClaims,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CopilotRequest = parse_body(&body)?;
    let owner = claims.map(|claims| claims.sub);

    let stream_id = request
        .stream_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let stream_header =
        HeaderValue::from_str(&stream_id).map_err(|_| ApiError::BadRequest("invalid streamId".to_string()))?;

    let span = tracing::info_span!(
        "copilot_stream",
        stream_id = %stream_id,
        user_id = %owner.as_deref().unwrap_or("anonymous"),
        seq = tracing::field::Empty,
    );
    if let Some(seq) = request.seq {
        span.record("seq", seq);
    }
    span.in_scope(|| info!("Starting copilot stream {stream_id}"));

    let registered = state.streams.register_stream(stream_id, owner.clone());
    let (sink, frames) = frame_channel(state.config.frame_buffer, request.seq, registered.token.clone());

    let turn = CopilotTurn {
        prompt: request.prompt,
        owner,
        seq: request.seq,
    };
    let options = ProducerOptions::from(state.config.as_ref());
    let source = state.context_source.clone();
    let streams = state.streams.clone();

    tokio::spawn(
        async move {
            let token = registered.token.clone();
            if let Err(e) = produce_copilot_stream(sink, source, turn, options, token).await {
                warn!("Copilot stream {} stopped early: {e}", registered.id);
            }
            streams.release(&registered);
            tracing::info!("copilot stream released");
        }
        .instrument(span),
    );

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(STREAM_CONTENT_TYPE)),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::HeaderName::from_static(STREAM_ID_HEADER), stream_header),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}
