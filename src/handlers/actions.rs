use axum::{body::Bytes, extract::State, Extension, Json};
use serde_json::Value;

use crate::{
    actions::{execute_action, CopilotAction},
    auth::Claims,
    handlers::{parse_body, ApiError},
    state::AppState,
    types::ActionRequest,
};

/// `POST /api/ai/actions`: runs an action the user confirmed.
pub async fn actions_handler(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: ActionRequest = parse_body(&body)?;
    let action = CopilotAction::parse(&request.action, &request.input)?;

    let result = execute_action(state.actions.as_ref(), claims.user_id(), action).await?;
    Ok(Json(result))
}
