use axum::Json;
use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::actions::ACTION_NAMES;
use crate::handlers::copilot::STREAM_CONTENT_TYPE;

pub const SERVICE_NAME: &str = "productive-me-mcp";
pub const SERVICE_VERSION: &str = "1.0.0";

const PRIORITIES: [&str; 3] = ["low", "medium", "high"];

static MANIFEST: Lazy<Value> = Lazy::new(|| {
    json!({
        "name": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "description": "Discovery document for the copilot stream and its actions",
        "auth": {
            "type": "supabase-session",
            "header": "Authorization",
        },
        "endpoints": {
            "copilot": {
                "method": "POST",
                "path": "/api/ai/copilot",
                "streaming": true,
                "input": {
                    "type": "object",
                    "properties": {
                        "prompt": { "type": "string" },
                        "seq": { "type": "integer", "minimum": 0 },
                        "streamId": { "type": "string" },
                    },
                    "required": ["prompt"],
                },
                "output": { "type": "stream", "contentType": STREAM_CONTENT_TYPE },
            },
            "cancelStream": {
                "method": "POST",
                "path": "/api/ai/cancel-stream",
                "query": { "stream_id": { "type": "string" } },
            },
            "actions": {
                "method": "POST",
                "path": "/api/ai/actions",
                "input": {
                    "type": "object",
                    "properties": {
                        "action": { "type": "string", "enum": ACTION_NAMES },
                        "input": { "$ref": "#/schemas/ActionInputs" },
                    },
                    "required": ["action", "input"],
                },
                "output": { "type": "object" },
            },
        },
        "schemas": action_schemas(),
    })
});

fn action_schemas() -> Value {
    json!({
        "ActionInputs": {
            "oneOf": [
                { "$ref": "#/schemas/CreateTask" },
                { "$ref": "#/schemas/UpdateTask" },
                { "$ref": "#/schemas/ScheduleEvent" },
                { "$ref": "#/schemas/AnalyzeBudget" },
                { "$ref": "#/schemas/SummarizeNews" },
                { "$ref": "#/schemas/ScreenTimeAdvice" },
            ],
        },
        "CreateTask": {
            "type": "object",
            "properties": {
                "title": { "type": "string", "minLength": 1 },
                "description": { "type": "string" },
                "priority": { "type": "string", "enum": PRIORITIES, "default": "medium" },
                "due_date": { "type": "string" },
            },
            "required": ["title"],
        },
        "UpdateTask": {
            "type": "object",
            "properties": {
                "id": { "type": "string", "minLength": 1 },
                "title": { "type": "string", "minLength": 1 },
                "description": { "type": "string" },
                "priority": { "type": "string", "enum": PRIORITIES },
                "stage": { "type": "string", "enum": ["todo", "pending", "done"] },
                "due_date": { "type": "string" },
            },
            "required": ["id"],
        },
        "ScheduleEvent": {
            "type": "object",
            "properties": {
                "title": { "type": "string", "minLength": 1 },
                "description": { "type": "string" },
                "starts_at": { "type": "string", "minLength": 1 },
                "priority": { "type": "string", "enum": PRIORITIES, "default": "medium" },
            },
            "required": ["title", "starts_at"],
        },
        "AnalyzeBudget": {
            "type": "object",
            "properties": {
                "month": { "type": "string", "description": "YYYY-MM", "pattern": "^\\d{4}-\\d{2}$" },
            },
            "required": ["month"],
        },
        "SummarizeNews": {
            "type": "object",
            "properties": {
                "symbols": { "type": "array", "items": { "type": "string" }, "default": [] },
            },
        },
        "ScreenTimeAdvice": {
            "type": "object",
            "properties": {
                "range": { "type": "string", "enum": ["day", "week", "month"], "default": "week" },
            },
        },
    })
}

/// `GET /api/mcp`
pub async fn mcp_manifest() -> Json<Value> {
    Json(MANIFEST.clone())
}
