//! Operations the copilot may propose, and their execution once the user
//! confirms one.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use log::info;
use postgrest::Postgrest;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::supabase::{execute, execute_json};

pub const ACTION_NAMES: [&str; 6] = [
    "createTask",
    "updateTask",
    "scheduleEvent",
    "analyzeBudget",
    "summarizeNews",
    "screenTimeAdvice",
];

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Unknown action")]
    UnknownAction(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStage {
    Todo,
    Pending,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenTimeRange {
    Day,
    #[default]
    Week,
    Month,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTaskInput {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateTaskInput {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<TaskStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEventInput {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub starts_at: String,
    #[serde(default)]
    pub priority: TaskPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeBudgetInput {
    /// `YYYY-MM`
    pub month: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizeNewsInput {
    #[serde(default)]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenTimeAdviceInput {
    #[serde(default)]
    pub range: ScreenTimeRange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CopilotAction {
    CreateTask(CreateTaskInput),
    UpdateTask(UpdateTaskInput),
    ScheduleEvent(ScheduleEventInput),
    AnalyzeBudget(AnalyzeBudgetInput),
    SummarizeNews(SummarizeNewsInput),
    ScreenTimeAdvice(ScreenTimeAdviceInput),
}

impl CopilotAction {
    /// Validates `input` against the schema of `action`.
    pub fn parse(action: &str, input: &Value) -> Result<Self, ActionError> {
        match action {
            "createTask" => {
                let input: CreateTaskInput = parse_input(input)?;
                require_non_empty("title", &input.title)?;
                Ok(CopilotAction::CreateTask(input))
            }
            "updateTask" => {
                let input: UpdateTaskInput = parse_input(input)?;
                require_non_empty("id", &input.id)?;
                if let Some(title) = &input.title {
                    require_non_empty("title", title)?;
                }
                Ok(CopilotAction::UpdateTask(input))
            }
            "scheduleEvent" => {
                let input: ScheduleEventInput = parse_input(input)?;
                require_non_empty("title", &input.title)?;
                require_non_empty("starts_at", &input.starts_at)?;
                Ok(CopilotAction::ScheduleEvent(input))
            }
            "analyzeBudget" => {
                let input: AnalyzeBudgetInput = parse_input(input)?;
                validate_month(&input.month)?;
                Ok(CopilotAction::AnalyzeBudget(input))
            }
            "summarizeNews" => Ok(CopilotAction::SummarizeNews(parse_input(input)?)),
            "screenTimeAdvice" => Ok(CopilotAction::ScreenTimeAdvice(parse_input(input)?)),
            other => Err(ActionError::UnknownAction(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CopilotAction::CreateTask(_) => "createTask",
            CopilotAction::UpdateTask(_) => "updateTask",
            CopilotAction::ScheduleEvent(_) => "scheduleEvent",
            CopilotAction::AnalyzeBudget(_) => "analyzeBudget",
            CopilotAction::SummarizeNews(_) => "summarizeNews",
            CopilotAction::ScreenTimeAdvice(_) => "screenTimeAdvice",
        }
    }
}

fn parse_input<T: DeserializeOwned>(input: &Value) -> Result<T, ActionError> {
    T::deserialize(input).map_err(|e| ActionError::InvalidInput(format!("invalid input: {e}")))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ActionError> {
    if value.is_empty() {
        return Err(ActionError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

fn validate_month(month: &str) -> Result<(), ActionError> {
    NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| ActionError::InvalidInput(format!("month must be YYYY-MM, got {month:?}")))
}

/// Data operations behind the actions.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn create_task(&self, owner: &str, input: &CreateTaskInput) -> Result<Value, ActionError>;
    async fn update_task(&self, owner: &str, input: &UpdateTaskInput) -> Result<(), ActionError>;
    async fn schedule_event(&self, owner: &str, input: &ScheduleEventInput) -> Result<Value, ActionError>;
    async fn analyze_budget(&self, owner: &str, month: &str) -> Result<Value, ActionError>;
}

/// Runs a validated action for `owner` and builds the response body.
pub async fn execute_action(
    executor: &dyn ActionExecutor,
    owner: &str,
    action: CopilotAction,
) -> Result<Value, ActionError> {
    info!("Executing copilot action {} for {owner}", action.name());

    match action {
        CopilotAction::CreateTask(input) => {
            let task = executor.create_task(owner, &input).await?;
            Ok(json!({ "ok": true, "task": task }))
        }
        CopilotAction::UpdateTask(input) => {
            executor.update_task(owner, &input).await?;
            Ok(json!({ "ok": true }))
        }
        CopilotAction::ScheduleEvent(input) => {
            let event = executor.schedule_event(owner, &input).await?;
            Ok(json!({ "ok": true, "event": event }))
        }
        CopilotAction::AnalyzeBudget(input) => {
            let summary = executor.analyze_budget(owner, &input.month).await?;
            Ok(json!({ "ok": true, "summary": summary }))
        }
        CopilotAction::SummarizeNews(input) => Ok(json!({
            "ok": true,
            "summary": { "symbols": input.symbols, "highlights": [] },
        })),
        CopilotAction::ScreenTimeAdvice(input) => Ok(json!({
            "ok": true,
            "advice": { "range": input.range, "tips": [] },
        })),
    }
}

fn with_owner<T: Serialize>(owner: &str, input: &T) -> Result<Value, ActionError> {
    let mut row = serde_json::to_value(input).map_err(|e| ActionError::Backend(e.to_string()))?;
    if let Value::Object(fields) = &mut row {
        fields.insert("user_id".to_string(), Value::String(owner.to_string()));
    }
    Ok(row)
}

pub struct PostgrestActionExecutor {
    client: Postgrest,
}

impl PostgrestActionExecutor {
    pub fn new(client: Postgrest) -> Self {
        Self { client }
    }

    async fn insert_row(&self, table: &str, row: Value) -> Result<Value, ActionError> {
        let query = self.client.from(table).insert(json!([row]).to_string()).single();
        execute_json(query).await.map_err(ActionError::Backend)
    }
}

#[async_trait]
impl ActionExecutor for PostgrestActionExecutor {
    async fn create_task(&self, owner: &str, input: &CreateTaskInput) -> Result<Value, ActionError> {
        self.insert_row("tasks", with_owner(owner, input)?).await
    }

    async fn update_task(&self, owner: &str, input: &UpdateTaskInput) -> Result<(), ActionError> {
        let changes = serde_json::to_string(input).map_err(|e| ActionError::Backend(e.to_string()))?;
        let query = self
            .client
            .from("tasks")
            .eq("id", &input.id)
            .eq("user_id", owner)
            .update(changes);
        execute(query).await.map_err(ActionError::Backend)?;
        Ok(())
    }

    async fn schedule_event(&self, owner: &str, input: &ScheduleEventInput) -> Result<Value, ActionError> {
        self.insert_row("events", with_owner(owner, input)?).await
    }

    async fn analyze_budget(&self, _owner: &str, month: &str) -> Result<Value, ActionError> {
        let params = json!({ "p_month": month }).to_string();
        execute_json(self.client.rpc("analyze_budget_month", params))
            .await
            .map_err(ActionError::Backend)
    }
}

/// Keeps created rows in memory, keyed by table.
#[derive(Default)]
pub struct MemoryActionExecutor {
    rows: DashMap<String, Vec<Value>>,
}

impl MemoryActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.rows
            .get(table)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn insert_row(&self, table: &str, mut row: Value) -> Value {
        if let Value::Object(fields) = &mut row {
            fields.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
            fields.insert("created_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        }
        self.rows.entry(table.to_string()).or_default().push(row.clone());
        row
    }
}

#[async_trait]
impl ActionExecutor for MemoryActionExecutor {
    async fn create_task(&self, owner: &str, input: &CreateTaskInput) -> Result<Value, ActionError> {
        let mut row = with_owner(owner, input)?;
        if let Value::Object(fields) = &mut row {
            fields.insert("stage".to_string(), Value::String("todo".to_string()));
        }
        Ok(self.insert_row("tasks", row))
    }

    async fn update_task(&self, owner: &str, input: &UpdateTaskInput) -> Result<(), ActionError> {
        let changes = serde_json::to_value(input).map_err(|e| ActionError::Backend(e.to_string()))?;
        let Value::Object(changes) = changes else {
            return Ok(());
        };

        if let Some(mut tasks) = self.rows.get_mut("tasks") {
            let target = tasks
                .iter_mut()
                .find(|row| row["id"] == input.id.as_str() && row["user_id"] == owner);
            if let Some(Value::Object(fields)) = target {
                fields.extend(changes);
            }
        }
        Ok(())
    }

    async fn schedule_event(&self, owner: &str, input: &ScheduleEventInput) -> Result<Value, ActionError> {
        Ok(self.insert_row("events", with_owner(owner, input)?))
    }

    async fn analyze_budget(&self, _owner: &str, _month: &str) -> Result<Value, ActionError> {
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_task_applies_defaults() {
        let action = CopilotAction::parse("createTask", &json!({ "title": "Write report" })).unwrap();
        match action {
            CopilotAction::CreateTask(input) => {
                assert_eq!(input.priority, TaskPriority::Medium);
                assert!(input.description.is_none());
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_empty_title_is_rejected() {
        let err = CopilotAction::parse("createTask", &json!({ "title": "" })).unwrap_err();
        assert_eq!(err.to_string(), "title must not be empty");
    }

    #[test]
    fn test_bad_enum_value_is_rejected() {
        let err = CopilotAction::parse("updateTask", &json!({ "id": "t1", "stage": "archived" })).unwrap_err();
        assert!(matches!(err, ActionError::InvalidInput(_)));
    }

    #[test]
    fn test_schedule_event_requires_start() {
        assert!(CopilotAction::parse("scheduleEvent", &json!({ "title": "Standup" })).is_err());
        assert!(CopilotAction::parse(
            "scheduleEvent",
            &json!({ "title": "Standup", "starts_at": "2024-06-01T09:00:00Z" })
        )
        .is_ok());
    }

    #[test]
    fn test_month_must_be_year_and_month() {
        assert!(CopilotAction::parse("analyzeBudget", &json!({ "month": "2024-06" })).is_ok());
        assert!(CopilotAction::parse("analyzeBudget", &json!({ "month": "2024-13" })).is_err());
        assert!(CopilotAction::parse("analyzeBudget", &json!({ "month": "" })).is_err());
    }

    #[test]
    fn test_optional_inputs_default() {
        let news = CopilotAction::parse("summarizeNews", &json!({})).unwrap();
        assert_eq!(news, CopilotAction::SummarizeNews(SummarizeNewsInput { symbols: vec![] }));

        let advice = CopilotAction::parse("screenTimeAdvice", &json!({})).unwrap();
        assert_eq!(
            advice,
            CopilotAction::ScreenTimeAdvice(ScreenTimeAdviceInput { range: ScreenTimeRange::Week })
        );
    }

    #[test]
    fn test_unknown_action() {
        let err = CopilotAction::parse("deleteEverything", &json!({})).unwrap_err();
        assert!(matches!(err, ActionError::UnknownAction(_)));
        assert_eq!(err.to_string(), "Unknown action");
    }

    #[test]
    fn test_every_listed_action_parses_by_name() {
        for name in ACTION_NAMES {
            let err = CopilotAction::parse(name, &Value::Null).err();
            assert!(!matches!(err, Some(ActionError::UnknownAction(_))), "{name}");
        }
    }

    #[tokio::test]
    async fn test_memory_executor_scopes_updates_to_owner() {
        let executor = MemoryActionExecutor::new();
        let create = CopilotAction::parse("createTask", &json!({ "title": "Gym" })).unwrap();
        let response = execute_action(&executor, "user-1", create).await.unwrap();
        let id = response["task"]["id"].as_str().unwrap().to_string();
        assert_eq!(response["task"]["user_id"], "user-1");

        let update = CopilotAction::parse("updateTask", &json!({ "id": id, "stage": "done" })).unwrap();
        execute_action(&executor, "user-2", update.clone()).await.unwrap();
        assert_eq!(executor.rows("tasks")[0]["stage"], "todo");

        execute_action(&executor, "user-1", update).await.unwrap();
        assert_eq!(executor.rows("tasks")[0]["stage"], "done");
    }

    #[tokio::test]
    async fn test_placeholder_actions_respond_without_backend() {
        let executor = MemoryActionExecutor::new();
        let action = CopilotAction::parse("summarizeNews", &json!({ "symbols": ["AAPL"] })).unwrap();
        let response = execute_action(&executor, "user-1", action).await.unwrap();
        assert_eq!(response, json!({ "ok": true, "summary": { "symbols": ["AAPL"], "highlights": [] } }));
    }
}
