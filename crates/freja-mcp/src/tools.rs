// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::debug;

use crate::api::{CronTaskSpec, ManagementApiClient};
use crate::spec::{CRON_DONE_SERVER_ID, CRON_TASKS_SERVER_ID};

/// Result of an in-process tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            content: msg.into(),
            is_error: true,
        }
    }
}

/// A tool hosted inside the core rather than behind a child process.
#[async_trait]
pub trait InProcessTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, args: &Value) -> ToolOutcome;
}

/// A named group of in-process tools, addressed by the subprocess as
/// `mcp__<id>__<tool>`.
pub struct InProcessServer {
    pub id: String,
    tools: Vec<Arc<dyn InProcessTool>>,
    /// Present only on the cron-done server; lets the cron runner await the
    /// `end_task` call without downcasting the tool object.
    end_task_signal: Option<Arc<CompletionSignal>>,
}

impl std::fmt::Debug for InProcessServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessServer")
            .field("id", &self.id)
            .field("tools", &self.tool_names())
            .finish()
    }
}

impl InProcessServer {
    pub fn new(id: impl Into<String>, tools: Vec<Arc<dyn InProcessTool>>) -> Self {
        Self {
            id: id.into(),
            tools,
            end_task_signal: None,
        }
    }

    /// The end-of-scheduled-task server (cron executions only).
    pub fn cron_done() -> Self {
        let tool = EndTaskTool::new();
        let signal = Arc::clone(&tool.signal);
        let mut server = Self::new(
            CRON_DONE_SERVER_ID,
            vec![Arc::new(tool) as Arc<dyn InProcessTool>],
        );
        server.end_task_signal = Some(signal);
        server
    }

    /// The scheduled-task management server (IM executions with a reachable
    /// management API only).
    pub fn cron_tasks(management_port: u16) -> Self {
        let client = Arc::new(ManagementApiClient::new(management_port));
        Self::new(
            CRON_TASKS_SERVER_ID,
            vec![
                Arc::new(CreateTaskTool {
                    client: Arc::clone(&client),
                }) as Arc<dyn InProcessTool>,
                Arc::new(ListTasksTool {
                    client: Arc::clone(&client),
                }),
                Arc::new(UpdateTaskTool {
                    client: Arc::clone(&client),
                }),
                Arc::new(DeleteTaskTool {
                    client: Arc::clone(&client),
                }),
                Arc::new(RunTaskTool { client }),
            ],
        )
    }

    pub fn tool(&self, name: &str) -> Option<&Arc<dyn InProcessTool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// The completion signal of the `end_task` tool, when this server has one.
    pub fn completion_signal(&self) -> Option<Arc<CompletionSignal>> {
        self.end_task_signal.clone()
    }
}

// ─── End-task tool ────────────────────────────────────────────────────────────

/// One-shot "the scheduled task is finished" signal observed by the cron
/// runner.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    done: AtomicBool,
    notify: Notify,
}

impl CompletionSignal {
    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        while !self.is_done() {
            self.notify.notified().await;
        }
    }
}

/// Lets the agent declare a scheduled task complete so the cron runner can
/// tear the session down instead of waiting for an idle timeout.
struct EndTaskTool {
    signal: Arc<CompletionSignal>,
}

impl EndTaskTool {
    fn new() -> Self {
        Self {
            signal: Arc::new(CompletionSignal::default()),
        }
    }
}

#[async_trait]
impl InProcessTool for EndTaskTool {
    fn name(&self) -> &str {
        "end_task"
    }

    fn description(&self) -> &str {
        "Declare the current scheduled task finished. Call this once when the \
         task's goal is met; the session will be wound down afterwards."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string", "description": "One-line result summary" }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value) -> ToolOutcome {
        let summary = args.get("summary").and_then(Value::as_str).unwrap_or("");
        debug!(summary, "scheduled task marked complete");
        self.signal.mark_done();
        ToolOutcome::ok("task marked complete")
    }
}

// ─── Scheduled-task management tools ──────────────────────────────────────────

struct CreateTaskTool {
    client: Arc<ManagementApiClient>,
}

#[async_trait]
impl InProcessTool for CreateTaskTool {
    fn name(&self) -> &str {
        "create_task"
    }

    fn description(&self) -> &str {
        "Create a scheduled task. The schedule is one of: {\"at\": ISO-8601}, \
         {\"every\": minutes >= 5}, or {\"cron\": expr, \"tz\"?: IANA zone}."
    }

    fn parameters_schema(&self) -> Value {
        task_spec_schema()
    }

    async fn execute(&self, args: &Value) -> ToolOutcome {
        let spec: CronTaskSpec = match serde_json::from_value(args.clone()) {
            Ok(s) => s,
            Err(e) => return ToolOutcome::err(format!("invalid task spec: {e}")),
        };
        match self.client.create(&spec).await {
            Ok(v) => ToolOutcome::ok(v.to_string()),
            Err(e) => ToolOutcome::err(format!("create failed: {e:#}")),
        }
    }
}

struct ListTasksTool {
    client: Arc<ManagementApiClient>,
}

#[async_trait]
impl InProcessTool for ListTasksTool {
    fn name(&self) -> &str {
        "list_tasks"
    }

    fn description(&self) -> &str {
        "List all scheduled tasks with their ids, schedules, and delivery targets."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn execute(&self, _args: &Value) -> ToolOutcome {
        match self.client.list().await {
            Ok(v) => ToolOutcome::ok(v.to_string()),
            Err(e) => ToolOutcome::err(format!("list failed: {e:#}")),
        }
    }
}

struct UpdateTaskTool {
    client: Arc<ManagementApiClient>,
}

#[async_trait]
impl InProcessTool for UpdateTaskTool {
    fn name(&self) -> &str {
        "update_task"
    }

    fn description(&self) -> &str {
        "Update an existing scheduled task by id. Provide the full new spec."
    }

    fn parameters_schema(&self) -> Value {
        let mut schema = task_spec_schema();
        schema["properties"]["id"] = json!({ "type": "string" });
        schema["required"]
            .as_array_mut()
            .expect("schema has required array")
            .push(json!("id"));
        schema
    }

    async fn execute(&self, args: &Value) -> ToolOutcome {
        let Some(id) = args.get("id").and_then(Value::as_str) else {
            return ToolOutcome::err("missing 'id'");
        };
        let mut body = args.clone();
        body.as_object_mut().map(|o| o.remove("id"));
        let spec: CronTaskSpec = match serde_json::from_value(body) {
            Ok(s) => s,
            Err(e) => return ToolOutcome::err(format!("invalid task spec: {e}")),
        };
        match self.client.update(id, &spec).await {
            Ok(v) => ToolOutcome::ok(v.to_string()),
            Err(e) => ToolOutcome::err(format!("update failed: {e:#}")),
        }
    }
}

struct DeleteTaskTool {
    client: Arc<ManagementApiClient>,
}

#[async_trait]
impl InProcessTool for DeleteTaskTool {
    fn name(&self) -> &str {
        "delete_task"
    }

    fn description(&self) -> &str {
        "Delete a scheduled task by id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value) -> ToolOutcome {
        let Some(id) = args.get("id").and_then(Value::as_str) else {
            return ToolOutcome::err("missing 'id'");
        };
        match self.client.delete(id).await {
            Ok(v) => ToolOutcome::ok(v.to_string()),
            Err(e) => ToolOutcome::err(format!("delete failed: {e:#}")),
        }
    }
}

struct RunTaskTool {
    client: Arc<ManagementApiClient>,
}

#[async_trait]
impl InProcessTool for RunTaskTool {
    fn name(&self) -> &str {
        "run_task"
    }

    fn description(&self) -> &str {
        "Trigger a scheduled task immediately, outside its schedule."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: &Value) -> ToolOutcome {
        let Some(id) = args.get("id").and_then(Value::as_str) else {
            return ToolOutcome::err("missing 'id'");
        };
        match self.client.run(id).await {
            Ok(v) => ToolOutcome::ok(v.to_string()),
            Err(e) => ToolOutcome::err(format!("run failed: {e:#}")),
        }
    }
}

fn task_spec_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "schedule": {
                "type": "object",
                "description": "Exactly one of: {at}, {every}, {cron, tz?}"
            },
            "message": { "type": "string" },
            "delivery": {
                "type": "object",
                "properties": {
                    "platform": { "type": "string" },
                    "botId": { "type": "string" },
                    "chatId": { "type": "string" }
                },
                "required": ["platform", "botId", "chatId"]
            },
            "workspace": { "type": "string" },
            "model": { "type": "string" },
            "permissionMode": { "type": "string" }
        },
        "required": ["schedule", "message", "delivery", "workspace"],
        "additionalProperties": true
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
