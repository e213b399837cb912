// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! MCP integration: turns declarative server definitions into the concrete
//! child-process spec map handed to the agent subprocess.
//!
//! Pure policy — nothing here spawns a process.  The subprocess launches the
//! external servers itself; the two in-process servers (scheduled-task
//! control) run inside the core and are only *declared* through the spec map
//! so the permission engine can gate them by server id.

mod api;
mod integrator;
mod spec;
mod tools;

pub use api::{CronDelivery, CronSchedule, CronTaskSpec, ManagementApiClient, ScheduleError};
pub use integrator::{build_server_specs, PINNED_PACKAGE_VERSIONS};
pub use spec::{
    mcp_server_id, ExecutionContext, ExternalServerSpec, ImContext, ServerSpecs,
    CRON_DONE_SERVER_ID, CRON_TASKS_SERVER_ID,
};
pub use tools::{CompletionSignal, InProcessServer, InProcessTool, ToolOutcome};
