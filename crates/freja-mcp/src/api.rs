// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Client for the host's scheduled-task management API.
//!
//! The cron daemon lives in the desktop shell; the core only talks to its
//! local HTTP endpoint.  Schedules are validated client-side so the agent
//! gets a usable error instead of a 400 body.

use std::str::FromStr;

use anyhow::Context;
use freja_config::{PermissionMode, ProviderEnv};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Minimum interval for `every`-style schedules, in minutes.
const MIN_EVERY_MINUTES: u32 = 5;

/// When to run a scheduled task.  Exactly one variant; the JSON shape is a
/// tagged union keyed by field name (`at` / `every` / `cron`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CronSchedule {
    At {
        /// ISO-8601 instant.
        at: String,
    },
    Every {
        /// Interval in minutes, at least [`MIN_EVERY_MINUTES`].
        every: u32,
    },
    Cron {
        cron: String,
        /// IANA timezone name; host-local when absent.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tz: Option<String>,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("`at` is not an ISO-8601 timestamp: {0}")]
    BadTimestamp(String),
    #[error("`every` must be at least {MIN_EVERY_MINUTES} minutes, got {0}")]
    IntervalTooShort(u32),
    #[error("`cron` expression does not parse: {0}")]
    BadCronExpr(String),
}

impl CronSchedule {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Self::At { at } => chrono::DateTime::parse_from_rfc3339(at)
                .map(|_| ())
                .map_err(|_| ScheduleError::BadTimestamp(at.clone())),
            Self::Every { every } => {
                if *every < MIN_EVERY_MINUTES {
                    Err(ScheduleError::IntervalTooShort(*every))
                } else {
                    Ok(())
                }
            }
            Self::Cron { cron: expr, .. } => cron::Schedule::from_str(expr)
                .map(|_| ())
                .map_err(|_| ScheduleError::BadCronExpr(expr.clone())),
        }
    }
}

/// Where a scheduled task's output is delivered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronDelivery {
    pub platform: String,
    pub bot_id: String,
    pub chat_id: String,
}

/// The create/update payload of the management API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronTaskSpec {
    pub schedule: CronSchedule,
    pub message: String,
    pub delivery: CronDelivery,
    pub workspace: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub permission_mode: Option<PermissionMode>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider_env: Option<ProviderEnv>,
}

pub struct ManagementApiClient {
    base: String,
    http: reqwest::Client,
}

impl ManagementApiClient {
    pub fn new(port: u16) -> Self {
        Self {
            base: format!("http://127.0.0.1:{port}"),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub async fn create(&self, spec: &CronTaskSpec) -> anyhow::Result<Value> {
        spec.schedule.validate()?;
        self.post("/api/cron/create", serde_json::to_value(spec)?)
            .await
    }

    pub async fn update(&self, task_id: &str, spec: &CronTaskSpec) -> anyhow::Result<Value> {
        spec.schedule.validate()?;
        let mut body = serde_json::to_value(spec)?;
        body["id"] = Value::String(task_id.to_string());
        self.post("/api/cron/update", body).await
    }

    pub async fn delete(&self, task_id: &str) -> anyhow::Result<Value> {
        self.post("/api/cron/delete", serde_json::json!({ "id": task_id }))
            .await
    }

    pub async fn run(&self, task_id: &str) -> anyhow::Result<Value> {
        self.post("/api/cron/run", serde_json::json!({ "id": task_id }))
            .await
    }

    pub async fn list(&self) -> anyhow::Result<Value> {
        let url = format!("{}/api/cron/list", self.base);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        resp.json().await.context("decoding cron list response")
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let url = format!("{}{path}", self.base);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?;
        resp.json().await.context("decoding management API response")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
