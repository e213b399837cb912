// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use freja_model::{
    AgentEvent, AgentInput, AssistantWireMessage, StreamPayload, WireBlock, WireDelta, WireUsage,
};
use tokio::sync::mpsc;

use crate::driver::{AgentDriver, AgentLaunch, AgentSession, SpawnError, StderrSignals};

/// A pre-scripted subprocess run.  Each spawn pops the next run from the
/// driver's queue; each user message emits the next turn's event list.  This
/// lets tests specify exact event sequences — tool trees, sub-agent nesting,
/// errors — without a real subprocess.
#[derive(Default)]
pub struct ScriptedRun {
    /// Fail the spawn itself (the synchronous already-in-use path).
    pub fail_already_in_use: bool,
    /// Events emitted as soon as the run starts (typically `system-init`).
    pub init_events: Vec<AgentEvent>,
    /// Per-user-message event scripts, consumed front to back.
    pub turns: VecDeque<Vec<AgentEvent>>,
    /// Raise the stderr already-in-use flag and end the stream immediately
    /// after the init events (the asynchronous detection path).
    pub stderr_already_in_use: bool,
}

impl ScriptedRun {
    pub fn with_init(session_id: &str) -> Self {
        Self {
            init_events: vec![system_init(session_id)],
            ..Default::default()
        }
    }

    pub fn then_turn(mut self, events: Vec<AgentEvent>) -> Self {
        self.turns.push_back(events);
        self
    }
}

/// Deterministic [`AgentDriver`] for tests.  Records every launch and every
/// input record so assertions can inspect exactly what the controller sent.
#[derive(Default)]
pub struct ScriptedDriver {
    runs: Mutex<VecDeque<ScriptedRun>>,
    pub launches: Mutex<Vec<AgentLaunch>>,
    pub inputs: Arc<Mutex<Vec<AgentInput>>>,
}

impl ScriptedDriver {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            ..Default::default()
        }
    }

    pub fn push_run(&self, run: ScriptedRun) {
        self.runs.lock().expect("runs poisoned").push_back(run);
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().expect("launches poisoned").len()
    }

    pub fn recorded_inputs(&self) -> Vec<AgentInput> {
        self.inputs.lock().expect("inputs poisoned").clone()
    }
}

#[async_trait]
impl AgentDriver for ScriptedDriver {
    async fn spawn(&self, launch: &AgentLaunch) -> Result<AgentSession, SpawnError> {
        self.launches
            .lock()
            .expect("launches poisoned")
            .push(launch.clone());

        let run = self
            .runs
            .lock()
            .expect("runs poisoned")
            .pop_front()
            .unwrap_or_else(|| ScriptedRun::with_init("scripted-session"));

        if run.fail_already_in_use {
            return Err(SpawnError::AlreadyInUse);
        }

        let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(256);
        let (input_tx, mut input_rx) = mpsc::channel::<AgentInput>(64);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let signals = Arc::new(StderrSignals::default());

        let inputs = Arc::clone(&self.inputs);
        let signals_task = Arc::clone(&signals);
        tokio::spawn(async move {
            for event in run.init_events {
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
            if run.stderr_already_in_use {
                signals_task.mark_already_in_use();
                // Dropping event_tx ends the stream, like a crashed start.
                return;
            }
            let mut turns = run.turns;
            loop {
                tokio::select! {
                    _ = kill_rx.recv() => break,
                    record = input_rx.recv() => {
                        let Some(record) = record else { break };
                        let is_user = matches!(record, AgentInput::User { .. });
                        inputs.lock().expect("inputs poisoned").push(record);
                        if is_user {
                            let turn = turns.pop_front().unwrap_or_else(|| text_turn("ok", None));
                            for event in turn {
                                if event_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(AgentSession {
            events: event_rx,
            input: input_tx,
            signals,
            kill: kill_tx,
        })
    }
}

// ─── Event script helpers ─────────────────────────────────────────────────────

pub fn system_init(session_id: &str) -> AgentEvent {
    AgentEvent::System {
        subtype: "init".into(),
        session_id: Some(session_id.to_string()),
        model: Some("mock-model".into()),
        tools: vec!["Bash".into(), "Read".into()],
        slash_commands: vec![],
        agents: vec![],
        skills: vec![],
        plugins: vec![],
        status: None,
    }
}

/// A plain streamed text turn: block start, one delta, stop, full assistant
/// payload, result with usage.
pub fn text_turn(text: &str, uuid: Option<&str>) -> Vec<AgentEvent> {
    vec![
        AgentEvent::StreamEvent {
            event: StreamPayload::ContentBlockStart {
                index: 0,
                content_block: WireBlock::Text {
                    text: String::new(),
                },
            },
            parent_tool_use_id: None,
            session_id: None,
        },
        AgentEvent::StreamEvent {
            event: StreamPayload::ContentBlockDelta {
                index: 0,
                delta: WireDelta::TextDelta { text: text.into() },
            },
            parent_tool_use_id: None,
            session_id: None,
        },
        AgentEvent::StreamEvent {
            event: StreamPayload::ContentBlockStop { index: 0 },
            parent_tool_use_id: None,
            session_id: None,
        },
        AgentEvent::Assistant {
            message: AssistantWireMessage {
                content: vec![WireBlock::Text { text: text.into() }],
                model: Some("mock-model".into()),
            },
            parent_tool_use_id: None,
            uuid: uuid.map(str::to_string),
        },
        result_success(10, 4),
    ]
}

pub fn result_success(input_tokens: u64, output_tokens: u64) -> AgentEvent {
    AgentEvent::Result {
        subtype: "success".into(),
        usage: Some(WireUsage {
            input_tokens,
            output_tokens,
            ..Default::default()
        }),
        model_usage: HashMap::from([(
            "mock-model".to_string(),
            WireUsage {
                input_tokens,
                output_tokens,
                ..Default::default()
            },
        )]),
        result: None,
        is_error: false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
