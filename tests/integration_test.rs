// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end scenarios driven through the full controller stack with a
//! scripted agent subprocess.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use freja_core::mock::{result_success, ScriptedDriver, ScriptedRun};
use freja_core::{
    AgentDriver, ControllerOptions, EnqueueOptions, ImagePayload, PermissionReply,
    SessionController, ASK_USER_TOOL, STRIPPED_RESULT_SENTINEL,
};
use freja_mcp::ExecutionContext;
use freja_model::{
    AgentEvent, AgentInput, ControlRequestPayload, PermissionResponsePayload, StreamPayload,
    UiEvent, WireBlock, WireDelta,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;

struct Harness {
    controller: SessionController,
    driver: Arc<ScriptedDriver>,
    events: broadcast::Receiver<UiEvent>,
    _dir: tempfile::TempDir,
}

fn harness(runs: Vec<ScriptedRun>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(ScriptedDriver::new(runs));
    let controller = SessionController::new(ControllerOptions {
        user_dir: dir.path().to_path_buf(),
        driver: Arc::clone(&driver) as Arc<dyn AgentDriver>,
        mcp_presets: vec![],
        exec_ctx: ExecutionContext::default(),
    });
    let events = controller.subscribe();
    Harness {
        controller,
        driver,
        events,
        _dir: dir,
    }
}

async fn wait_for(
    rx: &mut broadcast::Receiver<UiEvent>,
    mut pred: impl FnMut(&UiEvent) -> bool,
) -> UiEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

fn can_use_tool(request_id: &str, tool: &str, input: Value) -> AgentEvent {
    AgentEvent::ControlRequest {
        request_id: request_id.to_string(),
        request: ControlRequestPayload::CanUseTool {
            tool_name: tool.to_string(),
            input,
        },
    }
}

fn text_chunk(index: usize, text: &str) -> AgentEvent {
    AgentEvent::StreamEvent {
        event: StreamPayload::ContentBlockDelta {
            index,
            delta: WireDelta::TextDelta { text: text.into() },
        },
        parent_tool_use_id: None,
        session_id: None,
    }
}

// ── Scenario: permission cascade ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn one_always_allow_resolves_all_pending_requests_for_the_tool() {
    let mut h = harness(vec![ScriptedRun::with_init("agent-1").then_turn(vec![
        can_use_tool("r1", "WebSearch", json!({"query": "a"})),
        can_use_tool("r2", "WebSearch", json!({"query": "b"})),
        can_use_tool("r3", "WebSearch", json!({"query": "c"})),
        result_success(5, 5),
    ])]);
    h.controller
        .initialize(Path::new("/ws"), None, Some("sess-1".into()))
        .await
        .unwrap();
    h.controller
        .enqueue_user_message(EnqueueOptions {
            text: "search things".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Three distinct permission requests reach the UI.
    let mut request_ids = Vec::new();
    while request_ids.len() < 3 {
        if let UiEvent::PermissionRequest {
            request_id,
            tool_name,
            ..
        } = wait_for(&mut h.events, |e| {
            matches!(e, UiEvent::PermissionRequest { .. })
        })
        .await
        {
            assert_eq!(tool_name, "WebSearch");
            request_ids.push(request_id);
        }
    }

    // One always-allow resolves every pending request.
    assert!(h
        .controller
        .handle_permission_response(&request_ids[0], PermissionReply::AlwaysAllow));

    // All three control responses eventually reach the subprocess as allows.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let allows = h
            .driver
            .recorded_inputs()
            .into_iter()
            .filter(|input| {
                matches!(
                    input,
                    AgentInput::ControlResponse {
                        response: PermissionResponsePayload::Allow { .. },
                        ..
                    }
                )
            })
            .count();
        if allows == 3 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "allows never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(h.controller.get_pending_interactive_requests().is_empty());
}

// ── Scenario: ask-user protocol ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn ask_user_answers_are_folded_into_the_tool_input() {
    let question_input = json!({
        "questions": [{
            "question": "Deploy where?",
            "header": "Target",
            "options": ["staging", "production"],
            "multiSelect": false
        }]
    });
    let mut h = harness(vec![ScriptedRun::with_init("agent-1").then_turn(vec![
        can_use_tool("q1", ASK_USER_TOOL, question_input),
        result_success(2, 2),
    ])]);
    h.controller
        .initialize(Path::new("/ws"), None, Some("sess-1".into()))
        .await
        .unwrap();
    h.controller
        .enqueue_user_message(EnqueueOptions {
            text: "deploy it".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let request_id = match wait_for(&mut h.events, |e| {
        matches!(e, UiEvent::AskUserQuestionRequest { .. })
    })
    .await
    {
        UiEvent::AskUserQuestionRequest {
            request_id,
            questions,
        } => {
            assert_eq!(questions.len(), 1);
            assert_eq!(questions[0].header, "Target");
            request_id
        }
        _ => unreachable!(),
    };
    assert!(h
        .controller
        .handle_ask_user_question_response(&request_id, Some(vec!["staging".into()])));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    'outer: loop {
        for input in h.driver.recorded_inputs() {
            if let AgentInput::ControlResponse {
                response: PermissionResponsePayload::Allow { updated_input },
                ..
            } = input
            {
                let v = updated_input.expect("ask-user allow carries updated input");
                assert_eq!(v["answers"][0], "staging");
                break 'outer;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "allow never arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Scenario: decorative filter precision ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn decorative_wrapper_chunks_never_reach_ui_or_disk() {
    let mut decorative =
        "Z.ai Built-in Tool: web_search\n**Input:**\n```json\n{\"q\": 1}\n```\n".to_string();
    while decorative.len() < 200 {
        decorative.push('x');
    }
    // Same length, only one marker: must pass through.
    let mut benign = "**Input:** some ordinary markdown about inputs ".to_string();
    while benign.len() < 200 {
        benign.push('y');
    }

    let mut h = harness(vec![ScriptedRun::with_init("agent-1").then_turn(vec![
        text_chunk(0, &decorative),
        text_chunk(0, &benign),
        result_success(2, 2),
    ])]);
    h.controller
        .initialize(Path::new("/ws"), None, Some("sess-1".into()))
        .await
        .unwrap();
    h.controller
        .enqueue_user_message(EnqueueOptions {
            text: "go".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    wait_for(&mut h.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;

    // The benign chunk was broadcast, the decorative one was not.
    let mut rx = h.events;
    let mut chunks = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let UiEvent::MessageChunk { text, .. } = event {
            chunks.push(text);
        }
    }
    assert!(chunks.iter().any(|c| c == &benign));
    assert!(chunks.iter().all(|c| c != &decorative));

    // Persisted content likewise.
    let stored = h
        .controller
        .store()
        .load_transcript("sess-1")
        .await
        .unwrap();
    let assistant_text = stored.last().unwrap().plain_text();
    assert_eq!(assistant_text, benign);
}

// ── Tool-result stripping through the full stack ──────────────────────────────

#[tokio::test(start_paused = true)]
async fn opaque_tool_results_are_stripped_on_disk_but_kept_in_memory() {
    let mut h = harness(vec![ScriptedRun::with_init("agent-1").then_turn(vec![
        AgentEvent::StreamEvent {
            event: StreamPayload::ContentBlockStart {
                index: 0,
                content_block: WireBlock::ToolUse {
                    id: "shot-1".into(),
                    name: "mcp__playwright__screenshot".into(),
                    input: json!({}),
                },
            },
            parent_tool_use_id: None,
            session_id: None,
        },
        AgentEvent::User {
            message: freja_model::UserWireMessage {
                content: freja_model::UserWireContent::Blocks(vec![WireBlock::ToolResult {
                    tool_use_id: "shot-1".into(),
                    content: Value::String("binaryblobbinaryblob".into()),
                    is_error: false,
                }]),
            },
            parent_tool_use_id: None,
            uuid: None,
        },
        result_success(3, 3),
    ])]);
    h.controller
        .initialize(Path::new("/ws"), None, Some("sess-1".into()))
        .await
        .unwrap();
    h.controller
        .enqueue_user_message(EnqueueOptions {
            text: "screenshot the page".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    wait_for(&mut h.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;

    // In memory: the real payload (the subprocess context needs it).
    let messages = h.controller.get_messages().await;
    let tool = messages
        .last()
        .unwrap()
        .blocks()
        .unwrap()
        .iter()
        .find_map(|b| b.as_tool())
        .unwrap();
    assert_eq!(tool.result.as_ref().unwrap().content, "binaryblobbinaryblob");

    // On disk: the sentinel.
    let stored = h
        .controller
        .store()
        .load_transcript("sess-1")
        .await
        .unwrap();
    let stored_tool = stored
        .last()
        .unwrap()
        .blocks()
        .unwrap()
        .iter()
        .find_map(|b| b.as_tool())
        .unwrap();
    assert_eq!(
        stored_tool.result.as_ref().unwrap().content,
        STRIPPED_RESULT_SENTINEL
    );
}

// ── Attachments ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn image_messages_save_attachments_and_round_trip() {
    use base64::Engine as _;
    let mut h = harness(vec![ScriptedRun::with_init("agent-1")]);
    h.controller
        .initialize(Path::new("/ws"), None, Some("sess-1".into()))
        .await
        .unwrap();

    let payload = base64::engine::general_purpose::STANDARD.encode([0x89, 0x50, 0x4e, 0x47]);
    h.controller
        .enqueue_user_message(EnqueueOptions {
            text: String::new(),
            images: vec![ImagePayload {
                mime: "image/png".into(),
                base64_data: payload.clone(),
            }],
            ..Default::default()
        })
        .await
        .unwrap();

    let replayed = wait_for(&mut h.events, |e| matches!(e, UiEvent::MessageReplay { .. })).await;
    let attachment = match replayed {
        UiEvent::MessageReplay { message } => {
            assert_eq!(message.attachments.len(), 1);
            message.attachments[0].clone()
        }
        _ => unreachable!(),
    };
    let url = h
        .controller
        .store()
        .attachment_data_url(&attachment)
        .await
        .unwrap();
    assert_eq!(url, format!("data:image/png;base64,{payload}"));

    // A text-less message derives the image-message title.
    let meta = h.controller.store().metadata("sess-1").await.unwrap();
    assert_eq!(meta.title, "image message");

    // The subprocess payload put the image block before the (absent) text.
    wait_for(&mut h.events, |e| matches!(e, UiEvent::MessageComplete { .. })).await;
    let inputs = h.driver.recorded_inputs();
    let user = inputs
        .iter()
        .find_map(|i| match i {
            AgentInput::User { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("user record sent");
    assert!(matches!(
        user.content[0],
        freja_model::UserInputBlock::Image { .. }
    ));
}
