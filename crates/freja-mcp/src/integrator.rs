// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Deterministic computation of the MCP server spec map.
//!
//! Selection: an explicit in-memory override wins; otherwise the config
//! file's enabled-id list is merged with the builtin presets and the user's
//! custom definitions.  Builtin stdio servers get their invocation rewritten
//! onto the bundled runtime and their `@latest` specifiers pinned; custom
//! commands run verbatim.

use std::collections::HashMap;
use std::sync::Arc;

use freja_config::{Config, McpServerDef, McpTransport};
use tracing::debug;

use crate::spec::{ExecutionContext, ExternalServerSpec, ServerSpecs};
use crate::tools::InProcessServer;

/// Known package versions, replacing `@latest` so a server launch never pays
/// a registry metadata round-trip.  Keep this table in lockstep with the
/// builtin preset list shipped by the desktop shell.
pub const PINNED_PACKAGE_VERSIONS: &[(&str, &str)] = &[
    ("@playwright/mcp", "0.0.41"),
    ("@upstash/context7-mcp", "1.0.14"),
    ("@modelcontextprotocol/server-filesystem", "2025.7.29"),
    ("@modelcontextprotocol/server-sequential-thinking", "2025.7.1"),
    ("chrome-devtools-mcp", "0.4.0"),
];

/// File name of the bundled runtime launcher (supports `<launcher> x <pkg>`).
const BUNDLED_LAUNCHER: &str = "bun";

/// Compute the server spec map for one subprocess launch.
///
/// `presets` are the builtin definitions shipped with the app; `override_list`
/// is the session's in-memory selection (`None` falls back to the config
/// file, an explicit empty list disables every user server).
pub fn build_server_specs(
    presets: &[McpServerDef],
    override_list: Option<&[McpServerDef]>,
    config: &Config,
    ctx: &ExecutionContext,
) -> ServerSpecs {
    let mut specs = ServerSpecs::default();

    match override_list {
        Some(defs) => {
            for def in defs {
                specs
                    .external
                    .insert(def.id.clone(), resolve_def(def, config, ctx));
            }
        }
        None => {
            let enabled = config.mcp_enabled_servers.as_deref();
            for def in presets.iter().chain(config.mcp_servers.iter()) {
                if let Some(ids) = enabled {
                    if !ids.iter().any(|id| id == &def.id) {
                        continue;
                    }
                }
                specs
                    .external
                    .insert(def.id.clone(), resolve_def(def, config, ctx));
            }
        }
    }

    // Always-available in-process servers, gated by invocation context.
    if ctx.is_cron() {
        specs
            .in_process
            .push(Arc::new(InProcessServer::cron_done()));
    }
    if ctx.is_im() {
        if let Some(port) = ctx.management_port {
            specs
                .in_process
                .push(Arc::new(InProcessServer::cron_tasks(port)));
        }
    }

    debug!(
        external = specs.external.len(),
        in_process = specs.in_process.len(),
        "mcp server specs computed"
    );
    specs
}

fn resolve_def(def: &McpServerDef, config: &Config, ctx: &ExecutionContext) -> ExternalServerSpec {
    match &def.transport {
        McpTransport::Sse { url, headers } => ExternalServerSpec::Sse {
            url: url.clone(),
            headers: headers.clone(),
        },
        McpTransport::Http { url, headers } => ExternalServerSpec::Http {
            url: url.clone(),
            headers: headers.clone(),
        },
        McpTransport::Stdio { command, args, env } => {
            let mut args = match config.mcp_server_args.get(&def.id) {
                Some(overridden) => overridden.clone(),
                None => args.clone(),
            };
            let mut env = env.clone();
            if let Some(extra) = config.mcp_server_env.get(&def.id) {
                env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
            }

            if !def.builtin {
                // User-defined commands run verbatim.
                return ExternalServerSpec::Stdio {
                    command: command.clone(),
                    args,
                    env,
                };
            }

            for arg in args.iter_mut() {
                *arg = pin_version(arg);
            }

            let command = if command == "npx" {
                match bundled_launcher(ctx) {
                    Some(launcher) => {
                        // `bun x <pkg>` — no npm prompt, no Node requirement.
                        args.retain(|a| a != "-y" && a != "--yes");
                        args.insert(0, "x".to_string());
                        launcher
                    }
                    None => {
                        // Keep npx but make sure it cannot stop to ask.
                        if !args.iter().any(|a| a == "-y" || a == "--yes") {
                            args.insert(0, "-y".to_string());
                        }
                        command.clone()
                    }
                }
            } else {
                command.clone()
            };

            ExternalServerSpec::Stdio { command, args, env }
        }
    }
}

fn bundled_launcher(ctx: &ExecutionContext) -> Option<String> {
    let dir = ctx.bundled_runtime_dir.as_ref()?;
    let path = dir.join(BUNDLED_LAUNCHER);
    if path.is_file() {
        Some(path.to_string_lossy().into_owned())
    } else {
        None
    }
}

/// `pkg@latest` → `pkg@<pinned>` when the package is in the table.
fn pin_version(arg: &str) -> String {
    let Some(pkg) = arg.strip_suffix("@latest") else {
        return arg.to_string();
    };
    for (name, version) in PINNED_PACKAGE_VERSIONS {
        if *name == pkg {
            return format!("{pkg}@{version}");
        }
    }
    arg.to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{CRON_DONE_SERVER_ID, CRON_TASKS_SERVER_ID, ImContext};

    fn builtin_npx(id: &str, pkg: &str) -> McpServerDef {
        McpServerDef {
            id: id.into(),
            name: None,
            builtin: true,
            transport: McpTransport::Stdio {
                command: "npx".into(),
                args: vec![format!("{pkg}@latest")],
                env: HashMap::new(),
            },
        }
    }

    fn custom_stdio(id: &str) -> McpServerDef {
        McpServerDef {
            id: id.into(),
            name: None,
            builtin: false,
            transport: McpTransport::Stdio {
                command: "node".into(),
                args: vec!["server.js".into()],
                env: HashMap::new(),
            },
        }
    }

    fn im_ctx(port: Option<u16>) -> ExecutionContext {
        ExecutionContext {
            im: Some(ImContext {
                platform: "telegram".into(),
                bot_id: "bot".into(),
                chat_id: "chat".into(),
            }),
            management_port: port,
            ..Default::default()
        }
    }

    // ── Selection ─────────────────────────────────────────────────────────────

    #[test]
    fn null_override_falls_back_to_config_enabled_list() {
        let presets = vec![builtin_npx("playwright", "@playwright/mcp"), builtin_npx("context7", "@upstash/context7-mcp")];
        let config = Config {
            mcp_enabled_servers: Some(vec!["playwright".into()]),
            ..Default::default()
        };
        let specs = build_server_specs(&presets, None, &config, &ExecutionContext::default());
        assert!(specs.external.contains_key("playwright"));
        assert!(!specs.external.contains_key("context7"));
    }

    #[test]
    fn no_enabled_list_means_all_presets() {
        let presets = vec![builtin_npx("playwright", "@playwright/mcp")];
        let config = Config::default();
        let specs = build_server_specs(&presets, None, &config, &ExecutionContext::default());
        assert_eq!(specs.external.len(), 1);
    }

    #[test]
    fn explicit_empty_override_disables_user_servers() {
        let presets = vec![builtin_npx("playwright", "@playwright/mcp")];
        let specs = build_server_specs(
            &presets,
            Some(&[]),
            &Config::default(),
            &ExecutionContext::default(),
        );
        assert!(specs.external.is_empty());
    }

    #[test]
    fn config_customs_are_merged_with_presets() {
        let presets = vec![builtin_npx("playwright", "@playwright/mcp")];
        let config = Config {
            mcp_servers: vec![custom_stdio("mine")],
            ..Default::default()
        };
        let specs = build_server_specs(&presets, None, &config, &ExecutionContext::default());
        assert!(specs.external.contains_key("playwright"));
        assert!(specs.external.contains_key("mine"));
    }

    #[test]
    fn idempotent_for_same_inputs() {
        let presets = vec![builtin_npx("playwright", "@playwright/mcp")];
        let config = Config::default();
        let ctx = ExecutionContext::default();
        let a = build_server_specs(&presets, None, &config, &ctx);
        let b = build_server_specs(&presets, None, &config, &ctx);
        assert_eq!(a.external, b.external);
    }

    // ── Rewriting ─────────────────────────────────────────────────────────────

    #[test]
    fn builtin_npx_without_runtime_gets_noninteractive_flag() {
        let presets = vec![builtin_npx("playwright", "@playwright/mcp")];
        let specs =
            build_server_specs(&presets, None, &Config::default(), &ExecutionContext::default());
        match &specs.external["playwright"] {
            ExternalServerSpec::Stdio { command, args, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args[0], "-y");
            }
            other => panic!("wrong spec: {other:?}"),
        }
    }

    #[test]
    fn builtin_npx_rewrites_onto_bundled_runtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bun"), "").unwrap();
        let ctx = ExecutionContext {
            bundled_runtime_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let presets = vec![builtin_npx("playwright", "@playwright/mcp")];
        let specs = build_server_specs(&presets, None, &Config::default(), &ctx);
        match &specs.external["playwright"] {
            ExternalServerSpec::Stdio { command, args, .. } => {
                assert!(command.ends_with("bun"), "command was {command}");
                assert_eq!(args[0], "x");
                assert!(!args.contains(&"-y".to_string()));
            }
            other => panic!("wrong spec: {other:?}"),
        }
    }

    #[test]
    fn latest_specifier_is_pinned_for_known_packages() {
        let presets = vec![builtin_npx("playwright", "@playwright/mcp")];
        let specs =
            build_server_specs(&presets, None, &Config::default(), &ExecutionContext::default());
        match &specs.external["playwright"] {
            ExternalServerSpec::Stdio { args, .. } => {
                assert!(args.iter().any(|a| a == "@playwright/mcp@0.0.41"));
            }
            other => panic!("wrong spec: {other:?}"),
        }
    }

    #[test]
    fn unknown_package_keeps_latest() {
        let presets = vec![builtin_npx("odd", "@example/unknown-mcp")];
        let specs =
            build_server_specs(&presets, None, &Config::default(), &ExecutionContext::default());
        match &specs.external["odd"] {
            ExternalServerSpec::Stdio { args, .. } => {
                assert!(args.iter().any(|a| a == "@example/unknown-mcp@latest"));
            }
            other => panic!("wrong spec: {other:?}"),
        }
    }

    #[test]
    fn custom_command_is_verbatim() {
        let config = Config {
            mcp_servers: vec![custom_stdio("mine")],
            ..Default::default()
        };
        let specs = build_server_specs(&[], None, &config, &ExecutionContext::default());
        match &specs.external["mine"] {
            ExternalServerSpec::Stdio { command, args, .. } => {
                assert_eq!(command, "node");
                assert_eq!(args, &vec!["server.js".to_string()]);
            }
            other => panic!("wrong spec: {other:?}"),
        }
    }

    #[test]
    fn per_server_arg_and_env_overrides_apply() {
        let mut config = Config {
            mcp_servers: vec![],
            ..Default::default()
        };
        config
            .mcp_server_args
            .insert("playwright".into(), vec!["--headless".into()]);
        config.mcp_server_env.insert(
            "playwright".into(),
            HashMap::from([("DEBUG".to_string(), "1".to_string())]),
        );
        let presets = vec![builtin_npx("playwright", "@playwright/mcp")];
        let specs = build_server_specs(&presets, None, &config, &ExecutionContext::default());
        match &specs.external["playwright"] {
            ExternalServerSpec::Stdio { args, env, .. } => {
                assert!(args.iter().any(|a| a == "--headless"));
                assert_eq!(env.get("DEBUG").map(String::as_str), Some("1"));
            }
            other => panic!("wrong spec: {other:?}"),
        }
    }

    // ── In-process servers ────────────────────────────────────────────────────

    #[test]
    fn cron_context_adds_done_server_only() {
        let ctx = ExecutionContext {
            cron_task_id: Some("task-1".into()),
            ..Default::default()
        };
        let specs = build_server_specs(&[], None, &Config::default(), &ctx);
        assert!(specs.in_process_server(CRON_DONE_SERVER_ID).is_some());
        assert!(specs.in_process_server(CRON_TASKS_SERVER_ID).is_none());
    }

    #[test]
    fn im_context_with_port_adds_task_server() {
        let specs = build_server_specs(&[], None, &Config::default(), &im_ctx(Some(7801)));
        assert!(specs.in_process_server(CRON_TASKS_SERVER_ID).is_some());
    }

    #[test]
    fn im_context_without_port_adds_nothing() {
        let specs = build_server_specs(&[], None, &Config::default(), &im_ctx(None));
        assert!(specs.in_process.is_empty());
    }

    #[test]
    fn desktop_context_has_no_in_process_servers() {
        let specs =
            build_server_specs(&[], None, &Config::default(), &ExecutionContext::default());
        assert!(specs.in_process.is_empty());
    }
}
