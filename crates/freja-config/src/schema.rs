// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The config file written by the desktop shell.  Field names are the shell's
/// JSON contract (camelCase) and must not drift.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Ids of user-enabled MCP servers.  `None` means the user never touched
    /// the toggle list — every preset server stays enabled.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mcp_enabled_servers: Option<Vec<String>>,
    /// Custom server definitions added by the user.
    #[serde(default)]
    pub mcp_servers: Vec<McpServerDef>,
    /// Per-server argument overrides, keyed by server id.
    #[serde(default)]
    pub mcp_server_args: HashMap<String, Vec<String>>,
    /// Per-server environment overrides, keyed by server id.
    #[serde(default)]
    pub mcp_server_env: HashMap<String, HashMap<String, String>>,
    /// Read for display only — child environments inherit the user's shell
    /// environment naturally, so nothing here is ever injected.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub proxy_settings: Option<ProxySettings>,
}

// ─── MCP server definitions ───────────────────────────────────────────────────

/// Declarative description of one MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct McpServerDef {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    /// Shipped with the app (subject to runtime rewriting) vs user-defined
    /// (command used verbatim).
    #[serde(default)]
    pub builtin: bool,
    #[serde(flatten)]
    pub transport: McpTransport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(default)]
    pub enabled: bool,
    pub protocol: ProxyProtocol,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Socks5,
}

// ─── Session runtime configuration ────────────────────────────────────────────

/// Tool-permission mode for a session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Auto,
    Plan,
    FullAgency,
    Custom,
}

impl PermissionMode {
    /// The mode string the subprocess vocabulary understands.
    pub fn subprocess_name(self) -> &'static str {
        match self {
            Self::Auto | Self::Custom => "default",
            Self::Plan => "plan",
            Self::FullAgency => "bypassPermissions",
        }
    }

    /// Only fullAgency skips the subprocess-side permission checks entirely.
    pub fn skips_permission_checks(self) -> bool {
        matches!(self, Self::FullAgency)
    }
}

/// How the provider credential is handed to the subprocess.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CredentialStrategy {
    /// `ANTHROPIC_AUTH_TOKEN` only.
    #[default]
    AuthToken,
    /// `ANTHROPIC_API_KEY` only.
    ApiKey,
    /// Both variables carry the credential.
    Both,
    /// Token set, API key explicitly cleared to an empty string — some
    /// third-party gateways reject requests when both are present.
    AuthTokenClearApiKey,
}

/// Provider environment for a session.  `None` base URL means the official
/// endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEnv {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub strategy: CredentialStrategy,
}

impl ProviderEnv {
    /// True when this environment targets the vanilla official endpoint.
    pub fn is_official(&self) -> bool {
        self.base_url.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SystemPromptMode {
    /// The subprocess's built-in prompt, untouched.
    #[default]
    Preset,
    /// Replace the built-in prompt with `content`.
    Replace,
    /// Keep the built-in prompt and append `content`.
    Append,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemPromptConfig {
    #[serde(default)]
    pub mode: SystemPromptMode,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
}

/// A sub-agent definition forwarded to the subprocess.  The presence of any
/// definition auto-allows the `Task` delegation tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDef {
    pub description: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_shell_contract_field_names() {
        let text = r#"{
            "mcpEnabledServers": ["playwright"],
            "mcpServers": [
                {"id": "custom", "type": "stdio", "command": "node", "args": ["server.js"]}
            ],
            "mcpServerArgs": {"playwright": ["--headless"]},
            "mcpServerEnv": {"playwright": {"DEBUG": "1"}},
            "proxySettings": {"enabled": true, "protocol": "socks5", "host": "127.0.0.1", "port": 1080}
        }"#;
        let cfg: Config = serde_json::from_str(text).unwrap();
        assert_eq!(cfg.mcp_enabled_servers.as_deref(), Some(&["playwright".to_string()][..]));
        assert_eq!(cfg.mcp_servers.len(), 1);
        assert_eq!(cfg.mcp_server_args["playwright"], vec!["--headless"]);
        assert_eq!(
            cfg.proxy_settings.unwrap().protocol,
            ProxyProtocol::Socks5
        );
    }

    #[test]
    fn transport_tag_discriminates_variants() {
        let sse: McpServerDef = serde_json::from_str(
            r#"{"id": "remote", "type": "sse", "url": "https://mcp.example/sse"}"#,
        )
        .unwrap();
        assert!(matches!(sse.transport, McpTransport::Sse { .. }));
    }

    #[test]
    fn permission_mode_maps_to_subprocess_vocabulary() {
        assert_eq!(PermissionMode::Auto.subprocess_name(), "default");
        assert_eq!(PermissionMode::Plan.subprocess_name(), "plan");
        assert_eq!(PermissionMode::FullAgency.subprocess_name(), "bypassPermissions");
        assert_eq!(PermissionMode::Custom.subprocess_name(), "default");
        assert!(PermissionMode::FullAgency.skips_permission_checks());
        assert!(!PermissionMode::Auto.skips_permission_checks());
    }

    #[test]
    fn provider_env_official_detection() {
        assert!(ProviderEnv::default().is_official());
        let third = ProviderEnv {
            base_url: Some("https://third.example".into()),
            ..Default::default()
        };
        assert!(!third.is_official());
    }

    #[test]
    fn permission_mode_serde_uses_camel_case() {
        assert_eq!(
            serde_json::to_string(&PermissionMode::FullAgency).unwrap(),
            "\"fullAgency\""
        );
    }
}
