// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Subprocess environment assembly: provider credentials and PATH.

use std::path::Path;

use freja_config::{CredentialStrategy, ProviderEnv};

const AUTH_TOKEN_VAR: &str = "ANTHROPIC_AUTH_TOKEN";
const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";
const BASE_URL_VAR: &str = "ANTHROPIC_BASE_URL";

/// Environment overrides for the agent subprocess.  `None` values remove the
/// variable so stale credentials from the parent environment never leak into
/// a session that switched providers.
pub fn provider_env_vars(provider: &ProviderEnv) -> Vec<(String, Option<String>)> {
    let mut vars: Vec<(String, Option<String>)> = Vec::new();

    match &provider.base_url {
        Some(url) => vars.push((BASE_URL_VAR.into(), Some(url.clone()))),
        // Explicitly cleared: the official endpoint must not inherit a
        // third-party base URL from the shell.
        None => vars.push((BASE_URL_VAR.into(), None)),
    }

    let Some(credential) = &provider.credential else {
        return vars;
    };
    match provider.strategy {
        CredentialStrategy::AuthToken => {
            vars.push((AUTH_TOKEN_VAR.into(), Some(credential.clone())));
            vars.push((API_KEY_VAR.into(), None));
        }
        CredentialStrategy::ApiKey => {
            vars.push((API_KEY_VAR.into(), Some(credential.clone())));
            vars.push((AUTH_TOKEN_VAR.into(), None));
        }
        CredentialStrategy::Both => {
            vars.push((AUTH_TOKEN_VAR.into(), Some(credential.clone())));
            vars.push((API_KEY_VAR.into(), Some(credential.clone())));
        }
        CredentialStrategy::AuthTokenClearApiKey => {
            vars.push((AUTH_TOKEN_VAR.into(), Some(credential.clone())));
            // Set to empty rather than removed: some gateways reject
            // requests when the variable is present with another value.
            vars.push((API_KEY_VAR.into(), Some(String::new())));
        }
    }
    vars
}

/// PATH for the subprocess: bundled runtime first, then `~/.bun/bin`, then
/// platform defaults, then the inherited PATH.  Duplicate entries are merged
/// (case-insensitively on Windows, where env var lookup ignores case too).
pub fn build_path_var(bundled_runtime_dir: Option<&Path>) -> String {
    let mut entries: Vec<String> = Vec::new();
    if let Some(dir) = bundled_runtime_dir {
        entries.push(dir.to_string_lossy().into_owned());
    }
    if let Some(home) = dirs::home_dir() {
        entries.push(home.join(".bun").join("bin").to_string_lossy().into_owned());
    }
    for default in platform_defaults() {
        entries.push(default.to_string());
    }
    if let Some(current) = std::env::var_os("PATH") {
        for part in std::env::split_paths(&current) {
            entries.push(part.to_string_lossy().into_owned());
        }
    }

    let mut seen: Vec<String> = Vec::new();
    entries.retain(|e| {
        let key = normalize(e);
        if e.is_empty() || seen.contains(&key) {
            false
        } else {
            seen.push(key);
            true
        }
    });
    entries.join(path_separator())
}

fn platform_defaults() -> &'static [&'static str] {
    if cfg!(target_os = "macos") {
        &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin"]
    } else if cfg!(windows) {
        &[]
    } else {
        &["/usr/local/bin", "/usr/bin", "/bin"]
    }
}

fn normalize(entry: &str) -> String {
    if cfg!(windows) {
        entry.to_ascii_lowercase()
    } else {
        entry.to_string()
    }
}

fn path_separator() -> &'static str {
    if cfg!(windows) {
        ";"
    } else {
        ":"
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
