// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::Config;

/// Returns the user data directory holding `config.json`, `sessions.json`,
/// transcripts, and attachments.
///
/// Defaults to `$XDG_DATA_HOME/freja` (i.e. `~/.local/share/freja`); the
/// `FREJA_USER_DIR` environment variable overrides it for tests and portable
/// installs.
pub fn user_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FREJA_USER_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local")
                .join("share")
        })
        .join("freja")
}

/// Load `config.json` from the given user directory.
///
/// A missing file is the common case (fresh install) and yields the default
/// config.  A file that fails to parse also yields the default — the shell
/// owns the file, and a half-written config must never take the core down.
pub fn load(user_dir: &Path) -> Config {
    let path = user_dir.join("config.json");
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(_) => {
            debug!(path = %path.display(), "no config file; using defaults");
            return Config::default();
        }
    };
    match serde_json::from_str(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config file unparseable; using defaults");
            Config::default()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(dir.path());
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn unparseable_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        let cfg = load(dir.path());
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn valid_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"mcpEnabledServers": ["a", "b"]}"#,
        )
        .unwrap();
        let cfg = load(dir.path());
        assert_eq!(
            cfg.mcp_enabled_servers,
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }
}
