//! Pipeline configuration stored in `config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Bot configuration (TOML).
///
/// Intended to be edited by humans; missing fields default to values that
/// work for a stock GitHub + agent-CLI setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BotConfig {
    /// Seconds allowed for one discovery search command.
    pub search_timeout_secs: u64,
    /// Seconds allowed for `git clone` of the fork.
    pub clone_timeout_secs: u64,
    /// Seconds allowed for `git push` (the most failure-prone network step).
    pub push_timeout_secs: u64,
    /// Seconds allowed for each local git step (config/checkout/add/commit).
    pub git_timeout_secs: u64,
    /// Seconds allowed for each generated shell command.
    pub shell_timeout_secs: u64,
    /// Seconds allowed for one model invocation.
    pub model_timeout_secs: u64,
    /// Truncate captured subprocess output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Evict workspaces idle for longer than this.
    pub workspace_ttl_secs: u64,
    /// Fork-readiness polling budget.
    pub fork_poll_attempts: u32,
    pub fork_poll_delay_secs: u64,
    /// Bound the project tree embedded in the generation prompt.
    pub tree_max_entries: usize,
    /// Bound each embedded file's content in prompts.
    pub file_content_limit_bytes: usize,
    pub author: AuthorConfig,
    pub model: ModelConfig,
}

/// Commit author identity. Empty fields fall back to the authenticated login.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthorConfig {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Command to invoke the generation-model agent (e.g. `["codex","exec"]`).
    pub command: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string()],
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            search_timeout_secs: 30,
            clone_timeout_secs: 120,
            push_timeout_secs: 120,
            git_timeout_secs: 30,
            shell_timeout_secs: 60,
            model_timeout_secs: 600,
            output_limit_bytes: 100_000,
            workspace_ttl_secs: 30 * 60,
            fork_poll_attempts: 10,
            fork_poll_delay_secs: 2,
            tree_max_entries: 200,
            file_content_limit_bytes: 48_000,
            author: AuthorConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl BotConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("search_timeout_secs", self.search_timeout_secs),
            ("clone_timeout_secs", self.clone_timeout_secs),
            ("push_timeout_secs", self.push_timeout_secs),
            ("git_timeout_secs", self.git_timeout_secs),
            ("shell_timeout_secs", self.shell_timeout_secs),
            ("model_timeout_secs", self.model_timeout_secs),
            ("workspace_ttl_secs", self.workspace_ttl_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.fork_poll_attempts == 0 {
            return Err(anyhow!("fork_poll_attempts must be > 0"));
        }
        if self.tree_max_entries == 0 {
            return Err(anyhow!("tree_max_entries must be > 0"));
        }
        if self.file_content_limit_bytes == 0 {
            return Err(anyhow!("file_content_limit_bytes must be > 0"));
        }
        if self.model.command.is_empty() || self.model.command[0].trim().is_empty() {
            return Err(anyhow!("model.command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `BotConfig::default()`.
pub fn load_config(path: &Path) -> Result<BotConfig> {
    if !path.exists() {
        let cfg = BotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: BotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, BotConfig::default());
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "push_timeout_secs = 300\n\n[author]\nname = \"Bot\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.push_timeout_secs, 300);
        assert_eq!(cfg.author.name, "Bot");
        assert_eq!(cfg.search_timeout_secs, 30);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let cfg = BotConfig {
            push_timeout_secs: 0,
            ..BotConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_model_command_is_rejected() {
        let cfg = BotConfig {
            model: ModelConfig {
                command: Vec::new(),
            },
            ..BotConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
