//! Generation-model collaborator.
//!
//! The [`TextModel`] trait decouples the pipeline from the model backend.
//! Production uses [`CliModel`], which spawns a configured agent command;
//! tests use scripted models that replay queued replies.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::ops::Generation;
use crate::io::process::run_command_streaming;

/// JSON Schema constraining the structured generation result. This is the
/// boundary contract with the model service.
pub const GENERATION_SCHEMA: &str = include_str!("../../schemas/generation.schema.json");

/// Append-only text sink fed chunk-by-chunk while a generation streams.
pub type ChunkSink<'a> = &'a mut dyn FnMut(&str);

/// Generation-model operations the pipeline depends on.
pub trait TextModel {
    /// One-shot completion: the full response text for a prompt.
    fn complete(&self, prompt: &str) -> Result<String>;
    /// Streaming generation: relays text chunks to `sink` as they arrive and
    /// returns the structured result once the stream completes.
    fn generate(&self, prompt: &str, sink: ChunkSink<'_>) -> Result<Generation>;
}

/// Validate a raw structured result against the generation schema, then
/// deserialize it.
pub fn parse_generation(raw: &str) -> Result<Generation> {
    let value: Value = serde_json::from_str(raw).context("parse generation json")?;
    validate_generation_schema(&value)?;
    let generation = serde_json::from_value(value).context("parse generation as struct")?;
    Ok(generation)
}

/// Validate a JSON instance against the generation schema (Draft 2020-12).
fn validate_generation_schema(instance: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(GENERATION_SCHEMA).context("parse generation schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile generation schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!(
            "generation schema validation failed:\n- {}",
            messages.join("\n- ")
        );
    }
    Ok(())
}

/// Model backend that spawns a configured agent command.
///
/// The prompt is fed on stdin, stdout is relayed to the chunk sink line by
/// line, and the structured result is read from the `--output-last-message`
/// file after the process exits.
pub struct CliModel {
    command: Vec<String>,
    state_dir: PathBuf,
    timeout: Duration,
    output_limit: usize,
}

impl CliModel {
    pub fn new(
        command: Vec<String>,
        state_dir: impl Into<PathBuf>,
        timeout: Duration,
        output_limit: usize,
    ) -> Result<Self> {
        if command.is_empty() || command[0].trim().is_empty() {
            return Err(anyhow!("model command is empty"));
        }
        Ok(Self {
            command,
            state_dir: state_dir.into(),
            timeout,
            output_limit,
        })
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd
    }

    fn check_run(&self, output: &crate::io::process::ExecOutput) -> Result<()> {
        if output.timed_out {
            bail!("model command timed out after {:?}", self.timeout);
        }
        if output.exit_code != 0 {
            bail!(
                "model command failed with exit code {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

impl TextModel for CliModel {
    #[instrument(skip_all)]
    fn complete(&self, prompt: &str) -> Result<String> {
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("create model state dir {}", self.state_dir.display()))?;
        let mut cmd = self.base_command();
        cmd.arg("-").current_dir(&self.state_dir);
        let output = run_command_streaming(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit,
            &mut |_| {},
        )
        .context("run model command")?;
        self.check_run(&output)?;
        debug!(bytes = output.stdout.len(), "model completion finished");
        Ok(output.stdout)
    }

    #[instrument(skip_all)]
    fn generate(&self, prompt: &str, sink: ChunkSink<'_>) -> Result<Generation> {
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("create model state dir {}", self.state_dir.display()))?;
        let schema_path = self.state_dir.join("generation.schema.json");
        fs::write(&schema_path, GENERATION_SCHEMA)
            .with_context(|| format!("write schema {}", schema_path.display()))?;
        let output_path = self.state_dir.join("generation.json");
        // Stale output from a previous request must not pass for this one.
        if output_path.exists() {
            fs::remove_file(&output_path)
                .with_context(|| format!("remove stale {}", output_path.display()))?;
        }

        info!("starting model generation");
        let mut cmd = self.base_command();
        cmd.arg("--output-schema")
            .arg(&schema_path)
            .arg("--output-last-message")
            .arg(&output_path)
            .arg("-")
            .current_dir(&self.state_dir);
        let output = run_command_streaming(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit,
            sink,
        )
        .context("run model command")?;
        self.check_run(&output)?;

        let raw = fs::read_to_string(&output_path)
            .with_context(|| format!("read model output {}", output_path.display()))?;
        let generation = parse_generation(&raw)?;
        if generation.file_operations.is_empty() {
            warn!("model produced no file operations");
        }
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_valid_generation() {
        let raw = r#"{
            "fileOperations": [
                {"type": "createFile", "path": "a.txt", "content": "hi"},
                {"type": "updateFile", "path": "b.txt",
                 "searchReplace": [{"search": "x", "replace": "y"}]}
            ],
            "shellCommands": ["npm install"],
            "explanation": "did things"
        }"#;
        let generation = parse_generation(raw).expect("parse");
        assert_eq!(generation.file_operations.len(), 2);
        assert_eq!(generation.explanation, "did things");
    }

    #[test]
    fn rejects_unknown_operation_types() {
        let raw = r#"{
            "fileOperations": [{"type": "renameFile", "path": "a", "content": ""}],
            "shellCommands": [],
            "explanation": ""
        }"#;
        let err = parse_generation(raw).unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn rejects_missing_required_fields() {
        let raw = r#"{"fileOperations": []}"#;
        assert!(parse_generation(raw).is_err());
    }

    #[test]
    fn rejects_empty_model_command() {
        assert!(CliModel::new(Vec::new(), "/tmp", Duration::from_secs(1), 10).is_err());
    }
}
