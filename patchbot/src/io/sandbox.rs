//! Execution-environment abstraction.
//!
//! The pipeline talks to one durable filesystem + shell per project through
//! the [`Sandbox`] trait. Production uses [`LocalSandbox`] rooted at a host
//! directory; tests use the same type over temp dirs, or scripted stubs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument};

use crate::io::process::{ExecOutput, run_shell};

/// One durable filesystem + shell, addressed by absolute string paths.
pub trait Sandbox: Send + Sync {
    /// Base directory of the environment; repositories are cloned under it.
    fn workdir(&self) -> String;
    /// Run a shell script in `dir` with a timeout.
    fn exec(&self, dir: &str, script: &str, timeout: Duration) -> Result<ExecOutput>;
    /// Read a file's full text content.
    fn read_file(&self, path: &str) -> Result<String>;
    /// Write a file, creating parent directories as needed.
    fn write_file(&self, path: &str, content: &str) -> Result<()>;
    /// Remove a file; a missing file is not an error.
    fn delete_file(&self, path: &str) -> Result<()>;
    /// Make git available, installing it on first use if missing. The check
    /// runs once per environment instance, not per call.
    fn ensure_git(&self) -> Result<()>;
    /// Tear the environment down. Called on registry eviction.
    fn kill(&self) -> Result<()>;
}

/// Sandbox backed by a directory on the local filesystem.
pub struct LocalSandbox {
    root: PathBuf,
    output_limit: usize,
    git_ready: AtomicBool,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>, output_limit: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create sandbox root {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("canonicalize sandbox root {}", root.display()))?;
        Ok(Self {
            root,
            output_limit,
            git_ready: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Sandbox for LocalSandbox {
    fn workdir(&self) -> String {
        self.root.display().to_string()
    }

    #[instrument(skip_all, fields(dir))]
    fn exec(&self, dir: &str, script: &str, timeout: Duration) -> Result<ExecOutput> {
        run_shell(Path::new(dir), script, timeout, self.output_limit)
    }

    fn read_file(&self, path: &str) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("read {path}"))
    }

    fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(path, content).with_context(|| format!("write {}", path.display()))
    }

    fn delete_file(&self, path: &str) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("delete {path}")),
        }
    }

    fn ensure_git(&self) -> Result<()> {
        if self.git_ready.load(Ordering::Relaxed) {
            return Ok(());
        }
        let check = self.exec(&self.workdir(), "git --version", Duration::from_secs(10))?;
        if check.success() {
            debug!("git available");
            self.git_ready.store(true, Ordering::Relaxed);
            return Ok(());
        }
        info!("git not found in environment, installing");
        let install = self.exec(
            &self.workdir(),
            "apt-get update -qq && apt-get install -y -qq git",
            Duration::from_secs(300),
        )?;
        if !install.success() {
            bail!(
                "git is unavailable and could not be installed: {}",
                install.stderr.trim()
            );
        }
        let recheck = self.exec(&self.workdir(), "git --version", Duration::from_secs(10))?;
        if !recheck.success() {
            bail!("git still unavailable after install");
        }
        self.git_ready.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.root.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, LocalSandbox) {
        let temp = tempfile::tempdir().expect("tempdir");
        let sandbox = LocalSandbox::new(temp.path().join("env"), 100_000).expect("sandbox");
        (temp, sandbox)
    }

    #[test]
    fn write_creates_parents_and_read_round_trips() {
        let (_temp, sandbox) = sandbox();
        let path = format!("{}/a/b/c.txt", sandbox.workdir());
        sandbox.write_file(&path, "hello").expect("write");
        assert_eq!(sandbox.read_file(&path).expect("read"), "hello");
    }

    #[test]
    fn delete_of_missing_file_is_ok() {
        let (_temp, sandbox) = sandbox();
        let path = format!("{}/missing.txt", sandbox.workdir());
        sandbox.delete_file(&path).expect("delete");
    }

    #[test]
    fn exec_runs_in_requested_directory() {
        let (_temp, sandbox) = sandbox();
        let sub = format!("{}/sub", sandbox.workdir());
        fs::create_dir_all(&sub).expect("mkdir");
        let out = sandbox
            .exec(&sub, "pwd", Duration::from_secs(5))
            .expect("exec");
        assert_eq!(out.stdout.trim(), sub);
    }

    #[test]
    fn ensure_git_caches_the_check() {
        let (_temp, sandbox) = sandbox();
        sandbox.ensure_git().expect("git present on test hosts");
        assert!(sandbox.git_ready.load(Ordering::Relaxed));
        sandbox.ensure_git().expect("cached");
    }

    #[test]
    fn kill_removes_the_root() {
        let (_temp, sandbox) = sandbox();
        sandbox.kill().expect("kill");
        assert!(!sandbox.root().exists());
        sandbox.kill().expect("kill twice");
    }
}
