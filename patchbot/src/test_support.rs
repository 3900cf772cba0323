//! Scripted collaborators and repository fixtures for tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};

use std::sync::Arc;

use crate::core::ops::Generation;
use crate::core::repo::RepoRef;
use crate::io::github::{CodeHost, PullRequest, RepoInfo};
use crate::io::model::{ChunkSink, TextModel};
use crate::io::process::ExecOutput;
use crate::io::sandbox::{LocalSandbox, Sandbox};
use crate::workspace::Clock;

/// Model that replays queued completions and generations in FIFO order.
#[derive(Default)]
pub struct ScriptedModel {
    completions: RefCell<VecDeque<Result<String, String>>>,
    generations: RefCell<VecDeque<ScriptedGeneration>>,
    consumed: RefCell<usize>,
}

pub struct ScriptedGeneration {
    pub chunks: Vec<String>,
    pub result: Generation,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_completion(&self, text: &str) {
        self.completions
            .borrow_mut()
            .push_back(Ok(text.to_string()));
    }

    pub fn push_completion_error(&self, message: &str) {
        self.completions
            .borrow_mut()
            .push_back(Err(message.to_string()));
    }

    pub fn push_generation(&self, chunks: Vec<String>, result: Generation) {
        self.generations
            .borrow_mut()
            .push_back(ScriptedGeneration { chunks, result });
    }

    pub fn completions_consumed(&self) -> usize {
        *self.consumed.borrow()
    }
}

impl TextModel for ScriptedModel {
    fn complete(&self, _prompt: &str) -> Result<String> {
        *self.consumed.borrow_mut() += 1;
        match self.completions.borrow_mut().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted completion queued")),
        }
    }

    fn generate(&self, _prompt: &str, sink: ChunkSink<'_>) -> Result<Generation> {
        let scripted = self
            .generations
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted generation queued"))?;
        for chunk in &scripted.chunks {
            sink(chunk);
        }
        Ok(scripted.result)
    }
}

/// Recorded host interaction, for asserting call sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    ViewerLogin,
    GetRepo { owner: String, repo: String },
    CreateFork { upstream: String },
    CreatePullRequest { head: String, base: String },
}

struct PendingFork {
    owner: String,
    repo: String,
    info: RepoInfo,
    visible_after: u32,
    polls: u32,
}

/// Host stub with an in-memory repository table and call recording.
pub struct ScriptedHost {
    login: String,
    repos: RefCell<HashMap<(String, String), RepoInfo>>,
    calls: RefCell<Vec<HostCall>>,
    fork_template: RefCell<Option<(RepoInfo, u32)>>,
    pending_fork: RefCell<Option<PendingFork>>,
    next_pr_number: RefCell<u64>,
    last_pull_request: RefCell<Option<CreatedPullRequest>>,
}

/// Arguments of the last `create_pull_request` call.
#[derive(Debug, Clone)]
pub struct CreatedPullRequest {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

impl ScriptedHost {
    pub fn new(login: &str) -> Self {
        Self {
            login: login.to_string(),
            repos: RefCell::new(HashMap::new()),
            calls: RefCell::new(Vec::new()),
            fork_template: RefCell::new(None),
            pending_fork: RefCell::new(None),
            next_pr_number: RefCell::new(1),
            last_pull_request: RefCell::new(None),
        }
    }

    pub fn insert_repo(&self, owner: &str, repo: &str, info: RepoInfo) {
        self.repos
            .borrow_mut()
            .insert((owner.to_string(), repo.to_string()), info);
    }

    /// Configure what a created fork will look like and how many polls it
    /// takes before the hosting side reports it.
    pub fn set_fork_result(&self, info: RepoInfo, visible_after_polls: u32) {
        *self.fork_template.borrow_mut() = Some((info, visible_after_polls));
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.borrow().clone()
    }

    pub fn create_fork_calls(&self) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| matches!(call, HostCall::CreateFork { .. }))
            .count()
    }

    pub fn last_pull_request(&self) -> Option<CreatedPullRequest> {
        self.last_pull_request.borrow().clone()
    }
}

impl CodeHost for ScriptedHost {
    fn viewer_login(&self) -> Result<String> {
        self.calls.borrow_mut().push(HostCall::ViewerLogin);
        Ok(self.login.clone())
    }

    fn get_repo(&self, owner: &str, repo: &str) -> Result<Option<RepoInfo>> {
        self.calls.borrow_mut().push(HostCall::GetRepo {
            owner: owner.to_string(),
            repo: repo.to_string(),
        });
        let mut pending = self.pending_fork.borrow_mut();
        if let Some(fork) = pending.as_mut()
            && fork.owner == owner
            && fork.repo == repo
        {
            fork.polls += 1;
            if fork.polls >= fork.visible_after {
                let ready = pending.take().expect("pending fork present");
                self.repos
                    .borrow_mut()
                    .insert((ready.owner, ready.repo), ready.info);
            }
        }
        drop(pending);
        Ok(self
            .repos
            .borrow()
            .get(&(owner.to_string(), repo.to_string()))
            .cloned())
    }

    fn create_fork(&self, upstream: &RepoRef) -> Result<()> {
        self.calls.borrow_mut().push(HostCall::CreateFork {
            upstream: upstream.full_name(),
        });
        if let Some((info, visible_after)) = self.fork_template.borrow().clone() {
            *self.pending_fork.borrow_mut() = Some(PendingFork {
                owner: self.login.clone(),
                repo: upstream.repo.clone(),
                info,
                visible_after,
                polls: 0,
            });
        }
        Ok(())
    }

    fn create_pull_request(
        &self,
        upstream: &RepoRef,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        self.calls.borrow_mut().push(HostCall::CreatePullRequest {
            head: head.to_string(),
            base: base.to_string(),
        });
        *self.last_pull_request.borrow_mut() = Some(CreatedPullRequest {
            head: head.to_string(),
            base: base.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
        let mut next = self.next_pr_number.borrow_mut();
        let number = *next;
        *next += 1;
        Ok(PullRequest {
            number,
            url: format!("https://github.com/{}/pull/{number}", upstream.full_name()),
        })
    }
}

/// Sandbox stub with canned exec results and an in-memory filesystem.
pub struct ScriptedSandbox {
    workdir: String,
    exec_results: Mutex<VecDeque<Result<ExecOutput, String>>>,
    exec_scripts: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, String>>,
    killed: AtomicBool,
}

impl ScriptedSandbox {
    pub fn new(workdir: &str) -> Self {
        Self {
            workdir: workdir.to_string(),
            exec_results: Mutex::new(VecDeque::new()),
            exec_scripts: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            killed: AtomicBool::new(false),
        }
    }

    pub fn push_exec(&self, output: ExecOutput) {
        self.exec_results
            .lock()
            .expect("exec results")
            .push_back(Ok(output));
    }

    pub fn push_exec_error(&self, message: &str) {
        self.exec_results
            .lock()
            .expect("exec results")
            .push_back(Err(message.to_string()));
    }

    pub fn insert_file(&self, path: &str, content: &str) {
        self.files
            .lock()
            .expect("files")
            .insert(path.to_string(), content.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().expect("files").get(path).cloned()
    }

    pub fn exec_scripts(&self) -> Vec<String> {
        self.exec_scripts.lock().expect("exec scripts").clone()
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }
}

impl Sandbox for ScriptedSandbox {
    fn workdir(&self) -> String {
        self.workdir.clone()
    }

    fn exec(&self, _dir: &str, script: &str, _timeout: Duration) -> Result<ExecOutput> {
        self.exec_scripts
            .lock()
            .expect("exec scripts")
            .push(script.to_string());
        match self.exec_results.lock().expect("exec results").pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
            }),
        }
    }

    fn read_file(&self, path: &str) -> Result<String> {
        self.files
            .lock()
            .expect("files")
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("read {path}: no such file"))
    }

    fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.insert_file(path, content);
        Ok(())
    }

    fn delete_file(&self, path: &str) -> Result<()> {
        self.files.lock().expect("files").remove(path);
        Ok(())
    }

    fn ensure_git(&self) -> Result<()> {
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        self.killed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Clock advanced by hand, for deterministic expiry tests.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock");
        *now += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("clock")
    }
}

/// Upstream fixture: a seeded working repository plus a bare remote that
/// stands in for the fork's clone URL, so `git clone` and `git push` work
/// without a network.
pub struct FixtureRepo {
    temp: tempfile::TempDir,
    pub work: PathBuf,
    pub bare: PathBuf,
}

impl FixtureRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let work = temp.path().join("upstream");
        let bare = temp.path().join("fork.git");
        fs::create_dir_all(&work).context("create work dir")?;
        git(&work, &["init", "--quiet"])?;
        git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"])?;
        git(&work, &["config", "user.name", "Fixture"])?;
        git(&work, &["config", "user.email", "fixture@example.com"])?;
        Ok(Self { temp, work, bare })
    }

    pub fn write_file(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.work.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create parents")?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        git(&self.work, &["add", "-A"])?;
        git(&self.work, &["commit", "--quiet", "-m", message])
    }

    /// Publish the working repository as a bare remote.
    pub fn publish_bare(&self) -> Result<()> {
        let work = self.work.display().to_string();
        let bare = self.bare.display().to_string();
        git(self.temp.path(), &["clone", "--bare", "--quiet", &work, &bare])
    }

    /// Clone URL for the bare remote (a local path).
    pub fn clone_url(&self) -> String {
        self.bare.display().to_string()
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = Command::new("git")
            .args(["show-ref", "--verify", "--quiet"])
            .arg(format!("refs/heads/{branch}"))
            .current_dir(&self.bare)
            .status()
            .context("spawn git show-ref")?;
        Ok(status.success())
    }
}

/// Canonicalized scratch directory for per-project sandboxes.
pub struct ScratchDir {
    _temp: tempfile::TempDir,
    pub root: PathBuf,
}

impl ScratchDir {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path().canonicalize().context("canonicalize scratch")?;
        Ok(Self { _temp: temp, root })
    }
}

/// Factory producing [`LocalSandbox`]es under `root`, for wiring sessions.
pub fn local_sandbox_factory(
    root: PathBuf,
    output_limit: usize,
) -> impl Fn(&str) -> Result<Arc<dyn Sandbox>> {
    move |project_id: &str| {
        let sandbox = LocalSandbox::new(root.join(project_id), output_limit)?;
        Ok(Arc::new(sandbox) as Arc<dyn Sandbox>)
    }
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}
