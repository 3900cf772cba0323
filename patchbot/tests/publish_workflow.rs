//! Publish workflow tests over a real local git remote.
//!
//! A bare repository stands in for the fork's clone URL, so branch, commit,
//! and push run against real git without a network. The hosting side is a
//! scripted stub that records every call.

use std::process::Command;
use std::time::Duration;

use patchbot::apply::AppliedOperation;
use patchbot::core::repo::RepoRef;
use patchbot::io::github::RepoInfo;
use patchbot::io::sandbox::{LocalSandbox, Sandbox};
use patchbot::publish::{
    ForkNotReadyError, ForkRetry, PublishOutcome, PublishRequest, PublishWorkflow, acquire_fork,
};
use patchbot::test_support::{FixtureRepo, HostCall, ScriptedHost};

fn upstream() -> RepoRef {
    RepoRef {
        owner: "acme".to_string(),
        repo: "widget".to_string(),
    }
}

fn fork_info(clone_url: &str) -> RepoInfo {
    RepoInfo {
        owner: "octocat".to_string(),
        clone_url: clone_url.to_string(),
        default_branch: "main".to_string(),
        fork: true,
        parent_full_name: Some("acme/widget".to_string()),
    }
}

fn upstream_info() -> RepoInfo {
    RepoInfo {
        owner: "acme".to_string(),
        clone_url: "https://github.com/acme/widget.git".to_string(),
        default_branch: "main".to_string(),
        fork: false,
        parent_full_name: None,
    }
}

fn no_delay_retry(attempts: u32) -> ForkRetry {
    ForkRetry {
        attempts,
        delay: Duration::ZERO,
    }
}

#[test]
fn existing_fork_is_reused_without_a_create_call() {
    let host = ScriptedHost::new("octocat");
    host.insert_repo("octocat", "widget", fork_info("/tmp/fork.git"));

    let first = acquire_fork(&host, &upstream(), "octocat", &no_delay_retry(10)).expect("first");
    let second = acquire_fork(&host, &upstream(), "octocat", &no_delay_retry(10)).expect("second");

    assert!(first.exists);
    assert_eq!(first.clone_url, second.clone_url);
    assert_eq!(first.fork_owner, "octocat");
    assert_eq!(host.create_fork_calls(), 0);
}

#[test]
fn repository_that_is_not_a_fork_of_the_upstream_is_not_reused() {
    let host = ScriptedHost::new("octocat");
    // Same name under the login, but forked from somewhere else entirely.
    host.insert_repo(
        "octocat",
        "widget",
        RepoInfo {
            parent_full_name: Some("someone-else/widget".to_string()),
            ..fork_info("/tmp/other.git")
        },
    );

    let err = acquire_fork(&host, &upstream(), "octocat", &no_delay_retry(2)).unwrap_err();
    assert!(err.downcast_ref::<ForkNotReadyError>().is_some());
    assert_eq!(host.create_fork_calls(), 1);
}

#[test]
fn created_fork_becomes_visible_after_polling() {
    let host = ScriptedHost::new("octocat");
    host.set_fork_result(fork_info("/tmp/fork.git"), 3);

    let fork =
        acquire_fork(&host, &upstream(), "octocat", &no_delay_retry(10)).expect("acquire");

    assert!(!fork.exists);
    assert_eq!(fork.clone_url, "/tmp/fork.git");
    assert_eq!(host.create_fork_calls(), 1);
    let polls = host
        .calls()
        .iter()
        .filter(|call| matches!(call, HostCall::GetRepo { owner, .. } if owner == "octocat"))
        .count();
    // One lookup before the create call, then three polls until visible.
    assert_eq!(polls, 4);
}

#[test]
fn fork_poll_exhaustion_fails_with_a_typed_error() {
    let host = ScriptedHost::new("octocat");
    // No fork template: the created fork never becomes visible.

    let err = acquire_fork(&host, &upstream(), "octocat", &no_delay_retry(4)).unwrap_err();
    let not_ready = err
        .downcast_ref::<ForkNotReadyError>()
        .expect("ForkNotReadyError");
    assert_eq!(not_ready.attempts, 4);
    assert_eq!(not_ready.upstream, "acme/widget");
}

fn publish_request(timestamp: u64) -> PublishRequest {
    PublishRequest {
        repo_url: "https://github.com/acme/widget".to_string(),
        request_text: "add a subtract function to math.ts".to_string(),
        explanation: "Adds a subtract helper next to add.".to_string(),
        applied: vec![AppliedOperation {
            kind: "updateFile",
            path: "math.ts".to_string(),
        }],
        executed_commands: vec!["npm test".to_string()],
        base_branch: None,
        author_name: String::new(),
        author_email: String::new(),
        timestamp,
    }
}

fn git_in(dir: &std::path::Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn publish_pushes_the_branch_and_opens_a_pull_request() {
    let fixture = FixtureRepo::new().expect("fixture");
    fixture
        .write_file("math.ts", "export function add(a, b) { return a + b; }\n")
        .expect("seed");
    fixture.commit_all("initial").expect("commit");
    fixture.publish_bare().expect("bare");

    // Workspace: a clone of the fork with one local edit, as after apply.
    let temp = tempfile::tempdir().expect("tempdir");
    let repo_path = temp.path().join("widget");
    git_in(
        temp.path(),
        &[
            "clone",
            "--quiet",
            &fixture.clone_url(),
            &repo_path.display().to_string(),
        ],
    );
    std::fs::write(
        repo_path.join("math.ts"),
        "export function add(a, b) { return a + b; }\nexport function subtract(a, b) { return a - b; }\n",
    )
    .expect("edit");

    let host = ScriptedHost::new("octocat");
    host.insert_repo("octocat", "widget", fork_info(&fixture.clone_url()));
    host.insert_repo("acme", "widget", upstream_info());

    let sandbox = LocalSandbox::new(temp.path(), 100_000).expect("sandbox");
    let workflow = PublishWorkflow::new(
        &host,
        &sandbox,
        "test-token",
        no_delay_retry(10),
        Duration::from_secs(30),
        Duration::from_secs(120),
    );
    let outcome = workflow.publish(
        &repo_path.display().to_string(),
        &publish_request(1700000000),
    );

    let PublishOutcome::Created(report) = outcome else {
        panic!("publish failed: {outcome:?}");
    };
    assert_eq!(
        report.branch,
        "ai-bot/1700000000-add-a-subtract-function-to-mat"
    );
    assert_eq!(report.from, format!("octocat:{}", report.branch));
    assert_eq!(report.to, "acme:main");
    assert_eq!(report.pr_number, 1);
    assert_eq!(report.commit.len(), 40);
    assert!(report.commit.chars().all(|c| c.is_ascii_hexdigit()));

    // The branch arrived on the remote with the fallback author identity.
    assert!(fixture.branch_exists(&report.branch).expect("show-ref"));
    let author = git_in(
        &fixture.bare,
        &["log", "-1", "--format=%an", &report.branch],
    );
    assert_eq!(author.trim(), "octocat");
    let message = git_in(&fixture.bare, &["log", "-1", "--format=%B", &report.branch]);
    assert!(message.contains("add a subtract function to math.ts"));
    assert!(message.contains("Adds a subtract helper next to add."));

    let pr = host.last_pull_request().expect("pull request");
    assert_eq!(pr.head, report.from);
    assert_eq!(pr.base, "main");
    assert!(pr.body.contains("- updateFile `math.ts`"));
    assert!(pr.body.contains("- `npm test`"));
}

#[test]
fn git_step_failure_is_reported_not_raised() {
    let host = ScriptedHost::new("octocat");
    host.insert_repo("octocat", "widget", fork_info("/tmp/fork.git"));

    // The workspace directory is not a git repository, so the first git
    // step fails with a nonzero exit.
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = LocalSandbox::new(temp.path(), 100_000).expect("sandbox");
    let workflow = PublishWorkflow::new(
        &host,
        &sandbox,
        "test-token",
        no_delay_retry(10),
        Duration::from_secs(30),
        Duration::from_secs(120),
    );

    let outcome = workflow.publish(&sandbox.workdir(), &publish_request(42));
    let PublishOutcome::Failed { error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(error.contains("git step"), "unexpected error: {error}");
    // The workflow stopped before ever reaching the hosting side for a PR.
    assert!(
        !host
            .calls()
            .iter()
            .any(|call| matches!(call, HostCall::CreatePullRequest { .. }))
    );
}
