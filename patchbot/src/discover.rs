//! File discovery: a three-stage tool-selection state machine.
//!
//! The machine is total: every input reaches the terminal state with a
//! (possibly empty) candidate list, and no transition raises to the caller.
//! Tool selection falls back to a keyword grep when the model is unusable,
//! and a failed or empty search degrades to "no candidates".

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::keywords::extract_keywords;
use crate::io::model::TextModel;
use crate::io::process::sh_quote;
use crate::io::prompt::PromptAssembler;
use crate::io::sandbox::Sandbox;

/// Directories never searched and never reported.
const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git", "dist"];

/// Search strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTool {
    Grep,
    Glob,
    Regex,
}

impl SearchTool {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchTool::Grep => "grep",
            SearchTool::Glob => "glob",
            SearchTool::Regex => "regex",
        }
    }
}

/// States of the discovery machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    AnalyzeTask,
    SelectTool,
    ExecuteSearch,
    Done,
}

/// Shared context mutated by the machine's transitions.
#[derive(Debug)]
pub struct DiscoveryContext {
    pub request: String,
    pub repo_path: String,
    pub keywords: BTreeSet<String>,
    pub tool: Option<SearchTool>,
    pub query: Option<String>,
    pub found_files: Vec<String>,
}

impl DiscoveryContext {
    pub fn new(request: impl Into<String>, repo_path: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            repo_path: repo_path.into(),
            keywords: BTreeSet::new(),
            tool: None,
            query: None,
            found_files: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolChoice {
    tool: String,
    query: String,
}

/// Drives the machine from entry to terminal state.
pub struct DiscoveryController<'a> {
    model: &'a dyn TextModel,
    sandbox: &'a dyn Sandbox,
    prompts: &'a PromptAssembler,
    search_timeout: Duration,
}

impl<'a> DiscoveryController<'a> {
    pub fn new(
        model: &'a dyn TextModel,
        sandbox: &'a dyn Sandbox,
        prompts: &'a PromptAssembler,
        search_timeout: Duration,
    ) -> Self {
        Self {
            model,
            sandbox,
            prompts,
            search_timeout,
        }
    }

    /// Run discovery to completion and return candidate file paths.
    #[instrument(skip_all)]
    pub fn discover(&self, request: &str, repo_path: &str) -> Vec<String> {
        let mut ctx = DiscoveryContext::new(request, repo_path);
        let mut state = DiscoveryState::AnalyzeTask;
        while state != DiscoveryState::Done {
            state = self.step(state, &mut ctx);
        }
        info!(candidates = ctx.found_files.len(), "discovery finished");
        ctx.found_files
    }

    /// One transition. Failure policy per state: fall back, never raise.
    pub fn step(&self, state: DiscoveryState, ctx: &mut DiscoveryContext) -> DiscoveryState {
        match state {
            DiscoveryState::AnalyzeTask => {
                ctx.keywords = extract_keywords(&ctx.request);
                debug!(keywords = ?ctx.keywords, "analyzed request");
                DiscoveryState::SelectTool
            }
            DiscoveryState::SelectTool => {
                let (tool, query) = self.select_tool(ctx);
                ctx.tool = Some(tool);
                ctx.query = Some(query);
                DiscoveryState::ExecuteSearch
            }
            DiscoveryState::ExecuteSearch => {
                ctx.found_files = self.execute_search(ctx);
                DiscoveryState::Done
            }
            DiscoveryState::Done => DiscoveryState::Done,
        }
    }

    fn select_tool(&self, ctx: &DiscoveryContext) -> (SearchTool, String) {
        let choice = self
            .prompts
            .build_select_tool(&ctx.request, &ctx.keywords)
            .and_then(|prompt| self.model.complete(&prompt))
            .and_then(|raw| parse_tool_choice(&raw));
        match choice {
            Ok((tool, query)) => {
                info!(tool = tool.as_str(), query, "model selected search tool");
                (tool, query)
            }
            Err(err) => {
                let query = fallback_query(&ctx.keywords);
                warn!(error = %err, query, "tool selection failed, falling back to grep");
                (SearchTool::Grep, query)
            }
        }
    }

    fn execute_search(&self, ctx: &DiscoveryContext) -> Vec<String> {
        let (Some(tool), Some(query)) = (ctx.tool, ctx.query.as_deref()) else {
            return Vec::new();
        };
        if query.is_empty() {
            return Vec::new();
        }
        let script = search_script(tool, query, &ctx.repo_path);
        debug!(script, "executing search");
        match self.sandbox.exec(&ctx.repo_path, &script, self.search_timeout) {
            Ok(output) if output.success() => filter_found_files(&output.stdout),
            Ok(output) => {
                debug!(
                    exit_code = output.exit_code,
                    timed_out = output.timed_out,
                    "search returned no candidates"
                );
                Vec::new()
            }
            Err(err) => {
                warn!(error = %err, "search execution failed");
                Vec::new()
            }
        }
    }
}

fn parse_tool_choice(raw: &str) -> Result<(SearchTool, String)> {
    let json =
        extract_json_object(raw).ok_or_else(|| anyhow!("no json object in model reply"))?;
    let choice: ToolChoice = serde_json::from_str(json)?;
    let tool = match choice.tool.trim() {
        "grep" => SearchTool::Grep,
        "glob" => SearchTool::Glob,
        "regex" => SearchTool::Regex,
        other => bail!("unknown search tool '{other}'"),
    };
    let query = choice.query.trim().to_string();
    if query.is_empty() {
        bail!("empty search query");
    }
    Ok((tool, query))
}

/// Tolerate code fences and prose around the JSON object.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end >= start).then(|| &raw[start..=end])
}

fn fallback_query(keywords: &BTreeSet<String>) -> String {
    keywords
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("|")
}

fn search_script(tool: SearchTool, query: &str, repo_path: &str) -> String {
    let root = sh_quote(repo_path);
    let q = sh_quote(query);
    match tool {
        SearchTool::Grep => format!(
            "grep -rIl --exclude-dir=node_modules --exclude-dir=.git --exclude-dir=dist -e {q} {root}"
        ),
        SearchTool::Regex => format!(
            "grep -rIlE --exclude-dir=node_modules --exclude-dir=.git --exclude-dir=dist -e {q} {root}"
        ),
        SearchTool::Glob => format!(
            "find {root} -type f -name {q} -not -path '*/node_modules/*' -not -path '*/.git/*' -not -path '*/dist/*'"
        ),
    }
}

/// Parse search output into a sorted, deduplicated path list, dropping any
/// excluded-directory matches that slipped past the search flags.
fn filter_found_files(stdout: &str) -> Vec<String> {
    let mut files: Vec<String> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            !EXCLUDED_DIRS
                .iter()
                .any(|dir| line.split('/').any(|segment| segment == *dir))
        })
        .map(str::to_string)
        .collect();
    files.sort();
    files.dedup();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedModel, ScriptedSandbox};
    use crate::io::process::ExecOutput;

    fn prompts() -> PromptAssembler {
        PromptAssembler::new(10_000, 50)
    }

    fn controller<'a>(
        model: &'a ScriptedModel,
        sandbox: &'a ScriptedSandbox,
        prompts: &'a PromptAssembler,
    ) -> DiscoveryController<'a> {
        DiscoveryController::new(model, sandbox, prompts, Duration::from_secs(30))
    }

    fn ok_output(stdout: &str) -> ExecOutput {
        ExecOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    #[test]
    fn follows_the_model_tool_choice() {
        let model = ScriptedModel::new();
        model.push_completion("```json\n{\"tool\": \"glob\", \"query\": \"*.ts\"}\n```");
        let sandbox = ScriptedSandbox::new("/ws");
        sandbox.push_exec(ok_output("/ws/repo/math.ts\n/ws/repo/api.ts\n"));
        let prompts = prompts();

        let found = controller(&model, &sandbox, &prompts).discover("add subtract", "/ws/repo");
        assert_eq!(found, vec!["/ws/repo/api.ts", "/ws/repo/math.ts"]);
        let scripts = sandbox.exec_scripts();
        assert!(scripts[0].contains("find"));
        assert!(scripts[0].contains("'*.ts'"));
    }

    #[test]
    fn model_failure_falls_back_to_keyword_grep() {
        let model = ScriptedModel::new();
        model.push_completion_error("model unavailable");
        let sandbox = ScriptedSandbox::new("/ws");
        sandbox.push_exec(ok_output(""));
        let prompts = prompts();

        let mut ctx = DiscoveryContext::new("add a subtract helper", "/ws/repo");
        let machine = controller(&model, &sandbox, &prompts);
        let mut state = DiscoveryState::AnalyzeTask;
        state = machine.step(state, &mut ctx);
        state = machine.step(state, &mut ctx);
        assert_eq!(state, DiscoveryState::ExecuteSearch);
        assert_eq!(ctx.tool, Some(SearchTool::Grep));
        assert_eq!(ctx.query.as_deref(), Some("add|helper|subtract"));
    }

    #[test]
    fn unparseable_model_reply_falls_back() {
        let model = ScriptedModel::new();
        model.push_completion("I think grep would be nice");
        let sandbox = ScriptedSandbox::new("/ws");
        sandbox.push_exec(ok_output(""));
        let prompts = prompts();

        let found = controller(&model, &sandbox, &prompts).discover("rename login", "/ws/repo");
        assert!(found.is_empty());
        assert!(sandbox.exec_scripts()[0].contains("grep -rIl"));
    }

    #[test]
    fn nonzero_search_exit_yields_empty_list() {
        let model = ScriptedModel::new();
        model.push_completion(r#"{"tool": "grep", "query": "login"}"#);
        let sandbox = ScriptedSandbox::new("/ws");
        sandbox.push_exec(ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "no matches".to_string(),
            timed_out: false,
        });
        let prompts = prompts();

        let found = controller(&model, &sandbox, &prompts).discover("rename login", "/ws/repo");
        assert!(found.is_empty());
    }

    #[test]
    fn exec_error_yields_empty_list() {
        let model = ScriptedModel::new();
        model.push_completion(r#"{"tool": "grep", "query": "login"}"#);
        let sandbox = ScriptedSandbox::new("/ws");
        sandbox.push_exec_error("sandbox unreachable");
        let prompts = prompts();

        let found = controller(&model, &sandbox, &prompts).discover("rename login", "/ws/repo");
        assert!(found.is_empty());
    }

    #[test]
    fn excluded_directories_are_filtered_from_results() {
        let found = filter_found_files(
            "/ws/repo/src/app.ts\n/ws/repo/node_modules/lib/index.js\n/ws/repo/dist/app.js\n",
        );
        assert_eq!(found, vec!["/ws/repo/src/app.ts"]);
    }

    #[test]
    fn extracts_json_from_fenced_replies() {
        let raw = "Sure!\n```json\n{\"tool\":\"regex\",\"query\":\"fn main\"}\n```";
        let (tool, query) = parse_tool_choice(raw).expect("parse");
        assert_eq!(tool, SearchTool::Regex);
        assert_eq!(query, "fn main");
    }
}
