//! Structured file operations and the search/replace engine.
//!
//! A [`Generation`] is produced once per request and consumed exactly once
//! by the application engine. Update operations use regex-first-then-literal
//! matching; see [`apply_search_replace`].

use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};

/// One `{search, replace}` unit of an update operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchReplace {
    pub search: String,
    pub replace: String,
}

/// A single structured edit against the workspace repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FileOperation {
    CreateFile {
        path: String,
        content: String,
    },
    RewriteFile {
        path: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdateFile {
        path: String,
        search_replace: Vec<SearchReplace>,
    },
    DeleteFile {
        path: String,
    },
}

impl FileOperation {
    /// Target path as supplied by the model (not yet resolved).
    pub fn path(&self) -> &str {
        match self {
            FileOperation::CreateFile { path, .. }
            | FileOperation::RewriteFile { path, .. }
            | FileOperation::UpdateFile { path, .. }
            | FileOperation::DeleteFile { path } => path,
        }
    }

    /// Stable operation kind label used in logs and pull request bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            FileOperation::CreateFile { .. } => "createFile",
            FileOperation::RewriteFile { .. } => "rewriteFile",
            FileOperation::UpdateFile { .. } => "updateFile",
            FileOperation::DeleteFile { .. } => "deleteFile",
        }
    }
}

/// Structured output of one generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    pub file_operations: Vec<FileOperation>,
    pub shell_commands: Vec<String>,
    pub explanation: String,
}

/// How one search/replace pair matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    /// `search` compiled and matched as a regex; all matches were replaced.
    Regex { matches: usize },
    /// The regex had no matches (or failed to compile) but the literal text
    /// was present; all occurrences were replaced.
    Literal { occurrences: usize },
    /// Neither interpretation matched; content unchanged.
    NoMatch,
}

/// Apply pairs left to right, each operating on the result of the previous
/// one. Returns the final content and one outcome per pair; a non-matching
/// pair is a no-op, never an error.
pub fn apply_search_replace(content: &str, pairs: &[SearchReplace]) -> (String, Vec<PairOutcome>) {
    let mut buffer = content.to_string();
    let mut outcomes = Vec::with_capacity(pairs.len());
    for pair in pairs {
        outcomes.push(apply_pair(&mut buffer, pair));
    }
    (buffer, outcomes)
}

fn apply_pair(buffer: &mut String, pair: &SearchReplace) -> PairOutcome {
    if pair.search.is_empty() {
        return PairOutcome::NoMatch;
    }
    if let Ok(re) = Regex::new(&pair.search) {
        let matches = re.find_iter(buffer).count();
        if matches > 0 {
            // NoExpand: the replacement is literal text, not a capture template.
            *buffer = re.replace_all(buffer, NoExpand(&pair.replace)).into_owned();
            return PairOutcome::Regex { matches };
        }
    }
    let occurrences = buffer.matches(&pair.search).count();
    if occurrences > 0 {
        *buffer = buffer.replace(&pair.search, &pair.replace);
        return PairOutcome::Literal { occurrences };
    }
    PairOutcome::NoMatch
}
