//! Side-effecting adapters: config, subprocesses, the sandbox filesystem,
//! the GitHub API, the generation model, and prompt assembly.

pub mod config;
pub mod github;
pub mod model;
pub mod process;
pub mod prompt;
pub mod sandbox;
