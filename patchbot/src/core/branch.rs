//! Branch naming for published changes.

/// Prefix for every branch the bot pushes.
pub const BRANCH_PREFIX: &str = "ai-bot";

/// Deterministic-but-unique branch name: `ai-bot/<unix-ts>-<slug>`.
///
/// Uniqueness leans on timestamp granularity; collisions are acceptably rare
/// and not actively guarded against.
pub fn branch_name(request: &str, unix_ts: u64) -> String {
    let slug = request_slug(request);
    if slug.is_empty() {
        return format!("{BRANCH_PREFIX}/{unix_ts}-change");
    }
    format!("{BRANCH_PREFIX}/{unix_ts}-{slug}")
}

/// Slug of the first 30 characters of the request: lowercased, with runs of
/// non-alphanumeric characters collapsed to a single `-`.
pub fn request_slug(request: &str) -> String {
    let head: String = request.chars().take(30).collect();
    let mut slug = String::with_capacity(head.len());
    for c in head.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}
