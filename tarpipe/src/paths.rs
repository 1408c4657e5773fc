use std::path::{Path, PathBuf};

use anyhow::Context;

/// Reads a path list: one path per line, blank lines ignored.
pub async fn read_path_list(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed reading path list from {path:?}"))?;
    Ok(parse_path_list(&content))
}

fn parse_path_list(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
        .map(PathBuf::from)
        .collect()
}
