//! Procfile parsing: the `web:` line is the app's launch command.

use crate::error::StartError;
use std::path::Path;

/// Read the launch command from `dir/Procfile`.
///
/// Only the first `web:` line counts; other process types are ignored.
pub async fn web_command(dir: &Path) -> Result<String, StartError> {
    let contents = tokio::fs::read_to_string(dir.join("Procfile"))
        .await
        .map_err(|_| StartError::NoWebEntry(dir.to_path_buf()))?;
    parse_web_line(&contents).ok_or_else(|| StartError::NoWebEntry(dir.to_path_buf()))
}

fn parse_web_line(contents: &str) -> Option<String> {
    let line = contents.lines().find(|l| l.starts_with("web:"))?;
    let command = line["web:".len()..].trim();
    if command.is_empty() {
        None
    } else {
        Some(command.to_string())
    }
}
