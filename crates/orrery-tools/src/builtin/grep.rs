use std::path::Path;

use globset::Glob;
use regex::RegexBuilder;
use serde::Deserialize;

use orrery_types::{OrreryError, Result};

use crate::environment::{bad_args, LocalEnvironment};

#[derive(Deserialize)]
struct Params {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    glob: Option<String>,
    #[serde(default)]
    case_insensitive: bool,
}

const MAX_MATCHES: usize = 1000;

pub(crate) async fn run(env: &LocalEnvironment, args: serde_json::Value) -> Result<String> {
    let params: Params = serde_json::from_value(args).map_err(|e| bad_args("grep", e))?;
    let regex = RegexBuilder::new(&params.pattern)
        .case_insensitive(params.case_insensitive)
        .build()
        .map_err(|e| OrreryError::Tool {
            tool: "grep".into(),
            message: format!("bad pattern '{}': {e}", params.pattern),
        })?;

    let file_filter = params
        .glob
        .as_deref()
        .map(|g| {
            Glob::new(g).map(|g| g.compile_matcher()).map_err(|e| {
                OrreryError::Tool {
                    tool: "grep".into(),
                    message: format!("bad glob '{g:?}': {e}"),
                }
            })
        })
        .transpose()?;

    let base = params
        .path
        .as_deref()
        .map(|p| env.resolve(p))
        .unwrap_or_else(|| env.work_dir().to_path_buf());

    let mut lines = Vec::new();
    search(&base, &base, &regex, file_filter.as_ref(), &mut lines);
    Ok(lines.join("\n"))
}

fn search(
    base: &Path,
    path: &Path,
    regex: &regex::Regex,
    file_filter: Option<&globset::GlobMatcher>,
    out: &mut Vec<String>,
) {
    if out.len() >= MAX_MATCHES {
        return;
    }
    if path.is_dir() {
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
            && path != base
        {
            return;
        }
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                search(base, &entry.path(), regex, file_filter, out);
            }
        }
        return;
    }

    if let Some(filter) = file_filter {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if !filter.is_match(name) {
            return;
        }
    }
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    let display = path.strip_prefix(base).unwrap_or(path).display();
    for (number, line) in content.lines().enumerate() {
        if out.len() >= MAX_MATCHES {
            return;
        }
        if regex.is_match(line) {
            out.push(format!("{display}:{}:{line}", number + 1));
        }
    }
}
