use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use serde::Deserialize;

use orrery_types::{OrreryError, Result};

use crate::environment::{bad_args, LocalEnvironment};

#[derive(Deserialize)]
struct Params {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

pub(crate) async fn run(env: &LocalEnvironment, args: serde_json::Value) -> Result<String> {
    let params: Params = serde_json::from_value(args).map_err(|e| bad_args("glob", e))?;
    let base = params
        .path
        .as_deref()
        .map(|p| env.resolve(p))
        .unwrap_or_else(|| env.work_dir().to_path_buf());

    let matcher = Glob::new(&params.pattern)
        .map_err(|e| OrreryError::Tool {
            tool: "glob".into(),
            message: format!("bad pattern '{}': {e}", params.pattern),
        })?
        .compile_matcher();

    let mut matches = Vec::new();
    walk(&base, &base, &matcher, &mut matches)?;
    matches.sort();
    Ok(matches
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join("\n"))
}

fn walk(
    base: &Path,
    dir: &Path,
    matcher: &GlobMatcher,
    out: &mut Vec<PathBuf>,
) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            // Hidden directories are skipped, matching shell conventions.
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
            {
                continue;
            }
            walk(base, &path, matcher, out)?;
        } else {
            let relative = path.strip_prefix(base).unwrap_or(&path);
            if matcher.is_match(relative) {
                out.push(path);
            }
        }
    }
    Ok(())
}
