use serde::Deserialize;

use orrery_types::{OrreryError, Result};

use crate::environment::{bad_args, LocalEnvironment};

#[derive(Deserialize)]
struct Params {
    path: String,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: usize,
}

pub(crate) async fn run(env: &LocalEnvironment, args: serde_json::Value) -> Result<String> {
    let params: Params = serde_json::from_value(args).map_err(|e| bad_args("read_file", e))?;
    let path = env.resolve(&params.path);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| OrreryError::Tool {
            tool: "read_file".into(),
            message: format!("{}: {e}", path.display()),
        })?;

    if params.offset == 0 && params.limit == 0 {
        return Ok(content);
    }

    let lines: Vec<&str> = content.lines().collect();
    let start = params.offset.min(lines.len());
    let end = if params.limit > 0 {
        (start + params.limit).min(lines.len())
    } else {
        lines.len()
    };
    Ok(lines[start..end].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ToolEnvironment;

    #[tokio::test]
    async fn reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\nworld\n").unwrap();
        let env = LocalEnvironment::new(dir.path());
        let out = env
            .execute("read_file", serde_json::json!({"path": "a.txt"}))
            .await
            .unwrap();
        assert_eq!(out, "hello\nworld\n");
    }

    #[tokio::test]
    async fn offset_and_limit_select_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour\n").unwrap();
        let env = LocalEnvironment::new(dir.path());
        let out = env
            .execute(
                "read_file",
                serde_json::json!({"path": "a.txt", "offset": 1, "limit": 2}),
            )
            .await
            .unwrap();
        assert_eq!(out, "two\nthree");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalEnvironment::new(dir.path());
        let err = env
            .execute("read_file", serde_json::json!({"path": "nope.txt"}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrreryError::Tool { .. }));
    }
}
