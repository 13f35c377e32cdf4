use serde::Deserialize;

use orrery_types::{OrreryError, Result};

use crate::environment::{bad_args, LocalEnvironment};

#[derive(Deserialize)]
struct Params {
    path: String,
    content: String,
}

pub(crate) async fn run(env: &LocalEnvironment, args: serde_json::Value) -> Result<String> {
    let params: Params = serde_json::from_value(args).map_err(|e| bad_args("write_file", e))?;
    let path = env.resolve(&params.path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| OrreryError::Tool {
                tool: "write_file".into(),
                message: format!("create {}: {e}", parent.display()),
            })?;
    }
    tokio::fs::write(&path, &params.content)
        .await
        .map_err(|e| OrreryError::Tool {
            tool: "write_file".into(),
            message: format!("{}: {e}", path.display()),
        })?;
    Ok(format!(
        "Wrote {} bytes to {}",
        params.content.len(),
        params.path
    ))
}

#[cfg(test)]
mod tests {
    use crate::environment::{LocalEnvironment, ToolEnvironment};

    #[tokio::test]
    async fn writes_and_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let env = LocalEnvironment::new(dir.path());
        let out = env
            .execute(
                "write_file",
                serde_json::json!({"path": "nested/out.txt", "content": "data"}),
            )
            .await
            .unwrap();
        assert!(out.contains("4 bytes"));
        let written = std::fs::read_to_string(dir.path().join("nested/out.txt")).unwrap();
        assert_eq!(written, "data");
    }
}
