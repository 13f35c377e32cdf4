use serde::Deserialize;

use orrery_types::{OrreryError, Result};

use crate::environment::{bad_args, LocalEnvironment};

#[derive(Deserialize)]
struct Params {
    path: String,
    old_string: String,
    new_string: String,
}

/// Exact-match single replacement. Fails unless `old_string` occurs exactly
/// once in the file.
pub(crate) async fn run(env: &LocalEnvironment, args: serde_json::Value) -> Result<String> {
    let params: Params = serde_json::from_value(args).map_err(|e| bad_args("edit_file", e))?;
    let path = env.resolve(&params.path);
    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| OrreryError::Tool {
            tool: "edit_file".into(),
            message: format!("{}: {e}", path.display()),
        })?;

    let count = content.matches(&params.old_string).count();
    if count == 0 {
        return Err(OrreryError::Tool {
            tool: "edit_file".into(),
            message: "old_string not found in file".into(),
        });
    }
    if count > 1 {
        return Err(OrreryError::Tool {
            tool: "edit_file".into(),
            message: format!("old_string found {count} times; it must be unique"),
        });
    }

    let updated = content.replacen(&params.old_string, &params.new_string, 1);
    tokio::fs::write(&path, updated)
        .await
        .map_err(|e| OrreryError::Tool {
            tool: "edit_file".into(),
            message: format!("{}: {e}", path.display()),
        })?;
    Ok(format!("Edited {}", params.path))
}
