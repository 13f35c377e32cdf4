use serde::Deserialize;

use orrery_types::{OrreryError, Result};

use crate::environment::{bad_args, LocalEnvironment};
use crate::scrub::scrubbed_env;

#[derive(Deserialize)]
struct Params {
    command: String,
    #[serde(default)]
    timeout_ms: u64,
}

/// Run a shell command with a scrubbed environment and a timeout.
pub(crate) async fn run(env: &LocalEnvironment, args: serde_json::Value) -> Result<String> {
    let params: Params = serde_json::from_value(args).map_err(|e| bad_args("bash", e))?;
    let timeout_ms = if params.timeout_ms > 0 {
        params.timeout_ms
    } else {
        env.default_timeout_ms()
    };

    let mut cmd = tokio::process::Command::new("bash");
    cmd.args(["-c", &params.command])
        .current_dir(env.work_dir())
        .env_clear()
        .envs(scrubbed_env())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| OrreryError::Tool {
        tool: "bash".into(),
        message: format!("spawn failed: {e}"),
    })?;

    let output = tokio::time::timeout(
        std::time::Duration::from_millis(timeout_ms),
        child.wait_with_output(),
    )
    .await
    .map_err(|_| OrreryError::CommandTimeout { timeout_ms })?
    .map_err(|e| OrreryError::Tool {
        tool: "bash".into(),
        message: format!("wait failed: {e}"),
    })?;

    let mut out = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        out.push_str("\nSTDERR:\n");
        out.push_str(&stderr);
    }
    if !output.status.success() {
        out.push_str(&format!(
            "\nExit code: {}",
            output.status.code().unwrap_or(-1)
        ));
    }
    Ok(out)
}
