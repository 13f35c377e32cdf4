use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use orrery_types::{OrreryError, Result};

/// Dispatches tool invocations by name. A successful invocation returns the
/// tool's text output; an error is converted by the agent into an in-band
/// `is_error` tool message so the model can react.
#[async_trait]
pub trait ToolEnvironment: Send + Sync {
    async fn execute(&self, name: &str, args: serde_json::Value) -> Result<String>;

    fn working_directory(&self) -> &Path;
}

/// Tool environment backed by the local filesystem and shell.
pub struct LocalEnvironment {
    work_dir: PathBuf,
    default_timeout_ms: u64,
}

impl LocalEnvironment {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            default_timeout_ms: 10_000,
        }
    }

    pub fn current_dir() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub(crate) fn default_timeout_ms(&self) -> u64 {
        self.default_timeout_ms
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Relative paths resolve against the working directory; absolute paths
    /// pass through.
    pub(crate) fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.work_dir.join(p)
        }
    }
}

#[async_trait]
impl ToolEnvironment for LocalEnvironment {
    async fn execute(&self, name: &str, args: serde_json::Value) -> Result<String> {
        tracing::debug!(tool = name, "executing tool");
        match name {
            "read_file" => crate::builtin::read_file::run(self, args).await,
            "write_file" => crate::builtin::write_file::run(self, args).await,
            "edit_file" => crate::builtin::edit_file::run(self, args).await,
            "bash" => crate::builtin::shell::run(self, args).await,
            "glob" => crate::builtin::glob::run(self, args).await,
            "grep" => crate::builtin::grep::run(self, args).await,
            other => Err(OrreryError::Tool {
                tool: other.to_string(),
                message: format!("unknown tool: {other}"),
            }),
        }
    }

    fn working_directory(&self) -> &Path {
        &self.work_dir
    }
}

pub(crate) fn bad_args(tool: &str, err: impl std::fmt::Display) -> OrreryError {
    OrreryError::Tool {
        tool: tool.to_string(),
        message: format!("invalid arguments: {err}"),
    }
}
