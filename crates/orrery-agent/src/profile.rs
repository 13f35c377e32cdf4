//! Provider profiles: the (model, system prompt, tool set) bundle for each
//! provider family.

use std::path::Path;

use orrery_llm::ToolDefinition;

#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub name: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
    pub supports_parallel_tool_calls: bool,
}

impl ProviderProfile {
    /// Upsert a tool by name.
    pub fn register_tool(&mut self, tool: ToolDefinition) {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name == tool.name) {
            *existing = tool;
        } else {
            self.tools.push(tool);
        }
    }
}

const BASE_PROMPT: &str = "You are an expert coding assistant. You help users with software \
engineering tasks by reading files, editing code, running commands, and iterating until the \
task is done.";

/// Default profile for Anthropic models.
pub fn default_anthropic_profile(model: impl Into<String>) -> ProviderProfile {
    ProviderProfile {
        name: "anthropic".into(),
        provider: "anthropic".into(),
        model: model.into(),
        system_prompt: format!(
            "{BASE_PROMPT}\n\n\
             Use the edit_file tool for targeted edits using exact string matching \
             (old_string/new_string).\n\
             Use read_file to understand existing code before making changes.\n\
             Use bash for running tests, builds, and git operations."
        ),
        tools: default_tool_set(),
        supports_parallel_tool_calls: true,
    }
}

/// Default profile for OpenAI models; includes `apply_patch`.
pub fn default_openai_profile(model: impl Into<String>) -> ProviderProfile {
    let mut tools = default_tool_set();
    tools.push(apply_patch_tool());
    ProviderProfile {
        name: "openai".into(),
        provider: "openai".into(),
        model: model.into(),
        system_prompt: format!(
            "{BASE_PROMPT}\n\n\
             Use apply_patch for file modifications using the v4a diff format.\n\
             Use read_file to understand existing code before making changes.\n\
             Use bash for running tests, builds, and git operations."
        ),
        tools,
        supports_parallel_tool_calls: true,
    }
}

/// Default profile for Gemini models.
pub fn default_gemini_profile(model: impl Into<String>) -> ProviderProfile {
    ProviderProfile {
        name: "gemini".into(),
        provider: "gemini".into(),
        model: model.into(),
        system_prompt: format!(
            "{BASE_PROMPT}\n\n\
             Use write_file and edit_file for code modifications.\n\
             Use read_file to understand existing code before making changes.\n\
             Use bash for running tests, builds, and git operations."
        ),
        tools: default_tool_set(),
        supports_parallel_tool_calls: true,
    }
}

/// Select a default profile by provider name.
pub fn profile_for_provider(provider: &str, model: impl Into<String>) -> ProviderProfile {
    match provider {
        "openai" => default_openai_profile(model),
        "gemini" | "google" => default_gemini_profile(model),
        _ => default_anthropic_profile(model),
    }
}

// ---------------------------------------------------------------------------
// Tool definitions
// ---------------------------------------------------------------------------

fn tool(name: &str, description: &str, parameters: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        name: name.into(),
        description: description.into(),
        parameters,
    }
}

/// Definitions for the builtin tool set executed by the tool environment.
pub fn default_tool_set() -> Vec<ToolDefinition> {
    vec![
        tool(
            "read_file",
            "Read a file from the working directory. Supports line offset/limit for large files.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path, relative to the working directory"},
                    "offset": {"type": "integer", "description": "First line to read (0-based)"},
                    "limit": {"type": "integer", "description": "Maximum number of lines to read"}
                },
                "required": ["path"]
            }),
        ),
        tool(
            "write_file",
            "Write content to a file, creating parent directories as needed.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        ),
        tool(
            "edit_file",
            "Replace an exact string in a file. The old_string must occur exactly once.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old_string": {"type": "string"},
                    "new_string": {"type": "string"}
                },
                "required": ["path", "old_string", "new_string"]
            }),
        ),
        tool(
            "bash",
            "Run a shell command in the working directory and return its output.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_ms": {"type": "integer", "description": "Command timeout in milliseconds"}
                },
                "required": ["command"]
            }),
        ),
        tool(
            "glob",
            "Find files matching a glob pattern.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Glob pattern, e.g. **/*.rs"},
                    "path": {"type": "string", "description": "Base directory for the search"}
                },
                "required": ["pattern"]
            }),
        ),
        tool(
            "grep",
            "Search file contents with a regular expression.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string"},
                    "glob": {"type": "string", "description": "Restrict to files matching this glob"},
                    "case_insensitive": {"type": "boolean"}
                },
                "required": ["pattern"]
            }),
        ),
    ]
}

/// The `apply_patch` definition used by the OpenAI profile.
pub fn apply_patch_tool() -> ToolDefinition {
    tool(
        "apply_patch",
        "Apply a patch to files using the v4a diff format. Supports adding, deleting, \
         updating, and renaming files.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "patch": {
                    "type": "string",
                    "description": "The patch in v4a format. Must start with '*** Begin Patch' and end with '*** End Patch'."
                }
            },
            "required": ["patch"]
        }),
    )
}

// ---------------------------------------------------------------------------
// System prompt assembly
// ---------------------------------------------------------------------------

/// Build the full system prompt: profile instructions, environment context,
/// tool descriptions, discovered project docs, then user instruction
/// overrides.
pub fn build_system_prompt(
    profile: &ProviderProfile,
    work_dir: &Path,
    user_instructions: &str,
) -> String {
    let mut parts = vec![profile.system_prompt.clone()];
    parts.push(environment_context(work_dir, &profile.model));
    if !profile.tools.is_empty() {
        parts.push(tool_descriptions(&profile.tools));
    }
    if let Some(docs) = discover_project_docs(work_dir, &profile.provider) {
        parts.push(docs);
    }
    if !user_instructions.is_empty() {
        parts.push(format!("# User Instructions\n{user_instructions}"));
    }
    parts.join("\n\n")
}

fn environment_context(work_dir: &Path, model: &str) -> String {
    let mut ctx = format!(
        "# Environment\n\
         - Platform: {}/{}\n\
         - Working directory: {}\n\
         - Date: {}\n\
         - Model: {}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        work_dir.display(),
        chrono::Utc::now().format("%Y-%m-%d"),
        model,
    );
    if let Ok(head) = std::fs::read_to_string(work_dir.join(".git/HEAD")) {
        if let Some(branch) = head.trim().strip_prefix("ref: refs/heads/") {
            ctx.push_str(&format!("\n- Git branch: {branch}"));
        }
    }
    ctx
}

fn tool_descriptions(tools: &[ToolDefinition]) -> String {
    let mut lines = vec!["# Available Tools".to_string()];
    for t in tools {
        lines.push(format!("- **{}**: {}", t.name, t.description));
    }
    lines.join("\n")
}

/// Read AGENTS.md plus the provider-specific instructions file, when present.
fn discover_project_docs(work_dir: &Path, provider: &str) -> Option<String> {
    let mut docs = Vec::new();
    if let Ok(content) = std::fs::read_to_string(work_dir.join("AGENTS.md")) {
        docs.push(format!("# Project Instructions (AGENTS.md)\n{content}"));
    }
    let provider_file = match provider {
        "anthropic" => Some("CLAUDE.md"),
        "openai" => Some("CODEX.md"),
        "gemini" => Some("GEMINI.md"),
        _ => None,
    };
    if let Some(file) = provider_file {
        if let Ok(content) = std::fs::read_to_string(work_dir.join(file)) {
            docs.push(format!("# Project Instructions ({file})\n{content}"));
        }
    }
    if docs.is_empty() {
        None
    } else {
        Some(docs.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profiles_carry_builtin_tools() {
        let p = default_anthropic_profile("model-a");
        assert_eq!(p.provider, "anthropic");
        assert!(p.tools.iter().any(|t| t.name == "edit_file"));
        assert!(!p.tools.iter().any(|t| t.name == "apply_patch"));

        let p = default_gemini_profile("model-g");
        assert!(p.tools.iter().any(|t| t.name == "write_file"));
    }

    #[test]
    fn openai_profile_includes_apply_patch() {
        let p = default_openai_profile("model-o");
        assert!(p.tools.iter().any(|t| t.name == "apply_patch"));
        assert!(p.system_prompt.contains("apply_patch"));
    }

    #[test]
    fn register_tool_upserts_by_name() {
        let mut p = default_anthropic_profile("m");
        let before = p.tools.len();
        p.register_tool(ToolDefinition {
            name: "bash".into(),
            description: "replaced description".into(),
            parameters: serde_json::json!({}),
        });
        assert_eq!(p.tools.len(), before);
        assert_eq!(
            p.tools.iter().find(|t| t.name == "bash").unwrap().description,
            "replaced description"
        );

        p.register_tool(ToolDefinition {
            name: "brand_new".into(),
            description: "new".into(),
            parameters: serde_json::json!({}),
        });
        assert_eq!(p.tools.len(), before + 1);
    }

    #[test]
    fn profile_for_provider_dispatch() {
        assert_eq!(profile_for_provider("openai", "m").provider, "openai");
        assert_eq!(profile_for_provider("gemini", "m").provider, "gemini");
        assert_eq!(profile_for_provider("google", "m").provider, "gemini");
        assert_eq!(profile_for_provider("anything", "m").provider, "anthropic");
    }

    #[test]
    fn system_prompt_assembly_layers_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Follow the house style.").unwrap();
        std::fs::write(dir.path().join("CLAUDE.md"), "Prefer small diffs.").unwrap();

        let profile = default_anthropic_profile("model-a");
        let prompt = build_system_prompt(&profile, dir.path(), "Always run tests.");

        assert!(prompt.contains("# Environment"));
        assert!(prompt.contains("# Available Tools"));
        assert!(prompt.contains("Follow the house style."));
        assert!(prompt.contains("Prefer small diffs."));
        assert!(prompt.contains("# User Instructions\nAlways run tests."));
        // Profile instructions come first; user overrides last.
        assert!(prompt.find(BASE_PROMPT).unwrap() < prompt.find("# User Instructions").unwrap());
    }

    #[test]
    fn provider_docs_are_provider_specific() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("GEMINI.md"), "gemini notes").unwrap();
        let anthropic = build_system_prompt(&default_anthropic_profile("m"), dir.path(), "");
        assert!(!anthropic.contains("gemini notes"));
        let gemini = build_system_prompt(&default_gemini_profile("m"), dir.path(), "");
        assert!(gemini.contains("gemini notes"));
    }
}
