//! Credential scrubbing for child process environments.

use std::collections::HashMap;

/// Name fragments that mark an environment variable as a credential.
const SENSITIVE_PATTERNS: &[&str] = &[
    "_API_KEY",
    "_SECRET",
    "_TOKEN",
    "_PASSWORD",
    "_CREDENTIAL",
    "AWS_ACCESS_KEY",
    "AWS_SECRET",
    "PRIVATE_KEY",
];

pub fn is_sensitive(name: &str) -> bool {
    let upper = name.to_uppercase();
    SENSITIVE_PATTERNS.iter().any(|p| upper.contains(p))
}

/// A copy of the process environment with credential-bearing variables
/// removed, for passing to tool subprocesses.
pub fn scrubbed_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(name, _)| !is_sensitive(name))
        .collect()
}
