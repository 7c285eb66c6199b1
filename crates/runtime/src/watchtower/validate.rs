//! Command and environment validation for the watchtower
//!
//! Validation runs before any spawn. A rejected command never raises out of
//! the exec entry points; the caller embeds the block reason in the result
//! or registry entry.

use std::collections::HashMap;

use crate::types::WatchtowerError;

/// Substring deny list. Matching is case-insensitive.
pub const DENY_PATTERNS: [&str; 36] = [
    "rm -rf /",
    "rm -fr /",
    "rm -rf ~",
    "rm -rf *",
    ":(){",
    ":|:&",
    "mkfs",
    "dd if=/dev/zero",
    "dd of=/dev/sd",
    "> /dev/sda",
    "chmod -r 777 /",
    "chmod 777 /",
    "chown -r",
    "sudo shutdown",
    "sudo reboot",
    "sudo halt",
    "sudo rm",
    "shutdown -h",
    "init 0",
    "init 6",
    "poweroff",
    "$(",
    "`",
    ">(",
    "<(",
    "ld_preload",
    "ld_library_path",
    "dyld_insert_libraries",
    "dyld_library_path",
    "curl | sh",
    "curl | bash",
    "wget | sh",
    "| bash -",
    "/etc/shadow",
    "nc -l",
    "kill -9 1",
];

/// Absolute-path prefixes that are always acceptable in commands.
pub const SAFE_PATH_PREFIXES: [&str; 9] = [
    "/usr/", "/bin/", "/sbin/", "/etc/", "/tmp/", "/dev/", "/proc/", "/sys/", "/nix/",
];

/// Environment variables callers may never override.
pub const BLOCKED_ENV_VARS: [&str; 5] = [
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "PATH",
];

/// The PATH forced onto every spawned process.
pub const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin";

/// Validate a command string against the deny list and path policy.
pub fn validate_command(command: &str, workspace_root: &str) -> Result<(), WatchtowerError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(WatchtowerError::EmptyCommand);
    }

    let lowered = trimmed.to_lowercase();
    if DENY_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Err(WatchtowerError::DangerousCommand);
    }

    // every absolute path mentioned must live under the workspace or a safe
    // system prefix
    for token in trimmed.split_whitespace() {
        let token = token.trim_matches(|c| matches!(c, '"' | '\'' | ';' | ')' | '('));
        if token.starts_with('/') {
            let in_workspace = token.starts_with(workspace_root);
            let in_safe_prefix = SAFE_PATH_PREFIXES.iter().any(|p| token.starts_with(p));
            if !in_workspace && !in_safe_prefix {
                return Err(WatchtowerError::PathEscape(token.to_string()));
            }
        }
    }

    Ok(())
}

/// Validate caller-supplied environment overrides.
pub fn validate_env(env: &HashMap<String, String>) -> Result<(), WatchtowerError> {
    for key in env.keys() {
        let upper = key.to_uppercase();
        if BLOCKED_ENV_VARS.contains(&upper.as_str()) {
            return Err(WatchtowerError::EnvBlocked(key.clone()));
        }
    }
    Ok(())
}
