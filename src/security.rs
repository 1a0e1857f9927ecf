//! Input validation shared by transports and the search engine's security scan.
//!
//! All checks here are purely syntactic: none of them touch the filesystem or the
//! network. A path is rejected because of what it says, not because of what exists.
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::UtcpError;

const DANGEROUS_COMMAND_CHARS: &[char] = &[
    '|', '&', ';', '\n', '`', '$', '(', ')', '<', '>', '"', '\'', '\\',
];

/// Validates a command name against an allowlist, rejecting shell metacharacters
/// that could turn a command string into a second command.
pub fn validate_command(command: &str, allowed_commands: &[&str]) -> Result<(), UtcpError> {
    if command.chars().any(|c| DANGEROUS_COMMAND_CHARS.contains(&c)) {
        return Err(UtcpError::CommandInjection(format!(
            "command contains dangerous characters: '{command}'"
        )));
    }

    let cmd_name = std::path::Path::new(command)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(command);

    if !allowed_commands.is_empty() && !allowed_commands.contains(&cmd_name) {
        return Err(UtcpError::CommandInjection(format!(
            "command '{cmd_name}' is not in the allowed list: {allowed_commands:?}"
        )));
    }

    Ok(())
}

/// Validates subprocess arguments for shell operators and command substitution.
pub fn validate_command_args(args: &[String]) -> Result<(), UtcpError> {
    for arg in args {
        if arg.contains("&&") || arg.contains("||") || arg.contains(';') || arg.contains('|') {
            return Err(UtcpError::CommandInjection(format!(
                "argument contains a shell operator: '{arg}'"
            )));
        }
        if arg.contains("$(") || arg.contains('`') {
            return Err(UtcpError::CommandInjection(format!(
                "argument contains command substitution: '{arg}'"
            )));
        }
    }
    Ok(())
}

const DISALLOWED_EXTENSIONS: &[&str] = &["exe", "dll", "so", "dylib", "bat", "cmd", "sh", "ps1"];

/// Validates that a path is relative-safe and does not carry a disallowed
/// extension. Purely syntactic: no `canonicalize`, no stat, the path need not exist.
pub fn validate_path_syntax(path: &str, allowed_extensions: &[&str]) -> Result<(), UtcpError> {
    if std::path::Path::new(path)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(UtcpError::PathTraversal(format!(
            "path '{path}' contains a '..' segment"
        )));
    }

    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    if let Some(ext) = ext {
        let disallowed = if allowed_extensions.is_empty() {
            DISALLOWED_EXTENSIONS.contains(&ext.as_str())
        } else {
            !allowed_extensions.contains(&ext.as_str())
        };
        if disallowed {
            return Err(UtcpError::InvalidExtension(format!(
                "path '{path}' has disallowed extension '.{ext}'"
            )));
        }
    }

    Ok(())
}

/// Validates that a URL uses a secure scheme when `require_tls` is set. Always
/// accepts localhost/127.0.0.1 without erroring (informational only).
pub fn validate_url_security(url: &str, require_tls: bool) -> Result<(), UtcpError> {
    let url_lower = url.to_lowercase();

    if require_tls
        && !(url_lower.starts_with("https://")
            || url_lower.starts_with("wss://")
            || url_lower.starts_with("grpcs://"))
    {
        return Err(UtcpError::Config(format!(
            "URL must use TLS (https://, wss://, grpcs://): '{url}'"
        )));
    }

    Ok(())
}

/// Rejects payloads above `max_size` bytes.
pub fn validate_size_limit(data: &[u8], max_size: usize) -> Result<(), UtcpError> {
    if data.len() > max_size {
        return Err(UtcpError::Config(format!(
            "data size {} bytes exceeds maximum allowed size {max_size} bytes",
            data.len()
        )));
    }
    Ok(())
}

/// Rejects a zero or over-long timeout.
pub fn validate_timeout(timeout_ms: u64, max_timeout_ms: u64) -> Result<(), UtcpError> {
    if timeout_ms == 0 {
        return Err(UtcpError::Config("timeout cannot be zero".into()));
    }
    if timeout_ms > max_timeout_ms {
        return Err(UtcpError::Config(format!(
            "timeout {timeout_ms}ms exceeds maximum allowed {max_timeout_ms}ms"
        )));
    }
    Ok(())
}

static API_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(api[_-]?key|secret|token)["']?\s*[:=]\s*["']?[A-Za-z0-9_\-]{16,}"#).unwrap());
static BEARER_TOKEN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)bearer\s+[A-Za-z0-9_\-\.]{8,}").unwrap());
static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static PASSWORD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)password["']?\s*[:=]\s*["']?\S+"#).unwrap());

/// Scans free text for shapes that look like secrets. Used by the search engine's
/// optional `security_scan` to attach warnings to a result, never to block it.
pub fn scan_for_secrets(text: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if API_KEY_PATTERN.is_match(text) {
        warnings.push("possible API key or secret".to_string());
    }
    if BEARER_TOKEN_PATTERN.is_match(text) {
        warnings.push("possible bearer token".to_string());
    }
    if PASSWORD_PATTERN.is_match(text) {
        warnings.push("possible password literal".to_string());
    }
    if EMAIL_PATTERN.is_match(text) {
        warnings.push("possible email address".to_string());
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_command_rejects_dangerous_chars() {
        assert!(validate_command("python3", &["python3", "node"]).is_ok());
        assert!(validate_command("ls; rm -rf /", &[]).is_err());
        assert!(validate_command("cat /etc/passwd | grep root", &[]).is_err());
        assert!(validate_command("echo `whoami`", &[]).is_err());
        assert!(validate_command("cmd && evil", &[]).is_err());
    }

    #[test]
    fn validate_command_allowlist() {
        let allowed = ["python3", "node", "npm"];
        assert!(validate_command("python3", &allowed).is_ok());
        assert!(validate_command("bash", &allowed).is_err());
        assert!(validate_command("/usr/bin/python3", &allowed).is_ok());
    }

    #[test]
    fn validate_command_args_rejects_injection_shapes() {
        assert!(validate_command_args(&["--help".to_string()]).is_ok());
        assert!(validate_command_args(&["arg && evil".to_string()]).is_err());
        assert!(validate_command_args(&["$(whoami)".to_string()]).is_err());
        assert!(validate_command_args(&["`id`".to_string()]).is_err());
    }

    #[test]
    fn validate_path_syntax_rejects_parent_dir_without_touching_disk() {
        let err = validate_path_syntax("../../etc/passwd", &[]).unwrap_err();
        assert!(matches!(err, UtcpError::PathTraversal(_)));
    }

    #[test]
    fn validate_path_syntax_rejects_disallowed_extension() {
        let err = validate_path_syntax("payload.exe", &[]).unwrap_err();
        assert!(matches!(err, UtcpError::InvalidExtension(_)));
    }

    #[test]
    fn validate_path_syntax_accepts_plain_relative_path() {
        assert!(validate_path_syntax("schemas/tool.json", &["json"]).is_ok());
    }

    #[test]
    fn validate_url_security_requires_tls_when_asked() {
        assert!(validate_url_security("https://api.example.com", true).is_ok());
        assert!(validate_url_security("http://api.example.com", true).is_err());
        assert!(validate_url_security("http://api.example.com", false).is_ok());
    }

    #[test]
    fn validate_size_limit_and_timeout() {
        assert!(validate_size_limit(&vec![0u8; 1000], 2000).is_ok());
        assert!(validate_size_limit(&vec![0u8; 1000], 500).is_err());
        assert!(validate_timeout(1000, 60000).is_ok());
        assert!(validate_timeout(0, 60000).is_err());
        assert!(validate_timeout(100_000, 60_000).is_err());
    }

    #[test]
    fn scan_for_secrets_flags_known_shapes() {
        assert!(scan_for_secrets("api_key: \"sk-abcdefghijklmnopqrst\"").contains(&"possible API key or secret".to_string()));
        assert!(scan_for_secrets("Authorization: Bearer abcd1234.efgh5678").contains(&"possible bearer token".to_string()));
        assert!(scan_for_secrets("contact admin@example.com for help").contains(&"possible email address".to_string()));
        assert!(scan_for_secrets("hello world").is_empty());
    }
}
