//! Map child-process failures onto the typed error taxonomy.

use conductor_core::{AgentKind, EngineError};

/// Shells report "command not found" as exit 127.
const EXIT_NOT_FOUND: i32 = 127;

/// Classify a spawn failure (the process never started).
pub fn classify_spawn_error(kind: AgentKind, error: &std::io::Error) -> EngineError {
    if error.kind() == std::io::ErrorKind::NotFound {
        return EngineError::AgentNotInstalled {
            kind: kind.as_str().to_string(),
            message: format!("'{}' not found on PATH", kind.command()),
        };
    }
    EngineError::AgentFailed {
        message: format!("failed to spawn '{}': {error}", kind.command()),
    }
}

/// Classify a non-zero exit by code and captured stderr.
pub fn classify_exit(kind: AgentKind, exit_code: Option<i32>, stderr: &str) -> EngineError {
    if exit_code == Some(EXIT_NOT_FOUND) {
        return EngineError::AgentNotInstalled {
            kind: kind.as_str().to_string(),
            message: format!("exit {EXIT_NOT_FOUND} (command not found)"),
        };
    }

    let lower = stderr.to_lowercase();
    if looks_like_auth(&lower) {
        return EngineError::Auth {
            provider: kind.provider().to_string(),
            message: first_line(stderr),
        };
    }
    if lower.contains("429") || lower.contains("rate limit") {
        return EngineError::RateLimited {
            message: first_line(stderr),
        };
    }

    EngineError::AgentFailed {
        message: format!(
            "'{}' exited with {}: {}",
            kind.command(),
            exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
            first_line(stderr)
        ),
    }
}

fn looks_like_auth(stderr_lower: &str) -> bool {
    stderr_lower.contains("api key")
        || stderr_lower.contains("api_key")
        || stderr_lower.contains("token expired")
        || stderr_lower.contains("unauthorized")
        || stderr_lower.contains("401")
}

fn first_line(stderr: &str) -> String {
    let line = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut line = line.trim().to_string();
    if line.len() > 300 {
        line.truncate(300);
    }
    line
}
