//! Balanced JSON extraction from free-form agent output.
//!
//! Agents asked for structured output rarely return bare JSON; they wrap it
//! in prose and fenced code blocks. This module finds the first balanced
//! JSON object or array in a string with a hand-rolled scanner that honors
//! string contents and escapes. Fenced code blocks are searched first, since
//! that is where a well-behaved agent puts the payload.

/// Extract the first balanced JSON object or array span.
///
/// Returns the exact span (a slice of the input) or `None` when no balanced
/// object/array exists. The span is not guaranteed to be *valid* JSON — the
/// caller parses it — only structurally balanced.
pub fn extract_json(input: &str) -> Option<&str> {
    for block in fenced_blocks(input) {
        if let Some(span) = first_balanced(block) {
            return Some(span);
        }
    }
    first_balanced(input)
}

/// Contents of ``` fenced code blocks, in document order.
fn fenced_blocks(input: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = input;
    loop {
        let Some(open) = rest.find("```") else { break };
        let after_fence = &rest[open + 3..];
        // Skip the info string ("json", "yaml", ...) up to end of line.
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
        let body = &after_fence[body_start..];
        let Some(close) = body.find("```") else { break };
        blocks.push(&body[..close]);
        rest = &body[close + 3..];
    }
    blocks
}

/// Scan for the first balanced `{...}` or `[...]` span.
fn first_balanced(input: &str) -> Option<&str> {
    let bytes = input.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        let open = input[start..].find(['{', '['])? + start;
        match scan_balanced(input, open) {
            Some(end) => return Some(&input[open..end]),
            // Unbalanced from this opener; try the next one.
            None => start = open + 1,
        }
    }
    None
}

/// Walk from an opening brace/bracket; return the exclusive end index of the
/// balanced span, or `None` if the input ends first.
fn scan_balanced(input: &str, open: usize) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    let mut i = open;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    // Tolerant of mismatched bracket flavors; the JSON parser
                    // downstream rejects those.
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}
