//! Shared utility functions for the prdeploy crate.

use std::path::{Path, PathBuf};

/// Extract a JSON array from text that may contain other content.
///
/// `pm2 jlist` can print daemon notices (themselves starting with `[PM2]`)
/// before the JSON document, so every `[` is tried as a start and the first
/// balanced slice that parses as a JSON array wins.
pub fn extract_json_array(text: &str) -> Option<serde_json::Value> {
    text.match_indices('[').find_map(|(start, _)| {
        let candidate = balanced_array(&text[start..])?;
        serde_json::from_str::<serde_json::Value>(candidate)
            .ok()
            .filter(|v| v.is_array())
    })
}

/// The bracket-balanced prefix of `text`, which must start with `[`.
/// Brackets inside string literals are skipped.
fn balanced_array(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Resolve `binary` against `PATH`. Paths containing a separator are checked
/// directly.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    if binary.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(binary);
        return path.is_file().then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Replace characters that are unsafe in a single path component.
pub fn sanitize_path_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if out.starts_with('.') {
        out.replace_range(0..1, "_");
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_array_simple() {
        let value = extract_json_array(r#"[{"name": "1"}]"#).unwrap();
        assert_eq!(value[0]["name"], "1");
    }

    #[test]
    fn test_extract_json_array_skips_daemon_notices() {
        let text = "[PM2] Spawning PM2 daemon with pm2_home=/root/.pm2\n[PM2] Daemon launched\n[{\"name\":\"7\"}]\n";
        let value = extract_json_array(text).unwrap();
        assert_eq!(value[0]["name"], "7");
    }

    #[test]
    fn test_extract_json_array_brackets_in_strings() {
        let text = r#"[{"name": "a]b", "args": ["x"]}] trailing"#;
        let value = extract_json_array(text).unwrap();
        assert_eq!(value[0]["name"], "a]b");
        assert_eq!(value[0]["args"][0], "x");
    }

    #[test]
    fn test_extract_json_array_escaped_quote() {
        let value = extract_json_array(r#"[{"name": "a\"]"}]"#).unwrap();
        assert_eq!(value[0]["name"], "a\"]");
    }

    #[test]
    fn test_extract_json_array_empty_list() {
        assert_eq!(extract_json_array("[]"), Some(serde_json::json!([])));
    }

    #[test]
    fn test_extract_json_array_none() {
        assert_eq!(extract_json_array("no json here"), None);
        assert_eq!(extract_json_array("[1, 2"), None);
    }

    #[test]
    fn test_find_in_path_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool");
        std::fs::write(&tool, "").unwrap();
        assert_eq!(find_in_path(tool.to_str().unwrap()), Some(tool.clone()));
        assert_eq!(find_in_path(dir.path().join("missing").to_str().unwrap()), None);
    }

    #[test]
    fn test_find_in_path_unknown_binary() {
        assert_eq!(find_in_path("prdeploy-definitely-not-installed"), None);
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("feature/x"), "feature-x");
        assert_eq!(sanitize_path_component("my repo"), "my-repo");
        assert_eq!(sanitize_path_component(".hidden"), "_hidden");
        assert_eq!(sanitize_path_component(".."), "_.");
        assert_eq!(sanitize_path_component(""), "_");
        assert_eq!(sanitize_path_component("release-1.2_rc"), "release-1.2_rc");
    }
}
