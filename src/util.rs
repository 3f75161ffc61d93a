//! Shared helpers for the conveyor crate.

/// Extract the first JSON object from text that may contain other content.
/// Brace-counting scanner that ignores braces inside string literals, so
/// prose like `{"note": "see {braces}"}` extracts cleanly.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    scan_object(text, start)
}

/// Extract the last JSON object in the text. Executor responses tend to
/// talk first and emit the structured result at the end, so payload
/// extraction prefers the final object over earlier inline examples.
pub fn extract_last_json_object(text: &str) -> Option<String> {
    let mut best = None;
    let mut from = 0;
    while let Some(rel) = text[from..].find('{') {
        let start = from + rel;
        match scan_object(text, start) {
            Some(obj) => {
                from = start + obj.len();
                best = Some(obj);
            }
            None => from = start + 1,
        }
    }
    best
}

fn scan_object(text: &str, start: usize) -> Option<String> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
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
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Render a wait/elapsed duration the way it reads in progress lines:
/// `45s`, `3m 20s`, `1h 04m`.
pub fn format_duration_secs(total: u64) -> String {
    if total < 60 {
        format!("{total}s")
    } else if total < 3600 {
        format!("{}m {:02}s", total / 60, total % 60)
    } else {
        format!("{}h {:02}m", total / 3600, (total % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Result follows: {"status": "ok"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"status": "ok"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": 1}} trailing"#;
        assert_eq!(extract_json_object(text), Some(r#"{"outer": {"inner": 1}}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_braces_in_strings() {
        let text = r#"{"note": "a { stray } pair", "n": 2}"#;
        assert_eq!(extract_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }

    #[test]
    fn test_extract_json_object_no_json() {
        assert_eq!(extract_json_object("nothing structured here"), None);
    }

    #[test]
    fn test_extract_last_json_object_prefers_final() {
        let text = r#"example: {"draft": true} ... final: {"draft": false, "tasks": []}"#;
        assert_eq!(
            extract_last_json_object(text),
            Some(r#"{"draft": false, "tasks": []}"#.to_string())
        );
    }

    #[test]
    fn test_extract_last_json_object_single() {
        let text = r#"{"only": 1}"#;
        assert_eq!(extract_last_json_object(text), Some(text.to_string()));
    }

    #[test]
    fn test_format_duration_secs() {
        assert_eq!(format_duration_secs(45), "45s");
        assert_eq!(format_duration_secs(200), "3m 20s");
        assert_eq!(format_duration_secs(3840), "1h 04m");
    }
}
