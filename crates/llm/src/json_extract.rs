//! Balanced-brace-safe JSON object extraction from free-form LLM text
//!. The naive "first `{` to last `}`" approach breaks on
//! any response containing more than one object, or a string value that
//! itself contains unbalanced braces; this scans respecting string
//! boundaries and backslash escapes.

use serde::de::DeserializeOwned;

/// Strips a leading ` ```json ` / ` ``` ` fence if present, then returns all
/// top-level balanced `{...}` substrings found in the remaining text, in
/// order of appearance.
pub fn extract_json_objects(text: &str) -> Vec<String> {
    let stripped = strip_code_fence(text);
    let bytes = stripped.as_bytes();
    let mut objects = Vec::new();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = find_matching_brace(stripped, i) {
                objects.push(stripped[i..=end].to_string());
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }

    objects
}

/// Convenience wrapper: returns the first extracted object parsed as `T`.
pub fn extract_json_output<T: DeserializeOwned>(text: &str) -> Option<T> {
    extract_json_objects(text).into_iter().find_map(|candidate| serde_json::from_str(&candidate).ok())
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.strip_suffix("```").unwrap_or(rest).trim()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.strip_suffix("```").unwrap_or(rest).trim()
    } else {
        trimmed
    }
}

/// Walks forward from `start` (the index of an opening `{`), tracking brace
/// depth while ignoring braces inside string literals. A `"` only starts or
/// ends a string when not preceded by an odd number of backslashes.
fn find_matching_brace(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;

    let mut i = start;
    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            if escape {
                escape = false;
            } else if c == b'\\' {
                escape = true;
            } else if c == b'"' {
                in_string = false;
            }
        } else {
            match c {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn extracts_bare_object() {
        let objs = extract_json_objects(r#"here you go: {"a": 1} thanks"#);
        assert_eq!(objs, vec![r#"{"a": 1}"#.to_string()]);
    }

    #[test]
    fn extracts_fenced_object() {
        let objs = extract_json_objects("```json\n{\"a\": 1}\n```");
        assert_eq!(objs, vec![r#"{"a": 1}"#.to_string()]);
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let text = r#"{"message": "use { and } inside strings"}"#;
        let objs = extract_json_objects(text);
        assert_eq!(objs.len(), 1);
        let parsed: Value = serde_json::from_str(&objs[0]).unwrap();
        assert_eq!(parsed["message"], "use { and } inside strings");
    }

    #[test]
    fn ignores_escaped_quotes_inside_strings() {
        let text = r#"{"message": "she said \"hi { there\""}"#;
        let objs = extract_json_objects(text);
        assert_eq!(objs.len(), 1);
        let parsed: Value = serde_json::from_str(&objs[0]).unwrap();
        assert_eq!(parsed["message"], "she said \"hi { there\"");
    }

    #[test]
    fn extracts_multiple_top_level_objects_in_order() {
        let text = r#"first {"a": 1} then {"b": 2}"#;
        let objs = extract_json_objects(text);
        assert_eq!(objs.len(), 2);
        assert!(objs[0].contains("\"a\""));
        assert!(objs[1].contains("\"b\""));
    }

    #[test]
    fn unterminated_object_yields_nothing() {
        let objs = extract_json_objects(r#"{"a": 1"#);
        assert!(objs.is_empty());
    }

    #[test]
    fn extract_json_output_deserializes_typed_value() {
        #[derive(serde::Deserialize)]
        struct Out {
            action: String,
        }
        let out: Out = extract_json_output(r#"sure, ```json\n{"action": "go"}\n```"#).unwrap();
        assert_eq!(out.action, "go");
    }

    #[test]
    fn no_json_present_returns_none() {
        let out: Option<Value> = extract_json_output("just plain text, no braces here");
        assert!(out.is_none());
    }
}
