//! Output document recovery and canonical patch extraction.

use serde_json::Value;

/// Derives the canonical patch from a structured output document.
///
/// Precedence is a compatibility contract and must not be reordered:
/// 1. a top-level `patch` field;
/// 2. a nested `result` object carrying its own `patch` field;
/// 3. a plain-text `result`, used directly as the patch;
/// 4. otherwise empty.
pub fn extract_patch(output: &Value) -> String {
    if let Some(patch) = output.get("patch").and_then(Value::as_str) {
        if !patch.is_empty() {
            return patch.to_string();
        }
    }

    match output.get("result") {
        Some(Value::Object(result)) => result
            .get("patch")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some(Value::String(result)) => result.clone(),
        _ => String::new(),
    }
}

/// Recovers a structured output document from raw container logs.
///
/// Scans the log lines in reverse for the last line that parses as JSON;
/// when none does, the raw log text is wrapped as the output.
pub fn extract_output_from_logs(logs: &str) -> Value {
    for line in logs.lines().rev() {
        let trimmed = line.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                return value;
            }
        }
    }
    serde_json::json!({ "logs": logs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_precedence_top_level() {
        assert_eq!(extract_patch(&json!({"patch": "P"})), "P");
        // Top-level wins over everything nested
        assert_eq!(
            extract_patch(&json!({"patch": "P", "result": {"patch": "P2"}})),
            "P"
        );
    }

    #[test]
    fn test_patch_precedence_nested_result() {
        assert_eq!(extract_patch(&json!({"result": {"patch": "P2"}})), "P2");
    }

    #[test]
    fn test_patch_precedence_string_result() {
        assert_eq!(extract_patch(&json!({"result": "P3"})), "P3");
    }

    #[test]
    fn test_patch_precedence_empty() {
        assert_eq!(extract_patch(&json!({})), "");
        assert_eq!(extract_patch(&json!({"result": 42})), "");
        assert_eq!(extract_patch(&json!({"result": {"other": "x"}})), "");
    }

    #[test]
    fn test_empty_top_level_patch_falls_through() {
        assert_eq!(
            extract_patch(&json!({"patch": "", "result": {"patch": "P2"}})),
            "P2"
        );
    }

    #[test]
    fn test_logs_recover_last_json_line() {
        let logs = "starting\n{\"first\": 1}\nnoise\n{\"success\": true, \"patch\": \"d\"}\ntrailing";
        let output = extract_output_from_logs(logs);
        assert_eq!(output["success"], json!(true));
        assert_eq!(output["patch"], json!("d"));
    }

    #[test]
    fn test_logs_skip_unparsable_braced_lines() {
        let logs = "{not json}\n{\"ok\": 1}\n{also not json}";
        let output = extract_output_from_logs(logs);
        assert_eq!(output["ok"], json!(1));
    }

    #[test]
    fn test_logs_wrap_when_no_json() {
        let logs = "plain text\nmore text";
        let output = extract_output_from_logs(logs);
        assert_eq!(output["logs"], json!(logs));
    }
}
