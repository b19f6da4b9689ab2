// Reverie Engine — Tolerant JSON Extraction
// Models asked for JSON-only output still wrap it in markdown fences or
// prose often enough that a salvage pass pays for itself. Parse directly
// first, then fall back to the outermost brace span.

use serde_json::Value;

/// Parse a JSON object out of raw LLM output. Returns an empty object when
/// nothing parseable is found.
pub fn extract_json_object(raw: &str) -> Value {
    let text = raw.trim();
    if text.is_empty() {
        return Value::Object(Default::default());
    }

    if let Ok(v) = serde_json::from_str::<Value>(text) {
        if v.is_object() {
            return v;
        }
    }

    // Covers fenced blocks and leading/trailing prose: the object is the
    // outermost `{ … }` span.
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            if let Ok(v) = serde_json::from_str::<Value>(&text[start..=end]) {
                if v.is_object() {
                    return v;
                }
            }
        }
    }

    Value::Object(Default::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let v = extract_json_object(r#"{"a": 1}"#);
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn salvages_fenced_output() {
        let raw = "Here you go:\n```json\n{\"name\": \"Ember\"}\n```\nHope that helps!";
        let v = extract_json_object(raw);
        assert_eq!(v["name"], "Ember");
    }

    #[test]
    fn salvages_prose_wrapped_output() {
        let v = extract_json_object("The result is {\"ok\": true} as requested.");
        assert_eq!(v["ok"], true);
    }

    #[test]
    fn garbage_yields_empty_object() {
        assert!(extract_json_object("no json here").as_object().unwrap().is_empty());
        assert!(extract_json_object("").as_object().unwrap().is_empty());
        assert!(extract_json_object("[1,2,3]").as_object().unwrap().is_empty());
    }
}
