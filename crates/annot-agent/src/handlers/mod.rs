//! Built-in handlers

mod add_user_message;
mod entity_lookup;
mod fenced_json_block;
mod structured_output;
mod web_search;

pub use add_user_message::{AddUserMessage, AddUserMessageConfig};
pub use entity_lookup::{EntityLookupToolUse, EntityLookupToolUseConfig};
pub use fenced_json_block::{FencedJsonBlock, FencedJsonBlockConfig};
pub use structured_output::{StructuredOutput, StructuredOutputConfig};
pub use web_search::{WebSearch, WebSearchConfig};

use serde_json::Value;

use crate::error::{Error, Result};

/// Top-level schema key that only matters to the schema authoring tools
const IGNORE_TYPES_KEY: &str = "__ignore_types__";

/// A `json_schema` response format definition with its compiled validator.
///
/// The definition follows the response format shape
/// `{ name, strict, schema }`; only `schema` is used for validation.
pub(crate) struct OutputSchema {
    definition: Value,
    validator: jsonschema::Validator,
}

impl OutputSchema {
    pub(crate) fn new(handler: &str, mut definition: Value) -> Result<Self> {
        if let Some(map) = definition.as_object_mut() {
            map.remove(IGNORE_TYPES_KEY);
        }
        let schema = definition.get("schema").ok_or_else(|| {
            Error::InvalidConfig(format!("{handler}: json_schema has no 'schema' entry"))
        })?;
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| Error::InvalidConfig(format!("{handler}: invalid schema: {e}")))?;

        Ok(Self {
            definition,
            validator,
        })
    }

    pub(crate) fn definition(&self) -> &Value {
        &self.definition
    }

    /// Returns every violation, one per line
    pub(crate) fn validate(&self, instance: &Value) -> std::result::Result<(), String> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("\n"))
        }
    }
}

/// Find the single ```json fenced block of `text`
pub(crate) fn extract_fenced_json(text: &str) -> std::result::Result<&str, String> {
    const OPEN: &str = "```json";
    const CLOSE: &str = "```";

    let start = text
        .find(OPEN)
        .ok_or_else(|| "No JSON block found in the response".to_string())?;
    let body_start = start + OPEN.len();
    let end = text[body_start..]
        .find(CLOSE)
        .map(|i| body_start + i)
        .ok_or_else(|| "No JSON block found in the response".to_string())?;

    if text[end..].contains(OPEN) {
        return Err("Multiple JSON blocks found in the response".to_string());
    }

    Ok(text[body_start..end].trim())
}

/// Parse model output that should be JSON but may be wrapped in prose or a
/// code fence, or be slightly malformed (see [`repair_json`]).
pub(crate) fn parse_lenient(text: &str) -> std::result::Result<Value, String> {
    let trimmed = text.trim();
    let direct = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Some(fenced) = fenced_body(trimmed) {
        if let Ok(value) = serde_json::from_str(fenced) {
            return Ok(value);
        }
    }

    if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if open < close {
            if let Ok(value) = serde_json::from_str(&trimmed[open..=close]) {
                return Ok(value);
            }
        }
    }

    let body = fenced_body(trimmed).unwrap_or(trimmed);
    if let Some(start) = body.find(['{', '[']) {
        let repaired = repair_json(&body[start..]);
        // Anything after the first complete value is prose
        let mut values = serde_json::Deserializer::from_str(&repaired).into_iter::<Value>();
        if let Some(Ok(value)) = values.next() {
            tracing::debug!("Parsed JSON after repair");
            return Ok(value);
        }
    }

    Err(direct.to_string())
}

/// Fix the usual mistakes in model-written JSON: trailing commas, bare
/// object keys and output cut off before the closing brackets.
fn repair_json(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut string_is_key = false;
    let mut escaped = false;
    let mut expect_key = false;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                string_is_key = expect_key;
                expect_key = false;
                out.push(c);
            }
            '{' => {
                closers.push('}');
                expect_key = true;
                out.push(c);
            }
            '[' => {
                closers.push(']');
                expect_key = false;
                out.push(c);
            }
            '}' | ']' => {
                closers.pop();
                expect_key = false;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, None | Some('}') | Some(']')) {
                    expect_key = closers.last() == Some(&'}');
                    out.push(c);
                }
            }
            c if expect_key && (c.is_alphabetic() || c == '_') => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                out.push('"');
                out.extend(&chars[start..i]);
                out.push('"');
                expect_key = false;
                continue;
            }
            c => {
                if !c.is_whitespace() {
                    expect_key = false;
                }
                out.push(c);
            }
        }
        i += 1;
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
        if string_is_key {
            out.push_str(": null");
        }
    }
    if out.trim_end().ends_with(':') {
        out.push_str(" null");
    }
    out.extend(closers.iter().rev());
    out
}

/// Body of the first code fence, with or without a language tag
fn fenced_body(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> Value {
        json!({
            "name": "annotation",
            "strict": true,
            "__ignore_types__": ["Thing"],
            "schema": {
                "type": "object",
                "required": ["organism"],
                "properties": {"organism": {"type": "string"}}
            }
        })
    }

    #[test]
    fn test_output_schema_strips_ignore_key() {
        let schema = OutputSchema::new("Test", definition()).unwrap();
        assert!(schema.definition().get(IGNORE_TYPES_KEY).is_none());
        assert!(schema.definition().get("schema").is_some());
    }

    #[test]
    fn test_output_schema_requires_schema_entry() {
        let err = OutputSchema::new("Test", json!({"name": "x"})).err().unwrap();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_output_schema_validation() {
        let schema = OutputSchema::new("Test", definition()).unwrap();
        assert!(schema.validate(&json!({"organism": "mouse"})).is_ok());
        let err = schema.validate(&json!({"organism": 3})).unwrap_err();
        assert!(err.starts_with("/organism"));
        assert!(schema.validate(&json!({})).is_err());
    }

    #[test]
    fn test_extract_fenced_json() {
        let text = "Here you go:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_fenced_json(text).unwrap(), "{\"a\": 1}");

        assert!(extract_fenced_json("no block").is_err());
        assert!(extract_fenced_json("```json\n{\"a\": 1}").is_err());

        let two = "```json\n{}\n```\n```json\n[]\n```";
        assert_eq!(
            extract_fenced_json(two).unwrap_err(),
            "Multiple JSON blocks found in the response"
        );
    }

    #[test]
    fn test_parse_lenient() {
        assert_eq!(parse_lenient(" {\"a\": 1} ").unwrap(), json!({"a": 1}));
        assert_eq!(
            parse_lenient("```json\n{\"a\": 2}\n```").unwrap(),
            json!({"a": 2})
        );
        assert_eq!(
            parse_lenient("```\n[1, 2]\n```").unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            parse_lenient("Sure! {\"a\": 3} Hope this helps.").unwrap(),
            json!({"a": 3})
        );
        assert!(parse_lenient("not json at all").is_err());
    }

    #[test]
    fn test_parse_lenient_repairs_malformed_json() {
        assert_eq!(
            parse_lenient(r#"{"a": [1, 2,], "b": 3,}"#).unwrap(),
            json!({"a": [1, 2], "b": 3})
        );
        assert_eq!(
            parse_lenient(r#"{organism: "mouse", taxon_id: 10090, nested: {ok: true}}"#).unwrap(),
            json!({"organism": "mouse", "taxon_id": 10090, "nested": {"ok": true}})
        );
        assert_eq!(
            parse_lenient(r#"Result: {"organisms": ["mouse", "rat"#).unwrap(),
            json!({"organisms": ["mouse", "rat"]})
        );
        assert_eq!(
            parse_lenient(r#"{"a": 1, "b":"#).unwrap(),
            json!({"a": 1, "b": null})
        );
        assert_eq!(
            parse_lenient("```json\n{\"a\": [1, 2").unwrap(),
            json!({"a": [1, 2]})
        );
        assert_eq!(
            parse_lenient(r#"{"a": "x", "unfinish"#).unwrap(),
            json!({"a": "x", "unfinish": null})
        );
    }

    #[test]
    fn test_repair_keeps_string_contents() {
        assert_eq!(
            repair_json(r#"{"text": "a, b}, c: d"}"#),
            r#"{"text": "a, b}, c: d"}"#
        );
    }
}
