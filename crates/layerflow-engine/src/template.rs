//! Input resolution: substitutes upstream step outputs into a step's input.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use layerflow_core::error::{LayerflowError, Result};
use layerflow_core::input::{InputValue, StepOutputRef, TextSegment};
use layerflow_core::types::StepResult;

static NULL: Value = Value::Null;

/// Resolve every value of `input` against the results recorded so far.
///
/// A reference to a step with no successful result is an
/// `UnresolvedReference`; a projection into a field the data lacks is
/// `InvalidInput`.
pub fn resolve_input(
    step_id: &str,
    input: &BTreeMap<String, InputValue>,
    results: &HashMap<String, StepResult>,
) -> Result<Map<String, Value>> {
    input
        .iter()
        .map(|(key, value)| Ok((key.clone(), resolve_value(step_id, value, results)?)))
        .collect()
}

fn resolve_value(
    step_id: &str,
    value: &InputValue,
    results: &HashMap<String, StepResult>,
) -> Result<Value> {
    match value {
        InputValue::Literal(v) => Ok(v.clone()),
        InputValue::Ref(r) => lookup(step_id, r, results).cloned(),
        InputValue::Text(segments) => {
            let mut text = String::new();
            for segment in segments {
                match segment {
                    TextSegment::Literal(s) => text.push_str(s),
                    TextSegment::Ref(r) => match lookup(step_id, r, results)? {
                        Value::String(s) => text.push_str(s),
                        other => text.push_str(&other.to_string()),
                    },
                }
            }
            Ok(Value::String(text))
        }
        InputValue::List(items) => items
            .iter()
            .map(|item| resolve_value(step_id, item, results))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        InputValue::Map(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), resolve_value(step_id, v, results)?)))
            .collect::<Result<Map<_, _>>>()
            .map(Value::Object),
    }
}

fn lookup<'a>(
    step_id: &str,
    reference: &StepOutputRef,
    results: &'a HashMap<String, StepResult>,
) -> Result<&'a Value> {
    let unresolved = || LayerflowError::UnresolvedReference {
        step: step_id.to_string(),
        reference: reference.to_string(),
    };

    let result = results
        .get(&reference.step_id)
        .filter(|r| r.success)
        .ok_or_else(unresolved)?;
    let data = result.data.as_ref().unwrap_or(&NULL);

    reference.project(data).ok_or_else(|| {
        LayerflowError::InvalidInput(format!(
            "Step '{}': '{}' has no field '{}'",
            step_id,
            reference.step_id,
            reference.field.join(".")
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerflow_core::types::{LayerKind, LayerOutput};
    use serde_json::json;

    fn results() -> HashMap<String, StepResult> {
        let mut map = HashMap::new();
        map.insert(
            "search".to_string(),
            StepResult::succeeded(
                LayerKind::Gemini,
                LayerOutput::new(json!({"title": "Rust", "hits": [1, 2, 3]})),
                10,
                1,
            ),
        );
        map.insert(
            "note".to_string(),
            StepResult::succeeded(LayerKind::Claude, LayerOutput::text("plain text"), 5, 1),
        );
        map
    }

    fn input(pairs: Value) -> BTreeMap<String, InputValue> {
        serde_json::from_value(pairs).unwrap()
    }

    #[test]
    fn test_whole_reference_keeps_structure() {
        let resolved = resolve_input("s", &input(json!({"data": "{{search}}"})), &results()).unwrap();
        assert_eq!(resolved["data"], json!({"title": "Rust", "hits": [1, 2, 3]}));
    }

    #[test]
    fn test_field_projection() {
        let resolved = resolve_input(
            "s",
            &input(json!({"title": "{{search.title}}", "second": {"$ref": "search.hits.1"}})),
            &results(),
        )
        .unwrap();
        assert_eq!(resolved["title"], json!("Rust"));
        assert_eq!(resolved["second"], json!(2));
    }

    #[test]
    fn test_embedded_text_substitution() {
        let resolved = resolve_input(
            "s",
            &input(json!({"prompt": "Title: {{search.title}}; note: {{note}}; hits: {{search.hits}}"})),
            &results(),
        )
        .unwrap();
        assert_eq!(
            resolved["prompt"],
            json!("Title: Rust; note: plain text; hits: [1,2,3]")
        );
    }

    #[test]
    fn test_nested_structures() {
        let resolved = resolve_input(
            "s",
            &input(json!({"ctx": {"items": ["{{note}}", 7, {"$literal": "{{note}}"}]}})),
            &results(),
        )
        .unwrap();
        assert_eq!(resolved["ctx"], json!({"items": ["plain text", 7, "{{note}}"]}));
    }

    #[test]
    fn test_missing_step_is_unresolved() {
        let err = resolve_input("s", &input(json!({"x": "{{nonexistent}}"})), &results()).unwrap_err();
        match err {
            LayerflowError::UnresolvedReference { step, reference } => {
                assert_eq!(step, "s");
                assert_eq!(reference, "nonexistent");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_failed_step_is_unresolved() {
        let mut map = results();
        map.insert("broken".into(), StepResult::skipped(LayerKind::Claude, "search"));
        let err = resolve_input("s", &input(json!({"x": "{{broken}}"})), &map).unwrap_err();
        assert!(matches!(err, LayerflowError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_missing_field_is_invalid_input() {
        let err = resolve_input("s", &input(json!({"x": "{{search.author}}"})), &results()).unwrap_err();
        assert!(matches!(err, LayerflowError::InvalidInput(_)));
    }
}
