//! Typed step inputs.
//!
//! Step inputs are parsed once, when a graph is loaded, into an `InputValue`
//! tree. References to upstream outputs are explicit `StepOutputRef` nodes, so
//! resolution never has to guess whether a string is a template.
//!
//! JSON forms accepted:
//! - `"{{search}}"` / `"{{search.items.0}}"`: a whole-value reference
//! - `"Summarize: {{search}}"`: text with embedded references
//! - `{"$ref": "search.title"}`: explicit reference
//! - `{"$literal": ...}`: a value taken verbatim, never interpreted

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LayerflowError;

const REF_KEY: &str = "$ref";
const LITERAL_KEY: &str = "$literal";

/// Reference to another step's output, optionally projected into its data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepOutputRef {
    pub step_id: String,
    /// Path into the referenced step's `data`. Empty means the whole value.
    pub field: Vec<String>,
}

impl StepOutputRef {
    pub fn whole(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            field: vec![],
        }
    }

    pub fn field(step_id: impl Into<String>, path: &str) -> Self {
        Self {
            step_id: step_id.into(),
            field: path.split('.').map(str::to_string).collect(),
        }
    }

    /// Parse `id` or `id.path.to.field`. Returns `None` for anything that is
    /// not a well-formed reference expression.
    pub fn parse(expr: &str) -> Option<Self> {
        let expr = expr.trim();
        let mut parts = expr.split('.');
        let step_id = parts.next()?;
        if !is_valid_id(step_id) {
            return None;
        }
        let field: Vec<String> = parts.map(str::to_string).collect();
        if field
            .iter()
            .any(|f| f.is_empty() || f.chars().any(char::is_whitespace))
        {
            return None;
        }
        Some(Self {
            step_id: step_id.to_string(),
            field,
        })
    }

    /// Walk `field` into `data`. Numeric segments index arrays.
    pub fn project<'a>(&self, data: &'a Value) -> Option<&'a Value> {
        let mut current = data;
        for segment in &self.field {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for StepOutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.step_id)?;
        for segment in &self.field {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Piece of a text template.
#[derive(Debug, Clone, PartialEq)]
pub enum TextSegment {
    Literal(String),
    Ref(StepOutputRef),
}

/// A step input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum InputValue {
    /// Taken as-is.
    Literal(Value),
    /// Replaced by the referenced value, structure preserved.
    Ref(StepOutputRef),
    /// String with embedded references, substituted as text.
    Text(Vec<TextSegment>),
    List(Vec<InputValue>),
    Map(BTreeMap<String, InputValue>),
}

impl InputValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        InputValue::Literal(value.into())
    }

    pub fn reference(step_id: impl Into<String>) -> Self {
        InputValue::Ref(StepOutputRef::whole(step_id))
    }

    /// Parse a string that may contain `{{...}}` references.
    pub fn text(s: &str) -> Self {
        parse_template(s)
    }

    /// Parse a raw JSON value into a typed input tree.
    pub fn parse(value: Value) -> Result<Self, LayerflowError> {
        match value {
            Value::String(s) => Ok(parse_template(&s)),
            Value::Array(items) => items
                .into_iter()
                .map(InputValue::parse)
                .collect::<Result<Vec<_>, _>>()
                .map(InputValue::List),
            Value::Object(mut map) => {
                if map.len() == 1 {
                    if let Some(inner) = map.remove(LITERAL_KEY) {
                        return Ok(InputValue::Literal(inner));
                    }
                    if let Some(target) = map.get(REF_KEY) {
                        let expr = target.as_str().ok_or_else(|| {
                            LayerflowError::InvalidInput(format!("{} must be a string", REF_KEY))
                        })?;
                        return StepOutputRef::parse(expr).map(InputValue::Ref).ok_or_else(|| {
                            LayerflowError::InvalidInput(format!(
                                "Malformed reference: {}",
                                expr
                            ))
                        });
                    }
                }
                map.into_iter()
                    .map(|(k, v)| InputValue::parse(v).map(|parsed| (k, parsed)))
                    .collect::<Result<BTreeMap<_, _>, _>>()
                    .map(InputValue::Map)
            }
            scalar => Ok(InputValue::Literal(scalar)),
        }
    }

    /// Every reference in this value, depth-first.
    pub fn references(&self) -> Vec<&StepOutputRef> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a StepOutputRef>) {
        match self {
            InputValue::Literal(_) => {}
            InputValue::Ref(r) => out.push(r),
            InputValue::Text(segments) => {
                for segment in segments {
                    if let TextSegment::Ref(r) = segment {
                        out.push(r);
                    }
                }
            }
            InputValue::List(items) => items.iter().for_each(|i| i.collect_refs(out)),
            InputValue::Map(map) => map.values().for_each(|v| v.collect_refs(out)),
        }
    }
}

impl TryFrom<Value> for InputValue {
    type Error = LayerflowError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        InputValue::parse(value)
    }
}

impl From<InputValue> for Value {
    fn from(input: InputValue) -> Self {
        match input {
            InputValue::Literal(v) => {
                if needs_escape(&v) {
                    let mut wrapper = serde_json::Map::new();
                    wrapper.insert(LITERAL_KEY.to_string(), v);
                    Value::Object(wrapper)
                } else {
                    v
                }
            }
            InputValue::Ref(r) => Value::String(format!("{{{{{}}}}}", r)),
            InputValue::Text(segments) => {
                let mut s = String::new();
                for segment in segments {
                    match segment {
                        TextSegment::Literal(text) => s.push_str(&text),
                        TextSegment::Ref(r) => s.push_str(&format!("{{{{{}}}}}", r)),
                    }
                }
                Value::String(s)
            }
            InputValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            InputValue::Map(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// A literal that would parse back into something else must be wrapped.
fn needs_escape(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains("{{"),
        Value::Array(_) | Value::Object(_) => true,
        _ => false,
    }
}

fn parse_template(s: &str) -> InputValue {
    let mut segments: Vec<TextSegment> = Vec::new();
    let mut literal = String::new();
    let mut rest = s;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        match StepOutputRef::parse(&after_open[..close]) {
            Some(r) => {
                literal.push_str(&rest[..open]);
                if !literal.is_empty() {
                    segments.push(TextSegment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(TextSegment::Ref(r));
            }
            None => {
                // Not a reference; keep the braces verbatim.
                literal.push_str(&rest[..open + 2 + close + 2]);
            }
        }
        rest = &after_open[close + 2..];
    }
    literal.push_str(rest);

    if segments.is_empty() {
        return InputValue::Literal(Value::String(literal));
    }
    if !literal.is_empty() {
        segments.push(TextSegment::Literal(literal));
    }
    if let [TextSegment::Ref(r)] = segments.as_slice() {
        return InputValue::Ref(r.clone());
    }
    InputValue::Text(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_reference() {
        let v = InputValue::parse(json!("{{search}}")).unwrap();
        assert_eq!(v, InputValue::Ref(StepOutputRef::whole("search")));

        let v = InputValue::parse(json!("{{ search.items.0 }}")).unwrap();
        assert_eq!(v, InputValue::Ref(StepOutputRef::field("search", "items.0")));
    }

    #[test]
    fn test_embedded_reference() {
        let v = InputValue::text("Summarize {{search}} briefly");
        assert_eq!(
            v,
            InputValue::Text(vec![
                TextSegment::Literal("Summarize ".into()),
                TextSegment::Ref(StepOutputRef::whole("search")),
                TextSegment::Literal(" briefly".into()),
            ])
        );
    }

    #[test]
    fn test_non_reference_braces_stay_literal() {
        let v = InputValue::text("use {{ not a ref }} and {{unclosed");
        assert_eq!(
            v,
            InputValue::Literal(json!("use {{ not a ref }} and {{unclosed"))
        );
    }

    #[test]
    fn test_explicit_ref_and_literal_objects() {
        let v = InputValue::parse(json!({"$ref": "fetch.title"})).unwrap();
        assert_eq!(v, InputValue::Ref(StepOutputRef::field("fetch", "title")));

        let v = InputValue::parse(json!({"$literal": "{{search}}"})).unwrap();
        assert_eq!(v, InputValue::Literal(json!("{{search}}")));
        assert!(v.references().is_empty());

        assert!(InputValue::parse(json!({"$ref": 42})).is_err());
        assert!(InputValue::parse(json!({"$ref": "bad id"})).is_err());
    }

    #[test]
    fn test_nested_references_collected() {
        let v = InputValue::parse(json!({
            "sources": ["{{a}}", {"inner": "x {{b.title}}"}],
            "count": 3
        }))
        .unwrap();
        let refs: Vec<String> = v.references().iter().map(|r| r.to_string()).collect();
        assert_eq!(refs, vec!["a", "b.title"]);
    }

    #[test]
    fn test_serialize_escapes_literals() {
        let v = InputValue::Literal(json!("{{search}}"));
        let out: Value = v.clone().into();
        assert_eq!(out, json!({"$literal": "{{search}}"}));
        assert_eq!(InputValue::parse(out).unwrap(), v);

        let r: Value = InputValue::Ref(StepOutputRef::field("a", "b")).into();
        assert_eq!(r, json!("{{a.b}}"));
    }

    #[test]
    fn test_project() {
        let data = json!({"items": [{"title": "first"}, {"title": "second"}]});
        let r = StepOutputRef::field("s", "items.1.title");
        assert_eq!(r.project(&data), Some(&json!("second")));
        assert_eq!(StepOutputRef::field("s", "items.9").project(&data), None);
        assert_eq!(StepOutputRef::whole("s").project(&data), Some(&data));
    }
}
