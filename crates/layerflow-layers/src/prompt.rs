//! Rendering a resolved step into a prompt for a text-in, text-out layer.

use serde_json::Value;

use layerflow_core::types::{Action, ResolvedStep};

/// Input keys rendered as the body of the prompt, in this order.
const PRIMARY_KEYS: [&str; 3] = ["prompt", "text", "query"];

/// Keys consumed by layers themselves rather than shown to the model.
const RESERVED_KEYS: [&str; 3] = ["file", "files", "model"];

fn preamble(action: Action) -> &'static str {
    match action {
        Action::Reason => "Think through the following carefully and answer.",
        Action::Code => "Write the code requested below. Reply with code and brief notes only.",
        Action::Review => "Review the following. List concrete problems and suggested fixes.",
        Action::Summarize => "Summarize the following concisely, keeping key facts.",
        Action::Search => "Search the web for the following and report what you find, citing sources.",
        Action::Ground => "Verify the following claims against current sources. Mark each as supported or not.",
        Action::Analyze => "Analyze the following and report your findings.",
        Action::ProcessFile => "Extract the content of the attached file(s) and report it.",
        Action::DescribeImage => "Describe the attached image(s) in detail.",
        Action::Transcribe => "Transcribe the attached audio or video.",
    }
}

/// Build the prompt text: preamble, primary fields, then every other input
/// key as a context block.
pub fn render(step: &ResolvedStep) -> String {
    let mut out = String::from(preamble(step.action));

    for key in PRIMARY_KEYS {
        if let Some(value) = step.input.get(key) {
            out.push_str("\n\n");
            out.push_str(&value_text(value));
        }
    }

    let context: Vec<(&String, &Value)> = step
        .input
        .iter()
        .filter(|(k, _)| !PRIMARY_KEYS.contains(&k.as_str()) && !RESERVED_KEYS.contains(&k.as_str()))
        .collect();
    if !context.is_empty() {
        out.push_str("\n\nContext:");
        for (key, value) in context {
            out.push_str(&format!("\n[{}]\n{}", key, value_text(value)));
        }
    }

    out
}

/// Strings verbatim, everything else as pretty JSON.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerflow_core::types::LayerKind;
    use serde_json::json;

    fn step(action: Action, input: Value) -> ResolvedStep {
        ResolvedStep {
            id: "s".into(),
            replaces: None,
            layer: LayerKind::Claude,
            action,
            input: input.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_primary_fields_first() {
        let rendered = render(&step(
            Action::Summarize,
            json!({"text": "long article", "audience": "engineers", "prompt": "Be brief."}),
        ));
        assert_eq!(
            rendered,
            "Summarize the following concisely, keeping key facts.\n\nBe brief.\n\nlong article\n\nContext:\n[audience]\nengineers"
        );
    }

    #[test]
    fn test_structured_context_is_json() {
        let rendered = render(&step(
            Action::Analyze,
            json!({"query": "trends", "data": {"hits": [1, 2]}, "file": "/tmp/x.pdf"}),
        ));
        assert!(rendered.starts_with("Analyze the following"));
        assert!(rendered.contains("trends"));
        assert!(rendered.contains("[data]\n{\n  \"hits\""));
        assert!(!rendered.contains("/tmp/x.pdf"));
    }

    #[test]
    fn test_empty_input_is_just_preamble() {
        assert_eq!(render(&step(Action::Reason, json!({}))), preamble(Action::Reason));
    }
}
