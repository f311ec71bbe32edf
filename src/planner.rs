//! Keyword planner: turns a free-text request into a task graph.

use std::sync::OnceLock;

use regex::Regex;

use layerflow_core::graph::{Step, TaskGraph};
use layerflow_core::input::InputValue;
use layerflow_core::types::{Action, LayerKind};

fn media_file() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:^|\s)([^\s]+\.(png|jpe?g|gif|webp|bmp|mp3|wav|m4a|flac|ogg|mp4|mov|webm|pdf|docx?|csv|xlsx?))\b",
        )
        .expect("static pattern")
    })
}

fn research() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(research|search|look\s+up|find|latest|news|current|sources?|compare|trends?)\b")
            .expect("static pattern")
    })
}

fn coding() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(code|function|implement|refactor|bug|compile|script|snippet|regex|sql)\b")
            .expect("static pattern")
    })
}

/// Pick a graph shape for `prompt`. Media files win over research, which
/// wins over code; anything else is a single reasoning step.
pub fn plan_from_prompt(prompt: &str) -> TaskGraph {
    let prompt = prompt.trim();

    if let Some(caps) = media_file().captures(prompt) {
        let path = caps[1].to_string();
        let action = match caps[2].to_lowercase().as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => Action::DescribeImage,
            "mp3" | "wav" | "m4a" | "flac" | "ogg" | "mp4" | "mov" | "webm" => Action::Transcribe,
            _ => Action::ProcessFile,
        };
        return TaskGraph::new(vec![
            Step::new("extract", LayerKind::Multimodal, action)
                .with_input("file", InputValue::literal(path))
                .with_input("prompt", InputValue::literal(prompt)),
            Step::new("answer", LayerKind::Claude, Action::Reason)
                .with_input("prompt", InputValue::literal(prompt))
                .with_input("text", InputValue::reference("extract"))
                .depends_on(["extract"]),
        ]);
    }

    if research().is_match(prompt) {
        return TaskGraph::new(vec![
            Step::new("search", LayerKind::Gemini, Action::Search)
                .with_input("query", InputValue::literal(prompt)),
            Step::new("summarize", LayerKind::Claude, Action::Summarize)
                .with_input("prompt", InputValue::literal(prompt))
                .with_input("text", InputValue::reference("search"))
                .depends_on(["search"]),
        ])
        .with_fallback(
            "search",
            Step::new("search_fallback", LayerKind::Claude, Action::Reason)
                .with_input("prompt", InputValue::literal(prompt)),
        );
    }

    let action = if coding().is_match(prompt) {
        Action::Code
    } else {
        Action::Reason
    };
    TaskGraph::new(vec![Step::new("answer", LayerKind::Claude, action)
        .with_input("prompt", InputValue::literal(prompt))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerflow_engine::resolver;

    #[test]
    fn test_research_prompt() {
        let graph = plan_from_prompt("Find the latest benchmarks for Rust async runtimes");
        assert_eq!(graph.steps.len(), 2);
        assert_eq!(graph.steps[0].layer, LayerKind::Gemini);
        assert_eq!(graph.steps[1].action, Action::Summarize);
        assert_eq!(graph.fallback_for("search").unwrap().layer, LayerKind::Claude);
        let plan = resolver::plan(&graph).unwrap();
        assert_eq!(plan.phases.len(), 2);
    }

    #[test]
    fn test_media_prompt() {
        let graph = plan_from_prompt("What is in ./shots/diagram.PNG and is it accurate?");
        assert_eq!(graph.steps[0].action, Action::DescribeImage);
        assert_eq!(
            graph.steps[0].input["file"],
            InputValue::literal("./shots/diagram.PNG")
        );
        resolver::plan(&graph).unwrap();

        let graph = plan_from_prompt("transcribe meeting.mp3 please");
        assert_eq!(graph.steps[0].action, Action::Transcribe);

        let graph = plan_from_prompt("summarize report.pdf");
        assert_eq!(graph.steps[0].action, Action::ProcessFile);
    }

    #[test]
    fn test_code_and_default() {
        let graph = plan_from_prompt("Implement a function that parses ISO dates");
        assert_eq!(graph.steps.len(), 1);
        assert_eq!(graph.steps[0].action, Action::Code);

        let graph = plan_from_prompt("Why is the sky blue?");
        assert_eq!(graph.steps[0].action, Action::Reason);
        resolver::plan(&graph).unwrap();
    }

    #[test]
    fn test_prompt_with_braces_stays_literal() {
        let graph = plan_from_prompt("explain {{this}} syntax");
        resolver::plan(&graph).unwrap();
    }
}
