pub mod claude;
pub mod gemini;
pub mod multimodal;
pub mod process;
pub mod prompt;

pub use claude::ClaudeLayer;
pub use gemini::GeminiLayer;
pub use multimodal::MultimodalLayer;

use tracing::debug;

use layerflow_core::config::AppConfig;
use layerflow_core::registry::LayerRegistry;

/// Build a registry with every layer enabled in `config`.
pub fn build_registry(config: &AppConfig) -> LayerRegistry {
    let mut registry = LayerRegistry::new();

    if config.layers.claude.enabled {
        registry.register(ClaudeLayer::new(&config.layers.claude));
    } else {
        debug!(layer = "claude", "Layer disabled in config");
    }

    if config.layers.gemini.enabled {
        registry.register(GeminiLayer::new(&config.layers.gemini));
    } else {
        debug!(layer = "gemini", "Layer disabled in config");
    }

    if config.layers.multimodal.enabled {
        registry.register(MultimodalLayer::new(config.layers.multimodal.clone()));
    } else {
        debug!(layer = "multimodal", "Layer disabled in config");
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerflow_core::types::LayerKind;

    #[test]
    fn test_build_registry_respects_enabled() {
        let config = AppConfig::parse(
            r#"
[layers.gemini]
enabled = false
"#,
        )
        .unwrap();
        let registry = build_registry(&config);
        assert_eq!(registry.kinds(), vec![LayerKind::Claude, LayerKind::Multimodal]);
    }
}
