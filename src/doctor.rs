use layerflow_core::config::AppConfig;
use layerflow_core::registry::LayerRegistry;
use layerflow_core::types::LayerKind;
use layerflow_engine::RunContext;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

/// Initialize and probe every layer, then print a report. Returns the
/// number of issues found.
pub async fn run_doctor(config: &AppConfig, registry: &LayerRegistry) -> usize {
    let mut checks = Vec::new();

    for kind in LayerKind::ALL {
        if !layer_enabled(config, kind) {
            checks.push(CheckResult {
                label: kind.to_string(),
                ok: true,
                detail: "disabled in config".into(),
            });
        }
    }

    let init = registry.initialize_all().await;
    let ctx = RunContext::probe(registry.clone());
    for (kind, outcome) in init {
        let check = match outcome {
            Ok(()) if ctx.availability().is_available(kind) => CheckResult {
                label: kind.to_string(),
                ok: true,
                detail: layer_detail(config, kind),
            },
            Ok(()) => CheckResult {
                label: kind.to_string(),
                ok: false,
                detail: "initialized but reports unavailable".into(),
            },
            Err(e) => CheckResult {
                label: kind.to_string(),
                ok: false,
                detail: e.to_string(),
            },
        };
        checks.push(check);
    }

    checks.push(check_retry(config));

    let mut ok_count = 0;
    let mut fail_count = 0;
    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

fn layer_enabled(config: &AppConfig, kind: LayerKind) -> bool {
    match kind {
        LayerKind::Claude => config.layers.claude.enabled,
        LayerKind::Gemini => config.layers.gemini.enabled,
        LayerKind::Multimodal => config.layers.multimodal.enabled,
    }
}

fn layer_detail(config: &AppConfig, kind: LayerKind) -> String {
    let timeout = config
        .layer_timeout(kind)
        .unwrap_or_else(|| kind.default_timeout());
    match kind {
        LayerKind::Claude => format!(
            "'{}' ready, timeout {}s",
            config.layers.claude.binary_or("claude"),
            timeout.as_secs()
        ),
        LayerKind::Gemini => format!(
            "'{}' ready, timeout {}s",
            config.layers.gemini.binary_or("gemini"),
            timeout.as_secs()
        ),
        LayerKind::Multimodal => format!(
            "API key set, model {}, timeout {}s",
            config.layers.multimodal.model,
            timeout.as_secs()
        ),
    }
}

fn check_retry(config: &AppConfig) -> CheckResult {
    let retry = &config.engine.retry;
    if retry.initial_backoff_ms <= retry.max_backoff_ms {
        CheckResult {
            label: "Retry policy".into(),
            ok: true,
            detail: format!(
                "{} retries, backoff {}ms to {}ms",
                config.engine.default_retries, retry.initial_backoff_ms, retry.max_backoff_ms
            ),
        }
    } else {
        CheckResult {
            label: "Retry policy".into(),
            ok: false,
            detail: format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                retry.initial_backoff_ms, retry.max_backoff_ms
            ),
        }
    }
}
