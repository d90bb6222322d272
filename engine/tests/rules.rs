//! Rule compilation and loading through the public API.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use serde_json::json;

use spanmold::domain::dsl::{
    BundleHandle, BundleLoader, CompileError, DslError, LoadMode, RuleSources, SourceFile,
    compile_sources, validate,
};
use spanmold::utils::clock::SteppingClock;
use spanmold::{Attributes, CanonicalEvent, CompiledBundle, Normalizer};

fn assert_send_sync<T: Send + Sync>() {}

/// Normalizer whose clock never advances, so budgets never fire.
fn frozen(bundle: &Arc<CompiledBundle>) -> Normalizer {
    Normalizer::new(Arc::clone(bundle)).with_clock(Arc::new(SteppingClock::new(0)))
}

fn with_provider(name: &str, content: &str) -> RuleSources {
    let embedded = RuleSources::embedded();
    let mut providers = embedded.providers;
    providers.push(SourceFile::new(name, content));
    RuleSources::new(embedded.core, providers)
}

/// Embedded rules with an extra openai alias.
fn with_openai_alias(alias: &str) -> RuleSources {
    let embedded = RuleSources::embedded();
    let providers = embedded
        .providers
        .into_iter()
        .map(|file| {
            if file.name == "providers/openai.yaml" {
                let content = file.content.replacen("aliases: [", &format!("aliases: [{alias}, "), 1);
                SourceFile::new(file.name, content)
            } else {
                file
            }
        })
        .collect();
    RuleSources::new(embedded.core, providers)
}

fn write_rules(dir: &Path, sources: &RuleSources) {
    fs::create_dir_all(dir.join("providers")).unwrap();
    fs::write(dir.join(&sources.core.name), &sources.core.content).unwrap();
    for file in &sources.providers {
        fs::write(dir.join(&file.name), &file.content).unwrap();
    }
}

#[test]
fn duplicate_signature_in_tier_is_rejected() {
    let sources = with_provider(
        "providers/copycat.yaml",
        r#"
provider: copycat
extends: generic
structure_patterns:
  - id: copycat_traceloop
    instrumentor: traceloop
    required_fields: [gen_ai.openai.api_base, gen_ai.request.model, gen_ai.system]
    confidence_weight: 0.9
"#,
    );

    let result = validate(&sources);
    assert!(!result.ok);
    assert!(result.errors.iter().any(|e| matches!(
        e,
        DslError::DuplicateSignature { tier, first, second }
            if tier == "traceloop" && first == "copycat_traceloop" && second == "openai_traceloop"
            || tier == "traceloop" && first == "openai_traceloop" && second == "copycat_traceloop"
    )));

    let err = compile_sources(&sources).unwrap_err();
    assert!(matches!(err, CompileError::Invalid(_)));
    assert!(err.errors().iter().any(|e| e.contains("copycat_traceloop")));
}

#[test]
fn same_signature_in_other_tier_is_allowed() {
    let sources = with_provider(
        "providers/mirror.yaml",
        r#"
provider: mirror
extends: generic
structure_patterns:
  - id: mirror_openlit
    instrumentor: openlit
    required_fields: [gen_ai.openai.api_base, gen_ai.request.model, gen_ai.system]
    confidence_weight: 0.9
"#,
    );
    let bundle = compile_sources(&sources).unwrap();
    assert!(bundle.provider("mirror").is_some());
}

#[test]
fn normalizer_picks_up_edited_rules() {
    let dir = tempfile::tempdir().unwrap();
    let rules_dir = dir.path().join("rules");
    write_rules(&rules_dir, &RuleSources::embedded());

    let loader = BundleLoader::new(
        Some(rules_dir.clone()),
        Some(dir.path().join("bundle.msgpack")),
    );
    let normalizer = Normalizer::from_loader(&loader, LoadMode::Dev).unwrap();
    let span: Attributes = [
        ("gen_ai.system".to_string(), json!("gpt-shop")),
        ("gen_ai.request.model".to_string(), json!("gpt-4o")),
    ]
    .into_iter()
    .collect();
    assert_eq!(normalizer.normalize(&span).config.get("provider"), None);

    // Teach the openai rules a new alias
    let openai = rules_dir.join("providers/openai.yaml");
    let content = fs::read_to_string(&openai).unwrap();
    fs::write(&openai, content.replacen("aliases: [", "aliases: [gpt-shop, ", 1)).unwrap();

    assert!(normalizer.handle().refresh_if_stale(&loader).unwrap());
    assert!(!normalizer.handle().refresh_if_stale(&loader).unwrap());
    assert_eq!(
        normalizer.normalize(&span).config.get("provider"),
        Some(&json!("openai"))
    );
}

#[test]
fn prod_artifact_matches_dev_compile() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("bundle.msgpack");
    let loader = BundleLoader::new(None, Some(artifact.clone()));
    let compiled = loader.compile_to_artifact().unwrap();

    let loaded = loader.load(LoadMode::Prod).unwrap();
    assert_eq!(loaded.source_hash, compiled.source_hash);
    assert_eq!(loaded.summary().providers.len(), compiled.summary().providers.len());

    let handle = Arc::new(BundleHandle::new(loaded));
    let event = Normalizer::with_handle(handle).normalize(
        &[("gen_ai.system".to_string(), json!("gemini"))]
            .into_iter()
            .collect(),
    );
    assert_eq!(event.config.get("provider"), Some(&json!("gemini")));
}

#[test]
fn shared_normalizer_survives_concurrent_swaps() {
    assert_send_sync::<Normalizer>();
    assert_send_sync::<BundleHandle>();
    assert_send_sync::<CanonicalEvent>();

    let original = Arc::new(compile_sources(&RuleSources::embedded()).unwrap());
    let taught = Arc::new(compile_sources(&with_openai_alias("gpt-shop")).unwrap());
    let span: Attributes = [
        ("gen_ai.system".to_string(), json!("gpt-shop")),
        ("gen_ai.request.model".to_string(), json!("gpt-4o")),
        ("gen_ai.completion.0.content".to_string(), json!("hello")),
    ]
    .into_iter()
    .collect();

    let before = frozen(&original).normalize(&span);
    let after = frozen(&taught).normalize(&span);
    assert_ne!(before, after);
    assert_eq!(after.config.get("provider"), Some(&json!("openai")));

    let normalizer = frozen(&original);
    const WORKERS: usize = 4;
    const SPANS_PER_WORKER: usize = 200;
    thread::scope(|s| {
        for _ in 0..WORKERS {
            s.spawn(|| {
                for _ in 0..SPANS_PER_WORKER {
                    let event = normalizer.normalize(&span);
                    assert!(
                        event == before || event == after,
                        "event matches neither bundle: {:?}",
                        event
                    );
                }
            });
        }
        s.spawn(|| {
            for i in 0..SPANS_PER_WORKER {
                let next = if i % 2 == 0 { &taught } else { &original };
                normalizer.handle().swap(Arc::clone(next));
                thread::yield_now();
            }
        });
    });

    let snapshot = normalizer.diagnostics().snapshot();
    assert_eq!(snapshot.spans_processed, (WORKERS * SPANS_PER_WORKER) as u64);
    assert_eq!(snapshot.processing_errors, 0);
}
