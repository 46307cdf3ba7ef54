//! End-to-end scenarios driving the public API: rule registration, graph
//! resolution, memoized execution, invalidation, and subprocess-backed
//! rules.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::Utf8PathBuf;
use karakuri::{
    Digest, Engine, EngineConfig, EngineError, Executor, GraphError, Params, ProcessRequest,
    Registry, Rule, Store,
};

#[derive(Clone, Hash, PartialEq, Eq, Debug)]
struct Name(String);
#[derive(Clone, Hash, PartialEq, Eq, Debug)]
struct Greeting(String);

fn engine_with(rules: Vec<Rule>) -> Engine {
    let mut registry = Registry::new();
    for rule in rules {
        registry.register(rule).unwrap();
    }
    Engine::new(registry, Arc::new(Store::new()), EngineConfig::default())
}

#[test]
fn greeting_is_computed_once_per_identity() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let engine = engine_with(vec![Rule::new("greet").param::<Name>().build(
        move |_, params| {
            counter.fetch_add(1, Ordering::SeqCst);
            let name = params.get::<Name>()?;
            Ok(Greeting(format!("Hello, {}", name.0)))
        },
    )]);

    let params = Params::of(Name("world".into()));
    let first = engine.request::<Greeting>(params.clone()).unwrap();
    let second = engine.request::<Greeting>(params).unwrap();

    assert_eq!(first.0, "Hello, world");
    assert_eq!(second.0, "Hello, world");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_rule_reports_requested_and_available() {
    let engine = engine_with(vec![]);
    let err = engine
        .request::<Greeting>(Params::of(Name("world".into())))
        .unwrap_err();

    match err {
        EngineError::Graph(GraphError::NoRule { product, .. }) => {
            assert!(product.contains("Greeting"));
        }
        other => panic!("expected NoRule, got {other:?}"),
    }
}

#[test]
fn ambiguous_rules_are_rejected_with_candidates() {
    #[derive(Clone, Hash, PartialEq, Eq, Debug)]
    struct Locale(String);

    let engine = engine_with(vec![
        Rule::new("greet_plain").param::<Name>().build(|_, params| {
            let name = params.get::<Name>()?;
            Ok(Greeting(format!("Hello, {}", name.0)))
        }),
        Rule::new("greet_localized")
            .param::<Name>()
            .param::<Locale>()
            .build(|_, params| {
                let name = params.get::<Name>()?;
                Ok(Greeting(format!("Bonjour, {}", name.0)))
            }),
    ]);

    // Only Name ambient: the localized rule is unsatisfiable, the plain
    // one wins by parameter-subset filtering.
    let plain = engine
        .request::<Greeting>(Params::of(Name("world".into())))
        .unwrap();
    assert_eq!(plain.0, "Hello, world");

    // Both ambient: both rules are satisfiable and neither is preferred.
    let mut params = Params::of(Name("world".into()));
    params.insert(Locale("fr".into())).unwrap();
    let err = engine.request::<Greeting>(params).unwrap_err();

    match err {
        EngineError::Graph(GraphError::Ambiguous { rules, .. }) => {
            assert_eq!(rules.len(), 2);
        }
        other => panic!("expected Ambiguous, got {other:?}"),
    }
}

#[test]
fn dependency_cycles_are_rejected_at_resolution() {
    #[derive(Clone, Hash, PartialEq, Eq, Debug)]
    struct Yin(u32);
    #[derive(Clone, Hash, PartialEq, Eq, Debug)]
    struct Yang(u32);

    let engine = engine_with(vec![
        Rule::new("yin").param::<Yang>().build(|_, params| {
            let yang = params.get::<Yang>()?;
            Ok(Yin(yang.0))
        }),
        Rule::new("yang").param::<Yin>().build(|_, params| {
            let yin = params.get::<Yin>()?;
            Ok(Yang(yin.0))
        }),
    ]);

    let err = engine
        .request::<Yin>(Params::of(Name("seed".into())))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Graph(GraphError::Cycle { .. })
    ));
}

/// A two-stage build: `assemble` Gets a `Compiled` artifact for a
/// `SourceSet`; the compile rule snapshots the sources and shells out to
/// concatenate them. Editing a source and invalidating must produce a
/// different artifact digest; before invalidation the stale result stays
/// cached.
#[test]
fn subprocess_backed_compilation_recomputes_after_invalidation() {
    #[derive(Clone, Hash, PartialEq, Eq, Debug)]
    struct SourceSet(Vec<Utf8PathBuf>);
    #[derive(Clone, Hash, PartialEq, Eq, Debug)]
    struct Compiled(Digest);
    #[derive(Clone, Hash, PartialEq, Eq, Debug)]
    struct Assembled(Digest);

    let workdir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(workdir.path().to_path_buf()).unwrap();
    std::fs::write(root.join("a.src"), "alpha\n").unwrap();
    std::fs::write(root.join("b.src"), "beta\n").unwrap();

    let store = Arc::new(Store::new());
    let sandbox_root = tempfile::tempdir().unwrap();
    let executor = Arc::new(Executor::new(
        store.clone(),
        Utf8PathBuf::from_path_buf(sandbox_root.path().to_path_buf()).unwrap(),
    ));

    let compile_root = root.clone();
    let mut registry = Registry::new();
    registry
        .register(Rule::new("compile").param::<SourceSet>().build(
            move |ctx, params| {
                let sources = params.get::<SourceSet>()?;
                let input = ctx.snapshot(&compile_root, &sources.0)?;
                let result = executor.run(&ProcessRequest {
                    executable: "/bin/sh".into(),
                    args: vec!["-c".into(), "cat *.src > out.bin".into()],
                    env: BTreeMap::new(),
                    input,
                    output_paths: vec!["out.bin".into()],
                })?;
                anyhow::ensure!(result.exit_code == 0, "compile exited {}", result.exit_code);
                Ok(Compiled(result.output))
            },
        ))
        .unwrap();
    registry
        .register(
            Rule::new("assemble")
                .param::<SourceSet>()
                .get::<Compiled, SourceSet>()
                .build(|ctx, params| {
                    let sources = params.get::<SourceSet>()?;
                    let compiled = ctx.get::<Compiled, SourceSet>(SourceSet(sources.0.clone()))?;
                    Ok(Assembled(compiled.0))
                }),
        )
        .unwrap();

    let engine = Engine::new(registry, store.clone(), EngineConfig::default());
    let sources = SourceSet(vec!["a.src".into(), "b.src".into()]);

    let first = engine
        .request::<Assembled>(Params::of(sources.clone()))
        .unwrap();

    // Edit a source. Without invalidation the stale result is served.
    std::fs::write(root.join("a.src"), "ALPHA\n").unwrap();
    let stale = engine
        .request::<Assembled>(Params::of(sources.clone()))
        .unwrap();
    assert_eq!(stale.0, first.0);

    // After invalidation the pipeline reruns against current content.
    let evicted = engine.invalidate(&[root.join("a.src")]);
    assert!(evicted >= 2, "compile and assemble both evicted, got {evicted}");
    let fresh = engine
        .request::<Assembled>(Params::of(sources))
        .unwrap();
    assert_ne!(fresh.0, first.0);

    let out = store.get_tree(&fresh.0).unwrap();
    let blob = store.get(&out["out.bin"].digest).unwrap();
    assert_eq!(&*blob, b"ALPHA\nbeta\n");
}

/// A failing subprocess yields a normal result; the rule decides it is an
/// error, which then surfaces as a task failure with the rule's name.
#[test]
fn nonzero_exit_surfaces_as_rule_failure() {
    #[derive(Clone, Hash, PartialEq, Eq, Debug)]
    struct Target(String);
    #[derive(Clone, Hash, PartialEq, Eq, Debug)]
    struct Built(Digest);

    let store = Arc::new(Store::new());
    let sandbox_root = tempfile::tempdir().unwrap();
    let executor = Arc::new(Executor::new(
        store.clone(),
        Utf8PathBuf::from_path_buf(sandbox_root.path().to_path_buf()).unwrap(),
    ));

    let exec_store = store.clone();
    let mut registry = Registry::new();
    registry
        .register(Rule::new("build").param::<Target>().build(move |_, _| {
            let result = executor.run(&ProcessRequest {
                executable: "/bin/sh".into(),
                args: vec!["-c".into(), "printf 'unknown target' >&2; exit 2".into()],
                env: BTreeMap::new(),
                input: exec_store.empty_tree(),
                output_paths: vec![],
            })?;
            if result.exit_code != 0 {
                let stderr = exec_store.get(&result.stderr)?;
                anyhow::bail!(
                    "build exited {}: {}",
                    result.exit_code,
                    String::from_utf8_lossy(&stderr)
                );
            }
            Ok(Built(result.output))
        }))
        .unwrap();

    let engine = Engine::new(registry, store, EngineConfig::default());
    let err = engine
        .request::<Built>(Params::of(Target("//app".into())))
        .unwrap_err();

    match err {
        EngineError::Task { rule, source } => {
            assert_eq!(rule, "build");
            let message = source.to_string();
            assert!(message.contains("exited 2"));
            assert!(message.contains("unknown target"));
        }
        other => panic!("expected Task, got {other:?}"),
    }
}

#[test]
fn rule_graph_renders_registered_rules() {
    let engine = engine_with(vec![Rule::new("greet").param::<Name>().build(
        |_, params| {
            let name = params.get::<Name>()?;
            Ok(Greeting(format!("Hello, {}", name.0)))
        },
    )]);

    engine
        .request::<Greeting>(Params::of(Name("world".into())))
        .unwrap();

    let rendered = engine.render_rule_graph();
    assert!(rendered.contains("graph LR"));
    assert!(rendered.contains("greet"));
}
