//! End-to-end weaving behavior: synthetic classes go through the full
//! pipeline and the woven bytecode is executed against a live dispatcher.

mod common;

use std::sync::Arc;

use parking_lot::Mutex;

use classweave::analysis::AnalysisCache;
use classweave::classfile::ClassFile;
use classweave::config::EngineConfig;
use classweave::descriptor::{DescriptorBundle, MixinField, MixinSpec, PointcutSpec};
use classweave::dispatch::{AdviceHandler, Dispatcher};
use classweave::engine::{ClassPreloader, Engine};
use classweave::hierarchy::{ClassByteSource, HierarchyCache, LoaderRef, BOOTSTRAP_LOADER};
use classweave::hook::LoadHook;
use classweave::registry::AdviceRegistry;
use classweave::weaver::{TransformOutcome, Weaver};

use common::{ClassBytesBuilder, Interp, Outcome};

struct EmptySource;

impl ClassByteSource for EmptySource {
    fn class_bytes(&self, _: &str) -> Option<Vec<u8>> {
        None
    }
    fn parent(&self) -> Option<LoaderRef> {
        None
    }
}

fn boot_loader() -> (Arc<dyn ClassByteSource>, LoaderRef) {
    let source: Arc<dyn ClassByteSource> = Arc::new(EmptySource);
    let loader = LoaderRef::new(BOOTSTRAP_LOADER, &source);
    (source, loader)
}

struct Recording {
    events: Mutex<Vec<String>>,
    tag: &'static str,
}

impl Recording {
    fn new(tag: &'static str) -> Arc<Self> {
        Arc::new(Self { events: Mutex::new(Vec::new()), tag })
    }
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

impl AdviceHandler for Recording {
    fn on_before(&self) {
        self.events.lock().push(format!("{}:before", self.tag));
    }
    fn on_return(&self) {
        self.events.lock().push(format!("{}:return", self.tag));
    }
    fn on_throw(&self) {
        self.events.lock().push(format!("{}:throw", self.tag));
    }
}

struct NoopPreloader;

impl ClassPreloader for NoopPreloader {
    fn preload(&self, _: &str) -> Result<(), String> {
        Ok(())
    }
}

fn pointcut(class: &str, method: &str, advice: &str, group: Option<&str>) -> PointcutSpec {
    PointcutSpec {
        class_name: class.into(),
        include_subtypes: false,
        sub_type_restriction: None,
        method_name: method.into(),
        params: None,
        return_type: None,
        nesting_group: group.map(String::from),
        order: 0,
        advice: advice.into(),
        on_before: true,
        on_return: true,
        on_throw: true,
    }
}

fn parts() -> (Arc<AdviceRegistry>, Weaver, Dispatcher) {
    let config = EngineConfig::default();
    let registry = Arc::new(AdviceRegistry::new());
    let weaver = Weaver::new(
        registry.clone(),
        Arc::new(HierarchyCache::new(64)),
        Arc::new(AnalysisCache::new(64)),
        &config,
    );
    (registry, weaver, Dispatcher::new())
}

#[test]
fn woven_method_fires_before_and_return_through_the_engine() {
    let bundle = DescriptorBundle::from_json(
        r#"{
            "id": "e2e",
            "pointcuts": [
                {"class_name": "app/Job", "method_name": "run", "advice": "job"}
            ]
        }"#,
    )
    .unwrap();
    let handler = Recording::new("job");
    let engine = Arc::new(
        Engine::builder().bundle(bundle).handler("job", handler.clone()).build(),
    );
    engine.bootstrap(&NoopPreloader).unwrap();
    let hook = LoadHook::new(engine.clone());

    let mut builder = ClassBytesBuilder::new("app/Job");
    builder.method("run", "()V", vec![0xb1]);
    let bytes = builder.build();

    let (_keep, loader) = boot_loader();
    let woven = hook.transform(&loader, "app/Job", &bytes).expect("expected woven bytes");
    let cf = ClassFile::parse(&woven).unwrap();
    let interp = Interp {
        class: &cf,
        dispatcher: engine.dispatcher().as_ref(),
        dispatch_class: &engine.config().dispatch_class,
    };

    assert_eq!(interp.call("run"), Outcome::Returned(None));
    assert_eq!(handler.events(), vec!["job:before", "job:return"]);
}

#[test]
fn throwing_method_fires_on_throw_exactly_once_and_rethrows() {
    let (registry, weaver, dispatcher) = parts();
    let d = registry.register(&pointcut("app/Job", "boom", "job", None)).unwrap();
    let handler = Recording::new("job");
    dispatcher.register_handler("job", handler.clone());
    dispatcher.wire(&d);

    let mut builder = ClassBytesBuilder::new("app/Job");
    // aconst_null; athrow
    builder.method("boom", "()V", vec![0x01, 0xbf]);
    let bytes = builder.build();

    let (_keep, loader) = boot_loader();
    let TransformOutcome::Woven(woven) = weaver.transform(&loader, "app/Job", &bytes) else {
        panic!("expected woven output");
    };
    let cf = ClassFile::parse(&woven).unwrap();
    let config = EngineConfig::default();
    let interp = Interp {
        class: &cf,
        dispatcher: &dispatcher,
        dispatch_class: &config.dispatch_class,
    };

    // The appended handler runs the exit call once, then the exception
    // keeps propagating out of the method.
    assert_eq!(interp.call("boom"), Outcome::Threw);
    assert_eq!(handler.events(), vec!["job:before", "job:throw"]);
}

#[test]
fn throwing_method_without_a_throw_hook_still_releases_its_group() {
    let (registry, weaver, dispatcher) = parts();
    let mut spec = pointcut("app/Job", "boom", "job", Some("job"));
    spec.on_throw = false;
    let d = registry.register(&spec).unwrap();
    let handler = Recording::new("job");
    dispatcher.register_handler("job", handler.clone());
    dispatcher.wire(&d);

    let mut builder = ClassBytesBuilder::new("app/Job");
    builder.method("boom", "()V", vec![0x01, 0xbf]);
    let bytes = builder.build();

    let (_keep, loader) = boot_loader();
    let TransformOutcome::Woven(woven) = weaver.transform(&loader, "app/Job", &bytes) else {
        panic!("expected woven output");
    };
    let cf = ClassFile::parse(&woven).unwrap();
    let config = EngineConfig::default();
    let interp = Interp {
        class: &cf,
        dispatcher: &dispatcher,
        dispatch_class: &config.dispatch_class,
    };

    // Each top-level call must get a fresh activation: the woven throw
    // path pops the group even though the handler's throw hook is off.
    assert_eq!(interp.call("boom"), Outcome::Threw);
    assert_eq!(interp.call("boom"), Outcome::Threw);
    assert_eq!(handler.events(), vec!["job:before", "job:before"]);
}

#[test]
fn nesting_group_activates_once_across_a_delegating_chain() {
    let (registry, weaver, dispatcher) = parts();
    let outer = registry.register(&pointcut("app/Job", "run", "outer", Some("job"))).unwrap();
    let inner = registry.register(&pointcut("app/Job", "doRun", "inner", Some("job"))).unwrap();
    let outer_handler = Recording::new("outer");
    let inner_handler = Recording::new("inner");
    dispatcher.register_handler("outer", outer_handler.clone());
    dispatcher.register_handler("inner", inner_handler.clone());
    dispatcher.wire(&outer);
    dispatcher.wire(&inner);

    let mut builder = ClassBytesBuilder::new("app/Job");
    let delegate = builder.methodref("app/Job", "doRun", "()V");
    let [hi, lo] = delegate.to_be_bytes();
    builder.method("run", "()V", vec![0xb8, hi, lo, 0xb1]);
    builder.method("doRun", "()V", vec![0xb1]);
    let bytes = builder.build();

    let (_keep, loader) = boot_loader();
    let TransformOutcome::Woven(woven) = weaver.transform(&loader, "app/Job", &bytes) else {
        panic!("expected woven output");
    };
    let cf = ClassFile::parse(&woven).unwrap();
    let config = EngineConfig::default();
    let interp = Interp {
        class: &cf,
        dispatcher: &dispatcher,
        dispatch_class: &config.dispatch_class,
    };

    assert_eq!(interp.call("run"), Outcome::Returned(None));
    assert_eq!(outer_handler.events(), vec!["outer:before", "outer:return"]);
    assert!(inner_handler.events().is_empty());

    // A direct call to the inner method, outside the wrapper, is active.
    assert_eq!(interp.call("doRun"), Outcome::Returned(None));
    assert_eq!(inner_handler.events(), vec!["inner:before", "inner:return"]);
}

#[test]
fn overlapping_mixin_declarations_inject_once() {
    let (registry, weaver, _dispatcher) = parts();
    for target in ["app/*", "app/Target"] {
        let mixin = MixinSpec {
            target: target.into(),
            interface: "agent/HasCtx".into(),
            fields: vec![MixinField {
                name: "ctx".into(),
                descriptor: "Ljava/lang/Object;".into(),
            }],
        };
        registry.register_mixin(mixin.compile().unwrap()).unwrap();
    }

    let mut builder = ClassBytesBuilder::new("app/Target");
    builder.method("run", "()V", vec![0xb1]);
    let bytes = builder.build();

    let (_keep, loader) = boot_loader();
    let TransformOutcome::Woven(woven) = weaver.transform(&loader, "app/Target", &bytes) else {
        panic!("expected woven output");
    };
    let cf = ClassFile::parse(&woven).unwrap();
    assert_eq!(cf.interface_names().unwrap(), vec!["agent/HasCtx"]);
    assert_eq!(cf.fields.len(), 1);
}

#[test]
fn unmatched_class_passes_through_untouched() {
    let (registry, weaver, _dispatcher) = parts();
    registry.register(&pointcut("app/Elsewhere", "run", "x", None)).unwrap();

    let mut builder = ClassBytesBuilder::new("app/Job");
    builder.method("execute", "()V", vec![0xb1]);
    let bytes = builder.build();

    let (_keep, loader) = boot_loader();
    assert_eq!(weaver.transform(&loader, "app/Job", &bytes), TransformOutcome::Unchanged);
}

#[test]
fn weaving_the_same_bytes_twice_is_deterministic() {
    let (registry, weaver, _dispatcher) = parts();
    registry.register(&pointcut("app/Job", "run", "job", None)).unwrap();

    let mut builder = ClassBytesBuilder::new("app/Job");
    builder.method("run", "()V", vec![0xb1]);
    builder.method("other", "()V", vec![0xb1]);
    let bytes = builder.build();

    let (_keep, loader) = boot_loader();
    let first = weaver.transform(&loader, "app/Job", &bytes);
    let second = weaver.transform(&loader, "app/Job", &bytes);
    assert!(matches!(first, TransformOutcome::Woven(_)));
    assert_eq!(first, second);
}

struct GeneratedSource;

impl ClassByteSource for GeneratedSource {
    fn class_bytes(&self, class_name: &str) -> Option<Vec<u8>> {
        if !class_name.starts_with("gen/") {
            return None;
        }
        let mut builder = ClassBytesBuilder::new(class_name);
        builder.method("run", "()V", vec![0xb1]);
        Some(builder.build())
    }
    fn parent(&self) -> Option<LoaderRef> {
        None
    }
}

#[test]
fn hierarchy_cache_stays_bounded_and_agrees_after_eviction() {
    let source: Arc<dyn ClassByteSource> = Arc::new(GeneratedSource);
    let loader = LoaderRef::new(BOOTSTRAP_LOADER, &source);
    let cache = HierarchyCache::new(8);

    let cold = cache.resolve("gen/C0", &loader);
    for i in 0..100 {
        cache.resolve(&format!("gen/C{i}"), &loader);
    }
    assert!(cache.len() <= 8, "cache grew to {}", cache.len());

    let warm = cache.resolve("gen/C0", &loader);
    assert_eq!(warm.name, cold.name);
    assert_eq!(warm.super_names, cold.super_names);
    assert!(!warm.incomplete);
}
