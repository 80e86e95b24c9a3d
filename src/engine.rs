//! Engine assembly and bootstrap ordering.
//!
//! The engine is an explicit context object built once at startup and
//! handed to everything that needs it; there is no process-global state.
//! Before the host's load hook is installed, [`Engine::bootstrap`] forces
//! the loading of a fixed closure of types the woven code and the engine
//! itself touch, because first-touching them from inside the hook can
//! deadlock the loader. A bootstrap failure is the one fatal startup error;
//! everything after that degrades instead of failing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::analysis::AnalysisCache;
use crate::config::EngineConfig;
use crate::descriptor::DescriptorBundle;
use crate::dispatch::{AdviceHandler, Dispatcher};
use crate::error::EngineError;
use crate::hierarchy::{HierarchyCache, LoaderRef};
use crate::registry::{AdviceRegistry, BundleReport};
use crate::weaver::{TransformOutcome, Weaver};

/// Types that must be resident before the load hook goes in. Touching any
/// of these for the first time from inside the hook recurses into class
/// loading. Maintained by hand; extend it when a new runtime dependency
/// shows up in a bootstrap deadlock.
pub const BOOTSTRAP_PRELOAD: &[&str] = &[
    "java/lang/Throwable",
    "java/lang/ThreadLocal",
    "java/util/concurrent/ConcurrentHashMap",
    "java/util/concurrent/atomic/AtomicBoolean",
    "java/util/concurrent/locks/ReentrantReadWriteLock",
];

/// Host-side capability to force-load a class by name, used only during
/// bootstrap.
pub trait ClassPreloader {
    fn preload(&self, class_name: &str) -> Result<(), String>;
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<AdviceRegistry>,
    hierarchy: Arc<HierarchyCache>,
    analysis: Arc<AnalysisCache>,
    dispatcher: Arc<Dispatcher>,
    weaver: Weaver,
    /// Health signal. When false, every transform and dispatch is a
    /// complete no-op; partial operation is worse than none.
    weaving_ok: AtomicBool,
    started: AtomicBool,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AdviceRegistry> {
        &self.registry
    }

    pub fn hierarchy(&self) -> &Arc<HierarchyCache> {
        &self.hierarchy
    }

    pub fn analysis(&self) -> &Arc<AnalysisCache> {
        &self.analysis
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn weaving_ok(&self) -> bool {
        self.weaving_ok.load(Ordering::Acquire)
    }

    /// Forces the engine's dependency closure (plus the dispatch class)
    /// resident. Must run exactly once, before the load hook is installed.
    pub fn bootstrap(&self, preloader: &dyn ClassPreloader) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyStarted);
        }
        for class in BOOTSTRAP_PRELOAD.iter().copied().chain([self.config.dispatch_class.as_str()])
        {
            if let Err(reason) = preloader.preload(class) {
                self.weaving_ok.store(false, Ordering::Release);
                return Err(EngineError::Bootstrap { class: class.to_string(), reason });
            }
        }
        self.weaving_ok.store(true, Ordering::Release);
        info!(preloaded = BOOTSTRAP_PRELOAD.len() + 1, "weaving engine started");
        Ok(())
    }

    /// The load-hook entry point. A stopped or failed engine passes every
    /// class through untouched.
    pub fn transform(
        &self,
        loader: &LoaderRef,
        class_name: &str,
        bytes: &[u8],
    ) -> TransformOutcome {
        if !self.weaving_ok() {
            return TransformOutcome::Unchanged;
        }
        self.weaver.transform(loader, class_name, bytes)
    }

    /// Late registration for classes loaded after startup. The caller is
    /// responsible for triggering a reweave of already-resident classes.
    pub fn register_bundle(&self, bundle: &DescriptorBundle) -> BundleReport {
        let report = self.registry.register_bundle(bundle);
        self.dispatcher.sync(&self.registry);
        report
    }

    /// Whether a resident class would be rewritten under the current
    /// descriptors, used to pick retransform candidates.
    pub fn is_weave_candidate(&self, class_name: &str) -> bool {
        !self.registry.advisors_for_class(class_name).is_empty()
            || !self.registry.mixins_for_class(class_name).is_empty()
            || !self.registry.shims_for_class(class_name).is_empty()
    }
}

#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    bundles: Vec<DescriptorBundle>,
    handlers: Vec<(String, Arc<dyn AdviceHandler>)>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bundle(mut self, bundle: DescriptorBundle) -> Self {
        self.bundles.push(bundle);
        self
    }

    pub fn handler(mut self, advice_key: &str, handler: Arc<dyn AdviceHandler>) -> Self {
        self.handlers.push((advice_key.to_string(), handler));
        self
    }

    pub fn build(self) -> Engine {
        let registry = Arc::new(AdviceRegistry::new());
        let hierarchy = Arc::new(HierarchyCache::new(self.config.hierarchy_cache_capacity));
        let analysis = Arc::new(AnalysisCache::new(self.config.analysis_cache_capacity));
        let dispatcher = Arc::new(Dispatcher::new());

        for (key, handler) in self.handlers {
            dispatcher.register_handler(&key, handler);
        }
        for bundle in &self.bundles {
            let report = registry.register_bundle(bundle);
            if report.rejected > 0 {
                warn!(
                    bundle = %bundle.id,
                    accepted = report.accepted,
                    rejected = report.rejected,
                    "bundle registered with rejections"
                );
            }
        }
        dispatcher.sync(&registry);

        let weaver = Weaver::new(
            registry.clone(),
            hierarchy.clone(),
            analysis.clone(),
            &self.config,
        );
        Engine {
            config: self.config,
            registry,
            hierarchy,
            analysis,
            dispatcher,
            weaver,
            weaving_ok: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{ClassByteSource, BOOTSTRAP_LOADER};
    use parking_lot::Mutex;

    struct EmptySource;
    impl ClassByteSource for EmptySource {
        fn class_bytes(&self, _: &str) -> Option<Vec<u8>> {
            None
        }
        fn parent(&self) -> Option<LoaderRef> {
            None
        }
    }

    struct RecordingPreloader {
        loaded: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl ClassPreloader for RecordingPreloader {
        fn preload(&self, class_name: &str) -> Result<(), String> {
            if self.fail_on == Some(class_name) {
                return Err("not found".to_string());
            }
            self.loaded.lock().push(class_name.to_string());
            Ok(())
        }
    }

    #[test]
    fn bootstrap_preloads_closure_and_enables_weaving() {
        let engine = Engine::builder().build();
        let preloader = RecordingPreloader { loaded: Mutex::new(Vec::new()), fail_on: None };
        assert!(!engine.weaving_ok());
        engine.bootstrap(&preloader).unwrap();
        assert!(engine.weaving_ok());
        let loaded = preloader.loaded.lock().clone();
        assert!(loaded.contains(&"java/lang/Throwable".to_string()));
        assert!(loaded.contains(&EngineConfig::default().dispatch_class));
    }

    #[test]
    fn bootstrap_failure_is_fatal_and_disables_weaving() {
        let engine = Engine::builder().build();
        let preloader = RecordingPreloader {
            loaded: Mutex::new(Vec::new()),
            fail_on: Some("java/lang/ThreadLocal"),
        };
        let err = engine.bootstrap(&preloader);
        assert!(matches!(err, Err(EngineError::Bootstrap { .. })));
        assert!(!engine.weaving_ok());

        // A failed engine must behave as a complete no-op.
        let source: Arc<dyn ClassByteSource> = Arc::new(EmptySource);
        let loader = LoaderRef::new(BOOTSTRAP_LOADER, &source);
        assert_eq!(
            engine.transform(&loader, "app/Anything", &[0xCA, 0xFE, 0xBA, 0xBE]),
            TransformOutcome::Unchanged
        );
    }

    #[test]
    fn bootstrap_runs_once() {
        let engine = Engine::builder().build();
        let preloader = RecordingPreloader { loaded: Mutex::new(Vec::new()), fail_on: None };
        engine.bootstrap(&preloader).unwrap();
        assert!(matches!(engine.bootstrap(&preloader), Err(EngineError::AlreadyStarted)));
    }

    #[test]
    fn late_bundles_reach_matching() {
        let engine = Engine::builder().build();
        let preloader = RecordingPreloader { loaded: Mutex::new(Vec::new()), fail_on: None };
        engine.bootstrap(&preloader).unwrap();

        assert!(!engine.is_weave_candidate("app/Target"));
        let bundle = DescriptorBundle::from_json(
            r#"{
                "id": "late",
                "pointcuts": [
                    {"class_name": "app/Target", "method_name": "run", "advice": "late:run"}
                ]
            }"#,
        )
        .unwrap();
        let report = engine.register_bundle(&bundle);
        assert_eq!(report.accepted, 1);
        assert!(engine.is_weave_candidate("app/Target"));
    }
}
