//! Full class analysis: the cached structural snapshot the matcher works on.
//!
//! An [`AnalyzedClass`] is built lazily from a thin snapshot plus hierarchy
//! resolution the first time a compiled unit gets past the fast path, and
//! reused for every later lookup of the same (class, loader) key. Snapshots
//! embed the registry epoch they were built against, so late descriptor
//! registration invalidates them instead of serving stale applicability.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::descriptor::{MixinDeclaration, ShimDeclaration};
use crate::hierarchy::{HierarchyCache, Key, LoaderRef, TwoGen, TypeHierarchy};
use crate::pattern::parse_method_descriptor;
use crate::registry::AdviceRegistry;
use crate::thin::ThinClass;

#[derive(Debug, Clone)]
pub struct AnalyzedMethod {
    pub access_flags: u16,
    pub name: String,
    pub descriptor: String,
    /// Friendly parameter type names parsed from the descriptor.
    pub params: Vec<String>,
    pub return_type: String,
}

/// Cached structural snapshot of one compiled unit.
pub struct AnalyzedClass {
    pub name: Arc<str>,
    pub access_flags: u16,
    pub hierarchy: Arc<TypeHierarchy>,
    pub methods: Vec<AnalyzedMethod>,
    /// Mixin declarations whose target pattern matches this type.
    pub mixins: Vec<Arc<MixinDeclaration>>,
    /// Shim declarations whose target pattern matches this type.
    pub shims: Vec<Arc<ShimDeclaration>>,
    /// Registry epoch this snapshot was built against.
    pub epoch: u64,
}

impl AnalyzedClass {
    pub fn has_mixins(&self) -> bool {
        !self.mixins.is_empty()
    }

    pub fn has_shims(&self) -> bool {
        !self.shims.is_empty()
    }
}

pub struct AnalysisCache {
    entries: Mutex<TwoGen<Arc<AnalyzedClass>>>,
    inflight: DashMap<Key, Arc<OnceCell<Arc<AnalyzedClass>>>>,
}

impl AnalysisCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(TwoGen::new(capacity)), inflight: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the snapshot for (thin.name, loader), building it at most
    /// once concurrently per key. A snapshot built against an older registry
    /// epoch is discarded and rebuilt.
    pub fn get_or_analyze(
        &self,
        thin: &ThinClass<'_>,
        loader: &LoaderRef,
        hierarchy: &HierarchyCache,
        registry: &AdviceRegistry,
    ) -> Arc<AnalyzedClass> {
        let key: Key = (Arc::from(thin.name), loader.id());
        let epoch = registry.epoch();

        if let Some(hit) = self.entries.lock().get(&key) {
            if hit.epoch == epoch {
                return hit;
            }
        }

        let cell = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let built = cell
            .get_or_init(|| Arc::new(analyze(thin, loader, hierarchy, registry, epoch)))
            .clone();
        self.inflight.remove(&key);

        // A concurrent initializer may have raced a registration; only cache
        // snapshots that are still current.
        if built.epoch == epoch {
            self.entries.lock().insert(key, built.clone());
            built
        } else {
            Arc::new(analyze(thin, loader, hierarchy, registry, registry.epoch()))
        }
    }
}

fn analyze(
    thin: &ThinClass<'_>,
    loader: &LoaderRef,
    hierarchy: &HierarchyCache,
    registry: &AdviceRegistry,
    epoch: u64,
) -> AnalyzedClass {
    let resolved = hierarchy.resolve(thin.name, loader);

    let mut methods = Vec::with_capacity(thin.methods.len());
    for m in &thin.methods {
        // Methods with malformed descriptors are unmatchable, not fatal.
        if let Ok((params, return_type)) = parse_method_descriptor(m.descriptor) {
            methods.push(AnalyzedMethod {
                access_flags: m.access_flags,
                name: m.name.to_string(),
                descriptor: m.descriptor.to_string(),
                params,
                return_type,
            });
        }
    }

    AnalyzedClass {
        name: Arc::from(thin.name),
        access_flags: thin.access_flags,
        hierarchy: resolved,
        methods,
        mixins: registry.mixins_for_class(thin.name),
        shims: registry.shims_for_class(thin.name),
        epoch,
    }
}
