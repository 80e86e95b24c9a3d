//! The class transformer.
//!
//! Every loaded compiled unit passes through [`Weaver::transform`]. Most
//! units match nothing; the thin snapshot decides that without a full parse
//! or any allocation beyond the snapshot itself. Units that might match get
//! the full analysis, per-method matching, and bytecode rewriting.
//!
//! A transform never fails outward. Any internal error (or panic) falls
//! back to the original bytes; the first occurrence of each distinct error
//! is logged at warn level, repeats at debug, so a hot-reload loop cannot
//! flood the log.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::analysis::AnalysisCache;
use crate::bytecode::{weave_method, DispatchRefs};
use crate::classfile::{ClassFile, CodeAttribute, RawAttribute};
use crate::config::EngineConfig;
use crate::error::TransformError;
use crate::hierarchy::{HierarchyCache, LoaderRef};
use crate::matcher::{match_method, MatchedAdvisorSet};
use crate::mixin::{apply_mixins, apply_shims};
use crate::registry::AdviceRegistry;
use crate::thin::ThinClass;

/// Classes verified with stack-map frames.
const FRAMES_MAJOR_VERSION: u16 = 50;

#[derive(Debug, PartialEq, Eq)]
pub enum TransformOutcome {
    /// Original bytes stand; the host keeps using them.
    Unchanged,
    Woven(Vec<u8>),
}

pub struct Weaver {
    registry: Arc<AdviceRegistry>,
    hierarchy: Arc<HierarchyCache>,
    analysis: Arc<AnalysisCache>,
    dispatch_class: String,
    member_prefix: String,
    logged_failures: Mutex<FxHashSet<(String, String)>>,
}

impl Weaver {
    pub fn new(
        registry: Arc<AdviceRegistry>,
        hierarchy: Arc<HierarchyCache>,
        analysis: Arc<AnalysisCache>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            hierarchy,
            analysis,
            dispatch_class: config.dispatch_class.clone(),
            member_prefix: config.injected_member_prefix.clone(),
            logged_failures: Mutex::new(FxHashSet::default()),
        }
    }

    /// Transforms one compiled unit. Never panics and never fails; any
    /// internal problem degrades to [`TransformOutcome::Unchanged`].
    pub fn transform(
        &self,
        loader: &LoaderRef,
        class_name: &str,
        bytes: &[u8],
    ) -> TransformOutcome {
        let result = catch_unwind(AssertUnwindSafe(|| self.try_transform(loader, class_name, bytes)));
        match result {
            Ok(Ok(Some(woven))) => TransformOutcome::Woven(woven),
            Ok(Ok(None)) => TransformOutcome::Unchanged,
            Ok(Err(err)) => {
                self.log_failure(class_name, &err);
                TransformOutcome::Unchanged
            }
            Err(_) => {
                self.log_failure(class_name, &TransformError::Panicked);
                TransformOutcome::Unchanged
            }
        }
    }

    fn try_transform(
        &self,
        loader: &LoaderRef,
        class_name: &str,
        bytes: &[u8],
    ) -> Result<Option<Vec<u8>>, TransformError> {
        if self.registry.is_empty() {
            return Ok(None);
        }

        let thin = ThinClass::parse(bytes)?;
        let candidates = self.registry.advisors_for_class(class_name);
        let mixins = self.registry.mixins_for_class(class_name);
        let shims = self.registry.shims_for_class(class_name);

        // Fast path: nothing here can possibly match.
        let any_method_name_hit = candidates.iter().any(|d| {
            thin.methods.iter().any(|m| d.method_pattern.matches(m.name))
        });
        if !any_method_name_hit && mixins.is_empty() && shims.is_empty() {
            return Ok(None);
        }

        let analyzed = self.analysis.get_or_analyze(&thin, loader, &self.hierarchy, &self.registry);
        let mut match_sets: FxHashMap<(String, String), MatchedAdvisorSet> = FxHashMap::default();
        for method in &analyzed.methods {
            let set = match_method(&analyzed, method, &candidates);
            if !set.is_empty() {
                match_sets.insert((method.name.clone(), method.descriptor.clone()), set);
            }
        }
        if match_sets.is_empty() && !analyzed.has_mixins() && !analyzed.has_shims() {
            return Ok(None);
        }

        let mut cf = ClassFile::parse(bytes)?;
        let needs_frames = cf.major_version >= FRAMES_MAJOR_VERSION;
        let mut modified = false;

        if !match_sets.is_empty() {
            let refs = DispatchRefs::intern(&mut cf.constant_pool, &self.dispatch_class)?;
            let appends_handler = match_sets
                .values()
                .any(|set| set.iter().any(|d| d.hooks.on_throw || d.hooks.on_before));
            if needs_frames && appends_handler {
                cf.constant_pool.intern_utf8("StackMapTable")?;
            }
            for i in 0..cf.methods.len() {
                let key = {
                    let m = &cf.methods[i];
                    (
                        m.name(&cf.constant_pool)?.to_string(),
                        m.descriptor(&cf.constant_pool)?.to_string(),
                    )
                };
                let Some(set) = match_sets.get(&key) else { continue };
                let Some(code_at) = cf.methods[i].code_attribute(&cf.constant_pool) else {
                    // Abstract and native methods have no body to weave.
                    debug!(class = class_name, method = %key.0, "matched method has no code");
                    continue;
                };
                let code =
                    CodeAttribute::parse(&cf.methods[i].attributes[code_at].info, &cf.constant_pool)?;
                let woven = weave_method(&code, &mut cf.constant_pool, &refs, set, needs_frames)?;
                let name_index = cf.methods[i].attributes[code_at].name_index;
                cf.methods[i].attributes[code_at] =
                    RawAttribute { name_index, info: woven.to_bytes() };
                modified = true;
            }
        }

        modified |= apply_mixins(&mut cf, &analyzed.mixins, &self.member_prefix)?;
        modified |= apply_shims(&mut cf, &analyzed.shims)?;

        if modified {
            Ok(Some(cf.to_bytes()))
        } else {
            Ok(None)
        }
    }

    fn log_failure(&self, class_name: &str, err: &TransformError) {
        let error = err.to_string();
        let first = self
            .logged_failures
            .lock()
            .insert((class_name.to_string(), error.clone()));
        if first {
            warn!(class = class_name, %error, "transform failed, passing class through");
        } else {
            debug!(class = class_name, %error, "transform failed, passing class through");
        }
    }
}
