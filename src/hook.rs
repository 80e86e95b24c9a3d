//! Host integration for load-time weaving.
//!
//! [`LoadHook`] is the surface the host's class-load callback talks to: it
//! takes the raw bytes, returns replacement bytes or `None`, and never
//! panics or errors across that boundary. [`initial_reweave`] handles the
//! other startup path, retransforming classes that were already resident
//! when the descriptors arrived.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::Engine;
use crate::hierarchy::LoaderRef;
use crate::weaver::TransformOutcome;

/// Host-side capability to retransform an already-loaded class.
pub trait Retransform {
    fn retransform(&self, class_name: &str) -> Result<(), String>;
}

pub struct LoadHook {
    engine: Arc<Engine>,
}

impl LoadHook {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Returns replacement bytes, or `None` to load the class unchanged.
    /// Total: every failure inside the engine degrades to `None`.
    pub fn transform(
        &self,
        loader: &LoaderRef,
        class_name: &str,
        bytes: &[u8],
    ) -> Option<Vec<u8>> {
        match self.engine.transform(loader, class_name, bytes) {
            TransformOutcome::Unchanged => None,
            TransformOutcome::Woven(bytes) => Some(bytes),
        }
    }
}

/// Requests a retransform of every already-loaded class the current
/// descriptors would touch. Individual failures are logged and skipped;
/// classes loaded from here on go through the load hook normally.
pub fn initial_reweave(
    engine: &Engine,
    retransform: &dyn Retransform,
    loaded_classes: &[&str],
) -> usize {
    let mut requested = 0;
    for class_name in loaded_classes {
        if !engine.is_weave_candidate(class_name) {
            continue;
        }
        match retransform.retransform(class_name) {
            Ok(()) => {
                requested += 1;
                debug!(class = class_name, "requested retransform");
            }
            Err(reason) => {
                warn!(class = class_name, %reason, "retransform failed");
            }
        }
    }
    requested
}
