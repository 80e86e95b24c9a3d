//! The advice descriptor registry.
//!
//! Catalogs register descriptor bundles here, at startup or later.
//! Descriptors are indexed by the leading path segment of their class
//! pattern's literal prefix, so the weaver's per-class lookup touches one
//! bucket plus the catch-all instead of scanning every descriptor.
//! Malformed items are rejected individually with a warning; the registry
//! keeps functioning with the rest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::descriptor::{
    AdviceDescriptor, DescriptorBundle, MixinDeclaration, PointcutSpec, ShimDeclaration,
};
use crate::error::DescriptorError;

#[derive(Default)]
struct Index {
    buckets: FxHashMap<String, Vec<Arc<AdviceDescriptor>>>,
    /// Wildcard-leading, alternated, and sub-type-matching descriptors:
    /// these can match names outside any literal bucket.
    catch_all: Vec<Arc<AdviceDescriptor>>,
    mixins: Vec<Arc<MixinDeclaration>>,
    shims: Vec<Arc<ShimDeclaration>>,
    next_id: u32,
}

/// Outcome of registering one bundle.
#[derive(Debug, Default)]
pub struct BundleReport {
    pub accepted: usize,
    pub rejected: usize,
}

pub struct AdviceRegistry {
    index: RwLock<Index>,
    /// Bumped on every successful registration; lets consumers notice late
    /// registration and trigger an initial reweave of resident classes.
    epoch: AtomicU64,
}

impl Default for AdviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdviceRegistry {
    pub fn new() -> Self {
        Self { index: RwLock::new(Index::default()), epoch: AtomicU64::new(0) }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Registers a single pointcut.
    ///
    /// Advisors that tie on `order` keep registration order, which for
    /// bundle input is the catalog list order: deterministic for a fixed
    /// catalog set, but a reordering of catalogs reorders the tie-break.
    pub fn register(&self, spec: &PointcutSpec) -> Result<Arc<AdviceDescriptor>, DescriptorError> {
        let mut index = self.index.write();
        let descriptor = Arc::new(spec.compile(index.next_id)?);
        index.next_id += 1;

        let bucket_key = if descriptor.include_subtypes {
            // Sub-type matches land on names unrelated to the pattern text.
            None
        } else {
            // Bucket only on a complete first segment. A prefix cut mid
            // segment ("org" from "org*") would miss classes like
            // "orgfoo/X", whose lookup segment is "orgfoo".
            descriptor
                .class_pattern
                .literal_prefix()
                .filter(|p| p.contains('/'))
                .map(first_segment)
        };
        match bucket_key {
            Some(key) => index.buckets.entry(key).or_default().push(descriptor.clone()),
            None => index.catch_all.push(descriptor.clone()),
        }
        drop(index);
        self.bump_epoch();
        Ok(descriptor)
    }

    pub fn register_mixin(
        &self,
        mixin: MixinDeclaration,
    ) -> Result<Arc<MixinDeclaration>, DescriptorError> {
        let mut index = self.index.write();
        if let Some(existing) = index.mixins.iter().find(|m| m.interface == mixin.interface) {
            let same_fields = existing.fields.len() == mixin.fields.len()
                && existing
                    .fields
                    .iter()
                    .zip(&mixin.fields)
                    .all(|(a, b)| a.name == b.name && a.descriptor == b.descriptor);
            if !same_fields {
                return Err(DescriptorError::ConflictingMixin {
                    interface: mixin.interface.clone(),
                    target: mixin.target.source().to_string(),
                });
            }
        }
        let mixin = Arc::new(mixin);
        index.mixins.push(mixin.clone());
        drop(index);
        self.bump_epoch();
        Ok(mixin)
    }

    pub fn register_shim(&self, shim: ShimDeclaration) -> Arc<ShimDeclaration> {
        let shim = Arc::new(shim);
        self.index.write().shims.push(shim.clone());
        self.bump_epoch();
        shim
    }

    /// Registers everything in a bundle, rejecting malformed items
    /// individually.
    pub fn register_bundle(&self, bundle: &DescriptorBundle) -> BundleReport {
        let mut report = BundleReport::default();
        for spec in &bundle.pointcuts {
            match self.register(spec) {
                Ok(_) => report.accepted += 1,
                Err(err) => {
                    report.rejected += 1;
                    warn!(bundle = %bundle.id, class = %spec.class_name, %err,
                          "rejected pointcut");
                }
            }
        }
        for spec in &bundle.mixins {
            let compiled = spec.compile().and_then(|m| self.register_mixin(m));
            match compiled {
                Ok(_) => report.accepted += 1,
                Err(err) => {
                    report.rejected += 1;
                    warn!(bundle = %bundle.id, target = %spec.target, %err, "rejected mixin");
                }
            }
        }
        for spec in &bundle.shims {
            match spec.compile() {
                Ok(s) => {
                    self.register_shim(s);
                    report.accepted += 1;
                }
                Err(err) => {
                    report.rejected += 1;
                    warn!(bundle = %bundle.id, target = %spec.target, %err, "rejected shim");
                }
            }
        }
        report
    }

    /// All descriptors whose class pattern could match `class_name`,
    /// unfiltered (the matcher applies the full pattern per method).
    pub fn advisors_for_class(&self, class_name: &str) -> Vec<Arc<AdviceDescriptor>> {
        let index = self.index.read();
        let mut out: Vec<Arc<AdviceDescriptor>> = Vec::new();
        if let Some(bucket) = index.buckets.get(&first_segment(class_name)) {
            out.extend(
                bucket
                    .iter()
                    .filter(|d| {
                        d.class_pattern
                            .literal_prefix()
                            .map_or(true, |p| class_name.starts_with(p))
                    })
                    .cloned(),
            );
        }
        out.extend(index.catch_all.iter().cloned());
        out
    }

    /// Every registered descriptor, in registration order.
    pub fn all_advisors(&self) -> Vec<Arc<AdviceDescriptor>> {
        let index = self.index.read();
        let mut out: Vec<Arc<AdviceDescriptor>> =
            index.buckets.values().flatten().cloned().collect();
        out.extend(index.catch_all.iter().cloned());
        out.sort_by_key(|d| d.id);
        out
    }

    pub fn mixins_for_class(&self, class_name: &str) -> Vec<Arc<MixinDeclaration>> {
        self.index
            .read()
            .mixins
            .iter()
            .filter(|m| m.target.matches(class_name))
            .cloned()
            .collect()
    }

    pub fn shims_for_class(&self, class_name: &str) -> Vec<Arc<ShimDeclaration>> {
        self.index
            .read()
            .shims
            .iter()
            .filter(|s| s.target.matches(class_name))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        let index = self.index.read();
        index.buckets.is_empty()
            && index.catch_all.is_empty()
            && index.mixins.is_empty()
            && index.shims.is_empty()
    }
}

fn first_segment(name: &str) -> String {
    match name.find('/') {
        Some(pos) => name[..pos].to_string(),
        None => name.to_string(),
    }
}
