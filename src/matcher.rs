//! The pointcut matcher: descriptor applicability per method.
//!
//! Matching is pure. Given the same analyzed class and registered
//! descriptors it always produces the same advisor set, so it can run
//! concurrently from any loader thread without coordination.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::analysis::{AnalyzedClass, AnalyzedMethod};
use crate::descriptor::AdviceDescriptor;
use crate::hierarchy::TypeHierarchy;

/// The ordered, deduplicated advisors matched for one method.
///
/// Ordering is ascending `order`, ties broken by registration sequence.
/// When several matched descriptors share a nesting group, only the first
/// stays active at this join point; the rest are dropped here so the woven
/// code never wires duplicate interception for one logical operation.
#[derive(Debug, Default)]
pub struct MatchedAdvisorSet {
    advisors: Vec<Arc<AdviceDescriptor>>,
}

impl MatchedAdvisorSet {
    /// Wraps advisors that are already ordered and deduplicated.
    pub(crate) fn from_sorted(advisors: Vec<Arc<AdviceDescriptor>>) -> Self {
        Self { advisors }
    }

    pub fn is_empty(&self) -> bool {
        self.advisors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.advisors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AdviceDescriptor>> {
        self.advisors.iter()
    }
}

/// Whether `descriptor` applies to the type itself, before any method-level
/// checks. Used both per method and for the weaver's class-level gate.
pub fn class_matches(descriptor: &AdviceDescriptor, hierarchy: &TypeHierarchy) -> bool {
    let name = hierarchy.name.as_ref();
    let name_hit = descriptor.class_pattern.matches(name)
        || (descriptor.include_subtypes
            && hierarchy.ancestors().any(|a| descriptor.class_pattern.matches(a)));
    if !name_hit {
        return false;
    }
    match &descriptor.sub_type_restriction {
        Some(restriction) => restriction.is_match(name),
        None => true,
    }
}

fn method_matches(descriptor: &AdviceDescriptor, method: &AnalyzedMethod) -> bool {
    descriptor.method_pattern.matches(&method.name)
        && descriptor.params.matches(&method.params)
        && descriptor
            .return_type
            .as_deref()
            .map_or(true, |rt| rt == method.return_type)
}

/// Matches one method against the candidate descriptors for its class.
///
/// `candidates` is the registry's per-class pre-filter output; the full
/// class pattern is still re-checked here because the pre-filter is only a
/// prefix discriminator.
pub fn match_method(
    class: &AnalyzedClass,
    method: &AnalyzedMethod,
    candidates: &[Arc<AdviceDescriptor>],
) -> MatchedAdvisorSet {
    let mut matched: Vec<Arc<AdviceDescriptor>> = candidates
        .iter()
        .filter(|d| class_matches(d, &class.hierarchy) && method_matches(d, method))
        .cloned()
        .collect();

    matched.sort_by_key(|d| (d.order, d.id));

    let mut seen_groups: FxHashSet<String> = FxHashSet::default();
    let mut advisors = Vec::with_capacity(matched.len());
    for d in matched {
        if let Some(group) = &d.nesting_group {
            if !seen_groups.insert(group.clone()) {
                continue;
            }
        }
        advisors.push(d);
    }
    MatchedAdvisorSet { advisors }
}
