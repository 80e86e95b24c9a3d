//! Type-hierarchy resolution and the (class, loader) hierarchy cache.
//!
//! Resolution walks super-types and interfaces across loader boundaries
//! using parent-delegation semantics, reading only byte streams the loaders
//! already have. The cache is process-wide, read-mostly, bounded, and owns
//! its entries; it holds loaders only by [`Weak`] back-reference so a cache
//! entry can never pin a transient loader in memory. Entries for a collected
//! loader are never promoted again and fall out under the capacity bound.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::thin::ThinClass;

pub type LoaderId = u64;

/// Identity of the bootstrap loader.
pub const BOOTSTRAP_LOADER: LoaderId = 0;

/// Supplies raw class bytes for hierarchy analysis. Implemented by the host
/// integration per loader; `parent` models standard parent delegation.
pub trait ClassByteSource: Send + Sync {
    fn class_bytes(&self, internal_name: &str) -> Option<Vec<u8>>;
    fn parent(&self) -> Option<LoaderRef>;
}

/// A non-owning handle to one class loader.
#[derive(Clone)]
pub struct LoaderRef {
    id: LoaderId,
    source: Weak<dyn ClassByteSource>,
}

impl LoaderRef {
    pub fn new(id: LoaderId, source: &Arc<dyn ClassByteSource>) -> Self {
        Self { id, source: Arc::downgrade(source) }
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Arc<dyn ClassByteSource>> {
        self.source.upgrade()
    }
}

impl std::fmt::Debug for LoaderRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderRef").field("id", &self.id).finish()
    }
}

/// Ordered ancestor/interface chain for one (class, loader) pair.
#[derive(Debug)]
pub struct TypeHierarchy {
    pub name: Arc<str>,
    /// Super classes, nearest first, ending at `java/lang/Object` when the
    /// chain resolved completely.
    pub super_names: Vec<Arc<str>>,
    /// Transitively implemented interfaces, declaration order, deduplicated.
    pub interface_names: Vec<Arc<str>>,
    /// Set when some ancestor could not be resolved (missing bytes, parse
    /// failure, collected loader, or a resolution cycle).
    pub incomplete: bool,
}

impl TypeHierarchy {
    fn unresolved(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            super_names: Vec::new(),
            interface_names: Vec::new(),
            incomplete: true,
        }
    }

    /// All ancestor names: supers first, then interfaces.
    pub fn ancestors(&self) -> impl Iterator<Item = &str> {
        self.super_names
            .iter()
            .map(|s| s.as_ref())
            .chain(self.interface_names.iter().map(|s| s.as_ref()))
    }

    /// Whether this type is `name` or has `name` anywhere in its chain.
    pub fn is_sub_type_of(&self, name: &str) -> bool {
        self.name.as_ref() == name || self.ancestors().any(|a| a == name)
    }
}

/// A (class name, loader identity) cache key.
pub(crate) type Key = (Arc<str>, LoaderId);

/// Bounded two-generation map: when the hot generation fills, it becomes the
/// cold one and the previous cold generation is dropped. Lookups promote
/// cold hits. Total residency is at most `capacity` entries.
pub(crate) struct TwoGen<V> {
    hot: FxHashMap<Key, V>,
    cold: FxHashMap<Key, V>,
    half: usize,
}

impl<V: Clone> TwoGen<V> {
    pub(crate) fn new(capacity: usize) -> Self {
        let half = (capacity / 2).max(1);
        Self { hot: FxHashMap::default(), cold: FxHashMap::default(), half }
    }

    pub(crate) fn get(&mut self, key: &Key) -> Option<V> {
        if let Some(v) = self.hot.get(key) {
            return Some(v.clone());
        }
        if let Some(v) = self.cold.remove(key) {
            self.insert(key.clone(), v.clone());
            return Some(v);
        }
        None
    }

    pub(crate) fn insert(&mut self, key: Key, value: V) {
        if self.hot.len() >= self.half {
            self.cold = std::mem::take(&mut self.hot);
        }
        self.hot.insert(key, value);
    }

    pub(crate) fn len(&self) -> usize {
        self.hot.len() + self.cold.len()
    }
}

thread_local! {
    // Keys currently being resolved on this thread; re-entrant resolution of
    // the same key yields "no further ancestors" instead of recursing.
    static IN_PROGRESS: std::cell::RefCell<Vec<Key>> = std::cell::RefCell::new(Vec::new());
}

pub struct HierarchyCache {
    entries: Mutex<TwoGen<Arc<TypeHierarchy>>>,
    inflight: DashMap<Key, Arc<OnceCell<Arc<TypeHierarchy>>>>,
}

impl HierarchyCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(TwoGen::new(capacity)), inflight: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the ancestor/interface chain for `name` as seen by `loader`.
    ///
    /// First-time analysis of a key is single-flight: concurrent calls for
    /// the same (class, loader) block on one computation. Unresolvable
    /// ancestors degrade to an incomplete chain; this never fails.
    pub fn resolve(&self, name: &str, loader: &LoaderRef) -> Arc<TypeHierarchy> {
        let key: Key = (Arc::from(name), loader.id());

        if let Some(hit) = self.entries.lock().get(&key) {
            return hit;
        }

        // Cycle guard before the single-flight cell: re-entering the cell
        // for a key this thread is already computing would self-deadlock.
        let cycling = IN_PROGRESS.with(|s| s.borrow().contains(&key));
        if cycling {
            debug!(class = name, "hierarchy resolution cycle, treating as no ancestors");
            return Arc::new(TypeHierarchy::unresolved(name));
        }

        // Nested ancestor resolution never waits on another thread's cell.
        // With mutually circular input, two threads can each claim one key
        // of the cycle and block on the other's forever; recomputing an
        // ancestor is cheap next to that.
        let nested = IN_PROGRESS.with(|s| !s.borrow().is_empty());
        if nested {
            let finished =
                self.inflight.get(&key).and_then(|cell| cell.get().cloned());
            let resolved = match finished {
                Some(done) => done,
                None => self.compute_guarded(&key, name, loader),
            };
            self.entries.lock().insert(key, resolved.clone());
            return resolved;
        }

        let cell = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let resolved = cell.get_or_init(|| self.compute_guarded(&key, name, loader)).clone();
        self.entries.lock().insert(key.clone(), resolved.clone());
        self.inflight.remove(&key);
        resolved
    }

    fn compute_guarded(&self, key: &Key, name: &str, loader: &LoaderRef) -> Arc<TypeHierarchy> {
        IN_PROGRESS.with(|s| s.borrow_mut().push(key.clone()));
        let result = Arc::new(self.compute(name, loader));
        IN_PROGRESS.with(|s| {
            let mut s = s.borrow_mut();
            if let Some(pos) = s.iter().position(|k| k == key) {
                s.remove(pos);
            }
        });
        result
    }

    fn compute(&self, name: &str, loader: &LoaderRef) -> TypeHierarchy {
        let Some(bytes) = find_class_bytes(loader, name) else {
            debug!(class = name, loader = loader.id(), "ancestor bytes not found");
            return TypeHierarchy::unresolved(name);
        };
        let thin = match ThinClass::parse(&bytes) {
            Ok(t) => t,
            Err(err) => {
                debug!(class = name, %err, "ancestor parse failed");
                return TypeHierarchy::unresolved(name);
            }
        };

        let mut super_names: Vec<Arc<str>> = Vec::new();
        let mut interface_names: Vec<Arc<str>> = Vec::new();
        let mut incomplete = false;

        if let Some(super_name) = thin.super_name {
            super_names.push(Arc::from(super_name));
            if super_name != "java/lang/Object" {
                let parent = self.resolve(super_name, loader);
                incomplete |= parent.incomplete;
                super_names.extend(parent.super_names.iter().cloned());
                interface_names.extend(parent.interface_names.iter().cloned());
            }
        }
        for iface in &thin.interfaces {
            push_unique(&mut interface_names, Arc::from(*iface));
            let parent = self.resolve(iface, loader);
            incomplete |= parent.incomplete;
            // An interface's "supers" are further interfaces.
            for inherited in parent.ancestors() {
                if inherited != "java/lang/Object" {
                    push_unique(&mut interface_names, Arc::from(inherited));
                }
            }
        }

        TypeHierarchy { name: Arc::from(name), super_names, interface_names, incomplete }
    }
}

fn push_unique(names: &mut Vec<Arc<str>>, name: Arc<str>) {
    if !names.iter().any(|n| *n == name) {
        names.push(name);
    }
}

/// Standard parent-delegation lookup: ask the ancestor-most loader first.
/// Iterative so pathological delegation chains cannot exhaust the stack.
fn find_class_bytes(loader: &LoaderRef, name: &str) -> Option<Vec<u8>> {
    let mut chain = Vec::new();
    let mut current = Some(loader.clone());
    while let Some(l) = current {
        let Some(source) = l.upgrade() else { break };
        current = source.parent();
        chain.push(source);
        if chain.len() > 64 {
            break; // delegation cycle, give up
        }
    }
    for source in chain.iter().rev() {
        if let Some(bytes) = source.class_bytes(name) {
            return Some(bytes);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;

    struct MapSource {
        classes: PlMutex<HashMap<String, Vec<u8>>>,
        parent: Option<LoaderRef>,
    }

    impl ClassByteSource for MapSource {
        fn class_bytes(&self, name: &str) -> Option<Vec<u8>> {
            self.classes.lock().get(name).cloned()
        }
        fn parent(&self) -> Option<LoaderRef> {
            self.parent.clone()
        }
    }

    fn loader(
        id: LoaderId,
        classes: &[(&str, Vec<u8>)],
        parent: Option<LoaderRef>,
    ) -> (Arc<dyn ClassByteSource>, LoaderRef) {
        let source: Arc<dyn ClassByteSource> = Arc::new(MapSource {
            classes: PlMutex::new(
                classes.iter().map(|(n, b)| (n.to_string(), b.clone())).collect(),
            ),
            parent,
        });
        let r = LoaderRef::new(id, &source);
        (source, r)
    }

    fn class_bytes(name: &str, super_name: &str, interfaces: &[&str]) -> Vec<u8> {
        // Hand-rolled minimal class file with the given names.
        let mut cp: Vec<Vec<u8>> = Vec::new();
        let mut utf8 = |s: &str| -> u16 {
            let mut e = vec![1u8];
            e.extend_from_slice(&(s.len() as u16).to_be_bytes());
            e.extend_from_slice(s.as_bytes());
            cp.push(e);
            cp.len() as u16
        };
        let n_this = utf8(name);
        let n_super = utf8(super_name);
        let n_ifaces: Vec<u16> = interfaces.iter().map(|i| utf8(i)).collect();
        let mut class = |n: u16| -> u16 {
            let mut e = vec![7u8];
            e.extend_from_slice(&n.to_be_bytes());
            cp.push(e);
            cp.len() as u16
        };
        let c_this = class(n_this);
        let c_super = class(n_super);
        let c_ifaces: Vec<u16> = n_ifaces.iter().map(|&n| class(n)).collect();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xCAFEBABE_u32.to_be_bytes());
        bytes.extend_from_slice(&0_u16.to_be_bytes());
        bytes.extend_from_slice(&52_u16.to_be_bytes());
        bytes.extend_from_slice(&((cp.len() + 1) as u16).to_be_bytes());
        for e in &cp {
            bytes.extend_from_slice(e);
        }
        bytes.extend_from_slice(&0x0021_u16.to_be_bytes());
        bytes.extend_from_slice(&c_this.to_be_bytes());
        bytes.extend_from_slice(&c_super.to_be_bytes());
        bytes.extend_from_slice(&(c_ifaces.len() as u16).to_be_bytes());
        for c in &c_ifaces {
            bytes.extend_from_slice(&c.to_be_bytes());
        }
        for _ in 0..3 {
            bytes.extend_from_slice(&0_u16.to_be_bytes());
        }
        bytes
    }

    #[test]
    fn resolves_super_and_interface_chain() {
        let (_keep, boot) = loader(
            BOOTSTRAP_LOADER,
            &[
                ("app/Base", class_bytes("app/Base", "java/lang/Object", &["app/Marker"])),
                ("app/Impl", class_bytes("app/Impl", "app/Base", &["app/Extra"])),
                ("app/Marker", class_bytes("app/Marker", "java/lang/Object", &[])),
                ("app/Extra", class_bytes("app/Extra", "java/lang/Object", &["app/Marker"])),
            ],
            None,
        );
        let cache = HierarchyCache::new(16);
        let h = cache.resolve("app/Impl", &boot);
        assert_eq!(
            h.super_names.iter().map(|s| s.as_ref()).collect::<Vec<_>>(),
            vec!["app/Base", "java/lang/Object"]
        );
        assert!(h.interface_names.iter().any(|i| i.as_ref() == "app/Marker"));
        assert!(h.interface_names.iter().any(|i| i.as_ref() == "app/Extra"));
        assert!(h.is_sub_type_of("app/Base"));
        assert!(h.is_sub_type_of("app/Marker"));
        assert!(!h.incomplete);
    }

    #[test]
    fn cold_and_warm_resolution_agree() {
        let (_keep, boot) = loader(
            BOOTSTRAP_LOADER,
            &[("app/A", class_bytes("app/A", "java/lang/Object", &[]))],
            None,
        );
        let cache = HierarchyCache::new(16);
        let cold: Vec<String> =
            cache.resolve("app/A", &boot).ancestors().map(String::from).collect();
        let warm: Vec<String> =
            cache.resolve("app/A", &boot).ancestors().map(String::from).collect();
        assert_eq!(cold, warm);
    }

    #[test]
    fn parent_delegation_wins() {
        let (keep_parent, parent) = loader(
            1,
            &[("app/Dup", class_bytes("app/Dup", "java/lang/Object", &["app/FromParent"]))],
            None,
        );
        let (_keep_child, child) = loader(
            2,
            &[("app/Dup", class_bytes("app/Dup", "java/lang/Object", &["app/FromChild"]))],
            Some(parent),
        );
        let cache = HierarchyCache::new(16);
        let h = cache.resolve("app/Dup", &child);
        assert!(h.interface_names.iter().any(|i| i.as_ref() == "app/FromParent"));
        drop(keep_parent);
    }

    #[test]
    fn missing_ancestor_degrades_not_panics() {
        let (_keep, boot) = loader(
            BOOTSTRAP_LOADER,
            &[("app/Orphan", class_bytes("app/Orphan", "gone/Super", &[]))],
            None,
        );
        let cache = HierarchyCache::new(16);
        let h = cache.resolve("app/Orphan", &boot);
        assert!(h.incomplete);
        assert!(h.is_sub_type_of("gone/Super")); // direct super is still known
    }

    #[test]
    fn cyclic_hierarchy_terminates() {
        let (_keep, boot) = loader(
            BOOTSTRAP_LOADER,
            &[
                ("app/A", class_bytes("app/A", "app/B", &[])),
                ("app/B", class_bytes("app/B", "app/A", &[])),
            ],
            None,
        );
        let cache = HierarchyCache::new(16);
        let h = cache.resolve("app/A", &boot);
        assert!(h.is_sub_type_of("app/B"));
    }

    #[test]
    fn concurrent_circular_resolution_terminates() {
        // Two threads start at opposite ends of a super-type cycle. Each
        // claims its own key; neither may wait on the other's.
        let (_keep, boot) = loader(
            BOOTSTRAP_LOADER,
            &[
                ("app/A", class_bytes("app/A", "app/B", &[])),
                ("app/B", class_bytes("app/B", "app/A", &[])),
            ],
            None,
        );
        let cache = Arc::new(HierarchyCache::new(16));
        let handles: Vec<_> = ["app/A", "app/B"]
            .into_iter()
            .map(|name| {
                let cache = cache.clone();
                let boot = boot.clone();
                std::thread::spawn(move || cache.resolve(name, &boot))
            })
            .collect();
        for handle in handles {
            let h = handle.join().unwrap();
            assert!(h.is_sub_type_of("app/A"));
            assert!(h.is_sub_type_of("app/B"));
        }
    }

    #[test]
    fn capacity_bounds_residency() {
        let classes: Vec<(String, Vec<u8>)> = (0..100)
            .map(|i| {
                let name = format!("app/C{i}");
                let bytes = class_bytes(&name, "java/lang/Object", &[]);
                (name, bytes)
            })
            .collect();
        let refs: Vec<(&str, Vec<u8>)> =
            classes.iter().map(|(n, b)| (n.as_str(), b.clone())).collect();
        let (_keep, boot) = loader(BOOTSTRAP_LOADER, &refs, None);

        let cache = HierarchyCache::new(10);
        for (name, _) in &classes {
            cache.resolve(name, &boot);
        }
        assert!(cache.len() <= 10);
    }

    #[test]
    fn collected_loader_degrades() {
        let (source, r) = loader(5, &[], None);
        drop(source);
        let cache = HierarchyCache::new(4);
        let h = cache.resolve("app/Gone", &r);
        assert!(h.incomplete);
    }
}
