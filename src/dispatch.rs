//! Runtime dispatch from woven call sites to advice handlers.
//!
//! Woven bytecode calls `enter`, `exitReturning`, and `exitThrowing` with
//! the advisor id baked into the instruction stream; the dispatcher routes
//! those to the handler registered under the descriptor's advice key.
//! Nesting-group suppression happens here: a handler whose group is already
//! active lower on the same call stack is recorded but not invoked, so a
//! delegating wrapper calling the real implementation produces one
//! activation, not two.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::descriptor::{AdviceDescriptor, HookSet};
use crate::registry::AdviceRegistry;

/// Interception logic for one advice key. Implementations record timers and
/// spans; the engine only routes calls.
pub trait AdviceHandler: Send + Sync {
    fn on_before(&self);
    fn on_return(&self);
    fn on_throw(&self);
}

#[derive(Clone)]
struct Wired {
    group: Option<Arc<str>>,
    hooks: HookSet,
    handler: Option<Arc<dyn AdviceHandler>>,
}

struct Activation {
    id: u32,
    active: bool,
    group: Option<Arc<str>>,
}

thread_local! {
    static STACK: RefCell<Vec<Activation>> = RefCell::new(Vec::new());
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<FxHashMap<String, Arc<dyn AdviceHandler>>>,
    wired: RwLock<FxHashMap<u32, Wired>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler behind an advice key. Descriptors wired later
    /// (or re-wired) pick it up.
    pub fn register_handler(&self, advice_key: &str, handler: Arc<dyn AdviceHandler>) {
        self.handlers.write().insert(advice_key.to_string(), handler);
    }

    /// Wires one descriptor id to its handler. A descriptor whose advice key
    /// has no registered handler dispatches as a no-op.
    pub fn wire(&self, descriptor: &AdviceDescriptor) {
        let handler = self.handlers.read().get(&descriptor.advice).cloned();
        if handler.is_none() {
            debug!(advice = %descriptor.advice, id = descriptor.id, "no handler for advice key");
        }
        let group = descriptor.nesting_group.as_deref().map(Arc::from);
        self.wired
            .write()
            .insert(descriptor.id, Wired { group, hooks: descriptor.hooks, handler });
    }

    /// Wires every descriptor currently in the registry.
    pub fn sync(&self, registry: &AdviceRegistry) {
        for descriptor in registry.all_advisors() {
            self.wire(&descriptor);
        }
    }

    pub fn enter(&self, id: u32) {
        let Some(wired) = self.wired.read().get(&id).cloned() else {
            return;
        };
        let active = STACK.with(|s| {
            let mut s = s.borrow_mut();
            let active = match &wired.group {
                Some(g) => !s
                    .iter()
                    .any(|a| a.active && a.group.as_deref() == Some(g.as_ref())),
                None => true,
            };
            s.push(Activation { id, active, group: wired.group.clone() });
            active
        });
        if active && wired.hooks.on_before {
            if let Some(handler) = &wired.handler {
                handler.on_before();
            }
        }
    }

    pub fn exit_returning(&self, id: u32) {
        self.exit(id, false);
    }

    pub fn exit_throwing(&self, id: u32) {
        self.exit(id, true);
    }

    fn exit(&self, id: u32, threw: bool) {
        // Exits always pop the activation, even when the corresponding
        // hook is off; the woven code pairs every enter with both exit
        // paths and this is where the pop lands. A descriptor wiring only
        // an exit hook has no activation and dispatches directly.
        let was_active = STACK.with(|s| {
            let mut s = s.borrow_mut();
            s.iter()
                .rposition(|a| a.id == id)
                .map(|pos| s.remove(pos).active)
        });
        if was_active.unwrap_or(true) {
            if let Some(wired) = self.wired.read().get(&id) {
                let enabled = if threw { wired.hooks.on_throw } else { wired.hooks.on_return };
                if enabled {
                    if let Some(handler) = &wired.handler {
                        if threw {
                            handler.on_throw();
                        } else {
                            handler.on_return();
                        }
                    }
                }
            }
        }
    }
}
