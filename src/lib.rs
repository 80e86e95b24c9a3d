//! # classweave
//!
//! Load-time bytecode weaving for JVM class files.
//!
//! The engine rewrites classes as the host loads them: methods matched by
//! registered pointcut descriptors get entry, normal-exit, and
//! exceptional-exit calls into a dispatch class, mixin interfaces get
//! injected with their backing fields and accessors, and shim interfaces
//! get grafted onto existing implementations. Classes nothing matches pass
//! through byte-identical.
//!
//! ## Pipeline
//!
//! ```text
//! host load hook
//!   └─ LoadHook::transform
//!        └─ Engine::transform            health gate
//!             └─ Weaver::transform       panic barrier, fast paths
//!                  ├─ ThinClass::parse   cheap candidate screen
//!                  ├─ AnalysisCache      per-class advisor sets
//!                  │    └─ HierarchyCache  super/interface closure
//!                  ├─ weave_method       bytecode rewriting
//!                  └─ apply_mixins / apply_shims
//! ```
//!
//! At runtime the woven call sites land in [`dispatch::Dispatcher`], which
//! routes to registered [`dispatch::AdviceHandler`]s and suppresses nested
//! activations within a nesting group.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use classweave::{DescriptorBundle, Engine, LoadHook};
//! use std::sync::Arc;
//!
//! let bundle = DescriptorBundle::from_json(catalog_json)?;
//! let engine = Arc::new(Engine::builder().bundle(bundle).build());
//! engine.bootstrap(&preloader)?;
//! let hook = LoadHook::new(engine);
//! // install `hook.transform(..)` as the host's class-load callback
//! ```

pub mod analysis;
pub mod bytecode;
pub mod classfile;
pub mod config;
pub mod descriptor;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod hook;
pub mod matcher;
pub mod mixin;
pub mod pattern;
pub mod registry;
pub mod thin;
pub mod weaver;

pub use crate::config::EngineConfig;
pub use crate::descriptor::{AdviceDescriptor, DescriptorBundle};
pub use crate::dispatch::{AdviceHandler, Dispatcher};
pub use crate::engine::{ClassPreloader, Engine, EngineBuilder};
pub use crate::error::{ClassFileError, DescriptorError, EngineError, TransformError};
pub use crate::hierarchy::{ClassByteSource, HierarchyCache, LoaderId, LoaderRef};
pub use crate::hook::{initial_reweave, LoadHook, Retransform};
pub use crate::registry::{AdviceRegistry, BundleReport};
pub use crate::weaver::{TransformOutcome, Weaver};
