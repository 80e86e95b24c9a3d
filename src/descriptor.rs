//! Advice, mixin, and shim declarations.
//!
//! Instrumentation catalogs supply these as descriptor bundles (JSON
//! documents); the registry compiles each one into its immutable matched
//! form at registration time and rejects malformed items individually.

use regex::Regex;
use serde::Deserialize;

use crate::error::DescriptorError;
use crate::pattern::{NamePattern, ParamsPattern};

/// Which interception hooks a descriptor wires up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSet {
    pub on_before: bool,
    pub on_return: bool,
    pub on_throw: bool,
}

impl HookSet {
    pub const ALL: HookSet = HookSet { on_before: true, on_return: true, on_throw: true };
}

/// One compiled interception rule. Immutable once registered.
#[derive(Debug, Clone)]
pub struct AdviceDescriptor {
    /// Registry-assigned id, doubling as the registration sequence for
    /// tie-breaking and as the dispatch id woven into bytecode.
    pub id: u32,
    pub class_pattern: NamePattern,
    /// When set, the pattern also matches sub-types of matching names.
    pub include_subtypes: bool,
    /// Candidate concrete type names must match this to be eligible; lets a
    /// framework pointcut exclude its own defining hierarchy.
    pub sub_type_restriction: Option<Regex>,
    pub method_pattern: NamePattern,
    pub params: ParamsPattern,
    /// Friendly return type name constraint, if any.
    pub return_type: Option<String>,
    pub nesting_group: Option<String>,
    /// Explicit tie-break, ascending; ties fall back to registration order.
    pub order: i32,
    /// Handler key in the dispatch table.
    pub advice: String,
    pub hooks: HookSet,
}

/// A cross-cutting interface plus backing state, injected into matching
/// types at most once each.
#[derive(Debug, Clone)]
pub struct MixinDeclaration {
    pub target: NamePattern,
    /// Internal name of the interface to add.
    pub interface: String,
    pub fields: Vec<MixinField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MixinField {
    pub name: String,
    /// JVM field descriptor, e.g. `Ljava/lang/Object;` or `J`.
    pub descriptor: String,
}

/// A duck-typed view onto a type the advice cannot reference at compile
/// time, resolved structurally by method name and signature.
#[derive(Debug, Clone)]
pub struct ShimDeclaration {
    pub target: NamePattern,
    pub interface: String,
    pub methods: Vec<ShimMethod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShimMethod {
    /// Name on the shim interface.
    pub name: String,
    pub descriptor: String,
    /// Name of the structurally matching method on the target type;
    /// defaults to the shim method's own name.
    #[serde(default)]
    pub target_method: Option<String>,
}

// ---------------------------------------------------------------------------
// Wire forms
// ---------------------------------------------------------------------------

/// One catalog's worth of declarations, as parsed from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorBundle {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Configuration property schema, opaque to the engine.
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub pointcuts: Vec<PointcutSpec>,
    #[serde(default)]
    pub mixins: Vec<MixinSpec>,
    #[serde(default)]
    pub shims: Vec<ShimSpec>,
}

impl DescriptorBundle {
    pub fn from_json(json: &str) -> Result<Self, DescriptorError> {
        serde_json::from_str(json).map_err(|e| DescriptorError::InvalidBundle(e.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointcutSpec {
    pub class_name: String,
    #[serde(default)]
    pub include_subtypes: bool,
    #[serde(default)]
    pub sub_type_restriction: Option<String>,
    pub method_name: String,
    /// Friendly type names, optionally ending in `..`. Absent means "any".
    #[serde(default)]
    pub params: Option<Vec<String>>,
    #[serde(default)]
    pub return_type: Option<String>,
    #[serde(default)]
    pub nesting_group: Option<String>,
    #[serde(default)]
    pub order: i32,
    pub advice: String,
    #[serde(default = "default_true")]
    pub on_before: bool,
    #[serde(default = "default_true")]
    pub on_return: bool,
    #[serde(default = "default_true")]
    pub on_throw: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct MixinSpec {
    pub target: String,
    pub interface: String,
    #[serde(default)]
    pub fields: Vec<MixinField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShimSpec {
    pub target: String,
    pub interface: String,
    pub methods: Vec<ShimMethod>,
}

impl PointcutSpec {
    /// Compiles the wire form; `id` is assigned by the registry.
    pub fn compile(&self, id: u32) -> Result<AdviceDescriptor, DescriptorError> {
        let class_pattern = NamePattern::compile(&self.class_name)?;
        let method_pattern = NamePattern::compile(&self.method_name)?;
        let params = match &self.params {
            Some(spec) => ParamsPattern::compile(spec)?,
            None => ParamsPattern::any(),
        };
        let sub_type_restriction =
            self.sub_type_restriction.as_deref().map(Regex::new).transpose()?;
        Ok(AdviceDescriptor {
            id,
            class_pattern,
            include_subtypes: self.include_subtypes,
            sub_type_restriction,
            method_pattern,
            params,
            return_type: self.return_type.clone(),
            nesting_group: self.nesting_group.clone(),
            order: self.order,
            advice: self.advice.clone(),
            hooks: HookSet {
                on_before: self.on_before,
                on_return: self.on_return,
                on_throw: self.on_throw,
            },
        })
    }
}

impl MixinSpec {
    pub fn compile(&self) -> Result<MixinDeclaration, DescriptorError> {
        Ok(MixinDeclaration {
            target: NamePattern::compile(&self.target)?,
            interface: self.interface.clone(),
            fields: self.fields.clone(),
        })
    }
}

impl ShimSpec {
    pub fn compile(&self) -> Result<ShimDeclaration, DescriptorError> {
        Ok(ShimDeclaration {
            target: NamePattern::compile(&self.target)?,
            interface: self.interface.clone(),
            methods: self.methods.clone(),
        })
    }
}
