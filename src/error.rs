//! Error taxonomy for the weaving engine.
//!
//! Steady-state failures degrade the instrumentation, never the host:
//! descriptor errors are rejected per item, analysis errors degrade to a
//! partial hierarchy, transform errors fall back to pass-through. Only
//! [`EngineError::Bootstrap`] is fatal.

use thiserror::Error;

/// Errors raised while parsing or re-encoding a class file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassFileError {
    #[error("unexpected end of class file")]
    UnexpectedEof,
    #[error("invalid magic: {0:#x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool index: {0}")]
    InvalidConstantPoolIndex(u16),
    #[error("invalid constant pool tag: {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("constant pool entry is not valid UTF-8")]
    InvalidUtf8,
    #[error("constant pool overflow")]
    ConstantPoolOverflow,
}

/// Errors rejecting a single descriptor at registration time.
///
/// The registry keeps functioning with the remaining valid descriptors.
#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("empty pattern")]
    EmptyPattern,
    #[error("invalid sub-type restriction regex: {0}")]
    InvalidRestriction(#[from] regex::Error),
    #[error("invalid method descriptor: {0}")]
    InvalidMethodDescriptor(String),
    #[error("parameter wildcard `..` only allowed in trailing position")]
    MisplacedParamWildcard,
    #[error("mixin interface {interface} already claimed for target {target}")]
    ConflictingMixin { interface: String, target: String },
    #[error("descriptor bundle rejected: {0}")]
    InvalidBundle(String),
}

/// Errors encountered while rewriting one compiled unit.
///
/// All of these degrade to pass-through: the original bytes are returned
/// unchanged and the occurrence is logged (rate-limited).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error(transparent)]
    ClassFile(#[from] ClassFileError),
    #[error("unsupported bytecode construct: {0}")]
    Unsupported(&'static str),
    #[error("unknown opcode {0:#x} at pc {1}")]
    UnknownOpcode(u8, usize),
    #[error("branch offset out of range after injection")]
    BranchOverflow,
    #[error("method {0} has no Code attribute")]
    MissingCode(String),
    #[error("internal panic during transform")]
    Panicked,
}

/// Fatal engine startup errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bootstrap preload failed for {class}: {reason}")]
    Bootstrap { class: String, reason: String },
    #[error("engine already started")]
    AlreadyStarted,
}
