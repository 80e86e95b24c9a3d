//! Mixin and shim injection.
//!
//! A mixin adds an interface, backing fields, and generated accessors to a
//! matching type, once per type no matter how many declarations match. A
//! shim adds an interface whose methods are resolved structurally against
//! the target's real methods; when names differ a synthetic bridge method
//! forwards the call. A shim whose expected method is missing fails for
//! that type only.

use std::sync::Arc;

use tracing::debug;

use crate::classfile::{
    CodeAttribute, ClassFile, FieldInfo, MethodInfo, RawAttribute, ACC_FINAL, ACC_INTERFACE,
    ACC_PRIVATE, ACC_PUBLIC, ACC_SYNTHETIC,
};
use crate::descriptor::{MixinDeclaration, ShimDeclaration};
use crate::error::{ClassFileError, TransformError};

const ALOAD_0: u8 = 0x2a;
const ILOAD: u8 = 0x15;
const IRETURN: u8 = 0xac;
const RETURN: u8 = 0xb1;
const GETFIELD: u8 = 0xb4;
const PUTFIELD: u8 = 0xb5;
const INVOKEVIRTUAL: u8 = 0xb6;

/// Adds each applicable mixin to the class. Returns whether anything
/// changed.
pub fn apply_mixins(
    cf: &mut ClassFile,
    mixins: &[Arc<MixinDeclaration>],
    member_prefix: &str,
) -> Result<bool, TransformError> {
    if cf.access_flags & (ACC_INTERFACE | ACC_FINAL) != 0 {
        return Ok(false);
    }
    let mut modified = false;
    for mixin in mixins {
        if implements(cf, &mixin.interface)? {
            continue;
        }
        let iface = cf.constant_pool.intern_class(&mixin.interface)?;
        cf.interfaces.push(iface);
        for field in &mixin.fields {
            let field_name = format!("{member_prefix}{}", field.name);
            let name_index = cf.constant_pool.intern_utf8(&field_name)?;
            let descriptor_index = cf.constant_pool.intern_utf8(&field.descriptor)?;
            cf.fields.push(FieldInfo {
                access_flags: ACC_PRIVATE | ACC_SYNTHETIC,
                name_index,
                descriptor_index,
                attributes: Vec::new(),
            });

            let owner = cf.class_name()?.to_string();
            let field_ref =
                cf.constant_pool.intern_fieldref(&owner, &field_name, &field.descriptor)?;
            let first = *field.descriptor.as_bytes().first().ok_or_else(|| {
                TransformError::ClassFile(ClassFileError::InvalidAttribute(
                    "mixin field descriptor".to_string(),
                ))
            })?;
            let kind = type_kind(first);
            let wide = matches!(kind, b'J' | b'D');

            let getter = format!("{member_prefix}get{}", capitalized(&field.name));
            let mut code = vec![ALOAD_0, GETFIELD];
            code.extend_from_slice(&field_ref.to_be_bytes());
            code.push(return_opcode(kind));
            add_method(
                cf,
                &getter,
                &format!("(){}", field.descriptor),
                if wide { 2 } else { 1 },
                1,
                code,
            )?;

            let setter = format!("{member_prefix}set{}", capitalized(&field.name));
            let mut code = vec![ALOAD_0, load_opcode(kind), 0x01, PUTFIELD];
            code.extend_from_slice(&field_ref.to_be_bytes());
            code.push(RETURN);
            add_method(
                cf,
                &setter,
                &format!("({})V", field.descriptor),
                if wide { 3 } else { 2 },
                if wide { 3 } else { 2 },
                code,
            )?;
        }
        modified = true;
    }
    Ok(modified)
}

/// Adds each applicable shim interface, generating bridge methods where the
/// shim name differs from the target method. Returns whether anything
/// changed.
pub fn apply_shims(
    cf: &mut ClassFile,
    shims: &[Arc<ShimDeclaration>],
) -> Result<bool, TransformError> {
    if cf.access_flags & ACC_INTERFACE != 0 {
        return Ok(false);
    }
    let mut modified = false;
    'shims: for shim in shims {
        if implements(cf, &shim.interface)? {
            continue;
        }
        // Resolve every method before mutating anything, so a partial shim
        // never lands on the class.
        let mut bridges = Vec::new();
        for method in &shim.methods {
            let target = method.target_method.as_deref().unwrap_or(&method.name);
            if !has_method(cf, target, &method.descriptor)? {
                debug!(
                    class = cf.class_name()?,
                    shim = %shim.interface,
                    method = target,
                    "shim target method missing, skipping shim for this type"
                );
                continue 'shims;
            }
            if target != method.name {
                bridges.push((method.name.clone(), method.descriptor.clone(), target.to_string()));
            }
        }
        let iface = cf.constant_pool.intern_class(&shim.interface)?;
        cf.interfaces.push(iface);
        for (name, descriptor, target) in bridges {
            add_bridge(cf, &name, &descriptor, &target)?;
        }
        modified = true;
    }
    Ok(modified)
}

fn implements(cf: &ClassFile, interface: &str) -> Result<bool, ClassFileError> {
    for &idx in &cf.interfaces {
        if cf.constant_pool.class_name(idx)? == interface {
            return Ok(true);
        }
    }
    Ok(false)
}

fn has_method(cf: &ClassFile, name: &str, descriptor: &str) -> Result<bool, ClassFileError> {
    for m in &cf.methods {
        if m.name(&cf.constant_pool)? == name && m.descriptor(&cf.constant_pool)? == descriptor {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A `public` forwarder: loads `this` and every argument, invokes the
/// structurally matched target method, returns its result.
fn add_bridge(
    cf: &mut ClassFile,
    name: &str,
    descriptor: &str,
    target: &str,
) -> Result<(), TransformError> {
    let (params, ret) = jvm_signature(descriptor)?;
    let owner = cf.class_name()?.to_string();
    let target_ref = cf.constant_pool.intern_methodref(&owner, target, descriptor)?;

    let mut code = vec![ALOAD_0];
    let mut slot: u8 = 1;
    for &kind in &params {
        code.push(load_opcode(kind));
        code.push(slot);
        slot += if matches!(kind, b'J' | b'D') { 2 } else { 1 };
    }
    code.push(INVOKEVIRTUAL);
    code.extend_from_slice(&target_ref.to_be_bytes());
    code.push(if ret == b'V' { RETURN } else { return_opcode(ret) });

    let slots = slot as u16;
    add_method(cf, name, descriptor, slots.max(2), slots, code)?;
    Ok(())
}

fn add_method(
    cf: &mut ClassFile,
    name: &str,
    descriptor: &str,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
) -> Result<(), ClassFileError> {
    let name_index = cf.constant_pool.intern_utf8(name)?;
    let descriptor_index = cf.constant_pool.intern_utf8(descriptor)?;
    let code_name = cf.constant_pool.intern_utf8("Code")?;
    let attr = CodeAttribute {
        max_stack,
        max_locals,
        code,
        exception_table: Vec::new(),
        attributes: Vec::new(),
    };
    cf.methods.push(MethodInfo {
        access_flags: ACC_PUBLIC | ACC_SYNTHETIC,
        name_index,
        descriptor_index,
        attributes: vec![RawAttribute { name_index: code_name, info: attr.to_bytes() }],
    });
    Ok(())
}

/// Collapses a descriptor type to its computational kind: `I` for all
/// int-like primitives, `A` for references and arrays.
fn type_kind(first: u8) -> u8 {
    match first {
        b'B' | b'C' | b'S' | b'Z' | b'I' => b'I',
        b'J' | b'F' | b'D' => first,
        _ => b'A',
    }
}

fn load_opcode(kind: u8) -> u8 {
    match kind {
        b'I' => ILOAD,
        b'J' => 0x16,
        b'F' => 0x17,
        b'D' => 0x18,
        _ => 0x19, // aload
    }
}

fn return_opcode(kind: u8) -> u8 {
    match kind {
        b'I' => IRETURN,
        b'J' => 0xad,
        b'F' => 0xae,
        b'D' => 0xaf,
        _ => 0xb0, // areturn
    }
}

/// Parameter and return kinds of a JVM method descriptor.
fn jvm_signature(descriptor: &str) -> Result<(Vec<u8>, u8), TransformError> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(TransformError::ClassFile(ClassFileError::InvalidAttribute(
            descriptor.to_string(),
        )));
    }
    let mut params = Vec::new();
    let mut i = 1;
    while i < bytes.len() && bytes[i] != b')' {
        let first = bytes[i];
        params.push(if first == b'[' { b'A' } else { type_kind(first) });
        i = skip_type(bytes, i)?;
    }
    if i + 1 >= bytes.len() {
        return Err(TransformError::ClassFile(ClassFileError::InvalidAttribute(
            descriptor.to_string(),
        )));
    }
    let ret_first = bytes[i + 1];
    let ret = if ret_first == b'V' {
        b'V'
    } else if ret_first == b'[' {
        b'A'
    } else {
        type_kind(ret_first)
    };
    Ok((params, ret))
}

fn skip_type(bytes: &[u8], mut i: usize) -> Result<usize, TransformError> {
    while i < bytes.len() && bytes[i] == b'[' {
        i += 1;
    }
    match bytes.get(i) {
        Some(b'L') => {
            while i < bytes.len() && bytes[i] != b';' {
                i += 1;
            }
            if i >= bytes.len() {
                return Err(TransformError::ClassFile(ClassFileError::InvalidAttribute(
                    "descriptor".to_string(),
                )));
            }
            Ok(i + 1)
        }
        Some(_) => Ok(i + 1),
        None => Err(TransformError::ClassFile(ClassFileError::InvalidAttribute(
            "descriptor".to_string(),
        ))),
    }
}

fn capitalized(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
