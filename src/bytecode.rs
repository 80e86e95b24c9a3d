//! Method-body rewriting.
//!
//! A matched method is rewritten in place: dispatch calls are inserted at
//! entry and before every return instruction, and a catch-all handler is
//! appended that notifies the dispatcher and re-raises. Insertion shifts
//! instruction offsets, so the body is decoded into a symbolic form, laid
//! out again (switch padding depends on alignment), and re-encoded with
//! every branch target, exception-table range, and offset-bearing attribute
//! (`StackMapTable`, `LineNumberTable`, `LocalVariableTable`) remapped.
//!
//! Constructs the rewriter cannot handle safely, legacy `jsr`/`ret`
//! subroutines and 16-bit branch or offset overflow, fail the transform;
//! the caller degrades to the original bytes.

use rustc_hash::FxHashMap;

use crate::classfile::{
    put_u2, put_u4, CodeAttribute, ConstantPool, ExceptionTableEntry, RawAttribute, Reader,
};
use crate::error::{ClassFileError, TransformError};
use crate::matcher::MatchedAdvisorSet;

const SIPUSH: u8 = 0x11;
const LDC_W: u8 = 0x13;
const IINC: u8 = 0x84;
const IRETURN: u8 = 0xac;
const RETURN: u8 = 0xb1;
const INVOKESTATIC: u8 = 0xb8;
const ATHROW: u8 = 0xbf;
const GOTO: u8 = 0xa7;
const JSR: u8 = 0xa8;
const RET: u8 = 0xa9;
const TABLESWITCH: u8 = 0xaa;
const LOOKUPSWITCH: u8 = 0xab;
const WIDE: u8 = 0xc4;
const GOTO_W: u8 = 0xc8;
const JSR_W: u8 = 0xc9;
const IFNULL: u8 = 0xc6;
const IFNONNULL: u8 = 0xc7;

/// Constant-pool slots for the dispatch entry points, interned once per
/// woven class.
pub(crate) struct DispatchRefs {
    enter: u16,
    exit_returning: u16,
    exit_throwing: u16,
    throwable_class: u16,
}

impl DispatchRefs {
    pub(crate) fn intern(
        cp: &mut ConstantPool,
        dispatch_class: &str,
    ) -> Result<Self, ClassFileError> {
        Ok(Self {
            enter: cp.intern_methodref(dispatch_class, "enter", "(I)V")?,
            exit_returning: cp.intern_methodref(dispatch_class, "exitReturning", "(I)V")?,
            exit_throwing: cp.intern_methodref(dispatch_class, "exitThrowing", "(I)V")?,
            throwable_class: cp.intern_class("java/lang/Throwable")?,
        })
    }
}

#[derive(Debug)]
enum Insn {
    /// Fixed-size instruction with no code offsets in its operands.
    Plain(Vec<u8>),
    /// 16-bit-offset branch; target is an absolute pre-weave pc.
    Branch { opcode: u8, target: u32 },
    /// `goto_w`.
    BranchW { target: u32 },
    TableSwitch { default: u32, low: i32, high: i32, targets: Vec<u32> },
    LookupSwitch { default: u32, pairs: Vec<(i32, u32)> },
}

struct Item {
    /// Pre-weave pc of the original instruction; `None` for injected items.
    old_pc: Option<u32>,
    /// Injected bytes emitted before the instruction. Branches to `old_pc`
    /// land here, so code routed to a return site runs the exit calls.
    pre: Vec<u8>,
    insn: Insn,
    new_pc: u32,
}

fn fixed_len(opcode: u8) -> Option<usize> {
    Some(match opcode {
        0x00..=0x0f => 1,
        0x10 => 2, // bipush
        0x11 => 3, // sipush
        0x12 => 2, // ldc
        0x13 | 0x14 => 3,
        0x15..=0x19 => 2, // iload..aload
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2, // istore..astore
        0x3b..=0x83 => 1,
        0x84 => 3, // iinc
        0x85..=0x98 => 1,
        0xac..=0xb1 => 1, // returns
        0xb2..=0xb8 => 3, // field/method access
        0xb9 | 0xba => 5, // invokeinterface, invokedynamic
        0xbb => 3,        // new
        0xbc => 2,        // newarray
        0xbd => 3,        // anewarray
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3, // checkcast, instanceof
        0xc2 | 0xc3 => 1,
        0xc5 => 4, // multianewarray
        _ => return None,
    })
}

fn decode(code: &[u8]) -> Result<Vec<Item>, TransformError> {
    let mut items = Vec::new();
    let mut pc = 0usize;
    while pc < code.len() {
        let opcode = code[pc];
        let rel = |off: i32| -> u32 { (pc as i64 + off as i64) as u32 };
        let need = |end: usize| -> Result<(), TransformError> {
            if end > code.len() {
                Err(TransformError::ClassFile(ClassFileError::UnexpectedEof))
            } else {
                Ok(())
            }
        };
        let (insn, len) = match opcode {
            JSR | JSR_W | RET => {
                return Err(TransformError::Unsupported("jsr/ret subroutine"));
            }
            0x99..=GOTO | IFNULL | IFNONNULL => {
                need(pc + 3)?;
                let off = i16::from_be_bytes([code[pc + 1], code[pc + 2]]) as i32;
                (Insn::Branch { opcode, target: rel(off) }, 3)
            }
            GOTO_W => {
                need(pc + 5)?;
                let off = i32::from_be_bytes([
                    code[pc + 1],
                    code[pc + 2],
                    code[pc + 3],
                    code[pc + 4],
                ]);
                (Insn::BranchW { target: rel(off) }, 5)
            }
            TABLESWITCH => {
                let pad = (4 - (pc + 1) % 4) % 4;
                let mut at = pc + 1 + pad;
                need(at + 12)?;
                let read_i32 = |at: usize| {
                    i32::from_be_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
                };
                let default = rel(read_i32(at));
                let low = read_i32(at + 4);
                let high = read_i32(at + 8);
                at += 12;
                if high < low {
                    return Err(TransformError::UnknownOpcode(opcode, pc));
                }
                let n = (high - low + 1) as usize;
                need(at + 4 * n)?;
                let targets = (0..n).map(|i| rel(read_i32(at + 4 * i))).collect();
                (Insn::TableSwitch { default, low, high, targets }, 1 + pad + 12 + 4 * n)
            }
            LOOKUPSWITCH => {
                let pad = (4 - (pc + 1) % 4) % 4;
                let mut at = pc + 1 + pad;
                need(at + 8)?;
                let read_i32 = |at: usize| {
                    i32::from_be_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
                };
                let default = rel(read_i32(at));
                let npairs = read_i32(at + 4);
                at += 8;
                if npairs < 0 {
                    return Err(TransformError::UnknownOpcode(opcode, pc));
                }
                let n = npairs as usize;
                need(at + 8 * n)?;
                let pairs = (0..n)
                    .map(|i| (read_i32(at + 8 * i), rel(read_i32(at + 8 * i + 4))))
                    .collect();
                (Insn::LookupSwitch { default, pairs }, 1 + pad + 8 + 8 * n)
            }
            WIDE => {
                need(pc + 2)?;
                let modified = code[pc + 1];
                if modified == RET {
                    return Err(TransformError::Unsupported("jsr/ret subroutine"));
                }
                let len = if modified == IINC { 6 } else { 4 };
                need(pc + len)?;
                (Insn::Plain(code[pc..pc + len].to_vec()), len)
            }
            _ => match fixed_len(opcode) {
                Some(len) => {
                    need(pc + len)?;
                    (Insn::Plain(code[pc..pc + len].to_vec()), len)
                }
                None => return Err(TransformError::UnknownOpcode(opcode, pc)),
            },
        };
        items.push(Item { old_pc: Some(pc as u32), pre: Vec::new(), insn, new_pc: 0 });
        pc += len;
    }
    Ok(items)
}

fn insn_size(insn: &Insn, pc: u32) -> u32 {
    match insn {
        Insn::Plain(bytes) => bytes.len() as u32,
        Insn::Branch { .. } => 3,
        Insn::BranchW { .. } => 5,
        Insn::TableSwitch { targets, .. } => {
            let pad = (4 - (pc + 1) % 4) % 4;
            1 + pad + 12 + 4 * targets.len() as u32
        }
        Insn::LookupSwitch { pairs, .. } => {
            let pad = (4 - (pc + 1) % 4) % 4;
            1 + pad + 8 + 8 * pairs.len() as u32
        }
    }
}

fn push_id(out: &mut Vec<u8>, cp: &mut ConstantPool, id: u32) -> Result<(), TransformError> {
    if id <= i16::MAX as u32 {
        out.push(SIPUSH);
        put_u2(out, id as u16);
    } else {
        let idx = cp.intern_integer(id as i32)?;
        out.push(LDC_W);
        put_u2(out, idx);
    }
    Ok(())
}

fn invokestatic(out: &mut Vec<u8>, method_ref: u16) {
    out.push(INVOKESTATIC);
    put_u2(out, method_ref);
}

/// Rewrites one method body for its matched advisors.
///
/// `needs_frames` reflects the class-file version: classes verified with
/// stack-map frames (major 50+) get a frame for the appended handler even
/// when the method had none before.
pub fn weave_method(
    code: &CodeAttribute,
    cp: &mut ConstantPool,
    refs: &DispatchRefs,
    advisors: &MatchedAdvisorSet,
    needs_frames: bool,
) -> Result<CodeAttribute, TransformError> {
    let mut entry = Vec::new();
    for d in advisors.iter().filter(|d| d.hooks.on_before) {
        push_id(&mut entry, cp, d.id)?;
        invokestatic(&mut entry, refs.enter);
    }
    // Every advisor that gets an enter also gets both exit calls: enter
    // pushes a nesting activation, and an exit path that skips the pop
    // would leave the group suppressed on that thread forever. The
    // dispatcher withholds the handler callback when the hook is off.
    let mut exit = Vec::new();
    for d in advisors
        .iter()
        .filter(|d| d.hooks.on_return || d.hooks.on_before)
        .collect::<Vec<_>>()
        .iter()
        .rev()
    {
        push_id(&mut exit, cp, d.id)?;
        invokestatic(&mut exit, refs.exit_returning);
    }
    let mut throw = Vec::new();
    for d in advisors
        .iter()
        .filter(|d| d.hooks.on_throw || d.hooks.on_before)
        .collect::<Vec<_>>()
        .iter()
        .rev()
    {
        push_id(&mut throw, cp, d.id)?;
        invokestatic(&mut throw, refs.exit_throwing);
    }
    if entry.is_empty() && exit.is_empty() && throw.is_empty() {
        return Ok(code.clone());
    }
    if code.code.is_empty() {
        return Ok(code.clone());
    }

    let mut items = decode(&code.code)?;
    for item in &mut items {
        if let Insn::Plain(bytes) = &item.insn {
            if matches!(bytes.first(), Some(op) if (IRETURN..=RETURN).contains(op)) {
                item.pre = exit.clone();
            }
        }
    }
    if !entry.is_empty() {
        items.insert(
            0,
            Item { old_pc: None, pre: entry, insn: Insn::Plain(Vec::new()), new_pc: 0 },
        );
    }
    let handler_index = if throw.is_empty() {
        None
    } else {
        let mut pre = throw;
        pre.push(ATHROW);
        items.push(Item { old_pc: None, pre, insn: Insn::Plain(Vec::new()), new_pc: 0 });
        Some(items.len() - 1)
    };

    // Iterative layout: switch padding depends on alignment, which depends
    // on everything laid out before it.
    let mut total;
    let mut rounds = 0;
    loop {
        let mut pc = 0u32;
        let mut changed = false;
        for item in &mut items {
            if item.new_pc != pc {
                item.new_pc = pc;
                changed = true;
            }
            let insn_pc = pc + item.pre.len() as u32;
            pc = insn_pc + insn_size(&item.insn, insn_pc);
        }
        total = pc;
        if !changed {
            break;
        }
        rounds += 1;
        if rounds > 32 {
            return Err(TransformError::Unsupported("layout did not converge"));
        }
    }
    if total > u16::MAX as u32 {
        return Err(TransformError::Unsupported("woven method exceeds 64k"));
    }

    let end_of_body = match handler_index {
        Some(i) => items[i].new_pc,
        None => total,
    };
    let old_len = code.code.len() as u32;
    let mut map: FxHashMap<u32, u32> = FxHashMap::default();
    for item in &items {
        if let Some(old) = item.old_pc {
            map.insert(old, item.new_pc);
        }
    }
    let lookup = |old: u32| -> Result<u32, TransformError> {
        if old == old_len {
            return Ok(end_of_body);
        }
        map.get(&old)
            .copied()
            .ok_or(TransformError::ClassFile(ClassFileError::InvalidAttribute(
                "code offset".to_string(),
            )))
    };

    let mut out = Vec::with_capacity(total as usize);
    for item in &items {
        out.extend_from_slice(&item.pre);
        let insn_pc = item.new_pc + item.pre.len() as u32;
        match &item.insn {
            Insn::Plain(bytes) => out.extend_from_slice(bytes),
            Insn::Branch { opcode, target } => {
                let off = lookup(*target)? as i64 - insn_pc as i64;
                let off = i16::try_from(off).map_err(|_| TransformError::BranchOverflow)?;
                out.push(*opcode);
                put_u2(&mut out, off as u16);
            }
            Insn::BranchW { target } => {
                let off = lookup(*target)? as i64 - insn_pc as i64;
                out.push(GOTO_W);
                put_u4(&mut out, off as i32 as u32);
            }
            Insn::TableSwitch { default, low, high, targets } => {
                out.push(TABLESWITCH);
                let pad = (4 - (insn_pc + 1) % 4) % 4;
                out.extend(std::iter::repeat(0u8).take(pad as usize));
                let rel = |t: u32| -> Result<u32, TransformError> {
                    Ok((lookup(t)? as i64 - insn_pc as i64) as i32 as u32)
                };
                put_u4(&mut out, rel(*default)?);
                put_u4(&mut out, *low as u32);
                put_u4(&mut out, *high as u32);
                for t in targets {
                    put_u4(&mut out, rel(*t)?);
                }
            }
            Insn::LookupSwitch { default, pairs } => {
                out.push(LOOKUPSWITCH);
                let pad = (4 - (insn_pc + 1) % 4) % 4;
                out.extend(std::iter::repeat(0u8).take(pad as usize));
                let rel = |t: u32| -> Result<u32, TransformError> {
                    Ok((lookup(t)? as i64 - insn_pc as i64) as i32 as u32)
                };
                put_u4(&mut out, rel(*default)?);
                put_u4(&mut out, pairs.len() as u32);
                for (key, t) in pairs {
                    put_u4(&mut out, *key as u32);
                    put_u4(&mut out, rel(*t)?);
                }
            }
        }
    }

    let mut exception_table: Vec<ExceptionTableEntry> = Vec::new();
    for e in &code.exception_table {
        exception_table.push(ExceptionTableEntry {
            start_pc: lookup(e.start_pc as u32)? as u16,
            end_pc: lookup(e.end_pc as u32)? as u16,
            handler_pc: lookup(e.handler_pc as u32)? as u16,
            catch_type: e.catch_type,
        });
    }
    let handler_pc = match handler_index {
        Some(i) => {
            let handler_pc = items[i].new_pc;
            exception_table.push(ExceptionTableEntry {
                start_pc: lookup(0)? as u16,
                end_pc: end_of_body as u16,
                handler_pc: handler_pc as u16,
                catch_type: 0,
            });
            Some(handler_pc)
        }
        None => None,
    };

    let attributes = remap_attributes(
        &code.attributes,
        cp,
        &lookup,
        handler_pc.filter(|_| needs_frames),
        refs,
    )?;

    Ok(CodeAttribute {
        max_stack: code.max_stack.saturating_add(1).max(2),
        max_locals: code.max_locals,
        code: out,
        exception_table,
        attributes,
    })
}

// ---------------------------------------------------------------------------
// Offset-bearing Code attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum VType {
    Prim(u8),
    Object(u16),
    /// Offset of the corresponding `new` instruction, pre-weave.
    Uninitialized(u32),
}

#[derive(Debug)]
enum FrameBody {
    Same,
    SameLocals1(VType),
    Chop(u8),
    Append(Vec<VType>),
    Full { locals: Vec<VType>, stack: Vec<VType> },
}

struct StackFrame {
    offset: u32,
    /// Whether `offset` is already a post-weave pc (the appended handler
    /// frame) or a pre-weave pc that still needs remapping.
    mapped: bool,
    body: FrameBody,
}

fn remap_attributes(
    attrs: &[RawAttribute],
    cp: &ConstantPool,
    lookup: &dyn Fn(u32) -> Result<u32, TransformError>,
    handler_frame_at: Option<u32>,
    refs: &DispatchRefs,
) -> Result<Vec<RawAttribute>, TransformError> {
    let mut out = Vec::with_capacity(attrs.len() + 1);
    let mut saw_stack_map = false;
    for attr in attrs {
        let name = attr.name(cp)?;
        let info = match name {
            "StackMapTable" => {
                saw_stack_map = true;
                let mut frames = parse_stack_map(&attr.info)?;
                if let Some(at) = handler_frame_at {
                    frames.push(handler_frame(at, refs));
                }
                emit_stack_map(&frames, lookup)?
            }
            "LineNumberTable" => remap_line_numbers(&attr.info, lookup)?,
            "LocalVariableTable" | "LocalVariableTypeTable" => {
                remap_local_variables(&attr.info, lookup)?
            }
            _ => attr.info.clone(),
        };
        out.push(RawAttribute { name_index: attr.name_index, info });
    }
    // A linear method has no frames; the appended handler still needs one on
    // frame-verified classes.
    if let (Some(at), false) = (handler_frame_at, saw_stack_map) {
        // Cannot intern here (pool is borrowed shared); weaver pre-interns.
        let name_index = cp
            .find_utf8("StackMapTable")
            .ok_or(TransformError::ClassFile(ClassFileError::InvalidAttribute(
                "StackMapTable".to_string(),
            )))?;
        let frames = vec![handler_frame(at, refs)];
        let info = emit_stack_map(&frames, lookup)?;
        out.push(RawAttribute { name_index, info });
    }
    Ok(out)
}

fn handler_frame(at: u32, refs: &DispatchRefs) -> StackFrame {
    StackFrame {
        offset: at,
        mapped: true,
        body: FrameBody::Full {
            locals: Vec::new(),
            stack: vec![VType::Object(refs.throwable_class)],
        },
    }
}

fn read_vtype(r: &mut Reader) -> Result<VType, ClassFileError> {
    let tag = r.read_u1()?;
    match tag {
        0..=6 => Ok(VType::Prim(tag)),
        7 => Ok(VType::Object(r.read_u2()?)),
        8 => Ok(VType::Uninitialized(r.read_u2()? as u32)),
        _ => Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
    }
}

fn write_vtype(
    out: &mut Vec<u8>,
    v: &VType,
    lookup: &dyn Fn(u32) -> Result<u32, TransformError>,
) -> Result<(), TransformError> {
    match v {
        VType::Prim(tag) => out.push(*tag),
        VType::Object(index) => {
            out.push(7);
            put_u2(out, *index);
        }
        VType::Uninitialized(offset) => {
            out.push(8);
            put_u2(out, lookup(*offset)? as u16);
        }
    }
    Ok(())
}

fn parse_stack_map(info: &[u8]) -> Result<Vec<StackFrame>, ClassFileError> {
    let mut r = Reader::new(info);
    let count = r.read_u2()?;
    let mut frames = Vec::with_capacity(count as usize);
    let mut offset: i64 = -1;
    for _ in 0..count {
        let tag = r.read_u1()?;
        let (delta, body) = match tag {
            0..=63 => (tag as u32, FrameBody::Same),
            64..=127 => ((tag - 64) as u32, FrameBody::SameLocals1(read_vtype(&mut r)?)),
            247 => {
                let delta = r.read_u2()? as u32;
                (delta, FrameBody::SameLocals1(read_vtype(&mut r)?))
            }
            248..=250 => (r.read_u2()? as u32, FrameBody::Chop(251 - tag)),
            251 => (r.read_u2()? as u32, FrameBody::Same),
            252..=254 => {
                let delta = r.read_u2()? as u32;
                let k = (tag - 251) as usize;
                let mut vtypes = Vec::with_capacity(k);
                for _ in 0..k {
                    vtypes.push(read_vtype(&mut r)?);
                }
                (delta, FrameBody::Append(vtypes))
            }
            255 => {
                let delta = r.read_u2()? as u32;
                let n_locals = r.read_u2()? as usize;
                let mut locals = Vec::with_capacity(n_locals);
                for _ in 0..n_locals {
                    locals.push(read_vtype(&mut r)?);
                }
                let n_stack = r.read_u2()? as usize;
                let mut stack = Vec::with_capacity(n_stack);
                for _ in 0..n_stack {
                    stack.push(read_vtype(&mut r)?);
                }
                (delta, FrameBody::Full { locals, stack })
            }
            _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
        };
        offset += 1 + delta as i64;
        frames.push(StackFrame { offset: offset as u32, mapped: false, body });
    }
    if r.remaining() != 0 {
        return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string()));
    }
    Ok(frames)
}

fn emit_stack_map(
    frames: &[StackFrame],
    lookup: &dyn Fn(u32) -> Result<u32, TransformError>,
) -> Result<Vec<u8>, TransformError> {
    let mut out = Vec::new();
    put_u2(&mut out, frames.len() as u16);
    let mut prev: i64 = -1;
    for frame in frames {
        let new_offset = if frame.mapped { frame.offset } else { lookup(frame.offset)? };
        let delta = new_offset as i64 - prev - 1;
        if delta < 0 {
            return Err(TransformError::ClassFile(ClassFileError::InvalidAttribute(
                "StackMapTable".to_string(),
            )));
        }
        prev = new_offset as i64;
        let delta = delta as u32;
        match &frame.body {
            FrameBody::Same => {
                if delta <= 63 {
                    out.push(delta as u8);
                } else {
                    out.push(251);
                    put_u2(&mut out, delta as u16);
                }
            }
            FrameBody::SameLocals1(v) => {
                if delta <= 63 {
                    out.push(64 + delta as u8);
                } else {
                    out.push(247);
                    put_u2(&mut out, delta as u16);
                }
                write_vtype(&mut out, v, lookup)?;
            }
            FrameBody::Chop(k) => {
                out.push(251 - k);
                put_u2(&mut out, delta as u16);
            }
            FrameBody::Append(vtypes) => {
                out.push(251 + vtypes.len() as u8);
                put_u2(&mut out, delta as u16);
                for v in vtypes {
                    write_vtype(&mut out, v, lookup)?;
                }
            }
            FrameBody::Full { locals, stack } => {
                out.push(255);
                put_u2(&mut out, delta as u16);
                put_u2(&mut out, locals.len() as u16);
                for v in locals {
                    write_vtype(&mut out, v, lookup)?;
                }
                put_u2(&mut out, stack.len() as u16);
                for v in stack {
                    write_vtype(&mut out, v, lookup)?;
                }
            }
        }
    }
    Ok(out)
}

fn remap_line_numbers(
    info: &[u8],
    lookup: &dyn Fn(u32) -> Result<u32, TransformError>,
) -> Result<Vec<u8>, TransformError> {
    let mut r = Reader::new(info);
    let count = r.read_u2()?;
    let mut out = Vec::with_capacity(info.len());
    put_u2(&mut out, count);
    for _ in 0..count {
        let start_pc = r.read_u2()? as u32;
        let line = r.read_u2()?;
        put_u2(&mut out, lookup(start_pc)? as u16);
        put_u2(&mut out, line);
    }
    Ok(out)
}

fn remap_local_variables(
    info: &[u8],
    lookup: &dyn Fn(u32) -> Result<u32, TransformError>,
) -> Result<Vec<u8>, TransformError> {
    let mut r = Reader::new(info);
    let count = r.read_u2()?;
    let mut out = Vec::with_capacity(info.len());
    put_u2(&mut out, count);
    for _ in 0..count {
        let start_pc = r.read_u2()? as u32;
        let length = r.read_u2()? as u32;
        let new_start = lookup(start_pc)?;
        let new_end = lookup(start_pc + length)?;
        put_u2(&mut out, new_start as u16);
        put_u2(&mut out, (new_end - new_start) as u16);
        for _ in 0..3 {
            put_u2(&mut out, r.read_u2()?);
        }
    }
    Ok(out)
}
