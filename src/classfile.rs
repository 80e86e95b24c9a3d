//! Class file parsing and re-encoding.
//!
//! The weaver only ever rewrites a small part of a class file: the `Code`
//! attributes of matched methods, the interface list, and members injected
//! by mixins and shims. Everything else must survive a round trip
//! byte-for-byte, so attributes are kept as raw `(name_index, bytes)` pairs
//! and re-emitted verbatim, and `Utf8` constants keep their raw (modified
//! UTF-8) bytes rather than a lossy decode.
//!
//! The constant pool supports appending new entries with interning, so the
//! weaver can reference the dispatch class and injected members without
//! duplicating pool slots.

use rustc_hash::FxHashMap;

use crate::error::ClassFileError;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<RawAttribute>,
}

impl MethodInfo {
    pub fn name<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.utf8(self.name_index)
    }

    pub fn descriptor<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.utf8(self.descriptor_index)
    }

    /// Index of this method's `Code` attribute, if it has one.
    pub fn code_attribute(&self, cp: &ConstantPool) -> Option<usize> {
        self.attributes
            .iter()
            .position(|a| matches!(cp.utf8(a.name_index), Ok("Code")))
    }
}

/// An attribute kept in its undecoded wire form.
#[derive(Debug, Clone)]
pub struct RawAttribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

impl RawAttribute {
    pub fn name<'a>(&self, cp: &'a ConstantPool) -> Result<&'a str, ClassFileError> {
        cp.utf8(self.name_index)
    }
}

/// Decoded `Code` attribute of one method.
#[derive(Debug, Clone)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

impl CodeAttribute {
    pub fn parse(info: &[u8], cp: &ConstantPool) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(info);
        let max_stack = r.read_u2()?;
        let max_locals = r.read_u2()?;
        let code_length = r.read_u4()? as usize;
        let code = r.read_bytes(code_length)?.to_vec();
        let table_length = r.read_u2()? as usize;
        let mut exception_table = Vec::with_capacity(table_length);
        for _ in 0..table_length {
            exception_table.push(ExceptionTableEntry {
                start_pc: r.read_u2()?,
                end_pc: r.read_u2()?,
                handler_pc: r.read_u2()?,
                catch_type: r.read_u2()?,
            });
        }
        let attributes = parse_attributes(&mut r, cp)?;
        if r.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute("Code".to_string()));
        }
        Ok(Self { max_stack, max_locals, code, exception_table, attributes })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len() + 64);
        put_u2(&mut out, self.max_stack);
        put_u2(&mut out, self.max_locals);
        put_u4(&mut out, self.code.len() as u32);
        out.extend_from_slice(&self.code);
        put_u2(&mut out, self.exception_table.len() as u16);
        for e in &self.exception_table {
            put_u2(&mut out, e.start_pc);
            put_u2(&mut out, e.end_pc);
            put_u2(&mut out, e.handler_pc);
            put_u2(&mut out, e.catch_type);
        }
        emit_attributes(&mut out, &self.attributes);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CpInfo {
    /// Raw modified-UTF-8 bytes, undecoded.
    Utf8(Vec<u8>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<Option<CpInfo>>,
    // Interning indexes, populated lazily on first append.
    utf8_lookup: FxHashMap<Vec<u8>, u16>,
    class_lookup: FxHashMap<u16, u16>,
    indexed: bool,
}

impl ConstantPool {
    pub fn get(&self, index: u16) -> Result<&CpInfo, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantPoolIndex(index))
    }

    pub fn utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Utf8(raw) => std::str::from_utf8(raw).map_err(|_| ClassFileError::InvalidUtf8),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Resolves a `Class` entry to its internal (slash-form) name.
    pub fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.utf8(*name_index),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Number of slots for the class-file header (entries + 1 for slot 0).
    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    fn push(&mut self, entry: CpInfo) -> Result<u16, ClassFileError> {
        if self.entries.len() >= u16::MAX as usize {
            return Err(ClassFileError::ConstantPoolOverflow);
        }
        self.entries.push(Some(entry));
        Ok((self.entries.len() - 1) as u16)
    }

    fn ensure_indexed(&mut self) {
        if self.indexed {
            return;
        }
        for (i, entry) in self.entries.iter().enumerate() {
            match entry {
                Some(CpInfo::Utf8(raw)) => {
                    self.utf8_lookup.entry(raw.clone()).or_insert(i as u16);
                }
                Some(CpInfo::Class { name_index }) => {
                    self.class_lookup.entry(*name_index).or_insert(i as u16);
                }
                _ => {}
            }
        }
        self.indexed = true;
    }

    /// Read-only lookup of an existing UTF-8 slot.
    pub fn find_utf8(&self, value: &str) -> Option<u16> {
        self.entries.iter().enumerate().find_map(|(i, e)| match e {
            Some(CpInfo::Utf8(raw)) if raw.as_slice() == value.as_bytes() => Some(i as u16),
            _ => None,
        })
    }

    /// Interns a UTF-8 constant, reusing an existing slot when present.
    pub fn intern_utf8(&mut self, value: &str) -> Result<u16, ClassFileError> {
        self.ensure_indexed();
        if let Some(&idx) = self.utf8_lookup.get(value.as_bytes()) {
            return Ok(idx);
        }
        let idx = self.push(CpInfo::Utf8(value.as_bytes().to_vec()))?;
        self.utf8_lookup.insert(value.as_bytes().to_vec(), idx);
        Ok(idx)
    }

    pub fn intern_class(&mut self, name: &str) -> Result<u16, ClassFileError> {
        let name_index = self.intern_utf8(name)?;
        if let Some(&idx) = self.class_lookup.get(&name_index) {
            return Ok(idx);
        }
        let idx = self.push(CpInfo::Class { name_index })?;
        self.class_lookup.insert(name_index, idx);
        Ok(idx)
    }

    pub fn intern_name_and_type(
        &mut self,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let name_index = self.intern_utf8(name)?;
        let descriptor_index = self.intern_utf8(descriptor)?;
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(CpInfo::NameAndType { name_index: n, descriptor_index: d }) = entry {
                if *n == name_index && *d == descriptor_index {
                    return Ok(i as u16);
                }
            }
        }
        self.push(CpInfo::NameAndType { name_index, descriptor_index })
    }

    pub fn intern_methodref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let class_index = self.intern_class(owner)?;
        let name_and_type_index = self.intern_name_and_type(name, descriptor)?;
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(CpInfo::Methodref { class_index: c, name_and_type_index: n }) = entry {
                if *c == class_index && *n == name_and_type_index {
                    return Ok(i as u16);
                }
            }
        }
        self.push(CpInfo::Methodref { class_index, name_and_type_index })
    }

    pub fn intern_integer(&mut self, value: i32) -> Result<u16, ClassFileError> {
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(CpInfo::Integer(v)) = entry {
                if *v == value {
                    return Ok(i as u16);
                }
            }
        }
        self.push(CpInfo::Integer(value))
    }

    pub fn intern_fieldref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let class_index = self.intern_class(owner)?;
        let name_and_type_index = self.intern_name_and_type(name, descriptor)?;
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(CpInfo::Fieldref { class_index: c, name_and_type_index: n }) = entry {
                if *c == class_index && *n == name_and_type_index {
                    return Ok(i as u16);
                }
            }
        }
        self.push(CpInfo::Fieldref { class_index, name_and_type_index })
    }

    fn emit(&self, out: &mut Vec<u8>) {
        let mut i = 1;
        while i < self.entries.len() {
            let entry = match &self.entries[i] {
                Some(e) => e,
                None => {
                    i += 1;
                    continue;
                }
            };
            match entry {
                CpInfo::Utf8(raw) => {
                    out.push(1);
                    put_u2(out, raw.len() as u16);
                    out.extend_from_slice(raw);
                }
                CpInfo::Integer(v) => {
                    out.push(3);
                    put_u4(out, *v as u32);
                }
                CpInfo::Float(bits) => {
                    out.push(4);
                    put_u4(out, *bits);
                }
                CpInfo::Long(v) => {
                    out.push(5);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                CpInfo::Double(bits) => {
                    out.push(6);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                CpInfo::Class { name_index } => {
                    out.push(7);
                    put_u2(out, *name_index);
                }
                CpInfo::String { string_index } => {
                    out.push(8);
                    put_u2(out, *string_index);
                }
                CpInfo::Fieldref { class_index, name_and_type_index } => {
                    out.push(9);
                    put_u2(out, *class_index);
                    put_u2(out, *name_and_type_index);
                }
                CpInfo::Methodref { class_index, name_and_type_index } => {
                    out.push(10);
                    put_u2(out, *class_index);
                    put_u2(out, *name_and_type_index);
                }
                CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                    out.push(11);
                    put_u2(out, *class_index);
                    put_u2(out, *name_and_type_index);
                }
                CpInfo::NameAndType { name_index, descriptor_index } => {
                    out.push(12);
                    put_u2(out, *name_index);
                    put_u2(out, *descriptor_index);
                }
                CpInfo::MethodHandle { reference_kind, reference_index } => {
                    out.push(15);
                    out.push(*reference_kind);
                    put_u2(out, *reference_index);
                }
                CpInfo::MethodType { descriptor_index } => {
                    out.push(16);
                    put_u2(out, *descriptor_index);
                }
                CpInfo::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    out.push(17);
                    put_u2(out, *bootstrap_method_attr_index);
                    put_u2(out, *name_and_type_index);
                }
                CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                    out.push(18);
                    put_u2(out, *bootstrap_method_attr_index);
                    put_u2(out, *name_and_type_index);
                }
                CpInfo::Module { name_index } => {
                    out.push(19);
                    put_u2(out, *name_index);
                }
                CpInfo::Package { name_index } => {
                    out.push(20);
                    put_u2(out, *name_index);
                }
            }
            i += 1;
        }
    }
}

pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub(crate) fn read_u1(&mut self) -> Result<u8, ClassFileError> {
        if self.remaining() < 1 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub(crate) fn read_u2(&mut self) -> Result<u16, ClassFileError> {
        if self.remaining() < 2 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub(crate) fn read_u4(&mut self) -> Result<u32, ClassFileError> {
        if self.remaining() < 4 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = u32::from_be_bytes([
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<(), ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof);
        }
        self.pos += len;
        Ok(())
    }
}

pub(crate) fn put_u2(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u4(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u4()?;
        if magic != 0xCAFEBABE {
            return Err(ClassFileError::InvalidMagic(magic));
        }

        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;

        let constant_pool = parse_constant_pool(&mut r)?;

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;

        let interfaces_count = r.read_u2()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(r.read_u2()?);
        }

        let fields_count = r.read_u2()?;
        let mut fields = Vec::with_capacity(fields_count as usize);
        for _ in 0..fields_count {
            let access_flags = r.read_u2()?;
            let name_index = r.read_u2()?;
            let descriptor_index = r.read_u2()?;
            let attributes = parse_attributes(&mut r, &constant_pool)?;
            fields.push(FieldInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let methods_count = r.read_u2()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            let access_flags = r.read_u2()?;
            let name_index = r.read_u2()?;
            let descriptor_index = r.read_u2()?;
            let attributes = parse_attributes(&mut r, &constant_pool)?;
            methods.push(MethodInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let attributes = parse_attributes(&mut r, &constant_pool)?;

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn class_name(&self) -> Result<&str, ClassFileError> {
        self.constant_pool.class_name(self.this_class)
    }

    /// `None` for `java/lang/Object`, which has no super class.
    pub fn super_name(&self) -> Result<Option<&str>, ClassFileError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> Result<Vec<&str>, ClassFileError> {
        self.interfaces
            .iter()
            .map(|&i| self.constant_pool.class_name(i))
            .collect()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4096);
        put_u4(&mut out, 0xCAFEBABE);
        put_u2(&mut out, self.minor_version);
        put_u2(&mut out, self.major_version);
        put_u2(&mut out, self.constant_pool.count());
        self.constant_pool.emit(&mut out);
        put_u2(&mut out, self.access_flags);
        put_u2(&mut out, self.this_class);
        put_u2(&mut out, self.super_class);
        put_u2(&mut out, self.interfaces.len() as u16);
        for &i in &self.interfaces {
            put_u2(&mut out, i);
        }
        put_u2(&mut out, self.fields.len() as u16);
        for f in &self.fields {
            put_u2(&mut out, f.access_flags);
            put_u2(&mut out, f.name_index);
            put_u2(&mut out, f.descriptor_index);
            emit_attributes(&mut out, &f.attributes);
        }
        put_u2(&mut out, self.methods.len() as u16);
        for m in &self.methods {
            put_u2(&mut out, m.access_flags);
            put_u2(&mut out, m.name_index);
            put_u2(&mut out, m.descriptor_index);
            emit_attributes(&mut out, &m.attributes);
        }
        emit_attributes(&mut out, &self.attributes);
        out
    }
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut entries: Vec<Option<CpInfo>> = Vec::with_capacity(count);
    entries.push(None); // index 0 is unused

    let mut i = 1;
    while i < count {
        let tag = r.read_u1()?;
        let entry = match tag {
            1 => {
                let len = r.read_u2()? as usize;
                CpInfo::Utf8(r.read_bytes(len)?.to_vec())
            }
            3 => CpInfo::Integer(r.read_u4()? as i32),
            4 => CpInfo::Float(r.read_u4()?),
            5 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                entries.push(Some(CpInfo::Long(((high << 32) | low) as i64)));
                entries.push(None);
                i += 2;
                continue;
            }
            6 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                entries.push(Some(CpInfo::Double((high << 32) | low)));
                entries.push(None);
                i += 2;
                continue;
            }
            7 => CpInfo::Class { name_index: r.read_u2()? },
            8 => CpInfo::String { string_index: r.read_u2()? },
            9 => CpInfo::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            10 => CpInfo::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            11 => CpInfo::InterfaceMethodref {
                class_index: r.read_u2()?,
                name_and_type_index: r.read_u2()?,
            },
            12 => CpInfo::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
            15 => {
                CpInfo::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? }
            }
            16 => CpInfo::MethodType { descriptor_index: r.read_u2()? },
            17 => CpInfo::Dynamic {
                bootstrap_method_attr_index: r.read_u2()?,
                name_and_type_index: r.read_u2()?,
            },
            18 => CpInfo::InvokeDynamic {
                bootstrap_method_attr_index: r.read_u2()?,
                name_and_type_index: r.read_u2()?,
            },
            19 => CpInfo::Module { name_index: r.read_u2()? },
            20 => CpInfo::Package { name_index: r.read_u2()? },
            _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
        };

        entries.push(Some(entry));
        i += 1;
    }

    Ok(ConstantPool { entries, ..Default::default() })
}

fn parse_attributes(r: &mut Reader, cp: &ConstantPool) -> Result<Vec<RawAttribute>, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut attrs = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = r.read_u2()?;
        // Validate the name eagerly so corrupt pools fail here, not at weave
        // time.
        let _ = cp.utf8(name_index)?;
        let length = r.read_u4()? as usize;
        let info = r.read_bytes(length)?.to_vec();
        attrs.push(RawAttribute { name_index, info });
    }
    Ok(attrs)
}

fn emit_attributes(out: &mut Vec<u8>, attrs: &[RawAttribute]) {
    put_u2(out, attrs.len() as u16);
    for a in attrs {
        put_u2(out, a.name_index);
        put_u4(out, a.info.len() as u32);
        out.extend_from_slice(&a.info);
    }
}
