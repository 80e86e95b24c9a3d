#![allow(dead_code)]

//! Shared fixtures: a synthetic class builder and a small bytecode
//! interpreter that executes woven methods, routing calls against the
//! dispatch class into a real [`Dispatcher`].

use classweave::classfile::{ClassFile, CodeAttribute, CpInfo};
use classweave::dispatch::Dispatcher;

enum CpEntry {
    Utf8(String),
    Class(u16),
    NameAndType(u16, u16),
    Methodref(u16, u16),
}

struct RawMethod {
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
}

/// Emits valid class-file bytes for test classes, one method body at a
/// time. Constant pool entries are deduplicated so method references can
/// be handed out before the final build.
pub struct ClassBytesBuilder {
    major_version: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    entries: Vec<CpEntry>,
    methods: Vec<RawMethod>,
}

impl ClassBytesBuilder {
    pub fn new(name: &str) -> Self {
        let mut b = Self {
            major_version: 52,
            this_class: 0,
            super_class: 0,
            interfaces: Vec::new(),
            entries: Vec::new(),
            methods: Vec::new(),
        };
        b.this_class = b.class(name);
        b.super_class = b.class("java/lang/Object");
        b
    }

    pub fn major_version(mut self, v: u16) -> Self {
        self.major_version = v;
        self
    }

    pub fn extends(mut self, super_name: &str) -> Self {
        self.super_class = self.class(super_name);
        self
    }

    pub fn implements(mut self, interface: &str) -> Self {
        let idx = self.class(interface);
        self.interfaces.push(idx);
        self
    }

    pub fn utf8(&mut self, value: &str) -> u16 {
        for (i, e) in self.entries.iter().enumerate() {
            if let CpEntry::Utf8(s) = e {
                if s == value {
                    return (i + 1) as u16;
                }
            }
        }
        self.entries.push(CpEntry::Utf8(value.to_string()));
        self.entries.len() as u16
    }

    pub fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        for (i, e) in self.entries.iter().enumerate() {
            if let CpEntry::Class(n) = e {
                if *n == name_index {
                    return (i + 1) as u16;
                }
            }
        }
        self.entries.push(CpEntry::Class(name_index));
        self.entries.len() as u16
    }

    pub fn methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(owner);
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let nat = 'nat: {
            for (i, e) in self.entries.iter().enumerate() {
                if let CpEntry::NameAndType(n, d) = e {
                    if *n == name_index && *d == descriptor_index {
                        break 'nat (i + 1) as u16;
                    }
                }
            }
            self.entries.push(CpEntry::NameAndType(name_index, descriptor_index));
            self.entries.len() as u16
        };
        self.entries.push(CpEntry::Methodref(class_index, nat));
        self.entries.len() as u16
    }

    pub fn method(&mut self, name: &str, descriptor: &str, code: Vec<u8>) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        self.utf8("Code");
        self.methods.push(RawMethod {
            access_flags: 0x0009, // public static
            name_index,
            descriptor_index,
            max_stack: 2,
            max_locals: 1,
            code,
        });
    }

    pub fn build(mut self) -> Vec<u8> {
        let code_name = self.utf8("Code");
        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFEBABE_u32.to_be_bytes());
        out.extend_from_slice(&0_u16.to_be_bytes());
        out.extend_from_slice(&self.major_version.to_be_bytes());
        out.extend_from_slice(&((self.entries.len() + 1) as u16).to_be_bytes());
        for e in &self.entries {
            match e {
                CpEntry::Utf8(s) => {
                    out.push(1);
                    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                CpEntry::Class(n) => {
                    out.push(7);
                    out.extend_from_slice(&n.to_be_bytes());
                }
                CpEntry::NameAndType(n, d) => {
                    out.push(12);
                    out.extend_from_slice(&n.to_be_bytes());
                    out.extend_from_slice(&d.to_be_bytes());
                }
                CpEntry::Methodref(c, n) => {
                    out.push(10);
                    out.extend_from_slice(&c.to_be_bytes());
                    out.extend_from_slice(&n.to_be_bytes());
                }
            }
        }
        out.extend_from_slice(&0x0021_u16.to_be_bytes());
        out.extend_from_slice(&self.this_class.to_be_bytes());
        out.extend_from_slice(&self.super_class.to_be_bytes());
        out.extend_from_slice(&(self.interfaces.len() as u16).to_be_bytes());
        for i in &self.interfaces {
            out.extend_from_slice(&i.to_be_bytes());
        }
        out.extend_from_slice(&0_u16.to_be_bytes()); // fields
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for m in &self.methods {
            out.extend_from_slice(&m.access_flags.to_be_bytes());
            out.extend_from_slice(&m.name_index.to_be_bytes());
            out.extend_from_slice(&m.descriptor_index.to_be_bytes());
            out.extend_from_slice(&1_u16.to_be_bytes());
            out.extend_from_slice(&code_name.to_be_bytes());
            let mut info = Vec::new();
            info.extend_from_slice(&m.max_stack.to_be_bytes());
            info.extend_from_slice(&m.max_locals.to_be_bytes());
            info.extend_from_slice(&(m.code.len() as u32).to_be_bytes());
            info.extend_from_slice(&m.code);
            info.extend_from_slice(&0_u16.to_be_bytes()); // exception table
            info.extend_from_slice(&0_u16.to_be_bytes()); // code attrs
            out.extend_from_slice(&(info.len() as u32).to_be_bytes());
            out.extend_from_slice(&info);
        }
        out.extend_from_slice(&0_u16.to_be_bytes()); // class attrs
        out
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Returned(Option<i32>),
    Threw,
}

/// Executes the integer subset of the bytecode the tests and the weaver
/// emit. Calls into the dispatch class land on the real dispatcher; calls
/// to the class's own static methods recurse.
pub struct Interp<'a> {
    pub class: &'a ClassFile,
    pub dispatcher: &'a Dispatcher,
    pub dispatch_class: &'a str,
}

impl Interp<'_> {
    pub fn call(&self, method_name: &str) -> Outcome {
        self.call_desc(method_name, "()V")
    }

    fn call_desc(&self, method_name: &str, descriptor: &str) -> Outcome {
        let cp = &self.class.constant_pool;
        let method = self
            .class
            .methods
            .iter()
            .find(|m| {
                m.name(cp).map(|n| n == method_name).unwrap_or(false)
                    && m.descriptor(cp).map(|d| d == descriptor).unwrap_or(false)
            })
            .unwrap_or_else(|| panic!("no method {method_name}{descriptor}"));
        let at = method.code_attribute(cp).expect("method has no code");
        let code = CodeAttribute::parse(&method.attributes[at].info, cp).expect("bad code");
        self.exec(&code)
    }

    fn exec(&self, code: &CodeAttribute) -> Outcome {
        let cp = &self.class.constant_pool;
        let this_name = self.class.class_name().expect("class name");
        let bytes = &code.code;
        let mut stack: Vec<i32> = Vec::new();
        let mut pc: usize = 0;
        loop {
            let op = bytes[pc];
            match op {
                0x00 => pc += 1,
                0x01 => {
                    stack.push(0);
                    pc += 1;
                }
                0x02..=0x08 => {
                    stack.push(op as i32 - 3);
                    pc += 1;
                }
                0x10 => {
                    stack.push(bytes[pc + 1] as i8 as i32);
                    pc += 2;
                }
                0x11 => {
                    stack.push(i16::from_be_bytes([bytes[pc + 1], bytes[pc + 2]]) as i32);
                    pc += 3;
                }
                0x13 => {
                    let idx = u16::from_be_bytes([bytes[pc + 1], bytes[pc + 2]]);
                    match cp.get(idx).expect("ldc_w index") {
                        CpInfo::Integer(v) => stack.push(*v),
                        other => panic!("ldc_w of unsupported constant {other:?}"),
                    }
                    pc += 3;
                }
                0x60 => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(a.wrapping_add(b));
                    pc += 1;
                }
                0xa7 => {
                    let off = i16::from_be_bytes([bytes[pc + 1], bytes[pc + 2]]) as isize;
                    pc = (pc as isize + off) as usize;
                }
                0xac => return Outcome::Returned(Some(stack.pop().unwrap())),
                0xb1 => return Outcome::Returned(None),
                0xb8 => {
                    let idx = u16::from_be_bytes([bytes[pc + 1], bytes[pc + 2]]);
                    let CpInfo::Methodref { class_index, name_and_type_index } =
                        cp.get(idx).expect("methodref")
                    else {
                        panic!("invokestatic of non-methodref");
                    };
                    let owner = cp.class_name(*class_index).expect("owner");
                    let CpInfo::NameAndType { name_index, descriptor_index } =
                        cp.get(*name_and_type_index).expect("name and type")
                    else {
                        panic!("bad name and type");
                    };
                    let name = cp.utf8(*name_index).expect("name");
                    let descriptor = cp.utf8(*descriptor_index).expect("descriptor");
                    if owner == self.dispatch_class {
                        let id = stack.pop().unwrap() as u32;
                        match name {
                            "enter" => self.dispatcher.enter(id),
                            "exitReturning" => self.dispatcher.exit_returning(id),
                            "exitThrowing" => self.dispatcher.exit_throwing(id),
                            other => panic!("unexpected dispatch call {other}"),
                        }
                        pc += 3;
                    } else if owner == this_name {
                        match self.call_desc(name, descriptor) {
                            Outcome::Returned(Some(v)) => stack.push(v),
                            Outcome::Returned(None) => {}
                            Outcome::Threw => {
                                // Propagate through this frame's handlers.
                                match self.find_handler(code, pc) {
                                    Some(handler) => {
                                        stack.clear();
                                        stack.push(-1);
                                        pc = handler;
                                        continue;
                                    }
                                    None => return Outcome::Threw,
                                }
                            }
                        }
                        pc += 3;
                    } else {
                        panic!("invokestatic of unknown owner {owner}");
                    }
                }
                0xbf => {
                    stack.pop();
                    match self.find_handler(code, pc) {
                        Some(handler) => {
                            stack.clear();
                            stack.push(-1);
                            pc = handler;
                        }
                        None => return Outcome::Threw,
                    }
                }
                other => panic!("interpreter does not handle opcode {other:#04x} at {pc}"),
            }
        }
    }

    fn find_handler(&self, code: &CodeAttribute, pc: usize) -> Option<usize> {
        code.exception_table
            .iter()
            .find(|e| (e.start_pc as usize) <= pc && pc < e.end_pc as usize)
            .map(|e| e.handler_pc as usize)
    }
}
