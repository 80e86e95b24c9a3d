//! Thin class snapshot: the fast-path, structure-only parse.
//!
//! Most loaded units match no registered pattern, so the steady-state cost
//! of the engine is dominated by deciding "nothing applies here" as cheaply
//! as possible. This parse borrows from the input buffer, materializes only
//! names and method signatures, and skips every attribute payload by its
//! length prefix.

use crate::classfile::Reader;
use crate::error::ClassFileError;

/// Structure-only view of one compiled unit, borrowing the raw bytes.
#[derive(Debug)]
pub struct ThinClass<'a> {
    pub access_flags: u16,
    pub name: &'a str,
    pub super_name: Option<&'a str>,
    pub interfaces: Vec<&'a str>,
    pub methods: Vec<ThinMethod<'a>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ThinMethod<'a> {
    pub access_flags: u16,
    pub name: &'a str,
    pub descriptor: &'a str,
}

enum ThinCp<'a> {
    Utf8(&'a [u8]),
    Class { name_index: u16 },
    Other,
}

impl<'a> ThinClass<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u4()?;
        if magic != 0xCAFEBABE {
            return Err(ClassFileError::InvalidMagic(magic));
        }
        r.skip(4)?; // minor, major

        let cp = parse_thin_pool(&mut r)?;
        let utf8 = |index: u16| -> Result<&'a str, ClassFileError> {
            match cp.get(index as usize) {
                Some(ThinCp::Utf8(raw)) => {
                    std::str::from_utf8(raw).map_err(|_| ClassFileError::InvalidUtf8)
                }
                _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
            }
        };
        let class_name = |index: u16| -> Result<&'a str, ClassFileError> {
            match cp.get(index as usize) {
                Some(ThinCp::Class { name_index }) => utf8(*name_index),
                _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
            }
        };

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;
        let name = class_name(this_class)?;
        let super_name = if super_class == 0 { None } else { Some(class_name(super_class)?) };

        let interfaces_count = r.read_u2()? as usize;
        let mut interfaces = Vec::with_capacity(interfaces_count);
        for _ in 0..interfaces_count {
            interfaces.push(class_name(r.read_u2()?)?);
        }

        let fields_count = r.read_u2()? as usize;
        for _ in 0..fields_count {
            r.skip(6)?;
            skip_attributes(&mut r)?;
        }

        let methods_count = r.read_u2()? as usize;
        let mut methods = Vec::with_capacity(methods_count);
        for _ in 0..methods_count {
            let access_flags = r.read_u2()?;
            let name = utf8(r.read_u2()?)?;
            let descriptor = utf8(r.read_u2()?)?;
            skip_attributes(&mut r)?;
            methods.push(ThinMethod { access_flags, name, descriptor });
        }

        // Class-level attributes are irrelevant to matching; stop here.
        Ok(Self { access_flags, name, super_name, interfaces, methods })
    }
}

fn parse_thin_pool<'a>(r: &mut Reader<'a>) -> Result<Vec<ThinCp<'a>>, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(count);
    entries.push(ThinCp::Other); // index 0 unused

    let mut i = 1;
    while i < count {
        let tag = r.read_u1()?;
        match tag {
            1 => {
                let len = r.read_u2()? as usize;
                entries.push(ThinCp::Utf8(r.read_bytes(len)?));
            }
            7 => entries.push(ThinCp::Class { name_index: r.read_u2()? }),
            5 | 6 => {
                r.skip(8)?;
                entries.push(ThinCp::Other);
                entries.push(ThinCp::Other);
                i += 2;
                continue;
            }
            3 | 4 | 9 | 10 | 11 | 12 | 17 | 18 => {
                r.skip(4)?;
                entries.push(ThinCp::Other);
            }
            15 => {
                r.skip(3)?;
                entries.push(ThinCp::Other);
            }
            8 | 16 | 19 | 20 => {
                r.skip(2)?;
                entries.push(ThinCp::Other);
            }
            _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
        }
        i += 1;
    }
    Ok(entries)
}

fn skip_attributes(r: &mut Reader) -> Result<(), ClassFileError> {
    let count = r.read_u2()? as usize;
    for _ in 0..count {
        r.skip(2)?;
        let length = r.read_u4()? as usize;
        r.skip(length)?;
    }
    Ok(())
}
