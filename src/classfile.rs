//! The parsed class-file view the core consumes.
//!
//! Nothing here reads `.class` binary format: this module is the seam
//! between an out-of-scope binary reader and the per-method pipeline in
//! [`crate::pipeline`]. Hosts construct a [`ClassFile`] however they like;
//! tests build one by hand, the same way the teacher crate's own tests
//! hand-build `tir::Program` values instead of running a parser.

use crate::common::Id;

/// A value type in this language: integers and booleans share the integer
/// representation, and there is a distinct void for method returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Void,
}

/// A JVM-style method descriptor, `(T*)R`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub params: Vec<ValueType>,
    pub ret: ValueType,
}

impl Descriptor {
    /// Parse a descriptor of the form `(T*)R`, one character per type.
    ///
    /// This is the fixed version of the bug called out in the design notes:
    /// every parameter gets its own character instead of all of them sharing
    /// the first one.
    pub fn parse(s: &str) -> Option<Descriptor> {
        let s = s.strip_prefix('(')?;
        let (params_str, ret_str) = s.split_once(')')?;
        let params = params_str
            .chars()
            .map(ValueType::from_char)
            .collect::<Option<Vec<_>>>()?;
        let ret = match ret_str.chars().next() {
            Some(c) => ValueType::from_char(c)?,
            None => return None,
        };
        Some(Descriptor { params, ret })
    }

    pub fn arg_count(&self) -> usize {
        self.params.len()
    }
}

impl ValueType {
    fn from_char(c: char) -> Option<ValueType> {
        match c {
            // Booleans share the integer representation (§3: type tag "I"
            // covers integer/boolean), so `Z` collapses to `Int` on parse.
            'I' | 'Z' => Some(ValueType::Int),
            'V' => Some(ValueType::Void),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            ValueType::Int => 'I',
            ValueType::Void => 'V',
        }
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for p in &self.params {
            write!(f, "{}", p.as_char())?;
        }
        write!(f, "){}", self.ret.as_char())
    }
}

/// One entry of the constant pool: either an integer literal or a reference
/// to a static method by name and descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConstEntry {
    Integer(i32),
    MethodRef { name: Id, descriptor: Descriptor },
}

/// A method's constant pool, addressable by `u16` index.
#[derive(Clone, Debug, Default)]
pub struct ConstantPool {
    entries: Vec<ConstEntry>,
}

impl ConstantPool {
    pub fn new(entries: Vec<ConstEntry>) -> Self {
        ConstantPool { entries }
    }

    pub fn get(&self, index: u16) -> Option<&ConstEntry> {
        self.entries.get(index as usize)
    }

    pub fn integer(&self, index: u16) -> Option<i32> {
        match self.get(index) {
            Some(ConstEntry::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn method_ref(&self, index: u16) -> Option<(Id, &Descriptor)> {
        match self.get(index) {
            Some(ConstEntry::MethodRef { name, descriptor }) => Some((*name, descriptor)),
            _ => None,
        }
    }
}

/// One method's raw code and metadata, as the core sees it.
#[derive(Clone, Debug)]
pub struct MethodDef {
    pub name: Id,
    pub descriptor: Descriptor,
    pub code: Vec<u8>,
    pub max_locals: u16,
    pub constants: ConstantPool,
}

impl MethodDef {
    /// The three I/O methods are recognized by name and descriptor and must
    /// never be lowered as ordinary calls.
    pub fn is_io(name: &str, descriptor: &Descriptor) -> bool {
        matches!(
            (name, descriptor.params.as_slice(), descriptor.ret),
            ("read", [], ValueType::Int)
                | ("write", [ValueType::Int], ValueType::Void)
        )
    }
}

/// A parsed source file: an ordered list of methods compiled in source order.
#[derive(Clone, Debug, Default)]
pub struct ClassFile {
    pub source_file: String,
    pub methods: Vec<MethodDef>,
}

impl ClassFile {
    /// Parse the minimal line-oriented text notation `nanoc` accepts at its
    /// input seam. This is not a binary class-file reader — just enough glue
    /// for a host to hand-author a class file on disk instead of embedding
    /// one in Rust source:
    ///
    /// ```text
    /// .source hello.src
    /// .method read ()I
    /// .endmethod
    /// .method fact (I)I maxlocals=2
    /// .const int 1
    /// .code 01 04 01 03 01 1a
    /// .endmethod
    /// ```
    pub fn parse_text(text: &str) -> Option<ClassFile> {
        let mut source_file = String::new();
        let mut methods = Vec::new();

        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty() && !l.starts_with('#'));

        let mut current: Option<(crate::common::Id, Descriptor, u16, Vec<ConstEntry>, Vec<u8>)> = None;

        while let Some(line) = lines.next() {
            let mut parts = line.split_whitespace();
            match parts.next()? {
                ".source" => source_file = parts.next()?.to_string(),
                ".method" => {
                    let name = internment::Intern::new(parts.next()?.to_string());
                    let descriptor = Descriptor::parse(parts.next()?)?;
                    let max_locals = parts
                        .next()
                        .and_then(|s| s.strip_prefix("maxlocals="))
                        .and_then(|n| n.parse().ok())
                        .unwrap_or(0);
                    current = Some((name, descriptor, max_locals, Vec::new(), Vec::new()));
                }
                ".const" => {
                    let (_, _, _, consts, _) = current.as_mut()?;
                    match parts.next()? {
                        "int" => consts.push(ConstEntry::Integer(parts.next()?.parse().ok()?)),
                        "methodref" => {
                            let name = internment::Intern::new(parts.next()?.to_string());
                            let descriptor = Descriptor::parse(parts.next()?)?;
                            consts.push(ConstEntry::MethodRef { name, descriptor });
                        }
                        _ => return None,
                    }
                }
                ".code" => {
                    let (_, _, _, _, code) = current.as_mut()?;
                    for byte in parts {
                        code.push(u8::from_str_radix(byte, 16).ok()?);
                    }
                }
                ".endmethod" => {
                    let (name, descriptor, max_locals, consts, code) = current.take()?;
                    methods.push(MethodDef {
                        name,
                        descriptor,
                        code,
                        max_locals,
                        constants: ConstantPool::new(consts),
                    });
                }
                _ => return None,
            }
        }

        if current.is_some() {
            return None; // a .method block with no matching .endmethod
        }

        Some(ClassFile { source_file, methods })
    }
}
