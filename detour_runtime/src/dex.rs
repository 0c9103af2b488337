//! Dex-level method data.
//!
//! Only the pieces the runtime consults after loading are modeled: string,
//! type, prototype and method id tables, plus code items with their try
//! ranges and catch handlers. Parsing is out of scope; files are assembled
//! with [`DexFileBuilder`].
//!
//! # Layout
//!
//! ```text
//! DexFile
//! ├── strings:    Vec<String>        (string_idx -> text)
//! ├── type_ids:   Vec<u32>           (type_idx -> descriptor string_idx)
//! ├── protos:     Vec<ProtoId>       (proto_idx -> shorty, return, params)
//! ├── method_ids: Vec<MethodId>      (method_idx -> class, proto, name)
//! └── code_items: offset -> CodeItem (offset 0 means "no body")
//! ```

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Sentinel for a missing 32-bit index.
pub const NO_INDEX: u32 = u32::MAX;

/// Instruction opcodes the runtime inspects.
pub mod opcodes {
    /// `nop`.
    pub const NOP: u8 = 0x00;
    /// `move-result`.
    pub const MOVE_RESULT: u8 = 0x0a;
    /// `move-exception`: first instruction of a handler that reads the exception.
    pub const MOVE_EXCEPTION: u8 = 0x0d;
    /// `return-void`.
    pub const RETURN_VOID: u8 = 0x0e;
    /// `return`.
    pub const RETURN: u8 = 0x0f;
    /// `throw`.
    pub const THROW: u8 = 0x27;
}

// =============================================================================
// Descriptors
// =============================================================================

/// Shorty character of a type descriptor (`L` for every reference type).
pub fn shorty_char(descriptor: &str) -> char {
    match descriptor.chars().next() {
        Some('[') | Some('L') | None => 'L',
        Some(c) => c,
    }
}

/// `Lcom/example/Foo;` to `com.example.Foo`. Other descriptors are returned
/// with slashes replaced.
pub fn descriptor_to_dot(descriptor: &str) -> String {
    let inner = descriptor
        .strip_prefix('L')
        .and_then(|d| d.strip_suffix(';'))
        .unwrap_or(descriptor);
    inner.replace('/', ".")
}

/// Human-readable type name, e.g. `int[]` or `java.lang.String`.
pub fn pretty_descriptor(descriptor: &str) -> String {
    let dims = descriptor.chars().take_while(|&c| c == '[').count();
    let element = &descriptor[dims..];
    let mut name = match element {
        "V" => "void".to_owned(),
        "Z" => "boolean".to_owned(),
        "B" => "byte".to_owned(),
        "C" => "char".to_owned(),
        "S" => "short".to_owned(),
        "I" => "int".to_owned(),
        "J" => "long".to_owned(),
        "F" => "float".to_owned(),
        "D" => "double".to_owned(),
        other => descriptor_to_dot(other),
    };
    for _ in 0..dims {
        name.push_str("[]");
    }
    name
}

// =============================================================================
// Code Items
// =============================================================================

/// One catch clause of a try range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchHandler {
    /// Caught exception type, or `None` for a catch-all.
    pub type_idx: Option<u16>,
    /// Dex pc of the handler.
    pub address: u32,
}

/// A guarded instruction range and its handlers, in match order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryItem {
    /// First guarded dex pc.
    pub start_addr: u32,
    /// Number of guarded code units.
    pub insn_count: u16,
    /// Handlers tried in order.
    pub handlers: Vec<CatchHandler>,
}

impl TryItem {
    /// Check if the range covers `dex_pc`.
    #[inline]
    pub fn covers(&self, dex_pc: u32) -> bool {
        dex_pc >= self.start_addr && dex_pc < self.start_addr + u32::from(self.insn_count)
    }
}

/// Bytecode body of a method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeItem {
    /// Register count.
    pub registers_size: u16,
    /// Incoming argument registers.
    pub ins_size: u16,
    /// Outgoing argument registers.
    pub outs_size: u16,
    /// Code units.
    pub insns: Vec<u16>,
    /// Try ranges, sorted by start address.
    pub tries: Vec<TryItem>,
}

impl CodeItem {
    /// Create a body with no try ranges.
    pub fn new(registers_size: u16, ins_size: u16, insns: Vec<u16>) -> Self {
        Self {
            registers_size,
            ins_size,
            outs_size: 0,
            insns,
            tries: Vec::new(),
        }
    }

    /// Add a try range.
    pub fn with_try(mut self, start_addr: u32, insn_count: u16, handlers: Vec<CatchHandler>) -> Self {
        self.tries.push(TryItem {
            start_addr,
            insn_count,
            handlers,
        });
        self.tries.sort_by_key(|t| t.start_addr);
        self
    }

    /// Handlers guarding `dex_pc`, in match order.
    pub fn catch_handlers(&self, dex_pc: u32) -> &[CatchHandler] {
        self.tries
            .iter()
            .find(|t| t.covers(dex_pc))
            .map(|t| t.handlers.as_slice())
            .unwrap_or(&[])
    }

    /// Opcode of the instruction at `dex_pc`.
    #[inline]
    pub fn opcode_at(&self, dex_pc: u32) -> Option<u8> {
        self.insns.get(dex_pc as usize).map(|unit| (unit & 0xff) as u8)
    }
}

// =============================================================================
// Dex File
// =============================================================================

/// Method id: declaring type, prototype and name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodId {
    /// Declaring type index.
    pub class_idx: u16,
    /// Prototype index.
    pub proto_idx: u16,
    /// Name string index.
    pub name_idx: u32,
}

/// Method prototype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtoId {
    /// Shorty string index.
    pub shorty_idx: u32,
    /// Return type index.
    pub return_type_idx: u16,
    /// Parameter type indices.
    pub parameters: SmallVec<[u16; 4]>,
}

/// An immutable, loaded dex file.
#[derive(Debug)]
pub struct DexFile {
    location: String,
    strings: Vec<String>,
    string_index: FxHashMap<String, u32>,
    type_ids: Vec<u32>,
    protos: Vec<ProtoId>,
    method_ids: Vec<MethodId>,
    code_items: FxHashMap<u32, Arc<CodeItem>>,
}

impl DexFile {
    /// Start assembling a dex file.
    pub fn builder(location: impl Into<String>) -> DexFileBuilder {
        DexFileBuilder::new(location)
    }

    /// Location the file was loaded from.
    #[inline]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// String by index.
    #[inline]
    pub fn string(&self, idx: u32) -> Option<&str> {
        self.strings.get(idx as usize).map(String::as_str)
    }

    /// Type descriptor by type index.
    pub fn type_descriptor(&self, type_idx: u16) -> Option<&str> {
        self.type_ids
            .get(usize::from(type_idx))
            .and_then(|&s| self.string(s))
    }

    /// Method id by index.
    #[inline]
    pub fn method_id(&self, method_idx: u32) -> Option<&MethodId> {
        self.method_ids.get(method_idx as usize)
    }

    /// Prototype by index.
    #[inline]
    pub fn proto(&self, proto_idx: u16) -> Option<&ProtoId> {
        self.protos.get(usize::from(proto_idx))
    }

    /// Number of method ids.
    #[inline]
    pub fn num_method_ids(&self) -> usize {
        self.method_ids.len()
    }

    /// Method name.
    pub fn method_name(&self, method_idx: u32) -> Option<&str> {
        self.method_id(method_idx).and_then(|m| self.string(m.name_idx))
    }

    /// Method shorty.
    pub fn method_shorty(&self, method_idx: u32) -> Option<&str> {
        self.method_proto(method_idx)
            .and_then(|p| self.string(p.shorty_idx))
    }

    /// Prototype of a method.
    pub fn method_proto(&self, method_idx: u32) -> Option<&ProtoId> {
        self.method_id(method_idx).and_then(|m| self.proto(m.proto_idx))
    }

    /// Descriptor of the method's declaring type.
    pub fn method_declaring_descriptor(&self, method_idx: u32) -> Option<&str> {
        self.method_id(method_idx)
            .and_then(|m| self.type_descriptor(m.class_idx))
    }

    /// Method signature, e.g. `(ILjava/lang/String;)V`.
    pub fn method_signature(&self, method_idx: u32) -> Option<String> {
        let proto = self.method_proto(method_idx)?;
        let mut signature = String::from("(");
        for &param in &proto.parameters {
            signature.push_str(self.type_descriptor(param)?);
        }
        signature.push(')');
        signature.push_str(self.type_descriptor(proto.return_type_idx)?);
        Some(signature)
    }

    /// Look up a string index.
    #[inline]
    pub fn find_string_id(&self, s: &str) -> Option<u32> {
        self.string_index.get(s).copied()
    }

    /// Look up a type index by descriptor.
    pub fn find_type_id(&self, descriptor: &str) -> Option<u16> {
        let string_idx = self.find_string_id(descriptor)?;
        self.type_ids
            .iter()
            .position(|&s| s == string_idx)
            .and_then(|pos| u16::try_from(pos).ok())
    }

    /// Look up a prototype by return and parameter type indices.
    pub fn find_proto_id(&self, return_type_idx: u16, parameters: &[u16]) -> Option<u16> {
        self.protos
            .iter()
            .position(|p| p.return_type_idx == return_type_idx && p.parameters.as_slice() == parameters)
            .and_then(|pos| u16::try_from(pos).ok())
    }

    /// Look up a method index.
    pub fn find_method_id(&self, class_idx: u16, name_idx: u32, proto_idx: u16) -> Option<u32> {
        self.method_ids
            .iter()
            .position(|m| m.class_idx == class_idx && m.name_idx == name_idx && m.proto_idx == proto_idx)
            .and_then(|pos| u32::try_from(pos).ok())
    }

    /// Code item at `offset`. Offset 0 never has one.
    pub fn code_item(&self, offset: u32) -> Option<Arc<CodeItem>> {
        if offset == 0 {
            return None;
        }
        self.code_items.get(&offset).cloned()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// First code item offset handed out by the builder.
const FIRST_CODE_OFFSET: u32 = 0x70;

/// Assembles a [`DexFile`].
#[derive(Debug)]
pub struct DexFileBuilder {
    location: String,
    strings: Vec<String>,
    string_index: FxHashMap<String, u32>,
    type_ids: Vec<u32>,
    type_index: FxHashMap<u32, u16>,
    protos: Vec<ProtoId>,
    method_ids: Vec<MethodId>,
    code_items: FxHashMap<u32, Arc<CodeItem>>,
    next_code_offset: u32,
}

impl DexFileBuilder {
    /// Create an empty builder.
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            strings: Vec::new(),
            string_index: FxHashMap::default(),
            type_ids: Vec::new(),
            type_index: FxHashMap::default(),
            protos: Vec::new(),
            method_ids: Vec::new(),
            code_items: FxHashMap::default(),
            next_code_offset: FIRST_CODE_OFFSET,
        }
    }

    /// Intern a string.
    pub fn add_string(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.string_index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_owned());
        self.string_index.insert(s.to_owned(), idx);
        idx
    }

    /// Intern a type descriptor.
    pub fn add_type(&mut self, descriptor: &str) -> u16 {
        let string_idx = self.add_string(descriptor);
        if let Some(&idx) = self.type_index.get(&string_idx) {
            return idx;
        }
        let idx = self.type_ids.len() as u16;
        self.type_ids.push(string_idx);
        self.type_index.insert(string_idx, idx);
        idx
    }

    /// Intern a prototype.
    pub fn add_proto(&mut self, return_type: &str, parameters: &[&str]) -> u16 {
        let return_type_idx = self.add_type(return_type);
        let params: SmallVec<[u16; 4]> = parameters.iter().map(|p| self.add_type(p)).collect();
        if let Some(pos) = self
            .protos
            .iter()
            .position(|p| p.return_type_idx == return_type_idx && p.parameters == params)
        {
            return pos as u16;
        }

        let shorty: String = std::iter::once(return_type)
            .chain(parameters.iter().copied())
            .map(shorty_char)
            .collect();
        let shorty_idx = self.add_string(&shorty);
        self.protos.push(ProtoId {
            shorty_idx,
            return_type_idx,
            parameters: params,
        });
        (self.protos.len() - 1) as u16
    }

    /// Add a method id and return its index.
    pub fn add_method(&mut self, class: &str, name: &str, return_type: &str, parameters: &[&str]) -> u32 {
        let class_idx = self.add_type(class);
        let proto_idx = self.add_proto(return_type, parameters);
        let name_idx = self.add_string(name);
        let id = MethodId {
            class_idx,
            proto_idx,
            name_idx,
        };
        if let Some(pos) = self.method_ids.iter().position(|m| *m == id) {
            return pos as u32;
        }
        self.method_ids.push(id);
        (self.method_ids.len() - 1) as u32
    }

    /// Add a code item and return its offset.
    pub fn add_code_item(&mut self, item: CodeItem) -> u32 {
        let offset = self.next_code_offset;
        // 16-byte header, then two bytes per code unit, 4-byte aligned.
        let size = 16 + (item.insns.len() as u32 * 2).next_multiple_of(4);
        self.next_code_offset += size;
        self.code_items.insert(offset, Arc::new(item));
        offset
    }

    /// Finish the file.
    pub fn build(self) -> Arc<DexFile> {
        Arc::new(DexFile {
            location: self.location,
            strings: self.strings,
            string_index: self.string_index,
            type_ids: self.type_ids,
            protos: self.protos,
            method_ids: self.method_ids,
            code_items: self.code_items,
        })
    }
}
