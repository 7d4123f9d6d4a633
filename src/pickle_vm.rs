//! Capability-limited pickle virtual machine for PyTorch .pt files.
//!
//! PyTorch saves models as ZIP files containing:
//! - `archive/data.pkl`: pickle protocol 2+ stream describing the model structure
//! - `archive/data/N`: raw storage files containing tensor data
//!
//! The VM executes just enough of the pickle protocol to reconstruct that
//! structure as a [`Value`] graph. It never instantiates arbitrary classes:
//! `GLOBAL`/`STACK_GLOBAL` resolve through a closed allow-list of
//! [`Callable`]s (`collections.OrderedDict`, the `torch._utils` tensor
//! rebuild helpers, and the torch storage classes), and any other global
//! fails hard with [`Error::UnsupportedConstruct`]. Grammar violations and
//! resource-limit overruns fail with [`Error::CorruptCheckpoint`].

use std::collections::BTreeMap;
use std::io::Read;

use crate::error::Error;
use crate::models::DType;

/// Maximum size of the pickle stream and of any single bytes/string object (256 MiB).
const MAX_PICKLE_BYTES: usize = 256 * 1024 * 1024;

/// Maximum number of items on the pickle stack.
const MAX_STACK_SIZE: usize = 10_000_000;

/// Maximum number of entries in the pickle memo table.
const MAX_MEMO_SIZE: usize = 10_000_000;

/// Maximum number of opcodes to execute before aborting.
const MAX_OPCODES: usize = 50_000_000;

/// Maximum number of items in a single list/tuple/dict.
const MAX_CONTAINER_ITEMS: usize = 1_000_000;

/// A node in the parsed object graph (also the VM stack element).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    /// Mapping with insertion order and unique keys (Python dict semantics).
    Dict(Vec<(Value, Value)>),
    /// A rebuilt tensor view over a named storage.
    Tensor(TensorRef),
    /// A storage loaded through a persistent id.
    Storage(StorageRef),
    /// A resolved, allow-listed global.
    Callable(Callable),
    /// MARK sentinel, never part of a finished graph.
    Mark,
}

impl Value {
    /// Looks up a string key in a mapping node.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(pairs) => pairs.iter().find_map(|(k, v)| match k {
                Value::Str(s) if s == key => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Node kind for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Tensor(_) => "tensor",
            Value::Storage(_) => "storage",
            Value::Callable(_) => "callable",
            Value::Mark => "mark",
        }
    }
}

/// A tensor view: storage name plus the geometry needed to materialize it.
///
/// `stride` and `storage_offset` are in elements, not bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRef {
    pub storage_key: String,
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub stride: Vec<u64>,
    pub storage_offset: u64,
}

/// A typed storage reference: (key, dtype, element count).
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRef {
    pub key: String,
    pub dtype: DType,
    pub numel: u64,
}

/// The closed set of globals the VM will resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callable {
    /// `collections.OrderedDict`
    OrderedDict,
    /// `torch._utils._rebuild_tensor` and its `_v2`/`_v3`/`_v4` successors.
    RebuildTensor,
    /// `torch._utils._rebuild_parameter`; unwraps to the inner tensor.
    RebuildParameter,
    /// A `torch.*Storage` class.
    Storage(DType),
}

/// Parses a pickle stream into its root object graph.
///
/// The stream must end with a STOP opcode leaving exactly one value.
pub fn parse_pickle<R: Read>(reader: &mut R) -> Result<Value, Error> {
    let mut data = Vec::new();
    reader
        .take(MAX_PICKLE_BYTES as u64 + 1)
        .read_to_end(&mut data)?;
    if data.len() > MAX_PICKLE_BYTES {
        return Err(Error::CorruptCheckpoint(format!(
            "pickle stream exceeds {} byte limit",
            MAX_PICKLE_BYTES
        )));
    }

    let mut vm = PickleVM {
        data: &data,
        pos: 0,
        stack: Vec::new(),
        memo: BTreeMap::new(),
    };
    vm.execute()
}

struct PickleVM<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    memo: BTreeMap<u32, Value>,
}

fn eof() -> Error {
    Error::CorruptCheckpoint("unexpected end of pickle stream".into())
}

impl<'a> PickleVM<'a> {
    fn read_u8(&mut self) -> Result<u8, Error> {
        if self.pos >= self.data.len() {
            return Err(eof());
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn read_u16_le(&mut self) -> Result<u16, Error> {
        if self.pos + 2 > self.data.len() {
            return Err(eof());
        }
        let v = u16::from_le_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn read_u32_le(&mut self) -> Result<u32, Error> {
        if self.pos + 4 > self.data.len() {
            return Err(eof());
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32_le(&mut self) -> Result<i32, Error> {
        Ok(self.read_u32_le()? as i32)
    }

    fn read_u64_le(&mut self) -> Result<u64, Error> {
        if self.pos + 8 > self.data.len() {
            return Err(eof());
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if n > MAX_PICKLE_BYTES {
            return Err(Error::CorruptCheckpoint(format!(
                "pickle object size {} exceeds limit {}",
                n, MAX_PICKLE_BYTES
            )));
        }
        let end = self.pos.checked_add(n).ok_or_else(eof)?;
        if end > self.data.len() {
            return Err(eof());
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_string(&mut self, n: usize) -> Result<String, Error> {
        let bytes = self.read_bytes(n)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(Error::CorruptCheckpoint(
                "non-UTF-8 string in pickle stream".into(),
            )),
        }
    }

    fn read_text_line(&mut self) -> Result<String, Error> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != b'\n' {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return Err(eof());
        }
        let line = &self.data[start..self.pos];
        self.pos += 1; // skip '\n'
        match std::str::from_utf8(line) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(Error::CorruptCheckpoint(
                "non-UTF-8 text in pickle stream".into(),
            )),
        }
    }

    /// Pops an operand. A MARK here is a protocol violation.
    fn pop(&mut self) -> Result<Value, Error> {
        match self.stack.pop() {
            Some(Value::Mark) => Err(Error::CorruptCheckpoint(
                "unexpected MARK on the stack".into(),
            )),
            Some(value) => Ok(value),
            None => Err(Error::CorruptCheckpoint("stack underflow".into())),
        }
    }

    fn find_mark(&self) -> Option<usize> {
        for i in (0..self.stack.len()).rev() {
            if matches!(self.stack[i], Value::Mark) {
                return Some(i);
            }
        }
        None
    }

    fn pop_to_mark(&mut self) -> Result<Vec<Value>, Error> {
        let mark_idx = self.find_mark().ok_or_else(|| {
            Error::CorruptCheckpoint("MARK expected but not found on the stack".into())
        })?;
        let items: Vec<Value> = self.stack.drain(mark_idx + 1..).collect();
        self.stack.pop(); // remove Mark
        Ok(items)
    }

    fn memo_put(&mut self, idx: u32) -> Result<(), Error> {
        if self.memo.len() >= MAX_MEMO_SIZE {
            return Err(Error::CorruptCheckpoint("memo size limit exceeded".into()));
        }
        match self.stack.last() {
            Some(value) => {
                self.memo.insert(idx, value.clone());
                Ok(())
            }
            None => Err(Error::CorruptCheckpoint(
                "memo store with an empty stack".into(),
            )),
        }
    }

    fn memo_get(&mut self, idx: u32) -> Result<(), Error> {
        match self.memo.get(&idx) {
            Some(value) => {
                if value_node_count(value, MAX_CONTAINER_ITEMS) > MAX_CONTAINER_ITEMS {
                    return Err(Error::CorruptCheckpoint(
                        "memoized value too large to copy".into(),
                    ));
                }
                self.stack.push(value.clone());
                Ok(())
            }
            None => Err(Error::CorruptCheckpoint(format!("memo key {} is not set", idx))),
        }
    }

    fn execute(&mut self) -> Result<Value, Error> {
        let mut opcode_count: usize = 0;
        loop {
            opcode_count += 1;
            if opcode_count > MAX_OPCODES {
                return Err(Error::CorruptCheckpoint("opcode limit exceeded".into()));
            }

            let opcode = self.read_u8()?;

            match opcode {
                // PROTO
                0x80 => {
                    let _version = self.read_u8()?;
                }
                // FRAME
                0x95 => {
                    let frame_len = self.read_u64_le()? as usize;
                    let end = self.pos.checked_add(frame_len).ok_or_else(|| {
                        Error::CorruptCheckpoint("FRAME length exceeds data bounds".into())
                    })?;
                    if end > self.data.len() {
                        return Err(Error::CorruptCheckpoint(
                            "FRAME length exceeds data bounds".into(),
                        ));
                    }
                }
                // STOP
                0x2e => break,
                // MARK
                0x28 => self.stack.push(Value::Mark),
                // EMPTY_TUPLE
                0x29 => self.stack.push(Value::Tuple(Vec::new())),
                // EMPTY_LIST
                0x5d => self.stack.push(Value::List(Vec::new())),
                // EMPTY_DICT
                0x7d => self.stack.push(Value::Dict(Vec::new())),
                // NONE
                0x4e => self.stack.push(Value::None),
                // NEWTRUE
                0x88 => self.stack.push(Value::Bool(true)),
                // NEWFALSE
                0x89 => self.stack.push(Value::Bool(false)),
                // BININT
                0x4a => {
                    let v = self.read_i32_le()?;
                    self.stack.push(Value::Int(v as i64));
                }
                // BININT1
                0x4b => {
                    let v = self.read_u8()?;
                    self.stack.push(Value::Int(v as i64));
                }
                // BININT2
                0x4d => {
                    let v = self.read_u16_le()?;
                    self.stack.push(Value::Int(v as i64));
                }
                // LONG1
                0x8a => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?;
                    let val = long_from_bytes(bytes)?;
                    self.stack.push(Value::Int(val));
                }
                // BINFLOAT (big-endian f64)
                0x47 => {
                    let bytes = self.read_bytes(8)?;
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(bytes);
                    self.stack.push(Value::Float(f64::from_be_bytes(buf)));
                }
                // BINUNICODE (4-byte length)
                0x58 => {
                    let n = self.read_u32_le()? as usize;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                // SHORT_BINUNICODE (1-byte length)
                0x8c => {
                    let n = self.read_u8()? as usize;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                // BINUNICODE8 (8-byte length)
                0x8d => {
                    let n = self.read_u64_le()?;
                    let n = usize::try_from(n).map_err(|_| eof())?;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                // SHORT_BINSTRING
                0x55 => {
                    let n = self.read_u8()? as usize;
                    let s = self.read_string(n)?;
                    self.stack.push(Value::Str(s));
                }
                // SHORT_BINBYTES
                0x43 => {
                    let n = self.read_u8()? as usize;
                    let bytes = self.read_bytes(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                // BINBYTES
                0x44 => {
                    let n = self.read_u32_le()? as usize;
                    let bytes = self.read_bytes(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                // BINBYTES8
                0x8e => {
                    let n = self.read_u64_le()?;
                    let n = usize::try_from(n).map_err(|_| eof())?;
                    let bytes = self.read_bytes(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                // BYTEARRAY8 (protocol 5)
                0x96 => {
                    let n = self.read_u64_le()?;
                    let n = usize::try_from(n).map_err(|_| eof())?;
                    let bytes = self.read_bytes(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                // INT (text encoding; "00"/"01" are protocol-0 booleans)
                0x49 => {
                    let line = self.read_text_line()?;
                    let s = line.trim();
                    if s == "00" {
                        self.stack.push(Value::Bool(false));
                    } else if s == "01" {
                        self.stack.push(Value::Bool(true));
                    } else {
                        let v = s.parse::<i64>().map_err(|_| {
                            Error::CorruptCheckpoint(format!("invalid INT literal '{}'", s))
                        })?;
                        self.stack.push(Value::Int(v));
                    }
                }
                // GLOBAL (two newline-terminated lines: module, name)
                0x63 => {
                    let module = self.read_text_line()?;
                    let name = self.read_text_line()?;
                    let callable = resolve_global(&module, &name)?;
                    self.stack.push(Value::Callable(callable));
                }
                // STACK_GLOBAL
                0x93 => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => {
                            let callable = resolve_global(&module, &name)?;
                            self.stack.push(Value::Callable(callable));
                        }
                        _ => {
                            return Err(Error::CorruptCheckpoint(
                                "STACK_GLOBAL expects two strings".into(),
                            ));
                        }
                    }
                }
                // TUPLE1
                0x85 => {
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a]));
                }
                // TUPLE2
                0x86 => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b]));
                }
                // TUPLE3
                0x87 => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.stack.push(Value::Tuple(vec![a, b, c]));
                }
                // TUPLE (from MARK)
                0x74 => {
                    let items = self.pop_to_mark()?;
                    if items.len() > MAX_CONTAINER_ITEMS {
                        return Err(Error::CorruptCheckpoint("tuple size limit exceeded".into()));
                    }
                    self.stack.push(Value::Tuple(items));
                }
                // LIST (from MARK)
                0x6c => {
                    let items = self.pop_to_mark()?;
                    if items.len() > MAX_CONTAINER_ITEMS {
                        return Err(Error::CorruptCheckpoint("list size limit exceeded".into()));
                    }
                    self.stack.push(Value::List(items));
                }
                // DICT (from MARK)
                0x64 => {
                    let items = self.pop_to_mark()?;
                    let mut pairs = Vec::new();
                    for (key, value) in items_to_pairs(items)? {
                        dict_insert(&mut pairs, key, value)?;
                    }
                    self.stack.push(Value::Dict(pairs));
                }
                // REDUCE
                0x52 => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let result = reduce(callable, args)?;
                    self.stack.push(result);
                }
                // NEWOBJ (cls.__new__(cls, *args); same dispatch as REDUCE here)
                0x81 => {
                    let args = self.pop()?;
                    let cls = self.pop()?;
                    let result = reduce(cls, args)?;
                    self.stack.push(result);
                }
                // NEWOBJ_EX
                0x92 => {
                    let _kwargs = self.pop()?;
                    let args = self.pop()?;
                    let cls = self.pop()?;
                    let result = reduce(cls, args)?;
                    self.stack.push(result);
                }
                // BUILD
                0x62 => {
                    let state = self.pop()?;
                    let obj = self.pop()?;
                    let result = build(obj, state)?;
                    self.stack.push(result);
                }
                // BINPERSID
                0x51 => {
                    let pid = self.pop()?;
                    let result = persistent_load(pid)?;
                    self.stack.push(result);
                }
                // SETITEM
                0x73 => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    match self.stack.last_mut() {
                        Some(Value::Dict(pairs)) => dict_insert(pairs, key, value)?,
                        Some(other) => {
                            return Err(Error::CorruptCheckpoint(format!(
                                "SETITEM on {}",
                                other.type_name()
                            )));
                        }
                        None => {
                            return Err(Error::CorruptCheckpoint(
                                "stack underflow in SETITEM".into(),
                            ));
                        }
                    }
                }
                // SETITEMS
                0x75 => {
                    let items = self.pop_to_mark()?;
                    let pairs = items_to_pairs(items)?;
                    match self.stack.last_mut() {
                        Some(Value::Dict(existing)) => {
                            for (key, value) in pairs {
                                dict_insert(existing, key, value)?;
                            }
                        }
                        Some(other) => {
                            return Err(Error::CorruptCheckpoint(format!(
                                "SETITEMS on {}",
                                other.type_name()
                            )));
                        }
                        None => {
                            return Err(Error::CorruptCheckpoint(
                                "stack underflow in SETITEMS".into(),
                            ));
                        }
                    }
                }
                // APPEND
                0x61 => {
                    let value = self.pop()?;
                    match self.stack.last_mut() {
                        Some(Value::List(list)) => {
                            if list.len() >= MAX_CONTAINER_ITEMS {
                                return Err(Error::CorruptCheckpoint(
                                    "list size limit exceeded".into(),
                                ));
                            }
                            list.push(value);
                        }
                        Some(other) => {
                            return Err(Error::CorruptCheckpoint(format!(
                                "APPEND on {}",
                                other.type_name()
                            )));
                        }
                        None => {
                            return Err(Error::CorruptCheckpoint(
                                "stack underflow in APPEND".into(),
                            ));
                        }
                    }
                }
                // APPENDS
                0x65 => {
                    let items = self.pop_to_mark()?;
                    match self.stack.last_mut() {
                        Some(Value::List(list)) => {
                            if list.len() + items.len() > MAX_CONTAINER_ITEMS {
                                return Err(Error::CorruptCheckpoint(
                                    "list size limit exceeded".into(),
                                ));
                            }
                            list.extend(items);
                        }
                        Some(other) => {
                            return Err(Error::CorruptCheckpoint(format!(
                                "APPENDS on {}",
                                other.type_name()
                            )));
                        }
                        None => {
                            return Err(Error::CorruptCheckpoint(
                                "stack underflow in APPENDS".into(),
                            ));
                        }
                    }
                }
                // BINPUT
                0x71 => {
                    let idx = self.read_u8()? as u32;
                    self.memo_put(idx)?;
                }
                // LONG_BINPUT
                0x72 => {
                    let idx = self.read_u32_le()?;
                    self.memo_put(idx)?;
                }
                // MEMOIZE
                0x94 => {
                    let idx = self.memo.len() as u32;
                    self.memo_put(idx)?;
                }
                // BINGET
                0x68 => {
                    let idx = self.read_u8()? as u32;
                    self.memo_get(idx)?;
                }
                // LONG_BINGET
                0x6a => {
                    let idx = self.read_u32_le()?;
                    self.memo_get(idx)?;
                }
                // POP (removes whatever is on top, a MARK included)
                0x30 => {
                    if self.stack.pop().is_none() {
                        return Err(Error::CorruptCheckpoint("stack underflow in POP".into()));
                    }
                }
                // POP_MARK
                0x31 => {
                    self.pop_to_mark()?;
                }
                // DUP
                0x32 => match self.stack.last() {
                    Some(value) => {
                        if value_node_count(value, MAX_CONTAINER_ITEMS) > MAX_CONTAINER_ITEMS {
                            return Err(Error::CorruptCheckpoint(
                                "value too large to duplicate".into(),
                            ));
                        }
                        self.stack.push(value.clone());
                    }
                    None => {
                        return Err(Error::CorruptCheckpoint("stack underflow in DUP".into()));
                    }
                },
                // INST, OBJ: arbitrary class instantiation
                0x69 | 0x6f => {
                    return Err(Error::UnsupportedConstruct(
                        "pickle stream instantiates an arbitrary class".into(),
                    ));
                }
                // EXT1, EXT2, EXT4: extension registry lookups
                0x82..=0x84 => {
                    return Err(Error::UnsupportedConstruct(
                        "pickle extension registry is not supported".into(),
                    ));
                }
                // NEXT_BUFFER (protocol 5): out-of-band data never appears in .pt files
                0x97 => {
                    return Err(Error::UnsupportedConstruct(
                        "out-of-band pickle buffers are not supported".into(),
                    ));
                }
                other => {
                    return Err(Error::CorruptCheckpoint(format!(
                        "unknown opcode 0x{:02X} at position {}",
                        other,
                        self.pos - 1
                    )));
                }
            }

            if self.stack.len() > MAX_STACK_SIZE {
                return Err(Error::CorruptCheckpoint("stack size limit exceeded".into()));
            }
        }

        if self.stack.len() != 1 {
            return Err(Error::CorruptCheckpoint(format!(
                "pickle stream finished with {} values on the stack",
                self.stack.len()
            )));
        }
        match self.stack.pop() {
            Some(Value::Mark) => Err(Error::CorruptCheckpoint(
                "pickle stream finished with an unmatched MARK".into(),
            )),
            Some(root) => Ok(root),
            None => Err(Error::CorruptCheckpoint(
                "pickle stream produced no value".into(),
            )),
        }
    }
}

/// Resolves a global against the allow-list. Everything else is rejected.
fn resolve_global(module: &str, name: &str) -> Result<Callable, Error> {
    match (module, name) {
        ("collections", "OrderedDict") => Ok(Callable::OrderedDict),
        (
            "torch._utils",
            "_rebuild_tensor" | "_rebuild_tensor_v2" | "_rebuild_tensor_v3"
            | "_rebuild_tensor_v4",
        ) => Ok(Callable::RebuildTensor),
        ("torch._utils", "_rebuild_parameter") => Ok(Callable::RebuildParameter),
        ("torch", class_name) => match storage_class_to_dtype(class_name) {
            Some(dtype) => Ok(Callable::Storage(dtype)),
            None => Err(Error::UnsupportedConstruct(format!(
                "global '{}.{}' is not allowed",
                module, name
            ))),
        },
        _ => Err(Error::UnsupportedConstruct(format!(
            "global '{}.{}' is not allowed",
            module, name
        ))),
    }
}

fn storage_class_to_dtype(name: &str) -> Option<DType> {
    match name {
        "DoubleStorage" => Some(DType::F64),
        "FloatStorage" => Some(DType::F32),
        "HalfStorage" => Some(DType::F16),
        "BFloat16Storage" => Some(DType::BF16),
        "LongStorage" => Some(DType::I64),
        "IntStorage" => Some(DType::I32),
        "ShortStorage" => Some(DType::I16),
        "CharStorage" => Some(DType::I8),
        "ByteStorage" => Some(DType::U8),
        "BoolStorage" => Some(DType::Bool),
        "ComplexFloatStorage" => Some(DType::C64),
        "ComplexDoubleStorage" => Some(DType::C128),
        _ => None,
    }
}

fn reduce(callable: Value, args: Value) -> Result<Value, Error> {
    let callable = match callable {
        Value::Callable(callable) => callable,
        other => {
            return Err(Error::CorruptCheckpoint(format!(
                "REDUCE on {}",
                other.type_name()
            )));
        }
    };
    let args = match args {
        Value::Tuple(items) => items,
        other => {
            return Err(Error::CorruptCheckpoint(format!(
                "REDUCE arguments must be a tuple, got {}",
                other.type_name()
            )));
        }
    };

    match callable {
        Callable::OrderedDict => ordered_dict_from_args(args),
        Callable::RebuildTensor => rebuild_tensor(&args),
        Callable::RebuildParameter => rebuild_parameter(args),
        Callable::Storage(_) => Err(Error::UnsupportedConstruct(
            "storage objects can only come from persistent ids".into(),
        )),
    }
}

/// `OrderedDict()` or `OrderedDict([(key, value), ...])`.
fn ordered_dict_from_args(mut args: Vec<Value>) -> Result<Value, Error> {
    if args.is_empty() {
        return Ok(Value::Dict(Vec::new()));
    }
    match args.swap_remove(0) {
        Value::List(items) => {
            let mut pairs = Vec::new();
            for item in items {
                match item {
                    Value::Tuple(mut kv) if kv.len() == 2 => {
                        // pop order: value, then key
                        if let (Some(value), Some(key)) = (kv.pop(), kv.pop()) {
                            dict_insert(&mut pairs, key, value)?;
                        }
                    }
                    other => {
                        return Err(Error::CorruptCheckpoint(format!(
                            "OrderedDict items must be key/value pairs, got {}",
                            other.type_name()
                        )));
                    }
                }
            }
            Ok(Value::Dict(pairs))
        }
        other => Err(Error::CorruptCheckpoint(format!(
            "OrderedDict argument must be a list, got {}",
            other.type_name()
        ))),
    }
}

/// `_rebuild_tensor*(storage, storage_offset, size[, stride, ...])`.
fn rebuild_tensor(args: &[Value]) -> Result<Value, Error> {
    if args.len() < 3 {
        return Err(Error::CorruptCheckpoint(format!(
            "tensor rebuild expects at least 3 arguments, got {}",
            args.len()
        )));
    }

    let storage = match &args[0] {
        Value::Storage(storage) => storage.clone(),
        other => {
            return Err(Error::CorruptCheckpoint(format!(
                "tensor rebuild expects a storage, got {}",
                other.type_name()
            )));
        }
    };
    let storage_offset = match &args[1] {
        Value::Int(v) if *v >= 0 => *v as u64,
        other => {
            return Err(Error::CorruptCheckpoint(format!(
                "tensor storage offset must be a non-negative integer, got {}",
                other.type_name()
            )));
        }
    };
    let shape = int_tuple(&args[2], "shape")?;
    let stride = match args.get(3) {
        Some(value) => {
            let stride = int_tuple(value, "stride")?;
            if stride.len() != shape.len() {
                return Err(Error::CorruptCheckpoint(format!(
                    "tensor stride rank {} does not match shape rank {}",
                    stride.len(),
                    shape.len()
                )));
            }
            stride
        }
        None => contiguous_strides(&shape),
    };

    Ok(Value::Tensor(TensorRef {
        storage_key: storage.key,
        dtype: storage.dtype,
        shape,
        stride,
        storage_offset,
    }))
}

/// Reads a tuple (or list) of non-negative integers, for shapes and strides.
fn int_tuple(value: &Value, what: &str) -> Result<Vec<u64>, Error> {
    let items = match value {
        Value::Tuple(items) | Value::List(items) => items,
        other => {
            return Err(Error::CorruptCheckpoint(format!(
                "tensor {} must be a tuple, got {}",
                what,
                other.type_name()
            )));
        }
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Int(v) if *v >= 0 => out.push(*v as u64),
            other => {
                return Err(Error::CorruptCheckpoint(format!(
                    "tensor {} must hold non-negative integers, got {}",
                    what,
                    other.type_name()
                )));
            }
        }
    }
    Ok(out)
}

/// `_rebuild_parameter(tensor, requires_grad, hooks)`: the parameter wrapper
/// is transparent here, only the inner tensor matters.
fn rebuild_parameter(mut args: Vec<Value>) -> Result<Value, Error> {
    if args.is_empty() {
        return Err(Error::CorruptCheckpoint(
            "parameter rebuild expects a tensor argument".into(),
        ));
    }
    match args.swap_remove(0) {
        tensor @ Value::Tensor(_) => Ok(tensor),
        other => Err(Error::CorruptCheckpoint(format!(
            "parameter rebuild expects a tensor, got {}",
            other.type_name()
        ))),
    }
}

fn build(obj: Value, state: Value) -> Result<Value, Error> {
    match (obj, state) {
        (obj, Value::None) => Ok(obj),
        (Value::Dict(mut pairs), Value::Dict(state_pairs)) => {
            for (key, value) in state_pairs {
                dict_insert(&mut pairs, key, value)?;
            }
            Ok(Value::Dict(pairs))
        }
        // (state, slotstate) form; each part is None or a dict of fields
        (Value::Dict(mut pairs), Value::Tuple(parts)) if parts.len() == 2 => {
            for part in parts {
                match part {
                    Value::None => {}
                    Value::Dict(state_pairs) => {
                        for (key, value) in state_pairs {
                            dict_insert(&mut pairs, key, value)?;
                        }
                    }
                    other => {
                        return Err(Error::CorruptCheckpoint(format!(
                            "BUILD state tuple holds {}",
                            other.type_name()
                        )));
                    }
                }
            }
            Ok(Value::Dict(pairs))
        }
        (obj, state) => Err(Error::CorruptCheckpoint(format!(
            "BUILD cannot apply {} state to {}",
            state.type_name(),
            obj.type_name()
        ))),
    }
}

/// PyTorch persistent id: `("storage", storage_class, key, device, numel)`,
/// or the legacy form without the leading tag.
fn persistent_load(pid: Value) -> Result<Value, Error> {
    let items = match pid {
        Value::Tuple(items) => items,
        other => {
            return Err(Error::UnsupportedConstruct(format!(
                "persistent id must be a tuple, got {}",
                other.type_name()
            )));
        }
    };

    let fields: &[Value] = match items.first() {
        Some(Value::Str(tag)) if tag == "storage" => {
            if items.len() != 5 {
                return Err(Error::UnsupportedConstruct(format!(
                    "storage persistent id has {} fields, expected 5",
                    items.len()
                )));
            }
            &items[1..]
        }
        _ => {
            if items.len() != 4 {
                return Err(Error::UnsupportedConstruct(
                    "persistent id is not a storage reference".into(),
                ));
            }
            &items[..]
        }
    };

    let dtype = match &fields[0] {
        Value::Callable(Callable::Storage(dtype)) => *dtype,
        other => {
            return Err(Error::UnsupportedConstruct(format!(
                "persistent id does not name a storage class, got {}",
                other.type_name()
            )));
        }
    };
    let key = match &fields[1] {
        Value::Str(key) => key.clone(),
        other => {
            return Err(Error::CorruptCheckpoint(format!(
                "storage key must be a string, got {}",
                other.type_name()
            )));
        }
    };
    // fields[2] is the device location, irrelevant for conversion
    let numel = match &fields[3] {
        Value::Int(v) if *v >= 0 => *v as u64,
        other => {
            return Err(Error::CorruptCheckpoint(format!(
                "storage element count must be a non-negative integer, got {}",
                other.type_name()
            )));
        }
    };

    Ok(Value::Storage(StorageRef { key, dtype, numel }))
}

/// Inserts into an ordered pair list with Python dict semantics: replacing
/// an existing key keeps its original position.
fn dict_insert(pairs: &mut Vec<(Value, Value)>, key: Value, value: Value) -> Result<(), Error> {
    for pair in pairs.iter_mut() {
        if pair.0 == key {
            pair.1 = value;
            return Ok(());
        }
    }
    if pairs.len() >= MAX_CONTAINER_ITEMS {
        return Err(Error::CorruptCheckpoint("dict size limit exceeded".into()));
    }
    pairs.push((key, value));
    Ok(())
}

fn items_to_pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>, Error> {
    if items.len() % 2 != 0 {
        return Err(Error::CorruptCheckpoint(
            "dict items come in key/value pairs".into(),
        ));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn long_from_bytes(bytes: &[u8]) -> Result<i64, Error> {
    if bytes.is_empty() {
        return Ok(0);
    }
    if bytes.len() > 8 {
        return Err(Error::CorruptCheckpoint(
            "LONG1 integer wider than 64 bits".into(),
        ));
    }
    let mut val: i64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        val |= (b as i64) << (i * 8);
    }
    // Sign extend based on the most significant byte
    let bits = bytes.len() * 8;
    if bits < 64 && bytes[bytes.len() - 1] & 0x80 != 0 {
        val |= !0i64 << bits;
    }
    Ok(val)
}

/// Counts nodes in a value tree (iteratively, to avoid stack overflow),
/// returning early once `limit` is exceeded.
fn value_node_count(val: &Value, limit: usize) -> usize {
    let mut count = 0usize;
    let mut work = vec![val];
    while let Some(v) = work.pop() {
        count += 1;
        if count > limit {
            return count;
        }
        match v {
            Value::List(items) | Value::Tuple(items) => {
                work.extend(items.iter());
            }
            Value::Dict(pairs) => {
                for (k, v) in pairs {
                    work.push(k);
                    work.push(v);
                }
            }
            _ => {}
        }
    }
    count
}

/// Row-major strides for a contiguous tensor of the given shape.
pub(crate) fn contiguous_strides(shape: &[u64]) -> Vec<u64> {
    let mut strides = vec![1u64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1].saturating_mul(shape[i + 1]);
    }
    strides
}
