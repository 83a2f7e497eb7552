//! Runtime value representation

pub mod error;

pub use error::{ValueError, ValueResult};

use crate::env::Environment;
use crate::runtime::{ChannelId, TaskId};
use crate::types::{Type, TypeTag};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Hashable key for dict values.
///
/// Keys compare by value equality; integer keys are normalized across widths
/// so `1` stored through an `I8` and looked up through an `I64` address the
/// same slot. Float keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    Nil,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
}

impl DictKey {
    pub fn from_value(value: &Value) -> ValueResult<DictKey> {
        match value {
            Value::Nil => Ok(DictKey::Nil),
            Value::Bool(b) => Ok(DictKey::Bool(*b)),
            Value::I8(n) => Ok(DictKey::Int(*n as i64)),
            Value::I16(n) => Ok(DictKey::Int(*n as i64)),
            Value::I32(n) => Ok(DictKey::Int(*n as i64)),
            Value::I64(n) => Ok(DictKey::Int(*n)),
            Value::U8(n) => Ok(DictKey::Int(*n as i64)),
            Value::U16(n) => Ok(DictKey::Int(*n as i64)),
            Value::U32(n) => Ok(DictKey::Int(*n as i64)),
            Value::U64(n) => {
                if *n <= i64::MAX as u64 {
                    Ok(DictKey::Int(*n as i64))
                } else {
                    Ok(DictKey::UInt(*n))
                }
            }
            Value::String(s) => Ok(DictKey::Str(s.clone())),
            other => Err(ValueError::TypeError {
                expected: "hashable key (nil, bool, integer, string)",
                actual: other.type_name(),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DictKey::Nil => Value::Nil,
            DictKey::Bool(b) => Value::Bool(*b),
            DictKey::Int(n) => Value::I64(*n),
            DictKey::UInt(n) => Value::U64(*n),
            DictKey::Str(s) => Value::String(s.clone()),
        }
    }
}

/// Backing storage for dict values. Insertion order is not guaranteed.
#[derive(Debug, Clone, Default)]
pub struct DictValue {
    pub entries: FxHashMap<DictKey, Value>,
}

impl DictValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DictKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: DictKey, value: Value) {
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: &DictKey) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A language-level error: the payload of the error arm of an error union.
///
/// Round-trips its error-type name, message, arguments and source line
/// unchanged regardless of how it was allocated.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub error_type: String,
    pub message: String,
    pub arguments: Vec<Value>,
    pub line: u32,
}

impl ErrorValue {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>, line: u32) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            arguments: Vec::new(),
            line,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<Value>) -> Self {
        self.arguments = arguments;
        self
    }
}

impl std::fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.error_type)
        } else {
            write!(f, "{}: {}", self.error_type, self.message)
        }
    }
}

/// Active arm of an error union. The discriminant is explicit: the VM never
/// re-derives which arm is live by inspecting payload shape.
#[derive(Debug, Clone, PartialEq)]
pub enum UnionState {
    Ok(Value),
    Err(ErrorValue),
}

/// A user function's location in the flat instruction array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionValue {
    pub name: String,
    /// Address of the first body instruction
    pub start: usize,
    /// Address of the matching end marker
    pub end: usize,
    /// Whether the function participates in the error-union calling convention
    pub can_fail: bool,
}

/// A function bundled with a snapshot of named outer-scope bindings.
///
/// The captured environment has no enclosing scope: each listed name's value
/// was copied out of the defining scope at creation time, so later mutation
/// of the outer binding is invisible to the closure.
#[derive(Debug, Clone)]
pub struct ClosureValue {
    pub function: Arc<FunctionValue>,
    pub captured: Environment,
    pub captured_names: Vec<String>,
}

/// A user-defined variant value: variant name plus named fields. This is how
/// Option/Result-like shapes are modeled at the language level.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordValue {
    pub variant: String,
    pub fields: FxHashMap<String, Value>,
}

/// Class descriptor: field defaults plus methods, with single inheritance.
#[derive(Debug, Clone)]
pub struct ClassValue {
    pub name: String,
    pub superclass: Option<Arc<ClassValue>>,
    pub fields: Vec<(String, Value)>,
    pub methods: FxHashMap<String, Arc<FunctionValue>>,
}

impl ClassValue {
    /// Field defaults for an instance, superclass fields first.
    pub fn field_defaults(&self) -> Vec<(String, Value)> {
        let mut out = match &self.superclass {
            Some(parent) => parent.field_defaults(),
            None => Vec::new(),
        };
        out.extend(self.fields.iter().cloned());
        out
    }

    /// Method lookup walking the superclass chain.
    pub fn find_method(&self, name: &str) -> Option<Arc<FunctionValue>> {
        if let Some(m) = self.methods.get(name) {
            return Some(m.clone());
        }
        self.superclass.as_ref().and_then(|s| s.find_method(name))
    }
}

/// A class instance.
#[derive(Debug, Clone)]
pub struct ObjectValue {
    pub class: Arc<ClassValue>,
    pub fields: FxHashMap<String, Value>,
}

/// Iterator cursor state. Sequence sources are materialized up front;
/// channel sources buffer one received value between has-next and next.
#[derive(Debug, Clone)]
pub enum IteratorValue {
    Seq {
        items: Vec<Value>,
        index: usize,
    },
    Channel {
        id: ChannelId,
        buffered: Option<Value>,
        exhausted: bool,
    },
}

impl IteratorValue {
    pub fn seq(items: Vec<Value>) -> Self {
        IteratorValue::Seq { items, index: 0 }
    }

    pub fn channel(id: ChannelId) -> Self {
        IteratorValue::Channel {
            id,
            buffered: None,
            exhausted: false,
        }
    }
}

/// Runtime value types
#[derive(Clone)]
pub enum Value {
    /// Nil/null value
    Nil,

    /// Boolean value
    Bool(bool),

    // The eight integer width/signedness combinations
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),

    /// 32-bit float
    F32(f32),

    /// 64-bit float
    F64(f64),

    /// String value
    String(String),

    /// Ordered sequence, mutable in place through any live handle
    List(Arc<RwLock<Vec<Value>>>),

    /// Fixed-size sequence, element-wise mutable by index
    Tuple(Arc<RwLock<Vec<Value>>>),

    /// Key/value mapping with value-equality keys
    Dict(Arc<RwLock<DictValue>>),

    /// Half-open integer range, materialized lazily
    Range { start: i64, end: i64, step: i64 },

    /// Enum variant: qualified name plus optional payload
    EnumVariant {
        name: String,
        payload: Option<Box<Value>>,
    },

    /// User-defined variant record
    Record(Arc<RecordValue>),

    /// A raw error value (outside any union)
    Error(Box<ErrorValue>),

    /// Error union with an explicit active-arm discriminant
    Union(Box<UnionState>),

    /// User function reference
    Function(Arc<FunctionValue>),

    /// Function plus captured-at-creation environment
    Closure(Arc<ClosureValue>),

    /// Host-registered function
    NativeFunction {
        name: String,
        arity: usize,
        function: Arc<dyn Fn(&[Value]) -> Result<Value, ErrorValue> + Send + Sync>,
    },

    /// Iterator cursor over a sequence or channel
    Iterator(Arc<Mutex<IteratorValue>>),

    /// Channel handle
    Channel(ChannelId),

    /// Task handle, redeemable through AWAIT
    Task(TaskId),

    /// Lock-free integer for cross-task mutation
    Atomic(Arc<AtomicI64>),

    /// Class handle
    Class(Arc<ClassValue>),

    /// Class instance
    Object(Arc<RwLock<ObjectValue>>),

    /// Module with exports
    Module {
        name: String,
        exports: FxHashMap<String, Value>,
    },
}

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(RwLock::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Arc::new(RwLock::new(items)))
    }

    pub fn dict(dict: DictValue) -> Value {
        Value::Dict(Arc::new(RwLock::new(dict)))
    }

    pub fn union_ok(value: Value) -> Value {
        Value::Union(Box::new(UnionState::Ok(value)))
    }

    pub fn union_err(error: ErrorValue) -> Value {
        Value::Union(Box::new(UnionState::Err(error)))
    }

    pub fn iterator(iter: IteratorValue) -> Value {
        Value::Iterator(Arc::new(Mutex::new(iter)))
    }

    pub fn atomic(initial: i64) -> Value {
        Value::Atomic(Arc::new(AtomicI64::new(initial)))
    }

    /// Type checking predicates
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Value::I8(_)
                | Value::I16(_)
                | Value::I32(_)
                | Value::I64(_)
                | Value::U8(_)
                | Value::U16(_)
                | Value::U32(_)
                | Value::U64(_)
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Value::F32(_) | Value::F64(_))
    }

    pub fn is_number(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_) | Value::Closure(_) | Value::NativeFunction { .. } | Value::Class(_)
        )
    }

    /// True for a raw error value or the error arm of a union.
    pub fn is_error(&self) -> bool {
        match self {
            Value::Error(_) => true,
            Value::Union(state) => matches!(**state, UnionState::Err(_)),
            _ => false,
        }
    }

    /// The carried error, if this is an error value or an error-arm union.
    pub fn error_value(&self) -> Option<&ErrorValue> {
        match self {
            Value::Error(e) => Some(e),
            Value::Union(state) => match &**state {
                UnionState::Err(e) => Some(e),
                UnionState::Ok(_) => None,
            },
            _ => None,
        }
    }

    /// Type conversion helpers
    pub fn as_bool(&self) -> ValueResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            _ => Err(ValueError::TypeError {
                expected: "bool",
                actual: self.type_name(),
            }),
        }
    }

    /// Widen any integer (or atomic) to i64, failing on overflow.
    pub fn as_i64(&self) -> ValueResult<i64> {
        match self {
            Value::I8(n) => Ok(*n as i64),
            Value::I16(n) => Ok(*n as i64),
            Value::I32(n) => Ok(*n as i64),
            Value::I64(n) => Ok(*n),
            Value::U8(n) => Ok(*n as i64),
            Value::U16(n) => Ok(*n as i64),
            Value::U32(n) => Ok(*n as i64),
            Value::U64(n) => {
                if *n <= i64::MAX as u64 {
                    Ok(*n as i64)
                } else {
                    Err(ValueError::ConversionError {
                        from: "u64",
                        to: "i64",
                        reason: format!("{} exceeds i64 range", n),
                    })
                }
            }
            Value::Atomic(a) => Ok(a.load(Ordering::SeqCst)),
            _ => Err(ValueError::TypeError {
                expected: "integer",
                actual: self.type_name(),
            }),
        }
    }

    pub fn as_f64(&self) -> ValueResult<f64> {
        match self {
            Value::F32(x) => Ok(*x as f64),
            Value::F64(x) => Ok(*x),
            _ => self.as_i64().map(|n| n as f64),
        }
    }

    pub fn as_str(&self) -> ValueResult<&str> {
        match self {
            Value::String(s) => Ok(s),
            _ => Err(ValueError::TypeError {
                expected: "string",
                actual: self.type_name(),
            }),
        }
    }

    pub fn as_list(&self) -> ValueResult<&Arc<RwLock<Vec<Value>>>> {
        match self {
            Value::List(items) => Ok(items),
            _ => Err(ValueError::TypeError {
                expected: "list",
                actual: self.type_name(),
            }),
        }
    }

    pub fn as_tuple(&self) -> ValueResult<&Arc<RwLock<Vec<Value>>>> {
        match self {
            Value::Tuple(items) => Ok(items),
            _ => Err(ValueError::TypeError {
                expected: "tuple",
                actual: self.type_name(),
            }),
        }
    }

    pub fn as_dict(&self) -> ValueResult<&Arc<RwLock<DictValue>>> {
        match self {
            Value::Dict(dict) => Ok(dict),
            _ => Err(ValueError::TypeError {
                expected: "dict",
                actual: self.type_name(),
            }),
        }
    }

    pub fn as_closure(&self) -> ValueResult<&Arc<ClosureValue>> {
        match self {
            Value::Closure(c) => Ok(c),
            _ => Err(ValueError::TypeError {
                expected: "closure",
                actual: self.type_name(),
            }),
        }
    }

    pub fn as_channel(&self) -> ValueResult<ChannelId> {
        match self {
            Value::Channel(id) => Ok(*id),
            _ => Err(ValueError::TypeError {
                expected: "channel",
                actual: self.type_name(),
            }),
        }
    }

    pub fn as_task(&self) -> ValueResult<TaskId> {
        match self {
            Value::Task(id) => Ok(*id),
            _ => Err(ValueError::TypeError {
                expected: "task",
                actual: self.type_name(),
            }),
        }
    }

    /// Expand a range into its backing sequence.
    pub fn materialize_range(start: i64, end: i64, step: i64) -> ValueResult<Vec<Value>> {
        if step == 0 {
            return Err(ValueError::InvalidOperation(
                "range step must be non-zero".to_string(),
            ));
        }
        let mut items = Vec::new();
        let mut current = start;
        if step > 0 {
            while current < end {
                items.push(Value::I64(current));
                current += step;
            }
        } else {
            while current > end {
                items.push(Value::I64(current));
                current += step;
            }
        }
        Ok(items)
    }

    /// Get type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::EnumVariant { .. } => "enum-variant",
            Value::Record(_) => "record",
            Value::Error(_) => "error",
            Value::Union(_) => "error-union",
            Value::Function(_) => "function",
            Value::Closure(_) => "closure",
            Value::NativeFunction { .. } => "native-function",
            Value::Iterator(_) => "iterator",
            Value::Channel(_) => "channel",
            Value::Task(_) => "task",
            Value::Atomic(_) => "atomic",
            Value::Class(_) => "class",
            Value::Object(_) => "object",
            Value::Module { .. } => "module",
        }
    }

    /// The value's type descriptor.
    pub fn type_of(&self) -> Type {
        match self {
            Value::Nil => Type::Primitive(TypeTag::Nil),
            Value::Bool(_) => Type::Primitive(TypeTag::Bool),
            Value::I8(_) => Type::Primitive(TypeTag::I8),
            Value::I16(_) => Type::Primitive(TypeTag::I16),
            Value::I32(_) => Type::Primitive(TypeTag::I32),
            Value::I64(_) => Type::Primitive(TypeTag::I64),
            Value::U8(_) => Type::Primitive(TypeTag::U8),
            Value::U16(_) => Type::Primitive(TypeTag::U16),
            Value::U32(_) => Type::Primitive(TypeTag::U32),
            Value::U64(_) => Type::Primitive(TypeTag::U64),
            Value::F32(_) => Type::Primitive(TypeTag::F32),
            Value::F64(_) => Type::Primitive(TypeTag::F64),
            Value::String(_) => Type::Primitive(TypeTag::String),
            Value::List(_) => Type::List(Box::new(Type::Primitive(TypeTag::Any))),
            Value::Tuple(items) => {
                Type::Tuple(items.read().iter().map(|v| v.type_of()).collect())
            }
            Value::Dict(_) => Type::Dict(
                Box::new(Type::Primitive(TypeTag::Any)),
                Box::new(Type::Primitive(TypeTag::Any)),
            ),
            Value::Range { .. } => Type::Primitive(TypeTag::Range),
            Value::EnumVariant { name, .. } => Type::Named(name.clone()),
            Value::Record(record) => Type::Named(record.variant.clone()),
            Value::Error(e) => Type::Named(e.error_type.clone()),
            Value::Union(state) => match &**state {
                UnionState::Ok(v) => Type::ErrorUnion {
                    success: Box::new(v.type_of()),
                    errors: Vec::new(),
                    generic: true,
                },
                UnionState::Err(e) => Type::ErrorUnion {
                    success: Box::new(Type::Primitive(TypeTag::Nil)),
                    errors: vec![e.error_type.clone()],
                    generic: false,
                },
            },
            Value::Function(_) => Type::Primitive(TypeTag::Function),
            Value::Closure(_) => Type::Primitive(TypeTag::Closure),
            Value::NativeFunction { .. } => Type::Primitive(TypeTag::Function),
            Value::Iterator(_) => Type::Primitive(TypeTag::Iterator),
            Value::Channel(_) => Type::Primitive(TypeTag::Channel),
            Value::Task(_) => Type::Primitive(TypeTag::Task),
            Value::Atomic(_) => Type::Primitive(TypeTag::Atomic),
            Value::Class(_) => Type::Primitive(TypeTag::Class),
            Value::Object(_) => Type::Primitive(TypeTag::Object),
            Value::Module { .. } => Type::Primitive(TypeTag::Module),
        }
    }

    /// Check if value is truthy
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            _ => true,
        }
    }

    /// Structural equality with cross-width numeric comparison.
    pub fn loose_eq(&self, other: &Value) -> bool {
        use Value::*;
        if self.is_number() && other.is_number() {
            return match (self.integer_repr(), other.integer_repr()) {
                (Some(a), Some(b)) => a == b,
                _ => match (self.as_f64(), other.as_f64()) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => false,
                },
            };
        }
        match (self, other) {
            (Nil, Nil) => true,
            (Bool(a), Bool(b)) => a == b,
            (String(a), String(b)) => a == b,
            (List(a), List(b)) | (Tuple(a), Tuple(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.loose_eq(y))
            }
            (Dict(a), Dict(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.entries
                        .iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.loose_eq(w)))
            }
            (
                Range {
                    start: s1,
                    end: e1,
                    step: t1,
                },
                Range {
                    start: s2,
                    end: e2,
                    step: t2,
                },
            ) => s1 == s2 && e1 == e2 && t1 == t2,
            (
                EnumVariant {
                    name: n1,
                    payload: p1,
                },
                EnumVariant {
                    name: n2,
                    payload: p2,
                },
            ) => {
                n1 == n2
                    && match (p1, p2) {
                        (None, None) => true,
                        (Some(a), Some(b)) => a.loose_eq(b),
                        _ => false,
                    }
            }
            (Record(a), Record(b)) => {
                a.variant == b.variant
                    && a.fields.len() == b.fields.len()
                    && a.fields
                        .iter()
                        .all(|(k, v)| b.fields.get(k).is_some_and(|w| v.loose_eq(w)))
            }
            (Error(a), Error(b)) => a.error_type == b.error_type && a.message == b.message,
            (Union(a), Union(b)) => match (&**a, &**b) {
                (UnionState::Ok(x), UnionState::Ok(y)) => x.loose_eq(y),
                (UnionState::Err(x), UnionState::Err(y)) => {
                    x.error_type == y.error_type && x.message == y.message
                }
                _ => false,
            },
            (Function(a), Function(b)) => a == b,
            (Closure(a), Closure(b)) => Arc::ptr_eq(a, b),
            (NativeFunction { name: n1, .. }, NativeFunction { name: n2, .. }) => n1 == n2,
            (Iterator(a), Iterator(b)) => Arc::ptr_eq(a, b),
            (Channel(a), Channel(b)) => a == b,
            (Task(a), Task(b)) => a == b,
            (Atomic(a), Atomic(b)) => Arc::ptr_eq(a, b),
            (Class(a), Class(b)) => Arc::ptr_eq(a, b),
            (Object(a), Object(b)) => Arc::ptr_eq(a, b),
            (Module { name: n1, .. }, Module { name: n2, .. }) => n1 == n2,
            _ => false,
        }
    }

    /// Common integer representation for cross-width comparison, when the
    /// value is integer-like (including atomics).
    fn integer_repr(&self) -> Option<i128> {
        match self {
            Value::I8(n) => Some(*n as i128),
            Value::I16(n) => Some(*n as i128),
            Value::I32(n) => Some(*n as i128),
            Value::I64(n) => Some(*n as i128),
            Value::U8(n) => Some(*n as i128),
            Value::U16(n) => Some(*n as i128),
            Value::U32(n) => Some(*n as i128),
            Value::U64(n) => Some(*n as i128),
            Value::Atomic(a) => Some(a.load(Ordering::SeqCst) as i128),
            _ => None,
        }
    }

    /// Render without quoting strings; used by string interpolation and print.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => format!("{}", other),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        // Strict on numeric width; use loose_eq for language-level equality
        if self.is_number() && other.is_number() {
            return std::mem::discriminant(self) == std::mem::discriminant(other)
                && self.loose_eq(other);
        }
        self.loose_eq(other)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::I8(n) => write!(f, "I8({})", n),
            Value::I16(n) => write!(f, "I16({})", n),
            Value::I32(n) => write!(f, "I32({})", n),
            Value::I64(n) => write!(f, "I64({})", n),
            Value::U8(n) => write!(f, "U8({})", n),
            Value::U16(n) => write!(f, "U16({})", n),
            Value::U32(n) => write!(f, "U32({})", n),
            Value::U64(n) => write!(f, "U64({})", n),
            Value::F32(x) => write!(f, "F32({})", x),
            Value::F64(x) => write!(f, "F64({})", x),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::List(items) => f.debug_list().entries(items.read().iter()).finish(),
            Value::Tuple(items) => {
                f.debug_tuple("Tuple").field(&items.read().len()).finish()
            }
            Value::Dict(dict) => f.debug_struct("Dict").field("len", &dict.read().len()).finish(),
            Value::Range { start, end, step } => {
                write!(f, "Range({}..{} by {})", start, end, step)
            }
            Value::EnumVariant { name, payload } => f
                .debug_struct("EnumVariant")
                .field("name", name)
                .field("payload", payload)
                .finish(),
            Value::Record(record) => f
                .debug_struct("Record")
                .field("variant", &record.variant)
                .finish(),
            Value::Error(e) => write!(f, "Error({}: {})", e.error_type, e.message),
            Value::Union(state) => match &**state {
                UnionState::Ok(v) => write!(f, "Ok({:?})", v),
                UnionState::Err(e) => write!(f, "Err({}: {})", e.error_type, e.message),
            },
            Value::Function(func) => write!(f, "Function({})", func.name),
            Value::Closure(c) => write!(f, "Closure({})", c.function.name),
            Value::NativeFunction { name, arity, .. } => f
                .debug_struct("NativeFunction")
                .field("name", name)
                .field("arity", arity)
                .finish(),
            Value::Iterator(_) => write!(f, "Iterator(..)"),
            Value::Channel(id) => write!(f, "Channel({})", id),
            Value::Task(id) => write!(f, "Task({})", id),
            Value::Atomic(a) => write!(f, "Atomic({})", a.load(Ordering::SeqCst)),
            Value::Class(c) => write!(f, "Class({})", c.name),
            Value::Object(o) => write!(f, "Object({})", o.read().class.name),
            Value::Module { name, exports } => f
                .debug_struct("Module")
                .field("name", name)
                .field("exports", &exports.len())
                .finish(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::I8(n) => write!(f, "{}", n),
            Value::I16(n) => write!(f, "{}", n),
            Value::I32(n) => write!(f, "{}", n),
            Value::I64(n) => write!(f, "{}", n),
            Value::U8(n) => write!(f, "{}", n),
            Value::U16(n) => write!(f, "{}", n),
            Value::U32(n) => write!(f, "{}", n),
            Value::U64(n) => write!(f, "{}", n),
            Value::F32(x) => write!(f, "{}", x),
            Value::F64(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.read().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.read().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Dict(dict) => {
                write!(f, "{{")?;
                for (i, (key, value)) in dict.read().entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key.to_value(), value)?;
                }
                write!(f, "}}")
            }
            Value::Range { start, end, step } => {
                if *step == 1 {
                    write!(f, "{}..{}", start, end)
                } else {
                    write!(f, "{}..{}:{}", start, end, step)
                }
            }
            Value::EnumVariant { name, payload } => match payload {
                Some(p) => write!(f, "{}({})", name, p),
                None => write!(f, "{}", name),
            },
            Value::Record(record) => {
                write!(f, "{}(", record.variant)?;
                for (i, (key, value)) in record.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, ")")
            }
            Value::Error(e) => write!(f, "#<error {}>", e),
            Value::Union(state) => match &**state {
                UnionState::Ok(v) => write!(f, "ok({})", v),
                UnionState::Err(e) => write!(f, "err({})", e),
            },
            Value::Function(func) => write!(f, "#<fn {}>", func.name),
            Value::Closure(c) => write!(f, "#<closure {}>", c.function.name),
            Value::NativeFunction { name, .. } => write!(f, "#<native {}>", name),
            Value::Iterator(_) => write!(f, "#<iterator>"),
            Value::Channel(id) => write!(f, "#<{}>", id),
            Value::Task(id) => write!(f, "#<{}>", id),
            Value::Atomic(a) => write!(f, "{}", a.load(Ordering::SeqCst)),
            Value::Class(c) => write!(f, "#<class {}>", c.name),
            Value::Object(o) => write!(f, "#<{} instance>", o.read().class.name),
            Value::Module { name, exports } => {
                write!(f, "#<module {} with {} exports>", name, exports.len())
            }
        }
    }
}

#[cfg(test)]
#[path = "../value_tests.rs"]
mod tests;
