//! The Keel virtual machine
//!
//! A single-threaded dispatch loop over a flat instruction array. The
//! operand stack, call stack and error-frame stack live here; parallel
//! constructs hand body ranges to the shared [`TaskRuntime`], where each
//! task runs its own loop over the same program with its own stacks and a
//! child scope of the shared global environment.

use crate::bytecode::{Instruction, Opcode, Program};
use crate::error::{StackFrame, StackTrace, VmError, VmResult};
use crate::pattern;
use crate::safety::{checked_ops, ResourceLimits};
use keel_core::env::Environment;
use keel_core::runtime::{TaskId, TaskRuntime};
use keel_core::types::{self, ArithOp};
use keel_core::value::{
    ClassValue, ClosureValue, DictKey, DictValue, ErrorValue, FunctionValue, IteratorValue,
    ObjectValue, UnionState, Value, ValueError,
};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use tracing::{debug, trace};

/// A call frame: who was called, where to resume, and the scope to restore.
pub struct CallFrame {
    function_name: String,
    return_address: usize,
    stack_base: usize,
    caller_env: Environment,
    args_supplied: usize,
    args_remaining: usize,
}

/// An installed error handler. Consulted only when a value turns out to be
/// an error; the success path never touches this stack.
pub struct ErrorFrame {
    handler_address: usize,
    stack_depth: usize,
    call_depth: usize,
    expected_error: Option<String>,
    function_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Parallel,
    Concurrent,
}

struct BlockContext {
    kind: BlockKind,
    tasks: Vec<TaskId>,
}

struct ClassBuilder {
    name: String,
    superclass: Option<Arc<ClassValue>>,
    fields: Vec<(String, Value)>,
    methods: FxHashMap<String, Arc<FunctionValue>>,
}

struct EnumBuilder {
    name: String,
    variants: FxHashMap<String, Option<String>>,
}

#[derive(Debug, Clone)]
struct EnumDef {
    variants: FxHashMap<String, Option<String>>,
}

/// A host function: plain, or handed the VM instance as well.
#[derive(Clone)]
pub enum NativeCallable {
    Plain(Arc<dyn Fn(&[Value]) -> Result<Value, ErrorValue> + Send + Sync>),
    VmAware(Arc<dyn Fn(&mut Vm, &[Value]) -> Result<Value, ErrorValue> + Send + Sync>),
}

/// Name tables shared between the main interpreter and every task body.
#[derive(Default)]
pub struct Registries {
    functions: RwLock<FxHashMap<String, Arc<FunctionValue>>>,
    natives: RwLock<FxHashMap<String, NativeCallable>>,
    classes: RwLock<FxHashMap<String, Arc<ClassValue>>>,
    enums: RwLock<FxHashMap<String, EnumDef>>,
    modules: RwLock<FxHashMap<String, Value>>,
}

enum VmState {
    Continue,
    Halt,
}

pub struct Vm {
    program: Arc<Program>,
    stack: Vec<Value>,
    call_stack: Vec<CallFrame>,
    error_frames: Vec<ErrorFrame>,
    globals: Environment,
    env: Environment,
    temps: FxHashMap<i64, Value>,
    registries: Arc<Registries>,
    runtime: Arc<TaskRuntime>,
    limits: ResourceLimits,
    blocks: Vec<BlockContext>,
    pending_iterable: Option<(String, Value)>,
    class_builder: Option<ClassBuilder>,
    enum_builder: Option<EnumBuilder>,
    ip: usize,
    trace: bool,
}

impl Vm {
    pub fn new(program: Program) -> Self {
        Self::with_limits(program, ResourceLimits::default())
    }

    pub fn with_limits(program: Program, limits: ResourceLimits) -> Self {
        let runtime = match limits.worker_threads {
            Some(n) => TaskRuntime::with_threads(n),
            None => TaskRuntime::new(),
        };
        let globals = Environment::new();
        Self {
            program: Arc::new(program),
            stack: Vec::new(),
            call_stack: Vec::new(),
            error_frames: Vec::new(),
            globals: globals.clone(),
            env: globals,
            temps: FxHashMap::default(),
            registries: Arc::new(Registries::default()),
            runtime: Arc::new(runtime),
            limits,
            blocks: Vec::new(),
            pending_iterable: None,
            class_builder: None,
            enum_builder: None,
            ip: 0,
            trace: false,
        }
    }

    /// Interpreter for a task body: same program, registries, runtime and
    /// globals, but fresh stacks and its own scope chain.
    fn task_vm(
        program: Arc<Program>,
        registries: Arc<Registries>,
        runtime: Arc<TaskRuntime>,
        globals: Environment,
        env: Environment,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            program,
            stack: Vec::new(),
            call_stack: Vec::new(),
            error_frames: Vec::new(),
            globals,
            env,
            temps: FxHashMap::default(),
            registries,
            runtime,
            limits,
            blocks: Vec::new(),
            pending_iterable: None,
            class_builder: None,
            enum_builder: None,
            ip: 0,
            trace: false,
        }
    }

    pub fn enable_trace(&mut self) {
        self.trace = true;
    }

    pub fn set_resource_limits(&mut self, limits: ResourceLimits) {
        self.limits = limits;
    }

    /// Register a host function under `name`.
    pub fn register_native<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Value]) -> Result<Value, ErrorValue> + Send + Sync + 'static,
    {
        self.registries
            .natives
            .write()
            .insert(name.into(), NativeCallable::Plain(Arc::new(function)));
    }

    /// Register a host function that also receives the VM instance.
    pub fn register_native_with_vm<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&mut Vm, &[Value]) -> Result<Value, ErrorValue> + Send + Sync + 'static,
    {
        self.registries
            .natives
            .write()
            .insert(name.into(), NativeCallable::VmAware(Arc::new(function)));
    }

    /// Make a preloaded module visible to `Import`.
    pub fn register_module(&mut self, name: impl Into<String>, exports: FxHashMap<String, Value>) {
        let name = name.into();
        let module = Value::Module {
            name: name.clone(),
            exports,
        };
        self.registries.modules.write().insert(name, module);
    }

    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.define(name, value);
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).ok()
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    pub fn runtime(&self) -> &Arc<TaskRuntime> {
        &self.runtime
    }

    /// Execute from address 0 to the end of the program (or a `Halt`),
    /// returning the top of the operand stack.
    pub fn run(&mut self) -> VmResult<Value> {
        let end = self.program.instructions.len();
        self.run_range(0, end)
    }

    fn run_range(&mut self, start: usize, end: usize) -> VmResult<Value> {
        self.ip = start;
        let base_depth = self.call_stack.len();
        while self.ip < self.program.instructions.len() {
            if self.ip == end && self.call_stack.len() == base_depth {
                break;
            }
            let instruction = self.program.instructions[self.ip].clone();
            self.ip += 1;
            if self.trace {
                trace!(
                    ip = self.ip - 1,
                    opcode = ?instruction.opcode,
                    stack = self.stack.len(),
                    "execute"
                );
            }
            match self.execute_instruction(&instruction)? {
                VmState::Continue => {}
                VmState::Halt => break,
            }
        }
        Ok(self.stack.pop().unwrap_or(Value::Nil))
    }

    /// Run until the call stack shrinks back to `target_depth`. Used where a
    /// call must complete within a single opcode (constructor bodies).
    fn finish_call(&mut self, target_depth: usize) -> VmResult<()> {
        while self.call_stack.len() > target_depth {
            if self.ip >= self.program.instructions.len() {
                return Err(VmError::MalformedProgram {
                    message: "call frame left open at end of program".to_string(),
                    line: 0,
                });
            }
            let instruction = self.program.instructions[self.ip].clone();
            self.ip += 1;
            match self.execute_instruction(&instruction)? {
                VmState::Continue => {}
                VmState::Halt => {
                    return Err(VmError::RuntimeError {
                        message: "halt inside a nested call".to_string(),
                        stack_trace: Some(self.build_stack_trace()),
                    })
                }
            }
        }
        Ok(())
    }

    fn execute_instruction(&mut self, instruction: &Instruction) -> VmResult<VmState> {
        use Opcode::*;

        let line = instruction.line;
        match instruction.opcode {
            // Stack operations
            PushInt => self.push(Value::I64(instruction.int_operand))?,
            PushFloat => self.push(Value::F64(instruction.float_operand))?,
            PushString => self.push(Value::String(instruction.string_operand.clone()))?,
            PushBool => self.push(Value::Bool(instruction.bool_operand))?,
            PushNull => self.push(Value::Nil)?,
            Pop => {
                self.pop("pop")?;
            }
            Dup => {
                let value = self.peek(0)?.clone();
                self.push(value)?;
            }
            Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(VmError::StackUnderflow {
                        operation: "swap".to_string(),
                        stack_size: len,
                    });
                }
                self.stack.swap(len - 1, len - 2);
            }

            // Variable operations
            DeclareVar => {
                let value = self.pop("declare_var")?;
                self.env.define(instruction.string_operand.clone(), value);
            }
            StoreVar => {
                let value = self.pop("store_var")?;
                self.store_variable(&instruction.string_operand, value, line)?;
            }
            LoadVar => {
                let name = instruction.string_operand.as_str();
                let value = self
                    .env
                    .get(name)
                    .or_else(|_| self.globals.get(name))
                    .map_err(|_| VmError::UndefinedVariable {
                        name: name.to_string(),
                        line,
                    })?;
                self.push(value)?;
            }
            RemoveVar => {
                let name = instruction.string_operand.as_str();
                self.env.remove(name).map_err(|_| VmError::UndefinedVariable {
                    name: name.to_string(),
                    line,
                })?;
            }
            DefineAtomic => {
                let initial = self.pop("define_atomic")?;
                let n = initial.as_i64().map_err(|_| {
                    self.type_error("define_atomic", "integer", initial.type_name(), line)
                })?;
                self.env
                    .define(instruction.string_operand.clone(), Value::atomic(n));
            }
            StoreTemp => {
                let value = self.pop("store_temp")?;
                self.temps.insert(instruction.int_operand, value);
            }
            LoadTemp => {
                let value = self.temps.get(&instruction.int_operand).cloned().ok_or(
                    VmError::MalformedProgram {
                        message: format!("temp slot {} is empty", instruction.int_operand),
                        line,
                    },
                )?;
                self.push(value)?;
            }
            ClearTemp => {
                self.temps.remove(&instruction.int_operand);
            }

            // Arithmetic
            Add => return self.binary_arith(ArithOp::Add, line),
            Subtract => return self.binary_arith(ArithOp::Sub, line),
            Multiply => return self.binary_arith(ArithOp::Mul, line),
            Divide => return self.binary_arith(ArithOp::Div, line),
            Modulo => return self.binary_arith(ArithOp::Rem, line),
            Power => return self.binary_arith(ArithOp::Pow, line),
            Negate => {
                let value = Self::deref_atomic(self.pop("negate")?);
                match types::negate(&value) {
                    Ok(result) => self.push(result)?,
                    Err(err) => return self.value_error_to_state(err, "negate", line),
                }
            }

            // Strings
            Concat => {
                let b = self.pop("concat")?;
                let a = self.pop("concat")?;
                if a.is_string() || b.is_string() {
                    self.push(Value::String(format!(
                        "{}{}",
                        a.to_display_string(),
                        b.to_display_string()
                    )))?;
                } else {
                    return Err(self.type_error(
                        "concat",
                        "string",
                        &format!("{} and {}", a.type_name(), b.type_name()),
                        line,
                    ));
                }
            }
            InterpolateString => {
                let count = instruction.int_operand as usize;
                let mut parts = Vec::with_capacity(count);
                for _ in 0..count {
                    parts.push(self.pop("interpolate_string")?);
                }
                parts.reverse();
                let mut out = String::new();
                for part in parts {
                    out.push_str(&part.to_display_string());
                }
                self.push(Value::String(out))?;
            }

            // Comparison
            Equal => {
                let b = Self::deref_atomic(self.pop("equal")?);
                let a = Self::deref_atomic(self.pop("equal")?);
                self.push(Value::Bool(a.loose_eq(&b)))?;
            }
            NotEqual => {
                let b = Self::deref_atomic(self.pop("not_equal")?);
                let a = Self::deref_atomic(self.pop("not_equal")?);
                self.push(Value::Bool(!a.loose_eq(&b)))?;
            }
            Less => return self.binary_cmp(line, "less", |ord| ord == Ordering::Less),
            LessEqual => return self.binary_cmp(line, "less_equal", |ord| ord != Ordering::Greater),
            Greater => return self.binary_cmp(line, "greater", |ord| ord == Ordering::Greater),
            GreaterEqual => {
                return self.binary_cmp(line, "greater_equal", |ord| ord != Ordering::Less)
            }

            // Logical
            And => {
                let b = self.pop("and")?;
                let a = self.pop("and")?;
                match (a.as_bool(), b.as_bool()) {
                    (Ok(x), Ok(y)) => self.push(Value::Bool(x && y))?,
                    _ => {
                        return Err(self.type_error(
                            "and",
                            "bool",
                            &format!("{} and {}", a.type_name(), b.type_name()),
                            line,
                        ))
                    }
                }
            }
            Or => {
                let b = self.pop("or")?;
                let a = self.pop("or")?;
                match (a.as_bool(), b.as_bool()) {
                    (Ok(x), Ok(y)) => self.push(Value::Bool(x || y))?,
                    _ => {
                        return Err(self.type_error(
                            "or",
                            "bool",
                            &format!("{} and {}", a.type_name(), b.type_name()),
                            line,
                        ))
                    }
                }
            }
            Not => {
                let value = self.pop("not")?;
                match value.as_bool() {
                    Ok(b) => self.push(Value::Bool(!b))?,
                    Err(_) => {
                        return Err(self.type_error("not", "bool", value.type_name(), line))
                    }
                }
            }

            // Control flow
            Jump => {
                self.jump_relative(instruction.int_operand)?;
            }
            JumpIfTrue => {
                let condition = self.pop("jump_if_true")?;
                if condition.is_truthy() {
                    self.jump_relative(instruction.int_operand)?;
                }
            }
            JumpIfFalse => {
                let condition = self.pop("jump_if_false")?;
                if !condition.is_truthy() {
                    self.jump_relative(instruction.int_operand)?;
                }
            }

            // Functions
            BeginFunction => {
                let start = self.ip;
                let end = self.find_block_end(start, BeginFunction, EndFunction, line)?;
                let func = Arc::new(FunctionValue {
                    name: instruction.string_operand.clone(),
                    start,
                    end,
                    can_fail: instruction.bool_operand,
                });
                if let Some(builder) = &mut self.class_builder {
                    builder.methods.insert(func.name.clone(), func);
                } else {
                    self.registries
                        .functions
                        .write()
                        .insert(func.name.clone(), func);
                }
                self.ip = end + 1;
            }
            EndFunction => {
                // Falling off the end of a body is an implicit nil return
                self.return_from_call(Value::Nil, line)?;
            }
            DefineParam => {
                let frame = self.call_stack.last_mut().ok_or(VmError::MalformedProgram {
                    message: "parameter outside a call".to_string(),
                    line,
                })?;
                if frame.args_remaining == 0 {
                    let name = frame.function_name.clone();
                    return Err(VmError::RuntimeError {
                        message: format!(
                            "missing argument for parameter '{}' of {}",
                            instruction.string_operand, name
                        ),
                        stack_trace: Some(self.build_stack_trace()),
                    });
                }
                frame.args_remaining -= 1;
                let value = self.pop("define_param")?;
                self.env.define(instruction.string_operand.clone(), value);
            }
            DefineOptionalParam => {
                let position = instruction.int_operand as usize;
                let frame = self.call_stack.last_mut().ok_or(VmError::MalformedProgram {
                    message: "parameter outside a call".to_string(),
                    line,
                })?;
                if frame.args_supplied > position {
                    frame.args_remaining -= 1;
                    let value = self.pop("define_optional_param")?;
                    self.env.define(instruction.string_operand.clone(), value);
                    self.push(Value::Bool(true))?;
                } else {
                    self.env
                        .define(instruction.string_operand.clone(), Value::Nil);
                    self.push(Value::Bool(false))?;
                }
            }
            SetDefaultValue => {
                let value = self.pop("set_default_value")?;
                self.env.define(instruction.string_operand.clone(), value);
            }
            Call => {
                let argc = instruction.int_operand as usize;
                return self.call_named(&instruction.string_operand, argc, line);
            }
            CallClosure => {
                let argc = instruction.int_operand as usize;
                let callee = self.pop("call_closure")?;
                match callee {
                    Value::Closure(closure) => {
                        self.call_function(
                            closure.function.clone(),
                            argc,
                            Some(closure.captured.clone()),
                        )?;
                    }
                    Value::Function(func) => {
                        self.call_function(func, argc, None)?;
                    }
                    Value::NativeFunction { function, .. } => {
                        return self.invoke_native_fn(&*function, argc);
                    }
                    other => {
                        return Err(self.type_error(
                            "call_closure",
                            "callable",
                            other.type_name(),
                            line,
                        ))
                    }
                }
            }
            Return => {
                let frame_base = self
                    .call_stack
                    .last()
                    .ok_or(VmError::MalformedProgram {
                        message: "return outside a call".to_string(),
                        line,
                    })?
                    .stack_base;
                let value = if self.stack.len() > frame_base {
                    self.pop("return")?
                } else {
                    Value::Nil
                };
                self.return_from_call(value, line)?;
            }
            CreateClosure => {
                return self.create_closure(instruction, line);
            }

            // Classes
            BeginClass => {
                self.class_builder = Some(ClassBuilder {
                    name: instruction.string_operand.clone(),
                    superclass: None,
                    fields: Vec::new(),
                    methods: FxHashMap::default(),
                });
            }
            SetSuperclass => {
                let superclass = self
                    .registries
                    .classes
                    .read()
                    .get(&instruction.string_operand)
                    .cloned()
                    .ok_or_else(|| VmError::RuntimeError {
                        message: format!("unknown superclass '{}'", instruction.string_operand),
                        stack_trace: Some(self.build_stack_trace()),
                    })?;
                match &mut self.class_builder {
                    Some(builder) => builder.superclass = Some(superclass),
                    None => {
                        return Err(VmError::MalformedProgram {
                            message: "superclass outside a class body".to_string(),
                            line,
                        })
                    }
                }
            }
            DefineField => {
                let default = self.pop("define_field")?;
                match &mut self.class_builder {
                    Some(builder) => builder
                        .fields
                        .push((instruction.string_operand.clone(), default)),
                    None => {
                        return Err(VmError::MalformedProgram {
                            message: "field outside a class body".to_string(),
                            line,
                        })
                    }
                }
            }
            EndClass => {
                let builder = self.class_builder.take().ok_or(VmError::MalformedProgram {
                    message: "end of class without a class body".to_string(),
                    line,
                })?;
                let class = Arc::new(ClassValue {
                    name: builder.name.clone(),
                    superclass: builder.superclass,
                    fields: builder.fields,
                    methods: builder.methods,
                });
                self.registries
                    .classes
                    .write()
                    .insert(builder.name.clone(), class.clone());
                self.globals.define(builder.name, Value::Class(class));
            }
            GetProperty => {
                return self.get_property(&instruction.string_operand, line);
            }
            SetProperty => {
                return self.set_property(&instruction.string_operand, line);
            }
            LoadThis => {
                let value = self
                    .env
                    .get("this")
                    .map_err(|_| VmError::UndefinedVariable {
                        name: "this".to_string(),
                        line,
                    })?;
                self.push(value)?;
            }

            // Collections
            CreateList => {
                let count = instruction.int_operand as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.pop("create_list")?);
                }
                items.reverse();
                self.push(Value::list(items))?;
            }
            ListAppend => {
                let value = self.pop("list_append")?;
                let list = self.pop("list_append")?;
                match &list {
                    Value::List(items) => items.write().push(value),
                    other => {
                        return Err(self.type_error("list_append", "list", other.type_name(), line))
                    }
                }
                self.push(list)?;
            }
            CreateDict => {
                let pairs = instruction.int_operand as usize;
                let mut dict = DictValue::new();
                let mut entries = Vec::with_capacity(pairs);
                for _ in 0..pairs {
                    let value = self.pop("create_dict")?;
                    let key = self.pop("create_dict")?;
                    entries.push((key, value));
                }
                for (key, value) in entries.into_iter().rev() {
                    let key = match DictKey::from_value(&key) {
                        Ok(key) => key,
                        Err(err) => return self.value_error_to_state(err, "create_dict", line),
                    };
                    dict.insert(key, value);
                }
                self.push(Value::dict(dict))?;
            }
            DictSet => {
                let value = self.pop("dict_set")?;
                let key = self.pop("dict_set")?;
                let dict = self.pop("dict_set")?;
                match &dict {
                    Value::Dict(entries) => {
                        let key = match DictKey::from_value(&key) {
                            Ok(key) => key,
                            Err(err) => return self.value_error_to_state(err, "dict_set", line),
                        };
                        entries.write().insert(key, value);
                    }
                    other => {
                        return Err(self.type_error("dict_set", "dict", other.type_name(), line))
                    }
                }
                self.push(dict)?;
            }
            CreateTuple => {
                let count = instruction.int_operand as usize;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.pop("create_tuple")?);
                }
                items.reverse();
                self.push(Value::tuple(items))?;
            }
            CreateRange => {
                let end = Self::deref_atomic(self.pop("create_range")?);
                let start = Self::deref_atomic(self.pop("create_range")?);
                match (start.as_i64(), end.as_i64()) {
                    (Ok(start), Ok(end)) => {
                        self.push(Value::Range {
                            start,
                            end,
                            step: 1,
                        })?;
                    }
                    _ => {
                        return Err(self.type_error(
                            "create_range",
                            "integer bounds",
                            &format!("{} and {}", start.type_name(), end.type_name()),
                            line,
                        ))
                    }
                }
            }
            SetRangeStep => {
                let step = Self::deref_atomic(self.pop("set_range_step")?);
                let range = self.pop("set_range_step")?;
                match (&range, step.as_i64()) {
                    (Value::Range { start, end, .. }, Ok(step)) => {
                        self.push(Value::Range {
                            start: *start,
                            end: *end,
                            step,
                        })?;
                    }
                    _ => {
                        return Err(self.type_error(
                            "set_range_step",
                            "range and integer step",
                            &format!("{} and {}", range.type_name(), step.type_name()),
                            line,
                        ))
                    }
                }
            }
            GetIndex => {
                return self.get_index(line);
            }
            SetIndex => {
                return self.set_index(line);
            }

            // Iterators
            GetIterator => {
                return self.get_iterator(line);
            }
            IteratorHasNext => {
                return self.iterator_has_next(line);
            }
            IteratorNext => {
                return self.iterator_next(line, false);
            }
            IteratorNextKeyValue => {
                return self.iterator_next(line, true);
            }

            // Scopes
            BeginScope => {
                self.env = Environment::with_enclosing(self.env.clone());
            }
            EndScope => {
                self.env = self.env.enclosing().ok_or(VmError::MalformedProgram {
                    message: "scope end without a matching begin".to_string(),
                    line,
                })?;
            }

            // Enums
            BeginEnum => {
                self.enum_builder = Some(EnumBuilder {
                    name: instruction.string_operand.clone(),
                    variants: FxHashMap::default(),
                });
            }
            DefineEnumVariant => {
                let variant = instruction.string_operand.clone();
                let builder = self.enum_builder.as_mut().ok_or(VmError::MalformedProgram {
                    message: "enum variant outside an enum body".to_string(),
                    line,
                })?;
                let full = format!("{}.{}", builder.name, variant);
                builder.variants.insert(variant, None);
                self.globals.define(
                    full.clone(),
                    Value::EnumVariant {
                        name: full,
                        payload: None,
                    },
                );
            }
            DefineEnumVariantWithType => {
                let payload_type = self.pop("define_enum_variant")?;
                let payload_type = payload_type
                    .as_str()
                    .map_err(|_| VmError::MalformedProgram {
                        message: "enum variant payload type must be a string".to_string(),
                        line,
                    })?
                    .to_string();
                let builder = self.enum_builder.as_mut().ok_or(VmError::MalformedProgram {
                    message: "enum variant outside an enum body".to_string(),
                    line,
                })?;
                builder
                    .variants
                    .insert(instruction.string_operand.clone(), Some(payload_type));
            }
            EndEnum => {
                let builder = self.enum_builder.take().ok_or(VmError::MalformedProgram {
                    message: "end of enum without an enum body".to_string(),
                    line,
                })?;
                self.registries.enums.write().insert(
                    builder.name,
                    EnumDef {
                        variants: builder.variants,
                    },
                );
            }

            // Error unions
            PushErrorFrame => {
                if self.error_frames.len() >= self.limits.max_error_frames {
                    return Err(VmError::RuntimeError {
                        message: "error frame limit exceeded".to_string(),
                        stack_trace: Some(self.build_stack_trace()),
                    });
                }
                let handler = self.resolve_jump(instruction.int_operand)?;
                let expected_error = if instruction.string_operand.is_empty() {
                    None
                } else {
                    Some(instruction.string_operand.clone())
                };
                self.error_frames.push(ErrorFrame {
                    handler_address: handler,
                    stack_depth: self.stack.len(),
                    call_depth: self.call_stack.len(),
                    expected_error,
                    function_name: self.current_function_name(),
                });
            }
            PopErrorFrame => {
                self.error_frames.pop().ok_or(VmError::MalformedProgram {
                    message: "error frame pop without a matching push".to_string(),
                    line,
                })?;
            }
            CheckError => {
                let is_error = self.peek(0)?.is_error();
                self.push(Value::Bool(is_error))?;
            }
            IsError => {
                let value = self.pop("is_error")?;
                self.push(Value::Bool(value.is_error()))?;
            }
            IsSuccess => {
                let value = self.pop("is_success")?;
                self.push(Value::Bool(!value.is_error()))?;
            }
            ConstructError => {
                let argc = instruction.int_operand as usize;
                let mut arguments = Vec::with_capacity(argc);
                for _ in 0..argc {
                    arguments.push(self.pop("construct_error")?);
                }
                arguments.reverse();
                let message = arguments
                    .first()
                    .and_then(|v| v.as_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let error = ErrorValue::new(instruction.string_operand.clone(), message, line)
                    .with_arguments(arguments);
                self.push(Value::union_err(error))?;
            }
            ConstructOk => {
                let value = self.pop("construct_ok")?;
                self.push(Value::union_ok(value))?;
            }
            UnwrapValue => {
                let value = self.pop("unwrap_value")?;
                match value {
                    Value::Union(state) => match *state {
                        UnionState::Ok(payload) => self.push(payload)?,
                        UnionState::Err(error) => {
                            return self
                                .propagate_error(Value::union_err(error))
                                .map(|_| VmState::Continue)
                        }
                    },
                    Value::Error(error) => {
                        return self
                            .propagate_error(Value::union_err(*error))
                            .map(|_| VmState::Continue)
                    }
                    other => self.push(other)?,
                }
            }
            PropagateError => {
                let value = self.pop("propagate_error")?;
                if value.is_error() {
                    return self.propagate_error(value).map(|_| VmState::Continue);
                }
                self.push(value)?;
            }
            StoreException => {
                let value = self.pop("store_exception")?;
                let bound = match value {
                    Value::Union(state) => match *state {
                        UnionState::Err(error) => Value::Error(Box::new(error)),
                        UnionState::Ok(payload) => payload,
                    },
                    other => other,
                };
                self.env.define(instruction.string_operand.clone(), bound);
            }

            // Pattern matching
            MatchPattern => {
                let index = instruction.int_operand as usize;
                let pattern =
                    self.program
                        .patterns
                        .get(index)
                        .cloned()
                        .ok_or(VmError::MalformedProgram {
                            message: format!("pattern index {} out of range", index),
                            line,
                        })?;
                let value = self.pop("match_pattern")?;
                match pattern::match_value(&value, &pattern) {
                    Some(bindings) => {
                        for (name, bound) in bindings {
                            self.env.define(name, bound);
                        }
                        self.push(Value::Bool(true))?;
                    }
                    None => self.push(Value::Bool(false))?,
                }
            }

            // Concurrency
            BeginParallel => {
                self.blocks.push(BlockContext {
                    kind: BlockKind::Parallel,
                    tasks: Vec::new(),
                });
            }
            EndParallel => {
                let block = self.expect_block(BlockKind::Parallel, line)?;
                let mut results = Vec::with_capacity(block.tasks.len());
                for id in block.tasks {
                    match self.runtime.await_result(id) {
                        Ok(value) => results.push(value),
                        Err(error) => results.push(Value::Error(Box::new(error))),
                    }
                }
                self.push(Value::list(results))?;
            }
            BeginConcurrent => {
                self.blocks.push(BlockContext {
                    kind: BlockKind::Concurrent,
                    tasks: Vec::new(),
                });
            }
            EndConcurrent => {
                let block = self.expect_block(BlockKind::Concurrent, line)?;
                let mut first_error = None;
                for id in block.tasks {
                    if let Err(error) = self.runtime.await_result(id) {
                        first_error.get_or_insert(error);
                    }
                }
                if let Some(error) = first_error {
                    self.raise(error)?;
                    return Ok(VmState::Continue);
                }
            }
            BeginTask => {
                let end = self.find_block_end(self.ip, BeginTask, EndTask, line)?;
                let task_env = Environment::with_enclosing(self.globals.clone());
                let id = self.spawn_task(self.ip, end, task_env);
                self.register_task(id)?;
                self.ip = end + 1;
            }
            BeginWorker => {
                let end = self.find_block_end(self.ip, BeginWorker, EndWorker, line)?;
                let task_env = Environment::with_enclosing(self.globals.clone());
                if !instruction.string_operand.is_empty() {
                    let bound = self.pop("begin_worker")?;
                    task_env.define(instruction.string_operand.clone(), bound);
                }
                let id = self.spawn_task(self.ip, end, task_env);
                self.register_task(id)?;
                self.ip = end + 1;
            }
            StoreIterable => {
                let iterable = self.pop("store_iterable")?;
                self.pending_iterable = Some((instruction.string_operand.clone(), iterable));
            }
            SpawnIteratingTasks => {
                return self.spawn_iterating_tasks(line);
            }
            Await => {
                let value = self.pop("await")?;
                match value {
                    Value::Task(id) => match self.runtime.await_result(id) {
                        Ok(result) => self.push(result)?,
                        Err(error) => {
                            self.raise(error)?;
                            return Ok(VmState::Continue);
                        }
                    },
                    other => {
                        return Err(self.type_error("await", "task", other.type_name(), line))
                    }
                }
            }
            CreateChannel => {
                let id = self.runtime.create_channel();
                self.push(Value::Channel(id))?;
            }
            ChannelSend => {
                let value = self.pop("channel_send")?;
                let channel = self.pop("channel_send")?;
                match channel.as_channel() {
                    Ok(id) => match self.runtime.send(id, value) {
                        Ok(()) => self.push(Value::Nil)?,
                        Err(error) => {
                            self.raise(error)?;
                            return Ok(VmState::Continue);
                        }
                    },
                    Err(_) => {
                        return Err(self.type_error(
                            "channel_send",
                            "channel",
                            channel.type_name(),
                            line,
                        ))
                    }
                }
            }
            ChannelReceive => {
                let channel = self.pop("channel_receive")?;
                match channel.as_channel() {
                    Ok(id) => match self.runtime.recv(id) {
                        Ok(value) => self.push(value)?,
                        Err(error) => {
                            self.raise(error)?;
                            return Ok(VmState::Continue);
                        }
                    },
                    Err(_) => {
                        return Err(self.type_error(
                            "channel_receive",
                            "channel",
                            channel.type_name(),
                            line,
                        ))
                    }
                }
            }
            CloseChannel => {
                let channel = self.pop("close_channel")?;
                match channel.as_channel() {
                    Ok(id) => match self.runtime.close_channel(id) {
                        Ok(()) => self.push(Value::Nil)?,
                        Err(error) => {
                            self.raise(error)?;
                            return Ok(VmState::Continue);
                        }
                    },
                    Err(_) => {
                        return Err(self.type_error(
                            "close_channel",
                            "channel",
                            channel.type_name(),
                            line,
                        ))
                    }
                }
            }
            EndTask | EndWorker => {
                // Reached only as a skip target; the parent jumps past these
            }

            // Modules
            Import => {
                let name = instruction.string_operand.as_str();
                let module = self
                    .registries
                    .modules
                    .read()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| VmError::ModuleError {
                        module_name: name.to_string(),
                        message: "module is not registered".to_string(),
                    })?;
                self.env.define(name.to_string(), module);
            }

            // Misc
            Print => {
                let count = instruction.int_operand as usize;
                let mut parts = Vec::with_capacity(count);
                for _ in 0..count {
                    parts.push(self.pop("print")?);
                }
                parts.reverse();
                let rendered: Vec<String> =
                    parts.iter().map(|v| v.to_display_string()).collect();
                println!("{}", rendered.join(" "));
            }
            Halt => return Ok(VmState::Halt),
            Nop => {}
        }

        Ok(VmState::Continue)
    }

    // --- stack primitives ---

    fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= self.limits.max_stack_depth {
            return Err(VmError::StackOverflow {
                current_depth: self.stack.len(),
                max_depth: self.limits.max_stack_depth,
            });
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, operation: &str) -> VmResult<Value> {
        self.stack.pop().ok_or_else(|| VmError::StackUnderflow {
            operation: operation.to_string(),
            stack_size: 0,
        })
    }

    fn peek(&self, offset: usize) -> VmResult<&Value> {
        let len = self.stack.len();
        if offset >= len {
            return Err(VmError::StackUnderflow {
                operation: "peek".to_string(),
                stack_size: len,
            });
        }
        Ok(&self.stack[len - 1 - offset])
    }

    fn deref_atomic(value: Value) -> Value {
        match value {
            Value::Atomic(cell) => Value::I64(cell.load(AtomicOrdering::SeqCst)),
            other => other,
        }
    }

    // --- arithmetic & comparison ---

    fn binary_arith(&mut self, op: ArithOp, line: u32) -> VmResult<VmState> {
        let b = self.pop("arithmetic")?;
        let a = self.pop("arithmetic")?;

        // Atomic increments stay lock-free: the add happens inside the cell
        // and the handle flows on so the store back is a no-op.
        if let Value::Atomic(cell) = &a {
            if matches!(op, ArithOp::Add | ArithOp::Sub) {
                let delta = Self::deref_atomic(b.clone()).as_i64().map_err(|_| {
                    self.type_error("arithmetic", "integer", b.type_name(), line)
                })?;
                match op {
                    ArithOp::Add => cell.fetch_add(delta, AtomicOrdering::SeqCst),
                    _ => cell.fetch_sub(delta, AtomicOrdering::SeqCst),
                };
                self.push(a.clone())?;
                return Ok(VmState::Continue);
            }
        }

        let a = Self::deref_atomic(a);
        let b = Self::deref_atomic(b);
        match types::arithmetic(op, &a, &b) {
            Ok(result) => {
                self.push(result)?;
                Ok(VmState::Continue)
            }
            Err(err) => self.value_error_to_state(err, "arithmetic", line),
        }
    }

    fn binary_cmp<F>(&mut self, line: u32, operation: &str, f: F) -> VmResult<VmState>
    where
        F: FnOnce(Ordering) -> bool,
    {
        let b = Self::deref_atomic(self.pop(operation)?);
        let a = Self::deref_atomic(self.pop(operation)?);
        match types::compare(&a, &b) {
            Ok(ordering) => {
                self.push(Value::Bool(f(ordering)))?;
                Ok(VmState::Continue)
            }
            Err(_) => Err(self.type_error(
                operation,
                "comparable values",
                &format!("{} and {}", a.type_name(), b.type_name()),
                line,
            )),
        }
    }

    /// Route a value-level failure: recoverable categories become language
    /// errors flowing through the union machinery, the rest abort the run.
    fn value_error_to_state(
        &mut self,
        err: ValueError,
        operation: &str,
        line: u32,
    ) -> VmResult<VmState> {
        let language_error = match err {
            ValueError::DivisionByZero => {
                Some(ErrorValue::new("DivisionByZero", "division by zero", line))
            }
            ValueError::IndexOutOfBounds { index, length } => Some(ErrorValue::new(
                "IndexOutOfBounds",
                format!("index {} out of bounds for length {}", index, length),
                line,
            )),
            ValueError::KeyNotFound(ref key) => Some(ErrorValue::new(
                "KeyNotFound",
                format!("key not found: {}", key),
                line,
            )),
            ValueError::ConversionError { .. } => {
                Some(ErrorValue::new("TypeConversion", err.to_string(), line))
            }
            ValueError::InvalidOperation(ref message) if message.contains("overflow") => {
                Some(ErrorValue::new("OverflowError", message.clone(), line))
            }
            _ => None,
        };
        match language_error {
            Some(error) => {
                self.raise(error)?;
                Ok(VmState::Continue)
            }
            None => Err(VmError::RuntimeError {
                message: format!("{} in {}", err, operation),
                stack_trace: Some(self.build_stack_trace()),
            }),
        }
    }

    // --- control flow ---

    fn resolve_jump(&self, offset: i64) -> VmResult<usize> {
        let target = self.ip as i64 + offset;
        if target < 0 || target as usize > self.program.instructions.len() {
            return Err(VmError::InvalidJumpTarget {
                target,
                program_len: self.program.instructions.len(),
            });
        }
        Ok(target as usize)
    }

    fn jump_relative(&mut self, offset: i64) -> VmResult<()> {
        self.ip = self.resolve_jump(offset)?;
        Ok(())
    }

    /// Index of the instruction closing the block that starts at `from`,
    /// skipping nested blocks of the same kind.
    fn find_block_end(
        &self,
        from: usize,
        open: Opcode,
        close: Opcode,
        line: u32,
    ) -> VmResult<usize> {
        let mut depth = 0usize;
        let mut index = from;
        while index < self.program.instructions.len() {
            let opcode = self.program.instructions[index].opcode;
            if opcode == open {
                depth += 1;
            } else if opcode == close {
                if depth == 0 {
                    return Ok(index);
                }
                depth -= 1;
            }
            index += 1;
        }
        Err(VmError::MalformedProgram {
            message: format!("unmatched {:?}", open),
            line,
        })
    }

    // --- variables ---

    fn store_variable(&mut self, name: &str, value: Value, line: u32) -> VmResult<()> {
        // An existing atomic binding takes the lock-free path
        if let Ok(Value::Atomic(cell)) = self.env.get(name).or_else(|_| self.globals.get(name)) {
            match value {
                Value::Atomic(other) if Arc::ptr_eq(&cell, &other) => return Ok(()),
                other => {
                    let n = other.as_i64().map_err(|_| {
                        self.type_error("store_var", "integer", other.type_name(), line)
                    })?;
                    cell.store(n, AtomicOrdering::SeqCst);
                    return Ok(());
                }
            }
        }
        self.env
            .assign(name, value.clone())
            .or_else(|_| self.globals.assign(name, value))
            .map_err(|_| VmError::UndefinedVariable {
                name: name.to_string(),
                line,
            })
    }

    // --- calls ---

    fn call_named(&mut self, name: &str, argc: usize, line: u32) -> VmResult<VmState> {
        let func = self.registries.functions.read().get(name).cloned();
        if let Some(func) = func {
            self.call_function(func, argc, None)?;
            return Ok(VmState::Continue);
        }
        let native = self.registries.natives.read().get(name).cloned();
        if let Some(native) = native {
            return self.invoke_native(native, argc);
        }
        if let Some((enum_name, variant)) = name.split_once('.') {
            let payload_type = self
                .registries
                .enums
                .read()
                .get(enum_name)
                .and_then(|def| def.variants.get(variant).cloned());
            if let Some(payload_type) = payload_type {
                return self.construct_enum_variant(name, payload_type, argc, line);
            }
        }
        if let Ok(value) = self.env.get(name).or_else(|_| self.globals.get(name)) {
            match value {
                Value::Closure(closure) => {
                    self.call_function(
                        closure.function.clone(),
                        argc,
                        Some(closure.captured.clone()),
                    )?;
                    return Ok(VmState::Continue);
                }
                Value::Function(func) => {
                    self.call_function(func, argc, None)?;
                    return Ok(VmState::Continue);
                }
                Value::NativeFunction { function, .. } => {
                    return self.invoke_native_fn(&*function, argc);
                }
                Value::Class(class) => {
                    self.construct_object(class, argc)?;
                    return Ok(VmState::Continue);
                }
                _ => {}
            }
        }
        Err(VmError::UndefinedFunction {
            name: name.to_string(),
            line,
        })
    }

    /// Push a frame and jump into a function body. The invocation scope is a
    /// child of the globals for plain functions, or of the closure's captured
    /// snapshot when `env_root` is given.
    fn call_function(
        &mut self,
        func: Arc<FunctionValue>,
        argc: usize,
        env_root: Option<Environment>,
    ) -> VmResult<()> {
        if self.call_stack.len() >= self.limits.max_call_depth {
            return Err(VmError::CallStackOverflow {
                current_depth: self.call_stack.len(),
                max_depth: self.limits.max_call_depth,
            });
        }
        if self.stack.len() < argc {
            return Err(VmError::StackUnderflow {
                operation: format!("call {}", func.name),
                stack_size: self.stack.len(),
            });
        }
        let root = env_root.unwrap_or_else(|| self.globals.clone());
        let call_env = Environment::with_enclosing(root);
        let caller_env = std::mem::replace(&mut self.env, call_env);
        self.call_stack.push(CallFrame {
            function_name: func.name.clone(),
            return_address: self.ip,
            stack_base: self.stack.len() - argc,
            caller_env,
            args_supplied: argc,
            args_remaining: argc,
        });
        trace!(function = %func.name, argc, "call");
        self.ip = func.start;
        Ok(())
    }

    fn return_from_call(&mut self, value: Value, line: u32) -> VmResult<()> {
        let frame = self.call_stack.pop().ok_or(VmError::MalformedProgram {
            message: "return outside a call".to_string(),
            line,
        })?;
        self.stack.truncate(frame.stack_base);
        self.env = frame.caller_env;
        self.ip = frame.return_address;
        // Handlers installed inside the finished function are dead now
        while self
            .error_frames
            .last()
            .is_some_and(|f| f.call_depth > self.call_stack.len())
        {
            self.error_frames.pop();
        }
        self.push(value)
    }

    fn invoke_native(&mut self, callable: NativeCallable, argc: usize) -> VmResult<VmState> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop("native call")?);
        }
        args.reverse();
        let result = match callable {
            NativeCallable::Plain(function) => function(&args),
            NativeCallable::VmAware(function) => function(self, &args),
        };
        match result {
            Ok(value) => {
                self.push(value)?;
                Ok(VmState::Continue)
            }
            Err(error) => {
                self.raise(error)?;
                Ok(VmState::Continue)
            }
        }
    }

    fn invoke_native_fn(
        &mut self,
        function: &(dyn Fn(&[Value]) -> Result<Value, ErrorValue> + Send + Sync),
        argc: usize,
    ) -> VmResult<VmState> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop("native call")?);
        }
        args.reverse();
        match function(&args) {
            Ok(value) => {
                self.push(value)?;
                Ok(VmState::Continue)
            }
            Err(error) => {
                self.raise(error)?;
                Ok(VmState::Continue)
            }
        }
    }

    fn construct_enum_variant(
        &mut self,
        full_name: &str,
        payload_type: Option<String>,
        argc: usize,
        line: u32,
    ) -> VmResult<VmState> {
        let payload = match (payload_type, argc) {
            (Some(_), 1) => Some(Box::new(self.pop("enum construction")?)),
            (None, 0) => None,
            (_, supplied) => {
                return Err(VmError::RuntimeError {
                    message: format!(
                        "wrong argument count {} for enum variant {}",
                        supplied, full_name
                    ),
                    stack_trace: Some(self.build_stack_trace()),
                })
            }
        };
        self.push(Value::EnumVariant {
            name: full_name.to_string(),
            payload,
        })?;
        Ok(VmState::Continue)
    }

    fn construct_object(&mut self, class: Arc<ClassValue>, argc: usize) -> VmResult<()> {
        let mut fields = FxHashMap::default();
        for (name, default) in class.field_defaults() {
            fields.insert(name, default);
        }
        let object = Value::Object(Arc::new(RwLock::new(ObjectValue {
            class: class.clone(),
            fields,
        })));
        if let Some(init) = class.find_method("init") {
            let depth = self.call_stack.len();
            self.call_function(init, argc, None)?;
            self.env.define("this", object.clone());
            self.finish_call(depth)?;
            // The constructor's own return value is discarded
            self.pop("constructor result")?;
        } else {
            for _ in 0..argc {
                self.pop("constructor arguments")?;
            }
        }
        self.push(object)
    }

    fn create_closure(&mut self, instruction: &Instruction, line: u32) -> VmResult<VmState> {
        let func = self
            .registries
            .functions
            .read()
            .get(&instruction.string_operand)
            .cloned()
            .ok_or_else(|| VmError::UndefinedFunction {
                name: instruction.string_operand.clone(),
                line,
            })?;
        let count = instruction.int_operand as usize;
        let mut captured_names = Vec::with_capacity(count);
        for _ in 0..count {
            let name = self.pop("create_closure")?;
            let name = name.as_str().map_err(|_| VmError::MalformedProgram {
                message: "captured variable name must be a string".to_string(),
                line,
            })?;
            captured_names.push(name.to_string());
        }
        captured_names.reverse();

        // Capture by value at creation time: a fresh parentless scope holding
        // a copy of each named binding. Later writes to the defining scope do
        // not reach the closure.
        let captured = Environment::new();
        for name in &captured_names {
            let value = self
                .env
                .get(name)
                .or_else(|_| self.globals.get(name))
                .map_err(|_| VmError::UndefinedVariable {
                    name: name.clone(),
                    line,
                })?;
            captured.define(name.clone(), value);
        }

        self.push(Value::Closure(Arc::new(ClosureValue {
            function: func,
            captured,
            captured_names,
        })))?;
        Ok(VmState::Continue)
    }

    // --- properties & indexing ---

    fn get_property(&mut self, name: &str, line: u32) -> VmResult<VmState> {
        let target = self.pop("get_property")?;
        match &target {
            Value::Object(object) => {
                let found = object.read().fields.get(name).cloned();
                if let Some(value) = found {
                    self.push(value)?;
                    return Ok(VmState::Continue);
                }
                let method = object.read().class.find_method(name);
                if let Some(method) = method {
                    // Bind the receiver the way any capture is bound
                    let captured = Environment::new();
                    captured.define("this", target.clone());
                    self.push(Value::Closure(Arc::new(ClosureValue {
                        function: method,
                        captured,
                        captured_names: vec!["this".to_string()],
                    })))?;
                    return Ok(VmState::Continue);
                }
                self.raise(ErrorValue::new(
                    "KeyNotFound",
                    format!("no property '{}' on {}", name, object.read().class.name),
                    line,
                ))?;
                Ok(VmState::Continue)
            }
            Value::Dict(dict) => {
                let found = dict.read().get(&DictKey::Str(name.to_string())).cloned();
                match found {
                    Some(value) => {
                        self.push(value)?;
                        Ok(VmState::Continue)
                    }
                    None => {
                        self.raise(ErrorValue::new(
                            "KeyNotFound",
                            format!("key not found: {}", name),
                            line,
                        ))?;
                        Ok(VmState::Continue)
                    }
                }
            }
            Value::Module { name: module, exports } => match exports.get(name) {
                Some(value) => {
                    self.push(value.clone())?;
                    Ok(VmState::Continue)
                }
                None => Err(VmError::ModuleError {
                    module_name: module.clone(),
                    message: format!("module does not export '{}'", name),
                }),
            },
            Value::Nil => {
                self.raise(ErrorValue::new(
                    "NullReference",
                    format!("property '{}' on nil", name),
                    line,
                ))?;
                Ok(VmState::Continue)
            }
            other => Err(self.type_error("get_property", "object", other.type_name(), line)),
        }
    }

    fn set_property(&mut self, name: &str, line: u32) -> VmResult<VmState> {
        let value = self.pop("set_property")?;
        let target = self.pop("set_property")?;
        match &target {
            Value::Object(object) => {
                object.write().fields.insert(name.to_string(), value);
                Ok(VmState::Continue)
            }
            Value::Dict(dict) => {
                dict.write().insert(DictKey::Str(name.to_string()), value);
                Ok(VmState::Continue)
            }
            Value::Nil => {
                self.raise(ErrorValue::new(
                    "NullReference",
                    format!("property '{}' on nil", name),
                    line,
                ))?;
                Ok(VmState::Continue)
            }
            other => Err(self.type_error("set_property", "object", other.type_name(), line)),
        }
    }

    fn get_index(&mut self, line: u32) -> VmResult<VmState> {
        let index = Self::deref_atomic(self.pop("get_index")?);
        let container = self.pop("get_index")?;
        match &container {
            Value::List(items) | Value::Tuple(items) => {
                let i = match index.as_i64() {
                    Ok(i) => i,
                    Err(_) => {
                        return Err(self.type_error(
                            "get_index",
                            "integer index",
                            index.type_name(),
                            line,
                        ))
                    }
                };
                let items = items.read();
                if i < 0 || i as usize >= items.len() {
                    let length = items.len();
                    drop(items);
                    return self.value_error_to_state(
                        ValueError::IndexOutOfBounds { index: i, length },
                        "get_index",
                        line,
                    );
                }
                let value = items[i as usize].clone();
                drop(items);
                self.push(value)?;
                Ok(VmState::Continue)
            }
            Value::Dict(dict) => {
                let key = match DictKey::from_value(&index) {
                    Ok(key) => key,
                    Err(err) => return self.value_error_to_state(err, "get_index", line),
                };
                let found = dict.read().get(&key).cloned();
                match found {
                    Some(value) => {
                        self.push(value)?;
                        Ok(VmState::Continue)
                    }
                    None => self.value_error_to_state(
                        ValueError::KeyNotFound(index.to_display_string()),
                        "get_index",
                        line,
                    ),
                }
            }
            Value::String(s) => {
                let i = match index.as_i64() {
                    Ok(i) => i,
                    Err(_) => {
                        return Err(self.type_error(
                            "get_index",
                            "integer index",
                            index.type_name(),
                            line,
                        ))
                    }
                };
                match s.chars().nth(i.max(0) as usize) {
                    Some(c) if i >= 0 => {
                        self.push(Value::String(c.to_string()))?;
                        Ok(VmState::Continue)
                    }
                    _ => self.value_error_to_state(
                        ValueError::IndexOutOfBounds {
                            index: i,
                            length: s.chars().count(),
                        },
                        "get_index",
                        line,
                    ),
                }
            }
            Value::Range { start, end, step } => {
                let i = match index.as_i64() {
                    Ok(i) => i,
                    Err(_) => {
                        return Err(self.type_error(
                            "get_index",
                            "integer index",
                            index.type_name(),
                            line,
                        ))
                    }
                };
                let span = checked_ops::sub_i64(*end, *start)?;
                let count = if *step != 0 { (span / *step).max(0) } else { 0 };
                if i < 0 || i >= count {
                    return self.value_error_to_state(
                        ValueError::IndexOutOfBounds {
                            index: i,
                            length: count.max(0) as usize,
                        },
                        "get_index",
                        line,
                    );
                }
                let value = checked_ops::add_i64(*start, checked_ops::mul_i64(i, *step)?)?;
                self.push(Value::I64(value))?;
                Ok(VmState::Continue)
            }
            other => Err(self.type_error("get_index", "indexable", other.type_name(), line)),
        }
    }

    fn set_index(&mut self, line: u32) -> VmResult<VmState> {
        let value = self.pop("set_index")?;
        let index = Self::deref_atomic(self.pop("set_index")?);
        let container = self.pop("set_index")?;
        match &container {
            Value::List(items) | Value::Tuple(items) => {
                let i = match index.as_i64() {
                    Ok(i) => i,
                    Err(_) => {
                        return Err(self.type_error(
                            "set_index",
                            "integer index",
                            index.type_name(),
                            line,
                        ))
                    }
                };
                let mut items = items.write();
                if i < 0 || i as usize >= items.len() {
                    let length = items.len();
                    drop(items);
                    return self.value_error_to_state(
                        ValueError::IndexOutOfBounds { index: i, length },
                        "set_index",
                        line,
                    );
                }
                items[i as usize] = value;
                Ok(VmState::Continue)
            }
            Value::Dict(dict) => {
                let key = match DictKey::from_value(&index) {
                    Ok(key) => key,
                    Err(err) => return self.value_error_to_state(err, "set_index", line),
                };
                dict.write().insert(key, value);
                Ok(VmState::Continue)
            }
            other => Err(self.type_error("set_index", "list or dict", other.type_name(), line)),
        }
    }

    // --- iterators ---

    fn get_iterator(&mut self, line: u32) -> VmResult<VmState> {
        let value = self.pop("get_iterator")?;
        let iterator = match &value {
            Value::Iterator(_) => {
                self.push(value)?;
                return Ok(VmState::Continue);
            }
            Value::Channel(id) => IteratorValue::channel(*id),
            Value::List(items) => IteratorValue::seq(items.read().clone()),
            Value::Tuple(items) => IteratorValue::seq(items.read().clone()),
            Value::Range { start, end, step } => {
                match Value::materialize_range(*start, *end, *step) {
                    Ok(items) => IteratorValue::seq(items),
                    Err(err) => return self.value_error_to_state(err, "get_iterator", line),
                }
            }
            Value::Dict(dict) => IteratorValue::seq(
                dict.read()
                    .entries
                    .iter()
                    .map(|(key, value)| Value::tuple(vec![key.to_value(), value.clone()]))
                    .collect(),
            ),
            Value::String(s) => {
                IteratorValue::seq(s.chars().map(|c| Value::String(c.to_string())).collect())
            }
            other => {
                return Err(self.type_error("get_iterator", "iterable", other.type_name(), line))
            }
        };
        self.push(Value::iterator(iterator))?;
        Ok(VmState::Continue)
    }

    fn iterator_has_next(&mut self, line: u32) -> VmResult<VmState> {
        let iterator = self.peek(0)?.clone();
        let cell = match &iterator {
            Value::Iterator(cell) => Arc::clone(cell),
            other => {
                return Err(self.type_error(
                    "iterator_has_next",
                    "iterator",
                    other.type_name(),
                    line,
                ))
            }
        };
        let has_next = {
            let mut state = cell.lock();
            match &mut *state {
                IteratorValue::Seq { items, index } => *index < items.len(),
                IteratorValue::Channel {
                    id,
                    buffered,
                    exhausted,
                } => {
                    if buffered.is_some() {
                        true
                    } else if *exhausted {
                        // Exhaustion is permanent once reported
                        false
                    } else {
                        match self.runtime.recv(*id) {
                            Ok(value) => {
                                *buffered = Some(value);
                                true
                            }
                            Err(_) => {
                                *exhausted = true;
                                false
                            }
                        }
                    }
                }
            }
        };
        self.push(Value::Bool(has_next))?;
        Ok(VmState::Continue)
    }

    fn iterator_next(&mut self, line: u32, key_value: bool) -> VmResult<VmState> {
        let iterator = self.peek(0)?.clone();
        let cell = match &iterator {
            Value::Iterator(cell) => Arc::clone(cell),
            other => {
                return Err(self.type_error("iterator_next", "iterator", other.type_name(), line))
            }
        };
        let mut channel_error = None;
        let next = {
            let mut state = cell.lock();
            match &mut *state {
                IteratorValue::Seq { items, index } => {
                    if *index < items.len() {
                        let value = items[*index].clone();
                        *index += 1;
                        Some(value)
                    } else {
                        None
                    }
                }
                IteratorValue::Channel {
                    id,
                    buffered,
                    exhausted,
                } => {
                    if let Some(value) = buffered.take() {
                        Some(value)
                    } else if *exhausted {
                        None
                    } else {
                        match self.runtime.recv(*id) {
                            Ok(value) => Some(value),
                            Err(error) => {
                                *exhausted = true;
                                channel_error = Some(error);
                                None
                            }
                        }
                    }
                }
            }
        };
        if let Some(error) = channel_error {
            self.raise(error)?;
            return Ok(VmState::Continue);
        }
        let value = next.ok_or_else(|| VmError::RuntimeError {
            message: "iterator exhausted".to_string(),
            stack_trace: Some(self.build_stack_trace()),
        })?;
        if key_value {
            match &value {
                Value::Tuple(items) if items.read().len() == 2 => {
                    let items = items.read();
                    let key = items[0].clone();
                    let entry = items[1].clone();
                    drop(items);
                    self.push(key)?;
                    self.push(entry)?;
                }
                other => {
                    return Err(self.type_error(
                        "iterator_next",
                        "key/value pair",
                        other.type_name(),
                        line,
                    ))
                }
            }
        } else {
            self.push(value)?;
        }
        Ok(VmState::Continue)
    }

    // --- error propagation ---

    fn raise(&mut self, error: ErrorValue) -> VmResult<()> {
        self.propagate_error(Value::union_err(error))
    }

    /// Walk the error-frame stack for a handler; failing that, return the
    /// error from the innermost enclosing function exactly as a RETURN of the
    /// error value would. At top level the error aborts the run.
    fn propagate_error(&mut self, error: Value) -> VmResult<()> {
        let error_type = error
            .error_value()
            .map(|e| e.error_type.clone())
            .unwrap_or_default();

        while let Some(frame) = self.error_frames.last() {
            let matches = frame
                .expected_error
                .as_deref()
                .map_or(true, |expected| expected == error_type);
            if !matches {
                self.error_frames.pop();
                continue;
            }
            let frame = self.error_frames.pop().expect("frame just observed");
            debug!(
                error = %error_type,
                handler = frame.handler_address,
                function = %frame.function_name,
                "transferring to error handler"
            );
            while self.call_stack.len() > frame.call_depth {
                let popped = self.call_stack.pop().expect("depth checked");
                self.env = popped.caller_env;
            }
            self.stack.truncate(frame.stack_depth);
            self.ip = frame.handler_address;
            return self.push(error);
        }

        if !self.call_stack.is_empty() {
            debug!(error = %error_type, "no handler; returning error from function");
            let line = error.error_value().map(|e| e.line).unwrap_or(0);
            return self.return_from_call(error, line);
        }

        let line = error.error_value().map(|e| e.line).unwrap_or(0);
        let error = error
            .error_value()
            .cloned()
            .unwrap_or_else(|| ErrorValue::new("UnknownError", "", line));
        Err(VmError::UnhandledError { error, line })
    }

    // --- concurrency ---

    fn expect_block(&mut self, kind: BlockKind, line: u32) -> VmResult<BlockContext> {
        match self.blocks.pop() {
            Some(block) if block.kind == kind => Ok(block),
            _ => Err(VmError::MalformedProgram {
                message: format!("unbalanced {:?} block", kind),
                line,
            }),
        }
    }

    fn register_task(&mut self, id: TaskId) -> VmResult<()> {
        match self.blocks.last_mut() {
            Some(block) => {
                block.tasks.push(id);
                Ok(())
            }
            None => self.push(Value::Task(id)),
        }
    }

    fn spawn_task(&self, start: usize, end: usize, env: Environment) -> TaskId {
        let program = Arc::clone(&self.program);
        let registries = Arc::clone(&self.registries);
        let runtime = Arc::clone(&self.runtime);
        let globals = self.globals.clone();
        let limits = self.limits.clone();
        debug!(start, end, "spawning task body");
        self.runtime.submit(move || {
            let mut vm = Vm::task_vm(program, registries, runtime, globals, env, limits);
            vm.ip = start;
            vm.run_range(start, end).map_err(|err| match err {
                VmError::UnhandledError { error, .. } => error,
                other => ErrorValue::new("TaskError", other.to_string(), 0),
            })
        })
    }

    fn spawn_iterating_tasks(&mut self, line: u32) -> VmResult<VmState> {
        let (loop_var, iterable) =
            self.pending_iterable
                .take()
                .ok_or(VmError::MalformedProgram {
                    message: "no stored iterable for task iteration".to_string(),
                    line,
                })?;
        let begins_task = self
            .program
            .instructions
            .get(self.ip)
            .map(|i| i.opcode == Opcode::BeginTask)
            .unwrap_or(false);
        if !begins_task {
            return Err(VmError::MalformedProgram {
                message: "task iteration must be followed by a task body".to_string(),
                line,
            });
        }
        let body_start = self.ip + 1;
        let end = self.find_block_end(body_start, Opcode::BeginTask, Opcode::EndTask, line)?;

        let items = match &iterable {
            Value::List(items) => items.read().clone(),
            Value::Tuple(items) => items.read().clone(),
            Value::Range { start, end, step } => {
                match Value::materialize_range(*start, *end, *step) {
                    Ok(items) => items,
                    Err(err) => return self.value_error_to_state(err, "spawn_tasks", line),
                }
            }
            Value::Dict(dict) => dict
                .read()
                .entries
                .iter()
                .map(|(key, value)| Value::tuple(vec![key.to_value(), value.clone()]))
                .collect(),
            other => {
                return Err(self.type_error("spawn_tasks", "iterable", other.type_name(), line))
            }
        };

        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            let task_env = Environment::with_enclosing(self.globals.clone());
            task_env.define(loop_var.clone(), item);
            handles.push(self.spawn_task(body_start, end, task_env));
        }
        if let Some(block) = self.blocks.last_mut() {
            block.tasks.extend(handles);
        } else {
            let values = handles.into_iter().map(Value::Task).collect();
            self.push(Value::list(values))?;
        }
        self.ip = end + 1;
        Ok(VmState::Continue)
    }

    // --- diagnostics ---

    fn current_function_name(&self) -> String {
        self.call_stack
            .last()
            .map(|frame| frame.function_name.clone())
            .unwrap_or_else(|| "<main>".to_string())
    }

    fn type_error(&self, operation: &str, expected: &str, got: &str, line: u32) -> VmError {
        VmError::TypeError {
            operation: operation.to_string(),
            expected: expected.to_string(),
            got: got.to_string(),
            line,
        }
    }

    /// Build a stack trace from the current call stack.
    pub fn build_stack_trace(&self) -> StackTrace {
        let mut trace = StackTrace::new();
        for frame in &self.call_stack {
            let line = self
                .program
                .instructions
                .get(frame.return_address.saturating_sub(1))
                .map(|i| i.line)
                .unwrap_or(0);
            trace.push_frame(StackFrame {
                function_name: frame.function_name.clone(),
                ip: frame.return_address,
                line,
            });
        }
        trace
    }
}

#[cfg(test)]
#[path = "vm_tests.rs"]
mod tests;
