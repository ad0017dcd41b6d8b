use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use monkey_syntax::{Block, Expr, Program, Stmt};
use sha2::{Digest, Sha256};

pub const STACK_SIZE: usize = 2048;
pub const GLOBALS_SIZE: usize = 65536;
pub const MAX_FRAMES: usize = 1024;

// ---------------------------------------------------------------------------
// Object model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Value {
    Integer(i64),
    String(Rc<String>),
    Boolean(bool),
    Null,
    Array(Rc<Vec<Value>>),
    Hash(Rc<HashValue>),
    CompiledFunction(Rc<CompiledFunction>),
    Closure(Rc<ClosureValue>),
    Builtin(BuiltinDef),
    /// Bubbles a `return` through nested blocks in the tree interpreter.
    /// Never observed by the VM.
    ReturnValue(Box<Value>),
    /// Message-bearing failure value of the tree interpreter.
    Error(String),
    Quote(Rc<Expr>),
    Function(Rc<FunctionValue>),
    Macro(Rc<MacroValue>),
}

pub type HashValue = IndexMap<HashKey, HashPair>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey {
    pub kind: &'static str,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashPair {
    pub key: Value,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    pub instructions: Instructions,
    pub num_locals: u8,
    pub num_parameters: u8,
}

#[derive(Debug, Clone)]
pub struct ClosureValue {
    pub func: Rc<CompiledFunction>,
    pub free: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct FunctionValue {
    pub parameters: Vec<String>,
    pub body: Block,
    pub env: Environment,
}

#[derive(Debug, Clone)]
pub struct MacroValue {
    pub parameters: Vec<String>,
    pub body: Block,
    pub env: Environment,
}

pub type BuiltinFn = fn(&[Value]) -> Value;

#[derive(Clone, Copy)]
pub struct BuiltinDef {
    pub name: &'static str,
    pub func: BuiltinFn,
}

impl fmt::Debug for BuiltinDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuiltinDef({})", self.name)
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "INTEGER",
            Value::String(_) => "STRING",
            Value::Boolean(_) => "BOOLEAN",
            Value::Null => "NULL",
            Value::Array(_) => "ARRAY",
            Value::Hash(_) => "HASH",
            Value::CompiledFunction(_) => "COMPILED_FUNCTION",
            Value::Closure(_) => "CLOSURE",
            Value::Builtin(_) => "BUILTIN",
            Value::ReturnValue(_) => "RETURN_VALUE",
            Value::Error(_) => "ERROR",
            Value::Quote(_) => "QUOTE",
            Value::Function(_) => "FUNCTION",
            Value::Macro(_) => "MACRO",
        }
    }

    pub fn inspect(&self) -> String {
        match self {
            Value::Integer(value) => value.to_string(),
            Value::String(value) => value.as_ref().clone(),
            Value::Boolean(value) => value.to_string(),
            Value::Null => "null".to_string(),
            Value::Array(elements) => {
                let elements = elements
                    .iter()
                    .map(Value::inspect)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("[{elements}]")
            }
            Value::Hash(pairs) => {
                let pairs = pairs
                    .values()
                    .map(|pair| format!("{} : {}", pair.key.inspect(), pair.value.inspect()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{pairs}}}")
            }
            Value::CompiledFunction(func) => {
                format!("CompiledFunction[{:p}]", Rc::as_ptr(func))
            }
            Value::Closure(closure) => format!("Closure[{:p}]", Rc::as_ptr(closure)),
            Value::Builtin(_) => "builtin function".to_string(),
            Value::ReturnValue(value) => value.inspect(),
            Value::Error(message) => format!("ERROR: {message}"),
            Value::Quote(node) => format!("QUOTE({node})"),
            Value::Function(func) => {
                format!("fn({}) {{\n{}\n}}", func.parameters.join(", "), func.body)
            }
            Value::Macro(value) => {
                format!("macro({}) {{\n{}\n}}", value.parameters.join(", "), value.body)
            }
        }
    }

    /// Digest pair used for hash keys. `None` marks unhashable kinds.
    pub fn hash_key(&self) -> Option<HashKey> {
        match self {
            Value::Integer(value) => Some(HashKey {
                kind: self.type_name(),
                value: *value as u64,
            }),
            Value::Boolean(value) => Some(HashKey {
                kind: self.type_name(),
                value: u64::from(*value),
            }),
            Value::String(value) => Some(HashKey {
                kind: self.type_name(),
                value: fnv1a_64(value.as_bytes()),
            }),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }
}

// Structural equality for data kinds, identity for callables. The VM's own
// `==` operator has different semantics (see `values_identical`).
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Hash(a), Value::Hash(b)) => a == b,
            (Value::CompiledFunction(a), Value::CompiledFunction(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            (Value::ReturnValue(a), Value::ReturnValue(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Quote(a), Value::Quote(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Macro(a), Value::Macro(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Name-to-value store with an optional enclosing environment. Used only by
/// the tree interpreter while evaluating macro bodies; the compiled VM has
/// no environment object.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    inner: Rc<RefCell<EnvironmentInner>>,
}

#[derive(Debug, Default)]
struct EnvironmentInner {
    store: HashMap<String, Value>,
    outer: Option<Environment>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_enclosed(outer: &Environment) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EnvironmentInner {
                store: HashMap::new(),
                outer: Some(outer.clone()),
            })),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let inner = self.inner.borrow();
        match inner.store.get(name) {
            Some(value) => Some(value.clone()),
            None => inner.outer.as_ref().and_then(|outer| outer.get(name)),
        }
    }

    pub fn set(&self, name: &str, value: Value) -> Value {
        self.inner
            .borrow_mut()
            .store
            .insert(name.to_string(), value.clone());
        value
    }

    /// Flattened view with local bindings shadowing outer ones, sorted by
    /// name for stable output.
    pub fn all(&self) -> Vec<(String, Value)> {
        let mut merged = HashMap::new();
        self.collect(&mut merged);
        let mut entries: Vec<(String, Value)> = merged.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn collect(&self, into: &mut HashMap<String, Value>) {
        let inner = self.inner.borrow();
        if let Some(outer) = &inner.outer {
            outer.collect(into);
        }
        for (name, value) in &inner.store {
            into.insert(name.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

pub const BUILTINS: &[BuiltinDef] = &[
    BuiltinDef {
        name: "puts",
        func: builtin_puts,
    },
    BuiltinDef {
        name: "len",
        func: builtin_len,
    },
    BuiltinDef {
        name: "first",
        func: builtin_first,
    },
    BuiltinDef {
        name: "last",
        func: builtin_last,
    },
    BuiltinDef {
        name: "rest",
        func: builtin_rest,
    },
    BuiltinDef {
        name: "push",
        func: builtin_push,
    },
];

pub fn lookup_builtin(name: &str) -> Option<BuiltinDef> {
    BUILTINS.iter().find(|def| def.name == name).copied()
}

fn builtin_puts(args: &[Value]) -> Value {
    for arg in args {
        println!("{}", arg.inspect());
    }
    Value::Null
}

fn builtin_len(args: &[Value]) -> Value {
    if args.len() != 1 {
        return Value::Error(format!(
            "len() requires exactly one argument, got {}",
            args.len()
        ));
    }
    match &args[0] {
        Value::Array(elements) => Value::Integer(elements.len() as i64),
        Value::String(value) => Value::Integer(value.len() as i64),
        other => Value::Error(format!(
            "argument of type {} not supported for len()",
            other.type_name()
        )),
    }
}

fn builtin_first(args: &[Value]) -> Value {
    if args.len() != 1 {
        return Value::Error(format!(
            "first() requires exactly one argument, got {}",
            args.len()
        ));
    }
    match &args[0] {
        Value::Array(elements) => elements.first().cloned().unwrap_or(Value::Null),
        other => Value::Error(format!(
            "argument to first() must be an ARRAY, got {}",
            other.type_name()
        )),
    }
}

fn builtin_last(args: &[Value]) -> Value {
    if args.len() != 1 {
        return Value::Error(format!(
            "last() requires exactly one argument, got {}",
            args.len()
        ));
    }
    match &args[0] {
        Value::Array(elements) => elements.last().cloned().unwrap_or(Value::Null),
        other => Value::Error(format!(
            "argument to last() must be an ARRAY, got {}",
            other.type_name()
        )),
    }
}

fn builtin_rest(args: &[Value]) -> Value {
    if args.len() != 1 {
        return Value::Error(format!(
            "rest() requires exactly one argument, got {}",
            args.len()
        ));
    }
    match &args[0] {
        Value::Array(elements) => {
            if elements.is_empty() {
                Value::Null
            } else {
                Value::Array(Rc::new(elements[1..].to_vec()))
            }
        }
        other => Value::Error(format!(
            "argument to rest() must be an ARRAY, got {}",
            other.type_name()
        )),
    }
}

fn builtin_push(args: &[Value]) -> Value {
    if args.len() != 2 {
        return Value::Error(format!(
            "push() requires exactly two arguments, got {}",
            args.len()
        ));
    }
    match &args[0] {
        Value::Array(elements) => {
            let mut extended = elements.as_ref().clone();
            extended.push(args[1].clone());
            Value::Array(Rc::new(extended))
        }
        other => Value::Error(format!(
            "argument to push() must be an ARRAY, got {}",
            other.type_name()
        )),
    }
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

pub type Instructions = Vec<u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Constant = 0,
    Add,
    Pop,
    Sub,
    Mul,
    Div,
    True,
    False,
    Equal,
    NotEqual,
    GreaterThan,
    Minus,
    Bang,
    JumpNotTruthy,
    Jump,
    Null,
    GetGlobal,
    SetGlobal,
    Array,
    Hash,
    Index,
    Call,
    ReturnValue,
    Return,
    GetLocal,
    SetLocal,
    GetBuiltin,
    Closure,
    GetFree,
    CurrentClosure,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        let op = match byte {
            0 => Opcode::Constant,
            1 => Opcode::Add,
            2 => Opcode::Pop,
            3 => Opcode::Sub,
            4 => Opcode::Mul,
            5 => Opcode::Div,
            6 => Opcode::True,
            7 => Opcode::False,
            8 => Opcode::Equal,
            9 => Opcode::NotEqual,
            10 => Opcode::GreaterThan,
            11 => Opcode::Minus,
            12 => Opcode::Bang,
            13 => Opcode::JumpNotTruthy,
            14 => Opcode::Jump,
            15 => Opcode::Null,
            16 => Opcode::GetGlobal,
            17 => Opcode::SetGlobal,
            18 => Opcode::Array,
            19 => Opcode::Hash,
            20 => Opcode::Index,
            21 => Opcode::Call,
            22 => Opcode::ReturnValue,
            23 => Opcode::Return,
            24 => Opcode::GetLocal,
            25 => Opcode::SetLocal,
            26 => Opcode::GetBuiltin,
            27 => Opcode::Closure,
            28 => Opcode::GetFree,
            29 => Opcode::CurrentClosure,
            _ => return None,
        };
        Some(op)
    }
}

pub struct Definition {
    pub name: &'static str,
    pub operand_widths: &'static [usize],
}

pub fn definition(op: Opcode) -> Definition {
    let (name, operand_widths): (&'static str, &'static [usize]) = match op {
        Opcode::Constant => ("OpConstant", &[2]),
        Opcode::Add => ("OpAdd", &[]),
        Opcode::Pop => ("OpPop", &[]),
        Opcode::Sub => ("OpSub", &[]),
        Opcode::Mul => ("OpMul", &[]),
        Opcode::Div => ("OpDiv", &[]),
        Opcode::True => ("OpTrue", &[]),
        Opcode::False => ("OpFalse", &[]),
        Opcode::Equal => ("OpEqual", &[]),
        Opcode::NotEqual => ("OpNotEqual", &[]),
        Opcode::GreaterThan => ("OpGreaterThan", &[]),
        Opcode::Minus => ("OpMinus", &[]),
        Opcode::Bang => ("OpBang", &[]),
        Opcode::JumpNotTruthy => ("OpJumpNotTruthy", &[2]),
        Opcode::Jump => ("OpJump", &[2]),
        Opcode::Null => ("OpNull", &[]),
        Opcode::GetGlobal => ("OpGetGlobal", &[2]),
        Opcode::SetGlobal => ("OpSetGlobal", &[2]),
        Opcode::Array => ("OpArray", &[2]),
        Opcode::Hash => ("OpHash", &[2]),
        Opcode::Index => ("OpIndex", &[]),
        Opcode::Call => ("OpCall", &[1]),
        Opcode::ReturnValue => ("OpReturnValue", &[]),
        Opcode::Return => ("OpReturn", &[]),
        Opcode::GetLocal => ("OpGetLocal", &[1]),
        Opcode::SetLocal => ("OpSetLocal", &[1]),
        Opcode::GetBuiltin => ("OpGetBuiltin", &[1]),
        Opcode::Closure => ("OpClosure", &[2, 1]),
        Opcode::GetFree => ("OpGetFree", &[1]),
        Opcode::CurrentClosure => ("OpCurrentClosure", &[]),
    };
    Definition {
        name,
        operand_widths,
    }
}

pub fn make(op: Opcode, operands: &[usize]) -> Vec<u8> {
    let def = definition(op);
    let mut instruction = vec![op as u8];
    for (operand, width) in operands.iter().zip(def.operand_widths.iter()) {
        match *width {
            2 => instruction.extend_from_slice(&(*operand as u16).to_be_bytes()),
            1 => instruction.push(*operand as u8),
            _ => {}
        }
    }
    instruction
}

pub fn read_u16(ins: &[u8]) -> u16 {
    u16::from_be_bytes([ins[0], ins[1]])
}

pub fn read_u8(ins: &[u8]) -> u8 {
    ins[0]
}

pub fn read_operands(def: &Definition, ins: &[u8]) -> (Vec<usize>, usize) {
    let mut operands = Vec::with_capacity(def.operand_widths.len());
    let mut offset = 0;
    for width in def.operand_widths {
        match *width {
            2 => operands.push(read_u16(&ins[offset..]) as usize),
            1 => operands.push(read_u8(&ins[offset..]) as usize),
            _ => {}
        }
        offset += *width;
    }
    (operands, offset)
}

/// Human-readable listing of an instruction stream, one instruction per
/// line, prefixed with its byte offset.
pub fn disassemble(ins: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0;
    while pos < ins.len() {
        let op = match Opcode::from_byte(ins[pos]) {
            Some(op) => op,
            None => {
                out.push_str(&format!("{pos:04} ERROR: unknown opcode {}\n", ins[pos]));
                pos += 1;
                continue;
            }
        };
        let def = definition(op);
        let (operands, read) = read_operands(&def, &ins[pos + 1..]);
        out.push_str(&format!("{pos:04} {}", def.name));
        for operand in &operands {
            out.push_str(&format!(" {operand}"));
        }
        out.push('\n');
        pos += 1 + read;
    }
    out
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    Compile { message: String },
    Runtime { message: String },
    Serialize { message: String },
    Load { message: String },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Compile { message } => write!(f, "compile error: {message}"),
            VmError::Runtime { message } => write!(f, "runtime error: {message}"),
            VmError::Serialize { message } => write!(f, "serialize error: {message}"),
            VmError::Load { message } => write!(f, "load error: {message}"),
        }
    }
}

impl std::error::Error for VmError {}

fn compile_error(message: impl Into<String>) -> VmError {
    VmError::Compile {
        message: message.into(),
    }
}

fn runtime_error(message: impl Into<String>) -> VmError {
    VmError::Runtime {
        message: message.into(),
    }
}

fn serialize_error(message: impl Into<String>) -> VmError {
    VmError::Serialize {
        message: message.into(),
    }
}

fn load_error(message: impl Into<String>) -> VmError {
    VmError::Load {
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    Builtin,
    Free,
    Function,
}

/// Sentinel index of the `Function`-scope self-reference. It is not a slot;
/// resolution of this symbol compiles to `OpCurrentClosure`.
pub const FUNCTION_SELF_INDEX: usize = usize::MAX;

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    store: HashMap<String, Symbol>,
    outer: Option<Box<SymbolTable>>,
    pub free_symbols: Vec<Symbol>,
    num_definitions: usize,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_enclosed(outer: SymbolTable) -> Self {
        Self {
            outer: Some(Box::new(outer)),
            ..Self::default()
        }
    }

    pub fn num_definitions(&self) -> usize {
        self.num_definitions
    }

    pub fn take_outer(&mut self) -> Option<SymbolTable> {
        self.outer.take().map(|outer| *outer)
    }

    /// Binds `name` in this scope. Redefining a name already bound in this
    /// scope reuses its slot instead of allocating a new one.
    pub fn define(&mut self, name: &str) -> Symbol {
        let scope = if self.outer.is_none() {
            SymbolScope::Global
        } else {
            SymbolScope::Local
        };
        if let Some(existing) = self.store.get(name) {
            if existing.scope == scope {
                return existing.clone();
            }
        }
        let symbol = Symbol {
            name: name.to_string(),
            scope,
            index: self.num_definitions,
        };
        self.store.insert(name.to_string(), symbol.clone());
        self.num_definitions += 1;
        symbol
    }

    /// Does not consume a definition slot; the index is the caller's
    /// position in the builtin table.
    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Binds the enclosing function's own name inside its body so recursive
    /// references resolve to the current closure.
    pub fn define_function_name(&mut self, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Function,
            index: FUNCTION_SELF_INDEX,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        self.free_symbols.push(original.clone());
        let symbol = Symbol {
            name: original.name.clone(),
            scope: SymbolScope::Free,
            index: self.free_symbols.len() - 1,
        };
        self.store.insert(original.name, symbol.clone());
        symbol
    }

    /// Resolution walks outward. A hit that is Local or Free in an enclosing
    /// function is promoted into this table's free list, so every
    /// intermediate scope captures the variable and can relay it inward.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            return Some(symbol.clone());
        }
        let outer = self.outer.as_mut()?;
        let symbol = outer.resolve(name)?;
        if symbol.scope == SymbolScope::Global || symbol.scope == SymbolScope::Builtin {
            return Some(symbol);
        }
        Some(self.define_free(symbol))
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Value>,
}

#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: Opcode,
    position: usize,
}

#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Instructions,
    last_instruction: Option<EmittedInstruction>,
    previous_instruction: Option<EmittedInstruction>,
}

pub struct Compiler {
    constants: Vec<Value>,
    symbols: SymbolTable,
    scopes: Vec<CompilationScope>,
}

impl Compiler {
    pub fn new() -> Self {
        let mut symbols = SymbolTable::new();
        for (index, builtin) in BUILTINS.iter().enumerate() {
            symbols.define_builtin(index, builtin.name);
        }
        Self {
            constants: Vec::new(),
            symbols,
            scopes: vec![CompilationScope::default()],
        }
    }

    /// Clears the main scope's instruction buffer while keeping the symbol
    /// table and constant pool, so a REPL can feed successive programs
    /// through one compiler. Unwinds scopes left behind by a failed
    /// compile.
    pub fn reset(&mut self) {
        while self.scopes.len() > 1 {
            self.leave_scope();
        }
        let scope = self.scope_mut();
        scope.instructions.clear();
        scope.last_instruction = None;
        scope.previous_instruction = None;
    }

    pub fn compile(&mut self, program: &Program) -> Result<(), VmError> {
        for stmt in &program.statements {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    pub fn bytecode(&self) -> Bytecode {
        let scope = self.scopes.first().expect("compiler always has a scope");
        Bytecode {
            instructions: scope.instructions.clone(),
            constants: self.constants.clone(),
        }
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), VmError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Opcode::Pop, &[]);
            }
            Stmt::Let { name, value } => {
                // Defined before the value compiles so a function body can
                // resolve its own binding as a self-reference.
                let symbol = self.symbols.define(name);
                self.compile_expr(value)?;
                match symbol.scope {
                    SymbolScope::Global => self.emit(Opcode::SetGlobal, &[symbol.index]),
                    _ => self.emit(Opcode::SetLocal, &[symbol.index]),
                };
            }
            Stmt::Return(value) => {
                self.compile_expr(value)?;
                self.emit(Opcode::ReturnValue, &[]);
            }
        }
        Ok(())
    }

    fn compile_block(&mut self, block: &Block) -> Result<(), VmError> {
        for stmt in &block.statements {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), VmError> {
        match expr {
            Expr::Integer(value) => {
                let index = self.add_constant(Value::Integer(*value));
                self.emit(Opcode::Constant, &[index]);
            }
            Expr::String(value) => {
                let index = self.add_constant(Value::String(Rc::new(value.clone())));
                self.emit(Opcode::Constant, &[index]);
            }
            Expr::Boolean(value) => {
                if *value {
                    self.emit(Opcode::True, &[]);
                } else {
                    self.emit(Opcode::False, &[]);
                }
            }
            Expr::Null => {
                self.emit(Opcode::Null, &[]);
            }
            Expr::Ident(name) => {
                let symbol = self.symbols.resolve(name).ok_or_else(|| {
                    compile_error(format!("can't get global '{name}', it's not defined."))
                })?;
                self.load_symbol(&symbol);
            }
            Expr::Prefix { op, right } => {
                self.compile_expr(right)?;
                match op {
                    monkey_syntax::PrefixOp::Bang => self.emit(Opcode::Bang, &[]),
                    monkey_syntax::PrefixOp::Minus => self.emit(Opcode::Minus, &[]),
                };
            }
            Expr::Infix { op, left, right } => {
                use monkey_syntax::InfixOp;
                if *op == InfixOp::Lt {
                    self.compile_expr(right)?;
                    self.compile_expr(left)?;
                    self.emit(Opcode::GreaterThan, &[]);
                    return Ok(());
                }
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                match op {
                    InfixOp::Add => self.emit(Opcode::Add, &[]),
                    InfixOp::Sub => self.emit(Opcode::Sub, &[]),
                    InfixOp::Mul => self.emit(Opcode::Mul, &[]),
                    InfixOp::Div => self.emit(Opcode::Div, &[]),
                    InfixOp::Gt => self.emit(Opcode::GreaterThan, &[]),
                    InfixOp::Eq => self.emit(Opcode::Equal, &[]),
                    InfixOp::NotEq => self.emit(Opcode::NotEqual, &[]),
                    InfixOp::Lt => unreachable!("handled above"),
                };
            }
            Expr::If {
                condition,
                consequence,
                alternative,
            } => {
                self.compile_expr(condition)?;
                let jump_not_truthy_pos = self.emit(Opcode::JumpNotTruthy, &[9999]);

                self.compile_block(consequence)?;
                if self.last_instruction_is(Opcode::Pop) {
                    self.remove_last_instruction();
                }

                let jump_pos = self.emit(Opcode::Jump, &[9999]);
                let after_consequence = self.current_instructions_len();
                self.change_operand(jump_not_truthy_pos, after_consequence);

                match alternative {
                    None => {
                        self.emit(Opcode::Null, &[]);
                    }
                    Some(alternative) => {
                        self.compile_block(alternative)?;
                        if self.last_instruction_is(Opcode::Pop) {
                            self.remove_last_instruction();
                        }
                    }
                }

                let after_alternative = self.current_instructions_len();
                self.change_operand(jump_pos, after_alternative);
            }
            Expr::Index { left, index } => {
                self.compile_expr(left)?;
                self.compile_expr(index)?;
                self.emit(Opcode::Index, &[]);
            }
            Expr::Call {
                function,
                arguments,
            } => {
                self.compile_expr(function)?;
                for arg in arguments {
                    self.compile_expr(arg)?;
                }
                self.emit(Opcode::Call, &[arguments.len()]);
            }
            Expr::Array(elements) => {
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(Opcode::Array, &[elements.len()]);
            }
            Expr::Hash(pairs) => {
                for (key, value) in pairs {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit(Opcode::Hash, &[pairs.len() * 2]);
            }
            Expr::Function {
                name,
                parameters,
                body,
            } => {
                self.enter_scope();

                if let Some(name) = name {
                    self.symbols.define_function_name(name);
                }
                for parameter in parameters {
                    self.symbols.define(parameter);
                }

                self.compile_block(body)?;

                if self.last_instruction_is(Opcode::Pop) {
                    self.replace_last_pop_with_return();
                }
                if !self.last_instruction_is(Opcode::ReturnValue) {
                    self.emit(Opcode::Return, &[]);
                }

                let free_symbols = self.symbols.free_symbols.clone();
                let num_locals = self.symbols.num_definitions();
                let instructions = self.leave_scope();

                for symbol in &free_symbols {
                    self.load_symbol(symbol);
                }

                let func = CompiledFunction {
                    instructions,
                    num_locals: num_locals as u8,
                    num_parameters: parameters.len() as u8,
                };
                let index = self.add_constant(Value::CompiledFunction(Rc::new(func)));
                self.emit(Opcode::Closure, &[index, free_symbols.len()]);
            }
            Expr::Macro { .. } => {
                return Err(compile_error(
                    "macro literals are only allowed as top-level let bindings",
                ));
            }
        }
        Ok(())
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[symbol.index]),
            SymbolScope::Builtin => self.emit(Opcode::GetBuiltin, &[symbol.index]),
            SymbolScope::Free => self.emit(Opcode::GetFree, &[symbol.index]),
            SymbolScope::Function => self.emit(Opcode::CurrentClosure, &[]),
        };
    }

    fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn emit(&mut self, op: Opcode, operands: &[usize]) -> usize {
        let ins = make(op, operands);
        let pos = self.add_instruction(&ins);
        self.set_last_instruction(op, pos);
        pos
    }

    fn add_instruction(&mut self, ins: &[u8]) -> usize {
        let scope = self.scope_mut();
        let pos = scope.instructions.len();
        scope.instructions.extend_from_slice(ins);
        pos
    }

    fn set_last_instruction(&mut self, opcode: Opcode, position: usize) {
        let scope = self.scope_mut();
        scope.previous_instruction = scope.last_instruction;
        scope.last_instruction = Some(EmittedInstruction { opcode, position });
    }

    fn last_instruction_is(&self, op: Opcode) -> bool {
        let scope = self.scope();
        if scope.instructions.is_empty() {
            return false;
        }
        scope
            .last_instruction
            .is_some_and(|last| last.opcode == op)
    }

    fn remove_last_instruction(&mut self) {
        let scope = self.scope_mut();
        if let Some(last) = scope.last_instruction {
            scope.instructions.truncate(last.position);
            scope.last_instruction = scope.previous_instruction;
            scope.previous_instruction = None;
        }
    }

    fn replace_instruction(&mut self, pos: usize, new_instruction: &[u8]) {
        let scope = self.scope_mut();
        scope.instructions[pos..pos + new_instruction.len()].copy_from_slice(new_instruction);
    }

    fn change_operand(&mut self, op_pos: usize, operand: usize) {
        let byte = self.scope().instructions[op_pos];
        let op = Opcode::from_byte(byte).expect("changing operand of unknown opcode");
        let new_instruction = make(op, &[operand]);
        self.replace_instruction(op_pos, &new_instruction);
    }

    fn replace_last_pop_with_return(&mut self) {
        if let Some(last) = self.scope().last_instruction {
            let new_instruction = make(Opcode::ReturnValue, &[]);
            self.replace_instruction(last.position, &new_instruction);
            self.scope_mut().last_instruction = Some(EmittedInstruction {
                opcode: Opcode::ReturnValue,
                position: last.position,
            });
        }
    }

    fn current_instructions_len(&self) -> usize {
        self.scope().instructions.len()
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        let outer = std::mem::take(&mut self.symbols);
        self.symbols = SymbolTable::new_enclosed(outer);
    }

    fn leave_scope(&mut self) -> Instructions {
        let scope = self
            .scopes
            .pop()
            .expect("leave_scope without matching enter_scope");
        if let Some(outer) = self.symbols.take_outer() {
            self.symbols = outer;
        }
        scope.instructions
    }

    fn scope(&self) -> &CompilationScope {
        self.scopes.last().expect("compiler always has a scope")
    }

    fn scope_mut(&mut self) -> &mut CompilationScope {
        self.scopes.last_mut().expect("compiler always has a scope")
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Virtual machine
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Frame {
    closure: Rc<ClosureValue>,
    ip: usize,
    base_pointer: usize,
}

pub struct Vm {
    constants: Vec<Value>,
    stack: Vec<Value>,
    sp: usize,
    globals: Vec<Value>,
    frames: Vec<Frame>,
}

impl Vm {
    pub fn new(bytecode: Bytecode) -> Self {
        let mut vm = Self {
            constants: Vec::new(),
            stack: vec![Value::Null; STACK_SIZE],
            sp: 0,
            globals: vec![Value::Null; GLOBALS_SIZE],
            frames: Vec::with_capacity(MAX_FRAMES),
        };
        vm.recode(bytecode);
        vm
    }

    /// Swaps in a fresh program while keeping the globals array, so a REPL
    /// can run successive lines on one machine.
    pub fn recode(&mut self, bytecode: Bytecode) {
        self.constants = bytecode.constants;
        let main_fn = Rc::new(CompiledFunction {
            instructions: bytecode.instructions,
            num_locals: 0,
            num_parameters: 0,
        });
        let main_closure = Rc::new(ClosureValue {
            func: main_fn,
            free: Vec::new(),
        });
        self.frames.clear();
        self.frames.push(Frame {
            closure: main_closure,
            ip: 0,
            base_pointer: 0,
        });
        self.sp = 0;
    }

    pub fn stack_top(&self) -> Option<Value> {
        if self.sp == 0 {
            None
        } else {
            Some(self.stack[self.sp - 1].clone())
        }
    }

    /// The value most recently popped off the stack; what a completed
    /// expression statement evaluated to.
    pub fn last_popped(&self) -> Value {
        self.stack[self.sp].clone()
    }

    pub fn run(&mut self) -> Result<(), VmError> {
        loop {
            let (closure, ip) = {
                let frame = self.current_frame();
                (Rc::clone(&frame.closure), frame.ip)
            };
            let ins = &closure.func.instructions;
            if ip >= ins.len() {
                break;
            }

            let op = Opcode::from_byte(ins[ip])
                .ok_or_else(|| runtime_error(format!("unknown opcode: {}", ins[ip])))?;
            self.current_frame_mut().ip += 1;
            let operands = ip + 1;

            match op {
                Opcode::Constant => {
                    let index = read_u16(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let value = self
                        .constants
                        .get(index)
                        .cloned()
                        .ok_or_else(|| runtime_error(format!("invalid constant index: {index}")))?;
                    self.push(value)?;
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                    self.execute_binary_operation(op)?;
                }
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::True => self.push(Value::Boolean(true))?,
                Opcode::False => self.push(Value::Boolean(false))?,
                Opcode::Null => self.push(Value::Null)?,
                Opcode::Equal | Opcode::NotEqual | Opcode::GreaterThan => {
                    self.execute_comparison(op)?;
                }
                Opcode::Minus => self.execute_minus_operator()?,
                Opcode::Bang => self.execute_bang_operator()?,
                Opcode::Jump => {
                    let pos = read_u16(&ins[operands..]) as usize;
                    self.current_frame_mut().ip = pos;
                }
                Opcode::JumpNotTruthy => {
                    let pos = read_u16(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let condition = self.pop()?;
                    if !is_truthy(&condition) {
                        self.current_frame_mut().ip = pos;
                    }
                }
                Opcode::SetGlobal => {
                    let index = read_u16(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 2;
                    self.globals[index] = self.pop()?;
                }
                Opcode::GetGlobal => {
                    let index = read_u16(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let value = self.globals[index].clone();
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let index = read_u8(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 1;
                    let base_pointer = self.current_frame().base_pointer;
                    self.stack[base_pointer + index] = self.pop()?;
                }
                Opcode::GetLocal => {
                    let index = read_u8(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 1;
                    let base_pointer = self.current_frame().base_pointer;
                    let value = self.stack[base_pointer + index].clone();
                    self.push(value)?;
                }
                Opcode::GetBuiltin => {
                    let index = read_u8(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 1;
                    let builtin = BUILTINS
                        .get(index)
                        .copied()
                        .ok_or_else(|| runtime_error(format!("invalid builtin index: {index}")))?;
                    self.push(Value::Builtin(builtin))?;
                }
                Opcode::GetFree => {
                    let index = read_u8(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 1;
                    let value = closure
                        .free
                        .get(index)
                        .cloned()
                        .ok_or_else(|| runtime_error(format!("invalid free variable index: {index}")))?;
                    self.push(value)?;
                }
                Opcode::CurrentClosure => {
                    self.push(Value::Closure(Rc::clone(&closure)))?;
                }
                Opcode::Array => {
                    let count = read_u16(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let elements = self.stack[self.sp - count..self.sp].to_vec();
                    self.sp -= count;
                    self.push(Value::Array(Rc::new(elements)))?;
                }
                Opcode::Hash => {
                    let count = read_u16(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 2;
                    let hash = self.build_hash(self.sp - count, self.sp)?;
                    self.sp -= count;
                    self.push(hash)?;
                }
                Opcode::Index => {
                    let index = self.pop()?;
                    let left = self.pop()?;
                    self.execute_index_expression(left, index)?;
                }
                Opcode::Call => {
                    let num_args = read_u8(&ins[operands..]) as usize;
                    self.current_frame_mut().ip += 1;
                    self.execute_call(num_args)?;
                }
                Opcode::Closure => {
                    let const_index = read_u16(&ins[operands..]) as usize;
                    let num_free = read_u8(&ins[operands + 2..]) as usize;
                    self.current_frame_mut().ip += 3;
                    self.push_closure(const_index, num_free)?;
                }
                Opcode::ReturnValue => {
                    let return_value = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .ok_or_else(|| runtime_error("return outside of a call frame"))?;
                    self.sp = frame.base_pointer - 1;
                    self.push(return_value)?;
                }
                Opcode::Return => {
                    let frame = self
                        .frames
                        .pop()
                        .ok_or_else(|| runtime_error("return outside of a call frame"))?;
                    self.sp = frame.base_pointer - 1;
                    self.push(Value::Null)?;
                }
            }
        }
        Ok(())
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("frame stack is never empty")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack is never empty")
    }

    fn push(&mut self, value: Value) -> Result<(), VmError> {
        if self.sp >= STACK_SIZE {
            return Err(runtime_error("stack overflow"));
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        if self.sp == 0 {
            return Err(runtime_error("stack underflow"));
        }
        self.sp -= 1;
        Ok(self.stack[self.sp].clone())
    }

    fn execute_binary_operation(&mut self, op: Opcode) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;
        match (&left, &right) {
            (Value::Integer(left), Value::Integer(right)) => {
                self.execute_binary_integer_operation(op, *left, *right)
            }
            (Value::String(left), Value::String(right)) => {
                if op != Opcode::Add {
                    return Err(runtime_error(format!(
                        "unknown string operator: {}",
                        definition(op).name
                    )));
                }
                let mut result = left.as_ref().clone();
                result.push_str(right);
                self.push(Value::String(Rc::new(result)))
            }
            _ => Err(runtime_error(format!(
                "unsupported types for binary operation: {} {}",
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    fn execute_binary_integer_operation(
        &mut self,
        op: Opcode,
        left: i64,
        right: i64,
    ) -> Result<(), VmError> {
        let result = match op {
            Opcode::Add => left.wrapping_add(right),
            Opcode::Sub => left.wrapping_sub(right),
            Opcode::Mul => left.wrapping_mul(right),
            Opcode::Div => left.wrapping_div(right),
            _ => {
                return Err(runtime_error(format!(
                    "unknown integer operator: {}",
                    definition(op).name
                )))
            }
        };
        self.push(Value::Integer(result))
    }

    fn execute_comparison(&mut self, op: Opcode) -> Result<(), VmError> {
        let right = self.pop()?;
        let left = self.pop()?;

        if let (Value::Integer(left), Value::Integer(right)) = (&left, &right) {
            let result = match op {
                Opcode::Equal => left == right,
                Opcode::NotEqual => left != right,
                Opcode::GreaterThan => left > right,
                _ => {
                    return Err(runtime_error(format!(
                        "unknown integer comparison: {}",
                        definition(op).name
                    )))
                }
            };
            return self.push(Value::Boolean(result));
        }

        match op {
            Opcode::Equal => {
                let result = values_identical(&left, &right);
                self.push(Value::Boolean(result))
            }
            Opcode::NotEqual => {
                let result = !values_identical(&left, &right);
                self.push(Value::Boolean(result))
            }
            _ => Err(runtime_error(format!(
                "unknown operator: {} ({} {})",
                definition(op).name,
                left.type_name(),
                right.type_name()
            ))),
        }
    }

    fn execute_minus_operator(&mut self) -> Result<(), VmError> {
        let operand = self.pop()?;
        match operand {
            Value::Integer(value) => self.push(Value::Integer(value.wrapping_neg())),
            other => Err(runtime_error(format!(
                "unsupported type for negation: {}",
                other.type_name()
            ))),
        }
    }

    fn execute_bang_operator(&mut self) -> Result<(), VmError> {
        let operand = self.pop()?;
        self.push(Value::Boolean(!is_truthy(&operand)))
    }

    fn build_hash(&self, start: usize, end: usize) -> Result<Value, VmError> {
        let mut pairs = IndexMap::new();
        let mut index = start;
        while index < end {
            let key = self.stack[index].clone();
            let value = self.stack[index + 1].clone();
            let hash_key = key.hash_key().ok_or_else(|| {
                runtime_error(format!("unusable as hash key: {}", key.type_name()))
            })?;
            pairs.insert(hash_key, HashPair { key, value });
            index += 2;
        }
        Ok(Value::Hash(Rc::new(pairs)))
    }

    fn execute_index_expression(&mut self, left: Value, index: Value) -> Result<(), VmError> {
        match (&left, &index) {
            (Value::Array(elements), Value::Integer(i)) => {
                let value = if *i < 0 {
                    Value::Null
                } else {
                    elements.get(*i as usize).cloned().unwrap_or(Value::Null)
                };
                self.push(value)
            }
            (Value::Hash(pairs), _) => {
                let hash_key = index.hash_key().ok_or_else(|| {
                    runtime_error(format!("unusable as hash key: {}", index.type_name()))
                })?;
                let value = pairs
                    .get(&hash_key)
                    .map(|pair| pair.value.clone())
                    .unwrap_or(Value::Null);
                self.push(value)
            }
            _ => Err(runtime_error(format!(
                "index operator not supported: {}",
                left.type_name()
            ))),
        }
    }

    fn execute_call(&mut self, num_args: usize) -> Result<(), VmError> {
        let callee = self.stack[self.sp - 1 - num_args].clone();
        match callee {
            Value::Closure(closure) => self.call_closure(closure, num_args),
            Value::Builtin(builtin) => self.call_builtin(builtin, num_args),
            _ => Err(runtime_error("calling non-function and non-built-in")),
        }
    }

    fn call_closure(
        &mut self,
        closure: Rc<ClosureValue>,
        num_args: usize,
    ) -> Result<(), VmError> {
        if num_args != closure.func.num_parameters as usize {
            return Err(runtime_error(format!(
                "wrong number of arguments: want={}, got={}",
                closure.func.num_parameters, num_args
            )));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(runtime_error(format!(
                "stack overflow: maximum call depth {MAX_FRAMES} exceeded"
            )));
        }

        let base_pointer = self.sp - num_args;
        let num_locals = closure.func.num_locals as usize;
        if base_pointer + num_locals > STACK_SIZE {
            return Err(runtime_error("stack overflow"));
        }
        self.frames.push(Frame {
            closure,
            ip: 0,
            base_pointer,
        });
        self.sp = base_pointer + num_locals;
        Ok(())
    }

    fn call_builtin(&mut self, builtin: BuiltinDef, num_args: usize) -> Result<(), VmError> {
        let args = self.stack[self.sp - num_args..self.sp].to_vec();
        let result = (builtin.func)(&args);
        self.sp = self.sp - num_args - 1;
        self.push(result)
    }

    fn push_closure(&mut self, const_index: usize, num_free: usize) -> Result<(), VmError> {
        let constant = self
            .constants
            .get(const_index)
            .cloned()
            .ok_or_else(|| runtime_error(format!("invalid constant index: {const_index}")))?;
        let func = match constant {
            Value::CompiledFunction(func) => func,
            other => {
                return Err(runtime_error(format!(
                    "not a function: {}",
                    other.type_name()
                )))
            }
        };

        let free = self.stack[self.sp - num_free..self.sp].to_vec();
        self.sp -= num_free;
        self.push(Value::Closure(Rc::new(ClosureValue { func, free })))
    }
}

fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Boolean(false) | Value::Null)
}

/// The `==` the dispatch loop applies to non-integer operands: reference
/// identity, except booleans and null which are singletons by construction.
fn values_identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Integer(l), Value::Integer(r)) => l == r,
        (Value::Boolean(l), Value::Boolean(r)) => l == r,
        (Value::Null, Value::Null) => true,
        (Value::String(l), Value::String(r)) => Rc::ptr_eq(l, r),
        (Value::Array(l), Value::Array(r)) => Rc::ptr_eq(l, r),
        (Value::Hash(l), Value::Hash(r)) => Rc::ptr_eq(l, r),
        (Value::CompiledFunction(l), Value::CompiledFunction(r)) => Rc::ptr_eq(l, r),
        (Value::Closure(l), Value::Closure(r)) => Rc::ptr_eq(l, r),
        (Value::Builtin(l), Value::Builtin(r)) => l.name == r.name,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Serializer / loader
// ---------------------------------------------------------------------------

pub const SERIAL_VERSION: u8 = 1;
pub const HEADER: [u8; 9] = [42, 69, b'M', b'o', b'n', b'k', b'e', b'y', SERIAL_VERSION];

const HEADER_LEN: usize = HEADER.len();
const CHECKSUM_LEN: usize = 32;

const TAG_ARRAY: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_BOOL_TRUE: u8 = 3;
const TAG_BOOL_FALSE: u8 = 4;
const TAG_NULL: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_COMPILED_FUNCTION: u8 = 7;

pub struct Serializer {
    pub output: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self {
            output: Vec::with_capacity(10240),
        }
    }

    pub fn write(&mut self, code: &Bytecode) -> Result<(), VmError> {
        self.output.extend_from_slice(&HEADER);
        // Reserved for the checksum, filled in once the body is complete.
        self.output.extend_from_slice(&[0; CHECKSUM_LEN]);

        let num_constants = code.constants.len();
        if num_constants > 255 {
            return Err(serialize_error(format!(
                "too many constants ({num_constants}), can only serialize 255 tops"
            )));
        }

        self.output.push(num_constants as u8);
        for constant in &code.constants {
            self.write_value(constant)?;
        }

        self.output
            .extend_from_slice(&(code.instructions.len() as u32).to_be_bytes());
        self.output.extend_from_slice(&code.instructions);

        let checksum = Sha256::digest(&self.output[HEADER_LEN + CHECKSUM_LEN..]);
        self.output[HEADER_LEN..HEADER_LEN + CHECKSUM_LEN].copy_from_slice(&checksum);

        Ok(())
    }

    fn write_value(&mut self, value: &Value) -> Result<(), VmError> {
        match value {
            Value::Array(elements) => {
                self.output.push(TAG_ARRAY);
                self.output
                    .extend_from_slice(&(elements.len() as u32).to_be_bytes());
                for element in elements.iter() {
                    self.write_value(element)?;
                }
                Ok(())
            }
            Value::Integer(value) => {
                self.output.push(TAG_INTEGER);
                self.output.extend_from_slice(&value.to_be_bytes());
                Ok(())
            }
            Value::String(value) => {
                self.output.push(TAG_STRING);
                self.output.extend_from_slice(value.as_bytes());
                self.output.push(0);
                Ok(())
            }
            Value::Boolean(value) => {
                self.output
                    .push(if *value { TAG_BOOL_TRUE } else { TAG_BOOL_FALSE });
                Ok(())
            }
            Value::Null => {
                self.output.push(TAG_NULL);
                Ok(())
            }
            Value::CompiledFunction(func) => {
                self.output.push(TAG_COMPILED_FUNCTION);
                self.output.push(func.num_locals);
                self.output.push(func.num_parameters);
                self.output
                    .extend_from_slice(&(func.instructions.len() as u32).to_be_bytes());
                self.output.extend_from_slice(&func.instructions);
                Ok(())
            }
            other => Err(serialize_error(format!(
                "object of type {} can't be serialized",
                other.type_name()
            ))),
        }
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Loader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Loader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub fn load(mut self) -> Result<Bytecode, VmError> {
        self.check_header().map_err(load_error)?;

        let num_constants = self
            .read_byte()
            .map_err(|_| load_error("can't read constant count, no more data in buffer"))?;

        let mut constants = Vec::with_capacity(num_constants as usize);
        for i in 0..num_constants {
            let constant = self
                .read_constant()
                .map_err(|err| load_error(format!("error reading constant #{i}: {err}")))?;
            constants.push(constant);
        }

        let instructions_len = self.read_u32().map_err(load_error)? as usize;
        if self.pos + instructions_len > self.input.len() {
            return Err(load_error(format!(
                "can't read instructions, not {instructions_len} bytes left in buffer"
            )));
        }
        let instructions = self.input[self.pos..self.pos + instructions_len].to_vec();

        Ok(Bytecode {
            instructions,
            constants,
        })
    }

    fn check_header(&mut self) -> Result<(), String> {
        if self.input.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err("not enough data in the buffer for the header".to_string());
        }
        for (i, byte) in HEADER.iter().enumerate() {
            if self.input[i] != *byte {
                return Err(format!("error in file header at byte #{}", i + 1));
            }
        }
        self.pos = HEADER_LEN;

        let expected = &self.input[self.pos..self.pos + CHECKSUM_LEN];
        self.pos += CHECKSUM_LEN;

        let actual = Sha256::digest(&self.input[self.pos..]);
        for (i, byte) in actual.iter().enumerate() {
            if expected[i] != *byte {
                return Err(format!("byte #{} of checksum doesn't match", i + 1));
            }
        }
        Ok(())
    }

    fn read_constant(&mut self) -> Result<Value, String> {
        let tag = self
            .read_byte()
            .map_err(|_| "can't read type byte, no more data in buffer".to_string())?;
        match tag {
            TAG_STRING => self.read_string(),
            TAG_INTEGER => self.read_integer(),
            TAG_COMPILED_FUNCTION => self.read_function(),
            TAG_ARRAY => self.read_array(),
            TAG_BOOL_TRUE => Ok(Value::Boolean(true)),
            TAG_BOOL_FALSE => Ok(Value::Boolean(false)),
            TAG_NULL => Ok(Value::Null),
            other => Err(format!("can't load constant type value {other}")),
        }
    }

    fn read_string(&mut self) -> Result<Value, String> {
        let start = self.pos;
        while self.pos < self.input.len() && self.input[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.input.len() {
            return Err("no string-terminating 0-byte found".to_string());
        }
        let value = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        self.pos += 1;
        Ok(Value::String(Rc::new(value)))
    }

    fn read_integer(&mut self) -> Result<Value, String> {
        if self.pos + 8 > self.input.len() {
            return Err("not enough data in buffer to read INTEGER".to_string());
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.input[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(Value::Integer(i64::from_be_bytes(bytes)))
    }

    fn read_function(&mut self) -> Result<Value, String> {
        if self.pos + 6 > self.input.len() {
            return Err("can't read function header, not enough data in buffer".to_string());
        }
        let num_locals = self.input[self.pos];
        let num_parameters = self.input[self.pos + 1];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.input[self.pos + 2..self.pos + 6]);
        let instructions_len = u32::from_be_bytes(len_bytes) as usize;
        self.pos += 6;

        if self.pos + instructions_len > self.input.len() {
            return Err(format!(
                "can't read function instructions, not {instructions_len} bytes left in buffer"
            ));
        }
        let instructions = self.input[self.pos..self.pos + instructions_len].to_vec();
        self.pos += instructions_len;

        Ok(Value::CompiledFunction(Rc::new(CompiledFunction {
            instructions,
            num_locals,
            num_parameters,
        })))
    }

    fn read_array(&mut self) -> Result<Value, String> {
        let count = self
            .read_u32()
            .map_err(|_| "can't read array size, no more data in buffer".to_string())?;
        let mut elements = Vec::with_capacity(count as usize);
        for _ in 0..count {
            elements.push(self.read_constant()?);
        }
        Ok(Value::Array(Rc::new(elements)))
    }

    fn read_byte(&mut self) -> Result<u8, String> {
        if self.pos >= self.input.len() {
            return Err("no more data in buffer".to_string());
        }
        let byte = self.input[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn read_u32(&mut self) -> Result<u32, String> {
        if self.pos + 4 > self.input.len() {
            return Err("not enough data in buffer to read u32".to_string());
        }
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.input[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }
}
