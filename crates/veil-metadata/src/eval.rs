//! Reference evaluator
//!
//! A small interpreter for method bodies, playing the part of a debugger's
//! function evaluation: it can construct objects, call property getters and
//! observe their side effects. It understands the instruction subset of
//! [`Opcode`] and a handful of core library intrinsics.
//!
//! Reference-type instances are shared (`Rc<RefCell<_>>`), value-type
//! instances are copied. Every argument and local slot is a shared cell so
//! that managed pointers (`ldloca`, `ldarga`, `ldflda`) stay valid across
//! calls.

use crate::body::{Instruction, Operand};
use crate::module::{FieldRef, MemberReference, MethodId, MethodRef, Module};
use crate::opcode::Opcode;
use crate::types::{MethodSignature, TypeSignature};
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;
use thiserror::Error;

/// Default call depth before reporting a stack overflow
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Default instruction budget for one top-level invocation
pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;

/// Evaluation errors
#[derive(Debug, Error)]
pub enum EvalError {
    /// `System.Environment::FailFast` was called
    #[error("Process terminated: {0}")]
    FailFast(String),

    /// Call depth limit reached
    #[error("Stack overflow at call depth {0}")]
    StackOverflow(usize),

    /// Instruction budget exhausted
    #[error("Instruction budget exhausted")]
    StepLimitExceeded,

    /// Not enough values on the evaluation stack
    #[error("{0}: evaluation stack underflow")]
    StackUnderflow(String),

    /// Method could not be resolved to a body or intrinsic
    #[error("Unresolved method {0}")]
    UnresolvedMethod(String),

    /// Method has no body
    #[error("Method {0} has no body")]
    MissingBody(String),

    /// Wrong number of arguments
    #[error("{method}: expected {expected} arguments, got {actual}")]
    ArgumentCount {
        method: String,
        expected: usize,
        actual: usize,
    },

    /// Operand value has the wrong shape for the operation
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Null dereference
    #[error("Null reference accessing {0}")]
    NullReference(String),

    /// Pointer does not lead to a storage location
    #[error("Invalid managed pointer")]
    InvalidPointer,

    /// Branch to a missing label
    #[error("{0}: invalid branch target")]
    InvalidBranch(String),

    /// Array index out of range
    #[error("Index {0} out of range")]
    IndexOutOfRange(i64),

    /// A managed exception was thrown
    #[error("Unhandled exception: {0}")]
    Exception(String),

    /// Execution ran past the last instruction
    #[error("{0}: execution falls off end of method")]
    FallOffEnd(String),
}

/// Shared reference-type instance
pub type ObjectRef = Rc<RefCell<Instance>>;

/// Storage slot for an argument or local
pub type Slot = Rc<RefCell<Value>>;

/// Reference-type instance
#[derive(Debug, Clone)]
pub struct Instance {
    pub ty: TypeSignature,
    pub fields: FxHashMap<String, Value>,
}

/// Value-type instance
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub ty: TypeSignature,
    pub fields: FxHashMap<String, Value>,
}

/// Where a managed pointer starts
#[derive(Debug, Clone)]
pub enum PointerRoot {
    /// An argument or local slot
    Slot(Slot),
    /// A field of a heap object; the first path element names the field
    Object(ObjectRef),
}

/// Managed pointer: a root plus a path of value-type field names
#[derive(Debug, Clone)]
pub struct Pointer {
    pub root: PointerRoot,
    pub path: Vec<String>,
}

impl Pointer {
    fn to_slot(slot: Slot) -> Self {
        Self {
            root: PointerRoot::Slot(slot),
            path: Vec::new(),
        }
    }

    fn to_field(object: ObjectRef, name: &str) -> Self {
        Self {
            root: PointerRoot::Object(object),
            path: vec![name.to_string()],
        }
    }

    fn field(&self, name: &str) -> Self {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Self {
            root: self.root.clone(),
            path,
        }
    }

    /// Read the value the pointer refers to
    pub fn load(&self) -> Result<Value, EvalError> {
        match &self.root {
            PointerRoot::Slot(slot) => read_path(&slot.borrow(), &self.path),
            PointerRoot::Object(object) => {
                let (first, rest) = self.path.split_first().ok_or(EvalError::InvalidPointer)?;
                let instance = object.borrow();
                match instance.fields.get(first) {
                    Some(value) => read_path(value, rest),
                    None if rest.is_empty() => Ok(Value::Null),
                    None => Err(EvalError::InvalidPointer),
                }
            }
        }
    }

    /// Overwrite the value the pointer refers to
    pub fn store(&self, value: Value) -> Result<(), EvalError> {
        match &self.root {
            PointerRoot::Slot(slot) => write_path(&mut slot.borrow_mut(), &self.path, value),
            PointerRoot::Object(object) => {
                let (first, rest) = self.path.split_first().ok_or(EvalError::InvalidPointer)?;
                let mut instance = object.borrow_mut();
                let target = instance.fields.entry(first.clone()).or_insert(Value::Null);
                write_path(target, rest, value)
            }
        }
    }
}

fn read_path(value: &Value, path: &[String]) -> Result<Value, EvalError> {
    match path.split_first() {
        None => Ok(value.clone()),
        Some((name, rest)) => match value {
            Value::Struct(s) => match s.fields.get(name) {
                Some(inner) => read_path(inner, rest),
                None if rest.is_empty() => Ok(Value::Null),
                None => Err(EvalError::InvalidPointer),
            },
            _ => Err(EvalError::InvalidPointer),
        },
    }
}

fn write_path(target: &mut Value, path: &[String], value: Value) -> Result<(), EvalError> {
    match path.split_first() {
        None => {
            *target = value;
            Ok(())
        }
        Some((name, rest)) => match target {
            Value::Struct(s) => {
                let inner = s.fields.entry(name.clone()).or_insert(Value::Null);
                write_path(inner, rest, value)
            }
            _ => Err(EvalError::InvalidPointer),
        },
    }
}

/// Runtime value
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    I4(i32),
    I8(i64),
    R4(f32),
    R8(f64),
    String(String),
    Object(ObjectRef),
    Struct(StructValue),
    Array(Rc<RefCell<Vec<Value>>>),
    Ptr(Pointer),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::I4(a), Value::I4(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::R4(a), Value::R4(b)) => a == b,
            (Value::R8(a), Value::R8(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Value {
    /// Read an instance field of an object or struct value
    pub fn field(&self, name: &str) -> Option<Value> {
        match self {
            Value::Object(object) => object.borrow().fields.get(name).cloned(),
            Value::Struct(s) => s.fields.get(name).cloned(),
            _ => None,
        }
    }

    pub fn as_i4(&self) -> Option<i32> {
        match self {
            Value::I4(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I4(v) => *v != 0,
            Value::I8(v) => *v != 0,
            _ => true,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::I4(_) => "int32",
            Value::I8(_) => "int64",
            Value::R4(_) => "float32",
            Value::R8(_) => "float64",
            Value::String(_) => "string",
            Value::Object(_) => "object",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
            Value::Ptr(_) => "pointer",
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::I4(x), Value::I4(y)) => Some(x.cmp(y)),
        (Value::I8(x), Value::I8(y)) => Some(x.cmp(y)),
        (Value::I4(x), Value::I8(y)) => Some(i64::from(*x).cmp(y)),
        (Value::I8(x), Value::I4(y)) => Some(x.cmp(&i64::from(*y))),
        (Value::R4(x), Value::R4(y)) => x.partial_cmp(y),
        (Value::R8(x), Value::R8(y)) => x.partial_cmp(y),
        _ => None,
    }
}

fn arithmetic(opcode: Opcode, a: Value, b: Value) -> Result<Value, EvalError> {
    let result = match (a, b) {
        (Value::I4(x), Value::I4(y)) => Value::I4(match opcode {
            Opcode::Add => x.wrapping_add(y),
            Opcode::Sub => x.wrapping_sub(y),
            _ => x.wrapping_mul(y),
        }),
        (Value::I8(x), Value::I8(y)) => Value::I8(match opcode {
            Opcode::Add => x.wrapping_add(y),
            Opcode::Sub => x.wrapping_sub(y),
            _ => x.wrapping_mul(y),
        }),
        (Value::R4(x), Value::R4(y)) => Value::R4(match opcode {
            Opcode::Add => x + y,
            Opcode::Sub => x - y,
            _ => x * y,
        }),
        (Value::R8(x), Value::R8(y)) => Value::R8(match opcode {
            Opcode::Add => x + y,
            Opcode::Sub => x - y,
            _ => x * y,
        }),
        (a, b) => {
            return Err(EvalError::TypeMismatch(format!(
                "{} on {} and {}",
                opcode,
                a.describe(),
                b.describe()
            )))
        }
    };
    Ok(result)
}

struct Frame {
    name: String,
    args: Vec<Slot>,
    locals: Vec<Slot>,
    stack: Vec<Value>,
}

impl Frame {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, EvalError> {
        self.stack
            .pop()
            .ok_or_else(|| EvalError::StackUnderflow(self.name.clone()))
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, EvalError> {
        if self.stack.len() < count {
            return Err(EvalError::StackUnderflow(self.name.clone()));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn local(&self, instr: &Instruction) -> Result<&Slot, EvalError> {
        instr
            .local_index()
            .and_then(|i| self.locals.get(i as usize))
            .ok_or_else(|| EvalError::TypeMismatch(format!("{}: bad local operand", self.name)))
    }

    fn arg(&self, instr: &Instruction) -> Result<&Slot, EvalError> {
        instr
            .arg_index()
            .and_then(|i| self.args.get(i as usize))
            .ok_or_else(|| EvalError::TypeMismatch(format!("{}: bad argument operand", self.name)))
    }
}

fn slot(value: Value) -> Slot {
    Rc::new(RefCell::new(value))
}

/// Interpreter over the bodies of one module
pub struct Evaluator<'m> {
    module: &'m Module,
    statics: FxHashMap<FieldRef, Value>,
    depth: usize,
    max_depth: usize,
    steps: u64,
    max_steps: u64,
}

impl<'m> Evaluator<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            statics: FxHashMap::default(),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            steps: 0,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Set the call depth at which a stack overflow is reported
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Set the instruction budget
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Invoke a method defined in the module. Void methods return `None`.
    pub fn invoke(&mut self, method: MethodId, args: Vec<Value>) -> Result<Option<Value>, EvalError> {
        if self.depth >= self.max_depth {
            return Err(EvalError::StackOverflow(self.depth));
        }
        if self.depth == 0 {
            self.steps = 0;
        }
        self.depth += 1;
        let result = self.execute(method, args);
        self.depth -= 1;
        result
    }

    /// Invoke a method by reference, resolving members and intrinsics
    pub fn invoke_ref(&mut self, method: &MethodRef, args: Vec<Value>) -> Result<Option<Value>, EvalError> {
        match method {
            MethodRef::Def(id) => self.invoke(*id, args),
            MethodRef::Member(member) => match self.resolve_member(member) {
                Some(id) => self.invoke(id, args),
                None => self.intrinsic(member, args),
            },
        }
    }

    /// Allocate an instance and run a constructor on it (`newobj`)
    pub fn construct(&mut self, ctor: &MethodRef, params: Vec<Value>) -> Result<Value, EvalError> {
        let declaring = match ctor {
            MethodRef::Def(id) => self.module.signature_of(self.module.method(*id).declaring_type),
            MethodRef::Member(member) => member.parent.clone(),
        };

        if declaring.is_value_type() {
            let target = slot(self.default_value(&declaring));
            let mut args = vec![Value::Ptr(Pointer::to_slot(target.clone()))];
            args.extend(params);
            self.invoke_ref(ctor, args)?;
            let value = target.borrow().clone();
            Ok(value)
        } else {
            let object = Rc::new(RefCell::new(Instance {
                fields: self.default_fields(&declaring),
                ty: declaring,
            }));
            let mut args = vec![Value::Object(object.clone())];
            args.extend(params);
            self.invoke_ref(ctor, args)?;
            Ok(Value::Object(object))
        }
    }

    /// Zero value of a type
    pub fn default_value(&self, ty: &TypeSignature) -> Value {
        let stripped = ty.strip_modifiers();
        match stripped {
            TypeSignature::Boolean
            | TypeSignature::Char
            | TypeSignature::I1
            | TypeSignature::U1
            | TypeSignature::I2
            | TypeSignature::U2
            | TypeSignature::I4
            | TypeSignature::U4 => Value::I4(0),
            TypeSignature::I8 | TypeSignature::U8 | TypeSignature::I | TypeSignature::U => Value::I8(0),
            TypeSignature::R4 => Value::R4(0.0),
            TypeSignature::R8 => Value::R8(0.0),
            sig if sig.is_value_type() => Value::Struct(StructValue {
                ty: sig.clone(),
                fields: self.default_fields(sig),
            }),
            _ => Value::Null,
        }
    }

    fn default_fields(&self, ty: &TypeSignature) -> FxHashMap<String, Value> {
        let mut fields = FxHashMap::default();
        if let Some(id) = self.module.resolve_signature(ty) {
            for &field in &self.module.type_def(id).fields {
                let def = self.module.field(field);
                if !def.is_static() && def.field_type.strip_modifiers() != ty.strip_modifiers() {
                    fields.insert(def.name.clone(), self.default_value(&def.field_type));
                }
            }
        }
        fields
    }

    fn resolve_member(&self, member: &MemberReference) -> Option<MethodId> {
        let owner = self.module.resolve_signature(&member.parent)?;
        self.module.find_method(owner, &member.name, &member.signature)
    }

    fn intrinsic(&mut self, member: &MemberReference, args: Vec<Value>) -> Result<Option<Value>, EvalError> {
        let parent = &member.parent;
        if parent.is_corlib_type("System", "Environment") && member.name == "FailFast" {
            let message = args
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            return Err(EvalError::FailFast(message));
        }
        if member.name == ".ctor"
            && (parent.is_corlib_type("System", "Object") || parent.is_corlib_type("System", "ValueType"))
        {
            return Ok(None);
        }
        Err(EvalError::UnresolvedMethod(format!("{}::{}", parent, member.name)))
    }

    fn signature_of(&self, method: &MethodRef) -> MethodSignature {
        match method {
            MethodRef::Def(id) => self.module.method(*id).signature.clone(),
            MethodRef::Member(member) => member.signature.clone(),
        }
    }

    fn field_name(&self, field: &FieldRef) -> String {
        match field {
            FieldRef::Def(id) => self.module.field(*id).name.clone(),
            FieldRef::Member { name, .. } => name.clone(),
        }
    }

    fn field_type(&self, field: &FieldRef) -> TypeSignature {
        match field {
            FieldRef::Def(id) => self.module.field(*id).field_type.clone(),
            FieldRef::Member { field_type, .. } => field_type.clone(),
        }
    }

    fn load_field(&self, target: Value, name: &str) -> Result<Value, EvalError> {
        match target {
            Value::Object(_) | Value::Struct(_) => Ok(target.field(name).unwrap_or(Value::Null)),
            Value::Ptr(pointer) => match pointer.load()? {
                Value::Ptr(_) => Err(EvalError::InvalidPointer),
                inner => self.load_field(inner, name),
            },
            Value::Null => Err(EvalError::NullReference(name.to_string())),
            other => Err(EvalError::TypeMismatch(format!(
                "ldfld {} on {}",
                name,
                other.describe()
            ))),
        }
    }

    fn store_field(&self, target: Value, name: &str, value: Value) -> Result<(), EvalError> {
        match target {
            Value::Object(object) => {
                object.borrow_mut().fields.insert(name.to_string(), value);
                Ok(())
            }
            Value::Ptr(pointer) => match pointer.load()? {
                Value::Object(object) => {
                    object.borrow_mut().fields.insert(name.to_string(), value);
                    Ok(())
                }
                Value::Struct(_) => pointer.field(name).store(value),
                Value::Null => Err(EvalError::NullReference(name.to_string())),
                other => Err(EvalError::TypeMismatch(format!(
                    "stfld {} through pointer to {}",
                    name,
                    other.describe()
                ))),
            },
            Value::Null => Err(EvalError::NullReference(name.to_string())),
            other => Err(EvalError::TypeMismatch(format!(
                "stfld {} on {}",
                name,
                other.describe()
            ))),
        }
    }

    fn field_address(&self, target: Value, name: &str) -> Result<Pointer, EvalError> {
        match target {
            Value::Object(object) => Ok(Pointer::to_field(object, name)),
            Value::Ptr(pointer) => match pointer.load()? {
                Value::Object(object) => Ok(Pointer::to_field(object, name)),
                Value::Struct(_) => Ok(pointer.field(name)),
                Value::Null => Err(EvalError::NullReference(name.to_string())),
                other => Err(EvalError::TypeMismatch(format!(
                    "ldflda {} through pointer to {}",
                    name,
                    other.describe()
                ))),
            },
            Value::Null => Err(EvalError::NullReference(name.to_string())),
            other => Err(EvalError::TypeMismatch(format!(
                "ldflda {} on {}",
                name,
                other.describe()
            ))),
        }
    }

    fn call(&mut self, frame: &mut Frame, method: &MethodRef) -> Result<(), EvalError> {
        let signature = self.signature_of(method);
        let args = frame.pop_n(signature.arg_count())?;
        let result = self.invoke_ref(method, args)?;
        if signature.return_type != TypeSignature::Void {
            frame.push(result.unwrap_or(Value::Null));
        }
        Ok(())
    }

    fn execute(&mut self, method: MethodId, args: Vec<Value>) -> Result<Option<Value>, EvalError> {
        let module = self.module;
        let def = module.method(method);
        let name = format!("{}::{}", module.type_full_name(def.declaring_type), def.name);
        let body = def
            .body
            .as_ref()
            .ok_or_else(|| EvalError::MissingBody(name.clone()))?;

        let expected = def.signature.arg_count();
        if args.len() != expected {
            return Err(EvalError::ArgumentCount {
                method: name,
                expected,
                actual: args.len(),
            });
        }

        let mut frame = Frame {
            args: args.into_iter().map(slot).collect(),
            locals: body
                .locals
                .iter()
                .map(|local| slot(self.default_value(&local.ty)))
                .collect(),
            stack: Vec::new(),
            name,
        };

        let instructions = body.instructions.as_slice();
        let mut pc = 0;
        loop {
            let instr = instructions
                .get(pc)
                .ok_or_else(|| EvalError::FallOffEnd(frame.name.clone()))?;
            self.steps += 1;
            if self.steps > self.max_steps {
                return Err(EvalError::StepLimitExceeded);
            }
            pc += 1;

            let jump = |frame: &Frame, operand: &Operand| -> Result<usize, EvalError> {
                match operand {
                    Operand::Label(target) => body
                        .instructions
                        .position_of(*target)
                        .ok_or_else(|| EvalError::InvalidBranch(frame.name.clone())),
                    _ => Err(EvalError::InvalidBranch(frame.name.clone())),
                }
            };

            match instr.opcode {
                Opcode::Nop => {}

                op if op.is_ldarg() => {
                    let value = frame.arg(instr)?.borrow().clone();
                    frame.push(value);
                }
                Opcode::Ldarga | Opcode::LdargaS => {
                    let pointer = Pointer::to_slot(frame.arg(instr)?.clone());
                    frame.push(Value::Ptr(pointer));
                }
                Opcode::Starg | Opcode::StargS => {
                    let value = frame.pop()?;
                    *frame.arg(instr)?.borrow_mut() = value;
                }

                op if op.is_ldloc() => {
                    let value = frame.local(instr)?.borrow().clone();
                    frame.push(value);
                }
                op if op.is_ldloca() => {
                    let pointer = Pointer::to_slot(frame.local(instr)?.clone());
                    frame.push(Value::Ptr(pointer));
                }
                op if op.is_stloc() => {
                    let value = frame.pop()?;
                    *frame.local(instr)?.borrow_mut() = value;
                }

                Opcode::Ldnull => frame.push(Value::Null),
                Opcode::LdcI8 | Opcode::LdcR4 | Opcode::LdcR8 | Opcode::Ldstr => {
                    let value = match &instr.operand {
                        Operand::I64(v) => Value::I8(*v),
                        Operand::F32(v) => Value::R4(*v),
                        Operand::F64(v) => Value::R8(*v),
                        Operand::String(s) => Value::String(s.clone()),
                        _ => {
                            return Err(EvalError::TypeMismatch(format!(
                                "{}: bad constant operand",
                                frame.name
                            )))
                        }
                    };
                    frame.push(value);
                }
                op if instr.i4_constant().is_some() || op == Opcode::LdcI4 || op == Opcode::LdcI4S => {
                    let value = instr.i4_constant().ok_or_else(|| {
                        EvalError::TypeMismatch(format!("{}: bad constant operand", frame.name))
                    })?;
                    frame.push(Value::I4(value));
                }

                Opcode::Dup => {
                    let value = frame.pop()?;
                    frame.push(value.clone());
                    frame.push(value);
                }
                Opcode::Pop => {
                    frame.pop()?;
                }

                Opcode::Call | Opcode::Callvirt => {
                    let Operand::Method(target) = &instr.operand else {
                        return Err(EvalError::TypeMismatch(format!("{}: bad call operand", frame.name)));
                    };
                    self.call(&mut frame, target)?;
                }
                Opcode::Newobj => {
                    let Operand::Method(ctor) = &instr.operand else {
                        return Err(EvalError::TypeMismatch(format!("{}: bad newobj operand", frame.name)));
                    };
                    let count = self.signature_of(ctor).params.len();
                    let params = frame.pop_n(count)?;
                    let value = self.construct(ctor, params)?;
                    frame.push(value);
                }
                Opcode::Ret => {
                    if def.signature.return_type == TypeSignature::Void {
                        return Ok(None);
                    }
                    return frame.pop().map(Some);
                }

                Opcode::Br | Opcode::BrS => {
                    pc = jump(&frame, &instr.operand)?;
                }
                Opcode::Brfalse | Opcode::BrfalseS | Opcode::Brtrue | Opcode::BrtrueS => {
                    let value = frame.pop()?;
                    let wanted = matches!(instr.opcode, Opcode::Brtrue | Opcode::BrtrueS);
                    if value.is_truthy() == wanted {
                        pc = jump(&frame, &instr.operand)?;
                    }
                }
                Opcode::Beq | Opcode::Bge | Opcode::Bgt | Opcode::Ble | Opcode::Blt => {
                    let b = frame.pop()?;
                    let a = frame.pop()?;
                    let taken = match instr.opcode {
                        Opcode::Beq => a == b,
                        Opcode::Bge => matches!(compare(&a, &b), Some(Ordering::Greater | Ordering::Equal)),
                        Opcode::Bgt => compare(&a, &b) == Some(Ordering::Greater),
                        Opcode::Ble => matches!(compare(&a, &b), Some(Ordering::Less | Ordering::Equal)),
                        _ => compare(&a, &b) == Some(Ordering::Less),
                    };
                    if taken {
                        pc = jump(&frame, &instr.operand)?;
                    }
                }

                Opcode::Add | Opcode::Sub | Opcode::Mul => {
                    let b = frame.pop()?;
                    let a = frame.pop()?;
                    frame.push(arithmetic(instr.opcode, a, b)?);
                }
                // Native integers are modelled as 64-bit
                Opcode::ConvI | Opcode::ConvU => {
                    let value = match frame.pop()? {
                        Value::I4(v) => Value::I8(i64::from(v)),
                        Value::I8(v) => Value::I8(v),
                        other => {
                            return Err(EvalError::TypeMismatch(format!(
                                "{}: cannot convert {:?} to native int",
                                frame.name, other
                            )))
                        }
                    };
                    frame.push(value);
                }
                Opcode::Ceq | Opcode::Cgt | Opcode::Clt => {
                    let b = frame.pop()?;
                    let a = frame.pop()?;
                    let result = match instr.opcode {
                        Opcode::Ceq => a == b,
                        Opcode::Cgt => compare(&a, &b) == Some(Ordering::Greater),
                        _ => compare(&a, &b) == Some(Ordering::Less),
                    };
                    frame.push(Value::I4(i32::from(result)));
                }

                // Boxing is transparent in this value model
                Opcode::Castclass | Opcode::Isinst | Opcode::Box | Opcode::UnboxAny => {}

                Opcode::Throw => {
                    let value = frame.pop()?;
                    return Err(EvalError::Exception(value.describe().to_string()));
                }

                Opcode::Ldfld | Opcode::Ldflda | Opcode::Stfld | Opcode::Ldsfld | Opcode::Stsfld => {
                    let Operand::Field(field) = &instr.operand else {
                        return Err(EvalError::TypeMismatch(format!("{}: bad field operand", frame.name)));
                    };
                    let field_name = self.field_name(field);
                    match instr.opcode {
                        Opcode::Ldfld => {
                            let target = frame.pop()?;
                            frame.push(self.load_field(target, &field_name)?);
                        }
                        Opcode::Ldflda => {
                            let target = frame.pop()?;
                            frame.push(Value::Ptr(self.field_address(target, &field_name)?));
                        }
                        Opcode::Stfld => {
                            let value = frame.pop()?;
                            let target = frame.pop()?;
                            self.store_field(target, &field_name, value)?;
                        }
                        Opcode::Ldsfld => {
                            let value = match self.statics.get(field) {
                                Some(value) => value.clone(),
                                None => self.default_value(&self.field_type(field)),
                            };
                            frame.push(value);
                        }
                        _ => {
                            let value = frame.pop()?;
                            self.statics.insert(field.clone(), value);
                        }
                    }
                }

                Opcode::Newarr => {
                    let Operand::Type(element) = &instr.operand else {
                        return Err(EvalError::TypeMismatch(format!("{}: bad newarr operand", frame.name)));
                    };
                    let length = match frame.pop()? {
                        Value::I4(n) if n >= 0 => n as usize,
                        Value::I4(n) => return Err(EvalError::IndexOutOfRange(i64::from(n))),
                        other => {
                            return Err(EvalError::TypeMismatch(format!(
                                "newarr length of {}",
                                other.describe()
                            )))
                        }
                    };
                    let items = vec![self.default_value(element); length];
                    frame.push(Value::Array(Rc::new(RefCell::new(items))));
                }
                Opcode::Ldlen => match frame.pop()? {
                    Value::Array(items) => {
                        let len = items.borrow().len();
                        frame.push(Value::I4(len as i32));
                    }
                    Value::Null => return Err(EvalError::NullReference("array".to_string())),
                    other => {
                        return Err(EvalError::TypeMismatch(format!("ldlen on {}", other.describe())))
                    }
                },
                Opcode::Ldelem | Opcode::Stelem => {
                    let value = if instr.opcode == Opcode::Stelem {
                        Some(frame.pop()?)
                    } else {
                        None
                    };
                    let index = match frame.pop()? {
                        Value::I4(i) => i64::from(i),
                        Value::I8(i) => i,
                        other => {
                            return Err(EvalError::TypeMismatch(format!(
                                "array index of {}",
                                other.describe()
                            )))
                        }
                    };
                    let Value::Array(items) = frame.pop()? else {
                        return Err(EvalError::NullReference("array".to_string()));
                    };
                    let position = usize::try_from(index)
                        .ok()
                        .filter(|&i| i < items.borrow().len())
                        .ok_or(EvalError::IndexOutOfRange(index))?;
                    match value {
                        Some(value) => items.borrow_mut()[position] = value,
                        None => {
                            let element = items.borrow()[position].clone();
                            frame.push(element);
                        }
                    }
                }

                Opcode::Initobj => {
                    let Operand::Type(ty) = &instr.operand else {
                        return Err(EvalError::TypeMismatch(format!("{}: bad initobj operand", frame.name)));
                    };
                    let Value::Ptr(pointer) = frame.pop()? else {
                        return Err(EvalError::InvalidPointer);
                    };
                    pointer.store(self.default_value(ty))?;
                }

                other => {
                    return Err(EvalError::TypeMismatch(format!(
                        "{}: unsupported opcode {}",
                        frame.name, other
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::MethodBody;
    use crate::module::{field_attributes, method_attributes, type_attributes, FieldDef, MethodDef, TypeDef};
    use crate::types::TypeDefOrRef;

    fn static_method(module: &mut Module, name: &str, ret: TypeSignature, params: Vec<TypeSignature>, body: MethodBody) -> MethodId {
        let owner = module
            .find_type("App", "Program")
            .unwrap_or_else(|| module.add_type(TypeDef::new("App", "Program", type_attributes::PUBLIC, Some(TypeSignature::Object))));
        module.add_method(
            owner,
            MethodDef::new(name, method_attributes::PUBLIC | method_attributes::STATIC, MethodSignature::new_static(ret, params))
                .with_body(body),
        )
    }

    #[test]
    fn test_arithmetic_and_branches() {
        let mut module = Module::new("App");
        // max(a, b) * 2
        let mut body = MethodBody::new();
        body.emit_op(Opcode::Ldarg0);
        body.emit_op(Opcode::Ldarg1);
        let else_label = crate::body::InstrId(5);
        body.emit(Opcode::Blt, Operand::Label(else_label));
        body.emit_op(Opcode::Ldarg0);
        let join = crate::body::InstrId(6);
        body.emit(Opcode::Br, Operand::Label(join));
        body.emit_op(Opcode::Ldarg1); // id 5
        body.emit_op(Opcode::LdcI4_2); // id 6
        body.emit_op(Opcode::Mul);
        body.emit_op(Opcode::Ret);
        let max2 = static_method(&mut module, "Max2", TypeSignature::I4, vec![TypeSignature::I4, TypeSignature::I4], body);

        let mut eval = Evaluator::new(&module);
        assert_eq!(eval.invoke(max2, vec![Value::I4(3), Value::I4(9)]).unwrap(), Some(Value::I4(18)));
        assert_eq!(eval.invoke(max2, vec![Value::I4(7), Value::I4(1)]).unwrap(), Some(Value::I4(14)));
    }

    #[test]
    fn test_value_type_constructor_through_pointer() {
        let mut module = Module::new("App");
        let point = module.add_type(TypeDef::new(
            "App",
            "Point",
            type_attributes::PUBLIC | type_attributes::SEQUENTIAL_LAYOUT,
            Some(TypeSignature::corlib_class("System", "ValueType")),
        ));
        let x = module.add_field(point, FieldDef::new("X", field_attributes::PUBLIC, TypeSignature::I4));
        let mut ctor_body = MethodBody::new();
        ctor_body.emit_op(Opcode::Ldarg0);
        ctor_body.emit_op(Opcode::Ldarg1);
        ctor_body.emit(Opcode::Stfld, Operand::Field(FieldRef::Def(x)));
        ctor_body.emit_op(Opcode::Ret);
        let ctor = module.add_method(
            point,
            MethodDef::new(
                ".ctor",
                method_attributes::PUBLIC | method_attributes::SPECIAL_NAME | method_attributes::RT_SPECIAL_NAME,
                MethodSignature::new_instance(TypeSignature::Void, vec![TypeSignature::I4]),
            )
            .with_body(ctor_body),
        );

        // var p = default(Point); p..ctor(5); return p.X;
        let point_sig = TypeSignature::ValueType(TypeDefOrRef::Def(point));
        let mut body = MethodBody::new();
        body.add_local(point_sig.clone());
        body.emit(Opcode::LdlocaS, Operand::Local(0));
        body.emit(Opcode::LdcI4S, Operand::I32(5));
        body.emit(Opcode::Call, Operand::Method(MethodRef::Def(ctor)));
        body.emit_op(Opcode::Ldloc0);
        body.emit(Opcode::Ldfld, Operand::Field(FieldRef::Def(x)));
        body.emit_op(Opcode::Ret);
        let run = static_method(&mut module, "Run", TypeSignature::I4, vec![], body);

        let mut eval = Evaluator::new(&module);
        assert_eq!(eval.invoke(run, vec![]).unwrap(), Some(Value::I4(5)));

        let built = eval.construct(&MethodRef::Def(ctor), vec![Value::I4(11)]).unwrap();
        assert_eq!(built.field("X"), Some(Value::I4(11)));
    }

    #[test]
    fn test_fail_fast_intrinsic() {
        let mut module = Module::new("App");
        let mut body = MethodBody::new();
        body.emit(Opcode::Ldstr, Operand::String("boom".to_string()));
        body.emit(
            Opcode::Call,
            Operand::Method(MethodRef::member(
                TypeSignature::corlib_class("System", "Environment"),
                "FailFast",
                MethodSignature::new_static(TypeSignature::Void, vec![TypeSignature::String]),
            )),
        );
        body.emit_op(Opcode::Ret);
        let run = static_method(&mut module, "Run", TypeSignature::Void, vec![], body);

        let err = Evaluator::new(&module).invoke(run, vec![]).unwrap_err();
        assert!(matches!(err, EvalError::FailFast(msg) if msg == "boom"));
    }

    #[test]
    fn test_unbounded_recursion_overflows() {
        let mut module = Module::new("App");
        let owner = module.add_type(TypeDef::new("App", "Program", type_attributes::PUBLIC, Some(TypeSignature::Object)));
        let method = module.add_method(
            owner,
            MethodDef::new("Loop", method_attributes::PUBLIC | method_attributes::STATIC, MethodSignature::new_static(TypeSignature::I4, vec![])),
        );
        let mut body = MethodBody::new();
        body.emit(Opcode::Call, Operand::Method(MethodRef::Def(method)));
        body.emit_op(Opcode::Ret);
        module.method_mut(method).body = Some(body);

        let err = Evaluator::new(&module).with_max_depth(16).invoke(method, vec![]).unwrap_err();
        assert!(matches!(err, EvalError::StackOverflow(16)));
    }

    #[test]
    fn test_reference_semantics() {
        let mut module = Module::new("App");
        let person = module.add_type(TypeDef::new("App", "Person", type_attributes::PUBLIC, Some(TypeSignature::Object)));
        let age = module.add_field(person, FieldDef::new("Age", field_attributes::PUBLIC, TypeSignature::I4));

        // static void Birthday(Person p) { p.Age = p.Age + 1; }
        let mut body = MethodBody::new();
        body.emit_op(Opcode::Ldarg0);
        body.emit_op(Opcode::Ldarg0);
        body.emit(Opcode::Ldfld, Operand::Field(FieldRef::Def(age)));
        body.emit_op(Opcode::LdcI4_1);
        body.emit_op(Opcode::Add);
        body.emit(Opcode::Stfld, Operand::Field(FieldRef::Def(age)));
        body.emit_op(Opcode::Ret);
        let birthday = static_method(
            &mut module,
            "Birthday",
            TypeSignature::Void,
            vec![TypeSignature::Class(TypeDefOrRef::Def(person))],
            body,
        );

        let object = Rc::new(RefCell::new(Instance {
            ty: TypeSignature::Class(TypeDefOrRef::Def(person)),
            fields: FxHashMap::default(),
        }));
        object.borrow_mut().fields.insert("Age".to_string(), Value::I4(41));
        let value = Value::Object(object);

        let mut eval = Evaluator::new(&module);
        assert_eq!(eval.invoke(birthday, vec![value.clone()]).unwrap(), None);
        assert_eq!(value.field("Age"), Some(Value::I4(42)));
    }

    #[test]
    fn test_argument_count_checked() {
        let mut module = Module::new("App");
        let mut body = MethodBody::new();
        body.emit_op(Opcode::Ret);
        let run = static_method(&mut module, "Run", TypeSignature::Void, vec![TypeSignature::I4], body);
        assert!(matches!(
            Evaluator::new(&module).invoke(run, vec![]),
            Err(EvalError::ArgumentCount { expected: 1, actual: 0, .. })
        ));
    }

    #[test]
    fn test_arrays() {
        let mut module = Module::new("App");
        let mut body = MethodBody::new();
        body.add_local(TypeSignature::SzArray(Box::new(TypeSignature::I4)));
        body.emit_op(Opcode::LdcI4_3);
        body.emit(Opcode::Newarr, Operand::Type(TypeSignature::I4));
        body.emit_op(Opcode::Stloc0);
        body.emit_op(Opcode::Ldloc0);
        body.emit_op(Opcode::LdcI4_1);
        body.emit(Opcode::LdcI4S, Operand::I32(77));
        body.emit(Opcode::Stelem, Operand::Type(TypeSignature::I4));
        body.emit_op(Opcode::Ldloc0);
        body.emit_op(Opcode::LdcI4_1);
        body.emit(Opcode::Ldelem, Operand::Type(TypeSignature::I4));
        body.emit_op(Opcode::Ldloc0);
        body.emit_op(Opcode::Ldlen);
        body.emit_op(Opcode::Add);
        body.emit_op(Opcode::Ret);
        let run = static_method(&mut module, "Run", TypeSignature::I4, vec![], body);
        assert_eq!(Evaluator::new(&module).invoke(run, vec![]).unwrap(), Some(Value::I4(80)));
    }
}
