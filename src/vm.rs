// Call-frame dispatch loop executing bytecode (§4.3). The VM owns the heap,
// the value stack, the call-frame stack, the globals table and the
// open-upvalue list — every piece of interpreter state lives here rather
// than behind process-wide globals, per the "VM as a single value" design
// note (§9).

use std::time::Instant;

use crate::chunk::{disassemble_instruction, OpCode};
use crate::compiler;
use crate::errors::{ErrorKind, RuffError, SourceLocation};
use crate::gc::{Heap, ObjRef};
use crate::object::{NativeObj, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjUpvalue, UpvalueState};
use crate::table::Table;
use crate::value::{format_value, Value};

/// Up to 64 call frames (§4.3).
const FRAMES_MAX: usize = 64;
/// `64 * 256` value slots (§4.3).
const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// A native function: receives the VM (so it can allocate heap values, e.g.
/// strings) and its argument slice, per §3's `(arg-count, arg-slice) →
/// Value` contract.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, String>;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Index into `Vm::stack` of this frame's slot 0.
    slots: usize,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table<Value>,
    /// Head of the descending-address open-upvalue list (§3 invariants).
    open_upvalues: Option<ObjRef>,
    start_time: Instant,
    pub trace_exec: bool,
    script_args: Vec<String>,
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            start_time: Instant::now(),
            trace_exec: false,
            script_args: Vec::new(),
        };
        crate::native::define_natives(&mut vm);
        vm
    }

    pub fn set_stress_gc(&mut self, on: bool) {
        self.heap.stress_gc = on;
    }

    pub fn set_log_gc(&mut self, on: bool) {
        self.heap.log_gc = on;
    }

    pub fn set_script_args(&mut self, args: Vec<String>) {
        self.script_args = args;
    }

    pub fn script_args(&self) -> &[String] {
        &self.script_args
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // ---- allocation helpers, keeping VM-side roots correct ----------------

    fn mark_roots(
        stack: &[Value],
        frames: &[CallFrame],
        open_upvalues: Option<ObjRef>,
        globals: &Table<Value>,
        heap: &mut Heap,
    ) {
        for v in stack {
            heap.mark_value(*v);
        }
        for f in frames {
            heap.mark_object(f.closure);
        }
        let mut cur = open_upvalues;
        while let Some(r) = cur {
            heap.mark_object(r);
            cur = heap.upvalue_next_open(r);
        }
        for (k, _hash, v) in globals.iter() {
            heap.mark_object(k);
            heap.mark_value(*v);
        }
        heap.mark_init_string();
    }

    fn alloc(&mut self, obj: Obj, size: usize) -> ObjRef {
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = self.open_upvalues;
        let globals = &self.globals;
        self.heap.alloc(obj, size, move |heap| {
            Vm::mark_roots(stack, frames, open_upvalues, globals, heap);
        })
    }

    /// Intern `bytes`, respecting VM roots if the intern triggers a GC.
    pub fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = self.open_upvalues;
        let globals = &self.globals;
        self.heap.intern_bytes(bytes, move |heap| {
            Vm::mark_roots(stack, frames, open_upvalues, globals, heap);
        })
    }

    pub fn intern_value(&mut self, bytes: &[u8]) -> Value {
        Value::Obj(self.intern(bytes))
    }

    fn string_hash(&self, r: ObjRef) -> u32 {
        self.heap.get(r).as_string().expect("global/property key must be a string").hash
    }

    fn string_bytes(&self, r: ObjRef) -> Vec<u8> {
        self.heap.get(r).as_string().expect("expected string").bytes.to_vec()
    }

    pub fn string_lossy(&self, r: ObjRef) -> String {
        self.heap.get(r).as_string().expect("expected string").as_str_lossy().into_owned()
    }

    /// Installs `function` as a global named `name`, used by native-library
    /// setup (`native::define_natives`) to populate globals before any
    /// script runs.
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_ref = self.intern(name.as_bytes());
        let hash = self.string_hash(name_ref);
        let native_ref =
            self.alloc(Obj::Native(NativeObj { name: name_ref, function }), std::mem::size_of::<NativeObj>());
        self.globals.set(name_ref, hash, Value::Obj(native_ref));
    }

    // ---- stack plumbing ----------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn frame_chunk_fn(&self, frame: &CallFrame) -> ObjRef {
        self.heap.get(frame.closure).as_closure().expect("frame closure").function
    }

    fn read_u8(&mut self) -> u8 {
        let i = self.frames.len() - 1;
        let func = self.frame_chunk_fn(&self.frames[i]);
        let ip = self.frames[i].ip;
        let byte = self.heap.get(func).as_function().unwrap().chunk.code[ip];
        self.frames[i].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8() as u16;
        let lo = self.read_u8() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_u8();
        let i = self.frames.len() - 1;
        let func = self.frame_chunk_fn(&self.frames[i]);
        self.heap.get(func).as_function().unwrap().chunk.constants[idx as usize]
    }

    fn read_string(&mut self) -> ObjRef {
        self.read_constant().as_obj().expect("constant is not a string")
    }

    fn current_line(&self) -> u32 {
        let frame = self.frame();
        let func = self.frame_chunk_fn(frame);
        self.heap.get(func).as_function().unwrap().chunk.line_at(frame.ip.saturating_sub(1))
    }

    // ---- public entry point -------------------------------------------------

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match compiler::compile(source, &mut self.heap, &self.globals) {
            Some(f) => f,
            None => return InterpretResult::CompileError,
        };
        self.push(Value::Obj(function));
        let closure_ref =
            self.alloc(Obj::Closure(ObjClosure { function, upvalues: Vec::new() }), std::mem::size_of::<ObjClosure>());
        self.pop();
        self.push(Value::Obj(closure_ref));
        self.call_closure(closure_ref, 0);
        self.run()
    }

    fn run(&mut self) -> InterpretResult {
        loop {
            if self.trace_exec {
                self.trace();
            }
            let op = OpCode::from_u8(self.read_u8());
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_u8() as usize;
                    let base = self.frame().slots;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_u8() as usize;
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(v) => {
                            let v = *v;
                            self.push(v);
                        }
                        None => {
                            let msg = format!("Undefined variable '{}'.", self.string_lossy(name));
                            return self.runtime_error(&msg);
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.string_hash(name);
                    let v = self.peek(0);
                    self.globals.set(name, hash, v);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.string_hash(name);
                    let v = self.peek(0);
                    if self.globals.set(name, hash, v) {
                        // `set` reports whether this was a fresh insertion;
                        // an assignment to an undefined global must not
                        // silently create it (§4.3).
                        self.globals.delete(name, hash);
                        let msg = format!("Undefined variable '{}'.", self.string_lossy(name));
                        return self.runtime_error(&msg);
                    }
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_u8() as usize;
                    let closure = self.frame().closure;
                    let up = self.heap.get(closure).as_closure().unwrap().upvalues[idx];
                    let v = self.upvalue_get(up);
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_u8() as usize;
                    let closure = self.frame().closure;
                    let up = self.heap.get(closure).as_closure().unwrap().upvalues[idx];
                    let v = self.peek(0);
                    self.upvalue_set(up, v);
                }
                OpCode::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    let inst_ref = match receiver.as_obj().filter(|r| self.heap.get(*r).as_instance().is_some()) {
                        Some(r) => r,
                        None => return self.runtime_error("Only instances have properties."),
                    };
                    let hash = self.string_hash(name);
                    let field = self.heap.get(inst_ref).as_instance().unwrap().fields.get(name, hash).copied();
                    if let Some(v) = field {
                        self.pop();
                        self.push(v);
                    } else {
                        let class_ref = self.heap.get(inst_ref).as_instance().unwrap().class;
                        let method = self.heap.get(class_ref).as_class().unwrap().methods.get(name, hash).copied();
                        match method {
                            Some(Value::Obj(m)) => {
                                let bound = self.bind_method(receiver, m);
                                self.pop();
                                self.push(bound);
                            }
                            _ => {
                                let msg = format!("Undefined property '{}'.", self.string_lossy(name));
                                return self.runtime_error(&msg);
                            }
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(1);
                    let inst_ref = match receiver.as_obj().filter(|r| self.heap.get(*r).as_instance().is_some()) {
                        Some(r) => r,
                        None => return self.runtime_error("Only instances have fields."),
                    };
                    let hash = self.string_hash(name);
                    let value = self.peek(0);
                    if let Obj::Instance(inst) = self.heap.get_mut(inst_ref) {
                        inst.fields.set(name, hash, value);
                    }
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_obj().expect("super must be a class");
                    let receiver = self.pop();
                    let hash = self.string_hash(name);
                    let method = self.heap.get(superclass).as_class().unwrap().methods.get(name, hash).copied();
                    match method {
                        Some(Value::Obj(m)) => {
                            let bound = self.bind_method(receiver, m);
                            self.push(bound);
                        }
                        _ => {
                            let msg = format!("Undefined property '{}'.", self.string_lossy(name));
                            return self.runtime_error(&msg);
                        }
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    if let Err(r) = self.numeric_binary(|a, b| Value::Bool(a > b)) {
                        return r;
                    }
                }
                OpCode::Less => {
                    if let Err(r) = self.numeric_binary(|a, b| Value::Bool(a < b)) {
                        return r;
                    }
                }
                OpCode::Add => {
                    if let Err(r) = self.add() {
                        return r;
                    }
                }
                OpCode::Subtract => {
                    if let Err(r) = self.numeric_binary(|a, b| Value::Number(a - b)) {
                        return r;
                    }
                }
                OpCode::Multiply => {
                    if let Err(r) = self.numeric_binary(|a, b| Value::Number(a * b)) {
                        return r;
                    }
                }
                OpCode::Divide => {
                    if let Err(r) = self.numeric_binary(|a, b| Value::Number(a / b)) {
                        return r;
                    }
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return self.runtime_error("Operand must be a number."),
                    }
                }
                OpCode::Print => {
                    let v = self.pop();
                    println!("{}", format_value(v, &self.heap));
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_u8() as usize;
                    let callee = self.peek(argc);
                    if !self.call_value(callee, argc) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_u8() as usize;
                    if !self.invoke(name, argc) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_u8() as usize;
                    let superclass = self.pop().as_obj().expect("super must be a class");
                    if !self.invoke_from_class(superclass, name, argc) {
                        return InterpretResult::RuntimeError;
                    }
                }
                OpCode::Closure => {
                    let function = self.read_constant().as_obj().expect("CLOSURE operand must be a function");
                    let upvalue_count = self.heap.get(function).as_function().unwrap().upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_u8() == 1;
                        let index = self.read_u8() as usize;
                        if is_local {
                            let base = self.frame().slots;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let closure = self.frame().closure;
                            upvalues.push(self.heap.get(closure).as_closure().unwrap().upvalues[index]);
                        }
                    }
                    let closure_ref =
                        self.alloc(Obj::Closure(ObjClosure { function, upvalues }), std::mem::size_of::<ObjClosure>());
                    self.push(Value::Obj(closure_ref));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.slots);
                    if self.frames.is_empty() {
                        self.pop();
                        return InterpretResult::Ok;
                    }
                    self.stack.truncate(frame.slots);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class_ref = self.alloc(Obj::Class(ObjClass::new(name)), std::mem::size_of::<ObjClass>());
                    self.push(Value::Obj(class_ref));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let super_ref = match superclass.as_obj().filter(|r| self.heap.get(*r).as_class().is_some()) {
                        Some(r) => r,
                        None => return self.runtime_error("Superclass must be a class."),
                    };
                    let sub_ref = self.peek(0).as_obj().expect("INHERIT expects a class on top");
                    let super_methods = self.heap.get(super_ref).as_class().unwrap().methods.clone();
                    if let Obj::Class(sub) = self.heap.get_mut(sub_ref) {
                        sub.methods.copy_from(&super_methods);
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }
            }
        }
    }

    // ---- arithmetic -----------------------------------------------------

    fn numeric_binary(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), InterpretResult> {
        let (b, a) = (self.peek(0).as_number(), self.peek(1).as_number());
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn add(&mut self) -> Result<(), InterpretResult> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Some(an), Some(bn)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            self.push(Value::Number(an + bn));
            return Ok(());
        }
        if a.is_string(&self.heap) && b.is_string(&self.heap) {
            let a_ref = a.as_obj().unwrap();
            let b_ref = b.as_obj().unwrap();
            let mut bytes = self.string_bytes(a_ref);
            bytes.extend(self.string_bytes(b_ref));
            let result = self.intern_value(&bytes);
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }
        Err(self.runtime_error("Operands must be two numbers or two strings."))
    }

    // ---- calls ------------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: usize) -> bool {
        let r = match callee.as_obj() {
            Some(r) => r,
            None => {
                self.runtime_error("Can only call functions and classes.");
                return false;
            }
        };
        match self.heap.get(r) {
            Obj::Closure(_) => self.call_closure(r, argc),
            Obj::Native(native) => {
                let function = native.function;
                let base = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[base..].to_vec();
                match function(self, &args) {
                    Ok(result) => {
                        self.stack.truncate(base - 1);
                        self.push(result);
                        true
                    }
                    Err(msg) => {
                        self.runtime_error(&msg);
                        false
                    }
                }
            }
            Obj::Class(_) => self.call_class(r, argc),
            Obj::BoundMethod(bound) => {
                let receiver = bound.receiver;
                let method = bound.method;
                let base = self.stack.len() - argc - 1;
                self.stack[base] = receiver;
                self.call_closure(method, argc)
            }
            _ => {
                self.runtime_error("Can only call functions and classes.");
                false
            }
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, argc: usize) -> bool {
        let function_ref = self.heap.get(closure_ref).as_closure().unwrap().function;
        let arity = self.heap.get(function_ref).as_function().unwrap().arity as usize;
        if argc != arity {
            self.runtime_error(&format!("Expected {} arguments but got {}.", arity, argc));
            return false;
        }
        if self.frames.len() >= FRAMES_MAX {
            self.runtime_error("Stack overflow.");
            return false;
        }
        let slots = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slots });
        true
    }

    fn call_class(&mut self, class_ref: ObjRef, argc: usize) -> bool {
        let instance_ref = self.alloc(Obj::Instance(ObjInstance::new(class_ref)), std::mem::size_of::<ObjInstance>());
        let base = self.stack.len() - argc - 1;
        self.stack[base] = Value::Obj(instance_ref);
        let init = self.heap.init_string;
        let hash = self.string_hash(init);
        let initializer = self.heap.get(class_ref).as_class().unwrap().methods.get(init, hash).copied();
        match initializer {
            Some(Value::Obj(m)) => self.call_closure(m, argc),
            _ => {
                if argc != 0 {
                    self.runtime_error(&format!("Expected 0 arguments but got {}.", argc));
                    return false;
                }
                true
            }
        }
    }

    fn bind_method(&mut self, receiver: Value, method: ObjRef) -> Value {
        let bound_ref =
            self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }), std::mem::size_of::<ObjBoundMethod>());
        Value::Obj(bound_ref)
    }

    fn invoke(&mut self, name: ObjRef, argc: usize) -> bool {
        let receiver = self.peek(argc);
        let inst_ref = match receiver.as_obj().filter(|r| self.heap.get(*r).as_instance().is_some()) {
            Some(r) => r,
            None => {
                self.runtime_error("Only instances have methods.");
                return false;
            }
        };
        let hash = self.string_hash(name);
        let field = self.heap.get(inst_ref).as_instance().unwrap().fields.get(name, hash).copied();
        if let Some(value) = field {
            let base = self.stack.len() - argc - 1;
            self.stack[base] = value;
            return self.call_value(value, argc);
        }
        let class_ref = self.heap.get(inst_ref).as_instance().unwrap().class;
        self.invoke_from_class(class_ref, name, argc)
    }

    fn invoke_from_class(&mut self, class_ref: ObjRef, name: ObjRef, argc: usize) -> bool {
        let hash = self.string_hash(name);
        let method = self.heap.get(class_ref).as_class().unwrap().methods.get(name, hash).copied();
        match method {
            Some(Value::Obj(m)) => self.call_closure(m, argc),
            _ => {
                let msg = format!("Undefined property '{}'.", self.string_lossy(name));
                self.runtime_error(&msg);
                false
            }
        }
    }

    fn define_method(&mut self, name: ObjRef) {
        let method = self.pop();
        let class_ref = self.peek(0).as_obj().expect("METHOD expects a class below the closure");
        let hash = self.string_hash(name);
        if let Obj::Class(class) = self.heap.get_mut(class_ref) {
            class.methods.set(name, hash, method);
        }
    }

    // ---- upvalues -----------------------------------------------------------

    fn upvalue_get(&self, r: ObjRef) -> Value {
        match self.heap.get(r) {
            Obj::Upvalue(u) => match u.state {
                UpvalueState::Open(idx) => self.stack[idx],
                UpvalueState::Closed => u.closed,
            },
            _ => unreachable!(),
        }
    }

    fn upvalue_set(&mut self, r: ObjRef, value: Value) {
        let idx = match self.heap.get(r) {
            Obj::Upvalue(u) => match u.state {
                UpvalueState::Open(idx) => Some(idx),
                UpvalueState::Closed => None,
            },
            _ => unreachable!(),
        };
        match idx {
            Some(idx) => self.stack[idx] = value,
            None => {
                if let Obj::Upvalue(u) = self.heap.get_mut(r) {
                    u.closed = value;
                }
            }
        }
    }

    /// Finds or creates the open upvalue for stack slot `index`, keeping the
    /// open list sorted by descending stack address and deduplicated (§3,
    /// §4.3).
    fn capture_upvalue(&mut self, index: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut cur = self.open_upvalues;
        while let Some(r) = cur {
            let slot = match self.heap.get(r) {
                Obj::Upvalue(u) => match u.state {
                    UpvalueState::Open(i) => i,
                    UpvalueState::Closed => unreachable!("open list held a closed upvalue"),
                },
                _ => unreachable!(),
            };
            if slot == index {
                return r;
            }
            if slot < index {
                break;
            }
            prev = Some(r);
            cur = self.heap.upvalue_next_open(r);
        }

        let created = self.alloc(
            Obj::Upvalue(ObjUpvalue { state: UpvalueState::Open(index), closed: Value::Nil, next_open: cur }),
            std::mem::size_of::<ObjUpvalue>(),
        );
        match prev {
            Some(p) => {
                if let Obj::Upvalue(u) = self.heap.get_mut(p) {
                    u.next_open = Some(created);
                }
            }
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Closes every open upvalue at or above stack index `from`, per
    /// `CLOSE_UPVALUE`'s and `RETURN`'s contract (§4.3).
    fn close_upvalues(&mut self, from: usize) {
        while let Some(r) = self.open_upvalues {
            let slot = match self.heap.get(r) {
                Obj::Upvalue(u) => match u.state {
                    UpvalueState::Open(i) => i,
                    UpvalueState::Closed => break,
                },
                _ => unreachable!(),
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            let next = self.heap.upvalue_next_open(r);
            if let Obj::Upvalue(u) = self.heap.get_mut(r) {
                u.closed = value;
                u.state = UpvalueState::Closed;
                u.next_open = None;
            }
            self.open_upvalues = next;
        }
    }

    // ---- errors & tracing ---------------------------------------------------

    fn runtime_error(&mut self, message: &str) -> InterpretResult {
        let line = self.current_line();
        eprintln!("{}", RuffError::new(ErrorKind::Runtime, message.to_string(), SourceLocation::new(line)));
        for frame in self.frames.iter().rev() {
            let function = self.frame_chunk_fn(frame);
            let func = self.heap.get(function).as_function().unwrap();
            let frame_line = func.chunk.line_at(frame.ip.saturating_sub(1));
            let name = match func.name {
                Some(n) => format!("{}()", self.string_lossy(n)),
                None => "script".to_string(),
            };
            eprintln!("[line {}] in {}", frame_line, name);
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        InterpretResult::RuntimeError
    }

    fn trace(&self) {
        eprint!("          ");
        for v in &self.stack {
            eprint!("[ {} ]", format_value(*v, &self.heap));
        }
        eprintln!();
        let frame = self.frame();
        let function = self.frame_chunk_fn(frame);
        let chunk = &self.heap.get(function).as_function().unwrap().chunk;
        let (line, _) = disassemble_instruction(chunk, frame.ip, &self.heap);
        eprintln!("{}", line);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> InterpretResult {
        Vm::new().interpret(source)
    }

    #[test]
    fn arithmetic_and_print() {
        assert_eq!(run("print 1 + 2;"), InterpretResult::Ok);
    }

    #[test]
    fn string_interning_equality() {
        assert_eq!(run(r#"var a = "hi"; var b = "h" + "i"; print a == b;"#), InterpretResult::Ok);
    }

    #[test]
    fn closures_capture_and_mutate_shared_upvalue() {
        let src = r#"
            fun f() {
                var x = 0;
                fun g() { x = x + 1; return x; }
                return g;
            }
            var c = f();
            print c();
            print c();
        "#;
        assert_eq!(run(src), InterpretResult::Ok);
    }

    #[test]
    fn class_inheritance_and_init() {
        let src = r#"
            class A { greet() { print "hi"; } }
            class B < A {}
            B().greet();
            class C { init(x) { this.x = x; } }
            print C(7).x;
        "#;
        assert_eq!(run(src), InterpretResult::Ok);
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        assert_eq!(run("print nope;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn arity_mismatch_is_a_runtime_error() {
        assert_eq!(run("fun f(a) { return a; } f(1, 2);"), InterpretResult::RuntimeError);
    }

    #[test]
    fn compile_error_does_not_run_anything() {
        assert_eq!(run("var ="), InterpretResult::CompileError);
    }

    #[test]
    fn stress_gc_does_not_change_program_behavior() {
        let src = r#"
            class Node { init(v) { this.v = v; } }
            var a = Node(1);
            var b = Node(2);
            fun make() { var x = "sub" + "string"; return x; }
            print make();
            print a.v + b.v;
        "#;
        let mut vm = Vm::new();
        vm.set_stress_gc(true);
        assert_eq!(vm.interpret(src), InterpretResult::Ok);
    }
}
