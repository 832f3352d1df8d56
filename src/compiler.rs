// Single-pass Pratt parser / bytecode emitter (§4.2). No intermediate AST:
// every grammar production emits bytecode directly as it recognizes it.

use crate::chunk::{Chunk, OpCode};
use crate::errors::{ErrorKind, RuffError, SourceLocation};
use crate::gc::{Heap, ObjRef};
use crate::object::{FunctionKind, Obj, ObjFunction};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::table::Table;
use crate::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FunctionFrame<'src> {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FunctionFrame<'src> {
    fn new(function: ObjRef, kind: FunctionKind) -> Self {
        // Slot 0 is reserved for the receiver in methods/initializers, and
        // for the (unnamed, unusable) callee slot otherwise.
        let slot0_name = if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
            "this"
        } else {
            ""
        };
        FunctionFrame {
            function,
            kind,
            locals: vec![Local { name: slot0_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassFrame {
    has_superclass: bool,
}

#[derive(Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src> = fn(&mut Compiler<'_, 'src>, bool);

struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

fn get_rule<'src>(kind: TokenKind) -> ParseRule<'src> {
    use TokenKind::*;
    let (prefix, infix, precedence): (Option<ParseFn<'src>>, Option<ParseFn<'src>>, Precedence) =
        match kind {
            LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
            Dot => (None, Some(Compiler::dot), Precedence::Call),
            Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
            Plus => (None, Some(Compiler::binary), Precedence::Term),
            Slash => (None, Some(Compiler::binary), Precedence::Factor),
            Star => (None, Some(Compiler::binary), Precedence::Factor),
            Bang => (Some(Compiler::unary), None, Precedence::None),
            BangEqual => (None, Some(Compiler::binary), Precedence::Equality),
            EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                (None, Some(Compiler::binary), Precedence::Comparison)
            }
            Identifier => (Some(Compiler::variable), None, Precedence::None),
            String => (Some(Compiler::string), None, Precedence::None),
            Number => (Some(Compiler::number), None, Precedence::None),
            And => (None, Some(Compiler::and_), Precedence::And),
            Or => (None, Some(Compiler::or_), Precedence::Or),
            False | Nil | True => (Some(Compiler::literal), None, Precedence::None),
            This => (Some(Compiler::this_), None, Precedence::None),
            Super => (Some(Compiler::super_), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
    ParseRule { prefix, infix, precedence }
}

pub struct Compiler<'h, 'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    frames: Vec<FunctionFrame<'src>>,
    classes: Vec<ClassFrame>,
    heap: &'h mut Heap,
    globals: &'h Table<Value>,
}

/// Compiles `source` into a top-level script function, or `None` on any
/// compile error (all diagnostics are printed as a side effect).
pub fn compile(source: &str, heap: &mut Heap, globals: &Table<Value>) -> Option<ObjRef> {
    let mut compiler = Compiler::new(source, heap, globals);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let (function, _upvalues) = compiler.end_compiler();
    if compiler.had_error {
        None
    } else {
        Some(function)
    }
}

impl<'h, 'src> Compiler<'h, 'src> {
    fn new(source: &'src str, heap: &'h mut Heap, globals: &'h Table<Value>) -> Self {
        let mut compiler = Compiler {
            scanner: Scanner::new(source),
            previous: Token { kind: TokenKind::Error, lexeme: "", line: 0 },
            current: Token { kind: TokenKind::Error, lexeme: "", line: 0 },
            had_error: false,
            panic_mode: false,
            frames: Vec::new(),
            classes: Vec::new(),
            heap,
            globals,
        };
        let script = compiler.alloc_function();
        compiler.frames.push(FunctionFrame::new(script, FunctionKind::Script));
        compiler
    }

    // ---- low-level token & error plumbing ----------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let kind = if token.kind == TokenKind::Error {
            ErrorKind::Lexical
        } else {
            ErrorKind::Syntax
        };
        let full = if token.kind == TokenKind::Eof {
            format!("at end: {message}")
        } else if token.kind == TokenKind::Error {
            message.to_string()
        } else {
            format!("at '{}': {message}", token.lexeme)
        };
        RuffError::new(kind, full, SourceLocation::new(token.line)).print_compile();
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- heap access, scoped to keep GC roots correct ------------------

    fn alloc_function(&mut self) -> ObjRef {
        let frames = &self.frames;
        let globals = self.globals;
        self.heap.alloc(Obj::Function(ObjFunction::new()), std::mem::size_of::<ObjFunction>(), |heap| {
            mark_compile_roots(frames, globals, heap);
        })
    }

    fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        let frames = &self.frames;
        let globals = self.globals;
        self.heap.intern_bytes(bytes, |heap| {
            mark_compile_roots(frames, globals, heap);
        })
    }

    fn current_function_ref(&self) -> ObjRef {
        self.frames.last().unwrap().function
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        let f = self.current_function_ref();
        match self.heap.get_mut(f) {
            Obj::Function(func) => &mut func.chunk,
            _ => unreachable!(),
        }
    }

    // ---- byte emission --------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write_u8(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_op2(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        let kind = self.frames.last().unwrap().kind;
        if kind == FunctionKind::Initializer {
            self.emit_op2(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Some(i) => i,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_op2(OpCode::Constant, idx);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(msg) = self.current_chunk().patch_jump_to_here(offset) {
            self.error(&msg);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let r = self.intern(name.as_bytes());
        self.make_constant(Value::Obj(r))
    }

    // ---- scopes, locals, upvalues ---------------------------------------

    fn begin_scope(&mut self) {
        self.frames.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        frame.scope_depth -= 1;
        let depth = frame.scope_depth;
        while let Some(local) = frame.locals.last() {
            if local.depth <= depth {
                break;
            }
            let captured = local.is_captured;
            frame.locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &'src str) {
        let frame = self.frames.last_mut().unwrap();
        if frame.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        frame.locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        frame.locals.last_mut().unwrap().depth = depth;
    }

    fn declare_variable(&mut self) {
        let frame = self.frames.last();
        if frame.unwrap().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let depth = self.frames.last().unwrap().scope_depth;
        for local in self.frames.last().unwrap().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.frames.last().unwrap().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_string();
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.frames.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op2(OpCode::DefineGlobal, global);
    }

    fn resolve_local(frame: &FunctionFrame<'src>, name: &str) -> Option<Result<u8, ()>> {
        for (i, local) in frame.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Some(Err(()));
                }
                return Some(Ok(i as u8));
            }
        }
        None
    }

    fn add_upvalue(frame: &mut FunctionFrame<'src>, index: u8, is_local: bool) -> Result<u8, &'static str> {
        for (i, up) in frame.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if frame.upvalues.len() >= MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        frame.upvalues.push(UpvalueDesc { index, is_local });
        Ok((frame.upvalues.len() - 1) as u8)
    }

    /// Resolves `name` as an upvalue of `self.frames[frame_idx]`, recursing
    /// into enclosing frames as needed (§4.2 variable resolution, steps 1-2).
    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing_idx = frame_idx - 1;
        if let Some(result) = Self::resolve_local(&self.frames[enclosing_idx], name) {
            return match result {
                Ok(local_slot) => {
                    self.frames[enclosing_idx].locals[local_slot as usize].is_captured = true;
                    match Self::add_upvalue(&mut self.frames[frame_idx], local_slot, true) {
                        Ok(idx) => Some(idx),
                        Err(msg) => {
                            self.error(msg);
                            None
                        }
                    }
                }
                Err(()) => {
                    self.error("Can't read local variable in its own initializer.");
                    None
                }
            };
        }
        if let Some(enclosing_upvalue) = self.resolve_upvalue(enclosing_idx, name) {
            return match Self::add_upvalue(&mut self.frames[frame_idx], enclosing_upvalue, false) {
                Ok(idx) => Some(idx),
                Err(msg) => {
                    self.error(msg);
                    None
                }
            };
        }
        None
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let frame_idx = self.frames.len() - 1;
        let (get_op, set_op, arg): (OpCode, OpCode, u8) =
            match Self::resolve_local(&self.frames[frame_idx], name) {
                Some(Ok(slot)) => (OpCode::GetLocal, OpCode::SetLocal, slot),
                Some(Err(())) => {
                    self.error("Can't read local variable in its own initializer.");
                    (OpCode::GetLocal, OpCode::SetLocal, 0)
                }
                None => match self.resolve_upvalue(frame_idx, name) {
                    Some(idx) => (OpCode::GetUpvalue, OpCode::SetUpvalue, idx),
                    None => {
                        let idx = self.identifier_constant(name);
                        (OpCode::GetGlobal, OpCode::SetGlobal, idx)
                    }
                },
            };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op2(set_op, arg);
        } else {
            self.emit_op2(get_op, arg);
        }
    }

    // ---- expressions ------------------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = get_rule::<'src>(self.previous.kind).prefix;
        let prefix = match prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule::<'src>(self.current.kind).precedence {
            self.advance();
            let infix = get_rule::<'src>(self.previous.kind).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let contents = &lexeme[1..lexeme.len() - 1];
        let r = self.intern(contents.as_bytes());
        self.emit_constant(Value::Obj(r));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op2(OpCode::SuperInvoke, name_idx);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_op2(OpCode::GetSuper, name_idx);
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let rule = get_rule::<'src>(op_kind);
        self.parse_precedence(rule.precedence.next());
        match op_kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op2(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op2(OpCode::SetProperty, name_idx);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op2(OpCode::Invoke, name_idx);
            self.emit_byte(arg_count);
        } else {
            self.emit_op2(OpCode::GetProperty, name_idx);
        }
    }

    // ---- statements ---------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.frames.len() == 1 {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.frames.last().unwrap().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    // ---- functions & classes --------------------------------------------

    fn function(&mut self, kind: FunctionKind) {
        let name_token = self.previous.lexeme.to_string();
        // Allocate the function and push its frame first, so it's already
        // reachable via `mark_compile_roots` (every active compiler frame's
        // function is a root) before interning the name — `intern` is a GC
        // suspension point, and under stress-GC a not-yet-rooted nested
        // function's name would otherwise be swept before `f.name` is set.
        let function_ref = self.alloc_function();
        self.frames.push(FunctionFrame::new(function_ref, kind));
        let name_ref = self.intern(name_token.as_bytes());
        if let Obj::Function(f) = self.heap.get_mut(function_ref) {
            f.name = Some(name_ref);
        }
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                {
                    let frame = self.frames.last_mut().unwrap();
                    if frame.locals.len() >= MAX_ARGS + 1 {
                        self.error("Can't have more than 255 parameters.");
                    }
                }
                let arity = self.heap.get(function_ref).as_function().unwrap().arity;
                if (arity as usize) < MAX_ARGS {
                    if let Obj::Function(f) = self.heap.get_mut(function_ref) {
                        f.arity = arity + 1;
                    }
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (finished, upvalues) = self.end_compiler();
        debug_assert_eq!(finished, function_ref);

        let idx = self.make_constant(Value::Obj(function_ref));
        self.emit_op2(OpCode::Closure, idx);
        for up in &upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&name);
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_op2(OpCode::Method, name_idx);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&class_name);
        self.declare_variable();

        self.emit_op2(OpCode::Class, name_idx);
        self.define_variable(name_idx);

        self.classes.push(ClassFrame { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme.to_string();
            self.variable(false);
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let class_frame = self.classes.pop().unwrap();
        if class_frame.has_superclass {
            self.end_scope();
        }
    }

    /// Finalizes the innermost frame: emits the implicit return, pops the
    /// frame, and records its upvalue count on the `ObjFunction`. The
    /// returned upvalue descriptors become the `CLOSURE` operand trailer —
    /// one `(is_local, index)` pair per captured upvalue — which the caller
    /// emits into the *enclosing* frame's chunk, now current again, right
    /// after the `CLOSURE` opcode itself.
    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let frame = self.frames.pop().unwrap();
        let function_ref = frame.function;
        if let Obj::Function(f) = self.heap.get_mut(function_ref) {
            f.upvalue_count = frame.upvalues.len();
        }
        (function_ref, frame.upvalues)
    }
}

fn mark_compile_roots<'src>(frames: &[FunctionFrame<'src>], globals: &Table<Value>, heap: &mut Heap) {
    for f in frames {
        heap.mark_object(f.function);
    }
    for (k, _hash, v) in globals.iter() {
        heap.mark_object(k);
        heap.mark_value(*v);
    }
    heap.mark_init_string();
}
