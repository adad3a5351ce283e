//! Single-pass compiler: a Pratt parser that emits bytecode directly
//!
//! There is no AST. Each token kind maps to a prefix handler, an infix
//! handler, and a precedence; `parse_precedence` drives them and bytecode
//! falls out as a side effect. Function compilers stack up for nested
//! functions, class compilers for nested class declarations, and loop
//! records carry `break`/`continue` patch targets.
//!
//! Errors are collected as diagnostics. The first error in a statement
//! switches the parser into panic mode, which suppresses further reports
//! until it synchronizes at a statement boundary.

use std::rc::Rc;

use crate::bytecode::{disassemble, Chunk, OpCode};
use crate::diagnostic::Diagnostic;
use crate::heap::{Handle, Heap};
use crate::object::{Obj, ObjFunction};
use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Local slots are addressed by one byte, including slot zero.
const MAX_LOCALS: usize = 256;
/// Upvalue slots are addressed by one byte.
const MAX_UPVALUES: usize = 256;
/// Jump operands are unsigned 16-bit.
const MAX_JUMP: usize = u16::MAX as usize;

/// Compile a source string into the top-level script function.
///
/// On success the returned handle is an [`Obj::Function`] with arity zero.
/// On failure every diagnostic collected during the parse is returned and
/// nothing is executed.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    print_code: bool,
) -> Result<Handle, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(source, heap, print_code);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A declared local variable. `depth` is -1 between declaration and
/// initialization, which is how reads in a variable's own initializer are
/// caught.
struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

/// One captured variable reference, as emitted after `Closure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// Per-construct state for `break`/`continue` resolution. Switch statements
/// push a record with `is_loop` false: `break` resolves there, `continue`
/// skips past it to the nearest real loop.
struct LoopRecord {
    /// Back-edge target (the condition, or the increment clause of a `for`)
    start: usize,
    /// Scope depth at entry; jumps out pop locals deeper than this
    depth: i32,
    is_loop: bool,
    /// Forward jumps to patch to the end of the construct
    breaks: Vec<usize>,
}

/// Compilation state for one function, innermost last on the stack.
struct FunctionCompiler {
    kind: FunctionKind,
    chunk: Chunk,
    arity: u8,
    name: Option<String>,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
    loops: Vec<LoopRecord>,
}

impl FunctionCompiler {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        // Slot zero holds the callee: `this` inside methods, unnameable
        // otherwise.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            kind,
            chunk: Chunk::new(),
            arity: 0,
            name,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

struct ClassCompiler {
    has_superclass: bool,
}

pub struct Compiler<'h> {
    heap: &'h mut Heap,
    scanner: Scanner,
    current: Token,
    previous: Token,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    functions: Vec<FunctionCompiler>,
    classes: Vec<ClassCompiler>,
    /// Offset of the `Pop` ending the most recent top-level expression
    /// statement; if it is still the last instruction at EOF, the script's
    /// implicit return carries that value out to the host.
    last_expr_pop: Option<usize>,
    print_code: bool,
}

// ---------------------------------------------------------------------------
// Pratt rule table

/// Precedence levels, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    /// `=` and the compound assignment forms
    Assignment,
    /// `?:`
    Ternary,
    Or,
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=` `instanceof`
    Comparison,
    /// `+` `-`
    Term,
    /// `*` `/`
    Factor,
    /// `!` `-` and prefix `++`/`--`
    Unary,
    /// `.` `()`
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Ternary,
            Ternary => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool);

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> ParseRule {
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

#[rustfmt::skip]
fn get_rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    match kind {
        LeftParen    => rule(Some(grouping),    Some(call),    Precedence::Call),
        Dot          => rule(None,              Some(dot),     Precedence::Call),
        Minus        => rule(Some(unary),       Some(binary),  Precedence::Term),
        Plus         => rule(None,              Some(binary),  Precedence::Term),
        Slash        => rule(None,              Some(binary),  Precedence::Factor),
        Star         => rule(None,              Some(binary),  Precedence::Factor),
        Bang         => rule(Some(unary),       None,          Precedence::None),
        BangEqual    => rule(None,              Some(binary),  Precedence::Equality),
        EqualEqual   => rule(None,              Some(binary),  Precedence::Equality),
        Greater      => rule(None,              Some(binary),  Precedence::Comparison),
        GreaterEqual => rule(None,              Some(binary),  Precedence::Comparison),
        Less         => rule(None,              Some(binary),  Precedence::Comparison),
        LessEqual    => rule(None,              Some(binary),  Precedence::Comparison),
        Instanceof   => rule(None,              Some(binary),  Precedence::Comparison),
        Question     => rule(None,              Some(ternary), Precedence::Ternary),
        PlusPlus     => rule(Some(prefix_step), None,          Precedence::None),
        MinusMinus   => rule(Some(prefix_step), None,          Precedence::None),
        Identifier   => rule(Some(variable),    None,          Precedence::None),
        String       => rule(Some(string),      None,          Precedence::None),
        Number       => rule(Some(number),      None,          Precedence::None),
        And          => rule(None,              Some(and_),    Precedence::And),
        Or           => rule(None,              Some(or_),     Precedence::Or),
        True         => rule(Some(literal),     None,          Precedence::None),
        False        => rule(Some(literal),     None,          Precedence::None),
        Nil          => rule(Some(literal),     None,          Precedence::None),
        This         => rule(Some(this_),       None,          Precedence::None),
        Super        => rule(Some(super_),      None,          Precedence::None),
        _            => rule(None,              None,          Precedence::None),
    }
}

// ---------------------------------------------------------------------------
// Parser plumbing

impl<'h> Compiler<'h> {
    fn new(source: &str, heap: &'h mut Heap, print_code: bool) -> Self {
        Self {
            heap,
            scanner: Scanner::new(source),
            current: Token::new(TokenKind::Eof, "", 1),
            previous: Token::new(TokenKind::Eof, "", 1),
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            functions: vec![FunctionCompiler::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            last_expr_pop: None,
            print_code,
        }
    }

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            let token = self.current.clone();
            self.error_at(&token, &message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
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

    fn error(&mut self, message: &str) {
        let token = self.previous.clone();
        self.error_at(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current.clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = match token.kind {
            TokenKind::Eof => Some(String::new()),
            TokenKind::Error => None,
            _ => Some(token.lexeme.clone()),
        };
        self.diagnostics
            .push(Diagnostic::error(token.line, at, message));
    }

    /// Skip tokens until a statement boundary so one mistake does not
    /// cascade into a wall of spurious diagnostics.
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
                | TokenKind::Switch
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- Emission -------------------------------------------------------

    fn fun(&self) -> &FunctionCompiler {
        self.functions.last().expect("function compiler stack")
    }

    fn fun_mut(&mut self) -> &mut FunctionCompiler {
        self.functions.last_mut().expect("function compiler stack")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.fun_mut().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.fun_mut().chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, index);
    }

    /// Emit a forward jump with a placeholder operand; returns the operand
    /// offset for patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.fun().chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand itself
        let jump = self.fun().chunk.code.len() - offset - 2;
        if jump > MAX_JUMP {
            self.error("Too much code to jump over.");
        }
        self.fun_mut().chunk.code[offset] = (jump >> 8) as u8;
        self.fun_mut().chunk.code[offset + 1] = jump as u8;
    }

    fn emit_loop(&mut self, start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.fun().chunk.code.len() - start + 2;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    /// Implicit function exit: initializers return `this`, everything else
    /// returns nil.
    fn emit_return(&mut self) {
        if self.fun().kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_constant(Value::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Pop the innermost function compiler into a function object and hand
    /// back its upvalue descriptors for the enclosing `Closure` emission.
    fn pop_function(&mut self) -> (Handle, Vec<UpvalueRef>) {
        let finished = self.functions.pop().expect("function compiler stack");
        let FunctionCompiler {
            chunk,
            arity,
            name,
            upvalues,
            ..
        } = finished;
        if self.print_code && !self.had_error {
            let label = name.clone().unwrap_or_else(|| "<script>".to_string());
            eprint!("{}", disassemble(&chunk, &label, self.heap));
        }
        let name = name.map(|n| self.heap.intern(&n));
        let function = ObjFunction {
            arity,
            upvalue_count: upvalues.len(),
            chunk: Rc::new(chunk),
            name,
        };
        (self.heap.alloc(Obj::Function(function)), upvalues)
    }

    /// Finish the top-level script. If the program ended with an expression
    /// statement, drop its trailing `Pop` so the implicit return carries the
    /// value to the host; otherwise return nil as usual.
    fn finish(mut self) -> Result<Handle, Vec<Diagnostic>> {
        let retain_value = matches!(
            self.last_expr_pop,
            Some(offset) if offset + 1 == self.fun().chunk.code.len()
        );
        if retain_value {
            self.fun_mut().chunk.code.pop();
            self.fun_mut().chunk.lines.pop();
            self.emit_op(OpCode::Return);
        } else {
            self.emit_return();
        }
        let (handle, _) = self.pop_function();
        if self.had_error {
            Err(self.diagnostics)
        } else {
            Ok(handle)
        }
    }

    // ---- Scopes and variables ------------------------------------------

    fn begin_scope(&mut self) {
        self.fun_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fun_mut().scope_depth -= 1;
        loop {
            let op = {
                let f = self.fun();
                match f.locals.last() {
                    Some(local) if local.depth > f.scope_depth => Some(if local.is_captured {
                        OpCode::CloseUpvalue
                    } else {
                        OpCode::Pop
                    }),
                    _ => None,
                }
            };
            match op {
                Some(op) => {
                    self.emit_op(op);
                    self.fun_mut().locals.pop();
                }
                None => break,
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.intern(name);
        self.make_constant(Value::Obj(handle))
    }

    /// Resolve a name against one function's locals, top-down.
    fn resolve_local(&mut self, func_index: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (slot, local) in self.functions[func_index].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((slot, local.depth));
                break;
            }
        }
        let (slot, depth) = found?;
        if depth == -1 {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    /// Resolve a name against enclosing functions, capturing it as an
    /// upvalue in every function between the use and the declaration.
    fn resolve_upvalue(&mut self, func_index: usize, name: &str) -> Option<u8> {
        if func_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(func_index - 1, name) {
            self.functions[func_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(func_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(func_index - 1, name) {
            return Some(self.add_upvalue(func_index, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, func_index: usize, index: u8, is_local: bool) -> u8 {
        for (i, upvalue) in self.functions[func_index].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }
        if self.functions[func_index].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.functions[func_index]
            .upvalues
            .push(UpvalueRef { index, is_local });
        (self.functions[func_index].upvalues.len() - 1) as u8
    }

    fn add_local(&mut self, name: String) {
        if self.fun().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.fun_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.fun().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.clone();
        let mut duplicate = false;
        {
            let f = self.fun();
            for local in f.locals.iter().rev() {
                if local.depth != -1 && local.depth < f.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.fun().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.clone();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        let f = self.fun_mut();
        if f.scope_depth == 0 {
            return;
        }
        let depth = f.scope_depth;
        if let Some(local) = f.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.fun().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    /// Where does this name live? Locals first, then captured upvalues,
    /// falling through to a global by name.
    fn resolve_variable_ops(&mut self, name: &str) -> (OpCode, OpCode, u8) {
        let func_index = self.functions.len() - 1;
        if let Some(slot) = self.resolve_local(func_index, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(func_index, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        }
    }

    /// Compile a variable reference, assignment, or step. The sugar forms
    /// all expand to get/set pairs and only apply when assignment is legal
    /// at the current precedence.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op, arg) = self.resolve_variable_ops(name);

        if can_assign {
            if self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_op_byte(set_op, arg);
                return;
            }
            if let Some(op) = self.check_compound_assign() {
                self.advance();
                self.emit_op_byte(get_op, arg);
                self.expression();
                self.emit_op(op);
                self.emit_op_byte(set_op, arg);
                return;
            }
            if self.check(TokenKind::PlusPlus) || self.check(TokenKind::MinusMinus) {
                let op = if self.current.kind == TokenKind::PlusPlus {
                    OpCode::Add
                } else {
                    OpCode::Subtract
                };
                self.advance();
                // Postfix: the expression's value is the variable before the step.
                self.emit_op_byte(get_op, arg);
                self.emit_op_byte(get_op, arg);
                self.emit_constant(Value::Number(1.0));
                self.emit_op(op);
                self.emit_op_byte(set_op, arg);
                self.emit_op(OpCode::Pop);
                return;
            }
        }

        self.emit_op_byte(get_op, arg);
    }

    fn check_compound_assign(&self) -> Option<OpCode> {
        match self.current.kind {
            TokenKind::PlusEqual => Some(OpCode::Add),
            TokenKind::MinusEqual => Some(OpCode::Subtract),
            TokenKind::StarEqual => Some(OpCode::Multiply),
            TokenKind::SlashEqual => Some(OpCode::Divide),
            _ => None,
        }
    }

    // ---- Expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// The Pratt core: dispatch the prefix rule for the token just
    /// consumed, then fold infix rules while their precedence holds.
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = get_rule(self.previous.kind).prefix;
        let can_assign = precedence <= Precedence::Assignment;
        match prefix {
            Some(prefix_fn) => prefix_fn(self, can_assign),
            None => {
                self.error("Expect expression.");
                return;
            }
        }

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix_fn) = get_rule(self.previous.kind).infix {
                infix_fn(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                }
                count = count.saturating_add(1);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count
    }

    // ---- Declarations ---------------------------------------------------

    fn declaration(&mut self) {
        // Any new declaration invalidates the retained-value tracking;
        // expression_statement re-establishes it.
        self.last_expr_pop = None;
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

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_constant(Value::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Functions may refer to themselves; the name is usable in the body.
        self.mark_initialized();
        let name = self.previous.lexeme.clone();
        self.function(FunctionKind::Function, name);
        self.define_variable(global);
    }

    /// Compile a function body in a fresh function compiler, then emit the
    /// `Closure` instruction with its upvalue descriptors in the enclosing
    /// function.
    fn function(&mut self, kind: FunctionKind, name: String) {
        self.functions.push(FunctionCompiler::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.fun().arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let arity = self.fun().arity.saturating_add(1);
                self.fun_mut().arity = arity;
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

        self.emit_return();
        let (handle, upvalues) = self.pop_function();
        let constant = self.make_constant(Value::Obj(handle));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();
        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.lexeme.clone();
            self.named_variable(&superclass_name, false);
            if class_name == superclass_name {
                self.error("A class can't inherit from itself.");
            }

            // `super` is a synthetic local over the superclass value, scoped
            // to the class body.
            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self
            .classes
            .last()
            .map(|class| class.has_superclass)
            .unwrap_or(false);
        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.previous.lexeme.clone();
        let constant = self.identifier_constant(&method_name);
        let kind = if method_name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, method_name);
        self.emit_op_byte(OpCode::Method, constant);
    }

    // ---- Statements -----------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
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

    fn expression_statement(&mut self) {
        let top_level = self.functions.len() == 1 && self.fun().scope_depth == 0;
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        let offset = self.fun().chunk.code.len();
        self.emit_op(OpCode::Pop);
        if top_level {
            self.last_expr_pop = Some(offset);
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
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

    fn return_statement(&mut self) {
        if self.fun().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.fun().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.fun().chunk.code.len();
        let depth = self.fun().scope_depth;
        self.fun_mut().loops.push(LoopRecord {
            start: loop_start,
            depth,
            is_loop: true,
            breaks: Vec::new(),
        });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.finish_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.fun().chunk.code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            // The increment runs after the body: jump over it now, run the
            // body, loop back here, then take the back edge to the condition.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.fun().chunk.code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let depth = self.fun().scope_depth;
        self.fun_mut().loops.push(LoopRecord {
            start: loop_start,
            depth,
            is_loop: true,
            breaks: Vec::new(),
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.finish_loop();
        self.end_scope();
    }

    /// Compile `switch (expr) { case v: ... default: ... }`.
    ///
    /// The scrutinee is held in a hidden scoped local; each case loads it
    /// and compares. There is no fallthrough: reaching the next `case`
    /// label jumps to the end. The record registered here has `is_loop`
    /// false so `break` stops at the switch while `continue` passes it by.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.begin_scope();
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");

        self.add_local(String::new());
        self.mark_initialized();
        let slot = (self.fun().locals.len() - 1) as u8;

        let depth = self.fun().scope_depth;
        self.fun_mut().loops.push(LoopRecord {
            start: 0,
            depth,
            is_loop: false,
            breaks: Vec::new(),
        });

        self.consume(TokenKind::LeftBrace, "Expect '{' before switch cases.");

        let mut miss_jump: Option<usize> = None;
        let mut case_open = false;

        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Case) {
                if case_open {
                    self.end_case();
                }
                if let Some(miss) = miss_jump.take() {
                    self.patch_jump(miss);
                    self.emit_op(OpCode::Pop);
                }
                self.emit_op_byte(OpCode::GetLocal, slot);
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after case value.");
                self.emit_op(OpCode::Equal);
                miss_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
                self.emit_op(OpCode::Pop);
                case_open = true;
            } else if self.match_token(TokenKind::Default) {
                if case_open {
                    self.end_case();
                }
                if let Some(miss) = miss_jump.take() {
                    self.patch_jump(miss);
                    self.emit_op(OpCode::Pop);
                }
                self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
                case_open = true;
            } else if case_open {
                self.statement();
            } else {
                self.error_at_current("Expect 'case' or 'default' inside switch.");
                self.advance();
            }
        }

        if let Some(miss) = miss_jump.take() {
            self.patch_jump(miss);
            self.emit_op(OpCode::Pop);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after switch cases.");
        self.finish_loop();
        self.end_scope();
    }

    /// Close a case body: jump to the end of the switch (no fallthrough).
    fn end_case(&mut self) {
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(record) = self.fun_mut().loops.last_mut() {
            record.breaks.push(jump);
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        let depth = self.fun().loops.last().map(|record| record.depth);
        let depth = match depth {
            Some(depth) => depth,
            None => {
                self.error("Can't use 'break' outside of a loop or switch.");
                return;
            }
        };
        self.discard_locals(depth);
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(record) = self.fun_mut().loops.last_mut() {
            record.breaks.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        // The innermost real loop; switch records don't take `continue`.
        let target = self
            .fun()
            .loops
            .iter()
            .rev()
            .find(|record| record.is_loop)
            .map(|record| (record.start, record.depth));
        match target {
            Some((start, depth)) => {
                self.discard_locals(depth);
                self.emit_loop(start);
            }
            None => self.error("Can't use 'continue' outside of a loop."),
        }
    }

    /// Emit pops for locals declared deeper than `depth` without forgetting
    /// them: a jump out of a loop body leaves the declarations behind but
    /// their slots must be vacated (and captured ones closed) at runtime.
    fn discard_locals(&mut self, depth: i32) {
        let ops: Vec<OpCode> = self
            .fun()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| {
                if local.is_captured {
                    OpCode::CloseUpvalue
                } else {
                    OpCode::Pop
                }
            })
            .collect();
        for op in ops {
            self.emit_op(op);
        }
    }

    /// Pop the innermost loop record and patch its breaks to land here.
    fn finish_loop(&mut self) {
        let record = self.fun_mut().loops.pop().expect("loop record stack");
        for jump in record.breaks {
            self.patch_jump(jump);
        }
    }
}

// ---------------------------------------------------------------------------
// Pratt handlers

fn grouping(c: &mut Compiler, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn number(c: &mut Compiler, _can_assign: bool) {
    let value: f64 = c.previous.lexeme.parse().unwrap_or(0.0);
    c.emit_constant(Value::Number(value));
}

fn string(c: &mut Compiler, _can_assign: bool) {
    // Strip the surrounding quotes; the span is raw, no escapes.
    let lexeme = &c.previous.lexeme;
    let contents = lexeme[1..lexeme.len() - 1].to_string();
    let handle = c.heap.intern(&contents);
    c.emit_constant(Value::Obj(handle));
}

fn literal(c: &mut Compiler, _can_assign: bool) {
    match c.previous.kind {
        TokenKind::False => c.emit_constant(Value::Bool(false)),
        TokenKind::True => c.emit_constant(Value::Bool(true)),
        TokenKind::Nil => c.emit_constant(Value::Nil),
        _ => unreachable!("literal rule on a non-literal token"),
    }
}

fn variable(c: &mut Compiler, can_assign: bool) {
    let name = c.previous.lexeme.clone();
    c.named_variable(&name, can_assign);
}

fn unary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.previous.kind;
    c.parse_precedence(Precedence::Unary);
    match operator {
        TokenKind::Minus => c.emit_op(OpCode::Negate),
        TokenKind::Bang => c.emit_op(OpCode::Not),
        _ => unreachable!("unary rule on a non-unary token"),
    }
}

/// Prefix `++`/`--`: (get, 1, op, set), leaving the stepped value.
fn prefix_step(c: &mut Compiler, can_assign: bool) {
    let op = if c.previous.kind == TokenKind::PlusPlus {
        OpCode::Add
    } else {
        OpCode::Subtract
    };
    c.consume(TokenKind::Identifier, "Expect variable name after prefix operator.");
    if !can_assign {
        c.error("Invalid assignment target.");
        return;
    }
    let name = c.previous.lexeme.clone();
    let (get_op, set_op, arg) = c.resolve_variable_ops(&name);
    c.emit_op_byte(get_op, arg);
    c.emit_constant(Value::Number(1.0));
    c.emit_op(op);
    c.emit_op_byte(set_op, arg);
}

fn binary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.previous.kind;
    let precedence = get_rule(operator).precedence.next();
    c.parse_precedence(precedence);

    match operator {
        TokenKind::BangEqual => c.emit_ops(OpCode::Equal, OpCode::Not),
        TokenKind::EqualEqual => c.emit_op(OpCode::Equal),
        TokenKind::Greater => c.emit_op(OpCode::Greater),
        TokenKind::GreaterEqual => c.emit_ops(OpCode::Less, OpCode::Not),
        TokenKind::Less => c.emit_op(OpCode::Less),
        TokenKind::LessEqual => c.emit_ops(OpCode::Greater, OpCode::Not),
        TokenKind::Plus => c.emit_op(OpCode::Add),
        TokenKind::Minus => c.emit_op(OpCode::Subtract),
        TokenKind::Star => c.emit_op(OpCode::Multiply),
        TokenKind::Slash => c.emit_op(OpCode::Divide),
        TokenKind::Instanceof => c.emit_op(OpCode::InstanceOf),
        _ => unreachable!("binary rule on a non-binary token"),
    }
}

fn and_(c: &mut Compiler, _can_assign: bool) {
    let end_jump = c.emit_jump(OpCode::JumpIfFalse);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Precedence::And);
    c.patch_jump(end_jump);
}

fn or_(c: &mut Compiler, _can_assign: bool) {
    let else_jump = c.emit_jump(OpCode::JumpIfFalse);
    let end_jump = c.emit_jump(OpCode::Jump);
    c.patch_jump(else_jump);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Precedence::Or);
    c.patch_jump(end_jump);
}

/// `cond ? then : else`; both branches parse at assignment precedence, so
/// the operator is right-associative.
fn ternary(c: &mut Compiler, _can_assign: bool) {
    let else_jump = c.emit_jump(OpCode::JumpIfFalse);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Precedence::Assignment);
    c.consume(TokenKind::Colon, "Expect ':' after then branch of '?:'.");

    let end_jump = c.emit_jump(OpCode::Jump);
    c.patch_jump(else_jump);
    c.emit_op(OpCode::Pop);
    c.parse_precedence(Precedence::Assignment);
    c.patch_jump(end_jump);
}

fn call(c: &mut Compiler, _can_assign: bool) {
    let argc = c.argument_list();
    c.emit_op_byte(OpCode::Call, argc);
}

fn dot(c: &mut Compiler, can_assign: bool) {
    c.consume(TokenKind::Identifier, "Expect property name after '.'.");
    let name = c.previous.lexeme.clone();
    let constant = c.identifier_constant(&name);

    if can_assign && c.match_token(TokenKind::Equal) {
        c.expression();
        c.emit_op_byte(OpCode::SetProperty, constant);
    } else if c.match_token(TokenKind::LeftParen) {
        let argc = c.argument_list();
        c.emit_op_byte(OpCode::Invoke, constant);
        c.emit_byte(argc);
    } else {
        c.emit_op_byte(OpCode::GetProperty, constant);
    }
}

fn this_(c: &mut Compiler, _can_assign: bool) {
    if c.classes.is_empty() {
        c.error("Can't use 'this' outside of a class.");
        return;
    }
    c.named_variable("this", false);
}

fn super_(c: &mut Compiler, _can_assign: bool) {
    if c.classes.is_empty() {
        c.error("Can't use 'super' outside of a class.");
    } else if !c
        .classes
        .last()
        .map(|class| class.has_superclass)
        .unwrap_or(false)
    {
        c.error("Can't use 'super' in a class with no superclass.");
    }

    c.consume(TokenKind::Dot, "Expect '.' after 'super'.");
    c.consume(TokenKind::Identifier, "Expect superclass method name.");
    let name = c.previous.lexeme.clone();
    let constant = c.identifier_constant(&name);

    c.named_variable("this", false);
    if c.match_token(TokenKind::LeftParen) {
        let argc = c.argument_list();
        c.named_variable("super", false);
        c.emit_op_byte(OpCode::SuperInvoke, constant);
        c.emit_byte(argc);
    } else {
        c.named_variable("super", false);
        c.emit_op_byte(OpCode::GetSuper, constant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn compile_ok(source: &str) -> (Heap, Handle) {
        let mut heap = Heap::default();
        let handle = compile(source, &mut heap, false).expect("compile failed");
        (heap, handle)
    }

    fn compile_err(source: &str) -> Vec<Diagnostic> {
        let mut heap = Heap::default();
        compile(source, &mut heap, false).expect_err("compile unexpectedly succeeded")
    }

    fn script_chunk(heap: &Heap, handle: Handle) -> Rc<Chunk> {
        match heap.get(handle) {
            Obj::Function(f) => f.chunk.clone(),
            other => panic!("expected function, found {:?}", other),
        }
    }

    #[test]
    fn test_compiles_arithmetic() {
        let (heap, handle) = compile_ok("1 + 2 * 3;");
        let chunk = script_chunk(&heap, handle);
        let listing = disassemble(&chunk, "script", &heap);
        assert!(listing.contains("Add"));
        assert!(listing.contains("Multiply"));
        // Multiplication binds tighter: it is emitted before the addition.
        assert!(listing.find("Multiply") < listing.find("Add"));
    }

    #[test]
    fn test_trailing_expression_retains_value() {
        // The final Pop is dropped so the host can read the value.
        let (heap, handle) = compile_ok("1 + 2;");
        let chunk = script_chunk(&heap, handle);
        assert_eq!(chunk.code.last(), Some(&(OpCode::Return as u8)));
        let listing = disassemble(&chunk, "script", &heap);
        assert!(!listing.contains("Pop"));
    }

    #[test]
    fn test_declaration_does_not_retain_value() {
        let (heap, handle) = compile_ok("var x = 1;");
        let chunk = script_chunk(&heap, handle);
        let listing = disassemble(&chunk, "script", &heap);
        // Implicit nil return after a declaration-only script.
        assert!(listing.contains("DefineGlobal"));
        assert!(listing.contains("'nil'"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let diags = compile_err("1 + 2 = 3;");
        assert_eq!(diags.len(), 1);
        assert_eq!(
            diags[0].to_string(),
            "[line 1] Error at '=': Invalid assignment target."
        );
    }

    #[test]
    fn test_return_at_top_level_is_an_error() {
        let diags = compile_err("return 1;");
        assert!(diags[0].message.contains("Can't return from top-level code."));
    }

    #[test]
    fn test_this_outside_class() {
        let diags = compile_err("print this;");
        assert!(diags[0].message.contains("Can't use 'this' outside of a class."));
    }

    #[test]
    fn test_super_without_superclass() {
        let diags = compile_err("class A { method() { return super.method(); } }");
        assert!(diags[0]
            .message
            .contains("Can't use 'super' in a class with no superclass."));
    }

    #[test]
    fn test_duplicate_local_declaration() {
        let diags = compile_err("{ var a = 1; var a = 2; }");
        assert!(diags[0]
            .message
            .contains("Already a variable with this name in this scope."));
    }

    #[test]
    fn test_read_in_own_initializer() {
        let diags = compile_err("{ var a = 1; { var a = a; } }");
        assert!(diags[0]
            .message
            .contains("Can't read local variable in its own initializer."));
    }

    #[test]
    fn test_break_outside_loop() {
        let diags = compile_err("break;");
        assert!(diags[0]
            .message
            .contains("Can't use 'break' outside of a loop or switch."));
    }

    #[test]
    fn test_continue_outside_loop() {
        let diags = compile_err("continue;");
        assert!(diags[0]
            .message
            .contains("Can't use 'continue' outside of a loop."));
    }

    #[test]
    fn test_class_cannot_inherit_from_itself() {
        let diags = compile_err("class A < A {}");
        assert!(diags[0].message.contains("A class can't inherit from itself."));
    }

    #[test]
    fn test_panic_mode_recovers_at_statement_boundary() {
        // Two independent mistakes produce two diagnostics, not a cascade.
        let diags = compile_err("var 1 = 2;\nvar 3 = 4;");
        assert_eq!(diags.len(), 2);
        assert!(diags.iter().all(|d| d.message == "Expect variable name."));
    }

    #[test]
    fn test_closure_emission_captures_local() {
        let (heap, handle) = compile_ok(
            "fun outer() { var a = 1; fun inner() { return a; } return inner; }",
        );
        let chunk = script_chunk(&heap, handle);
        // The outer function is a constant of the script chunk; its chunk in
        // turn carries the Closure instruction with one captured local.
        let outer = chunk
            .constants
            .iter()
            .find_map(|v| match v {
                Value::Obj(h) => match heap.get(*h) {
                    Obj::Function(f) if f.name.is_some() => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function constant");
        let listing = disassemble(&outer.chunk, "outer", &heap);
        assert!(listing.contains("Closure"));
        assert!(listing.contains("local 1"));
    }

    #[test]
    fn test_too_many_constants_reports_error() {
        // 257 distinct number literals overflow the 8-bit constant pool.
        let mut source = String::from("var a = 0");
        for i in 1..300 {
            source.push_str(&format!(" + {}", i));
        }
        source.push(';');
        let diags = compile_err(&source);
        assert!(diags[0].message.contains("Too many constants in one chunk."));
    }
}
