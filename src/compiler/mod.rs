//! Lowers swc's ECMAScript AST to VM opcodes
//!
//! Locals live in heap scope objects, so closures need no capture analysis:
//! a function simply remembers the scope it was created in. Function
//! declarations are hoisted to the top of their body.
//!
//! `finally` blocks are emitted once per exit path (normal completion and
//! rethrow). `break`, `continue` and `return` leave a protected region
//! without running its `finally` block.

use swc_common::{FileName, SourceMap, Span, Spanned, sync::Lrc};
use swc_ecma_ast::*;
use swc_ecma_parser::{Parser, StringInput, Syntax, lexer::Lexer};
use thiserror::Error;

use crate::vm::coerce::number_to_string;
use crate::vm::opcodes::OpCode;
use crate::vm::value::JsValue;

/// A source that failed to parse or uses syntax the VM cannot run.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} (line {line}, column {column})")]
pub struct CompileError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

/// Codegen failure, positioned by span until mapped onto the source.
#[derive(Debug)]
pub struct CodegenError {
    pub message: String,
    pub span: Span,
}

type GenResult<T = ()> = Result<T, CodegenError>;

fn unsupported(what: &str, span: Span) -> CodegenError {
    CodegenError {
        message: format!("unsupported syntax: {}", what),
        span,
    }
}

/// Compile a script.
///
/// A source that is not a valid script but is a single expression, such as
/// an anonymous `function (api) { ... }`, compiles to that expression.
pub fn compile(source: &str) -> Result<Vec<OpCode>, CompileError> {
    let cm: Lrc<SourceMap> = Default::default();
    let script = match parse_script(&cm, source) {
        Ok(script) => script,
        Err(err) => {
            let trimmed = source.trim_end().trim_end_matches(';');
            match parse_script(&cm, &format!("({}\n)", trimmed)) {
                Ok(script) if is_single_expression(&script) => script,
                _ => return Err(locate(&cm, err)),
            }
        }
    };
    Codegen::new()
        .generate(&script)
        .map_err(|err| locate(&cm, err))
}

fn parse_script(cm: &Lrc<SourceMap>, source: &str) -> GenResult<Script> {
    let fm = cm.new_source_file(FileName::Custom("script.js".into()).into(), source.to_string());
    let lexer = Lexer::new(
        Syntax::Es(Default::default()),
        Default::default(),
        StringInput::from(&*fm),
        None,
    );
    let mut parser = Parser::new_from(lexer);
    let script = parser.parse_script().map_err(|e| CodegenError {
        message: e.kind().msg().to_string(),
        span: e.span(),
    })?;
    if let Some(e) = parser.take_errors().into_iter().next() {
        return Err(CodegenError {
            message: e.kind().msg().to_string(),
            span: e.span(),
        });
    }
    Ok(script)
}

fn is_single_expression(script: &Script) -> bool {
    matches!(script.body.as_slice(), [Stmt::Expr(_)])
}

fn locate(cm: &Lrc<SourceMap>, err: CodegenError) -> CompileError {
    let (line, column) = if err.span.lo.0 == 0 {
        (0, 0)
    } else {
        let loc = cm.lookup_char_pos(err.span.lo);
        (loc.line, loc.col.0 + 1)
    };
    CompileError {
        message: err.message,
        line,
        column,
    }
}

/// Jump sites of one breakable statement, patched once its end is known.
struct LoopContext {
    label: Option<String>,
    /// Labeled blocks accept `break` only.
    is_loop: bool,
    /// Protected regions open when the statement was entered.
    try_depth: usize,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

pub struct Codegen {
    pub instructions: Vec<OpCode>,
    in_function: bool,
    loops: Vec<LoopContext>,
    try_depth: usize,
    /// Label waiting to be claimed by the loop it is attached to.
    pending_label: Option<String>,
}

impl Default for Codegen {
    fn default() -> Self {
        Self::new()
    }
}

impl Codegen {
    pub fn new() -> Self {
        Self {
            instructions: Vec::new(),
            in_function: false,
            loops: Vec::new(),
            try_depth: 0,
            pending_label: None,
        }
    }

    /// Top-level code leaves the last expression statement's value as the
    /// program result.
    pub fn generate(&mut self, script: &Script) -> GenResult<Vec<OpCode>> {
        self.gen_body(&script.body)?;
        self.emit(OpCode::LoadCompletion);
        self.emit(OpCode::Return);
        Ok(std::mem::take(&mut self.instructions))
    }

    fn emit(&mut self, op: OpCode) -> usize {
        self.instructions.push(op);
        self.instructions.len() - 1
    }

    fn here(&self) -> usize {
        self.instructions.len()
    }

    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.instructions[at] {
            OpCode::Jump(addr) | OpCode::JumpIfFalse(addr) | OpCode::JumpIfTrue(addr) => {
                *addr = target
            }
            OpCode::SetupTry { catch_addr } => *catch_addr = target,
            _ => {}
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Function or script body: declarations first, then the rest in order.
    fn gen_body(&mut self, stmts: &[Stmt]) -> GenResult {
        for stmt in stmts {
            if let Stmt::Decl(Decl::Fn(fn_decl)) = stmt {
                self.gen_fn_decl(fn_decl)?;
            }
        }
        for stmt in stmts {
            if !matches!(stmt, Stmt::Decl(Decl::Fn(_))) {
                self.gen_stmt(stmt)?;
            }
        }
        Ok(())
    }

    fn gen_fn_decl(&mut self, fn_decl: &FnDecl) -> GenResult {
        let name = fn_decl.ident.sym.to_string();
        self.gen_function(&fn_decl.function, name.clone())?;
        self.emit(OpCode::Declare(name));
        Ok(())
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> GenResult {
        match stmt {
            Stmt::Expr(expr_stmt) => {
                self.gen_expr(&expr_stmt.expr)?;
                // Only top-level statements feed the program result.
                if self.in_function {
                    self.emit(OpCode::Pop);
                } else {
                    self.emit(OpCode::Completion);
                }
            }
            Stmt::Decl(Decl::Var(var_decl)) => self.gen_var_decl(var_decl)?,
            Stmt::Decl(Decl::Fn(fn_decl)) => self.gen_fn_decl(fn_decl)?,
            Stmt::Block(block) => {
                for s in &block.stmts {
                    self.gen_stmt(s)?;
                }
            }
            Stmt::Empty(_) => {}
            Stmt::Return(ret_stmt) => {
                if !self.in_function {
                    return Err(unsupported("return outside of a function", ret_stmt.span));
                }
                match &ret_stmt.arg {
                    Some(arg) => self.gen_expr(arg)?,
                    None => {
                        self.emit(OpCode::Push(JsValue::Undefined));
                    }
                }
                self.emit(OpCode::Return);
            }
            Stmt::If(if_stmt) => {
                self.gen_expr(&if_stmt.test)?;
                let to_else = self.emit(OpCode::JumpIfFalse(0));
                self.gen_stmt(&if_stmt.cons)?;
                match &if_stmt.alt {
                    Some(alt) => {
                        let to_end = self.emit(OpCode::Jump(0));
                        let else_start = self.here();
                        self.patch(to_else, else_start);
                        self.gen_stmt(alt)?;
                        let end = self.here();
                        self.patch(to_end, end);
                    }
                    None => {
                        let end = self.here();
                        self.patch(to_else, end);
                    }
                }
            }
            Stmt::While(while_stmt) => {
                self.enter_loop(true);
                let loop_start = self.here();
                self.gen_expr(&while_stmt.test)?;
                let exit_jump = self.emit(OpCode::JumpIfFalse(0));
                self.gen_stmt(&while_stmt.body)?;
                self.emit(OpCode::Jump(loop_start));
                let loop_end = self.here();
                self.patch(exit_jump, loop_end);
                self.exit_loop(loop_start, loop_end);
            }
            Stmt::DoWhile(do_while) => {
                self.enter_loop(true);
                let loop_start = self.here();
                self.gen_stmt(&do_while.body)?;
                let continue_target = self.here();
                self.gen_expr(&do_while.test)?;
                self.emit(OpCode::JumpIfTrue(loop_start));
                let loop_end = self.here();
                self.exit_loop(continue_target, loop_end);
            }
            Stmt::For(for_stmt) => {
                match &for_stmt.init {
                    Some(VarDeclOrExpr::VarDecl(var_decl)) => self.gen_var_decl(var_decl)?,
                    Some(VarDeclOrExpr::Expr(expr)) => {
                        self.gen_expr(expr)?;
                        self.emit(OpCode::Pop);
                    }
                    None => {}
                }
                self.enter_loop(true);
                let loop_start = self.here();
                let exit_jump = match &for_stmt.test {
                    Some(test) => {
                        self.gen_expr(test)?;
                        Some(self.emit(OpCode::JumpIfFalse(0)))
                    }
                    None => None,
                };
                self.gen_stmt(&for_stmt.body)?;
                let continue_target = self.here();
                if let Some(update) = &for_stmt.update {
                    self.gen_expr(update)?;
                    self.emit(OpCode::Pop);
                }
                self.emit(OpCode::Jump(loop_start));
                let loop_end = self.here();
                if let Some(exit_jump) = exit_jump {
                    self.patch(exit_jump, loop_end);
                }
                self.exit_loop(continue_target, loop_end);
            }
            Stmt::Labeled(labeled) => {
                let label = labeled.label.sym.to_string();
                match &*labeled.body {
                    Stmt::While(_) | Stmt::DoWhile(_) | Stmt::For(_) => {
                        self.pending_label = Some(label);
                        self.gen_stmt(&labeled.body)?;
                    }
                    body => {
                        self.pending_label = Some(label);
                        self.enter_loop(false);
                        self.gen_stmt(body)?;
                        let end = self.here();
                        self.exit_loop(end, end);
                    }
                }
            }
            Stmt::Break(break_stmt) => {
                let label = break_stmt.label.as_ref().map(|l| l.sym.to_string());
                let idx = self
                    .find_loop(label.as_deref(), false)
                    .ok_or_else(|| unsupported("break outside of a loop", break_stmt.span))?;
                let jump = self.emit_loop_exit(idx);
                self.loops[idx].breaks.push(jump);
            }
            Stmt::Continue(continue_stmt) => {
                let label = continue_stmt.label.as_ref().map(|l| l.sym.to_string());
                let idx = self
                    .find_loop(label.as_deref(), true)
                    .ok_or_else(|| unsupported("continue outside of a loop", continue_stmt.span))?;
                let jump = self.emit_loop_exit(idx);
                self.loops[idx].continues.push(jump);
            }
            Stmt::Throw(throw_stmt) => {
                self.gen_expr(&throw_stmt.arg)?;
                self.emit(OpCode::Throw);
            }
            Stmt::Try(try_stmt) => self.gen_try(try_stmt)?,
            other => return Err(unsupported("statement", other.span())),
        }
        Ok(())
    }

    fn gen_var_decl(&mut self, var_decl: &VarDecl) -> GenResult {
        for decl in &var_decl.decls {
            let Pat::Ident(binding) = &decl.name else {
                return Err(unsupported("destructuring declaration", decl.span));
            };
            match &decl.init {
                Some(init) => self.gen_expr(init)?,
                None => {
                    self.emit(OpCode::Push(JsValue::Undefined));
                }
            }
            self.emit(OpCode::Declare(binding.id.sym.to_string()));
        }
        Ok(())
    }

    /// Layout:
    /// ```text
    ///     SetupTry(catch)   block   PopTry   [finally]   Jump(end)
    /// catch:                                   ; [exception]
    ///     bind param
    ///     SetupTry(rethrow) handler PopTry   [finally]   Jump(end)
    /// rethrow:
    ///     [finally]   Throw
    /// end:
    /// ```
    /// Without a catch clause the exception goes straight to `rethrow`;
    /// without a finally block the handler is not protected.
    fn gen_try(&mut self, try_stmt: &TryStmt) -> GenResult {
        let finalizer = try_stmt.finalizer.as_ref();
        let mut to_end = Vec::new();

        let setup = self.emit(OpCode::SetupTry { catch_addr: 0 });
        self.try_depth += 1;
        self.gen_block(&try_stmt.block)?;
        self.try_depth -= 1;
        self.emit(OpCode::PopTry);
        if let Some(finalizer) = finalizer {
            self.gen_block(finalizer)?;
        }
        to_end.push(self.emit(OpCode::Jump(0)));

        let catch_start = self.here();
        self.patch(setup, catch_start);

        if let Some(handler) = &try_stmt.handler {
            match &handler.param {
                Some(Pat::Ident(binding)) => {
                    self.emit(OpCode::Declare(binding.id.sym.to_string()));
                }
                Some(other) => return Err(unsupported("catch binding pattern", other.span())),
                None => {
                    self.emit(OpCode::Pop);
                }
            }
            match finalizer {
                Some(finalizer) => {
                    let protect = self.emit(OpCode::SetupTry { catch_addr: 0 });
                    self.try_depth += 1;
                    self.gen_block(&handler.body)?;
                    self.try_depth -= 1;
                    self.emit(OpCode::PopTry);
                    self.gen_block(finalizer)?;
                    to_end.push(self.emit(OpCode::Jump(0)));

                    let rethrow = self.here();
                    self.patch(protect, rethrow);
                    self.gen_block(finalizer)?;
                    self.emit(OpCode::Throw);
                }
                None => self.gen_block(&handler.body)?,
            }
        } else if let Some(finalizer) = finalizer {
            self.gen_block(finalizer)?;
            self.emit(OpCode::Throw);
        }

        let end = self.here();
        for jump in to_end {
            self.patch(jump, end);
        }
        Ok(())
    }

    fn gen_block(&mut self, block: &BlockStmt) -> GenResult {
        for stmt in &block.stmts {
            self.gen_stmt(stmt)?;
        }
        Ok(())
    }

    fn enter_loop(&mut self, is_loop: bool) {
        self.loops.push(LoopContext {
            label: self.pending_label.take(),
            is_loop,
            try_depth: self.try_depth,
            breaks: Vec::new(),
            continues: Vec::new(),
        });
    }

    fn exit_loop(&mut self, continue_target: usize, end: usize) {
        if let Some(ctx) = self.loops.pop() {
            for jump in ctx.breaks {
                self.patch(jump, end);
            }
            for jump in ctx.continues {
                self.patch(jump, continue_target);
            }
        }
    }

    fn find_loop(&self, label: Option<&str>, is_continue: bool) -> Option<usize> {
        self.loops.iter().rposition(|ctx| match label {
            Some(label) => ctx.label.as_deref() == Some(label) && (ctx.is_loop || !is_continue),
            None => ctx.is_loop,
        })
    }

    /// Close the protected regions opened inside the target loop, then jump.
    fn emit_loop_exit(&mut self, idx: usize) -> usize {
        for _ in self.loops[idx].try_depth..self.try_depth {
            self.emit(OpCode::PopTry);
        }
        self.emit(OpCode::Jump(0))
    }

    // =========================================================================
    // Functions
    // =========================================================================

    fn gen_function(&mut self, function: &Function, name: String) -> GenResult {
        if function.is_async || function.is_generator {
            return Err(unsupported("async or generator function", function.span));
        }
        let params: Vec<&Pat> = function.params.iter().map(|p| &p.pat).collect();
        let body = function
            .body
            .as_ref()
            .ok_or_else(|| unsupported("function without body", function.span))?;
        self.gen_function_body(&params, FunctionBody::Block(body), name, false)
    }

    /// Emits the body out of line, jumped over, followed by the
    /// `MakeFunction` that closes over the current scope.
    fn gen_function_body(
        &mut self,
        params: &[&Pat],
        body: FunctionBody<'_>,
        name: String,
        arrow: bool,
    ) -> GenResult {
        let mut names = Vec::with_capacity(params.len());
        let mut defaults = Vec::new();
        for param in params {
            match param {
                Pat::Ident(binding) => names.push(binding.id.sym.to_string()),
                Pat::Assign(assign) => {
                    let Pat::Ident(binding) = &*assign.left else {
                        return Err(unsupported("parameter pattern", assign.span));
                    };
                    let param_name = binding.id.sym.to_string();
                    names.push(param_name.clone());
                    defaults.push((param_name, &assign.right));
                }
                other => return Err(unsupported("parameter pattern", other.span())),
            }
        }

        let skip_body = self.emit(OpCode::Jump(0));
        let address = self.here();

        let outer_in_function = std::mem::replace(&mut self.in_function, true);
        let outer_loops = std::mem::take(&mut self.loops);
        let outer_try_depth = std::mem::replace(&mut self.try_depth, 0);

        let result = (|| -> GenResult {
            for (param, default) in defaults {
                self.emit(OpCode::Load(param.clone()));
                self.emit(OpCode::Push(JsValue::Undefined));
                self.emit(OpCode::Eq);
                let skip = self.emit(OpCode::JumpIfFalse(0));
                self.gen_expr(default)?;
                self.emit(OpCode::Store(param));
                let after = self.here();
                self.patch(skip, after);
            }
            match body {
                FunctionBody::Block(block) => {
                    self.gen_body(&block.stmts)?;
                    self.emit(OpCode::Push(JsValue::Undefined));
                }
                FunctionBody::Expr(expr) => self.gen_expr(expr)?,
            }
            self.emit(OpCode::Return);
            Ok(())
        })();

        self.in_function = outer_in_function;
        self.loops = outer_loops;
        self.try_depth = outer_try_depth;
        result?;

        let after_body = self.here();
        self.patch(skip_body, after_body);
        self.emit(OpCode::MakeFunction {
            address,
            params: names,
            name,
            arrow,
        });
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn gen_expr(&mut self, expr: &Expr) -> GenResult {
        match expr {
            Expr::Lit(lit) => self.gen_lit(lit)?,
            Expr::Tpl(tpl) => {
                self.emit(OpCode::Push(JsValue::String(String::new())));
                for (i, quasi) in tpl.quasis.iter().enumerate() {
                    let text = match &quasi.cooked {
                        Some(cooked) => cooked.to_string_lossy().to_string(),
                        None => quasi.raw.to_string(),
                    };
                    if !text.is_empty() {
                        self.emit(OpCode::Push(JsValue::String(text)));
                        self.emit(OpCode::Add);
                    }
                    if let Some(e) = tpl.exprs.get(i) {
                        self.gen_expr(e)?;
                        self.emit(OpCode::Add);
                    }
                }
            }
            Expr::Ident(id) => {
                let op = match &*id.sym {
                    "undefined" => OpCode::Push(JsValue::Undefined),
                    "NaN" => OpCode::Push(JsValue::Number(f64::NAN)),
                    "Infinity" => OpCode::Push(JsValue::Number(f64::INFINITY)),
                    name => OpCode::Load(name.to_string()),
                };
                self.emit(op);
            }
            Expr::This(_) => {
                self.emit(OpCode::LoadThis);
            }
            Expr::Paren(paren) => self.gen_expr(&paren.expr)?,
            Expr::Seq(seq) => {
                for (i, e) in seq.exprs.iter().enumerate() {
                    self.gen_expr(e)?;
                    if i + 1 < seq.exprs.len() {
                        self.emit(OpCode::Pop);
                    }
                }
            }
            Expr::Array(arr_lit) => {
                self.emit(OpCode::NewArray);
                for elem in &arr_lit.elems {
                    match elem {
                        Some(ExprOrSpread {
                            spread: Some(span), ..
                        }) => return Err(unsupported("spread element", *span)),
                        Some(elem) => self.gen_expr(&elem.expr)?,
                        None => {
                            self.emit(OpCode::Push(JsValue::Undefined));
                        }
                    }
                    self.emit(OpCode::ArrayPush);
                }
            }
            Expr::Object(obj_lit) => self.gen_object(obj_lit)?,
            Expr::Fn(fn_expr) => {
                let name = fn_expr
                    .ident
                    .as_ref()
                    .map(|id| id.sym.to_string())
                    .unwrap_or_default();
                self.gen_function(&fn_expr.function, name)?;
            }
            Expr::Arrow(arrow) => {
                if arrow.is_async || arrow.is_generator {
                    return Err(unsupported("async arrow function", arrow.span));
                }
                let params: Vec<&Pat> = arrow.params.iter().collect();
                let body = match &*arrow.body {
                    BlockStmtOrExpr::BlockStmt(block) => FunctionBody::Block(block),
                    BlockStmtOrExpr::Expr(e) => FunctionBody::Expr(e),
                };
                self.gen_function_body(&params, body, String::new(), true)?;
            }
            Expr::Unary(unary) => self.gen_unary(unary)?,
            Expr::Update(update) => self.gen_update(update)?,
            Expr::Bin(bin) => self.gen_binary(bin)?,
            Expr::Assign(assign) => self.gen_assign(assign)?,
            Expr::Member(member) => {
                self.gen_expr(&member.obj)?;
                self.gen_member_get(&member.prop)?;
            }
            Expr::Cond(cond) => {
                self.gen_expr(&cond.test)?;
                let to_alt = self.emit(OpCode::JumpIfFalse(0));
                self.gen_expr(&cond.cons)?;
                let to_end = self.emit(OpCode::Jump(0));
                let alt_start = self.here();
                self.patch(to_alt, alt_start);
                self.gen_expr(&cond.alt)?;
                let end = self.here();
                self.patch(to_end, end);
            }
            Expr::Call(call) => {
                let Callee::Expr(callee) = &call.callee else {
                    return Err(unsupported("super or import call", call.span));
                };
                match &**callee {
                    // Method call: the object doubles as `this`.
                    Expr::Member(member) => {
                        self.gen_expr(&member.obj)?;
                        self.emit(OpCode::Dup);
                        self.gen_member_get(&member.prop)?;
                    }
                    other => {
                        self.emit(OpCode::Push(JsValue::Undefined));
                        self.gen_expr(other)?;
                    }
                }
                let argc = self.gen_args(&call.args)?;
                self.emit(OpCode::Call(argc));
            }
            Expr::New(new_expr) => {
                self.gen_expr(&new_expr.callee)?;
                let argc = match &new_expr.args {
                    Some(args) => self.gen_args(args)?,
                    None => 0,
                };
                self.emit(OpCode::Construct(argc));
            }
            other => return Err(unsupported("expression", other.span())),
        }
        Ok(())
    }

    fn gen_lit(&mut self, lit: &Lit) -> GenResult {
        let value = match lit {
            Lit::Num(num) => JsValue::Number(num.value),
            Lit::Str(s) => JsValue::String(s.value.to_string_lossy().to_string()),
            Lit::Bool(b) => JsValue::Boolean(b.value),
            Lit::Null(_) => JsValue::Null,
            other => return Err(unsupported("literal", other.span())),
        };
        self.emit(OpCode::Push(value));
        Ok(())
    }

    fn gen_object(&mut self, obj_lit: &ObjectLit) -> GenResult {
        self.emit(OpCode::NewObject);
        for prop in &obj_lit.props {
            let PropOrSpread::Prop(prop) = prop else {
                return Err(unsupported("object spread", obj_lit.span));
            };
            self.emit(OpCode::Dup);
            match &**prop {
                Prop::KeyValue(kv) => {
                    let key = self.gen_prop_key(&kv.key)?;
                    self.gen_expr(&kv.value)?;
                    self.emit_prop_store(key);
                }
                Prop::Shorthand(id) => {
                    let name = id.sym.to_string();
                    self.emit(OpCode::Load(name.clone()));
                    self.emit(OpCode::SetProp(name));
                }
                Prop::Method(method) => {
                    let key = self.gen_prop_key(&method.key)?;
                    let name = key.clone().unwrap_or_default();
                    self.gen_function(&method.function, name)?;
                    self.emit_prop_store(key);
                }
                other => return Err(unsupported("accessor property", other.span())),
            }
            self.emit(OpCode::Pop);
        }
        Ok(())
    }

    /// Static keys are returned; computed keys are pushed and yield `None`.
    fn gen_prop_key(&mut self, key: &PropName) -> GenResult<Option<String>> {
        Ok(Some(match key {
            PropName::Ident(id) => id.sym.to_string(),
            PropName::Str(s) => s.value.to_string_lossy().to_string(),
            PropName::Num(n) => number_to_string(n.value),
            PropName::Computed(computed) => {
                self.gen_expr(&computed.expr)?;
                return Ok(None);
            }
            PropName::BigInt(big) => return Err(unsupported("bigint key", big.span)),
        }))
    }

    fn emit_prop_store(&mut self, key: Option<String>) {
        match key {
            Some(key) => self.emit(OpCode::SetProp(key)),
            None => self.emit(OpCode::SetPropComputed),
        };
    }

    fn gen_member_get(&mut self, prop: &MemberProp) -> GenResult {
        match prop {
            MemberProp::Ident(id) => {
                self.emit(OpCode::GetProp(id.sym.to_string()));
            }
            MemberProp::Computed(computed) => {
                self.gen_expr(&computed.expr)?;
                self.emit(OpCode::GetPropComputed);
            }
            MemberProp::PrivateName(private) => {
                return Err(unsupported("private name", private.span));
            }
        }
        Ok(())
    }

    fn gen_args(&mut self, args: &[ExprOrSpread]) -> GenResult<usize> {
        for arg in args {
            if let Some(span) = arg.spread {
                return Err(unsupported("spread argument", span));
            }
            self.gen_expr(&arg.expr)?;
        }
        Ok(args.len())
    }

    fn gen_unary(&mut self, unary: &UnaryExpr) -> GenResult {
        if unary.op == UnaryOp::TypeOf
            && let Expr::Ident(id) = &*unary.arg
        {
            self.emit(OpCode::TypeOfName(id.sym.to_string()));
            return Ok(());
        }
        self.gen_expr(&unary.arg)?;
        match unary.op {
            UnaryOp::Minus => self.emit(OpCode::Neg),
            UnaryOp::Plus => self.emit(OpCode::Plus),
            UnaryOp::Bang => self.emit(OpCode::Not),
            UnaryOp::Tilde => self.emit(OpCode::BitNot),
            UnaryOp::TypeOf => self.emit(OpCode::TypeOf),
            UnaryOp::Void => {
                self.emit(OpCode::Pop);
                self.emit(OpCode::Push(JsValue::Undefined))
            }
            UnaryOp::Delete => return Err(unsupported("delete", unary.span)),
        };
        Ok(())
    }

    /// `x++` is lowered as `++x - 1`, which is equal after the ToNumber.
    fn gen_update(&mut self, update: &UpdateExpr) -> GenResult {
        let (step, undo) = match update.op {
            UpdateOp::PlusPlus => (OpCode::Add, OpCode::Sub),
            UpdateOp::MinusMinus => (OpCode::Sub, OpCode::Add),
        };
        let one = || OpCode::Push(JsValue::Number(1.0));
        match &*update.arg {
            Expr::Ident(id) => {
                let name = id.sym.to_string();
                self.emit(OpCode::Load(name.clone()));
                self.emit(OpCode::Plus);
                self.emit(one());
                self.emit(step);
                self.emit(OpCode::Dup);
                self.emit(OpCode::Store(name));
            }
            Expr::Member(member) => {
                self.gen_expr(&member.obj)?;
                match &member.prop {
                    MemberProp::Ident(id) => {
                        let name = id.sym.to_string();
                        self.emit(OpCode::Dup);
                        self.emit(OpCode::GetProp(name.clone()));
                        self.emit(OpCode::Plus);
                        self.emit(one());
                        self.emit(step);
                        self.emit(OpCode::SetProp(name));
                    }
                    MemberProp::Computed(computed) => {
                        self.gen_expr(&computed.expr)?;
                        self.emit(OpCode::Dup2);
                        self.emit(OpCode::GetPropComputed);
                        self.emit(OpCode::Plus);
                        self.emit(one());
                        self.emit(step);
                        self.emit(OpCode::SetPropComputed);
                    }
                    MemberProp::PrivateName(private) => {
                        return Err(unsupported("private name", private.span));
                    }
                }
            }
            other => return Err(unsupported("update target", other.span())),
        }
        if !update.prefix {
            self.emit(one());
            self.emit(undo);
        }
        Ok(())
    }

    fn gen_binary(&mut self, bin: &BinExpr) -> GenResult {
        match bin.op {
            BinaryOp::LogicalAnd | BinaryOp::LogicalOr => {
                self.gen_expr(&bin.left)?;
                self.emit(OpCode::Dup);
                let short_circuit = if bin.op == BinaryOp::LogicalAnd {
                    self.emit(OpCode::JumpIfFalse(0))
                } else {
                    self.emit(OpCode::JumpIfTrue(0))
                };
                self.emit(OpCode::Pop);
                self.gen_expr(&bin.right)?;
                let end = self.here();
                self.patch(short_circuit, end);
                return Ok(());
            }
            BinaryOp::NullishCoalescing => {
                self.gen_expr(&bin.left)?;
                self.emit(OpCode::Dup);
                self.emit(OpCode::Push(JsValue::Null));
                self.emit(OpCode::EqEq);
                let keep_left = self.emit(OpCode::JumpIfFalse(0));
                self.emit(OpCode::Pop);
                self.gen_expr(&bin.right)?;
                let end = self.here();
                self.patch(keep_left, end);
                return Ok(());
            }
            _ => {}
        }
        self.gen_expr(&bin.left)?;
        self.gen_expr(&bin.right)?;
        let op = binary_opcode(bin.op)
            .ok_or_else(|| unsupported(&format!("operator {:?}", bin.op), bin.span))?;
        self.emit(op);
        Ok(())
    }

    fn gen_assign(&mut self, assign: &AssignExpr) -> GenResult {
        let compound = match assign.op {
            AssignOp::Assign => None,
            op => match compound_opcode(op) {
                Some(opcode) => Some(opcode),
                None => return Err(unsupported("logical assignment", assign.span)),
            },
        };
        let AssignTarget::Simple(target) = &assign.left else {
            return Err(unsupported("destructuring assignment", assign.span));
        };
        match target {
            SimpleAssignTarget::Ident(binding) => {
                let name = binding.id.sym.to_string();
                if let Some(opcode) = compound {
                    self.emit(OpCode::Load(name.clone()));
                    self.gen_expr(&assign.right)?;
                    self.emit(opcode);
                } else {
                    self.gen_expr(&assign.right)?;
                }
                self.emit(OpCode::Dup);
                self.emit(OpCode::Store(name));
            }
            SimpleAssignTarget::Member(member) => {
                self.gen_expr(&member.obj)?;
                let key = match &member.prop {
                    MemberProp::Ident(id) => Some(id.sym.to_string()),
                    MemberProp::Computed(computed) => {
                        self.gen_expr(&computed.expr)?;
                        None
                    }
                    MemberProp::PrivateName(private) => {
                        return Err(unsupported("private name", private.span));
                    }
                };
                if let Some(opcode) = compound {
                    match &key {
                        Some(name) => {
                            self.emit(OpCode::Dup);
                            self.emit(OpCode::GetProp(name.clone()));
                        }
                        None => {
                            self.emit(OpCode::Dup2);
                            self.emit(OpCode::GetPropComputed);
                        }
                    }
                    self.gen_expr(&assign.right)?;
                    self.emit(opcode);
                } else {
                    self.gen_expr(&assign.right)?;
                }
                self.emit_prop_store(key);
            }
            SimpleAssignTarget::Paren(paren) => {
                return Err(unsupported("parenthesized assignment target", paren.span));
            }
            other => return Err(unsupported("assignment target", other.span())),
        }
        Ok(())
    }
}

/// Body of a function or arrow function.
enum FunctionBody<'a> {
    Block(&'a BlockStmt),
    Expr(&'a Expr),
}

fn binary_opcode(op: BinaryOp) -> Option<OpCode> {
    Some(match op {
        BinaryOp::Add => OpCode::Add,
        BinaryOp::Sub => OpCode::Sub,
        BinaryOp::Mul => OpCode::Mul,
        BinaryOp::Div => OpCode::Div,
        BinaryOp::Mod => OpCode::Mod,
        BinaryOp::Exp => OpCode::Pow,
        BinaryOp::EqEqEq => OpCode::Eq,
        BinaryOp::NotEqEq => OpCode::Ne,
        BinaryOp::EqEq => OpCode::EqEq,
        BinaryOp::NotEq => OpCode::NeEq,
        BinaryOp::Lt => OpCode::Lt,
        BinaryOp::LtEq => OpCode::LtEq,
        BinaryOp::Gt => OpCode::Gt,
        BinaryOp::GtEq => OpCode::GtEq,
        BinaryOp::BitAnd => OpCode::BitAnd,
        BinaryOp::BitOr => OpCode::BitOr,
        BinaryOp::BitXor => OpCode::Xor,
        BinaryOp::LShift => OpCode::ShiftLeft,
        BinaryOp::RShift => OpCode::ShiftRight,
        BinaryOp::ZeroFillRShift => OpCode::ShiftRightUnsigned,
        _ => return None,
    })
}

fn compound_opcode(op: AssignOp) -> Option<OpCode> {
    binary_opcode(match op {
        AssignOp::AddAssign => BinaryOp::Add,
        AssignOp::SubAssign => BinaryOp::Sub,
        AssignOp::MulAssign => BinaryOp::Mul,
        AssignOp::DivAssign => BinaryOp::Div,
        AssignOp::ModAssign => BinaryOp::Mod,
        AssignOp::ExpAssign => BinaryOp::Exp,
        AssignOp::LShiftAssign => BinaryOp::LShift,
        AssignOp::RShiftAssign => BinaryOp::RShift,
        AssignOp::ZeroFillRShiftAssign => BinaryOp::ZeroFillRShift,
        AssignOp::BitOrAssign => BinaryOp::BitOr,
        AssignOp::BitXorAssign => BinaryOp::BitXor,
        AssignOp::BitAndAssign => BinaryOp::BitAnd,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_function_expression_compiles() {
        let code = compile("function(api){ return api.add(2,3); }").unwrap();
        assert!(
            code.iter()
                .any(|op| matches!(op, OpCode::MakeFunction { params, .. } if params == &["api"]))
        );
        assert!(matches!(code.last(), Some(OpCode::Return)));
    }

    #[test]
    fn test_syntax_error_has_position() {
        let err = compile("var a = 1;\nnot valid syntax (((").unwrap_err();
        assert!(!err.message.is_empty());
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_unsupported_syntax_is_reported() {
        let err = compile("class A {}").unwrap_err();
        assert!(err.message.starts_with("unsupported syntax"));
        let err = compile("for (var k in o) {}").unwrap_err();
        assert!(err.message.starts_with("unsupported syntax"));
    }

    #[test]
    fn test_function_declarations_are_hoisted() {
        let code = compile("f(); function f() { return 1; }").unwrap();
        let declare = code
            .iter()
            .position(|op| matches!(op, OpCode::Declare(name) if name == "f"))
            .unwrap();
        let call = code
            .iter()
            .position(|op| matches!(op, OpCode::Call(_)))
            .unwrap();
        assert!(declare < call);
    }

    #[test]
    fn test_break_inside_try_closes_handler() {
        let code = compile("while (true) { try { break; } catch (e) {} }").unwrap();
        let setups = code
            .iter()
            .filter(|op| matches!(op, OpCode::SetupTry { .. }))
            .count();
        let pops = code.iter().filter(|op| matches!(op, OpCode::PopTry)).count();
        // One PopTry on the normal path, one before the break.
        assert_eq!(setups, 1);
        assert_eq!(pops, 2);
    }
}
